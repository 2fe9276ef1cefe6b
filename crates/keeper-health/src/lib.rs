//! keeper-health: liveness probes and service supervision.
//!
//! The update controller talks to the outside world through two traits:
//! [`ProcessSupervisor`] to stop and start units and [`HealthCheck`] to
//! decide whether a freshly started release is serving. The default
//! implementations shell out to `systemctl` and issue an HTTP GET.

pub mod error;
pub mod probe;
pub mod supervisor;

pub use error::{SupervisorError, SupervisorResult};
pub use probe::{HealthCheck, HttpHealthCheck, ProbePolicy, ProbeResult, http_probe, wait_until_healthy};
pub use supervisor::{ProcessSupervisor, SystemctlSupervisor};
