//! Service lifecycle control.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{SupervisorError, SupervisorResult};

/// Stops, starts and queries managed units.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn stop(&self, unit: &str) -> SupervisorResult<()>;
    async fn start(&self, unit: &str) -> SupervisorResult<()>;
    async fn is_active(&self, unit: &str) -> SupervisorResult<bool>;

    /// Pick up changed unit definitions before units are started again.
    async fn reload_units(&self) -> SupervisorResult<()> {
        Ok(())
    }
}

/// Supervisor backed by `systemctl`.
#[derive(Debug, Clone)]
pub struct SystemctlSupervisor {
    systemctl: PathBuf,
}

impl SystemctlSupervisor {
    pub fn new(systemctl: impl Into<PathBuf>) -> Self {
        Self {
            systemctl: systemctl.into(),
        }
    }

    async fn run(&self, action: &str, unit: &str) -> SupervisorResult<std::process::Output> {
        debug!(action, unit, "systemctl");
        let mut cmd = Command::new(&self.systemctl);
        cmd.arg(action);
        if !unit.is_empty() {
            cmd.arg(unit);
        }
        cmd.stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| SupervisorError::Spawn {
                command: format!("{} {action} {unit}", self.systemctl.display()),
                source,
            })
    }

    async fn checked(&self, action: &str, unit: &str) -> SupervisorResult<()> {
        let output = self.run(action, unit).await?;
        if output.status.success() {
            info!(action, unit, "systemctl action succeeded");
            return Ok(());
        }
        Err(SupervisorError::Failed {
            action: action.to_string(),
            unit: unit.to_string(),
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl ProcessSupervisor for SystemctlSupervisor {
    async fn stop(&self, unit: &str) -> SupervisorResult<()> {
        self.checked("stop", unit).await
    }

    async fn start(&self, unit: &str) -> SupervisorResult<()> {
        self.checked("start", unit).await
    }

    /// `systemctl is-active` exits 0 only for an active unit.
    async fn is_active(&self, unit: &str) -> SupervisorResult<bool> {
        Ok(self.run("is-active", unit).await?.status.success())
    }

    async fn reload_units(&self) -> SupervisorResult<()> {
        self.checked("daemon-reload", "").await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    /// A stand-in `systemctl` that logs its arguments and fails for
    /// `broken.service`.
    fn fake_systemctl(dir: &std::path::Path) -> PathBuf {
        let log = dir.join("calls.log");
        let script = dir.join("systemctl");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$1 $2\" >> {}\ncase \"$2\" in broken.service) echo boom >&2; exit 3;; esac\nexit 0\n",
                log.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[tokio::test]
    async fn actions_are_passed_through() {
        let dir = tempfile::tempdir().unwrap();
        let sup = SystemctlSupervisor::new(fake_systemctl(dir.path()));

        sup.stop("capture.service").await.unwrap();
        sup.reload_units().await.unwrap();
        sup.start("capture.service").await.unwrap();
        assert!(sup.is_active("capture.service").await.unwrap());

        let log = fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert_eq!(
            log.lines().collect::<Vec<_>>(),
            vec![
                "stop capture.service",
                "daemon-reload ",
                "start capture.service",
                "is-active capture.service"
            ]
        );
    }

    #[tokio::test]
    async fn failures_carry_status_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let sup = SystemctlSupervisor::new(fake_systemctl(dir.path()));

        let err = sup.start("broken.service").await.unwrap_err();
        match err {
            SupervisorError::Failed { status, stderr, .. } => {
                assert_eq!(status, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!sup.is_active("broken.service").await.unwrap());
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let sup = SystemctlSupervisor::new("/nonexistent/systemctl");
        assert!(matches!(
            sup.stop("capture.service").await,
            Err(SupervisorError::Spawn { .. })
        ));
    }
}
