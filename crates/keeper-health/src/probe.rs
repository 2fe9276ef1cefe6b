//! Liveness probes for the managed services.

use std::time::Duration;

use async_trait::async_trait;
use keeper_core::{ConfigError, HealthProbeConfig};
use tokio::time::Instant;
use tracing::{debug, info};

/// Result of a single HTTP probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// No response: connection refused, handshake error or timeout.
    Failed,
}

/// Post-update liveness check.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// One probe bounded by `timeout`.
    async fn probe(&self, timeout: Duration) -> bool;
}

/// `GET http://<address><path>`, healthy on 2xx.
#[derive(Debug, Clone)]
pub struct HttpHealthCheck {
    address: String,
    path: String,
}

impl HttpHealthCheck {
    pub fn new(address: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            path: path.into(),
        }
    }

    pub fn from_config(cfg: &HealthProbeConfig) -> Self {
        Self::new(&cfg.address, &cfg.path)
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn probe(&self, timeout: Duration) -> bool {
        http_probe(&self.address, &self.path, timeout).await == ProbeResult::Healthy
    }
}

/// Perform one HTTP probe against `address`.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", concat!("keeper/", env!("CARGO_PKG_VERSION")))
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "health probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| {
        debug!(%uri, "health probe timed out");
        ProbeResult::Failed
    })
}

/// How long to keep probing and how often.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl ProbePolicy {
    pub fn from_config(cfg: &HealthProbeConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            timeout: cfg.timeout()?,
            interval: cfg.interval()?,
        })
    }
}

/// Probe until one succeeds or `policy.timeout` elapses.
///
/// Each probe gets whatever is left of the overall budget, so the call never
/// runs much past the deadline.
pub async fn wait_until_healthy(check: &dyn HealthCheck, policy: ProbePolicy) -> bool {
    let deadline = Instant::now() + policy.timeout;
    let mut attempts = 0u32;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            info!(attempts, "health probe did not pass before the deadline");
            return false;
        }
        attempts += 1;
        if check.probe(remaining).await {
            debug!(attempts, "health probe passed");
            return true;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(policy.interval.min(remaining)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves `statuses[n]` to the n-th connection, repeating the last one.
    async fn serve(statuses: Vec<u16>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let status = statuses[n.min(statuses.len() - 1)];
                let mut buf = [0u8; 1024];
                let _ = sock.read(&mut buf).await;
                let resp = format!("HTTP/1.1 {status} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                let _ = sock.write_all(resp.as_bytes()).await;
            }
        });
        (addr, hits)
    }

    #[tokio::test]
    async fn two_hundred_is_healthy() {
        let (addr, _) = serve(vec![200]).await;
        assert_eq!(
            http_probe(&addr, "/healthz", Duration::from_secs(2)).await,
            ProbeResult::Healthy
        );
    }

    #[tokio::test]
    async fn server_error_is_unhealthy() {
        let (addr, _) = serve(vec![503]).await;
        assert_eq!(
            http_probe(&addr, "/healthz", Duration::from_secs(2)).await,
            ProbeResult::Unhealthy
        );
    }

    #[tokio::test]
    async fn refused_connection_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert_eq!(
            http_probe(&addr, "/healthz", Duration::from_secs(2)).await,
            ProbeResult::Failed
        );
    }

    #[tokio::test]
    async fn waiting_polls_until_the_service_comes_up() {
        let (addr, hits) = serve(vec![503, 503, 200]).await;
        let check = HttpHealthCheck::new(addr, "/healthz");
        let policy = ProbePolicy {
            timeout: Duration::from_secs(5),
            interval: Duration::from_millis(20),
        };
        assert!(wait_until_healthy(&check, policy).await);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn waiting_gives_up_at_the_deadline() {
        let (addr, _) = serve(vec![500]).await;
        let check = HttpHealthCheck::new(addr, "/healthz");
        let policy = ProbePolicy {
            timeout: Duration::from_millis(200),
            interval: Duration::from_millis(20),
        };
        let started = std::time::Instant::now();
        assert!(!wait_until_healthy(&check, policy).await);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
