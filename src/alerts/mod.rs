//! Operator alerts.
//!
//! `Alerts` fans each message out to every configured `AlertSink`
//! concurrently. Each sink gets a bounded time slot and its failures are
//! logged, so a slow or broken channel never stalls the engine.

pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "INFO"),
            AlertLevel::Warning => write!(f, "WARNING"),
            AlertLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// A notification channel.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, level: AlertLevel, message: &str) -> Result<()>;

    fn name(&self) -> &str;
}

/// Writes alerts to the structured log.
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn send(&self, level: AlertLevel, message: &str) -> Result<()> {
        match level {
            AlertLevel::Info => info!(alert = %message, "ALERT"),
            AlertLevel::Warning => warn!(alert = %message, "ALERT"),
            AlertLevel::Error => error!(alert = %message, "ALERT"),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Fan-out over zero or more sinks.
#[derive(Clone)]
pub struct Alerts {
    sinks: Vec<Arc<dyn AlertSink>>,
    sink_timeout: Duration,
}

impl Alerts {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>, sink_timeout: Duration) -> Self {
        Self {
            sinks,
            sink_timeout,
        }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub async fn info(&self, message: impl AsRef<str>) {
        self.notify(AlertLevel::Info, message.as_ref()).await;
    }

    pub async fn warning(&self, message: impl AsRef<str>) {
        self.notify(AlertLevel::Warning, message.as_ref()).await;
    }

    pub async fn error(&self, message: impl AsRef<str>) {
        self.notify(AlertLevel::Error, message.as_ref()).await;
    }

    /// Deliver one alert to every sink.
    pub async fn notify(&self, level: AlertLevel, message: &str) {
        let sends = self.sinks.iter().map(|sink| async move {
            match tokio::time::timeout(self.sink_timeout, sink.send(level, message)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(sink = sink.name(), error = %e, "Alert delivery failed"),
                Err(_) => warn!(
                    sink = sink.name(),
                    timeout_secs = self.sink_timeout.as_secs(),
                    "Alert delivery timed out"
                ),
            }
        });
        join_all(sends).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Capture(Mutex<Vec<(AlertLevel, String)>>);

    #[async_trait]
    impl AlertSink for Capture {
        async fn send(&self, level: AlertLevel, message: &str) -> Result<()> {
            self.0.lock().unwrap().push((level, message.to_string()));
            Ok(())
        }

        fn name(&self) -> &str {
            "capture"
        }
    }

    struct Broken;

    #[async_trait]
    impl AlertSink for Broken {
        async fn send(&self, _: AlertLevel, _: &str) -> Result<()> {
            anyhow::bail!("channel down")
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    struct Stuck;

    #[async_trait]
    impl AlertSink for Stuck {
        async fn send(&self, _: AlertLevel, _: &str) -> Result<()> {
            futures::future::pending::<()>().await;
            Ok(())
        }

        fn name(&self) -> &str {
            "stuck"
        }
    }

    #[tokio::test]
    async fn test_fans_out_despite_failing_sinks() {
        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        let sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(Broken), Arc::new(Stuck), capture.clone()];
        let alerts = Alerts::new(sinks, Duration::from_millis(20));

        alerts.warning("Incomplete contracts found").await;
        alerts.error("Width mismatch").await;

        let seen = capture.0.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (AlertLevel::Warning, "Incomplete contracts found".to_string()),
                (AlertLevel::Error, "Width mismatch".to_string()),
            ]
        );
    }

    #[test]
    fn test_no_sinks_is_a_no_op() {
        let alerts = Alerts::new(Vec::new(), Duration::from_secs(1));
        tokio_test::block_on(alerts.info("nothing to see"));
        assert_eq!(alerts.sink_count(), 0);
    }
}
