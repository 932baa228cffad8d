//! Telegram reachability.
//!
//! Every Telegram call reports its outcome here. The first network failure of
//! an outage is recorded as `NETWORK_ERROR`; later failures only log until a
//! call succeeds again. The flag doubles as the gate's connectivity probe, so
//! the "Retry Connection" fix succeeds once the link is back.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use teloxide::RequestError;

use warden_core::{
    access::AccessGate,
    domain::{ErrorCode, Severity},
    error_controller::NewError,
    ports::ConnectivityProbe,
};

#[derive(Debug)]
pub struct LinkHealth {
    up: AtomicBool,
}

impl Default for LinkHealth {
    fn default() -> Self {
        Self {
            up: AtomicBool::new(true),
        }
    }
}

impl LinkHealth {
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// Returns true if the link was down.
    fn mark_up(&self) -> bool {
        !self.up.swap(true, Ordering::SeqCst)
    }

    /// Returns true if this failure starts an outage.
    fn mark_down(&self) -> bool {
        self.up.swap(false, Ordering::SeqCst)
    }
}

impl ConnectivityProbe for LinkHealth {
    fn check(&self) -> bool {
        self.is_up()
    }
}

pub fn is_network_fault(e: &RequestError) -> bool {
    matches!(e, RequestError::Network(_) | RequestError::Io(_))
}

/// Feeds Telegram call outcomes into the link flag and the gate's error log.
#[derive(Clone)]
pub struct LinkMonitor {
    gate: Arc<AccessGate>,
    health: Arc<LinkHealth>,
}

impl LinkMonitor {
    pub fn new(gate: Arc<AccessGate>, health: Arc<LinkHealth>) -> Self {
        Self { gate, health }
    }

    pub fn health(&self) -> &LinkHealth {
        &self.health
    }

    pub async fn observe<T>(&self, context: &str, res: &Result<T, RequestError>) {
        match res {
            Ok(_) => self.succeeded(),
            Err(e) => self.failed(context, e).await,
        }
    }

    pub fn succeeded(&self) {
        if self.health.mark_up() {
            tracing::info!("telegram reachable again");
        }
    }

    pub async fn failed(&self, context: &str, e: &RequestError) {
        if !is_network_fault(e) {
            // Per-chat rejections (blocked bot, bad chat id) say nothing about the link.
            tracing::warn!("{context} failed: {e}");
            return;
        }
        if !self.health.mark_down() {
            tracing::debug!("{context} failed while telegram is unreachable: {e}");
            return;
        }
        tracing::error!("{context} failed, telegram unreachable: {e}");
        self.gate
            .add_error(
                NewError::new(ErrorCode::Network, format!("{context}: {e}")).severity(Severity::High),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teloxide::ApiError;
    use warden_core::{
        access::GateDeps,
        config::Config,
        ports::{ChannelSink, GateEvent},
    };
    use tokio::sync::mpsc::UnboundedReceiver;

    fn network_error() -> RequestError {
        RequestError::Io(
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset").into(),
        )
    }

    fn monitor(dir: &std::path::Path) -> (LinkMonitor, UnboundedReceiver<GateEvent>) {
        let health = Arc::new(LinkHealth::default());
        let (sink, events) = ChannelSink::new();
        let gate = Arc::new(AccessGate::open(
            &Config::defaults(dir.join("db.json")),
            GateDeps {
                events: Arc::new(sink),
                probe: Some(health.clone()),
                ..GateDeps::default()
            },
        ));
        (LinkMonitor::new(gate, health), events)
    }

    #[tokio::test]
    async fn outage_is_recorded_once_until_the_link_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let (link, mut events) = monitor(dir.path());

        link.failed("reply", &network_error()).await;
        link.failed("reply", &network_error()).await;
        assert!(!link.health().is_up());

        let report = link.gate.error_report().await;
        let network: Vec<_> = report
            .recent
            .iter()
            .filter(|e| e.code == ErrorCode::Network)
            .collect();
        assert_eq!(network.len(), 1);
        assert_eq!(network[0].severity, Severity::High);
        // The probe reports the link down, so the transport reset is what resolves it.
        assert_eq!(network[0].fix_applied.as_deref(), Some("Reset Transport"));
        assert!(matches!(events.try_recv(), Ok(GateEvent::ModuleReset { .. })));

        link.observe("reply", &Ok::<(), RequestError>(())).await;
        assert!(link.health().is_up());
        link.failed("reply", &network_error()).await;
        let report = link.gate.error_report().await;
        assert_eq!(
            report.recent.iter().filter(|e| e.code == ErrorCode::Network).count(),
            2
        );
    }

    #[tokio::test]
    async fn recovered_link_satisfies_connection_retry() {
        let dir = tempfile::tempdir().unwrap();
        let (link, _events) = monitor(dir.path());

        link.succeeded();
        let rec = link
            .gate
            .add_error(NewError::new(ErrorCode::Network, "timeout"))
            .await;
        assert_eq!(rec.fix_applied.as_deref(), Some("Retry Connection"));
    }

    #[tokio::test]
    async fn rejections_are_not_network_faults() {
        let dir = tempfile::tempdir().unwrap();
        let (link, _events) = monitor(dir.path());

        link.failed("reply", &RequestError::Api(ApiError::BotBlocked)).await;
        assert!(link.health().is_up());
        assert_eq!(link.gate.error_report().await.total, 0);
    }
}
