//! Delivery of gate events to Telegram users.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use warden_core::{domain::UserId, error_controller::Module, ports::GateEvent};

use crate::{format::format_ts, health::LinkMonitor, Notifier};

/// Who gets told what about an event.
pub fn deliveries(event: &GateEvent, owner: Option<UserId>) -> Vec<(UserId, String)> {
    let mut out = Vec::new();
    match event {
        GateEvent::AccessExpired { identities } => {
            for id in identities {
                out.push((
                    *id,
                    "⏰ <b>Access expired</b>\n\nAsk the owner for a new access code, then use /redeem."
                        .to_string(),
                ));
            }
            if let Some(owner) = owner {
                let list = identities
                    .iter()
                    .map(|id| format!("<code>{id}</code>"))
                    .collect::<Vec<_>>()
                    .join(", ");
                out.push((owner, format!("📅 <b>Access expired</b> for: {list}")));
            }
        }
        GateEvent::CredentialReissued {
            identity,
            code,
            expires_at,
        } => {
            out.push((
                *identity,
                format!(
                    "🔐 <b>New OTP</b>\n\nYour previous code expired.\nOTP: <code>{code}</code>\nExpires: {}",
                    format_ts(*expires_at)
                ),
            ));
        }
        // The forwarder handles a transport reset itself by re-checking the link.
        GateEvent::ModuleReset {
            module: Module::Transport,
        } => {}
        GateEvent::ModuleReset { module } => {
            if let Some(owner) = owner {
                out.push((
                    owner,
                    format!("🔧 Auto-fix requested a reset of the <b>{}</b> module.", module.as_str()),
                ));
            }
        }
    }
    out
}

/// Forward events until the channel closes or `cancel` fires.
pub async fn forward_events(
    mut rx: UnboundedReceiver<GateEvent>,
    notifier: Arc<dyn Notifier>,
    link: LinkMonitor,
    owner: Option<UserId>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
          _ = cancel.cancelled() => break,
          ev = rx.recv() => match ev {
            Some(ev) => ev,
            None => break,
          },
        };

        if let GateEvent::ModuleReset {
            module: Module::Transport,
        } = event
        {
            let res = notifier.ping().await;
            link.observe("transport re-check", &res).await;
        }

        for (to, html) in deliveries(&event, owner) {
            let res = notifier.send_html(to, &html).await;
            link.observe("event notification", &res).await;
        }
    }
    tracing::debug!("event forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{health::LinkHealth, SendResult};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;
    use warden_core::{
        access::{AccessGate, GateDeps},
        config::Config,
        ports::{ChannelSink, EventSink},
    };

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(UserId, String)>>,
        pings: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn send_html(&self, to: UserId, html: &str) -> SendResult {
            self.sent.lock().await.push((to, html.to_string()));
            Ok(())
        }

        async fn ping(&self) -> SendResult {
            self.pings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn link(dir: &std::path::Path) -> LinkMonitor {
        let gate = AccessGate::open(&Config::defaults(dir.join("db.json")), GateDeps::default());
        LinkMonitor::new(Arc::new(gate), Arc::new(LinkHealth::default()))
    }

    #[test]
    fn expiry_notifies_each_user_and_the_owner() {
        let ev = GateEvent::AccessExpired {
            identities: vec![UserId(1), UserId(2)],
        };
        let out = deliveries(&ev, Some(UserId(100)));
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].0, UserId(100));
        assert!(out[2].1.contains("<code>1</code>, <code>2</code>"));

        assert_eq!(deliveries(&ev, None).len(), 2);
    }

    #[test]
    fn module_reset_goes_to_owner_only() {
        let ev = GateEvent::ModuleReset {
            module: Module::Crypto,
        };
        assert!(deliveries(&ev, None).is_empty());
        let out = deliveries(&ev, Some(UserId(100)));
        assert!(out[0].1.contains("crypto"));

        let transport = GateEvent::ModuleReset {
            module: Module::Transport,
        };
        assert!(deliveries(&transport, Some(UserId(100))).is_empty());
    }

    #[tokio::test]
    async fn forwarder_delivers_until_channel_closes() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, rx) = ChannelSink::new();
        let recorder = Arc::new(Recorder::default());

        sink.emit(GateEvent::CredentialReissued {
            identity: UserId(42),
            code: "123456".to_string(),
            expires_at: Utc::now(),
        });
        sink.emit(GateEvent::ModuleReset {
            module: Module::Transport,
        });
        drop(sink);

        forward_events(
            rx,
            recorder.clone(),
            link(dir.path()),
            None,
            CancellationToken::new(),
        )
        .await;

        let sent = recorder.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, UserId(42));
        assert!(sent[0].1.contains("<code>123456</code>"));
        assert_eq!(recorder.pings.load(Ordering::SeqCst), 1);
    }
}
