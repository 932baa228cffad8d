//! Telegram adapter (teloxide).
//!
//! Parses chat commands, drives `warden_core::access::AccessGate` and renders
//! its typed results as Telegram HTML. Gate events are forwarded to the
//! affected users and the owner; Telegram failures feed the gate's error log
//! through `health::LinkMonitor`.

use async_trait::async_trait;

use teloxide::{prelude::*, types::ParseMode};

use tokio::time::sleep;

pub mod events;
pub mod format;
pub mod handlers;
pub mod health;
pub mod router;

use teloxide::RequestError;
use warden_core::domain::UserId;

pub type SendResult<T = ()> = std::result::Result<T, RequestError>;

/// Outbound side of the transport, as seen by the event forwarder.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_html(&self, to: UserId, html: &str) -> SendResult;

    /// Cheapest authenticated round trip, used to re-check the link.
    async fn ping(&self) -> SendResult;
}

#[derive(Clone)]
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(to: UserId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(to.0)
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> SendResult<T>
    where
        Fut: std::future::IntoFuture<Output = SendResult<T>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(RequestError::RetryAfter(d)) if attempts < MAX_RETRIES => {
                    attempts += 1;
                    sleep(d).await;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_html(&self, to: UserId, html: &str) -> SendResult {
        self.with_retry(|| {
            self.bot
                .send_message(Self::tg_chat(to), html.to_string())
                .parse_mode(ParseMode::Html)
        })
        .await?;
        Ok(())
    }

    async fn ping(&self) -> SendResult {
        self.with_retry(|| self.bot.get_me()).await?;
        Ok(())
    }
}
