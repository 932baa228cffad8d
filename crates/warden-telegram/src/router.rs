use std::{sync::Arc, time::Duration};

use teloxide::{dispatching::Dispatcher, dptree, prelude::*, update_listeners, RequestError};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use warden_core::{access::AccessGate, config::Config, ports::GateEvent, scheduler::RepeatingTask};

use crate::{
    events::forward_events,
    handlers,
    health::{LinkHealth, LinkMonitor},
    Notifier, TelegramNotifier,
};

/// How often the link is re-checked while polling runs.
const LINK_CHECK_EVERY: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<AccessGate>,
    pub link: LinkMonitor,
}

/// Run long polling until `cancel` fires. Gate events from `events` are
/// delivered to users and the owner for as long as polling runs. Telegram
/// failures update `health`, which the gate uses as its connectivity probe.
pub async fn run_polling(
    cfg: Arc<Config>,
    gate: Arc<AccessGate>,
    events: UnboundedReceiver<GateEvent>,
    health: Arc<LinkHealth>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if cfg.telegram_bot_token.trim().is_empty() {
        anyhow::bail!("TELEGRAM_BOT_TOKEN is not set");
    }
    let bot = Bot::new(cfg.telegram_bot_token.clone());
    let link = LinkMonitor::new(gate.clone(), health);

    let me = bot.get_me().await;
    link.observe("startup check", &me).await;
    if let Ok(me) = me {
        tracing::info!("warden started: @{}", me.username());
    }
    match cfg.owner_id {
        Some(owner) => tracing::info!(%owner, "owner configured"),
        None => tracing::warn!("WARDEN_OWNER_ID not set; admin commands are unavailable"),
    }

    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(bot.clone()));
    let forwarder = tokio::spawn(forward_events(
        events,
        notifier.clone(),
        link.clone(),
        cfg.owner_id,
        cancel.child_token(),
    ));

    let (pinger, watched) = (notifier.clone(), link.clone());
    let link_check = RepeatingTask::spawn("link-check", LINK_CHECK_EVERY, move || {
        let (notifier, link) = (pinger.clone(), watched.clone());
        async move {
            let res = notifier.ping().await;
            link.observe("link check", &res).await;
        }
    });

    if let Some(owner) = cfg.owner_id {
        let stats = gate.stats().await;
        let msg = format!(
            "🤖 <b>Warden online</b>\n\n{}",
            crate::format::store_stats(&stats)
        );
        let res = notifier.send_html(owner, &msg).await;
        link.observe("startup notification", &res).await;
    }

    let state = Arc::new(AppState {
        gate,
        link: link.clone(),
    });

    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::handle_callback))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    let mut dispatcher = Dispatcher::builder(bot.clone(), handler)
        .dependencies(dptree::deps![state])
        .build();

    let shutdown = dispatcher.shutdown_token();
    let stop = cancel.clone();
    let stopper = tokio::spawn(async move {
        stop.cancelled().await;
        // The dispatcher may not be running yet; keep asking until it is.
        loop {
            match shutdown.shutdown() {
                Ok(done) => {
                    done.await;
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    });

    let listener = update_listeners::polling_default(bot).await;
    let on_poll_error = Arc::new(move |e: RequestError| {
        let link = link.clone();
        async move { link.failed("polling", &e).await }
    });
    dispatcher.dispatch_with_listener(listener, on_poll_error).await;

    stopper.abort();
    cancel.cancel();
    link_check.stop().await;
    if let Err(e) = forwarder.await {
        tracing::warn!("event forwarder ended abnormally: {e}");
    }
    tracing::info!("polling stopped");
    Ok(())
}
