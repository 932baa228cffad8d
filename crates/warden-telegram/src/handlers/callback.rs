use std::sync::Arc;

use teloxide::prelude::*;

use warden_core::domain::UserId;

use crate::router::AppState;

use super::commands::{execute, send_reply, Caller};

/// Menu buttons carry `cmd:<name>` and run the same path as typed commands.
pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let cb_id = q.id.clone();
    let chat_id = q.message.as_ref().map(|m| m.chat.id);
    let data = q.data.clone().unwrap_or_default();

    // Always answer the callback query so the client stops spinning.
    let answered = bot.answer_callback_query(cb_id).await;
    state.link.observe("callback answer", &answered).await;

    let (Some(chat_id), Some(cmd)) = (chat_id, data.strip_prefix("cmd:")) else {
        return Ok(());
    };

    let caller = Caller {
        id: UserId(q.from.id.0 as i64),
        name: Some(q.from.first_name.clone()).filter(|n| !n.is_empty()),
    };
    tracing::debug!(user = %caller.id, cmd, "menu button");

    let reply = execute(&state.gate, &caller, cmd, "").await;
    send_reply(&bot, &state.link, chat_id, reply).await;
    Ok(())
}
