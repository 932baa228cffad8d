//! Telegram update handlers.
//!
//! Handlers only translate between Telegram updates and gate calls; every
//! policy decision (trust, lockdown, code validity) is made by the gate.

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{CallbackQuery, Message},
};

use warden_core::domain::UserId;

use crate::router::AppState;
mod callback;
mod commands;

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    callback::handle_callback(bot, q, state).await
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };

    if text.starts_with('/') {
        return commands::handle_command(bot, msg, state).await;
    }

    // Free text: answer with the menu (or the hostile reply).
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let caller = commands::Caller {
        id: UserId(user.id.0 as i64),
        name: Some(user.first_name.clone()).filter(|n| !n.is_empty()),
    };
    let reply = commands::execute(&state.gate, &caller, "menu", "").await;
    commands::send_reply(&bot, &state.link, msg.chat.id, reply).await;
    Ok(())
}
