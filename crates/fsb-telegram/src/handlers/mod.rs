//! Telegram update handlers.
//!
//! Each handler validates who is talking, updates the conversation state if
//! a multi-step flow is active, and calls into `fsb-core`.

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{CallbackQuery, Message, ParseMode},
};
use tracing::warn;

use crate::router::AppState;

mod callback;
mod commands;
mod delivery;
mod media;
mod text;
mod workspace_ops;

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    callback::handle_callback(bot, q, state).await
}

/// New posts in the store channel are indexed automatically.
pub async fn handle_channel_post(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    if msg.chat.id.0 == state.cfg.store_channel.0 {
        media::handle_store_channel_post(&msg, &state).await;
    }
    Ok(())
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    if !msg.chat.is_private() {
        return Ok(());
    }
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let user_id = user.id.0 as i64;

    match state
        .records
        .is_banned(fsb_core::domain::UserId(user_id))
        .await
    {
        Ok(true) => return Ok(()),
        Ok(false) => {}
        Err(e) => warn!("ban lookup failed for {user_id}: {e}"),
    }

    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            return commands::handle_command(bot, msg, state).await;
        }
        return text::handle_text(bot, msg, state).await;
    }

    if msg.document().is_some()
        || msg.video().is_some()
        || msg.audio().is_some()
        || msg.photo().is_some()
    {
        return media::handle_media(bot, msg, state).await;
    }

    Ok(())
}

/// Send an HTML-formatted reply; logs instead of failing the handler.
pub(crate) async fn send_html(bot: &Bot, chat: teloxide::types::ChatId, html: &str) {
    if let Err(e) = bot
        .send_message(chat, html)
        .parse_mode(ParseMode::Html)
        .disable_web_page_preview(true)
        .await
    {
        warn!("send failed in chat {}: {e}", chat.0);
    }
}
