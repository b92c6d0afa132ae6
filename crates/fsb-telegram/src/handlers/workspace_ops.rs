//! Workspace UI: menu rendering and transform execution.

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, InputFile, ParseMode},
};
use tracing::warn;

use fsb_core::{
    domain::{Reference, StoredItem, UserId},
    formatting::{escape_html, format_bytes},
    media::OperationSpec,
};

use crate::router::AppState;

use super::send_html;

pub async fn open_workspace(
    bot: &Bot,
    state: &Arc<AppState>,
    user: i64,
    chat: ChatId,
    reference: Reference,
) {
    let item = match state.store.metadata(reference).await {
        Ok(item) => item,
        Err(e) => {
            warn!(reference = reference.0, "workspace source lookup failed: {e}");
            send_html(bot, chat, "❌ Could not find that file in the store.").await;
            return;
        }
    };

    match state.workspaces.open(UserId(user), item.clone()).await {
        Ok(snapshot) => {
            let text = menu_text(&item);
            if let Err(e) = bot
                .send_message(chat, text)
                .parse_mode(ParseMode::Html)
                .reply_markup(menu_keyboard(snapshot.id))
                .await
            {
                warn!("workspace menu send failed: {e}");
            }
        }
        Err(e) => {
            warn!("workspace open failed: {e}");
            send_html(bot, chat, "❌ Could not open the workspace.").await;
        }
    }
}

pub fn menu_text(item: &StoredItem) -> String {
    format!(
        "🎬 <b>Workspace ready</b>\n\n📁 <b>File:</b> <code>{}</code>\n📦 <b>Size:</b> <code>{}</code>\n\nPick a task below ⬇️",
        escape_html(&item.display_name),
        format_bytes(item.byte_size)
    )
}

pub fn menu_keyboard(session_id: u64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback("🎲 Random screenshot", format!("ws_rand_{session_id}")),
            InlineKeyboardButton::callback("🕓 Screenshot at…", format!("ws_shot_{session_id}")),
        ],
        vec![
            InlineKeyboardButton::callback("✂️ Clip…", format!("ws_clip_{session_id}")),
            InlineKeyboardButton::callback("💧 Watermark…", format!("ws_wm_{session_id}")),
        ],
        vec![InlineKeyboardButton::callback(
            "🗑 Close workspace",
            format!("ws_close_{session_id}"),
        )],
    ])
}

/// Download-once, transform, upload, clean up.
pub async fn run_operation(
    bot: &Bot,
    state: &Arc<AppState>,
    user: i64,
    chat: ChatId,
    op: OperationSpec,
) {
    let owner = UserId(user);

    let status = match bot
        .send_message(chat, "📥 Preparing the source file...")
        .await
    {
        Ok(m) => m,
        Err(e) => {
            warn!("status send failed: {e}");
            return;
        }
    };

    if let Err(e) = state.workspaces.ensure_local_copy(owner).await {
        let _ = bot
            .edit_message_text(chat, status.id, format!("❌ {e}"))
            .await;
        return;
    }

    let _ = bot
        .edit_message_text(
            chat,
            status.id,
            format!("⚙️ Running {}... this may take a moment.", op.name()),
        )
        .await;

    match state.workspaces.produce_artifact(owner, &op).await {
        Ok((bytes, file_name)) => {
            let _ = bot.delete_message(chat, status.id).await;

            let input = InputFile::memory(bytes).file_name(file_name.clone());
            let sent = if file_name.ends_with(".jpg") {
                bot.send_photo(chat, input).await.map(|_| ())
            } else {
                bot.send_video(chat, input).await.map(|_| ())
            };
            if let Err(e) = sent {
                warn!("artifact upload failed: {e}");
                send_html(bot, chat, "❌ The artifact could not be uploaded.").await;
                return;
            }

            if let Some(snapshot) = state.workspaces.status(owner).await {
                let _ = bot
                    .send_message(chat, "✅ <b>Done!</b> Ready for another operation.")
                    .parse_mode(ParseMode::Html)
                    .reply_markup(menu_keyboard(snapshot.id))
                    .await;
            }
        }
        Err(e) => {
            // The session survives tool failures; the owner can retry.
            let _ = bot
                .edit_message_text(chat, status.id, format!("❌ {e}"))
                .await;
        }
    }
}
