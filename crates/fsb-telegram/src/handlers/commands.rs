//! Command handlers.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};
use tracing::{info, warn};

use fsb_core::{
    domain::{Reference, UserId},
    errors::{Error, TokenError},
    formatting::{escape_html, format_bytes},
};

use crate::router::{AppState, Pending, ReindexStats};

use super::{delivery, send_html};

pub async fn handle_command(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let text = msg.text().unwrap_or_default();
    let mut parts = text.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let arg = parts.next();

    let user = msg.from().map(|u| u.id.0 as i64).unwrap_or_default();
    let is_admin = state.is_admin(user);
    let chat = msg.chat.id;

    match command {
        "/start" => handle_start(&bot, &state, &msg, arg).await,
        "/help" => {
            send_html(&bot, chat, help_text(is_admin)).await;
        }
        "/cancel" => {
            state.pending.remove(&user);
            send_html(&bot, chat, "Cancelled.").await;
        }
        "/request" => {
            let request_text = text.splitn(2, char::is_whitespace).nth(1).unwrap_or("").trim();
            handle_content_request(&bot, &state, &msg, user, request_text).await;
        }

        // Operator commands below.
        _ if !is_admin => {
            send_html(&bot, chat, "Unknown command. Try /help.").await;
        }

        "/genlink" => {
            state.pending.insert(user, Pending::GenlinkSource);
            send_html(
                &bot,
                chat,
                "🔗 <b>Single link</b>\n\nForward the file from the store channel (or paste its t.me link).",
            )
            .await;
        }
        "/batch" => {
            state.pending.insert(user, Pending::BatchFirst);
            send_html(
                &bot,
                chat,
                "🔗 <b>Batch link: step 1 of 2</b>\n\nForward the <b>first</b> file of the range from the store channel.",
            )
            .await;
        }
        "/process" => {
            state.pending.insert(user, Pending::ProcessSource);
            send_html(
                &bot,
                chat,
                "🎬 Forward the stored video you want to work on.",
            )
            .await;
        }
        "/close" => {
            let closed = state.workspaces.close(UserId(user)).await;
            let text = if closed {
                "🗑 <b>Workspace closed.</b> All temporary files have been removed."
            } else {
                "No open workspace."
            };
            send_html(&bot, chat, text).await;
        }

        "/startindex" => {
            let cursor = load_cursor(&state).await;
            state.indexing.insert(
                user,
                ReindexStats {
                    cursor,
                    ..ReindexStats::default()
                },
            );
            send_html(
                &bot,
                chat,
                "✅ <b>Indexing session started</b>\n\nForward store-channel media to me now; \
                 I will count new and already-indexed files. Send /stopindex when done.",
            )
            .await;
        }
        "/stopindex" => {
            let Some((_, stats)) = state.indexing.remove(&user) else {
                send_html(&bot, chat, "No indexing session. Use /startindex first.").await;
                return Ok(());
            };
            persist_index(&state, stats).await;
            send_html(
                &bot,
                chat,
                &format!(
                    "⏹ <b>Indexing session stopped</b>\n\n• New files: <code>{}</code>\n• Duplicates: <code>{}</code>",
                    stats.new, stats.duplicate
                ),
            )
            .await;
        }

        "/stats" => handle_stats(&bot, &state, chat).await,
        "/broadcast" => handle_broadcast(&bot, &state, &msg).await,

        "/ban" | "/unban" => {
            let Some(target) = arg.and_then(|a| a.parse::<i64>().ok()) else {
                send_html(&bot, chat, "Usage: <code>/ban &lt;user id&gt;</code>").await;
                return Ok(());
            };
            let banned = command == "/ban";
            if let Err(e) = state.records.set_banned(UserId(target), banned).await {
                warn!("ban update failed: {e}");
                send_html(&bot, chat, "❌ Could not update the user record.").await;
                return Ok(());
            }
            let verb = if banned { "banned" } else { "unbanned" };
            send_html(&bot, chat, &format!("User <code>{target}</code> {verb}.")).await;
        }

        "/purge" => {
            let Some(reference) = arg.and_then(|a| a.parse::<i64>().ok()) else {
                send_html(&bot, chat, "Usage: <code>/purge &lt;reference&gt;</code>").await;
                return Ok(());
            };
            let reference = Reference(reference);
            match state.store.purge(reference).await {
                Ok(true) => {
                    state.index.remove(reference);
                    let _ = state
                        .records
                        .save_index_snapshot(state.index.snapshot())
                        .await;
                    send_html(&bot, chat, &format!("🗑 Purged <code>{reference}</code>.")).await;
                }
                Ok(false) => {
                    send_html(&bot, chat, "That reference was already gone.").await;
                }
                Err(e) => {
                    warn!(reference = reference.0, "purge failed: {e}");
                    send_html(&bot, chat, "❌ Purge failed, see logs.").await;
                }
            }
        }

        _ => {
            send_html(&bot, chat, "Unknown command. Try /help.").await;
        }
    }

    Ok(())
}

async fn handle_start(bot: &Bot, state: &Arc<AppState>, msg: &Message, payload: Option<&str>) {
    let Some(from) = msg.from() else { return };
    let user = UserId(from.id.0 as i64);

    if let Err(e) = state.records.upsert_user(user).await {
        warn!("user upsert failed: {e}");
    }

    let Some(token) = payload else {
        let name = escape_html(&from.first_name);
        send_html(
            bot,
            msg.chat.id,
            &format!(
                "👋 Hello {name}!\n\nI store files and serve them through permanent links. \
                 Send me a keyword to search the library, or open a share link to receive a file."
            ),
        )
        .await;
        return;
    };

    match state.resolver.resolve(token).await {
        Ok(references) => {
            info!(user = user.0, count = references.len(), "link resolved");
            delivery::deliver_references(bot, state, user, &references).await;
        }
        Err(e) => {
            let text = match &e {
                Error::Token(TokenError::Malformed) => {
                    "❌ <b>This link is invalid.</b> Check that it was copied completely."
                }
                Error::Token(TokenError::UnknownReference(_)) => {
                    "❌ <b>This file no longer exists.</b> It may have been removed from the library."
                }
                Error::Token(TokenError::InvalidRange { .. }) => {
                    "❌ <b>This batch link is invalid.</b>"
                }
                _ => "❌ <b>Something went wrong.</b> Please try the link again in a moment.",
            };
            warn!(user = user.0, "link resolution failed: {e}");
            send_html(bot, msg.chat.id, text).await;
        }
    }
}

/// Consumer asks for content that is not in the library yet; relayed to the
/// admins with accept/decline buttons.
async fn handle_content_request(
    bot: &Bot,
    state: &Arc<AppState>,
    msg: &Message,
    user: i64,
    request_text: &str,
) {
    if request_text.is_empty() {
        send_html(
            bot,
            msg.chat.id,
            "🎬 <b>How to request content</b>\n\nUse <code>/request</code> followed by a description, e.g.\n<code>/request The Dark Knight (2008) 4K</code>",
        )
        .await;
        return;
    }
    if request_text.len() > 500 {
        send_html(
            bot,
            msg.chat.id,
            "❌ <b>Request too long.</b> Please keep it under 500 characters.",
        )
        .await;
        return;
    }

    let details = format!(
        "📩 <b>New content request</b>\n\nFrom: <code>{user}</code>\n\n<blockquote>{}</blockquote>",
        escape_html(request_text)
    );
    let keyboard = teloxide::types::InlineKeyboardMarkup::new(vec![
        vec![
            teloxide::types::InlineKeyboardButton::callback(
                "✅ Accept",
                format!("creq_ok_{user}"),
            ),
            teloxide::types::InlineKeyboardButton::callback("❌ Decline", format!("creq_no_{user}")),
        ],
        vec![teloxide::types::InlineKeyboardButton::callback(
            "💬 Reply to user",
            format!("creq_re_{user}"),
        )],
    ]);

    let mut relayed = false;
    for admin in &state.cfg.admins {
        let res = bot
            .send_message(ChatId(*admin), details.clone())
            .parse_mode(teloxide::types::ParseMode::Html)
            .reply_markup(keyboard.clone())
            .await;
        match res {
            Ok(_) => relayed = true,
            Err(e) => warn!(admin, "request relay failed: {e}"),
        }
    }

    let ack = if relayed {
        "✅ <b>Request sent!</b> Our team will review it shortly."
    } else {
        "❌ <b>Unable to send the request right now.</b> Please try again later."
    };
    send_html(bot, msg.chat.id, ack).await;
}

async fn handle_stats(bot: &Bot, state: &Arc<AppState>, chat: ChatId) {
    let users = state.records.all_user_ids().await.unwrap_or_default().len();
    let downloads = state.records.total_downloads().await.unwrap_or_default();

    let mut lines = vec![
        "📊 <b>Library stats</b>".to_string(),
        String::new(),
        format!("• Users: <code>{users}</code>"),
        format!("• Indexed files: <code>{}</code>", state.index.len()),
        format!("• Downloads: <code>{downloads}</code>"),
    ];

    let top = state.index.top_n(5);
    if !top.is_empty() {
        lines.push(String::new());
        lines.push("🏆 <b>Most downloaded</b>".to_string());
        for hit in top {
            lines.push(format!(
                "• {} ({}) — <code>{}</code> downloads",
                escape_html(&hit.display_name),
                format_bytes(hit.byte_size),
                hit.download_count
            ));
        }
    }

    send_html(bot, chat, &lines.join("\n")).await;
}

async fn handle_broadcast(bot: &Bot, state: &Arc<AppState>, msg: &Message) {
    let Some(source) = msg.reply_to_message() else {
        send_html(
            bot,
            msg.chat.id,
            "<b>Usage:</b> reply to the message you want to broadcast with <code>/broadcast</code>.",
        )
        .await;
        return;
    };

    let users = state.records.all_user_ids().await.unwrap_or_default();
    let mut sent = 0usize;
    let mut failed = 0usize;

    for user in &users {
        let res = bot
            .copy_message(ChatId(user.0), msg.chat.id, source.id)
            .await;
        match res {
            Ok(_) => sent += 1,
            Err(teloxide::RequestError::RetryAfter(d)) => {
                tokio::time::sleep(d).await;
                match bot.copy_message(ChatId(user.0), msg.chat.id, source.id).await {
                    Ok(_) => sent += 1,
                    Err(_) => failed += 1,
                }
            }
            Err(e) => {
                // Blocked / deactivated accounts fall out of the user list.
                if is_unreachable_user(&e) {
                    let _ = state.records.remove_user(*user).await;
                }
                failed += 1;
            }
        }
    }

    send_html(
        bot,
        msg.chat.id,
        &format!(
            "<b><u>Broadcast completed</u></b>\n\n• Total: <code>{}</code>\n• Sent: <code>{sent}</code>\n• Failed: <code>{failed}</code>",
            users.len()
        ),
    )
    .await;
}

fn is_unreachable_user(e: &teloxide::RequestError) -> bool {
    matches!(
        e,
        teloxide::RequestError::Api(
            teloxide::ApiError::BotBlocked | teloxide::ApiError::UserDeactivated
        )
    )
}

pub(super) async fn load_cursor(state: &Arc<AppState>) -> fsb_core::index::ReindexCursor {
    state
        .records
        .get_setting("reindex_cursor")
        .await
        .ok()
        .flatten()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

pub(super) async fn persist_index(state: &Arc<AppState>, stats: ReindexStats) {
    if let Err(e) = state
        .records
        .set_setting(
            "reindex_cursor",
            serde_json::to_value(stats.cursor).unwrap_or_default(),
        )
        .await
    {
        warn!("cursor persist failed: {e}");
    }
    if let Err(e) = state
        .records
        .save_index_snapshot(state.index.snapshot())
        .await
    {
        warn!("index snapshot persist failed: {e}");
    }
}

fn help_text(is_admin: bool) -> &'static str {
    if is_admin {
        "<b>Commands</b>\n\
         /genlink — link for one stored file\n\
         /batch — link for a contiguous range\n\
         /process — open a video workspace\n\
         /close — close your workspace\n\
         /startindex · /stopindex — bulk re-index forwarded media\n\
         /stats — library statistics\n\
         /broadcast — reply to a message to broadcast it\n\
         /ban · /unban — manage users\n\
         /purge — delete a stored file\n\
         /cancel — abort the current flow\n\n\
         Send any text to search the library."
    } else {
        "Send me a keyword to search the library, or open a share link to receive a file.\n\
         /help — this message"
    }
}
