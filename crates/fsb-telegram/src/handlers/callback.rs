//! Inline-keyboard callback handlers: re-delivery handshake, search result
//! selection and paging, and workspace actions.

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{CallbackQuery, InlineKeyboardButton, InlineKeyboardMarkup, ParseMode},
};
use tracing::{info, warn};

use fsb_core::{
    domain::{ChatId as CoreChatId, Reference, UserId},
    errors::RequestWorkflowError,
    expiry::{DeclineReason, RequestDecision},
    link::LinkTarget,
    transport::DeliveryOptions,
};

use crate::router::{AppState, Pending};

use super::{delivery, send_html, text, workspace_ops};

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let Some(data) = q.data.clone() else {
        return Ok(());
    };
    let user = q.from.id.0 as i64;

    if let Some(rest) = data.strip_prefix("rerequest_") {
        if let Ok(id) = rest.parse::<u64>() {
            handle_rerequest(&bot, &state, &q, user, id).await;
        }
        return Ok(());
    }

    if let Some(rest) = data.strip_prefix("selectfile_") {
        if let Ok(reference) = rest.parse::<i64>() {
            handle_select_file(&bot, &state, &q, Reference(reference)).await;
        }
        return Ok(());
    }

    if let Some(rest) = data.strip_prefix("spage_") {
        if let Some((page, query)) = rest.split_once('_') {
            if let (Ok(page), Some(message)) = (page.parse::<usize>(), q.message.as_ref()) {
                answer(&bot, &q, None).await;
                text::handle_page_switch(&bot, &state, message, page, query).await;
            }
        }
        return Ok(());
    }

    if let Some(rest) = data.strip_prefix("ws_") {
        handle_workspace_action(&bot, &state, &q, user, rest).await;
        return Ok(());
    }

    // Admin-side request decisions.
    if !state.is_admin(user) {
        answer(&bot, &q, Some("Not for you.")).await;
        return Ok(());
    }
    if let Some(rest) = data.strip_prefix("creq_") {
        handle_content_request_decision(&bot, &state, &q, user, rest).await;
    } else if let Some(rest) = data.strip_prefix("creqreason_") {
        if let Some((target, code)) = rest.split_once('_') {
            if let Ok(target) = target.parse::<i64>() {
                handle_content_request_decline(&bot, &q, target, code).await;
            }
        }
    } else if let Some(rest) = data.strip_prefix("reqok_") {
        if let Ok(id) = rest.parse::<u64>() {
            handle_accept(&bot, &state, &q, id).await;
        }
    } else if let Some(rest) = data.strip_prefix("reqno_") {
        if let Ok(id) = rest.parse::<u64>() {
            show_decline_reasons(&bot, &q, id).await;
        }
    } else if let Some(rest) = data.strip_prefix("reqreason_") {
        if let Some((id, code)) = rest.split_once('_') {
            if let Ok(id) = id.parse::<u64>() {
                handle_decline(&bot, &state, &q, id, code).await;
            }
        }
    }

    Ok(())
}

async fn handle_rerequest(bot: &Bot, state: &Arc<AppState>, q: &CallbackQuery, user: i64, id: u64) {
    match state
        .workflow
        .request_redelivery(id, UserId(user), chrono::Utc::now())
    {
        Ok(artifact) => {
            answer(bot, q, Some("Request sent to the admins.")).await;
            if let Some(message) = q.message.as_ref() {
                let _ = bot
                    .edit_message_text(
                        message.chat.id,
                        message.id,
                        "⌛ <b>Re-delivery requested.</b> An admin will review it shortly.",
                    )
                    .parse_mode(ParseMode::Html)
                    .await;
            }

            let name = state
                .index
                .get(artifact.source_reference)
                .map(|h| h.display_name)
                .unwrap_or_else(|| format!("reference {}", artifact.source_reference));
            let keyboard = InlineKeyboardMarkup::new(vec![vec![
                InlineKeyboardButton::callback("✅ Accept", format!("reqok_{id}")),
                InlineKeyboardButton::callback("❌ Decline", format!("reqno_{id}")),
            ]]);
            let text = format!(
                "📩 <b>Re-delivery request</b>\n\nFrom: <code>{user}</code>\nFile: <code>{}</code>",
                fsb_core::formatting::escape_html(&name)
            );
            for admin in &state.cfg.admins {
                let res = bot
                    .send_message(ChatId(*admin), text.clone())
                    .parse_mode(ParseMode::Html)
                    .reply_markup(keyboard.clone())
                    .await;
                if let Err(e) = res {
                    warn!(admin, "could not notify admin: {e}");
                }
            }
            info!(artifact = id, user, "re-delivery requested");
        }
        Err(e) => {
            let alert = e.to_string();
            answer_alert(bot, q, &alert).await;
            if matches!(e, RequestWorkflowError::WindowClosed) {
                if let Some(message) = q.message.as_ref() {
                    let _ = bot
                        .edit_message_text(
                            message.chat.id,
                            message.id,
                            "🚫 <b>The re-request window for this file has closed.</b>",
                        )
                        .parse_mode(ParseMode::Html)
                        .await;
                }
            }
        }
    }
}

async fn handle_accept(bot: &Bot, state: &Arc<AppState>, q: &CallbackQuery, id: u64) {
    let Some(artifact) = state.workflow.get(id) else {
        answer_alert(bot, q, "Unknown request.").await;
        return;
    };

    let options = DeliveryOptions {
        caption: None,
        protect_content: state.cfg.protect_content,
    };
    let copy = match state
        .store
        .deliver(
            artifact.source_reference,
            CoreChatId(artifact.consumer.0),
            &options,
        )
        .await
    {
        Ok(copy) => copy,
        Err(e) => {
            warn!(artifact = id, "re-delivery copy failed: {e}");
            answer_alert(bot, q, "Delivery failed; the file may be gone.").await;
            return;
        }
    };

    match state
        .workflow
        .resolve_request(id, RequestDecision::Accept { delivery: copy }, chrono::Utc::now())
    {
        Ok(fresh) => {
            state.index.record_access(artifact.source_reference);
            let _ = state
                .records
                .log_download(artifact.source_reference, artifact.consumer)
                .await;
            delivery::attach_notice(bot, state, fresh.id, copy).await;
            answer(bot, q, Some("Accepted and re-delivered.")).await;
            edit_admin_message(bot, q, "✅ <b>ACCEPTED</b> — file re-delivered.").await;
            info!(artifact = id, fresh = fresh.id, "re-delivery accepted");
        }
        Err(e) => {
            answer_alert(bot, q, &e.to_string()).await;
        }
    }
}

async fn show_decline_reasons(bot: &Bot, q: &CallbackQuery, id: u64) {
    let Some(message) = q.message.as_ref() else {
        return;
    };
    answer(bot, q, None).await;
    let keyboard = InlineKeyboardMarkup::new(vec![
        vec![InlineKeyboardButton::callback(
            "📵 Not available",
            format!("reqreason_{id}_na"),
        )],
        vec![InlineKeyboardButton::callback(
            "❓ Invalid request",
            format!("reqreason_{id}_ir"),
        )],
        vec![InlineKeyboardButton::callback(
            "🚫 Policy violation",
            format!("reqreason_{id}_pv"),
        )],
        vec![InlineKeyboardButton::callback(
            "⬅️ Back",
            format!("reqreason_{id}_back"),
        )],
    ]);
    let _ = bot
        .edit_message_reply_markup(message.chat.id, message.id)
        .reply_markup(keyboard)
        .await;
}

async fn handle_decline(bot: &Bot, state: &Arc<AppState>, q: &CallbackQuery, id: u64, code: &str) {
    if code == "back" {
        let Some(message) = q.message.as_ref() else {
            return;
        };
        answer(bot, q, Some("Cancelled.")).await;
        let keyboard = InlineKeyboardMarkup::new(vec![vec![
            InlineKeyboardButton::callback("✅ Accept", format!("reqok_{id}")),
            InlineKeyboardButton::callback("❌ Decline", format!("reqno_{id}")),
        ]]);
        let _ = bot
            .edit_message_reply_markup(message.chat.id, message.id)
            .reply_markup(keyboard)
            .await;
        return;
    }

    let reason = match code {
        "na" => DeclineReason::NotAvailable,
        "ir" => DeclineReason::InvalidRequest,
        "pv" => DeclineReason::PolicyViolation,
        _ => DeclineReason::Other,
    };

    match state.workflow.resolve_request(
        id,
        RequestDecision::Decline {
            reason,
            note: None,
        },
        chrono::Utc::now(),
    ) {
        Ok(artifact) => {
            send_html(
                bot,
                ChatId(artifact.consumer.0),
                &format!(
                    "❌ <b>Request declined</b>\n\n{}",
                    reason.message()
                ),
            )
            .await;
            answer(bot, q, Some("User notified.")).await;
            edit_admin_message(bot, q, "❌ <b>DECLINED</b> — user notified.").await;
            info!(artifact = id, ?reason, "re-delivery declined");
        }
        Err(e) => answer_alert(bot, q, &e.to_string()).await,
    }
}

fn content_request_keyboard(target: i64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback("✅ Accept", format!("creq_ok_{target}")),
            InlineKeyboardButton::callback("❌ Decline", format!("creq_no_{target}")),
        ],
        vec![InlineKeyboardButton::callback(
            "💬 Reply to user",
            format!("creq_re_{target}"),
        )],
    ])
}

/// Admin action on a `/request` relay.
async fn handle_content_request_decision(
    bot: &Bot,
    state: &Arc<AppState>,
    q: &CallbackQuery,
    admin: i64,
    rest: &str,
) {
    let Some((action, target)) = rest.split_once('_') else {
        return;
    };
    let Ok(target) = target.parse::<i64>() else {
        return;
    };

    match action {
        "ok" => {
            send_html(
                bot,
                ChatId(target),
                "🎉 <b>Good news!</b> Your content request was <b>accepted</b>. \
                 The team will upload it soon.",
            )
            .await;
            answer(bot, q, Some("User notified.")).await;
            edit_admin_message(bot, q, "✅ <b>ACCEPTED</b> — user notified.").await;
        }
        "no" => {
            let Some(message) = q.message.as_ref() else {
                return;
            };
            answer(bot, q, None).await;
            let keyboard = InlineKeyboardMarkup::new(vec![
                vec![InlineKeyboardButton::callback(
                    "📵 Not available",
                    format!("creqreason_{target}_na"),
                )],
                vec![InlineKeyboardButton::callback(
                    "❓ Invalid request",
                    format!("creqreason_{target}_ir"),
                )],
                vec![InlineKeyboardButton::callback(
                    "🚫 Policy violation",
                    format!("creqreason_{target}_pv"),
                )],
                vec![InlineKeyboardButton::callback(
                    "⬅️ Back",
                    format!("creqreason_{target}_back"),
                )],
            ]);
            let _ = bot
                .edit_message_reply_markup(message.chat.id, message.id)
                .reply_markup(keyboard)
                .await;
        }
        "re" => {
            state
                .pending
                .insert(admin, Pending::AdminReply { target });
            answer(bot, q, Some("Send your message...")).await;
            send_html(
                bot,
                ChatId(admin),
                "📝 Send the message you want to forward to the user (or /cancel).",
            )
            .await;
        }
        _ => {}
    }
}

async fn handle_content_request_decline(bot: &Bot, q: &CallbackQuery, target: i64, code: &str) {
    if code == "back" {
        let Some(message) = q.message.as_ref() else {
            return;
        };
        answer(bot, q, Some("Cancelled.")).await;
        let _ = bot
            .edit_message_reply_markup(message.chat.id, message.id)
            .reply_markup(content_request_keyboard(target))
            .await;
        return;
    }

    let reason = match code {
        "na" => DeclineReason::NotAvailable,
        "ir" => DeclineReason::InvalidRequest,
        "pv" => DeclineReason::PolicyViolation,
        _ => DeclineReason::Other,
    };
    send_html(
        bot,
        ChatId(target),
        &format!("❌ <b>Request declined</b>\n\n{}", reason.message()),
    )
    .await;
    answer(bot, q, Some("User notified.")).await;
    edit_admin_message(bot, q, "❌ <b>DECLINED</b> — user notified.").await;
}

async fn handle_select_file(bot: &Bot, state: &Arc<AppState>, q: &CallbackQuery, reference: Reference) {
    answer(bot, q, Some("Generating your link...")).await;
    let Some(message) = q.message.as_ref() else {
        return;
    };

    let url = state
        .resolver
        .codec()
        .share_url(&state.cfg.link_base_url, &LinkTarget::Single(reference));
    let _ = bot
        .edit_message_text(
            message.chat.id,
            message.id,
            format!("✅ <b>Your link is ready!</b>\n\n<code>{url}</code>"),
        )
        .parse_mode(ParseMode::Html)
        .await;
}

async fn handle_workspace_action(
    bot: &Bot,
    state: &Arc<AppState>,
    q: &CallbackQuery,
    user: i64,
    rest: &str,
) {
    let Some((action, sid)) = rest.split_once('_') else {
        return;
    };
    let Ok(session_id) = sid.parse::<u64>() else {
        return;
    };

    let live = state
        .workspaces
        .session(UserId(user))
        .map(|s| s.id == session_id)
        .unwrap_or(false);
    if !live {
        answer_alert(
            bot,
            q,
            "This workspace has expired. Start a new one with /process.",
        )
        .await;
        return;
    }

    let Some(message) = q.message.as_ref() else {
        return;
    };
    let chat = message.chat.id;

    match action {
        "rand" => {
            answer(bot, q, Some("Generating a random screenshot...")).await;
            workspace_ops::run_operation(
                bot,
                state,
                user,
                chat,
                fsb_core::media::OperationSpec::RandomScreenshot,
            )
            .await;
        }
        "shot" => {
            answer(bot, q, None).await;
            state.pending.insert(user, Pending::ScreenshotAt);
            send_html(
                bot,
                chat,
                "📝 Reply with the screenshot position in <b>seconds</b>, e.g. <code>90</code>.",
            )
            .await;
        }
        "clip" => {
            answer(bot, q, None).await;
            state.pending.insert(user, Pending::ClipDetails);
            send_html(
                bot,
                chat,
                "📝 Reply like <code>90 20</code> to clip 20s starting at 1m30s (max 60s).",
            )
            .await;
        }
        "wm" => {
            answer(bot, q, None).await;
            state.pending.insert(user, Pending::WatermarkText);
            send_html(bot, chat, "📝 Reply with the watermark text.").await;
        }
        "close" => {
            answer(bot, q, Some("Closing...")).await;
            state.workspaces.close(UserId(user)).await;
            let _ = bot
                .edit_message_text(
                    chat,
                    message.id,
                    "🗑 <b>Workspace closed.</b>\nAll temporary files have been removed.",
                )
                .parse_mode(ParseMode::Html)
                .await;
        }
        _ => {}
    }
}

async fn edit_admin_message(bot: &Bot, q: &CallbackQuery, status: &str) {
    let Some(message) = q.message.as_ref() else {
        return;
    };
    let original = message.text().unwrap_or_default();
    let _ = bot
        .edit_message_text(
            message.chat.id,
            message.id,
            format!("{}\n\n{status}", fsb_core::formatting::escape_html(original)),
        )
        .parse_mode(ParseMode::Html)
        .await;
}

async fn answer(bot: &Bot, q: &CallbackQuery, text: Option<&str>) {
    let mut req = bot.answer_callback_query(q.id.clone());
    if let Some(t) = text {
        req = req.text(t.to_string());
    }
    if let Err(e) = req.await {
        warn!("answer_callback_query failed: {e}");
    }
}

async fn answer_alert(bot: &Bot, q: &CallbackQuery, text: &str) {
    let res = bot
        .answer_callback_query(q.id.clone())
        .text(text.to_string())
        .show_alert(true)
        .await;
    if let Err(e) = res {
        warn!("answer_callback_query failed: {e}");
    }
}
