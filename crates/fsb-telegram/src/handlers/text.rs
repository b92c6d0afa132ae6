//! Plain-text messages: multi-step flow inputs first, keyword search
//! otherwise.

use std::sync::Arc;

use regex::Regex;
use teloxide::{
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, Message, ParseMode},
};
use tracing::warn;

use fsb_core::{
    domain::Reference,
    formatting::{escape_html, format_bytes, truncate_label},
    index::SearchHit,
    media::OperationSpec,
};

use crate::router::{AppState, Pending};

use super::{media, send_html, workspace_ops};

pub const RESULTS_PER_PAGE: usize = 5;
const MAX_QUERY_CALLBACK_BYTES: usize = 40;

pub async fn handle_text(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(from) = msg.from() else {
        return Ok(());
    };
    let user = from.id.0 as i64;
    let text = msg.text().unwrap_or_default().trim().to_string();

    // A waiting flow consumes the message.
    if let Some((_, pending)) = state.pending.remove(&user) {
        return handle_pending_text(bot, msg, state, pending, &text).await;
    }

    // Keyword search for everyone else.
    if text.len() < state.cfg.min_query_length {
        return Ok(());
    }
    let hits = state.index.search(&text, state.cfg.search_results_limit);
    if hits.is_empty() {
        return Ok(());
    }

    let (body, keyboard) = render_results_page(&text, &hits, 1);
    bot.send_message(msg.chat.id, body)
        .parse_mode(ParseMode::Html)
        .reply_markup(keyboard)
        .await?;
    Ok(())
}

async fn handle_pending_text(
    bot: Bot,
    msg: Message,
    state: Arc<AppState>,
    pending: Pending,
    text: &str,
) -> ResponseResult<()> {
    let Some(from) = msg.from() else {
        return Ok(());
    };
    let user = from.id.0 as i64;
    let chat = msg.chat.id;

    match pending {
        // t.me links are accepted in place of a forward for link flows.
        Pending::GenlinkSource | Pending::BatchFirst | Pending::BatchSecond { .. } => {
            let Some(reference) = reference_from_store_link(state.cfg.store_channel.0, text)
            else {
                state.pending.insert(user, pending);
                send_html(
                    &bot,
                    chat,
                    "❌ That does not look like a store-channel file. Forward the file itself or paste its t.me link.",
                )
                .await;
                return Ok(());
            };
            media::advance_link_flow(&bot, &state, user, chat, pending, reference).await;
        }

        Pending::ProcessSource => {
            state.pending.insert(user, pending);
            send_html(&bot, chat, "Forward the stored video file itself, please.").await;
        }

        Pending::ScreenshotAt => {
            let Ok(at_second) = text.parse::<u32>() else {
                state.pending.insert(user, Pending::ScreenshotAt);
                send_html(
                    &bot,
                    chat,
                    "<b>Invalid timestamp.</b> Reply with a number of seconds, e.g. <code>90</code>.",
                )
                .await;
                return Ok(());
            };
            workspace_ops::run_operation(
                &bot,
                &state,
                user,
                chat,
                OperationSpec::Screenshot { at_second },
            )
            .await;
        }

        Pending::ClipDetails => {
            let parts: Vec<&str> = text.split_whitespace().collect();
            let parsed = match parts.as_slice() {
                [start, duration] => start
                    .parse::<u32>()
                    .ok()
                    .zip(duration.parse::<u32>().ok()),
                _ => None,
            };
            let Some((start_second, duration_seconds)) = parsed else {
                state.pending.insert(user, Pending::ClipDetails);
                send_html(
                    &bot,
                    chat,
                    "<b>Invalid format.</b> Reply like <code>90 20</code> to clip 20s starting at 1m30s (max 60s).",
                )
                .await;
                return Ok(());
            };
            workspace_ops::run_operation(
                &bot,
                &state,
                user,
                chat,
                OperationSpec::Clip {
                    start_second,
                    duration_seconds,
                },
            )
            .await;
        }

        Pending::WatermarkText => {
            workspace_ops::run_operation(
                &bot,
                &state,
                user,
                chat,
                OperationSpec::Watermark {
                    text: text.to_string(),
                },
            )
            .await;
        }

        Pending::AdminReply { target } => {
            send_html(
                &bot,
                teloxide::types::ChatId(target),
                &format!(
                    "💬 <b>A message from the admin team about your request:</b>\n\n<i>{}</i>",
                    escape_html(text)
                ),
            )
            .await;
            send_html(&bot, chat, "✅ Message sent.").await;
        }
    }

    Ok(())
}

/// Parse a store-channel `t.me` link into a reference.
fn reference_from_store_link(store_channel: i64, text: &str) -> Option<Reference> {
    let re = Regex::new(r"^https://t\.me/(?:c/)?(\w+)/(\d+)$").expect("valid regex");
    let caps = re.captures(text.trim())?;
    let channel = caps.get(1)?.as_str();
    let message_id: i64 = caps.get(2)?.as_str().parse().ok()?;

    // Private channels appear as `t.me/c/<internal id>/<msg>`, where the
    // internal id is the channel id without the -100 prefix.
    if channel.chars().all(|c| c.is_ascii_digit())
        && format!("-100{channel}") == store_channel.to_string()
    {
        return Some(Reference(message_id));
    }
    None
}

/// Build one page of search results with selection and paging buttons.
pub fn render_results_page(
    query: &str,
    hits: &[SearchHit],
    page: usize,
) -> (String, InlineKeyboardMarkup) {
    let total_pages = hits.len().div_ceil(RESULTS_PER_PAGE).max(1);
    let page = page.clamp(1, total_pages);
    let start = (page - 1) * RESULTS_PER_PAGE;
    let visible = &hits[start..hits.len().min(start + RESULTS_PER_PAGE)];

    let mut rows: Vec<Vec<InlineKeyboardButton>> = Vec::new();
    for hit in visible {
        let label = format!(
            "📄 {} ({})",
            truncate_label(&hit.display_name, 40),
            format_bytes(hit.byte_size)
        );
        rows.push(vec![InlineKeyboardButton::callback(
            label,
            format!("selectfile_{}", hit.reference.0),
        )]);
    }

    let query_key = callback_query_key(query);
    let mut nav = Vec::new();
    if page > 1 {
        nav.push(InlineKeyboardButton::callback(
            "⬅️ Prev",
            format!("spage_{}_{query_key}", page - 1),
        ));
    }
    if page < total_pages {
        nav.push(InlineKeyboardButton::callback(
            "Next ➡️",
            format!("spage_{}_{query_key}", page + 1),
        ));
    }
    if !nav.is_empty() {
        rows.push(nav);
    }

    let body = format!(
        "🔎 <b>Results for '{}'</b> (page {page}/{total_pages})\n\nSelect a file below:",
        escape_html(query)
    );
    (body, InlineKeyboardMarkup::new(rows))
}

/// Callback data is limited to 64 bytes; keep the query part bounded.
fn callback_query_key(query: &str) -> String {
    let mut out = String::new();
    for ch in query.chars() {
        if out.len() + ch.len_utf8() > MAX_QUERY_CALLBACK_BYTES {
            break;
        }
        out.push(ch);
    }
    out
}

pub async fn handle_page_switch(
    bot: &Bot,
    state: &Arc<AppState>,
    message: &Message,
    page: usize,
    query: &str,
) {
    let hits = state.index.search(query, state.cfg.search_results_limit);
    if hits.is_empty() {
        return;
    }
    let (body, keyboard) = render_results_page(query, &hits, page);
    if let Err(e) = bot
        .edit_message_text(message.chat.id, message.id, body)
        .parse_mode(ParseMode::Html)
        .reply_markup(keyboard)
        .await
    {
        warn!("page switch edit failed: {e}");
    }
}
