//! Incoming media: ingestion of new content, forwarded-file link flows,
//! workspace source selection, and bulk indexing sessions.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};
use tracing::{info, warn};

use fsb_core::{
    domain::{ChatId as CoreChatId, MessageId, MessageRef, Reference, StoredItem},
    link::LinkTarget,
};

use crate::message_media;
use crate::router::{AppState, Pending};

use super::{send_html, workspace_ops};

pub async fn handle_media(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(from) = msg.from() else {
        return Ok(());
    };
    let user = from.id.0 as i64;
    let chat = msg.chat.id;
    let is_admin = state.is_admin(user);

    // A waiting flow consumes the file.
    if let Some((_, pending)) = state.pending.remove(&user) {
        match pending {
            Pending::GenlinkSource | Pending::BatchFirst | Pending::BatchSecond { .. } => {
                let Some(reference) = reference_from_forward(&state, &msg) else {
                    state.pending.insert(user, pending);
                    send_html(
                        &bot,
                        chat,
                        "❌ <b>This file is not from the store channel.</b> Forward a stored file, please.",
                    )
                    .await;
                    return Ok(());
                };
                advance_link_flow(&bot, &state, user, chat, pending, reference).await;
            }
            Pending::ProcessSource => {
                let Some(reference) = reference_from_forward(&state, &msg) else {
                    state.pending.insert(user, pending);
                    send_html(
                        &bot,
                        chat,
                        "❌ Forward the video from the store channel, please.",
                    )
                    .await;
                    return Ok(());
                };
                workspace_ops::open_workspace(&bot, &state, user, chat, reference).await;
            }
            other => {
                // Text-input flows stay armed; the stray file is ignored.
                state.pending.insert(user, other);
            }
        }
        return Ok(());
    }

    if !is_admin {
        return Ok(());
    }

    // Active indexing session: count instead of ingesting.
    if state.indexing.contains_key(&user) {
        let Some(reference) = reference_from_forward(&state, &msg) else {
            send_html(
                &bot,
                chat,
                "Forward files <b>from the store channel</b> while indexing.",
            )
            .await;
            return Ok(());
        };
        // Probe first; the tally guard is not held across the await.
        match state.store.metadata(reference).await {
            Ok(item) => {
                use fsb_core::index::IndexOutcome;
                let outcome = state.index.register(&item);
                if let Some(mut stats) = state.indexing.get_mut(&user) {
                    match outcome {
                        IndexOutcome::New => stats.new += 1,
                        IndexOutcome::Duplicate => stats.duplicate += 1,
                    }
                    stats.cursor.advance_past(reference);
                }
            }
            Err(e) => warn!(reference = reference.0, "indexing probe failed: {e}"),
        }
        return Ok(());
    }

    ingest_new_file(&bot, &state, &msg).await;
    Ok(())
}

/// Operator sent a fresh file: archive it in the store channel, index it and
/// hand back the permanent link.
async fn ingest_new_file(bot: &Bot, state: &Arc<AppState>, msg: &Message) {
    let reply = match bot
        .send_message(msg.chat.id, "Saving to the library...")
        .await
    {
        Ok(m) => m,
        Err(e) => {
            warn!("reply failed: {e}");
            return;
        }
    };

    let source = MessageRef {
        chat_id: CoreChatId(msg.chat.id.0),
        message_id: MessageId(msg.id.0),
    };

    match state.store.ingest(source).await {
        Ok(item) => {
            state.index.register(&item);
            if let Err(e) = state
                .records
                .save_index_snapshot(state.index.snapshot())
                .await
            {
                warn!("index snapshot persist failed: {e}");
            }
            info!(reference = item.reference.0, "file ingested");

            let url = state
                .resolver
                .codec()
                .share_url(&state.cfg.link_base_url, &LinkTarget::Single(item.reference));
            let _ = bot
                .edit_message_text(
                    msg.chat.id,
                    reply.id,
                    format!(
                        "✅ <b>File saved &amp; link generated!</b>\n\n<code>{url}</code>"
                    ),
                )
                .parse_mode(teloxide::types::ParseMode::Html)
                .await;
        }
        Err(e) => {
            warn!("ingest failed: {e}");
            let _ = bot
                .edit_message_text(
                    msg.chat.id,
                    reply.id,
                    "❌ <b>Something went wrong!</b> Could not save the file to the store channel.",
                )
                .parse_mode(teloxide::types::ParseMode::Html)
                .await;
        }
    }
}

/// Files posted straight into the store channel are indexed automatically.
pub async fn handle_store_channel_post(msg: &Message, state: &Arc<AppState>) {
    let Some((_, display_name, byte_size, media_kind)) = message_media(msg) else {
        return;
    };
    let item = StoredItem {
        reference: Reference(msg.id.0 as i64),
        display_name,
        byte_size,
        media_kind,
        created_at: msg.date,
    };
    state.index.register(&item);
    info!(reference = item.reference.0, "store channel post indexed");
}

/// Continue a `/genlink` or `/batch` flow with a resolved reference.
pub(super) async fn advance_link_flow(
    bot: &Bot,
    state: &Arc<AppState>,
    user: i64,
    chat: ChatId,
    pending: Pending,
    reference: Reference,
) {
    match pending {
        Pending::GenlinkSource => {
            send_link_reply(bot, state, chat, &LinkTarget::Single(reference)).await;
        }
        Pending::BatchFirst => {
            state
                .pending
                .insert(user, Pending::BatchSecond { first: reference });
            send_html(
                bot,
                chat,
                "🔗 <b>Batch link: step 2 of 2</b>\n\nNow forward the <b>last</b> file of the range.",
            )
            .await;
        }
        Pending::BatchSecond { first } => {
            // Accept the endpoints in either order.
            let (start, end) = if first <= reference {
                (first, reference)
            } else {
                (reference, first)
            };
            match LinkTarget::range(start, end) {
                Ok(target) => send_link_reply(bot, state, chat, &target).await,
                Err(e) => send_html(bot, chat, &format!("❌ {e}")).await,
            }
        }
        _ => {}
    }
}

async fn send_link_reply(bot: &Bot, state: &Arc<AppState>, chat: ChatId, target: &LinkTarget) {
    let url = state
        .resolver
        .codec()
        .share_url(&state.cfg.link_base_url, target);
    send_html(
        bot,
        chat,
        &format!(
            "✅ <b>Link generated!</b>\n\nYour permanent link is ready to be shared.\n\n<code>{url}</code>"
        ),
    )
    .await;
}

/// Reference of a message forwarded out of the store channel, if that is
/// what this is.
fn reference_from_forward(state: &Arc<AppState>, msg: &Message) -> Option<Reference> {
    let chat = msg.forward_from_chat()?;
    if chat.id.0 != state.cfg.store_channel.0 {
        return None;
    }
    msg.forward_from_message_id()
        .map(|id| Reference(id as i64))
}
