//! Shared delivery path: copy stored items to a consumer, log the download,
//! and register the expiry artifact with its countdown notice.

use std::sync::Arc;

use teloxide::{prelude::*, types::ParseMode};
use tracing::warn;

use fsb_core::{
    domain::{ChatId as CoreChatId, MessageId, MessageRef, Reference, UserId},
    errors::Error,
    formatting::delivery_caption,
    transport::DeliveryOptions,
};

use crate::router::{delivery_notice_text, AppState};

/// Deliver `references` to `user`'s private chat. Returns how many copies
/// went out.
pub async fn deliver_references(
    bot: &Bot,
    state: &Arc<AppState>,
    user: UserId,
    references: &[Reference],
) -> usize {
    let chat = teloxide::types::ChatId(user.0);
    let mut delivered = 0usize;

    for &reference in references {
        let caption = caption_for(state, reference).await;
        let options = DeliveryOptions {
            caption,
            protect_content: state.cfg.protect_content,
        };

        let copy = match state
            .store
            .deliver(reference, CoreChatId(user.0), &options)
            .await
        {
            Ok(copy) => copy,
            Err(Error::NotFound(_)) => {
                super::send_html(
                    bot,
                    chat,
                    &format!("⚠️ File <code>{reference}</code> is no longer available."),
                )
                .await;
                continue;
            }
            Err(e) => {
                warn!(reference = reference.0, "delivery failed: {e}");
                super::send_html(
                    bot,
                    chat,
                    "❌ <b>Something went wrong</b> while fetching this file. Please try the link again.",
                )
                .await;
                continue;
            }
        };

        delivered += 1;
        state.index.record_access(reference);
        if let Err(e) = state.records.log_download(reference, user).await {
            warn!("download log failed: {e}");
        }

        if !state.cfg.delivery_ttl.is_zero() {
            let artifact = state
                .workflow
                .deliver(reference, user, copy, chrono::Utc::now());
            attach_notice(bot, state, artifact.id, copy).await;
        }
    }

    delivered
}

/// Send the countdown message under a delivered copy and remember it on the
/// artifact so the sweep can edit it later.
pub async fn attach_notice(bot: &Bot, state: &Arc<AppState>, artifact_id: u64, copy: MessageRef) {
    let chat = teloxide::types::ChatId(copy.chat_id.0);
    let sent = bot
        .send_message(chat, delivery_notice_text(state.cfg.delivery_ttl))
        .parse_mode(ParseMode::Html)
        .reply_to_message_id(teloxide::types::MessageId(copy.message_id.0))
        .await;

    match sent {
        Ok(m) => state.workflow.set_notice(
            artifact_id,
            MessageRef {
                chat_id: copy.chat_id,
                message_id: MessageId(m.id.0),
            },
        ),
        Err(e) => warn!(artifact = artifact_id, "could not send expiry notice: {e}"),
    }
}

async fn caption_for(state: &Arc<AppState>, reference: Reference) -> Option<String> {
    let template = state.cfg.custom_caption.as_deref()?;

    // Prefer the index's display name; fall back to a metadata probe.
    let name = match state.index.get(reference) {
        Some(hit) => hit.display_name,
        None => match state.store.metadata(reference).await {
            Ok(item) => item.display_name,
            Err(_) => return None,
        },
    };
    delivery_caption(Some(template), &name)
}
