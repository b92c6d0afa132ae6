//! Telegram adapter (teloxide).
//!
//! This crate implements the `fsb-core` `ContentTransport` port over the
//! Telegram Bot API and hosts the update router and handlers.

use std::path::Path;

use async_trait::async_trait;

use teloxide::{net::Download, prelude::*, types::FileMeta};
use tokio::time::sleep;

pub mod handlers;
pub mod router;

pub use teloxide::Bot;

use fsb_core::{
    domain::{ChatId, MediaKind, MessageId, MessageRef, Reference},
    errors::Error,
    transport::{ContentTransport, DeliveryOptions, ItemMetadata},
    Result,
};

/// `ContentTransport` over the Bot API.
///
/// The store channel's message ids are the references. The Bot API cannot
/// read an arbitrary channel message directly, so metadata probes forward the
/// message into a scratch chat (the owner's private chat), inspect the copy,
/// and delete it again.
#[derive(Clone)]
pub struct TelegramVault {
    bot: Bot,
    store_channel: ChatId,
    scratch_chat: ChatId,
}

impl TelegramVault {
    pub fn new(bot: Bot, store_channel: ChatId, scratch_chat: ChatId) -> Self {
        Self {
            bot,
            store_channel,
            scratch_chat,
        }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
        teloxide::types::MessageId(message_id.0)
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        use teloxide::ApiError;
        match &e {
            teloxide::RequestError::RetryAfter(d) => {
                Error::TransientTransport(format!("rate limited, retry after {}s", d.as_secs()))
            }
            teloxide::RequestError::Network(_) | teloxide::RequestError::Io(_) => {
                Error::TransientTransport(format!("telegram network error: {e}"))
            }
            teloxide::RequestError::Api(api) => match api {
                ApiError::MessageIdInvalid
                | ApiError::MessageToForwardNotFound
                | ApiError::MessageToDeleteNotFound => Error::NotFound(Reference(0)),
                _ => Error::External(format!("telegram error: {e}")),
            },
            _ => Error::External(format!("telegram error: {e}")),
        }
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }

    /// Forward the stored message into the scratch chat and hand the copy to
    /// `f`; the copy is deleted afterwards. `Ok(None)` when the message no
    /// longer exists.
    async fn with_scratch_copy<T>(
        &self,
        reference: Reference,
        f: impl FnOnce(&teloxide::types::Message) -> T,
    ) -> Result<Option<T>> {
        let forwarded = self
            .with_retry(|| {
                self.bot.forward_message(
                    Self::tg_chat(self.scratch_chat),
                    Self::tg_chat(self.store_channel),
                    teloxide::types::MessageId(reference.0 as i32),
                )
            })
            .await;

        let forwarded = match forwarded {
            Ok(m) => m,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let out = f(&forwarded);

        let _ = self
            .bot
            .delete_message(Self::tg_chat(self.scratch_chat), forwarded.id)
            .await;

        Ok(Some(out))
    }
}

pub(crate) fn message_media(
    msg: &teloxide::types::Message,
) -> Option<(FileMeta, String, u64, MediaKind)> {
    if let Some(doc) = msg.document() {
        let name = doc
            .file_name
            .clone()
            .unwrap_or_else(|| format!("document-{}", msg.id.0));
        return Some((
            doc.file.clone(),
            name,
            doc.file.size as u64,
            MediaKind::Document,
        ));
    }
    if let Some(video) = msg.video() {
        let name = video
            .file_name
            .clone()
            .unwrap_or_else(|| format!("video-{}.mp4", msg.id.0));
        return Some((
            video.file.clone(),
            name,
            video.file.size as u64,
            MediaKind::Video,
        ));
    }
    if let Some(audio) = msg.audio() {
        let name = audio
            .file_name
            .clone()
            .unwrap_or_else(|| format!("audio-{}.mp3", msg.id.0));
        return Some((
            audio.file.clone(),
            name,
            audio.file.size as u64,
            MediaKind::Audio,
        ));
    }
    if let Some(sizes) = msg.photo() {
        let best = sizes.iter().max_by_key(|p| p.file.size)?;
        return Some((
            best.file.clone(),
            format!("photo-{}.jpg", msg.id.0),
            best.file.size as u64,
            MediaKind::Image,
        ));
    }
    None
}

#[async_trait]
impl ContentTransport for TelegramVault {
    async fn archive(&self, source: MessageRef) -> Result<Reference> {
        let id = self
            .with_retry(|| {
                self.bot
                    .copy_message(
                        Self::tg_chat(self.store_channel),
                        Self::tg_chat(source.chat_id),
                        Self::tg_msg_id(source.message_id),
                    )
                    .disable_notification(true)
            })
            .await?;
        Ok(Reference(id.0 as i64))
    }

    async fn copy_to(
        &self,
        reference: Reference,
        dest: ChatId,
        options: &DeliveryOptions,
    ) -> Result<MessageRef> {
        let id = self
            .with_retry(|| {
                let mut req = self
                    .bot
                    .copy_message(
                        Self::tg_chat(dest),
                        Self::tg_chat(self.store_channel),
                        teloxide::types::MessageId(reference.0 as i32),
                    )
                    .protect_content(options.protect_content);
                if let Some(caption) = &options.caption {
                    req = req
                        .caption(caption.clone())
                        .parse_mode(teloxide::types::ParseMode::Html);
                }
                req
            })
            .await
            .map_err(|e| match e {
                Error::NotFound(_) => Error::NotFound(reference),
                other => other,
            })?;
        Ok(MessageRef {
            chat_id: dest,
            message_id: MessageId(id.0),
        })
    }

    async fn fetch_to_file(&self, reference: Reference, dest: &Path) -> Result<u64> {
        let meta = self
            .with_scratch_copy(reference, |msg| message_media(msg).map(|(f, ..)| f))
            .await?
            .flatten()
            .ok_or(Error::NotFound(reference))?;

        let file = self
            .with_retry(|| self.bot.get_file(meta.id.clone()))
            .await?;

        let mut out = tokio::fs::File::create(dest).await?;
        self.bot
            .download_file(&file.path, &mut out)
            .await
            .map_err(|e| Error::TransientTransport(format!("download failed: {e}")))?;

        let written = tokio::fs::metadata(dest).await?.len();
        Ok(written)
    }

    async fn probe(&self, reference: Reference) -> Result<Option<ItemMetadata>> {
        self.with_scratch_copy(reference, |msg| match message_media(msg) {
            Some((_, display_name, byte_size, media_kind)) => ItemMetadata {
                display_name,
                byte_size,
                media_kind,
                created_at: msg.date,
            },
            None => ItemMetadata {
                display_name: format!("message-{}", msg.id.0),
                byte_size: 0,
                media_kind: MediaKind::Other,
                created_at: msg.date,
            },
        })
        .await
    }

    async fn purge(&self, reference: Reference) -> Result<bool> {
        let res = self
            .with_retry(|| {
                self.bot.delete_message(
                    Self::tg_chat(self.store_channel),
                    teloxide::types::MessageId(reference.0 as i32),
                )
            })
            .await;
        match res {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
