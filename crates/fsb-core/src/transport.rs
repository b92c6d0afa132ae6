use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::{ChatId, MediaKind, MessageRef, Reference},
    Result,
};

/// Metadata the transport can recover about a stored message.
#[derive(Clone, Debug)]
pub struct ItemMetadata {
    pub display_name: String,
    pub byte_size: u64,
    pub media_kind: MediaKind,
    pub created_at: DateTime<Utc>,
}

/// Presentation knobs for a delivered copy.
#[derive(Clone, Debug, Default)]
pub struct DeliveryOptions {
    pub caption: Option<String>,
    pub protect_content: bool,
}

/// Hexagonal port for the content transport backing the store.
///
/// The store channel's message ids are the item references; the adapter must
/// classify its failures as `Error::TransientTransport` (network, rate
/// limit), `Error::NotFound`, or permanent, so the content store can apply
/// its retry policy correctly.
#[async_trait]
pub trait ContentTransport: Send + Sync {
    /// Copy an operator upload into the store channel. The resulting message
    /// id becomes the item's reference; references are never reused.
    async fn archive(&self, source: MessageRef) -> Result<Reference>;

    /// Copy a stored item out of the store channel into a consumer chat.
    async fn copy_to(
        &self,
        reference: Reference,
        dest: ChatId,
        options: &DeliveryOptions,
    ) -> Result<MessageRef>;

    /// Download a stored item's bytes to a local file. Returns the byte
    /// count written.
    async fn fetch_to_file(&self, reference: Reference, dest: &Path) -> Result<u64>;

    /// Metadata probe; `None` when the backing message no longer exists.
    async fn probe(&self, reference: Reference) -> Result<Option<ItemMetadata>>;

    /// Delete the backing message. Returns false when it was already gone.
    async fn purge(&self, reference: Reference) -> Result<bool>;
}
