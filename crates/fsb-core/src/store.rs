//! Content store adapter: the append-only item store built on the transport.
//!
//! The transport is fallible in boring ways (rate limits, network); this
//! layer owns the bounded exponential backoff so callers see either success,
//! a definite `NotFound`, or `FetchFailed` after the attempts are spent.
//! Concurrent fetches of the same reference are independent on purpose; the
//! workspace layer is the one that de-duplicates expensive downloads.

use std::{path::Path, sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::warn;

use crate::{
    config::Config,
    domain::{ChatId, MessageRef, Reference, StoredItem},
    errors::Error,
    transport::{ContentTransport, DeliveryOptions},
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            attempts: cfg.fetch_attempts,
            base_delay: cfg.fetch_base_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based): base, 2x, 4x, ...
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

pub struct ContentStore {
    transport: Arc<dyn ContentTransport>,
    retry: RetryPolicy,
}

impl ContentStore {
    pub fn new(transport: Arc<dyn ContentTransport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// Append an operator upload to the store and describe it.
    ///
    /// Ingestion is append-only: the transport hands out a fresh reference
    /// and this layer never reassigns one.
    pub async fn ingest(&self, source: MessageRef) -> Result<StoredItem> {
        let reference = self
            .with_retry(source_reference_hint(source), || {
                self.transport.archive(source)
            })
            .await?;
        self.metadata(reference).await
    }

    /// Full metadata for a stored item, or `NotFound` once purged.
    pub async fn metadata(&self, reference: Reference) -> Result<StoredItem> {
        let meta = self
            .with_retry(reference, || self.transport.probe(reference))
            .await?
            .ok_or(Error::NotFound(reference))?;
        Ok(StoredItem {
            reference,
            display_name: meta.display_name,
            byte_size: meta.byte_size,
            media_kind: meta.media_kind,
            created_at: meta.created_at,
        })
    }

    pub async fn exists(&self, reference: Reference) -> Result<bool> {
        let meta = self
            .with_retry(reference, || self.transport.probe(reference))
            .await?;
        Ok(meta.is_some())
    }

    /// Copy a stored item into a consumer chat.
    pub async fn deliver(
        &self,
        reference: Reference,
        dest: ChatId,
        options: &DeliveryOptions,
    ) -> Result<MessageRef> {
        self.with_retry(reference, || {
            self.transport.copy_to(reference, dest, options)
        })
        .await
    }

    /// Download a stored item's bytes into `dest`.
    pub async fn fetch_to_file(&self, reference: Reference, dest: &Path) -> Result<u64> {
        self.with_retry(reference, || self.transport.fetch_to_file(reference, dest))
            .await
    }

    /// Remove the backing message; false when it was already gone.
    pub async fn purge(&self, reference: Reference) -> Result<bool> {
        self.with_retry(reference, || self.transport.purge(reference))
            .await
    }

    async fn with_retry<T, Fut>(&self, reference: Reference, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() => {
                    if attempt >= self.retry.attempts {
                        return Err(Error::FetchFailed {
                            reference,
                            attempts: attempt,
                            detail: e.to_string(),
                        });
                    }
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        reference = reference.0,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient transport error, backing off: {e}"
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// `archive` runs before a reference exists; use the source message id so a
// `FetchFailed` error still names something traceable.
fn source_reference_hint(source: MessageRef) -> Reference {
    Reference(source.message_id.0 as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MediaKind, MessageId};
    use crate::errors::TokenError;
    use crate::link::{LinkCodec, LinkResolver, LinkTarget, SigningKeys};
    use crate::transport::ItemMetadata;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Transport that fails transiently a configured number of times, and
    /// knows a fixed set of existing references.
    struct FlakyTransport {
        failures_left: AtomicU32,
        calls: AtomicU32,
        known: Mutex<HashSet<i64>>,
    }

    impl FlakyTransport {
        fn new(failures: u32, known: &[i64]) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                known: Mutex::new(known.iter().copied().collect()),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn maybe_fail(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(Error::TransientTransport("flood wait".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ContentTransport for FlakyTransport {
        async fn archive(&self, source: MessageRef) -> Result<Reference> {
            self.maybe_fail()?;
            let reference = Reference(source.message_id.0 as i64 + 1000);
            self.known.lock().unwrap().insert(reference.0);
            Ok(reference)
        }

        async fn copy_to(
            &self,
            reference: Reference,
            dest: ChatId,
            _options: &DeliveryOptions,
        ) -> Result<MessageRef> {
            self.maybe_fail()?;
            if !self.known.lock().unwrap().contains(&reference.0) {
                return Err(Error::NotFound(reference));
            }
            Ok(MessageRef {
                chat_id: dest,
                message_id: MessageId(reference.0 as i32),
            })
        }

        async fn fetch_to_file(&self, reference: Reference, _dest: &Path) -> Result<u64> {
            self.maybe_fail()?;
            if !self.known.lock().unwrap().contains(&reference.0) {
                return Err(Error::NotFound(reference));
            }
            Ok(1024)
        }

        async fn probe(&self, reference: Reference) -> Result<Option<ItemMetadata>> {
            self.maybe_fail()?;
            if !self.known.lock().unwrap().contains(&reference.0) {
                return Ok(None);
            }
            Ok(Some(ItemMetadata {
                display_name: format!("file-{}.mkv", reference.0),
                byte_size: 1024,
                media_kind: MediaKind::Video,
                created_at: Utc::now(),
            }))
        }

        async fn purge(&self, reference: Reference) -> Result<bool> {
            self.maybe_fail()?;
            Ok(self.known.lock().unwrap().remove(&reference.0))
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(0),
        }
    }

    #[tokio::test]
    async fn fetch_recovers_within_backoff_budget() {
        let transport = Arc::new(FlakyTransport::new(2, &[5]));
        let store = ContentStore::new(transport.clone(), fast_retry());

        let n = store
            .fetch_to_file(Reference(5), Path::new("/tmp/unused"))
            .await
            .unwrap();
        assert_eq!(n, 1024);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn fetch_escalates_after_attempts_exhausted() {
        let transport = Arc::new(FlakyTransport::new(10, &[5]));
        let store = ContentStore::new(transport, fast_retry());

        let err = store
            .fetch_to_file(Reference(5), Path::new("/tmp/unused"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::FetchFailed {
                reference: Reference(5),
                attempts: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let transport = Arc::new(FlakyTransport::new(0, &[]));
        let store = ContentStore::new(transport.clone(), fast_retry());

        let err = store
            .fetch_to_file(Reference(99), Path::new("/tmp/unused"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(Reference(99))));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn ingest_assigns_fresh_reference_and_describes_item() {
        let transport = Arc::new(FlakyTransport::new(0, &[]));
        let store = ContentStore::new(transport, fast_retry());

        let source = MessageRef {
            chat_id: ChatId(7),
            message_id: MessageId(3),
        };
        let item = store.ingest(source).await.unwrap();
        assert_eq!(item.reference, Reference(1003));
        assert_eq!(item.media_kind, MediaKind::Video);
        assert!(item.display_name.contains("1003"));
    }

    #[tokio::test]
    async fn resolver_reports_unknown_reference_after_purge() {
        let transport = Arc::new(FlakyTransport::new(0, &[5]));
        let store = Arc::new(ContentStore::new(transport, fast_retry()));
        let codec = LinkCodec::new(SigningKeys::new(b"k".to_vec(), vec![]));
        let token = codec.encode(&LinkTarget::Single(Reference(5)));
        let resolver = LinkResolver::new(codec, store.clone());

        assert_eq!(resolver.resolve(&token).await.unwrap(), vec![Reference(5)]);

        assert!(store.purge(Reference(5)).await.unwrap());
        let err = resolver.resolve(&token).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Token(TokenError::UnknownReference(Reference(5)))
        ));
    }

    #[tokio::test]
    async fn resolver_skips_purged_middles_of_a_range() {
        let transport = Arc::new(FlakyTransport::new(0, &[10, 12]));
        let store = Arc::new(ContentStore::new(transport, fast_retry()));
        let codec = LinkCodec::new(SigningKeys::new(b"k".to_vec(), vec![]));
        let token = codec.encode(&LinkTarget::range(Reference(10), Reference(12)).unwrap());
        let resolver = LinkResolver::new(codec, store);

        assert_eq!(
            resolver.resolve(&token).await.unwrap(),
            vec![Reference(10), Reference(12)]
        );
    }
}
