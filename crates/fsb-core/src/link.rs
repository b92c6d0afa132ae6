//! Link codec: turns stored-item references into opaque, restart-proof
//! share tokens and back.
//!
//! A token is `base64url(payload:mac)` where the payload is `get-{id}` for a
//! single item or `get-{start}-{end}` for a contiguous range, and the mac is
//! a truncated HMAC-SHA256 tag under a durable signing key. Nothing in the
//! token depends on process state, so links survive restarts; key rotation
//! keeps previously issued links decodable via a grace list of old keys.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{
    domain::Reference,
    errors::TokenError,
    store::ContentStore,
    Result,
};

type HmacSha256 = Hmac<Sha256>;

/// Truncated tag length in bytes (16 hex chars in the payload text).
const MAC_LEN: usize = 8;

/// Hard cap on how many items one range token may address.
const MAX_RANGE_SPAN: i64 = 200;

/// What a token points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkTarget {
    Single(Reference),
    Range { start: Reference, end: Reference },
}

impl LinkTarget {
    /// Build a range target, rejecting inverted pairs up front.
    pub fn range(start: Reference, end: Reference) -> std::result::Result<Self, TokenError> {
        if end < start {
            return Err(TokenError::InvalidRange { start, end });
        }
        Ok(LinkTarget::Range { start, end })
    }

    /// The inclusive sequence of references this target addresses, in store
    /// order.
    pub fn references(&self) -> Vec<Reference> {
        match *self {
            LinkTarget::Single(r) => vec![r],
            LinkTarget::Range { start, end } => {
                (start.0..=end.0).map(Reference).collect()
            }
        }
    }

    pub fn span(&self) -> i64 {
        match *self {
            LinkTarget::Single(_) => 1,
            LinkTarget::Range { start, end } => end.0 - start.0 + 1,
        }
    }
}

/// Durable signing key material.
///
/// `previous` holds rotated-out keys that remain valid for decoding during
/// the rotation grace period. Only `current` is used for encoding.
#[derive(Clone)]
pub struct SigningKeys {
    current: Vec<u8>,
    previous: Vec<Vec<u8>>,
}

impl SigningKeys {
    pub fn new(current: impl Into<Vec<u8>>, previous: Vec<Vec<u8>>) -> Self {
        Self {
            current: current.into(),
            previous,
        }
    }

    pub fn from_config(signing_key: &str, previous_keys: &[String]) -> Self {
        Self {
            current: signing_key.as_bytes().to_vec(),
            previous: previous_keys.iter().map(|k| k.as_bytes().to_vec()).collect(),
        }
    }

    fn all(&self) -> impl Iterator<Item = &[u8]> {
        std::iter::once(self.current.as_slice()).chain(self.previous.iter().map(|k| k.as_slice()))
    }
}

#[derive(Clone)]
pub struct LinkCodec {
    keys: SigningKeys,
}

impl LinkCodec {
    pub fn new(keys: SigningKeys) -> Self {
        Self { keys }
    }

    pub fn encode(&self, target: &LinkTarget) -> String {
        let payload = match *target {
            LinkTarget::Single(r) => format!("get-{}", r.0),
            LinkTarget::Range { start, end } => format!("get-{}-{}", start.0, end.0),
        };
        let mac = sign(&self.keys.current, &payload);
        let signed = format!("{payload}:{}", hex::encode(mac));
        URL_SAFE_NO_PAD.encode(signed.as_bytes())
    }

    pub fn decode(&self, token: &str) -> std::result::Result<LinkTarget, TokenError> {
        // Tolerate padded variants of our own tokens.
        let token = token.trim().trim_end_matches('=');
        let raw = URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .map_err(|_| TokenError::Malformed)?;
        let signed = String::from_utf8(raw).map_err(|_| TokenError::Malformed)?;

        let (payload, mac_hex) = signed.rsplit_once(':').ok_or(TokenError::Malformed)?;
        let tag = hex::decode(mac_hex).map_err(|_| TokenError::Malformed)?;
        if !self.verify(payload, &tag) {
            return Err(TokenError::Malformed);
        }

        parse_payload(payload)
    }

    fn verify(&self, payload: &str, tag: &[u8]) -> bool {
        if tag.len() != MAC_LEN {
            return false;
        }
        self.keys.all().any(|key| {
            let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
            mac.update(payload.as_bytes());
            mac.verify_truncated_left(tag).is_ok()
        })
    }

    /// Public share URL embedding the token as a query parameter.
    pub fn share_url(&self, base_url: &str, target: &LinkTarget) -> String {
        format!("{}?start={}", base_url.trim_end_matches('/'), self.encode(target))
    }
}

fn sign(key: &[u8], payload: &str) -> [u8; MAC_LEN] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    let full = mac.finalize().into_bytes();
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(&full[..MAC_LEN]);
    out
}

fn parse_payload(payload: &str) -> std::result::Result<LinkTarget, TokenError> {
    let rest = payload.strip_prefix("get-").ok_or(TokenError::Malformed)?;

    let parts: Vec<&str> = rest.split('-').collect();
    match parts.as_slice() {
        [id] => Ok(LinkTarget::Single(parse_reference(id)?)),
        [start, end] => {
            let start = parse_reference(start)?;
            let end = parse_reference(end)?;
            LinkTarget::range(start, end)
        }
        _ => Err(TokenError::Malformed),
    }
}

fn parse_reference(s: &str) -> std::result::Result<Reference, TokenError> {
    let id: i64 = s.parse().map_err(|_| TokenError::Malformed)?;
    if id <= 0 {
        return Err(TokenError::Malformed);
    }
    Ok(Reference(id))
}

/// Resolves decoded tokens against the content store.
///
/// Decoding is pure; resolution is where a purged reference turns into
/// `UnknownReference` instead of a stale success.
pub struct LinkResolver {
    codec: LinkCodec,
    store: Arc<ContentStore>,
}

impl LinkResolver {
    pub fn new(codec: LinkCodec, store: Arc<ContentStore>) -> Self {
        Self { codec, store }
    }

    pub fn codec(&self) -> &LinkCodec {
        &self.codec
    }

    /// Decode a token and return the references that still exist in the
    /// store, in order.
    ///
    /// A single-item token whose reference was purged fails with
    /// `UnknownReference`. A range token skips purged items in the middle and
    /// fails only when nothing in the range survives.
    pub async fn resolve(&self, token: &str) -> Result<Vec<Reference>> {
        let target = self.codec.decode(token)?;
        if target.span() > MAX_RANGE_SPAN {
            return Err(crate::Error::InvalidOperation(format!(
                "range addresses {} items (limit {MAX_RANGE_SPAN})",
                target.span()
            )));
        }

        let mut existing = Vec::new();
        let mut first_missing = None;
        for reference in target.references() {
            if self.store.exists(reference).await? {
                existing.push(reference);
            } else if first_missing.is_none() {
                first_missing = Some(reference);
            }
        }

        if existing.is_empty() {
            let missing = first_missing.unwrap_or(match target {
                LinkTarget::Single(r) => r,
                LinkTarget::Range { start, .. } => start,
            });
            return Err(TokenError::UnknownReference(missing).into());
        }

        Ok(existing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> LinkCodec {
        LinkCodec::new(SigningKeys::new(b"primary-key".to_vec(), vec![]))
    }

    #[test]
    fn single_roundtrip() {
        let c = codec();
        let target = LinkTarget::Single(Reference(42));
        let token = c.encode(&target);
        assert_eq!(c.decode(&token).unwrap(), target);
    }

    #[test]
    fn range_roundtrip_expands_inclusive_in_order() {
        let c = codec();
        let target = LinkTarget::range(Reference(10), Reference(13)).unwrap();
        let token = c.encode(&target);
        let decoded = c.decode(&token).unwrap();
        assert_eq!(
            decoded.references(),
            vec![Reference(10), Reference(11), Reference(12), Reference(13)]
        );
    }

    #[test]
    fn inverted_range_is_rejected() {
        let err = LinkTarget::range(Reference(9), Reference(3)).unwrap_err();
        assert!(matches!(err, TokenError::InvalidRange { .. }));
    }

    #[test]
    fn tampered_token_is_malformed() {
        let c = codec();
        let token = c.encode(&LinkTarget::Single(Reference(7)));

        // Flip a character somewhere in the middle.
        let mut bytes = token.into_bytes();
        let mid = bytes.len() / 2;
        bytes[mid] = if bytes[mid] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();

        assert_eq!(c.decode(&tampered).unwrap_err(), TokenError::Malformed);
    }

    #[test]
    fn garbage_is_malformed() {
        let c = codec();
        assert_eq!(c.decode("not a token").unwrap_err(), TokenError::Malformed);
        assert_eq!(c.decode("").unwrap_err(), TokenError::Malformed);
    }

    #[test]
    fn rotated_key_decodes_during_grace_then_fails_when_dropped() {
        let old = LinkCodec::new(SigningKeys::new(b"old-key".to_vec(), vec![]));
        let token = old.encode(&LinkTarget::Single(Reference(5)));

        let rotated = LinkCodec::new(SigningKeys::new(
            b"new-key".to_vec(),
            vec![b"old-key".to_vec()],
        ));
        assert_eq!(
            rotated.decode(&token).unwrap(),
            LinkTarget::Single(Reference(5))
        );

        let dropped = LinkCodec::new(SigningKeys::new(b"new-key".to_vec(), vec![]));
        assert_eq!(dropped.decode(&token).unwrap_err(), TokenError::Malformed);
    }

    #[test]
    fn tokens_are_url_safe() {
        let c = codec();
        let token = c.encode(&LinkTarget::range(Reference(1), Reference(200)).unwrap());
        assert!(token
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'));
    }

    #[test]
    fn padded_token_still_decodes() {
        let c = codec();
        let token = format!("{}==", c.encode(&LinkTarget::Single(Reference(3))));
        assert_eq!(c.decode(&token).unwrap(), LinkTarget::Single(Reference(3)));
    }

    #[test]
    fn share_url_embeds_token_as_query_param() {
        let c = codec();
        let url = c.share_url("https://files.example.com/", &LinkTarget::Single(Reference(1)));
        assert!(url.starts_with("https://files.example.com?start="));
    }
}
