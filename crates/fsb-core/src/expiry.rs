//! Delivery expiry and the re-request handshake.
//!
//! Every delivered copy gets a `DeliveryArtifact` with a fixed TTL. Expiry is
//! evaluated lazily as a pure function of timestamps; there is no per-artifact
//! timer. A bounded sweep (`take_newly_expired`) lets the transport layer
//! swap an expired delivery's countdown message for a "request again" button.
//! Consumers whose copy expired may request re-delivery within a window;
//! admins accept (a brand-new artifact with a fresh TTL) or decline with a
//! reason. Declines are per-request, not a ban.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    domain::{MessageRef, Reference, UserId},
    errors::RequestWorkflowError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Expired,
}

/// Why an admin declined a re-delivery request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    NotAvailable,
    InvalidRequest,
    PolicyViolation,
    Other,
}

impl DeclineReason {
    pub fn message(&self) -> &'static str {
        match self {
            DeclineReason::NotAvailable => "The content is no longer available.",
            DeclineReason::InvalidRequest => "The request could not be matched to a valid file.",
            DeclineReason::PolicyViolation => "The request violates the content policy.",
            DeclineReason::Other => "The request could not be fulfilled.",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ArtifactState {
    Issued,
    RequestPending {
        requested_at: DateTime<Utc>,
    },
    Declined {
        reason: DeclineReason,
        note: Option<String>,
        decided_at: DateTime<Utc>,
    },
}

/// A delivered copy of a stored item, subject to expiry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeliveryArtifact {
    pub id: u64,
    pub source_reference: Reference,
    pub consumer: UserId,
    /// The delivered copy in the consumer's chat.
    pub delivery: MessageRef,
    /// The countdown / "request again" companion message, once known.
    pub notice: Option<MessageRef>,
    pub sent_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ArtifactState,
    /// Set when a later accept superseded this artifact. History stays
    /// queryable; superseded artifacts are never deleted.
    pub superseded_by: Option<u64>,
    /// True for artifacts minted by an accepted re-request. Their expiry is
    /// final: no further re-request affordance is offered.
    pub redelivery: bool,
    expiry_notified: bool,
}

/// Pure expiry check: fresh strictly before the deadline, expired at and
/// after it. Calling this any number of times changes nothing.
pub fn check_expiry(artifact: &DeliveryArtifact, now: DateTime<Utc>) -> Freshness {
    if now < artifact.expires_at {
        Freshness::Fresh
    } else {
        Freshness::Expired
    }
}

/// Admin decision on a pending re-delivery request.
#[derive(Clone, Debug)]
pub enum RequestDecision {
    /// The re-sent copy's message ref; a new artifact is minted for it.
    Accept { delivery: MessageRef },
    Decline {
        reason: DeclineReason,
        note: Option<String>,
    },
}

#[derive(Clone, Copy, Debug)]
pub struct WorkflowConfig {
    pub ttl: Duration,
    pub rerequest_window: Duration,
}

impl WorkflowConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            ttl: cfg.delivery_ttl,
            rerequest_window: cfg.rerequest_window,
        }
    }
}

pub struct DeliveryWorkflow {
    cfg: WorkflowConfig,
    artifacts: DashMap<u64, DeliveryArtifact>,
    next_id: AtomicU64,
}

impl DeliveryWorkflow {
    pub fn new(cfg: WorkflowConfig) -> Self {
        Self {
            cfg,
            artifacts: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.cfg.ttl
    }

    /// Record a fresh delivery.
    pub fn deliver(
        &self,
        source_reference: Reference,
        consumer: UserId,
        delivery: MessageRef,
        now: DateTime<Utc>,
    ) -> DeliveryArtifact {
        self.insert(source_reference, consumer, delivery, now, false)
    }

    pub fn get(&self, id: u64) -> Option<DeliveryArtifact> {
        self.artifacts.get(&id).map(|a| a.clone())
    }

    /// Attach the countdown/affordance companion message.
    pub fn set_notice(&self, id: u64, notice: MessageRef) {
        if let Some(mut a) = self.artifacts.get_mut(&id) {
            a.notice = Some(notice);
        }
    }

    /// Consumer asks for the expired copy again.
    pub fn request_redelivery(
        &self,
        id: u64,
        consumer: UserId,
        now: DateTime<Utc>,
    ) -> std::result::Result<DeliveryArtifact, RequestWorkflowError> {
        let mut artifact = self
            .artifacts
            .get_mut(&id)
            .ok_or(RequestWorkflowError::UnknownArtifact(id))?;
        // The button belongs to the recipient; anyone else sees a dead link.
        if artifact.consumer != consumer {
            return Err(RequestWorkflowError::UnknownArtifact(id));
        }

        if matches!(artifact.state, ArtifactState::RequestPending { .. }) {
            return Err(RequestWorkflowError::AlreadyPending);
        }
        if check_expiry(&artifact, now) == Freshness::Fresh {
            return Err(RequestWorkflowError::NotExpired);
        }
        if artifact.redelivery || now >= self.window_deadline(&artifact) {
            return Err(RequestWorkflowError::WindowClosed);
        }

        artifact.state = ArtifactState::RequestPending { requested_at: now };
        Ok(artifact.clone())
    }

    /// Admin resolves a pending request.
    ///
    /// Accept mints a brand-new artifact for the same source with the TTL
    /// restarting at decision time and marks the old artifact superseded.
    /// Decline records the reason; the consumer may request again later while
    /// the window is open.
    pub fn resolve_request(
        &self,
        id: u64,
        decision: RequestDecision,
        now: DateTime<Utc>,
    ) -> std::result::Result<DeliveryArtifact, RequestWorkflowError> {
        let (source_reference, consumer) = {
            let mut artifact = self
                .artifacts
                .get_mut(&id)
                .ok_or(RequestWorkflowError::UnknownArtifact(id))?;
            if !matches!(artifact.state, ArtifactState::RequestPending { .. }) {
                return Err(RequestWorkflowError::NotPending);
            }

            match &decision {
                RequestDecision::Decline { reason, note } => {
                    artifact.state = ArtifactState::Declined {
                        reason: *reason,
                        note: note.clone(),
                        decided_at: now,
                    };
                    return Ok(artifact.clone());
                }
                RequestDecision::Accept { .. } => {
                    artifact.state = ArtifactState::Issued;
                    (artifact.source_reference, artifact.consumer)
                }
            }
        };

        let RequestDecision::Accept { delivery } = decision else {
            unreachable!("decline returned above");
        };
        let fresh = self.insert(source_reference, consumer, delivery, now, true);
        if let Some(mut old) = self.artifacts.get_mut(&id) {
            old.superseded_by = Some(fresh.id);
        }
        Ok(fresh)
    }

    /// Artifacts that crossed their deadline since the last sweep, each
    /// reported exactly once. The caller replaces their user-facing notice
    /// with the re-request affordance (or the final-expiry text for
    /// re-delivered copies).
    pub fn take_newly_expired(&self, now: DateTime<Utc>) -> Vec<DeliveryArtifact> {
        let mut out = Vec::new();
        for mut pair in self.artifacts.iter_mut() {
            let artifact = pair.value_mut();
            if artifact.expiry_notified || artifact.superseded_by.is_some() {
                continue;
            }
            if check_expiry(artifact, now) == Freshness::Expired {
                artifact.expiry_notified = true;
                out.push(artifact.clone());
            }
        }
        out.sort_by_key(|a| a.id);
        out
    }

    /// Deadline past which a re-request is no longer accepted.
    pub fn window_deadline(&self, artifact: &DeliveryArtifact) -> DateTime<Utc> {
        artifact.expires_at
            + chrono::Duration::from_std(self.cfg.rerequest_window)
                .unwrap_or_else(|_| chrono::Duration::hours(24))
    }

    pub fn snapshot(&self) -> Vec<DeliveryArtifact> {
        let mut all: Vec<DeliveryArtifact> =
            self.artifacts.iter().map(|a| a.clone()).collect();
        all.sort_by_key(|a| a.id);
        all
    }

    pub fn restore(&self, artifacts: Vec<DeliveryArtifact>) {
        self.artifacts.clear();
        let mut max_id = 0;
        for a in artifacts {
            max_id = max_id.max(a.id);
            self.artifacts.insert(a.id, a);
        }
        self.next_id.store(max_id + 1, Ordering::SeqCst);
    }

    fn insert(
        &self,
        source_reference: Reference,
        consumer: UserId,
        delivery: MessageRef,
        now: DateTime<Utc>,
        redelivery: bool,
    ) -> DeliveryArtifact {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let ttl = chrono::Duration::from_std(self.cfg.ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let artifact = DeliveryArtifact {
            id,
            source_reference,
            consumer,
            delivery,
            notice: None,
            sent_at: now,
            expires_at: now + ttl,
            state: ArtifactState::Issued,
            superseded_by: None,
            redelivery,
            expiry_notified: false,
        };
        self.artifacts.insert(id, artifact.clone());
        artifact
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatId, MessageId};
    use chrono::TimeZone;

    fn workflow() -> DeliveryWorkflow {
        DeliveryWorkflow::new(WorkflowConfig {
            ttl: Duration::from_secs(60),
            rerequest_window: Duration::from_secs(24 * 3600),
        })
    }

    fn t(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn msg(id: i32) -> MessageRef {
        MessageRef {
            chat_id: ChatId(1),
            message_id: MessageId(id),
        }
    }

    #[test]
    fn expiry_is_a_pure_function_of_time() {
        let wf = workflow();
        let a = wf.deliver(Reference(5), UserId(1), msg(10), t(0));

        // Fresh for every call before the deadline, expired at and after it,
        // no matter how often we ask.
        for _ in 0..3 {
            assert_eq!(check_expiry(&a, t(0)), Freshness::Fresh);
            assert_eq!(check_expiry(&a, t(59)), Freshness::Fresh);
            assert_eq!(check_expiry(&a, t(60)), Freshness::Expired);
            assert_eq!(check_expiry(&a, t(61)), Freshness::Expired);
        }
        assert_eq!(wf.get(a.id).unwrap().state, ArtifactState::Issued);
    }

    #[test]
    fn rerequest_requires_expiry_and_is_single_flight() {
        let wf = workflow();
        let a = wf.deliver(Reference(5), UserId(1), msg(10), t(0));

        assert_eq!(
            wf.request_redelivery(a.id, UserId(1), t(30)).unwrap_err(),
            RequestWorkflowError::NotExpired
        );

        let pending = wf.request_redelivery(a.id, UserId(1), t(61)).unwrap();
        assert!(matches!(pending.state, ArtifactState::RequestPending { .. }));

        assert_eq!(
            wf.request_redelivery(a.id, UserId(1), t(62)).unwrap_err(),
            RequestWorkflowError::AlreadyPending
        );
    }

    #[test]
    fn rerequest_by_someone_else_is_a_dead_link() {
        let wf = workflow();
        let a = wf.deliver(Reference(5), UserId(1), msg(10), t(0));
        assert_eq!(
            wf.request_redelivery(a.id, UserId(2), t(61)).unwrap_err(),
            RequestWorkflowError::UnknownArtifact(a.id)
        );
    }

    #[test]
    fn accept_mints_fresh_artifact_with_new_ttl_from_decision_time() {
        let wf = workflow();
        let a = wf.deliver(Reference(5), UserId(1), msg(10), t(0));
        wf.request_redelivery(a.id, UserId(1), t(61)).unwrap();

        let fresh = wf
            .resolve_request(
                a.id,
                RequestDecision::Accept { delivery: msg(20) },
                t(120),
            )
            .unwrap();

        assert_ne!(fresh.id, a.id);
        assert_eq!(fresh.source_reference, Reference(5));
        assert_eq!(fresh.sent_at, t(120));
        assert_eq!(fresh.expires_at, t(180));
        assert!(fresh.redelivery);
        assert_eq!(check_expiry(&fresh, t(121)), Freshness::Fresh);

        let old = wf.get(a.id).unwrap();
        assert_eq!(old.superseded_by, Some(fresh.id));
    }

    #[test]
    fn decline_records_reason_and_allows_a_later_rerequest() {
        let wf = workflow();
        let a = wf.deliver(Reference(5), UserId(1), msg(10), t(0));
        wf.request_redelivery(a.id, UserId(1), t(61)).unwrap();

        let declined = wf
            .resolve_request(
                a.id,
                RequestDecision::Decline {
                    reason: DeclineReason::NotAvailable,
                    note: Some("source offline".to_string()),
                },
                t(70),
            )
            .unwrap();
        assert!(matches!(
            declined.state,
            ArtifactState::Declined {
                reason: DeclineReason::NotAvailable,
                ..
            }
        ));

        // Declines are per-request: a later attempt within the window works.
        let again = wf.request_redelivery(a.id, UserId(1), t(90)).unwrap();
        assert!(matches!(again.state, ArtifactState::RequestPending { .. }));
    }

    #[test]
    fn rerequest_window_eventually_closes() {
        let wf = workflow();
        let a = wf.deliver(Reference(5), UserId(1), msg(10), t(0));

        let past_window = t(60 + 24 * 3600);
        assert_eq!(
            wf.request_redelivery(a.id, UserId(1), past_window)
                .unwrap_err(),
            RequestWorkflowError::WindowClosed
        );
    }

    #[test]
    fn redelivered_copies_expire_for_good() {
        let wf = workflow();
        let a = wf.deliver(Reference(5), UserId(1), msg(10), t(0));
        wf.request_redelivery(a.id, UserId(1), t(61)).unwrap();
        let fresh = wf
            .resolve_request(a.id, RequestDecision::Accept { delivery: msg(20) }, t(70))
            .unwrap();

        assert_eq!(
            wf.request_redelivery(fresh.id, UserId(1), t(200)).unwrap_err(),
            RequestWorkflowError::WindowClosed
        );
    }

    #[test]
    fn resolving_without_a_pending_request_fails() {
        let wf = workflow();
        let a = wf.deliver(Reference(5), UserId(1), msg(10), t(0));
        assert_eq!(
            wf.resolve_request(a.id, RequestDecision::Accept { delivery: msg(20) }, t(10))
                .unwrap_err(),
            RequestWorkflowError::NotPending
        );
    }

    #[test]
    fn sweep_reports_each_expired_artifact_once() {
        let wf = workflow();
        let a = wf.deliver(Reference(5), UserId(1), msg(10), t(0));
        let b = wf.deliver(Reference(6), UserId(2), msg(11), t(30));

        assert!(wf.take_newly_expired(t(10)).is_empty());

        let first = wf.take_newly_expired(t(61));
        assert_eq!(first.iter().map(|x| x.id).collect::<Vec<_>>(), vec![a.id]);

        let second = wf.take_newly_expired(t(200));
        assert_eq!(second.iter().map(|x| x.id).collect::<Vec<_>>(), vec![b.id]);

        assert!(wf.take_newly_expired(t(400)).is_empty());
    }

    #[test]
    fn snapshot_roundtrip_keeps_ids_monotonic() {
        let wf = workflow();
        let a = wf.deliver(Reference(5), UserId(1), msg(10), t(0));
        let b = wf.deliver(Reference(6), UserId(2), msg(11), t(1));

        let restored = workflow();
        restored.restore(wf.snapshot());
        assert_eq!(restored.get(a.id).unwrap(), a);
        assert_eq!(restored.get(b.id).unwrap(), b);

        let c = restored.deliver(Reference(7), UserId(3), msg(12), t(2));
        assert!(c.id > b.id);
    }
}
