use crate::types::{Decision, EventKind, NegotiationEvent, Offer, PartyId, SessionId, SessionStatus};
use serde::Serialize;
use std::collections::BTreeMap;

/// Folded state of one negotiation stream.
///
/// Owned by a single stream controller; subscribers only ever see clones.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct NegotiationSession {
    pub session_id: Option<SessionId>,
    pub status: SessionStatus,
    pub log: Vec<NegotiationEvent>,
    /// Latest offer per offering party.
    pub offers: BTreeMap<PartyId, Offer>,
    pub decision: Option<Decision>,
    /// Message of the event that moved the session to `Errored`.
    pub error: Option<String>,
}

impl NegotiationSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// A session whose request has just been handed to the transport.
    pub fn submitted() -> Self {
        Self {
            status: SessionStatus::Initiated,
            ..Self::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn last_seq(&self) -> u64 {
        match self.log.last() {
            Some(event) => event.seq,
            None => 0,
        }
    }

    pub fn has_cancelled_entry(&self) -> bool {
        self.log.iter().any(NegotiationEvent::is_cancelled)
    }

    /// Folds one event into the session.
    ///
    /// Once the status is terminal, events are still logged but nothing else changes.
    /// A second `Cancelled` event is dropped entirely.
    pub fn apply(&mut self, event: NegotiationEvent) {
        if event.is_cancelled() && self.has_cancelled_entry() {
            tracing::debug!("[SESSION] Ignoring repeated cancellation");
            return;
        }

        if self.is_terminal() {
            tracing::debug!(
                "[SESSION] Late '{}' event #{} after terminal status {}",
                event.kind.name(),
                event.seq,
                self.status
            );
            self.log.push(event);
            return;
        }

        let previous = self.status;
        match &event.kind {
            EventKind::Initiated { session_id, .. } => {
                if self.session_id.is_none() {
                    self.session_id = session_id.clone();
                }
                self.status = SessionStatus::Negotiating;
            }
            EventKind::OfferReceived { offer, .. } => {
                self.offers.insert(offer.party.clone(), offer.clone());
            }
            EventKind::Completed { decision } => {
                self.status = if decision.success {
                    SessionStatus::Completed
                } else {
                    SessionStatus::Failed
                };
                self.decision = Some(decision.clone());
            }
            EventKind::Errored { message, .. } => {
                self.status = SessionStatus::Errored;
                self.error = Some(message.clone());
            }
            EventKind::Cancelled => {
                self.status = SessionStatus::Cancelled;
            }
            // Log-only kinds. Declines keep earlier offers from the same party.
            EventKind::Broadcast { .. }
            | EventKind::AgentEvaluating { .. }
            | EventKind::OfferDeclined { .. }
            | EventKind::RoundStarted { .. }
            | EventKind::OfferAdjusted { .. }
            | EventKind::Deciding
            | EventKind::StreamComplete
            | EventKind::Unknown { .. }
            | EventKind::ParseError { .. } => {}
        }

        if previous != self.status {
            tracing::info!(
                "[SESSION] {} -> {} on '{}' (#{})",
                previous,
                self.status,
                event.kind.name(),
                event.seq
            );
        }
        self.log.push(event);
    }
}

/// Pure form of [`NegotiationSession::apply`].
pub fn reduce(mut state: NegotiationSession, event: NegotiationEvent) -> NegotiationSession {
    state.apply(event);
    state
}

pub fn fold_events<I>(initial: NegotiationSession, events: I) -> NegotiationSession
where
    I: IntoIterator<Item = NegotiationEvent>,
{
    events.into_iter().fold(initial, reduce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Decision;

    fn initiated(seq: u64, id: &str) -> NegotiationEvent {
        NegotiationEvent::new(
            seq,
            "initiated",
            EventKind::Initiated {
                session_id: Some(SessionId::from(id)),
                request: None,
            },
        )
    }

    fn offer(seq: u64, party: &str, qty: u32, price: f64) -> NegotiationEvent {
        NegotiationEvent::new(
            seq,
            "offer",
            EventKind::OfferReceived {
                offer: Offer::new(party, qty, price),
                reasoning: None,
            },
        )
    }

    fn completed(seq: u64, success: bool) -> NegotiationEvent {
        NegotiationEvent::new(
            seq,
            "completed",
            EventKind::Completed {
                decision: Decision {
                    success,
                    selected_offers: vec![],
                    total_cost: 0.0,
                    reason: if success {
                        None
                    } else {
                        Some("No offers received".to_string())
                    },
                    reasoning: None,
                    recommendations: vec![],
                },
            },
        )
    }

    #[test]
    fn test_snapshot_serializes_with_unknown_and_parse_error_entries() {
        let session = fold_events(
            NegotiationSession::submitted(),
            vec![
                initiated(1, "abc123"),
                NegotiationEvent::new(
                    2,
                    "unrecognized",
                    EventKind::Unknown {
                        kind: Some("offer_selected".into()),
                        raw: "{}".into(),
                    },
                ),
                NegotiationEvent::new(
                    3,
                    "bad",
                    EventKind::ParseError {
                        reason: "invalid JSON".into(),
                        raw: "{".into(),
                    },
                ),
                offer(4, "H2", 5, 100.0),
                completed(5, true),
            ],
        );

        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["session_id"], "abc123");
        let kinds: Vec<&str> = value["log"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["kind"].as_str().unwrap())
            .collect();
        assert_eq!(
            kinds,
            vec!["initiated", "unknown", "parse_error", "offer_received", "completed"]
        );
        assert_eq!(value["log"][1]["wire_kind"], "offer_selected");
        assert_eq!(value["offers"]["H2"]["total_cost"], 500.0);
        assert_eq!(value["decision"]["success"], true);
    }

    #[test]
    fn test_initiated_sets_id_once() {
        let session = fold_events(
            NegotiationSession::submitted(),
            vec![initiated(1, "first"), initiated(2, "second")],
        );
        assert_eq!(session.session_id, Some(SessionId::from("first")));
        assert_eq!(session.status, SessionStatus::Negotiating);
        assert_eq!(session.log.len(), 2);
    }

    #[test]
    fn test_offer_upsert_last_write_wins() {
        let session = fold_events(
            NegotiationSession::submitted(),
            vec![
                initiated(1, "s"),
                offer(2, "H2", 5, 100.0),
                offer(3, "H3", 2, 90.0),
                offer(4, "H2", 4, 95.0),
            ],
        );
        assert_eq!(session.offers.len(), 2);
        let h2 = &session.offers[&PartyId::from("H2")];
        assert_eq!(h2.quantity, 4);
        assert_eq!(h2.total_cost, 380.0);
    }

    #[test]
    fn test_decline_keeps_prior_offer() {
        let decline = NegotiationEvent::new(
            3,
            "declined",
            EventKind::OfferDeclined {
                party: PartyId::from("H2"),
                reason: Some("capacity".into()),
            },
        );
        let session = fold_events(
            NegotiationSession::submitted(),
            vec![initiated(1, "s"), offer(2, "H2", 5, 100.0), decline],
        );
        assert!(session.offers.contains_key(&PartyId::from("H2")));
        assert_eq!(session.status, SessionStatus::Negotiating);
    }

    #[test]
    fn test_failed_decision() {
        let session = fold_events(
            NegotiationSession::submitted(),
            vec![initiated(1, "s"), completed(2, false)],
        );
        assert_eq!(session.status, SessionStatus::Failed);
        let decision = session.decision.as_ref().unwrap();
        assert_eq!(decision.reason.as_deref(), Some("No offers received"));
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let session = fold_events(
            NegotiationSession::submitted(),
            vec![
                initiated(1, "s"),
                completed(2, true),
                NegotiationEvent::errored(3, "late failure", None),
                offer(4, "H9", 1, 1.0),
                NegotiationEvent::cancelled(5),
            ],
        );
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.error.is_none());
        assert!(session.offers.is_empty());
        assert_eq!(session.log.len(), 5);
    }

    #[test]
    fn test_errored_from_any_live_status() {
        let session = reduce(
            NegotiationSession::submitted(),
            NegotiationEvent::errored(1, "upstream down", Some(503)),
        );
        assert_eq!(session.status, SessionStatus::Errored);
        assert_eq!(session.error.as_deref(), Some("upstream down"));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let session = fold_events(
            NegotiationSession::submitted(),
            vec![
                initiated(1, "s"),
                NegotiationEvent::cancelled(2),
                NegotiationEvent::cancelled(3),
            ],
        );
        assert_eq!(session.status, SessionStatus::Cancelled);
        assert_eq!(session.log.iter().filter(|e| e.is_cancelled()).count(), 1);
    }

    #[test]
    fn test_unknown_and_parse_errors_are_log_only() {
        let session = fold_events(
            NegotiationSession::submitted(),
            vec![
                NegotiationEvent::new(
                    1,
                    "?",
                    EventKind::Unknown {
                        kind: Some("offer_selected".into()),
                        raw: "{}".into(),
                    },
                ),
                NegotiationEvent::new(
                    2,
                    "!",
                    EventKind::ParseError {
                        reason: "bad".into(),
                        raw: "{".into(),
                    },
                ),
            ],
        );
        assert_eq!(session.status, SessionStatus::Initiated);
        assert_eq!(session.last_seq(), 2);
    }
}
