use crate::constants::{KIND_FIELD, KNOWN_KINDS, MAX_FRAME_BYTES};
use crate::decoder::Frame;
use crate::types::{snippet, Decision, EventKind, NegotiationEvent, Offer, PartyId, SessionId};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// --- WIRE TYPES ---

#[derive(Deserialize, Debug)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WireEvent {
    NegotiationInitiated {
        session_id: Option<String>,
        request: Option<Value>,
    },
    BroadcastingRequest {
        #[serde(default)]
        participants: Vec<String>,
    },
    AgentAnalyzing {
        agent: String,
    },
    OfferReceived {
        agent: Option<String>,
        offer: WireOffer,
        reasoning: Option<String>,
    },
    OfferDeclined {
        agent: String,
        reason: Option<String>,
    },
    NegotiationRoundStarted {
        offers_count: Option<u32>,
    },
    OfferAdjusted {
        agent: String,
        #[serde(default)]
        adjustment: Value,
    },
    MakingDecision {},
    NegotiationCompleted {
        decision: WireDecision,
    },
    Error {
        message: Option<String>,
        #[serde(rename = "type")]
        error_type: Option<String>,
    },
    StreamComplete {},
}

#[derive(Deserialize, Debug)]
struct WireOffer {
    #[serde(deserialize_with = "whole_quantity")]
    quantity: u32,
    price_per_unit: f64,
    hospital_name: Option<String>,
    offer_id: Option<String>,
    #[serde(default)]
    conditions: Vec<String>,
}

#[derive(Deserialize, Debug)]
struct WireDecision {
    success: bool,
    #[serde(default)]
    selected_offers: Vec<WireSelectedOffer>,
    #[serde(default)]
    total_cost: f64,
    reason: Option<String>,
    reasoning: Option<String>,
    #[serde(default)]
    recommendations: Vec<String>,
}

#[derive(Deserialize, Debug)]
struct WireSelectedOffer {
    hospital: String,
    #[serde(deserialize_with = "whole_quantity")]
    quantity: u32,
    total_cost: f64,
}

/// Quantities come from model-generated JSON and may be written as `5.0`.
fn whole_quantity<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let n = f64::deserialize(deserializer)?;
    if n.is_finite() && n >= 0.0 && n.fract() == 0.0 && n <= f64::from(u32::MAX) {
        Ok(n as u32)
    } else {
        Err(D::Error::custom(format!(
            "quantity must be a whole non-negative number, got {}",
            n
        )))
    }
}

impl From<WireDecision> for Decision {
    fn from(wire: WireDecision) -> Self {
        let reason = if wire.success {
            wire.reason
        } else {
            wire.reason.or_else(|| wire.reasoning.clone())
        };
        Self {
            success: wire.success,
            selected_offers: wire
                .selected_offers
                .into_iter()
                .map(|s| Offer::from_total(s.hospital, s.quantity, s.total_cost))
                .collect(),
            total_cost: wire.total_cost,
            reason,
            reasoning: wire.reasoning,
            recommendations: wire.recommendations,
        }
    }
}

/// Classifies a decoded frame. A frame cut short by the decoder limit is a parse error.
pub fn classify_frame(frame: &Frame, seq: u64) -> NegotiationEvent {
    if frame.truncated {
        return parse_error(
            seq,
            format!("message exceeds {} bytes", MAX_FRAME_BYTES),
            &frame.payload,
        );
    }
    classify(&frame.payload, seq)
}

/// Classifies one frame payload. Never fails: malformed payloads become `ParseError`,
/// payloads without a recognized kind become `Unknown`.
pub fn classify(payload: &str, seq: u64) -> NegotiationEvent {
    if payload.len() > MAX_FRAME_BYTES {
        return parse_error(
            seq,
            format!("payload too large: {} bytes", payload.len()),
            payload,
        );
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => return parse_error(seq, format!("invalid JSON: {}", e), payload),
    };

    let kind = value.get(KIND_FIELD).and_then(|k| k.as_str()).map(str::to_string);
    let is_known = match &kind {
        Some(k) => KNOWN_KINDS.contains(&k.as_str()),
        None => false,
    };
    if !value.is_object() || !is_known {
        tracing::debug!("[CLASSIFY] Unknown payload kind {:?}", kind);
        let summary = match &kind {
            Some(k) => format!("Unrecognized event '{}'", k),
            None => "Unrecognized message".to_string(),
        };
        return NegotiationEvent::new(
            seq,
            summary,
            EventKind::Unknown {
                kind,
                raw: payload.to_string(),
            },
        );
    }

    let timestamp = value
        .get("timestamp")
        .and_then(|t| t.as_str())
        .and_then(|t| t.parse::<chrono::NaiveDateTime>().ok());
    let message = value
        .get("message")
        .and_then(|m| m.as_str())
        .filter(|m| !m.is_empty())
        .map(str::to_string);

    let wire = match serde_json::from_value::<WireEvent>(value) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(
                "[CLASSIFY] Malformed '{}' payload: {}",
                kind.as_deref().unwrap_or_default(),
                e
            );
            return parse_error(seq, format!("malformed payload: {}", e), payload);
        }
    };

    let kind = match into_event_kind(wire) {
        Ok(k) => k,
        Err(reason) => return parse_error(seq, reason, payload),
    };
    let summary = match message {
        Some(m) => m,
        None => describe(&kind),
    };

    NegotiationEvent {
        seq,
        summary,
        timestamp,
        kind,
    }
}

fn into_event_kind(wire: WireEvent) -> std::result::Result<EventKind, String> {
    let kind = match wire {
        WireEvent::NegotiationInitiated {
            session_id,
            request,
        } => EventKind::Initiated {
            session_id: session_id.filter(|s| !s.is_empty()).map(SessionId::from),
            request,
        },
        WireEvent::BroadcastingRequest { participants } => EventKind::Broadcast { participants },
        WireEvent::AgentAnalyzing { agent } => EventKind::AgentEvaluating {
            party: PartyId::from(agent),
        },
        WireEvent::OfferReceived {
            agent,
            offer,
            reasoning,
        } => {
            let party = match agent.or(offer.hospital_name) {
                Some(p) if !p.is_empty() => p,
                _ => return Err("offer_received without an offering party".to_string()),
            };
            if !offer.price_per_unit.is_finite() || offer.price_per_unit < 0.0 {
                return Err(format!(
                    "offer_received with invalid price {}",
                    offer.price_per_unit
                ));
            }
            let mut parsed = Offer::new(party, offer.quantity, offer.price_per_unit);
            parsed.offer_id = offer.offer_id;
            parsed.conditions = offer.conditions;
            EventKind::OfferReceived {
                offer: parsed,
                reasoning,
            }
        }
        WireEvent::OfferDeclined { agent, reason } => EventKind::OfferDeclined {
            party: PartyId::from(agent),
            reason,
        },
        WireEvent::NegotiationRoundStarted { offers_count } => {
            EventKind::RoundStarted { offers_count }
        }
        WireEvent::OfferAdjusted { agent, adjustment } => EventKind::OfferAdjusted {
            party: PartyId::from(agent),
            adjustment,
        },
        WireEvent::MakingDecision {} => EventKind::Deciding,
        WireEvent::NegotiationCompleted { decision } => EventKind::Completed {
            decision: decision.into(),
        },
        WireEvent::Error {
            message,
            error_type,
        } => EventKind::Errored {
            message: message.unwrap_or_else(|| "unspecified error".to_string()),
            error_type,
            status: None,
        },
        WireEvent::StreamComplete {} => EventKind::StreamComplete,
    };
    Ok(kind)
}

fn parse_error(seq: u64, reason: String, raw: &str) -> NegotiationEvent {
    NegotiationEvent::new(
        seq,
        format!("Could not parse message: {}", reason),
        EventKind::ParseError {
            reason,
            raw: snippet(raw),
        },
    )
}

fn describe(kind: &EventKind) -> String {
    match kind {
        EventKind::Initiated { session_id, .. } => match session_id {
            Some(id) => format!("Negotiation {} initiated", id.short()),
            None => "Negotiation initiated".to_string(),
        },
        EventKind::Broadcast { participants } => {
            if participants.is_empty() {
                "Broadcasting request".to_string()
            } else {
                format!("Broadcasting request to {}", participants.join(", "))
            }
        }
        EventKind::AgentEvaluating { party } => format!("{} is analyzing the request", party),
        EventKind::OfferReceived { offer, .. } => format!(
            "Offer from {}: {} units at {:.2} each ({:.2} total)",
            offer.party, offer.quantity, offer.price_per_unit, offer.total_cost
        ),
        EventKind::OfferDeclined { party, reason } => match reason {
            Some(r) => format!("{} declined: {}", party, r),
            None => format!("{} declined", party),
        },
        EventKind::RoundStarted { offers_count } => match offers_count {
            Some(n) => format!("Negotiation round started with {} offers", n),
            None => "Negotiation round started".to_string(),
        },
        EventKind::OfferAdjusted { party, .. } => format!("{} adjusted its offer", party),
        EventKind::Deciding => "Making decision".to_string(),
        EventKind::Completed { decision } => {
            if decision.success {
                format!(
                    "Negotiation completed: {} offer(s) selected, {:.2} total",
                    decision.selected_offers.len(),
                    decision.total_cost
                )
            } else {
                format!(
                    "Negotiation failed: {}",
                    decision.reason.as_deref().unwrap_or("no reason given")
                )
            }
        }
        EventKind::Errored { message, .. } => format!("Negotiation error: {}", message),
        EventKind::StreamComplete => "Stream complete".to_string(),
        EventKind::Cancelled => "Negotiation cancelled by user".to_string(),
        EventKind::Unknown { .. } => "Unrecognized message".to_string(),
        EventKind::ParseError { reason, .. } => format!("Could not parse message: {}", reason),
    }
}
