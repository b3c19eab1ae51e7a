use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub String);

/// Identifier of an offering (or declining) party, as named on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartyId(pub String);

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PartyId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PartyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl SessionId {
    pub fn short(&self) -> &str {
        prefix_chars(&self.0, 8)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns a prefix of the string with at most `max_chars` characters,
/// respecting UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

pub(crate) fn snippet(s: &str) -> String {
    let head = prefix_chars(s, crate::constants::SNIPPET_CHARS);
    if head.len() < s.len() {
        format!("{}...", head)
    } else {
        s.to_string()
    }
}

#[derive(Error, Debug)]
pub enum ParleyError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid negotiation request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(reqwest::StatusCode, String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: ParleyError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ParleyError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

/// --- REQUEST ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Critical,
    High,
    Medium,
    Low,
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// The payload POSTed to the negotiation endpoint. Never mutated after submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NegotiationRequest {
    #[serde(rename = "initiator_hospital_id", alias = "initiator")]
    pub initiator: String,
    pub resource_type: String,
    pub quantity: u32,
    pub urgency: Urgency,
    pub duration_days: u32,
    pub max_budget: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_details: Option<serde_json::Value>,
}

impl Default for NegotiationRequest {
    fn default() -> Self {
        Self {
            initiator: "HOSP_A".to_string(),
            resource_type: "ventilators".to_string(),
            quantity: 5,
            urgency: Urgency::High,
            duration_days: 7,
            max_budget: 500_000.0,
            additional_details: None,
        }
    }
}

impl NegotiationRequest {
    pub fn validate(&self) -> Result<()> {
        if self.initiator.trim().is_empty() {
            return Err(ParleyError::InvalidRequest("initiator must not be empty".into()).into());
        }
        if self.resource_type.trim().is_empty() {
            return Err(
                ParleyError::InvalidRequest("resource type must not be empty".into()).into(),
            );
        }
        if self.quantity == 0 {
            return Err(ParleyError::InvalidRequest("quantity must be positive".into()).into());
        }
        if self.duration_days == 0 {
            return Err(
                ParleyError::InvalidRequest("duration must be at least one day".into()).into(),
            );
        }
        if !(self.max_budget.is_finite() && self.max_budget > 0.0) {
            return Err(ParleyError::InvalidRequest(format!(
                "budget ceiling must be positive, got {}",
                self.max_budget
            ))
            .into());
        }
        if let Some(details) = &self.additional_details {
            if !details.is_object() {
                return Err(ParleyError::InvalidRequest(
                    "additional details must be a JSON object".into(),
                )
                .into());
            }
        }
        Ok(())
    }
}

/// --- OFFERS & DECISIONS ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Offer {
    pub party: PartyId,
    pub quantity: u32,
    pub price_per_unit: f64,
    pub total_cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,
}

impl Offer {
    pub fn new(party: impl Into<PartyId>, quantity: u32, price_per_unit: f64) -> Self {
        Self {
            party: party.into(),
            quantity,
            price_per_unit,
            total_cost: f64::from(quantity) * price_per_unit,
            offer_id: None,
            conditions: Vec::new(),
        }
    }

    /// Builds an offer from a quoted total, as carried by a decision's selected offers.
    pub fn from_total(party: impl Into<PartyId>, quantity: u32, total_cost: f64) -> Self {
        let price_per_unit = if quantity == 0 {
            0.0
        } else {
            total_cost / f64::from(quantity)
        };
        Self {
            party: party.into(),
            quantity,
            price_per_unit,
            total_cost,
            offer_id: None,
            conditions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub success: bool,
    pub selected_offers: Vec<Offer>,
    pub total_cost: f64,
    /// Set on failure; falls back to the decision's reasoning when no explicit reason is given.
    pub reason: Option<String>,
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<String>,
}

/// --- SESSION STATUS ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Initiated,
    Negotiating,
    Completed,
    Failed,
    Cancelled,
    Errored,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Errored
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Initiated => "initiated",
            Self::Negotiating => "negotiating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Errored => "errored",
        };
        write!(f, "{}", s)
    }
}

/// --- EVENTS ---

/// One classified protocol message, or an event synthesized by the stream controller.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NegotiationEvent {
    /// Arrival order within the session, starting at 1.
    pub seq: u64,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<chrono::NaiveDateTime>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Initiated {
        session_id: Option<SessionId>,
        request: Option<serde_json::Value>,
    },
    Broadcast {
        participants: Vec<String>,
    },
    AgentEvaluating {
        party: PartyId,
    },
    OfferReceived {
        offer: Offer,
        reasoning: Option<String>,
    },
    OfferDeclined {
        party: PartyId,
        reason: Option<String>,
    },
    RoundStarted {
        offers_count: Option<u32>,
    },
    OfferAdjusted {
        party: PartyId,
        adjustment: serde_json::Value,
    },
    Deciding,
    Completed {
        decision: Decision,
    },
    Errored {
        message: String,
        error_type: Option<String>,
        status: Option<u16>,
    },
    StreamComplete,
    Cancelled,
    Unknown {
        /// Discriminator as sent by the service, if any.
        #[serde(rename = "wire_kind")]
        kind: Option<String>,
        raw: String,
    },
    ParseError {
        reason: String,
        raw: String,
    },
}

impl EventKind {
    /// Stable name of the variant, used in logs and rendered output.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initiated { .. } => "initiated",
            Self::Broadcast { .. } => "broadcast",
            Self::AgentEvaluating { .. } => "agent_evaluating",
            Self::OfferReceived { .. } => "offer_received",
            Self::OfferDeclined { .. } => "offer_declined",
            Self::RoundStarted { .. } => "round_started",
            Self::OfferAdjusted { .. } => "offer_adjusted",
            Self::Deciding => "deciding",
            Self::Completed { .. } => "completed",
            Self::Errored { .. } => "errored",
            Self::StreamComplete => "stream_complete",
            Self::Cancelled => "cancelled",
            Self::Unknown { .. } => "unknown",
            Self::ParseError { .. } => "parse_error",
        }
    }
}

impl NegotiationEvent {
    pub fn new(seq: u64, summary: impl Into<String>, kind: EventKind) -> Self {
        Self {
            seq,
            summary: summary.into(),
            timestamp: None,
            kind,
        }
    }

    pub fn cancelled(seq: u64) -> Self {
        Self::new(seq, "Negotiation cancelled by user", EventKind::Cancelled)
    }

    pub fn errored(seq: u64, message: impl Into<String>, status: Option<u16>) -> Self {
        let message = message.into();
        let summary = match status {
            Some(code) => format!("Negotiation service returned status {}: {}", code, message),
            None => format!("Negotiation error: {}", message),
        };
        Self::new(
            seq,
            summary,
            EventKind::Errored {
                message,
                error_type: None,
                status,
            },
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, EventKind::Cancelled)
    }
}

/// --- SERVICE STATUS ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceStatus {
    pub status: String,
    #[serde(default)]
    pub total_agents: Option<u32>,
    #[serde(default)]
    pub active_sessions: Option<u32>,
    #[serde(default)]
    pub agents: Vec<String>,
    #[serde(default)]
    pub message: Option<String>,
}
