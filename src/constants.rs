/// Prefix every protocol message line carries. The trailing space is optional on the wire.
pub const DATA_PREFIX: &str = "data:";

/// Discriminator field of a message payload
pub const KIND_FIELD: &str = "event";

/// Negotiation service endpoints
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const NEGOTIATE_PATH: &str = "/api/v1/parliament/negotiate";
pub const STATUS_PATH: &str = "/api/v1/autonomous-negotiation/status";

/// Longest line the frame decoder buffers. Longer `data:` lines surface as truncated frames,
/// which classify as parse errors; other long lines are dropped.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// How much of a raw payload or upstream body is kept in summaries and error messages
pub const SNIPPET_CHARS: usize = 200;

/// Chunk size used when replaying a recorded stream
pub const DEFAULT_REPLAY_CHUNK_BYTES: usize = 64;

pub const PREMATURE_END_MESSAGE: &str = "stream ended before a decision was reached";

/// Wire names of the recognized event kinds
pub const KIND_INITIATED: &str = "negotiation_initiated";
pub const KIND_BROADCAST: &str = "broadcasting_request";
pub const KIND_AGENT_ANALYZING: &str = "agent_analyzing";
pub const KIND_OFFER_RECEIVED: &str = "offer_received";
pub const KIND_OFFER_DECLINED: &str = "offer_declined";
pub const KIND_ROUND_STARTED: &str = "negotiation_round_started";
pub const KIND_OFFER_ADJUSTED: &str = "offer_adjusted";
pub const KIND_MAKING_DECISION: &str = "making_decision";
pub const KIND_COMPLETED: &str = "negotiation_completed";
pub const KIND_ERROR: &str = "error";
pub const KIND_STREAM_COMPLETE: &str = "stream_complete";

pub const KNOWN_KINDS: &[&str] = &[
    KIND_INITIATED,
    KIND_BROADCAST,
    KIND_AGENT_ANALYZING,
    KIND_OFFER_RECEIVED,
    KIND_OFFER_DECLINED,
    KIND_ROUND_STARTED,
    KIND_OFFER_ADJUSTED,
    KIND_MAKING_DECISION,
    KIND_COMPLETED,
    KIND_ERROR,
    KIND_STREAM_COMPLETE,
];
