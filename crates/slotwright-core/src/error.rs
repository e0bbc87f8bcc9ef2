use crate::dom::NodeId;

/// Fatal slot definition problems. Surfaced synchronously and never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Placeholder {0:?} has no data-name attribute")]
    MissingName(NodeId),
    #[error("Slot '{slot_id}' has no candidate sizes for any breakpoint")]
    NoSizes { slot_id: String },
}

/// A header-bidding partner call that produced no usable bids.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartnerError {
    #[error("{partner} did not respond within {budget_ms}ms")]
    Timeout { partner: String, budget_ms: u64 },
    #[error("{partner} transport error: {reason}")]
    Transport { partner: String, reason: String },
    #[error("{partner} rejected request: {reason}")]
    InvalidRequest { partner: String, reason: String },
    #[error("{partner} bid request panicked")]
    Panicked { partner: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomError {
    #[error("Node {0:?} not found")]
    NodeNotFound(NodeId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Ad server error: {0}")]
pub struct AdServerError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Line item lookup failed: {0}")]
pub struct LineItemError(pub String);

/// Failure while finalizing a filled slot; the slot degrades to "not rendered".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("Slot '{0}' is not registered")]
    SlotNotFound(String),
    #[error(transparent)]
    Dom(#[from] DomError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("toml parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

/// Sampled diagnostic for an auction that came back empty. Not a failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Empty ad response for slot '{slot_id}'")]
pub struct EmptyResponse {
    pub slot_id: String,
}
