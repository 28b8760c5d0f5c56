use crate::shortcode::ShortCode;
use serde::{Deserialize, Serialize};

/// A stored short → long mapping together with its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub short: ShortCode,
    pub long: String,
    /// Opaque per-session identifier of the creator.
    pub owner: String,
    /// Soft-delete flag. A deleted link is never resolved to a redirect.
    pub deleted: bool,
}

/// The result of resolving a short code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRecord {
    /// The original URL that was shortened.
    pub original_url: String,
    pub owner: String,
    /// Whether the link has been soft-deleted. Callers must treat this as terminal.
    pub deleted: bool,
}

impl From<Link> for UrlRecord {
    fn from(link: Link) -> Self {
        UrlRecord {
            original_url: link.long,
            owner: link.owner,
            deleted: link.deleted,
        }
    }
}

/// One entry of a batch shortening request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub original_url: String,
    /// Caller-side key echoed back in the matching [`BatchOutcome`].
    pub correlation_id: String,
}

impl BatchEntry {
    pub fn new(original_url: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            original_url: original_url.into(),
            correlation_id: correlation_id.into(),
        }
    }
}

/// The short code assigned to one [`BatchEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub correlation_id: String,
    pub short: ShortCode,
    /// `false` when the long URL was already stored and `short` is the existing code.
    pub created: bool,
}
