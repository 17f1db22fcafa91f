//! Header tags carried by every stored message.
//!
//! Tags are the only thing the server can search on, so they hold opaque
//! path ids rather than paths. Everything else lives in encrypted bodies.

use thiserror::Error;

use crate::store::transport::{FetchedMessage, SearchCriteria};

pub const HEADER_KIND: &str = "X-Mailfs-Kind";
pub const HEADER_PATH: &str = "X-Mailfs-Path";
pub const HEADER_ANCESTORS: &str = "X-Mailfs-Ancestors";
pub const HEADER_GENERATION: &str = "X-Mailfs-Generation";
pub const HEADER_CHUNK_INDEX: &str = "X-Mailfs-Chunk-Index";
pub const HEADER_CHUNK_COUNT: &str = "X-Mailfs-Chunk-Count";
pub const HEADER_SALT: &str = "X-Mailfs-Salt";
pub const HEADER_SUBJECT: &str = "Subject";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Manifest,
    Chunk,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Manifest => "manifest",
            MessageKind::Chunk => "chunk",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "manifest" => Some(MessageKind::Manifest),
            "chunk" => Some(MessageKind::Chunk),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TagError {
    #[error("Missing header {0}")]
    Missing(&'static str),
    #[error("Malformed header {0}: {1:?}")]
    Malformed(&'static str, String),
}

/// Parsed tag set of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTags {
    pub kind: MessageKind,
    pub path_id: String,
    /// Ids of every ancestor directory, root first. Empty for the root.
    pub ancestors: Vec<String>,
    pub generation: u64,
    /// Set on chunk messages only.
    pub chunk_index: Option<u32>,
    pub chunk_count: u32,
    pub salt: String,
}

impl MessageTags {
    pub fn to_headers(&self) -> Vec<(String, String)> {
        let subject = match self.chunk_index {
            Some(index) => format!(
                "mailfs chunk {}/{} gen {}",
                index + 1,
                self.chunk_count,
                self.generation
            ),
            None => format!("mailfs manifest gen {}", self.generation),
        };

        let mut headers = vec![
            (HEADER_SUBJECT.to_string(), subject),
            (HEADER_KIND.to_string(), self.kind.as_str().to_string()),
            (HEADER_PATH.to_string(), self.path_id.clone()),
            (HEADER_ANCESTORS.to_string(), self.ancestors.join(" ")),
            (HEADER_GENERATION.to_string(), self.generation.to_string()),
            (HEADER_CHUNK_COUNT.to_string(), self.chunk_count.to_string()),
            (HEADER_SALT.to_string(), self.salt.clone()),
        ];
        if let Some(index) = self.chunk_index {
            headers.push((HEADER_CHUNK_INDEX.to_string(), index.to_string()));
        }
        headers
    }

    pub fn from_message(message: &FetchedMessage) -> Result<Self, TagError> {
        let get = |name: &'static str| message.header(name).ok_or(TagError::Missing(name));
        let number = |name: &'static str| -> Result<u64, TagError> {
            let raw = get(name)?;
            raw.trim()
                .parse::<u64>()
                .map_err(|_| TagError::Malformed(name, raw.to_string()))
        };
        let index = |name: &'static str| -> Result<u32, TagError> {
            let raw = get(name)?;
            raw.trim()
                .parse::<u32>()
                .map_err(|_| TagError::Malformed(name, raw.to_string()))
        };

        let raw_kind = get(HEADER_KIND)?;
        let kind = MessageKind::parse(raw_kind)
            .ok_or_else(|| TagError::Malformed(HEADER_KIND, raw_kind.to_string()))?;

        let chunk_index = match kind {
            MessageKind::Chunk => Some(index(HEADER_CHUNK_INDEX)?),
            MessageKind::Manifest => None,
        };

        Ok(Self {
            kind,
            path_id: get(HEADER_PATH)?.trim().to_string(),
            ancestors: message
                .header(HEADER_ANCESTORS)
                .unwrap_or_default()
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            generation: number(HEADER_GENERATION)?,
            chunk_index,
            chunk_count: index(HEADER_CHUNK_COUNT)?,
            salt: get(HEADER_SALT)?.trim().to_string(),
        })
    }
}

// Search builders. Path ids all have the same length, so a substring match on
// one id is an exact match. Generation terms are substrings too ("1" matches
// "10"); callers re-check generations after fetching headers.

/// Every message of one kind in the mailbox.
pub fn all_of_kind(kind: MessageKind) -> SearchCriteria {
    SearchCriteria::new().header(HEADER_KIND, kind.as_str())
}

/// Manifests for exactly this path.
pub fn manifests_for(path_id: &str) -> SearchCriteria {
    all_of_kind(MessageKind::Manifest).header(HEADER_PATH, path_id)
}

/// Manifests anywhere below the directory with this id.
pub fn manifests_under(dir_id: &str) -> SearchCriteria {
    all_of_kind(MessageKind::Manifest).header(HEADER_ANCESTORS, dir_id)
}

/// Every message tagged with this path, manifests and chunks alike.
pub fn all_for(path_id: &str) -> SearchCriteria {
    SearchCriteria::new().header(HEADER_PATH, path_id)
}

/// Candidate chunk messages for one slot of one commit.
pub fn chunk_at(path_id: &str, generation: u64, salt: &str, index: u32) -> SearchCriteria {
    all_of_kind(MessageKind::Chunk)
        .header(HEADER_PATH, path_id)
        .header(HEADER_GENERATION, generation.to_string())
        .header(HEADER_SALT, salt)
        .header(HEADER_CHUNK_INDEX, index.to_string())
}
