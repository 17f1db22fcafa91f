//! The remote message store as seen by the engine.
//!
//! This is the IMAP-shaped surface the engine sequences: SEARCH, FETCH,
//! APPEND, STORE \Deleted, EXPUNGE, LOGOUT. Connection management, login,
//! TLS and protocol framing belong to whoever implements the trait.

use std::future::Future;

use thiserror::Error;

/// Server-assigned message identifier (an IMAP UID).
pub type MessageId = u64;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Operation timed out")]
    Timeout,
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Message of {size} bytes exceeds server limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("No such message: {0}")]
    NoSuchMessage(MessageId),
}

impl TransportError {
    /// Failures worth retrying: the request may succeed if sent again.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::Connection(_))
    }
}

/// Conjunction of header substring terms (IMAP `SEARCH HEADER name value`).
///
/// Messages flagged deleted never match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchCriteria {
    pub headers: Vec<(String, String)>,
}

impl SearchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Whether a message with these headers satisfies every term.
    /// Header names compare case-insensitively, values by substring.
    pub fn matches(&self, headers: &[(String, String)]) -> bool {
        self.headers.iter().all(|(name, needle)| {
            headers
                .iter()
                .any(|(h, v)| h.eq_ignore_ascii_case(name) && contains_ignore_case(v, needle))
        })
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchParts {
    /// Header fields only.
    Headers,
    /// Header fields and body.
    Full,
}

#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub id: MessageId,
    pub headers: Vec<(String, String)>,
    /// Present only for `FetchParts::Full`.
    pub body: Option<Vec<u8>>,
}

impl FetchedMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(h, _)| h.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// One authenticated session against a mail server.
///
/// Every call is a potentially slow network round trip. Implementations must
/// be shareable across tasks; the engine issues chunk appends concurrently.
pub trait MailStore: Send + Sync + 'static {
    fn search(
        &self,
        mailbox: &str,
        criteria: &SearchCriteria,
    ) -> impl Future<Output = Result<Vec<MessageId>, TransportError>> + Send;

    fn fetch(
        &self,
        mailbox: &str,
        id: MessageId,
        parts: FetchParts,
    ) -> impl Future<Output = Result<FetchedMessage, TransportError>> + Send;

    fn append(
        &self,
        mailbox: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> impl Future<Output = Result<MessageId, TransportError>> + Send;

    /// Flag a message `\Deleted`. It stays fetchable until `expunge`.
    fn mark_deleted(
        &self,
        mailbox: &str,
        id: MessageId,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn expunge(&self, mailbox: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn logout(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
