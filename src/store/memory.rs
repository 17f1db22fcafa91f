//! In-memory mailbox implementing `MailStore`.
//!
//! Behaves like a single IMAP account with a lagging search index: appended
//! messages are fetchable at once but only become searchable after the
//! configured lag. Used by the test suite and by scratch mounts.
//!
//! Test hooks: failure injection, append counters by header value, body
//! tampering, and a per-message size limit.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::transport::{
    FetchParts, FetchedMessage, MailStore, MessageId, SearchCriteria, TransportError,
};

/// Default per-message size limit (25 MiB, a common provider cap).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 25 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Search,
    Fetch,
    Append,
    MarkDeleted,
    Expunge,
    Logout,
}

struct StoredMessage {
    mailbox: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    deleted: bool,
    appended_at: Instant,
}

impl StoredMessage {
    fn size(&self) -> usize {
        self.headers
            .iter()
            .map(|(h, v)| h.len() + v.len() + 4)
            .sum::<usize>()
            + self.body.len()
    }
}

/// Failure rule matched against appends by header value.
struct AppendFault {
    header: String,
    value: String,
    error: TransportError,
}

struct MailboxState {
    messages: BTreeMap<MessageId, StoredMessage>,
    next_id: MessageId,
    search_lag: Duration,
    max_message_size: usize,
    logged_out: bool,
    /// Errors returned by the next calls of a given operation, in order.
    scheduled: VecDeque<(Operation, TransportError)>,
    append_faults: Vec<AppendFault>,
    /// Every successful append's headers, in order.
    append_log: Vec<Vec<(String, String)>>,
}

pub struct MemoryMailbox {
    state: Mutex<MailboxState>,
}

impl Default for MemoryMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MailboxState {
                messages: BTreeMap::new(),
                next_id: 1,
                search_lag: Duration::ZERO,
                max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
                logged_out: false,
                scheduled: VecDeque::new(),
                append_faults: Vec::new(),
                append_log: Vec::new(),
            }),
        }
    }

    pub fn with_search_lag(self, lag: Duration) -> Self {
        self.lock().search_lag = lag;
        self
    }

    pub fn with_max_message_size(self, limit: usize) -> Self {
        self.lock().max_message_size = limit;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MailboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_search_lag(&self, lag: Duration) {
        self.lock().search_lag = lag;
    }

    /// Make the next call of `op` fail with `error`. Calls queue up in order.
    pub fn fail_next(&self, op: Operation, error: TransportError) {
        self.lock().scheduled.push_back((op, error));
    }

    /// Fail every append carrying `header: value` until `clear_faults`.
    pub fn fail_appends_with(&self, header: &str, value: &str, error: TransportError) {
        self.lock().append_faults.push(AppendFault {
            header: header.to_string(),
            value: value.to_string(),
            error,
        });
    }

    pub fn clear_faults(&self) {
        let mut state = self.lock();
        state.scheduled.clear();
        state.append_faults.clear();
    }

    /// Successful appends whose `header` equals `value`.
    pub fn appends_with(&self, header: &str, value: &str) -> usize {
        self.lock()
            .append_log
            .iter()
            .filter(|headers| {
                headers
                    .iter()
                    .any(|(h, v)| h.eq_ignore_ascii_case(header) && v == value)
            })
            .count()
    }

    pub fn append_count(&self) -> usize {
        self.lock().append_log.len()
    }

    /// Messages not flagged deleted whose `header` equals `value`.
    pub fn live_with(&self, header: &str, value: &str) -> Vec<MessageId> {
        self.lock()
            .messages
            .iter()
            .filter(|(_, m)| {
                !m.deleted
                    && m.headers
                        .iter()
                        .any(|(h, v)| h.eq_ignore_ascii_case(header) && v == value)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.lock().messages.values().filter(|m| !m.deleted).count()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.lock()
            .messages
            .get(&id)
            .map(|m| !m.deleted)
            .unwrap_or(false)
    }

    /// Rewrite a stored body in place, as a hostile server could.
    pub fn tamper_body(&self, id: MessageId, edit: impl FnOnce(&mut Vec<u8>)) -> bool {
        match self.lock().messages.get_mut(&id) {
            Some(message) => {
                edit(&mut message.body);
                true
            }
            None => false,
        }
    }

    fn check(&self, state: &mut MailboxState, op: Operation) -> Result<(), TransportError> {
        if state.logged_out {
            return Err(TransportError::Auth("session logged out".to_string()));
        }
        if let Some(pos) = state.scheduled.iter().position(|(o, _)| *o == op) {
            if let Some((_, error)) = state.scheduled.remove(pos) {
                return Err(error);
            }
        }
        Ok(())
    }
}

impl MailStore for MemoryMailbox {
    async fn search(
        &self,
        mailbox: &str,
        criteria: &SearchCriteria,
    ) -> Result<Vec<MessageId>, TransportError> {
        let mut state = self.lock();
        self.check(&mut state, Operation::Search)?;
        let lag = state.search_lag;
        Ok(state
            .messages
            .iter()
            .filter(|(_, m)| {
                m.mailbox == mailbox
                    && !m.deleted
                    && m.appended_at.elapsed() >= lag
                    && criteria.matches(&m.headers)
            })
            .map(|(id, _)| *id)
            .collect())
    }

    async fn fetch(
        &self,
        mailbox: &str,
        id: MessageId,
        parts: FetchParts,
    ) -> Result<FetchedMessage, TransportError> {
        let mut state = self.lock();
        self.check(&mut state, Operation::Fetch)?;
        let message = state
            .messages
            .get(&id)
            .filter(|m| m.mailbox == mailbox)
            .ok_or(TransportError::NoSuchMessage(id))?;
        Ok(FetchedMessage {
            id,
            headers: message.headers.clone(),
            body: match parts {
                FetchParts::Headers => None,
                FetchParts::Full => Some(message.body.clone()),
            },
        })
    }

    async fn append(
        &self,
        mailbox: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<MessageId, TransportError> {
        let mut state = self.lock();
        self.check(&mut state, Operation::Append)?;

        if let Some(fault) = state.append_faults.iter().find(|f| {
            headers
                .iter()
                .any(|(h, v)| h.eq_ignore_ascii_case(&f.header) && *v == f.value)
        }) {
            return Err(fault.error.clone());
        }

        let message = StoredMessage {
            mailbox: mailbox.to_string(),
            headers: headers.to_vec(),
            body: body.to_vec(),
            deleted: false,
            appended_at: Instant::now(),
        };
        let size = message.size();
        if size > state.max_message_size {
            return Err(TransportError::TooLarge {
                size,
                limit: state.max_message_size,
            });
        }

        let id = state.next_id;
        state.next_id += 1;
        state.append_log.push(headers.to_vec());
        state.messages.insert(id, message);
        Ok(id)
    }

    async fn mark_deleted(&self, mailbox: &str, id: MessageId) -> Result<(), TransportError> {
        let mut state = self.lock();
        self.check(&mut state, Operation::MarkDeleted)?;
        match state.messages.get_mut(&id) {
            Some(message) if message.mailbox == mailbox => {
                message.deleted = true;
                Ok(())
            }
            _ => Err(TransportError::NoSuchMessage(id)),
        }
    }

    async fn expunge(&self, mailbox: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        self.check(&mut state, Operation::Expunge)?;
        state
            .messages
            .retain(|_, m| !(m.deleted && m.mailbox == mailbox));
        Ok(())
    }

    async fn logout(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if let Some(pos) = state.scheduled.iter().position(|(o, _)| *o == Operation::Logout) {
            if let Some((_, error)) = state.scheduled.remove(pos) {
                return Err(error);
            }
        }
        state.logged_out = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(value: &str) -> Vec<(String, String)> {
        vec![("X-Test".to_string(), value.to_string())]
    }

    #[tokio::test]
    async fn test_append_fetch_search() {
        let mb = MemoryMailbox::new();
        let id = mb.append("INBOX", &tag("a"), b"body").await.unwrap();
        let fetched = mb.fetch("INBOX", id, FetchParts::Full).await.unwrap();
        assert_eq!(fetched.body.as_deref(), Some(&b"body"[..]));
        assert_eq!(fetched.header("x-test"), Some("a"));

        let hits = mb
            .search("INBOX", &SearchCriteria::new().header("X-Test", "a"))
            .await
            .unwrap();
        assert_eq!(hits, vec![id]);
        assert!(mb.search("Other", &SearchCriteria::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_lag_hides_new_messages() {
        let mb = MemoryMailbox::new().with_search_lag(Duration::from_secs(3600));
        let id = mb.append("INBOX", &tag("a"), b"x").await.unwrap();
        assert!(mb.search("INBOX", &SearchCriteria::new()).await.unwrap().is_empty());
        assert!(mb.fetch("INBOX", id, FetchParts::Headers).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_and_expunge() {
        let mb = MemoryMailbox::new();
        let id = mb.append("INBOX", &tag("a"), b"x").await.unwrap();
        mb.mark_deleted("INBOX", id).await.unwrap();
        assert!(mb.search("INBOX", &SearchCriteria::new()).await.unwrap().is_empty());
        assert!(mb.fetch("INBOX", id, FetchParts::Headers).await.is_ok());
        mb.expunge("INBOX").await.unwrap();
        assert_eq!(
            mb.fetch("INBOX", id, FetchParts::Headers).await.unwrap_err(),
            TransportError::NoSuchMessage(id)
        );
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let mb = MemoryMailbox::new();
        mb.fail_next(Operation::Append, TransportError::Timeout);
        assert_eq!(
            mb.append("INBOX", &tag("a"), b"x").await.unwrap_err(),
            TransportError::Timeout
        );
        assert!(mb.append("INBOX", &tag("a"), b"x").await.is_ok());

        mb.fail_appends_with("X-Test", "b", TransportError::Connection("drop".into()));
        assert!(mb.append("INBOX", &tag("b"), b"x").await.is_err());
        assert!(mb.append("INBOX", &tag("a"), b"x").await.is_ok());
        assert_eq!(mb.appends_with("X-Test", "a"), 2);
        assert_eq!(mb.appends_with("X-Test", "b"), 0);
    }

    #[tokio::test]
    async fn test_size_limit_and_logout() {
        let mb = MemoryMailbox::new().with_max_message_size(64);
        assert!(matches!(
            mb.append("INBOX", &tag("a"), &[0u8; 100]).await,
            Err(TransportError::TooLarge { .. })
        ));
        mb.logout().await.unwrap();
        assert!(matches!(
            mb.search("INBOX", &SearchCriteria::new()).await,
            Err(TransportError::Auth(_))
        ));
    }
}
