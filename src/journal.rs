//! Request journal.
//!
//! Every request received by the server is appended here, matched or not.
//! Verification queries only read from it.

use crate::matcher::CompiledPattern;
use crate::registry::MappingId;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::Mutex;

/// A request as received by the stub server.
#[derive(Debug, Clone, Serialize)]
pub struct LoggedRequest {
    /// Position in the journal (assigned on record)
    pub id: u64,
    pub method: String,
    /// Path plus query string, as sent
    pub url: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub headers: HashMap<String, String>,
    #[serde(serialize_with = "serialize_body")]
    pub body: Vec<u8>,
    pub received_at: DateTime<Utc>,
    /// Mapping that served the request, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_stub: Option<MappingId>,
}

fn serialize_body<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(body))
}

impl LoggedRequest {
    /// Capture a request at receipt time.
    pub fn new(
        method: &str,
        url: &str,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Self {
        let (path, query) = match url.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (url.to_string(), None),
        };
        Self {
            id: 0,
            method: method.to_ascii_uppercase(),
            url: url.to_string(),
            path,
            query,
            headers,
            body,
            received_at: Utc::now(),
            matched_stub: None,
        }
    }

    /// Look up a header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Body as UTF-8, when it is valid text.
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// One-line description used in diagnostics.
    pub fn summary(&self) -> String {
        let mut headers: Vec<_> = self
            .headers
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect();
        headers.sort();
        if headers.is_empty() {
            format!("{} {}", self.method, self.url)
        } else {
            format!("{} {} [{}]", self.method, self.url, headers.join(", "))
        }
    }
}

/// Expected number of journal entries in a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountMatcher {
    Exactly(usize),
    AtLeast(usize),
    AtMost(usize),
}

impl CountMatcher {
    pub fn matches(&self, actual: usize) -> bool {
        match *self {
            CountMatcher::Exactly(n) => actual == n,
            CountMatcher::AtLeast(n) => actual >= n,
            CountMatcher::AtMost(n) => actual <= n,
        }
    }
}

impl Default for CountMatcher {
    fn default() -> Self {
        CountMatcher::AtLeast(1)
    }
}

impl fmt::Display for CountMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CountMatcher::Exactly(n) => write!(f, "exactly {}", n),
            CountMatcher::AtLeast(n) => write!(f, "at least {}", n),
            CountMatcher::AtMost(n) => write!(f, "at most {}", n),
        }
    }
}

#[derive(Default)]
struct JournalInner {
    entries: Vec<LoggedRequest>,
    next_id: u64,
}

/// Append-only, mutex-guarded request log.
#[derive(Default)]
pub struct RequestJournal {
    inner: Mutex<JournalInner>,
}

impl RequestJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request, returning its journal id.
    pub async fn record(&self, mut request: LoggedRequest) -> u64 {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        request.id = inner.next_id;
        inner.entries.push(request);
        inner.next_id
    }

    /// Snapshot of all entries in arrival order.
    pub async fn entries(&self) -> Vec<LoggedRequest> {
        self.inner.lock().await.entries.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Entries matching a compiled pattern.
    pub(crate) async fn find(&self, pattern: &CompiledPattern) -> Vec<LoggedRequest> {
        self.inner
            .lock()
            .await
            .entries
            .iter()
            .filter(|r| pattern.matches(r))
            .cloned()
            .collect()
    }

    /// Entries no mapping answered.
    pub async fn unmatched(&self) -> Vec<LoggedRequest> {
        self.inner
            .lock()
            .await
            .entries
            .iter()
            .filter(|r| r.matched_stub.is_none())
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.inner.lock().await.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_split() {
        let request = LoggedRequest::new("get", "/api/users?page=2", HashMap::new(), Vec::new());
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/api/users");
        assert_eq!(request.query.as_deref(), Some("page=2"));
    }

    #[test]
    fn test_header_lookup_ignores_case() {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "text/plain".to_string());
        let request = LoggedRequest::new("GET", "/", headers, Vec::new());
        assert_eq!(request.header("Content-Type"), Some("text/plain"));
        assert_eq!(request.header("Accept"), None);
    }

    #[test]
    fn test_count_matcher() {
        assert!(CountMatcher::Exactly(1).matches(1));
        assert!(!CountMatcher::Exactly(1).matches(2));
        assert!(CountMatcher::AtLeast(1).matches(3));
        assert!(!CountMatcher::AtLeast(1).matches(0));
        assert!(CountMatcher::AtMost(0).matches(0));
        assert_eq!(CountMatcher::default(), CountMatcher::AtLeast(1));
        assert_eq!(CountMatcher::Exactly(2).to_string(), "exactly 2");
    }

    #[tokio::test]
    async fn test_record_assigns_ids() {
        let journal = RequestJournal::new();
        let first = journal
            .record(LoggedRequest::new("GET", "/a", HashMap::new(), Vec::new()))
            .await;
        let second = journal
            .record(LoggedRequest::new("GET", "/b", HashMap::new(), Vec::new()))
            .await;
        assert!(second > first);
        assert_eq!(journal.len().await, 2);
        assert_eq!(journal.unmatched().await.len(), 2);

        journal.clear().await;
        assert!(journal.is_empty().await);
    }
}
