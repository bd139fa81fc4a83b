use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::digest::Digest;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("chunk starts at offset {start}, expected {expected}")]
    NonContiguousChunk { expected: u64, start: u64 },
    #[error("computed digest {actual} does not match declared digest {expected}")]
    DigestMismatch { expected: Digest, actual: Digest },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initiated,
    Receiving,
    Committed,
    Abandoned,
}

/// An in-progress resumable upload. The buffer only ever grows by
/// contiguous appends; `bytes_received` is the high-water mark the next
/// chunk must start at.
pub struct UploadSession {
    pub id: String,
    pub repository: String,
    pub write_lock: Arc<Mutex<()>>,
    buffer: Vec<u8>,
    state: SessionState,
    pub created_at: Instant,
}

impl UploadSession {
    pub fn new(id: String, repository: String) -> Self {
        UploadSession {
            id,
            repository,
            write_lock: Arc::new(Mutex::new(())),
            buffer: Vec::new(),
            state: SessionState::Initiated,
            created_at: Instant::now(),
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Appends a chunk. A declared start offset must equal the current
    /// high-water mark exactly; out-of-order and replayed chunks are
    /// rejected without touching the buffer. `None` means the client sent
    /// no Content-Range, which always appends at the current offset.
    pub fn append_chunk(&mut self, start: Option<u64>, data: &[u8]) -> Result<u64, UploadError> {
        let expected = self.bytes_received();
        if let Some(start) = start {
            if start != expected {
                return Err(UploadError::NonContiguousChunk { expected, start });
            }
        }
        self.buffer.extend_from_slice(data);
        self.state = SessionState::Receiving;
        Ok(self.bytes_received())
    }

    /// Finalizes the session against the declared digest. On mismatch the
    /// buffer is left untouched and the session stays resumable.
    pub fn commit(&mut self, expected: &Digest) -> Result<Bytes, UploadError> {
        let actual = Digest::compute(&self.buffer);
        if actual != *expected {
            return Err(UploadError::DigestMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        self.state = SessionState::Committed;
        Ok(Bytes::from(std::mem::take(&mut self.buffer)))
    }

    pub fn abandon(&mut self) {
        self.state = SessionState::Abandoned;
        self.buffer.clear();
    }

    /// Rolls the buffer back to `len` bytes after a failed commit that
    /// carried a final body chunk.
    pub fn truncate(&mut self, len: u64) {
        self.buffer.truncate(len as usize);
    }
}

#[derive(Default)]
pub struct UploadSessionStore {
    sessions: HashMap<String, UploadSession>,
}

impl UploadSessionStore {
    pub fn create(&mut self, session: UploadSession) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Option<&UploadSession> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut UploadSession> {
        self.sessions.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<UploadSession> {
        self.sessions.remove(id)
    }

    pub fn cleanup_expired(&mut self, max_age: Duration) -> Vec<UploadSession> {
        let now = Instant::now();
        let expired_keys: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.created_at) >= max_age)
            .map(|(k, _)| k.clone())
            .collect();
        expired_keys
            .iter()
            .filter_map(|k| {
                let mut session = self.sessions.remove(k)?;
                session.abandon();
                Some(session)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> UploadSession {
        UploadSession::new("u1".to_string(), "myorg/app".to_string())
    }

    #[test]
    fn contiguous_chunks_advance_high_water_mark() {
        let mut s = session();
        assert_eq!(s.append_chunk(Some(0), b"hello ").unwrap(), 6);
        assert_eq!(s.append_chunk(Some(6), b"world").unwrap(), 11);
        assert_eq!(s.state(), SessionState::Receiving);
    }

    #[test]
    fn out_of_order_chunk_is_rejected_without_mutation() {
        let mut s = session();
        let err = s.append_chunk(Some(10), b"later").unwrap_err();
        assert!(matches!(
            err,
            UploadError::NonContiguousChunk {
                expected: 0,
                start: 10
            }
        ));
        assert_eq!(s.bytes_received(), 0);
    }

    #[test]
    fn replayed_chunk_is_rejected() {
        let mut s = session();
        s.append_chunk(Some(0), b"first").unwrap();
        // retrying the already-applied range fails; the mark has moved on
        let err = s.append_chunk(Some(0), b"first").unwrap_err();
        assert!(matches!(err, UploadError::NonContiguousChunk { .. }));
        assert_eq!(s.bytes_received(), 5);
    }

    #[test]
    fn chunk_without_range_appends_at_current_offset() {
        let mut s = session();
        s.append_chunk(None, b"ab").unwrap();
        s.append_chunk(None, b"cd").unwrap();
        assert_eq!(s.bytes_received(), 4);
    }

    #[test]
    fn commit_verifies_digest_and_yields_bytes() {
        let mut s = session();
        s.append_chunk(Some(0), b"payload").unwrap();
        let blob = s.commit(&Digest::compute(b"payload")).unwrap();
        assert_eq!(&blob[..], b"payload");
        assert_eq!(s.state(), SessionState::Committed);
    }

    #[test]
    fn failed_commit_leaves_session_resumable() {
        let mut s = session();
        s.append_chunk(Some(0), b"payload").unwrap();
        let wrong = Digest::compute(b"something else");
        assert!(matches!(
            s.commit(&wrong),
            Err(UploadError::DigestMismatch { .. })
        ));
        assert_eq!(s.state(), SessionState::Receiving);
        assert_eq!(s.bytes_received(), 7);
        // contiguous resume still works after the failure
        s.append_chunk(Some(7), b"!").unwrap();
        assert_eq!(s.bytes_received(), 8);
    }

    #[test]
    fn cleanup_expired_abandons_old_sessions() {
        let mut store = UploadSessionStore::default();
        store.create(session());
        let expired = store.cleanup_expired(Duration::from_secs(0));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].state(), SessionState::Abandoned);
        assert!(store.get("u1").is_none());
    }
}
