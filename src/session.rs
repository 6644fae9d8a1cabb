use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;

/// Error type session stores report; the shard wraps it in
/// [`Error::Store`](crate::Error::Store).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Persistent session state, keyed by shard index.
///
/// The shard reads `(session_id, last_seq)` at connect time to decide between
/// identify and resume, advances `last_seq` on every dispatch, and replaces
/// the session id whenever the server issues a new `Ready`.
///
/// Read failures at connect time are non-fatal: the shard logs a warning and
/// proceeds as if the store held the zero values, which turns the attempt
/// into a fresh identify. Write failures abort the current connection
/// attempt.
pub trait SessionStore: Send + Sync + 'static {
    /// Last persisted dispatch sequence number, 0 if none.
    fn get_seq(&self, shard_index: u32) -> impl Future<Output = Result<u64, BoxError>> + Send;

    /// Persist the dispatch sequence number.
    fn set_seq(
        &self,
        shard_index: u32,
        seq: u64,
    ) -> impl Future<Output = Result<(), BoxError>> + Send;

    /// Current session id, empty if none.
    fn get_session(&self, shard_index: u32)
        -> impl Future<Output = Result<String, BoxError>> + Send;

    /// Persist the session id.
    fn set_session(
        &self,
        shard_index: u32,
        session_id: String,
    ) -> impl Future<Output = Result<(), BoxError>> + Send;
}

#[derive(Debug, Default, Clone)]
struct SessionState {
    session_id: String,
    seq: u64,
}

/// In-process [`SessionStore`] for tests and single-process deployments.
///
/// Clones share state, so a supervisor can keep a handle while shards own
/// their copies. Sessions do not survive a restart; pair the shard with a
/// durable store when resume-across-restart matters.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<u32, SessionState>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    async fn get_seq(&self, shard_index: u32) -> Result<u64, BoxError> {
        Ok(self.inner.read().get(&shard_index).map_or(0, |s| s.seq))
    }

    async fn set_seq(&self, shard_index: u32, seq: u64) -> Result<(), BoxError> {
        self.inner.write().entry(shard_index).or_default().seq = seq;
        Ok(())
    }

    async fn get_session(&self, shard_index: u32) -> Result<String, BoxError> {
        Ok(self
            .inner
            .read()
            .get(&shard_index)
            .map_or_else(String::new, |s| s.session_id.clone()))
    }

    async fn set_session(&self, shard_index: u32, session_id: String) -> Result<(), BoxError> {
        self.inner
            .write()
            .entry(shard_index)
            .or_default()
            .session_id = session_id;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_store_returns_zero_values() {
        let store = MemoryStore::new();
        assert_eq!(store.get_seq(0).await.unwrap(), 0);
        assert_eq!(store.get_session(0).await.unwrap(), "");
    }

    #[tokio::test]
    async fn state_is_kept_per_shard() {
        let store = MemoryStore::new();
        store.set_session(0, "alpha".to_owned()).await.unwrap();
        store.set_seq(0, 120).await.unwrap();
        store.set_session(3, "beta".to_owned()).await.unwrap();

        assert_eq!(store.get_session(0).await.unwrap(), "alpha");
        assert_eq!(store.get_seq(0).await.unwrap(), 120);
        assert_eq!(store.get_session(3).await.unwrap(), "beta");
        assert_eq!(store.get_seq(3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.set_seq(1, 7).await.unwrap();
        assert_eq!(other.get_seq(1).await.unwrap(), 7);
    }
}
