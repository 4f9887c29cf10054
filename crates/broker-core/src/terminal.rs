//! A registered host and its live sessions.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::session::Session;

const NEW_SESSIONS_CAPACITY: usize = 1;

/// One connected host: its secret, its live sessions, and the queue of
/// freshly-created sessions awaiting pickup by the control stream.
pub struct Terminal {
    locator: String,
    trusted_secret: String,
    lifetime: CancellationToken,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    closing: std::sync::atomic::AtomicBool,
    new_sessions_tx: mpsc::Sender<Arc<Session>>,
    new_sessions_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Session>>>,
}

impl Terminal {
    pub fn new(parent_lifetime: &CancellationToken, locator: String, trusted_secret: String) -> Self {
        let (new_sessions_tx, new_sessions_rx) = mpsc::channel(NEW_SESSIONS_CAPACITY);
        Self {
            locator,
            trusted_secret,
            lifetime: parent_lifetime.child_token(),
            sessions: RwLock::new(HashMap::new()),
            closing: std::sync::atomic::AtomicBool::new(false),
            new_sessions_tx,
            new_sessions_rx: tokio::sync::Mutex::new(new_sessions_rx),
        }
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }

    pub fn new_sessions_sender(&self) -> &mpsc::Sender<Arc<Session>> {
        &self.new_sessions_tx
    }

    pub fn new_sessions_receiver(&self) -> &tokio::sync::Mutex<mpsc::Receiver<Arc<Session>>> {
        &self.new_sessions_rx
    }

    /// Fails with `DuplicateToken` if a session with the same token exists,
    /// or `Closing` if `close()` has already run.
    pub async fn register_session(&self, session: Arc<Session>) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if self.closing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::Closing);
        }
        if sessions.contains_key(session.token()) {
            return Err(Error::DuplicateToken(session.token().to_string()));
        }
        sessions.insert(session.token().to_string(), session);
        Ok(())
    }

    /// Idempotent.
    pub async fn unregister_session(&self, token: &str) {
        self.sessions.write().await.remove(token);
    }

    pub async fn find_session(&self, token: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(token).cloned()
    }

    /// Returns `false` when the stored secret is empty (never accept
    /// anonymous); otherwise compares in length-independent constant time.
    pub fn is_secret_valid(&self, candidate: &str) -> bool {
        if self.trusted_secret.is_empty() {
            return false;
        }
        constant_time_eq(self.trusted_secret.as_bytes(), candidate.as_bytes())
    }

    /// Sets `closing`, cancels and removes every current session. No new
    /// sessions will be accepted afterwards.
    pub async fn close(&self) {
        let mut sessions = self.sessions.write().await;
        self.closing.store(true, std::sync::atomic::Ordering::SeqCst);
        for (_, session) in sessions.drain() {
            session.close();
        }
        self.lifetime.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Length-independent constant-time comparison, standing in for Go's
/// `crypto/subtle.ConstantTimeCompare` (no stdlib equivalent exists).
/// Differing lengths still short-circuit the result but not the loop body,
/// so running time only depends on the longer input's length, never on how
/// many leading bytes match.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let len_match = (a.len() == b.len()) as u8;
    let n = a.len().max(b.len());
    let mut diff: u8 = 0;
    for i in 0..n {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    len_match == 1 && diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Dimensions;

    fn terminal() -> Terminal {
        Terminal::new(&CancellationToken::new(), "loc-1".into(), "s3cret".into())
    }

    #[tokio::test]
    async fn register_rejects_duplicate_token() {
        let t = terminal();
        let lifetime = CancellationToken::new();
        let session = Arc::new(Session::new(&lifetime, Dimensions::new(80, 24)));
        t.register_session(session.clone()).await.unwrap();

        let err = t.register_session(session).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateToken(_)));
    }

    #[tokio::test]
    async fn register_rejects_once_closing() {
        let t = terminal();
        t.close().await;
        let session = Arc::new(Session::new(&CancellationToken::new(), Dimensions::new(80, 24)));
        let err = t.register_session(session).await.unwrap_err();
        assert_eq!(err, Error::Closing);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let t = terminal();
        t.unregister_session("nope").await;
        t.unregister_session("nope").await;
    }

    #[tokio::test]
    async fn close_cancels_and_clears_all_sessions() {
        let t = terminal();
        let session = Arc::new(Session::new(&CancellationToken::new(), Dimensions::new(80, 24)));
        let token = session.token().to_string();
        t.register_session(session.clone()).await.unwrap();

        t.close().await;

        assert!(session.lifetime().is_cancelled());
        assert!(t.find_session(&token).await.is_none());
        assert!(t.is_closing());
    }

    #[test]
    fn secret_valid_rejects_empty_trusted_secret() {
        let t = Terminal::new(&CancellationToken::new(), "loc".into(), String::new());
        assert!(!t.is_secret_valid(""));
        assert!(!t.is_secret_valid("anything"));
    }

    #[test]
    fn secret_valid_requires_exact_match() {
        let t = terminal();
        assert!(t.is_secret_valid("s3cret"));
        assert!(!t.is_secret_valid("wrong"));
        assert!(!t.is_secret_valid("s3cre"));
        assert!(!t.is_secret_valid("s3cretx"));
    }

    #[test]
    fn constant_time_eq_matches_plain_equality() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(!constant_time_eq(b"", b"x"));
        assert!(constant_time_eq(b"", b""));
    }
}
