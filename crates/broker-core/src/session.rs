//! The per-guest I/O rendezvous.

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Columns/rows requested by a guest, or pushed by a later resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub cols: u32,
    pub rows: u32,
}

impl Dimensions {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self { cols, rows }
    }
}

/// Channel capacity standing in for Go's unbuffered channel: a second send
/// still blocks until the first is drained, so backpressure is preserved.
const RENDEZVOUS_CAPACITY: usize = 1;

/// One guest's attachment to one [`crate::Terminal`](crate::terminal::Terminal).
///
/// The guest stream is the sole producer on `input`/`resize` and sole
/// consumer on `output`; the host data stream is the mirror image. Session
/// itself never sends or receives on these channels — endpoints reach in
/// directly, which is why the halves are exposed as plain accessors rather
/// than wrapped in `send_input`-style methods.
pub struct Session {
    token: String,
    requested_dimensions: Dimensions,
    lifetime: CancellationToken,

    input_tx: mpsc::Sender<Vec<u8>>,
    input_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    output_tx: mpsc::Sender<Vec<u8>>,
    output_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    resize_tx: mpsc::Sender<Dimensions>,
    resize_rx: Mutex<mpsc::Receiver<Dimensions>>,
}

impl Session {
    /// Allocates a token, derives a child lifetime from `parent_lifetime`,
    /// and returns the new Session.
    pub fn new(parent_lifetime: &CancellationToken, requested_dimensions: Dimensions) -> Self {
        let (input_tx, input_rx) = mpsc::channel(RENDEZVOUS_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(RENDEZVOUS_CAPACITY);
        let (resize_tx, resize_rx) = mpsc::channel(RENDEZVOUS_CAPACITY);

        Self {
            token: uuid::Uuid::new_v4().simple().to_string(),
            requested_dimensions,
            lifetime: parent_lifetime.child_token(),
            input_tx,
            input_rx: Mutex::new(input_rx),
            output_tx,
            output_rx: Mutex::new(output_rx),
            resize_tx,
            resize_rx: Mutex::new(resize_rx),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn requested_dimensions(&self) -> Dimensions {
        self.requested_dimensions
    }

    pub fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }

    /// Cancels the session's lifetime. Idempotent.
    pub fn close(&self) {
        self.lifetime.cancel();
    }

    pub fn input_sender(&self) -> &mpsc::Sender<Vec<u8>> {
        &self.input_tx
    }

    pub fn input_receiver(&self) -> &Mutex<mpsc::Receiver<Vec<u8>>> {
        &self.input_rx
    }

    pub fn output_sender(&self) -> &mpsc::Sender<Vec<u8>> {
        &self.output_tx
    }

    pub fn output_receiver(&self) -> &Mutex<mpsc::Receiver<Vec<u8>>> {
        &self.output_rx
    }

    pub fn resize_sender(&self) -> &mpsc::Sender<Dimensions> {
        &self.resize_tx
    }

    pub fn resize_receiver(&self) -> &Mutex<mpsc::Receiver<Dimensions>> {
        &self.resize_rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_allocates_a_unique_token() {
        let parent = CancellationToken::new();
        let a = Session::new(&parent, Dimensions::new(80, 24));
        let b = Session::new(&parent, Dimensions::new(80, 24));
        assert_ne!(a.token(), b.token());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_cancels_lifetime() {
        let parent = CancellationToken::new();
        let session = Session::new(&parent, Dimensions::new(80, 24));
        assert!(!session.lifetime().is_cancelled());
        session.close();
        session.close();
        assert!(session.lifetime().is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn closing_parent_cancels_session() {
        let parent = CancellationToken::new();
        let session = Session::new(&parent, Dimensions::new(80, 24));
        parent.cancel();
        assert!(session.lifetime().is_cancelled());
    }

    #[tokio::test]
    async fn input_channel_is_capacity_one() {
        let parent = CancellationToken::new();
        let session = Session::new(&parent, Dimensions::new(80, 24));
        session.input_sender().send(vec![1]).await.unwrap();
        {
            let mut rx = session.input_receiver().lock().await;
            assert_eq!(rx.recv().await, Some(vec![1]));
        }
    }
}
