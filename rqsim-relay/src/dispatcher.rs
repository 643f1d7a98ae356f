//! Single ordered queue between ingress handlers and the broadcast loop.

use tokio::sync::mpsc;

use crate::protocol::Envelope;

/// Create a dispatcher queue.
///
/// `None` gives an unbounded queue; `Some(n)` bounds it to `n` envelopes and
/// makes [`DispatchSender::dispatch`] wait for space.
pub fn channel(capacity: Option<usize>) -> (DispatchSender, DispatchReceiver) {
    match capacity {
        Some(n) => {
            let (tx, rx) = mpsc::channel(n.max(1));
            (DispatchSender::Bounded(tx), DispatchReceiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (DispatchSender::Unbounded(tx), DispatchReceiver::Unbounded(rx))
        }
    }
}

/// The broadcast loop has stopped; the envelope was not queued.
#[derive(Debug)]
pub struct DispatchClosed(pub Envelope);

#[derive(Debug, Clone)]
pub enum DispatchSender {
    Bounded(mpsc::Sender<Envelope>),
    Unbounded(mpsc::UnboundedSender<Envelope>),
}

impl DispatchSender {
    pub async fn dispatch(&self, envelope: Envelope) -> Result<(), DispatchClosed> {
        match self {
            Self::Bounded(tx) => tx.send(envelope).await.map_err(|e| DispatchClosed(e.0)),
            Self::Unbounded(tx) => tx.send(envelope).map_err(|e| DispatchClosed(e.0)),
        }
    }
}

#[derive(Debug)]
pub enum DispatchReceiver {
    Bounded(mpsc::Receiver<Envelope>),
    Unbounded(mpsc::UnboundedReceiver<Envelope>),
}

impl DispatchReceiver {
    /// Next envelope in arrival order; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        match self {
            Self::Bounded(rx) => rx.recv().await,
            Self::Unbounded(rx) => rx.recv().await,
        }
    }
}
