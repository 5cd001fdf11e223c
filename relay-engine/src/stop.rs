//! Stop signalling between the registry and a running pipeline
//!
//! The registry keeps the `StopHandle`, the pipeline keeps the
//! `StopListener`. Both are created before the task is flipped to
//! `Running`, so a stop request can never miss a spawned process: it is
//! either buffered until the next check or picked up by the runner while it
//! waits on the child.
//!
//! A request that stopped the pipeline is held by the listener and only
//! confirmed once the owner has recorded the outcome, so the requester
//! always observes the final state.

use tokio::sync::{mpsc, oneshot};

/// Reply channel carrying the outcome of a kill attempt
pub type StopAck = oneshot::Sender<std::io::Result<()>>;

/// Creates a connected stop handle and listener
pub fn stop_channel() -> (StopHandle, StopListener) {
    let (tx, rx) = mpsc::channel(1);
    (
        StopHandle { tx },
        StopListener {
            rx: Some(rx),
            accepted: None,
        },
    )
}

/// Registry side of the stop channel
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: mpsc::Sender<StopAck>,
}

impl StopHandle {
    /// Asks the pipeline to stop and waits for its acknowledgement
    ///
    /// # Returns
    /// * `Ok(true)` - the pipeline stopped (any live process was killed)
    ///   and its owner confirmed the outcome
    /// * `Ok(false)` - the pipeline finished without acting on the request
    /// * `Err(_)` - killing the live process failed; it keeps running
    pub async fn request_stop(&self) -> std::io::Result<bool> {
        let (ack_tx, ack_rx) = oneshot::channel();

        if self.tx.send(ack_tx).await.is_err() {
            return Ok(false);
        }

        match ack_rx.await {
            Ok(result) => result.map(|_| true),
            // Listener dropped with our request queued or unconfirmed
            Err(_) => Ok(false),
        }
    }
}

/// Pipeline side of the stop channel
#[derive(Debug)]
pub struct StopListener {
    rx: Option<mpsc::Receiver<StopAck>>,
    accepted: Option<StopAck>,
}

impl StopListener {
    /// A listener that never receives a request
    ///
    /// For running pipelines outside a registry.
    pub fn detached() -> Self {
        Self {
            rx: None,
            accepted: None,
        }
    }

    /// Takes a queued stop request without waiting
    pub fn pending(&mut self) -> Option<StopAck> {
        self.rx.as_mut().and_then(|rx| rx.try_recv().ok())
    }

    /// Waits for the next stop request
    ///
    /// Never resolves when detached or when every handle is gone.
    pub async fn requested(&mut self) -> StopAck {
        if let Some(rx) = self.rx.as_mut() {
            if let Some(ack) = rx.recv().await {
                return ack;
            }
        }
        std::future::pending().await
    }

    /// Marks a request as the one that stopped the pipeline
    ///
    /// The requester keeps waiting until `confirm` is called.
    pub fn accept(&mut self, ack: StopAck) {
        self.accepted = Some(ack);
    }

    /// Releases the requester waiting on an accepted stop
    pub fn confirm(&mut self) {
        if let Some(ack) = self.accepted.take() {
            let _ = ack.send(Ok(()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_request_is_acknowledged() {
        let (handle, mut listener) = stop_channel();

        let stopper = tokio::spawn(async move { handle.request_stop().await });

        let ack = listener.requested().await;
        ack.send(Ok(())).unwrap();

        assert!(stopper.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_request_after_listener_dropped() {
        let (handle, listener) = stop_channel();
        drop(listener);

        assert!(!handle.request_stop().await.unwrap());
    }

    #[tokio::test]
    async fn test_queued_request_dropped_with_listener() {
        let (handle, mut listener) = stop_channel();

        let stopper = tokio::spawn(async move { handle.request_stop().await });

        // Wait until the request is queued, then finish without answering
        loop {
            if let Some(ack) = listener.pending() {
                drop(ack);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(listener);

        assert!(!stopper.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_kill_failure_is_reported() {
        let (handle, mut listener) = stop_channel();

        let stopper = tokio::spawn(async move { handle.request_stop().await });

        let ack = listener.requested().await;
        ack.send(Err(std::io::Error::other("no such process"))).unwrap();

        assert!(stopper.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_accepted_request_waits_for_confirm() {
        let (handle, mut listener) = stop_channel();

        let stopper = tokio::spawn(async move { handle.request_stop().await });

        let ack = listener.requested().await;
        listener.accept(ack);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stopper.is_finished());

        listener.confirm();
        assert!(stopper.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_unconfirmed_request_dropped_with_listener() {
        let (handle, mut listener) = stop_channel();

        let stopper = tokio::spawn(async move { handle.request_stop().await });

        let ack = listener.requested().await;
        listener.accept(ack);
        drop(listener);

        assert!(!stopper.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_detached_listener_never_fires() {
        let mut listener = StopListener::detached();
        assert!(listener.pending().is_none());

        let waited = tokio::time::timeout(Duration::from_millis(20), listener.requested()).await;
        assert!(waited.is_err());
    }
}
