use tokio::sync::broadcast;

/// Listens for the service shutdown signal.
///
/// Only one value is ever sent on the broadcast channel (or the sender is dropped), after which
/// every holder should stop. The flag remembers that it already happened so `recv` can be polled
/// again from a `select!` loop.
#[derive(Debug)]
pub(crate) struct Shutdown {
    shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        Self {
            shutdown: self.shutdown,
            notify: self.notify.resubscribe(),
        }
    }
}

impl Shutdown {
    pub(crate) fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            shutdown: false,
            notify,
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Waits for the signal, returning immediately if it was already seen.
    pub(crate) async fn recv(&mut self) {
        if self.is_shutdown() {
            return;
        }

        // Lagging is impossible with a single value; a closed channel counts as shutdown too.
        let _ = self.notify.recv().await;

        self.shutdown = true;
    }
}

impl From<broadcast::Receiver<()>> for Shutdown {
    fn from(notify: broadcast::Receiver<()>) -> Self {
        Self::new(notify)
    }
}

#[tokio::test]
async fn shutdown_is_sticky() {
    let (tx, rx) = broadcast::channel(1);
    let mut shutdown = Shutdown::new(rx);
    let mut clone = shutdown.clone();

    assert!(!shutdown.is_shutdown());
    drop(tx);

    shutdown.recv().await;
    clone.recv().await;
    assert!(shutdown.is_shutdown());
    assert!(clone.is_shutdown());

    // second call does not wait
    shutdown.recv().await;
}
