use tokio::sync::broadcast;

/// How many un-read ticks a subscriber may accumulate before the oldest
/// are dropped. Ticks carry no payload, so a lagged subscriber simply
/// resyncs against current state on its next wakeup.
const CAPACITY: usize = 8;

/// Fan-out of free-space change events. The LV service posts a tick after
/// every successful mutation; each watch stream holds its own receiver so
/// a slow consumer can not block the others.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<()>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    /// Post a tick. Having no subscribers is not an error.
    pub(crate) fn notify(&self) {
        let _ = self.tx.send(());
    }

    /// Subscribe to ticks posted from now on.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    #[tokio::test]
    async fn subscribers_receive_every_tick_in_order() {
        let notifier = Notifier::new();
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();

        notifier.notify();
        notifier.notify();
        notifier.notify();

        for rx in [&mut first, &mut second] {
            for _ in 0..3 {
                rx.recv().await.unwrap();
            }
            assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        }
    }

    #[tokio::test]
    async fn ticks_before_subscribing_are_not_delivered() {
        let notifier = Notifier::new();
        notifier.notify();
        let mut rx = notifier.subscribe();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn slow_subscribers_lag_and_resync() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();

        for _ in 0..(CAPACITY + 3) {
            notifier.notify();
        }

        // the oldest ticks were dropped, the receiver is told how many
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        // the remaining ticks are still delivered
        for _ in 0..CAPACITY {
            rx.recv().await.unwrap();
        }
    }
}
