use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// A notification about a change of a managed resource.
#[derive(Clone, Debug)]
pub enum Event<K> {
    Updated(K),
    Deleted(K),
}

/// A one-shot, level triggered stop flag shared by a loop and its handles.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once [`StopSignal::stop`] has been called, including before this call.
    pub async fn stopped(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // register before checking the flag so a concurrent stop is not missed
        notified.as_mut().enable();
        if self.is_stopped() {
            return;
        }
        notified.await;
    }
}

/// Producer side of the bounded queue feeding one control loop.
pub struct EventSender<K> {
    key: String,
    tx: mpsc::Sender<Event<K>>,
    capacity: usize,
    stop: Arc<StopSignal>,
}

impl<K> Clone for EventSender<K> {
    fn clone(&self) -> Self {
        EventSender {
            key: self.key.clone(),
            tx: self.tx.clone(),
            capacity: self.capacity,
            stop: self.stop.clone(),
        }
    }
}

pub fn event_queue<K>(
    key: &str,
    capacity: usize,
    stop: Arc<StopSignal>,
) -> (EventSender<K>, mpsc::Receiver<Event<K>>) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (
        EventSender {
            key: key.to_string(),
            tx,
            capacity,
            stop,
        },
        rx,
    )
}

impl<K> EventSender<K> {
    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue an event, waiting for room while the queue is full.
    ///
    /// Returns false when the loop stopped before the event could be queued.
    pub async fn send(&self, event: Event<K>) -> bool {
        if self.stop.is_stopped() {
            return false;
        }
        let used = self.len();
        if used * 5 > self.capacity * 4 {
            warn!(
                "{}: event queue is {}/{} full, loop is falling behind",
                self.key, used, self.capacity
            );
        }
        tokio::select! {
            biased;
            _ = self.stop.stopped() => false,
            res = self.tx.send(event) => res.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn full_queue_unblocks_on_stop() {
        let stop = Arc::new(StopSignal::new());
        let (tx, _rx) = event_queue::<u32>("ns/a", 1, stop.clone());
        assert!(tx.send(Event::Updated(1)).await);

        let blocked = tokio::spawn({
            let tx = tx.clone();
            async move { tx.send(Event::Updated(2)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        stop.stop();
        assert!(!blocked.await.unwrap());
        assert!(!tx.send(Event::Updated(3)).await);
    }

    #[tokio::test]
    async fn events_keep_their_order() {
        let stop = Arc::new(StopSignal::new());
        let (tx, mut rx) = event_queue::<u32>("ns/a", 4, stop);
        for i in 0..3 {
            assert!(tx.send(Event::Updated(i)).await);
        }
        assert_eq!(tx.len(), 3);
        for i in 0..3 {
            match rx.recv().await {
                Some(Event::Updated(n)) => assert_eq!(n, i),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn stopped_resolves_after_the_fact() {
        let stop = StopSignal::new();
        stop.stop();
        tokio::time::timeout(Duration::from_secs(1), stop.stopped())
            .await
            .unwrap();
    }
}
