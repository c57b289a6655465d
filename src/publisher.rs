//! Fan-out of serialized snapshots to connected stream clients.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use crate::snapshot::MetricSnapshot;

struct Inner {
    tx: broadcast::Sender<Arc<str>>,
    latest: RwLock<Option<Arc<str>>>,
    clients: AtomicUsize,
    published: AtomicU64,
}

/// Holds the most recent snapshot JSON and broadcasts each new one.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Inner>,
}

/// A connected client. Dropping it decrements the client count.
pub struct Subscription {
    pub rx: broadcast::Receiver<Arc<str>>,
    inner: Arc<Inner>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.clients.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Publisher {
    /// `capacity` is how many snapshots a slow client may lag before it
    /// starts skipping.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                tx,
                latest: RwLock::new(None),
                clients: AtomicUsize::new(0),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Serializes and broadcasts `snapshot`. Returns the serialized size.
    pub fn publish(&self, snapshot: &MetricSnapshot) -> Result<usize, serde_json::Error> {
        let json: Arc<str> = serde_json::to_string(snapshot)?.into();
        let size = json.len();
        self.publish_raw(json);
        Ok(size)
    }

    fn publish_raw(&self, json: Arc<str>) {
        *self.inner.latest.write().unwrap_or_else(|e| e.into_inner()) = Some(json.clone());
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error
        let _ = self.inner.tx.send(json);
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.clients.fetch_add(1, Ordering::Relaxed);
        Subscription {
            rx: self.inner.tx.subscribe(),
            inner: self.inner.clone(),
        }
    }

    pub fn latest(&self) -> Option<Arc<str>> {
        self.inner
            .latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.load(Ordering::Relaxed)
    }

    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_published_json() {
        let publisher = Publisher::new(4);
        let mut sub = publisher.subscribe();
        assert_eq!(publisher.client_count(), 1);

        publisher.publish_raw(Arc::from("{\"n\":1}"));
        let msg = sub.rx.recv().await.unwrap();
        assert_eq!(&*msg, "{\"n\":1}");
        assert_eq!(publisher.latest().as_deref(), Some("{\"n\":1}"));

        drop(sub);
        assert_eq!(publisher.client_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_client_lags_instead_of_blocking() {
        let publisher = Publisher::new(2);
        let mut sub = publisher.subscribe();
        for i in 0..5 {
            publisher.publish_raw(Arc::from(format!("{i}")));
        }
        assert!(matches!(
            sub.rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert_eq!(&*sub.rx.recv().await.unwrap(), "3");
        assert_eq!(publisher.published_count(), 5);
    }
}
