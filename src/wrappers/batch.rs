//! Batch collector
//!
//! Buffers items and hands them to a sink in batches: when the buffer
//! reaches `batch_size`, when the first unflushed item has waited
//! `timeout`, and on [`BatchCollector::close`]. An empty flush never
//! happens.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::queue::{BatchHandler, QueueError, QueueResult};

/// Batch collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCollectorConfig {
    /// Flush as soon as this many items are buffered.
    pub batch_size: usize,
    /// Flush once the first unflushed item has waited this long.
    pub timeout: Duration,
}

impl Default for BatchCollectorConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            timeout: Duration::from_secs(1),
        }
    }
}

struct Inner<T> {
    config: BatchCollectorConfig,
    sink: Arc<dyn BatchHandler<T>>,
    buffer: Mutex<Vec<T>>,
    /// Bumped on every flush so a pending timer can tell whether its batch
    /// was already flushed by size or by hand.
    generation: AtomicU64,
    closed: AtomicBool,
}

impl<T: Send + 'static> Inner<T> {
    fn take_batch(&self) -> Option<Vec<T>> {
        let mut buffer = self.buffer.lock();
        if buffer.is_empty() {
            return None;
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        Some(std::mem::take(&mut *buffer))
    }

    async fn flush(&self) -> QueueResult<()> {
        match self.take_batch() {
            None => Ok(()),
            Some(batch) => self.sink.handle_batch(batch).await,
        }
    }

    async fn flush_if_generation(&self, generation: u64) {
        let batch = {
            let mut buffer = self.buffer.lock();
            if self.generation.load(Ordering::Acquire) != generation || buffer.is_empty() {
                return;
            }
            self.generation.fetch_add(1, Ordering::AcqRel);
            std::mem::take(&mut *buffer)
        };
        if let Err(error) = self.sink.handle_batch(batch).await {
            warn!(%error, "timed batch flush failed");
        }
    }
}

/// Size- and time-bounded batching buffer.
pub struct BatchCollector<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> BatchCollector<T> {
    /// Create a collector feeding `sink`.
    pub fn new(config: BatchCollectorConfig, sink: Arc<dyn BatchHandler<T>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sink,
                buffer: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Buffer an item, flushing inline when the batch fills.
    pub async fn push(&self, item: T) -> QueueResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(QueueError::Stopped);
        }
        let (flush_now, timer_generation) = {
            let mut buffer = self.inner.buffer.lock();
            buffer.push(item);
            let timer_generation = if buffer.len() == 1 {
                Some(self.inner.generation.load(Ordering::Acquire))
            } else {
                None
            };
            (buffer.len() >= self.inner.config.batch_size, timer_generation)
        };
        if flush_now {
            return self.inner.flush().await;
        }
        if let Some(generation) = timer_generation {
            let inner = self.inner.clone();
            let timeout = inner.config.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                inner.flush_if_generation(generation).await;
            });
        }
        Ok(())
    }

    /// Items currently buffered.
    pub fn len(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.buffer.lock().is_empty()
    }

    /// Flush whatever is buffered, regardless of size or age.
    pub async fn flush(&self) -> QueueResult<()> {
        self.inner.flush().await
    }

    /// Flush remaining items and refuse further pushes.
    pub async fn close(&self) -> QueueResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(QueueError::Stopped);
        }
        self.inner.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::FnBatchHandler;
    use parking_lot::Mutex as PlMutex;

    fn collector(
        config: BatchCollectorConfig,
    ) -> (BatchCollector<u32>, Arc<PlMutex<Vec<Vec<u32>>>>) {
        let batches = Arc::new(PlMutex::new(Vec::new()));
        let batches_in_sink = batches.clone();
        let sink = Arc::new(FnBatchHandler(move |batch: Vec<u32>| {
            let batches = batches_in_sink.clone();
            async move {
                batches.lock().push(batch);
                Ok(())
            }
        }));
        (BatchCollector::new(config, sink), batches)
    }

    #[tokio::test]
    async fn flushes_when_batch_fills() {
        let (collector, batches) = collector(BatchCollectorConfig {
            batch_size: 3,
            timeout: Duration::from_secs(60),
        });

        for i in 0..3 {
            collector.push(i).await.unwrap();
        }
        assert_eq!(batches.lock().as_slice(), &[vec![0, 1, 2]]);
        assert!(collector.is_empty());
    }

    #[tokio::test]
    async fn flushes_on_timeout() {
        let (collector, batches) = collector(BatchCollectorConfig {
            batch_size: 100,
            timeout: Duration::from_millis(40),
        });

        collector.push(1).await.unwrap();
        collector.push(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(batches.lock().as_slice(), &[vec![1, 2]]);
    }

    #[tokio::test]
    async fn close_flushes_the_remainder() {
        let (collector, batches) = collector(BatchCollectorConfig {
            batch_size: 100,
            timeout: Duration::from_secs(60),
        });

        collector.push(9).await.unwrap();
        collector.close().await.unwrap();

        assert_eq!(batches.lock().as_slice(), &[vec![9]]);
        assert!(matches!(collector.push(1).await, Err(QueueError::Stopped)));
    }

    #[tokio::test]
    async fn empty_collector_never_flushes_empty_batches() {
        let (collector, batches) = collector(BatchCollectorConfig {
            batch_size: 2,
            timeout: Duration::from_millis(20),
        });

        collector.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        collector.close().await.unwrap();

        assert!(batches.lock().is_empty());
    }
}
