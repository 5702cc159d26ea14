//! Buffered distribution of [`StorageEvent`]s to subscribers, coalesced into batches on a
//! size-or-time window.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::warn;
use storage::StorageEvent;

/// Collects events from a local store's [`storage::LocalStore::events`] channel and
/// re-emits them as batches, either when `max_collected_events` accumulate or when
/// `max_collected_time` elapses since the first event in the batch, whichever comes first.
///
/// The outbound channel is bounded; once full, the oldest queued batch is dropped (with a
/// warning) to make room rather than letting a slow subscriber stall the local store.
pub struct EventPipeline<K, V> {
    outbound: Receiver<Vec<StorageEvent<K, V>>>,
    shutdown: Arc<Mutex<bool>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl<K, V> EventPipeline<K, V>
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn spawn(source: Receiver<StorageEvent<K, V>>, max_collected_events: usize, max_collected_time: Duration) -> Self {
        let (tx, rx): (Sender<Vec<StorageEvent<K, V>>>, Receiver<Vec<StorageEvent<K, V>>>) = bounded(64);
        let shutdown = Arc::new(Mutex::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let worker = thread::spawn(move || {
            let mut batch = Vec::new();
            let mut window_start = Instant::now();

            loop {
                if *shutdown_flag.lock().expect("event pipeline shutdown flag poisoned") {
                    break;
                }

                let remaining = max_collected_time.saturating_sub(window_start.elapsed());
                match source.recv_timeout(remaining) {
                    Ok(event) => {
                        let closing = matches!(event, StorageEvent::Closing);
                        if batch.is_empty() {
                            window_start = Instant::now();
                        }
                        batch.push(event);
                        if closing || batch.len() >= max_collected_events {
                            Self::flush(&tx, &mut batch);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if !batch.is_empty() {
                            Self::flush(&tx, &mut batch);
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        if !batch.is_empty() {
                            Self::flush(&tx, &mut batch);
                        }
                        break;
                    }
                }
            }
        });

        EventPipeline { outbound: rx, shutdown, worker: Some(worker) }
    }

    fn flush(tx: &Sender<Vec<StorageEvent<K, V>>>, batch: &mut Vec<StorageEvent<K, V>>) {
        let ready = std::mem::take(batch);
        if tx.try_send(ready).is_err() {
            warn!("event pipeline outbound channel full, dropping oldest batch");
            let _ = tx.try_recv();
        }
    }

    /// The channel coalesced batches are read from. Cloning hands out another handle onto
    /// the same underlying queue (competing consumers), not a broadcast fan-out.
    pub fn receiver(&self) -> Receiver<Vec<StorageEvent<K, V>>> {
        self.outbound.clone()
    }
}

impl<K, V> Drop for EventPipeline<K, V> {
    fn drop(&mut self) {
        *self.shutdown.lock().expect("event pipeline shutdown flag poisoned") = true;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn flushes_on_size_threshold() {
        let (tx, rx) = unbounded();
        let pipeline: EventPipeline<String, i32> = EventPipeline::spawn(rx, 2, Duration::from_secs(5));

        tx.send(StorageEvent::Created("a".to_string(), 1)).unwrap();
        tx.send(StorageEvent::Created("b".to_string(), 2)).unwrap();

        let batch = pipeline.receiver().recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn flushes_on_time_threshold() {
        let (tx, rx) = unbounded();
        let pipeline: EventPipeline<String, i32> = EventPipeline::spawn(rx, 100, Duration::from_millis(20));

        tx.send(StorageEvent::Created("a".to_string(), 1)).unwrap();

        let batch = pipeline.receiver().recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn closing_flushes_immediately() {
        let (tx, rx) = unbounded();
        let pipeline: EventPipeline<String, i32> = EventPipeline::spawn(rx, 100, Duration::from_secs(5));

        tx.send(StorageEvent::Closing).unwrap();

        let batch = pipeline.receiver().recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(matches!(batch[0], StorageEvent::Closing));
    }
}
