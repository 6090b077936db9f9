//! Live fan-out broker.
//!
//! A producer (typically a thread reading a DLT text feed) publishes records; every
//! subscriber whose criteria accept a record gets its own copy through an unbounded
//! crossbeam channel. Dropping a [`ChannelStream`] removes it from the registry. Once the
//! broker is closed, subscribers drain what is queued and then report exhaustion.

use super::{criteria_accept, ChannelFilter, LogRecord, TraceBroker, TraceStream};
use crate::error::Result;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

type SubscriberId = u64;

struct Subscriber {
    criteria: Vec<ChannelFilter>,
    sender: Sender<LogRecord>,
}

#[derive(Default)]
struct Registry {
    subscribers: Mutex<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Broker handle; clones share the same subscriber registry
#[derive(Clone, Default)]
pub struct ChannelBroker {
    registry: Arc<Registry>,
}

impl std::fmt::Debug for ChannelBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelBroker")
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ChannelBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `record` to every matching subscriber, returning how many received it
    pub fn publish(&self, record: LogRecord) -> usize {
        if self.is_closed() {
            return 0;
        }
        let subscribers = self.registry.subscribers.lock();
        let mut delivered = 0;
        for subscriber in subscribers.values() {
            if criteria_accept(&subscriber.criteria, &record)
                && subscriber.sender.send(record.clone()).is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Stop accepting records and disconnect every subscriber
    pub fn close(&self) {
        if !self.registry.closed.swap(true, Ordering::SeqCst) {
            let dropped = self.registry.subscribers.lock().drain().count();
            debug!("Trace broker closed, {} subscriber(s) disconnected", dropped);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.registry.closed.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.subscribers.lock().len()
    }

    /// Publish every parseable line of `reader` on a background thread
    ///
    /// The broker is closed when the reader ends or fails. The handle yields the number
    /// of records published.
    pub fn spawn_line_feed<R>(&self, reader: R) -> JoinHandle<Result<usize>>
    where
        R: BufRead + Send + 'static,
    {
        let broker = self.clone();
        thread::spawn(move || {
            let mut published = 0;
            let outcome = (|| -> Result<()> {
                for line in reader.lines() {
                    let line = line?;
                    if LogRecord::is_skippable_line(&line) {
                        continue;
                    }
                    match LogRecord::parse_line(&line) {
                        Ok(record) => {
                            broker.publish(record);
                            published += 1;
                        }
                        Err(e) => warn!("Skipping trace line: {}", e),
                    }
                }
                Ok(())
            })();
            info!("Trace feed ended after {} records", published);
            broker.close();
            outcome.map(|_| published)
        })
    }
}

impl TraceBroker for ChannelBroker {
    type Stream = ChannelStream;

    fn subscribe(&self, criteria: &[ChannelFilter]) -> Result<ChannelStream> {
        let (sender, receiver) = channel::unbounded();
        let id = self.registry.next_id.fetch_add(1, Ordering::SeqCst);
        if !self.is_closed() {
            self.registry.subscribers.lock().insert(
                id,
                Subscriber {
                    criteria: criteria.to_vec(),
                    sender,
                },
            );
        }
        debug!("Live subscription {} with {} criteria", id, criteria.len());
        Ok(ChannelStream {
            id,
            receiver,
            registry: Arc::downgrade(&self.registry),
            disconnected: false,
        })
    }
}

/// Subscription handle of a [`ChannelBroker`]
pub struct ChannelStream {
    id: SubscriberId,
    receiver: Receiver<LogRecord>,
    registry: Weak<Registry>,
    disconnected: bool,
}

impl std::fmt::Debug for ChannelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStream")
            .field("id", &self.id)
            .field("queued", &self.receiver.len())
            .field("disconnected", &self.disconnected)
            .finish()
    }
}

impl TraceStream for ChannelStream {
    fn next_available(&mut self, timeout: Duration) -> Option<LogRecord> {
        if self.disconnected {
            return None;
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(record) => Some(record),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.disconnected = true;
                None
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        self.disconnected
    }
}

impl Drop for ChannelStream {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.subscribers.lock().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_respects_criteria() {
        let broker = ChannelBroker::new();
        let mut boot = broker.subscribe(&[ChannelFilter::new("SYS", "BOOT")]).unwrap();
        let mut all = broker.subscribe(&[]).unwrap();

        assert_eq!(broker.publish(LogRecord::new(1.0, "SYS", "BOOT", "up")), 2);
        assert_eq!(broker.publish(LogRecord::new(2.0, "NSM", "LCM", "x")), 1);

        assert_eq!(boot.next_available(Duration::ZERO).unwrap().payload, "up");
        assert!(boot.next_available(Duration::from_millis(5)).is_none());
        assert_eq!(all.next_available(Duration::ZERO).unwrap().payload, "up");
        assert_eq!(all.next_available(Duration::ZERO).unwrap().payload, "x");
    }

    #[test]
    fn test_drop_unsubscribes() {
        let broker = ChannelBroker::new();
        let stream = broker.subscribe(&[]).unwrap();
        assert_eq!(broker.subscriber_count(), 1);
        drop(stream);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[test]
    fn test_close_drains_then_exhausts() {
        let broker = ChannelBroker::new();
        let mut stream = broker.subscribe(&[]).unwrap();
        broker.publish(LogRecord::new(1.0, "A", "B", "queued"));
        broker.close();

        assert_eq!(stream.next_available(Duration::ZERO).unwrap().payload, "queued");
        assert!(stream.next_available(Duration::from_secs(1)).is_none());
        assert!(stream.is_exhausted());
        assert_eq!(broker.publish(LogRecord::new(2.0, "A", "B", "late")), 0);
    }

    #[test]
    fn test_line_feed_publishes_and_closes() {
        let broker = ChannelBroker::new();
        let mut stream = broker.subscribe(&[]).unwrap();
        let feed = "0.5 SYS BOOT one\ngarbage\n# comment\n0.7 SYS BOOT two\n";
        let handle = broker.spawn_line_feed(std::io::Cursor::new(feed.to_string()));

        assert_eq!(handle.join().unwrap().unwrap(), 2);
        assert_eq!(stream.next_available(Duration::from_secs(1)).unwrap().payload, "one");
        assert_eq!(stream.next_available(Duration::from_secs(1)).unwrap().payload, "two");
        assert!(stream.next_available(Duration::from_secs(1)).is_none());
        assert!(stream.is_exhausted());
    }
}
