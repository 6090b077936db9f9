//! Replay broker over a finite, pre-recorded trace.
//!
//! Every record is scheduled at an arrival offset relative to the moment a stream is
//! subscribed. The stream waits on its [`Clock`](crate::clock::Clock), so on a
//! [`ManualClock`](crate::clock::ManualClock) whole boot sequences replay in simulated
//! time.

use super::{criteria_accept, ChannelFilter, LogRecord, TraceBroker, TraceStream};
use crate::clock::SharedClock;
use crate::error::Result;
use std::collections::VecDeque;
use std::io::BufRead;
use std::time::Duration;
use tracing::{debug, warn};

/// How record timestamps translate into arrival offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pacing {
    /// Every record is available as soon as the stream is subscribed
    #[default]
    Immediate,
    /// Records arrive in file order, spaced by the gap to the previous timestamp
    ///
    /// A timestamp lower than its predecessor (a new boot) adds no delay.
    Realtime,
}

#[derive(Debug, Clone)]
struct Scheduled {
    arrival: Duration,
    record: LogRecord,
}

/// Broker serving a recorded trace to any number of independent subscriptions
#[derive(Debug, Clone)]
pub struct ReplayBroker {
    schedule: Vec<Scheduled>,
    clock: SharedClock,
}

impl ReplayBroker {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            schedule: Vec::new(),
            clock,
        }
    }

    /// Broker over `records`, paced according to `pacing`
    ///
    /// Records keep their input order whatever the pacing.
    pub fn from_records(records: Vec<LogRecord>, pacing: Pacing, clock: SharedClock) -> Self {
        let mut broker = Self::new(clock);
        let mut arrival = Duration::ZERO;
        let mut previous = records.first().map(|r| r.timestamp);
        for record in records {
            if pacing == Pacing::Realtime {
                if let Some(previous) = previous {
                    let gap = Duration::try_from_secs_f64((record.timestamp - previous).max(0.0))
                        .unwrap_or(Duration::MAX);
                    arrival = arrival.saturating_add(gap);
                }
                previous = Some(record.timestamp);
            }
            broker.schedule.push(Scheduled { arrival, record });
        }
        broker
    }

    /// Parse a text trace, skipping blank lines and comments
    ///
    /// Malformed lines are reported and skipped; I/O errors are propagated.
    pub fn from_reader<R: BufRead>(reader: R, pacing: Pacing, clock: SharedClock) -> Result<Self> {
        let mut records = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if LogRecord::is_skippable_line(&line) {
                continue;
            }
            match LogRecord::parse_line(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping trace line {}: {}", index + 1, e),
            }
        }
        debug!("Loaded {} trace records", records.len());
        Ok(Self::from_records(records, pacing, clock))
    }

    /// Schedule `record` to arrive `arrival` after subscription
    ///
    /// Records are kept in arrival order; equal arrivals keep insertion order.
    pub fn push_at(&mut self, arrival: Duration, record: LogRecord) {
        let position = self.schedule.partition_point(|s| s.arrival <= arrival);
        self.schedule.insert(position, Scheduled { arrival, record });
    }

    pub fn len(&self) -> usize {
        self.schedule.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedule.is_empty()
    }
}

impl TraceBroker for ReplayBroker {
    type Stream = ReplayStream;

    fn subscribe(&self, criteria: &[ChannelFilter]) -> Result<ReplayStream> {
        let base = self.clock.now();
        let queue: VecDeque<Scheduled> = self
            .schedule
            .iter()
            .filter(|s| criteria_accept(criteria, &s.record))
            .map(|s| Scheduled {
                arrival: base + s.arrival,
                record: s.record.clone(),
            })
            .collect();
        debug!(
            "Replay subscription with {} criteria, {} records queued",
            criteria.len(),
            queue.len()
        );
        Ok(ReplayStream {
            queue,
            clock: self.clock.clone(),
        })
    }
}

/// Subscription over a [`ReplayBroker`]; exhausted once every queued record was pulled
#[derive(Debug)]
pub struct ReplayStream {
    queue: VecDeque<Scheduled>,
    clock: SharedClock,
}

impl ReplayStream {
    /// Records not yet pulled
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl TraceStream for ReplayStream {
    fn next_available(&mut self, timeout: Duration) -> Option<LogRecord> {
        let arrival = self.queue.front()?.arrival;
        let now = self.clock.now();
        if arrival > now {
            let wait = arrival - now;
            if wait > timeout {
                self.clock.sleep(timeout);
                return None;
            }
            self.clock.sleep(wait);
        }
        self.queue.pop_front().map(|s| s.record)
    }

    fn is_exhausted(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn records() -> Vec<LogRecord> {
        vec![
            LogRecord::new(10.0, "SYS", "BOOT", "kernel up"),
            LogRecord::new(12.5, "NSM", "LCM", "state RUNNING"),
            LogRecord::new(13.0, "SYS", "BOOT", "userspace up"),
        ]
    }

    #[test]
    fn test_realtime_pacing_waits_on_clock() {
        let clock = ManualClock::new();
        let broker = ReplayBroker::from_records(records(), Pacing::Realtime, clock.shared());
        let mut stream = broker.subscribe(&[]).unwrap();

        let first = stream.next_available(Duration::from_secs(1)).unwrap();
        assert_eq!(first.payload, "kernel up");
        assert_eq!(clock.now(), Duration::ZERO);

        assert!(stream.next_available(Duration::from_secs(1)).is_none());
        assert_eq!(clock.now(), Duration::from_secs(1));

        let second = stream.next_available(Duration::from_secs(5)).unwrap();
        assert_eq!(second.payload, "state RUNNING");
        assert_eq!(clock.now(), Duration::from_millis(2500));
    }

    #[test]
    fn test_subscription_criteria() {
        let clock = ManualClock::new();
        let broker = ReplayBroker::from_records(records(), Pacing::Immediate, clock.shared());
        let mut stream = broker
            .subscribe(&[ChannelFilter::new("SYS", "BOOT")])
            .unwrap();
        assert_eq!(stream.pending(), 2);
        assert_eq!(
            stream.next_available(Duration::ZERO).unwrap().payload,
            "kernel up"
        );
        assert_eq!(
            stream.next_available(Duration::ZERO).unwrap().payload,
            "userspace up"
        );
        assert!(stream.is_exhausted());
        assert!(stream.next_available(Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_arrivals_relative_to_subscription() {
        let clock = ManualClock::starting_at(Duration::from_secs(100));
        let mut broker = ReplayBroker::new(clock.shared());
        broker.push_at(Duration::from_secs(3), LogRecord::new(0.0, "A", "B", "late"));
        broker.push_at(Duration::from_secs(1), LogRecord::new(0.0, "A", "B", "early"));

        let mut stream = broker.subscribe(&[]).unwrap();
        assert_eq!(stream.next_available(Duration::from_secs(10)).unwrap().payload, "early");
        assert_eq!(clock.now(), Duration::from_secs(101));
        assert_eq!(stream.next_available(Duration::from_secs(10)).unwrap().payload, "late");
        assert_eq!(clock.now(), Duration::from_secs(103));
    }

    #[test]
    fn test_realtime_pacing_keeps_file_order_across_boots() {
        let text = "\
0.1 SYS BOOT boot1 kernel
0.9 SYS BOOT boot1 noise
3.0 SYS BOOT boot1 map
0.12 SYS BOOT boot2 kernel
2.6 SYS BOOT boot2 map
";
        let clock = ManualClock::new();
        let broker =
            ReplayBroker::from_reader(text.as_bytes(), Pacing::Realtime, clock.shared()).unwrap();
        let mut stream = broker.subscribe(&[]).unwrap();

        let mut delivered = Vec::new();
        while let Some(record) = stream.next_available(Duration::from_secs(10)) {
            delivered.push(record.payload);
        }
        assert_eq!(
            delivered,
            vec!["boot1 kernel", "boot1 noise", "boot1 map", "boot2 kernel", "boot2 map"]
        );
        // 2.9s for the first boot, nothing for the reset, 2.48s for the second
        let elapsed = clock.now().as_secs_f64();
        assert!((elapsed - 5.38).abs() < 1e-6, "clock at {:?}", clock.now());
    }

    #[test]
    fn test_from_reader_skips_comments_and_bad_lines() {
        let text = "# recorded on rack 4\n\n1.0 SYS BOOT first\nnot a record\n2.0 SYS BOOT second\n";
        let clock = ManualClock::new();
        let broker =
            ReplayBroker::from_reader(text.as_bytes(), Pacing::Immediate, clock.shared()).unwrap();
        assert_eq!(broker.len(), 2);
    }
}
