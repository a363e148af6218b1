//! Stream ordering buffer - bounded out-of-order absorption
//!
//! Upstream producers deliver events slightly out of order (venue clock
//! skew, reconnect replay). Per (provider, symbol, kind) stream this buffer
//! holds events keyed by their provider sequence number and releases a
//! monotone prefix, waiting at most `lateness_tolerance` for a missing
//! number and never holding more than `max_buffer_size` events per stream.
//!
//! # Release rule
//!
//! A sliding expected-next counter is kept per stream. The smallest
//! buffered sequence number is released while
//!
//! - it equals the expected next sequence, or
//! - it has waited longer than the lateness tolerance, or
//! - the stream buffer is over capacity.
//!
//! On release the expected counter slides to `released + 1` (never
//! backwards). Duplicate sequence numbers inside the buffer collapse to
//! the latest-`ingest_ts` copy; the loser goes back to the pool.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::clock::Clock;
use crate::config::OrderingConfig;
use crate::core_types::SeqNum;
use crate::event::{Event, StreamKey};
use crate::pool::Recycler;
use crate::stats::PipelineStats;

struct BufferedEvent {
    event: Box<Event>,
    arrival: Instant,
}

struct StreamBuffer {
    entries: BTreeMap<SeqNum, BufferedEvent>,
    /// Expected next sequence. Streams are sequenced from 1 upstream.
    next_seq: SeqNum,
}

impl StreamBuffer {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 1,
        }
    }
}

/// Partitioned reorder buffer. One logical buffer per [`StreamKey`];
/// the map shards its locks, keeping contention per-partition.
pub struct OrderingBuffer {
    streams: DashMap<StreamKey, StreamBuffer>,
    lateness_tolerance: Duration,
    max_buffer_size: usize,
    clock: Clock,
    recycler: Arc<Recycler>,
    stats: Arc<PipelineStats>,
}

impl OrderingBuffer {
    pub fn new(
        config: &OrderingConfig,
        clock: Clock,
        recycler: Arc<Recycler>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            streams: DashMap::new(),
            lateness_tolerance: config.lateness_tolerance(),
            max_buffer_size: config.max_buffer_size,
            clock,
            recycler,
            stats,
        }
    }

    /// Insert an event and release any now-ready prefix for its stream.
    ///
    /// Ownership of `event` moves into the buffer; it comes back to the
    /// caller through the ready list (possibly immediately). The flag is
    /// true when the event is still held by the buffer afterwards.
    pub fn on_event(&self, event: Box<Event>) -> (Vec<Box<Event>>, bool) {
        let key = StreamKey::of(&event);
        let seq = event.seq_provider;
        let now = self.clock.now();

        let mut stream = self.streams.entry(key).or_insert_with(StreamBuffer::new);

        // Collapse in-buffer duplicates: keep the latest-ingest_ts copy.
        if let Some(existing) = stream.entries.get(&seq) {
            if existing.event.ingest_ts >= event.ingest_ts {
                self.recycler.recycle_event(event);
                let ready = self.release_ready(&mut stream, now);
                return (ready, false);
            }
            let loser = stream.entries.remove(&seq).expect("entry just observed");
            self.recycler.recycle_event(loser.event);
        }

        stream.entries.insert(
            seq,
            BufferedEvent {
                event,
                arrival: now,
            },
        );

        let ready = self.release_ready(&mut stream, now);
        let buffered = stream.entries.contains_key(&seq);
        if buffered {
            PipelineStats::incr(&self.stats.buffered);
        }
        (ready, buffered)
    }

    /// Periodic flush: apply the release rule at `now`, and fully drain any
    /// stream that has reached its capacity.
    pub fn flush(&self) -> Vec<Box<Event>> {
        let now = self.clock.now();
        let mut ready = Vec::new();
        for mut stream in self.streams.iter_mut() {
            ready.extend(self.release_ready(&mut stream, now));
            if stream.entries.len() >= self.max_buffer_size {
                ready.extend(Self::pop_all(&mut stream, &self.stats));
            }
        }
        ready
    }

    /// Synchronous terminal flush: every buffered event, in per-stream
    /// sequence order. The caller owns their lifecycle thereafter.
    pub fn drain(&self) -> Vec<Box<Event>> {
        let mut remaining = Vec::new();
        for mut stream in self.streams.iter_mut() {
            remaining.extend(Self::pop_all(&mut stream, &self.stats));
        }
        remaining
    }

    /// Current buffer size for one stream, for metrics.
    pub fn depth(&self, key: &StreamKey) -> usize {
        self.streams.get(key).map_or(0, |s| s.entries.len())
    }

    /// Buffered events across all streams.
    pub fn total_depth(&self) -> usize {
        self.streams.iter().map(|s| s.entries.len()).sum()
    }

    fn release_ready(&self, stream: &mut StreamBuffer, now: Instant) -> Vec<Box<Event>> {
        let mut ready = Vec::new();
        loop {
            let Some((&seq, entry)) = stream.entries.first_key_value() else {
                break;
            };
            let in_order = seq == stream.next_seq;
            let expired = now.duration_since(entry.arrival) > self.lateness_tolerance;
            let over_capacity = stream.entries.len() > self.max_buffer_size;
            if !(in_order || expired || over_capacity) {
                break;
            }

            let released = stream.entries.remove(&seq).expect("first entry present");
            stream.next_seq = stream.next_seq.max(seq + 1);
            if in_order {
                PipelineStats::incr(&self.stats.released_in_order);
            } else {
                PipelineStats::incr(&self.stats.released_late);
            }
            ready.push(released.event);
        }
        ready
    }

    fn pop_all(stream: &mut StreamBuffer, stats: &PipelineStats) -> Vec<Box<Event>> {
        let mut ready = Vec::new();
        while let Some((&seq, _)) = stream.entries.first_key_value() {
            let released = stream.entries.remove(&seq).expect("first entry present");
            stream.next_seq = stream.next_seq.max(seq + 1);
            PipelineStats::incr(&stats.released_late);
            ready.push(released.event);
        }
        ready
    }
}

impl std::fmt::Debug for OrderingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderingBuffer")
            .field("streams", &self.streams.len())
            .field("lateness_tolerance", &self.lateness_tolerance)
            .field("max_buffer_size", &self.max_buffer_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::PoolConfig;
    use crate::event::EventKind;
    use chrono::TimeZone;

    struct Fixture {
        buffer: OrderingBuffer,
        recycler: Arc<Recycler>,
        driver: ManualClock,
    }

    fn fixture(config: OrderingConfig) -> Fixture {
        let (clock, driver) = Clock::manual();
        let recycler = Recycler::new(&PoolConfig {
            max_cached: 256,
            debug_checks: true,
        });
        let stats = Arc::new(PipelineStats::new());
        let buffer = OrderingBuffer::new(&config, clock, Arc::clone(&recycler), stats);
        Fixture {
            buffer,
            recycler,
            driver,
        }
    }

    fn event(fx: &Fixture, seq: SeqNum) -> Box<Event> {
        let mut event = fx.recycler.checkout_event();
        event.provider = "binance".to_string();
        event.symbol = "BTC-USDT".to_string();
        event.kind = EventKind::Trade;
        event.seq_provider = seq;
        event.ingest_ts = chrono::Utc
            .timestamp_millis_opt(1_700_000_000_000 + seq as i64)
            .unwrap();
        event
    }

    fn seqs(events: &[Box<Event>]) -> Vec<SeqNum> {
        events.iter().map(|e| e.seq_provider).collect()
    }

    fn recycle_all(fx: &Fixture, events: Vec<Box<Event>>) {
        fx.recycler.recycle_events(events.into_iter().map(Some));
    }

    #[test]
    fn test_out_of_order_burst_released_in_order() {
        // seq 2, 1, 3 arriving close together come out 1, 2, 3
        let fx = fixture(OrderingConfig::default());

        let (ready, buffered) = fx.buffer.on_event(event(&fx, 2));
        assert!(ready.is_empty());
        assert!(buffered);

        fx.driver.advance(Duration::from_millis(10));
        let (ready, buffered) = fx.buffer.on_event(event(&fx, 1));
        assert_eq!(seqs(&ready), vec![1, 2]);
        assert!(!buffered);
        recycle_all(&fx, ready);

        let (ready, _) = fx.buffer.on_event(event(&fx, 3));
        assert_eq!(seqs(&ready), vec![3]);
        recycle_all(&fx, ready);
    }

    #[test]
    fn test_late_event_escapes_after_tolerance() {
        // a gap ahead of seq 5 is given up after the lateness tolerance
        let fx = fixture(OrderingConfig::default());

        let (ready, buffered) = fx.buffer.on_event(event(&fx, 5));
        assert!(ready.is_empty());
        assert!(buffered);

        fx.driver.advance(Duration::from_millis(200));
        let ready = fx.buffer.flush();
        assert_eq!(seqs(&ready), vec![5]);
        recycle_all(&fx, ready);

        // the expected counter slid past the released number
        let (ready, _) = fx.buffer.on_event(event(&fx, 6));
        assert_eq!(seqs(&ready), vec![6]);
        recycle_all(&fx, ready);
    }

    #[test]
    fn test_flush_within_tolerance_holds() {
        let fx = fixture(OrderingConfig::default());
        let (ready, _) = fx.buffer.on_event(event(&fx, 5));
        assert!(ready.is_empty());

        fx.driver.advance(Duration::from_millis(100));
        assert!(fx.buffer.flush().is_empty());
        assert_eq!(fx.buffer.total_depth(), 1);

        recycle_all(&fx, fx.buffer.drain());
    }

    #[test]
    fn test_duplicate_seq_collapses_to_latest_ingest() {
        let fx = fixture(OrderingConfig::default());

        let (ready, _) = fx.buffer.on_event(event(&fx, 2));
        assert!(ready.is_empty());

        // same seq, later ingest_ts wins
        let mut newer = event(&fx, 2);
        newer.ingest_ts = chrono::Utc
            .timestamp_millis_opt(1_700_000_999_000)
            .unwrap();
        let marker = newer.ingest_ts;
        let (ready, _) = fx.buffer.on_event(newer);
        assert!(ready.is_empty());

        // same seq, older ingest_ts loses
        let (ready, buffered) = fx.buffer.on_event(event(&fx, 2));
        assert!(ready.is_empty());
        assert!(!buffered);

        let key = StreamKey {
            provider: "binance".to_string(),
            symbol: "BTC-USDT".to_string(),
            kind: EventKind::Trade,
        };
        assert_eq!(fx.buffer.depth(&key), 1);

        let remaining = fx.buffer.drain();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].ingest_ts, marker);
        // both losers went back to the pool
        assert_eq!(fx.recycler.stats().events.recycles, 2);
        recycle_all(&fx, remaining);
    }

    #[test]
    fn test_capacity_forces_release() {
        let fx = fixture(OrderingConfig {
            max_buffer_size: 4,
            ..OrderingConfig::default()
        });

        // seq 1 never arrives; 2..=5 fill the buffer
        for seq in 2..=5 {
            let (ready, _) = fx.buffer.on_event(event(&fx, seq));
            assert!(ready.is_empty());
        }
        // the sixth entry pushes the stream over capacity
        let (ready, _) = fx.buffer.on_event(event(&fx, 6));
        assert_eq!(seqs(&ready), vec![2, 3, 4, 5, 6]);
        recycle_all(&fx, ready);
    }

    #[test]
    fn test_streams_are_isolated() {
        let fx = fixture(OrderingConfig::default());

        let (ready, _) = fx.buffer.on_event(event(&fx, 2));
        assert!(ready.is_empty());

        // a different provider's stream starts at its own seq 1
        let mut other = event(&fx, 1);
        other.provider = "okx".to_string();
        let (ready, _) = fx.buffer.on_event(other);
        assert_eq!(seqs(&ready), vec![1]);
        recycle_all(&fx, ready);

        assert_eq!(fx.buffer.total_depth(), 1);
        recycle_all(&fx, fx.buffer.drain());
    }

    #[test]
    fn test_drain_returns_everything_in_seq_order() {
        let fx = fixture(OrderingConfig::default());
        for seq in [9, 4, 7] {
            let (ready, _) = fx.buffer.on_event(event(&fx, seq));
            assert!(ready.is_empty());
        }
        let drained = fx.buffer.drain();
        assert_eq!(seqs(&drained), vec![4, 7, 9]);
        assert_eq!(fx.buffer.total_depth(), 0);
        recycle_all(&fx, drained);
    }
}
