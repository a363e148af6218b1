//! Orchestrator - snapshot/delta fusion, routing-version stamping,
//! throttled fused emission
//!
//! Three cooperating pieces share the canonical stream:
//!
//! - the [`store::SnapshotStore`] holds CAS-versioned state per
//!   (market, instrument, canonical_type);
//! - the [`stamp::VersionStamper`] stamps the control plane's current
//!   routing version onto everything emitted downstream;
//! - the [`throttle::EmitThrottle`] spaces fused emissions per instrument.
//!
//! An `ORDERBOOK.SNAPSHOT` frame replaces the stored record (version back
//! to 1). An `ORDERBOOK.DELTA` frame is fused into the stored snapshot
//! through a CAS retry loop; losing a race re-reads and reapplies, and
//! exhausting the retries surfaces a conflict. Everything else forwards
//! straight to the bus with a stamped routing version.

pub mod stamp;
pub mod store;
pub mod throttle;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::bus::EventBus;
use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::error::CoreError;
use crate::event::{BookLevel, BookSnapshotData, EventKind, Payload};
use crate::pool::Recycler;
use crate::shutdown::Shutdown;
use crate::stats::PipelineStats;

use stamp::VersionStamper;
use store::{SnapshotKey, SnapshotRecord, SnapshotStore};
use throttle::EmitThrottle;

const SNAPSHOT_TYPE: &str = "ORDERBOOK.SNAPSHOT";
const DELTA_TYPE: &str = "ORDERBOOK.DELTA";

/// One frame of the canonical stream as the orchestrator sees it:
/// identity tags plus the opaque fused-state document.
#[derive(Debug, Clone)]
pub struct FusionFrame {
    pub market: String,
    pub instrument: String,
    pub canonical_type: String,
    /// Contributing venue.
    pub source: String,
    pub ts: DateTime<Utc>,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub trace_id: Option<String>,
}

/// Merge/stamp/throttle engine over the canonical stream.
pub struct Orchestrator {
    store: SnapshotStore,
    stamper: Arc<VersionStamper>,
    throttle: EmitThrottle,
    config: OrchestratorConfig,
    recycler: Arc<Recycler>,
    bus: Arc<EventBus>,
    stats: Arc<PipelineStats>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        clock: Clock,
        recycler: Arc<Recycler>,
        bus: Arc<EventBus>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            store: SnapshotStore::new(),
            stamper: Arc::new(VersionStamper::new(0)),
            throttle: EmitThrottle::new(config.emit_interval(), clock),
            config,
            recycler,
            bus,
            stats,
        }
    }

    /// Shared stamper handle for the control plane (sole writer).
    pub fn stamper(&self) -> Arc<VersionStamper> {
        Arc::clone(&self.stamper)
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Process one frame of the canonical stream.
    pub fn handle(&self, frame: &FusionFrame) -> Result<(), CoreError> {
        match frame.canonical_type.as_str() {
            SNAPSHOT_TYPE => {
                let key = self.snapshot_key(frame);
                self.store.put(key, frame.data.clone(), &frame.source, frame.ts, None);
                PipelineStats::incr(&self.stats.snapshots_put);
                let record = self.store.get(&self.snapshot_key(frame))?;
                self.emit(frame, &record)
            }
            DELTA_TYPE => self.fuse_delta(frame),
            _ => self.forward(frame),
        }
    }

    /// Fuse a delta into the stored snapshot under CAS, retrying a bounded
    /// number of times when another writer got there first.
    fn fuse_delta(&self, frame: &FusionFrame) -> Result<(), CoreError> {
        let key = self.snapshot_key(frame);

        for _ in 0..=self.config.cas_retry_limit {
            let current = match self.store.get(&key) {
                Ok(current) => current,
                Err(error) => {
                    // no snapshot yet: the delta has nothing to fuse into
                    PipelineStats::incr(&self.stats.deltas_dropped);
                    return Err(error);
                }
            };

            if self.config.reject_stale_deltas && frame.ts < current.updated_at {
                PipelineStats::incr(&self.stats.deltas_dropped);
                tracing::debug!(
                    instrument = %frame.instrument,
                    provider = %frame.source,
                    "stale delta rejected"
                );
                return Ok(());
            }

            let mut updated = current.clone();
            updated.seq = current.seq + 1;
            updated.updated_at = frame.ts;
            if !updated.providers.contains(&frame.source) {
                updated.providers.push(frame.source.clone());
            }
            Self::apply_delta(&mut updated, frame)?;

            match self.store.compare_and_swap(&key, current.version, updated) {
                Ok(_) => {
                    PipelineStats::incr(&self.stats.deltas_fused);
                    let record = self.store.get(&key)?;
                    return self.emit(frame, &record);
                }
                Err(CoreError::Conflict(_)) => {
                    PipelineStats::incr(&self.stats.cas_conflicts);
                    continue;
                }
                Err(error) => return Err(error),
            }
        }

        Err(CoreError::Conflict(format!(
            "cas retries exceeded for {key}",
            key = self.snapshot_key(frame)
        )))
    }

    /// Top-of-book application: a bid delta rewrites topBid/bidQty, an ask
    /// delta rewrites topAsk/askQty.
    fn apply_delta(record: &mut SnapshotRecord, frame: &FusionFrame) -> Result<(), CoreError> {
        let field = |name: &str| -> Result<serde_json::Value, CoreError> {
            frame
                .data
                .get(name)
                .cloned()
                .ok_or_else(|| CoreError::Invalid(format!("delta missing {name:?}")))
        };
        let side = field("side")?;
        let price = field("price")?;
        let qty = field("qty")?;

        match side.as_str() {
            Some("bid") => {
                record.data.insert("topBid".to_string(), price);
                record.data.insert("bidQty".to_string(), qty);
            }
            Some("ask") => {
                record.data.insert("topAsk".to_string(), price);
                record.data.insert("askQty".to_string(), qty);
            }
            _ => {
                return Err(CoreError::Invalid(format!(
                    "delta side must be \"bid\" or \"ask\", got {side}"
                )));
            }
        }
        Ok(())
    }

    /// Decorate the fused record as a merged canonical event and publish.
    /// Emissions per instrument are spaced by the throttle; losers are
    /// dropped, not re-queued.
    fn emit(&self, frame: &FusionFrame, record: &SnapshotRecord) -> Result<(), CoreError> {
        if !self.throttle.allow(&frame.instrument) {
            PipelineStats::incr(&self.stats.throttled);
            return Ok(());
        }

        let mut merged = self.recycler.checkout_merged();
        merged.event.event_id = format!(
            "{}:{}:merge:{}",
            frame.instrument, SNAPSHOT_TYPE, record.seq
        );
        merged.event.provider = frame.source.clone();
        merged.event.symbol = frame.instrument.clone();
        merged.event.kind = EventKind::BookSnapshot;
        merged.event.seq_provider = record.seq;
        merged.event.ingest_ts = record.updated_at;
        merged.event.emit_ts = Utc::now().max(record.updated_at);
        merged.event.trace_id = frame.trace_id.clone();
        merged.event.payload = Self::snapshot_payload(record);
        self.stamper.stamp(&mut merged.event);
        merged.source_providers.extend(record.providers.iter().cloned());
        merged.merge_window_id = uuid::Uuid::new_v4().to_string();

        let published = self.bus.publish(&merged.event);
        self.recycler.recycle_merged(merged);
        published
    }

    /// Forward a non-book frame to the bus as a plain canonical event with
    /// a freshly stamped routing version. Covers the whole canonical-type
    /// taxonomy through the shared payload construction; critical kinds
    /// are never throttled.
    fn forward(&self, frame: &FusionFrame) -> Result<(), CoreError> {
        let Some(kind) = EventKind::from_canonical(&frame.canonical_type) else {
            return Err(CoreError::Invalid(format!(
                "unknown canonical type {:?}",
                frame.canonical_type
            )));
        };
        if !kind.is_critical() && !self.throttle.allow(&frame.instrument) {
            PipelineStats::incr(&self.stats.throttled);
            return Ok(());
        }

        let payload = crate::ingest::payload_from_document(
            kind,
            &serde_json::Value::Object(frame.data.clone()),
            &self.recycler,
        )?;

        let mut event = self.recycler.checkout_event();
        event.event_id = format!("{}:{}:fwd", frame.instrument, frame.canonical_type);
        event.provider = frame.source.clone();
        event.symbol = frame.instrument.clone();
        event.kind = kind;
        event.ingest_ts = frame.ts;
        event.emit_ts = Utc::now().max(frame.ts);
        event.trace_id = frame.trace_id.clone();
        event.payload = payload;
        self.stamper.stamp(&mut event);

        let published = self.bus.publish(&event);
        self.recycler.recycle_event(event);
        published
    }

    /// Materialise the fused record as a book payload. A record carrying
    /// full sides deserialises directly; otherwise the top-of-book fields
    /// are projected into single-level sides.
    fn snapshot_payload(record: &SnapshotRecord) -> Payload {
        if record.data.contains_key("bids") || record.data.contains_key("asks") {
            if let Ok(book) = serde_json::from_value::<BookSnapshotData>(
                serde_json::Value::Object(record.data.clone()),
            ) {
                return Payload::BookSnapshot(book);
            }
        }

        let text = |name: &str| {
            record
                .data
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let side = |price: String, qty: String| {
            if price.is_empty() {
                Vec::new()
            } else {
                vec![BookLevel { price, qty }]
            }
        };
        Payload::BookSnapshot(BookSnapshotData {
            bids: side(text("topBid"), text("bidQty")),
            asks: side(text("topAsk"), text("askQty")),
            checksum: String::new(),
            last_update: record.updated_at.timestamp_millis(),
            first_update_id: record.seq,
            final_update_id: record.seq,
        })
    }

    fn snapshot_key(&self, frame: &FusionFrame) -> SnapshotKey {
        SnapshotKey {
            market: frame.market.clone(),
            instrument: frame.instrument.clone(),
            canonical_type: SNAPSHOT_TYPE.to_string(),
        }
    }

    /// Consume the fusion stream until it closes or shutdown fires.
    /// Per-frame errors are logged and never stop the loop.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<FusionFrame>,
        shutdown: Shutdown,
    ) {
        loop {
            let frame = tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };
            if let Err(error) = self.handle(&frame) {
                tracing::warn!(
                    market = %frame.market,
                    instrument = %frame.instrument,
                    canonical_type = %frame.canonical_type,
                    provider = %frame.source,
                    %error,
                    "fusion frame failed"
                );
            }
        }
        tracing::debug!("orchestrator stopped");
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("snapshots", &self.store.len())
            .field("routing_version", &self.stamper.current_version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use serde_json::json;

    struct Fixture {
        orchestrator: Arc<Orchestrator>,
        bus: Arc<EventBus>,
        recycler: Arc<Recycler>,
        stats: Arc<PipelineStats>,
    }

    fn fixture(config: OrchestratorConfig) -> Fixture {
        let recycler = Recycler::new(&PoolConfig {
            max_cached: 64,
            debug_checks: true,
        });
        let stats = Arc::new(PipelineStats::new());
        let bus = EventBus::new(64, Arc::clone(&recycler));
        let orchestrator = Arc::new(Orchestrator::new(
            config,
            Clock::system(),
            Arc::clone(&recycler),
            Arc::clone(&bus),
            Arc::clone(&stats),
        ));
        Fixture {
            orchestrator,
            bus,
            recycler,
            stats,
        }
    }

    fn object(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        let serde_json::Value::Object(map) = value else {
            panic!("expected object")
        };
        map
    }

    fn snapshot_frame() -> FusionFrame {
        FusionFrame {
            market: "spot".to_string(),
            instrument: "BTC-USDT".to_string(),
            canonical_type: SNAPSHOT_TYPE.to_string(),
            source: "binance".to_string(),
            ts: Utc::now(),
            data: object(json!({
                "topBid": "42000.0", "bidQty": "1.5",
                "topAsk": "42001.0", "askQty": "2.0",
            })),
            trace_id: Some("t-1".to_string()),
        }
    }

    fn delta_frame(side: &str, price: &str, qty: &str) -> FusionFrame {
        FusionFrame {
            market: "spot".to_string(),
            instrument: "BTC-USDT".to_string(),
            canonical_type: DELTA_TYPE.to_string(),
            source: "binance".to_string(),
            ts: Utc::now(),
            data: object(json!({"side": side, "price": price, "qty": qty})),
            trace_id: None,
        }
    }

    #[test]
    fn test_snapshot_then_delta_fuses() {
        let fx = fixture(OrchestratorConfig::default());
        let (_id, mut rx) = fx.bus.subscribe(EventKind::BookSnapshot).unwrap();

        fx.orchestrator.handle(&snapshot_frame()).unwrap();
        fx.orchestrator
            .handle(&delta_frame("bid", "42005.0", "0.7"))
            .unwrap();

        let key = SnapshotKey {
            market: "spot".to_string(),
            instrument: "BTC-USDT".to_string(),
            canonical_type: SNAPSHOT_TYPE.to_string(),
        };
        let record = fx.orchestrator.store().get(&key).unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.seq, 2);
        assert_eq!(record.data.get("topBid").unwrap(), "42005.0");
        // ask side untouched
        assert_eq!(record.data.get("topAsk").unwrap(), "42001.0");
        assert_eq!(record.providers, vec!["binance".to_string()]);

        // two fused emissions reached the bus
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.kind, EventKind::BookSnapshot);
        let Payload::BookSnapshot(book) = &second.payload else {
            panic!("expected book payload");
        };
        assert_eq!(book.bids[0].price, "42005.0");
        fx.recycler.recycle_event(first);
        fx.recycler.recycle_event(second);
        assert_eq!(fx.recycler.outstanding(), 0);
    }

    #[test]
    fn test_delta_without_snapshot_drops() {
        let fx = fixture(OrchestratorConfig::default());
        let err = fx
            .orchestrator
            .handle(&delta_frame("bid", "1", "1"))
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        assert_eq!(fx.stats.snapshot().deltas_dropped, 1);
    }

    #[test]
    fn test_concurrent_deltas_both_land() {
        let fx = fixture(OrchestratorConfig::default());
        fx.orchestrator.handle(&snapshot_frame()).unwrap();

        let mut handles = vec![];
        for (side, price) in [("bid", "42010.0"), ("ask", "42011.0")] {
            let orchestrator = Arc::clone(&fx.orchestrator);
            let frame = delta_frame(side, price, "1.0");
            handles.push(std::thread::spawn(move || orchestrator.handle(&frame)));
        }
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let key = SnapshotKey {
            market: "spot".to_string(),
            instrument: "BTC-USDT".to_string(),
            canonical_type: SNAPSHOT_TYPE.to_string(),
        };
        let record = fx.orchestrator.store().get(&key).unwrap();
        // both deltas applied, one version bump each
        assert_eq!(record.version, 3);
        assert_eq!(record.data.get("topBid").unwrap(), "42010.0");
        assert_eq!(record.data.get("topAsk").unwrap(), "42011.0");
    }

    #[test]
    fn test_cross_provider_delta_extends_source_providers() {
        let fx = fixture(OrchestratorConfig::default());
        let (_id, mut rx) = fx.bus.subscribe(EventKind::BookSnapshot).unwrap();

        fx.orchestrator.handle(&snapshot_frame()).unwrap();
        let mut okx_delta = delta_frame("ask", "42002.5", "0.9");
        okx_delta.source = "okx".to_string();
        fx.orchestrator.handle(&okx_delta).unwrap();

        let key = SnapshotKey {
            market: "spot".to_string(),
            instrument: "BTC-USDT".to_string(),
            canonical_type: SNAPSHOT_TYPE.to_string(),
        };
        let record = fx.orchestrator.store().get(&key).unwrap();
        assert_eq!(
            record.providers,
            vec!["binance".to_string(), "okx".to_string()]
        );

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        fx.recycler.recycle_event(first);
        fx.recycler.recycle_event(second);
        // merged wrappers were recycled by emit; pool balanced
        assert_eq!(fx.recycler.outstanding(), 0);
    }

    #[test]
    fn test_routing_version_is_stamped() {
        let fx = fixture(OrchestratorConfig::default());
        let (_id, mut rx) = fx.bus.subscribe(EventKind::BookSnapshot).unwrap();

        fx.orchestrator.stamper().update_version(17);
        fx.orchestrator.handle(&snapshot_frame()).unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.routing_version, 17);
        assert_eq!(event.kind, EventKind::BookSnapshot);
        assert!(event.payload_matches_kind());
        fx.recycler.recycle_event(event);
    }

    #[test]
    fn test_throttle_drops_rapid_emissions() {
        let fx = fixture(OrchestratorConfig {
            emit_interval_ms: 60_000,
            ..OrchestratorConfig::default()
        });
        let (_id, mut rx) = fx.bus.subscribe(EventKind::BookSnapshot).unwrap();

        fx.orchestrator.handle(&snapshot_frame()).unwrap();
        fx.orchestrator
            .handle(&delta_frame("bid", "42002.0", "1"))
            .unwrap();

        // only the first emission passed; the delta was fused but its
        // emission throttled
        let event = rx.try_recv().unwrap();
        fx.recycler.recycle_event(event);
        assert!(rx.try_recv().is_err());
        assert_eq!(fx.stats.snapshot().throttled, 1);
        assert_eq!(fx.stats.snapshot().deltas_fused, 1);
    }

    #[test]
    fn test_stale_delta_rejected_when_strict() {
        let fx = fixture(OrchestratorConfig {
            reject_stale_deltas: true,
            ..OrchestratorConfig::default()
        });
        fx.orchestrator.handle(&snapshot_frame()).unwrap();

        let mut old = delta_frame("bid", "41990.0", "1");
        old.ts = Utc::now() - chrono::Duration::seconds(30);
        fx.orchestrator.handle(&old).unwrap();

        let key = SnapshotKey {
            market: "spot".to_string(),
            instrument: "BTC-USDT".to_string(),
            canonical_type: SNAPSHOT_TYPE.to_string(),
        };
        // unchanged: the stale delta was dropped
        let record = fx.orchestrator.store().get(&key).unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(fx.stats.snapshot().deltas_dropped, 1);
    }

    fn exec_report_frame() -> FusionFrame {
        FusionFrame {
            market: "spot".to_string(),
            instrument: "BTC-USDT".to_string(),
            canonical_type: "EXEC.REPORT".to_string(),
            source: "binance".to_string(),
            ts: Utc::now(),
            data: object(json!({
                "clientOrderId": "c-9",
                "exchangeOrderId": "x-9",
                "state": "PARTIAL",
                "side": "Buy",
                "orderType": "LIMIT",
                "price": "42000.00",
                "quantity": "2",
                "filledQty": "1",
                "remainingQty": "1",
                "avgFillPrice": "42000.00",
                "timestamp": 1_700_000_000_000i64,
            })),
            trace_id: Some("t-exec".to_string()),
        }
    }

    #[test]
    fn test_exec_report_frame_forwards_as_critical() {
        let fx = fixture(OrchestratorConfig::default());
        let (_id, mut rx) = fx.bus.subscribe(EventKind::ExecReport).unwrap();
        fx.orchestrator.stamper().update_version(11);

        fx.orchestrator.handle(&exec_report_frame()).unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::ExecReport);
        assert!(event.kind.is_critical());
        assert_eq!(event.routing_version, 11);
        assert!(event.payload_matches_kind());
        let Payload::ExecReport(report) = &event.payload else {
            panic!("expected exec report payload");
        };
        assert_eq!(report.client_order_id, "c-9");
        fx.recycler.recycle_event(event);
        assert_eq!(fx.recycler.outstanding(), 0);
    }

    #[test]
    fn test_critical_forward_bypasses_throttle() {
        let fx = fixture(OrchestratorConfig {
            emit_interval_ms: 60_000,
            ..OrchestratorConfig::default()
        });
        let (_id, mut book_rx) = fx.bus.subscribe(EventKind::BookSnapshot).unwrap();
        let (_id, mut exec_rx) = fx.bus.subscribe(EventKind::ExecReport).unwrap();

        // the snapshot emission consumes the instrument's throttle slot
        fx.orchestrator.handle(&snapshot_frame()).unwrap();
        let book = book_rx.try_recv().unwrap();
        fx.recycler.recycle_event(book);

        // an exec report on the same instrument still goes through
        fx.orchestrator.handle(&exec_report_frame()).unwrap();
        let report = exec_rx.try_recv().unwrap();
        assert_eq!(report.kind, EventKind::ExecReport);
        fx.recycler.recycle_event(report);
        assert_eq!(fx.stats.snapshot().throttled, 0);
    }

    #[test]
    fn test_balance_update_frame_forwards() {
        let fx = fixture(OrchestratorConfig::default());
        let (_id, mut rx) = fx.bus.subscribe(EventKind::BalanceUpdate).unwrap();

        let frame = FusionFrame {
            market: "spot".to_string(),
            instrument: "BTC-USDT".to_string(),
            canonical_type: "BALANCE.UPDATE".to_string(),
            source: "binance".to_string(),
            ts: Utc::now(),
            data: object(json!({
                "currency": "USDT",
                "total": "1000.00",
                "available": "750.00",
                "timestamp": 1_700_000_000_000i64,
            })),
            trace_id: None,
        };
        fx.orchestrator.handle(&frame).unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::BalanceUpdate);
        assert!(event.payload_matches_kind());
        fx.recycler.recycle_event(event);
    }

    #[test]
    fn test_trade_frame_forwards_with_stamp() {
        let fx = fixture(OrchestratorConfig::default());
        let (_id, mut rx) = fx.bus.subscribe(EventKind::Trade).unwrap();
        fx.orchestrator.stamper().update_version(5);

        let frame = FusionFrame {
            market: "spot".to_string(),
            instrument: "BTC-USDT".to_string(),
            canonical_type: "TRADE".to_string(),
            source: "okx".to_string(),
            ts: Utc::now(),
            data: object(json!({
                "tradeId": "t-1", "side": "Sell", "price": "42000.1",
                "quantity": "0.2", "timestamp": 1_700_000_000_000i64,
            })),
            trace_id: None,
        };
        fx.orchestrator.handle(&frame).unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::Trade);
        assert_eq!(event.routing_version, 5);
        assert_eq!(event.provider, "okx");
        fx.recycler.recycle_event(event);
    }
}
