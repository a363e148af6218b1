//! Canonical ingestor - raw adapter frames to canonical events
//!
//! Venue adapters hand over string-keyed [`RawInstance`] maps. The ingestor
//! validates them, consults the dispatch table (route + filters), assigns a
//! per-(type, instrument) sequence number, stamps the current table version
//! and emits a pool-allocated canonical [`Event`] onto the canonical stream.
//!
//! ```text
//! adapter → RawInstance → [validate → route/filter → seq → build] → Event
//! ```

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::CoreError;
use crate::event::{Event, EventKind, Payload};
use crate::pool::Recycler;
use crate::shutdown::Shutdown;
use crate::stats::PipelineStats;
use crate::table::DispatchTable;

// ============================================================
// RAW INSTANCE
// ============================================================

/// Raw adapter frame: a canonical type tag plus an opaque payload document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInstance {
    pub canonical_type: String,
    pub instrument: String,
    #[serde(default)]
    pub market: String,
    /// Source venue tag; becomes the event's provider.
    pub source: String,
    /// Venue event time, epoch milliseconds.
    pub ts: i64,
    /// Adapter receive time, epoch milliseconds.
    pub ingested_at: i64,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub trace_id: Option<String>,
}

impl RawInstance {
    /// String view of a field for filter evaluation. Top-level tags are
    /// checked first, then payload keys; scalar payload values are
    /// stringified.
    pub fn field_as_str(&self, field: &str) -> Option<String> {
        match field {
            "canonicalType" => Some(self.canonical_type.clone()),
            "instrument" => Some(self.instrument.clone()),
            "market" => Some(self.market.clone()),
            "source" => Some(self.source.clone()),
            "traceId" => self.trace_id.clone(),
            _ => match self.payload.get(field)? {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                serde_json::Value::Bool(b) => Some(b.to_string()),
                _ => None,
            },
        }
    }
}

// ============================================================
// INGESTOR
// ============================================================

/// Deserialize an opaque payload document into the typed variant for
/// `kind`. Shared by the ingestor and the orchestrator's forwarder.
/// Execution reports stage through the report pool; book snapshots are
/// rejected when their sides are out of order.
pub(crate) fn payload_from_document(
    kind: EventKind,
    document: &serde_json::Value,
    recycler: &Recycler,
) -> Result<Payload, CoreError> {
    let invalid = |e: serde_json::Error| CoreError::Invalid(format!("payload for {kind:?}: {e}"));

    let payload = match kind {
        EventKind::Unspecified => {
            return Err(CoreError::Invalid("zero event kind".to_string()));
        }
        EventKind::Trade => {
            Payload::Trade(serde_json::from_value(document.clone()).map_err(invalid)?)
        }
        EventKind::Ticker => {
            Payload::Ticker(serde_json::from_value(document.clone()).map_err(invalid)?)
        }
        EventKind::BookSnapshot => {
            let book: crate::event::BookSnapshotData =
                serde_json::from_value(document.clone()).map_err(invalid)?;
            if !book.sides_ordered() {
                return Err(CoreError::Invalid(
                    "book snapshot sides out of order".to_string(),
                ));
            }
            Payload::BookSnapshot(book)
        }
        EventKind::BookUpdate => {
            Payload::BookDelta(serde_json::from_value(document.clone()).map_err(invalid)?)
        }
        EventKind::ExecReport => {
            // Stage through the report pool; the wrapper goes back even
            // when the document is malformed.
            let mut report = recycler.checkout_exec_report();
            match serde_json::from_value(document.clone()) {
                Ok(data) => {
                    report.data = data;
                    let data = report.data.clone();
                    recycler.recycle_exec_report(report);
                    Payload::ExecReport(data)
                }
                Err(e) => {
                    recycler.recycle_exec_report(report);
                    return Err(invalid(e));
                }
            }
        }
        EventKind::KlineSummary => {
            Payload::KlineSummary(serde_json::from_value(document.clone()).map_err(invalid)?)
        }
        EventKind::InstrumentUpdate => {
            Payload::InstrumentUpdate(serde_json::from_value(document.clone()).map_err(invalid)?)
        }
        EventKind::BalanceUpdate => {
            Payload::BalanceUpdate(serde_json::from_value(document.clone()).map_err(invalid)?)
        }
        EventKind::RiskControl => {
            Payload::RiskControl(serde_json::from_value(document.clone()).map_err(invalid)?)
        }
        EventKind::ControlAck | EventKind::ControlResult => {
            Payload::Control(serde_json::from_value(document.clone()).map_err(invalid)?)
        }
    };
    Ok(payload)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeqKey {
    canonical_type: String,
    instrument: String,
}

/// Maps raw instances to canonical events. One ingestor task per adapter
/// stream; the sequence counters are loop-owned, no cross-task access.
#[derive(Debug)]
pub struct Ingestor {
    table: Arc<DispatchTable>,
    recycler: Arc<Recycler>,
    stats: Arc<PipelineStats>,
    seqs: FxHashMap<SeqKey, u64>,
}

impl Ingestor {
    pub fn new(
        table: Arc<DispatchTable>,
        recycler: Arc<Recycler>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            table,
            recycler,
            stats,
            seqs: FxHashMap::default(),
        }
    }

    /// Map one raw instance.
    ///
    /// - `Ok(Some(event))`: canonical event, caller owns it
    /// - `Ok(None)`: dropped (no route, or filters rejected)
    /// - `Err(Invalid)`: malformed input
    pub fn ingest(&mut self, raw: &RawInstance) -> Result<Option<Box<Event>>, CoreError> {
        PipelineStats::incr(&self.stats.raw_ingested);

        if raw.instrument.is_empty() {
            return Err(CoreError::Invalid("raw instance missing instrument".to_string()));
        }
        let Some(kind) = EventKind::from_canonical(&raw.canonical_type) else {
            return Err(CoreError::Invalid(format!(
                "unknown canonical type {:?}",
                raw.canonical_type
            )));
        };

        let Some(route) = self.table.get(&raw.canonical_type) else {
            PipelineStats::incr(&self.stats.dropped_no_route);
            return Ok(None);
        };
        if !route.accepts(raw) {
            PipelineStats::incr(&self.stats.dropped_filtered);
            return Ok(None);
        }

        let payload = payload_from_document(kind, &raw.payload, &self.recycler)?;

        let seq = {
            let key = SeqKey {
                canonical_type: raw.canonical_type.clone(),
                instrument: raw.instrument.clone(),
            };
            let counter = self.seqs.entry(key).or_insert(0);
            *counter += 1;
            *counter
        };

        let latency_ms = (raw.ingested_at - raw.ts).max(0) as u64;
        PipelineStats::add(&self.stats.ingest_latency_ms_sum, latency_ms);

        let mut event = self.recycler.checkout_event();
        event.event_id = format!("{}:{}:{}", raw.instrument, raw.canonical_type, seq);
        event.routing_version = self.table.version();
        event.provider = raw.source.clone();
        event.symbol = raw.instrument.clone();
        event.kind = kind;
        event.seq_provider = seq;
        event.ingest_ts = chrono::DateTime::from_timestamp_millis(raw.ingested_at)
            .unwrap_or_default();
        event.emit_ts = chrono::Utc::now().max(event.ingest_ts);
        event.trace_id = Some(
            raw.trace_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        );
        event.payload = payload;

        PipelineStats::incr(&self.stats.canonical_emitted);
        Ok(Some(event))
    }

    /// Consume raw instances until the input closes or shutdown fires,
    /// emitting canonical events downstream.
    pub async fn run(
        mut self,
        mut raw_rx: mpsc::Receiver<RawInstance>,
        canonical_tx: mpsc::Sender<Box<Event>>,
        shutdown: Shutdown,
    ) {
        loop {
            let raw = tokio::select! {
                raw = raw_rx.recv() => match raw {
                    Some(raw) => raw,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };

            match self.ingest(&raw) {
                Ok(Some(event)) => {
                    // A closed downstream hands the event back through the
                    // send error; recycle it and stop. A stopping
                    // dispatcher drops its receiver, so this cannot hang.
                    if let Err(send_error) = canonical_tx.send(event).await {
                        self.recycler.recycle_event(send_error.0);
                        break;
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(
                        canonical_type = %raw.canonical_type,
                        instrument = %raw.instrument,
                        provider = %raw.source,
                        %error,
                        "dropping malformed raw instance"
                    );
                }
            }
        }
        tracing::debug!("ingestor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::event::{ExecState, Side};
    use crate::table::RouteEntry;
    use serde_json::json;

    fn setup() -> (Arc<DispatchTable>, Ingestor) {
        let table = Arc::new(DispatchTable::new());
        let recycler = Recycler::new(&PoolConfig {
            max_cached: 16,
            debug_checks: true,
        });
        let stats = Arc::new(PipelineStats::new());
        let ingestor = Ingestor::new(Arc::clone(&table), recycler, stats);
        (table, ingestor)
    }

    fn trade_route() -> RouteEntry {
        RouteEntry {
            canonical_type: "TRADE".to_string(),
            provider: "binance".to_string(),
            ws_topics: vec![],
            rest_fns: vec![],
            filters: vec![],
        }
    }

    fn trade_raw() -> RawInstance {
        RawInstance {
            canonical_type: "TRADE".to_string(),
            instrument: "BTC-USDT".to_string(),
            market: "spot".to_string(),
            source: "binance".to_string(),
            ts: 1_700_000_000_000,
            ingested_at: 1_700_000_000_025,
            payload: json!({
                "tradeId": "t-100",
                "side": "Buy",
                "price": "42000.50",
                "quantity": "0.25",
                "timestamp": 1_700_000_000_000i64,
            }),
            trace_id: Some("trace-1".to_string()),
        }
    }

    #[test]
    fn test_ingest_builds_canonical_event() {
        let (table, mut ingestor) = setup();
        table.upsert(trade_route());

        let event = ingestor.ingest(&trade_raw()).unwrap().expect("event");
        assert_eq!(event.event_id, "BTC-USDT:TRADE:1");
        assert_eq!(event.kind, EventKind::Trade);
        assert_eq!(event.provider, "binance");
        assert_eq!(event.symbol, "BTC-USDT");
        assert_eq!(event.seq_provider, 1);
        assert_eq!(event.routing_version, table.version());
        assert_eq!(event.trace_id.as_deref(), Some("trace-1"));
        assert!(event.payload_matches_kind());

        let Payload::Trade(trade) = &event.payload else {
            panic!("expected trade payload");
        };
        assert_eq!(trade.price, "42000.50");
        assert_eq!(trade.side, Side::Buy);

        ingestor.recycler.recycle_event(event);
    }

    #[test]
    fn test_sequence_is_per_type_and_instrument() {
        let (table, mut ingestor) = setup();
        table.upsert(trade_route());

        let a = ingestor.ingest(&trade_raw()).unwrap().unwrap();
        let b = ingestor.ingest(&trade_raw()).unwrap().unwrap();
        let mut other = trade_raw();
        other.instrument = "ETH-USDT".to_string();
        let c = ingestor.ingest(&other).unwrap().unwrap();

        assert_eq!(a.seq_provider, 1);
        assert_eq!(b.seq_provider, 2);
        assert_eq!(c.seq_provider, 1);
        assert_eq!(c.event_id, "ETH-USDT:TRADE:1");

        ingestor
            .recycler
            .recycle_events(vec![Some(a), Some(b), Some(c)]);
    }

    #[test]
    fn test_no_route_drops() {
        let (_table, mut ingestor) = setup();
        assert!(ingestor.ingest(&trade_raw()).unwrap().is_none());
        assert_eq!(ingestor.stats.snapshot().dropped_no_route, 1);
    }

    #[test]
    fn test_rejecting_filter_drops() {
        let (table, mut ingestor) = setup();
        let mut route = trade_route();
        route.filters = vec![crate::table::FilterRule {
            field: "source".to_string(),
            op: crate::table::FilterOp::Eq,
            values: vec!["okx".to_string()],
        }];
        table.upsert(route);

        assert!(ingestor.ingest(&trade_raw()).unwrap().is_none());
        assert_eq!(ingestor.stats.snapshot().dropped_filtered, 1);
    }

    #[test]
    fn test_invalid_inputs() {
        let (table, mut ingestor) = setup();
        table.upsert(trade_route());

        let mut missing_instrument = trade_raw();
        missing_instrument.instrument.clear();
        assert!(matches!(
            ingestor.ingest(&missing_instrument),
            Err(CoreError::Invalid(_))
        ));

        let mut bad_type = trade_raw();
        bad_type.canonical_type = "NOPE".to_string();
        assert!(matches!(
            ingestor.ingest(&bad_type),
            Err(CoreError::Invalid(_))
        ));
    }

    #[test]
    fn test_unsorted_book_snapshot_rejected() {
        let (table, mut ingestor) = setup();
        table.upsert(RouteEntry {
            canonical_type: "ORDERBOOK.SNAPSHOT".to_string(),
            provider: "binance".to_string(),
            ws_topics: vec![],
            rest_fns: vec![],
            filters: vec![],
        });

        let mut raw = trade_raw();
        raw.canonical_type = "ORDERBOOK.SNAPSHOT".to_string();
        raw.payload = json!({
            // bids must be descending; this pair is ascending
            "bids": [
                {"price": "41000.0", "qty": "1"},
                {"price": "42000.0", "qty": "1"},
            ],
            "asks": [{"price": "42001.0", "qty": "1"}],
            "checksum": "c",
            "lastUpdate": 1_700_000_000_000i64,
            "firstUpdateId": 1,
            "finalUpdateId": 2,
        });

        assert!(matches!(
            ingestor.ingest(&raw),
            Err(CoreError::Invalid(_))
        ));
    }

    #[test]
    fn test_exec_report_stages_through_pool() {
        let (table, mut ingestor) = setup();
        table.upsert(RouteEntry {
            canonical_type: "EXEC.REPORT".to_string(),
            provider: "binance".to_string(),
            ws_topics: vec![],
            rest_fns: vec![],
            filters: vec![],
        });

        let raw = RawInstance {
            canonical_type: "EXEC.REPORT".to_string(),
            instrument: "BTC-USDT".to_string(),
            market: "spot".to_string(),
            source: "binance".to_string(),
            ts: 1_700_000_000_000,
            ingested_at: 1_700_000_000_001,
            payload: json!({
                "clientOrderId": "c-1",
                "exchangeOrderId": "x-1",
                "state": "FILLED",
                "side": "Sell",
                "orderType": "LIMIT",
                "price": "42000.00",
                "quantity": "1",
                "filledQty": "1",
                "remainingQty": "0",
                "avgFillPrice": "42000.00",
                "timestamp": 1_700_000_000_000i64,
            }),
            trace_id: None,
        };

        let event = ingestor.ingest(&raw).unwrap().unwrap();
        let Payload::ExecReport(report) = &event.payload else {
            panic!("expected exec report payload");
        };
        assert_eq!(report.state, ExecState::Filled);
        assert_eq!(report.client_order_id, "c-1");
        // generated trace id for correlation
        assert!(event.trace_id.is_some());

        // the staging wrapper went back to its pool
        let stats = ingestor.recycler.stats();
        assert_eq!(stats.exec_reports.checkouts, 1);
        assert_eq!(stats.exec_reports.recycles, 1);

        ingestor.recycler.recycle_event(event);
    }
}
