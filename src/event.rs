//! Canonical events - the unit that flows through the pipeline
//!
//! Venue adapters map raw frames into a [`Event`] decoupled from any
//! venue-specific shape. Every price and quantity is carried as decimal
//! TEXT, never as a float, so venue precision survives the trip end to end.
//!
//! # Event Flow
//!
//! ```text
//! RawInstance → Ingestor → Event → Dispatcher (dedup + ordering) → Bus
//!                                                  │
//!                                     Orchestrator (merge/stamp) ─┘
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{RoutingVersion, SeqNum};
use crate::pool::{PoolSlot, Poolable};

// ============================================================
// EVENT KIND
// ============================================================

/// Canonical event kind. Discriminates the payload variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EventKind {
    /// Zero value - an event fresh out of the pool has this kind.
    #[default]
    Unspecified,
    BookSnapshot,
    BookUpdate,
    Trade,
    Ticker,
    ExecReport,
    KlineSummary,
    InstrumentUpdate,
    BalanceUpdate,
    RiskControl,
    ControlAck,
    ControlResult,
}

impl EventKind {
    /// Kinds that must reach consumers regardless of routing-version
    /// filtering: order lifecycle and control results cannot be dropped
    /// because a dispatch table flipped underneath them.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::ExecReport | Self::ControlAck | Self::ControlResult | Self::RiskControl
        )
    }

    /// Parse the canonical-type string used on the wire and in the
    /// dispatch table.
    pub fn from_canonical(s: &str) -> Option<Self> {
        match s {
            "ORDERBOOK.SNAPSHOT" => Some(Self::BookSnapshot),
            "ORDERBOOK.DELTA" => Some(Self::BookUpdate),
            "TRADE" => Some(Self::Trade),
            "TICKER" => Some(Self::Ticker),
            "EXEC.REPORT" => Some(Self::ExecReport),
            "KLINE.SUMMARY" => Some(Self::KlineSummary),
            "INSTRUMENT.UPDATE" => Some(Self::InstrumentUpdate),
            "BALANCE.UPDATE" => Some(Self::BalanceUpdate),
            "RISK.CONTROL" => Some(Self::RiskControl),
            "CONTROL.ACK" => Some(Self::ControlAck),
            "CONTROL.RESULT" => Some(Self::ControlResult),
            _ => None,
        }
    }

    /// Canonical-type string for this kind, the inverse of
    /// [`EventKind::from_canonical`].
    pub fn as_canonical(&self) -> &'static str {
        match self {
            Self::Unspecified => "",
            Self::BookSnapshot => "ORDERBOOK.SNAPSHOT",
            Self::BookUpdate => "ORDERBOOK.DELTA",
            Self::Trade => "TRADE",
            Self::Ticker => "TICKER",
            Self::ExecReport => "EXEC.REPORT",
            Self::KlineSummary => "KLINE.SUMMARY",
            Self::InstrumentUpdate => "INSTRUMENT.UPDATE",
            Self::BalanceUpdate => "BALANCE.UPDATE",
            Self::RiskControl => "RISK.CONTROL",
            Self::ControlAck => "CONTROL.ACK",
            Self::ControlResult => "CONTROL.RESULT",
        }
    }
}

// ============================================================
// STREAM KEY
// ============================================================

/// Ordering-buffer partition key: (provider, symbol, kind).
///
/// Used verbatim in metrics labels and as the reorder-map key, so its
/// `Display` form is stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub provider: String,
    pub symbol: String,
    pub kind: EventKind,
}

impl StreamKey {
    pub fn of(event: &Event) -> Self {
        Self {
            provider: event.provider.clone(),
            symbol: event.symbol.clone(),
            kind: event.kind,
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.provider, self.symbol, self.kind.as_canonical())
    }
}

// ============================================================
// PAYLOAD VARIANTS
// ============================================================

/// Trade / order side.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Side {
    #[default]
    #[serde(alias = "buy", alias = "BUY")]
    Buy,
    #[serde(alias = "sell", alias = "SELL")]
    Sell,
}

/// Order lifecycle state carried by execution reports.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecState {
    #[default]
    Ack,
    Partial,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

/// Risk-control breach status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskStatus {
    #[default]
    Triggered,
    Cleared,
}

/// One price level of an order book side. Price and quantity are decimal
/// text exactly as the venue sent them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: String,
    pub qty: String,
}

impl BookLevel {
    /// Numeric view of the price for ordering checks. `None` if the text
    /// is not a decimal.
    pub fn price_decimal(&self) -> Option<Decimal> {
        self.price.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeData {
    pub trade_id: String,
    pub side: Side,
    pub price: String,
    pub quantity: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerData {
    pub last: String,
    pub bid: String,
    pub ask: String,
    pub volume_24h: String,
    pub timestamp: i64,
}

/// Full order-book snapshot. Bids descending by price, asks ascending;
/// `bids[0]` / `asks[0]` are top-of-book.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookSnapshotData {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub checksum: String,
    pub last_update: i64,
    pub first_update_id: u64,
    pub final_update_id: u64,
}

impl BookSnapshotData {
    /// Top of book, if both sides are non-empty.
    pub fn top_of_book(&self) -> Option<(&BookLevel, &BookLevel)> {
        Some((self.bids.first()?, self.asks.first()?))
    }

    /// Check the side-ordering invariant: bids strictly descending,
    /// asks strictly ascending. Unparseable price text fails the check.
    pub fn sides_ordered(&self) -> bool {
        fn ordered(levels: &[BookLevel], descending: bool) -> bool {
            let mut prev: Option<Decimal> = None;
            for level in levels {
                let Some(price) = level.price_decimal() else {
                    return false;
                };
                if let Some(prev) = prev {
                    let ok = if descending { price < prev } else { price > prev };
                    if !ok {
                        return false;
                    }
                }
                prev = Some(price);
            }
            true
        }
        ordered(&self.bids, true) && ordered(&self.asks, false)
    }
}

/// Incremental order-book change for a single side+price.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookDeltaData {
    pub side: String,
    pub price: String,
    pub qty: String,
    pub update_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecReportData {
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub state: ExecState,
    pub side: Side,
    pub order_type: String,
    pub price: String,
    pub quantity: String,
    pub filled_qty: String,
    pub remaining_qty: String,
    pub avg_fill_price: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commission_amount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commission_asset: Option<String>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KlineSummaryData {
    pub open: String,
    pub close: String,
    pub high: String,
    pub low: String,
    pub volume: String,
    pub open_time: i64,
    pub close_time: i64,
}

/// Instrument catalogue refresh. The instrument definition is an opaque
/// venue document; downstream catalogue owners interpret it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentUpdateData {
    pub instrument: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceUpdateData {
    pub currency: String,
    pub total: String,
    pub available: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskControlData {
    pub strategy_id: String,
    pub provider: String,
    pub symbol: String,
    pub status: RiskStatus,
    pub reason: String,
    pub breach_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Map<String, serde_json::Value>>,
    pub kill_switch_engaged: bool,
    pub circuit_breaker_open: bool,
    pub timestamp: i64,
}

/// Control-plane acknowledgement / result payload (ControlAck, ControlResult).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlData {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Tagged payload sum type, discriminated by [`EventKind`].
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    /// Zero value - an event fresh out of the pool has no payload.
    #[default]
    None,
    Trade(TradeData),
    Ticker(TickerData),
    BookSnapshot(BookSnapshotData),
    BookDelta(BookDeltaData),
    ExecReport(ExecReportData),
    KlineSummary(KlineSummaryData),
    InstrumentUpdate(InstrumentUpdateData),
    BalanceUpdate(BalanceUpdateData),
    RiskControl(RiskControlData),
    Control(ControlData),
}

impl Payload {
    /// The kind this payload variant belongs to.
    pub fn expected_kind(&self) -> Option<EventKind> {
        match self {
            Self::None => None,
            Self::Trade(_) => Some(EventKind::Trade),
            Self::Ticker(_) => Some(EventKind::Ticker),
            Self::BookSnapshot(_) => Some(EventKind::BookSnapshot),
            Self::BookDelta(_) => Some(EventKind::BookUpdate),
            Self::ExecReport(_) => Some(EventKind::ExecReport),
            Self::KlineSummary(_) => Some(EventKind::KlineSummary),
            Self::InstrumentUpdate(_) => Some(EventKind::InstrumentUpdate),
            Self::BalanceUpdate(_) => Some(EventKind::BalanceUpdate),
            Self::RiskControl(_) => Some(EventKind::RiskControl),
            // Control payloads serve both the ack and the result kind.
            Self::Control(_) => None,
        }
    }
}

// ============================================================
// CANONICAL EVENT
// ============================================================

/// The canonical event. Pool-allocated on the hot path; exclusively owned
/// by one component at a time. Returning it to the pool invalidates it.
#[derive(Debug, Default)]
pub struct Event {
    /// Pool bookkeeping. First field so the poison word is the first
    /// machine word of the struct.
    pub(crate) slot: PoolSlot,

    /// Unique within the dedup window. Empty means "not deduplicatable".
    pub event_id: String,
    /// Dispatch-table generation this event was produced under.
    pub routing_version: RoutingVersion,
    /// Source venue tag.
    pub provider: String,
    /// Canonical instrument, e.g. `BTC-USDT`.
    pub symbol: String,
    pub kind: EventKind,
    /// Monotone per (provider, symbol, kind), assigned upstream.
    pub seq_provider: SeqNum,
    pub ingest_ts: DateTime<Utc>,
    /// Always >= `ingest_ts`.
    pub emit_ts: DateTime<Utc>,
    /// Optional correlation id.
    pub trace_id: Option<String>,
    pub payload: Payload,
}

impl Event {
    /// Check the kind/payload agreement invariant. Control payloads are
    /// valid for both control kinds; `Payload::None` only for the zero kind.
    pub fn payload_matches_kind(&self) -> bool {
        match (&self.payload, self.kind) {
            (Payload::None, EventKind::Unspecified) => true,
            (Payload::Control(_), EventKind::ControlAck | EventKind::ControlResult) => true,
            (payload, kind) => payload.expected_kind() == Some(kind),
        }
    }

    /// Copy every data field from `src`, leaving pool bookkeeping alone.
    /// This is the clone operation fan-out uses to mint per-subscriber
    /// instances out of the pool.
    pub fn copy_from(&mut self, src: &Event) {
        self.event_id.clear();
        self.event_id.push_str(&src.event_id);
        self.routing_version = src.routing_version;
        self.provider.clear();
        self.provider.push_str(&src.provider);
        self.symbol.clear();
        self.symbol.push_str(&src.symbol);
        self.kind = src.kind;
        self.seq_provider = src.seq_provider;
        self.ingest_ts = src.ingest_ts;
        self.emit_ts = src.emit_ts;
        self.trace_id = src.trace_id.clone();
        self.payload = src.payload.clone();
    }
}

impl Poolable for Event {
    fn slot(&mut self) -> &mut PoolSlot {
        &mut self.slot
    }

    fn slot_ref(&self) -> &PoolSlot {
        &self.slot
    }

    /// Total reset: every field back to its zero value.
    fn reset(&mut self) {
        self.event_id.clear();
        self.routing_version = 0;
        self.provider.clear();
        self.symbol.clear();
        self.kind = EventKind::Unspecified;
        self.seq_provider = 0;
        self.ingest_ts = DateTime::<Utc>::default();
        self.emit_ts = DateTime::<Utc>::default();
        self.trace_id = None;
        self.payload = Payload::None;
    }
}

// ============================================================
// MERGED EVENT
// ============================================================

/// An event fused from one or more provider partials, plus the provider
/// set and the merge window it was fused in. The embedded event carries
/// the surviving payload.
#[derive(Debug, Default)]
pub struct MergedEvent {
    pub(crate) slot: PoolSlot,

    pub event: Event,
    /// Provider ids fused into this event, first contributor first.
    pub source_providers: Vec<String>,
    pub merge_window_id: String,
}

impl Poolable for MergedEvent {
    fn slot(&mut self) -> &mut PoolSlot {
        &mut self.slot
    }

    fn slot_ref(&self) -> &PoolSlot {
        &self.slot
    }

    fn reset(&mut self) {
        self.event.reset();
        self.source_providers.clear();
        self.merge_window_id.clear();
    }
}

// ============================================================
// EXEC REPORT (pooled staging object)
// ============================================================

/// Pool-allocated execution-report staging object. Adapters check one out,
/// fill it from the venue frame, hand the data to an [`Event`] payload, and
/// recycle the wrapper.
#[derive(Debug, Default)]
pub struct ExecReport {
    pub(crate) slot: PoolSlot,
    pub data: ExecReportData,
}

impl Poolable for ExecReport {
    fn slot(&mut self) -> &mut PoolSlot {
        &mut self.slot
    }

    fn slot_ref(&self) -> &PoolSlot {
        &self.slot
    }

    fn reset(&mut self) {
        self.data = ExecReportData::default();
    }
}
