//! Synthetic feed generator
//!
//! Produces deterministic, seeded raw-instance sequences across several
//! providers and symbols, with bounded out-of-order delivery and occasional
//! duplicates - the traffic shape the dispatcher core is built to absorb.
//! Used by the demo binary and the end-to-end tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use serde_json::json;

use crate::ingest::RawInstance;

/// Configuration for a synthetic session.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub providers: Vec<String>,
    pub symbols: Vec<String>,
    /// Base epoch-millisecond timestamp of the first frame.
    pub start_ts: i64,
    /// Probability that a frame is emitted out of order.
    pub shuffle_probability: f64,
    /// Probability that a frame repeats the previous event id.
    pub duplicate_probability: f64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            providers: vec!["binance".to_string(), "okx".to_string()],
            symbols: vec!["BTC-USDT".to_string(), "ETH-USDT".to_string()],
            start_ts: 1_700_000_000_000,
            shuffle_probability: 0.15,
            duplicate_probability: 0.05,
        }
    }
}

/// Seeded generator of trade raw instances.
pub struct SyntheticFeed {
    rng: StdRng,
    config: FeedConfig,
    frame_counter: u64,
    trade_counters: FxHashMap<(usize, usize), u64>,
    /// One postponed frame per (provider, symbol), re-emitted after its
    /// successor to simulate reordering.
    held_back: FxHashMap<(usize, usize), RawInstance>,
}

impl SyntheticFeed {
    pub fn new(config: FeedConfig, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            config,
            frame_counter: 0,
            trade_counters: FxHashMap::default(),
            held_back: FxHashMap::default(),
        }
    }

    /// Next batch of frames: usually one, sometimes zero (held back) or
    /// two (a held-back frame plus its successor, swapped).
    pub fn next_frames(&mut self) -> Vec<RawInstance> {
        self.frame_counter += 1;
        let provider_idx = self.rng.gen_range(0..self.config.providers.len());
        let symbol_idx = self.rng.gen_range(0..self.config.symbols.len());
        let stream = (provider_idx, symbol_idx);

        let frame = self.trade_frame(provider_idx, symbol_idx);

        // Reorder: postpone this frame and release it after its successor.
        if self.rng.gen_bool(self.config.shuffle_probability)
            && !self.held_back.contains_key(&stream)
        {
            self.held_back.insert(stream, frame);
            return Vec::new();
        }

        let mut frames = vec![frame];
        if let Some(delayed) = self.held_back.remove(&stream) {
            frames.push(delayed);
        }

        // Duplicate: replay the newest frame verbatim.
        if self.rng.gen_bool(self.config.duplicate_probability) {
            frames.push(frames[0].clone());
        }
        frames
    }

    /// Emit every postponed frame, ending the session cleanly.
    pub fn flush(&mut self) -> Vec<RawInstance> {
        self.held_back.drain().map(|(_, frame)| frame).collect()
    }

    fn trade_frame(&mut self, provider_idx: usize, symbol_idx: usize) -> RawInstance {
        let counter = self
            .trade_counters
            .entry((provider_idx, symbol_idx))
            .or_insert(0);
        *counter += 1;

        let provider = self.config.providers[provider_idx].clone();
        let symbol = self.config.symbols[symbol_idx].clone();
        let ts = self.config.start_ts + self.frame_counter as i64;
        let price_cents = 4_200_000 + self.rng.gen_range(-5_000i64..5_000);
        let qty_milli = self.rng.gen_range(1i64..2_000);

        RawInstance {
            canonical_type: "TRADE".to_string(),
            instrument: symbol,
            market: "spot".to_string(),
            source: provider,
            ts,
            ingested_at: ts + self.rng.gen_range(0i64..5),
            payload: json!({
                "tradeId": format!("synthetic-{}", self.frame_counter),
                "side": if self.rng.gen_bool(0.5) { "Buy" } else { "Sell" },
                "price": format!("{}.{:02}", price_cents / 100, price_cents % 100),
                "quantity": format!("0.{:03}", qty_milli),
                "timestamp": ts,
            }),
            trace_id: Some(format!("synthetic-{}", self.frame_counter)),
        }
    }
}

impl std::fmt::Debug for SyntheticFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticFeed")
            .field("frames", &self.frame_counter)
            .field("held_back", &self.held_back.len())
            .finish()
    }
}
