//! Meltica demo entry point
//!
//! Wires the full pipeline against a seeded synthetic feed and prints a
//! counter summary at the end:
//!
//! ```text
//! ┌───────────┐    ┌──────────┐    ┌────────────┐    ┌─────┐    ┌───────────┐
//! │ Synthetic │───▶│ Ingestor │───▶│ Dispatcher │───▶│ Bus │───▶│ Consumers │
//! │   feed    │    │          │    │ dedup+sort │    │     │    │ (wrapped) │
//! └───────────┘    └──────────┘    └────────────┘    └─────┘    └───────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use meltica::config::MelticaConfig;
use meltica::consumer::ConsumerWrapper;
use meltica::dispatcher::DispatcherRuntime;
use meltica::event::EventKind;
use meltica::ingest::Ingestor;
use meltica::logging::init_logging;
use meltica::orchestrator::{FusionFrame, Orchestrator};
use meltica::pool::Recycler;
use meltica::shutdown::Shutdown;
use meltica::stats::PipelineStats;
use meltica::synthetic::{FeedConfig, SyntheticFeed};
use meltica::table::{DispatchTable, RouteEntry};
use meltica::{Clock, EventBus};

const DEMO_FRAMES: usize = 10_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = MelticaConfig::from_env_or_default()?;
    let _log_guard = init_logging(&config.logging);

    let recycler = Recycler::new(&config.pool);
    let stats = Arc::new(PipelineStats::new());
    let shutdown = Shutdown::new();
    let clock = Clock::system();

    // Control plane seeds one TRADE route before traffic starts.
    let table = Arc::new(DispatchTable::new());
    table.upsert(RouteEntry {
        canonical_type: "TRADE".to_string(),
        provider: "synthetic".to_string(),
        ws_topics: vec!["trade".to_string()],
        rest_fns: vec![],
        filters: vec![],
    });

    let bus = EventBus::new(config.bus.buffer_size, Arc::clone(&recycler));

    // Dispatcher runtime: canonical events in, errors out.
    let (canonical_tx, canonical_rx) = tokio::sync::mpsc::channel(1024);
    let runtime = DispatcherRuntime::new(
        config.dispatcher.clone(),
        &config.ordering,
        clock,
        Arc::clone(&bus),
        Arc::clone(&recycler),
        Arc::clone(&stats),
    );
    let mut err_rx = runtime.start(canonical_rx, shutdown.clone());
    let error_logger = tokio::spawn(async move {
        while let Some(error) = err_rx.recv().await {
            tracing::warn!(%error, "pipeline error");
        }
    });

    // Ingestor: raw frames in, canonical events out.
    let (raw_tx, raw_rx) = tokio::sync::mpsc::channel(1024);
    let ingestor = Ingestor::new(
        Arc::clone(&table),
        Arc::clone(&recycler),
        Arc::clone(&stats),
    );
    let ingest_task = tokio::spawn(ingestor.run(raw_rx, canonical_tx, shutdown.clone()));

    // Orchestrator: book snapshot/delta fusion onto the same bus.
    let orchestrator = Arc::new(Orchestrator::new(
        config.orchestrator.clone(),
        Clock::system(),
        Arc::clone(&recycler),
        Arc::clone(&bus),
        Arc::clone(&stats),
    ));
    orchestrator.stamper().update_version(table.version());
    let (fusion_tx, fusion_rx) = tokio::sync::mpsc::channel(256);
    let fusion_task = tokio::spawn(Arc::clone(&orchestrator).run(fusion_rx, shutdown.clone()));

    // Wrapped consumers: two on trades, one on fused books.
    let mut consumer_tasks = Vec::new();
    for (name, kind) in [
        ("grid-alpha", EventKind::Trade),
        ("momentum-beta", EventKind::Trade),
        ("book-watcher", EventKind::BookSnapshot),
    ] {
        let (_id, rx) = Arc::clone(&bus)
            .subscribe_with_shutdown(kind, shutdown.clone())
            .map_err(|e| anyhow::anyhow!("subscribe failed: {e}"))?;
        let wrapper = Arc::new(ConsumerWrapper::new(
            name,
            Arc::clone(&recycler),
            Arc::clone(&stats),
        ));
        consumer_tasks.push((
            Arc::clone(&wrapper),
            tokio::spawn(wrapper.run(rx, shutdown.clone(), move |event| {
                let symbol = event.symbol.clone();
                async move {
                    tracing::trace!(%symbol, "strategy tick");
                    Ok(())
                }
            })),
        ));
    }

    // Drive the synthetic trade feed.
    let mut feed = SyntheticFeed::new(FeedConfig::default(), 0x5EED);
    for _ in 0..DEMO_FRAMES {
        for frame in feed.next_frames() {
            if raw_tx.send(frame).await.is_err() {
                break;
            }
        }
    }
    for frame in feed.flush() {
        let _ = raw_tx.send(frame).await;
    }
    drop(raw_tx);

    // Drive a short book session through the orchestrator: one snapshot,
    // then alternating top-of-book deltas.
    let book = |canonical_type: &str, data: serde_json::Value| FusionFrame {
        market: "spot".to_string(),
        instrument: "BTC-USDT".to_string(),
        canonical_type: canonical_type.to_string(),
        source: "binance".to_string(),
        ts: chrono::Utc::now(),
        data: match data {
            serde_json::Value::Object(map) => map,
            _ => unreachable!("book frames are objects"),
        },
        trace_id: None,
    };
    fusion_tx
        .send(book(
            "ORDERBOOK.SNAPSHOT",
            serde_json::json!({
                "topBid": "42000.00", "bidQty": "1.0",
                "topAsk": "42000.50", "askQty": "1.2",
            }),
        ))
        .await?;
    for i in 0..100u32 {
        let (side, price) = if i % 2 == 0 {
            ("bid", format!("{}.00", 42_000 - (i % 7)))
        } else {
            ("ask", format!("{}.50", 42_000 + (i % 5)))
        };
        fusion_tx
            .send(book(
                "ORDERBOOK.DELTA",
                serde_json::json!({"side": side, "price": price, "qty": "0.5"}),
            ))
            .await?;
    }
    drop(fusion_tx);
    fusion_task.await?;

    // Let the tail of the pipeline settle past the flush tick, then stop.
    tokio::time::sleep(config.ordering.lateness_tolerance() + Duration::from_millis(200)).await;
    shutdown.request_shutdown();
    ingest_task.await?;
    for (_, task) in &mut consumer_tasks {
        task.await?;
    }
    bus.close();
    error_logger.await?;

    let snapshot = stats.snapshot();
    let pool_stats = recycler.stats();
    println!("================ meltica demo ================");
    println!("raw frames ingested    : {}", snapshot.raw_ingested);
    println!("canonical events       : {}", snapshot.canonical_emitted);
    println!("duplicates dropped     : {}", snapshot.deduped);
    println!("released in order      : {}", snapshot.released_in_order);
    println!("released late          : {}", snapshot.released_late);
    println!("published to bus       : {}", snapshot.published);
    println!("publish errors         : {}", snapshot.publish_errors);
    println!("snapshots installed    : {}", snapshot.snapshots_put);
    println!("deltas fused           : {}", snapshot.deltas_fused);
    println!("cas conflicts          : {}", snapshot.cas_conflicts);
    println!("emissions throttled    : {}", snapshot.throttled);
    println!("consumer processed     : {}", snapshot.consumer_processed);
    println!("consumer filtered      : {}", snapshot.consumer_filtered);
    println!(
        "event pool             : {} checkouts / {} recycles / {} fresh",
        pool_stats.events.checkouts, pool_stats.events.recycles, pool_stats.events.fresh_allocs
    );
    println!("outstanding pool items : {}", recycler.outstanding());
    for (wrapper, _) in &consumer_tasks {
        let counters = wrapper.counters();
        println!(
            "consumer {:<14} : {} processed, {} filtered, {} panics",
            wrapper.id(),
            counters.processed,
            counters.filtered,
            counters.panics
        );
    }
    println!("==============================================");

    Ok(())
}
