mod config;

use indexer_engine::adapter::SimulatedAdapter;
use indexer_engine::gap::GapReconciler;
use indexer_engine::metrics::create_shared_metrics;
use indexer_engine::orchestrator::Orchestrator;
use indexer_engine::processor::StoreProcessor;
use indexer_engine::progress::ProgressTracker;
use indexer_engine::store::memory::{MemoryBlockStore, MemoryChainStore};
use indexer_engine::IndexerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = config::get_cli_config()?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(cli.rust_log.into())
                .from_env_lossy(),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    let engine_config: IndexerConfig = envy::prefixed("INDEXER_").from_env()?;
    info!(chain = %engine_config.chain_id, "starting chain indexer");

    // A simulated source stands in for a network adapter; swap in a real
    // `ChainAdapter` implementation to index a live chain.
    let adapter = Arc::new(SimulatedAdapter::new(engine_config.chain_id.clone()));
    adapter.extend(cli.sim_head);

    let chain_store = Arc::new(MemoryChainStore::new());
    let block_store = Arc::new(MemoryBlockStore::new());
    let metrics = create_shared_metrics();
    let processor = Arc::new(StoreProcessor::new(
        chain_store.clone(),
        block_store.clone(),
        metrics.clone(),
    ));
    let reconciler = Arc::new(GapReconciler::new(
        engine_config.chain_id.clone(),
        adapter.clone(),
        processor.clone(),
        chain_store.clone(),
        block_store.clone(),
        metrics.clone(),
    ));
    let progress = Arc::new(ProgressTracker::new(
        engine_config.chain_id.clone(),
        adapter.clone(),
        chain_store.clone(),
        metrics.clone(),
    ));

    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(
        engine_config,
        adapter.clone(),
        processor,
        chain_store,
        reconciler,
        progress,
        metrics.clone(),
        shutdown.clone(),
    );
    orchestrator.start()?;

    // Simulated block production at the source.
    let producer_adapter = adapter.clone();
    let producer_shutdown = shutdown.clone();
    let producer = tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(cli.sim_block_interval_ms.max(1)));
        loop {
            tokio::select! {
                biased;
                _ = producer_shutdown.cancelled() => break,
                _ = ticker.tick() => producer_adapter.extend(1),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Termination signal received. Shutting down...");
    shutdown.cancel();
    let _ = producer.await;
    orchestrator.stop().await?;

    info!("{}", metrics.snapshot());
    info!("All tasks shut down.");
    Ok(())
}
