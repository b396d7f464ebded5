//! Node assembly: store, bus, consumer pool, ingest and taps.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use statesync_bus::{
    InMemoryBus, MessageSink, MessageSource, RouteTable, StaticRouteTable, Subscription,
    TransportError,
};
use statesync_core::SyncConfig;
use statesync_engine::{
    ConsumerStats, DispatchOptions, Dispatcher, ForwardRouter, Monitor, RetryPolicy,
    SyncConsumer, TtlStateCache,
};
use statesync_store::StateRepository;

use crate::ingest;

type ConsumerResult = Result<ConsumerStats, TransportError>;

/// Run the node until a shutdown signal or a fatal consumer error.
pub async fn run(config: SyncConfig) -> anyhow::Result<()> {
    info!("state sync node starting");

    let store = crate::open_store(&config)?;
    let registered = store
        .list_state_ids()
        .context("failed to list registered states")?;
    if registered.is_empty() {
        warn!("no states registered, run `statesyncd import-graph` first");
    } else {
        info!(states = registered.len(), "registered states loaded");
    }
    let store: Arc<dyn StateRepository> = Arc::new(store);

    let table = StaticRouteTable::new(config.routes.clone());
    info!(routes = ?table.route_names(), "route table loaded");
    let routes: Arc<dyn RouteTable> = Arc::new(table);
    let bus = InMemoryBus::with_capacity(config.messaging.queue_capacity);
    let sink: Arc<dyn MessageSink> = Arc::new(bus.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Consumers ──────────────────────────────────────────────

    let sync_subjects = config.destinations(&config.messaging.sync_route).to_vec();
    let retry = retry_policy(&config);
    let monitor = Monitor::new(sink.clone(), routes.clone(), &config.messaging.monitor_route);
    let options = DispatchOptions {
        lightweight: config.storage.lightweight,
    };

    let mut consumers: JoinSet<ConsumerResult> = JoinSet::new();
    let mut consumer_id = 0;
    for subject in &sync_subjects {
        for _ in 0..config.consumer.concurrency {
            let forwarder = ForwardRouter::new(
                store.clone(),
                sink.clone(),
                routes.clone(),
                &config.messaging.forward_route,
            );
            let dispatcher = Dispatcher::new(
                store.clone(),
                forwarder,
                TtlStateCache::new(config.cache.freshness()),
                options,
            );
            let source: Arc<dyn MessageSource> = Arc::new(bus.subscribe(subject));
            let consumer = SyncConsumer::new(consumer_id, source, dispatcher)
                .with_monitor(monitor.clone())
                .with_retry(retry)
                .with_sweep_interval(config.cache.freshness());
            consumers.spawn(consumer.run(shutdown_rx.clone()));
            consumer_id += 1;
        }
        info!(%subject, concurrency = config.consumer.concurrency, "consumers started");
    }

    // ── Taps and ingest ────────────────────────────────────────

    let mut aux: Vec<JoinHandle<()>> = Vec::new();
    for subject in tap_subjects(&config, &sync_subjects) {
        let source = bus.subscribe(&subject);
        aux.push(tokio::spawn(tap(source, shutdown_rx.clone())));
    }

    if let Some(addr) = config.ingest.listen {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind ingest listener on {addr}"))?;
        match sync_subjects.first() {
            Some(subject) => aux.push(tokio::spawn(ingest::serve(
                listener,
                sink.clone(),
                subject.clone(),
                config.ingest.max_line_bytes,
                shutdown_rx.clone(),
            ))),
            None => warn!("ingest configured without a sync subject"),
        }
    }

    // ── Shutdown ───────────────────────────────────────────────

    let mut failure = None;
    tokio::select! {
        _ = shutdown_signal() => info!("shutdown signal received"),
        Some(joined) = consumers.join_next() => {
            warn!("consumer exited before shutdown");
            failure = consumer_failure(joined);
        }
    }
    let _ = shutdown_tx.send(true);

    while let Some(joined) = consumers.join_next().await {
        if let Some(e) = consumer_failure(joined) {
            failure.get_or_insert(e);
        }
    }
    bus.close();
    for handle in aux {
        let _ = handle.await;
    }

    match failure {
        Some(e) => {
            error!(error = %e, "state sync node stopped with error");
            Err(e)
        }
        None => {
            info!("state sync node stopped");
            Ok(())
        }
    }
}

fn retry_policy(config: &SyncConfig) -> RetryPolicy {
    RetryPolicy {
        max_redeliveries: config.consumer.max_redeliveries,
        base_backoff: Duration::from_millis(config.consumer.retry_backoff_ms),
        max_backoff: Duration::from_millis(config.consumer.max_backoff_ms),
    }
}

/// Forward and monitor destinations that no consumer in this process reads.
fn tap_subjects(config: &SyncConfig, sync_subjects: &[String]) -> BTreeSet<String> {
    [
        &config.messaging.forward_route,
        &config.messaging.monitor_route,
    ]
    .into_iter()
    .flat_map(|route| config.destinations(route).iter().cloned())
    .filter(|subject| !sync_subjects.contains(subject))
    .collect()
}

/// Log and acknowledge everything published to a subject.
async fn tap(source: Subscription, mut shutdown: watch::Receiver<bool>) {
    debug!(subject = %source.subject(), "outbound tap started");
    loop {
        let received = tokio::select! {
            received = source.receive() => received,
            _ = shutdown.changed() => break,
        };
        match received {
            Ok(Some(delivery)) => {
                info!(
                    subject = %delivery.subject,
                    payload = %delivery.payload_lossy(),
                    "outbound message"
                );
                if let Err(e) = source.ack(&delivery).await {
                    warn!(error = %e, "tap ack failed");
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "tap receive failed");
                break;
            }
        }
    }
}

fn consumer_failure(joined: Result<ConsumerResult, JoinError>) -> Option<anyhow::Error> {
    match joined {
        Ok(Ok(stats)) => {
            info!(
                received = stats.received,
                synced = stats.synced,
                dropped = stats.dropped,
                "consumer finished"
            );
            None
        }
        Ok(Err(e)) => Some(anyhow::Error::new(e).context("consumer transport failed")),
        Err(e) => Some(anyhow::Error::new(e).context("consumer task failed")),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
