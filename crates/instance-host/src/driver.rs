//! Host frame loop.
//!
//! Plays the part of the host component: initializes one lifecycle, waits
//! for the broker, forwards frame ticks for the configured number of frames
//! and tears down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use script_instance::{
    EventPublisher, HostContext, InitOutcome, InstanceError, InstanceEvent, InstanceLifecycle,
    LifecycleState, PoolConfig, PoolStatus, PooledBroker,
};

use crate::config::HostConfig;
use crate::dry_run::DryRunFactory;

/// Object bound to scripts as `Context`
#[derive(Debug)]
pub struct HostComponent {
    pub name: String,
}

/// Object bound to scripts as `Root`
#[derive(Debug)]
pub struct HostOwner {
    pub name: String,
}

/// Summary of one host run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: InitOutcome,
    pub frames: u32,
    pub forwarded_ticks: u32,
    pub final_state: LifecycleState,
    pub pool: PoolStatus,
    pub contexts_created: usize,
}

/// Run the frame loop described by `config` to completion.
pub async fn run(config: &HostConfig) -> Result<RunReport> {
    let factory = DryRunFactory::new(&config.host.scripts_dir);
    let created = factory.created();
    let broker = Arc::new(
        PooledBroker::new(
            factory,
            PoolConfig {
                max_instances: config.host.pool_size,
                ..Default::default()
            },
        )
        .context("Failed to start instance broker")?,
    );

    let host = HostContext::live(Arc::new(HostComponent {
        name: "instance-host".to_string(),
    }))
    .with_owner(Arc::new(HostOwner {
        name: "world".to_string(),
    }));

    let events = EventPublisher::default();
    let logger = spawn_event_logger(&events);
    let lifecycle = InstanceLifecycle::new(broker.clone(), host).with_events(events);

    let outcome = lifecycle
        .initialize(config.instance.clone())
        .context("Failed to initialize instance")?;
    info!(?outcome, "Instance requested");

    let mut frames = 0;
    let mut forwarded_ticks = 0;

    if outcome == InitOutcome::Pending {
        match lifecycle.wait_ready().await {
            Ok(true) => info!("Instance running"),
            Ok(false) => warn!("Acquisition cancelled"),
            // Entry script failures still leave the instance held for teardown
            Err(e @ InstanceError::Script(_)) => warn!(error = %e, "Entry script failed"),
            Err(e) => error!(error = %e, "Instance failed to start"),
        }

        if lifecycle.state().is_active() {
            let delta = config.frame_delta();
            let mut interval =
                tokio::time::interval(Duration::from_millis(config.host.frame_interval_ms.max(1)));

            while frames < config.host.frames {
                interval.tick().await;
                frames += 1;
                if lifecycle.tick(delta)? {
                    forwarded_ticks += 1;
                }
            }
            info!(frames, forwarded_ticks, "Frame loop finished");
        }
    }

    if let Err(e) = lifecycle.teardown() {
        warn!(error = %e, "Teardown incomplete, retrying once");
        lifecycle.teardown().context("Teardown failed")?;
    }
    let final_state = lifecycle.state();
    drop(lifecycle);

    let pool = broker.status();
    broker.shutdown();

    if tokio::time::timeout(Duration::from_secs(1), logger).await.is_err() {
        debug!("Event logger still draining; abandoning it");
    }

    Ok(RunReport {
        outcome,
        frames,
        forwarded_ticks,
        final_state,
        pool,
        contexts_created: created.load(std::sync::atomic::Ordering::SeqCst),
    })
}

/// Log lifecycle events until every publisher is gone.
fn spawn_event_logger(events: &EventPublisher) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(InstanceEvent::Tick { delta }) => tracing::trace!(delta, "tick"),
                Ok(InstanceEvent::Message { name, payload }) => {
                    info!(name = %name, payload = %payload, "Script message");
                }
                Ok(InstanceEvent::Failed { stage, message }) => {
                    error!(?stage, message = %message, "Instance failed");
                }
                Ok(event) => info!(event = event.name(), "Lifecycle event"),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Event logger lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
