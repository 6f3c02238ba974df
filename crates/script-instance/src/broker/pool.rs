//! PooledBroker - thread-backed instance pool.
//!
//! Requests are queued to a broker thread which either reuses an idle
//! instance or creates a fresh context through the `ContextFactory`.
//! Released instances go back to the idle list while their context is still
//! valid; invalid ones are dropped.
//!
//! The idle list is not keyed by options. Any idle instance serves any
//! request, and a reused context keeps the bindings of its previous cycle,
//! so the factory's options only shape freshly created contexts. Set
//! `PoolConfig::reuse` to `false` when cycles need distinct contexts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{InstanceBroker, ReadyCallback, RequestResult};
use crate::context::ContextFactory;
use crate::instance::Instance;
use crate::options::InstanceOptions;

// ─────────────────────────────────────────────────────────────────────────────
// Broker Commands
// ─────────────────────────────────────────────────────────────────────────────

/// Commands sent to the broker thread
enum BrokerCommand {
    /// Produce an instance and hand it to `on_ready`
    Acquire {
        options: InstanceOptions,
        on_ready: ReadyCallback,
    },
    /// Stop the broker thread
    Shutdown,
}

/// Pool sizing
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum instances leased or queued at once
    pub max_instances: usize,
    /// Keep released instances for reuse
    pub reuse: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: 16,
            reuse: true,
        }
    }
}

/// Status of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle: usize,
    pub leased: usize,
    pub outstanding: usize,
}

struct PoolShared {
    factory: Arc<dyn ContextFactory>,
    config: PoolConfig,
    idle: Mutex<Vec<Arc<Instance>>>,
    leased: DashMap<Uuid, Arc<Instance>>,
    /// Leased plus queued requests
    outstanding: AtomicUsize,
    closed: AtomicBool,
}

impl PoolShared {
    fn free_slot(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    /// Pop an idle instance, or create one for `options` if none is left.
    fn acquire(&self, options: &InstanceOptions) -> Option<Arc<Instance>> {
        let reused = {
            let mut idle = self.idle.lock();
            idle.retain(|instance| instance.is_valid());
            idle.pop()
        };
        if let Some(instance) = reused {
            tracing::debug!(instance = %instance.id(), "Reusing pooled instance");
            return Some(instance);
        }

        match self.factory.create(options) {
            Ok(context) => {
                let instance = Arc::new(Instance::new(context));
                tracing::debug!(instance = %instance.id(), "Created instance");
                Some(instance)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to create runtime context");
                None
            }
        }
    }
}

/// Broker that serves requests from a dedicated thread.
pub struct PooledBroker {
    shared: Arc<PoolShared>,
    command_tx: mpsc::UnboundedSender<BrokerCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PooledBroker {
    /// Start a broker thread creating contexts with `factory`.
    pub fn new(factory: impl ContextFactory, config: PoolConfig) -> std::io::Result<Self> {
        let shared = Arc::new(PoolShared {
            factory: Arc::new(factory),
            config,
            idle: Mutex::new(Vec::new()),
            leased: DashMap::new(),
            outstanding: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("instance-broker".to_string())
            .spawn(move || run_broker(thread_shared, command_rx))?;

        tracing::info!(max_instances = shared.config.max_instances, "PooledBroker started");

        Ok(Self {
            shared,
            command_tx,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            idle: self.shared.idle.lock().len(),
            leased: self.shared.leased.len(),
            outstanding: self.shared.outstanding.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting requests and join the broker thread.
    ///
    /// Requests still queued are dropped without their callbacks firing.
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.command_tx.send(BrokerCommand::Shutdown);
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                tracing::error!("Broker thread panicked");
            }
        }
        self.shared.idle.lock().clear();
        tracing::info!("PooledBroker shut down");
    }
}

impl InstanceBroker for PooledBroker {
    fn request_instance(&self, options: &InstanceOptions, on_ready: ReadyCallback) -> RequestResult {
        if self.shared.closed.load(Ordering::SeqCst) {
            return RequestResult::Rejected;
        }

        let max = self.shared.config.max_instances;
        let reserved = self
            .shared
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1));
        if reserved.is_err() {
            tracing::warn!(max_instances = max, "Instance pool exhausted");
            return RequestResult::Rejected;
        }

        let command = BrokerCommand::Acquire {
            options: options.clone(),
            on_ready,
        };
        if self.command_tx.send(command).is_err() {
            self.shared.free_slot();
            return RequestResult::Rejected;
        }
        RequestResult::Queued
    }

    fn release_instance(&self, instance: Arc<Instance>) {
        if self.shared.leased.remove(&instance.id()).is_none() {
            tracing::warn!(instance = %instance.id(), "Release of an instance this pool did not lease");
            return;
        }
        self.shared.free_slot();

        if self.shared.config.reuse && instance.is_valid() && !self.shared.closed.load(Ordering::SeqCst) {
            tracing::debug!(instance = %instance.id(), "Instance returned to pool");
            self.shared.idle.lock().push(instance);
        } else {
            tracing::debug!(instance = %instance.id(), "Instance disposed");
        }
    }
}

impl Drop for PooledBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_broker(shared: Arc<PoolShared>, mut command_rx: mpsc::UnboundedReceiver<BrokerCommand>) {
    tracing::debug!("[broker] Thread started");

    while let Some(command) = command_rx.blocking_recv() {
        match command {
            BrokerCommand::Acquire { options, on_ready } => {
                if shared.closed.load(Ordering::SeqCst) {
                    shared.free_slot();
                    continue;
                }
                match shared.acquire(&options) {
                    Some(instance) => {
                        shared.leased.insert(instance.id(), Arc::clone(&instance));
                        on_ready(instance);
                    }
                    None => shared.free_slot(),
                }
            }
            BrokerCommand::Shutdown => break,
        }
    }

    tracing::debug!("[broker] Thread exiting");
}
