//! Instance lifecycle orchestration.
//!
//! `InstanceLifecycle` drives one script instance through
//!
//! ```text
//! Uninitialized → AcquiringInstance → Configuring → Running
//!     → StoppingWorker → ReleasingInstance → Uninitialized
//! ```
//!
//! The broker's `on_ready` callback only forwards the instance over a
//! one-shot channel; configuration always happens on the thread that calls
//! [`InstanceLifecycle::pump`], [`InstanceLifecycle::tick`] or
//! [`InstanceLifecycle::wait_ready`], which is the host thread the
//! host-thread strategy runs on.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::broker::{InstanceBroker, ReadyCallback, RequestResult};
use crate::context::HostObject;
use crate::error::{InstanceError, InstanceResult};
use crate::events::{EventPublisher, FailureStage, InstanceEvent};
use crate::execution::{ExecutionModel, ScriptRun, WorkerHandle};
use crate::features::{ExposureTargets, FeatureExposer};
use crate::instance::Instance;
use crate::options::InstanceOptions;
use crate::run_state::RunState;

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle State
// ─────────────────────────────────────────────────────────────────────────────

/// Current phase of a lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Uninitialized = 0,
    AcquiringInstance = 1,
    Configuring = 2,
    Running = 3,
    StoppingWorker = 4,
    ReleasingInstance = 5,
}

impl LifecycleState {
    /// Convert from u8
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::AcquiringInstance,
            2 => Self::Configuring,
            3 => Self::Running,
            4 => Self::StoppingWorker,
            5 => Self::ReleasingInstance,
            _ => Self::Uninitialized,
        }
    }

    /// Whether an instance is held and may be operated on
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Configuring | Self::Running)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::AcquiringInstance => write!(f, "acquiring instance"),
            Self::Configuring => write!(f, "configuring"),
            Self::Running => write!(f, "running"),
            Self::StoppingWorker => write!(f, "stopping worker"),
            Self::ReleasingInstance => write!(f, "releasing instance"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host Context
// ─────────────────────────────────────────────────────────────────────────────

/// What kind of world the hosting component lives in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HostKind {
    /// A running execution context
    #[default]
    Live,
    /// An editor or preview world
    Preview,
    /// A template/default object that never runs
    Template,
}

/// The component hosting a lifecycle.
#[derive(Clone)]
pub struct HostContext {
    pub kind: HostKind,
    /// Exposed to scripts as `Context`
    pub component: HostObject,
    /// Exposed to scripts as `Root`
    pub owner: Option<HostObject>,
}

impl HostContext {
    pub fn new(kind: HostKind, component: HostObject) -> Self {
        Self {
            kind,
            component,
            owner: None,
        }
    }

    pub fn live(component: HostObject) -> Self {
        Self::new(HostKind::Live, component)
    }

    pub fn with_owner(mut self, owner: HostObject) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn is_live(&self) -> bool {
        self.kind == HostKind::Live
    }
}

/// Result of an initialize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// Host context is not live; nothing happened
    Skipped,
    /// Broker refused the request; still uninitialized
    Rejected,
    /// Waiting for the broker to deliver an instance
    Pending,
}

// ─────────────────────────────────────────────────────────────────────────────
// Instance Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// The instance being operated on, readable without the slot lock.
struct Current {
    instance: Arc<Instance>,
    options: Arc<InstanceOptions>,
}

/// Per-cycle state, only touched with the slot lock held.
#[derive(Default)]
struct Slot {
    options: Option<Arc<InstanceOptions>>,
    pending: Option<oneshot::Receiver<Arc<Instance>>>,
    cancel: Option<CancellationToken>,
    run: Option<ScriptRun>,
    worker: Option<WorkerHandle>,
}

/// Owns one script instance from acquisition to release.
pub struct InstanceLifecycle {
    broker: Arc<dyn InstanceBroker>,
    host: HostContext,
    events: EventPublisher,
    run_state: Arc<RunState>,
    state: AtomicU8,
    current: Mutex<Option<Current>>,
    slot: Mutex<Slot>,
}

impl InstanceLifecycle {
    pub fn new(broker: Arc<dyn InstanceBroker>, host: HostContext) -> Self {
        Self {
            broker,
            host,
            events: EventPublisher::default(),
            run_state: Arc::new(RunState::new()),
            state: AtomicU8::new(LifecycleState::Uninitialized as u8),
            current: Mutex::new(None),
            slot: Mutex::new(Slot::default()),
        }
    }

    /// Publish notifications through an existing publisher.
    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = events;
        self
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: LifecycleState) {
        tracing::debug!(%state, "lifecycle transition");
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn host(&self) -> &HostContext {
        &self.host
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<InstanceEvent> {
        self.events.subscribe()
    }

    pub fn run_state(&self) -> &RunState {
        &self.run_state
    }

    pub fn is_script_running(&self) -> bool {
        self.run_state.is_script_running()
    }

    pub fn is_worker_alive(&self) -> bool {
        self.run_state.is_worker_alive()
    }

    /// The instance currently held, if any.
    pub fn instance(&self) -> Option<Arc<Instance>> {
        self.current.lock().as_ref().map(|c| Arc::clone(&c.instance))
    }

    fn misuse(&self, operation: &'static str, state: LifecycleState) -> InstanceError {
        tracing::error!(operation, %state, "Lifecycle operation called in an invalid state");
        InstanceError::Misuse { operation, state }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Acquisition
    // ─────────────────────────────────────────────────────────────────────────

    /// Ask the broker for an instance configured by `options`.
    pub fn initialize(&self, options: InstanceOptions) -> InstanceResult<InitOutcome> {
        if !self.host.is_live() {
            tracing::debug!(kind = ?self.host.kind, "Skipping initialization outside a live context");
            return Ok(InitOutcome::Skipped);
        }

        let mut slot = self.slot.lock();
        let state = self.state();
        if state != LifecycleState::Uninitialized {
            return Err(self.misuse("initialize", state));
        }

        let options = Arc::new(options);
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let on_ready = ready_callback(ready_tx, cancel.clone(), Arc::clone(&self.broker));

        match self.broker.request_instance(&options, on_ready) {
            RequestResult::Rejected => {
                tracing::warn!("Broker rejected the instance request");
                Ok(InitOutcome::Rejected)
            }
            RequestResult::Queued => {
                slot.options = Some(options);
                slot.pending = Some(ready_rx);
                slot.cancel = Some(cancel);
                self.set_state(LifecycleState::AcquiringInstance);
                Ok(InitOutcome::Pending)
            }
        }
    }

    /// Configure and start the instance if the broker has delivered it.
    ///
    /// Returns `true` when this call moved the lifecycle into `Running`.
    pub fn pump(&self) -> InstanceResult<bool> {
        if self.state() != LifecycleState::AcquiringInstance {
            return Ok(false);
        }

        let mut slot = self.slot.lock();
        if self.state() != LifecycleState::AcquiringInstance {
            return Ok(false);
        }
        let Some(ready_rx) = slot.pending.as_mut() else {
            return Ok(false);
        };

        match ready_rx.try_recv() {
            Ok(instance) => {
                slot.pending = None;
                self.configure(&mut slot, instance).map(|()| true)
            }
            Err(TryRecvError::Empty) => Ok(false),
            Err(TryRecvError::Closed) => {
                self.acquisition_dropped(&mut slot);
                Err(InstanceError::Rejected)
            }
        }
    }

    /// Wait for the broker and configure the instance on this task's thread.
    ///
    /// Returns `false` if the acquisition was cancelled by a teardown.
    /// Cancel safe: if the future is dropped mid-wait the pending request
    /// goes back into the lifecycle, so a later `pump`, `tick` or
    /// `wait_ready` still picks up the delivery.
    pub async fn wait_ready(&self) -> InstanceResult<bool> {
        let (ready_rx, cancel) = {
            let mut slot = self.slot.lock();
            match self.state() {
                LifecycleState::AcquiringInstance => {}
                LifecycleState::Running => return Ok(true),
                _ => return Ok(false),
            }
            match (slot.pending.take(), slot.cancel.clone()) {
                (Some(rx), Some(cancel)) => (rx, cancel),
                (rx, _) => {
                    slot.pending = rx;
                    return Ok(false);
                }
            }
        };

        let mut waiting = PendingWait {
            lifecycle: self,
            ready_rx: Some(ready_rx),
            cancel: cancel.clone(),
        };
        let received = match waiting.ready_rx.as_mut() {
            Some(ready_rx) => tokio::select! {
                biased;

                _ = cancel.cancelled() => None,
                received = ready_rx => Some(received),
            },
            None => None,
        };
        let ready_rx = waiting.ready_rx.take();
        drop(waiting);

        match received {
            None => {
                if let Some(mut ready_rx) = ready_rx {
                    ready_rx.close();
                    if let Ok(instance) = ready_rx.try_recv() {
                        self.broker.release_instance(instance);
                    }
                }
                Ok(false)
            }
            Some(Ok(instance)) => {
                let mut slot = self.slot.lock();
                if cancel.is_cancelled() || self.state() != LifecycleState::AcquiringInstance {
                    self.broker.release_instance(instance);
                    return Ok(false);
                }
                self.configure(&mut slot, instance).map(|()| true)
            }
            Some(Err(_)) => {
                let mut slot = self.slot.lock();
                self.acquisition_dropped(&mut slot);
                Err(InstanceError::Rejected)
            }
        }
    }

    fn acquisition_dropped(&self, slot: &mut Slot) {
        tracing::warn!("Broker dropped the instance request without delivering");
        *slot = Slot::default();
        self.set_state(LifecycleState::Uninitialized);
    }

    fn cancel_acquisition(&self, slot: &mut Slot) {
        if let Some(cancel) = slot.cancel.take() {
            cancel.cancel();
        }
        if let Some(mut ready_rx) = slot.pending.take() {
            ready_rx.close();
            if let Ok(instance) = ready_rx.try_recv() {
                tracing::debug!(instance = %instance.id(), "Returning instance delivered before teardown");
                self.broker.release_instance(instance);
            }
        }
        *slot = Slot::default();
        self.set_state(LifecycleState::Uninitialized);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────────────────

    fn configure(&self, slot: &mut Slot, instance: Arc<Instance>) -> InstanceResult<()> {
        let Some(options) = slot.options.clone() else {
            self.broker.release_instance(instance);
            return Err(self.misuse("configure", self.state()));
        };

        slot.cancel = None;
        self.set_state(LifecycleState::Configuring);
        *self.current.lock() = Some(Current {
            instance: Arc::clone(&instance),
            options: Arc::clone(&options),
        });
        self.run_state.arm();
        tracing::info!(instance = %instance.id(), threading = ?options.threading, "Instance acquired");

        let run = ScriptRun {
            instance: Arc::clone(&instance),
            options: Arc::clone(&options),
            events: self.events.clone(),
            run_state: Arc::clone(&self.run_state),
        };
        slot.run = Some(run.clone());

        let targets = ExposureTargets::new(
            self.host.component.clone(),
            self.host.owner.clone(),
            self.events.clone(),
        );
        if let Err(e) = FeatureExposer::expose_all(&instance, &options.features, &targets) {
            tracing::error!(instance = %instance.id(), error = %e, "Feature exposure failed");
            self.events.publish(InstanceEvent::Failed {
                stage: FailureStage::Exposure,
                message: e.to_string(),
            });
            self.abandon(slot);
            return Err(e);
        }

        match ExecutionModel::from_options(&options).start(run) {
            Ok(worker) => {
                slot.worker = worker;
                self.set_state(LifecycleState::Running);
                Ok(())
            }
            // The instance stays held so teardown still runs end-play and GC.
            Err(e @ InstanceError::Script(_)) => {
                self.set_state(LifecycleState::Running);
                Err(e)
            }
            Err(e) => {
                tracing::error!(instance = %instance.id(), error = %e, "Failed to start execution");
                self.abandon(slot);
                Err(e)
            }
        }
    }

    /// Give the instance back without running the script shutdown sequence.
    fn abandon(&self, slot: &mut Slot) {
        self.run_state.request_stop();
        if let Some(run) = slot.run.as_ref() {
            if run.instance.is_valid() {
                run.instance.context().request_garbage_collection();
            }
        }
        self.release(slot);
    }

    fn release(&self, slot: &mut Slot) {
        self.set_state(LifecycleState::ReleasingInstance);
        *slot = Slot::default();
        let current = self.current.lock().take();
        if let Some(current) = current {
            tracing::info!(instance = %current.instance.id(), "Releasing instance");
            self.broker.release_instance(current.instance);
        }
        self.set_state(LifecycleState::Uninitialized);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Running
    // ─────────────────────────────────────────────────────────────────────────

    /// Host frame update.
    ///
    /// Finishes a pending acquisition first. Under the host-thread strategy
    /// with attach-to-tick, forwards `delta` as a tick notification once the
    /// script is running and returns `true`.
    ///
    /// Frames that arrive while the broker has not answered yet return
    /// `Ok(false)`: hosts tick every frame from the moment they initialize.
    /// Ticking while uninitialized or during teardown is still a `Misuse`.
    pub fn tick(&self, delta: f32) -> InstanceResult<bool> {
        if !self.host.is_live() {
            return Ok(false);
        }

        let mut state = self.state();
        if state == LifecycleState::AcquiringInstance {
            self.pump()?;
            state = self.state();
        }

        match state {
            LifecycleState::AcquiringInstance => Ok(false),
            LifecycleState::Configuring | LifecycleState::Running => {
                let forward = match self.current.lock().as_ref() {
                    Some(current) => {
                        current.options.attach_to_tick
                            && current.options.uses_host_thread()
                            && self.run_state.is_script_running()
                    }
                    None => false,
                };
                if forward {
                    self.events.publish(InstanceEvent::Tick { delta });
                }
                Ok(forward)
            }
            other => Err(self.misuse("tick", other)),
        }
    }

    /// Bind an extra host object into the running instance.
    pub fn expose(&self, name: &str, object: HostObject) -> InstanceResult<()> {
        if !self.host.is_live() {
            return Err(InstanceError::InvalidHostContext);
        }
        let state = self.state();
        if !state.is_active() {
            return Err(self.misuse("expose", state));
        }
        let instance = self.instance().ok_or_else(|| self.misuse("expose", state))?;
        instance.context().expose(name, object)?;
        Ok(())
    }

    /// Publish on the generic message channel.
    pub fn emit(&self, name: &str, payload: &str) {
        self.events.emit(name, payload);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────────────────

    /// Stop the script and hand the instance back to the broker.
    ///
    /// A no-op when already uninitialized. If the worker does not stop within
    /// the configured bound this returns `WorkerStuck` and keeps the
    /// instance; calling `teardown` again resumes the wait.
    pub fn teardown(&self) -> InstanceResult<()> {
        if !self.host.is_live() {
            return Ok(());
        }

        // Checked before locking so a re-entrant call from a script fails
        // instead of deadlocking.
        let state = self.state();
        if matches!(state, LifecycleState::Configuring | LifecycleState::ReleasingInstance) {
            return Err(self.misuse("teardown", state));
        }

        let mut slot = self.slot.lock();
        match self.state() {
            LifecycleState::Uninitialized => Ok(()),
            LifecycleState::AcquiringInstance => {
                self.cancel_acquisition(&mut slot);
                Ok(())
            }
            LifecycleState::Running | LifecycleState::StoppingWorker => self.stop_and_release(&mut slot),
            other => Err(self.misuse("teardown", other)),
        }
    }

    fn stop_and_release(&self, slot: &mut Slot) -> InstanceResult<()> {
        self.run_state.request_stop();
        self.set_state(LifecycleState::StoppingWorker);

        let Some(run) = slot.run.clone() else {
            self.release(slot);
            return Ok(());
        };

        let mut outcome = Ok(());
        match slot.worker.as_mut() {
            Some(worker) => {
                let timeout = run.options.shutdown_timeout;
                let poll = run.options.shutdown_poll_interval;
                match worker.wait_stopped(timeout, poll) {
                    Ok(()) => {}
                    Err(e @ InstanceError::WorkerStuck { .. }) => {
                        tracing::error!(
                            instance = %run.instance.id(),
                            error = %e,
                            "Worker still running; keeping instance until teardown is retried"
                        );
                        self.events.publish(InstanceEvent::Failed {
                            stage: FailureStage::Worker,
                            message: e.to_string(),
                        });
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::error!(instance = %run.instance.id(), error = %e, "Worker ended abnormally");
                        outcome = Err(e);
                    }
                }
            }
            None => ExecutionModel::stop_on_host(&run),
        }

        self.release(slot);
        outcome
    }
}

impl Drop for InstanceLifecycle {
    fn drop(&mut self) {
        if self.state() == LifecycleState::Uninitialized {
            return;
        }
        match self.teardown() {
            Ok(()) => {}
            Err(InstanceError::WorkerStuck { .. }) => self.hand_off_stuck_worker(),
            Err(e) => tracing::error!(error = %e, "Teardown on drop failed"),
        }
    }
}

impl InstanceLifecycle {
    /// Nobody is left to retry the teardown, so a reaper thread waits for the
    /// worker and releases the instance once it has exited.
    fn hand_off_stuck_worker(&mut self) {
        let slot = std::mem::take(&mut *self.slot.lock());
        let current = self.current.lock().take();
        let (Some(worker), Some(current)) = (slot.worker, current) else {
            return;
        };

        let stuck = Arc::new(Mutex::new(Some(StuckWorker {
            worker,
            instance: current.instance,
            options: current.options,
            broker: Arc::clone(&self.broker),
        })));
        self.set_state(LifecycleState::Uninitialized);

        let reaper = Arc::clone(&stuck);
        let spawned = std::thread::Builder::new()
            .name("instance-reaper".to_string())
            .spawn(move || {
                let taken = reaper.lock().take();
                if let Some(stuck) = taken {
                    stuck.reap();
                }
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "Failed to spawn reaper; waiting for the worker on this thread");
            let taken = stuck.lock().take();
            if let Some(stuck) = taken {
                stuck.reap();
            }
        }
    }
}

/// A worker that outlived its lifecycle, with the instance it still runs on.
struct StuckWorker {
    worker: WorkerHandle,
    instance: Arc<Instance>,
    options: Arc<InstanceOptions>,
    broker: Arc<dyn InstanceBroker>,
}

impl StuckWorker {
    fn reap(mut self) {
        let timeout = self.options.shutdown_timeout;
        let poll = self.options.shutdown_poll_interval;
        loop {
            match self.worker.wait_stopped(timeout, poll) {
                Ok(()) => break,
                Err(InstanceError::WorkerStuck { waited }) => {
                    tracing::warn!(instance = %self.instance.id(), ?waited, "Reaper still waiting for worker");
                }
                Err(e) => {
                    tracing::error!(instance = %self.instance.id(), error = %e, "Worker ended abnormally");
                    break;
                }
            }
        }
        tracing::info!(instance = %self.instance.id(), "Releasing instance after worker exit");
        self.broker.release_instance(self.instance);
    }
}

/// Puts the pending receiver back if a `wait_ready` future is dropped
/// while it still holds it.
struct PendingWait<'a> {
    lifecycle: &'a InstanceLifecycle,
    ready_rx: Option<oneshot::Receiver<Arc<Instance>>>,
    cancel: CancellationToken,
}

impl Drop for PendingWait<'_> {
    fn drop(&mut self) {
        let Some(mut ready_rx) = self.ready_rx.take() else {
            return;
        };
        {
            let mut slot = self.lifecycle.slot.lock();
            if !self.cancel.is_cancelled()
                && self.lifecycle.state() == LifecycleState::AcquiringInstance
                && slot.pending.is_none()
            {
                slot.pending = Some(ready_rx);
                return;
            }
        }
        ready_rx.close();
        if let Ok(instance) = ready_rx.try_recv() {
            self.lifecycle.broker.release_instance(instance);
        }
    }
}

/// Build the broker continuation for one acquisition.
///
/// The continuation never touches the lifecycle directly. If the cycle was
/// cancelled, or the lifecycle is gone, the instance goes straight back to
/// the broker.
fn ready_callback(
    ready_tx: oneshot::Sender<Arc<Instance>>,
    cancel: CancellationToken,
    broker: Arc<dyn InstanceBroker>,
) -> ReadyCallback {
    Box::new(move |instance| {
        if cancel.is_cancelled() {
            tracing::debug!(instance = %instance.id(), "Discarding instance delivered after teardown");
            broker.release_instance(instance);
            return;
        }
        if let Err(instance) = ready_tx.send(instance) {
            tracing::debug!(instance = %instance.id(), "Lifecycle gone; returning instance");
            broker.release_instance(instance);
        }
    })
}
