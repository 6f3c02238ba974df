//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::broker::{InstanceBroker, ReadyCallback, RequestResult};
use crate::context::{HostObject, ScriptContext};
use crate::error::ContextError;
use crate::events::{EventPublisher, InstanceEvent};
use crate::instance::{Instance, ThreadOwner};
use crate::options::InstanceOptions;

/// Ordered record of runtime calls.
#[derive(Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == entry)
    }

}

/// A script context that records every call instead of running script.
pub(crate) struct RecordingContext {
    journal: Journal,
    scripts: HashMap<String, String>,
    valid: AtomicBool,
    fail_entry: bool,
    fail_inspector: bool,
    panic_on_entry: bool,
    entry_delay: Duration,
    gc_count: Arc<AtomicUsize>,
    observed: Mutex<Option<broadcast::Receiver<InstanceEvent>>>,
}

impl RecordingContext {
    pub fn new() -> (Self, Journal) {
        let journal = Journal::default();
        let mut scripts = HashMap::new();
        scripts.insert(
            crate::features::ASYNC_BOOTSTRAP.to_string(),
            "Async.callbacks = {};".to_string(),
        );
        let ctx = Self {
            journal: journal.clone(),
            scripts,
            valid: AtomicBool::new(true),
            fail_entry: false,
            fail_inspector: false,
            panic_on_entry: false,
            entry_delay: Duration::ZERO,
            gc_count: Arc::new(AtomicUsize::new(0)),
            observed: Mutex::new(None),
        };
        (ctx, journal)
    }

    pub fn without_script(mut self, name: &str) -> Self {
        self.scripts.remove(name);
        self
    }

    pub fn failing_entry(mut self) -> Self {
        self.fail_entry = true;
        self
    }

    pub fn failing_inspector(mut self) -> Self {
        self.fail_inspector = true;
        self
    }

    pub fn panicking_entry(mut self) -> Self {
        self.panic_on_entry = true;
        self
    }

    pub fn slow_entry(mut self, delay: Duration) -> Self {
        self.entry_delay = delay;
        self
    }

    /// Interleave events from `events` into the journal as `event:<name>`.
    ///
    /// Events are folded in whenever the context is called, so the journal
    /// shows which notifications were published before each runtime call.
    pub fn observe(&self, events: &EventPublisher) {
        *self.observed.lock() = Some(events.subscribe());
    }

    fn record(&self, entry: impl Into<String>) {
        if let Some(rx) = self.observed.lock().as_mut() {
            for event in drain(rx) {
                self.journal.push(format!("event:{}", event.name()));
            }
        }
        self.journal.push(entry);
    }

    pub fn gc_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.gc_count)
    }
}

impl ScriptContext for RecordingContext {
    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn expose(&self, name: &str, _object: HostObject) -> Result<(), ContextError> {
        self.record(format!("expose:{name}"));
        Ok(())
    }

    fn read_script_file(&self, path: &str) -> Result<String, ContextError> {
        self.record(format!("read:{path}"));
        self.scripts
            .get(path)
            .cloned()
            .ok_or_else(|| ContextError::FileNotFound(path.to_string()))
    }

    fn run_script(&self, _content: &str) -> Result<(), ContextError> {
        self.record("run_script");
        Ok(())
    }

    fn run_file(&self, path: &Path) -> Result<(), ContextError> {
        self.record(format!("run_file:{}", path.display()));
        if !self.entry_delay.is_zero() {
            std::thread::sleep(self.entry_delay);
        }
        if self.panic_on_entry {
            panic!("entry script blew up");
        }
        if self.fail_entry {
            return Err(ContextError::Evaluation("ReferenceError: x is not defined".to_string()));
        }
        Ok(())
    }

    fn create_inspector(&self, port: u16) -> Result<(), ContextError> {
        self.record(format!("inspector:{port}"));
        if self.fail_inspector {
            return Err(ContextError::Inspector {
                port,
                reason: "address in use".to_string(),
            });
        }
        Ok(())
    }

    fn request_garbage_collection(&self) {
        self.gc_count.fetch_add(1, Ordering::SeqCst);
        self.record("gc");
    }

    fn expose_module_system(&self) -> Result<(), ContextError> {
        self.record("modules");
        Ok(())
    }
}

/// A broker that parks callbacks until the test fires them.
#[derive(Default)]
pub(crate) struct ManualBroker {
    reject: AtomicBool,
    pending: Mutex<Vec<ReadyCallback>>,
    released: Mutex<Vec<(Uuid, ThreadOwner)>>,
    requests: AtomicUsize,
}

impl ManualBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rejecting() -> Arc<Self> {
        let broker = Self::default();
        broker.reject.store(true, Ordering::SeqCst);
        Arc::new(broker)
    }

    /// Fire the oldest parked callback with `instance`.
    pub fn fulfill(&self, instance: Arc<Instance>) -> bool {
        let callback = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return false;
            }
            pending.remove(0)
        };
        callback(instance);
        true
    }

    /// Drop the oldest parked callback without invoking it.
    pub fn abandon(&self) {
        let mut pending = self.pending.lock();
        if !pending.is_empty() {
            pending.remove(0);
        }
    }

    pub fn released(&self) -> Vec<Uuid> {
        self.released.lock().iter().map(|(id, _)| *id).collect()
    }

    /// Thread ownership each instance reported at the moment it was released.
    pub fn released_owners(&self) -> Vec<ThreadOwner> {
        self.released.lock().iter().map(|(_, owner)| *owner).collect()
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl InstanceBroker for ManualBroker {
    fn request_instance(&self, _options: &InstanceOptions, on_ready: ReadyCallback) -> RequestResult {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return RequestResult::Rejected;
        }
        self.pending.lock().push(on_ready);
        RequestResult::Queued
    }

    fn release_instance(&self, instance: Arc<Instance>) {
        self.released.lock().push((instance.id(), instance.owner()));
    }
}

/// Collect every event currently buffered in `rx`.
pub(crate) fn drain(rx: &mut broadcast::Receiver<InstanceEvent>) -> Vec<InstanceEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let started = Instant::now();
    while !condition() {
        if started.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}
