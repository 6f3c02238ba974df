//! Flags shared between the host thread and the worker thread.
//!
//! These three flags are the only state both threads touch. Everything else
//! is either immutable after configuration or confined to one thread.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct RunState {
    /// Cleared by the host to ask the tick loop to exit
    should_run: AtomicBool,
    /// Set once the startup sequence has finished
    script_running: AtomicBool,
    /// True from worker spawn until the worker has fully finished
    worker_alive: AtomicBool,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_run(&self) -> bool {
        self.should_run.load(Ordering::SeqCst)
    }

    pub fn is_script_running(&self) -> bool {
        self.script_running.load(Ordering::SeqCst)
    }

    pub fn is_worker_alive(&self) -> bool {
        self.worker_alive.load(Ordering::SeqCst)
    }

    /// Raise the run flag for a new cycle.
    pub(crate) fn arm(&self) {
        self.script_running.store(false, Ordering::SeqCst);
        self.should_run.store(true, Ordering::SeqCst);
    }

    /// Ask any active tick loop to exit on its next iteration.
    pub(crate) fn request_stop(&self) {
        self.should_run.store(false, Ordering::SeqCst);
    }

    pub(crate) fn set_script_running(&self, running: bool) {
        self.script_running.store(running, Ordering::SeqCst);
    }

    pub(crate) fn set_worker_alive(&self, alive: bool) {
        self.worker_alive.store(alive, Ordering::SeqCst);
    }
}
