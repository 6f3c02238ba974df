//! Execution strategies.
//!
//! An instance runs its entry script either synchronously on the host thread
//! or on a dedicated worker thread that it owns exclusively. Both strategies
//! share the same startup sequence:
//!
//! 1. `InstanceReady`, then `ScriptBegin`
//! 2. the entry script runs to completion
//! 3. `BeginPlay`, then `InitPassEnd`
//! 4. the script is marked running
//!
//! Under the host-thread strategy ticks are driven by the host. The worker
//! instead synthesizes its own ticks until the run flag is cleared, then fires
//! `EndPlay` and collects garbage on its own thread before reporting that it
//! is no longer alive.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{InstanceError, InstanceResult};
use crate::events::{EventPublisher, FailureStage, InstanceEvent};
use crate::instance::{Instance, ThreadOwner};
use crate::options::{InstanceOptions, ThreadingPolicy, WorkerHint};
use crate::run_state::RunState;

/// Everything a running script needs, shareable with the worker.
#[derive(Clone)]
pub(crate) struct ScriptRun {
    pub instance: Arc<Instance>,
    pub options: Arc<InstanceOptions>,
    pub events: EventPublisher,
    pub run_state: Arc<RunState>,
}

/// Run the startup sequence on the calling thread.
pub(crate) fn run_default_script(run: &ScriptRun) -> InstanceResult<()> {
    run.events.publish(InstanceEvent::InstanceReady);
    run.events.publish(InstanceEvent::ScriptBegin);

    let entry = &run.options.entry_script;
    if let Err(e) = run.instance.context().run_file(entry) {
        tracing::error!(
            instance = %run.instance.id(),
            script = %entry.display(),
            error = %e,
            "Entry script failed"
        );
        run.events.publish(InstanceEvent::Failed {
            stage: FailureStage::EntryScript,
            message: e.to_string(),
        });
        return Err(InstanceError::Script(e.to_string()));
    }

    run.events.publish(InstanceEvent::BeginPlay);
    run.events.publish(InstanceEvent::InitPassEnd);
    run.run_state.set_script_running(true);
    Ok(())
}

/// Fire `EndPlay` and collect garbage on the calling thread.
fn finish_script(run: &ScriptRun) {
    run.events.publish(InstanceEvent::EndPlay);
    if run.instance.is_valid() {
        run.instance.context().request_garbage_collection();
    }
    run.run_state.set_script_running(false);
}

// ─────────────────────────────────────────────────────────────────────────────
// Execution Model
// ─────────────────────────────────────────────────────────────────────────────

/// The run strategy selected by an instance's threading policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionModel {
    HostThread,
    DedicatedThread(WorkerHint),
}

impl ExecutionModel {
    pub fn from_options(options: &InstanceOptions) -> Self {
        match options.threading {
            ThreadingPolicy::HostThread => ExecutionModel::HostThread,
            ThreadingPolicy::DedicatedThread => ExecutionModel::DedicatedThread(options.worker.clone()),
        }
    }

    pub fn is_host_thread(&self) -> bool {
        matches!(self, ExecutionModel::HostThread)
    }

    /// Begin running the entry script.
    ///
    /// Host-thread runs return once the startup sequence has finished;
    /// dedicated-thread runs return the worker handle right after spawning.
    pub(crate) fn start(&self, run: ScriptRun) -> InstanceResult<Option<WorkerHandle>> {
        match self {
            ExecutionModel::HostThread => {
                run.instance.set_owner(ThreadOwner::Host);
                if run.options.create_inspector {
                    let port = run.options.inspector_port;
                    if let Err(e) = run.instance.context().create_inspector(port) {
                        tracing::warn!(instance = %run.instance.id(), port, error = %e, "Inspector not attached");
                    }
                }
                run_default_script(&run)?;
                Ok(None)
            }
            ExecutionModel::DedicatedThread(hint) => WorkerHandle::spawn(run, hint).map(Some),
        }
    }

    /// Host-thread half of teardown: there is no worker, so `EndPlay` and
    /// garbage collection happen on the calling thread.
    pub(crate) fn stop_on_host(run: &ScriptRun) {
        finish_script(run);
        run.instance.set_owner(ThreadOwner::None);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────────────────────────

/// Clears the worker's flags however the worker exits, unwinding included.
struct AliveGuard<'a> {
    run: &'a ScriptRun,
}

impl Drop for AliveGuard<'_> {
    fn drop(&mut self) {
        self.run.instance.set_owner(ThreadOwner::None);
        self.run.run_state.set_script_running(false);
        self.run.run_state.set_worker_alive(false);
    }
}

fn worker_main(run: ScriptRun, name: String) {
    let _alive = AliveGuard { run: &run };
    run.instance.set_owner(ThreadOwner::Worker);
    tracing::debug!("[worker:{}] Thread started", name);

    let started = run_default_script(&run).is_ok();

    if started && run.options.attach_to_tick {
        let delta = run.options.worker_tick_delta;
        let interval = run.options.worker_tick_interval;
        while run.run_state.should_run() {
            run.events.publish(InstanceEvent::Tick { delta });
            thread::sleep(interval);
        }
    }

    finish_script(&run);
    tracing::debug!("[worker:{}] Thread exiting", name);
}

/// Handle to an instance's dedicated worker thread.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    name: String,
    run_state: Arc<RunState>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    fn spawn(run: ScriptRun, hint: &WorkerHint) -> InstanceResult<Self> {
        let name = hint
            .name
            .clone()
            .unwrap_or_else(|| format!("script-instance-{}", run.instance.id().simple()));

        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(size) = hint.stack_size {
            builder = builder.stack_size(size);
        }

        // Raised before the thread exists so a teardown racing the spawn
        // still waits for it.
        let run_state = Arc::clone(&run.run_state);
        run_state.set_worker_alive(true);

        let worker_name = name.clone();
        let thread = match builder.spawn(move || worker_main(run, worker_name)) {
            Ok(thread) => thread,
            Err(e) => {
                run_state.set_worker_alive(false);
                return Err(InstanceError::SpawnFailed(e));
            }
        };

        tracing::debug!("[spawn_worker] {} spawned", name);
        Ok(Self {
            name,
            run_state,
            thread: Some(thread),
        })
    }

    /// Wait, in short sleeps, until the worker reports it is no longer alive.
    ///
    /// Gives up after `timeout` with `WorkerStuck`; the handle stays usable
    /// so the wait can be resumed.
    pub(crate) fn wait_stopped(&mut self, timeout: Duration, poll: Duration) -> InstanceResult<()> {
        let started = Instant::now();
        while self.run_state.is_worker_alive() {
            let waited = started.elapsed();
            if waited >= timeout {
                tracing::error!("[worker:{}] Still alive after {:?}", self.name, waited);
                return Err(InstanceError::WorkerStuck { waited });
            }
            thread::sleep(poll);
        }

        if let Some(thread) = self.thread.take() {
            thread.join().map_err(|_| InstanceError::WorkerPanic)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingContext, drain, wait_until};

    fn script_run(ctx: RecordingContext, options: InstanceOptions) -> ScriptRun {
        ScriptRun {
            instance: Arc::new(Instance::new(Arc::new(ctx))),
            options: Arc::new(options),
            events: EventPublisher::default(),
            run_state: Arc::new(RunState::new()),
        }
    }

    #[test]
    fn test_startup_sequence_order() {
        let (ctx, journal) = RecordingContext::new();
        let run = script_run(ctx, InstanceOptions::new("main.js"));
        let mut rx = run.events.subscribe();

        ExecutionModel::HostThread.start(run.clone()).unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                InstanceEvent::InstanceReady,
                InstanceEvent::ScriptBegin,
                InstanceEvent::BeginPlay,
                InstanceEvent::InitPassEnd,
            ]
        );
        assert!(run.run_state.is_script_running());
        assert_eq!(run.instance.owner(), ThreadOwner::Host);
        assert_eq!(journal.entries(), vec!["inspector:9229", "run_file:main.js"]);
    }

    #[test]
    fn test_inspector_failure_is_not_fatal() {
        let (ctx, journal) = RecordingContext::new();
        let run = script_run(ctx.failing_inspector(), InstanceOptions::new("main.js"));

        ExecutionModel::HostThread.start(run.clone()).unwrap();
        assert!(run.run_state.is_script_running());
        assert_eq!(journal.entries(), vec!["inspector:9229", "run_file:main.js"]);
    }

    #[test]
    fn test_inspector_disabled() {
        let (ctx, journal) = RecordingContext::new();
        let options = InstanceOptions::new("main.js").with_inspector(false, 9229);
        let run = script_run(ctx, options);

        ExecutionModel::HostThread.start(run).unwrap();
        assert_eq!(journal.entries(), vec!["run_file:main.js"]);
    }

    #[test]
    fn test_entry_failure_stops_startup() {
        let (ctx, _journal) = RecordingContext::new();
        let run = script_run(ctx.failing_entry(), InstanceOptions::new("main.js"));
        let mut rx = run.events.subscribe();

        let Err(err) = ExecutionModel::HostThread.start(run.clone()) else {
            panic!("entry failure should stop startup");
        };
        assert!(matches!(err, InstanceError::Script(_)));
        assert!(!run.run_state.is_script_running());

        let events = drain(&mut rx);
        assert_eq!(events[0], InstanceEvent::InstanceReady);
        assert_eq!(events[1], InstanceEvent::ScriptBegin);
        assert!(matches!(
            events[2],
            InstanceEvent::Failed { stage: FailureStage::EntryScript, .. }
        ));
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_worker_ticks_until_stopped() {
        let (ctx, journal) = RecordingContext::new();
        let gc = ctx.gc_counter();
        let options = InstanceOptions::new("main.js")
            .with_threading(ThreadingPolicy::DedicatedThread)
            .attach_to_tick(true);
        let run = script_run(ctx, options);
        let mut rx = run.events.subscribe();
        run.run_state.arm();

        let model = ExecutionModel::from_options(&run.options);
        let mut worker = model.start(run.clone()).unwrap().unwrap();
        assert!(run.run_state.is_worker_alive());
        assert!(wait_until(Duration::from_secs(5), || run.run_state.is_script_running()));
        assert!(wait_until(Duration::from_secs(5), || rx.len() > 4));

        run.run_state.request_stop();
        worker
            .wait_stopped(Duration::from_secs(5), Duration::from_micros(100))
            .unwrap();

        assert!(!run.run_state.is_worker_alive());
        assert!(!run.run_state.is_script_running());
        assert_eq!(run.instance.owner(), ThreadOwner::None);
        assert_eq!(gc.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!journal.entries().iter().any(|e| e.starts_with("inspector")));

        let events = drain(&mut rx);
        assert_eq!(events[0..4], [
            InstanceEvent::InstanceReady,
            InstanceEvent::ScriptBegin,
            InstanceEvent::BeginPlay,
            InstanceEvent::InitPassEnd,
        ]);
        assert!(events.iter().any(|e| matches!(e, InstanceEvent::Tick { delta } if *delta == 0.001)));
        assert_eq!(events.last(), Some(&InstanceEvent::EndPlay));
    }

    #[test]
    fn test_worker_without_tick_exits_after_startup() {
        let (ctx, _journal) = RecordingContext::new();
        let options = InstanceOptions::new("main.js").with_threading(ThreadingPolicy::DedicatedThread);
        let run = script_run(ctx, options);
        let mut rx = run.events.subscribe();
        run.run_state.arm();

        let mut worker = ExecutionModel::from_options(&run.options)
            .start(run.clone())
            .unwrap()
            .unwrap();
        worker
            .wait_stopped(Duration::from_secs(5), Duration::from_micros(100))
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&InstanceEvent::EndPlay));
        assert!(!events.iter().any(|e| matches!(e, InstanceEvent::Tick { .. })));
    }

    #[test]
    fn test_wait_is_bounded() {
        let (ctx, _journal) = RecordingContext::new();
        let options = InstanceOptions::new("main.js").with_threading(ThreadingPolicy::DedicatedThread);
        let run = script_run(ctx.slow_entry(Duration::from_millis(300)), options);
        run.run_state.arm();

        let mut worker = ExecutionModel::from_options(&run.options)
            .start(run.clone())
            .unwrap()
            .unwrap();

        let err = worker
            .wait_stopped(Duration::from_millis(20), Duration::from_micros(100))
            .unwrap_err();
        assert!(matches!(err, InstanceError::WorkerStuck { .. }));
        assert!(run.run_state.is_worker_alive());

        worker
            .wait_stopped(Duration::from_secs(5), Duration::from_micros(100))
            .unwrap();
        assert!(!run.run_state.is_worker_alive());
    }

    #[test]
    fn test_worker_panic_clears_alive_flag() {
        let (ctx, _journal) = RecordingContext::new();
        let options = InstanceOptions::new("main.js").with_threading(ThreadingPolicy::DedicatedThread);
        let run = script_run(ctx.panicking_entry(), options);
        run.run_state.arm();

        let mut worker = ExecutionModel::from_options(&run.options)
            .start(run.clone())
            .unwrap()
            .unwrap();

        let err = worker
            .wait_stopped(Duration::from_secs(5), Duration::from_micros(100))
            .unwrap_err();
        assert!(matches!(err, InstanceError::WorkerPanic));
        assert!(!run.run_state.is_worker_alive());
    }

    #[test]
    fn test_named_worker_thread() {
        let hint = WorkerHint {
            name: Some("ai-script".to_string()),
            stack_size: Some(512 * 1024),
        };
        let options = InstanceOptions::new("main.js")
            .with_threading(ThreadingPolicy::DedicatedThread)
            .with_worker(hint.clone());
        assert_eq!(ExecutionModel::from_options(&options), ExecutionModel::DedicatedThread(hint));
        assert!(ExecutionModel::from_options(&InstanceOptions::default()).is_host_thread());
    }
}
