use crate::unit::{ResultCollector, TestResult, TestUnit};
use crate::vm::Program;
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

const COMPLETION_POLL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("container no longer accepts work")]
    ShutDown,
    #[error("every worker has exited")]
    WorkersGone,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Results produced by any number of workers, consumed by one reader.
///
/// The source keeps its own sender, so the channel never disconnects while
/// the source is alive.
#[derive(Debug)]
pub struct ResultSource {
    sender: Sender<TestResult>,
    receiver: Receiver<TestResult>,
}

impl Default for ResultSource {
    fn default() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }
}

impl ResultSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results_available(&self) -> bool {
        !self.receiver.is_empty()
    }

    /// Removes and returns everything queued so far.
    pub fn take_available(&self) -> Vec<TestResult> {
        self.receiver.try_iter().collect()
    }

    /// The receiving end, for callers that wait on results alongside other
    /// channels.
    pub fn receiver(&self) -> &Receiver<TestResult> {
        &self.receiver
    }
}

impl ResultCollector for ResultSource {
    fn notify_end(&self, result: TestResult) {
        // The source owns a receiver, so the send cannot fail.
        let _ = self.sender.send(result);
    }
}

/// Where submitted units run.
///
/// A container accepts units until it is told to shut down once processing
/// completes. Every result lands in its [`ResultSource`].
pub trait Container: Send + Sync {
    /// Hands a unit over for execution. May block to apply back-pressure.
    fn submit(&self, unit: Arc<dyn TestUnit>) -> Result<(), ContainerError>;

    fn result_source(&self) -> &ResultSource;

    /// No more units will be submitted; work already accepted still runs.
    fn shutdown_when_processing_complete(&self);

    /// Waits briefly for accepted work to finish. Returns `true` once every
    /// accepted unit has completed after shutdown.
    fn await_completion(&self) -> bool;
}

/// Runs each unit on the submitting thread.
#[derive(Debug)]
pub struct SerialContainer {
    program: Program,
    results: ResultSource,
    shut: AtomicBool,
}

impl SerialContainer {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            results: ResultSource::new(),
            shut: AtomicBool::new(false),
        }
    }
}

impl Container for SerialContainer {
    fn submit(&self, unit: Arc<dyn TestUnit>) -> Result<(), ContainerError> {
        if self.shut.load(Ordering::Acquire) {
            return Err(ContainerError::ShutDown);
        }
        unit.execute(&self.program, &self.results);
        Ok(())
    }

    fn result_source(&self) -> &ResultSource {
        &self.results
    }

    fn shutdown_when_processing_complete(&self) {
        self.shut.store(true, Ordering::Release);
    }

    fn await_completion(&self) -> bool {
        self.shut.load(Ordering::Acquire)
    }
}

/// A fixed set of named workers fed through a bounded channel.
///
/// `submit` blocks while the channel is full.
pub struct ThreadPoolContainer {
    jobs: Mutex<Option<Sender<Arc<dyn TestUnit>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    results: Arc<ResultSource>,
}

impl ThreadPoolContainer {
    /// Starts the workers.
    ///
    /// # Arguments
    /// * `program`: The program variant every unit runs against.
    /// * `threads`: Number of workers, at least one.
    /// * `queue_capacity`: Units that may wait for a worker before `submit`
    ///   blocks, at least one.
    pub fn new(program: Program, threads: usize, queue_capacity: usize) -> Result<Self, ContainerError> {
        let (jobs, receiver) = bounded::<Arc<dyn TestUnit>>(queue_capacity.max(1));
        let results = Arc::new(ResultSource::new());

        let mut workers = Vec::with_capacity(threads.max(1));
        for id in 0..threads.max(1) {
            let receiver = receiver.clone();
            let results = Arc::clone(&results);
            let program = program.clone();
            let handle = thread::Builder::new()
                .name(format!("gauntlet-worker-{id}"))
                .spawn(move || worker_loop(id, &receiver, &program, &results))?;
            workers.push(handle);
        }
        debug!(threads = workers.len(), queue_capacity, "started worker pool");

        Ok(Self {
            jobs: Mutex::new(Some(jobs)),
            workers: Mutex::new(workers),
            results,
        })
    }
}

fn worker_loop(id: usize, jobs: &Receiver<Arc<dyn TestUnit>>, program: &Program, results: &ResultSource) {
    for unit in jobs.iter() {
        trace!(worker = id, test = %unit.description(), "running unit");
        unit.execute(program, results);
    }
    trace!(worker = id, "worker exiting");
}

impl Container for ThreadPoolContainer {
    fn submit(&self, unit: Arc<dyn TestUnit>) -> Result<(), ContainerError> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|_| ContainerError::ShutDown)?
            .clone()
            .ok_or(ContainerError::ShutDown)?;
        jobs.send(unit).map_err(|_| ContainerError::WorkersGone)
    }

    fn result_source(&self) -> &ResultSource {
        &self.results
    }

    fn shutdown_when_processing_complete(&self) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.take();
        }
    }

    fn await_completion(&self) -> bool {
        let Ok(mut workers) = self.workers.lock() else {
            return true;
        };
        if workers.iter().any(|w| !w.is_finished()) {
            drop(workers);
            thread::sleep(COMPLETION_POLL);
            return false;
        }
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{FnTestUnit, TestOutcome};
    use std::sync::atomic::AtomicUsize;

    fn units(n: usize, counter: &Arc<AtomicUsize>) -> Vec<Arc<dyn TestUnit>> {
        (0..n)
            .map(|i| {
                let counter = Arc::clone(counter);
                Arc::new(FnTestUnit::new("demo", &format!("t{i}"), move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })) as Arc<dyn TestUnit>
            })
            .collect()
    }

    fn drain(container: &dyn Container) -> Vec<TestResult> {
        container.shutdown_when_processing_complete();
        let mut results = Vec::new();
        loop {
            let done = container.await_completion();
            results.extend(container.result_source().take_available());
            if done && !container.result_source().results_available() {
                return results;
            }
        }
    }

    #[test]
    fn serial_container_runs_on_submit_and_rejects_after_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let container = SerialContainer::new(Program::new(Vec::new()));
        for unit in units(3, &counter) {
            container.submit(unit).expect("serial container accepts work");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(drain(&container).len(), 3);
        assert!(matches!(
            container.submit(units(1, &counter).remove(0)),
            Err(ContainerError::ShutDown)
        ));
    }

    #[test]
    fn pool_delivers_every_result_through_a_small_queue() {
        let counter = Arc::new(AtomicUsize::new(0));
        let container = ThreadPoolContainer::new(Program::new(Vec::new()), 3, 1).expect("pool starts");
        for unit in units(40, &counter) {
            container.submit(unit).expect("pool accepts work");
        }
        let results = drain(&container);
        assert_eq!(results.len(), 40);
        assert_eq!(counter.load(Ordering::SeqCst), 40);
        assert!(results.iter().all(|r| r.outcome == TestOutcome::Passed));
        assert!(matches!(
            container.submit(units(1, &counter).remove(0)),
            Err(ContainerError::ShutDown)
        ));
    }

    #[test]
    fn result_source_hands_out_each_result_once() {
        let source = Arc::new(ResultSource::new());
        assert!(!source.results_available());
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let writer = Arc::clone(&source);
                thread::spawn(move || {
                    writer.notify_end(TestResult::new(
                        crate::unit::Description::new("demo", &format!("w{i}")),
                        TestOutcome::Passed,
                        Duration::ZERO,
                    ));
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer thread panicked");
        }
        assert!(source.results_available());
        assert_eq!(source.take_available().len(), 4);
        assert!(source.take_available().is_empty());
    }
}
