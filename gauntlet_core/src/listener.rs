use crate::unit::{Description, TestResult};

/// Receives the lifecycle events of one scheduler run.
///
/// Every callback may fail. What happens to the rest of the run when a
/// listener fails is decided by the scheduler's
/// [`ListenerFailurePolicy`](crate::scheduler::ListenerFailurePolicy).
///
/// Callbacks are always made from the thread that called
/// [`Scheduler::run`](crate::scheduler::Scheduler::run), never from a worker.
pub trait TestListener: Send {
    /// Returns a name identifying the listener in logs.
    fn name(&self) -> &str;

    /// Called once before any unit is submitted.
    fn on_run_start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_test_success(&mut self, _result: &TestResult) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_test_failure(&mut self, _result: &TestResult) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_test_error(&mut self, _result: &TestResult) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_test_skipped(&mut self, _result: &TestResult) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_test_timeout(&mut self, _result: &TestResult) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called exactly once, after every result has been dispatched.
    fn on_run_end(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    RunStart,
    Success(Description),
    Failure(Description),
    Error(Description),
    Skipped(Description),
    Timeout(Description),
    RunEnd,
}

/// Keeps every event it sees, in order.
#[derive(Debug, Default)]
pub struct RecordingListener {
    pub events: Vec<ListenerEvent>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptions of every per-test event, in dispatch order.
    pub fn tests(&self) -> Vec<&Description> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ListenerEvent::Success(d)
                | ListenerEvent::Failure(d)
                | ListenerEvent::Error(d)
                | ListenerEvent::Skipped(d)
                | ListenerEvent::Timeout(d) => Some(d),
                ListenerEvent::RunStart | ListenerEvent::RunEnd => None,
            })
            .collect()
    }

    pub fn count(&self, event: &ListenerEvent) -> usize {
        self.events.iter().filter(|e| *e == event).count()
    }
}

impl TestListener for RecordingListener {
    fn name(&self) -> &str {
        "recording"
    }

    fn on_run_start(&mut self) -> anyhow::Result<()> {
        self.events.push(ListenerEvent::RunStart);
        Ok(())
    }

    fn on_test_success(&mut self, result: &TestResult) -> anyhow::Result<()> {
        self.events.push(ListenerEvent::Success(result.description.clone()));
        Ok(())
    }

    fn on_test_failure(&mut self, result: &TestResult) -> anyhow::Result<()> {
        self.events.push(ListenerEvent::Failure(result.description.clone()));
        Ok(())
    }

    fn on_test_error(&mut self, result: &TestResult) -> anyhow::Result<()> {
        self.events.push(ListenerEvent::Error(result.description.clone()));
        Ok(())
    }

    fn on_test_skipped(&mut self, result: &TestResult) -> anyhow::Result<()> {
        self.events.push(ListenerEvent::Skipped(result.description.clone()));
        Ok(())
    }

    fn on_test_timeout(&mut self, result: &TestResult) -> anyhow::Result<()> {
        self.events.push(ListenerEvent::Timeout(result.description.clone()));
        Ok(())
    }

    fn on_run_end(&mut self) -> anyhow::Result<()> {
        self.events.push(ListenerEvent::RunEnd);
        Ok(())
    }
}
