use crate::listener::TestListener;
use crate::unit::{TestOutcome, TestResult};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ResultKind {
    Pass,
    Fail,
    Error,
    Skipped,
    TimedOut,
}

impl ResultKind {
    pub const ALL: [ResultKind; 5] = [
        ResultKind::Pass,
        ResultKind::Fail,
        ResultKind::Error,
        ResultKind::Skipped,
        ResultKind::TimedOut,
    ];

    /// Invokes the listener callback matching this kind.
    pub fn dispatch(self, result: &TestResult, listener: &mut dyn TestListener) -> anyhow::Result<()> {
        match self {
            ResultKind::Pass => listener.on_test_success(result),
            ResultKind::Fail => listener.on_test_failure(result),
            ResultKind::Error => listener.on_test_error(result),
            ResultKind::Skipped => listener.on_test_skipped(result),
            ResultKind::TimedOut => listener.on_test_timeout(result),
        }
    }
}

/// Maps every possible result to exactly one [`ResultKind`].
pub trait ResultClassifier: Send + Sync {
    fn classify(&self, result: &TestResult) -> ResultKind;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultResultClassifier;

impl ResultClassifier for DefaultResultClassifier {
    fn classify(&self, result: &TestResult) -> ResultKind {
        match result.outcome {
            TestOutcome::Passed => ResultKind::Pass,
            TestOutcome::Failed(_) => ResultKind::Fail,
            TestOutcome::Errored(_) => ResultKind::Error,
            TestOutcome::Skipped => ResultKind::Skipped,
            TestOutcome::TimedOut(_) => ResultKind::TimedOut,
        }
    }
}
