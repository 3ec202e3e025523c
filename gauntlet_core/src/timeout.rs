use crate::coverage::TestCoverage;
use crate::unit::{Description, ResultBuffer, ResultCollector, TestOutcome, TestResult, TestUnit};
use crate::vm::Program;
use crossbeam_channel::{RecvTimeoutError, bounded};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT_FACTOR: f64 = 1.25;
pub const DEFAULT_TIMEOUT_CONSTANT: Duration = Duration::from_millis(4000);

/// Derives the time a test may take from how long it normally takes.
pub trait TimeoutLengthStrategy: Send + Sync + fmt::Debug {
    fn allowed_time(&self, normal: Duration) -> Duration;
}

/// `normal * factor + constant`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PercentAndConstantTimeoutStrategy {
    pub factor: f64,
    pub constant: Duration,
}

impl Default for PercentAndConstantTimeoutStrategy {
    fn default() -> Self {
        Self {
            factor: DEFAULT_TIMEOUT_FACTOR,
            constant: DEFAULT_TIMEOUT_CONSTANT,
        }
    }
}

impl TimeoutLengthStrategy for PercentAndConstantTimeoutStrategy {
    fn allowed_time(&self, normal: Duration) -> Duration {
        normal.mul_f64(self.factor.max(0.0)) + self.constant
    }
}

/// Runs the wrapped unit on its own thread and gives up on it once the
/// allowed time has passed.
///
/// A unit that overruns is reported as timed out and its thread is left
/// detached; the interpreter's step budget bounds how long it can linger.
#[derive(Debug, Clone)]
pub struct TimeoutDecoratedUnit {
    inner: Arc<dyn TestUnit>,
    allowed: Duration,
}

impl TimeoutDecoratedUnit {
    pub fn new(inner: Arc<dyn TestUnit>, allowed: Duration) -> Self {
        Self { inner, allowed }
    }

    pub fn allowed(&self) -> Duration {
        self.allowed
    }
}

impl TestUnit for TimeoutDecoratedUnit {
    fn description(&self) -> &Description {
        self.inner.description()
    }

    fn execute(&self, program: &Program, collector: &dyn ResultCollector) {
        let description = self.description().clone();
        let (tx, rx) = bounded(1);
        let inner = Arc::clone(&self.inner);
        let program = program.clone();

        let spawned = thread::Builder::new()
            .name(format!("gauntlet-test-{}", description.name))
            .spawn(move || {
                let buffer = ResultBuffer::default();
                inner.execute(&program, &buffer);
                let _ = tx.send(buffer.into_results());
            });
        if let Err(e) = spawned {
            collector.notify_end(TestResult::new(
                description,
                TestOutcome::Errored(format!("could not start test thread: {e}")),
                Duration::ZERO,
            ));
            return;
        }

        match rx.recv_timeout(self.allowed) {
            Ok(results) => results.into_iter().for_each(|r| collector.notify_end(r)),
            Err(RecvTimeoutError::Timeout) => {
                debug!(test = %description, allowed = ?self.allowed, "test timed out");
                collector.notify_end(TestResult::new(
                    description,
                    TestOutcome::TimedOut(self.allowed),
                    self.allowed,
                ));
            }
            Err(RecvTimeoutError::Disconnected) => {
                collector.notify_end(TestResult::new(
                    description,
                    TestOutcome::Errored("test thread exited without a result".to_string()),
                    Duration::ZERO,
                ));
            }
        }
    }

    fn filter(&self, predicate: &dyn Fn(&Description) -> bool) -> Vec<Arc<dyn TestUnit>> {
        self.inner
            .filter(predicate)
            .into_iter()
            .map(|unit| Arc::new(Self::new(unit, self.allowed)) as Arc<dyn TestUnit>)
            .collect()
    }
}

/// Turns coverage records back into runnable, time-limited units.
#[derive(Debug, Clone)]
pub struct TimeoutDecoratedTestSource {
    units: BTreeMap<Description, Arc<dyn TestUnit>>,
    strategy: Arc<dyn TimeoutLengthStrategy>,
}

impl TimeoutDecoratedTestSource {
    /// Indexes every leaf of `units` by description.
    pub fn new(units: &[Arc<dyn TestUnit>], strategy: Arc<dyn TimeoutLengthStrategy>) -> Self {
        let units = units
            .iter()
            .flat_map(|u| u.filter(&|_| true))
            .map(|u| (u.description().clone(), u))
            .collect();
        Self { units, strategy }
    }

    /// One decorated unit per record whose test is known, in record order.
    pub fn translate_tests(&self, tests: &[TestCoverage]) -> Vec<Arc<dyn TestUnit>> {
        tests
            .iter()
            .filter_map(|record| {
                let Some(unit) = self.units.get(&record.test) else {
                    warn!(test = %record.test, "no unit matches covering test");
                    return None;
                };
                let allowed = self.strategy.allowed_time(record.duration);
                Some(Arc::new(TimeoutDecoratedUnit::new(Arc::clone(unit), allowed)) as Arc<dyn TestUnit>)
            })
            .collect()
    }
}
