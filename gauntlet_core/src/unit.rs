use crate::vm::Program;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Identity of a single runnable test.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Description {
    /// The suite the test belongs to.
    pub class: String,
    pub name: String,
}

impl Description {
    pub fn new(class: &str, name: &str) -> Self {
        Self {
            class: class.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for Description {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.class, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    /// An assertion did not hold.
    Failed(String),
    /// The test stopped for any other reason.
    Errored(String),
    Skipped,
    /// The test exceeded its allowed time.
    TimedOut(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResult {
    pub description: Description,
    pub outcome: TestOutcome,
    pub duration: Duration,
}

impl TestResult {
    pub fn new(description: Description, outcome: TestOutcome, duration: Duration) -> Self {
        Self {
            description,
            outcome,
            duration,
        }
    }
}

/// Receives results as units finish.
///
/// Collectors are shared between every worker of a container, so a single
/// collector may be notified from several threads at once.
pub trait ResultCollector: Send + Sync {
    /// Called before a unit starts executing.
    fn notify_start(&self, _description: &Description) {}

    /// Called exactly once per executed test with its final result.
    fn notify_end(&self, result: TestResult);
}

/// A runnable piece of a test suite.
///
/// Units are immutable once built. Narrowing a unit with [`TestUnit::filter`]
/// produces new units and never alters the original.
pub trait TestUnit: Send + Sync + fmt::Debug {
    fn description(&self) -> &Description;

    /// Runs the unit against `program`, reporting every result to `collector`.
    ///
    /// Implementations must not panic; test failures of any kind are reported
    /// as results.
    fn execute(&self, program: &Program, collector: &dyn ResultCollector);

    /// The runnable leaves of this unit whose descriptions satisfy `predicate`.
    fn filter(&self, predicate: &dyn Fn(&Description) -> bool) -> Vec<Arc<dyn TestUnit>>;
}

pub type TestFn = dyn Fn(&Program) -> anyhow::Result<()> + Send + Sync;

/// Extracts a printable message from a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn is_assertion(message: &str) -> bool {
    message.starts_with("assertion")
}

/// A test written as a closure over the program under test.
///
/// A returned error is an error outcome. A panic raised by one of the
/// `assert!` family is a failure; any other panic is an error.
#[derive(Clone)]
pub struct FnTestUnit {
    description: Description,
    body: Arc<TestFn>,
}

impl fmt::Debug for FnTestUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTestUnit")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl FnTestUnit {
    pub fn new<F>(class: &str, name: &str, body: F) -> Self
    where
        F: Fn(&Program) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            description: Description::new(class, name),
            body: Arc::new(body),
        }
    }
}

impl TestUnit for FnTestUnit {
    fn description(&self) -> &Description {
        &self.description
    }

    fn execute(&self, program: &Program, collector: &dyn ResultCollector) {
        collector.notify_start(&self.description);
        let start = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| (self.body)(program)));
        let outcome = match result {
            Ok(Ok(())) => TestOutcome::Passed,
            Ok(Err(e)) => TestOutcome::Errored(format!("{e:#}")),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                if is_assertion(&message) {
                    TestOutcome::Failed(message)
                } else {
                    TestOutcome::Errored(message)
                }
            }
        };
        collector.notify_end(TestResult::new(
            self.description.clone(),
            outcome,
            start.elapsed(),
        ));
    }

    fn filter(&self, predicate: &dyn Fn(&Description) -> bool) -> Vec<Arc<dyn TestUnit>> {
        if predicate(&self.description) {
            vec![Arc::new(self.clone())]
        } else {
            Vec::new()
        }
    }
}

/// Several units run one after another under a shared description.
#[derive(Debug, Clone)]
pub struct TestGroup {
    description: Description,
    units: Vec<Arc<dyn TestUnit>>,
}

impl TestGroup {
    pub fn new(class: &str, units: Vec<Arc<dyn TestUnit>>) -> Self {
        Self {
            description: Description::new(class, "*"),
            units,
        }
    }

    pub fn units(&self) -> &[Arc<dyn TestUnit>] {
        &self.units
    }
}

impl TestUnit for TestGroup {
    fn description(&self) -> &Description {
        &self.description
    }

    fn execute(&self, program: &Program, collector: &dyn ResultCollector) {
        for unit in &self.units {
            unit.execute(program, collector);
        }
    }

    fn filter(&self, predicate: &dyn Fn(&Description) -> bool) -> Vec<Arc<dyn TestUnit>> {
        self.units.iter().flat_map(|u| u.filter(predicate)).collect()
    }
}

/// An in-memory collector, in arrival order.
#[derive(Debug, Default)]
pub struct ResultBuffer {
    results: Mutex<Vec<TestResult>>,
}

impl ResultBuffer {
    pub fn into_results(self) -> Vec<TestResult> {
        self.results
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ResultCollector for ResultBuffer {
    fn notify_end(&self, result: TestResult) {
        let mut results = self
            .results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        results.push(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    fn run(unit: &dyn TestUnit) -> Vec<TestResult> {
        let buffer = ResultBuffer::default();
        unit.execute(&Program::new(Vec::new()), &buffer);
        buffer.into_results()
    }

    #[test]
    fn outcomes_follow_how_the_body_ends() {
        let pass = FnTestUnit::new("demo", "pass", |_| Ok(()));
        let fail = FnTestUnit::new("demo", "fail", |_| {
            assert_eq!(1 + 1, 3);
            Ok(())
        });
        let error = FnTestUnit::new("demo", "error", |_| bail!("no such date"));
        let boom = FnTestUnit::new("demo", "boom", |_| panic!("index out of range"));

        assert_eq!(run(&pass)[0].outcome, TestOutcome::Passed);
        assert!(matches!(run(&fail)[0].outcome, TestOutcome::Failed(_)));
        assert_eq!(run(&error)[0].outcome, TestOutcome::Errored("no such date".into()));
        assert_eq!(run(&boom)[0].outcome, TestOutcome::Errored("index out of range".into()));
    }

    #[test]
    fn group_runs_children_in_order_and_filters_to_leaves() {
        let group = TestGroup::new(
            "demo",
            vec![
                Arc::new(FnTestUnit::new("demo", "a", |_| Ok(()))),
                Arc::new(FnTestUnit::new("demo", "b", |_| Ok(()))),
                Arc::new(FnTestUnit::new("demo", "c", |_| Ok(()))),
            ],
        );
        let names: Vec<String> = run(&group).into_iter().map(|r| r.description.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let narrowed = group.filter(&|d| d.name != "b");
        let names: Vec<&str> = narrowed.iter().map(|u| u.description().name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(group.units().len(), 3);
    }
}
