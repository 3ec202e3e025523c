use crate::classifier::{DefaultResultClassifier, ResultClassifier, ResultKind};
use crate::container::{Container, ContainerError};
use crate::listener::TestListener;
use crate::unit::{Description, TestResult, TestUnit};
use crossbeam_channel::{Receiver, bounded, select};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Upper bound on how long the drain loop blocks when neither a result nor
/// the feeder's report arrives.
const FEEDER_JOIN_POLL: Duration = Duration::from_millis(100);

/// Errors that end a scheduler run early.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("failed to start feeder thread: {0}")]
    Spawn(#[from] std::io::Error),
    /// A listener failed while the run used [`ListenerFailurePolicy::Propagate`].
    #[error("listener `{listener}` failed: {source}")]
    Listener {
        listener: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("feeder stopped after submitting {submitted} of {total} units: {source}")]
    Feed {
        submitted: usize,
        total: usize,
        #[source]
        source: ContainerError,
    },
    #[error("feeder thread exited without reporting")]
    FeederLost,
}

/// What a listener error does to the rest of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListenerFailurePolicy {
    /// Log the failure and keep dispatching.
    #[default]
    Isolate,
    /// Stop dispatching and fail the run once `on_run_end` has fired.
    Propagate,
}

pub type PriorityKey = dyn Fn(&Description) -> i64 + Send + Sync;

/// Order in which units are handed to the container.
#[derive(Clone, Default)]
pub enum OrderStrategy {
    #[default]
    DeclarationOrder,
    /// A shuffle that is reproducible for a given seed.
    RandomOrder { seed: u64 },
    /// Ascending by key; ties keep declaration order.
    PriorityOrder(Arc<PriorityKey>),
}

impl fmt::Debug for OrderStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStrategy::DeclarationOrder => f.write_str("DeclarationOrder"),
            OrderStrategy::RandomOrder { seed } => write!(f, "RandomOrder {{ seed: {seed} }}"),
            OrderStrategy::PriorityOrder(_) => f.write_str("PriorityOrder"),
        }
    }
}

impl OrderStrategy {
    /// Reorders `units` according to the strategy.
    ///
    /// # Returns
    /// The same units, in submission order.
    pub fn order(&self, mut units: Vec<Arc<dyn TestUnit>>) -> Vec<Arc<dyn TestUnit>> {
        match self {
            OrderStrategy::DeclarationOrder => {}
            OrderStrategy::RandomOrder { seed } => {
                let mut rng = ChaCha8Rng::seed_from_u64(*seed);
                units.shuffle(&mut rng);
            }
            OrderStrategy::PriorityOrder(key) => units.sort_by_key(|u| key(u.description())),
        }
        units
    }
}

/// Units narrowed to the leaves whose descriptions satisfy `predicate`.
pub fn filter_units(
    units: &[Arc<dyn TestUnit>],
    predicate: &dyn Fn(&Description) -> bool,
) -> Vec<Arc<dyn TestUnit>> {
    units.iter().flat_map(|u| u.filter(predicate)).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub submitted: usize,
    pub dispatched: usize,
    pub counts: BTreeMap<ResultKind, usize>,
}

impl RunSummary {
    pub fn count(&self, kind: ResultKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }
}

/// Drives one run: feeds units to a container on a background thread while
/// the calling thread classifies results and notifies listeners.
pub struct Scheduler {
    order: OrderStrategy,
    classifier: Arc<dyn ResultClassifier>,
    policy: ListenerFailurePolicy,
}

impl Scheduler {
    /// Creates a scheduler with the default classifier and
    /// [`ListenerFailurePolicy::Isolate`].
    ///
    /// # Arguments
    /// * `order`: How units are ordered before they are submitted.
    pub fn new(order: OrderStrategy) -> Self {
        Self {
            order,
            classifier: Arc::new(DefaultResultClassifier),
            policy: ListenerFailurePolicy::default(),
        }
    }

    /// Replaces the mapping from results to listener callbacks.
    pub fn with_classifier(mut self, classifier: Arc<dyn ResultClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Sets what a failing listener does to the rest of the run.
    pub fn with_failure_policy(mut self, policy: ListenerFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Runs every unit and dispatches every result.
    ///
    /// `on_run_start` fires before the first submission and `on_run_end`
    /// fires exactly once after the last dispatch, including when the run
    /// fails.
    pub fn run(
        &self,
        container: Arc<dyn Container>,
        units: Vec<Arc<dyn TestUnit>>,
        listeners: &mut [&mut dyn TestListener],
    ) -> Result<RunSummary, SchedulerError> {
        let units = self.order.order(units);
        let total = units.len();
        let mut run = Run {
            listeners,
            classifier: self.classifier.as_ref(),
            policy: self.policy,
            summary: RunSummary::default(),
        };
        info!(units = total, order = ?self.order, "run starting");

        if let Err(e) = run.fire(|l| l.on_run_start()) {
            run.end()?;
            return Err(e);
        }

        let (done_tx, done_rx) = bounded(1);
        let feeder_container = Arc::clone(&container);
        let spawned = thread::Builder::new()
            .name("gauntlet-feeder".to_string())
            .spawn(move || {
                let mut submitted = 0;
                for unit in units {
                    if let Err(e) = feeder_container.submit(unit) {
                        let _ = done_tx.send(Err((submitted, e)));
                        return;
                    }
                    submitted += 1;
                }
                let _ = done_tx.send(Ok(submitted));
            });
        if let Err(e) = spawned {
            run.end()?;
            return Err(e.into());
        }

        let outcome = run.drain(container.as_ref(), &done_rx, total);
        container.shutdown_when_processing_complete();
        let outcome = outcome.and_then(|feed| {
            loop {
                let complete = container.await_completion();
                for result in container.result_source().take_available() {
                    run.dispatch(result)?;
                }
                if complete && !container.result_source().results_available() {
                    return Ok(feed);
                }
            }
        });

        run.end()?;
        let feed = outcome?;
        run.summary.submitted = match feed {
            Ok(submitted) => submitted,
            Err((submitted, source)) => {
                return Err(SchedulerError::Feed {
                    submitted,
                    total,
                    source,
                });
            }
        };
        info!(
            submitted = run.summary.submitted,
            dispatched = run.summary.dispatched,
            "run finished"
        );
        Ok(run.summary)
    }
}

type FeedOutcome = Result<usize, (usize, ContainerError)>;

struct Run<'r, 'l> {
    listeners: &'r mut [&'l mut dyn TestListener],
    classifier: &'r dyn ResultClassifier,
    policy: ListenerFailurePolicy,
    summary: RunSummary,
}

impl Run<'_, '_> {
    fn fire<F>(&mut self, mut event: F) -> Result<(), SchedulerError>
    where
        F: FnMut(&mut dyn TestListener) -> anyhow::Result<()>,
    {
        for listener in self.listeners.iter_mut() {
            if let Err(source) = event(&mut **listener) {
                let name = listener.name().to_string();
                match self.policy {
                    ListenerFailurePolicy::Isolate => {
                        warn!(listener = %name, error = %source, "listener failed");
                    }
                    ListenerFailurePolicy::Propagate => {
                        return Err(SchedulerError::Listener {
                            listener: name,
                            source,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, result: TestResult) -> Result<(), SchedulerError> {
        let kind = self.classifier.classify(&result);
        *self.summary.counts.entry(kind).or_default() += 1;
        self.summary.dispatched += 1;
        debug!(test = %result.description, ?kind, "dispatching result");
        self.fire(|l| kind.dispatch(&result, l))
    }

    /// Dispatches results as they arrive until the feeder reports that it
    /// is done.
    fn drain(
        &mut self,
        container: &dyn Container,
        done: &Receiver<FeedOutcome>,
        total: usize,
    ) -> Result<FeedOutcome, SchedulerError> {
        let results = container.result_source().receiver();
        loop {
            select! {
                recv(results) -> result => {
                    if let Ok(result) = result {
                        self.dispatch(result)?;
                    }
                }
                recv(done) -> feed => {
                    let feed = feed.map_err(|_| SchedulerError::FeederLost)?;
                    debug!(total, "feeder finished");
                    return Ok(feed);
                }
                default(FEEDER_JOIN_POLL) => {}
            }
        }
    }

    fn end(&mut self) -> Result<(), SchedulerError> {
        self.fire(|l| l.on_run_end())
    }
}
