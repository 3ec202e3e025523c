use crate::classifier::{DefaultResultClassifier, ResultClassifier, ResultKind};
use crate::container::{ContainerError, ThreadPoolContainer};
use crate::coverage::{
    ClassInstrumenter, CoverageDatabase, CoverageSink, DEFAULT_REGISTER_PROBE_LIMIT, ProbeMap,
    TestCoverage,
};
use crate::engine::{MutationDetails, MutationEngine};
use crate::instruction::{ClassFile, VerifyError};
use crate::listener::TestListener;
use crate::scheduler::{
    ListenerFailurePolicy, OrderStrategy, Scheduler, SchedulerError, filter_units,
};
use crate::timeout::{
    PercentAndConstantTimeoutStrategy, TimeoutDecoratedTestSource, TimeoutLengthStrategy,
};
use crate::unit::{Description, ResultBuffer, TestResult, TestUnit};
use crate::vm::Program;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("test {test} does not pass on the unmutated program: {outcome}")]
    FailingBaseline { test: Description, outcome: String },
    #[error("failed to instrument class for coverage: {0}")]
    Instrument(#[from] VerifyError),
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationStatus {
    Killed,
    Survived,
    TimedOut,
    NoCoverage,
    NonViable,
}

#[derive(Debug, Clone, Serialize)]
pub struct MutationResult {
    pub details: MutationDetails,
    pub hash: String,
    pub status: MutationStatus,
    pub killing_tests: Vec<Description>,
    pub tests_run: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoverageSummary {
    pub test: Description,
    pub duration_ms: u128,
    pub probes: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MutationReport {
    pub results: Vec<MutationResult>,
    pub coverage: Vec<CoverageSummary>,
}

impl MutationReport {
    pub fn counts(&self) -> BTreeMap<MutationStatus, usize> {
        let mut counts = BTreeMap::new();
        for result in &self.results {
            *counts.entry(result.status).or_default() += 1;
        }
        counts
    }

    /// Share of detected mutants among those that could be built and were
    /// covered, as a percentage.
    pub fn mutation_score(&self) -> f64 {
        let counts = self.counts();
        let get = |s| counts.get(&s).copied().unwrap_or(0);
        let detected = get(MutationStatus::Killed) + get(MutationStatus::TimedOut);
        let relevant = detected + get(MutationStatus::Survived) + get(MutationStatus::NoCoverage);
        if relevant == 0 {
            return 100.0;
        }
        detected as f64 * 100.0 / relevant as f64
    }
}

/// Knobs for one [`MutationAnalysis`]. Built from configuration by
/// [`GauntletConfig::analysis_settings`](crate::config::GauntletConfig::analysis_settings).
#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    /// Workers per mutant run.
    pub threads: usize,
    /// Units that may wait for a worker before submission blocks.
    pub queue_capacity: usize,
    pub register_probe_limit: usize,
    pub listener_failure: ListenerFailurePolicy,
    /// Order of the covering tests within each mutant's run.
    pub order: OrderStrategy,
    pub timeout: Arc<dyn TimeoutLengthStrategy>,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            threads: 2,
            queue_capacity: 16,
            register_probe_limit: DEFAULT_REGISTER_PROBE_LIMIT,
            listener_failure: ListenerFailurePolicy::default(),
            order: OrderStrategy::default(),
            timeout: Arc::new(PercentAndConstantTimeoutStrategy::default()),
        }
    }
}

/// Tallies the verdict of one mutant's test run.
#[derive(Default)]
struct Verdict {
    killing: Vec<Description>,
    timed_out: bool,
    seen: usize,
}

impl Verdict {
    fn status(&self) -> MutationStatus {
        if !self.killing.is_empty() {
            MutationStatus::Killed
        } else if self.timed_out {
            MutationStatus::TimedOut
        } else {
            MutationStatus::Survived
        }
    }
}

impl TestListener for Verdict {
    fn name(&self) -> &str {
        "verdict"
    }

    fn on_test_success(&mut self, _result: &TestResult) -> anyhow::Result<()> {
        self.seen += 1;
        Ok(())
    }

    fn on_test_failure(&mut self, result: &TestResult) -> anyhow::Result<()> {
        self.seen += 1;
        self.killing.push(result.description.clone());
        Ok(())
    }

    fn on_test_error(&mut self, result: &TestResult) -> anyhow::Result<()> {
        self.on_test_failure(result)
    }

    fn on_test_skipped(&mut self, _result: &TestResult) -> anyhow::Result<()> {
        self.seen += 1;
        Ok(())
    }

    fn on_test_timeout(&mut self, _result: &TestResult) -> anyhow::Result<()> {
        self.seen += 1;
        self.timed_out = true;
        Ok(())
    }
}

/// Discovers every mutant of a program and runs the covering tests against
/// each one.
pub struct MutationAnalysis {
    engine: MutationEngine,
    settings: AnalysisSettings,
}

impl MutationAnalysis {
    /// Analysis that mutates with `engine`'s mutators.
    pub fn new(engine: MutationEngine, settings: AnalysisSettings) -> Self {
        Self { engine, settings }
    }

    /// Runs the full analysis.
    ///
    /// # Arguments
    /// * `program`: The unmutated program. Every class in it is mutated.
    /// * `units`: The test suite. Groups are flattened to their leaves.
    ///
    /// # Returns
    /// One result per discovered mutation, in discovery order, plus the
    /// per-test coverage summary. Fails if any test fails on the unmutated
    /// program.
    pub fn run(
        &self,
        program: &Program,
        units: &[Arc<dyn TestUnit>],
    ) -> Result<MutationReport, AnalysisError> {
        let leaves = filter_units(units, &|_| true);
        let classes: Vec<&ClassFile> = program.classes().collect();

        let candidates: Vec<(&ClassFile, MutationDetails)> = classes
            .iter()
            .flat_map(|class| {
                self.engine
                    .find_mutations(class)
                    .into_iter()
                    .map(move |details| (*class, details))
            })
            .collect();
        info!(classes = classes.len(), mutations = candidates.len(), tests = leaves.len(), "analysis starting");

        let (database, probe_map) = self.measure_coverage(program, &classes, &leaves)?;
        let source = TimeoutDecoratedTestSource::new(&leaves, Arc::clone(&self.settings.timeout));

        let mut results = Vec::with_capacity(candidates.len());
        for (class, details) in candidates {
            let result = self.analyse_mutant(program, class, details, &database, &probe_map, &source)?;
            debug!(mutation = %result.details.id, status = ?result.status, "analysed mutant");
            results.push(result);
        }

        let coverage = database
            .records()
            .iter()
            .map(|r| CoverageSummary {
                test: r.test.clone(),
                duration_ms: r.duration.as_millis(),
                probes: r.probes.len(),
            })
            .collect();
        let report = MutationReport { results, coverage };
        info!(counts = ?report.counts(), score = report.mutation_score(), "analysis finished");
        Ok(report)
    }

    /// Runs every leaf once against the instrumented program, recording which
    /// probes it reaches. Each leaf must pass.
    fn measure_coverage(
        &self,
        program: &Program,
        classes: &[&ClassFile],
        leaves: &[Arc<dyn TestUnit>],
    ) -> Result<(CoverageDatabase, ProbeMap), AnalysisError> {
        let instrumenter = ClassInstrumenter::new(self.settings.register_probe_limit);
        let mut probe_map = ProbeMap::default();
        let mut instrumented = Vec::with_capacity(classes.len());
        for (class_id, class) in classes.iter().enumerate() {
            let class = instrumenter.instrument(class, class_id as u32)?;
            probe_map.add(&class);
            instrumented.push(class.class);
        }

        let sink = Arc::new(CoverageSink::new());
        let instrumented = program.with_classes(instrumented).with_sink(Arc::clone(&sink));
        let classifier = DefaultResultClassifier;
        let mut database = CoverageDatabase::default();

        for unit in leaves {
            sink.take();
            let buffer = ResultBuffer::default();
            unit.execute(&instrumented, &buffer);
            let results = buffer.into_results();
            if let Some(bad) = results.iter().find(|r| classifier.classify(r) != ResultKind::Pass) {
                return Err(AnalysisError::FailingBaseline {
                    test: bad.description.clone(),
                    outcome: format!("{:?}", bad.outcome),
                });
            }
            database.record(TestCoverage {
                test: unit.description().clone(),
                duration: results.iter().map(|r| r.duration).sum::<Duration>(),
                probes: sink.take(),
            });
        }
        Ok((database, probe_map))
    }

    fn analyse_mutant(
        &self,
        program: &Program,
        class: &ClassFile,
        details: MutationDetails,
        database: &CoverageDatabase,
        probe_map: &ProbeMap,
        source: &TimeoutDecoratedTestSource,
    ) -> Result<MutationResult, AnalysisError> {
        let mut result = MutationResult {
            hash: details.id.stable_hash(),
            details,
            status: MutationStatus::NoCoverage,
            killing_tests: Vec::new(),
            tests_run: 0,
        };

        let mutated = self
            .engine
            .get_mutation(class, &result.details.id)
            .and_then(|mutant| Ok(program.with_mutant(&mutant)?));
        let mutated = match mutated {
            Ok(program) => program,
            Err(e) => {
                debug!(mutation = %result.details.id, error = %e, "mutant is not viable");
                result.status = MutationStatus::NonViable;
                return Ok(result);
            }
        };

        let probes = probe_map.probes_for(&result.details.id);
        let covering: Vec<TestCoverage> = database
            .tests_covering(&probes)
            .into_iter()
            .cloned()
            .collect();
        let units = source.translate_tests(&covering);
        if units.is_empty() {
            return Ok(result);
        }

        let container = Arc::new(ThreadPoolContainer::new(
            mutated,
            self.settings.threads,
            self.settings.queue_capacity,
        )?);
        let mut verdict = Verdict::default();
        let mut listeners: [&mut dyn TestListener; 1] = [&mut verdict];
        Scheduler::new(self.settings.order.clone())
            .with_failure_policy(self.settings.listener_failure)
            .run(container, units, &mut listeners)?;

        result.status = verdict.status();
        result.tests_run = verdict.seen;
        result.killing_tests = verdict.killing;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo;
    use crate::mutator::{ALL_GROUP, MutatorRegistry};
    use crate::instruction::{ArithOp, Insn, MethodBody};
    use crate::unit::FnTestUnit;
    use crate::vm::{Value, VmError};

    fn analysis_with(settings: AnalysisSettings) -> MutationAnalysis {
        let mutators = MutatorRegistry::new()
            .resolve(&[ALL_GROUP.to_string()])
            .expect("ALL resolves");
        MutationAnalysis::new(MutationEngine::new(mutators), settings)
    }

    fn analysis() -> MutationAnalysis {
        analysis_with(AnalysisSettings::default())
    }

    fn demo_report() -> MutationReport {
        analysis()
            .run(&demo::program(), &demo::units())
            .expect("demo analysis completes")
    }

    fn status_of<'r>(report: &'r MutationReport, method: &str, mutator: &str) -> Vec<&'r MutationResult> {
        report
            .results
            .iter()
            .filter(|r| r.details.id.method.name == method && r.details.id.mutator == mutator)
            .collect()
    }

    #[test]
    fn demo_suite_kills_temporal_mutants_and_misses_the_boundary() {
        let report = demo_report();

        let temporal = "gauntlet.mutators.experimental.TemporalConditionalBoundary";
        for method in ["isBefore", "isAfterViaPredicate"] {
            let found = status_of(&report, method, temporal);
            assert_eq!(found.len(), 1, "{method}");
            assert_eq!(found[0].status, MutationStatus::Killed, "{method}");
        }
        let before = &status_of(&report, "isBefore", temporal)[0];
        assert_eq!(
            before.killing_tests,
            vec![Description::new("demo/DatesTest", "sameDayIsNotBefore")]
        );

        let boundary = status_of(&report, "clampedSum", "gauntlet.mutators.ConditionalsBoundary");
        assert_eq!(boundary[0].status, MutationStatus::Survived);
        let negated = status_of(&report, "clampedSum", "gauntlet.mutators.NegateConditionals");
        assert_eq!(negated[0].status, MutationStatus::Killed);

        let untested = status_of(&report, "nextDay", "gauntlet.mutators.Math");
        assert_eq!(untested[0].status, MutationStatus::NoCoverage);
        assert_eq!(untested[0].tests_run, 0);

        let counts = report.counts();
        assert_eq!(counts.get(&MutationStatus::Killed), Some(&4));
        assert_eq!(counts.get(&MutationStatus::Survived), Some(&1));
        assert_eq!(counts.get(&MutationStatus::NoCoverage), Some(&1));
        assert_eq!(report.coverage.len(), demo::units().len());
    }

    #[test]
    fn only_covering_tests_run_against_a_mutant() {
        let report = demo_report();
        let sum_math = status_of(&report, "clampedSum", "gauntlet.mutators.Math");
        assert_eq!(sum_math[0].tests_run, 2);
        assert_eq!(sum_math[0].status, MutationStatus::Killed);
    }

    #[test]
    fn red_baseline_is_rejected() {
        let mut units = demo::units();
        units.push(Arc::new(FnTestUnit::new("demo/DatesTest", "broken", |p| {
            let v = p.call(demo::DATES_CLASS, "clampedSum", vec![])?;
            anyhow::ensure!(v.as_int().is_some(), "no value");
            Ok(())
        })));
        let err = analysis()
            .run(&demo::program(), &units)
            .expect_err("a failing baseline stops the analysis");
        assert!(
            matches!(err, AnalysisError::FailingBaseline { ref test, .. } if test.name == "broken")
        );
    }

    #[test]
    fn report_serialises_to_json() {
        let report = demo_report();
        let json = serde_json::to_value(&report).expect("report serialises");
        assert_eq!(json["results"].as_array().map(Vec::len), Some(report.results.len()));
        assert!(json["results"][0]["hash"].as_str().is_some_and(|h| h.len() == 32));
        assert!(report.mutation_score() > 50.0);
    }

    #[test]
    fn tests_that_end_in_a_fault_still_cover_their_lines() {
        let divide = ClassFile::new(
            "demo/Divide",
            vec![MethodBody::new(
                "divide",
                "(II)I",
                true,
                vec![
                    Insn::Line(40),
                    Insn::Load(0),
                    Insn::Load(1),
                    Insn::Arith(ArithOp::Div),
                    Insn::Return,
                ],
            )],
        );
        let units: Vec<Arc<dyn TestUnit>> = vec![Arc::new(FnTestUnit::new(
            "demo/DivideTest",
            "zeroDivisorFaults",
            |p| {
                let outcome = p.call("demo/Divide", "divide", vec![Value::Int(1), Value::Int(0)]);
                anyhow::ensure!(
                    outcome == Err(VmError::DivisionByZero),
                    "expected a division fault, got {outcome:?}"
                );
                Ok(())
            },
        ))];

        for register_probe_limit in [DEFAULT_REGISTER_PROBE_LIMIT, 0] {
            let report = analysis_with(AnalysisSettings {
                register_probe_limit,
                ..AnalysisSettings::default()
            })
            .run(&Program::new(vec![divide.clone()]), &units)
            .expect("divide analysis completes");

            assert_eq!(report.coverage[0].probes, 1, "limit {register_probe_limit}");
            assert_eq!(report.results.len(), 1);
            assert_eq!(
                report.results[0].status,
                MutationStatus::Killed,
                "limit {register_probe_limit}"
            );
        }
    }

    #[test]
    fn seeded_order_reaches_every_run_without_changing_verdicts() {
        let statuses = |report: &MutationReport| -> Vec<(String, MutationStatus)> {
            report
                .results
                .iter()
                .map(|r| (r.hash.clone(), r.status))
                .collect()
        };
        let shuffled = analysis_with(AnalysisSettings {
            order: OrderStrategy::RandomOrder { seed: 11 },
            threads: 1,
            ..AnalysisSettings::default()
        })
        .run(&demo::program(), &demo::units())
        .expect("shuffled analysis completes");

        assert_eq!(statuses(&shuffled), statuses(&demo_report()));
    }
}
