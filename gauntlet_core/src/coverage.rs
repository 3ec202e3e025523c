use crate::context::MutationIdentifier;
use crate::instruction::{CatchAll, ClassFile, Insn, Label, MethodBody, MethodKey, VerifyError};
use crate::unit::Description;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, trace};

pub const COVERAGE_SINK_OWNER: &str = "gauntlet/runtime/CoverageSink";
pub const VISIT_PROBE: &str = "visitProbe";
pub const VISIT_PROBES: &str = "visitProbes";

/// Largest probe count that is still tracked in local registers.
pub const DEFAULT_REGISTER_PROBE_LIMIT: usize = 15;

/// Upper bound for any configured register limit. A flush passes two ids plus
/// one argument per probe, and call arity is capped at 255.
pub const MAX_REGISTER_PROBE_LIMIT: usize = 253;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStrategy {
    /// One scratch local per probe, flushed to the sink on method exit.
    Register { probes: usize },
    /// An immediate sink call at every probe.
    Sink,
}

/// Number of probe locations (source line markers) in `method`.
pub fn count_probes(method: &MethodBody) -> usize {
    method
        .insns
        .iter()
        .filter(|insn| matches!(insn, Insn::Line(_)))
        .count()
}

/// Picks how a method with `count` probes is instrumented: nothing for no
/// probes, registers up to `register_limit`, the sink above it.
pub fn select_strategy(count: usize, register_limit: usize) -> Option<ProbeStrategy> {
    match count {
        0 => None,
        n if n <= register_limit => Some(ProbeStrategy::Register { probes: n }),
        _ => Some(ProbeStrategy::Sink),
    }
}

fn push_flush(insns: &mut Vec<Insn>, class_id: u32, probe_offset: u32, slots: &[u16]) {
    insns.push(Insn::Const(i64::from(class_id)));
    insns.push(Insn::Const(i64::from(probe_offset)));
    insns.extend(slots.iter().map(|slot| Insn::Load(*slot)));
    insns.push(Insn::invoke_static(
        COVERAGE_SINK_OWNER,
        VISIT_PROBES,
        &format!("(II{})V", "I".repeat(slots.len())),
    ));
}

/// Returns a copy of `method` with probes numbered from `probe_offset`.
///
/// The register strategy keeps one scratch local per line marker and flushes
/// them before every `Return`. Every other way out of the method goes through
/// an added catch-all handler that flushes and then rethrows. A method that
/// already carries its own handler gets sink probes instead.
///
/// # Errors
/// Fails when the method has no room left for scratch locals or labels.
pub fn insert_probes(
    strategy: ProbeStrategy,
    method: &MethodBody,
    class_id: u32,
    probe_offset: u32,
) -> Result<MethodBody, VerifyError> {
    let mut insns = Vec::with_capacity(method.insns.len() * 2);

    match strategy {
        ProbeStrategy::Register { .. } if method.catch_all.is_none() => {
            let count = u16::try_from(count_probes(method)).map_err(|_| VerifyError::LocalsExhausted)?;
            let base = method.first_free_local()?;
            let end = base.checked_add(count).ok_or(VerifyError::LocalsExhausted)?;
            let slots: Vec<u16> = (base..end).collect();
            let start = method.next_free_label()?;
            let guarded = CatchAll {
                start: Label(start),
                handler: Label(start.checked_add(1).ok_or(VerifyError::LabelsExhausted)?),
            };

            for slot in &slots {
                insns.push(Insn::Const(0));
                insns.push(Insn::Store(*slot));
            }
            insns.push(Insn::Label(guarded.start));
            let mut free = slots.iter();
            for insn in &method.insns {
                if matches!(insn, Insn::Return) {
                    push_flush(&mut insns, class_id, probe_offset, &slots);
                }
                insns.push(insn.clone());
                if matches!(insn, Insn::Line(_)) {
                    if let Some(slot) = free.next() {
                        insns.push(Insn::Const(1));
                        insns.push(Insn::Store(*slot));
                    }
                }
            }
            insns.push(Insn::Label(guarded.handler));
            push_flush(&mut insns, class_id, probe_offset, &slots);
            insns.push(Insn::Throw);

            Ok(MethodBody {
                insns,
                catch_all: Some(guarded),
                ..method.clone()
            })
        }
        _ => {
            let mut probe = probe_offset;
            for insn in &method.insns {
                insns.push(insn.clone());
                if matches!(insn, Insn::Line(_)) {
                    insns.push(Insn::Const(i64::from(class_id)));
                    insns.push(Insn::Const(i64::from(probe)));
                    insns.push(Insn::invoke_static(COVERAGE_SINK_OWNER, VISIT_PROBE, "(II)V"));
                    probe = probe.wrapping_add(1);
                }
            }
            Ok(MethodBody { insns, ..method.clone() })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProbeId {
    pub class_id: u32,
    pub probe: u32,
}

/// Where one probe sits in the unmutated class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSite {
    pub probe: u32,
    pub method: MethodKey,
    pub line: u32,
    /// Index of the line marker in the unmutated stream.
    pub insn_index: usize,
}

#[derive(Debug, Clone)]
pub struct InstrumentedClass {
    pub class_id: u32,
    pub class: ClassFile,
    pub sites: Vec<ProbeSite>,
    pub strategies: Vec<(MethodKey, Option<ProbeStrategy>)>,
}

#[derive(Debug, Clone, Copy)]
pub struct ClassInstrumenter {
    register_limit: usize,
}

impl Default for ClassInstrumenter {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTER_PROBE_LIMIT)
    }
}

impl ClassInstrumenter {
    pub fn new(register_limit: usize) -> Self {
        Self { register_limit }
    }

    /// Inserts probes into every method of `class`. Probe numbers are dense
    /// per class, starting at zero in declaration order.
    pub fn instrument(&self, class: &ClassFile, class_id: u32) -> Result<InstrumentedClass, VerifyError> {
        let mut offset = 0u32;
        let mut methods = Vec::with_capacity(class.methods.len());
        let mut sites = Vec::new();
        let mut strategies = Vec::with_capacity(class.methods.len());

        for method in &class.methods {
            let strategy = select_strategy(count_probes(method), self.register_limit).map(|s| {
                match s {
                    ProbeStrategy::Register { .. } if method.catch_all.is_some() => ProbeStrategy::Sink,
                    other => other,
                }
            });
            strategies.push((method.key(), strategy));
            let Some(strategy) = strategy else {
                methods.push(method.clone());
                continue;
            };
            trace!(class = %class.name, method = %method.key(), ?strategy, "instrumenting");

            let lines = method.insns.iter().enumerate().filter_map(|(i, insn)| match insn {
                Insn::Line(line) => Some((i, *line)),
                _ => None,
            });
            let before = sites.len();
            sites.extend(lines.enumerate().map(|(n, (insn_index, line))| ProbeSite {
                probe: offset + n as u32,
                method: method.key(),
                line,
                insn_index,
            }));
            methods.push(insert_probes(strategy, method, class_id, offset)?);
            offset += (sites.len() - before) as u32;
        }

        debug!(class = %class.name, probes = offset, "instrumented class");
        Ok(InstrumentedClass {
            class_id,
            class: ClassFile {
                name: class.name.clone(),
                methods,
            },
            sites,
            strategies,
        })
    }
}

/// Shared recorder for probe hits of one test execution.
#[derive(Debug, Default)]
pub struct CoverageSink {
    hits: Mutex<BTreeSet<ProbeId>>,
}

impl CoverageSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a single probe hit.
    pub fn visit(&self, class_id: u32, probe: u32) {
        if let Ok(mut hits) = self.hits.lock() {
            hits.insert(ProbeId { class_id, probe });
        }
    }

    /// Records every nonzero entry of `flags` as probe `offset + i`.
    pub fn visit_all(&self, class_id: u32, offset: u32, flags: &[i64]) {
        if let Ok(mut hits) = self.hits.lock() {
            hits.extend(
                flags
                    .iter()
                    .enumerate()
                    .filter(|(_, flag)| **flag != 0)
                    .map(|(i, _)| ProbeId {
                        class_id,
                        probe: offset + i as u32,
                    }),
            );
        }
    }

    /// Hits recorded since the last call; the sink is left empty.
    pub fn take(&self) -> BTreeSet<ProbeId> {
        self.hits
            .lock()
            .map(|mut hits| std::mem::take(&mut *hits))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct TestCoverage {
    pub test: Description,
    pub duration: Duration,
    pub probes: BTreeSet<ProbeId>,
}

#[derive(Debug, Clone, Default)]
pub struct CoverageDatabase {
    records: Vec<TestCoverage>,
}

impl CoverageDatabase {
    /// Stores one test's coverage. Call once per green test.
    pub fn record(&mut self, coverage: TestCoverage) {
        self.records.push(coverage);
    }

    pub fn records(&self) -> &[TestCoverage] {
        &self.records
    }

    /// Tests touching any of `probes`, fastest first.
    pub fn tests_covering(&self, probes: &[ProbeId]) -> Vec<&TestCoverage> {
        let mut covering: Vec<&TestCoverage> = self
            .records
            .iter()
            .filter(|r| probes.iter().any(|p| r.probes.contains(p)))
            .collect();
        covering.sort_by_key(|r| r.duration);
        covering
    }
}

/// Maps mutations back to the probe guarding their location.
#[derive(Debug, Clone, Default)]
pub struct ProbeMap {
    classes: BTreeMap<String, (u32, Vec<ProbeSite>)>,
}

impl ProbeMap {
    /// Registers the probe sites of an instrumented class, replacing any
    /// earlier entry for the same class name.
    pub fn add(&mut self, class: &InstrumentedClass) {
        self.classes.insert(
            class.class.name.clone(),
            (class.class_id, class.sites.clone()),
        );
    }

    /// Probe of the nearest line marker at or before the mutated instruction.
    /// Empty when the method carries no probes.
    pub fn probes_for(&self, id: &MutationIdentifier) -> Vec<ProbeId> {
        let Some((class_id, sites)) = self.classes.get(&id.class) else {
            return Vec::new();
        };
        sites
            .iter()
            .filter(|s| s.method == id.method && s.insn_index <= id.index)
            .max_by_key(|s| s.insn_index)
            .map(|s| ProbeId {
                class_id: *class_id,
                probe: s.probe,
            })
            .into_iter()
            .collect()
    }
}
