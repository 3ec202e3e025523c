use crate::context::{MutationContext, MutationIdentifier};
use crate::instruction::{ClassFile, CodecError, Insn, MethodBody, VerifyError, verify_method};
use crate::mutator::{InsnWriter, MethodMutator};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum MutationError {
    #[error("no configured mutator has id `{0}`")]
    UnknownMutator(String),
    #[error("class `{class}` has no method `{method}`")]
    UnknownMethod { class: String, method: String },
    #[error("mutation {0} was not produced by its mutator")]
    NotFound(Box<MutationIdentifier>),
    #[error("mutation {id} leaves an unbalanced stack: {source}")]
    Unbalanced {
        id: Box<MutationIdentifier>,
        #[source]
        source: VerifyError,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A discovered candidate together with the source line it sits on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationDetails {
    pub id: MutationIdentifier,
    pub line: Option<u32>,
}

/// A finished mutant: the details of its one change plus the encoded class.
#[derive(Debug, Clone)]
pub struct Mutant {
    pub details: MutationDetails,
    pub bytes: Vec<u8>,
}

impl Mutant {
    pub fn class(&self) -> Result<ClassFile, CodecError> {
        ClassFile::from_bytes(&self.bytes)
    }
}

/// Runs one mutator over one method, returning the rewritten stream. With a
/// discovery context the result equals the input.
///
/// # Errors
/// Fails only when the method leaves no label numbers for replacement code.
pub fn rewrite_method(
    mutator: &dyn MethodMutator,
    class: &str,
    method: &MethodBody,
    ctx: &mut MutationContext,
) -> Result<Vec<Insn>, VerifyError> {
    ctx.set_location(class, method.key());
    let mut out = InsnWriter::new(method.next_free_label()?);
    for (index, insn) in method.insns.iter().enumerate() {
        ctx.set_index(index);
        mutator.visit(insn, ctx, &mut out);
    }
    Ok(out.into_insns())
}

fn line_before(method: &MethodBody, index: usize) -> Option<u32> {
    method.insns.get(..=index)?.iter().rev().find_map(|insn| match insn {
        Insn::Line(line) => Some(*line),
        _ => None,
    })
}

/// Two-phase mutation: enumerate every candidate first, then build mutants
/// one identifier at a time.
#[derive(Debug, Clone)]
pub struct MutationEngine {
    mutators: Vec<Arc<dyn MethodMutator>>,
}

impl MutationEngine {
    pub fn new(mutators: Vec<Arc<dyn MethodMutator>>) -> Self {
        Self { mutators }
    }

    pub fn mutators(&self) -> &[Arc<dyn MethodMutator>] {
        &self.mutators
    }

    /// Discovery pass over every method of `class`.
    ///
    /// Methods whose unmutated body fails stack verification are skipped with
    /// a warning; the remaining methods are still scanned.
    pub fn find_mutations(&self, class: &ClassFile) -> Vec<MutationDetails> {
        let mut details = Vec::new();
        for method in &class.methods {
            if let Err(e) = verify_method(method).and_then(|()| method.next_free_label()) {
                warn!(class = %class.name, method = %method.key(), error = %e, "skipping malformed method");
                continue;
            }
            for mutator in &self.mutators {
                let mut ctx = MutationContext::discovery();
                if let Err(e) = rewrite_method(mutator.as_ref(), &class.name, method, &mut ctx) {
                    warn!(class = %class.name, method = %method.key(), error = %e, "skipping method");
                    continue;
                }
                details.extend(ctx.into_found().into_iter().map(|id| MutationDetails {
                    line: line_before(method, id.index),
                    id,
                }));
            }
        }
        debug!(class = %class.name, candidates = details.len(), "discovered mutations");
        details
    }

    /// Builds the mutant selected by `id`.
    ///
    /// Only the owning mutator runs, with a fresh context authorizing `id`
    /// alone. The rewritten method must pass stack verification.
    pub fn get_mutation(
        &self,
        class: &ClassFile,
        id: &MutationIdentifier,
    ) -> Result<Mutant, MutationError> {
        let mutator = self
            .mutators
            .iter()
            .find(|m| m.globally_unique_id() == id.mutator)
            .ok_or_else(|| MutationError::UnknownMutator(id.mutator.clone()))?;

        let mut mutated = class.clone();
        let method = mutated
            .methods
            .iter_mut()
            .find(|m| m.key() == id.method)
            .ok_or_else(|| MutationError::UnknownMethod {
                class: class.name.clone(),
                method: id.method.to_string(),
            })?;

        let mut ctx = MutationContext::targeting(id.clone());
        let insns = rewrite_method(mutator.as_ref(), &class.name, method, &mut ctx).map_err(
            |source| MutationError::Unbalanced {
                id: Box::new(id.clone()),
                source,
            },
        )?;
        if !ctx.found().contains(id) {
            return Err(MutationError::NotFound(Box::new(id.clone())));
        }
        let line = line_before(method, id.index);
        method.insns = insns;
        verify_method(method).map_err(|source| MutationError::Unbalanced {
            id: Box::new(id.clone()),
            source,
        })?;

        Ok(Mutant {
            details: MutationDetails {
                id: id.clone(),
                line,
            },
            bytes: mutated.to_bytes()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{ArithOp, JumpKind, Label, MethodKey};
    use crate::mutator::{MathMutator, MutatorRegistry, TemporalBoundaryMutator, ALL_GROUP};
    use crate::vm::{Program, Temporal, TemporalKind, Value};
    use proptest::prelude::*;

    const LOCAL_DATE: &str = "java/time/LocalDate";
    const DATE_CMP: &str = "(Ljava/time/chrono/ChronoLocalDate;)Z";

    fn dates_class() -> ClassFile {
        ClassFile::new(
            "demo/Dates",
            vec![
                MethodBody::new(
                    "isBefore",
                    "(Ljava/time/LocalDate;Ljava/time/LocalDate;)Z",
                    true,
                    vec![
                        Insn::Line(10),
                        Insn::Load(0),
                        Insn::Load(1),
                        Insn::invoke_virtual(LOCAL_DATE, "isBefore", DATE_CMP),
                        Insn::Return,
                    ],
                ),
                MethodBody::new(
                    "clampedSum",
                    "(II)I",
                    true,
                    vec![
                        Insn::Line(20),
                        Insn::Load(0),
                        Insn::Load(1),
                        Insn::Arith(ArithOp::Add),
                        Insn::Store(2),
                        Insn::Line(21),
                        Insn::Load(2),
                        Insn::Const(100),
                        Insn::Jump(JumpKind::IfICmpLe, Label(0)),
                        Insn::Const(100),
                        Insn::Return,
                        Insn::Label(Label(0)),
                        Insn::Line(23),
                        Insn::Load(2),
                        Insn::Return,
                    ],
                ),
            ],
        )
    }

    fn all_mutators() -> MutationEngine {
        MutationEngine::new(
            MutatorRegistry::new()
                .resolve(&[ALL_GROUP.to_string()])
                .expect("ALL resolves"),
        )
    }

    fn date(day: i64) -> Value {
        Value::Temporal(Temporal::new(TemporalKind::LocalDate, day))
    }

    /// Length of the changed region between two streams, measured in the
    /// original's instructions.
    fn changed_span(original: &[Insn], mutated: &[Insn]) -> usize {
        let prefix = original
            .iter()
            .zip(mutated)
            .take_while(|(a, b)| a == b)
            .count();
        let suffix = original[prefix..]
            .iter()
            .rev()
            .zip(mutated[prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .count();
        original.len() - prefix - suffix
    }

    #[test]
    fn discovery_finds_candidates_with_lines() {
        let found = all_mutators().find_mutations(&dates_class());
        let temporal: Vec<_> = found
            .iter()
            .filter(|d| d.id.mutator == TemporalBoundaryMutator.globally_unique_id())
            .collect();
        assert_eq!(temporal.len(), 1);
        assert_eq!(temporal[0].line, Some(10));
        assert_eq!(temporal[0].id.index, 3);

        let math: Vec<_> = found
            .iter()
            .filter(|d| d.id.mutator == MathMutator.globally_unique_id())
            .collect();
        assert_eq!(math.len(), 1);
        assert_eq!(math[0].line, Some(20));
        // boundary + negate on the one conditional jump, math on the add
        assert_eq!(found.len(), 4);
    }

    #[test]
    fn discovery_is_deterministic() {
        let engine = all_mutators();
        assert_eq!(
            engine.find_mutations(&dates_class()),
            engine.find_mutations(&dates_class())
        );
    }

    #[test]
    fn every_mutant_changes_exactly_one_location() {
        let engine = all_mutators();
        let class = dates_class();
        for details in engine.find_mutations(&class) {
            let mutant = engine
                .get_mutation(&class, &details.id)
                .expect("discovered mutation builds");
            let mutated = mutant.class().expect("mutant decodes");
            for (original, changed) in class.methods.iter().zip(&mutated.methods) {
                if original.key() == details.id.method {
                    assert_eq!(changed_span(&original.insns, &changed.insns), 1, "{}", details.id);
                } else {
                    assert_eq!(original, changed);
                }
            }
        }
    }

    #[test]
    fn temporal_mutant_turns_is_before_into_before_or_equal() {
        let engine = all_mutators();
        let class = dates_class();
        let details = engine
            .find_mutations(&class)
            .into_iter()
            .find(|d| d.id.mutator == TemporalBoundaryMutator.globally_unique_id())
            .expect("isBefore call is a candidate");
        let mutant = engine
            .get_mutation(&class, &details.id)
            .expect("temporal mutant builds");

        let original = Program::new(vec![class]);
        let mutated = original.with_mutant(&mutant).expect("mutant loads");
        let cases = [(1, 2), (2, 2), (3, 2)];
        for (a, b) in cases {
            let before = original
                .call("demo/Dates", "isBefore", vec![date(a), date(b)])
                .expect("original runs");
            let after = mutated
                .call("demo/Dates", "isBefore", vec![date(a), date(b)])
                .expect("mutant runs");
            assert_eq!(before, Value::Int(i64::from(a < b)));
            assert_eq!(after, Value::Int(i64::from(a <= b)), "a={a} b={b}");
        }
    }

    #[test]
    fn unknown_identifiers_are_rejected() {
        let engine = all_mutators();
        let class = dates_class();
        let mut id = engine.find_mutations(&class)[0].id.clone();

        id.index += 1;
        assert!(matches!(
            engine.get_mutation(&class, &id),
            Err(MutationError::NotFound(_))
        ));

        id.method = MethodKey::new("nope", "()V");
        assert!(matches!(
            engine.get_mutation(&class, &id),
            Err(MutationError::UnknownMethod { .. })
        ));

        id.mutator = "nobody".to_string();
        assert!(matches!(
            engine.get_mutation(&class, &id),
            Err(MutationError::UnknownMutator(_))
        ));
    }

    #[derive(Debug)]
    struct LeakyMutator;

    impl MethodMutator for LeakyMutator {
        fn globally_unique_id(&self) -> &'static str {
            "test.Leaky"
        }
        fn name(&self) -> &'static str {
            "LEAKY"
        }
        fn visit(&self, insn: &Insn, ctx: &mut MutationContext, out: &mut InsnWriter) {
            out.push(insn.clone());
            if matches!(insn, Insn::Arith(_)) {
                let id = ctx.register_mutation(self, "pushes an extra value");
                if ctx.should_mutate(&id) {
                    out.push(Insn::Const(0));
                }
            }
        }
    }

    #[test]
    fn unbalanced_rewrite_is_refused() {
        let engine = MutationEngine::new(vec![Arc::new(LeakyMutator)]);
        let class = dates_class();
        let found = engine.find_mutations(&class);
        assert_eq!(found.len(), 1);
        assert!(matches!(
            engine.get_mutation(&class, &found[0].id),
            Err(MutationError::Unbalanced { .. })
        ));
    }

    #[test]
    fn malformed_method_is_skipped_not_fatal() {
        let mut class = dates_class();
        class.methods.insert(
            0,
            MethodBody::new("broken", "()I", true, vec![Insn::Arith(ArithOp::Add), Insn::Return]),
        );
        let found = all_mutators().find_mutations(&class);
        assert_eq!(found.len(), 4);
        assert!(found.iter().all(|d| d.id.method.name != "broken"));
    }

    #[test]
    fn method_using_the_last_label_number_is_skipped() {
        let mut class = dates_class();
        class.methods.insert(
            0,
            MethodBody::new(
                "exhausted",
                "(II)I",
                true,
                vec![
                    Insn::Load(0),
                    Insn::Load(1),
                    Insn::Jump(JumpKind::IfICmpLt, Label(u32::MAX)),
                    Insn::Const(1),
                    Insn::Return,
                    Insn::Label(Label(u32::MAX)),
                    Insn::Const(0),
                    Insn::Return,
                ],
            ),
        );
        verify_method(&class.methods[0]).expect("the method itself is well-formed");

        let found = all_mutators().find_mutations(&class);
        assert_eq!(found.len(), 4);
        assert!(found.iter().all(|d| d.id.method.name != "exhausted"));
    }

    fn arith_op() -> impl Strategy<Value = Insn> {
        prop_oneof![
            Just(Insn::Arith(ArithOp::Add)),
            Just(Insn::Arith(ArithOp::Sub)),
            Just(Insn::Arith(ArithOp::Mul)),
            Just(Insn::Arith(ArithOp::Rem)),
        ]
    }

    proptest! {
        #[test]
        fn identifiers_are_stable_for_generated_methods(ops in proptest::collection::vec(arith_op(), 1..12)) {
            let mut insns = vec![Insn::Line(1), Insn::Const(1)];
            for (i, op) in ops.iter().enumerate() {
                insns.push(Insn::Line(i as u32 + 2));
                insns.push(Insn::Const(i as i64 + 2));
                insns.push(op.clone());
            }
            insns.push(Insn::Return);
            let class = ClassFile::new("gen/C", vec![MethodBody::new("f", "()I", true, insns)]);
            let engine = all_mutators();
            let first = engine.find_mutations(&class);
            prop_assert_eq!(first.len(), ops.len());
            prop_assert_eq!(&first, &engine.find_mutations(&class));
            for details in &first {
                let mutant = engine.get_mutation(&class, &details.id).expect("generated mutant builds");
                let changed = mutant.class().expect("generated mutant decodes");
                prop_assert_eq!(changed_span(&class.methods[0].insns, &changed.methods[0].insns), 1);
            }
        }
    }
}
