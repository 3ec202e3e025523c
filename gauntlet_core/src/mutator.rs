use crate::context::MutationContext;
use crate::instruction::{
    ArithOp, BootstrapArg, DynamicCall, Handle, Insn, InvokeKind, JumpKind, Label, MethodRef,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Owner of the static helpers that dynamic call sites are redirected to when
/// a temporal comparison handle is mutated.
pub const TEMPORAL_HELPER_OWNER: &str = "gauntlet/runtime/TemporalComparisons";

/// Registry name that expands to the default mutator group.
pub const DEFAULT_GROUP: &str = "DEFAULTS";
/// Registry name that expands to every known mutator.
pub const ALL_GROUP: &str = "ALL";

/// A `MethodMutator` is one rewrite rule over a method's instruction stream.
///
/// The engine feeds every instruction of a method, in order, to `visit`.
/// For each instruction the mutator either forwards it unchanged to the
/// writer, or registers a candidate mutation with the context and, only if the
/// context authorizes that exact candidate, writes a replacement sequence.
///
/// Replacements must leave the operand stack exactly as the original
/// instruction would. The engine verifies every built mutant and rejects
/// any that do not.
pub trait MethodMutator: Send + Sync + fmt::Debug {
    /// Stable textual id, independent of `name`. Mutation identifiers embed it,
    /// so changing it renumbers every mutant this rule produces.
    fn globally_unique_id(&self) -> &'static str;

    /// Short name used in configuration and registry lookups.
    fn name(&self) -> &'static str;

    /// Forwards or rewrites one instruction.
    ///
    /// # Arguments
    /// * `insn`: The instruction at the context's current index.
    /// * `ctx`: The pass-scoped context candidates are registered with.
    /// * `out`: Receives the forwarded or replacement instructions.
    fn visit(&self, insn: &Insn, ctx: &mut MutationContext, out: &mut InsnWriter);
}

/// Output side of a rewrite pass. Hands out labels that do not collide with
/// the ones already in the method.
#[derive(Debug, Default)]
pub struct InsnWriter {
    insns: Vec<Insn>,
    next_label: u32,
}

impl InsnWriter {
    /// Creates an empty writer.
    ///
    /// # Arguments
    /// * `next_label`: The first label number not used by the method being
    ///   rewritten. See [`MethodBody::next_free_label`](crate::instruction::MethodBody::next_free_label).
    pub fn new(next_label: u32) -> Self {
        Self {
            insns: Vec::new(),
            next_label,
        }
    }

    /// Appends `insn` to the rewritten stream.
    pub fn push(&mut self, insn: Insn) {
        self.insns.push(insn);
    }

    /// Hands out a label unused by the method and by earlier calls.
    ///
    /// Once the numbering is exhausted the last number repeats; the duplicate
    /// definition is then rejected when the mutant is verified.
    pub fn fresh_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label = self.next_label.saturating_add(1);
        label
    }

    /// Replaces the int on top of the stack with its boolean negation.
    pub fn push_negation(&mut self) {
        let when_true = self.fresh_label();
        let join = self.fresh_label();
        self.push(Insn::Jump(JumpKind::IfNe, when_true));
        self.push(Insn::Const(1));
        self.push(Insn::Jump(JumpKind::Goto, join));
        self.push(Insn::Label(when_true));
        self.push(Insn::Const(0));
        self.push(Insn::Label(join));
    }

    /// Consumes the writer, returning everything pushed so far.
    pub fn into_insns(self) -> Vec<Insn> {
        self.insns
    }
}

/// Registers `replacement` (when there is one) and writes it if authorized;
/// otherwise forwards `insn` untouched.
fn apply_replacement(
    mutator: &dyn MethodMutator,
    insn: &Insn,
    replacement: Option<(Insn, &str)>,
    ctx: &mut MutationContext,
    out: &mut InsnWriter,
) {
    if let Some((replacement, description)) = replacement {
        let id = ctx.register_mutation(mutator, description);
        if ctx.should_mutate(&id) {
            out.push(replacement);
            return;
        }
    }
    out.push(insn.clone());
}

struct MatchedType {
    owner: &'static str,
    comparable: &'static str,
}

impl MatchedType {
    fn comparison_descriptor(&self) -> String {
        format!("(L{};)Z", self.comparable)
    }

    fn dynamic_replacement_descriptor(&self) -> String {
        format!("(L{};L{};)Z", self.owner, self.comparable)
    }

    fn simple_name(&self) -> &'static str {
        self.owner.rsplit('/').next().unwrap_or(self.owner)
    }
}

const MATCHED_TYPES: &[MatchedType] = &[
    MatchedType { owner: "java/time/Year", comparable: "java/time/Year" },
    MatchedType { owner: "java/time/YearMonth", comparable: "java/time/YearMonth" },
    MatchedType { owner: "java/time/MonthDay", comparable: "java/time/MonthDay" },
    MatchedType { owner: "java/time/LocalDate", comparable: "java/time/chrono/ChronoLocalDate" },
    MatchedType { owner: "java/time/LocalTime", comparable: "java/time/LocalTime" },
    MatchedType { owner: "java/time/OffsetTime", comparable: "java/time/OffsetTime" },
    MatchedType {
        owner: "java/time/LocalDateTime",
        comparable: "java/time/chrono/ChronoLocalDateTime",
    },
    MatchedType { owner: "java/time/OffsetDateTime", comparable: "java/time/OffsetDateTime" },
    MatchedType {
        owner: "java/time/ZonedDateTime",
        comparable: "java/time/chrono/ChronoZonedDateTime",
    },
    MatchedType { owner: "java/time/Instant", comparable: "java/time/Instant" },
];

struct Replacement {
    source: &'static str,
    destination: &'static str,
    dynamic_destination: &'static str,
}

const REPLACEMENTS: &[Replacement] = &[
    Replacement {
        source: "isBefore",
        destination: "isAfter",
        dynamic_destination: "isBeforeOrEqual",
    },
    Replacement {
        source: "isAfter",
        destination: "isBefore",
        dynamic_destination: "isAfterOrEqual",
    },
];

/// Owners whose `isBefore`/`isAfter` the temporal mutator understands.
pub fn temporal_owners() -> impl Iterator<Item = &'static str> {
    MATCHED_TYPES.iter().map(|t| t.owner)
}

fn match_comparison(
    kind: InvokeKind,
    owner: &str,
    name: &str,
    descriptor: &str,
) -> Option<(&'static MatchedType, &'static Replacement)> {
    if kind != InvokeKind::Virtual {
        return None;
    }
    let matched = MATCHED_TYPES.iter().find(|t| t.owner == owner)?;
    let replacement = REPLACEMENTS.iter().find(|r| r.source == name)?;
    (matched.comparison_descriptor() == descriptor).then_some((matched, replacement))
}

fn describe_temporal(matched: &MatchedType, replacement: &Replacement) -> String {
    let type_name = matched.simple_name();
    format!(
        "Replaced {type_name}#{} with !{type_name}#{}.",
        replacement.source, replacement.destination
    )
}

/// Swaps `isBefore`/`isAfter` on date/time values for the negated inverse
/// comparison, turning a strict comparison into its non-strict counterpart.
///
/// Direct calls get the inverse call plus an inline negation. Handles bound
/// into dynamic call sites cannot carry inline code, so they are redirected to
/// static helpers on [`TEMPORAL_HELPER_OWNER`] that compute the same result.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemporalBoundaryMutator;

impl TemporalBoundaryMutator {
    fn visit_call(&self, call: &MethodRef, ctx: &mut MutationContext, out: &mut InsnWriter) {
        if let Some((matched, replacement)) =
            match_comparison(call.kind, &call.owner, &call.name, &call.descriptor)
        {
            let id = ctx.register_mutation(self, &describe_temporal(matched, replacement));
            if ctx.should_mutate(&id) {
                out.push(Insn::Invoke(MethodRef {
                    name: replacement.destination.to_string(),
                    ..call.clone()
                }));
                out.push_negation();
                return;
            }
        }
        out.push(Insn::Invoke(call.clone()));
    }

    fn visit_dynamic(&self, call: &DynamicCall, ctx: &mut MutationContext, out: &mut InsnWriter) {
        let args = call
            .args
            .iter()
            .map(|arg| match arg {
                BootstrapArg::Handle(handle) => BootstrapArg::Handle(self.mutate_handle(handle, ctx)),
                other => other.clone(),
            })
            .collect();
        out.push(Insn::InvokeDynamic(DynamicCall {
            args,
            ..call.clone()
        }));
    }

    fn mutate_handle(&self, handle: &Handle, ctx: &mut MutationContext) -> Handle {
        if let Some((matched, replacement)) =
            match_comparison(handle.kind, &handle.owner, &handle.name, &handle.descriptor)
        {
            let id = ctx.register_mutation(self, &describe_temporal(matched, replacement));
            if ctx.should_mutate(&id) {
                return Handle {
                    kind: InvokeKind::Static,
                    owner: TEMPORAL_HELPER_OWNER.to_string(),
                    name: replacement.dynamic_destination.to_string(),
                    descriptor: matched.dynamic_replacement_descriptor(),
                };
            }
        }
        handle.clone()
    }
}

impl MethodMutator for TemporalBoundaryMutator {
    fn globally_unique_id(&self) -> &'static str {
        "gauntlet.mutators.experimental.TemporalConditionalBoundary"
    }

    fn name(&self) -> &'static str {
        "TEMPORAL_BOUNDARY"
    }

    fn visit(&self, insn: &Insn, ctx: &mut MutationContext, out: &mut InsnWriter) {
        match insn {
            Insn::Invoke(call) => self.visit_call(call, ctx, out),
            Insn::InvokeDynamic(call) => self.visit_dynamic(call, ctx, out),
            other => out.push(other.clone()),
        }
    }
}

/// `<` becomes `<=`, `>` becomes `>=` and back.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionalsBoundaryMutator;

impl ConditionalsBoundaryMutator {
    pub fn replacement(insn: &Insn) -> Option<(Insn, &'static str)> {
        let Insn::Jump(kind, label) = insn else {
            return None;
        };
        let swapped = match kind {
            JumpKind::IfLt => JumpKind::IfLe,
            JumpKind::IfLe => JumpKind::IfLt,
            JumpKind::IfGt => JumpKind::IfGe,
            JumpKind::IfGe => JumpKind::IfGt,
            JumpKind::IfICmpLt => JumpKind::IfICmpLe,
            JumpKind::IfICmpLe => JumpKind::IfICmpLt,
            JumpKind::IfICmpGt => JumpKind::IfICmpGe,
            JumpKind::IfICmpGe => JumpKind::IfICmpGt,
            _ => return None,
        };
        Some((Insn::Jump(swapped, *label), "changed conditional boundary"))
    }
}

impl MethodMutator for ConditionalsBoundaryMutator {
    fn globally_unique_id(&self) -> &'static str {
        "gauntlet.mutators.ConditionalsBoundary"
    }

    fn name(&self) -> &'static str {
        "CONDITIONALS_BOUNDARY"
    }

    fn visit(&self, insn: &Insn, ctx: &mut MutationContext, out: &mut InsnWriter) {
        apply_replacement(self, insn, Self::replacement(insn), ctx, out);
    }
}

/// Inverts every conditional jump.
#[derive(Debug, Default, Clone, Copy)]
pub struct NegateConditionalsMutator;

impl NegateConditionalsMutator {
    pub fn replacement(insn: &Insn) -> Option<(Insn, &'static str)> {
        let Insn::Jump(kind, label) = insn else {
            return None;
        };
        let negated = match kind {
            JumpKind::Goto => return None,
            JumpKind::IfEq => JumpKind::IfNe,
            JumpKind::IfNe => JumpKind::IfEq,
            JumpKind::IfLt => JumpKind::IfGe,
            JumpKind::IfGe => JumpKind::IfLt,
            JumpKind::IfGt => JumpKind::IfLe,
            JumpKind::IfLe => JumpKind::IfGt,
            JumpKind::IfICmpEq => JumpKind::IfICmpNe,
            JumpKind::IfICmpNe => JumpKind::IfICmpEq,
            JumpKind::IfICmpLt => JumpKind::IfICmpGe,
            JumpKind::IfICmpGe => JumpKind::IfICmpLt,
            JumpKind::IfICmpGt => JumpKind::IfICmpLe,
            JumpKind::IfICmpLe => JumpKind::IfICmpGt,
        };
        Some((Insn::Jump(negated, *label), "negated conditional"))
    }
}

impl MethodMutator for NegateConditionalsMutator {
    fn globally_unique_id(&self) -> &'static str {
        "gauntlet.mutators.NegateConditionals"
    }

    fn name(&self) -> &'static str {
        "NEGATE_CONDITIONALS"
    }

    fn visit(&self, insn: &Insn, ctx: &mut MutationContext, out: &mut InsnWriter) {
        apply_replacement(self, insn, Self::replacement(insn), ctx, out);
    }
}

/// Swaps integer arithmetic operators.
#[derive(Debug, Default, Clone, Copy)]
pub struct MathMutator;

impl MathMutator {
    pub fn replacement(insn: &Insn) -> Option<(Insn, &'static str)> {
        let Insn::Arith(op) = insn else {
            return None;
        };
        let (to, description) = match op {
            ArithOp::Add => (ArithOp::Sub, "Replaced integer addition with subtraction"),
            ArithOp::Sub => (ArithOp::Add, "Replaced integer subtraction with addition"),
            ArithOp::Mul => (ArithOp::Div, "Replaced integer multiplication with division"),
            ArithOp::Div => (ArithOp::Mul, "Replaced integer division with multiplication"),
            ArithOp::Rem => (ArithOp::Mul, "Replaced integer modulus with multiplication"),
        };
        Some((Insn::Arith(to), description))
    }
}

impl MethodMutator for MathMutator {
    fn globally_unique_id(&self) -> &'static str {
        "gauntlet.mutators.Math"
    }

    fn name(&self) -> &'static str {
        "MATH"
    }

    fn visit(&self, insn: &Insn, ctx: &mut MutationContext, out: &mut InsnWriter) {
        apply_replacement(self, insn, Self::replacement(insn), ctx, out);
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown mutator `{0}`")]
    UnknownMutator(String),
    #[error("no mutators selected")]
    Empty,
}

/// Name → mutator lookup plus the group names accepted in configuration.
#[derive(Debug, Clone)]
pub struct MutatorRegistry {
    mutators: BTreeMap<&'static str, Arc<dyn MethodMutator>>,
}

impl Default for MutatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MutatorRegistry {
    /// Creates a registry holding every built-in mutator, keyed by
    /// [`MethodMutator::name`].
    pub fn new() -> Self {
        let all: [Arc<dyn MethodMutator>; 4] = [
            Arc::new(ConditionalsBoundaryMutator),
            Arc::new(NegateConditionalsMutator),
            Arc::new(MathMutator),
            Arc::new(TemporalBoundaryMutator),
        ];
        Self {
            mutators: all.into_iter().map(|m| (m.name(), m)).collect(),
        }
    }

    /// Looks up a single mutator by name. Group names are not expanded here;
    /// use [`MutatorRegistry::resolve`] for configuration input.
    pub fn get(&self, name: &str) -> Option<Arc<dyn MethodMutator>> {
        self.mutators.get(name).cloned()
    }

    /// Names of every registered mutator, in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.mutators.keys().copied()
    }

    /// The stable, non-experimental rules.
    pub fn defaults(&self) -> Vec<Arc<dyn MethodMutator>> {
        ["CONDITIONALS_BOUNDARY", "NEGATE_CONDITIONALS", "MATH"]
            .iter()
            .filter_map(|name| self.get(name))
            .collect()
    }

    /// Resolves names and group names, keeping first-seen order and dropping
    /// repeats.
    ///
    /// # Arguments
    /// * `names`: Mutator names, [`DEFAULT_GROUP`] or [`ALL_GROUP`].
    ///
    /// # Returns
    /// The selected mutators, or an error for an unknown name or an empty
    /// selection.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn MethodMutator>>, RegistryError> {
        let mut resolved: Vec<Arc<dyn MethodMutator>> = Vec::new();
        for name in names {
            let group = match name.as_str() {
                DEFAULT_GROUP => self.defaults(),
                ALL_GROUP => self.mutators.values().cloned().collect(),
                other => vec![
                    self.get(other)
                        .ok_or_else(|| RegistryError::UnknownMutator(other.to_string()))?,
                ],
            };
            for mutator in group {
                if !resolved
                    .iter()
                    .any(|m| m.globally_unique_id() == mutator.globally_unique_id())
                {
                    resolved.push(mutator);
                }
            }
        }
        if resolved.is_empty() {
            return Err(RegistryError::Empty);
        }
        Ok(resolved)
    }
}
