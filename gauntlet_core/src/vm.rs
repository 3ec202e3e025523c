//! A small interpreter for instruction streams.
//!
//! Test units use a [`Program`] to load and execute one variant of the code
//! under test: the original, the coverage-instrumented build, or a mutant.

use crate::coverage::{COVERAGE_SINK_OWNER, CoverageSink, VISIT_PROBE, VISIT_PROBES};
use crate::engine::Mutant;
use crate::instruction::{
    ArithOp, BootstrapArg, ClassFile, CodecError, Descriptor, DynamicCall, Handle, Insn,
    InvokeKind, Label, MethodBody, MethodRef, VerifyError,
};
use crate::mutator::TEMPORAL_HELPER_OWNER;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_MAX_STEPS: u64 = 1_000_000;
const MAX_CALL_DEPTH: usize = 256;
const LAMBDA_BOOTSTRAP_OWNER: &str = "java/lang/invoke/LambdaMetafactory";
const BI_PREDICATE_OWNER: &str = "java/util/function/BiPredicate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemporalKind {
    Year,
    YearMonth,
    MonthDay,
    LocalDate,
    LocalTime,
    OffsetTime,
    LocalDateTime,
    OffsetDateTime,
    ZonedDateTime,
    Instant,
}

const TEMPORAL_OWNERS: &[(TemporalKind, &str)] = &[
    (TemporalKind::Year, "java/time/Year"),
    (TemporalKind::YearMonth, "java/time/YearMonth"),
    (TemporalKind::MonthDay, "java/time/MonthDay"),
    (TemporalKind::LocalDate, "java/time/LocalDate"),
    (TemporalKind::LocalTime, "java/time/LocalTime"),
    (TemporalKind::OffsetTime, "java/time/OffsetTime"),
    (TemporalKind::LocalDateTime, "java/time/LocalDateTime"),
    (TemporalKind::OffsetDateTime, "java/time/OffsetDateTime"),
    (TemporalKind::ZonedDateTime, "java/time/ZonedDateTime"),
    (TemporalKind::Instant, "java/time/Instant"),
];

impl TemporalKind {
    pub fn owner(self) -> &'static str {
        TEMPORAL_OWNERS
            .iter()
            .find(|(kind, _)| *kind == self)
            .map_or("java/time/Instant", |(_, owner)| owner)
    }

    pub fn from_owner(owner: &str) -> Option<Self> {
        TEMPORAL_OWNERS
            .iter()
            .find(|(_, o)| *o == owner)
            .map(|(kind, _)| *kind)
    }
}

/// A date/time value reduced to its position on the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Temporal {
    pub kind: TemporalKind,
    pub ordinal: i64,
}

impl Temporal {
    pub fn new(kind: TemporalKind, ordinal: i64) -> Self {
        Self { kind, ordinal }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Temporal(Temporal),
    /// A bound method handle produced by a dynamic call site.
    Function(Handle),
    Null,
    /// An interpreter fault caught by a catch-all handler. Throwing it
    /// re-raises the original fault.
    Fault(Box<VmError>),
}

impl Value {
    pub fn bool(b: bool) -> Self {
        Value::Int(i64::from(b))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The operand a catch-all handler receives for `fault`.
    fn from_fault(fault: VmError) -> Self {
        match fault {
            VmError::Thrown(value) => value,
            other => Value::Fault(Box::new(other)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Temporal(t) => write!(f, "{:?}({})", t.kind, t.ordinal),
            Value::Function(h) => write!(f, "&{}.{}", h.owner, h.name),
            Value::Null => f.write_str("null"),
            Value::Fault(e) => write!(f, "fault({e})"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("class `{0}` is not loaded")]
    UnknownClass(String),
    #[error("no method `{method}` in `{class}`")]
    UnknownMethod { class: String, method: String },
    #[error("unsupported call {owner}.{name}{descriptor}")]
    UnsupportedCall {
        owner: String,
        name: String,
        descriptor: String,
    },
    #[error("type error in {method} at instruction {index}: {message}")]
    Type {
        method: String,
        index: usize,
        message: String,
    },
    #[error("operand stack underflow in {0}")]
    StackUnderflow(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("jump to undefined label {0}")]
    UndefinedLabel(Label),
    #[error("control fell off the end of {0}")]
    FellOffEnd(String),
    #[error("uncaught throw of {0}")]
    Thrown(Value),
    #[error("step limit of {0} exceeded")]
    StepLimit(u64),
    #[error("call depth limit exceeded")]
    CallDepth,
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

impl VmError {
    /// Everything but an exhausted step budget can reach a catch-all handler.
    pub fn is_catchable(&self) -> bool {
        !matches!(self, VmError::StepLimit(_))
    }
}

/// One loadable variant of the program under test.
#[derive(Debug, Clone)]
pub struct Program {
    classes: Arc<BTreeMap<String, Arc<ClassFile>>>,
    sink: Option<Arc<CoverageSink>>,
    max_steps: u64,
}

impl Program {
    pub fn new(classes: Vec<ClassFile>) -> Self {
        Self {
            classes: Arc::new(
                classes
                    .into_iter()
                    .map(|c| (c.name.clone(), Arc::new(c)))
                    .collect(),
            ),
            sink: None,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Caps each `call` at `max_steps` executed instructions; past it the
    /// call fails with `VmError::StepLimit`.
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn class(&self, name: &str) -> Option<&ClassFile> {
        self.classes.get(name).map(|c| c.as_ref())
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassFile> {
        self.classes.values().map(|c| c.as_ref())
    }

    /// Same program with each of `replacements` taking the place of the class
    /// of the same name.
    pub fn with_classes(&self, replacements: impl IntoIterator<Item = ClassFile>) -> Self {
        let mut classes = (*self.classes).clone();
        for class in replacements {
            classes.insert(class.name.clone(), Arc::new(class));
        }
        Self {
            classes: Arc::new(classes),
            ..self.clone()
        }
    }

    pub fn with_class(&self, class: ClassFile) -> Self {
        self.with_classes([class])
    }

    /// Same program with the mutant's rewritten class swapped in.
    pub fn with_mutant(&self, mutant: &Mutant) -> Result<Self, CodecError> {
        Ok(self.with_class(mutant.class()?))
    }

    /// Same classes, with probe hits recorded into `sink`.
    pub fn with_sink(&self, sink: Arc<CoverageSink>) -> Self {
        Self {
            sink: Some(sink),
            ..self.clone()
        }
    }

    pub fn sink(&self) -> Option<&Arc<CoverageSink>> {
        self.sink.as_ref()
    }

    /// Calls the first static method called `method` in `class`.
    pub fn call(&self, class: &str, method: &str, args: Vec<Value>) -> Result<Value, VmError> {
        let owner = self
            .classes
            .get(class)
            .ok_or_else(|| VmError::UnknownClass(class.to_string()))?;
        let body = owner
            .method_named(method)
            .ok_or_else(|| VmError::UnknownMethod {
                class: class.to_string(),
                method: method.to_string(),
            })?;
        let mut interpreter = Interpreter {
            program: self,
            steps: 0,
            depth: 0,
        };
        Ok(interpreter
            .run_method(class, body, args)?
            .unwrap_or(Value::Null))
    }
}

struct Interpreter<'p> {
    program: &'p Program,
    steps: u64,
    depth: usize,
}

enum Control {
    Next,
    Return(Option<Value>),
}

struct Frame {
    name: String,
    stack: Vec<Value>,
    locals: Vec<Value>,
}

impl Frame {
    fn pop(&mut self) -> Result<Value, VmError> {
        self.stack
            .pop()
            .ok_or_else(|| VmError::StackUnderflow(self.name.clone()))
    }

    fn pop_int(&mut self, index: usize) -> Result<i64, VmError> {
        match self.pop()? {
            Value::Int(v) => Ok(v),
            other => Err(self.type_error(index, format!("expected int, found {other}"))),
        }
    }

    fn pop_args(&mut self, count: usize) -> Result<Vec<Value>, VmError> {
        if self.stack.len() < count {
            return Err(VmError::StackUnderflow(self.name.clone()));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn type_error(&self, index: usize, message: String) -> VmError {
        VmError::Type {
            method: self.name.clone(),
            index,
            message,
        }
    }
}

fn arith(op: ArithOp, a: i64, b: i64) -> Result<i64, VmError> {
    Ok(match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::Div => a.checked_div(b).ok_or(VmError::DivisionByZero)?,
        ArithOp::Rem => a.checked_rem(b).ok_or(VmError::DivisionByZero)?,
    })
}

impl Interpreter<'_> {
    fn tick(&mut self) -> Result<(), VmError> {
        self.steps += 1;
        if self.steps > self.program.max_steps {
            return Err(VmError::StepLimit(self.program.max_steps));
        }
        Ok(())
    }

    fn run_method(
        &mut self,
        class: &str,
        method: &MethodBody,
        args: Vec<Value>,
    ) -> Result<Option<Value>, VmError> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(VmError::CallDepth);
        }
        self.depth += 1;
        let result = self.execute(class, method, args);
        self.depth -= 1;
        result
    }

    fn execute(
        &mut self,
        class: &str,
        method: &MethodBody,
        args: Vec<Value>,
    ) -> Result<Option<Value>, VmError> {
        let returns_value = method.signature()?.ret.is_some();
        let labels: HashMap<Label, usize> = method
            .insns
            .iter()
            .enumerate()
            .filter_map(|(i, insn)| match insn {
                Insn::Label(label) => Some((*label, i)),
                _ => None,
            })
            .collect();
        let position = |label: Label| labels.get(&label).copied().ok_or(VmError::UndefinedLabel(label));
        let guarded = match &method.catch_all {
            Some(c) => Some((position(c.start)?, position(c.handler)?)),
            None => None,
        };
        let mut frame = Frame {
            name: format!("{class}.{}", method.key()),
            stack: Vec::new(),
            locals: args,
        };
        let mut pc = 0;

        loop {
            let index = pc;
            let insn = method
                .insns
                .get(index)
                .ok_or_else(|| VmError::FellOffEnd(frame.name.clone()))?;
            self.tick()?;
            pc += 1;

            match self.step(insn, index, &mut frame, &labels, &mut pc, returns_value) {
                Ok(Control::Next) => {}
                Ok(Control::Return(value)) => return Ok(value),
                Err(fault) => match guarded {
                    Some((start, handler)) if (start..handler).contains(&index) && fault.is_catchable() => {
                        frame.stack.clear();
                        frame.stack.push(Value::from_fault(fault));
                        pc = handler;
                    }
                    _ => return Err(fault),
                },
            }
        }
    }

    fn step(
        &mut self,
        insn: &Insn,
        index: usize,
        frame: &mut Frame,
        labels: &HashMap<Label, usize>,
        pc: &mut usize,
        returns_value: bool,
    ) -> Result<Control, VmError> {
        match insn {
            Insn::Const(v) => frame.stack.push(Value::Int(*v)),
            Insn::Load(slot) => {
                let value = frame
                    .locals
                    .get(usize::from(*slot))
                    .cloned()
                    .ok_or_else(|| frame.type_error(index, format!("local {slot} unset")))?;
                frame.stack.push(value);
            }
            Insn::Store(slot) => {
                let value = frame.pop()?;
                let slot = usize::from(*slot);
                if frame.locals.len() <= slot {
                    frame.locals.resize(slot + 1, Value::Null);
                }
                frame.locals[slot] = value;
            }
            Insn::Arith(op) => {
                let b = frame.pop_int(index)?;
                let a = frame.pop_int(index)?;
                frame.stack.push(Value::Int(arith(*op, a, b)?));
            }
            Insn::Neg => {
                let v = frame.pop_int(index)?;
                frame.stack.push(Value::Int(v.wrapping_neg()));
            }
            Insn::Dup => {
                let v = frame.pop()?;
                frame.stack.push(v.clone());
                frame.stack.push(v);
            }
            Insn::Pop => {
                frame.pop()?;
            }
            Insn::Jump(kind, label) => {
                let (lhs, rhs) = match kind.operands() {
                    0 => (0, 0),
                    1 => (0, frame.pop_int(index)?),
                    _ => {
                        let rhs = frame.pop_int(index)?;
                        (frame.pop_int(index)?, rhs)
                    }
                };
                if kind.taken(lhs, rhs) {
                    *pc = *labels.get(label).ok_or(VmError::UndefinedLabel(*label))?;
                }
            }
            Insn::Label(_) | Insn::Line(_) => {}
            Insn::Invoke(call) => {
                let sig = Descriptor::parse(&call.descriptor)?;
                let args = frame.pop_args(sig.args.len())?;
                let receiver = match call.kind {
                    InvokeKind::Static => None,
                    _ => Some(frame.pop()?),
                };
                let result = self.invoke(call, receiver, args)?;
                if sig.ret.is_some() {
                    frame.stack.push(result.unwrap_or(Value::Null));
                }
            }
            Insn::InvokeDynamic(call) => {
                let sig = Descriptor::parse(&call.descriptor)?;
                frame.pop_args(sig.args.len())?;
                frame.stack.push(self.bootstrap(call)?);
            }
            Insn::Return => {
                let value = if returns_value { Some(frame.pop()?) } else { None };
                return Ok(Control::Return(value));
            }
            Insn::Throw => {
                return Err(match frame.pop()? {
                    Value::Fault(fault) => *fault,
                    value => VmError::Thrown(value),
                });
            }
        }
        Ok(Control::Next)
    }

    fn invoke(
        &mut self,
        call: &MethodRef,
        receiver: Option<Value>,
        args: Vec<Value>,
    ) -> Result<Option<Value>, VmError> {
        let unsupported = || VmError::UnsupportedCall {
            owner: call.owner.clone(),
            name: call.name.clone(),
            descriptor: call.descriptor.clone(),
        };

        if call.owner == COVERAGE_SINK_OWNER {
            return self.record_probes(call, &args).map(|()| None);
        }
        if call.owner == TEMPORAL_HELPER_OWNER {
            let [a, b] = args.as_slice() else {
                return Err(unsupported());
            };
            return match call.name.as_str() {
                "isBeforeOrEqual" => Ok(Some(Value::bool(!compare_temporal("isAfter", a, b)?))),
                "isAfterOrEqual" => Ok(Some(Value::bool(!compare_temporal("isBefore", a, b)?))),
                _ => Err(unsupported()),
            };
        }
        if TemporalKind::from_owner(&call.owner).is_some() {
            let (Some(recv), [arg]) = (receiver.as_ref(), args.as_slice()) else {
                return Err(unsupported());
            };
            return match call.name.as_str() {
                "isBefore" | "isAfter" | "isEqual" => {
                    Ok(Some(Value::bool(compare_temporal(&call.name, recv, arg)?)))
                }
                _ => Err(unsupported()),
            };
        }
        if call.owner == BI_PREDICATE_OWNER && call.name == "test" {
            let Some(Value::Function(handle)) = receiver else {
                return Err(unsupported());
            };
            return self.call_handle(&handle, args);
        }

        let class = self
            .program
            .classes
            .get(&call.owner)
            .cloned()
            .ok_or_else(|| VmError::UnknownClass(call.owner.clone()))?;
        let body = class
            .methods
            .iter()
            .find(|m| m.name == call.name && m.descriptor == call.descriptor)
            .ok_or_else(|| VmError::UnknownMethod {
                class: call.owner.clone(),
                method: format!("{}{}", call.name, call.descriptor),
            })?;
        let mut locals = Vec::with_capacity(args.len() + 1);
        locals.extend(receiver);
        locals.extend(args);
        self.run_method(&class.name, body, locals)
    }

    fn call_handle(&mut self, handle: &Handle, mut args: Vec<Value>) -> Result<Option<Value>, VmError> {
        let call = MethodRef {
            kind: handle.kind,
            owner: handle.owner.clone(),
            name: handle.name.clone(),
            descriptor: handle.descriptor.clone(),
        };
        match handle.kind {
            InvokeKind::Static => self.invoke(&call, None, args),
            _ if !args.is_empty() => {
                let receiver = args.remove(0);
                self.invoke(&call, Some(receiver), args)
            }
            _ => Err(VmError::UnsupportedCall {
                owner: call.owner,
                name: call.name,
                descriptor: call.descriptor,
            }),
        }
    }

    /// Lambda-style bootstraps bind the implementation handle, which is the
    /// first handle among the bootstrap arguments.
    fn bootstrap(&mut self, call: &DynamicCall) -> Result<Value, VmError> {
        let handle = (call.bootstrap.owner == LAMBDA_BOOTSTRAP_OWNER)
            .then(|| {
                call.args.iter().find_map(|arg| match arg {
                    BootstrapArg::Handle(h) => Some(h.clone()),
                    _ => None,
                })
            })
            .flatten();
        handle.map(Value::Function).ok_or_else(|| VmError::UnsupportedCall {
            owner: call.bootstrap.owner.clone(),
            name: call.bootstrap.name.clone(),
            descriptor: call.descriptor.clone(),
        })
    }

    fn record_probes(&mut self, call: &MethodRef, args: &[Value]) -> Result<(), VmError> {
        let ints: Vec<i64> = args.iter().filter_map(Value::as_int).collect();
        if ints.len() != args.len() || ints.len() < 2 {
            return Err(VmError::UnsupportedCall {
                owner: call.owner.clone(),
                name: call.name.clone(),
                descriptor: call.descriptor.clone(),
            });
        }
        let Some(sink) = self.program.sink.as_ref() else {
            return Ok(());
        };
        let class_id = ints[0] as u32;
        match call.name.as_str() {
            VISIT_PROBE => sink.visit(class_id, ints[1] as u32),
            VISIT_PROBES => sink.visit_all(class_id, ints[1] as u32, &ints[2..]),
            _ => {
                return Err(VmError::UnsupportedCall {
                    owner: call.owner.clone(),
                    name: call.name.clone(),
                    descriptor: call.descriptor.clone(),
                });
            }
        }
        Ok(())
    }
}

fn compare_temporal(name: &str, receiver: &Value, arg: &Value) -> Result<bool, VmError> {
    let (Value::Temporal(a), Value::Temporal(b)) = (receiver, arg) else {
        return Err(VmError::Type {
            method: name.to_string(),
            index: 0,
            message: format!("cannot compare {receiver} with {arg}"),
        });
    };
    if a.kind != b.kind {
        return Err(VmError::Type {
            method: name.to_string(),
            index: 0,
            message: format!("cannot compare {:?} with {:?}", a.kind, b.kind),
        });
    }
    Ok(match name {
        "isBefore" => a.ordinal < b.ordinal,
        "isAfter" => a.ordinal > b.ordinal,
        _ => a.ordinal == b.ordinal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{CatchAll, JumpKind};

    fn date(day: i64) -> Value {
        Value::Temporal(Temporal::new(TemporalKind::LocalDate, day))
    }

    fn lambda_class(handle: Handle) -> ClassFile {
        ClassFile::new(
            "demo/Lambdas",
            vec![MethodBody::new(
                "compare",
                "(Ljava/time/LocalDate;Ljava/time/LocalDate;)Z",
                true,
                vec![
                    Insn::Line(1),
                    Insn::InvokeDynamic(DynamicCall {
                        name: "test".to_string(),
                        descriptor: "()Ljava/util/function/BiPredicate;".to_string(),
                        bootstrap: Handle {
                            kind: InvokeKind::Static,
                            owner: LAMBDA_BOOTSTRAP_OWNER.to_string(),
                            name: "metafactory".to_string(),
                            descriptor: "()V".to_string(),
                        },
                        args: vec![BootstrapArg::Handle(handle)],
                    }),
                    Insn::Load(0),
                    Insn::Load(1),
                    Insn::invoke(
                        InvokeKind::Interface,
                        BI_PREDICATE_OWNER,
                        "test",
                        "(Ljava/lang/Object;Ljava/lang/Object;)Z",
                    ),
                    Insn::Return,
                ],
            )],
        )
    }

    #[test]
    fn runs_arithmetic_and_branches() {
        let class = ClassFile::new(
            "demo/Math",
            vec![MethodBody::new(
                "abs",
                "(I)I",
                true,
                vec![
                    Insn::Load(0),
                    Insn::Jump(JumpKind::IfGe, Label(0)),
                    Insn::Load(0),
                    Insn::Neg,
                    Insn::Return,
                    Insn::Label(Label(0)),
                    Insn::Load(0),
                    Insn::Return,
                ],
            )],
        );
        let program = Program::new(vec![class]);
        assert_eq!(program.call("demo/Math", "abs", vec![Value::Int(-4)]), Ok(Value::Int(4)));
        assert_eq!(program.call("demo/Math", "abs", vec![Value::Int(7)]), Ok(Value::Int(7)));
    }

    #[test]
    fn dynamic_sites_dispatch_through_bound_handles() {
        let virtual_handle = Handle {
            kind: InvokeKind::Virtual,
            owner: "java/time/LocalDate".to_string(),
            name: "isBefore".to_string(),
            descriptor: "(Ljava/time/chrono/ChronoLocalDate;)Z".to_string(),
        };
        let program = Program::new(vec![lambda_class(virtual_handle)]);
        assert_eq!(program.call("demo/Lambdas", "compare", vec![date(1), date(2)]), Ok(Value::Int(1)));
        assert_eq!(program.call("demo/Lambdas", "compare", vec![date(2), date(2)]), Ok(Value::Int(0)));

        let helper = Handle {
            kind: InvokeKind::Static,
            owner: TEMPORAL_HELPER_OWNER.to_string(),
            name: "isAfterOrEqual".to_string(),
            descriptor: "(Ljava/time/LocalDate;Ljava/time/chrono/ChronoLocalDate;)Z".to_string(),
        };
        let program = Program::new(vec![lambda_class(helper)]);
        assert_eq!(program.call("demo/Lambdas", "compare", vec![date(2), date(2)]), Ok(Value::Int(1)));
        assert_eq!(program.call("demo/Lambdas", "compare", vec![date(1), date(2)]), Ok(Value::Int(0)));
    }

    #[test]
    fn step_budget_stops_runaway_loops() {
        let spin = ClassFile::new(
            "demo/Spin",
            vec![MethodBody::new(
                "forever",
                "()V",
                true,
                vec![Insn::Label(Label(0)), Insn::Jump(JumpKind::Goto, Label(0))],
            )],
        );
        let program = Program::new(vec![spin]).with_max_steps(500);
        assert_eq!(program.call("demo/Spin", "forever", vec![]), Err(VmError::StepLimit(500)));
    }

    #[test]
    fn reports_missing_code_and_runtime_faults() {
        let class = ClassFile::new(
            "demo/Faults",
            vec![
                MethodBody::new(
                    "divide",
                    "(II)I",
                    true,
                    vec![Insn::Load(0), Insn::Load(1), Insn::Arith(ArithOp::Div), Insn::Return],
                ),
                MethodBody::new("raise", "()V", true, vec![Insn::Const(7), Insn::Throw]),
            ],
        );
        let program = Program::new(vec![class]);
        assert_eq!(
            program.call("demo/Faults", "divide", vec![Value::Int(1), Value::Int(0)]),
            Err(VmError::DivisionByZero)
        );
        assert_eq!(program.call("demo/Faults", "raise", vec![]), Err(VmError::Thrown(Value::Int(7))));
        assert!(matches!(program.call("demo/Nope", "x", vec![]), Err(VmError::UnknownClass(_))));
        assert!(matches!(
            program.call("demo/Faults", "missing", vec![]),
            Err(VmError::UnknownMethod { .. })
        ));
    }

    fn guarded(name: &str, descriptor: &str, body: Vec<Insn>, handler: Vec<Insn>) -> MethodBody {
        let mut insns = vec![Insn::Label(Label(0))];
        insns.extend(body);
        insns.push(Insn::Label(Label(1)));
        insns.extend(handler);
        MethodBody {
            catch_all: Some(CatchAll {
                start: Label(0),
                handler: Label(1),
            }),
            ..MethodBody::new(name, descriptor, true, insns)
        }
    }

    #[test]
    fn catch_all_handlers_receive_callee_faults() {
        let divide_call = || {
            vec![
                Insn::Load(0),
                Insn::Load(1),
                Insn::invoke_static("demo/Divide", "divide", "(II)I"),
                Insn::Return,
            ]
        };
        let divide = ClassFile::new(
            "demo/Divide",
            vec![MethodBody::new(
                "divide",
                "(II)I",
                true,
                vec![Insn::Load(0), Insn::Load(1), Insn::Arith(ArithOp::Div), Insn::Return],
            )],
        );
        let callers = ClassFile::new(
            "demo/Callers",
            vec![
                guarded("rethrowing", "(II)I", divide_call(), vec![Insn::Throw]),
                guarded(
                    "recovering",
                    "(II)I",
                    divide_call(),
                    vec![Insn::Pop, Insn::Const(-1), Insn::Return],
                ),
            ],
        );
        for method in &callers.methods {
            crate::instruction::verify_method(method).expect("guarded callers verify");
        }
        let program = Program::new(vec![divide, callers]);
        let call = |method: &str, a: i64, b: i64| {
            program.call("demo/Callers", method, vec![Value::Int(a), Value::Int(b)])
        };

        assert_eq!(call("rethrowing", 6, 3), Ok(Value::Int(2)));
        assert_eq!(call("rethrowing", 1, 0), Err(VmError::DivisionByZero));
        assert_eq!(call("recovering", 1, 0), Ok(Value::Int(-1)));
    }

    #[test]
    fn catch_all_handlers_rethrow_thrown_values_unchanged() {
        let class = ClassFile::new(
            "demo/Raise",
            vec![guarded("raise", "()V", vec![Insn::Const(7), Insn::Throw], vec![Insn::Throw])],
        );
        let program = Program::new(vec![class]);
        assert_eq!(program.call("demo/Raise", "raise", vec![]), Err(VmError::Thrown(Value::Int(7))));
    }

    #[test]
    fn step_limit_is_not_caught() {
        let spin = ClassFile::new(
            "demo/Spin",
            vec![guarded(
                "forever",
                "()V",
                vec![Insn::Jump(JumpKind::Goto, Label(0))],
                vec![Insn::Pop, Insn::Return],
            )],
        );
        let program = Program::new(vec![spin]).with_max_steps(100);
        assert_eq!(program.call("demo/Spin", "forever", vec![]), Err(VmError::StepLimit(100)));
    }

    #[test]
    fn with_class_leaves_original_untouched() {
        let a = ClassFile::new("demo/A", vec![MethodBody::new("one", "()I", true, vec![Insn::Const(1), Insn::Return])]);
        let b = ClassFile::new("demo/A", vec![MethodBody::new("one", "()I", true, vec![Insn::Const(2), Insn::Return])]);
        let original = Program::new(vec![a]);
        let variant = original.with_class(b);
        assert_eq!(original.call("demo/A", "one", vec![]), Ok(Value::Int(1)));
        assert_eq!(variant.call("demo/A", "one", vec![]), Ok(Value::Int(2)));
    }
}
