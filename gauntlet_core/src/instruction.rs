use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use thiserror::Error;

/// A jump target inside a single method body.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Encode, Decode,
)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub enum JumpKind {
    Goto,
    IfEq,
    IfNe,
    IfLt,
    IfGe,
    IfGt,
    IfLe,
    IfICmpEq,
    IfICmpNe,
    IfICmpLt,
    IfICmpGe,
    IfICmpGt,
    IfICmpLe,
}

impl JumpKind {
    /// Number of int operands the jump pops before deciding.
    pub fn operands(self) -> usize {
        match self {
            JumpKind::Goto => 0,
            JumpKind::IfEq
            | JumpKind::IfNe
            | JumpKind::IfLt
            | JumpKind::IfGe
            | JumpKind::IfGt
            | JumpKind::IfLe => 1,
            _ => 2,
        }
    }

    pub fn is_conditional(self) -> bool {
        self != JumpKind::Goto
    }

    /// Evaluates the branch condition. `lhs` is ignored for single-operand jumps,
    /// which compare `rhs` against zero.
    pub fn taken(self, lhs: i64, rhs: i64) -> bool {
        match self {
            JumpKind::Goto => true,
            JumpKind::IfEq => rhs == 0,
            JumpKind::IfNe => rhs != 0,
            JumpKind::IfLt => rhs < 0,
            JumpKind::IfGe => rhs >= 0,
            JumpKind::IfGt => rhs > 0,
            JumpKind::IfLe => rhs <= 0,
            JumpKind::IfICmpEq => lhs == rhs,
            JumpKind::IfICmpNe => lhs != rhs,
            JumpKind::IfICmpLt => lhs < rhs,
            JumpKind::IfICmpGe => lhs >= rhs,
            JumpKind::IfICmpGt => lhs > rhs,
            JumpKind::IfICmpLe => lhs <= rhs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub enum InvokeKind {
    Virtual,
    Static,
    Interface,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct MethodRef {
    pub kind: InvokeKind,
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

/// A method handle as carried by dynamic call sites.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct Handle {
    pub kind: InvokeKind,
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub enum BootstrapArg {
    Int(i64),
    MethodType(String),
    Handle(Handle),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct DynamicCall {
    pub name: String,
    pub descriptor: String,
    pub bootstrap: Handle,
    pub args: Vec<BootstrapArg>,
}

/// One node of a method's instruction stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub enum Insn {
    Const(i64),
    Load(u16),
    Store(u16),
    Arith(ArithOp),
    Neg,
    Dup,
    Pop,
    Jump(JumpKind, Label),
    Label(Label),
    /// Source line marker. These are the instrumentable locations.
    Line(u32),
    Invoke(MethodRef),
    InvokeDynamic(DynamicCall),
    Return,
    Throw,
}

impl Insn {
    pub fn invoke(kind: InvokeKind, owner: &str, name: &str, descriptor: &str) -> Self {
        Insn::Invoke(MethodRef {
            kind,
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        })
    }

    pub fn invoke_virtual(owner: &str, name: &str, descriptor: &str) -> Self {
        Self::invoke(InvokeKind::Virtual, owner, name, descriptor)
    }

    pub fn invoke_static(owner: &str, name: &str, descriptor: &str) -> Self {
        Self::invoke(InvokeKind::Static, owner, name, descriptor)
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insn::Const(v) => write!(f, "const {v}"),
            Insn::Load(s) => write!(f, "load {s}"),
            Insn::Store(s) => write!(f, "store {s}"),
            Insn::Arith(op) => write!(f, "{}", format!("{op:?}").to_lowercase()),
            Insn::Neg => f.write_str("neg"),
            Insn::Dup => f.write_str("dup"),
            Insn::Pop => f.write_str("pop"),
            Insn::Jump(kind, label) => write!(f, "{kind:?} {label}"),
            Insn::Label(label) => write!(f, "{label}:"),
            Insn::Line(line) => write!(f, "line {line}"),
            Insn::Invoke(m) => write!(f, "invoke{:?} {}.{}{}", m.kind, m.owner, m.name, m.descriptor),
            Insn::InvokeDynamic(c) => write!(f, "invokedynamic {}{}", c.name, c.descriptor),
            Insn::Return => f.write_str("return"),
            Insn::Throw => f.write_str("throw"),
        }
    }
}

/// Identifies a method inside its class.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Encode, Decode,
)]
pub struct MethodKey {
    pub name: String,
    pub descriptor: String,
}

impl MethodKey {
    pub fn new(name: &str, descriptor: &str) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.descriptor)
    }
}

/// A handler receiving every fault raised while control is at or after
/// `start` and before `handler`. The handler is entered with the fault as the
/// only operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct CatchAll {
    pub start: Label,
    pub handler: Label,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct MethodBody {
    pub name: String,
    pub descriptor: String,
    pub is_static: bool,
    pub insns: Vec<Insn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catch_all: Option<CatchAll>,
}

impl MethodBody {
    pub fn new(name: &str, descriptor: &str, is_static: bool, insns: Vec<Insn>) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            is_static,
            insns,
            catch_all: None,
        }
    }

    pub fn key(&self) -> MethodKey {
        MethodKey::new(&self.name, &self.descriptor)
    }

    pub fn signature(&self) -> Result<Descriptor, VerifyError> {
        Descriptor::parse(&self.descriptor)
    }

    /// Number of local slots taken by the receiver and arguments.
    pub fn parameter_slots(&self) -> Result<u16, VerifyError> {
        let receiver = u16::from(!self.is_static);
        u16::try_from(self.signature()?.args.len())
            .ok()
            .and_then(|args| args.checked_add(receiver))
            .ok_or(VerifyError::LocalsExhausted)
    }

    /// First local slot that neither a parameter nor any load/store uses.
    pub fn first_free_local(&self) -> Result<u16, VerifyError> {
        let highest = self
            .insns
            .iter()
            .filter_map(|insn| match insn {
                Insn::Load(slot) | Insn::Store(slot) => Some(*slot),
                _ => None,
            })
            .max();
        let used = match highest {
            Some(slot) => slot.checked_add(1).ok_or(VerifyError::LocalsExhausted)?,
            None => 0,
        };
        Ok(used.max(self.parameter_slots()?))
    }

    /// First label number not yet defined or referenced in this body.
    ///
    /// # Errors
    /// [`VerifyError::LabelsExhausted`] when the body already uses the
    /// largest label number.
    pub fn next_free_label(&self) -> Result<u32, VerifyError> {
        let highest = self
            .insns
            .iter()
            .filter_map(|insn| match insn {
                Insn::Label(l) | Insn::Jump(_, l) => Some(l.0),
                _ => None,
            })
            .chain(self.catch_all.iter().flat_map(|c| [c.start.0, c.handler.0]))
            .max();
        match highest {
            Some(label) => label.checked_add(1).ok_or(VerifyError::LabelsExhausted),
            None => Ok(0),
        }
    }
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("class encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("class decoding failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ClassFile {
    pub name: String,
    pub methods: Vec<MethodBody>,
}

impl ClassFile {
    pub fn new(name: &str, methods: Vec<MethodBody>) -> Self {
        Self {
            name: name.to_string(),
            methods,
        }
    }

    pub fn method(&self, key: &MethodKey) -> Option<&MethodBody> {
        self.methods
            .iter()
            .find(|m| m.name == key.name && m.descriptor == key.descriptor)
    }

    pub fn method_named(&self, name: &str) -> Option<&MethodBody> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let (class, _read) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(class)
    }
}

/// Coarse value category tracked by the stack checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Int,
    Ref,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub args: Vec<Kind>,
    pub ret: Option<Kind>,
}

impl Descriptor {
    /// Parses a JVM-style method descriptor such as `(IJ)Z`.
    pub fn parse(desc: &str) -> Result<Self, VerifyError> {
        let bad = || VerifyError::BadDescriptor(desc.to_string());
        let mut chars = desc.chars().peekable();
        if chars.next() != Some('(') {
            return Err(bad());
        }
        let mut args = Vec::new();
        loop {
            match chars.peek() {
                Some(')') => {
                    chars.next();
                    break;
                }
                Some(_) => args.push(parse_field_type(&mut chars).ok_or_else(bad)?),
                None => return Err(bad()),
            }
        }
        let ret = match chars.peek() {
            Some('V') => {
                chars.next();
                None
            }
            Some(_) => Some(parse_field_type(&mut chars).ok_or_else(bad)?),
            None => return Err(bad()),
        };
        if chars.next().is_some() {
            return Err(bad());
        }
        Ok(Self { args, ret })
    }
}

fn parse_field_type(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<Kind> {
    match chars.next()? {
        'I' | 'Z' | 'B' | 'C' | 'S' => Some(Kind::Int),
        'L' => {
            let mut saw_name = false;
            for c in chars.by_ref() {
                if c == ';' {
                    return saw_name.then_some(Kind::Ref);
                }
                saw_name = true;
            }
            None
        }
        '[' => {
            while chars.peek() == Some(&'[') {
                chars.next();
            }
            parse_field_type(chars).map(|_| Kind::Ref)
        }
        _ => None,
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("malformed descriptor `{0}`")]
    BadDescriptor(String),
    #[error("stack underflow at instruction {index}")]
    StackUnderflow { index: usize },
    #[error("expected {expected:?} at instruction {index}, found {found:?}")]
    KindMismatch {
        index: usize,
        expected: Kind,
        found: Kind,
    },
    #[error("inconsistent stack at instruction {index}: {first:?} vs {second:?}")]
    StackMismatch {
        index: usize,
        first: Vec<Kind>,
        second: Vec<Kind>,
    },
    #[error("load of unset local {slot} at instruction {index}")]
    UnsetLocal { index: usize, slot: u16 },
    #[error("jump to undefined label {0}")]
    UndefinedLabel(Label),
    #[error("label {0} defined twice")]
    DuplicateLabel(Label),
    #[error("control falls off the end of the method")]
    FallsOffEnd,
    #[error("return at instruction {index} leaves {left:?} on the stack")]
    LeftoverOnReturn { index: usize, left: Vec<Kind> },
    #[error("no free local slot left")]
    LocalsExhausted,
    #[error("no free label number left")]
    LabelsExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    stack: Vec<Kind>,
    locals: BTreeMap<u16, Kind>,
}

impl Frame {
    fn pop(&mut self, index: usize) -> Result<Kind, VerifyError> {
        self.stack.pop().ok_or(VerifyError::StackUnderflow { index })
    }

    fn pop_kind(&mut self, expected: Kind, index: usize) -> Result<(), VerifyError> {
        let found = self.pop(index)?;
        if found != expected {
            return Err(VerifyError::KindMismatch {
                index,
                expected,
                found,
            });
        }
        Ok(())
    }

    fn pop_call(&mut self, descriptor: &str, index: usize) -> Result<(), VerifyError> {
        let sig = Descriptor::parse(descriptor)?;
        for kind in sig.args.iter().rev() {
            self.pop_kind(*kind, index)?;
        }
        if let Some(ret) = sig.ret {
            self.stack.push(ret);
        }
        Ok(())
    }
}

enum Flow {
    Next,
    Branch(Label),
    Goto(Label),
    Exit,
}

/// What a `Return` must find on the stack. `None` means the stream is a
/// snippet and returns are not checked.
type ReturnRule = Option<Option<Kind>>;

fn step(insn: &Insn, index: usize, frame: &mut Frame, rule: ReturnRule) -> Result<Flow, VerifyError> {
    match insn {
        Insn::Const(_) => frame.stack.push(Kind::Int),
        Insn::Load(slot) => {
            let kind = *frame.locals.get(slot).ok_or(VerifyError::UnsetLocal {
                index,
                slot: *slot,
            })?;
            frame.stack.push(kind);
        }
        Insn::Store(slot) => {
            let kind = frame.pop(index)?;
            frame.locals.insert(*slot, kind);
        }
        Insn::Arith(_) => {
            frame.pop_kind(Kind::Int, index)?;
            frame.pop_kind(Kind::Int, index)?;
            frame.stack.push(Kind::Int);
        }
        Insn::Neg => {
            frame.pop_kind(Kind::Int, index)?;
            frame.stack.push(Kind::Int);
        }
        Insn::Dup => {
            let kind = frame.pop(index)?;
            frame.stack.push(kind);
            frame.stack.push(kind);
        }
        Insn::Pop => {
            frame.pop(index)?;
        }
        Insn::Jump(kind, label) => {
            for _ in 0..kind.operands() {
                frame.pop_kind(Kind::Int, index)?;
            }
            return Ok(if kind.is_conditional() {
                Flow::Branch(*label)
            } else {
                Flow::Goto(*label)
            });
        }
        Insn::Label(_) | Insn::Line(_) => {}
        Insn::Invoke(m) => {
            let sig = Descriptor::parse(&m.descriptor)?;
            for kind in sig.args.iter().rev() {
                frame.pop_kind(*kind, index)?;
            }
            if m.kind != InvokeKind::Static {
                frame.pop_kind(Kind::Ref, index)?;
            }
            if let Some(ret) = sig.ret {
                frame.stack.push(ret);
            }
        }
        Insn::InvokeDynamic(call) => frame.pop_call(&call.descriptor, index)?,
        Insn::Return => {
            if let Some(ret) = rule {
                if let Some(kind) = ret {
                    frame.pop_kind(kind, index)?;
                }
                if !frame.stack.is_empty() {
                    return Err(VerifyError::LeftoverOnReturn {
                        index,
                        left: frame.stack.clone(),
                    });
                }
            }
            return Ok(Flow::Exit);
        }
        Insn::Throw => {
            frame.pop(index)?;
            return Ok(Flow::Exit);
        }
    }
    Ok(Flow::Next)
}

fn label_positions(insns: &[Insn]) -> Result<HashMap<Label, usize>, VerifyError> {
    let mut positions = HashMap::new();
    for (i, insn) in insns.iter().enumerate() {
        if let Insn::Label(label) = insn {
            if positions.insert(*label, i).is_some() {
                return Err(VerifyError::DuplicateLabel(*label));
            }
        }
    }
    Ok(positions)
}

fn merge_into(
    states: &mut [Option<Frame>],
    target: usize,
    incoming: Frame,
    work: &mut VecDeque<usize>,
) -> Result<(), VerifyError> {
    let Some(existing) = states[target].as_mut() else {
        states[target] = Some(incoming);
        work.push_back(target);
        return Ok(());
    };
    if existing.stack != incoming.stack {
        return Err(VerifyError::StackMismatch {
            index: target,
            first: existing.stack.clone(),
            second: incoming.stack,
        });
    }
    let before = existing.locals.len();
    existing
        .locals
        .retain(|slot, kind| incoming.locals.get(slot) == Some(kind));
    if existing.locals.len() != before {
        work.push_back(target);
    }
    Ok(())
}

/// Abstract interpretation over the stream. Returns the frame reaching the
/// position just past the last instruction, if any path gets there.
fn analyse(
    insns: &[Insn],
    entry: Frame,
    rule: ReturnRule,
    catch_all: Option<&CatchAll>,
) -> Result<Option<Frame>, VerifyError> {
    let labels = label_positions(insns)?;
    let resolve = |label: &Label| labels.get(label).copied().ok_or(VerifyError::UndefinedLabel(*label));
    let guarded = catch_all
        .map(|c| Ok::<_, VerifyError>((resolve(&c.start)?, resolve(&c.handler)?)))
        .transpose()?;
    let mut states: Vec<Option<Frame>> = vec![None; insns.len() + 1];
    let mut work = VecDeque::new();
    merge_into(&mut states, 0, entry, &mut work)?;

    while let Some(i) = work.pop_front() {
        if i == insns.len() {
            continue;
        }
        let Some(mut frame) = states[i].clone() else {
            continue;
        };
        if let Some((start, handler)) = guarded {
            if (start..handler).contains(&i) {
                let fault = Frame {
                    stack: vec![Kind::Ref],
                    locals: frame.locals.clone(),
                };
                merge_into(&mut states, handler, fault, &mut work)?;
            }
        }
        match step(&insns[i], i, &mut frame, rule)? {
            Flow::Next => merge_into(&mut states, i + 1, frame, &mut work)?,
            Flow::Branch(label) => {
                let target = resolve(&label)?;
                merge_into(&mut states, target, frame.clone(), &mut work)?;
                merge_into(&mut states, i + 1, frame, &mut work)?;
            }
            Flow::Goto(label) => {
                let target = resolve(&label)?;
                merge_into(&mut states, target, frame, &mut work)?;
            }
            Flow::Exit => {}
        }
    }
    Ok(states.pop().flatten())
}

/// Statically checks that every path through `method` keeps the operand stack
/// balanced and well-kinded, and that no path falls off the end.
pub fn verify_method(method: &MethodBody) -> Result<(), VerifyError> {
    let sig = method.signature()?;
    method.parameter_slots()?;
    let receiver = (!method.is_static).then_some(Kind::Ref);
    let locals = receiver
        .into_iter()
        .chain(sig.args.iter().copied())
        .zip(0u16..)
        .map(|(kind, slot)| (slot, kind))
        .collect();
    let entry = Frame {
        stack: Vec::new(),
        locals,
    };
    match analyse(&method.insns, entry, Some(sig.ret), method.catch_all.as_ref())? {
        Some(_) => Err(VerifyError::FallsOffEnd),
        None => Ok(()),
    }
}

/// Runs a snippet from `entry` and reports the operand stack at its end.
/// `Ok(None)` when no path reaches the end.
pub fn sequence_effect(insns: &[Insn], entry: Vec<Kind>) -> Result<Option<Vec<Kind>>, VerifyError> {
    let frame = Frame {
        stack: entry,
        locals: BTreeMap::new(),
    };
    Ok(analyse(insns, frame, None, None)?.map(|f| f.stack))
}
