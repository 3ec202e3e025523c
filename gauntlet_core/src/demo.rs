//! A small date-handling program and its test suite, used by the CLI's
//! `demo` command and by the analysis tests.

use crate::instruction::{
    ArithOp, BootstrapArg, ClassFile, DynamicCall, Handle, Insn, InvokeKind, JumpKind, Label,
    MethodBody,
};
use crate::unit::{FnTestUnit, TestUnit};
use crate::vm::{Program, Temporal, TemporalKind, Value};
use std::sync::Arc;

pub const DATES_CLASS: &str = "demo/Dates";
const LOCAL_DATE: &str = "java/time/LocalDate";
const DATE_CMP: &str = "(Ljava/time/chrono/ChronoLocalDate;)Z";
const DATE_PAIR: &str = "(Ljava/time/LocalDate;Ljava/time/LocalDate;)Z";

pub fn date(day: i64) -> Value {
    Value::Temporal(Temporal::new(TemporalKind::LocalDate, day))
}

fn lambda_site(handle_name: &str) -> Insn {
    Insn::InvokeDynamic(DynamicCall {
        name: "test".to_string(),
        descriptor: "()Ljava/util/function/BiPredicate;".to_string(),
        bootstrap: Handle {
            kind: InvokeKind::Static,
            owner: "java/lang/invoke/LambdaMetafactory".to_string(),
            name: "metafactory".to_string(),
            descriptor: "()V".to_string(),
        },
        args: vec![
            BootstrapArg::MethodType("(Ljava/lang/Object;Ljava/lang/Object;)Z".to_string()),
            BootstrapArg::Handle(Handle {
                kind: InvokeKind::Virtual,
                owner: LOCAL_DATE.to_string(),
                name: handle_name.to_string(),
                descriptor: DATE_CMP.to_string(),
            }),
        ],
    })
}

pub fn dates_class() -> ClassFile {
    ClassFile::new(
        DATES_CLASS,
        vec![
            MethodBody::new(
                "isBefore",
                DATE_PAIR,
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
                "isAfterViaPredicate",
                DATE_PAIR,
                true,
                vec![
                    Insn::Line(15),
                    lambda_site("isAfter"),
                    Insn::Load(0),
                    Insn::Load(1),
                    Insn::invoke(
                        InvokeKind::Interface,
                        "java/util/function/BiPredicate",
                        "test",
                        "(Ljava/lang/Object;Ljava/lang/Object;)Z",
                    ),
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
            MethodBody::new(
                "nextDay",
                "(I)I",
                true,
                vec![
                    Insn::Line(30),
                    Insn::Load(0),
                    Insn::Const(1),
                    Insn::Arith(ArithOp::Add),
                    Insn::Return,
                ],
            ),
        ],
    )
}

pub fn program() -> Program {
    Program::new(vec![dates_class()])
}

fn check(program: &Program, method: &str, args: Vec<Value>, expected: i64) -> anyhow::Result<()> {
    let actual = program.call(DATES_CLASS, method, args)?;
    assert_eq!(actual, Value::Int(expected), "{method}");
    Ok(())
}

/// Tests for [`dates_class`]. `nextDay` is deliberately left untested and the
/// clamp boundary at exactly 100 is never exercised.
pub fn units() -> Vec<Arc<dyn TestUnit>> {
    let unit = |name: &str, body: fn(&Program) -> anyhow::Result<()>| {
        Arc::new(FnTestUnit::new("demo/DatesTest", name, body)) as Arc<dyn TestUnit>
    };
    vec![
        unit("earlierDayIsBefore", |p| check(p, "isBefore", vec![date(1), date(2)], 1)),
        unit("laterDayIsNotBefore", |p| check(p, "isBefore", vec![date(3), date(2)], 0)),
        unit("sameDayIsNotBefore", |p| check(p, "isBefore", vec![date(2), date(2)], 0)),
        unit("predicateSeesLaterDay", |p| {
            check(p, "isAfterViaPredicate", vec![date(3), date(1)], 1)?;
            check(p, "isAfterViaPredicate", vec![date(1), date(1)], 0)
        }),
        unit("smallSumPassesThrough", |p| {
            check(p, "clampedSum", vec![Value::Int(1), Value::Int(2)], 3)
        }),
        unit("largeSumIsClamped", |p| {
            check(p, "clampedSum", vec![Value::Int(90), Value::Int(20)], 100)
        }),
    ]
}
