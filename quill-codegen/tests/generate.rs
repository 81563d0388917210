//! End-to-end tests: whole functions through `generate`, checked against
//! the shape of the emitted instruction stream.

use quill_codegen::ast::{
    BinOp, EscapeTarget, Expr, FunctionInfo, Literal, ScopeInfo, Stmt, TargetId, UnaryOp,
    VarLocation, VarRef,
};
use quill_codegen::generate;
use quill_common::{BailoutReason, SourcePos};
use quill_masm::{IcKind, Instr, MacroAssembler, Reg, RootIndex, RuntimeFn, Stub};

fn compile(info: &FunctionInfo) -> Result<MacroAssembler, BailoutReason> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut masm = MacroAssembler::new();
    generate(info, &mut masm)?;
    Ok(masm)
}

fn expr_stmt(expr: Expr) -> Stmt {
    Stmt::Expression {
        expr,
        pos: SourcePos::NONE,
    }
}

fn return_stmt(value: Expr) -> Stmt {
    Stmt::Return {
        value,
        pos: SourcePos::NONE,
    }
}

fn param(name: &str, index: usize) -> Expr {
    Expr::var(VarRef::parameter(name, index))
}

#[test]
fn test_add_one_compiles_to_an_inline_smi_add() {
    // function f(x) { return x + 1; }
    let info = FunctionInfo::new(
        "f",
        ScopeInfo::function(1, 0),
        vec![return_stmt(Expr::Binary {
            op: BinOp::Add,
            left: Box::new(param("x", 0)),
            right: Box::new(Expr::num(1.0)),
        })],
    );
    let masm = compile(&info).expect("no bailout");
    let stream = masm.instructions();

    assert!(stream.iter().any(|i| matches!(i, Instr::EnterFrame)));
    // The add itself is inlined; the generic stub only exists out of
    // line, reached by the overflow branch.
    assert!(stream.iter().any(|i| matches!(i, Instr::Add(_, _, _))));
    assert!(stream
        .iter()
        .any(|i| matches!(i, Instr::CallStub(Stub::GenericBinaryOp { .. }))));
    // Epilogue: one return dropping the receiver and one argument.
    assert!(stream.iter().any(|i| matches!(i, Instr::ExitFrame)));
    assert_eq!(
        stream
            .iter()
            .filter(|i| matches!(i, Instr::Ret(1)))
            .count(),
        1
    );
}

#[test]
fn test_empty_function_returns_undefined() {
    let info = FunctionInfo::new("f", ScopeInfo::function(0, 0), vec![]);
    let masm = compile(&info).expect("no bailout");
    let stream = masm.instructions();
    assert!(stream
        .iter()
        .any(|i| matches!(i, Instr::LoadRoot(Reg::V0, RootIndex::Undefined))));
    assert!(stream.iter().any(|i| matches!(i, Instr::Ret(0))));
}

#[test]
fn test_multiple_returns_share_one_epilogue() {
    // function f(x) { if (x) return 1; return 2; }
    let info = FunctionInfo::new(
        "f",
        ScopeInfo::function(1, 0),
        vec![
            Stmt::If {
                cond: param("x", 0),
                then_stmt: Box::new(return_stmt(Expr::num(1.0))),
                else_stmt: None,
                pos: SourcePos::NONE,
            },
            return_stmt(Expr::num(2.0)),
        ],
    );
    let masm = compile(&info).expect("no bailout");
    let stream = masm.instructions();
    assert_eq!(
        stream
            .iter()
            .filter(|i| matches!(i, Instr::Ret(_)))
            .count(),
        1
    );
    assert_eq!(
        stream
            .iter()
            .filter(|i| matches!(i, Instr::ExitFrame))
            .count(),
        1
    );
}

#[test]
fn test_too_deep_nesting_bails_out() {
    let deep = (0..600).fold(Expr::num(1.0), |e, _| Expr::Unary {
        op: UnaryOp::Void,
        expr: Box::new(e),
    });
    let info = FunctionInfo::new("f", ScopeInfo::function(0, 0), vec![expr_stmt(deep)]);
    assert_eq!(compile(&info).unwrap_err(), BailoutReason::AstTooDeep);
}

#[test]
fn test_oversized_frame_bails_out() {
    let info = FunctionInfo::new("f", ScopeInfo::function(2, 20_000), vec![]);
    assert_eq!(compile(&info).unwrap_err(), BailoutReason::FrameTooLarge);
}

#[test]
fn test_global_code_batch_declares_its_globals() {
    let mut scope = ScopeInfo::function(0, 0);
    scope.is_global = true;
    let info = FunctionInfo::new(
        "(global)",
        scope,
        vec![
            Stmt::Declaration {
                var: VarRef::global("a"),
                init: None,
                pos: SourcePos::NONE,
            },
            Stmt::Declaration {
                var: VarRef::global("b"),
                init: Some(Expr::num(3.0)),
                pos: SourcePos::NONE,
            },
        ],
    );
    let masm = compile(&info).expect("no bailout");
    let stream = masm.instructions();
    assert!(stream
        .iter()
        .any(|i| matches!(i, Instr::CallRuntime(RuntimeFn::DeclareGlobals, 2))));
    // The initialized one also stores through the IC.
    assert!(stream
        .iter()
        .any(|i| matches!(i, Instr::CallIc(IcKind::Store { name }) if name == "b")));
}

#[test]
fn test_property_loads_inline_only_inside_loops() {
    let load_foo = expr_stmt(Expr::Property {
        obj: Box::new(param("x", 0)),
        key: Box::new(Expr::Literal(Literal::Str("foo".to_string()))),
        pos: SourcePos::NONE,
    });

    let straight = FunctionInfo::new(
        "f",
        ScopeInfo::function(1, 0),
        vec![load_foo.clone()],
    );
    let masm = compile(&straight).expect("no bailout");
    assert!(!masm
        .instructions()
        .iter()
        .any(|i| matches!(i, Instr::InlinePatchMarker)));
    assert!(masm
        .instructions()
        .iter()
        .any(|i| matches!(i, Instr::CallIc(IcKind::Load { .. }))));

    let looped = FunctionInfo::new(
        "f",
        ScopeInfo::function(1, 0),
        vec![Stmt::While {
            id: TargetId(1),
            cond: param("x", 0),
            body: Box::new(load_foo),
            pos: SourcePos::NONE,
        }],
    );
    let masm = compile(&looped).expect("no bailout");
    assert!(masm
        .instructions()
        .iter()
        .any(|i| matches!(i, Instr::InlinePatchMarker)));
}

#[test]
fn test_illegal_redeclaration_compiles_to_a_throw() {
    let mut scope = ScopeInfo::function(0, 0);
    scope.illegal_redeclaration = Some(Box::new(Expr::Throw {
        value: Box::new(Expr::str("redeclaration")),
        pos: SourcePos::NONE,
    }));
    // The body must not be compiled at all.
    let info = FunctionInfo::new(
        "f",
        scope,
        vec![expr_stmt(Expr::CallIntrinsic {
            intrinsic: quill_codegen::ast::Intrinsic::MathSqrt,
            args: vec![Expr::num(2.0)],
        })],
    );
    let masm = compile(&info).expect("no bailout");
    let stream = masm.instructions();
    assert!(stream
        .iter()
        .any(|i| matches!(i, Instr::CallRuntime(RuntimeFn::Throw, 1))));
    assert!(!stream
        .iter()
        .any(|i| matches!(i, Instr::CallRuntime(RuntimeFn::MathSqrt, _))));
}

#[test]
fn test_return_from_try_finally_runs_the_finally_code() {
    // function f(x) { try { return x; } finally { x; } }
    let info = FunctionInfo::new(
        "f",
        ScopeInfo::function(1, 0),
        vec![Stmt::TryFinally {
            try_block: vec![return_stmt(param("x", 0))],
            finally_block: vec![expr_stmt(param("x", 0))],
            escaping: Vec::<EscapeTarget>::new(),
        }],
    );
    let masm = compile(&info).expect("no bailout");
    let stream = masm.instructions();
    assert!(stream
        .iter()
        .any(|i| matches!(i, Instr::PushTryHandler(_, _))));
    assert!(stream
        .iter()
        .any(|i| matches!(i, Instr::CallRuntime(RuntimeFn::ReThrow, 1))));
    // The routed return still ends in the one shared epilogue.
    assert_eq!(
        stream
            .iter()
            .filter(|i| matches!(i, Instr::Ret(_)))
            .count(),
        1
    );
}

#[test]
fn test_context_allocated_function_builds_its_context() {
    let mut scope = ScopeInfo::function(1, 0);
    scope.heap_slot_count = 5;
    scope.context_params = vec![(0, 4)];
    let info = FunctionInfo::new("f", scope, vec![]);
    let masm = compile(&info).expect("no bailout");
    let stream = masm.instructions();
    assert!(stream
        .iter()
        .any(|i| matches!(i, Instr::CallStub(Stub::FastNewContext { slots: 5 }))));
    // The escaped parameter is copied into its context slot with a
    // write barrier.
    assert!(stream
        .iter()
        .any(|i| matches!(i, Instr::RecordWrite { .. })));
}

#[test]
fn test_statements_restore_the_frame_height() {
    // A grab bag of height-neutral statements; the debug assertions in
    // the generator do the real checking.
    let body = vec![
        expr_stmt(Expr::Assignment {
            target: Box::new(param("x", 0)),
            op: Some(BinOp::Add),
            value: Box::new(Expr::num(2.0)),
            pos: SourcePos::NONE,
        }),
        Stmt::Switch {
            id: TargetId(1),
            tag: param("x", 0),
            cases: vec![quill_codegen::ast::SwitchCase {
                label: Some(Expr::num(1.0)),
                body: vec![Stmt::Break {
                    target: TargetId(1),
                }],
            }],
            pos: SourcePos::NONE,
        },
        Stmt::ForIn {
            id: TargetId(2),
            each: param("x", 0),
            enumerable: param("y", 1),
            body: Box::new(Stmt::Continue {
                target: TargetId(2),
            }),
            pos: SourcePos::NONE,
        },
        return_stmt(param("x", 0)),
    ];
    let info = FunctionInfo::new("f", ScopeInfo::function(2, 0), body);
    compile(&info).expect("no bailout");
}

#[test]
fn test_var_ref_locations_round_trip_through_declarations() {
    // Locals without initializers produce no code at all.
    let var = VarRef::local("v", 0);
    assert_eq!(var.location, VarLocation::Slot(quill_codegen::ast::Slot::Local(0)));
    let info = FunctionInfo::new(
        "f",
        ScopeInfo::function(0, 1),
        vec![Stmt::Declaration {
            var,
            init: None,
            pos: SourcePos::NONE,
        }],
    );
    let masm = compile(&info).expect("no bailout");
    // Only prologue, stack check and epilogue; no stores beyond the
    // local's undefined initialization.
    assert!(!masm
        .instructions()
        .iter()
        .any(|i| matches!(i, Instr::Sw(_, _))));
}
