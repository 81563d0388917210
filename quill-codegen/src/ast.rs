//! Function-scoped syntax tree consumed from the front end
//!
//! The parser and scope resolver hand the backend one `FunctionInfo` per
//! function: the body statements plus the scope facts the generator needs
//! (slot assignments, eval taint, arguments-object mode, illegal
//! redeclarations). Variables arrive fully resolved; the backend never
//! looks names up itself except through the dynamic-lookup slot kind.
//!
//! Dispatch over these enums is by `match`; there is no visitor object.

use quill_common::{Smi, SourcePos};

/// Identifies a breakable construct so break/continue statements can name
/// their target without back pointers into the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableMode {
    Var,
    Const,
}

/// Resolved storage for a variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Parameter(usize),
    Local(usize),
    /// A context slot `index` in the function `depth` hops up the
    /// context chain (0 = the current function's context).
    Context { depth: usize, index: usize },
    /// Unresolvable at compile time; looked up by name at runtime,
    /// possibly with an inlined fast case.
    Lookup { fast: Option<DynamicFastCase> },
}

/// Fast cases for dynamic lookups: when every intervening scope is known
/// to have no context extension, the lookup collapses to a direct load
/// after `checks` extension-slot checks.
#[derive(Debug, Clone, PartialEq)]
pub enum DynamicFastCase {
    /// The name, if not shadowed by an extension, is a global property.
    Global { checks: usize },
    /// The name, if not shadowed, lives in a known slot.
    Local { checks: usize, slot: Box<Slot> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum VarLocation {
    Slot(Slot),
    /// A named property of the global object.
    Global,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarRef {
    pub name: String,
    pub mode: VariableMode,
    pub location: VarLocation,
    /// True for the `arguments` binding; loads may need the lazy
    /// materialization check.
    pub is_arguments: bool,
}

impl VarRef {
    pub fn new(name: impl Into<String>, location: VarLocation) -> VarRef {
        VarRef {
            name: name.into(),
            mode: VariableMode::Var,
            location,
            is_arguments: false,
        }
    }

    pub fn parameter(name: impl Into<String>, index: usize) -> VarRef {
        VarRef::new(name, VarLocation::Slot(Slot::Parameter(index)))
    }

    pub fn local(name: impl Into<String>, index: usize) -> VarRef {
        VarRef::new(name, VarLocation::Slot(Slot::Local(index)))
    }

    pub fn global(name: impl Into<String>) -> VarRef {
        VarRef::new(name, VarLocation::Global)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

impl Literal {
    /// The smi this literal denotes, if it is an integral number in range.
    pub fn as_smi(&self) -> Option<Smi> {
        match self {
            Literal::Number(n) if n.fract() == 0.0 && *n >= i32::MIN as f64 && *n <= i32::MAX as f64 =>
            {
                // -0.0 is a heap number, not a smi
                if *n == 0.0 && n.is_sign_negative() {
                    None
                } else {
                    Smi::new(*n as i32)
                }
            }
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Literal::Null)
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Literal::Undefined)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Or,
    And,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitOr,
    BitAnd,
    BitXor,
    Shl,
    Sar,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    EqStrict,
    Ne,
    NeStrict,
    Lt,
    Gt,
    Le,
    Ge,
    InstanceOf,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Delete,
    TypeOf,
    Void,
    /// Unary plus: ToNumber.
    Plus,
    Neg,
    BitNot,
}

/// Runtime intrinsics callable as `%Name(...)`. A handful have inlined
/// fast paths; the rest map straight to their runtime function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intrinsic {
    IsSmi,
    IsNonNegativeSmi,
    IsArray,
    ArgumentsLength,
    MathPow,
    MathSqrt,
    ObjectEquals,
    Runtime(quill_masm::RuntimeFn),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    /// Key and value are both literals; already part of the boilerplate.
    Constant,
    Computed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjProperty {
    pub key: Literal,
    pub value: Expr,
    pub kind: PropertyKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    This,
    ThisFunction,
    Var(VarRef),
    Property {
        obj: Box<Expr>,
        key: Box<Expr>,
        pos: SourcePos,
    },
    Assignment {
        target: Box<Expr>,
        /// Some(op) for compound assignment `target op= value`.
        op: Option<BinOp>,
        value: Box<Expr>,
        pos: SourcePos,
    },
    Conditional {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        pos: SourcePos,
    },
    CallNew {
        func: Box<Expr>,
        args: Vec<Expr>,
        pos: SourcePos,
    },
    CallIntrinsic {
        intrinsic: Intrinsic,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Count {
        is_increment: bool,
        is_prefix: bool,
        target: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    FunctionLit {
        /// Shared-function-info handle the instantiation references.
        info_id: u32,
        func: Box<FunctionInfo>,
    },
    ObjectLiteral {
        boilerplate_id: u32,
        literal_index: usize,
        properties: Vec<ObjProperty>,
        /// Shallow literals clone the boilerplate without recursing.
        is_shallow: bool,
    },
    ArrayLiteral {
        boilerplate_id: u32,
        literal_index: usize,
        values: Vec<Expr>,
        is_shallow: bool,
    },
    Throw {
        value: Box<Expr>,
        pos: SourcePos,
    },
}

impl Expr {
    pub fn num(n: f64) -> Expr {
        Expr::Literal(Literal::Number(n))
    }

    pub fn str(s: impl Into<String>) -> Expr {
        Expr::Literal(Literal::Str(s.into()))
    }

    pub fn var(v: VarRef) -> Expr {
        Expr::Var(v)
    }

    /// The smi constant this expression evaluates to, if it is one.
    pub fn as_smi_literal(&self) -> Option<Smi> {
        match self {
            Expr::Literal(lit) => lit.as_smi(),
            _ => None,
        }
    }

    /// True for expressions whose value cannot be observed by a getter
    /// or valueOf during evaluation of a sibling.
    pub fn is_trivial(&self) -> bool {
        matches!(self, Expr::Literal(_) | Expr::This | Expr::ThisFunction)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeKind {
    Break,
    Continue,
}

/// A break/continue target that control flow can escape to out of a try
/// block; the front end lists these per try node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscapeTarget {
    pub kind: EscapeKind,
    pub id: TargetId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    /// `None` marks the default clause.
    pub label: Option<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Block {
        id: TargetId,
        stmts: Vec<Stmt>,
    },
    Declaration {
        var: VarRef,
        init: Option<Expr>,
        pos: SourcePos,
    },
    Expression {
        expr: Expr,
        pos: SourcePos,
    },
    Empty,
    If {
        cond: Expr,
        then_stmt: Box<Stmt>,
        else_stmt: Option<Box<Stmt>>,
        pos: SourcePos,
    },
    Continue {
        target: TargetId,
    },
    Break {
        target: TargetId,
    },
    Return {
        value: Expr,
        pos: SourcePos,
    },
    While {
        id: TargetId,
        cond: Expr,
        body: Box<Stmt>,
        pos: SourcePos,
    },
    DoWhile {
        id: TargetId,
        body: Box<Stmt>,
        cond: Expr,
        condition_pos: SourcePos,
    },
    For {
        id: TargetId,
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        next: Option<Box<Stmt>>,
        body: Box<Stmt>,
        /// Stack slot of a loop variable known to stay smi, if the
        /// front-end analysis proved it.
        loop_var_smi: Option<Slot>,
        pos: SourcePos,
    },
    ForIn {
        id: TargetId,
        /// An assignable expression receiving each key.
        each: Expr,
        enumerable: Expr,
        body: Box<Stmt>,
        pos: SourcePos,
    },
    TryCatch {
        try_block: Vec<Stmt>,
        /// The catch binding, lowered to a stack slot by the front end.
        catch_var: VarRef,
        catch_block: Vec<Stmt>,
        escaping: Vec<EscapeTarget>,
    },
    TryFinally {
        try_block: Vec<Stmt>,
        finally_block: Vec<Stmt>,
        escaping: Vec<EscapeTarget>,
    },
    Switch {
        id: TargetId,
        tag: Expr,
        cases: Vec<SwitchCase>,
        pos: SourcePos,
    },
}

/// How the `arguments` object is materialized for this function.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgumentsMode {
    /// Built in the prologue.
    Eager { slot: Slot },
    /// The slot holds the hole until the first load materializes it.
    Lazy { slot: Slot },
}

/// Scope facts resolved by the front end.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeInfo {
    pub param_count: usize,
    /// Stack-allocated locals, not counting parameters.
    pub local_count: usize,
    /// Context slots including the fixed header slots; nonzero means the
    /// function allocates its own context in the prologue.
    pub heap_slot_count: usize,
    /// Parameters that escaped into the context: (parameter index,
    /// context slot index).
    pub context_params: Vec<(usize, usize)>,
    pub is_global: bool,
    pub arguments: Option<ArgumentsMode>,
    /// When the scope holds conflicting declarations, a synthesized
    /// throw expression compiled in place of the body.
    pub illegal_redeclaration: Option<Box<Expr>>,
}

impl ScopeInfo {
    pub fn function(param_count: usize, local_count: usize) -> ScopeInfo {
        ScopeInfo {
            param_count,
            local_count,
            heap_slot_count: 0,
            context_params: Vec::new(),
            is_global: false,
            arguments: None,
            illegal_redeclaration: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInfo {
    pub name: String,
    pub scope: ScopeInfo,
    pub body: Vec<Stmt>,
    /// Loop nesting of the call sites this code is compiled for; seeds
    /// the generator's inlining heuristics.
    pub loop_nesting: usize,
    pub function_pos: SourcePos,
}

impl FunctionInfo {
    pub fn new(name: impl Into<String>, scope: ScopeInfo, body: Vec<Stmt>) -> FunctionInfo {
        FunctionInfo {
            name: name.into(),
            scope,
            body,
            loop_nesting: 0,
            function_pos: SourcePos::NONE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_smi_literals() {
        assert_eq!(Expr::num(3.0).as_smi_literal(), Smi::new(3));
        assert_eq!(Expr::num(-1.0).as_smi_literal(), Smi::new(-1));
        assert_eq!(Expr::num(3.5).as_smi_literal(), None);
        assert_eq!(Expr::num(-0.0).as_smi_literal(), None);
        assert_eq!(Expr::num(3e10).as_smi_literal(), None);
        // largest smi is representable, one past it is not
        assert_eq!(
            Expr::num(((1i64 << 30) - 1) as f64).as_smi_literal(),
            Smi::new((1 << 30) - 1)
        );
        assert_eq!(Expr::num((1i64 << 30) as f64).as_smi_literal(), None);
    }

    #[test]
    fn test_trivial_expressions() {
        assert!(Expr::This.is_trivial());
        assert!(Expr::num(1.0).is_trivial());
        assert!(!Expr::var(VarRef::global("x")).is_trivial());
    }
}
