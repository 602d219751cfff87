//! Intermediate representation of a native-extension module
//!
//! The checker consumes one module per run: globals, function declarations
//! with whole-module facts attached, and function bodies as control-flow
//! graphs of basic blocks. Operands are small expression trees; every
//! source-level shape the analyses recognize (the PROTECT forms, counter
//! arithmetic, guard comparisons) is a direct tree pattern.
//!
//! Producing this IR from compiled C is a separate concern; modules arrive
//! serialized and are read back by [`loader`].

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod loader;
pub mod visit;

/// Local variable (stack slot) within one function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VarId(pub u32);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Basic block identifier, an index into [`FunBody::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Function identifier, an index into [`Module::functions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FunId(pub u32);

impl fmt::Display for FunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn{}", self.0)
    }
}

/// Global variable identifier, an index into [`Module::globals`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalId(pub u32);

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Coarse type tag. The analyses only ever need to distinguish
/// garbage-collected pointers from plain integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarType {
    Sexp,
    Int,
    Other,
}

/// A local variable slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Local {
    pub name: String,
    pub ty: VarType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
}

/// A call with a statically known callee. Indirect calls are lowered to
/// [`Exp::Unknown`] before the module reaches the checker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallExp {
    pub callee: FunId,
    pub args: Vec<Exp>,
}

/// Operand expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Exp {
    Const(i64),
    Str(String),
    /// Value of a global (a load of it).
    Global(GlobalId),
    /// Value of a local (a load of it).
    Local(VarId),
    /// Address of a local; its presence disqualifies the local from
    /// guard and freshness tracking.
    AddrLocal(VarId),
    /// Function parameter by position.
    Arg(u32),
    Call(CallExp),
    /// C assignment-expression `(v = e)`; evaluates `e`, stores it to `v`,
    /// and yields it.
    Assign(VarId, Box<Exp>),
    Select {
        cond: Box<Exp>,
        then_val: Box<Exp>,
        else_val: Box<Exp>,
    },
    Cmp {
        op: CmpOp,
        lhs: Box<Exp>,
        rhs: Box<Exp>,
    },
    Add {
        lhs: Box<Exp>,
        rhs: Box<Exp>,
    },
    /// Join of values flowing in from predecessors.
    Phi(Vec<Exp>),
    /// Address of a structure member derived from `base`.
    AddrField {
        base: Box<Exp>,
        index: u32,
    },
    /// Anything the producer could not express; the analyses treat it as
    /// an opaque value.
    Unknown,
}

impl Exp {
    pub fn call(callee: FunId, args: Vec<Exp>) -> Exp {
        Exp::Call(CallExp { callee, args })
    }

    pub fn assign(var: VarId, value: Exp) -> Exp {
        Exp::Assign(var, Box::new(value))
    }

    pub fn cmp(op: CmpOp, lhs: Exp, rhs: Exp) -> Exp {
        Exp::Cmp {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn add(lhs: Exp, rhs: Exp) -> Exp {
        Exp::Add {
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn select(cond: Exp, then_val: Exp, else_val: Exp) -> Exp {
        Exp::Select {
            cond: Box::new(cond),
            then_val: Box::new(then_val),
            else_val: Box::new(else_val),
        }
    }

    /// The call expression if this is directly a call.
    pub fn as_call(&self) -> Option<&CallExp> {
        match self {
            Exp::Call(call) => Some(call),
            _ => None,
        }
    }

    /// The local read if this is directly a load of one.
    pub fn as_local(&self) -> Option<VarId> {
        match self {
            Exp::Local(var) => Some(*var),
            _ => None,
        }
    }
}

/// Straight-line instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InstKind {
    /// `v = e`
    Store { var: VarId, value: Exp },
    /// `@g = e`
    StoreGlobal { global: GlobalId, value: Exp },
    /// Store through a derived location, `*(&base.index) = e`.
    StoreField { base: Exp, index: u32, value: Exp },
    /// Bare expression statement, typically a call.
    Eval(Exp),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inst {
    pub kind: InstKind,
    /// Source line, when debug info was available.
    pub line: Option<u32>,
}

impl Inst {
    pub fn new(kind: InstKind) -> Inst {
        Inst { kind, line: None }
    }

    pub fn at(kind: InstKind, line: u32) -> Inst {
        Inst {
            kind,
            line: Some(line),
        }
    }
}

/// Block terminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Term {
    Jump(BlockId),
    Branch {
        cond: Exp,
        then_bb: BlockId,
        else_bb: BlockId,
    },
    Ret(Option<Exp>),
    Unreachable,
}

impl Term {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Term::Jump(target) => vec![*target],
            Term::Branch {
                then_bb, else_bb, ..
            } => vec![*then_bb, *else_bb],
            Term::Ret(_) | Term::Unreachable => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub insts: Vec<Inst>,
    pub term: Term,
    /// Source line of the terminator.
    pub term_line: Option<u32>,
}

/// Whole-module facts attached to a function. For externals these come
/// from offline classification of the runtime; for defined functions the
/// oracle layer widens them through the call graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FunFacts {
    /// May trigger garbage collection (directly or transitively).
    pub allocating: bool,
    /// May return a freshly allocated, unprotected object.
    pub possible_allocator: bool,
    /// Returns a fresh object from the caller's perspective.
    pub fresh_returner: bool,
    /// Never returns (error/longjmp function).
    pub no_return: bool,
    /// Protects all of its arguments for the duration of the call.
    pub callee_protect: bool,
    /// Does not allocate before consuming any argument.
    pub callee_safe: bool,
    /// Parameter positions the function consumes before any allocation.
    pub callee_safe_params: Vec<u32>,
    /// Setter-shaped: stores later arguments into the first one.
    pub setter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunBody {
    pub locals: Vec<Local>,
    pub blocks: Vec<Block>,
    pub entry: BlockId,
}

impl FunBody {
    pub fn new() -> FunBody {
        FunBody {
            locals: Vec::new(),
            blocks: vec![Block {
                insts: Vec::new(),
                term: Term::Ret(None),
                term_line: None,
            }],
            entry: BlockId(0),
        }
    }

    pub fn add_local(&mut self, name: impl Into<String>, ty: VarType) -> VarId {
        let id = VarId(self.locals.len() as u32);
        self.locals.push(Local {
            name: name.into(),
            ty,
        });
        id
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            insts: Vec::new(),
            term: Term::Ret(None),
            term_line: None,
        });
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    pub fn push(&mut self, bb: BlockId, kind: InstKind) {
        self.block_mut(bb).insts.push(Inst::new(kind));
    }

    pub fn push_at(&mut self, bb: BlockId, kind: InstKind, line: u32) {
        self.block_mut(bb).insts.push(Inst::at(kind, line));
    }

    pub fn set_term(&mut self, bb: BlockId, term: Term) {
        self.block_mut(bb).term = term;
    }

    pub fn local(&self, id: VarId) -> &Local {
        &self.locals[id.0 as usize]
    }

    pub fn var_name(&self, id: VarId) -> &str {
        &self.locals[id.0 as usize].name
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }
}

impl Default for FunBody {
    fn default() -> Self {
        FunBody::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    /// Parameter types, used to skip non-SEXP argument positions.
    #[serde(default)]
    pub params: Vec<VarType>,
    #[serde(default)]
    pub facts: FunFacts,
    /// Source file of the definition, for diagnostics.
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub body: Option<FunBody>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Global {
    pub name: String,
    /// Interned symbol name when this global is a symbol binding
    /// (e.g. a cached result of installing a symbol).
    #[serde(default)]
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Module {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub globals: Vec<Global>,
    #[serde(default)]
    pub functions: Vec<Function>,
}

impl Module {
    pub fn function(&self, id: FunId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id.0 as usize]
    }

    pub fn fun_name(&self, id: FunId) -> &str {
        &self.functions[id.0 as usize].name
    }

    pub fn find_function(&self, name: &str) -> Option<FunId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FunId(i as u32))
    }

    pub fn find_global(&self, name: &str) -> Option<GlobalId> {
        self.globals
            .iter()
            .position(|g| g.name == name)
            .map(|i| GlobalId(i as u32))
    }

    pub fn fun_ids(&self) -> impl Iterator<Item = FunId> {
        (0..self.functions.len() as u32).map(FunId)
    }

    /// Declare an external function (no body).
    pub fn declare(&mut self, name: impl Into<String>, facts: FunFacts) -> FunId {
        let id = FunId(self.functions.len() as u32);
        self.functions.push(Function {
            name: name.into(),
            params: Vec::new(),
            facts,
            file: None,
            body: None,
        });
        id
    }

    /// Add a defined function.
    pub fn define(&mut self, name: impl Into<String>, body: FunBody) -> FunId {
        let id = FunId(self.functions.len() as u32);
        self.functions.push(Function {
            name: name.into(),
            params: Vec::new(),
            facts: FunFacts::default(),
            file: None,
            body: Some(body),
        });
        id
    }

    pub fn add_global(&mut self, name: impl Into<String>) -> GlobalId {
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(Global {
            name: name.into(),
            symbol: None,
        });
        id
    }

    pub fn add_symbol_global(
        &mut self,
        name: impl Into<String>,
        symbol: impl Into<String>,
    ) -> GlobalId {
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(Global {
            name: name.into(),
            symbol: Some(symbol.into()),
        });
        id
    }
}
