//! JSON loader for whole-program IR files.
//!
//! The wire format mirrors the in-memory model: functions with slot and
//! instruction tables, a specials section naming the runtime primitives by
//! symbol, and a globals table. All cross-references are by name in the
//! file and resolved to dense ids here; any dangling reference is a load
//! error, reported once with a descriptive message.

use indexmap::IndexMap;
use miette::Diagnostic;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use thiserror::Error;

use crate::module::{
    BinOp, Block, BlockId, CmpOp, Function, FunctionId, Global, GlobalId, Inst, InstKind, Loc,
    Module, Operand, Place, Slot, SlotKind, Terminator,
};

#[derive(Debug, Error, Diagnostic)]
pub enum LoadError {
    #[error("cannot read IR file {path}: {source}")]
    #[diagnostic(code(palisade::load::io))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IR file is not valid JSON: {0}")]
    #[diagnostic(code(palisade::load::json))]
    Json(#[from] serde_json::Error),

    #[error("duplicate function definition '{name}'")]
    #[diagnostic(code(palisade::load::duplicate_function))]
    DuplicateFunction { name: String },

    #[error("{context} refers to unknown function '{name}'")]
    #[diagnostic(code(palisade::load::unknown_function))]
    UnknownFunction { name: String, context: String },

    #[error("{context} refers to unknown global '{name}'")]
    #[diagnostic(code(palisade::load::unknown_global))]
    UnknownGlobal { name: String, context: String },

    #[error("function '{function}' refers to unknown slot '{name}'")]
    #[diagnostic(code(palisade::load::unknown_slot))]
    UnknownSlot { function: String, name: String },

    #[error("function '{function}': instruction {index} is out of range")]
    #[diagnostic(code(palisade::load::bad_inst))]
    BadInstIndex { function: String, index: usize },

    #[error("function '{function}': block {index} is out of range")]
    #[diagnostic(code(palisade::load::bad_block))]
    BadBlockIndex { function: String, index: usize },

    #[error("function '{function}': instruction {index} needs exactly one of slot/global/deref")]
    #[diagnostic(code(palisade::load::bad_place))]
    BadPlace { function: String, index: usize },
}

// ---------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawModule {
    #[serde(default)]
    globals: Vec<RawGlobal>,
    #[serde(default)]
    specials: RawSpecials,
    #[serde(default)]
    functions: Vec<RawFunction>,
}

#[derive(Debug, Deserialize)]
struct RawGlobal {
    name: String,
    /// Canonical symbol name, for globals holding interned symbols.
    #[serde(default)]
    symbol: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSpecials {
    protect: Option<String>,
    protect_with_index: Option<String>,
    reprotect: Option<String>,
    unprotect: Option<String>,
    unprotect_ptr: Option<String>,
    preserve_object: Option<String>,
    nil_check: Option<String>,
    nil_global: Option<String>,
    stack_top_global: Option<String>,
    node_stack_global: Option<String>,
    #[serde(default)]
    setters: Vec<String>,
    #[serde(default)]
    error_functions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawFunction {
    name: String,
    #[serde(default)]
    params: Vec<RawSlotKind>,
    #[serde(default)]
    allocates: bool,
    #[serde(default)]
    returns_fresh: bool,
    #[serde(default)]
    protect_args: Vec<usize>,
    #[serde(default)]
    safe_args: Vec<usize>,
    #[serde(default)]
    slots: Vec<RawSlot>,
    #[serde(default)]
    insts: Vec<RawInst>,
    #[serde(default)]
    blocks: Vec<RawBlock>,
}

#[derive(Debug, Deserialize)]
struct RawSlot {
    name: String,
    kind: RawSlotKind,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RawSlotKind {
    Int,
    Sexp,
    Other,
}

impl From<RawSlotKind> for SlotKind {
    fn from(kind: RawSlotKind) -> Self {
        match kind {
            RawSlotKind::Int => SlotKind::Int,
            RawSlotKind::Sexp => SlotKind::Sexp,
            RawSlotKind::Other => SlotKind::Other,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RawOperand {
    Const(i64),
    Inst(usize),
    Addr(String),
}

#[derive(Debug, Deserialize)]
struct RawInst {
    #[serde(flatten)]
    kind: RawInstKind,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    line: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum RawInstKind {
    Load {
        #[serde(default)]
        slot: Option<String>,
        #[serde(default)]
        global: Option<String>,
        #[serde(default)]
        deref: Option<usize>,
    },
    Store {
        #[serde(default)]
        slot: Option<String>,
        #[serde(default)]
        global: Option<String>,
        #[serde(default)]
        deref: Option<usize>,
        value: RawOperand,
    },
    Call {
        callee: String,
        #[serde(default)]
        args: Vec<RawOperand>,
    },
    Add {
        lhs: RawOperand,
        rhs: RawOperand,
    },
    Cmp {
        pred: RawCmpOp,
        lhs: RawOperand,
        rhs: RawOperand,
    },
    Select {
        cond: RawOperand,
        on_true: RawOperand,
        on_false: RawOperand,
    },
    Field {
        base: RawOperand,
        index: u32,
    },
    Phi {
        incoming: Vec<(usize, RawOperand)>,
    },
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RawCmpOp {
    Eq,
    Ne,
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    #[serde(default)]
    insts: Vec<usize>,
    term: RawTerminator,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    line: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawTerminator {
    Return {
        #[serde(default)]
        value: Option<RawOperand>,
    },
    Jump {
        target: usize,
    },
    Branch {
        cond: RawOperand,
        on_true: usize,
        on_false: usize,
    },
    Unreachable,
}

// ---------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------

/// Read and validate a module from `path`.
pub fn load_module(path: impl AsRef<Path>) -> Result<Module, LoadError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_module(&text)
}

/// Parse and validate a module from JSON text.
pub fn parse_module(text: &str) -> Result<Module, LoadError> {
    let raw: RawModule = serde_json::from_str(text)?;
    Resolver::new(&raw)?.resolve(raw)
}

struct Resolver {
    functions: HashMap<String, FunctionId>,
    globals: HashMap<String, GlobalId>,
}

impl Resolver {
    fn new(raw: &RawModule) -> Result<Self, LoadError> {
        let mut functions = HashMap::new();
        for (id, f) in raw.functions.iter().enumerate() {
            if functions.insert(f.name.clone(), id).is_some() {
                return Err(LoadError::DuplicateFunction {
                    name: f.name.clone(),
                });
            }
        }
        let mut globals = HashMap::new();
        for (id, g) in raw.globals.iter().enumerate() {
            globals.insert(g.name.clone(), id);
        }
        Ok(Resolver { functions, globals })
    }

    fn function(&self, name: &str, context: &str) -> Result<FunctionId, LoadError> {
        self.functions
            .get(name)
            .copied()
            .ok_or_else(|| LoadError::UnknownFunction {
                name: name.to_string(),
                context: context.to_string(),
            })
    }

    fn global(&self, name: &str, context: &str) -> Result<GlobalId, LoadError> {
        self.globals
            .get(name)
            .copied()
            .ok_or_else(|| LoadError::UnknownGlobal {
                name: name.to_string(),
                context: context.to_string(),
            })
    }

    fn resolve(&self, raw: RawModule) -> Result<Module, LoadError> {
        let mut module = Module::default();
        let mut symbols = IndexMap::new();
        for (id, g) in raw.globals.iter().enumerate() {
            module.globals.push(Global {
                name: g.name.clone(),
            });
            if let Some(symbol) = &g.symbol {
                symbols.insert(id, symbol.clone());
            }
        }
        module.symbols = symbols;
        module.specials = self.resolve_specials(&raw.specials)?;
        for f in raw.functions {
            let lowered = self.resolve_function(f)?;
            module.functions.push(lowered);
        }
        Ok(module)
    }

    fn resolve_specials(&self, raw: &RawSpecials) -> Result<crate::module::Specials, LoadError> {
        let mut specials = crate::module::Specials::default();
        let ctx = "specials table";
        let fun = |name: &Option<String>| -> Result<Option<FunctionId>, LoadError> {
            name.as_deref().map(|n| self.function(n, ctx)).transpose()
        };
        let global = |name: &Option<String>| -> Result<Option<GlobalId>, LoadError> {
            name.as_deref().map(|n| self.global(n, ctx)).transpose()
        };
        specials.protect = fun(&raw.protect)?;
        specials.protect_with_index = fun(&raw.protect_with_index)?;
        specials.reprotect = fun(&raw.reprotect)?;
        specials.unprotect = fun(&raw.unprotect)?;
        specials.unprotect_ptr = fun(&raw.unprotect_ptr)?;
        specials.preserve_object = fun(&raw.preserve_object)?;
        specials.nil_check = fun(&raw.nil_check)?;
        specials.nil_global = global(&raw.nil_global)?;
        specials.stack_top_global = global(&raw.stack_top_global)?;
        specials.node_stack_global = global(&raw.node_stack_global)?;
        specials.setters = raw
            .setters
            .iter()
            .map(|n| self.function(n, ctx))
            .collect::<Result<BTreeSet<_>, _>>()?;
        specials.error_functions = raw
            .error_functions
            .iter()
            .map(|n| self.function(n, ctx))
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(specials)
    }

    fn resolve_function(&self, raw: RawFunction) -> Result<Function, LoadError> {
        let mut fun = Function::new(raw.name.clone());
        fun.params = raw.params.into_iter().map(SlotKind::from).collect();
        fun.allocates = raw.allocates;
        fun.returns_fresh_hint = raw.returns_fresh;
        fun.protect_args = raw.protect_args.into_iter().collect();
        fun.safe_args = raw.safe_args.into_iter().collect();

        let mut slot_ids = HashMap::new();
        for (id, s) in raw.slots.iter().enumerate() {
            slot_ids.insert(s.name.clone(), id);
            fun.slots.push(Slot {
                name: s.name.clone(),
                kind: s.kind.into(),
            });
        }

        let fname = &raw.name;
        let n_insts = raw.insts.len();
        let n_blocks = raw.blocks.len();
        let slot = |name: &str| -> Result<usize, LoadError> {
            slot_ids
                .get(name)
                .copied()
                .ok_or_else(|| LoadError::UnknownSlot {
                    function: fname.clone(),
                    name: name.to_string(),
                })
        };
        let inst_index = |index: usize, at: usize| -> Result<usize, LoadError> {
            if index < n_insts {
                Ok(index)
            } else {
                Err(LoadError::BadInstIndex {
                    function: fname.clone(),
                    index: at,
                })
            }
        };
        let operand = |raw: &RawOperand, at: usize| -> Result<Operand, LoadError> {
            Ok(match raw {
                RawOperand::Const(value) => Operand::Const(*value),
                RawOperand::Inst(index) => Operand::Inst(inst_index(*index, at)?),
                RawOperand::Addr(name) => Operand::SlotAddr(slot(name)?),
            })
        };
        let place = |slot_name: &Option<String>,
                     global_name: &Option<String>,
                     deref: &Option<usize>,
                     at: usize|
         -> Result<Place, LoadError> {
            match (slot_name, global_name, deref) {
                (Some(name), None, None) => Ok(Place::Slot(slot(name)?)),
                (None, Some(name), None) => Ok(Place::Global(
                    self.global(name, &format!("function '{fname}'"))?,
                )),
                (None, None, Some(index)) => Ok(Place::Deref(inst_index(*index, at)?)),
                _ => Err(LoadError::BadPlace {
                    function: fname.clone(),
                    index: at,
                }),
            }
        };
        let block_index = |index: usize| -> Result<BlockId, LoadError> {
            if index < n_blocks {
                Ok(index)
            } else {
                Err(LoadError::BadBlockIndex {
                    function: fname.clone(),
                    index,
                })
            }
        };

        for (at, inst) in raw.insts.iter().enumerate() {
            let kind = match &inst.kind {
                RawInstKind::Load {
                    slot: s,
                    global,
                    deref,
                } => InstKind::Load {
                    src: place(s, global, deref, at)?,
                },
                RawInstKind::Store {
                    slot: s,
                    global,
                    deref,
                    value,
                } => InstKind::Store {
                    dst: place(s, global, deref, at)?,
                    value: operand(value, at)?,
                },
                RawInstKind::Call { callee, args } => InstKind::Call {
                    callee: self.function(callee, &format!("call in function '{fname}'"))?,
                    args: args
                        .iter()
                        .map(|a| operand(a, at))
                        .collect::<Result<_, _>>()?,
                },
                RawInstKind::Add { lhs, rhs } => InstKind::Bin {
                    op: BinOp::Add,
                    lhs: operand(lhs, at)?,
                    rhs: operand(rhs, at)?,
                },
                RawInstKind::Cmp { pred, lhs, rhs } => InstKind::Cmp {
                    op: match pred {
                        RawCmpOp::Eq => CmpOp::Eq,
                        RawCmpOp::Ne => CmpOp::Ne,
                    },
                    lhs: operand(lhs, at)?,
                    rhs: operand(rhs, at)?,
                },
                RawInstKind::Select {
                    cond,
                    on_true,
                    on_false,
                } => InstKind::Select {
                    cond: operand(cond, at)?,
                    on_true: operand(on_true, at)?,
                    on_false: operand(on_false, at)?,
                },
                RawInstKind::Field { base, index } => InstKind::Field {
                    base: operand(base, at)?,
                    index: *index,
                },
                RawInstKind::Phi { incoming } => InstKind::Phi {
                    incoming: incoming
                        .iter()
                        .map(|(block, op)| Ok((block_index(*block)?, operand(op, at)?)))
                        .collect::<Result<_, LoadError>>()?,
                },
            };
            fun.insts.push(Inst {
                kind,
                loc: Loc {
                    file: inst.file.clone().unwrap_or_default(),
                    line: inst.line.unwrap_or(0),
                },
            });
        }

        for (at, block) in raw.blocks.iter().enumerate() {
            let insts = block
                .insts
                .iter()
                .map(|&i| inst_index(i, i))
                .collect::<Result<Vec<_>, _>>()?;
            let term = match &block.term {
                RawTerminator::Return { value } => Terminator::Return {
                    value: value.as_ref().map(|v| operand(v, at)).transpose()?,
                },
                RawTerminator::Jump { target } => Terminator::Jump {
                    target: block_index(*target)?,
                },
                RawTerminator::Branch {
                    cond,
                    on_true,
                    on_false,
                } => Terminator::Branch {
                    cond: operand(cond, at)?,
                    on_true: block_index(*on_true)?,
                    on_false: block_index(*on_false)?,
                },
                RawTerminator::Unreachable => Terminator::Unreachable,
            };
            let term_loc = Loc {
                file: block.file.clone().unwrap_or_default(),
                line: block.line.unwrap_or(0),
            };
            fun.blocks.push(Block {
                insts,
                term,
                term_loc,
            });
        }

        fun.seal();
        Ok(fun)
    }
}
