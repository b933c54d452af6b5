use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::fmt;

/// A unique identifier for a function within a module.
pub type FunctionId = usize;
/// A unique identifier for a basic block within a function.
pub type BlockId = usize;
/// A unique identifier for a local storage slot within a function.
pub type SlotId = usize;
/// A unique identifier for an instruction within a function.
///
/// An instruction that produces a result is referenced by its own id, so
/// `InstId` doubles as a value identifier.
pub type InstId = usize;
/// A unique identifier for a module global.
pub type GlobalId = usize;

/// Storage class of a local slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Machine integer.
    Int,
    /// Heap pointer managed by the collector.
    Sexp,
    /// Anything else (floats, aggregates, raw pointers).
    Other,
}

/// A local storage slot (stack cell addressed by load/store).
#[derive(Debug, Clone)]
pub struct Slot {
    pub name: String,
    pub kind: SlotKind,
}

/// A module-level global variable.
#[derive(Debug, Clone)]
pub struct Global {
    pub name: String,
}

/// A memory location addressed by a load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    /// A local slot.
    Slot(SlotId),
    /// A module global.
    Global(GlobalId),
    /// A location computed by an instruction (for example a field
    /// projection of a loaded pointer).
    Deref(InstId),
}

/// An instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// An integer constant.
    Const(i64),
    /// The result of another instruction.
    Inst(InstId),
    /// The address of a local slot. Taking a slot's address disqualifies
    /// it from every guard/counter/fresh-variable role.
    SlotAddr(SlotId),
}

/// Binary arithmetic supported by the analyses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
}

/// Equality comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
}

/// Instruction payload.
#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    /// Read a location; the result is this instruction's value.
    Load { src: Place },
    /// Write `value` into `dst`.
    Store { dst: Place, value: Operand },
    /// Call a module function.
    Call { callee: FunctionId, args: Vec<Operand> },
    /// Binary arithmetic.
    Bin { op: BinOp, lhs: Operand, rhs: Operand },
    /// Integer/pointer comparison producing a truth value.
    Cmp { op: CmpOp, lhs: Operand, rhs: Operand },
    /// `cond ? on_true : on_false`.
    Select {
        cond: Operand,
        on_true: Operand,
        on_false: Operand,
    },
    /// In-bounds projection of a pointer value (field/element address).
    Field { base: Operand, index: u32 },
    /// SSA join of per-predecessor values.
    Phi { incoming: Vec<(BlockId, Operand)> },
}

/// Source location attached to an instruction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Loc {
    pub file: String,
    pub line: u32,
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.file.is_empty() {
            write!(f, "<unknown>:{}", self.line)
        } else {
            write!(f, "{}:{}", self.file, self.line)
        }
    }
}

/// One instruction with its source location.
#[derive(Debug, Clone)]
pub struct Inst {
    pub kind: InstKind,
    pub loc: Loc,
}

/// Basic-block terminator.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    /// Return from the function, optionally with a value.
    Return { value: Option<Operand> },
    /// Unconditional jump.
    Jump { target: BlockId },
    /// Two-way branch on a truth value (nonzero takes `on_true`).
    Branch {
        cond: Operand,
        on_true: BlockId,
        on_false: BlockId,
    },
    /// Control never leaves this block (a no-return call precedes it).
    Unreachable,
}

impl Terminator {
    /// CFG successors in branch order.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Return { .. } | Terminator::Unreachable => Vec::new(),
            Terminator::Jump { target } => vec![*target],
            Terminator::Branch {
                on_true, on_false, ..
            } => vec![*on_true, *on_false],
        }
    }
}

/// A basic block: straight-line instructions plus one terminator.
#[derive(Debug, Clone)]
pub struct Block {
    pub insts: Vec<InstId>,
    pub term: Terminator,
    /// Source location of the terminator, for findings reported at block
    /// exits.
    pub term_loc: Loc,
}

/// A function definition or declaration.
///
/// Instructions live in one arena per function (`insts`); blocks reference
/// them by id. A declaration has no blocks and is described only by its
/// attributes.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    /// Parameter storage classes, used to skip non-pointer arguments when
    /// collecting variables passed to a call.
    pub params: Vec<SlotKind>,
    pub slots: Vec<Slot>,
    pub blocks: Vec<Block>,
    pub insts: Vec<Inst>,
    /// The function calls the heap allocator directly.
    pub allocates: bool,
    /// Declared hint that the function may hand back a freshly allocated
    /// object (used for declarations, where no body can be inspected).
    pub returns_fresh_hint: bool,
    /// Argument positions the callee protects across its own allocations.
    pub protect_args: BTreeSet<usize>,
    /// Argument positions the callee never destroys, even when it
    /// allocates internally.
    pub safe_args: BTreeSet<usize>,
    /// Uses of each instruction result by other instructions, in program
    /// order. Computed by [`Function::seal`].
    uses: Vec<Vec<InstId>>,
    /// Instructions touching each slot (loads, stores, address-taking
    /// operands). Computed by [`Function::seal`].
    slot_uses: Vec<Vec<InstId>>,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Function {
            name: name.into(),
            params: Vec::new(),
            slots: Vec::new(),
            blocks: Vec::new(),
            insts: Vec::new(),
            allocates: false,
            returns_fresh_hint: false,
            protect_args: BTreeSet::new(),
            safe_args: BTreeSet::new(),
            uses: Vec::new(),
            slot_uses: Vec::new(),
        }
    }

    /// A declaration carries no body.
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id]
    }

    pub fn entry(&self) -> BlockId {
        0
    }

    /// Recompute the use maps. Must be called after the instruction list
    /// changes; the loader and the builder both do this.
    pub fn seal(&mut self) {
        let mut uses = vec![Vec::new(); self.insts.len()];
        let mut slot_uses = vec![Vec::new(); self.slots.len()];
        fn on_operand(
            op: &Operand,
            id: InstId,
            uses: &mut [Vec<InstId>],
            slot_uses: &mut [Vec<InstId>],
        ) {
            match *op {
                Operand::Inst(src) => uses[src].push(id),
                Operand::SlotAddr(slot) => slot_uses[slot].push(id),
                Operand::Const(_) => {}
            }
        }
        for (id, inst) in self.insts.iter().enumerate() {
            match &inst.kind {
                InstKind::Load { src } => {
                    if let Place::Slot(slot) = src {
                        slot_uses[*slot].push(id);
                    }
                    if let Place::Deref(base) = src {
                        uses[*base].push(id);
                    }
                }
                InstKind::Store { dst, value } => {
                    match dst {
                        Place::Slot(slot) => slot_uses[*slot].push(id),
                        Place::Deref(base) => uses[*base].push(id),
                        Place::Global(_) => {}
                    }
                    on_operand(value, id, &mut uses, &mut slot_uses);
                }
                InstKind::Call { args, .. } => {
                    for op in args {
                        on_operand(op, id, &mut uses, &mut slot_uses);
                    }
                }
                InstKind::Bin { lhs, rhs, .. } | InstKind::Cmp { lhs, rhs, .. } => {
                    on_operand(lhs, id, &mut uses, &mut slot_uses);
                    on_operand(rhs, id, &mut uses, &mut slot_uses);
                }
                InstKind::Select {
                    cond,
                    on_true,
                    on_false,
                } => {
                    on_operand(cond, id, &mut uses, &mut slot_uses);
                    on_operand(on_true, id, &mut uses, &mut slot_uses);
                    on_operand(on_false, id, &mut uses, &mut slot_uses);
                }
                InstKind::Field { base, .. } => on_operand(base, id, &mut uses, &mut slot_uses),
                InstKind::Phi { incoming } => {
                    for (_, op) in incoming {
                        on_operand(op, id, &mut uses, &mut slot_uses);
                    }
                }
            }
        }
        self.uses = uses;
        self.slot_uses = slot_uses;
    }

    /// Instructions consuming the result of `id`.
    pub fn uses(&self, id: InstId) -> &[InstId] {
        &self.uses[id]
    }

    pub fn has_one_use(&self, id: InstId) -> bool {
        self.uses[id].len() == 1
    }

    /// The single consumer of `id`, if there is exactly one.
    pub fn single_use(&self, id: InstId) -> Option<InstId> {
        match self.uses[id].as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    /// Instructions that load, store or take the address of `slot`.
    pub fn slot_uses(&self, slot: SlotId) -> &[InstId] {
        &self.slot_uses[slot]
    }

    /// The slot read by `id` when it is a direct slot load.
    pub fn load_of_slot(&self, id: InstId) -> Option<SlotId> {
        match self.insts[id].kind {
            InstKind::Load {
                src: Place::Slot(slot),
            } => Some(slot),
            _ => None,
        }
    }

    /// The global read by `id` when it is a direct global load.
    pub fn load_of_global(&self, id: InstId) -> Option<GlobalId> {
        match self.insts[id].kind {
            InstKind::Load {
                src: Place::Global(global),
            } => Some(global),
            _ => None,
        }
    }

    /// The callee and arguments when `id` is a call.
    pub fn as_call(&self, id: InstId) -> Option<(FunctionId, &[Operand])> {
        match &self.insts[id].kind {
            InstKind::Call { callee, args } => Some((*callee, args)),
            _ => None,
        }
    }

    /// Resolve an operand to the instruction defining it.
    pub fn operand_inst(&self, op: Operand) -> Option<InstId> {
        match op {
            Operand::Inst(id) => Some(id),
            _ => None,
        }
    }

    /// Constant value of an operand, if it is a constant.
    pub fn const_of(&self, op: Operand) -> Option<i64> {
        match op {
            Operand::Const(value) => Some(value),
            _ => None,
        }
    }

    /// How instruction `id` touches `slot`, if at all.
    pub fn slot_access(&self, id: InstId, slot: SlotId) -> Option<SlotAccess> {
        match &self.insts[id].kind {
            InstKind::Load {
                src: Place::Slot(s),
            } if *s == slot => return Some(SlotAccess::Load),
            InstKind::Store {
                dst: Place::Slot(s),
                value,
            } if *s == slot => return Some(SlotAccess::Store(*value)),
            _ => {}
        }
        let mut escaped = false;
        self.for_each_operand(id, |op| {
            if matches!(op, Operand::SlotAddr(s) if s == slot) {
                escaped = true;
            }
        });
        escaped.then_some(SlotAccess::Escape)
    }

    fn for_each_operand(&self, id: InstId, mut f: impl FnMut(Operand)) {
        match &self.insts[id].kind {
            InstKind::Load { .. } => {}
            InstKind::Store { value, .. } => f(*value),
            InstKind::Call { args, .. } => args.iter().copied().for_each(&mut f),
            InstKind::Bin { lhs, rhs, .. } | InstKind::Cmp { lhs, rhs, .. } => {
                f(*lhs);
                f(*rhs);
            }
            InstKind::Select {
                cond,
                on_true,
                on_false,
            } => {
                f(*cond);
                f(*on_true);
                f(*on_false);
            }
            InstKind::Field { base, .. } => f(*base),
            InstKind::Phi { incoming } => incoming.iter().for_each(|(_, op)| f(*op)),
        }
    }

    /// Display name for a slot; falls back to a positional name for slots
    /// the front end left unnamed.
    pub fn slot_name(&self, slot: SlotId) -> String {
        let name = &self.slots[slot].name;
        if name.is_empty() {
            format!("<slot {slot}>")
        } else {
            name.clone()
        }
    }
}

/// How one instruction touches a particular slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAccess {
    /// Direct load of the slot.
    Load,
    /// Direct store into the slot, carrying the stored value.
    Store(Operand),
    /// The slot's address escapes into the instruction.
    Escape,
}

/// Roles of the runtime primitives and globals the checkers recognize.
///
/// Every field is optional: a module that never references a primitive
/// simply leaves the corresponding checks dormant.
#[derive(Debug, Clone, Default)]
pub struct Specials {
    pub protect: Option<FunctionId>,
    pub protect_with_index: Option<FunctionId>,
    pub reprotect: Option<FunctionId>,
    pub unprotect: Option<FunctionId>,
    pub unprotect_ptr: Option<FunctionId>,
    pub preserve_object: Option<FunctionId>,
    /// Predicate returning nonzero when its argument is the nil object.
    pub nil_check: Option<FunctionId>,
    /// The distinguished nil constant.
    pub nil_global: Option<GlobalId>,
    /// The runtime protection-stack top pointer.
    pub stack_top_global: Option<GlobalId>,
    /// The interpreter operand stack; storing into its cells protects.
    pub node_stack_global: Option<GlobalId>,
    /// Container-mutating primitives whose first argument adopts the rest.
    pub setters: BTreeSet<FunctionId>,
    /// Known no-return error/terminate functions (seed set; the error-path
    /// analysis closes over it).
    pub error_functions: BTreeSet<FunctionId>,
}

impl Specials {
    /// Whether `f` pushes one entry onto the protection stack.
    pub fn is_protecting(&self, f: FunctionId) -> bool {
        self.protect == Some(f) || self.protect_with_index == Some(f)
    }

    /// Whether `f` is any of the stack-manipulating primitives, which are
    /// imbalanced by design.
    pub fn is_protection_primitive(&self, f: FunctionId) -> bool {
        self.is_protecting(f)
            || self.reprotect == Some(f)
            || self.unprotect == Some(f)
            || self.unprotect_ptr == Some(f)
    }

    pub fn is_setter(&self, f: FunctionId) -> bool {
        self.setters.contains(&f)
    }
}

/// A whole program: functions, globals and the module-level tables.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
    pub specials: Specials,
    /// Canonical symbol names for globals holding interned symbols, in
    /// declaration order.
    pub symbols: IndexMap<GlobalId, String>,
}

impl Module {
    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id]
    }

    pub fn function_named(&self, name: &str) -> Option<FunctionId> {
        self.functions.iter().position(|f| f.name == name)
    }

    /// Symbol name carried by `global`, if it is in the symbols map.
    pub fn symbol_of(&self, global: GlobalId) -> Option<&str> {
        self.symbols.get(&global).map(String::as_str)
    }
}
