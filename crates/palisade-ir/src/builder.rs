//! Programmatic construction of IR modules.
//!
//! Tests and embedders use these builders to assemble small synthetic
//! programs without going through the JSON wire format.

use crate::module::{
    BinOp, Block, BlockId, CmpOp, Function, FunctionId, Global, GlobalId, Inst, InstId, InstKind,
    Loc, Module, Operand, Place, Slot, SlotId, SlotKind, Specials, Terminator,
};

/// Builds a [`Module`] incrementally.
#[derive(Default)]
pub struct ModuleBuilder {
    module: Module,
}

/// Function ids of the standard protection runtime installed by
/// [`ModuleBuilder::standard_runtime`].
#[derive(Debug, Clone, Copy)]
pub struct RuntimeIds {
    pub protect: FunctionId,
    pub protect_with_index: FunctionId,
    pub reprotect: FunctionId,
    pub unprotect: FunctionId,
    pub unprotect_ptr: FunctionId,
    pub preserve_object: FunctionId,
    pub nil_check: FunctionId,
    pub nil_global: GlobalId,
    pub stack_top: GlobalId,
    pub node_stack: GlobalId,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global(&mut self, name: impl Into<String>) -> GlobalId {
        self.module.globals.push(Global { name: name.into() });
        self.module.globals.len() - 1
    }

    /// Add a global carrying an interned symbol.
    pub fn symbol_global(
        &mut self,
        name: impl Into<String>,
        symbol: impl Into<String>,
    ) -> GlobalId {
        let id = self.global(name);
        self.module.symbols.insert(id, symbol.into());
        id
    }

    /// Declare a body-less function.
    pub fn declare(&mut self, name: impl Into<String>) -> FunctionId {
        self.declare_with(name, |_| {})
    }

    /// Declare a body-less function, customizing its attributes.
    pub fn declare_with(
        &mut self,
        name: impl Into<String>,
        configure: impl FnOnce(&mut Function),
    ) -> FunctionId {
        let mut f = Function::new(name);
        configure(&mut f);
        self.module.functions.push(f);
        self.module.functions.len() - 1
    }

    /// Declare an allocating function that may hand back a fresh object.
    pub fn declare_allocator(&mut self, name: impl Into<String>) -> FunctionId {
        self.declare_with(name, |f| {
            f.allocates = true;
            f.returns_fresh_hint = true;
        })
    }

    pub fn specials_mut(&mut self) -> &mut Specials {
        &mut self.module.specials
    }

    /// Install the conventional protection runtime: the stack primitives,
    /// the nil global and nil-check predicate, and the stack-top/node-stack
    /// globals, all wired into the specials table.
    pub fn standard_runtime(&mut self) -> RuntimeIds {
        let protect = self.declare("protect");
        let protect_with_index = self.declare("protect_with_index");
        let reprotect = self.declare("reprotect");
        let unprotect = self.declare("unprotect");
        let unprotect_ptr = self.declare("unprotect_ptr");
        let preserve_object = self.declare("preserve_object");
        let nil_check = self.declare("is_nil");
        let nil_global = self.global("nil");
        let stack_top = self.global("pp_stack_top");
        let node_stack = self.global("node_stack_top");
        let specials = self.specials_mut();
        specials.protect = Some(protect);
        specials.protect_with_index = Some(protect_with_index);
        specials.reprotect = Some(reprotect);
        specials.unprotect = Some(unprotect);
        specials.unprotect_ptr = Some(unprotect_ptr);
        specials.preserve_object = Some(preserve_object);
        specials.nil_check = Some(nil_check);
        specials.nil_global = Some(nil_global);
        specials.stack_top_global = Some(stack_top);
        specials.node_stack_global = Some(node_stack);
        RuntimeIds {
            protect,
            protect_with_index,
            reprotect,
            unprotect,
            unprotect_ptr,
            preserve_object,
            nil_check,
            nil_global,
            stack_top,
            node_stack,
        }
    }

    /// Start defining a function body. The id is reserved immediately so
    /// the body can contain recursive calls.
    pub fn define(&mut self, name: impl Into<String>) -> FunctionBuilder<'_> {
        let name = name.into();
        self.module.functions.push(Function::new(name.clone()));
        let id = self.module.functions.len() - 1;
        let mut fun = Function::new(name.clone());
        fun.blocks.push(Block {
            insts: Vec::new(),
            term: Terminator::Unreachable,
            term_loc: Loc::default(),
        });
        FunctionBuilder {
            builder: self,
            id,
            file: format!("{name}.c"),
            fun,
            current: 0,
            next_line: 1,
        }
    }

    pub fn finish(self) -> Module {
        self.module
    }
}

/// Builds one function body; created by [`ModuleBuilder::define`].
///
/// Instructions are appended to the current block and stamped with
/// monotonically increasing line numbers so every statement has a distinct
/// source location unless [`FunctionBuilder::at_line`] pins one.
pub struct FunctionBuilder<'m> {
    builder: &'m mut ModuleBuilder,
    id: FunctionId,
    file: String,
    fun: Function,
    current: BlockId,
    next_line: u32,
}

impl FunctionBuilder<'_> {
    pub fn id(&self) -> FunctionId {
        self.id
    }

    pub fn set_params(&mut self, params: Vec<SlotKind>) {
        self.fun.params = params;
    }

    pub fn attrs(&mut self, configure: impl FnOnce(&mut Function)) {
        configure(&mut self.fun);
    }

    pub fn slot(&mut self, name: impl Into<String>, kind: SlotKind) -> SlotId {
        self.fun.slots.push(Slot {
            name: name.into(),
            kind,
        });
        self.fun.slots.len() - 1
    }

    /// Create a new empty block (terminated by `Unreachable` until set).
    pub fn block(&mut self) -> BlockId {
        self.fun.blocks.push(Block {
            insts: Vec::new(),
            term: Terminator::Unreachable,
            term_loc: Loc::default(),
        });
        self.fun.blocks.len() - 1
    }

    pub fn select_block(&mut self, block: BlockId) {
        self.current = block;
    }

    /// Pin the line number stamped on the next instruction.
    pub fn at_line(&mut self, line: u32) {
        self.next_line = line;
    }

    fn push(&mut self, kind: InstKind) -> InstId {
        let loc = Loc {
            file: self.file.clone(),
            line: self.next_line,
        };
        self.next_line += 1;
        self.fun.insts.push(Inst { kind, loc });
        let id = self.fun.insts.len() - 1;
        self.fun.blocks[self.current].insts.push(id);
        id
    }

    pub fn load(&mut self, slot: SlotId) -> InstId {
        self.push(InstKind::Load {
            src: Place::Slot(slot),
        })
    }

    pub fn load_global(&mut self, global: GlobalId) -> InstId {
        self.push(InstKind::Load {
            src: Place::Global(global),
        })
    }

    pub fn store(&mut self, slot: SlotId, value: Operand) -> InstId {
        self.push(InstKind::Store {
            dst: Place::Slot(slot),
            value,
        })
    }

    pub fn store_global(&mut self, global: GlobalId, value: Operand) -> InstId {
        self.push(InstKind::Store {
            dst: Place::Global(global),
            value,
        })
    }

    pub fn store_deref(&mut self, target: InstId, value: Operand) -> InstId {
        self.push(InstKind::Store {
            dst: Place::Deref(target),
            value,
        })
    }

    pub fn call(&mut self, callee: FunctionId, args: Vec<Operand>) -> InstId {
        self.push(InstKind::Call { callee, args })
    }

    pub fn add(&mut self, lhs: Operand, rhs: Operand) -> InstId {
        self.push(InstKind::Bin {
            op: BinOp::Add,
            lhs,
            rhs,
        })
    }

    pub fn cmp(&mut self, op: CmpOp, lhs: Operand, rhs: Operand) -> InstId {
        self.push(InstKind::Cmp { op, lhs, rhs })
    }

    pub fn select(&mut self, cond: Operand, on_true: Operand, on_false: Operand) -> InstId {
        self.push(InstKind::Select {
            cond,
            on_true,
            on_false,
        })
    }

    pub fn field(&mut self, base: Operand, index: u32) -> InstId {
        self.push(InstKind::Field { base, index })
    }

    pub fn phi(&mut self, incoming: Vec<(BlockId, Operand)>) -> InstId {
        self.push(InstKind::Phi { incoming })
    }

    fn set_term(&mut self, term: Terminator) {
        let loc = Loc {
            file: self.file.clone(),
            line: self.next_line,
        };
        self.next_line += 1;
        let block = &mut self.fun.blocks[self.current];
        block.term = term;
        block.term_loc = loc;
    }

    pub fn ret(&mut self, value: Option<Operand>) {
        self.set_term(Terminator::Return { value });
    }

    pub fn jump(&mut self, target: BlockId) {
        self.set_term(Terminator::Jump { target });
    }

    pub fn branch(&mut self, cond: Operand, on_true: BlockId, on_false: BlockId) {
        self.set_term(Terminator::Branch {
            cond,
            on_true,
            on_false,
        });
    }

    pub fn unreachable(&mut self) {
        self.set_term(Terminator::Unreachable);
    }

    /// Seal the use maps and commit the body into the module.
    pub fn finish(mut self) -> FunctionId {
        self.fun.seal();
        self.builder.module.functions[self.id] = self.fun;
        self.id
    }
}
