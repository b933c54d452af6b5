//! Allocation summaries over the call graph.
//!
//! Two predicates per function, closed transitively: `may_allocate` (the
//! function may reach the heap allocator) and `may_return_fresh` (it may
//! additionally hand a freshly allocated object back to its caller).
//! Definitions are inspected; declarations contribute their attributes.

use crate::module::{Function, FunctionId, InstKind, Module, Operand, Place, SlotKind, Terminator};

/// Per-function allocation predicates.
#[derive(Debug, Clone)]
pub struct AllocSummaries {
    may_allocate: Vec<bool>,
    may_return_fresh: Vec<bool>,
}

impl AllocSummaries {
    /// Close the base facts over the call graph.
    pub fn compute(module: &Module) -> Self {
        let n = module.functions.len();
        let mut may_allocate: Vec<bool> = module.functions.iter().map(|f| f.allocates).collect();

        // allocation closes over plain reachability of an allocating callee
        let mut changed = true;
        while changed {
            changed = false;
            for (id, f) in module.functions.iter().enumerate() {
                if may_allocate[id] {
                    continue;
                }
                let calls_allocating = f.insts.iter().any(|inst| match &inst.kind {
                    InstKind::Call { callee, .. } => may_allocate[*callee],
                    _ => false,
                });
                if calls_allocating {
                    may_allocate[id] = true;
                    changed = true;
                }
            }
        }

        // freshness additionally requires the allocated object to flow into
        // a return, directly, through a local slot, or through a phi
        let mut may_return_fresh: Vec<bool> = (0..n)
            .map(|id| may_allocate[id] && module.functions[id].returns_fresh_hint)
            .collect();
        let mut changed = true;
        while changed {
            changed = false;
            for (id, f) in module.functions.iter().enumerate() {
                if may_return_fresh[id] || !may_allocate[id] || f.is_declaration() {
                    continue;
                }
                if returns_fresh_value(f, &may_return_fresh) {
                    may_return_fresh[id] = true;
                    changed = true;
                }
            }
        }

        AllocSummaries {
            may_allocate,
            may_return_fresh,
        }
    }

    /// May the function transitively invoke the heap allocator?
    pub fn may_allocate(&self, f: FunctionId) -> bool {
        self.may_allocate[f]
    }

    /// May the function allocate and return the fresh object?
    pub fn may_return_fresh(&self, f: FunctionId) -> bool {
        self.may_return_fresh[f]
    }
}

fn returns_fresh_value(f: &Function, may_return_fresh: &[bool]) -> bool {
    let fresh_call = |op: Operand| -> bool {
        f.operand_inst(op)
            .and_then(|i| f.as_call(i))
            .is_some_and(|(callee, _)| may_return_fresh[callee])
    };
    let fresh_operand = |op: Operand| -> bool {
        if fresh_call(op) {
            return true;
        }
        // returned slot whose stores include a fresh call result
        let Some(slot) = f.operand_inst(op).and_then(|i| f.load_of_slot(i)) else {
            return false;
        };
        f.slot_uses(slot).iter().any(|&u| match &f.inst(u).kind {
            InstKind::Store {
                dst: Place::Slot(s),
                value,
            } => *s == slot && fresh_call(*value),
            _ => false,
        })
    };
    f.blocks.iter().any(|b| match &b.term {
        Terminator::Return { value: Some(op) } => match f.operand_inst(*op) {
            Some(i) => match &f.inst(i).kind {
                InstKind::Phi { incoming } => incoming.iter().any(|(_, op)| fresh_operand(*op)),
                _ => fresh_operand(*op),
            },
            None => false,
        },
        _ => false,
    })
}

impl Function {
    /// Does the callee protect its `index`-th argument across internal
    /// allocations?
    pub fn protects_arg(&self, index: usize) -> bool {
        self.protect_args.contains(&index)
    }

    /// Is the callee harmless to its `index`-th argument even when it
    /// allocates internally?
    pub fn is_safe_arg(&self, index: usize) -> bool {
        self.safe_args.contains(&index) || self.protects_arg(index)
    }

    /// Does the callee protect every pointer parameter it takes?
    pub fn protects_all_pointer_args(&self) -> bool {
        let mut any = false;
        for (i, kind) in self.params.iter().enumerate() {
            if *kind == SlotKind::Sexp {
                any = true;
                if !self.protects_arg(i) {
                    return false;
                }
            }
        }
        any
    }
}
