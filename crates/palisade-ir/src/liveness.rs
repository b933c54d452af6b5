//! Per-function liveness of local slots.
//!
//! Classic backward dataflow at instruction granularity. For every
//! instruction the oracle answers three questions about the program state
//! *after* it executes:
//!
//! - `possibly_used`: some path reads the slot before overwriting it;
//! - `possibly_killed`: some path overwrites the slot;
//! - `definitely_used`: every path reads the slot before overwriting it.

use std::collections::BTreeSet;

use crate::module::{Function, InstId, InstKind, Operand, Place, SlotId};

/// Slot sets describing the program point after one instruction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LiveSets {
    pub possibly_used: BTreeSet<SlotId>,
    pub possibly_killed: BTreeSet<SlotId>,
    pub definitely_used: BTreeSet<SlotId>,
}

/// Liveness oracle for one function.
#[derive(Debug, Clone)]
pub struct Liveness {
    after: Vec<LiveSets>,
}

impl Liveness {
    pub fn compute(f: &Function) -> Liveness {
        let universe: BTreeSet<SlotId> = (0..f.slots.len()).collect();
        let n_blocks = f.blocks.len();

        // block-level backward fixpoint on the three out/in pairs
        let mut live_in: Vec<LiveSets> = vec![LiveSets::default(); n_blocks];
        for sets in live_in.iter_mut() {
            sets.definitely_used = universe.clone();
        }
        let mut changed = true;
        while changed {
            changed = false;
            for b in (0..n_blocks).rev() {
                let out = block_out(f, b, &live_in, &universe);
                let mut state = out;
                for &inst in f.blocks[b].insts.iter().rev() {
                    transfer(f, inst, &mut state);
                }
                if state != live_in[b] {
                    live_in[b] = state;
                    changed = true;
                }
            }
        }

        // per-instruction sweep: the state after an instruction is the
        // state before its successor within the block
        let mut after = vec![LiveSets::default(); f.insts.len()];
        for b in 0..n_blocks {
            let mut state = block_out(f, b, &live_in, &universe);
            for &inst in f.blocks[b].insts.iter().rev() {
                after[inst] = state.clone();
                transfer(f, inst, &mut state);
            }
        }
        Liveness { after }
    }

    /// May `slot` still be read (before any overwrite) after `inst`?
    pub fn possibly_used(&self, inst: InstId, slot: SlotId) -> bool {
        self.after[inst].possibly_used.contains(&slot)
    }

    /// May `slot` be overwritten on some path after `inst`?
    pub fn possibly_killed(&self, inst: InstId, slot: SlotId) -> bool {
        self.after[inst].possibly_killed.contains(&slot)
    }

    /// Is `slot` read on every path after `inst` before being overwritten?
    pub fn definitely_used(&self, inst: InstId, slot: SlotId) -> bool {
        self.after[inst].definitely_used.contains(&slot)
    }

    pub fn sets_after(&self, inst: InstId) -> &LiveSets {
        &self.after[inst]
    }
}

fn block_out(
    f: &Function,
    b: usize,
    live_in: &[LiveSets],
    universe: &BTreeSet<SlotId>,
) -> LiveSets {
    let succs = f.blocks[b].term.successors();
    if succs.is_empty() {
        return LiveSets::default();
    }
    let mut out = LiveSets {
        definitely_used: universe.clone(),
        ..LiveSets::default()
    };
    for s in succs {
        let succ_in = &live_in[s];
        out.possibly_used.extend(succ_in.possibly_used.iter());
        out.possibly_killed.extend(succ_in.possibly_killed.iter());
        out.definitely_used = out
            .definitely_used
            .intersection(&succ_in.definitely_used)
            .copied()
            .collect();
    }
    out
}

fn reads_writes(f: &Function, inst: InstId) -> (Option<SlotId>, Option<SlotId>, Option<SlotId>) {
    // (read, written, escaped) — an address-taken slot counts as both
    match &f.inst(inst).kind {
        InstKind::Load {
            src: Place::Slot(slot),
        } => (Some(*slot), None, None),
        InstKind::Store {
            dst: Place::Slot(slot),
            value,
        } => {
            let escaped = match value {
                Operand::SlotAddr(s) => Some(*s),
                _ => None,
            };
            (None, Some(*slot), escaped)
        }
        InstKind::Call { args, .. } => {
            let escaped = args.iter().find_map(|a| match a {
                Operand::SlotAddr(s) => Some(*s),
                _ => None,
            });
            (None, None, escaped)
        }
        _ => (None, None, None),
    }
}

fn transfer(f: &Function, inst: InstId, state: &mut LiveSets) {
    let (read, written, escaped) = reads_writes(f, inst);
    if let Some(slot) = written {
        state.possibly_used.remove(&slot);
        state.definitely_used.remove(&slot);
        state.possibly_killed.insert(slot);
    }
    if let Some(slot) = read {
        state.possibly_used.insert(slot);
        state.definitely_used.insert(slot);
        state.possibly_killed.remove(&slot);
    }
    if let Some(slot) = escaped {
        // escaping through an address keeps every question open
        state.possibly_used.insert(slot);
        state.possibly_killed.insert(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ModuleBuilder;
    use crate::module::{Operand, SlotKind};

    #[test]
    fn straight_line_read_after_write() {
        let mut mb = ModuleBuilder::new();
        let use_fn = mb.declare("use");
        let mut fb = mb.define("f");
        let x = fb.slot("x", SlotKind::Sexp);
        let store = fb.store(x, Operand::Const(0));
        let v = fb.load(x);
        fb.call(use_fn, vec![Operand::Inst(v)]);
        fb.ret(None);
        let fid = fb.finish();
        let module = mb.finish();
        let f = module.function(fid);
        let live = Liveness::compute(f);
        // after the store, x is read on the only path
        assert!(live.possibly_used(store, x));
        assert!(live.definitely_used(store, x));
        // after the load nothing reads x again
        assert!(!live.possibly_used(v, x));
        assert!(!live.definitely_used(v, x));
    }

    #[test]
    fn branch_makes_use_possible_but_not_definite() {
        let mut mb = ModuleBuilder::new();
        let use_fn = mb.declare("use");
        let mut fb = mb.define("f");
        let x = fb.slot("x", SlotKind::Sexp);
        let c = fb.slot("c", SlotKind::Int);
        let b_use = fb.block();
        let b_skip = fb.block();
        let store = fb.store(x, Operand::Const(0));
        let cond = fb.load(c);
        fb.branch(Operand::Inst(cond), b_use, b_skip);
        fb.select_block(b_use);
        let v = fb.load(x);
        fb.call(use_fn, vec![Operand::Inst(v)]);
        fb.ret(None);
        fb.select_block(b_skip);
        fb.ret(None);
        let fid = fb.finish();
        let module = mb.finish();
        let live = Liveness::compute(module.function(fid));
        assert!(live.possibly_used(store, x));
        assert!(!live.definitely_used(store, x));
    }

    #[test]
    fn overwrite_kills_liveness() {
        let mut mb = ModuleBuilder::new();
        let use_fn = mb.declare("use");
        let mut fb = mb.define("f");
        let x = fb.slot("x", SlotKind::Sexp);
        let first = fb.store(x, Operand::Const(0));
        let second = fb.store(x, Operand::Const(1));
        let v = fb.load(x);
        fb.call(use_fn, vec![Operand::Inst(v)]);
        fb.ret(None);
        let fid = fb.finish();
        let module = mb.finish();
        let live = Liveness::compute(module.function(fid));
        // after the first store x is overwritten before any read
        assert!(!live.possibly_used(first, x));
        assert!(live.possibly_killed(first, x));
        assert!(live.possibly_used(second, x));
        assert!(!live.possibly_killed(second, x));
    }

    #[test]
    fn loops_reach_a_fixpoint() {
        let mut mb = ModuleBuilder::new();
        let use_fn = mb.declare("use");
        let mut fb = mb.define("f");
        let x = fb.slot("x", SlotKind::Sexp);
        let c = fb.slot("c", SlotKind::Int);
        let b_loop = fb.block();
        let b_exit = fb.block();
        let store = fb.store(x, Operand::Const(0));
        fb.jump(b_loop);
        fb.select_block(b_loop);
        let v = fb.load(x);
        fb.call(use_fn, vec![Operand::Inst(v)]);
        let cond = fb.load(c);
        fb.branch(Operand::Inst(cond), b_loop, b_exit);
        fb.select_block(b_exit);
        fb.ret(None);
        let fid = fb.finish();
        let module = mb.finish();
        let live = Liveness::compute(module.function(fid));
        assert!(live.possibly_used(store, x));
        assert!(live.definitely_used(store, x));
        // around the back edge the load stays live
        assert!(live.possibly_used(cond, x));
    }
}
