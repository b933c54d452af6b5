//! Integer-guard domain.
//!
//! An integer guard is a local flag tested against zero. Tracking one
//! costs a state-space split at every branch on it, so the recognizer
//! requires enough comparisons to make the split pay for itself.

use std::collections::BTreeMap;
use std::fmt;

use palisade_ir::module::{
    CmpOp, InstId, InstKind, Operand, SlotAccess, SlotId, SlotKind, Terminator,
};

use crate::engine::FunctionCtx;
use crate::state::AbsState;

/// Abstract value of one integer guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntGuardState {
    Zero,
    NonZero,
    Unknown,
}

impl fmt::Display for IntGuardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntGuardState::Zero => write!(f, "zero"),
            IntGuardState::NonZero => write!(f, "nonzero"),
            IntGuardState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Partial map from guard slots to their abstract values. Absence means
/// unknown, and unknown values are kept out of the map so equal states
/// compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct IntGuards {
    values: BTreeMap<SlotId, IntGuardState>,
}

impl IntGuards {
    pub fn get(&self, slot: SlotId) -> IntGuardState {
        self.values
            .get(&slot)
            .copied()
            .unwrap_or(IntGuardState::Unknown)
    }

    pub fn set(&mut self, slot: SlotId, state: IntGuardState) {
        if state == IntGuardState::Unknown {
            self.values.remove(&slot);
        } else {
            self.values.insert(slot, state);
        }
    }
}

/// Recognize an integer guard: an integer slot used only through loads and
/// stores, compared for equality against zero and never against any other
/// constant, with enough tests to justify tracking.
pub fn is_int_guard(ctx: &FunctionCtx<'_>, slot: SlotId) -> bool {
    ctx.int_guard_vars.get_or_compute(slot, || {
        let f = ctx.fun;
        if f.slots[slot].kind != SlotKind::Int {
            return false;
        }
        let mut comparisons = 0u32;
        let mut const_stores = 0u32;
        let mut copy_stores = 0u32;
        for &u in f.slot_uses(slot) {
            match f.slot_access(u, slot) {
                Some(SlotAccess::Load) => {
                    let Some(user) = f.single_use(u) else {
                        continue;
                    };
                    if let InstKind::Cmp { lhs, rhs, .. } = &f.inst(user).kind {
                        let other = if f.operand_inst(*lhs) == Some(u) {
                            *rhs
                        } else {
                            *lhs
                        };
                        match f.const_of(other) {
                            Some(0) => comparisons += 1,
                            Some(_) => return false,
                            None => {}
                        }
                    }
                }
                Some(SlotAccess::Store(value)) => {
                    if f.const_of(value).is_some() {
                        const_stores += 1;
                    } else if f
                        .operand_inst(value)
                        .and_then(|i| f.load_of_slot(i))
                        .is_some()
                    {
                        copy_stores += 1;
                    }
                }
                _ => return false,
            }
        }
        comparisons >= 2 || (comparisons == 1 && const_stores + copy_stores > 0)
    })
}

/// Store transfer for the integer-guard domain.
pub fn handle_inst(ctx: &FunctionCtx<'_>, inst: InstId, guards: &mut IntGuards) {
    let f = ctx.fun;
    let InstKind::Store { dst, value } = &f.inst(inst).kind else {
        return;
    };
    let palisade_ir::module::Place::Slot(slot) = *dst else {
        return;
    };
    if !is_int_guard(ctx, slot) {
        return;
    }
    let new_state = if let Some(constant) = f.const_of(*value) {
        if constant == 0 {
            IntGuardState::Zero
        } else {
            IntGuardState::NonZero
        }
    } else if let Some(src) = f
        .operand_inst(*value)
        .and_then(|i| f.load_of_slot(i))
        .filter(|&src| is_int_guard(ctx, src))
    {
        guards.get(src)
    } else {
        IntGuardState::Unknown
    };
    guards.set(slot, new_state);
}

/// Decompose a branch condition of the form `guard == 0` / `guard != 0`.
///
/// Returns the guard slot and whether the true edge corresponds to the
/// guard being zero.
pub(crate) fn branch_zero_test(ctx: &FunctionCtx<'_>, cond: Operand) -> Option<(SlotId, bool)> {
    let f = ctx.fun;
    let cmp = f.operand_inst(cond)?;
    let InstKind::Cmp { op, lhs, rhs } = &f.inst(cmp).kind else {
        return None;
    };
    let (load_op, constant) = match (f.const_of(*lhs), f.const_of(*rhs)) {
        (Some(c), None) => (*rhs, c),
        (None, Some(c)) => (*lhs, c),
        _ => return None,
    };
    if constant != 0 {
        return None;
    }
    let slot = f.operand_inst(load_op).and_then(|i| f.load_of_slot(i))?;
    if !is_int_guard(ctx, slot) {
        return None;
    }
    Some((slot, *op == CmpOp::Eq))
}

/// Branch handling: split (or prune) successors on a zero test of a
/// tracked guard.
pub fn handle_terminator(ctx: &FunctionCtx<'_>, s: &AbsState) -> Option<Vec<AbsState>> {
    let Terminator::Branch {
        cond,
        on_true,
        on_false,
    } = ctx.fun.blocks[s.block].term
    else {
        return None;
    };
    let (slot, true_means_zero) = branch_zero_test(ctx, cond)?;
    let known = s.int_guards.get(slot);

    let mut succs = Vec::new();
    let true_state = if true_means_zero {
        IntGuardState::Zero
    } else {
        IntGuardState::NonZero
    };
    let false_state = if true_means_zero {
        IntGuardState::NonZero
    } else {
        IntGuardState::Zero
    };
    if known != false_state {
        let mut next = s.fork(on_true);
        next.int_guards.set(slot, true_state);
        succs.push(next);
    }
    if known != true_state {
        let mut next = s.fork(on_false);
        next.int_guards.set(slot, false_state);
        succs.push(next);
    }
    Some(succs)
}

/// `unprotect(guard ? a : b)` with a known guard folds to a constant
/// count. This is the single point where the balance domain consumes an
/// integer guard; the balance and fresh-variable transfers both call it
/// before giving up on the argument form.
pub(crate) fn select_unprotect_amount(
    ctx: &FunctionCtx<'_>,
    arg: Operand,
    guards: &IntGuards,
) -> Option<i64> {
    let f = ctx.fun;
    let select = f.operand_inst(arg)?;
    let InstKind::Select {
        cond,
        on_true,
        on_false,
    } = &f.inst(select).kind
    else {
        return None;
    };
    let (true_count, false_count) = (f.const_of(*on_true)?, f.const_of(*on_false)?);
    let (slot, true_means_zero) = branch_zero_test(ctx, *cond)?;
    match guards.get(slot) {
        IntGuardState::Unknown => None,
        IntGuardState::Zero => Some(if true_means_zero { true_count } else { false_count }),
        IntGuardState::NonZero => Some(if true_means_zero { false_count } else { true_count }),
    }
}
