//! Pointer-guard domain.
//!
//! A pointer guard is a local heap-pointer slot used as a predicate:
//! tested against the nil constant (directly or through the nil-check
//! predicate) or against a specific interned symbol. The domain prunes
//! branches that contradict the tracked value, which is what removes most
//! spurious imbalance reports in code shaped like
//! `if (s != nil) protect(s); ... if (s != nil) unprotect(1);`.

use std::collections::BTreeMap;
use std::fmt;

use palisade_ir::module::{
    CmpOp, InstId, InstKind, Operand, Place, SlotAccess, SlotId, SlotKind, Terminator,
};

use crate::engine::FunctionCtx;
use crate::state::AbsState;

/// Abstract value of one pointer guard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SexpGuard {
    /// The nil constant.
    Nil,
    /// A specific interned symbol (symbols are never nil).
    Symbol(String),
    /// Known not to be nil.
    NonNil,
    Unknown,
}

impl fmt::Display for SexpGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SexpGuard::Nil => write!(f, "nil"),
            SexpGuard::Symbol(name) => write!(f, "symbol \"{name}\""),
            SexpGuard::NonNil => write!(f, "non-nil"),
            SexpGuard::Unknown => write!(f, "unknown"),
        }
    }
}

/// Partial map from guard slots to abstract values; unknown entries are
/// kept out of the map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SexpGuards {
    values: BTreeMap<SlotId, SexpGuard>,
}

impl SexpGuards {
    pub fn get(&self, slot: SlotId) -> SexpGuard {
        self.values
            .get(&slot)
            .cloned()
            .unwrap_or(SexpGuard::Unknown)
    }

    pub fn set(&mut self, slot: SlotId, state: SexpGuard) {
        if state == SexpGuard::Unknown {
            self.values.remove(&slot);
        } else {
            self.values.insert(slot, state);
        }
    }
}

/// Recognize a pointer guard: a heap-pointer slot used only through loads
/// and stores, tested against nil (by comparison with the nil global or
/// through the nil-check predicate). Like the integer side, tracking one
/// splits the state space at every branch on it, so a single nil test
/// qualifies only when the slot is also assigned something the domain can
/// track (nil, a symbol, a call result) or copied onward; otherwise two
/// tests are required before the split pays for itself.
pub fn is_sexp_guard(ctx: &FunctionCtx<'_>, slot: SlotId) -> bool {
    ctx.sexp_guard_vars.get_or_compute(slot, || {
        let f = ctx.fun;
        if f.slots[slot].kind != SlotKind::Sexp {
            return false;
        }
        let nil_global = ctx.module.specials.nil_global;
        let nil_check = ctx.module.specials.nil_check;
        let mut nil_tests = 0u32;
        let mut value_stores = 0u32;
        let mut copies = 0u32;
        for &u in f.slot_uses(slot) {
            match f.slot_access(u, slot) {
                Some(SlotAccess::Load) => {
                    let Some(user) = f.single_use(u) else {
                        continue;
                    };
                    match &f.inst(user).kind {
                        InstKind::Cmp { lhs, rhs, .. } => {
                            let other = if f.operand_inst(*lhs) == Some(u) {
                                *rhs
                            } else {
                                *lhs
                            };
                            let against_nil = f
                                .operand_inst(other)
                                .and_then(|i| f.load_of_global(i))
                                .is_some_and(|g| Some(g) == nil_global);
                            if against_nil {
                                nil_tests += 1;
                            }
                        }
                        InstKind::Call { callee, .. } if Some(*callee) == nil_check => {
                            nil_tests += 1;
                        }
                        InstKind::Store { .. } => {
                            // guard copied into another location
                            copies += 1;
                        }
                        _ => {}
                    }
                }
                Some(SlotAccess::Store(value)) => {
                    // assignments of nil, a symbol or a call result give
                    // the domain a value to track
                    if let Some(src) = f.operand_inst(value) {
                        let from_known_global = f.load_of_global(src).is_some_and(|g| {
                            Some(g) == nil_global || ctx.module.symbol_of(g).is_some()
                        });
                        if from_known_global || f.as_call(src).is_some() {
                            value_stores += 1;
                        }
                    }
                }
                _ => return false,
            }
        }
        nil_tests >= 2 || (nil_tests == 1 && value_stores + copies > 0)
    })
}

/// Store transfer for the pointer-guard domain.
pub fn handle_inst(ctx: &FunctionCtx<'_>, inst: InstId, s: &mut AbsState) {
    let f = ctx.fun;
    let InstKind::Store { dst, value } = &f.inst(inst).kind else {
        return;
    };
    let Place::Slot(slot) = *dst else {
        return;
    };
    if !is_sexp_guard(ctx, slot) {
        return;
    }

    // guard = protect(...) passes the protected value through
    let mut value = *value;
    if let Some((callee, args)) = f.operand_inst(value).and_then(|i| f.as_call(i)) {
        if ctx.module.specials.is_protecting(callee) {
            if let Some(&arg) = args.first() {
                value = arg;
            }
        }
    }

    if let Some(src) = f.operand_inst(value).and_then(|i| f.load_of_global(i)) {
        if Some(src) == ctx.module.specials.nil_global {
            s.sexp_guards.set(slot, SexpGuard::Nil);
            return;
        }
        if let Some(symbol) = ctx.module.symbol_of(src) {
            s.sexp_guards.set(slot, SexpGuard::Symbol(symbol.to_string()));
            return;
        }
    }
    if let Some(src) = f
        .operand_inst(value)
        .and_then(|i| f.load_of_slot(i))
        .filter(|&src| is_sexp_guard(ctx, src))
    {
        let copied = s.sexp_guards.get(src);
        s.sexp_guards.set(slot, copied);
        return;
    }
    if ctx.config.use_allocator_detection {
        // treating every possible allocator result as non-nil
        // over-approximates nullability; kept as a toggle
        if let Some((callee, _)) = f.operand_inst(value).and_then(|i| f.as_call(i)) {
            if ctx.summaries.may_return_fresh(callee) {
                s.sexp_guards.set(slot, SexpGuard::NonNil);
                return;
            }
        }
    }
    s.sexp_guards.set(slot, SexpGuard::Unknown);
}

/// `guard == nil` / `guard != nil` tests in branch conditions, through the
/// nil global or the nil-check predicate. Returns the guard and whether
/// the true edge means "is nil".
fn branch_nil_test(ctx: &FunctionCtx<'_>, cond: Operand) -> Option<(SlotId, bool)> {
    let f = ctx.fun;
    let inst = f.operand_inst(cond)?;
    match &f.inst(inst).kind {
        // if (nil_check(x)) ...
        InstKind::Call { callee, args } if Some(*callee) == ctx.module.specials.nil_check => {
            let slot = args
                .first()
                .and_then(|&a| f.operand_inst(a))
                .and_then(|i| f.load_of_slot(i))?;
            is_sexp_guard(ctx, slot).then_some((slot, true))
        }
        InstKind::Cmp { op, lhs, rhs } => {
            // if (nil_check(x) == 0) ...
            for (this, other) in [(*lhs, *rhs), (*rhs, *lhs)] {
                let Some(i) = f.operand_inst(this) else {
                    continue;
                };
                if let InstKind::Call { callee, args } = &f.inst(i).kind {
                    if Some(*callee) == ctx.module.specials.nil_check && f.const_of(other) == Some(0)
                    {
                        let slot = args
                            .first()
                            .and_then(|&a| f.operand_inst(a))
                            .and_then(|j| f.load_of_slot(j))?;
                        if !is_sexp_guard(ctx, slot) {
                            return None;
                        }
                        return Some((slot, *op == CmpOp::Ne));
                    }
                }
            }
            // if (x == nil) ...
            let nil_global = ctx.module.specials.nil_global?;
            for (this, other) in [(*lhs, *rhs), (*rhs, *lhs)] {
                let loads_nil = f
                    .operand_inst(other)
                    .and_then(|i| f.load_of_global(i))
                    == Some(nil_global);
                if !loads_nil {
                    continue;
                }
                let slot = f.operand_inst(this).and_then(|i| f.load_of_slot(i))?;
                if !is_sexp_guard(ctx, slot) {
                    return None;
                }
                return Some((slot, *op == CmpOp::Eq));
            }
            None
        }
        _ => None,
    }
}

/// `guard == <symbol global>` tests. Returns the guard, the symbol name,
/// and whether the true edge means "is that symbol".
fn branch_symbol_test(ctx: &FunctionCtx<'_>, cond: Operand) -> Option<(SlotId, String, bool)> {
    let f = ctx.fun;
    let inst = f.operand_inst(cond)?;
    let InstKind::Cmp { op, lhs, rhs } = &f.inst(inst).kind else {
        return None;
    };
    for (this, other) in [(*lhs, *rhs), (*rhs, *lhs)] {
        let symbol = f
            .operand_inst(other)
            .and_then(|i| f.load_of_global(i))
            .and_then(|g| ctx.module.symbol_of(g));
        let Some(symbol) = symbol else {
            continue;
        };
        let slot = f.operand_inst(this).and_then(|i| f.load_of_slot(i))?;
        if !is_sexp_guard(ctx, slot) {
            return None;
        }
        return Some((slot, symbol.to_string(), *op == CmpOp::Eq));
    }
    None
}

/// Branch handling: split or prune successors on nil and symbol tests of
/// tracked guards.
pub fn handle_terminator(ctx: &FunctionCtx<'_>, s: &AbsState) -> Option<Vec<AbsState>> {
    let Terminator::Branch {
        cond,
        on_true,
        on_false,
    } = ctx.fun.blocks[s.block].term
    else {
        return None;
    };

    if let Some((slot, positive)) = branch_nil_test(ctx, cond) {
        let known = s.sexp_guards.get(slot);
        // symbols and allocator results are never nil
        let (can_be_nil, can_be_non_nil) = match known {
            SexpGuard::Nil => (true, false),
            SexpGuard::Symbol(_) | SexpGuard::NonNil => (false, true),
            SexpGuard::Unknown => (true, true),
        };
        let (true_possible, false_possible) = if positive {
            (can_be_nil, can_be_non_nil)
        } else {
            (can_be_non_nil, can_be_nil)
        };
        let mut succs = Vec::new();
        if true_possible {
            let mut next = s.fork(on_true);
            if !matches!(known, SexpGuard::Symbol(_)) {
                let implied = if positive {
                    SexpGuard::Nil
                } else {
                    SexpGuard::NonNil
                };
                next.sexp_guards.set(slot, implied);
            }
            succs.push(next);
        }
        if false_possible {
            let mut next = s.fork(on_false);
            if !matches!(known, SexpGuard::Symbol(_)) {
                let implied = if positive {
                    SexpGuard::NonNil
                } else {
                    SexpGuard::Nil
                };
                next.sexp_guards.set(slot, implied);
            }
            succs.push(next);
        }
        return Some(succs);
    }

    if let Some((slot, symbol, positive)) = branch_symbol_test(ctx, cond) {
        let known = s.sexp_guards.get(slot);
        let (matches_symbol, may_differ) = match &known {
            SexpGuard::Symbol(existing) if *existing == symbol => (true, false),
            SexpGuard::Symbol(_) | SexpGuard::Nil => (false, true),
            SexpGuard::NonNil | SexpGuard::Unknown => (true, true),
        };
        let (true_possible, false_possible) = if positive {
            (matches_symbol, may_differ)
        } else {
            (may_differ, matches_symbol)
        };
        let mut succs = Vec::new();
        if true_possible {
            let mut next = s.fork(on_true);
            if positive {
                next.sexp_guards.set(slot, SexpGuard::Symbol(symbol.clone()));
            }
            succs.push(next);
        }
        if false_possible {
            let mut next = s.fork(on_false);
            if !positive {
                next.sexp_guards.set(slot, SexpGuard::Symbol(symbol.clone()));
            }
            succs.push(next);
        }
        return Some(succs);
    }

    None
}
