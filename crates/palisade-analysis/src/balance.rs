//! Protection-stack balance domain.
//!
//! Tracks the net protection-stack depth relative to function entry, a
//! recognized protection counter variable (`n = 0; protect(..); n++;
//! unprotect(n)` idioms), and the save/restore idiom for the runtime
//! stack-top pointer. Once the abstraction breaks down on a trace the
//! state is marked confused and stays quiet; in practice messages emitted
//! past that point are almost always false alarms.

use std::fmt;

use palisade_ir::module::{
    BinOp, CmpOp, Function, InstId, InstKind, Operand, Place, SlotAccess, SlotId, Terminator,
};
use tracing::trace;

use crate::diagnostics::LineMessenger;
use crate::engine::FunctionCtx;
use crate::state::AbsState;

const MSG_PFX: &str = "[PB] ";
const CONFUSION_DISCLAIMER: &str = "results will be incomplete";

/// Depth beyond which the protect-stack tracking gives up.
pub const MAX_DEPTH: i32 = 256;
/// Largest exact counter value tracked before switching to the
/// differential representation.
pub const MAX_COUNT: i64 = 64;

/// Tracking mode of the protection counter variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CountState {
    /// No counter value is tracked.
    #[default]
    None,
    /// `count` is the counter variable's exact value.
    Exact,
    /// The counter's protects have been folded into `depth`.
    Diff,
}

impl fmt::Display for CountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CountState::None => write!(f, "uninitialized (none)"),
            CountState::Exact => write!(f, "exact"),
            CountState::Diff => write!(f, "differential"),
        }
    }
}

/// Balance-domain value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Balance {
    /// Net protection-stack depth relative to function entry.
    pub depth: i32,
    /// Tracked value of the counter variable (meaningful in `Exact`).
    pub count: i64,
    pub count_state: CountState,
    /// The recognized counter slot, fixed at first use.
    pub counter_var: Option<SlotId>,
    /// Depth captured at the latest stack-top save; -1 when none.
    pub saved_depth: i32,
    /// Slot holding the saved stack-top value.
    pub top_save_var: Option<SlotId>,
    /// The abstraction broke down on this trace; no further findings.
    pub confused: bool,
}

impl Default for Balance {
    fn default() -> Self {
        Balance {
            depth: 0,
            count: 0,
            count_state: CountState::None,
            counter_var: None,
            saved_depth: -1,
            top_save_var: None,
            confused: false,
        }
    }
}

impl Balance {
    fn confuse(&mut self, msg: &mut LineMessenger, text: &str, loc: &palisade_ir::module::Loc) {
        msg.info(&format!("{MSG_PFX}{text} {CONFUSION_DISCLAIMER}"), loc);
        self.confused = true;
        trace!("balance confused, will not report more");
    }
}

// ---------------------------------------------------------------
// Recognizers
// ---------------------------------------------------------------

/// A protection counter is an integer slot that is only ever assigned a
/// constant or bumped by a constant, is otherwise only loaded, and is
/// passed to unprotect at least once (possibly inside `counter + k`).
pub fn is_counter_var(ctx: &FunctionCtx<'_>, slot: SlotId) -> bool {
    let Some(unprotect) = ctx.module.specials.unprotect else {
        return false;
    };
    ctx.counter_vars.get_or_compute(slot, || {
        let f = ctx.fun;
        if f.slots[slot].kind != palisade_ir::module::SlotKind::Int {
            return false;
        }
        let mut passed_to_unprotect = false;
        for &u in f.slot_uses(slot) {
            match f.slot_access(u, slot) {
                Some(SlotAccess::Store(value)) => {
                    if f.const_of(value).is_some() {
                        continue;
                    }
                    if add_of_slot_load(f, value, slot).is_some() {
                        continue;
                    }
                    return false;
                }
                Some(SlotAccess::Load) => {
                    let Some(mut user) = f.single_use(u) else {
                        return false;
                    };
                    // step over `counter + k`
                    if let InstKind::Bin {
                        op: BinOp::Add,
                        lhs,
                        rhs,
                    } = &f.inst(user).kind
                    {
                        if (f.const_of(*lhs).is_some() || f.const_of(*rhs).is_some())
                            && f.has_one_use(user)
                        {
                            user = f.uses(user)[0];
                        }
                    }
                    if let Some((callee, _)) = f.as_call(user) {
                        if callee == unprotect {
                            passed_to_unprotect = true;
                        }
                    }
                }
                _ => return false,
            }
        }
        passed_to_unprotect
    })
}

/// A stack-top save variable only ever receives the stack-top global and
/// stores it back.
pub fn is_top_save_var(ctx: &FunctionCtx<'_>, slot: SlotId) -> bool {
    let Some(stack_top) = ctx.module.specials.stack_top_global else {
        return false;
    };
    ctx.save_vars.get_or_compute(slot, || {
        let f = ctx.fun;
        let mut uses_stack_top = false;
        for &u in f.slot_uses(slot) {
            match f.slot_access(u, slot) {
                Some(SlotAccess::Store(value)) => {
                    // savestack = <stack top>
                    let from_top = f
                        .operand_inst(value)
                        .filter(|&i| f.has_one_use(i))
                        .and_then(|i| f.load_of_global(i))
                        == Some(stack_top);
                    if from_top {
                        uses_stack_top = true;
                        continue;
                    }
                    return false;
                }
                Some(SlotAccess::Load) => {
                    // <stack top> = savestack
                    if let Some(user) = f.single_use(u) {
                        if let InstKind::Store {
                            dst: Place::Global(g),
                            ..
                        } = &f.inst(user).kind
                        {
                            if *g == stack_top {
                                uses_stack_top = true;
                            }
                        }
                    }
                }
                _ => return false,
            }
        }
        uses_stack_top
    })
}

/// `load(slot) + c` (either operand order); returns the constant.
fn add_of_slot_load(f: &Function, value: Operand, slot: SlotId) -> Option<i64> {
    let inst = f.operand_inst(value)?;
    let InstKind::Bin {
        op: BinOp::Add,
        lhs,
        rhs,
    } = &f.inst(inst).kind
    else {
        return None;
    };
    let (constant, other) = match (f.const_of(*lhs), f.const_of(*rhs)) {
        (Some(c), None) => (c, *rhs),
        (None, Some(c)) => (c, *lhs),
        _ => return None,
    };
    let loaded = f.operand_inst(other).and_then(|i| f.load_of_slot(i))?;
    (loaded == slot).then_some(constant)
}

// ---------------------------------------------------------------
// Unprotect argument forms
// ---------------------------------------------------------------

pub(crate) enum UnprotectArg {
    Constant(i64),
    /// `counter` or `counter + addend`.
    Counter {
        slot: SlotId,
        addend: i64,
    },
    Unsupported(&'static str),
}

pub(crate) fn parse_unprotect_arg(ctx: &FunctionCtx<'_>, arg: Operand) -> UnprotectArg {
    let f = ctx.fun;
    if let Some(value) = f.const_of(arg) {
        return UnprotectArg::Constant(value);
    }
    let Some(inst) = f.operand_inst(arg) else {
        return UnprotectArg::Unsupported("has an unsupported form of unprotect (not constant, not variable),");
    };
    let (var_value, addend) = match &f.inst(inst).kind {
        InstKind::Bin {
            op: BinOp::Add,
            lhs,
            rhs,
        } => match (f.const_of(*lhs), f.const_of(*rhs)) {
            (Some(c), None) => (*rhs, c),
            (None, Some(c)) => (*lhs, c),
            _ => {
                return UnprotectArg::Unsupported(
                    "has an unsupported form of unprotect with a variable - binary add,",
                )
            }
        },
        _ => (arg, 0),
    };
    let Some(slot) = f
        .operand_inst(var_value)
        .and_then(|i| f.load_of_slot(i))
    else {
        return UnprotectArg::Unsupported("has an unsupported form of unprotect (not constant, not variable),");
    };
    if !is_counter_var(ctx, slot) {
        return UnprotectArg::Unsupported("has an unsupported form of unprotect with a variable,");
    }
    UnprotectArg::Counter { slot, addend }
}

/// Record `slot` as the function's counter variable; a second, different
/// counter confuses the abstraction.
fn bind_counter_var(
    b: &mut Balance,
    slot: SlotId,
    msg: &mut LineMessenger,
    loc: &palisade_ir::module::Loc,
    refinable: &mut u32,
) -> bool {
    match b.counter_var {
        None => {
            b.counter_var = Some(slot);
            true
        }
        Some(existing) if existing == slot => true,
        Some(_) => {
            b.confuse(msg, "uses multiple pointer protection counters,", loc);
            *refinable += 1;
            false
        }
    }
}

// ---------------------------------------------------------------
// Transfer functions
// ---------------------------------------------------------------

fn is_select(f: &Function, arg: Operand) -> bool {
    f.operand_inst(arg)
        .is_some_and(|i| matches!(f.inst(i).kind, InstKind::Select { .. }))
}

fn handle_call(
    ctx: &FunctionCtx<'_>,
    inst: InstId,
    b: &mut Balance,
    int_guards: Option<&crate::int_guards::IntGuards>,
    msg: &mut LineMessenger,
    refinable: &mut u32,
) {
    let Some((callee, args)) = ctx.fun.as_call(inst) else {
        return;
    };
    let sp = &ctx.module.specials;
    let loc = &ctx.fun.inst(inst).loc;

    if sp.is_protecting(callee) {
        if b.depth > MAX_DEPTH {
            b.confuse(msg, "has too high protection stack depth,", loc);
        } else {
            b.depth += 1;
        }
        return;
    }

    if sp.unprotect == Some(callee) {
        let Some(&arg) = args.first() else {
            return;
        };
        if is_select(ctx.fun, arg) {
            // unprotect(guard ? a : b) folds when the guard is known
            let folded = int_guards
                .and_then(|guards| crate::int_guards::select_unprotect_amount(ctx, arg, guards));
            if let Some(k) = folded {
                b.depth -= k as i32;
                if b.count_state != CountState::Diff && b.depth < 0 {
                    msg.info(&format!("{MSG_PFX}has negative depth"), loc);
                    *refinable += 1;
                }
            } else {
                b.confuse(
                    msg,
                    "has an unsupported form of unprotect (not constant, not variable),",
                    loc,
                );
                *refinable += 1;
            }
            return;
        }
        match parse_unprotect_arg(ctx, arg) {
            UnprotectArg::Constant(k) => {
                b.depth -= k as i32;
                if b.count_state != CountState::Diff && b.depth < 0 {
                    msg.info(&format!("{MSG_PFX}has negative depth"), loc);
                    *refinable += 1;
                }
            }
            UnprotectArg::Counter { slot, addend } => {
                if !bind_counter_var(b, slot, msg, loc, refinable) {
                    return;
                }
                match b.count_state {
                    CountState::None => {
                        msg.info(
                            &format!(
                                "{MSG_PFX}passes uninitialized counter of protects in a call to unprotect"
                            ),
                            loc,
                        );
                        *refinable += 1;
                    }
                    CountState::Exact => {
                        b.depth -= (b.count + addend) as i32;
                        if b.depth < 0 {
                            msg.info(&format!("{MSG_PFX}has negative depth"), loc);
                            *refinable += 1;
                        }
                        b.count_state = CountState::Diff;
                    }
                    CountState::Diff => {
                        // the counter's protects were already folded into
                        // depth, which now becomes exact again
                        b.count_state = CountState::None;
                        b.depth -= addend as i32;
                        if b.depth < 0 {
                            msg.info(
                                &format!("{MSG_PFX}has negative depth after unprotect(<counter>)"),
                                loc,
                            );
                            *refinable += 1;
                        }
                    }
                }
            }
            UnprotectArg::Unsupported(text) => {
                b.confuse(msg, text, loc);
            }
        }
        return;
    }

    if sp.unprotect_ptr == Some(callee) {
        b.depth -= 1;
        if b.count_state != CountState::Diff && b.depth < 0 {
            msg.info(&format!("{MSG_PFX}has negative depth"), loc);
            *refinable += 1;
        }
    }
}

fn handle_load(
    ctx: &FunctionCtx<'_>,
    inst: InstId,
    b: &mut Balance,
    msg: &mut LineMessenger,
    refinable: &mut u32,
) {
    // savestack = <stack top>
    let f = ctx.fun;
    let Some(stack_top) = ctx.module.specials.stack_top_global else {
        return;
    };
    if f.load_of_global(inst) != Some(stack_top) {
        return;
    }
    let Some(user) = f.single_use(inst) else {
        return;
    };
    let InstKind::Store {
        dst: Place::Slot(slot),
        ..
    } = f.inst(user).kind
    else {
        return;
    };
    if !is_top_save_var(ctx, slot) {
        return;
    }
    let loc = &f.inst(inst).loc;
    if b.count_state == CountState::Diff {
        b.confuse(
            msg,
            "saves the stack-top pointer while in differential count state,",
            loc,
        );
        *refinable += 1;
        return;
    }
    b.saved_depth = b.depth;
    b.top_save_var = Some(slot);
}

fn handle_store(
    ctx: &FunctionCtx<'_>,
    inst: InstId,
    b: &mut Balance,
    msg: &mut LineMessenger,
    refinable: &mut u32,
) {
    let f = ctx.fun;
    let InstKind::Store { dst, value } = &f.inst(inst).kind else {
        return;
    };
    let loc = &f.inst(inst).loc;

    // <stack top> = ...
    let stack_top = ctx.module.specials.stack_top_global;
    if stack_top.is_some() && *dst == Place::Global(stack_top.unwrap()) {
        let restored_from = f
            .operand_inst(*value)
            .and_then(|i| f.load_of_slot(i))
            .filter(|slot| Some(*slot) == b.top_save_var);
        if restored_from.is_some() {
            if b.count_state == CountState::Diff {
                b.confuse(
                    msg,
                    "restores the stack-top pointer while in differential count state,",
                    loc,
                );
                return;
            }
            if b.saved_depth < 0 {
                msg.info(
                    &format!("{MSG_PFX}restores the stack-top pointer from an uninitialized local variable"),
                    loc,
                );
                *refinable += 1;
            } else if b.saved_depth > b.depth {
                msg.info(
                    &format!("{MSG_PFX}restores the stack-top pointer above the current depth"),
                    loc,
                );
                *refinable += 1;
            } else {
                b.depth = b.saved_depth;
            }
            return;
        }
        b.confuse(msg, "manipulates the stack-top pointer directly,", loc);
        return;
    }

    // counter = ...
    let Place::Slot(slot) = *dst else {
        return;
    };
    if !is_counter_var(ctx, slot) {
        return;
    }
    if !bind_counter_var(b, slot, msg, loc, refinable) {
        return;
    }
    if let Some(constant) = f.const_of(*value) {
        b.count = constant;
        b.count_state = CountState::Exact;
        if b.count < 0 {
            msg.info(&format!("{MSG_PFX}protection counter set to a negative value"), loc);
        } else if b.count > MAX_COUNT {
            // large exact counters cost too many states; fold into depth
            b.count_state = CountState::Diff;
            b.depth -= b.count as i32;
            b.count = -1;
        }
        return;
    }
    if let Some(addend) = add_of_slot_load(f, *value, slot) {
        match b.count_state {
            CountState::None => {
                msg.info(
                    &format!("{MSG_PFX}adds a constant to an uninitialized counter variable"),
                    loc,
                );
                *refinable += 1;
            }
            CountState::Exact => {
                b.count += addend;
                if b.count < 0 {
                    msg.info(
                        &format!("{MSG_PFX}protection counter went negative after add"),
                        loc,
                    );
                    *refinable += 1;
                } else if b.count > MAX_COUNT {
                    b.count_state = CountState::Diff;
                    b.depth -= b.count as i32;
                    b.count = -1;
                }
            }
            CountState::Diff => {
                b.depth -= addend as i32;
            }
        }
        return;
    }
    // unknown right-hand side: stop tracking the counter value
    b.count_state = CountState::None;
}

/// Apply the balance transfer for one non-terminator instruction.
///
/// When the integer-guard domain is enabled its values are consulted for
/// the conditional-unprotect pattern.
pub fn handle_inst(
    ctx: &FunctionCtx<'_>,
    inst: InstId,
    b: &mut Balance,
    int_guards: Option<&crate::int_guards::IntGuards>,
    msg: &mut LineMessenger,
    refinable: &mut u32,
) {
    if b.count_state != CountState::Diff && b.depth < 0 {
        // a negative-depth finding was already reported on this trace
        return;
    }
    if b.confused {
        return;
    }
    handle_call(ctx, inst, b, int_guards, msg, refinable);
    if b.confused {
        return;
    }
    handle_load(ctx, inst, b, msg, refinable);
    if b.confused {
        return;
    }
    handle_store(ctx, inst, b, msg, refinable);
}

/// Balance handling for a block terminator.
///
/// Returns the successor states when the terminator was consumed (return
/// imbalance check, or a branch folded on a known counter value); `None`
/// leaves successor generation to the caller.
pub fn handle_terminator(
    ctx: &FunctionCtx<'_>,
    s: &AbsState,
    msg: &mut LineMessenger,
    refinable: &mut u32,
    imbalance_allowed: bool,
) -> Option<Vec<AbsState>> {
    if s.balance.confused {
        // keep exploring for the other domains
        return None;
    }
    let f = ctx.fun;
    let block = &f.blocks[s.block];

    if let Terminator::Return { .. } = block.term {
        if s.balance.depth != 0 && !imbalance_allowed {
            msg.info(
                &format!(
                    "{MSG_PFX}has possible protection stack imbalance (net depth {})",
                    s.balance.depth
                ),
                &block.term_loc,
            );
            *refinable += 1;
        }
        return Some(Vec::new());
    }

    let Terminator::Branch {
        cond,
        on_true,
        on_false,
    } = block.term
    else {
        return None;
    };
    // if (counter <op> const) ...
    let cmp = f.operand_inst(cond)?;
    let InstKind::Cmp { op, lhs, rhs } = &f.inst(cmp).kind else {
        return None;
    };
    let (load_op, constant) = match (f.const_of(*lhs), f.const_of(*rhs)) {
        (Some(c), None) => (*rhs, c),
        (None, Some(c)) => (*lhs, c),
        _ => return None,
    };
    let slot = f.operand_inst(load_op).and_then(|i| f.load_of_slot(i))?;
    if !is_counter_var(ctx, slot) {
        return None;
    }

    let mut balance = s.balance.clone();
    let loc = &block.term_loc;
    if !bind_counter_var(&mut balance, slot, msg, loc, refinable) {
        return None;
    }
    match balance.count_state {
        CountState::None => {
            msg.info(
                &format!(
                    "{MSG_PFX}branches based on an uninitialized value of the protection counter variable"
                ),
                loc,
            );
            *refinable += 1;
            None
        }
        CountState::Exact => {
            // the branch folds: the counter value is known
            let taken = match op {
                CmpOp::Eq => balance.count == constant,
                CmpOp::Ne => balance.count != constant,
            };
            let succ = if taken { on_true } else { on_false };
            let mut next = s.fork(succ);
            next.balance = balance;
            Some(vec![next])
        }
        CountState::Diff => {
            // `if (n) unprotect(n)`: unprotect(0) is a no-op, so only the
            // unprotect arm needs to be explored
            if constant != 0 {
                return None;
            }
            let (unprotect_succ, join_succ) = match op {
                CmpOp::Eq => (on_false, on_true),
                CmpOp::Ne => (on_true, on_false),
            };
            if !is_counter_unprotect_block(ctx, unprotect_succ, slot, join_succ) {
                return None;
            }
            let mut next = s.fork(unprotect_succ);
            next.balance = balance;
            Some(vec![next])
        }
    }
}

/// Does `block` consist of exactly `unprotect(load(counter))` followed by
/// a jump to `join`?
fn is_counter_unprotect_block(
    ctx: &FunctionCtx<'_>,
    block: palisade_ir::module::BlockId,
    counter: SlotId,
    join: palisade_ir::module::BlockId,
) -> bool {
    let f = ctx.fun;
    let Some(unprotect) = ctx.module.specials.unprotect else {
        return false;
    };
    let b = &f.blocks[block];
    let [load, call] = b.insts.as_slice() else {
        return false;
    };
    if f.load_of_slot(*load) != Some(counter) {
        return false;
    }
    let Some((callee, args)) = f.as_call(*call) else {
        return false;
    };
    if callee != unprotect || args.len() != 1 || args[0] != Operand::Inst(*load) {
        return false;
    }
    matches!(b.term, Terminator::Jump { target } if target == join)
}
