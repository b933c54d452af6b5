//! Fresh-variable domain.
//!
//! Tracks which local slots hold a just-allocated object, an abstract
//! protect stack of those slots, and the delayed diagnostics attached to
//! them. A slot is dangerous while its protect count is zero and an
//! allocating call is issued: the collector may move or free the object
//! behind the pointer. Whether that is worth reporting depends on what
//! happens next, so most findings here start out conditional and only
//! materialize when the variable is read again or is definitely live.

use std::collections::{BTreeMap, BTreeSet};

use palisade_ir::module::{
    Function, InstId, InstKind, Operand, Place, SlotAccess, SlotId, SlotKind,
};
use tracing::debug;

use crate::balance::{self, Balance, CountState, UnprotectArg};
use crate::diagnostics::{DelayedMessages, LineMessenger, Severity};
use crate::engine::FunctionCtx;
use crate::int_guards::IntGuards;

/// Fresh-variable domain value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FreshVars {
    /// Possibly-fresh slots and their protect counts.
    pub vars: BTreeMap<SlotId, u32>,
    /// Abstract protection stack; `None` entries are anonymous values.
    pub protect_stack: Vec<Option<SlotId>>,
    /// Delayed diagnostics keyed by the variable they blame.
    pub cond_msgs: BTreeMap<SlotId, DelayedMessages>,
    /// The abstraction broke down on this trace; stay quiet.
    pub confused: bool,
}

impl FreshVars {
    /// Drop the whole abstract stack and zero every protect count.
    fn unprotect_all(&mut self) {
        self.protect_stack.clear();
        for count in self.vars.values_mut() {
            *count = 0;
        }
    }
}

/// Only slots with purely load/store uses are tracked; anything whose
/// address escapes could be protected behind our back.
pub fn is_checked_fresh(ctx: &FunctionCtx<'_>, slot: SlotId) -> bool {
    ctx.checked_fresh.get_or_compute(slot, || {
        let f = ctx.fun;
        f.slots[slot].kind == SlotKind::Sexp
            && f
                .slot_uses(slot)
                .iter()
                .all(|&u| !matches!(f.slot_access(u, slot), Some(SlotAccess::Escape)))
    })
}

/// Identify the local slot a call argument stands for: `f(x)` loads the
/// slot directly, `f(x = g())` stores into it, and `x = f(g())` stores the
/// call's own result.
fn call_arg_var(f: &Function, call: InstId, arg: Option<Operand>) -> Option<SlotId> {
    if let Some(arg) = arg {
        if let Some(slot) = f.operand_inst(arg).and_then(|i| f.load_of_slot(i)) {
            return Some(slot);
        }
        if let Some(inst) = f.operand_inst(arg) {
            for &u in f.uses(inst) {
                if let InstKind::Store {
                    dst: Place::Slot(slot),
                    ..
                } = f.inst(u).kind
                {
                    return Some(slot);
                }
            }
        }
    }
    for &u in f.uses(call) {
        if let InstKind::Store {
            dst: Place::Slot(slot),
            ..
        } = f.inst(u).kind
        {
            return Some(slot);
        }
    }
    None
}

/// Slots passed to this call in pointer parameter positions.
fn passed_vars(f: &Function, callee: &Function, args: &[Operand]) -> BTreeSet<SlotId> {
    let mut passed = BTreeSet::new();
    for (i, &arg) in args.iter().enumerate() {
        if let Some(kind) = callee.params.get(i) {
            // varargs tails fall outside the declared parameter list
            if *kind != SlotKind::Sexp {
                continue;
            }
        }
        let Some(inst) = f.operand_inst(arg) else {
            continue;
        };
        if let Some(slot) = f.load_of_slot(inst) {
            passed.insert(slot);
            continue;
        }
        for &u in f.uses(inst) {
            if let InstKind::Store {
                dst: Place::Slot(slot),
                ..
            } = f.inst(u).kind
            {
                passed.insert(slot);
            }
        }
    }
    passed
}

/// Drop dead fresh variables, and materialize pending diagnostics for
/// variables that can no longer be overwritten before their next read.
fn prune_fresh_vars(
    ctx: &FunctionCtx<'_>,
    inst: InstId,
    fv: &mut FreshVars,
    msg: &mut LineMessenger,
    refinable: &mut u32,
) {
    let slots: Vec<SlotId> = fv.vars.keys().copied().collect();
    for slot in slots {
        if !ctx.liveness.possibly_used(inst, slot) {
            fv.vars.remove(&slot);
            fv.cond_msgs.remove(&slot);
            continue;
        }
        if !ctx.liveness.possibly_killed(inst, slot) {
            if let Some(pending) = fv.cond_msgs.remove(&slot) {
                pending.flush(msg);
                *refinable += 1;
            }
        }
    }
}

fn handle_call(
    ctx: &FunctionCtx<'_>,
    inst: InstId,
    balance: &Balance,
    int_guards: Option<&IntGuards>,
    fv: &mut FreshVars,
    msg: &mut LineMessenger,
    refinable: &mut u32,
) {
    let f = ctx.fun;
    let Some((callee, args)) = f.as_call(inst) else {
        return;
    };
    let sp = &ctx.module.specials;
    let loc = &f.inst(inst).loc;
    let first_arg = args.first().copied();

    if sp.preserve_object == Some(callee) {
        if let Some(slot) = call_arg_var(f, inst, first_arg) {
            fv.vars.remove(&slot);
            debug!(slot, "variable preserved, no longer fresh");
        }
        return;
    }

    if sp.is_protecting(callee) {
        if fv.protect_stack.len() >= ctx.config.max_pstack {
            msg.info("protect stack is too deep, unprotecting all variables", loc);
            *refinable += 1;
            fv.unprotect_all();
            fv.confused = true;
            return;
        }
        let var = call_arg_var(f, inst, first_arg).filter(|&v| is_checked_fresh(ctx, v));
        fv.protect_stack.push(var);
        if let Some(slot) = var {
            match fv.vars.get_mut(&slot) {
                Some(count) => *count += 1,
                None => {
                    // protecting a non-fresh variable signals intent: on
                    // release it should be treated as fresh again
                    fv.vars.insert(slot, 1);
                }
            }
        }
        return;
    }

    if sp.reprotect == Some(callee) {
        if let Some(slot) =
            call_arg_var(f, inst, first_arg).filter(|&v| is_checked_fresh(ctx, v))
        {
            let count = fv.vars.entry(slot).or_insert(0);
            if *count == 0 {
                *count = 1;
            }
        }
        return;
    }

    if sp.unprotect == Some(callee) || sp.unprotect_ptr == Some(callee) {
        let amount = if sp.unprotect_ptr == Some(callee) {
            Some(1)
        } else {
            match first_arg.map(|a| balance::parse_unprotect_arg(ctx, a)) {
                Some(UnprotectArg::Constant(k)) => Some(k),
                Some(UnprotectArg::Counter { addend, .. })
                    if balance.count_state == CountState::Exact =>
                {
                    Some(balance.count + addend)
                }
                _ => first_arg.zip(int_guards).and_then(|(a, guards)| {
                    crate::int_guards::select_unprotect_amount(ctx, a, guards)
                }),
            }
        };
        let Some(amount) = amount else {
            msg.info("unsupported form of unprotect, unprotecting all variables", loc);
            *refinable += 1;
            fv.unprotect_all();
            fv.confused = true;
            return;
        };
        if amount < 0 || amount as usize > fv.protect_stack.len() {
            msg.info(
                &format!(
                    "attempt to unprotect more items ({amount}) than protected ({}), results will be incorrect",
                    fv.protect_stack.len()
                ),
                loc,
            );
            *refinable += 1;
            fv.confused = true;
            return;
        }
        for _ in 0..amount {
            let top = fv.protect_stack.pop().expect("stack size checked above");
            if let Some(slot) = top {
                if let Some(count) = fv.vars.get_mut(&slot) {
                    // clamping at zero is a deliberate heuristic
                    *count = count.saturating_sub(1);
                }
            }
        }
        return;
    }

    if !ctx.summaries.may_allocate(callee) {
        return;
    }
    let callee_fun = ctx.module.function(callee);

    // an argument freshly allocated by a nested call is endangered by the
    // surrounding call's other allocations
    if !callee_fun.protects_all_pointer_args() {
        for (i, &arg) in args.iter().enumerate() {
            let Some((src, _)) = f.operand_inst(arg).and_then(|a| f.as_call(a)) else {
                continue;
            };
            if !ctx.summaries.may_return_fresh(src) || callee_fun.is_safe_arg(i) {
                continue;
            }
            msg.info(
                &format!(
                    "calling allocating function {} with argument allocated using {}",
                    callee_fun.name,
                    ctx.module.function(src).name
                ),
                loc,
            );
            *refinable += 1;
        }
    }

    prune_fresh_vars(ctx, inst, fv, msg, refinable);
    if fv.vars.is_empty() {
        return;
    }

    let passed = passed_vars(f, callee_fun, args);
    let slots: Vec<SlotId> = fv.vars.keys().copied().collect();
    for slot in slots {
        if fv.vars[&slot] > 0 || passed.contains(&slot) {
            continue;
        }
        let text = format!(
            "unprotected variable {} while calling allocating function {}",
            f.slot_name(slot),
            callee_fun.name
        );
        if ctx.liveness.definitely_used(inst, slot) {
            msg.info(&text, loc);
            *refinable += 1;
        } else {
            let id = msg.intern(Severity::Info, &text, loc);
            fv.cond_msgs.entry(slot).or_default().push(id);
        }
    }
}

fn handle_load(
    ctx: &FunctionCtx<'_>,
    inst: InstId,
    fv: &mut FreshVars,
    msg: &mut LineMessenger,
    refinable: &mut u32,
) {
    let f = ctx.fun;
    let Some(slot) = f.load_of_slot(inst) else {
        return;
    };

    // reading the variable makes any pending diagnostics real
    if let Some(pending) = fv.cond_msgs.remove(&slot) {
        pending.flush(msg);
        *refinable += 1;
    }

    let Some(&count) = fv.vars.get(&slot) else {
        return;
    };

    for &user in f.uses(inst) {
        if let Some((callee, args)) = f.as_call(user) {
            // a setter adopts the value into its first argument's object,
            // provided that container is itself not fresh
            if ctx.module.specials.is_setter(callee) && args.len() > 1 {
                let container = args
                    .first()
                    .and_then(|&a| f.operand_inst(a))
                    .and_then(|i| f.load_of_slot(i));
                if let Some(container) = container {
                    if !fv.vars.contains_key(&container) {
                        debug!(slot, "fresh variable passed to setter, no longer fresh");
                        fv.vars.remove(&slot);
                        return;
                    }
                }
            }
            continue;
        }
        if let InstKind::Store { dst, value } = &f.inst(user).kind {
            // a store into a global or into a location derived from
            // another object usually protects implicitly
            if f.operand_inst(*value) == Some(inst) && !matches!(dst, Place::Slot(_)) {
                debug!(slot, "fresh variable stored into non-local location");
                fv.vars.remove(&slot);
                return;
            }
        }
    }

    // fresh pointer handed straight to an allocating callee
    let Some(user) = f.single_use(inst) else {
        return;
    };
    let Some((callee, args)) = f.as_call(user) else {
        return;
    };
    let callee_fun = ctx.module.function(callee);
    if !ctx.summaries.may_allocate(callee) || callee_fun.protects_all_pointer_args() {
        return;
    }
    let arg_index = args.iter().position(|&a| f.operand_inst(a) == Some(inst));
    if let Some(i) = arg_index {
        if callee_fun.is_safe_arg(i) {
            return;
        }
    }
    if count > 0 {
        return;
    }
    let name = if f.slots[slot].name.is_empty() {
        match arg_index {
            Some(i) => format!("{} <arg {}>", f.slot_name(slot), i + 1),
            None => f.slot_name(slot),
        }
    } else {
        f.slot_name(slot)
    };
    msg.info(
        &format!(
            "calling allocating function {} with a fresh pointer ({name})",
            callee_fun.name
        ),
        &f.inst(user).loc,
    );
    *refinable += 1;
}

/// Is `target` a cell of the interpreter's node stack?
fn is_node_stack_cell(ctx: &FunctionCtx<'_>, target: InstId) -> bool {
    let Some(node_stack) = ctx.module.specials.node_stack_global else {
        return false;
    };
    let f = ctx.fun;
    let base = match &f.inst(target).kind {
        InstKind::Field { base, .. } => match f.operand_inst(*base) {
            Some(inst) => inst,
            None => return false,
        },
        _ => target,
    };
    f.load_of_global(base) == Some(node_stack)
}

fn handle_store(ctx: &FunctionCtx<'_>, inst: InstId, fv: &mut FreshVars) {
    let f = ctx.fun;
    let InstKind::Store { dst, value } = &f.inst(inst).kind else {
        return;
    };

    // pushing onto the node stack protects the pushed value
    if let Place::Deref(target) = dst {
        if is_node_stack_cell(ctx, *target) {
            if let Some(load) = f.operand_inst(*value) {
                if let Some(stored_slot) = f.load_of_slot(load) {
                    fv.vars.remove(&stored_slot);
                    // a sibling store of the same loaded value is a
                    // shallow alias and is protected too
                    for &u in f.uses(load) {
                        if let InstKind::Store {
                            dst: Place::Slot(alias),
                            ..
                        } = f.inst(u).kind
                        {
                            fv.vars.remove(&alias);
                        }
                    }
                }
            }
        }
        return;
    }

    let Place::Slot(slot) = *dst else {
        return;
    };

    // the overwrite makes pending diagnostics stale
    fv.cond_msgs.remove(&slot);

    if let Some((src, _)) = f.operand_inst(*value).and_then(|i| f.as_call(i)) {
        let sp = &ctx.module.specials;
        if sp.is_protecting(src) || sp.reprotect == Some(src) {
            // x = protect(...) is handled at the call itself
            return;
        }
        if ctx.summaries.may_return_fresh(src) {
            let result = f.operand_inst(*value).expect("checked above");
            for &u in f.uses(result) {
                if u == inst {
                    continue;
                }
                if let Some((other, other_args)) = f.as_call(u) {
                    if sp.is_protecting(other) || sp.reprotect == Some(other) {
                        // protect(x = alloc()) is handled at the call
                        return;
                    }
                    if sp.is_setter(other) && other_args.len() > 1 {
                        // setter wins when its container is not fresh
                        let container = other_args
                            .first()
                            .and_then(|&a| f.operand_inst(a))
                            .and_then(|i| f.load_of_slot(i));
                        if let Some(container) = container {
                            if !fv.vars.contains_key(&container) {
                                fv.vars.remove(&slot);
                                return;
                            }
                        }
                    }
                }
            }
            if is_checked_fresh(ctx, slot) {
                fv.vars.insert(slot, 0);
                debug!(slot, "initialized fresh variable");
                return;
            }
        }
    }

    // a projection of a fresh object is as endangered as the object
    if let Some(field) = f.operand_inst(*value) {
        if let InstKind::Field { base, .. } = &f.inst(field).kind {
            let base_slot = f.operand_inst(*base).and_then(|i| f.load_of_slot(i));
            if let Some(base_slot) = base_slot {
                if fv.vars.get(&base_slot) == Some(&0) && is_checked_fresh(ctx, slot) {
                    fv.vars.insert(slot, 0);
                    return;
                }
            }
        }
    }

    fv.vars.remove(&slot);
}

/// Apply the fresh-variable transfer for one non-terminator instruction.
///
/// Must run before the balance transfer: the unprotect-through-counter
/// case reads the counter value the balance transfer is about to consume.
pub fn handle_inst(
    ctx: &FunctionCtx<'_>,
    inst: InstId,
    balance: &Balance,
    int_guards: Option<&IntGuards>,
    fv: &mut FreshVars,
    msg: &mut LineMessenger,
    refinable: &mut u32,
) {
    if fv.confused {
        return;
    }
    handle_call(ctx, inst, balance, int_guards, fv, msg, refinable);
    handle_load(ctx, inst, fv, msg, refinable);
    handle_store(ctx, inst, fv);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unprotect_all_zeroes_counts_and_clears_stack() {
        let mut fv = FreshVars::default();
        fv.vars.insert(1, 2);
        fv.vars.insert(2, 0);
        fv.protect_stack.push(Some(1));
        fv.protect_stack.push(None);
        fv.unprotect_all();
        assert!(fv.protect_stack.is_empty());
        assert_eq!(fv.vars[&1], 0);
        assert_eq!(fv.vars[&2], 0);
    }

    #[test]
    fn fresh_vars_hash_includes_stack_order() {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut a = FreshVars::default();
        a.protect_stack = vec![Some(1), Some(2)];
        let mut b = FreshVars::default();
        b.protect_stack = vec![Some(2), Some(1)];
        let hash = |v: &FreshVars| {
            let mut h = DefaultHasher::new();
            v.hash(&mut h);
            h.finish()
        };
        assert_ne!(hash(&a), hash(&b));
    }
}
