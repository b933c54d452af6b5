//! Error-path analysis.
//!
//! An error function is one from which no return is reachable (it
//! terminates the process or long-jumps out). An error block is a block
//! all of whose paths end in a call to an error function; the fixpoint
//! engine skips such blocks, since findings on them would be noise.

use std::collections::BTreeSet;

use palisade_ir::module::{BlockId, Function, FunctionId, InstKind, Module, Terminator};

/// Blocks of `f` that can reach a regular return.
fn returning_blocks(f: &Function, error_fns: &BTreeSet<FunctionId>) -> BTreeSet<BlockId> {
    let mut error_blocks = BTreeSet::new();
    let mut returning = BTreeSet::new();
    for (id, block) in f.blocks.iter().enumerate() {
        if matches!(block.term, Terminator::Unreachable) {
            error_blocks.insert(id);
            continue;
        }
        let calls_error = block.insts.iter().any(|&i| match &f.inst(i).kind {
            InstKind::Call { callee, .. } => error_fns.contains(callee),
            _ => false,
        });
        if calls_error {
            error_blocks.insert(id);
            continue;
        }
        if matches!(block.term, Terminator::Return { .. }) {
            returning.insert(id);
        }
    }
    // propagate backwards: a block with a returning successor returns
    let mut changed = !returning.is_empty();
    while changed {
        changed = false;
        for (id, block) in f.blocks.iter().enumerate() {
            if error_blocks.contains(&id) || returning.contains(&id) {
                continue;
            }
            if block
                .term
                .successors()
                .iter()
                .any(|s| returning.contains(s))
            {
                returning.insert(id);
                changed = true;
            }
        }
    }
    returning
}

/// Is `f` an error function: no return reachable from its entry?
pub fn is_error_function(f: &Function, known: &BTreeSet<FunctionId>) -> bool {
    if f.is_declaration() {
        return false;
    }
    !returning_blocks(f, known).contains(&f.entry())
}

/// All blocks of `f` from which every path dies in an error call.
pub fn error_blocks(f: &Function, error_fns: &BTreeSet<FunctionId>) -> BTreeSet<BlockId> {
    let returning = returning_blocks(f, error_fns);
    (0..f.blocks.len())
        .filter(|b| !returning.contains(b))
        .collect()
}

/// Close the seed set of error functions over the module: a function whose
/// every path calls into a known error function is itself one.
pub fn find_error_functions(module: &Module) -> BTreeSet<FunctionId> {
    let mut error_fns = module.specials.error_functions.clone();
    let mut changed = true;
    while changed {
        changed = false;
        for (id, f) in module.functions.iter().enumerate() {
            if f.is_declaration() || error_fns.contains(&id) {
                continue;
            }
            if is_error_function(f, &error_fns) {
                error_fns.insert(id);
                changed = true;
            }
        }
    }
    error_fns
}
