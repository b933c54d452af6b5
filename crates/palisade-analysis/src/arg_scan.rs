//! Multi-allocating-argument scanner.
//!
//! Calls such as `cons(install("x"), scalar_int(1))` are a classic
//! protection bug: it does not matter that the callee protects its
//! arguments, because if the second argument is evaluated first, the
//! first argument's allocation can move it before the call even starts.
//! This pass flags any call with at least two allocating arguments of
//! which at least one may be a fresh object. It needs only the call-graph
//! summaries, not the abstract interpreter.

use palisade_ir::module::{Function, InstKind, Module, Operand};
use palisade_ir::summaries::AllocSummaries;

use crate::diagnostics::{Diagnostic, Severity};
use crate::error_paths;

/// Allocation class of one argument expression, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ArgKind {
    /// No allocation.
    NoAlloc,
    /// Allocates, but does not hand back a fresh object.
    Allocating,
    /// Allocates and may hand back a fresh object.
    Fresh,
}

fn classify_operand(f: &Function, op: Operand, summaries: &AllocSummaries) -> ArgKind {
    let Some(inst) = f.operand_inst(op) else {
        return ArgKind::NoAlloc;
    };
    match &f.inst(inst).kind {
        InstKind::Call { callee, .. } => {
            if summaries.may_return_fresh(*callee) {
                ArgKind::Fresh
            } else if summaries.may_allocate(*callee) {
                ArgKind::Allocating
            } else {
                ArgKind::NoAlloc
            }
        }
        // a joined value is as bad as its worst incoming alternative
        InstKind::Phi { incoming } => incoming
            .iter()
            .map(|(_, op)| classify_operand_shallow(f, *op, summaries))
            .max()
            .unwrap_or(ArgKind::NoAlloc),
        _ => ArgKind::NoAlloc,
    }
}

/// Phi operands are classified one level deep only.
fn classify_operand_shallow(f: &Function, op: Operand, summaries: &AllocSummaries) -> ArgKind {
    let Some(inst) = f.operand_inst(op) else {
        return ArgKind::NoAlloc;
    };
    match &f.inst(inst).kind {
        InstKind::Call { callee, .. } => {
            if summaries.may_return_fresh(*callee) {
                ArgKind::Fresh
            } else if summaries.may_allocate(*callee) {
                ArgKind::Allocating
            } else {
                ArgKind::NoAlloc
            }
        }
        _ => ArgKind::NoAlloc,
    }
}

/// Scan every call in every function of interest; error paths are skipped.
pub fn scan_module(module: &Module, filter: Option<&str>) -> Vec<Diagnostic> {
    let summaries = AllocSummaries::compute(module);
    let error_fns = error_paths::find_error_functions(module);
    let mut out = Vec::new();

    for fun in &module.functions {
        if fun.is_declaration() {
            continue;
        }
        if let Some(name) = filter {
            if fun.name != name {
                continue;
            }
        }
        let error_blocks = error_paths::error_blocks(fun, &error_fns);
        for (bid, block) in fun.blocks.iter().enumerate() {
            if error_blocks.contains(&bid) {
                continue;
            }
            for &inst in &block.insts {
                let InstKind::Call { callee, args } = &fun.inst(inst).kind else {
                    continue;
                };
                let mut allocating = 0u32;
                let mut fresh = 0u32;
                for &arg in args {
                    let kind = classify_operand(fun, arg, &summaries);
                    if kind >= ArgKind::Allocating {
                        allocating += 1;
                    }
                    if kind == ArgKind::Fresh {
                        fresh += 1;
                    }
                }
                if allocating >= 2 && fresh >= 1 {
                    let loc = &fun.inst(inst).loc;
                    out.push(Diagnostic {
                        severity: Severity::Warning,
                        function: fun.name.clone(),
                        file: loc.file.clone(),
                        line: loc.line,
                        message: format!(
                            "suspicious call (two or more unprotected arguments) to {}",
                            module.function(*callee).name
                        ),
                    });
                }
            }
        }
    }
    out
}
