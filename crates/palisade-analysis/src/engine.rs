//! Per-function fixpoint engine and the adaptive refinement controller.
//!
//! Each function is explored by a LIFO work list over interned abstract
//! states. A run starts with both guard domains disabled; when it produces
//! refinable findings, the run's diagnostics are discarded and the function
//! is re-analyzed with integer guards enabled, then with pointer guards as
//! well, until a run is clean or every precision is exhausted. The extra
//! precision is paid for only where a finding needs validating.

use std::collections::BTreeSet;

use palisade_ir::liveness::Liveness;
use palisade_ir::module::{BlockId, Function, FunctionId, Module};
use palisade_ir::summaries::AllocSummaries;
use tracing::{debug, warn};

use crate::diagnostics::{Diagnostic, LineMessenger};
use crate::state::{AbsState, SlotPredicateCache, StateSet};
use crate::{balance, fresh_vars, int_guards, sexp_guards};

/// Tuning knobs of the checker. The defaults are the reference shape.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Per-function cap on interned states; past it the function is
    /// abandoned.
    pub max_states: usize,
    /// Cap on the abstract protect stack depth.
    pub max_pstack: usize,
    /// Compare states structurally rather than by hash only.
    pub full_comparison: bool,
    /// At most one identical message per source line.
    pub unique_msgs: bool,
    /// Run the balance and fresh-variable checks as two separate passes.
    pub separate_checking: bool,
    /// Skip the protection primitives themselves; they are imbalanced by
    /// design.
    pub exclude_protection_functions: bool,
    /// Treat possible-allocator results as non-nil pointer guards.
    /// Over-approximates nullability.
    pub use_allocator_detection: bool,
    /// Functions that must not be re-analyzed with integer guards.
    pub avoid_int_guards: BTreeSet<String>,
    /// Functions that must not be re-analyzed with pointer guards.
    pub avoid_sexp_guards: BTreeSet<String>,
    /// Functions allowed to exit with a non-zero net depth.
    pub imbalance_allowed: BTreeSet<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            max_states: 100_000,
            max_pstack: 64,
            full_comparison: true,
            unique_msgs: true,
            separate_checking: false,
            exclude_protection_functions: true,
            use_allocator_detection: true,
            avoid_int_guards: BTreeSet::new(),
            avoid_sexp_guards: BTreeSet::new(),
            imbalance_allowed: BTreeSet::new(),
        }
    }
}

/// Everything the transfer functions need about the function under
/// analysis. Created once per function; the recognizer caches live here.
pub struct FunctionCtx<'a> {
    pub module: &'a Module,
    pub fun: &'a Function,
    pub fid: FunctionId,
    pub summaries: &'a AllocSummaries,
    pub config: &'a AnalysisConfig,
    pub liveness: Liveness,
    pub error_blocks: BTreeSet<BlockId>,
    pub counter_vars: SlotPredicateCache,
    pub save_vars: SlotPredicateCache,
    pub int_guard_vars: SlotPredicateCache,
    pub sexp_guard_vars: SlotPredicateCache,
    pub checked_fresh: SlotPredicateCache,
}

impl<'a> FunctionCtx<'a> {
    pub fn new(
        module: &'a Module,
        fid: FunctionId,
        summaries: &'a AllocSummaries,
        error_fns: &BTreeSet<FunctionId>,
        config: &'a AnalysisConfig,
    ) -> Self {
        let fun = module.function(fid);
        FunctionCtx {
            module,
            fun,
            fid,
            summaries,
            config,
            liveness: Liveness::compute(fun),
            error_blocks: crate::error_paths::error_blocks(fun, error_fns),
            counter_vars: SlotPredicateCache::default(),
            save_vars: SlotPredicateCache::default(),
            int_guard_vars: SlotPredicateCache::default(),
            sexp_guard_vars: SlotPredicateCache::default(),
            checked_fresh: SlotPredicateCache::default(),
        }
    }
}

/// Which checks a run performs.
#[derive(Debug, Clone, Copy)]
struct RunChecks {
    balance: bool,
    fresh: bool,
    int_guards: bool,
    sexp_guards: bool,
}

/// Outcome of a whole-module analysis.
#[derive(Debug)]
pub struct AnalysisReport {
    pub diagnostics: Vec<Diagnostic>,
    pub functions_analyzed: usize,
    /// Total interned states across all runs, including discarded ones.
    pub states_visited: usize,
    /// Functions abandoned because they exceeded the state cap.
    pub functions_aborted: usize,
}

/// One fixpoint run at fixed precision. Returns the number of refinable
/// findings; when the caller can still escalate, the run aborts at the
/// first one.
fn run_once(
    ctx: &FunctionCtx<'_>,
    checks: RunChecks,
    restartable: bool,
    msg: &mut LineMessenger,
    report: &mut AnalysisReport,
) -> u32 {
    let mut refinable: u32 = 0;
    let mut states = StateSet::new(ctx.config.max_states, ctx.config.full_comparison);
    states.add(AbsState::entry(ctx.fun.entry()));
    let imbalance_allowed = ctx.config.imbalance_allowed.contains(&ctx.fun.name);

    while let Some(mut s) = states.pop() {
        if restartable && refinable > 0 {
            break;
        }
        if ctx.error_blocks.contains(&s.block) {
            continue;
        }
        if states.over_budget() {
            warn!(
                function = ctx.fun.name.as_str(),
                states = states.visited(),
                "too many states, abandoning function"
            );
            report.functions_aborted += 1;
            break;
        }

        for &inst in &ctx.fun.blocks[s.block].insts {
            if checks.fresh {
                // must precede balance: it peeks at the counter state the
                // balance transfer is about to advance
                let AbsState {
                    balance,
                    fresh,
                    int_guards,
                    ..
                } = &mut s;
                let guards = checks.int_guards.then_some(&*int_guards);
                fresh_vars::handle_inst(ctx, inst, balance, guards, fresh, msg, &mut refinable);
            }
            if checks.balance {
                let AbsState {
                    balance,
                    int_guards,
                    ..
                } = &mut s;
                let guards = checks.int_guards.then_some(&*int_guards);
                balance::handle_inst(ctx, inst, balance, guards, msg, &mut refinable);
            }
            if checks.int_guards {
                int_guards::handle_inst(ctx, inst, &mut s.int_guards);
            }
            if checks.sexp_guards {
                sexp_guards::handle_inst(ctx, inst, &mut s);
            }
            if restartable && refinable > 0 {
                break;
            }
        }
        if restartable && refinable > 0 {
            break;
        }

        // terminator precedence: balance folds counter branches before the
        // int-guard domain sees them
        let handled = checks
            .balance
            .then(|| balance::handle_terminator(ctx, &s, msg, &mut refinable, imbalance_allowed))
            .flatten()
            .or_else(|| {
                checks
                    .sexp_guards
                    .then(|| sexp_guards::handle_terminator(ctx, &s))
                    .flatten()
            })
            .or_else(|| {
                checks
                    .int_guards
                    .then(|| int_guards::handle_terminator(ctx, &s))
                    .flatten()
            });
        match handled {
            Some(succs) => {
                for succ in succs {
                    states.add(succ);
                }
            }
            None => {
                for succ in ctx.fun.blocks[s.block].term.successors() {
                    states.add(s.fork(succ));
                }
            }
        }
    }
    report.states_visited += states.visited();
    refinable
}

/// Analyze one function with adaptive refinement.
fn check_function(
    ctx: &FunctionCtx<'_>,
    balance_on: bool,
    fresh_on: bool,
    checks_name: &str,
    msg: &mut LineMessenger,
    report: &mut AnalysisReport,
) {
    msg.start_function(&format!("{}{}", ctx.fun.name, checks_name));
    let avoid_int = ctx.config.avoid_int_guards.contains(&ctx.fun.name);
    let avoid_sexp = ctx.config.avoid_sexp_guards.contains(&ctx.fun.name);
    let mut int_on = false;
    let mut sexp_on = false;
    loop {
        let restartable = (!int_on && !avoid_int) || (!sexp_on && !avoid_sexp);
        let checks = RunChecks {
            balance: balance_on,
            fresh: fresh_on,
            int_guards: int_on,
            sexp_guards: sexp_on,
        };
        let refinable = run_once(ctx, checks, restartable, msg, report);
        if restartable && refinable > 0 {
            debug!(
                function = ctx.fun.name.as_str(),
                refinable, int_on, sexp_on, "refinable findings, restarting with more precision"
            );
            msg.clear();
            if !int_on && !avoid_int {
                int_on = true;
            } else {
                sexp_on = true;
            }
        } else {
            break;
        }
    }
}

/// Run the protection checks over every function of interest.
pub fn analyze_module(
    module: &Module,
    config: &AnalysisConfig,
    filter: Option<&str>,
) -> AnalysisReport {
    let summaries = AllocSummaries::compute(module);
    let error_fns = crate::error_paths::find_error_functions(module);
    let mut msg = LineMessenger::new(config.unique_msgs);
    let mut report = AnalysisReport {
        diagnostics: Vec::new(),
        functions_analyzed: 0,
        states_visited: 0,
        functions_aborted: 0,
    };

    for (fid, fun) in module.functions.iter().enumerate() {
        if fun.is_declaration() {
            continue;
        }
        if let Some(name) = filter {
            if fun.name != name {
                continue;
            }
        }
        if config.exclude_protection_functions
            && (module.specials.is_protection_primitive(fid)
                || module.specials.preserve_object == Some(fid))
        {
            continue;
        }
        report.functions_analyzed += 1;
        let ctx = FunctionCtx::new(module, fid, &summaries, &error_fns, config);
        if config.separate_checking {
            check_function(&ctx, true, false, " [protection balance]", &mut msg, &mut report);
            check_function(&ctx, false, true, " [unprotected pointers]", &mut msg, &mut report);
        } else {
            check_function(&ctx, true, true, "", &mut msg, &mut report);
        }
    }

    report.diagnostics = msg.take();
    report
}
