//! End-to-end scenarios for the joint balance / fresh-pointer checker.
//!
//! Each test assembles a small synthetic function and asserts the exact
//! findings the checker reports for it.

mod common;

use common::{check, check_with, fixture, messages};
use palisade_analysis::engine::AnalysisConfig;
use palisade_ir::module::{CmpOp, Operand, SlotKind};

// ---------------------------------------------------------------
// Balance
// ---------------------------------------------------------------

#[test]
fn balanced_function_is_clean() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("f");
    let x = fb.slot("x", SlotKind::Sexp);
    let v = fb.call(fx.alloc, vec![]);
    fb.store(x, Operand::Inst(v));
    let l1 = fb.load(x);
    fb.call(fx.rt.protect, vec![Operand::Inst(l1)]);
    let l2 = fb.load(x);
    fb.call(fx.use_fn, vec![Operand::Inst(l2)]);
    fb.call(fx.rt.unprotect, vec![Operand::Const(1)]);
    fb.ret(None);
    fb.finish();

    assert!(check(&fx.mb.finish()).is_empty());
}

#[test]
fn missing_unprotect_reports_imbalance() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("f");
    let x = fb.slot("x", SlotKind::Sexp);
    let v = fb.call(fx.alloc, vec![]);
    fb.store(x, Operand::Inst(v));
    let l = fb.load(x);
    fb.call(fx.rt.protect, vec![Operand::Inst(l)]);
    fb.ret(None);
    fb.finish();

    let found = check(&fx.mb.finish());
    assert_eq!(
        messages(&found),
        vec!["[PB] has possible protection stack imbalance (net depth 1)"]
    );
}

#[test]
fn unprotect_without_protect_reports_negative_depth() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("f");
    fb.call(fx.rt.unprotect, vec![Operand::Const(1)]);
    fb.ret(None);
    fb.finish();

    let found = check(&fx.mb.finish());
    let texts = messages(&found);
    assert!(texts.contains(&"[PB] has negative depth".to_string()));
    // the fresh-pointer domain independently reports the over-pop
    assert!(texts
        .iter()
        .any(|t| t.starts_with("attempt to unprotect more items (1) than protected (0)")));
    assert_eq!(found.len(), 2);
}

#[test]
fn imbalance_allowlist_suppresses_the_finding() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("push_one");
    let x = fb.slot("x", SlotKind::Sexp);
    let l = fb.load(x);
    fb.call(fx.rt.protect, vec![Operand::Inst(l)]);
    fb.ret(None);
    fb.finish();
    let module = fx.mb.finish();

    let mut config = AnalysisConfig::default();
    config.imbalance_allowed.insert("push_one".into());
    assert!(check_with(&module, &config).is_empty());
}

#[test]
fn exact_counter_balances_unprotect() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("f");
    let x = fb.slot("x", SlotKind::Sexp);
    let n = fb.slot("nprotect", SlotKind::Int);
    let l1 = fb.load(x);
    fb.call(fx.rt.protect, vec![Operand::Inst(l1)]);
    let l2 = fb.load(x);
    fb.call(fx.rt.protect, vec![Operand::Inst(l2)]);
    fb.store(n, Operand::Const(2));
    let ln = fb.load(n);
    fb.call(fx.rt.unprotect, vec![Operand::Inst(ln)]);
    fb.ret(None);
    fb.finish();

    assert!(check(&fx.mb.finish()).is_empty());
}

#[test]
fn counter_increments_are_tracked() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("f");
    let x = fb.slot("x", SlotKind::Sexp);
    let n = fb.slot("nprotect", SlotKind::Int);
    fb.store(n, Operand::Const(0));
    let l1 = fb.load(x);
    fb.call(fx.rt.protect, vec![Operand::Inst(l1)]);
    let ln1 = fb.load(n);
    let bumped = fb.add(Operand::Inst(ln1), Operand::Const(1));
    fb.store(n, Operand::Inst(bumped));
    let ln2 = fb.load(n);
    fb.call(fx.rt.unprotect, vec![Operand::Inst(ln2)]);
    fb.ret(None);
    fb.finish();

    assert!(check(&fx.mb.finish()).is_empty());
}

#[test]
fn unprotect_counter_plus_constant() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("f");
    let x = fb.slot("x", SlotKind::Sexp);
    let n = fb.slot("nprotect", SlotKind::Int);
    fb.store(n, Operand::Const(1));
    for _ in 0..3 {
        let l = fb.load(x);
        fb.call(fx.rt.protect, vec![Operand::Inst(l)]);
    }
    let ln = fb.load(n);
    let total = fb.add(Operand::Inst(ln), Operand::Const(2));
    fb.call(fx.rt.unprotect, vec![Operand::Inst(total)]);
    fb.ret(None);
    fb.finish();

    assert!(check(&fx.mb.finish()).is_empty());
}

#[test]
fn stack_top_save_restore_resets_depth() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("f");
    let x = fb.slot("x", SlotKind::Sexp);
    let save = fb.slot("savestack", SlotKind::Other);
    let top = fb.load_global(fx.rt.stack_top);
    fb.store(save, Operand::Inst(top));
    let l1 = fb.load(x);
    fb.call(fx.rt.protect, vec![Operand::Inst(l1)]);
    let l2 = fb.load(x);
    fb.call(fx.rt.protect, vec![Operand::Inst(l2)]);
    let restored = fb.load(save);
    fb.store_global(fx.rt.stack_top, Operand::Inst(restored));
    fb.ret(None);
    fb.finish();

    assert!(check(&fx.mb.finish()).is_empty());
}

#[test]
fn direct_stack_top_write_confuses_and_reports() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("f");
    fb.store_global(fx.rt.stack_top, Operand::Const(0));
    let x = fb.slot("x", SlotKind::Sexp);
    let l = fb.load(x);
    fb.call(fx.rt.protect, vec![Operand::Inst(l)]);
    fb.ret(None);
    fb.finish();

    let found = check(&fx.mb.finish());
    // confusion reports once and suppresses the would-be imbalance
    assert_eq!(
        messages(&found),
        vec!["[PB] manipulates the stack-top pointer directly, results will be incomplete"]
    );
}

// ---------------------------------------------------------------
// Fresh pointers
// ---------------------------------------------------------------

#[test]
fn fresh_pointer_across_allocating_call_is_reported() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("f");
    let x = fb.slot("x", SlotKind::Sexp);
    let y = fb.slot("y", SlotKind::Sexp);
    let v1 = fb.call(fx.alloc, vec![]);
    fb.store(x, Operand::Inst(v1));
    let v2 = fb.call(fx.alloc2, vec![]);
    fb.store(y, Operand::Inst(v2));
    let l = fb.load(x);
    fb.call(fx.use_fn, vec![Operand::Inst(l)]);
    fb.ret(None);
    fb.finish();

    let found = check(&fx.mb.finish());
    assert_eq!(
        messages(&found),
        vec!["unprotected variable x while calling allocating function alloc_other"]
    );
}

#[test]
fn protected_variable_is_not_reported() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("f");
    let x = fb.slot("x", SlotKind::Sexp);
    let y = fb.slot("y", SlotKind::Sexp);
    let v1 = fb.call(fx.alloc, vec![]);
    fb.store(x, Operand::Inst(v1));
    let l1 = fb.load(x);
    fb.call(fx.rt.protect, vec![Operand::Inst(l1)]);
    let v2 = fb.call(fx.alloc2, vec![]);
    fb.store(y, Operand::Inst(v2));
    let l2 = fb.load(x);
    fb.call(fx.use_fn, vec![Operand::Inst(l2)]);
    fb.call(fx.rt.unprotect, vec![Operand::Const(1)]);
    fb.ret(None);
    fb.finish();

    assert!(check(&fx.mb.finish()).is_empty());
}

#[test]
fn dead_fresh_variable_is_not_reported() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("f");
    let x = fb.slot("x", SlotKind::Sexp);
    let v1 = fb.call(fx.alloc, vec![]);
    fb.store(x, Operand::Inst(v1));
    let v2 = fb.call(fx.alloc2, vec![]);
    fb.store(x, Operand::Inst(v2));
    let l = fb.load(x);
    fb.call(fx.use_fn, vec![Operand::Inst(l)]);
    fb.ret(None);
    fb.finish();

    // the first allocation's value is overwritten before any read, so its
    // danger window is vacuous; the second is never endangered
    assert!(check(&fx.mb.finish()).is_empty());
}

#[test]
fn conditional_message_emits_once_for_a_branchy_use() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("f");
    let x = fb.slot("x", SlotKind::Sexp);
    let c = fb.slot("c", SlotKind::Int);
    let b_use = fb.block();
    let b_done = fb.block();
    let v1 = fb.call(fx.alloc, vec![]);
    fb.store(x, Operand::Inst(v1));
    fb.call(fx.alloc2, vec![]);
    let cond = fb.load(c);
    fb.branch(Operand::Inst(cond), b_use, b_done);
    fb.select_block(b_use);
    let l = fb.load(x);
    fb.call(fx.use_fn, vec![Operand::Inst(l)]);
    fb.jump(b_done);
    fb.select_block(b_done);
    fb.ret(None);
    fb.finish();

    // pending on both paths, but it materializes only where x is read
    let found = check(&fx.mb.finish());
    assert_eq!(
        messages(&found),
        vec!["unprotected variable x while calling allocating function alloc_other"]
    );
}

#[test]
fn fresh_pointer_passed_to_allocating_callee_is_reported() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("f");
    let x = fb.slot("x", SlotKind::Sexp);
    let v = fb.call(fx.alloc, vec![]);
    fb.store(x, Operand::Inst(v));
    let l = fb.load(x);
    fb.call(fx.alloc_use, vec![Operand::Inst(l)]);
    fb.ret(None);
    fb.finish();

    let found = check(&fx.mb.finish());
    assert_eq!(
        messages(&found),
        vec!["calling allocating function alloc_use with a fresh pointer (x)"]
    );
}

#[test]
fn callee_protect_attribute_suppresses_the_fresh_argument_report() {
    let mut fx = fixture();
    let protected_sink = fx.mb.declare_with("protected_sink", |f| {
        f.allocates = true;
        f.params = vec![SlotKind::Sexp];
        f.protect_args.insert(0);
    });
    let mut fb = fx.mb.define("f");
    let x = fb.slot("x", SlotKind::Sexp);
    let v = fb.call(fx.alloc, vec![]);
    fb.store(x, Operand::Inst(v));
    let l = fb.load(x);
    fb.call(protected_sink, vec![Operand::Inst(l)]);
    fb.ret(None);
    fb.finish();

    assert!(check(&fx.mb.finish()).is_empty());
}

#[test]
fn setter_adoption_makes_the_value_safe() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("f");
    let container = fb.slot("container", SlotKind::Sexp);
    let x = fb.slot("x", SlotKind::Sexp);
    let v = fb.call(fx.alloc, vec![]);
    fb.store(x, Operand::Inst(v));
    let lc = fb.load(container);
    let lx = fb.load(x);
    fb.call(fx.setter, vec![Operand::Inst(lc), Operand::Inst(lx)]);
    fb.call(fx.alloc2, vec![]);
    let l2 = fb.load(x);
    fb.call(fx.use_fn, vec![Operand::Inst(l2)]);
    fb.ret(None);
    fb.finish();

    assert!(check(&fx.mb.finish()).is_empty());
}

#[test]
fn store_into_global_protects_implicitly() {
    let mut fx = fixture();
    let keeper = fx.mb.global("keeper");
    let mut fb = fx.mb.define("f");
    let x = fb.slot("x", SlotKind::Sexp);
    let v = fb.call(fx.alloc, vec![]);
    fb.store(x, Operand::Inst(v));
    let l = fb.load(x);
    fb.store_global(keeper, Operand::Inst(l));
    fb.call(fx.alloc2, vec![]);
    let l2 = fb.load(x);
    fb.call(fx.use_fn, vec![Operand::Inst(l2)]);
    fb.ret(None);
    fb.finish();

    assert!(check(&fx.mb.finish()).is_empty());
}

#[test]
fn preserve_object_makes_the_value_safe() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("f");
    let x = fb.slot("x", SlotKind::Sexp);
    let v = fb.call(fx.alloc, vec![]);
    fb.store(x, Operand::Inst(v));
    let l = fb.load(x);
    fb.call(fx.rt.preserve_object, vec![Operand::Inst(l)]);
    fb.call(fx.alloc2, vec![]);
    let l2 = fb.load(x);
    fb.call(fx.use_fn, vec![Operand::Inst(l2)]);
    fb.ret(None);
    fb.finish();

    assert!(check(&fx.mb.finish()).is_empty());
}

#[test]
fn protect_stack_overflow_is_reported_and_confuses() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("f");
    let x = fb.slot("x", SlotKind::Sexp);
    for _ in 0..3 {
        let l = fb.load(x);
        fb.call(fx.rt.protect, vec![Operand::Inst(l)]);
    }
    fb.ret(None);
    fb.finish();
    let module = fx.mb.finish();

    let mut config = AnalysisConfig::default();
    config.max_pstack = 2;
    // the imbalance finding still comes from the balance domain
    let found = check_with(&module, &config);
    let texts = messages(&found);
    assert!(texts.contains(&"protect stack is too deep, unprotecting all variables".to_string()));
}

#[test]
fn node_stack_store_protects_the_pushed_value() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("f");
    let x = fb.slot("x", SlotKind::Sexp);
    let v = fb.call(fx.alloc, vec![]);
    fb.store(x, Operand::Inst(v));
    let top = fb.load_global(fx.rt.node_stack);
    let cell = fb.field(Operand::Inst(top), 0);
    let l = fb.load(x);
    fb.store_deref(cell, Operand::Inst(l));
    fb.call(fx.alloc2, vec![]);
    let l2 = fb.load(x);
    fb.call(fx.use_fn, vec![Operand::Inst(l2)]);
    fb.ret(None);
    fb.finish();

    assert!(check(&fx.mb.finish()).is_empty());
}

#[test]
fn field_of_fresh_is_fresh_too() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("f");
    let x = fb.slot("x", SlotKind::Sexp);
    let attr = fb.slot("attr", SlotKind::Sexp);
    let v = fb.call(fx.alloc, vec![]);
    fb.store(x, Operand::Inst(v));
    let l = fb.load(x);
    let proj = fb.field(Operand::Inst(l), 1);
    fb.store(attr, Operand::Inst(proj));
    fb.call(fx.alloc2, vec![]);
    let la = fb.load(attr);
    fb.call(fx.use_fn, vec![Operand::Inst(la)]);
    let lx = fb.load(x);
    fb.call(fx.use_fn, vec![Operand::Inst(lx)]);
    fb.ret(None);
    fb.finish();

    let found = check(&fx.mb.finish());
    let texts = messages(&found);
    assert!(texts
        .contains(&"unprotected variable attr while calling allocating function alloc_other".to_string()));
    assert!(texts
        .contains(&"unprotected variable x while calling allocating function alloc_other".to_string()));
}

#[test]
fn nested_allocating_argument_is_reported() {
    let mut fx = fixture();
    let sink = fx.mb.declare_with("wrap", |f| {
        f.allocates = true;
        f.params = vec![SlotKind::Sexp];
    });
    let mut fb = fx.mb.define("f");
    let inner = fb.call(fx.alloc, vec![]);
    fb.call(sink, vec![Operand::Inst(inner)]);
    fb.ret(None);
    fb.finish();

    let found = check(&fx.mb.finish());
    assert!(messages(&found)
        .contains(&"calling allocating function wrap with argument allocated using alloc".to_string()));
}

// ---------------------------------------------------------------
// Error paths
// ---------------------------------------------------------------

#[test]
fn findings_on_error_paths_are_suppressed() {
    let mut fx = fixture();
    let fatal = fx.mb.declare("fatal");
    fx.mb.specials_mut().error_functions.insert(fatal);
    let mut fb = fx.mb.define("f");
    let x = fb.slot("x", SlotKind::Sexp);
    let c = fb.slot("c", SlotKind::Int);
    let b_err = fb.block();
    let b_ok = fb.block();
    let cond = fb.load(c);
    fb.branch(Operand::Inst(cond), b_err, b_ok);
    fb.select_block(b_err);
    // imbalance on the dying path only
    let l = fb.load(x);
    fb.call(fx.rt.protect, vec![Operand::Inst(l)]);
    fb.call(fatal, vec![]);
    fb.unreachable();
    fb.select_block(b_ok);
    fb.ret(None);
    fb.finish();

    assert!(check(&fx.mb.finish()).is_empty());
}

// ---------------------------------------------------------------
// Branch folding on a known counter
// ---------------------------------------------------------------

#[test]
fn branch_on_exact_counter_folds() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("f");
    let x = fb.slot("x", SlotKind::Sexp);
    let n = fb.slot("nprotect", SlotKind::Int);
    let b_unprot = fb.block();
    let b_done = fb.block();
    fb.store(n, Operand::Const(1));
    let l = fb.load(x);
    fb.call(fx.rt.protect, vec![Operand::Inst(l)]);
    let ln = fb.load(n);
    let test = fb.cmp(CmpOp::Ne, Operand::Inst(ln), Operand::Const(0));
    fb.branch(Operand::Inst(test), b_unprot, b_done);
    fb.select_block(b_unprot);
    let ln2 = fb.load(n);
    fb.call(fx.rt.unprotect, vec![Operand::Inst(ln2)]);
    fb.jump(b_done);
    fb.select_block(b_done);
    fb.ret(None);
    fb.finish();

    // with n known to be 1, the skip edge is never explored and the
    // function balances
    assert!(check(&fx.mb.finish()).is_empty());
}
