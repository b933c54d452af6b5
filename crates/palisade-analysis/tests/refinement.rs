//! Adaptive refinement: findings that are artifacts of missing guard
//! tracking disappear when the run is repeated at higher precision.

mod common;

use common::{check, check_with, fixture, messages, no_refinement_config, Fixture};
use palisade_ir::module::{CmpOp, FunctionId, Operand, SlotKind};

/// `if (g) protect(x); ...; if (g) unprotect(1);` with `g` an integer
/// guard of unknown value. Only guard tracking can correlate the two
/// branches.
fn build_int_guard_function(fx: &mut Fixture) -> FunctionId {
    let mut fb = fx.mb.define("correlated");
    let g = fb.slot("g", SlotKind::Int);
    let src = fb.slot("src", SlotKind::Int);
    let x = fb.slot("x", SlotKind::Sexp);
    let b_prot = fb.block();
    let b_join = fb.block();
    let b_unprot = fb.block();
    let b_ret = fb.block();

    let init = fb.load(src);
    fb.store(g, Operand::Inst(init));
    let c1 = fb.load(g);
    let t1 = fb.cmp(CmpOp::Ne, Operand::Inst(c1), Operand::Const(0));
    fb.branch(Operand::Inst(t1), b_prot, b_join);

    fb.select_block(b_prot);
    let lx = fb.load(x);
    fb.call(fx.rt.protect, vec![Operand::Inst(lx)]);
    fb.jump(b_join);

    fb.select_block(b_join);
    let c2 = fb.load(g);
    let t2 = fb.cmp(CmpOp::Ne, Operand::Inst(c2), Operand::Const(0));
    fb.branch(Operand::Inst(t2), b_unprot, b_ret);

    fb.select_block(b_unprot);
    fb.call(fx.rt.unprotect, vec![Operand::Const(1)]);
    fb.jump(b_ret);

    fb.select_block(b_ret);
    fb.ret(None);
    fb.finish()
}

/// The same correlation through a pointer guard initialized to nil.
fn build_sexp_guard_function(fx: &mut Fixture) -> FunctionId {
    let mut fb = fx.mb.define("nil_guarded");
    let s = fb.slot("s", SlotKind::Sexp);
    let b_prot = fb.block();
    let b_join = fb.block();
    let b_unprot = fb.block();
    let b_ret = fb.block();

    let nil = fb.load_global(fx.rt.nil_global);
    fb.store(s, Operand::Inst(nil));
    let c1 = fb.load(s);
    let n1 = fb.load_global(fx.rt.nil_global);
    let t1 = fb.cmp(CmpOp::Ne, Operand::Inst(c1), Operand::Inst(n1));
    fb.branch(Operand::Inst(t1), b_prot, b_join);

    fb.select_block(b_prot);
    let ls = fb.load(s);
    fb.call(fx.rt.protect, vec![Operand::Inst(ls)]);
    fb.jump(b_join);

    fb.select_block(b_join);
    let c2 = fb.load(s);
    let n2 = fb.load_global(fx.rt.nil_global);
    let t2 = fb.cmp(CmpOp::Ne, Operand::Inst(c2), Operand::Inst(n2));
    fb.branch(Operand::Inst(t2), b_unprot, b_ret);

    fb.select_block(b_unprot);
    fb.call(fx.rt.unprotect, vec![Operand::Const(1)]);
    fb.jump(b_ret);

    fb.select_block(b_ret);
    fb.ret(None);
    fb.finish()
}

#[test]
fn int_guard_refinement_removes_spurious_imbalance() {
    let mut fx = fixture();
    build_int_guard_function(&mut fx);
    let module = fx.mb.finish();
    assert!(check(&module).is_empty());
}

#[test]
fn without_refinement_the_imbalance_is_reported() {
    let mut fx = fixture();
    build_int_guard_function(&mut fx);
    let module = fx.mb.finish();
    let config = no_refinement_config(&module);
    let found = check_with(&module, &config);
    assert!(messages(&found)
        .iter()
        .any(|m| m.contains("protection stack imbalance")));
}

#[test]
fn refinement_never_adds_findings() {
    let mut fx = fixture();
    build_int_guard_function(&mut fx);
    let module = fx.mb.finish();
    let refined = check(&module);
    let unrefined = check_with(&module, &no_refinement_config(&module));
    assert!(refined.len() <= unrefined.len());
}

#[test]
fn sexp_guard_refinement_removes_spurious_imbalance() {
    let mut fx = fixture();
    build_sexp_guard_function(&mut fx);
    let module = fx.mb.finish();
    assert!(check(&module).is_empty());
}

#[test]
fn nil_check_predicate_drives_the_same_pruning() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("checked");
    let s = fb.slot("s", SlotKind::Sexp);
    let b_prot = fb.block();
    let b_join = fb.block();
    let b_unprot = fb.block();
    let b_ret = fb.block();

    let nil = fb.load_global(fx.rt.nil_global);
    fb.store(s, Operand::Inst(nil));
    let c1 = fb.load(s);
    let t1 = fb.call(fx.rt.nil_check, vec![Operand::Inst(c1)]);
    let z1 = fb.cmp(CmpOp::Eq, Operand::Inst(t1), Operand::Const(0));
    fb.branch(Operand::Inst(z1), b_prot, b_join);

    fb.select_block(b_prot);
    let ls = fb.load(s);
    fb.call(fx.rt.protect, vec![Operand::Inst(ls)]);
    fb.jump(b_join);

    fb.select_block(b_join);
    let c2 = fb.load(s);
    let t2 = fb.call(fx.rt.nil_check, vec![Operand::Inst(c2)]);
    let z2 = fb.cmp(CmpOp::Eq, Operand::Inst(t2), Operand::Const(0));
    fb.branch(Operand::Inst(z2), b_unprot, b_ret);

    fb.select_block(b_unprot);
    fb.call(fx.rt.unprotect, vec![Operand::Const(1)]);
    fb.jump(b_ret);

    fb.select_block(b_ret);
    fb.ret(None);
    fb.finish();

    let module = fx.mb.finish();
    assert!(check(&module).is_empty());
}

#[test]
fn symbol_guard_is_never_nil() {
    let mut fx = fixture();
    let sym = fx.mb.symbol_global("sym_class", "class");
    let mut fb = fx.mb.define("symbolic");
    let s = fb.slot("s", SlotKind::Sexp);
    let b_prot = fb.block();
    let b_ret = fb.block();

    // s = <class symbol>; if (s == nil) protect(s);
    let init = fb.load_global(sym);
    fb.store(s, Operand::Inst(init));
    let c1 = fb.load(s);
    let n1 = fb.load_global(fx.rt.nil_global);
    let t1 = fb.cmp(CmpOp::Eq, Operand::Inst(c1), Operand::Inst(n1));
    fb.branch(Operand::Inst(t1), b_prot, b_ret);

    fb.select_block(b_prot);
    let ls = fb.load(s);
    fb.call(fx.rt.protect, vec![Operand::Inst(ls)]);
    fb.jump(b_ret);

    fb.select_block(b_ret);
    fb.ret(None);
    fb.finish();

    let module = fx.mb.finish();
    assert!(check(&module).is_empty());
}

#[test]
fn allocator_results_count_as_non_nil_when_enabled() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("allocated_guard");
    let s = fb.slot("s", SlotKind::Sexp);
    let b_prot = fb.block();
    let b_ret = fb.block();

    // s = alloc(); if (s == nil) protect(s);
    let v = fb.call(fx.alloc, vec![]);
    fb.store(s, Operand::Inst(v));
    let c1 = fb.load(s);
    let n1 = fb.load_global(fx.rt.nil_global);
    let t1 = fb.cmp(CmpOp::Eq, Operand::Inst(c1), Operand::Inst(n1));
    fb.branch(Operand::Inst(t1), b_prot, b_ret);

    fb.select_block(b_prot);
    let ls = fb.load(s);
    fb.call(fx.rt.protect, vec![Operand::Inst(ls)]);
    fb.jump(b_ret);

    fb.select_block(b_ret);
    fb.ret(None);
    fb.finish();
    let module = fx.mb.finish();

    assert!(check(&module).is_empty());

    let mut config = palisade_analysis::engine::AnalysisConfig::default();
    config.use_allocator_detection = false;
    let found = check_with(&module, &config);
    assert!(messages(&found)
        .iter()
        .any(|m| m.contains("protection stack imbalance")));
}

#[test]
fn conditional_unprotect_through_select_uses_the_guard() {
    let mut fx = fixture();
    let mut fb = fx.mb.define("select_unprotect");
    let g = fb.slot("g", SlotKind::Int);
    let x = fb.slot("x", SlotKind::Sexp);
    let b_prot = fb.block();
    let b_done = fb.block();

    // g = 1; if (g) { protect(x); protect(x); } unprotect(g ? 2 : 0)
    fb.store(g, Operand::Const(1));
    let c1 = fb.load(g);
    let t1 = fb.cmp(CmpOp::Ne, Operand::Inst(c1), Operand::Const(0));
    fb.branch(Operand::Inst(t1), b_prot, b_done);

    fb.select_block(b_prot);
    let l1 = fb.load(x);
    fb.call(fx.rt.protect, vec![Operand::Inst(l1)]);
    let l2 = fb.load(x);
    fb.call(fx.rt.protect, vec![Operand::Inst(l2)]);
    fb.jump(b_done);

    fb.select_block(b_done);
    let c2 = fb.load(g);
    let t2 = fb.cmp(CmpOp::Ne, Operand::Inst(c2), Operand::Const(0));
    let count = fb.select(Operand::Inst(t2), Operand::Const(2), Operand::Const(0));
    fb.call(fx.rt.unprotect, vec![Operand::Inst(count)]);
    fb.ret(None);
    fb.finish();

    let module = fx.mb.finish();
    assert!(check(&module).is_empty());
}
