#![allow(dead_code)]

use palisade_analysis::diagnostics::Diagnostic;
use palisade_analysis::engine::{analyze_module, AnalysisConfig};
use palisade_ir::builder::{ModuleBuilder, RuntimeIds};
use palisade_ir::module::{FunctionId, Module, SlotKind};

/// A module builder with the protection runtime and a few stock callees
/// installed: two fresh allocators, a plain consumer and a setter.
pub struct Fixture {
    pub mb: ModuleBuilder,
    pub rt: RuntimeIds,
    /// Allocating, returns a fresh object.
    pub alloc: FunctionId,
    /// Second fresh allocator, for distinguishable messages.
    pub alloc2: FunctionId,
    /// Allocating, takes one pointer argument, does not protect it.
    pub alloc_use: FunctionId,
    /// Non-allocating consumer of one pointer.
    pub use_fn: FunctionId,
    /// Registered setter: set_elt(container, value).
    pub setter: FunctionId,
}

pub fn fixture() -> Fixture {
    let mut mb = ModuleBuilder::new();
    let rt = mb.standard_runtime();
    let alloc = mb.declare_allocator("alloc");
    let alloc2 = mb.declare_allocator("alloc_other");
    let alloc_use = mb.declare_with("alloc_use", |f| {
        f.allocates = true;
        f.params = vec![SlotKind::Sexp];
    });
    let use_fn = mb.declare_with("use", |f| {
        f.params = vec![SlotKind::Sexp];
    });
    let setter = mb.declare_with("set_elt", |f| {
        f.params = vec![SlotKind::Sexp, SlotKind::Sexp];
    });
    mb.specials_mut().setters.insert(setter);
    Fixture {
        mb,
        rt,
        alloc,
        alloc2,
        alloc_use,
        use_fn,
        setter,
    }
}

pub fn check(module: &Module) -> Vec<Diagnostic> {
    check_with(module, &AnalysisConfig::default())
}

pub fn check_with(module: &Module, config: &AnalysisConfig) -> Vec<Diagnostic> {
    analyze_module(module, config, None).diagnostics
}

pub fn messages(diagnostics: &[Diagnostic]) -> Vec<String> {
    diagnostics.iter().map(|d| d.message.clone()).collect()
}

/// A config with both guard escalations disabled for every function.
pub fn no_refinement_config(module: &Module) -> AnalysisConfig {
    let mut config = AnalysisConfig::default();
    for f in &module.functions {
        config.avoid_int_guards.insert(f.name.clone());
        config.avoid_sexp_guards.insert(f.name.clone());
    }
    config
}
