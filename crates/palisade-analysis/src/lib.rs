#![doc = include_str!("../README.md")]

//! Palisade analysis engine.
//!
//! This crate implements the abstract domains, transfer functions,
//! work-list engine and refinement controller of the protection-stack
//! checker, the error-path pruner, the diagnostic pipeline, and the
//! multi-allocating-argument scanner.

pub mod arg_scan;
pub mod balance;
pub mod diagnostics;
pub mod engine;
pub mod error_paths;
pub mod fresh_vars;
pub mod int_guards;
pub mod sexp_guards;
pub mod state;
