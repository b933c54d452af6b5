#![doc = include_str!("../README.md")]

//! Palisade intermediate representation.
//!
//! This crate defines the low-level IR the checkers interpret, the JSON
//! loader with cross-reference validation, the allocation summaries over
//! the call graph, and per-function liveness.

pub mod builder;
pub mod liveness;
pub mod loader;
pub mod module;
pub mod summaries;
