//! Symbolic execution of Dalvik bytecode.
#![cfg_attr(all(docsrs, not(doctest)), feature(doc_auto_cfg))]

pub use symdex_vm::*;

pub mod config;
