//! Quill VM - Classic Virtual-Frame Code Generator
//!
//! A single-pass code generator for the Quill symbolic RISC backend. It
//! walks a resolved function syntax tree once, tracking the machine state
//! in a virtual frame (where each logical stack element currently lives:
//! memory, a register, a constant, or a copy), merging frame shapes at
//! control-flow joins through jump targets, and splitting rare slow paths
//! into deferred code blocks emitted after the main body.
//!
//! The entry point is [`codegen::generate`], which compiles one function
//! into a [`quill_masm::MacroAssembler`] stream or fails with a
//! recoverable bailout so the caller can pick another execution strategy.

pub mod ast;
pub mod codegen;
pub mod deferred;
pub mod frame;
pub mod jump_target;
pub mod reference;

pub use codegen::generate;
