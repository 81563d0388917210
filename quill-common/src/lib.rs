//! Quill VM - Common Types and Utilities
//!
//! This crate contains the shared leaf types used across the Quill VM
//! compilation pipeline: the tagged small-integer model, source positions,
//! and the recoverable compilation-bailout error taxonomy.

pub mod error;
pub mod smi;
pub mod source_pos;

pub use error::BailoutReason;
pub use smi::Smi;
pub use source_pos::SourcePos;
