//! Error handling for the Quill compilation pipeline
//!
//! Only resource exhaustion during compilation is recoverable: the caller
//! abandons the compiled-code strategy for the function and falls back to
//! another execution path. Everything that would indicate a compiler defect
//! (frame-height mismatches, double-bound labels, popping owned registers)
//! is an assertion, not an error value.

use thiserror::Error;

/// Reasons a single function compilation gives up without producing code.
///
/// A bailout is sticky for the rest of the function being compiled and is
/// returned from the top-level entry point; it never aborts the process.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BailoutReason {
    #[error("expression nesting exceeds the compiler stack budget")]
    AstTooDeep,

    #[error("function needs more frame slots than the backend supports")]
    FrameTooLarge,

    #[error("too many deferred code blocks for one function")]
    DeferredLimit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bailout_display() {
        assert_eq!(
            BailoutReason::AstTooDeep.to_string(),
            "expression nesting exceeds the compiler stack budget"
        );
        assert_eq!(
            BailoutReason::FrameTooLarge.to_string(),
            "function needs more frame slots than the backend supports"
        );
    }
}
