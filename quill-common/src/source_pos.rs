//! Source positions
//!
//! Positions are byte offsets into the script source. The code generator
//! records them into the emitted stream so the runtime can map return
//! addresses back to source for stack traces and the profiler.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A byte offset into the function's script source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourcePos(pub u32);

impl SourcePos {
    /// Sentinel for synthesized nodes with no source location.
    pub const NONE: SourcePos = SourcePos(u32::MAX);

    pub fn is_none(self) -> bool {
        self == SourcePos::NONE
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "<no position>")
        } else {
            write!(f, "@{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_sentinel() {
        assert!(SourcePos::NONE.is_none());
        assert!(!SourcePos(0).is_none());
        assert_eq!(format!("{}", SourcePos(17)), "@17");
        assert_eq!(format!("{}", SourcePos::NONE), "<no position>");
    }
}
