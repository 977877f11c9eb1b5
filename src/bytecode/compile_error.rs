/// Errors raised while lowering an expression tree to bytecode. Always
/// fatal to the compilation unit; the line is approximate, derived from
/// the nearest node the compiler had seen.
#[derive(Debug, Clone)]
pub enum CompileError {
    /// More locals than the wide operand encoding can address.
    TooManyLocals { line: u32 },
    /// More upvalues than the wide operand encoding can address.
    TooManyUpvalues { line: u32 },
    /// More constants than the wide operand encoding can address.
    TooManyConstants { line: u32 },
    /// A jump displacement outside the signed 16-bit range.
    JumpTooFar { line: u32 },
    /// Internal compiler invariant violation (shouldn't happen in normal use).
    Internal(String),
}

impl CompileError {
    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal(msg.into())
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::TooManyLocals { line } => write!(
                f,
                "compile error: too many local variables, max {} (approximate line {})",
                u16::MAX,
                line
            ),
            CompileError::TooManyUpvalues { line } => write!(
                f,
                "compile error: too many upvalues, max {} (approximate line {})",
                u16::MAX,
                line
            ),
            CompileError::TooManyConstants { line } => write!(
                f,
                "compile error: too many constants, max {} (approximate line {})",
                u16::MAX,
                line
            ),
            CompileError::JumpTooFar { line } => write!(
                f,
                "compile error: too much code to jump over, max {} bytes either direction (approximate line {})",
                i16::MAX,
                line
            ),
            CompileError::Internal(msg) => {
                write!(f, "compile error: internal error: {}", msg)
            }
        }
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_line() {
        let err = CompileError::JumpTooFar { line: 12 };
        let msg = err.to_string();
        assert!(msg.contains("jump"));
        assert!(msg.contains("line 12"));
    }

    #[test]
    fn test_internal_display() {
        let err = CompileError::internal("broken");
        assert!(err.to_string().contains("internal error: broken"));
    }

    #[test]
    fn test_implements_std_error() {
        let err = CompileError::TooManyLocals { line: 1 };
        let _: &dyn std::error::Error = &err;
    }
}
