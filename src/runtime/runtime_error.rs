/// One entry of the script call stack captured when an error was raised.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    pub function: String,
    pub line: u32,
}

/// A fatal script execution error: the message plus the call stack at the
/// point of failure, innermost frame first.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        RuntimeError {
            message: message.into(),
            trace: Vec::new(),
        }
    }

    pub fn push_frame(&mut self, function: impl Into<String>, line: u32) {
        self.trace.push(TraceFrame {
            function: function.into(),
            line,
        });
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "runtime error: {}", self.message)?;
        for frame in &self.trace {
            write!(f, "\n  in {} (line {})", frame.function, frame.line)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_trace() {
        let mut err = RuntimeError::new("cannot add str and num");
        err.push_frame("inner", 3);
        err.push_frame("main", 1);
        let text = err.to_string();
        assert!(text.starts_with("runtime error: cannot add str and num"));
        let inner_at = text.find("in inner (line 3)").unwrap();
        let main_at = text.find("in main (line 1)").unwrap();
        assert!(inner_at < main_at);
    }

    #[test]
    fn test_implements_std_error() {
        let err = RuntimeError::new("boom");
        let _: &dyn std::error::Error = &err;
    }
}
