//! Pre-execution checks on submitted tag code.
//!
//! The isolate is the security boundary. These checks only reject input that
//! can never run usefully, before paying for an isolate or a worker.

use crate::ExecutionResult;

/// Maximum code size in bytes (64 KB).
pub const DEFAULT_MAX_CODE_SIZE: usize = 64 * 1024;

/// Validate tag code before it reaches a sandbox.
///
/// A rejection is returned as the [`ExecutionResult::ScriptError`] the caller
/// should report, since it is the script author's mistake.
pub fn validate_code(code: &str, max_size: Option<usize>) -> Result<(), ExecutionResult> {
    let max = max_size.unwrap_or(DEFAULT_MAX_CODE_SIZE);

    if code.len() > max {
        return Err(ExecutionResult::ScriptError {
            name: "RangeError".into(),
            message: format!("code exceeds maximum size of {max} bytes (got {})", code.len()),
            stack: None,
        });
    }

    if code.trim().is_empty() {
        return Err(ExecutionResult::ScriptError {
            name: "SyntaxError".into(),
            message: "code is empty".into(),
            stack: None,
        });
    }

    if code.contains('\0') {
        return Err(ExecutionResult::ScriptError {
            name: "SyntaxError".into(),
            message: "code contains a NUL byte".into(),
            stack: None,
        });
    }

    Ok(())
}

/// Reject a serialized result larger than `max_size` bytes.
pub fn check_output_size(len: usize, max_size: usize) -> Result<(), ExecutionResult> {
    if len > max_size {
        return Err(ExecutionResult::ScriptError {
            name: "RangeError".into(),
            message: format!("result exceeds maximum size of {max_size} bytes"),
            stack: None,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_script() {
        assert!(validate_code("return 1 + 1", None).is_ok());
    }

    #[test]
    fn rejects_empty_code() {
        assert!(validate_code("", None).is_err());
        assert!(validate_code("  \n\t", None).is_err());
    }

    #[test]
    fn rejects_oversized_code() {
        let big = "x".repeat(100_000);
        match validate_code(&big, None).unwrap_err() {
            ExecutionResult::ScriptError { name, message, .. } => {
                assert_eq!(name, "RangeError");
                assert!(message.contains("100000"), "{message}");
            }
            other => panic!("expected ScriptError, got {other:?}"),
        }
    }

    #[test]
    fn rejects_nul_bytes() {
        assert!(validate_code("return 1\0", None).is_err());
    }

    #[test]
    fn custom_max_size() {
        let code = "x".repeat(100);
        assert!(validate_code(&code, Some(50)).is_err());
        assert!(validate_code(&code, Some(200)).is_ok());
    }

    #[test]
    fn output_size_limit() {
        assert!(check_output_size(100, 100).is_ok());
        match check_output_size(101, 100).unwrap_err() {
            ExecutionResult::ScriptError { name, message, .. } => {
                assert_eq!(name, "RangeError");
                assert!(message.contains("100 bytes"), "{message}");
            }
            other => panic!("expected ScriptError, got {other:?}"),
        }
    }
}
