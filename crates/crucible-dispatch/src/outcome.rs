//! Dispatch outcomes and workload-failure classification.

use crucible_schemas::{ErrorKind, EvalId};

/// What one `run_once` cycle did, for logs and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Queue was empty.
    Idle,
    /// Pool was empty; envelope requeued with a short backoff.
    PoolEmpty,
    /// Envelope handed back to the queue's retry machinery.
    NackedForRetry(EvalId),
    Completed(EvalId),
    Failed(EvalId, ErrorKind),
}

/// A non-zero exit is a user error when the output looks like the user's
/// program failing, and an executor crash otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureClass {
    UserError {
        /// Concise user-visible message (the exception line).
        message: String,
    },
    ExecutorCrash,
}

/// Classify combined output from a failed workload.
///
/// A Python traceback (or an `XyzError:`-shaped final line) means the user's
/// own program raised; anything else means the sandbox died under the user.
pub fn classify_workload_failure(output: &str) -> FailureClass {
    let has_traceback = output.contains("Traceback (most recent call last)");
    let error_line = output
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .filter(|l| looks_like_exception_line(l));

    match (has_traceback, error_line) {
        (_, Some(line)) => FailureClass::UserError {
            message: line.trim().to_string(),
        },
        (true, None) => FailureClass::UserError {
            message: "user program raised an exception".to_string(),
        },
        (false, None) => FailureClass::ExecutorCrash,
    }
}

/// `NameError: ...`, `ZeroDivisionError: ...`, `SyntaxError: ...` — an
/// identifier ending in `Error` followed by a colon.
fn looks_like_exception_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    match trimmed.split_once(':') {
        Some((head, _)) => {
            !head.is_empty()
                && head.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && (head.ends_with("Error") || head.ends_with("Exception"))
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_traceback_is_a_user_error_with_the_exception_line() {
        let out = "Traceback (most recent call last):\n  File \"<string>\", line 1, in <module>\nZeroDivisionError: division by zero\n";
        assert_eq!(
            classify_workload_failure(out),
            FailureClass::UserError {
                message: "ZeroDivisionError: division by zero".to_string()
            }
        );
    }

    #[test]
    fn bare_exception_line_still_counts_as_user_error() {
        let out = "MemoryError: out of memory\n";
        assert!(matches!(
            classify_workload_failure(out),
            FailureClass::UserError { .. }
        ));
    }

    #[test]
    fn oom_kill_with_no_user_output_is_an_executor_crash() {
        assert_eq!(classify_workload_failure(""), FailureClass::ExecutorCrash);
        assert_eq!(
            classify_workload_failure("killed\n"),
            FailureClass::ExecutorCrash
        );
    }

    #[test]
    fn ordinary_stdout_with_a_colon_is_not_an_exception() {
        assert_eq!(
            classify_workload_failure("result: 42\n"),
            FailureClass::ExecutorCrash
        );
    }
}
