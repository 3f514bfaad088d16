//! One-time retry policy for rewrapper failures.

use crate::errors::ErrorCode;
use crate::subprocess::SubprocessResult;

/// reclient internal error, often infrastructural.
pub const RECLIENT_ERROR_STATUS: i32 = 35;
/// Remote execution server error, e.g. a failed blob transfer.
pub const RBE_SERVER_ERROR_STATUS: i32 = 45;
/// SIGKILL, e.g. out of memory.
pub const RBE_KILLED_STATUS: i32 = 137;

pub const RETRIABLE_REWRAPPER_STATUSES: [i32; 3] =
    [RECLIENT_ERROR_STATUS, RBE_SERVER_ERROR_STATUS, RBE_KILLED_STATUS];

/// A compiler complaining about a missing header: the user must fix it.
pub fn matches_file_not_found(line: &str) -> bool {
    line.contains("fatal error:") && line.contains("file not found")
}

/// rewrapper could not reach reproxy in time.
pub fn matches_fail_to_dial(line: &str) -> bool {
    line.contains("Fail to dial") && line.contains("context deadline exceeded")
}

/// Why a failed result deserves another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    FailToDial,
    Status(ErrorCode),
}

/// Decide whether a failed rewrapper run should be retried once.
pub fn retry_reason(result: &SubprocessResult) -> Option<RetryReason> {
    if result.success() {
        return None;
    }
    if result.stderr.iter().any(|l| matches_file_not_found(l)) {
        return None;
    }
    if result.stderr.iter().any(|l| matches_fail_to_dial(l)) {
        return Some(RetryReason::FailToDial);
    }
    // for_exit_code only knows the retriable statuses
    ErrorCode::for_exit_code(result.returncode).map(RetryReason::Status)
}

pub fn should_retry_remote_action(result: &SubprocessResult) -> bool {
    retry_reason(result).is_some()
}
