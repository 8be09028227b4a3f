//! Exit-code mapping.
//!
//! `0` success, `2` invalid arguments (clap's own exit), `3` not
//! initialized / missing DB, `4` lock held, `5` validation failure,
//! `6` credit-exhaustion immediate-fail (once-mode), `1` unclassified.

use steroids_core::lock::LockError;
use steroids_core::merge::MergeError;

pub const SUCCESS: i32 = 0;
pub const UNCLASSIFIED: i32 = 1;
pub const NOT_INITIALIZED: i32 = 3;
pub const LOCK_HELD: i32 = 4;
pub const VALIDATION_FAILED: i32 = 5;
pub const CREDIT_ONCE_FAIL: i32 = 6;

/// Map an error chain onto the documented exit codes.
pub fn code_for_error(error: &anyhow::Error) -> i32 {
    for cause in error.chain() {
        if let Some(LockError::Held { .. }) = cause.downcast_ref::<LockError>() {
            return LOCK_HELD;
        }
        if let Some(MergeError::ValidationFailed { .. }) = cause.downcast_ref::<MergeError>() {
            return VALIDATION_FAILED;
        }
    }
    let message = format!("{error:#}");
    if message.contains("not initialized") || message.contains("database not found") {
        return NOT_INITIALIZED;
    }
    UNCLASSIFIED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_held_maps_to_4() {
        let err = anyhow::anyhow!(LockError::Held { pid: 123 }).context("acquiring lock");
        assert_eq!(code_for_error(&err), LOCK_HELD);
    }

    #[test]
    fn not_initialized_maps_to_3() {
        let err = anyhow::anyhow!("project not initialized: /x/.steroids/steroids.db missing");
        assert_eq!(code_for_error(&err), NOT_INITIALIZED);
    }

    #[test]
    fn validation_failure_maps_to_5() {
        let err = anyhow::anyhow!(MergeError::ValidationFailed {
            exit_code: Some(1),
            output: "tests failed".into(),
        });
        assert_eq!(code_for_error(&err), VALIDATION_FAILED);
    }

    #[test]
    fn anything_else_maps_to_1() {
        assert_eq!(code_for_error(&anyhow::anyhow!("boom")), UNCLASSIFIED);
    }
}
