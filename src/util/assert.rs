use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};

/// Builds the error raised when an internal invariant is violated. The failure
/// is logged and returned to the operation that triggered it.
pub fn fail(message: impl AsRef<str>) -> FirestoreError {
    let message = format!("INTERNAL ASSERTION FAILED: {}", message.as_ref());
    log::error!("{message}");
    internal_error(message)
}

/// Returns an internal assertion error when the condition is false.
pub fn hard_assert(condition: bool, message: impl AsRef<str>) -> FirestoreResult<()> {
    if condition {
        Ok(())
    } else {
        Err(fail(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;

    #[test]
    fn failed_assertion_is_internal() {
        let err = hard_assert(false, "boom").unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Internal);
        assert!(err.message().contains("INTERNAL ASSERTION FAILED"));
        assert!(err.message().contains("boom"));
    }

    #[test]
    fn passing_assertion_is_ok() {
        assert!(hard_assert(true, "never").is_ok());
    }
}
