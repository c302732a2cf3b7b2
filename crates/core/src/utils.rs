//! Internal helper macros.

/// Returns early with `Err($error)` unless `$predicate` holds.
///
/// Like `assert!`, but for validation that reports an error instead of panicking.
///
/// ```ignore
/// ensure!(byte.is_ascii_digit(), ParseError::malformed("version is not a digit"));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
