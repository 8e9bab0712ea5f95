//! Error construction macros.

/// Builds a [`crate::error::BargeError`] from a kind, a static description,
/// and an optional displayable detail.
///
/// The detail is rendered eagerly, so anything implementing `Display` works:
/// a path, a number, a `format!` result.
///
/// # Examples
/// ```rust,no_run
/// use barge::barge_error;
/// use barge::error::ErrorKind;
///
/// let plain = barge_error!(ErrorKind::ConfigInvalid, "Invalid input");
/// let detailed = barge_error!(
///     ErrorKind::ConversionFailed,
///     "Type conversion failed",
///     format!("cannot convert {} to an integer", "abc"),
/// );
/// ```
#[macro_export]
macro_rules! barge_error {
    ($kind:expr, $desc:expr $(, $detail:expr)? $(,)?) => {{
        let error = $crate::error::BargeError::new($kind, $desc);
        $(let error = error.with_detail($detail);)?
        error
    }};
}

/// Short-circuits the current function with an error built by
/// [`crate::barge_error!`]; accepts the same arguments.
#[macro_export]
macro_rules! bail {
    ($($args:tt)*) => {
        return Err($crate::barge_error!($($args)*))
    };
}
