//! Error construction macros.

/// Creates a [`crate::error::RowcastError`] from a kind and description,
/// optionally with dynamic detail.
#[macro_export]
macro_rules! rowcast_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::RowcastError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::RowcastError::from(($kind, $desc, $detail.to_string()))
    };
}

/// Creates a [`crate::error::RowcastError`] and returns it from the current
/// function.
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return Err($crate::rowcast_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return Err($crate::rowcast_error!($kind, $desc, $detail))
    };
}
