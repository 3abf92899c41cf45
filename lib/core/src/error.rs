//! Error handling foundation.
//!
//! Each crate defines its own domain error enums. At service boundaries
//! those errors are wrapped in a rootcause `Report` so callers get the
//! layered context while the inner layers stay matchable in tests.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_type_works() {
        let ok: Result<i32> = Ok(42);
        assert_eq!(ok.expect("should be ok"), 42);
    }
}
