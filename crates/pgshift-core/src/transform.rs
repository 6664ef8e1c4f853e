//! Hook for rewriting user-supplied SQL before it runs.

use crate::error::BoxError;

/// Rewrites SQL expressions and statements supplied in migrations (`up`,
/// `down`, defaults, checks and raw SQL) before they are executed.
pub trait SqlTransformer: Send + Sync {
    /// Return the SQL to run in place of `sql`, or reject it.
    fn transform_sql(&self, sql: &str) -> Result<String, BoxError>;
}

/// Leaves SQL untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTransformer;

impl SqlTransformer for NoopTransformer {
    fn transform_sql(&self, sql: &str) -> Result<String, BoxError> {
        Ok(sql.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Deny;

    impl SqlTransformer for Deny {
        fn transform_sql(&self, sql: &str) -> Result<String, BoxError> {
            if sql.contains("pg_sleep") {
                return Err("pg_sleep is not allowed".into());
            }
            Ok(sql.to_string())
        }
    }

    #[test]
    fn test_noop_transformer() {
        assert_eq!(NoopTransformer.transform_sql("lower(name)").unwrap(), "lower(name)");
    }

    #[test]
    fn test_rejecting_transformer() {
        assert!(Deny.transform_sql("pg_sleep(10)").is_err());
        assert_eq!(Deny.transform_sql("1").unwrap(), "1");
    }
}
