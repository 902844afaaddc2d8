//! Validation of model-generated SQL before it is allowed anywhere near
//! the database. Conservative keyword scan, not a parser: anything that
//! even looks like it writes, touches catalogs, or leaves the metrics
//! table is rejected. Execution additionally runs in a read-only
//! transaction, so the guard is the first line, not the only one.

use thiserror::Error;

/// The only table the NL query path may read.
pub const QUERY_TABLE: &str = "dashboard_metrics";

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "TRUNCATE", "DROP", "ALTER", "CREATE", "GRANT",
    "REVOKE", "COPY", "CALL", "EXECUTE", "PREPARE", "DO", "VACUUM", "LOCK", "LISTEN", "NOTIFY",
    "REFRESH", "SET", "RESET", "COMMENT", "INTO",
];

// Raw source tables are not exposed to generated queries.
const FORBIDDEN_TABLES: &[&str] = &[
    "CLASSROOM_COURSES",
    "CLASSROOM_ENROLLMENTS",
    "CLASSROOM_SUBMISSIONS",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardError {
    #[error("generated query is empty")]
    Empty,
    #[error("only a single statement is allowed")]
    MultipleStatements,
    #[error("only SELECT queries are allowed")]
    NotSelect,
    #[error("keyword {0} is not permitted")]
    ForbiddenKeyword(String),
    #[error("system catalogs are not queryable")]
    CatalogAccess,
    #[error("query must read from the {QUERY_TABLE} table only")]
    WrongTable,
}

/// Validates a generated statement and returns it normalized (trimmed,
/// trailing semicolon removed). The caller must still cap the result set
/// and execute read-only.
pub fn validate_select(sql: &str) -> Result<String, GuardError> {
    let cleaned = sql.trim().trim_end_matches(';').trim().to_string();
    if cleaned.is_empty() {
        return Err(GuardError::Empty);
    }
    if cleaned.contains(';') {
        return Err(GuardError::MultipleStatements);
    }

    let upper = cleaned.to_uppercase();
    let tokens: Vec<&str> = upper
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .collect();

    match tokens.first() {
        Some(&"SELECT") | Some(&"WITH") => {}
        _ => return Err(GuardError::NotSelect),
    }

    for token in &tokens {
        if FORBIDDEN_KEYWORDS.contains(token) {
            return Err(GuardError::ForbiddenKeyword(token.to_string()));
        }
        if token.starts_with("PG_") || *token == "INFORMATION_SCHEMA" {
            return Err(GuardError::CatalogAccess);
        }
        if FORBIDDEN_TABLES.contains(token) {
            return Err(GuardError::WrongTable);
        }
    }

    if !tokens.iter().any(|t| *t == "DASHBOARD_METRICS") {
        return Err(GuardError::WrongTable);
    }

    Ok(cleaned)
}

/// Clamps a requested row count into `1..=cap`.
pub fn clamp_limit(requested: i64, cap: i64) -> i64 {
    requested.clamp(1, cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_select() {
        let sql = "SELECT course_id, late_submissions FROM dashboard_metrics WHERE app = 'classroom' ORDER BY late_submissions DESC LIMIT 5";
        assert_eq!(validate_select(sql).unwrap(), sql);
    }

    #[test]
    fn accepts_cte_and_strips_trailing_semicolon() {
        let sql = "WITH latest AS (SELECT MAX(metric_date) AS d FROM dashboard_metrics) SELECT * FROM dashboard_metrics, latest;";
        let cleaned = validate_select(sql).unwrap();
        assert!(!cleaned.ends_with(';'));
    }

    #[test]
    fn rejects_empty_and_whitespace() {
        assert_eq!(validate_select(""), Err(GuardError::Empty));
        assert_eq!(validate_select("  ;  "), Err(GuardError::Empty));
    }

    #[test]
    fn rejects_multiple_statements() {
        let sql = "SELECT 1 FROM dashboard_metrics; DROP TABLE dashboard_metrics";
        assert_eq!(validate_select(sql), Err(GuardError::MultipleStatements));
    }

    #[test]
    fn rejects_non_select() {
        assert_eq!(
            validate_select("EXPLAIN SELECT * FROM dashboard_metrics"),
            Err(GuardError::NotSelect)
        );
    }

    #[test]
    fn rejects_dml_keywords() {
        assert_eq!(
            validate_select("SELECT * FROM dashboard_metrics WHERE app = delete"),
            Err(GuardError::ForbiddenKeyword("DELETE".into()))
        );
        assert_eq!(
            validate_select("select * into copied from dashboard_metrics"),
            Err(GuardError::ForbiddenKeyword("INTO".into()))
        );
    }

    #[test]
    fn rejects_catalog_access() {
        assert_eq!(
            validate_select("SELECT * FROM pg_tables, dashboard_metrics"),
            Err(GuardError::CatalogAccess)
        );
        assert_eq!(
            validate_select("SELECT table_name FROM information_schema.tables"),
            Err(GuardError::CatalogAccess)
        );
    }

    #[test]
    fn rejects_raw_source_tables() {
        assert_eq!(
            validate_select("SELECT * FROM classroom_submissions"),
            Err(GuardError::WrongTable)
        );
        // Joining a raw table in is just as forbidden as reading it alone.
        assert_eq!(
            validate_select("SELECT * FROM dashboard_metrics d JOIN classroom_enrollments e ON d.course_id = e.course_id"),
            Err(GuardError::WrongTable)
        );
    }

    #[test]
    fn rejects_unknown_tables() {
        assert_eq!(
            validate_select("SELECT * FROM users"),
            Err(GuardError::WrongTable)
        );
    }

    #[test]
    fn clamp_limit_bounds() {
        assert_eq!(clamp_limit(0, 500), 1);
        assert_eq!(clamp_limit(-5, 500), 1);
        assert_eq!(clamp_limit(100, 500), 100);
        assert_eq!(clamp_limit(10_000, 500), 500);
    }
}
