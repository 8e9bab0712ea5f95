//! Identifier quoting rules for the supported target dialects.
//!
//! Table names coming out of the export descriptor are used verbatim in
//! generated SQL, loader control files, and bookkeeping rows, so names that
//! collide with reserved words or rely on case must be wrapped in double
//! quotes exactly once, before any splitting starts.

/// PostgreSQL reserved words that force quoting (the subset that shows up as
/// table or column names in practice).
const RESERVED_PG: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "asymmetric", "both",
    "case", "cast", "check", "collate", "column", "constraint", "create", "current_date",
    "current_role", "current_time", "current_timestamp", "current_user", "default",
    "deferrable", "desc", "distinct", "do", "else", "end", "except", "false", "fetch", "for",
    "foreign", "from", "grant", "group", "having", "in", "initially", "intersect", "into",
    "lateral", "leading", "limit", "localtime", "localtimestamp", "not", "null", "offset",
    "on", "only", "or", "order", "placing", "primary", "references", "returning", "select",
    "session_user", "some", "symmetric", "table", "then", "to", "trailing", "true", "union",
    "unique", "user", "using", "variadic", "when", "where", "window", "with",
];

/// Oracle reserved words that force quoting.
const RESERVED_ORACLE: &[&str] = &[
    "access", "add", "all", "alter", "and", "any", "as", "asc", "audit", "between", "by",
    "char", "check", "cluster", "column", "comment", "compress", "connect", "create",
    "current", "date", "decimal", "default", "delete", "desc", "distinct", "drop", "else",
    "exclusive", "exists", "file", "float", "for", "from", "grant", "group", "having",
    "identified", "immediate", "in", "increment", "index", "initial", "insert", "integer",
    "intersect", "into", "is", "level", "like", "lock", "long", "maxextents", "minus", "mode",
    "modify", "noaudit", "nocompress", "not", "nowait", "null", "number", "of", "offline",
    "on", "online", "option", "or", "order", "pctfree", "prior", "public", "raw", "rename",
    "resource", "revoke", "row", "rowid", "rownum", "rows", "select", "session", "set",
    "share", "size", "smallint", "start", "successful", "synonym", "sysdate", "table", "then",
    "to", "trigger", "uid", "union", "unique", "update", "user", "validate", "values",
    "varchar", "varchar2", "view", "whenever", "where", "with",
];

/// Returns `true` if the identifier is already wrapped in double quotes.
pub fn is_quoted(identifier: &str) -> bool {
    identifier.len() >= 2 && identifier.starts_with('"') && identifier.ends_with('"')
}

/// Wraps an identifier in double quotes.
pub fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

/// Returns `true` if the name is reserved in PostgreSQL / YugabyteDB.
pub fn is_reserved_pg(identifier: &str) -> bool {
    RESERVED_PG.contains(&identifier.to_ascii_lowercase().as_str())
}

/// Returns `true` if the name is reserved in Oracle.
pub fn is_reserved_oracle(identifier: &str) -> bool {
    RESERVED_ORACLE.contains(&identifier.to_ascii_lowercase().as_str())
}

/// PostgreSQL folds unquoted identifiers to lowercase, so anything carrying an
/// uppercase character is case-sensitive.
pub fn is_case_sensitive_pg(identifier: &str) -> bool {
    identifier.chars().any(|c| c.is_ascii_uppercase())
}

/// Oracle folds unquoted identifiers to uppercase, so anything carrying a
/// lowercase character is case-sensitive.
pub fn is_case_sensitive_oracle(identifier: &str) -> bool {
    identifier.chars().any(|c| c.is_ascii_lowercase())
}

/// Quotes one part of a PostgreSQL object name if the name needs it.
pub fn quote_if_required_pg(identifier: &str) -> String {
    if is_quoted(identifier) {
        return identifier.to_string();
    }

    if is_reserved_pg(identifier) || is_case_sensitive_pg(identifier) {
        return quote(identifier);
    }

    identifier.to_string()
}

/// Quotes one part of an Oracle object name if the name needs it.
pub fn quote_if_required_oracle(identifier: &str) -> String {
    if is_quoted(identifier) {
        return identifier.to_string();
    }

    if is_reserved_oracle(identifier) || is_case_sensitive_oracle(identifier) {
        return quote(identifier);
    }

    identifier.to_string()
}
