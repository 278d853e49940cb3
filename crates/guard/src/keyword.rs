use crate::GateResult;
use crate::lexer::{TokenKind, tokenize};

/// Statement words that can write, change schema, change privileges, run
/// procedures or alter session state. Matched against bare words only.
pub const DENIED_KEYWORDS: &[&str] = &[
    // DML
    "UPDATE", "DELETE", "INSERT", "TRUNCATE", "MERGE", "UPSERT", "INTO",
    // DDL
    "DROP", "ALTER", "CREATE", "RENAME", "MODIFY",
    // DCL
    "GRANT", "REVOKE",
    // procedures and server commands
    "EXEC", "EXECUTE", "CALL", "DO", "COPY", "VACUUM", "ANALYZE", "REINDEX", "CLUSTER",
    "REFRESH", "LOCK", "NOTIFY", "LISTEN", "IMPORT", "PREPARE", "DEALLOCATE", "DISCARD",
    // transaction and session control
    "COMMIT", "ROLLBACK", "SAVEPOINT", "BEGIN", "SET", "RESET", "LOAD",
];

pub fn is_denied(word: &str) -> bool {
    DENIED_KEYWORDS
        .iter()
        .any(|kw| kw.eq_ignore_ascii_case(word))
}

pub fn check(sql: &str) -> GateResult {
    if sql.trim().is_empty() {
        return GateResult::reject("empty statement");
    }

    let tokens = match tokenize(sql) {
        Ok(tokens) => tokens,
        Err(err) => return GateResult::reject(format!("statement could not be tokenized: {}", err)),
    };
    if tokens.is_empty() {
        return GateResult::reject("empty statement");
    }

    let last = tokens.len() - 1;
    if tokens
        .iter()
        .enumerate()
        .any(|(idx, t)| t.is_punct(';') && idx != last)
    {
        return GateResult::reject("multiple statements are not allowed");
    }

    let mut detected = Vec::<String>::new();
    for token in tokens.iter().filter(|t| t.kind == TokenKind::Word) {
        if is_denied(&token.text) {
            let upper = token.text.to_ascii_uppercase();
            if !detected.contains(&upper) {
                detected.push(upper);
            }
        }
    }
    if !detected.is_empty() {
        return GateResult::reject(format!("forbidden keyword: {}", detected.join(", ")));
    }

    let leading = tokens.iter().find(|t| !t.is_punct('('));
    match leading {
        Some(t) if t.is_word("SELECT") || t.is_word("WITH") => GateResult::pass(),
        _ => GateResult::reject("only SELECT statements are allowed"),
    }
}
