//! Last line of defence before a human sees the query.
//!
//! A token-level pre-filter rejects patterns no audit answer can excuse. What
//! passes it goes to the model, and only an answer that is exactly `SAFE`
//! counts as a pass. Model failures reject.

use std::time::Instant;

use sqlgate_model::{LanguageModel, Prompt, PromptPurpose, generate_traced};
use tracing::Instrument;

use crate::lexer::{Token, TokenKind, tokenize};
use crate::{GateResult, runs_query_string};

pub const SAFE_MARKER: &str = "SAFE";

pub const AUDIT_SYSTEM_PROMPT: &str = "You are a SQL security auditor for a read-only analytics service.
Decide whether the PostgreSQL query below is a safe, read-only data query.

SAFE queries:
- SELECT statements that only read data
- filtering, aggregation, sorting, joins, CTEs and subqueries over business tables

UNSAFE queries:
- access to system catalogs or server metadata (pg_catalog, information_schema, pg_* views)
- privilege escalation or reading other users' credentials
- SQL injection patterns (always-true predicates such as OR 1=1, comment tricks)
- bulk extraction of entire large tables with no filter or limit
- UNION used to splice unrelated or sensitive data into the result
- subqueries used to reach sensitive data
- deliberately obfuscated or needlessly convoluted SQL

Answer with exactly one line:
- SAFE
- UNSAFE: <short reason>";

const SYSTEM_OBJECTS: &[&str] = &[
    "pg_catalog",
    "information_schema",
    "pg_shadow",
    "pg_authid",
    "pg_roles",
    "pg_user",
    "pg_stat_activity",
];

const DENIED_FUNCTIONS: &[&str] = &[
    "pg_read_file",
    "pg_read_binary_file",
    "pg_ls_dir",
    "pg_stat_file",
    "lo_import",
    "lo_export",
    "set_config",
    "current_setting",
    "pg_terminate_backend",
    "pg_cancel_backend",
    "pg_reload_conf",
];

const DENIED_FUNCTION_PREFIXES: &[&str] = &["dblink", "pg_sleep"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Safe,
    Unsafe(String),
}

/// Deterministic rules applied before any model call. Returns the rejection reason.
pub fn prefilter(sql: &str) -> Option<String> {
    let tokens = match tokenize(sql) {
        Ok(tokens) => tokens,
        Err(err) => return Some(format!("statement could not be tokenized: {}", err)),
    };

    for (i, token) in tokens.iter().enumerate() {
        if !token.is_identifier() {
            continue;
        }
        let key = token.ident_key();
        let is_call = tokens.get(i + 1).is_some_and(|n| n.is_punct('('));

        if is_call
            && (DENIED_FUNCTIONS.contains(&key.as_str())
                || runs_query_string(&key)
                || DENIED_FUNCTION_PREFIXES.iter().any(|p| key.starts_with(p)))
        {
            return Some(format!("dangerous function: {}", key));
        }
        if SYSTEM_OBJECTS.contains(&key.as_str()) {
            return Some(format!("system table access: {}", key));
        }
    }

    if has_tautology(&tokens) {
        return Some("injection pattern: always-true condition".to_string());
    }
    None
}

/// `OR <lit> = <same lit>` or `OR TRUE`.
fn has_tautology(tokens: &[Token]) -> bool {
    tokens.iter().enumerate().any(|(i, t)| {
        if !t.is_word("OR") {
            return false;
        }
        let rest = &tokens[i + 1..];
        let operand = rest
            .iter()
            .position(|t| !t.is_punct('('))
            .map(|skip| &rest[skip..])
            .unwrap_or(&[]);
        match operand {
            [first, ..] if first.is_word("TRUE") => true,
            [lhs, op, rhs, ..] => {
                lhs.is_literal()
                    && op.is_operator("=")
                    && rhs.kind == lhs.kind
                    && literal_value(lhs) == literal_value(rhs)
            }
            _ => false,
        }
    })
}

fn literal_value(token: &Token) -> String {
    match token.kind {
        TokenKind::Number => token.text.trim_start_matches('0').to_string(),
        _ => token.text.clone(),
    }
}

pub fn audit_prompt(sql: &str, explanation: &str) -> Prompt {
    let user = format!(
        "Audit this query.\n\n```sql\n{}\n```\n\nStated purpose: {}",
        sql.trim(),
        explanation.trim()
    );
    Prompt::new(PromptPurpose::Audit, AUDIT_SYSTEM_PROMPT, user)
}

/// Only the exact marker passes; `safe`, `SAFE.` or `SAFE but ...` do not.
pub fn parse_verdict(raw: &str) -> Verdict {
    let text = raw.trim();
    if text == SAFE_MARKER {
        return Verdict::Safe;
    }
    if let Some(rest) = text.strip_prefix("UNSAFE") {
        let reason = rest.trim_start_matches(':').trim();
        let reason = reason.lines().next().unwrap_or("").trim();
        if reason.is_empty() {
            return Verdict::Unsafe("flagged as unsafe".to_string());
        }
        return Verdict::Unsafe(reason.chars().take(200).collect());
    }
    Verdict::Unsafe("audit verdict not recognised".to_string())
}

/// Caller-facing wording for a semantic rejection. Never echoes model text.
pub fn user_message(reason: &str) -> &'static str {
    let lower = reason.to_ascii_lowercase();
    if lower.contains("system table") || lower.contains("catalog") {
        "system information cannot be queried"
    } else if lower.contains("injection") || lower.contains("dangerous function") {
        "this query cannot be run for security reasons"
    } else if lower.contains("bulk") || lower.contains("entire") || lower.contains("too many") {
        "the question asks for too much data; add a condition to narrow it"
    } else if lower.contains("union") {
        "this form of query is not supported"
    } else {
        "the query did not pass the security review; please rephrase the question"
    }
}

/// Runs the pre-filter and, when `model` is given, the model audit.
pub async fn check(model: Option<&dyn LanguageModel>, sql: &str, explanation: &str) -> GateResult {
    let span = tracing::info_span!(
        "gate.semantic",
        audited = model.is_some(),
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    async move {
        let result = evaluate(model, sql, explanation).await;
        tracing::Span::current().record("latency_ms", started.elapsed().as_millis() as u64);
        tracing::Span::current().record("outcome", if result.ok { "pass" } else { "reject" });
        result
    }
    .instrument(span)
    .await
}

async fn evaluate(model: Option<&dyn LanguageModel>, sql: &str, explanation: &str) -> GateResult {
    if sql.trim().is_empty() {
        return GateResult::reject("empty statement");
    }
    if let Some(reason) = prefilter(sql) {
        return GateResult::reject(reason);
    }
    let Some(model) = model else {
        return GateResult::pass();
    };

    match generate_traced(model, &audit_prompt(sql, explanation)).await {
        Ok(text) => match parse_verdict(&text) {
            Verdict::Safe => GateResult::pass(),
            Verdict::Unsafe(reason) => GateResult::reject(reason),
        },
        Err(err) => {
            tracing::warn!(error = %err, "semantic audit unavailable, rejecting");
            GateResult::reject("semantic audit unavailable")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlgate_model::ScriptedModel;

    #[test]
    fn only_the_exact_marker_is_safe() {
        assert_eq!(parse_verdict("SAFE"), Verdict::Safe);
        assert_eq!(parse_verdict("  SAFE\n"), Verdict::Safe);
        for ambiguous in ["safe", "SAFE.", "SAFE but check the join", "It is SAFE", "", "UNSAFEish"] {
            assert!(
                matches!(parse_verdict(ambiguous), Verdict::Unsafe(_)),
                "{ambiguous:?}"
            );
        }
        assert_eq!(
            parse_verdict("UNSAFE: reads pg_shadow\nmore text"),
            Verdict::Unsafe("reads pg_shadow".to_string())
        );
    }

    #[test]
    fn prefilter_catches_system_objects_functions_and_tautologies() {
        assert_eq!(
            prefilter("SELECT * FROM pg_catalog.pg_tables").as_deref(),
            Some("system table access: pg_catalog")
        );
        assert!(prefilter("SELECT usename FROM pg_shadow").is_some());
        assert_eq!(
            prefilter("SELECT pg_read_file('/etc/passwd')").as_deref(),
            Some("dangerous function: pg_read_file")
        );
        assert!(prefilter("SELECT pg_sleep_for('5 minutes')").is_some());
        assert!(prefilter("SELECT * FROM dblink_exec('x')").is_some());
        assert!(prefilter("SELECT current_setting('is_superuser')").is_some());
        assert!(prefilter("SELECT * FROM orders WHERE id = 5 OR 1=1").is_some());
        assert!(prefilter("SELECT * FROM orders WHERE id = 5 OR ('a' = 'a')").is_some());
        assert!(prefilter("SELECT * FROM orders WHERE id = 5 OR TRUE").is_some());
    }

    #[test]
    fn prefilter_rejects_every_function_that_runs_query_text() {
        for function in crate::QUERY_STRING_FUNCTIONS {
            let sql = format!("SELECT {}('select * from salaries', true, false, '')", function);
            assert_eq!(
                prefilter(&sql),
                Some(format!("dangerous function: {}", function)),
                "{}",
                sql
            );
        }
        assert_eq!(
            prefilter("SELECT * FROM ts_stat('SELECT body FROM salaries')").as_deref(),
            Some("dangerous function: ts_stat")
        );
        assert!(prefilter("SELECT QUERY_TO_XML('select 1', true, false, '')").is_some());
    }

    #[test]
    fn prefilter_ignores_literals_and_ordinary_predicates() {
        assert!(prefilter("SELECT * FROM logs WHERE message = 'pg_shadow'").is_none());
        assert!(prefilter("SELECT * FROM orders WHERE status = 'a' OR status = 'b'").is_none());
        assert!(prefilter("SELECT * FROM orders WHERE id = 1 OR id = 2").is_none());
        assert!(prefilter("SELECT * FROM orders WHERE 1 = 1 AND total > 5").is_none());
    }

    #[test]
    fn user_messages_do_not_echo_reasons() {
        assert_eq!(
            user_message("system table access: pg_roles"),
            "system information cannot be queried"
        );
        assert_eq!(
            user_message("Possible SQL injection"),
            "this query cannot be run for security reasons"
        );
        assert_eq!(
            user_message("UNION merges unrelated data"),
            "this form of query is not supported"
        );
    }

    #[tokio::test]
    async fn model_verdicts_decide_after_the_prefilter() {
        let model = ScriptedModel::new()
            .reply(PromptPurpose::Audit, "SAFE")
            .reply(PromptPurpose::Audit, "UNSAFE: bulk export")
            .reply(PromptPurpose::Audit, "Looks SAFE to me");

        let sql = "SELECT id FROM orders";
        assert!(check(Some(&model), sql, "ids").await.ok);

        let rejected = check(Some(&model), sql, "ids").await;
        assert_eq!(rejected.reason.as_deref(), Some("bulk export"));

        let ambiguous = check(Some(&model), sql, "ids").await;
        assert!(!ambiguous.ok);

        let blocked = check(Some(&model), "SELECT * FROM pg_user", "users").await;
        assert!(!blocked.ok);
        assert_eq!(model.call_count(PromptPurpose::Audit), 3);
    }

    #[tokio::test]
    async fn model_failure_fails_closed() {
        let model = ScriptedModel::new().fail(PromptPurpose::Audit);
        let result = check(Some(&model), "SELECT 1", "one").await;
        assert!(!result.ok);
        assert_eq!(result.reason.as_deref(), Some("semantic audit unavailable"));
    }

    #[tokio::test]
    async fn without_a_model_only_the_prefilter_runs() {
        assert!(check(None, "SELECT 1", "one").await.ok);
        assert!(!check(None, "SELECT lo_import('/tmp/x')", "x").await.ok);
    }

    #[test]
    fn audit_prompt_carries_query_and_purpose() {
        let prompt = audit_prompt("SELECT 1;", "one row");
        assert_eq!(prompt.purpose, PromptPurpose::Audit);
        assert!(prompt.user.contains("```sql\nSELECT 1;\n```"));
        assert!(prompt.user.contains("Stated purpose: one row"));
    }
}
