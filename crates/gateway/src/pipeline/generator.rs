//! Prompt construction and reply parsing for query generation.
//!
//! The model is asked for a fenced SQL block plus an `Explanation:` section,
//! or for a single `AMBIGUOUS: <reason>` line when the question leans on
//! context the conversation does not contain.

use sqlgate_contracts::{HistoryMessage, MessageRole};
use sqlgate_model::{LanguageModel, ModelError, Prompt, PromptPurpose, generate_traced};

pub const AMBIGUOUS_MARKER: &str = "AMBIGUOUS:";
const DEFAULT_EXPLANATION: &str = "Retrieves the requested data.";
/// History entries included in the prompt, newest last.
const PROMPT_HISTORY: usize = 6;
const MAX_HISTORY_CHARS: usize = 600;

const SYSTEM_PROMPT: &str = "You are a PostgreSQL expert. Convert the user's question into a single read-only SQL query.

## Rules
1. Produce exactly one SELECT statement (a leading WITH ... SELECT is allowed). Never use INSERT, UPDATE, DELETE, MERGE, DROP, ALTER, CREATE, TRUNCATE, GRANT, REVOKE, COPY, CALL or EXECUTE.
2. Use only the tables and columns listed in the schema below.
3. Order results so they are easy to read.
4. Include a matching GROUP BY whenever you aggregate.
5. Use PostgreSQL date functions for date arithmetic.
6. If the question refers to something earlier in the conversation (\"that\", \"those\", \"the same\", \"it\") and the conversation below does not contain it, reply with a single line `AMBIGUOUS: <what is missing>` and nothing else.

## Output format
SQL:
```sql
<the query>
```
Explanation: <one or two sentences describing what the query returns>

## Database schema
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub sql: String,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generation {
    Candidate(Candidate),
    Ambiguous(String),
}

#[derive(Debug)]
pub enum GenerateError {
    Model(ModelError),
    NoQuery,
}

impl std::fmt::Display for GenerateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerateError::Model(err) => write!(f, "{}", err),
            GenerateError::NoQuery => write!(f, "model reply contained no SQL block"),
        }
    }
}

impl std::error::Error for GenerateError {}

pub struct GenerationInput<'a> {
    pub question: &'a str,
    pub history: &'a [HistoryMessage],
    pub schema_text: &'a str,
    pub attempt: u32,
    pub hint: Option<&'a str>,
}

pub fn build_prompt(input: &GenerationInput<'_>) -> Prompt {
    let mut system = String::from(SYSTEM_PROMPT);
    system.push_str(input.schema_text);

    let mut user = String::new();
    let recent = input
        .history
        .len()
        .saturating_sub(PROMPT_HISTORY);
    let history = &input.history[recent..];
    if !history.is_empty() {
        user.push_str("## Conversation so far\n");
        for message in history {
            let role = match message.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            };
            user.push_str(&format!("{}: {}\n", role, clip(&message.content)));
            if let Some(sql) = message.sql.as_deref() {
                user.push_str(&format!("  (query: {})\n", clip(sql)));
            }
        }
        user.push('\n');
    }

    if let Some(hint) = input.hint {
        user.push_str(&format!(
            "## Previous attempt rejected (attempt {})\n{}\nWrite a different query that avoids this problem.\n\n",
            input.attempt.saturating_sub(1),
            hint
        ));
    }

    user.push_str("## Question\n");
    user.push_str(input.question.trim());
    Prompt::new(PromptPurpose::Generate, system, user)
}

pub async fn generate(
    model: &dyn LanguageModel,
    input: &GenerationInput<'_>,
) -> Result<Generation, GenerateError> {
    let text = generate_traced(model, &build_prompt(input))
        .await
        .map_err(GenerateError::Model)?;
    parse_reply(&text)
}

pub fn parse_reply(text: &str) -> Result<Generation, GenerateError> {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix(AMBIGUOUS_MARKER) {
        let reason = rest.lines().next().unwrap_or("").trim();
        return Ok(Generation::Ambiguous(reason.to_string()));
    }

    let sql = fenced_block(trimmed).ok_or(GenerateError::NoQuery)?;
    let explanation = explanation_section(trimmed)
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| DEFAULT_EXPLANATION.to_string());

    Ok(Generation::Candidate(Candidate { sql, explanation }))
}

fn fenced_block(text: &str) -> Option<String> {
    let body_start = match text.find("```sql") {
        Some(start) => start + "```sql".len(),
        None => text.find("```")? + 3,
    };
    let rest = &text[body_start..];
    let end = rest.find("```")?;
    let sql = rest[..end].trim();
    (!sql.is_empty()).then(|| sql.to_string())
}

fn explanation_section(text: &str) -> Option<String> {
    let start = text.find("Explanation:")? + "Explanation:".len();
    let rest = &text[start..];
    let end = rest.find("```").unwrap_or(rest.len());
    Some(rest[..end].trim().to_string())
}

fn clip(text: &str) -> String {
    if text.chars().count() <= MAX_HISTORY_CHARS {
        return text.replace('\n', " ");
    }
    let mut out = text.chars().take(MAX_HISTORY_CHARS).collect::<String>();
    out.push_str("...");
    out.replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(history: &'a [HistoryMessage], hint: Option<&'a str>) -> GenerationInput<'a> {
        GenerationInput {
            question: "How many orders shipped last week?",
            history,
            schema_text: "### orders\n| id | integer |",
            attempt: 2,
            hint,
        }
    }

    #[test]
    fn parses_sql_block_and_explanation() {
        let reply = "SQL:\n```sql\nSELECT count(*) FROM orders\n```\nExplanation: Counts orders.";
        let Generation::Candidate(candidate) = parse_reply(reply).unwrap() else {
            panic!("expected a candidate");
        };
        assert_eq!(candidate.sql, "SELECT count(*) FROM orders");
        assert_eq!(candidate.explanation, "Counts orders.");
    }

    #[test]
    fn bare_fence_and_missing_explanation_are_accepted() {
        let Generation::Candidate(candidate) = parse_reply("```\nSELECT 1\n```").unwrap() else {
            panic!("expected a candidate");
        };
        assert_eq!(candidate.sql, "SELECT 1");
        assert_eq!(candidate.explanation, DEFAULT_EXPLANATION);
    }

    #[test]
    fn ambiguous_marker_short_circuits() {
        let reply = "AMBIGUOUS: no earlier result to refer to\nextra";
        assert_eq!(
            parse_reply(reply).unwrap(),
            Generation::Ambiguous("no earlier result to refer to".to_string())
        );
    }

    #[test]
    fn prose_without_sql_is_an_error() {
        assert!(matches!(
            parse_reply("I cannot help with that."),
            Err(GenerateError::NoQuery)
        ));
        assert!(matches!(parse_reply("```sql\n  \n```"), Err(GenerateError::NoQuery)));
    }

    #[test]
    fn prompt_carries_schema_history_and_hint() {
        let history = vec![
            HistoryMessage::user("orders by region", 1),
            HistoryMessage::assistant("Returned 3 rows", Some("SELECT region FROM orders".to_string()), 2),
        ];
        let prompt = build_prompt(&input(&history, Some("keyword gate rejected the previous query: DELETE")));
        assert_eq!(prompt.purpose, PromptPurpose::Generate);
        assert!(prompt.system.ends_with("### orders\n| id | integer |"));
        assert!(prompt.user.contains("user: orders by region"));
        assert!(prompt.user.contains("(query: SELECT region FROM orders)"));
        assert!(prompt.user.contains("Previous attempt rejected (attempt 1)"));
        assert!(prompt.user.contains("DELETE"));
        assert!(prompt.user.ends_with("How many orders shipped last week?"));
    }

    #[test]
    fn prompt_sections_are_laid_out_in_order() {
        let history = vec![HistoryMessage::user("orders by region", 1)];
        let prompt = build_prompt(&input(&history, Some("unknown column 'regoin'")));
        assert_eq!(
            prompt.user,
            "## Conversation so far\nuser: orders by region\n\n\
             ## Previous attempt rejected (attempt 1)\nunknown column 'regoin'\n\
             Write a different query that avoids this problem.\n\n\
             ## Question\nHow many orders shipped last week?"
        );
    }

    #[test]
    fn first_attempt_prompt_has_no_hint_section() {
        let prompt = build_prompt(&input(&[], None));
        assert!(!prompt.user.contains("Previous attempt"));
        assert!(!prompt.user.contains("Conversation so far"));
    }
}
