//! The three independent checks every candidate query must clear.
//!
//! `keyword` and `structural` are pure and synchronous; `semantic` is the only
//! gate that talks to a model and always runs last.

pub mod keyword;
pub mod lexer;
pub mod semantic;
pub mod structural;

use serde::Serialize;

pub use lexer::{LexError, Token, TokenKind, statement_body, tokenize};

/// Functions that run SQL handed to them as text, or read a whole relation or
/// schema by name. The relations they touch never appear as tokens.
pub const QUERY_STRING_FUNCTIONS: &[&str] = &[
    "query_to_xml",
    "query_to_xmlschema",
    "query_to_xml_and_xmlschema",
    "table_to_xml",
    "table_to_xmlschema",
    "table_to_xml_and_xmlschema",
    "cursor_to_xml",
    "cursor_to_xmlschema",
    "schema_to_xml",
    "schema_to_xmlschema",
    "schema_to_xml_and_xmlschema",
    "database_to_xml",
    "database_to_xmlschema",
    "database_to_xml_and_xmlschema",
    "ts_stat",
    "ts_rewrite",
];

pub(crate) fn runs_query_string(function: &str) -> bool {
    QUERY_STRING_FUNCTIONS.contains(&function)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub referenced_tables: Vec<String>,
}

impl GateResult {
    pub fn pass() -> Self {
        Self {
            ok: true,
            reason: None,
            referenced_tables: Vec::new(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
            referenced_tables: Vec::new(),
        }
    }

    pub fn with_tables(mut self, tables: Vec<String>) -> Self {
        self.referenced_tables = tables;
        self
    }

    pub fn reason_or_default(&self) -> &str {
        self.reason.as_deref().unwrap_or("rejected")
    }
}
