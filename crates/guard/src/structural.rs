//! Reference check against the caller's schema view.
//!
//! This is not a SQL parser. It walks the token stream, recognises the places
//! where PostgreSQL names a relation (`FROM`/`JOIN` items, CTE definitions)
//! and the places where it names a column, and resolves both against the
//! snapshot. Scoping is flattened to the whole statement: a qualifier or alias
//! defined anywhere is visible everywhere.

use std::collections::{BTreeSet, HashMap, HashSet};

use sqlgate_contracts::{SchemaSnapshot, TableInfo};

use crate::lexer::{Token, TokenKind, tokenize};
use crate::{GateResult, runs_query_string};

/// Functions whose argument list may contain a bare `FROM` that is not a table clause.
const FROM_ARG_FUNCTIONS: &[&str] = &["EXTRACT", "SUBSTRING", "TRIM", "OVERLAY", "POSITION"];

/// Words that end a `FROM` item, so they can never be an implicit alias.
const CLAUSE_WORDS: &[&str] = &[
    "WHERE", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS", "NATURAL", "ON",
    "USING", "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "FETCH", "UNION", "INTERSECT",
    "EXCEPT", "WINDOW", "FOR", "TABLESAMPLE", "LATERAL", "SELECT", "FROM", "AS", "AND", "OR",
    "NOT", "WITH", "RETURNING", "THEN", "WHEN", "ELSE", "END", "ONLY",
];

/// Bare words that may appear in expression position without naming a column.
const EXPRESSION_WORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "AND", "OR", "NOT", "NULL", "TRUE", "FALSE", "AS", "ON", "JOIN",
    "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS", "NATURAL", "USING", "GROUP", "BY",
    "ORDER", "ASC", "DESC", "NULLS", "FIRST", "LAST", "LIMIT", "OFFSET", "HAVING", "DISTINCT",
    "ALL", "ANY", "SOME", "UNION", "INTERSECT", "EXCEPT", "CASE", "WHEN", "THEN", "ELSE", "END",
    "IN", "IS", "ISNULL", "NOTNULL", "LIKE", "ILIKE", "SIMILAR", "BETWEEN", "SYMMETRIC",
    "EXISTS", "WITH", "RECURSIVE", "MATERIALIZED", "INTERVAL", "CAST", "FILTER", "OVER",
    "PARTITION", "ROWS", "RANGE", "GROUPS", "UNBOUNDED", "PRECEDING", "FOLLOWING", "CURRENT",
    "ROW", "WINDOW", "FETCH", "NEXT", "ONLY", "TIES", "LATERAL", "ESCAPE", "COLLATE", "AT",
    "ZONE", "WITHOUT", "WITHIN", "ORDINALITY", "VALUES", "ARRAY", "PLACING", "FOR", "BOTH",
    "LEADING", "TRAILING", "UNKNOWN", "OF", "PERCENT", "DEFAULT", "TABLE",
    // special values
    "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP", "LOCALTIME", "LOCALTIMESTAMP",
    "CURRENT_USER", "SESSION_USER", "CURRENT_ROLE", "CURRENT_SCHEMA", "CURRENT_CATALOG",
    // date parts
    "YEAR", "MONTH", "DAY", "HOUR", "MINUTE", "SECOND", "WEEK", "QUARTER", "DOW", "DOY",
    "EPOCH", "ISODOW", "ISOYEAR", "CENTURY", "DECADE", "MILLENNIUM", "MILLISECONDS",
    "MICROSECONDS", "TIMEZONE", "TIMEZONE_HOUR", "TIMEZONE_MINUTE",
    // type names used in casts and typed literals
    "DATE", "TIME", "TIMESTAMP", "TIMESTAMPTZ", "TIMETZ", "VARCHAR", "CHAR", "CHARACTER",
    "VARYING", "TEXT", "INTEGER", "INT", "INT2", "INT4", "INT8", "BIGINT", "SMALLINT",
    "NUMERIC", "DECIMAL", "REAL", "DOUBLE", "PRECISION", "FLOAT", "FLOAT4", "FLOAT8", "BOOLEAN",
    "BOOL", "JSON", "JSONB", "UUID", "BYTEA", "MONEY",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    /// A catalog table, by its catalog name.
    Table(String),
    /// A CTE, subquery, `VALUES` list or set-returning function: any column is accepted.
    Derived,
}

#[derive(Default)]
struct References {
    tables: BTreeSet<String>,
    /// Qualifier (alias or unaliased table name, lowercased) to what it may stand for.
    qualifiers: HashMap<String, Vec<Source>>,
    /// Output names the statement itself defines: CTE names, aliases, column lists.
    defined_names: HashSet<String>,
    /// Token positions already accounted for as relation or alias names.
    consumed: HashSet<usize>,
}

impl References {
    fn add_qualifier(&mut self, name: String, source: Source) {
        self.defined_names.insert(name.clone());
        self.qualifiers.entry(name).or_default().push(source);
    }
}

pub fn check(sql: &str, schema: &SchemaSnapshot) -> GateResult {
    let tokens = match tokenize(sql) {
        Ok(tokens) => tokens,
        Err(err) => {
            return GateResult::reject(format!("statement could not be tokenized: {}", err));
        }
    };
    if !parens_balanced(&tokens) {
        return GateResult::reject("unbalanced parentheses");
    }

    let mut refs = References::default();
    let cte_names = collect_ctes(&tokens, &mut refs);

    if let Err(reason) = collect_relations(&tokens, schema, &cte_names, &mut refs) {
        return GateResult::reject(reason);
    }
    collect_output_aliases(&tokens, &mut refs);

    if let Err(reason) = check_columns(&tokens, schema, &refs) {
        return GateResult::reject(reason);
    }

    GateResult::pass().with_tables(refs.tables.into_iter().collect())
}

fn parens_balanced(tokens: &[Token]) -> bool {
    let mut depth = 0i64;
    for t in tokens {
        if t.is_punct('(') {
            depth += 1;
        } else if t.is_punct(')') {
            depth -= 1;
            if depth < 0 {
                return false;
            }
        }
    }
    depth == 0
}

/// Index just past the `)` matching the `(` at `open`.
fn skip_parens(tokens: &[Token], open: usize) -> usize {
    let mut depth = 0usize;
    let mut i = open;
    while i < tokens.len() {
        if tokens[i].is_punct('(') {
            depth += 1;
        } else if tokens[i].is_punct(')') {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return i + 1;
            }
        }
        i += 1;
    }
    tokens.len()
}

fn is_word_in(token: &Token, words: &[&str]) -> bool {
    token.kind == TokenKind::Word && words.iter().any(|w| token.text.eq_ignore_ascii_case(w))
}

/// A token that can name something the statement defines (alias, CTE).
fn is_name(token: &Token) -> bool {
    token.kind == TokenKind::QuotedIdent
        || (token.kind == TokenKind::Word && !is_word_in(token, CLAUSE_WORDS))
}

/// Records the identifiers inside a `( a, b, ... )` list as defined names.
fn take_column_list(tokens: &[Token], open: usize, refs: &mut References) -> usize {
    let end = skip_parens(tokens, open);
    for idx in open + 1..end.saturating_sub(1) {
        if tokens[idx].is_identifier() {
            refs.defined_names.insert(tokens[idx].ident_key());
            refs.consumed.insert(idx);
        }
    }
    end
}

fn collect_ctes(tokens: &[Token], refs: &mut References) -> HashSet<String> {
    let mut names = HashSet::new();
    let mut i = 0;
    while i < tokens.len() {
        if !tokens[i].is_word("WITH") {
            i += 1;
            continue;
        }
        i += 1;
        if tokens.get(i).is_some_and(|t| t.is_word("RECURSIVE")) {
            i += 1;
        }
        loop {
            let Some(name) = tokens.get(i).filter(|t| is_name(t)) else {
                break;
            };
            let key = name.ident_key();
            refs.consumed.insert(i);
            i += 1;
            if tokens.get(i).is_some_and(|t| t.is_punct('(')) {
                i = take_column_list(tokens, i, refs);
            }
            if !tokens.get(i).is_some_and(|t| t.is_word("AS")) {
                break;
            }
            i += 1;
            if tokens.get(i).is_some_and(|t| t.is_word("NOT")) {
                i += 1;
            }
            if tokens.get(i).is_some_and(|t| t.is_word("MATERIALIZED")) {
                i += 1;
            }
            if !tokens.get(i).is_some_and(|t| t.is_punct('(')) {
                break;
            }
            names.insert(key.clone());
            refs.add_qualifier(key, Source::Derived);
            // The CTE body is scanned later like any other part of the statement.
            i = skip_parens(tokens, i);
            if tokens.get(i).is_some_and(|t| t.is_punct(',')) {
                i += 1;
                continue;
            }
            break;
        }
    }
    names
}

fn collect_relations(
    tokens: &[Token],
    schema: &SchemaSnapshot,
    cte_names: &HashSet<String>,
    refs: &mut References,
) -> Result<(), String> {
    // Word that opened each currently open parenthesis.
    let mut paren_owners: Vec<Option<String>> = Vec::new();

    for (i, token) in tokens.iter().enumerate() {
        if token.is_punct('(') {
            let owner = i
                .checked_sub(1)
                .map(|p| &tokens[p])
                .filter(|p| p.kind == TokenKind::Word)
                .map(|p| p.text.to_ascii_uppercase());
            paren_owners.push(owner);
            continue;
        }
        if token.is_punct(')') {
            paren_owners.pop();
            continue;
        }

        let is_table_clause = if token.is_word("JOIN") || token.is_word("TABLE") {
            true
        } else if token.is_word("FROM") {
            let in_function_args = paren_owners
                .last()
                .and_then(|o| o.as_deref())
                .is_some_and(|o| FROM_ARG_FUNCTIONS.contains(&o));
            let after_distinct = i > 0 && tokens[i - 1].is_word("DISTINCT");
            !in_function_args && !after_distinct
        } else {
            false
        };

        if is_table_clause {
            parse_from_items(tokens, i + 1, schema, cte_names, refs)?;
        }
    }
    Ok(())
}

fn parse_from_items(
    tokens: &[Token],
    mut i: usize,
    schema: &SchemaSnapshot,
    cte_names: &HashSet<String>,
    refs: &mut References,
) -> Result<(), String> {
    loop {
        while tokens
            .get(i)
            .is_some_and(|t| t.is_word("ONLY") || t.is_word("LATERAL"))
        {
            i += 1;
        }
        let Some(first) = tokens.get(i) else {
            return Ok(());
        };

        if first.is_punct('(') {
            // A subquery or VALUES list is visited by the outer scan. A
            // parenthesized join starts with a relation no FROM or JOIN precedes.
            if !opens_subquery(tokens, i) {
                parse_from_items(tokens, i + 1, schema, cte_names, refs)?;
            }
            i = skip_parens(tokens, i);
            i = take_alias(tokens, i, None, Source::Derived, refs);
        } else if first.is_identifier() && !is_word_in(first, CLAUSE_WORDS) {
            let name_start = i;
            let mut parts = vec![first.ident_key()];
            i += 1;
            while tokens.get(i).is_some_and(|t| t.is_punct('.'))
                && tokens.get(i + 1).is_some_and(|t| t.is_identifier())
            {
                parts.push(tokens[i + 1].ident_key());
                i += 2;
            }
            for idx in name_start..i {
                refs.consumed.insert(idx);
            }

            if tokens.get(i).is_some_and(|t| t.is_punct('(')) {
                // Set-returning function such as generate_series(...).
                if let Some(function) = parts.last().filter(|f| runs_query_string(f)) {
                    return Err(query_string_reason(function));
                }
                i = skip_parens(tokens, i);
                if tokens.get(i).is_some_and(|t| t.is_word("WITH"))
                    && tokens.get(i + 1).is_some_and(|t| t.is_word("ORDINALITY"))
                {
                    i += 2;
                }
                i = take_alias(tokens, i, None, Source::Derived, refs);
            } else {
                let display = parts.join(".");
                let table_name = match parts.as_slice() {
                    [table] => Some(table.as_str()),
                    [qualifier, table] if is_schema_name(qualifier, schema) => Some(table.as_str()),
                    _ => None,
                };
                let Some(table_name) = table_name else {
                    return Err(format!("unknown table '{}'", display));
                };

                if parts.len() == 1 && cte_names.contains(table_name) {
                    i = take_alias(
                        tokens,
                        i,
                        Some(table_name.to_string()),
                        Source::Derived,
                        refs,
                    );
                } else {
                    let Some(table) = schema.table(table_name) else {
                        return Err(format!("unknown table '{}'", display));
                    };
                    refs.tables.insert(table.name.clone());
                    i = take_alias(
                        tokens,
                        i,
                        Some(table.name.to_ascii_lowercase()),
                        Source::Table(table.name.clone()),
                        refs,
                    );
                }
            }
        } else {
            return Ok(());
        }

        if tokens.get(i).is_some_and(|t| t.is_punct(',')) {
            i += 1;
            continue;
        }
        return Ok(());
    }
}

/// Whether the `(` at `open` starts a subquery or VALUES list rather than a
/// parenthesized join.
fn opens_subquery(tokens: &[Token], open: usize) -> bool {
    tokens[open..]
        .iter()
        .find(|t| !t.is_punct('('))
        .is_some_and(|t| {
            t.is_word("SELECT") || t.is_word("WITH") || t.is_word("VALUES") || t.is_word("TABLE")
        })
}

fn is_schema_name(qualifier: &str, schema: &SchemaSnapshot) -> bool {
    qualifier.eq_ignore_ascii_case(&schema.schema_name)
}

fn query_string_reason(function: &str) -> String {
    format!("function '{}' reads relations the query does not name", function)
}

/// Reads `[AS] alias [(col, ...)]` after a FROM item. Without an alias the
/// item is reachable under `default_name`.
fn take_alias(
    tokens: &[Token],
    mut i: usize,
    default_name: Option<String>,
    source: Source,
    refs: &mut References,
) -> usize {
    let explicit_as = tokens.get(i).is_some_and(|t| t.is_word("AS"));
    if explicit_as {
        i += 1;
    }
    let alias = tokens
        .get(i)
        .filter(|t| if explicit_as { t.is_identifier() } else { is_name(t) });

    match alias {
        Some(alias) => {
            refs.consumed.insert(i);
            refs.add_qualifier(alias.ident_key(), source);
            i += 1;
            if tokens.get(i).is_some_and(|t| t.is_punct('(')) {
                i = take_column_list(tokens, i, refs);
            }
        }
        None => {
            if let Some(name) = default_name {
                refs.add_qualifier(name, source);
            }
        }
    }
    i
}

/// Names introduced as output columns: `expr AS name`, `expr name` right
/// before `,`/`FROM`, and named windows.
fn collect_output_aliases(tokens: &[Token], refs: &mut References) {
    for i in 0..tokens.len() {
        let t = &tokens[i];
        if !t.is_identifier() || refs.consumed.contains(&i) {
            continue;
        }
        let prev = i.checked_sub(1).map(|p| &tokens[p]);
        let next = tokens.get(i + 1);

        let after_as = prev.is_some_and(|p| p.is_word("AS"));
        let named_window = prev.is_some_and(|p| p.is_word("WINDOW") || p.is_word("OVER"))
            || (next.is_some_and(|n| n.is_word("AS"))
                && i >= 2
                && (tokens[i - 1].is_word("WINDOW") || tokens[i - 1].is_punct(',')));
        let implicit = t.kind == TokenKind::Word
            && !is_word_in(t, EXPRESSION_WORDS)
            && prev.is_some_and(|p| {
                p.is_punct(')') || p.is_literal() || (p.is_identifier() && !is_word_in(p, EXPRESSION_WORDS))
            })
            && next.is_some_and(|n| n.is_punct(',') || n.is_word("FROM"));

        if after_as || implicit || (named_window && prev.is_some_and(|p| !p.is_punct(',')))
        {
            refs.defined_names.insert(t.ident_key());
        }
    }
}

fn check_columns(tokens: &[Token], schema: &SchemaSnapshot, refs: &References) -> Result<(), String> {
    let known_columns = refs
        .tables
        .iter()
        .filter_map(|name| schema.table(name))
        .flat_map(|t| t.columns.iter().map(|c| c.name.to_ascii_lowercase()))
        .collect::<HashSet<_>>();

    let mut i = 0;
    while i < tokens.len() {
        let t = &tokens[i];
        if !t.is_identifier() || refs.consumed.contains(&i) {
            i += 1;
            continue;
        }
        let prev = i.checked_sub(1).map(|p| &tokens[p]);
        if prev.is_some_and(|p| p.is_operator("::") || p.is_punct('.')) {
            i += 1;
            continue;
        }

        let dotted = tokens.get(i + 1).is_some_and(|n| n.is_punct('.'));
        if dotted {
            i = check_qualified(tokens, i, schema, refs)?;
            continue;
        }

        let is_call = tokens.get(i + 1).is_some_and(|n| n.is_punct('('));
        let key = t.ident_key();
        if is_call && runs_query_string(&key) {
            return Err(query_string_reason(&key));
        }
        let known = is_call
            || known_columns.contains(&key)
            || refs.defined_names.contains(&key)
            || (t.kind == TokenKind::Word && is_word_in(t, EXPRESSION_WORDS));
        if !known {
            return Err(format!("unknown column '{}'", t.text));
        }
        i += 1;
    }
    Ok(())
}

/// Checks `qualifier.column` (or `schema.table.column`) starting at `i` and
/// returns the index after the reference.
fn check_qualified(
    tokens: &[Token],
    i: usize,
    schema: &SchemaSnapshot,
    refs: &References,
) -> Result<usize, String> {
    let mut qualifier_idx = i;
    if is_schema_name(&tokens[i].ident_key(), schema)
        && tokens.get(i + 2).is_some_and(|t| t.is_identifier())
        && tokens.get(i + 3).is_some_and(|t| t.is_punct('.'))
    {
        qualifier_idx = i + 2;
    }
    let qualifier = &tokens[qualifier_idx];
    let Some(member) = tokens.get(qualifier_idx + 2) else {
        return Ok(qualifier_idx + 2);
    };
    let next = qualifier_idx + 3;

    let sources = refs.qualifiers.get(&qualifier.ident_key());
    let Some(sources) = sources else {
        return Err(format!("unknown table or alias '{}'", qualifier.text));
    };

    if member.is_operator("*") || sources.contains(&Source::Derived) {
        return Ok(next);
    }
    if !member.is_identifier() {
        return Ok(next);
    }
    if tokens.get(next).is_some_and(|t| t.is_punct('(')) {
        return Err(format!("unknown table or alias '{}'", qualifier.text));
    }

    let found = sources.iter().any(|source| match source {
        Source::Table(name) => schema
            .table(name)
            .is_some_and(|t: &TableInfo| t.column(&member.text).is_some()),
        Source::Derived => true,
    });
    if !found {
        return Err(format!("unknown column '{}.{}'", qualifier.text, member.text));
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlgate_contracts::{ColumnInfo, TableAccess};

    fn column(name: &str) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            data_type: "text".to_string(),
            nullable: true,
            is_primary_key: name == "id",
            foreign_key: None,
            description: None,
        }
    }

    fn table(name: &str, columns: &[&str]) -> TableInfo {
        TableInfo {
            name: name.to_string(),
            columns: columns.iter().map(|c| column(c)).collect(),
            estimated_row_count: 0,
            description: None,
        }
    }

    fn schema() -> SchemaSnapshot {
        SchemaSnapshot::new(
            vec![
                table("orders", &["id", "customer_id", "total", "status", "created_at"]),
                table("customers", &["id", "name", "email", "region"]),
                table("order_items", &["order_id", "product_id", "quantity"]),
            ],
            0,
        )
    }

    fn passes(sql: &str) -> GateResult {
        let result = check(sql, &schema());
        assert!(result.ok, "{sql}: {:?}", result.reason);
        result
    }

    fn rejects(sql: &str) -> String {
        let result = check(sql, &schema());
        assert!(!result.ok, "{sql} should be rejected");
        result.reason.unwrap_or_default()
    }

    #[test]
    fn simple_select_reports_referenced_tables() {
        let result = passes("SELECT id, total FROM orders WHERE status = 'paid' LIMIT 5");
        assert_eq!(result.referenced_tables, vec!["orders".to_string()]);
    }

    #[test]
    fn joins_and_aliases_resolve() {
        let result = passes(
            "SELECT c.name, SUM(o.total) AS revenue \
             FROM customers c \
             JOIN orders AS o ON o.customer_id = c.id \
             LEFT JOIN order_items oi ON oi.order_id = o.id \
             GROUP BY c.name ORDER BY revenue DESC",
        );
        assert_eq!(
            result.referenced_tables,
            vec!["customers", "order_items", "orders"]
        );
    }

    #[test]
    fn comma_joins_and_schema_qualified_names() {
        let result = passes(
            "SELECT o.id, c.name FROM public.orders o, customers c WHERE o.customer_id = c.id",
        );
        assert_eq!(result.referenced_tables, vec!["customers", "orders"]);
        passes("SELECT public.orders.id FROM public.orders");
    }

    #[test]
    fn unknown_table_is_named() {
        assert_eq!(rejects("SELECT * FROM invoices"), "unknown table 'invoices'");
        assert_eq!(
            rejects("SELECT * FROM orders JOIN payments p ON p.order_id = orders.id"),
            "unknown table 'payments'"
        );
        assert_eq!(
            rejects("SELECT * FROM pg_catalog.pg_user"),
            "unknown table 'pg_catalog.pg_user'"
        );
    }

    #[test]
    fn unknown_columns_are_named() {
        assert_eq!(
            rejects("SELECT salary FROM customers"),
            "unknown column 'salary'"
        );
        assert_eq!(
            rejects("SELECT c.salary FROM customers c"),
            "unknown column 'c.salary'"
        );
        assert_eq!(
            rejects("SELECT x.name FROM customers c"),
            "unknown table or alias 'x'"
        );
    }

    #[test]
    fn table_hidden_by_permission_filter_is_unknown() {
        let view = schema().filter(&TableAccess::only(["orders"]));
        let result = check("SELECT name FROM customers", &view);
        assert!(!result.ok);
        assert_eq!(result.reason.as_deref(), Some("unknown table 'customers'"));
    }

    #[test]
    fn ctes_and_subqueries_are_walked() {
        let result = passes(
            "WITH big AS (SELECT customer_id, total AS amount FROM orders WHERE total > 100) \
             SELECT c.name, b.amount FROM big b JOIN customers c ON c.id = b.customer_id",
        );
        assert_eq!(result.referenced_tables, vec!["customers", "orders"]);

        passes(
            "SELECT name FROM customers WHERE id IN (SELECT customer_id FROM orders WHERE total > 10)",
        );
        passes("SELECT s.n FROM (SELECT count(*) AS n FROM orders) s");
        passes("WITH r(a, b) AS (SELECT id, total FROM orders) SELECT a, b FROM r");

        assert_eq!(
            rejects("WITH x AS (SELECT * FROM refunds) SELECT * FROM x"),
            "unknown table 'refunds'"
        );
        assert_eq!(
            rejects("SELECT * FROM orders WHERE customer_id IN (SELECT id FROM accounts)"),
            "unknown table 'accounts'"
        );
    }

    #[test]
    fn function_syntax_with_from_is_not_a_table_clause() {
        passes("SELECT EXTRACT(YEAR FROM created_at) AS y, count(*) FROM orders GROUP BY 1");
        passes("SELECT SUBSTRING(name FROM 1 FOR 3) FROM customers");
        passes("SELECT TRIM(BOTH ' ' FROM name) FROM customers");
        passes("SELECT * FROM orders WHERE status IS DISTINCT FROM 'void'");
    }

    #[test]
    fn casts_literals_and_set_returning_functions() {
        passes("SELECT created_at::date AS day, total::numeric(10, 2) FROM orders");
        passes("SELECT * FROM orders WHERE created_at >= NOW() - INTERVAL '7 days'");
        passes("SELECT g.n FROM generate_series(1, 3) AS g(n)");
        passes("SELECT n FROM generate_series(1, 3) n");
        passes("SELECT v.x FROM (VALUES (1), (2)) AS v(x)");
    }

    #[test]
    fn implicit_and_window_aliases() {
        passes("SELECT count(*) n, region FROM customers GROUP BY region");
        passes(
            "SELECT id, rank() OVER w AS r FROM orders WINDOW w AS (ORDER BY total DESC)",
        );
    }

    #[test]
    fn quoted_identifiers_and_case_insensitive_lookup() {
        passes(r#"SELECT "name" FROM "customers""#);
        passes("SELECT NAME FROM CUSTOMERS");
    }

    #[test]
    fn using_list_and_star_are_accepted() {
        passes("SELECT o.*, c.* FROM orders o JOIN customers c ON c.id = o.customer_id");
        passes(
            "SELECT * FROM order_items JOIN orders ON orders.id = order_items.order_id",
        );
    }

    fn salaries_hidden() -> SchemaSnapshot {
        let mut full = schema();
        full.tables.push(table("salaries", &["employee", "amount"]));
        full.filter(&TableAccess::only(["orders", "customers"]))
    }

    #[test]
    fn parenthesized_joins_resolve_every_relation() {
        let view = salaries_hidden();
        for sql in [
            "SELECT * FROM (salaries CROSS JOIN orders) AS salaries",
            "SELECT * FROM ((salaries CROSS JOIN orders)) AS j",
            "SELECT * FROM (orders CROSS JOIN salaries) AS salaries",
            "SELECT * FROM orders, (salaries) AS s",
        ] {
            let result = check(sql, &view);
            assert_eq!(result.reason.as_deref(), Some("unknown table 'salaries'"), "{sql}");
        }

        let result = passes(
            "SELECT j.name FROM (orders o JOIN customers c ON c.id = o.customer_id) AS j",
        );
        assert_eq!(result.referenced_tables, vec!["customers", "orders"]);
        let result = passes(
            "SELECT * FROM ((orders o JOIN customers c ON c.id = o.customer_id) \
             JOIN order_items oi ON oi.order_id = o.id)",
        );
        assert_eq!(
            result.referenced_tables,
            vec!["customers", "order_items", "orders"]
        );
    }

    #[test]
    fn table_statements_name_a_relation() {
        let view = salaries_hidden();
        let result = check(
            "SELECT * FROM orders AS salaries UNION ALL TABLE salaries",
            &view,
        );
        assert_eq!(result.reason.as_deref(), Some("unknown table 'salaries'"));
        let result = passes("SELECT id FROM orders UNION (TABLE orders)");
        assert_eq!(result.referenced_tables, vec!["orders"]);
    }

    #[test]
    fn functions_running_query_text_are_rejected() {
        for function in crate::QUERY_STRING_FUNCTIONS {
            let in_select = format!("SELECT {}('select * from salaries', true, false, '')", function);
            assert_eq!(
                rejects(&in_select),
                format!("function '{}' reads relations the query does not name", function)
            );
            let in_from = format!("SELECT * FROM {}('select * from salaries') AS t", function);
            assert_eq!(
                rejects(&in_from),
                format!("function '{}' reads relations the query does not name", function)
            );
        }

        let view = salaries_hidden();
        let result = check("SELECT query_to_xml('select * from salaries', true, false, '')", &view);
        assert!(!result.ok);
        assert!(result.referenced_tables.is_empty());
    }

    #[test]
    fn schema_qualifier_follows_the_configured_schema() {
        let analytics = schema().with_schema_name("analytics");
        let result = check("SELECT analytics.orders.id FROM analytics.orders", &analytics);
        assert!(result.ok, "{:?}", result.reason);
        assert_eq!(result.referenced_tables, vec!["orders"]);
        assert!(check("SELECT o.id FROM ANALYTICS.orders o", &analytics).ok);

        let result = check("SELECT id FROM public.orders", &analytics);
        assert_eq!(result.reason.as_deref(), Some("unknown table 'public.orders'"));
    }

    #[test]
    fn broken_statements_are_rejected() {
        assert_eq!(rejects("SELECT (id FROM orders"), "unbalanced parentheses");
        assert!(rejects("SELECT 'x FROM orders").contains("tokenized"));
    }
}
