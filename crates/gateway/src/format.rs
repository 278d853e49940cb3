use serde_json::Value;
use sqlgate_contracts::ExecutionResult;

pub const PREVIEW_ROWS: usize = 10;
const MAX_CELL_CHARS: usize = 50;

/// Markdown summary of a result, stored as the assistant's history entry.
pub fn result_markdown(result: &ExecutionResult) -> String {
    if result.rows.is_empty() {
        return "No rows returned.".to_string();
    }

    let mut out = if result.is_truncated {
        format!(
            "Returned {} of {} rows ({} ms); the result was truncated.",
            result.returned_row_count, result.total_row_count, result.execution_time_ms
        )
    } else {
        format!(
            "Returned {} rows ({} ms).",
            result.returned_row_count, result.execution_time_ms
        )
    };

    let columns = if result.columns.is_empty() {
        result.rows[0].keys().cloned().collect::<Vec<_>>()
    } else {
        result.columns.iter().map(|c| c.name.clone()).collect()
    };

    out.push_str("\n\n| ");
    out.push_str(
        &columns
            .iter()
            .map(|c| escape(c))
            .collect::<Vec<_>>()
            .join(" | "),
    );
    out.push_str(" |\n|");
    out.push_str(&vec!["---"; columns.len()].join("|"));
    out.push('|');

    for row in result.rows.iter().take(PREVIEW_ROWS) {
        let cells = columns
            .iter()
            .map(|c| cell(row.get(c)))
            .collect::<Vec<_>>();
        out.push_str("\n| ");
        out.push_str(&cells.join(" | "));
        out.push_str(" |");
    }

    let remaining = result.total_row_count.saturating_sub(PREVIEW_ROWS as u64);
    if result.rows.len() > PREVIEW_ROWS && remaining > 0 {
        out.push_str(&format!("\n\n... and {} more rows.", remaining));
    }
    out
}

fn cell(value: Option<&Value>) -> String {
    let text = match value {
        None | Some(Value::Null) => return String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    let text = escape(&text);
    if text.chars().count() > MAX_CELL_CHARS {
        let mut cut = text.chars().take(MAX_CELL_CHARS - 3).collect::<String>();
        cut.push_str("...");
        return cut;
    }
    text
}

fn escape(text: &str) -> String {
    text.replace('|', "\\|").replace(['\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlgate_contracts::ResultColumn;
    use std::time::Duration;

    fn result(n: usize, max_rows: usize) -> ExecutionResult {
        let rows = (0..n)
            .map(|i| {
                let mut row = serde_json::Map::new();
                row.insert("id".to_string(), serde_json::json!(i));
                row.insert("name".to_string(), serde_json::json!(format!("a|{i}")));
                row.insert("note".to_string(), Value::Null);
                row
            })
            .collect();
        let columns = ["id", "name", "note"]
            .iter()
            .map(|c| ResultColumn {
                name: c.to_string(),
                data_type: "text".to_string(),
            })
            .collect();
        ExecutionResult::from_fetched(rows, columns, max_rows, None, Duration::from_millis(7))
    }

    #[test]
    fn empty_results_say_so() {
        assert_eq!(result_markdown(&result(0, 5)), "No rows returned.");
    }

    #[test]
    fn small_results_render_every_row() {
        let text = result_markdown(&result(2, 10));
        assert!(text.starts_with("Returned 2 rows (7 ms)."));
        assert!(text.contains("| id | name | note |\n|---|---|---|"));
        assert!(text.contains("| 0 | a\\|0 |  |"));
        assert!(!text.contains("more rows"));
    }

    #[test]
    fn long_results_show_ten_rows_and_a_remainder() {
        let text = result_markdown(&result(25, 20));
        assert!(text.starts_with("Returned 20 of 25 rows (7 ms); the result was truncated."));
        assert!(text.contains("| 9 | a\\|9 |  |"));
        assert!(!text.contains("| 10 |"));
        assert!(text.ends_with("... and 15 more rows."));
    }
}
