use sqlgate_contracts::TableInfo;
use sqlgate_model::{LanguageModel, Prompt, PromptPurpose, generate_traced};

const SYSTEM_PROMPT: &str = "You are a database permission checker.

Decide whether answering the user's question requires data from any table in the \"Inaccessible tables\" list.

## Rules
- Reply YES if the question needs data from an inaccessible table.
- Reply NO if the accessible tables are enough to answer it.
- Reply with exactly one word: YES or NO.";

pub fn prompt(question: &str, accessible: &[&TableInfo], inaccessible: &[&TableInfo]) -> Prompt {
    let mut system = String::from(SYSTEM_PROMPT);
    system.push_str("\n\n## Accessible tables\n");
    system.push_str(&table_list(accessible));
    system.push_str("\n\n## Inaccessible tables\n");
    system.push_str(&table_list(inaccessible));
    Prompt::new(PromptPurpose::PermissionCheck, system, question.trim())
}

/// True only on an explicit `YES`. Model errors and any other reply let the
/// run continue; the structural gate and the executor re-check stay
/// authoritative.
pub async fn needs_inaccessible(
    model: &dyn LanguageModel,
    question: &str,
    accessible: &[&TableInfo],
    inaccessible: &[&TableInfo],
) -> bool {
    match generate_traced(model, &prompt(question, accessible, inaccessible)).await {
        Ok(reply) => reply.trim().to_ascii_uppercase().starts_with("YES"),
        Err(err) => {
            tracing::warn!(error = %err, "permission pre-check unavailable, continuing");
            false
        }
    }
}

fn table_list(tables: &[&TableInfo]) -> String {
    if tables.is_empty() {
        return "(none)".to_string();
    }
    let mut names = tables.to_vec();
    names.sort_by(|a, b| a.name.cmp(&b.name));

    let mut out = String::new();
    for table in names {
        if !out.is_empty() {
            out.push('\n');
        }
        let line = match table.description.as_deref() {
            Some(description) => format!("- {}: {}", table.name, description),
            None => format!("- {}", table.name),
        };
        out.push_str(&line);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlgate_model::ScriptedModel;

    fn table(name: &str, description: Option<&str>) -> TableInfo {
        TableInfo {
            name: name.to_string(),
            columns: Vec::new(),
            estimated_row_count: 0,
            description: description.map(str::to_string),
        }
    }

    #[test]
    fn prompt_lists_both_sides() {
        let orders = table("orders", Some("Customer orders"));
        let salaries = table("salaries", None);
        let prompt = prompt("average salary?", &[&orders], &[&salaries]);
        assert_eq!(prompt.purpose, PromptPurpose::PermissionCheck);
        assert!(prompt.system.contains("## Accessible tables\n- orders: Customer orders"));
        assert!(prompt.system.contains("## Inaccessible tables\n- salaries"));
        assert_eq!(prompt.user, "average salary?");
    }

    #[test]
    fn table_list_is_sorted_one_per_line() {
        let orders = table("orders", Some("Customer orders"));
        let customers = table("customers", None);
        assert_eq!(
            table_list(&[&orders, &customers]),
            "- customers\n- orders: Customer orders"
        );
        assert_eq!(table_list(&[]), "(none)");
    }

    #[tokio::test]
    async fn only_explicit_yes_denies() {
        let salaries = table("salaries", None);
        for (reply, expected) in [("YES", true), ("yes.", true), ("NO", false), ("maybe", false)] {
            let model = ScriptedModel::new().reply(PromptPurpose::PermissionCheck, reply);
            assert_eq!(
                needs_inaccessible(&model, "q", &[], &[&salaries]).await,
                expected,
                "{reply}"
            );
        }

        let failing = ScriptedModel::new().fail(PromptPurpose::PermissionCheck);
        assert!(!needs_inaccessible(&failing, "q", &[], &[&salaries]).await);
    }
}
