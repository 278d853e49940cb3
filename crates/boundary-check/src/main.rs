use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{Context, Result};
use cargo_metadata::{Metadata, MetadataCommand, PackageId};

/// Packages that must stay free of database and HTTP-server code, and the
/// crates they may not reach through any dependency path.
const RULES: &[(&str, &[&str])] = &[
    (
        "sqlgate-contracts",
        &["sqlx", "axum", "sqlgate-ledger", "sqlgate-gateway"],
    ),
    (
        "sqlgate-guard",
        &["sqlx", "axum", "sqlgate-ledger", "sqlgate-gateway"],
    ),
    (
        "sqlgate-model",
        &["sqlx", "axum", "sqlgate-ledger", "sqlgate-gateway"],
    ),
    ("sqlgate-auth", &["sqlx", "sqlgate-ledger", "sqlgate-gateway"]),
];

fn main() -> Result<()> {
    let metadata = MetadataCommand::new()
        .exec()
        .context("failed to run `cargo metadata`")?;

    let mut failed = false;
    for (package, forbidden) in RULES {
        let violations = forbidden_reachable(&metadata, package, forbidden)?;
        if violations.is_empty() {
            println!(
                "OK: `{}` has no dependency edge to {}",
                package,
                forbidden.join(", ")
            );
        } else {
            eprintln!(
                "FAIL: `{}` depends on forbidden crate(s): {}",
                package,
                violations.join(", ")
            );
            failed = true;
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Walks the resolved graph from `package` and returns the forbidden crates
/// it reaches, sorted.
fn forbidden_reachable(metadata: &Metadata, package: &str, forbidden: &[&str]) -> Result<Vec<String>> {
    let resolve = metadata
        .resolve
        .as_ref()
        .context("`cargo metadata` did not include a resolved dependency graph")?;

    let root = metadata
        .packages
        .iter()
        .find(|p| p.name == package)
        .with_context(|| format!("package `{}` not found in workspace", package))?;

    let id_to_name: HashMap<&PackageId, &str> = metadata
        .packages
        .iter()
        .map(|p| (&p.id, p.name.as_str()))
        .collect();

    let adjacency: HashMap<&PackageId, Vec<&PackageId>> = resolve
        .nodes
        .iter()
        .map(|node| (&node.id, node.deps.iter().map(|dep| &dep.pkg).collect()))
        .collect();

    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(&root.id);
    visited.insert(&root.id);

    let mut violations = Vec::new();
    while let Some(current) = queue.pop_front() {
        let Some(deps) = adjacency.get(current) else {
            continue;
        };

        for dep in deps.iter().copied() {
            if !visited.insert(dep) {
                continue;
            }
            if let Some(name) = id_to_name.get(dep)
                && forbidden.contains(name)
            {
                violations.push((*name).to_string());
            }
            queue.push_back(dep);
        }
    }

    violations.sort();
    violations.dedup();
    Ok(violations)
}
