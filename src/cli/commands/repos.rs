//! Repos command - list configured repositories

use crate::cli::args::{OutputFormat, ReposArgs};
use crate::config::Config;
use crate::error::DepotResult;
use crate::format::FormatRegistry;
use crate::repository::{Repository, RepositoryRegistry};
use crate::ui::{self, UiContext};
use console::style;
use std::sync::Arc;

/// Execute the repos command
pub async fn execute(args: ReposArgs, config: &Config) -> DepotResult<()> {
    let registry = RepositoryRegistry::from_config(config, &FormatRegistry::default())?;
    let repositories: Vec<&Arc<Repository>> = registry.iter().collect();

    if repositories.is_empty() {
        match args.format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => {
                let ctx = UiContext::detect();
                ui::step_warn_hint(&ctx, "No repositories configured", "Add a [repositories.<name>] section");
            }
        }
        return Ok(());
    }

    match args.format {
        OutputFormat::Table => print_table(&repositories),
        OutputFormat::Json => print_json(&repositories)?,
        OutputFormat::Plain => {
            for repo in &repositories {
                println!("{}", repo.name);
            }
        }
    }

    Ok(())
}

fn print_table(repositories: &[&Arc<Repository>]) {
    let ctx = UiContext::detect();
    ui::intro(&ctx, "Repositories");

    println!(
        "{:<20} {:<8} {:<8} {:<12} {:<40}",
        style("NAME").bold(),
        style("KIND").bold(),
        style("FORMAT").bold(),
        style("TTL").bold(),
        style("REMOTE").bold()
    );
    println!("{}", "-".repeat(92));

    for repo in repositories {
        let kind = match (repo.is_proxy(), repo.offline) {
            (true, true) => style("offline").yellow(),
            (true, false) => style("proxy").green(),
            (false, _) => style("hosted").cyan(),
        };
        let ttl = format!(
            "{}s/{}s",
            repo.ttls.content.num_seconds(),
            repo.ttls.metadata.num_seconds()
        );
        println!(
            "{:<20} {:<8} {:<8} {:<12} {:<40}",
            repo.name,
            kind,
            repo.format.name(),
            ttl,
            repo.remote_url().unwrap_or("-")
        );
    }

    println!();
    println!("{} repositor{}", repositories.len(), if repositories.len() == 1 { "y" } else { "ies" });
}

fn print_json(repositories: &[&Arc<Repository>]) -> DepotResult<()> {
    let entries: Vec<serde_json::Value> = repositories
        .iter()
        .map(|repo| {
            serde_json::json!({
                "name": repo.name,
                "kind": repo.kind(),
                "format": repo.format.name(),
                "remote_url": repo.remote_url(),
                "offline": repo.offline,
                "negative_cache": repo.negative_cache,
                "content_ttl_secs": repo.ttls.content.num_seconds(),
                "metadata_ttl_secs": repo.ttls.metadata.num_seconds(),
                "negative_ttl_secs": repo.ttls.negative.num_seconds(),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}
