//! Browse command - list children of a repository path

use crate::browse::{BrowseIndex, BrowseNode};
use crate::cli::args::{BrowseArgs, OutputFormat};
use crate::config::Config;
use crate::error::DepotResult;
use crate::format::FormatRegistry;
use crate::repository::RepositoryRegistry;
use crate::store::ContentStore;
use crate::ui::{self, UiContext};
use console::style;
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
struct Listing<'a> {
    #[serde(flatten)]
    node: &'a BrowseNode,
    kind: String,
    leaf: bool,
}

/// Execute the browse command
///
/// Reads the persisted index; `depot rebuild` populates it for content
/// stored before indexing was enabled.
pub async fn execute(args: BrowseArgs, config: &Config) -> DepotResult<()> {
    let store = Arc::new(ContentStore::from_config(config));
    let repositories = RepositoryRegistry::from_config(config, &FormatRegistry::default())?;
    repositories.get(&args.repository)?;
    let index = BrowseIndex::new(store, repositories).with_page_size(config.browse.page_size);

    let segments: Vec<&str> = args
        .path
        .as_deref()
        .map(|p| p.split('/').filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    let children = index
        .get_by_display_path(&args.repository, &segments, args.limit, args.filter.as_deref())
        .await?;
    let mut parents = Vec::with_capacity(children.len());
    for node in &children {
        let path: Vec<&str> = node.full_path.split('/').filter(|s| !s.is_empty()).collect();
        let grandchildren = index
            .get_by_display_path(&args.repository, &path, 1, None)
            .await?;
        parents.push(!grandchildren.is_empty());
    }

    match args.format {
        OutputFormat::Table => print_table(&args, &children, &parents),
        OutputFormat::Json => {
            let listing: Vec<Listing> = children
                .iter()
                .zip(&parents)
                .map(|(node, has_children)| Listing {
                    node,
                    kind: node.ref_kind().to_string(),
                    leaf: !has_children,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        OutputFormat::Plain => {
            for node in &children {
                println!("{}", node.name);
            }
        }
    }

    Ok(())
}

fn print_table(args: &BrowseArgs, children: &[BrowseNode], parents: &[bool]) {
    let ctx = UiContext::detect();
    let location = match args.path.as_deref() {
        Some(path) if !path.trim_matches('/').is_empty() => {
            format!("{}/{}", args.repository, path.trim_matches('/'))
        }
        _ => args.repository.clone(),
    };

    if children.is_empty() {
        ui::step_info(&ctx, &format!("Nothing under {}", location));
        if args.path.is_none() {
            ui::remark(
                &ctx,
                &format!("Run: depot rebuild {} to index stored content", args.repository),
            );
        }
        return;
    }

    ui::intro(&ctx, &format!("Browse {}", location));
    println!(
        "{:<40} {:<14} {:<40}",
        style("NAME").bold(),
        style("KIND").bold(),
        style("REFERENCE").bold()
    );
    println!("{}", "-".repeat(94));

    for (node, has_children) in children.iter().zip(parents) {
        let name = if *has_children {
            format!("{}/", node.name)
        } else {
            node.name.clone()
        };
        println!(
            "{:<40} {:<14} {:<40}",
            name,
            node.ref_kind().to_string(),
            node.ref_id().unwrap_or("-")
        );
    }

    println!();
    println!("{} entr{}", children.len(), if children.len() == 1 { "y" } else { "ies" });
    if children.len() == args.limit {
        ui::remark(&ctx, "Listing truncated, raise --limit to see more");
    }
}
