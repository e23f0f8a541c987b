//! Rebuild command - regenerate a repository's browse index

use super::operator_context;
use crate::browse::BrowseIndex;
use crate::cli::args::RebuildArgs;
use crate::config::Config;
use crate::error::DepotResult;
use crate::format::FormatRegistry;
use crate::repository::RepositoryRegistry;
use crate::store::ContentStore;
use crate::ui::{self, RebuildProgress, UiContext};
use std::sync::Arc;

/// Execute the rebuild command
pub async fn execute(args: RebuildArgs, config: &Config) -> DepotResult<()> {
    let ctx = UiContext::detect();
    let store = Arc::new(ContentStore::from_config(config));
    let repositories = RepositoryRegistry::from_config(config, &FormatRegistry::default())?;
    let index = BrowseIndex::new(store, repositories).with_page_size(config.browse.page_size);
    let request = operator_context();

    let progress = RebuildProgress::new(&ctx, &args.repository);
    let result = index
        .rebuild(&args.repository, request.cancellation(), |line| {
            progress.on_progress(line)
        })
        .await;
    progress.finish();

    let summary = result?;
    let trimmed = index.trim(&args.repository).await?;
    let nodes = index.nodes(&args.repository).await?.len();

    ui::step_ok_detail(
        &ctx,
        &format!("Indexed {} artifact(s)", summary.assets),
        &format!("{} page(s)", summary.pages),
    );
    ui::key_value(&ctx, "Browse nodes", &nodes.to_string());
    if trimmed > 0 {
        ui::key_value(&ctx, "Trimmed", &trimmed.to_string());
    }
    ui::outro_success(&ctx, &format!("Rebuilt {}", args.repository));

    Ok(())
}
