//! Delete command - remove an artifact and collect its payload

use super::operator_context;
use crate::browse::{BrowseIndex, IndexWorkers};
use crate::cli::args::DeleteArgs;
use crate::config::Config;
use crate::error::DepotResult;
use crate::proxy::ProxyEngine;
use crate::ui::{self, UiContext};
use std::sync::Arc;

/// Execute the delete command
pub async fn execute(args: DeleteArgs, config: &Config) -> DepotResult<()> {
    let ctx = UiContext::detect().with_auto_yes(args.yes);
    let engine = ProxyEngine::from_config(config)?;
    engine.repositories().get(&args.repository)?;

    let message = format!("Delete {}/{}?", args.repository, args.path);
    if !ui::confirm(&ctx, &message, false).await? {
        ui::step_warn_hint(&ctx, "Delete skipped", "Pass --yes to confirm");
        return Ok(());
    }

    let index = Arc::new(
        BrowseIndex::new(engine.store().clone(), engine.repositories().clone())
            .with_page_size(config.browse.page_size),
    );
    let (events, workers) =
        IndexWorkers::spawn(index, config.browse.workers, config.browse.queue_capacity);
    let engine = engine.with_events(events.clone());

    let result = engine
        .delete(&args.repository, &args.path, &operator_context())
        .await;
    events.wait_idle().await;
    workers.shutdown().await;

    if !result? {
        ui::step_info(&ctx, &format!("{} is not stored", args.path));
        return Ok(());
    }

    // The CLI process is the collector: free the payload right away
    let collected = engine.store().collect_garbage(&args.repository).await?;
    ui::step_ok_detail(
        &ctx,
        &format!("Deleted {}/{}", args.repository, args.path),
        &format!("{} blob(s) collected", collected),
    );

    Ok(())
}
