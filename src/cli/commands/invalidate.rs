//! Invalidate command - force revalidation of a repository's cache

use super::operator_context;
use crate::cli::args::InvalidateArgs;
use crate::config::Config;
use crate::error::DepotResult;
use crate::proxy::ProxyEngine;
use crate::ui::{self, UiContext};

/// Execute the invalidate command
pub async fn execute(args: InvalidateArgs, config: &Config) -> DepotResult<()> {
    let ctx = UiContext::detect().with_auto_yes(args.yes);
    let engine = ProxyEngine::from_config(config)?;
    let repository = engine.repositories().get(&args.repository)?;

    if !repository.is_proxy() {
        ui::step_warn_hint(
            &ctx,
            &format!("{} is a hosted repository", args.repository),
            "Hosted content never expires; nothing to revalidate",
        );
    }

    let message = format!("Expire every cached entry of {}?", args.repository);
    if !ui::confirm(&ctx, &message, false).await? {
        ui::step_warn_hint(&ctx, "Invalidation skipped", "Pass --yes to confirm");
        return Ok(());
    }

    let summary = engine.invalidate(&args.repository, &operator_context()).await?;
    ui::step_ok(
        &ctx,
        &format!(
            "Expired {} entr{}, dropped {} negative",
            summary.expired,
            if summary.expired == 1 { "y" } else { "ies" },
            summary.dropped_negative
        ),
    );

    Ok(())
}
