//! Gc command - delete payloads no artifact references any more

use crate::cli::args::GcArgs;
use crate::config::Config;
use crate::error::DepotResult;
use crate::format::FormatRegistry;
use crate::repository::RepositoryRegistry;
use crate::store::ContentStore;
use crate::ui::{self, UiContext};

/// Execute the gc command
pub async fn execute(args: GcArgs, config: &Config) -> DepotResult<()> {
    let ctx = UiContext::detect();
    let store = ContentStore::from_config(config);
    let repositories = RepositoryRegistry::from_config(config, &FormatRegistry::default())?;

    let names: Vec<String> = match args.repository {
        Some(name) => vec![repositories.get(&name)?.name.clone()],
        None => repositories.iter().map(|repo| repo.name.clone()).collect(),
    };

    let mut total = 0;
    for name in &names {
        let collected = store.collect_garbage(name).await?;
        if collected > 0 {
            ui::key_value(&ctx, name, &format!("{} blob(s)", collected));
        }
        total += collected;
    }

    ui::step_ok_detail(
        &ctx,
        &format!("Collected {} orphaned blob(s)", total),
        &format!("{} repositor{}", names.len(), if names.len() == 1 { "y" } else { "ies" }),
    );
    Ok(())
}
