//! Fetch command - resolve one artifact through a repository

use super::operator_context;
use crate::browse::{BrowseIndex, IndexWorkers};
use crate::cli::args::FetchArgs;
use crate::config::Config;
use crate::error::{DepotError, DepotResult};
use crate::proxy::{FetchOutcome, FetchedContent, ProxyEngine};
use crate::ui::{self, TaskSpinner, UiContext};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Copy the payload to a file, or to stdout when `output` is `None`
async fn write_payload(content: FetchedContent, output: Option<PathBuf>) -> DepotResult<u64> {
    let mut reader = content.into_reader();
    tokio::task::spawn_blocking(move || match output {
        Some(path) => {
            let copy = std::fs::File::create(&path).and_then(|file| {
                let mut file = io::BufWriter::new(file);
                let written = io::copy(&mut reader, &mut file)?;
                file.flush()?;
                Ok(written)
            });
            copy.map_err(|e| DepotError::io(format!("writing {}", path.display()), e))
        }
        None => {
            let mut stdout = io::stdout().lock();
            io::copy(&mut reader, &mut stdout)
                .and_then(|written| stdout.flush().map(|_| written))
                .map_err(|e| DepotError::io("writing payload to stdout", e))
        }
    })
    .await
    .map_err(|e| DepotError::Internal(format!("payload writer panicked: {}", e)))?
}

/// Execute the fetch command
pub async fn execute(args: FetchArgs, config: &Config) -> DepotResult<()> {
    let engine = ProxyEngine::from_config(config)?;
    let index = Arc::new(
        BrowseIndex::new(engine.store().clone(), engine.repositories().clone())
            .with_page_size(config.browse.page_size),
    );
    let (events, workers) =
        IndexWorkers::spawn(index.clone(), config.browse.workers, config.browse.queue_capacity);
    let engine = engine.with_events(events.clone());
    let request = operator_context();

    // Without -o the payload goes to stdout, so stay quiet
    let Some(output) = args.output else {
        let result = engine.fetch(&args.repository, &args.path, &request).await;
        events.wait_idle().await;
        workers.shutdown().await;

        write_payload(result?, None).await?;
        return Ok(());
    };

    let ctx = UiContext::detect();
    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start(&format!("Fetching {}/{}", args.repository, args.path));

    let result = engine.fetch(&args.repository, &args.path, &request).await;
    events.wait_idle().await;
    workers.shutdown().await;

    let content = match result {
        Ok(content) => content,
        Err(e) => {
            spinner.stop_error(&format!("Fetch failed: {}", args.path));
            return Err(e);
        }
    };

    let outcome = content.outcome;
    let content_type = content.content_type.clone();
    let artifact = content.artifact.clone();
    let written = match write_payload(content, Some(output.clone())).await {
        Ok(written) => written,
        Err(e) => {
            spinner.stop_error(&format!("Could not save {}", args.path));
            return Err(e);
        }
    };
    spinner.stop(&format!(
        "Fetched {} ({}, {})",
        args.path,
        ui::format_bytes(written),
        outcome
    ));

    if outcome == FetchOutcome::StaleWhileError {
        ui::step_warn(&ctx, "Upstream unavailable, served a stale copy");
    }
    ui::key_value(&ctx, "Saved to", &output.display().to_string());
    ui::key_value(&ctx, "Content type", &content_type);
    if let Some(artifact) = &artifact {
        ui::key_value(&ctx, "SHA-256", &artifact.content_hash);
        ui::key_value(&ctx, "Generation", &artifact.generation.to_string());
    }
    match index.resolve_request_path(&args.repository, &args.path).await {
        Ok(Some(node)) => {
            ui::remark(&ctx, &format!("Indexed at {} ({})", node.full_path, node.ref_kind()));
        }
        Ok(None) => {}
        Err(e) => ui::step_warn(&ctx, &format!("Browse index unavailable: {}", e)),
    }

    Ok(())
}
