//! CLI entry point for shelfdl.

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use shelfdl_core::{
    AppContext, DestinationFolder, DirectHttpExecutor, LayeredConfig, PluginRegistry, Settings,
};
use tracing::{debug, info, warn};

mod app;
mod cli;

use app::progress_manager::watch_tasks;
use cli::{Args, Command, FetchArgs};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config = LayeredConfig::load(args.config.as_deref()).context("loading configuration")?;
    let mut settings = Settings::from_config(&config).context("invalid configuration")?;

    match args.command {
        Command::Fetch(fetch) => {
            apply_overrides(&mut settings, &fetch);
            run_fetch(settings, &fetch, !args.quiet).await
        }
        Command::Sources => run_sources(settings).await,
    }
}

fn apply_overrides(settings: &mut Settings, fetch: &FetchArgs) {
    if let Some(dest) = &fetch.dest {
        settings.destination_dir.clone_from(dest);
    }
    if let Some(concurrency) = fetch.concurrency {
        settings.max_concurrent_downloads = usize::from(concurrency);
    }
}

fn build_registry(settings: &Settings) -> Result<PluginRegistry> {
    let executor = DirectHttpExecutor::new(&settings.staging_dir).context("building HTTP client")?;
    let mut builder = PluginRegistry::builder();
    builder.register_executor(Arc::new(executor))?;
    Ok(builder.build())
}

async fn init_context(settings: Settings) -> Result<AppContext> {
    let registry = build_registry(&settings)?;
    let output = Arc::new(DestinationFolder::new(settings.destination_dir.clone()));
    AppContext::init(settings, registry, output)
        .await
        .context("starting orchestrator")
}

async fn run_fetch(settings: Settings, fetch: &FetchArgs, show_progress: bool) -> Result<()> {
    let ctx = init_context(settings).await?;
    let orchestrator = ctx.orchestrator();

    let mut task_ids = Vec::new();
    for url in &fetch.urls {
        let release = match DirectHttpExecutor::release_for_url(url) {
            Ok(release) => release,
            Err(error) => {
                warn!(url = %url, error = %error, "Skipping invalid URL");
                continue;
            }
        };
        let task = orchestrator.enqueue(&release)?;
        task_ids.push(task.id);
    }
    if task_ids.is_empty() {
        ctx.shutdown().await;
        bail!("no valid URLs to download");
    }

    let visible = show_progress && std::io::stderr().is_terminal();
    let summary = tokio::select! {
        summary = watch_tasks(orchestrator, &task_ids, visible) => summary,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling downloads");
            for id in &task_ids {
                let _ = orchestrator.cancel(id);
            }
            watch_tasks(orchestrator, &task_ids, false).await
        }
    };

    for id in &task_ids {
        if let Some(task) = orchestrator.get(id) {
            match &task.output_path {
                Some(path) => info!(task_id = %id, path = %path.display(), "Saved"),
                None => warn!(
                    task_id = %id,
                    status = %task.status,
                    message = task.status_message.as_deref().unwrap_or(""),
                    "Not downloaded"
                ),
            }
        }
    }
    info!(
        completed = summary.completed,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "Download complete"
    );
    ctx.shutdown().await;

    if summary.failed > 0 {
        bail!("{} of {} downloads failed", summary.failed, task_ids.len());
    }
    Ok(())
}

async fn run_sources(settings: Settings) -> Result<()> {
    let ctx = init_context(settings).await?;
    let sources = ctx.list_available_sources().await;
    if sources.is_empty() {
        println!("No release sources registered (direct URL downloads only).");
    }
    for source in &sources {
        let content: Vec<&str> = source
            .supported_content_types
            .iter()
            .map(|c| c.as_str())
            .collect();
        println!(
            "{:<24} {:<12} {:<5} {}",
            source.display_name,
            if source.available { "available" } else { "unavailable" },
            format!("{:?}", source.speed).to_lowercase(),
            content.join(",")
        );
    }
    ctx.shutdown().await;
    Ok(())
}
