use asset_hub::state::data::format_file_size;
use asset_hub::{Coordinator, FsWatcher, HubConfig, IndexEvent, RescanTarget, ScanReport};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Index 3D model libraries and cache their thumbnails
#[derive(Debug, Parser)]
#[command(name = "asset-hub", version, about)]
struct Cli {
    /// Library roots to scan (override the config file's roots)
    roots: Vec<PathBuf>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Keep running and rescan when files change
    #[arg(short, long)]
    watch: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("asset_hub=info")))
        .init();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> asset_hub::Result<()> {
    let mut config = match &cli.config {
        Some(path) => HubConfig::load(path)?,
        None => HubConfig::default(),
    };
    if !cli.roots.is_empty() {
        config.root_paths = cli.roots;
    }
    config.watch_filesystem |= cli.watch;
    if config.root_paths.is_empty() {
        return Err(asset_hub::HubError::Config(
            "no library roots given, pass them as arguments or in the config file".into(),
        ));
    }

    let coordinator = Coordinator::open(config)?;
    let report = coordinator.rescan(RescanTarget::All).await?;
    print_summary(&coordinator, &report).await?;

    if coordinator.config().watch_filesystem {
        watch(coordinator).await?;
    }
    Ok(())
}

/// Serve filesystem-triggered rescans until Ctrl+C
async fn watch(coordinator: Arc<Coordinator>) -> asset_hub::Result<()> {
    let mut events = coordinator.subscribe();
    let loop_handle = coordinator.spawn();
    let watcher = FsWatcher::start(Arc::clone(&coordinator))?;
    info!("Watching {} root(s), press Ctrl+C to stop", watcher.roots().len());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(IndexEvent::ScanFinished { report }) if report.change_count() > 0 => {
                    println!(
                        "Updated: {} added, {} updated, {} removed",
                        report.added, report.updated, report.removed
                    );
                }
                Ok(IndexEvent::ScanFailed { error }) => warn!("Rescan failed: {error}"),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Missed {missed} index events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    watcher.stop();
    coordinator.shutdown();
    loop_handle.await?;
    Ok(())
}

async fn print_summary(coordinator: &Coordinator, report: &ScanReport) -> asset_hub::Result<()> {
    let stats = coordinator.index().statistics()?;
    let (cache_bytes, _) = coordinator.store().disk_usage().await?;

    println!("Scanned {} root(s) in {} ms", report.roots.len(), report.duration_ms);
    println!(
        "  {} added, {} updated, {} removed, {} empty folders pruned",
        report.added, report.updated, report.removed, report.folders_pruned
    );
    for skipped in &report.skipped {
        println!("  skipped {}: {}", skipped.path.display(), skipped.reason);
    }
    for failure in &report.thumbnail_failures {
        println!("  placeholder for {}: {}", failure.path.display(), failure.reason);
    }
    println!(
        "Library: {} assets in {} folders, {} with thumbnails ({} cached)",
        stats.total_assets,
        stats.folders,
        stats.assets_with_thumbnail,
        format_file_size(cache_bytes)
    );
    for (extension, count) in stats.assets_by_extension.iter().take(8) {
        println!("  .{extension}: {count}");
    }
    Ok(())
}
