// src/main.rs

use anyhow::{bail, Context, Result};
use clap::Parser;
use odm_queue::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Download files one at a time, resuming interrupted transfers.
#[derive(Debug, Parser)]
#[command(name = "odm-queue", version)]
struct Cli {
    /// SQLite database holding the queue and partial downloads.
    #[arg(long, default_value = "downloads.db")]
    db: PathBuf,

    /// Directory receiving completed files (overrides the config file).
    #[arg(long)]
    dir: Option<PathBuf>,

    /// JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Speed limit in bytes per second; 0 is unlimited.
    #[arg(long)]
    limit: Option<u64>,

    /// Bearer token sent with every request.
    #[arg(long, env = "ODM_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// URLs to download. Without any, jobs left in the database are resumed.
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ManagerConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ManagerConfig::default(),
    };
    if let Some(dir) = cli.dir {
        config.download_dir = dir;
    }
    if let Some(limit) = cli.limit {
        config.speed_limit = limit;
    }

    let auth: Arc<dyn TokenProvider> = match cli.token {
        Some(token) => Arc::new(StaticToken::new(token)),
        None => Arc::new(NoAuth),
    };

    let state_manager = StateManager::open(&cli.db)
        .await
        .with_context(|| format!("opening {}", cli.db.display()))?;
    let manager = Arc::new(DownloadManager::new(state_manager, config, auth).await?);

    let mut next_id = manager.jobs().len() + 1;
    for url in &cli.urls {
        while manager.job(&next_id.to_string()).is_some() {
            next_id += 1;
        }
        let filename = filename_for(url, next_id);
        manager
            .start_download(JobDescriptor::new(next_id.to_string(), filename, url.clone()))
            .await?;
    }
    for job in manager.jobs() {
        if job.status == JobStatus::Paused {
            manager.resume_download(&job.id).await?;
        }
    }

    let runner = tokio::spawn(manager.clone().run());
    let reporter = {
        let mut updates = manager.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                for job in updates.borrow_and_update().iter() {
                    if job.status == JobStatus::InProgress {
                        info!(job_id = %job.id, progress = job.progress, received = job.received, total = job.total, "downloading");
                    }
                }
            }
        })
    };

    tokio::select! {
        _ = manager.wait_until_idle() => {},
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, pausing active transfer");
            for job in manager.jobs() {
                manager.pause_download(&job.id).await?;
            }
        }
    }
    reporter.abort();
    runner.abort();
    let _ = runner.await;

    let jobs = manager.jobs();
    for job in &jobs {
        info!(job_id = %job.id, filename = %job.filename, status = %job.status, "final state");
    }
    let failed = jobs.iter().filter(|job| job.status == JobStatus::Failed).count();
    if failed > 0 {
        bail!("{failed} download(s) failed");
    }
    manager.clear_completed().await?;
    Ok(())
}

/// Last non-empty path segment of `url`, or `download-<n>`.
fn filename_for(url: &str, n: usize) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let path = path.split_once("://").map_or(path, |(_, rest)| rest);
    path.split('/')
        .skip(1)
        .filter(|segment| !segment.is_empty())
        .last()
        .map(str::to_string)
        .unwrap_or_else(|| format!("download-{n}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_from_url() {
        assert_eq!(filename_for("https://x/a.bin", 1), "a.bin");
        assert_eq!(filename_for("https://x/dir/b.iso?sig=1", 2), "b.iso");
        assert_eq!(filename_for("https://x/", 3), "download-3");
        assert_eq!(filename_for("https://x", 4), "download-4");
    }
}
