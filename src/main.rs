use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

use feedbrief::config::Config;
use feedbrief::pipeline::Pipeline;
use feedbrief::storage::{Database, DatabaseError};

/// Get the config directory path (~/.config/feedbrief/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    let config_dir = PathBuf::from(home).join(".config").join("feedbrief");
    Ok(config_dir)
}

/// Create `dir` if needed and restrict it to the current user; the config
/// file may hold an API key.
fn ensure_private_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        println!("Created config directory: {}", dir.display());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let restricted = std::fs::metadata(dir).and_then(|meta| {
            let mut perms = meta.permissions();
            perms.set_mode(0o700);
            std::fs::set_permissions(dir, perms)
        });
        if let Err(e) = restricted {
            tracing::warn!(path = %dir.display(), error = %e, "Failed to restrict config directory to 0700");
        }
    }
    Ok(())
}

#[derive(Parser, Debug)]
#[command(
    name = "feedbrief",
    about = "Scheduled feed collection with AI-generated briefs"
)]
struct Args {
    /// Config file (default: ~/.config/feedbrief/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file (default: ~/.config/feedbrief/feedbrief.db)
    #[arg(long, value_name = "FILE")]
    db: Option<PathBuf>,

    /// Run one task now and exit once its queue drains
    #[arg(long, value_name = "ID")]
    run_task: Option<String>,

    /// With --run-task, crawl only the first feed
    #[arg(long, requires = "run_task")]
    test: bool,

    /// Generate briefs for up to N articles and exit
    #[arg(long, value_name = "N")]
    generate_briefs: Option<u32>,

    /// Print article statistics and exit
    #[arg(long)]
    stats: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    ensure_private_dir(&config_dir)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    tracing::debug!(config = ?config, "Loaded configuration");

    let db_path = args
        .db
        .clone()
        .unwrap_or_else(|| config_dir.join("feedbrief.db"));
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of feedbrief appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    if args.stats {
        let stats = db
            .article_stats()
            .await
            .context("Failed to read article statistics")?;
        let briefs = db.count_briefs().await.context("Failed to count briefs")?;
        println!("Feeds:            {}", stats.feeds);
        println!("Articles:         {}", stats.total);
        println!("  with content:   {}", stats.with_content);
        println!("  without:        {}", stats.without_content);
        println!("  inactive:       {}", stats.inactive);
        println!("Briefs:           {}", briefs);
        return Ok(());
    }

    let pipeline = Pipeline::from_config(db, config).context("Failed to build pipeline")?;

    if let Some(limit) = args.generate_briefs {
        if !pipeline.briefs().is_enabled() {
            eprintln!("Brief generation is disabled; set [ai] enabled = true in the config.");
            std::process::exit(1);
        }
        let result = pipeline
            .generate_briefs(limit)
            .await
            .context("Brief batch failed")?;
        println!(
            "Briefs: {} generated, {} failed, {} skipped ({} total)",
            result.success, result.failed, result.skipped, result.total
        );
        pipeline.shutdown().await;
        return Ok(());
    }

    if let Some(task_id) = &args.run_task {
        let tasks = pipeline.run_task(Some(task_id), args.test).await?;
        if tasks.is_empty() {
            eprintln!("Error: No active task with id {}", task_id);
            std::process::exit(1);
        }
        pipeline.wait_idle().await;
        let info = pipeline.queue_info();
        let briefs = pipeline.enrichment_queue().get_queue_info();
        println!(
            "Task {} finished: {} crawls completed, {} failed; {} brief units completed, {} failed",
            task_id, info.completed, info.failed, briefs.completed, briefs.failed
        );
        pipeline.shutdown().await;
        return Ok(());
    }

    let registered = pipeline.start().await?;
    tracing::info!(tasks = registered, "feedbrief running, press Ctrl-C to stop");
    println!("Scheduled {} task(s). Press Ctrl-C to stop.", registered);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    pipeline.shutdown().await;
    println!("Goodbye!");
    Ok(())
}
