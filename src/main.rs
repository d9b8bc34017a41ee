use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use orgvault::{
    api::{ClientConfig, TenantClient},
    config::{AppConfig, BackupTarget},
    model::{HistoryStore, ObjectDescriptor, ObjectTask},
    observability::{init_logging, TerminalProgress},
    orchestrator::{BackupOptions, Orchestrator},
    restore::{RestoreDataset, RestoreEngine, RestoreOptions, TransformConfig},
    sink::{FileSink, Sink, TableSink},
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exit code for configuration, credential, and connection failures.
const EXIT_FATAL: i32 = 4;

#[derive(Parser)]
#[command(name = "orgvault", version, about = "Tenant object-graph backup and restore")]
struct Cli {
    /// Path to the run configuration file
    #[arg(long)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract selected objects into the configured sink
    Backup,

    /// Load backed-up datasets into the target tenant
    Restore,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("orgvault: {:#}", e);
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = load_config(&cli.config).await?;
    config.apply_env_overrides();

    let _log_guard = init_logging(
        &config.log_level,
        config.log_directory.as_deref(),
        &config.log_rotation,
    )?;

    info!("orgvault v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {}", cli.config.display());

    let cancel = CancellationToken::new();
    setup_shutdown_handler(cancel.clone()).await;

    let token = config
        .connection
        .credential
        .resolve()
        .context("Failed to resolve session credential")?;
    let mut client_config = ClientConfig::new(&config.connection.instance_url, token);
    client_config.api_version = config.connection.api_version.clone();
    let client = Arc::new(TenantClient::new(client_config)?);

    match cli.command {
        Command::Backup => run_backup(client, &config, cancel).await,
        Command::Restore => run_restore(client, &config, cancel).await,
    }
}

async fn run_backup(
    client: Arc<TenantClient>,
    config: &AppConfig,
    cancel: CancellationToken,
) -> Result<i32> {
    let Some(job) = config.backup.clone() else {
        bail!("Configuration has no backup section");
    };

    // Quotas are advisory; they are shown, never enforced.
    match client.get_limits().await {
        Ok(limits) => {
            if let Some(api) = limits.daily_api_requests() {
                info!("Daily API requests: {}/{} used", api.used(), api.max);
            }
            if let Some(bulk) = limits.daily_bulk_query_jobs() {
                info!("Daily bulk query jobs: {}/{} used", bulk.used(), bulk.max);
            }
        }
        Err(e) => warn!("Could not read tenant limits: {}", e),
    }

    let selection = build_selection(&client, &job.objects).await?;
    if selection.is_empty() {
        bail!("No queryable objects selected");
    }
    info!("Selected {} objects", selection.len());

    let sink: Arc<dyn Sink> = match &job.target {
        BackupTarget::File { compress } => Arc::new(FileSink::new(*compress)),
        BackupTarget::Database {
            url,
            recreate_tables,
        } => Arc::new(TableSink::new(url.clone(), *recreate_tables)),
    };
    let history = Arc::new(HistoryStore::new(config.history_path.clone()).await?);

    let orchestrator = Orchestrator::new(
        client,
        sink,
        history,
        Arc::new(TerminalProgress),
        config.connection.username.clone(),
    );

    let options = BackupOptions {
        parallelism: job.parallelism,
        output_root: job.output_root.clone(),
        record_limit: job.record_limit,
        incremental: job.incremental,
        custom_where: job.custom_where.clone(),
        include_related: job.include_related,
        relationship_depth: job.relationship_depth,
        priority_only: job.priority_only,
        preserve_relationships: job.preserve_relationships,
    };

    let run = orchestrator.run(selection, &options, None, cancel).await?;

    info!(
        "Run {}: {:?}, {} completed, {} failed or skipped",
        run.id,
        run.status,
        run.completed_count(),
        run.failed_or_skipped_count()
    );
    for result in &run.results {
        if let Some(error) = &result.error {
            info!("  {}: {:?}: {}", result.object_name, result.status, error);
        }
        if let Some(warning) = &result.warning {
            warn!("  {}: {}", result.object_name, warning);
        }
    }

    Ok(run.exit_code())
}

/// Resolve the configured object list (or every queryable object) into
/// described tasks.
async fn build_selection(
    client: &Arc<TenantClient>,
    configured: &[String],
) -> Result<Vec<ObjectTask>> {
    let names: Vec<String> = if configured.is_empty() {
        let global = client
            .describe_global()
            .await
            .context("Failed to list tenant objects")?;
        global
            .sobjects
            .into_iter()
            .filter(|o| o.queryable)
            .map(|o| o.name)
            .collect()
    } else {
        configured.to_vec()
    };

    let explicit = !configured.is_empty();
    let mut selection = Vec::with_capacity(names.len());
    for name in names {
        match client.describe_sobject(&name).await {
            Ok(describe) => {
                if !describe.queryable {
                    warn!("{} is not queryable, skipping", name);
                    continue;
                }
                selection.push(ObjectTask::new(ObjectDescriptor::from_describe(&describe)));
            }
            // A misnamed object in the config is a configuration error; a
            // describe hiccup during an all-objects sweep is not.
            Err(e) if explicit => {
                return Err(e).with_context(|| format!("Cannot describe configured object {}", name));
            }
            Err(e) => warn!("Cannot describe {}, skipping: {}", name, e),
        }
    }
    Ok(selection)
}

async fn run_restore(
    client: Arc<TenantClient>,
    config: &AppConfig,
    cancel: CancellationToken,
) -> Result<i32> {
    let Some(job) = config.restore.clone() else {
        bail!("Configuration has no restore section");
    };

    let transform = match &job.transform {
        Some(path) => TransformConfig::load(path).await?,
        None => TransformConfig::default(),
    };

    let datasets = collect_datasets(&job.source_root, &job.objects).await?;
    if datasets.is_empty() {
        bail!("No datasets found under {}", job.source_root.display());
    }
    info!("Restoring {} datasets", datasets.len());

    let options = RestoreOptions {
        mode: job.mode.clone(),
        batch_size: job.batch_size,
        stop_on_error: job.stop_on_error,
        validate_before_restore: job.validate_before_restore,
        preserve_ids: job.preserve_ids,
        dry_run: job.dry_run,
        unresolved_references: job.unresolved_references,
        transform,
        ..RestoreOptions::default()
    };

    let engine = RestoreEngine::new(client);
    let report = engine.execute(datasets, &options, &cancel).await?;

    if report.dry_run {
        for preview in &report.previews {
            info!(
                "[dry run] {}: {} rows, ~{} API calls, {} would defer",
                preview.object, preview.total_rows, preview.estimated_api_calls, preview.would_defer
            );
        }
    }
    for object in &report.objects {
        info!(
            "{}: {} submitted, {} succeeded, {} failed ({} batches)",
            object.object, object.submitted, object.succeeded, object.failed, object.batches
        );
        for error in object.errors.iter().take(5) {
            warn!("  {}: {}", object.object, error);
        }
    }
    if report.deferred_updates_applied > 0 {
        info!(
            "Deferred reference updates applied: {}",
            report.deferred_updates_applied
        );
    }

    Ok(report.exit_code())
}

/// Datasets from the backup directory: the configured objects, or every
/// object CSV present (manifests and sidecars excluded).
async fn collect_datasets(
    source_root: &std::path::Path,
    configured: &[String],
) -> Result<Vec<RestoreDataset>> {
    if !configured.is_empty() {
        let mut datasets = Vec::new();
        for object in configured {
            let csv_path = source_root.join(format!("{}.csv", object));
            if !csv_path.exists() {
                bail!("Dataset not found: {}", csv_path.display());
            }
            datasets.push(RestoreDataset {
                object: object.clone(),
                csv_path,
            });
        }
        return Ok(datasets);
    }

    let mut datasets = Vec::new();
    let mut entries = tokio::fs::read_dir(source_root)
        .await
        .with_context(|| format!("Cannot read {}", source_root.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if path.extension().is_some_and(|ext| ext == "csv") && !stem.starts_with('_') {
            datasets.push(RestoreDataset {
                object: stem.to_string(),
                csv_path: path,
            });
        }
    }
    datasets.sort_by(|a, b| a.object.cmp(&b.object));
    Ok(datasets)
}

async fn load_config(path: &PathBuf) -> Result<AppConfig> {
    if !path.exists() {
        bail!(
            "Configuration file not found: {}\n\nCreate a config file first. Example:\n{}",
            path.display(),
            example_config()
        );
    }

    let content = tokio::fs::read_to_string(path)
        .await
        .context("Failed to read config file")?;

    let config: AppConfig =
        serde_json::from_str(&content).context("Failed to parse config file")?;

    Ok(config)
}

/// Wire Ctrl+C / SIGTERM to cooperative cancellation.
async fn setup_shutdown_handler(cancellation: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(windows)]
        {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received shutdown signal (Ctrl+C)");
                    cancellation.cancel();
                }
                Err(e) => {
                    eprintln!("Failed to listen for shutdown signal: {}", e);
                }
            }
        }

        #[cfg(unix)]
        {
            use signal::unix::{signal, SignalKind};

            let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
            let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    cancellation.cancel();
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    cancellation.cancel();
                }
            }
        }
    });
}

fn example_config() -> &'static str {
    r#"{
  "connection": {
    "name": "production",
    "instance_url": "https://example.my.tenant.com",
    "username": "ada@example.com",
    "credential": {"type": "env", "var": "ORGVAULT_ACCESS_TOKEN"}
  },
  "backup": {
    "objects": ["Account", "Contact"],
    "output_root": "/var/backups/tenant",
    "target": {"type": "file", "compress": true},
    "parallelism": 8,
    "incremental": true,
    "include_related": false
  },
  "log_level": "info",
  "history_path": ".orgvault_history.json"
}"#
}
