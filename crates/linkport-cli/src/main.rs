use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use linkport_core::{ColumnMapping, ImportJob, ImportSummary, TestSchedule, TestVariant};
use linkport_import::{
    render_summary_text, BatchOutcome, Collaborators, ImportConfig, ImportRequest, ImportRuntime, LogNotifier,
    MemoryQueue, NoopDomainRegistrar, StandardLinkValidator,
};
use linkport_storage::{FsObjectStore, MemoryCursorStore, MemoryLinkRepository, PgLinkRepository};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "linkport-cli")]
#[command(about = "Linkport CSV import worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the queue endpoints.
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Import a local CSV end to end without external services.
    ImportFile {
        path: PathBuf,
        #[arg(long)]
        workspace: String,
        #[arg(long, default_value = "local")]
        user: String,
        #[arg(long)]
        folder: Option<String>,
        #[arg(long)]
        link_column: String,
        #[arg(long)]
        url_column: String,
        #[arg(long)]
        title_column: Option<String>,
        #[arg(long)]
        description_column: Option<String>,
        #[arg(long)]
        tags_column: Option<String>,
        #[arg(long)]
        created_at_column: Option<String>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
    /// (Re)schedule the completion of a link's A/B test.
    ScheduleTest {
        link_id: String,
        /// RFC 3339 completion time; omit to cancel.
        #[arg(long)]
        completes_at: Option<DateTime<Utc>>,
        /// Variant destination URL; repeat for each variant.
        #[arg(long = "variant")]
        variants: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("linkport=info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => linkport_web::serve_from_env().await?,
        Commands::Migrate => {
            let config = ImportConfig::from_env();
            let database_url = config.database_url.context("DATABASE_URL is not set")?;
            PgLinkRepository::connect(&database_url)
                .await
                .context("connecting to postgres")?
                .migrate()
                .await?;
            println!("migrations applied");
        }
        Commands::ImportFile {
            path,
            workspace,
            user,
            folder,
            link_column,
            url_column,
            title_column,
            description_column,
            tags_column,
            created_at_column,
            max_rows,
        } => {
            let mapping = ColumnMapping {
                title: title_column,
                description: description_column,
                tags: tags_column,
                created_at: created_at_column,
                ..ColumnMapping::new(link_column, url_column)
            };
            let summary = import_file(&path, &workspace, &user, folder, mapping, max_rows).await?;
            print!("{}", render_summary_text(&summary)?);
        }
        Commands::ScheduleTest {
            link_id,
            completes_at,
            variants,
        } => {
            let runtime = ImportRuntime::from_env().await?;
            if runtime.config.queue_url.is_none() {
                eprintln!("QUEUE_URL is not set; the in-process queue will not outlive this command");
            }
            let percentage = if variants.is_empty() {
                0.0
            } else {
                100.0 / variants.len() as f64
            };
            let schedule = TestSchedule {
                link_id,
                test_variants: variants
                    .into_iter()
                    .map(|url| TestVariant { url, percentage })
                    .collect(),
                test_completed_at: completes_at,
            };
            let state = runtime.scheduler.schedule(&schedule, Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
    }

    Ok(())
}

/// Runs every batch of an import in-process, delivering continuations from a memory queue.
async fn import_file(
    path: &Path,
    workspace_id: &str,
    user_id: &str,
    folder_id: Option<String>,
    mapping: ColumnMapping,
    max_rows: Option<usize>,
) -> Result<ImportSummary> {
    let mut config = ImportConfig::from_env();
    if let Some(max_rows) = max_rows.filter(|n| *n > 0) {
        config.max_rows_per_execution = max_rows;
    }

    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let uploads = FsObjectStore::new(&config.uploads_dir);
    let stored = uploads.store_bytes(workspace_id, "csv", &bytes).await?;
    info!(path = %path.display(), location = %stored.location, "staged csv for import");

    let platform_domains = config.platform_domains()?;
    let queue = Arc::new(MemoryQueue::new());
    let stores = Arc::new(MemoryCursorStore::new());
    let runtime = ImportRuntime::from_parts(
        config,
        Collaborators {
            objects: Arc::new(uploads),
            cursors: stores.clone(),
            links: Arc::new(MemoryLinkRepository::new()),
            registrar: Arc::new(NoopDomainRegistrar),
            validator: Arc::new(StandardLinkValidator::new(platform_domains.clone())),
            queue: queue.clone(),
            notifier: Arc::new(LogNotifier),
        },
        stores,
        platform_domains,
    );

    let request = ImportRequest {
        user_id: user_id.to_string(),
        folder_id,
        url: stored.location,
        mapping,
    };
    runtime.start_import(workspace_id, request).await?;

    loop {
        let pending = queue.drain().await;
        if pending.is_empty() {
            bail!("import stopped without finishing");
        }
        for delivered in pending {
            let job: ImportJob = delivered.message.decode()?;
            match runtime.pipeline.process(&job).await? {
                BatchOutcome::Continued { cursor, .. } => info!(cursor, "continuing import"),
                BatchOutcome::Finished { summary, .. } => return Ok(summary),
            }
        }
    }
}
