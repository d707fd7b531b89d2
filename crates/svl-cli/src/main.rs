mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use svl_load::{LoadConfig, LoadError, LoadPipeline, LoadRunSummary};
use svl_report::{
    build_reporting_table, export_dictionary, export_parquet_snapshot, ReportConfig, ReportSummary,
};
use svl_storage::{Store, StoreStats};
use tracing::info;

use crate::logging::{init_logging, LogConfig};

#[derive(Debug, Parser)]
#[command(name = "svl")]
#[command(about = "Survey loader: users, ratings and survey responses into SQLite")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the store schema
    Migrate,
    /// Load users, ratings and surveys (default)
    Load(LoadArgs),
    /// Rebuild the reporting table
    Report(ReportArgs),
    /// Write the data dictionary of the reporting table
    Dictionary(DictionaryArgs),
    /// Print row counts and sample surveys
    Verify,
    /// Load, report, write the dictionary and a Parquet snapshot
    All(AllArgs),
}

#[derive(Debug, Clone, Default, Args)]
struct LoadArgs {
    /// Stop after this many inserted surveys
    #[arg(long)]
    max_records: Option<usize>,
    /// Commit every N inserted surveys
    #[arg(long)]
    commit_interval: Option<usize>,
}

#[derive(Debug, Clone, Default, Args)]
struct ReportArgs {
    #[arg(long)]
    year: Option<i32>,
    /// Comma separated months, e.g. 6,7,8
    #[arg(long, value_delimiter = ',')]
    months: Vec<u32>,
    #[arg(long)]
    table: Option<String>,
}

#[derive(Debug, Clone, Default, Args)]
struct DictionaryArgs {
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    table: Option<String>,
}

#[derive(Debug, Clone, Default, Args)]
struct AllArgs {
    #[command(flatten)]
    load: LoadArgs,
    #[command(flatten)]
    report: ReportArgs,
    /// Data dictionary output path
    #[arg(long)]
    output: Option<PathBuf>,
}

impl LoadArgs {
    fn apply(&self, config: &mut LoadConfig) {
        if self.max_records.is_some() {
            config.options.max_records = self.max_records;
        }
        if self.commit_interval.is_some() {
            config.options.commit_interval = self.commit_interval;
        }
    }
}

impl ReportArgs {
    fn apply(&self, config: &mut ReportConfig) -> Result<()> {
        if let Some(year) = self.year {
            config.window.year = year;
        }
        if !self.months.is_empty() {
            config.window.months = self.months.clone();
        }
        if let Some(table) = &self.table {
            config.table = table.clone();
        }
        config.window.validate()?;
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&LogConfig::from_env()?)?;

    let command = cli
        .command
        .unwrap_or_else(|| Commands::Load(LoadArgs::default()));
    let result = run(command).await;
    if let Some(message) = result.as_ref().err().and_then(fatal_message) {
        eprintln!("{message}");
    }
    result
}

/// Operator note on what a failed load left in the store.
fn fatal_message(err: &anyhow::Error) -> Option<String> {
    err.downcast_ref::<LoadError>().map(LoadError::progress_note)
}

async fn run(command: Commands) -> Result<()> {
    let mut load_config = LoadConfig::from_env();
    let mut report_config = ReportConfig::from_env();

    match command {
        Commands::Migrate => {
            let mut store = open_store(&load_config).await?;
            store.bootstrap_schema().await?;
            println!("schema ready: {}", store.url());
            store.close().await?;
        }
        Commands::Load(args) => {
            args.apply(&mut load_config);
            let mut store = load_config.open_store().await?;
            let summary = LoadPipeline::new(load_config).run_once(&mut store).await?;
            print_load_summary(&summary);
            store.close().await?;
        }
        Commands::Report(args) => {
            args.apply(&mut report_config)?;
            let mut store = open_store(&load_config).await?;
            let summary =
                build_reporting_table(&mut store, &report_config.table, &report_config.window).await?;
            print_report_summary(&summary);
            store.close().await?;
        }
        Commands::Dictionary(args) => {
            let table = args.table.unwrap_or(report_config.table);
            let output = args.output.unwrap_or(report_config.dictionary_path);
            let mut store = open_store(&load_config).await?;
            let dictionary = export_dictionary(&mut store, &table, &output).await?;
            println!(
                "dictionary written: {} (table={} rows={} columns={})",
                output.display(),
                table,
                dictionary.metadata.total_rows,
                dictionary.columns.len()
            );
            store.close().await?;
        }
        Commands::Verify => {
            let mut store = Store::open_existing(&load_config.database_url)
                .await
                .with_context(|| format!("opening {}", load_config.database_url))?;
            let missing = store.missing_tables().await?;
            if missing.is_empty() {
                print_stats(&store.stats().await?);
            } else {
                println!("missing tables: {}; run `svl migrate` or `svl load`", missing.join(", "));
            }
            store.close().await?;
        }
        Commands::All(args) => {
            args.load.apply(&mut load_config);
            args.report.apply(&mut report_config)?;
            let output = args.output.unwrap_or(report_config.dictionary_path.clone());
            let reports_dir = load_config.reports_dir.clone();

            let mut store = load_config.open_store().await?;
            let load = LoadPipeline::new(load_config).run_once(&mut store).await?;
            print_load_summary(&load);

            let report =
                build_reporting_table(&mut store, &report_config.table, &report_config.window).await?;
            print_report_summary(&report);

            let dictionary = export_dictionary(&mut store, &report_config.table, &output).await?;
            println!(
                "dictionary written: {} ({} columns)",
                output.display(),
                dictionary.columns.len()
            );

            let run_dir = reports_dir.join(load.run_id.to_string());
            let manifest = export_parquet_snapshot(&mut store, &report_config.table, &run_dir).await?;
            println!("parquet manifest: {}", manifest.display());
            store.close().await?;
        }
    }
    Ok(())
}

async fn open_store(config: &LoadConfig) -> Result<Store> {
    let store = Store::open(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    info!(url = %config.database_url, "store opened");
    Ok(store)
}

fn print_load_summary(summary: &LoadRunSummary) {
    let s = &summary.surveys;
    println!("load complete: run_id={} reports={}", summary.run_id, summary.reports_dir);
    println!(
        "  users: loaded={} skipped={} rejected={}",
        summary.users.loaded, summary.users.skipped, summary.users.rejected
    );
    println!(
        "  ratings: loaded={} rejected={}",
        summary.ratings.loaded, summary.ratings.rejected
    );
    println!(
        "  surveys: read={} inserted={} with_rating={} duplicates={} skipped={} rejected={} malformed_fields={}{}",
        s.records_read,
        s.processed,
        s.valid,
        s.duplicates,
        s.skipped,
        s.rejected,
        s.malformed_fields,
        if s.truncated { " (stopped at cap)" } else { "" }
    );
    print_stats(&summary.stats);
}

fn print_stats(stats: &StoreStats) {
    println!(
        "  store: usuarios={} dimension_calificaciones={} encuestas={}",
        stats.counts.users, stats.counts.ratings, stats.counts.surveys
    );
    let ids = &stats.survey_ids;
    if let (Some(min), Some(max)) = (ids.min_id, ids.max_id) {
        println!(
            "  id_encuesta: min={min} max={max} total={} unique={}",
            ids.total,
            if ids.all_unique() { "yes" } else { "no" }
        );
    }
    for sample in &stats.samples {
        println!(
            "  sample: id={} estado={} calificacion={} usuario={} fecha={}",
            sample.id,
            sample.status.as_deref().unwrap_or("-"),
            sample.rating_id.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string()),
            sample.user_name.as_deref().unwrap_or("-"),
            sample.inserted_on.as_deref().unwrap_or("-"),
        );
    }
}

fn print_report_summary(summary: &ReportSummary) {
    println!(
        "report {} ({}): rows={} unique_users={} average_rating={}",
        summary.table,
        summary.window,
        summary.total_rows,
        summary.unique_users,
        summary
            .average_rating
            .map(|avg| format!("{avg:.2}"))
            .unwrap_or_else(|| "-".to_string())
    );
    for row in &summary.sample {
        println!(
            "  id={} usuario={} email={} calificacion={} fecha={}",
            row.id,
            row.user_name.as_deref().unwrap_or("-"),
            row.email.as_deref().unwrap_or("-"),
            row.rating_value.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string()),
            row.inserted_on.as_deref().unwrap_or("-"),
        );
    }
}
