use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use geolayer_sync::app::{App, ProgressSinkKind, RetrySource};
use geolayer_sync::config::{ConfigLoader, ResolvedConfig};
use geolayer_sync::error::SyncError;
use geolayer_sync::output::{JsonOutput, OutputMode};
use geolayer_sync::report::RunReport;
use geolayer_sync::service::ArcGisHttpClient;
use geolayer_sync::tui::Tui;
use geolayer_sync::worker::CancelToken;

#[derive(Parser)]
#[command(name = "geolayer-sync")]
#[command(about = "Mirror ArcGIS REST layers into a local GeoJSON archive and reconcile it")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true, help = "Path to geolayer-sync.json")]
    config: Option<String>,

    #[arg(long, global = true)]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Discover and download every catalog endpoint")]
    Run,
    #[command(about = "Re-drive failures from a previous report or an item list")]
    Retry {
        #[arg(long, conflicts_with = "items", help = "Run report to take failures from")]
        report: Option<Utf8PathBuf>,

        #[arg(long, help = "JSON list of explicit retry items")]
        items: Option<Utf8PathBuf>,

        #[arg(long, help = "Include non-transient failures")]
        all_failures: bool,
    },
    #[command(about = "Compare the catalog's live layers with the data root")]
    Reconcile {
        #[arg(long)]
        report: Option<Utf8PathBuf>,
    },
    #[command(about = "Summarize the data root without network access")]
    Status {
        #[arg(long)]
        report: Option<Utf8PathBuf>,
    },
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<SyncError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &SyncError) -> u8 {
    match error {
        SyncError::CatalogRead { .. }
        | SyncError::MissingConfig(_)
        | SyncError::ConfigRead(_)
        | SyncError::ConfigParse(_)
        | SyncError::InvalidConfig(_)
        | SyncError::ReportRead { .. }
        | SyncError::ReportParse { .. }
        | SyncError::InvalidRetryItem(_) => 2,
        SyncError::HttpClient(_) => 3,
        SyncError::Filesystem(_) => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let cancel = CancelToken::new();
    let service = ArcGisHttpClient::new(&config.user_agent, config.max_redirects)?;
    let app = App::new(config.clone(), service).with_cancel(cancel.clone());

    match cli.command {
        Commands::Run => {
            let report = match output_mode {
                OutputMode::NonInteractive => app.run(&JsonOutput)?,
                OutputMode::Interactive => {
                    let mut tui = tui_for(ProgressSinkKind::Run, &config, &cancel);
                    let report = tui.run(move |sink| app.run(sink))?;
                    tui.finish(run_summary(&report, &config.run_report))?;
                    report
                }
            };
            if matches!(output_mode, OutputMode::NonInteractive) {
                JsonOutput::print_run(&report).into_diagnostic()?;
            }
        }
        Commands::Retry {
            report,
            items,
            all_failures,
        } => {
            let source = match items {
                Some(path) => RetrySource::Items(path),
                None => RetrySource::Report {
                    path: report.unwrap_or_else(|| config.run_report.clone()),
                    all_failures,
                },
            };
            match output_mode {
                OutputMode::NonInteractive => {
                    let report = app.retry(&source, &JsonOutput)?;
                    JsonOutput::print_run(&report).into_diagnostic()?;
                }
                OutputMode::Interactive => {
                    let mut tui = tui_for(ProgressSinkKind::Retry, &config, &cancel);
                    let report = tui.run(move |sink| app.retry(&source, sink))?;
                    tui.finish(run_summary(&report, &config.retry_report))?;
                }
            }
        }
        Commands::Reconcile { report } => match output_mode {
            OutputMode::NonInteractive => {
                let result = app.reconcile(report.as_deref(), &JsonOutput)?;
                JsonOutput::print_reconcile(&result).into_diagnostic()?;
            }
            OutputMode::Interactive => {
                let mut tui = tui_for(ProgressSinkKind::Reconcile, &config, &cancel);
                let result = tui.run(move |sink| app.reconcile(report.as_deref(), sink))?;
                let mut summary = vec![
                    format!("Expected layers: {}", result.expected_count),
                    format!("Present: {}", result.existing_count),
                    format!("Missing: {}", result.missing_count),
                    format!("Unexpected files: {}", result.unexpected_artifacts.len()),
                ];
                summary.extend(
                    result
                        .recommendations
                        .iter()
                        .map(|rec| format!("{} x{}: {}", rec.issue, rec.count, rec.remediation)),
                );
                summary.push(format!("Report: {}", config.reconcile_report));
                tui.finish(summary)?;
            }
        },
        Commands::Status { report } => {
            let status = app.status(report.as_deref(), &JsonOutput)?;
            JsonOutput::print_status(&status).into_diagnostic()?;
        }
    }

    Ok(())
}

fn tui_for(kind: ProgressSinkKind, config: &ResolvedConfig, cancel: &CancelToken) -> Tui {
    Tui::new(kind, config.data_root.clone(), cancel.clone())
}

fn run_summary(report: &RunReport, path: &Utf8PathBuf) -> Vec<String> {
    vec![
        format!("Endpoints: {}", report.total_endpoints),
        format!("Succeeded: {}", report.success_count),
        format!("Failed: {}", report.failure_count),
        format!("Report: {path}"),
    ]
}
