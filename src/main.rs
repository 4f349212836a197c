mod calendar;
mod config;
mod error;
mod fetch;
mod limiter;
mod models;
mod pipeline;
mod providers;
mod rollup;
mod service;
mod stats;
mod utilization;

use calendar::{parse_day, CalendarWindowPilot};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use config::{
    ensure_initialized, load_config, load_config_file, save_config, set_secret_key,
    upsert_account, CloudAccount,
};
use error::AppError;
use providers::CloudProvider;
use serde_json::{json, Map, Value};
use service::{report_views, ReportService};
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "costpilot")]
#[command(about = "Multi-cloud billing rollups and cost dashboards")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init,
    AddAccount {
        #[arg(long)]
        name: String,
        #[arg(long)]
        provider: String,
        #[arg(long)]
        access_key: String,
        #[arg(long)]
        secret_key: Option<String>,
        #[arg(long, default_value = "")]
        region_id: String,
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Print every reporting window for a date.
    Windows {
        #[arg(long, value_parser = parse_now)]
        now: Option<NaiveDate>,
    },
    Report {
        #[arg(long, value_parser = parse_now)]
        now: Option<NaiveDate>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, default_value = "json")]
        format: String,
        #[arg(long)]
        skip_utilization: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Json,
    Js,
}

fn parse_now(raw: &str) -> Result<NaiveDate, String> {
    parse_day(raw).map_err(|err| err.to_string())
}

fn validate_format(input: &str) -> Result<OutputFormat, AppError> {
    match input.to_ascii_lowercase().as_str() {
        "json" => Ok(OutputFormat::Json),
        "js" => Ok(OutputFormat::Js),
        _ => Err(AppError::Config(
            "Unsupported output format. Use json or js.".into(),
        )),
    }
}

fn pilot_for(now: Option<NaiveDate>) -> CalendarWindowPilot {
    CalendarWindowPilot::new(now.unwrap_or_else(|| chrono::Local::now().date_naive()))
}

fn windows_json(pilot: &CalendarWindowPilot) -> Result<Value, AppError> {
    let mut windows = Map::new();
    for view in report_views() {
        windows.insert(view.label(), serde_json::to_value(view.window(pilot))?);
    }
    Ok(json!({
        "now": calendar::format_day(pilot.now()),
        "windows": windows,
    }))
}

fn render(body: &str, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => body.to_string(),
        OutputFormat::Js => format!("window.costAnalysis = {body};"),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            ensure_initialized()?;
            println!("Initialized costpilot config and data directories.");
        }
        Commands::AddAccount {
            name,
            provider,
            access_key,
            secret_key,
            region_id,
            endpoint,
            fixture,
        } => {
            ensure_initialized()?;
            let provider: CloudProvider = provider.parse()?;
            let mut cfg = load_config_file()?;
            let account = CloudAccount {
                name: name.trim().to_string(),
                provider,
                access_key,
                region_id,
                endpoint,
                fixture,
            };
            if let Some(key) = secret_key {
                set_secret_key(&account.name, &key)?;
            }
            let name = account.name.clone();
            upsert_account(&mut cfg, account);
            save_config(&cfg)?;
            println!("Account '{name}' configured for {}.", provider.display_name());
        }
        Commands::Windows { now } => {
            let pilot = pilot_for(now);
            println!("{}", serde_json::to_string_pretty(&windows_json(&pilot)?)?);
        }
        Commands::Report {
            now,
            output,
            format,
            skip_utilization,
        } => {
            let format = validate_format(&format)?;
            ensure_initialized()?;
            let cfg = load_config()?;
            let pilot = pilot_for(now);
            let dashboard = ReportService::new(cfg)
                .run(pilot, !skip_utilization)
                .await?;
            let rendered = render(&serde_json::to_string_pretty(&dashboard)?, format);
            match output {
                Some(path) => {
                    fs::write(&path, rendered)?;
                    info!(path = %path.display(), "dashboard written");
                }
                None => println!("{rendered}"),
            }
        }
    }

    Ok(())
}
