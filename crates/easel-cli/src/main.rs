use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use easel_contracts::requests::{GenerationRequest, RawRow};
use easel_contracts::session::{non_empty_env, Credentials};
use easel_engine::{
    default_provider_registry, BatchEngine, BatchOptions, DeliveryStatus, DriveStorage,
    LocalDirStorage, MailGatewayNotifier, Notifier, StorageProvider,
};

#[derive(Debug, Parser)]
#[command(
    name = "easel",
    version,
    about = "Batch image generation with hierarchical upload and delivery"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Run(RunArgs),
    Plan(PlanArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    /// CSV batch with a Prompt column and optional Style/Size columns.
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Name of the published zip archive.
    #[arg(long, default_value = "generated_images")]
    project: String,
    #[arg(long)]
    model: Option<String>,
    /// Storage backend: drive or local.
    #[arg(long, default_value = "drive")]
    storage: String,
    /// Comma-separated notification recipients.
    #[arg(long)]
    recipients: Option<String>,
    #[arg(long, default_value = "Your Generated Images ZIP")]
    subject: String,
    #[arg(long, default_value = "Here is your image zip file and upload log.")]
    message: String,
    #[arg(long)]
    no_attach_log: bool,
    #[arg(long)]
    preview_email: bool,
    #[arg(long)]
    no_send_email: bool,
    #[arg(long, default_value_t = 2.0)]
    pause_seconds: f64,
}

#[derive(Debug, Parser)]
struct PlanArgs {
    #[arg(long)]
    input: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("easel error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_batch(args),
        Command::Plan(args) => run_plan(args),
    }
}

fn run_batch(args: RunArgs) -> Result<i32> {
    let rows = load_rows(&args.input)?;
    if rows.is_empty() {
        bail!("{} contains no rows", args.input.display());
    }
    let recipients = parse_recipients(args.recipients.as_deref());
    let credentials = Credentials::from_env();
    let providers = default_provider_registry(&credentials);
    let storage = build_storage(&args, &credentials)?;
    let notifier = build_notifier(&args, &recipients, &credentials)?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));

    let options = BatchOptions {
        project_name: args.project.clone(),
        model: args.model.clone(),
        pause_between_items: Duration::from_secs_f64(args.pause_seconds.max(0.0)),
        recipients,
        subject: args.subject.clone(),
        body: args.message.clone(),
        attach_log: !args.no_attach_log,
        preview_email: args.preview_email,
        send_email: !args.no_send_email,
    };

    let mut engine =
        BatchEngine::new(&args.out, &events_path, providers, storage, notifier, options)?;
    println!("session {}", engine.session_id());
    let total = rows.len();
    let outcome = engine.run(&rows)?;

    for failure in &outcome.failures {
        eprintln!("item {}: {}", failure.index + 1, failure.error);
    }
    println!(
        "{} of {} images generated and uploaded",
        outcome.succeeded(),
        total
    );
    println!("log: {}", outcome.log_path.display());
    println!("archive: {}", outcome.archive_path.display());
    match &outcome.delivery {
        DeliveryStatus::Skipped => {}
        DeliveryStatus::PreviewedOnly => println!("notification previewed, not sent"),
        DeliveryStatus::Sent { recipients } => {
            println!("notification sent to {recipients} recipient(s)")
        }
        DeliveryStatus::Failed { error } => eprintln!("notification failed: {error}"),
    }
    Ok(0)
}

fn run_plan(args: PlanArgs) -> Result<i32> {
    let rows = load_rows(&args.input)?;
    let mut ready = 0usize;
    let mut skipped = 0usize;
    for (index, row) in rows.iter().enumerate() {
        match GenerationRequest::normalize(row) {
            Ok(request) => {
                ready += 1;
                println!(
                    "{:>3}. [{}] {} ({})",
                    index + 1,
                    request.style,
                    request.effective_prompt(),
                    request.size
                );
            }
            Err(err) => {
                skipped += 1;
                println!("{:>3}. skipped: {err}", index + 1);
            }
        }
    }
    println!("{ready} ready, {skipped} skipped");
    Ok(0)
}

fn build_storage(args: &RunArgs, credentials: &Credentials) -> Result<Box<dyn StorageProvider>> {
    match args.storage.as_str() {
        "drive" => {
            let Some(token) = credentials.storage_token.clone() else {
                bail!("EASEL_STORAGE_TOKEN is required for --storage drive");
            };
            Ok(Box::new(DriveStorage::new(token)))
        }
        "local" => Ok(Box::new(LocalDirStorage::new(args.out.join("remote")))),
        other => bail!("unknown storage backend '{other}' (expected 'drive' or 'local')"),
    }
}

fn build_notifier(
    args: &RunArgs,
    recipients: &[String],
    credentials: &Credentials,
) -> Result<Option<Box<dyn Notifier>>> {
    if recipients.is_empty() || args.no_send_email {
        return Ok(None);
    }
    let Some(api_key) = credentials.mail_api_key.clone() else {
        bail!("EASEL_MAIL_API_KEY is required to send notifications");
    };
    let Some(api_base) = non_empty_env("EASEL_MAIL_API_BASE") else {
        bail!("EASEL_MAIL_API_BASE is required to send notifications");
    };
    let sender =
        non_empty_env("EASEL_MAIL_SENDER").unwrap_or_else(|| "no-reply@easel.local".to_string());
    Ok(Some(Box::new(MailGatewayNotifier::new(
        api_base, api_key, sender,
    ))))
}

fn parse_recipients(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

fn load_rows(path: &Path) -> Result<Vec<RawRow>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed opening {}", path.display()))?;
    let headers = reader
        .headers()
        .context("failed reading csv headers")?
        .clone();
    let prompt_column = header_index(&headers, "prompt");
    let style_column = header_index(&headers, "style");
    let size_column = header_index(&headers, "size");
    if prompt_column.is_none() {
        bail!("{} has no Prompt column", path.display());
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("failed reading csv record")?;
        rows.push(RawRow {
            prompt: field(&record, prompt_column),
            style: field(&record, style_column),
            size: field(&record, size_column),
        });
    }
    Ok(rows)
}

fn header_index(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers
        .iter()
        .position(|header| header.trim().eq_ignore_ascii_case(name))
}

fn field(record: &csv::StringRecord, index: Option<usize>) -> Option<String> {
    index
        .and_then(|position| record.get(position))
        .map(str::to_string)
        .filter(|value| !value.trim().is_empty())
}
