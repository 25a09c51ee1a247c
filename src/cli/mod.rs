//! Command-line interface for podcast-agent.
//!
//! Provides commands for running the pipeline or a single stage, sending
//! the digest, inspecting state and running as a long-lived scheduler.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use crate::config::Settings;
use crate::core::{next_digest_at, Database, DigestReport, Orchestrator};
use crate::domain::StageKind;

/// podcast-agent - Podcast download, transcription and digest pipeline
#[derive(Parser, Debug)]
#[command(name = "podcast-agent")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch feeds, then download, transcribe and summarize
    Run,

    /// Run a single stage over its eligible items
    Stage {
        /// download, transcription or summarization
        stage: StageKind,
    },

    /// Send the digest for the trailing window
    Digest {
        /// Print the digest instead of sending it
        #[arg(long)]
        dry_run: bool,

        /// With --dry-run, also write the HTML rendering to this file
        #[arg(long, value_name = "FILE", requires = "dry_run")]
        html: Option<PathBuf>,
    },

    /// Show per-stage counts, errors and recent activity
    Status,

    /// List job ledger rows
    Jobs {
        /// Only jobs for this item
        #[arg(long)]
        item: Option<i64>,

        /// Maximum number of jobs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,

    /// Run the pipeline on an interval and send the digest daily
    Daemon,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let settings = Settings::load()?;

        match self.command {
            Commands::Run => run_pipeline(&open_orchestrator(settings)?).await,
            Commands::Stage { stage } => run_stage(&open_orchestrator(settings)?, stage).await,
            Commands::Digest { dry_run, html } => {
                let orchestrator = open_orchestrator(settings)?;
                if dry_run {
                    preview_digest(&orchestrator, html)
                } else {
                    send_digest(&orchestrator).await
                }
            }
            Commands::Status => show_status(&open_orchestrator(settings)?),
            Commands::Jobs { item, limit } => {
                list_jobs(&open_orchestrator(settings)?, item, limit)
            }
            Commands::Config => show_config(&settings),
            Commands::Daemon => run_daemon(&open_orchestrator(settings)?).await,
        }
    }
}

fn open_orchestrator(settings: Settings) -> Result<Orchestrator> {
    let db = Database::open(&settings.database_path).with_context(|| {
        format!(
            "Failed to open database: {}",
            settings.database_path.display()
        )
    })?;
    Orchestrator::from_settings(settings, db)
}

/// Run the full pipeline once
async fn run_pipeline(orchestrator: &Orchestrator) -> Result<()> {
    let report = orchestrator.run_pipeline().await?;

    println!("Run {}", report.run_id);
    println!("New episodes: {}", report.new_items);
    println!();
    println!(
        "{:<15} {:>10} {:>10} {:>10}",
        "STAGE", "ATTEMPTED", "SUCCEEDED", "FAILED"
    );
    println!("{}", "-".repeat(48));
    for stage in &report.stages {
        println!(
            "{:<15} {:>10} {:>10} {:>10}",
            stage.stage, stage.attempted, stage.succeeded, stage.failed
        );
    }

    Ok(())
}

/// Run one stage
async fn run_stage(orchestrator: &Orchestrator, stage: StageKind) -> Result<()> {
    let summary = orchestrator.run_stage(stage).await?;
    println!(
        "{}: attempted {}, succeeded {}, failed {}",
        summary.stage, summary.attempted, summary.succeeded, summary.failed
    );
    Ok(())
}

/// Print the digest for now without sending it
fn preview_digest(orchestrator: &Orchestrator, html_out: Option<PathBuf>) -> Result<()> {
    let Some(payload) = orchestrator.preview_digest(Utc::now())? else {
        println!("No summarized episodes in the digest window");
        return Ok(());
    };

    println!("Subject: {}", payload.subject);
    println!();
    println!("{}", payload.body);

    if let Some(path) = html_out {
        let html = payload
            .html
            .context("The configured renderer produced no HTML")?;
        std::fs::write(&path, html)
            .with_context(|| format!("Failed to write HTML preview: {}", path.display()))?;
        println!();
        println!("HTML preview saved to {}", path.display());
    }

    Ok(())
}

/// Send the digest for now
async fn send_digest(orchestrator: &Orchestrator) -> Result<()> {
    let now = Utc::now();

    match orchestrator.send_digest(now).await? {
        DigestReport::NoContent { window_start, .. } => {
            println!(
                "No summarized episodes since {}; nothing sent",
                window_start.format("%Y-%m-%d %H:%M UTC")
            );
        }
        DigestReport::Sent {
            batch_id,
            items,
            deliveries,
            delivered,
        } => {
            println!("Digest batch {} ({} episodes)", batch_id, items);
            if deliveries.is_empty() {
                println!("  No delivery channel configured");
            }
            for delivery in &deliveries {
                let state = if delivery.sent { "sent" } else { "not sent" };
                println!(
                    "  {:<10} {:<9} delivered {}, failed {}",
                    delivery.channel, state, delivery.delivered, delivery.failed
                );
                if let Some(error) = &delivery.error {
                    println!("             {}", error);
                }
            }
            if !delivered {
                eprintln!("\n[Digest was not delivered to any recipient]");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Show registry and ledger state
fn show_status(orchestrator: &Orchestrator) -> Result<()> {
    let status = orchestrator.status()?;
    let stats = &status.stats;

    println!("Episodes: {}", stats.total);
    println!();
    println!("{:<15} {:>10} {:>10}", "STAGE", "DONE", "PENDING");
    println!("{}", "-".repeat(37));
    println!(
        "{:<15} {:>10} {:>10}",
        "download", stats.downloaded, stats.pending_download
    );
    println!(
        "{:<15} {:>10} {:>10}",
        "transcription", stats.transcribed, stats.pending_transcription
    );
    println!(
        "{:<15} {:>10} {:>10}",
        "summarization", stats.summarized, stats.pending_summarization
    );
    println!();

    if !status.jobs.is_empty() {
        println!("Jobs:");
        for (state, count) in &status.jobs {
            println!("  {}: {}", state, count);
        }
        println!();
    }

    if !status.errored.is_empty() {
        println!("Errored ({}):", stats.errored);
        for item in &status.errored {
            println!(
                "  [{}] {} (retries: {})",
                item.id,
                truncate(&item.title, 50),
                item.retry_count
            );
            if let Some(error) = &item.last_error {
                println!("       {}", truncate(error, 70));
            }
        }
        println!();
    }

    if !status.recent.is_empty() {
        println!("Recent episodes:");
        for item in &status.recent {
            let state = if item.summarized {
                "summarized"
            } else if item.transcribed {
                "transcribed"
            } else if item.downloaded {
                "downloaded"
            } else {
                "new"
            };
            println!(
                "  [{}] {:<12} {} - {}",
                item.id,
                state,
                truncate(&item.podcast, 20),
                truncate(&item.title, 40)
            );
        }
        println!();
    }

    match &status.last_digest {
        Some(batch) => println!(
            "Last digest: {} ({} episodes, {})",
            batch.digest_date.format("%Y-%m-%d %H:%M UTC"),
            batch.item_count,
            if batch.any_sent() { "sent" } else { "not sent" }
        ),
        None => println!("Last digest: never"),
    }

    Ok(())
}

/// List job ledger rows
fn list_jobs(orchestrator: &Orchestrator, item: Option<i64>, limit: usize) -> Result<()> {
    let jobs = orchestrator.jobs(item, limit)?;

    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    println!(
        "{:<6} {:<15} {:<6} {:<11} {:<20} {}",
        "JOB", "STAGE", "ITEM", "STATUS", "STARTED", "DETAIL"
    );
    println!("{}", "-".repeat(90));

    for job in jobs {
        let started = job
            .started_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let detail = match (&job.error_kind, &job.error_message, &job.result) {
            (Some(kind), Some(message), _) => format!("{}: {}", kind.as_str(), message),
            (_, _, Some(result)) => result.clone(),
            _ => String::new(),
        };
        println!(
            "{:<6} {:<15} {:<6} {:<11} {:<20} {}",
            job.id,
            job.stage,
            job.item_id,
            job.status,
            started,
            truncate(&detail, 40)
        );
    }

    Ok(())
}

/// Show resolved configuration with secrets masked
fn show_config(settings: &Settings) -> Result<()> {
    println!("podcast-agent configuration");
    println!();
    println!(
        "Config file: {}",
        settings
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:        {}", settings.home.display());
    println!("  Database:    {}", settings.database_path.display());
    println!("  Audio:       {}", settings.audio_dir.display());
    println!("  Transcripts: {}", settings.transcript_dir.display());
    println!("  Summaries:   {}", settings.summary_dir.display());
    println!(
        "  Template:    {}",
        settings
            .digest_template
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(built-in)".to_string())
    );
    println!();
    println!("Feeds ({}):", settings.feeds.len());
    for feed in &settings.feeds {
        println!("  {}: {}", feed.name, feed.url);
    }
    println!();
    println!("Stages:");
    for stage in StageKind::ALL {
        let pool = settings.stage(stage);
        println!(
            "  {:<15} concurrency {}, batch limit {}",
            stage,
            pool.concurrency,
            pool.batch_limit
                .map(|l| l.to_string())
                .unwrap_or_else(|| "none".to_string())
        );
    }
    println!();
    println!("Whisper: {} (model {})", settings.whisper.binary, settings.whisper.model);
    println!("Ollama:  {} (model {})", settings.llm.base_url, settings.llm.model);
    println!();
    println!(
        "Digest: window {}h, send at {} UTC, feeds checked every {}h",
        settings.digest.window_hours,
        settings.digest.send_time,
        settings.digest.feed_check_interval_hours
    );
    println!();
    let email = &settings.channels.email;
    println!(
        "Email:    {} ({}:{}, user {}, password {}, {} recipients)",
        enabled(email.enabled),
        email.smtp_server.as_deref().unwrap_or("no server"),
        email.smtp_port,
        email.username.as_deref().unwrap_or("none"),
        mask(email.password.as_deref()),
        email.recipients.len()
    );
    let telegram = &settings.channels.telegram;
    println!(
        "Telegram: {} (token {}, {} chats)",
        enabled(telegram.enabled),
        mask(telegram.bot_token.as_deref()),
        telegram.chat_ids.len()
    );
    let webhook = &settings.channels.webhook;
    println!(
        "Webhook:  {} ({}, token {}, {} recipients)",
        enabled(webhook.enabled),
        webhook.endpoint.as_deref().unwrap_or("no endpoint"),
        mask(webhook.token.as_deref()),
        webhook.recipients.len()
    );

    Ok(())
}

/// Run the pipeline every `feed_check_interval_hours` and the digest daily
async fn run_daemon(orchestrator: &Orchestrator) -> Result<()> {
    let digest = &orchestrator.settings().digest;
    let send_time = digest.send_time()?;
    let period = Duration::from_secs(u64::from(digest.feed_check_interval_hours) * 3600);

    info!(
        interval_hours = digest.feed_check_interval_hours,
        send_time = %digest.send_time,
        "Starting scheduler"
    );

    let mut pipeline_tick = tokio::time::interval(period);
    pipeline_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let next_digest = next_digest_at(Utc::now(), send_time);
        let until_digest = (next_digest - Utc::now()).to_std().unwrap_or_default();
        info!(next_digest = %next_digest, "Waiting");

        tokio::select! {
            _ = pipeline_tick.tick() => {
                if let Err(e) = orchestrator.run_pipeline().await {
                    error!(error = %format!("{:#}", e), "Pipeline run failed");
                }
            }
            _ = tokio::time::sleep(until_digest) => {
                if let Err(e) = orchestrator.send_digest(Utc::now()).await {
                    error!(error = %format!("{:#}", e), "Digest run failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}

fn mask(secret: Option<&str>) -> String {
    match secret {
        Some(s) if s.chars().count() > 8 => {
            let chars: Vec<char> = s.chars().collect();
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{}...{}", head, tail)
        }
        Some(_) => "****".to_string(),
        None => "not set".to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
