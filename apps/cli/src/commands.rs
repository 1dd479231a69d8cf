//! CLI command definitions, routing, and tracing setup.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use tokio::sync::broadcast;
use tracing::info;

use reconpipe_browser::StaticEngine;
use reconpipe_core::pipeline::{Pipeline, PipelineConfig};
use reconpipe_events::PipelineEvent;
use reconpipe_queue::Stage;
use reconpipe_shared::{AppConfig, PretextStatus, init_config, load_config};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// ReconPipe — enumerate, mine, and profile the contacts of a domain.
#[derive(Parser)]
#[command(
    name = "reconpipe",
    version,
    about = "Multi-stage contact reconnaissance: domains, DNS posture, sources, profiles, pretexts.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Discover domains related to a primary domain and queue DNS lookups.
    Discover {
        /// Primary domain, e.g. acme.com.
        domain: String,
    },

    /// Run a full recon pass for a domain: contacts, sources, and all stages.
    Recon {
        /// Domain to enumerate contacts for.
        domain: String,
    },

    /// Drain any jobs left queued from earlier runs.
    Run,

    /// Show stored domains, targets, and queue depth.
    Status {
        /// Limit the target listing to one domain.
        #[arg(long)]
        domain: Option<String>,
    },

    /// Synthesize a profile for an enriched target.
    Profile {
        /// Target email address.
        email: String,
    },

    /// Draft a pretext for a profiled target.
    Pretext {
        /// Target email address.
        email: String,

        /// Prompt name to draft with.
        #[arg(long, default_value = "it-notification")]
        prompt: String,
    },

    /// Review pretext drafts.
    Review {
        /// Review subcommand.
        #[command(subcommand)]
        action: ReviewAction,
    },

    /// Reset a terminal source and queue it for scraping again.
    Rescrape {
        /// Source URL to re-run.
        url: String,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Pretext review subcommands.
#[derive(Subcommand)]
pub(crate) enum ReviewAction {
    /// List pretext drafts for a target.
    List {
        /// Target email address.
        email: String,
    },
    /// Approve a draft.
    Approve {
        /// Pretext id (from `review list`).
        id: i64,
    },
    /// Reject a draft.
    Reject {
        /// Pretext id (from `review list`).
        id: i64,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "reconpipe=info",
        1 => "reconpipe=debug",
        _ => "reconpipe=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Discover { domain } => cmd_discover(&domain).await,
        Command::Recon { domain } => cmd_recon(&domain).await,
        Command::Run => cmd_run().await,
        Command::Status { domain } => cmd_status(domain.as_deref()).await,
        Command::Profile { email } => cmd_profile(&email).await,
        Command::Pretext { email, prompt } => cmd_pretext(&email, &prompt).await,
        Command::Review { action } => match action {
            ReviewAction::List { email } => cmd_review_list(&email).await,
            ReviewAction::Approve { id } => cmd_review_set(id, PretextStatus::Approved).await,
            ReviewAction::Reject { id } => cmd_review_set(id, PretextStatus::Rejected).await,
        },
        Command::Rescrape { url } => cmd_rescrape(&url).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Pipeline helpers
// ---------------------------------------------------------------------------

/// Load config, resolve API keys, and assemble the pipeline.
async fn build_pipeline() -> Result<Pipeline> {
    let config = load_config()?;
    let runtime = PipelineConfig::from_app(&config)?;
    let engine = Arc::new(StaticEngine::new()?);
    Ok(Pipeline::build(runtime, engine).await?)
}

/// Spawn the stage workers, wait for every queue to empty, then stop them.
/// Progress events are echoed to stdout while the pipeline runs.
async fn run_until_idle(pipeline: &Pipeline) -> Result<()> {
    let (shutdown_tx, _) = broadcast::channel(1);
    let workers = pipeline.spawn_workers(&shutdown_tx);

    let mut rx = pipeline.events().subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Ctrl-C stops the workers early; anything still queued is redelivered
    // on the next run.
    tokio::select! {
        result = pipeline.drain() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }
    let _ = shutdown_tx.send(());
    workers.join().await?;
    printer.abort();
    pipeline.shutdown().await;
    Ok(())
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::SourceUpdate {
            source_id,
            status,
            message,
        } => match message {
            Some(msg) => println!("  source {source_id}: {status} ({msg})"),
            None => println!("  source {source_id}: {status}"),
        },
        PipelineEvent::SourceMined {
            source_id,
            target_email,
            ..
        } => println!("  source {source_id} mined for {target_email}"),
        PipelineEvent::SourceFailed {
            source_id,
            target_email,
            ..
        } => println!("  source {source_id} failed for {target_email}"),
        PipelineEvent::TargetStatusUpdated { email, status, .. } => {
            println!("  target {email}: {status}")
        }
        PipelineEvent::DomainUpdated { domain } => println!("  domain {domain} updated"),
        PipelineEvent::RelatedDomainsFound {
            primary_domain,
            related_domains,
        } => println!(
            "  {} related domain(s) for {primary_domain}",
            related_domains.len()
        ),
        PipelineEvent::ReconUpdate { message } => println!("  {message}"),
        PipelineEvent::ReconComplete {
            domain,
            targets_count,
        } => println!("  recon of {domain} queued {targets_count} target(s)"),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_discover(domain: &str) -> Result<()> {
    let pipeline = build_pipeline().await?;

    info!(domain, "discovering related domains");
    let outcome = pipeline.coordinator().discover_domains(domain).await?;
    run_until_idle(&pipeline).await?;

    println!();
    println!("  Primary: {}", outcome.primary_domain);
    if outcome.related_domains.is_empty() {
        println!("  No related domains found.");
    } else {
        for related in &outcome.related_domains {
            println!("  Related: {related}");
        }
    }
    println!();
    Ok(())
}

async fn cmd_recon(domain: &str) -> Result<()> {
    let pipeline = build_pipeline().await?;

    info!(domain, "starting recon run");
    let summary = pipeline.coordinator().run_recon(domain).await?;
    run_until_idle(&pipeline).await?;

    println!();
    println!("  Recon complete for {}", summary.domain);
    println!("  Targets: {}", summary.targets_count);
    println!("  Sources queued: {}", summary.sources_enqueued);
    println!();
    Ok(())
}

async fn cmd_run() -> Result<()> {
    let pipeline = build_pipeline().await?;

    let mut outstanding = 0;
    for stage in Stage::ALL {
        outstanding += pipeline.queue().live_count(stage).await?;
    }
    if outstanding == 0 {
        println!("Nothing queued.");
        return Ok(());
    }

    info!(outstanding, "draining queued jobs");
    run_until_idle(&pipeline).await?;
    println!("Drained {outstanding} job(s).");
    Ok(())
}

async fn cmd_status(domain: Option<&str>) -> Result<()> {
    let pipeline = build_pipeline().await?;
    let storage = pipeline.storage();

    let domains = storage.list_domains().await?;
    if domains.is_empty() {
        println!("No domains stored. Run `reconpipe recon <domain>` first.");
        return Ok(());
    }

    println!();
    for d in &domains {
        if domain.is_some_and(|want| want != d.name) {
            continue;
        }
        println!("  {}", d.name);
        println!("    mx:     {}", d.mx.as_deref().unwrap_or("-"));
        println!("    spf:    {}", if d.spf.is_some() { "yes" } else { "no" });
        println!(
            "    dmarc:  {}",
            if d.dmarc.is_some() { "yes" } else { "no" }
        );
        println!("    format: {}", d.email_format.as_deref().unwrap_or("-"));

        for target in storage.list_targets_by_domain(&d.name).await? {
            let name = target.name.as_deref().unwrap_or("?");
            let profiled = if target.profile.is_some() {
                ", profiled"
            } else {
                ""
            };
            println!(
                "    target {} ({name}) — {}{profiled}",
                target.email, target.status
            );
        }
    }

    println!();
    for stage in Stage::ALL {
        let live = pipeline.queue().live_count(stage).await?;
        let failed = storage.count_jobs(stage.as_str(), "failed").await?;
        println!("  {stage}: {live} live, {failed} failed");
    }
    println!();
    Ok(())
}

async fn cmd_profile(email: &str) -> Result<()> {
    let pipeline = build_pipeline().await?;

    pipeline.coordinator().enqueue_profile(email).await?;
    run_until_idle(&pipeline).await?;

    let target = pipeline
        .storage()
        .get_target(email)
        .await?
        .ok_or_else(|| eyre!("target '{email}' not found"))?;
    match target.profile {
        Some(profile) => {
            println!();
            println!("{profile}");
            println!();
        }
        None => println!("Profile stage did not produce a profile; check the logs."),
    }
    Ok(())
}

async fn cmd_pretext(email: &str, prompt: &str) -> Result<()> {
    let pipeline = build_pipeline().await?;

    pipeline.coordinator().enqueue_pretext(email, prompt).await?;
    run_until_idle(&pipeline).await?;

    let pretexts = pipeline.storage().list_pretexts_for_target(email).await?;
    match pretexts.last() {
        Some(p) => {
            println!();
            println!("  Draft #{} [{}]", p.id, p.status);
            println!("  Subject: {}", p.subject);
            if let Some(link) = &p.link {
                println!("  Link:    {link}");
            }
            println!();
            println!("{}", p.body);
            println!();
        }
        None => println!("Pretext stage did not produce a draft; check the logs."),
    }
    Ok(())
}

async fn cmd_review_list(email: &str) -> Result<()> {
    let pipeline = build_pipeline().await?;

    let pretexts = pipeline.storage().list_pretexts_for_target(email).await?;
    if pretexts.is_empty() {
        println!("No pretexts for {email}.");
        return Ok(());
    }

    println!();
    for p in &pretexts {
        println!("  #{} [{}] {}", p.id, p.status, p.subject);
    }
    println!();
    Ok(())
}

async fn cmd_review_set(id: i64, next: PretextStatus) -> Result<()> {
    let pipeline = build_pipeline().await?;

    if pipeline.storage().set_pretext_status(id, next).await? {
        println!("Pretext #{id} is now {next}.");
        Ok(())
    } else {
        Err(eyre!("pretext #{id} not found or not in draft"))
    }
}

async fn cmd_rescrape(url: &str) -> Result<()> {
    let pipeline = build_pipeline().await?;

    pipeline.coordinator().rescrape_source(url).await?;
    run_until_idle(&pipeline).await?;
    println!("Rescrape of {url} finished.");
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
