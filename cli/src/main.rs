use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::*;
use log::{info, warn};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use jobintel_core::api::{self, AdminState};
use jobintel_core::http::HttpLinkProbe;
use jobintel_core::modules::search_api::SOURCE_NAME;
use jobintel_core::modules::{SearchApiConfig, SearchApiSource, StaticSource};
use jobintel_core::{
    BroadcastSink, ChannelQueue, ConsoleSink, FanoutSink, HttpClient, MemoryJobStore, Orchestrator,
    ResourceSampler, RetentionService, Scheduler, Settings, SinkRef, SourceDescriptor,
    SourcePriority, SourceRegistry, SystemProbe, ThrottleController, ThrottleLevel, WorkerPool,
};

const QUEUE_CAPACITY: usize = 64;
const UPDATE_BUFFER: usize = 64;

#[derive(Parser, Debug)]
#[command(
    name = "jobintel",
    version,
    about = "Resource-aware job-postings ingester",
    after_help = "\x1b[1;36mEXAMPLES:\x1b[0m
  Run everything:                 jobintel serve
  Custom admin address:           jobintel serve --bind 0.0.0.0:9000
  Check wiring only:              jobintel serve --dry-run
  Watch the throttle level:       jobintel sample -n 10 --interval-secs 2
  Show resolved settings:         jobintel config"
)]
pub struct Args {
    #[arg(short = 'v', long, global = true, default_value_t = false, help = "Debug-level logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the sampler, scheduler, worker pool and admin API
    Serve {
        #[arg(long, help = "Admin API address (overrides ADMIN_BIND)")]
        bind: Option<String>,

        #[arg(long, help = "Resolve settings and sources, then exit without serving")]
        dry_run: bool,
    },
    /// Sample host resources and print the level each sample maps to
    Sample {
        #[arg(short = 'n', long, default_value_t = 1, help = "Number of samples")]
        count: u32,

        #[arg(long, default_value_t = 1, help = "Seconds between samples")]
        interval_secs: u64,
    },
    /// Print the resolved settings as JSON
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    let args = Args::parse();
    init_logging(args.verbose);

    let settings = Settings::load().context("invalid configuration")?;

    match args.command {
        Command::Serve { bind, dry_run } => serve(settings, bind, dry_run).await,
        Command::Sample { count, interval_secs } => sample(&settings, count, interval_secs).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

fn print_banner() {
    let banner = r#"
       _       _     _       _       _
      (_) ___ | |__ (_)_ __ | |_ ___| |
      | |/ _ \| '_ \| | '_ \| __/ _ \ |
      | | (_) | |_) | | | | | ||  __/ |
     _/ |\___/|_.__/|_|_| |_|\__\___|_|
    |__/
    "#;
    print!("{}\r\n", banner.bright_cyan().bold());
    print!("{}\r\n", "──────────────────────────────────────────".dimmed());
    std::io::stdout().flush().ok();
}

fn paint(level: ThrottleLevel) -> ColoredString {
    match level {
        ThrottleLevel::Normal => level.name().green().bold(),
        ThrottleLevel::Light => level.name().yellow().bold(),
        ThrottleLevel::Heavy => level.name().bright_red().bold(),
        ThrottleLevel::Pause => level.name().red().bold().reversed(),
    }
}

/// Registers the search API when a key is configured, otherwise the
/// bundled demo feed so the pipeline still has something to run.
fn build_registry(settings: &Settings, client: &HttpClient) -> anyhow::Result<SourceRegistry> {
    let mut registry = SourceRegistry::new();
    if settings.tavily_api_key.is_some() {
        let queries = settings
            .search_queries()
            .with_context(|| format!("cannot read {:?}", settings.tavily_queries_file))?;
        let config = SearchApiConfig::from_settings(settings, queries);
        let source = SearchApiSource::new(client.clone(), config);
        registry.register(
            SourceDescriptor::new(SOURCE_NAME, 1, SourcePriority::High),
            Arc::new(source),
        )?;
    } else {
        warn!("TAVILY_API_KEY not set, registering the demo feed only");
        registry.register(
            SourceDescriptor::new("demo", 1, SourcePriority::Low),
            Arc::new(StaticSource::demo()),
        )?;
    }
    Ok(registry)
}

async fn serve(settings: Settings, bind: Option<String>, dry_run: bool) -> anyhow::Result<()> {
    let bind = bind.unwrap_or_else(|| settings.admin_bind.clone());
    let client = HttpClient::new(
        settings.http_timeout_secs,
        settings.http_proxy.as_deref(),
        &settings.http_header_list(),
    )
    .context("cannot build HTTP client")?;
    let registry = build_registry(&settings, &client)?;

    if dry_run {
        println!("[DRY RUN] Would serve admin API on {}", bind);
        for d in registry.list() {
            println!(
                "[DRY RUN] Source '{}' priority {:?} max concurrency {}",
                d.name, d.priority, d.max_concurrency
            );
        }
        println!(
            "[DRY RUN] Thresholds: disk >= {}% free, cpu <= {}%, memory <= {}%",
            settings.disk_min_free_percent, settings.cpu_max_percent, settings.memory_max_percent
        );
        return Ok(());
    }

    print_banner();

    let sampler = Arc::new(ResourceSampler::new(
        SystemProbe::new(&settings.disk_mount),
        settings.sample_timeout(),
    ));
    let initial = sampler.sample().await;
    let throttle = Arc::new(ThrottleController::new(settings.throttle_config(), initial));
    print!(
        "{} {}\r\n",
        "[*] Initial throttle level:".bright_cyan().bold(),
        paint(throttle.current_level())
    );
    std::io::stdout().flush().ok();

    let (queue, rx) = ChannelQueue::new(QUEUE_CAPACITY);
    let updates = BroadcastSink::new(UPDATE_BUFFER);
    let broadcast: SinkRef = Arc::new(updates.clone());
    let sink: SinkRef = Arc::new(FanoutSink::new(vec![ConsoleSink::new_ref(), broadcast]));
    let orchestrator = Arc::new(
        Orchestrator::new(throttle.clone(), Arc::new(registry), Arc::new(queue), sink)
            .with_retention_days(settings.retention_expired_days),
    );

    let store = Arc::new(MemoryJobStore::new());
    let retention = Arc::new(
        RetentionService::new(store.clone()).with_link_probe(Arc::new(HttpLinkProbe::new(client))),
    );
    let pool = WorkerPool::new(
        orchestrator.clone(),
        store,
        retention,
        settings.retention_policy()?,
        settings.worker_config(),
    );
    let workers = tokio::spawn(pool.run(rx));

    let sampling = throttle.start(sampler, settings.sample_interval());
    let scheduler = Arc::new(Scheduler::new(
        orchestrator.clone(),
        settings.scrape_interval(),
        settings.cleanup_interval(),
    ))
    .start();

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("cannot bind admin API to {}", bind))?;
    print!(
        "{}\r\n",
        format!("[+] Admin API listening on http://{}", bind).green().bold()
    );
    std::io::stdout().flush().ok();

    let state = AdminState {
        orchestrator,
        updates: updates.sender(),
    };
    api::serve(listener, state, async {
        tokio::signal::ctrl_c().await.ok();
    })
    .await
    .context("admin API failed")?;

    info!("Shutting down");
    scheduler.stop().await;
    sampling.stop().await;
    workers.abort();
    Ok(())
}

async fn sample(settings: &Settings, count: u32, interval_secs: u64) -> anyhow::Result<()> {
    let sampler = ResourceSampler::new(
        SystemProbe::new(&settings.disk_mount),
        settings.sample_timeout(),
    );
    let thresholds = settings.thresholds();

    for i in 0..count {
        if i > 0 {
            tokio::time::sleep(Duration::from_secs(interval_secs)).await;
        }
        let s = sampler.sample().await;
        let stale = if s.stale.is_empty() {
            String::new()
        } else {
            format!(" (stale: {:?})", s.stale).dimmed().to_string()
        };
        print!(
            "[*] cpu {:>5.1}%  memory {:>5.1}%  disk free {:>5.1}% ({:.1} GB)  -> {}{}\r\n",
            s.cpu_percent,
            s.memory_percent,
            s.disk_free_percent,
            s.disk_free_gb,
            paint(thresholds.classify(&s)),
            stale
        );
        std::io::stdout().flush().ok();
    }
    Ok(())
}
