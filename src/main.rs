use anyhow::{bail, Context, Result};
use clap::Parser;
use feedwatch::{
    AlertRecord, AlertSink, EventFilter, FeedConfig, FeedwatchConfig, MediaSource, MockSource,
    SessionRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(name = "feedwatch")]
#[command(about = "Watchdog for live video feeds: connection, freeze and picture quality")]
#[command(version)]
#[command(long_about = "Keeps every configured video feed connected, reconnecting with a flat \
delay when the network drops it, and analyses each frame for frozen or stalled pictures and \
visible degradation such as pixelation, blur and low contrast.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "feedwatch.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    #[arg(long, help = "Validate configuration file and exit without starting any feed")]
    validate_config: bool,

    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    #[arg(long, help = "Build all sessions but don't start them")]
    dry_run: bool,

    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Also write logs to daily rotated files in this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[arg(long, help = "Feed every camera from a moving synthetic test pattern")]
    synthetic: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    let _log_guard = init_logging(&args)?;

    info!("Starting feedwatch v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let mut config = FeedwatchConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        eprintln!("✗ Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    if args.validate_config {
        println!("✓ Configuration is valid ({} feeds)", config.feeds.len());
        return Ok(());
    }

    if config.feeds.is_empty() {
        if args.synthetic {
            config.feeds.push(FeedConfig {
                id: 1,
                name: "Synthetic".to_string(),
                url: "synthetic://1".to_string(),
            });
        } else {
            bail!("No feeds configured; add [[feeds]] entries to {}", args.config);
        }
    }

    let source = build_source(&args, &config)?;
    let alert_sink: Arc<dyn AlertSink> = Arc::new(|feed_id: u32, alert: &AlertRecord| {
        match serde_json::to_string(alert) {
            Ok(json) => info!(target: "feedwatch::alerts", feed_id, "{}", json),
            Err(e) => warn!("Failed to serialize alert for camera {}: {}", feed_id, e),
        }
    });

    let registry = Arc::new(SessionRegistry::from_config(
        &config,
        source,
        Some(alert_sink),
        None,
    )?);

    if args.dry_run {
        info!("Dry run mode - sessions built but not started");
        println!("✓ Dry run completed - {} sessions ready", registry.len());
        return Ok(());
    }

    // alerts already reach the log through the alert sink
    let mut events = registry.subscribe_filtered(
        EventFilter::EventTypes(vec!["state_changed", "connection_error"]),
        "event-log",
    );
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => info!(target: "feedwatch::events", feed_id = event.feed_id(), "{}", json),
                Err(e) => warn!("Failed to serialize event: {}", e),
            }
        }
    });

    registry.start_all().await;

    let status_task = {
        let registry = Arc::clone(&registry);
        let every = Duration::from_secs(config.system.status_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for status in registry.statuses() {
                    match serde_json::to_string(&status) {
                        Ok(json) => info!(target: "feedwatch::status", "{}", json),
                        Err(e) => warn!("Failed to serialize status: {}", e),
                    }
                }
            }
        })
    };

    let reason = wait_for_shutdown().await?;
    info!("Shutdown initiated: {}", reason);

    status_task.abort();
    registry.stop_all().await;
    event_task.abort();

    info!("Feedwatch shutdown complete");
    Ok(())
}

fn build_source(args: &Args, config: &FeedwatchConfig) -> Result<Arc<dyn MediaSource>> {
    if args.synthetic {
        info!("Using synthetic test pattern for all feeds");
        return Ok(Arc::new(MockSource::test_pattern(320, 240)));
    }

    #[cfg(all(target_os = "linux", feature = "gstreamer"))]
    {
        let source = feedwatch::GstMediaSource::new(config.connection.read_timeout())?;
        Ok(Arc::new(source))
    }

    #[cfg(not(all(target_os = "linux", feature = "gstreamer")))]
    {
        let _ = config;
        bail!("Built without the gstreamer feature; rebuild with --features gstreamer or run with --synthetic")
    }
}

/// Resolve on SIGINT or, on Unix, SIGTERM
async fn wait_for_shutdown() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                Ok("SIGINT")
            }
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        Ok("SIGINT")
    }
}

fn init_logging(args: &Args) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("feedwatch={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer().with_target(true).boxed()
        }
    };

    let (file_layer, guard) = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "feedwatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(file_layer)
        .with(env_filter)
        .init();

    Ok(guard)
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# Feedwatch Configuration File");
    println!("# Default configuration with all available options");
    println!("#");
    println!("# Feeds are listed as:");
    println!("# [[feeds]]");
    println!("# id = 1");
    println!("# name = \"Lobby\"");
    println!("# url = \"rtsp://camera.local/stream\"");
    println!();

    let text = toml::to_string_pretty(&FeedwatchConfig::default())
        .context("Failed to serialize default configuration")?;
    println!("{}", text);
    Ok(())
}
