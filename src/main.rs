use anyhow::{Context, bail};
use bifrost_tunnel::config::{
    Config, LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig, TunnelTriple,
};
use bifrost_tunnel::engine::Engine;
use bifrost_tunnel::logging::{self, CustomLogger};
use clap::{ArgAction, Parser};
use log::{error, info};
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[clap(
    version,
    about = "Forward local TCP ports to remote hosts through an HTTP CONNECT proxy"
)]
struct Args {
    #[clap(short = 'L', long = "tunnel", value_name = "PORT:HOST:HOSTPORT", help = "Forward local PORT to HOST:HOSTPORT (can be used multiple times)")]
    tunnels: Vec<TunnelTriple>,

    #[clap(short, long, value_name = "HOST[:PORT]", env = "BIFROST_PROXY", help = "HTTP proxy to tunnel through (default port 8080)")]
    proxy: Option<String>,

    #[clap(short = 'P', long, value_name = "USER:PASS", env = "BIFROST_PROXY_AUTH", hide_env_values = true, help = "Basic credentials for the proxy")]
    proxy_auth: Option<String>,

    #[clap(long, help = "Only accept connections from the loopback interface")]
    local_only: bool,

    #[clap(short = 'U', long, value_name = "STRING", help = "User-Agent header sent to the proxy")]
    user_agent: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Timeout for connecting to the proxy")]
    connect_timeout: Option<u64>,

    #[clap(long, value_name = "SECONDS", help = "Timeout for the proxy's CONNECT response")]
    handshake_timeout: Option<u64>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path (JSON)")]
    config: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Log session counters at this interval (debug level)")]
    stats_interval: Option<u64>,

    #[clap(short, long, action = ArgAction::Count, help = "Increase verbosity (-v info, -vv debug, -vvv trace)")]
    verbose: u8,

    #[clap(short, long, help = "Only log errors")]
    quiet: bool,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn or error (overrides -v/-q)")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("bifrost-tunnel: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    if let Some(config_file) = &args.generate_config {
        generate_sample_config(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let config = load_config(&args)?;
    init_logging(&args, &config)?;

    let registry = config.build_registry().context("invalid tunnel configuration")?;
    let mut options = config.engine_options();
    options.stats_interval = args.stats_interval.filter(|s| *s > 0).map(Duration::from_secs);

    let engine = Engine::new(registry, options);
    for spec in engine.specs() {
        info!("Tunnel {}", spec);
    }

    let running = engine.start().await.context("failed to start tunnels")?;
    running.run_until(shutdown_signal()).await;

    info!("All tunnels stopped");
    Ok(())
}

/// Config file first, then command-line values on top.
fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(config_file) => {
            if !Path::new(config_file).exists() {
                bail!("Configuration file not found: {}", config_file);
            }
            Config::from_file(config_file)
                .with_context(|| format!("failed to read {}", config_file))?
        }
        None => Config::default(),
    };

    config.tunnels.extend(args.tunnels.iter().cloned());
    if let Some(proxy) = &args.proxy {
        config.proxy = Some(proxy.clone());
    }
    if config.proxy.is_none() {
        config.proxy = ["HTTP_PROXY", "http_proxy"]
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()));
    }
    if let Some(auth) = &args.proxy_auth {
        config.proxy_auth = Some(auth.clone());
    }
    if args.local_only {
        config.local_only = true;
    }
    if let Some(user_agent) = &args.user_agent {
        config.user_agent = Some(user_agent.clone());
    }
    if let Some(secs) = args.connect_timeout {
        config.connect_timeout_secs = Some(secs);
    }
    if let Some(secs) = args.handshake_timeout {
        config.handshake_timeout_secs = Some(secs);
    }

    Ok(config)
}

fn init_logging(args: &Args, config: &Config) -> anyhow::Result<()> {
    let cli_level = match args.log_level.as_deref() {
        Some(level) => Some(logging::parse_log_level(level).map_err(|e| anyhow::anyhow!("{}", e))?),
        None => (args.verbose > 0 || args.quiet).then(|| LogLevel::from_verbosity(args.verbose, args.quiet)),
    };
    let cli_format = args
        .log_format
        .as_deref()
        .map(logging::parse_log_format)
        .transpose()
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    let result = match &config.logging {
        Some(logging_config) => {
            let mut logging_config = logging_config.clone();
            if let Some(level) = cli_level {
                logging_config.level = Some(level);
            }
            if let Some(format) = cli_format {
                logging_config.format = Some(format);
            }
            CustomLogger::init(logging_config)
        }
        None => logging::init_fallback(
            &cli_level.unwrap_or_default(),
            cli_format.unwrap_or(LogFormat::Text),
        ),
    };

    result.map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))
}

fn generate_sample_config(file_path: &str) -> anyhow::Result<()> {
    let sample = Config {
        tunnels: vec![
            "2222:ssh.example.com:443".parse()?,
            "2223:git.example.com:22".parse()?,
        ],
        proxy: Some("proxy.example.com:8080".to_string()),
        proxy_auth: Some("user:password".to_string()),
        local_only: true,
        user_agent: None,
        connect_timeout_secs: Some(10),
        handshake_timeout_secs: Some(10),
        max_header_size: Some(16 * 1024),
        logging: Some(LoggingConfig {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Text),
            targets: Some(vec![
                LogTarget {
                    output_type: LogOutputType::Stderr,
                    path: None,
                    level: None,
                },
                LogTarget {
                    output_type: LogOutputType::File,
                    path: Some("bifrost-tunnel.log".into()),
                    level: Some(LogLevel::Debug),
                },
            ]),
        }),
    };

    sample
        .to_file(file_path)
        .with_context(|| format!("failed to write {}", file_path))?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
