use std::sync::Arc;

use clap::Parser;
use tokio::signal;

use accordlink::config::{parse_shard_range, Config};
use accordlink::gateway::{intents, ConnectionSupervisor, GatewayEvent, WsConnector};
use accordlink::rest::{GatewayBotInfo, ReqwestTransport, RequestExecutor, RestDiagnostic};

/// Connect a range of gateway shards and log what they receive.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Shards to run, as `first..=last` (overrides ACCORD_SHARDS).
    #[arg(long)]
    shards: Option<String>,
    /// Total shard count (overrides ACCORD_SHARD_COUNT).
    #[arg(long)]
    shard_count: Option<u32>,
    /// Gateway endpoint (overrides ACCORD_GATEWAY_URL).
    #[arg(long)]
    gateway_url: Option<String>,
    /// Comma separated intents (overrides ACCORD_INTENTS).
    #[arg(long)]
    intents: Option<String>,
    /// `auto`, `immediate` or `never` (overrides ACCORD_RECONNECT).
    #[arg(long)]
    reconnect: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "accordlink=debug".into()),
        )
        .init();

    let args = Args::parse();
    let config = match load_config(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("  \x1b[31merror\x1b[0m [{}] {e}", e.code());
            std::process::exit(2);
        }
    };

    let transport = ReqwestTransport::new(&config.api_url).with_auth_token(&config.token);
    let (rest, mut diagnostics) = RequestExecutor::with_diagnostics(transport, config.rest_config());
    tokio::spawn(async move {
        while let Some(event) = diagnostics.recv().await {
            match event {
                RestDiagnostic::RateLimited {
                    bucket,
                    retry_after,
                    global,
                } => tracing::debug!(%bucket, global, ?retry_after, "rest rate limited"),
                RestDiagnostic::Retrying {
                    bucket,
                    attempt,
                    reason,
                } => tracing::debug!(%bucket, attempt, %reason, "rest retry"),
            }
        }
    });

    let discovered = if config.gateway_url.is_none()
        || config.shard_count.is_none()
        || config.max_concurrency.is_none()
    {
        match rest.gateway_bot().await {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::error!("gateway discovery failed: {e}");
                if config.gateway_url.is_none() {
                    std::process::exit(1);
                }
                None
            }
        }
    } else {
        None
    };

    let url = config
        .gateway_url
        .clone()
        .or_else(|| discovered.as_ref().map(|d| d.url.clone()))
        .unwrap_or_default();
    let shard_count = config
        .shard_count
        .or_else(|| discovered.as_ref().map(|d| d.shards))
        .unwrap_or(1);
    let max_concurrency = config
        .max_concurrency
        .or_else(|| {
            discovered
                .as_ref()
                .map(|d| d.session_start_limit.max_concurrency)
        })
        .unwrap_or(1);

    let range = config.shard_range(shard_count);
    print_banner(&config, &url, shard_count, &range, discovered.as_ref());

    let gateway = config.gateway_config(&url, shard_count, max_concurrency);
    let (mut supervisor, mut events) = ConnectionSupervisor::new(gateway, Arc::new(WsConnector));
    supervisor.spawn_range(range);

    tokio::select! {
        _ = log_events(&mut events) => {
            tracing::warn!("gateway event stream ended");
        }
        _ = shutdown_signal() => {
            tracing::info!("shutting down");
        }
    }

    supervisor.shutdown().await;
}

fn load_config(args: Args) -> Result<Config, accordlink::error::ConfigError> {
    use accordlink::error::ConfigError;

    let mut config = Config::from_env()?;
    if let Some(shards) = args.shards {
        config.shards = Some(parse_shard_range(&shards).ok_or(ConfigError::Invalid {
            var: "--shards",
            value: shards,
        })?);
    }
    if let Some(count) = args.shard_count {
        config.shard_count = Some(count);
    }
    if let Some(url) = args.gateway_url {
        config.gateway_url = Some(url);
    }
    if let Some(list) = args.intents {
        config.intents = intents::parse(&list).map_err(|name| ConfigError::Invalid {
            var: "--intents",
            value: name,
        })?;
    }
    if let Some(policy) = args.reconnect {
        config.reconnect = policy.parse().map_err(|_| ConfigError::Invalid {
            var: "--reconnect",
            value: policy,
        })?;
    }
    Ok(config)
}

fn print_banner(
    config: &Config,
    url: &str,
    shard_count: u32,
    range: &std::ops::RangeInclusive<u32>,
    discovered: Option<&GatewayBotInfo>,
) {
    let version = env!("CARGO_PKG_VERSION");
    let sha = env!("GIT_SHA");

    eprintln!();
    eprintln!("  \x1b[1;36maccordlink\x1b[0m \x1b[2mv{version} ({sha})\x1b[0m");
    eprintln!();
    eprintln!("  \x1b[2mapi\x1b[0m          {}", config.api_url);
    eprintln!("  \x1b[2mgateway\x1b[0m      {url}");
    eprintln!(
        "  \x1b[2mshards\x1b[0m       {}..={} of {shard_count}",
        range.start(),
        range.end()
    );
    eprintln!(
        "  \x1b[2mintents\x1b[0m      {}",
        intents::names(config.intents).join(",")
    );
    if let Some(info) = discovered {
        let limit = &info.session_start_limit;
        eprintln!(
            "  \x1b[2msessions\x1b[0m     {}/{} left, concurrency {}",
            limit.remaining, limit.total, limit.max_concurrency
        );
    }
    eprintln!();
}

async fn log_events(events: &mut tokio::sync::mpsc::UnboundedReceiver<GatewayEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            GatewayEvent::Dispatch {
                shard_id,
                event,
                sequence,
                ..
            } => tracing::debug!(shard_id, sequence, "dispatch {event}"),
            GatewayEvent::Connected { shard_id } => tracing::info!(shard_id, "connected"),
            GatewayEvent::Ready {
                shard_id,
                session_id,
            } => tracing::info!(shard_id, %session_id, "ready"),
            GatewayEvent::Resumed { shard_id } => tracing::info!(shard_id, "resumed"),
            GatewayEvent::Disconnected { shard_id, reason } => {
                tracing::warn!(shard_id, ?reason, "disconnected")
            }
            GatewayEvent::Reconnecting {
                shard_id,
                delay,
                attempt,
            } => tracing::info!(shard_id, attempt, ?delay, "reconnecting"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
