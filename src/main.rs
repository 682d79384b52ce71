use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::{LimiterHandle, LimiterState, RateLimitResult};

/// Admission control over stdin.
///
/// Reads one command per line (`check <key> [unix_millis]`, `fail <key>`,
/// `success <key>`, `reset <key>`) and writes one JSON result per line.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

/// JSON line written for a `check` command.
#[derive(Debug, Serialize)]
struct CheckOutput<'a> {
    op: &'static str,
    key: &'a str,
    #[serde(flatten)]
    result: &'a RateLimitResult,
}

impl<'a> CheckOutput<'a> {
    fn new(key: &'a str, result: &'a RateLimitResult) -> Self {
        Self {
            op: "check",
            key,
            result,
        }
    }
}

/// One parsed input line.
#[derive(Debug, PartialEq)]
enum Request {
    Check {
        key: String,
        at: Option<DateTime<Utc>>,
    },
    Fail(String),
    Success(String),
    Reset(String),
}

impl Request {
    fn parse(line: &str) -> Result<Self, String> {
        let mut parts = line.split_whitespace();
        let op = parts.next().ok_or("empty command")?;
        let key = parts
            .next()
            .ok_or_else(|| format!("{} requires a key", op))?
            .to_string();

        let request = match op {
            "check" => {
                let at = match parts.next() {
                    Some(raw) => {
                        let millis: i64 = raw
                            .parse()
                            .map_err(|_| format!("invalid timestamp: {}", raw))?;
                        let instant = DateTime::from_timestamp_millis(millis)
                            .ok_or_else(|| format!("timestamp out of range: {}", raw))?;
                        Some(instant)
                    }
                    None => None,
                };
                Request::Check { key, at }
            }
            "fail" => Request::Fail(key),
            "success" => Request::Success(key),
            "reset" => Request::Reset(key),
            other => return Err(format!("unknown command: {}", other)),
        };

        if let Some(extra) = parts.next() {
            return Err(format!("unexpected argument: {}", extra));
        }
        Ok(request)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TurnstileConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => TurnstileConfig::default(),
    };

    init_tracing(&cli, &config);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let limiter_config = config.limiter.compile()?;
    let state = LimiterState::<String>::new(limiter_config)?;
    info!(windows = ?state.windows(), "Rate limiter initialized");

    let handle = LimiterHandle::spawn(state);

    tokio::select! {
        result = serve(&handle) => result?,
        _ = shutdown_signal() => {}
    }

    handle.shutdown().await.ok();
    info!("Turnstile stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

fn init_tracing(cli: &Cli, config: &TurnstileConfig) {
    let default_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if cli.json_logs || config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Process stdin until EOF.
async fn serve(handle: &LimiterHandle<String>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let output = match Request::parse(line) {
            Ok(request) => {
                debug!(request = ?request, "Handling request");
                execute(handle, request).await?
            }
            Err(message) => {
                warn!(line = %line, error = %message, "Rejected input line");
                json!({ "error": message })
            }
        };

        let mut encoded = serde_json::to_vec(&output)?;
        encoded.push(b'\n');
        stdout.write_all(&encoded).await?;
        stdout.flush().await?;
    }

    info!("Input closed");
    Ok(())
}

async fn execute(handle: &LimiterHandle<String>, request: Request) -> anyhow::Result<Value> {
    let output = match request {
        Request::Check { key, at } => {
            let result = match at {
                Some(at) => handle.check_limit(key.clone(), at).await?,
                None => handle.check_limit_now(key.clone()).await?,
            };
            serde_json::to_value(CheckOutput::new(&key, &result))?
        }
        Request::Fail(key) => {
            handle.record_failure(key.clone()).await?;
            json!({ "op": "fail", "key": key })
        }
        Request::Success(key) => {
            handle.record_success(key.clone()).await?;
            json!({ "op": "success", "key": key })
        }
        Request::Reset(key) => {
            handle.reset(key.clone()).await?;
            json!({ "op": "reset", "key": key })
        }
    };
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Request::parse("check alice").unwrap(),
            Request::Check {
                key: "alice".to_string(),
                at: None
            }
        );
        assert_eq!(
            Request::parse("check 10.0.0.1 60000").unwrap(),
            Request::Check {
                key: "10.0.0.1".to_string(),
                at: DateTime::from_timestamp_millis(60_000),
            }
        );
        assert_eq!(Request::parse("fail bob").unwrap(), Request::Fail("bob".to_string()));
        assert_eq!(
            Request::parse("  success   bob ").unwrap(),
            Request::Success("bob".to_string())
        );
        assert_eq!(Request::parse("reset bob").unwrap(), Request::Reset("bob".to_string()));
    }

    #[test]
    fn test_check_output_flattens_result() {
        let result = RateLimitResult {
            is_allowed: false,
            current_attempts: 5,
            remaining_attempts: 0,
            next_allowed_attempt: DateTime::from_timestamp(120, 0),
            backoff_interval: Some(std::time::Duration::MAX),
        };

        let value = serde_json::to_value(CheckOutput::new("alice", &result)).unwrap();
        assert_eq!(value["op"], json!("check"));
        assert_eq!(value["key"], json!("alice"));
        assert_eq!(value["is_allowed"], json!(false));
        assert_eq!(value["current_attempts"], json!(5));
        assert_eq!(value["remaining_attempts"], json!(0));
        assert_eq!(value["backoff_ms"], json!(u64::MAX));
        assert!(value["next_allowed_attempt"].is_string());
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Request::parse("").is_err());
        assert!(Request::parse("check").is_err());
        assert!(Request::parse("block alice").is_err());
        assert!(Request::parse("check alice soon").is_err());
        assert!(Request::parse("reset alice now").is_err());
    }
}
