use std::{path::PathBuf, sync::Arc, time::Duration};

use bandwidth_broker::{
    request::CorrelatedRequest, Broker, BrokerConfig, BrokerError, FnObserver, Observer,
    ObserverContext, Payload, ReplyOutcome, RequestKey,
};
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Caller identity the reservation is made for
    #[arg(short, long, default_value = "127.0.0.1")]
    key: String,

    /// Reservation parameters as name=value (values parsed as JSON when possible)
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, serde_json::Value)>,

    /// How long the demo observer takes to approve, in milliseconds
    #[arg(long, default_value_t = 100)]
    reply_delay: u64,

    /// Demo observer never replies, so the request times out
    #[arg(long)]
    silent: bool,

    /// Enable debug mode
    #[arg(short, long)]
    verbose: bool,
}

fn parse_param(s: &str) -> Result<(String, serde_json::Value), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", s))?;
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

fn demo_observer(delay: Duration, silent: bool) -> Arc<dyn Observer> {
    Arc::new(FnObserver::new(
        "demo",
        move |request: Arc<CorrelatedRequest>, _: ObserverContext| async move {
            if silent {
                debug!(key = %request.key(), "demo observer staying silent");
                return None;
            }
            tokio::time::sleep(delay).await;
            Some(ReplyOutcome::success(format!(
                "reserved for {}",
                request.key()
            )))
        },
    ))
}

async fn run(cli: &Cli) -> Result<bool, BrokerError> {
    let config = if cli.config.exists() {
        BrokerConfig::from_file(&cli.config)?
    } else {
        // Default config
        BrokerConfig::default()
    };
    info!("config loaded.");
    debug!("config: {:?}", config);

    let observer = demo_observer(Duration::from_millis(cli.reply_delay), cli.silent);
    let broker = Broker::start_with(config, vec![observer]).await?;

    let payload: Payload = cli.params.iter().cloned().collect();
    let response = broker.reserve(RequestKey::new(cli.key.as_str()), payload).await;

    let json = serde_json::to_string(&response)
        .map_err(|e| BrokerError::internal(format!("Failed to encode response: {}", e)))?;
    println!("{}", json);

    broker.shutdown().await?;
    Ok(response.is_ok())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
