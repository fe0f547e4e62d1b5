use anyhow::{anyhow, Result};
use chaincrab::error::Error::DNSError;
use chaincrab::{Capability, Chain, Config, SharedConfig};
use is_terminal::IsTerminal;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    let mut first_args = std::env::args().take(2);
    let (program_name, config_file) = (
        first_args.next().unwrap_or("chaincrab".to_string()),
        first_args.next(),
    );

    let config = config_init(&program_name, config_file)?;
    let backend = config.backend().await?;
    let chain = Arc::new(Chain::from_config(&config, backend).await?);

    for plugin in chain.capable(Capability::Writable) {
        if let Some(writable) = plugin.writable_backend() {
            let backend = writable.read().await;
            if let Some(zones) = backend.as_writable().map(|w| w.zones().clone()) {
                let zones: Vec<String> = zones.iter().map(ToString::to_string).collect();
                tracing::info!(plugin = plugin.name(), "accepting updates for {zones:?}");
            }
        }
    }

    if std::io::stdout().is_terminal() {
        let names: Vec<&str> = chain.plugins().iter().map(|plugin| plugin.name()).collect();
        println!("chaincrab: {}", names.join(" -> "));
    }

    let shutdown = CancellationToken::new();
    tracing::info!("DNS listening on UDP {}", &config.dns_udp_bind_addr);
    tracing::info!("DNS listening on TCP {}", &config.dns_tcp_bind_addr);
    let dns_server = chaincrab::dns::new(config.clone(), chain, shutdown.clone()).await?;
    let dns_handle = tokio::spawn(dns_server.block_until_done());

    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("quitting from signal");
            shutdown.cancel();
        },
        Ok(dns_res) = dns_handle => {
            if let Err(err) = dns_res {
                return Err(DNSError(err).into())
            }
        }
    }
    tracing::info!("goodbye");
    Ok(())
}

fn tracing_init() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chaincrab=info".into()),
        )
        .init();
}

fn config_init(program_name: &str, config_file: Option<String>) -> Result<SharedConfig> {
    match config_file {
        None => Err(anyhow!("usage: {program_name} /path/to/config.json")),
        Some(config_file) => {
            tracing::debug!("loaded config from {config_file}");
            let config = Config::try_from_file(&config_file)?;
            Ok(Arc::new(config))
        }
    }
}
