use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Arg, Command};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use zonesign::config::SignerConfig;
use zonesign::dnssec::RrSet;
use zonesign::engine::SigningEngine;
use zonesign::graceful_shutdown::GracefulShutdown;
use zonesign::http_server::HttpServer;
use zonesign::records::MemoryRecordSource;

type MainResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[tokio::main]
async fn main() -> MainResult {
    let matches = Command::new("zonesign")
        .version(env!("CARGO_PKG_VERSION"))
        .about("DNSSEC key management and zone signing service")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file; ZONESIGN_* variables override it"),
        )
        .arg(
            Arg::new("bind")
                .long("bind")
                .value_name("ADDR")
                .help("HTTP API bind address"),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .help("Directory for durable state"),
        )
        .arg(
            Arg::new("records")
                .long("records")
                .value_name("FILE")
                .help("JSON file mapping zone origins to their RRsets"),
        )
        .get_matches();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => SignerConfig::from_file(path)?.with_env_overrides()?,
        None => SignerConfig::from_env()?,
    };
    if let Some(bind) = matches.get_one::<String>("bind") {
        config.http_bind_addr = Some(bind.parse::<SocketAddr>()?);
    }
    if let Some(dir) = matches.get_one::<String>("data-dir") {
        config.data_dir = Some(PathBuf::from(dir));
    }

    let records = Arc::new(MemoryRecordSource::new());
    if let Some(path) = matches.get_one::<String>("records") {
        let zones: HashMap<String, Vec<RrSet>> =
            serde_json::from_str(&std::fs::read_to_string(path)?)?;
        for (origin, rrsets) in zones {
            records.set_rrsets(&origin, rrsets);
        }
    }

    let http_bind_addr = config.http_bind_addr;
    let engine = Arc::new(SigningEngine::open(config, records)?);
    engine.provision_configured_zones()?;

    let shutdown = Arc::new(GracefulShutdown::new());
    let tasks = Arc::new(tokio::sync::Mutex::new(engine.spawn_background(&shutdown)));
    shutdown
        .register_component("background-tasks".to_string(), move || {
            let tasks = tasks.clone();
            async move {
                let handles = std::mem::take(&mut *tasks.lock().await);
                futures::future::join_all(handles).await;
                Ok(())
            }
        })
        .await;

    let http_handle = http_bind_addr.map(|addr| {
        let server = HttpServer::new(engine.clone(), addr);
        let rx = shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = server.start(rx).await {
                error!("HTTP server error: {}", e);
            }
        })
    });

    info!("zonesign {} running", env!("CARGO_PKG_VERSION"));
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    shutdown.shutdown().await?;
    if let Some(handle) = http_handle {
        let _ = handle.await;
    }
    Ok(())
}
