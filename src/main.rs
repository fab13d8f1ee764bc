use anyhow::{anyhow, Result};
use std::sync::Arc;

use vless_trojan_relay::config;
use vless_trojan_relay::core::{mask_uuid, DohResolver, ProtocolKind, Server};
use vless_trojan_relay::logger::{self, log};
use vless_trojan_relay::server_runner;

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // Must happen before any TLS operation
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let cli = config::CliArgs::parse_args();
    cli.validate()?;

    logger::init_logger(&cli.log_mode);

    let credentials = cli.credentials()?;
    let egress = cli.egress_policy();
    let primary = cli.valid_uuids().into_iter().next().unwrap_or_default();

    log::info!(
        uuids = credentials.uuid_count(),
        primary = %mask_uuid(&primary),
        fallback = egress.fallback_host().unwrap_or("none"),
        doh = %cli.doh_url,
        "Starting VLESS / Trojan relay"
    );

    let conn_config = config::ConnConfig::from_cli(&cli);
    let server_config = config::ServerConfig::from_cli(&cli);
    let resolver = DohResolver::new(&cli.doh_url, conn_config.doh_timeout)?;

    let server = Arc::new(
        Server::builder()
            .credentials(credentials)
            .egress(egress)
            .resolver(Arc::new(resolver))
            .conn_config(conn_config)
            .build(),
    );

    // Setup shutdown handler
    let conn_manager = server.conn_manager.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (mut sigint, mut sigterm) = match (
                signal(SignalKind::interrupt()),
                signal(SignalKind::terminate()),
            ) {
                (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
                _ => {
                    log::error!("Failed to install signal handlers");
                    return;
                }
            };

            tokio::select! {
                _ = sigint.recv() => {
                    log::info!("SIGINT received, shutting down...");
                }
                _ = sigterm.recv() => {
                    log::info!("SIGTERM received, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutdown signal received...");
        }

        let vless = conn_manager.count_by_protocol(ProtocolKind::Vless);
        let trojan = conn_manager.count_by_protocol(ProtocolKind::Trojan);
        let cancelled = conn_manager.cancel_all();
        log::info!(
            sessions = cancelled,
            vless = vless,
            trojan = trojan,
            "Cancelled active sessions"
        );
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
        std::process::exit(0);
    });

    server_runner::run_server(server, &server_config).await
}
