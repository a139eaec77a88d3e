//! Process entry point: loads configuration, wires up the server, and runs
//! it until a shutdown signal arrives.
//!
//! Per spec.md §6 this layer is an external collaborator specified only by
//! its interface (config file, ports, exit codes); `dhns::config` and
//! `dhns::server` hold the actual logic this binary only drives.

use std::process::ExitCode;

use dhns::config::{dhcp_port, dns_port, Config};
use dhns::logging;
use dhns::mds::MetadataService;
use dhns::server::DhnsServer;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = logging::init_logger("dhns", 2) {
        eprintln!("failed to initialize logger: {e}");
        return ExitCode::FAILURE;
    }

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "dhns.toml".to_string());
    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("startup: {e}");
            return ExitCode::FAILURE;
        }
    };

    let dhcp_port = dhcp_port();
    let dns_port = dns_port();

    let server = match DhnsServer::build(&config, dhcp_port, dns_port) {
        Ok(s) => s,
        Err(e) => {
            log::error!("startup: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(bind) = &config.mds.bind {
        match MetadataService::bind(bind, config.mds.public_keys.clone()).await {
            Ok(mds) => {
                tokio::spawn(async move { mds.serve().await });
            }
            Err(e) => log::error!("startup: metadata service: {e}"),
        }
    }

    let docker_domain = config.dns.base_domain.clone().unwrap_or_else(|| "docker".to_string());
    let docker_socket = config.dns.docker_socket.clone();

    log::info!("dhns: listening dhcp={dhcp_port} dns={dns_port}");

    tokio::select! {
        _ = server.start(docker_socket, docker_domain) => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!("dhns: shutdown signal received");
            server.stop();
        }
    }

    ExitCode::SUCCESS
}
