//! Cloud-init-compatible instance metadata service (spec.md §4.12) — an
//! external collaborator the design calls out as out of scope for deep
//! implementation, kept as a minimal raw-HTTP responder.
//!
//! Grounded on `original_source/dhns/mds/{server,handler}.py`: same fixed
//! path set under `/2009-04-04/...`, same canned responses, no real HTTP
//! framework — the original relies on stdlib's `BaseHTTPRequestHandler`,
//! so this reads one request line off the socket by hand instead of
//! pulling in `hyper`/`axum`.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::StartupError;

const API_VERSION: &str = "2009-04-04";

pub struct MetadataService {
    listener: TcpListener,
    public_keys: Vec<String>,
}

impl MetadataService {
    pub async fn bind(addr: &str, public_keys: Vec<String>) -> Result<Self, StartupError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| StartupError::Bind { addr: addr.to_string(), source: e })?;
        Ok(Self { listener, public_keys })
    }

    pub async fn serve(self) {
        loop {
            let Ok((stream, addr)) = self.listener.accept().await else { continue };
            let public_keys = self.public_keys.clone();
            tokio::spawn(async move {
                let client_ip = addr.ip().to_string();
                if let Err(e) = handle_connection(stream, &client_ip, &public_keys).await {
                    log::warn!("mds: request handling failed: {e}");
                }
            });
        }
    }
}

async fn handle_connection(mut stream: TcpStream, client_ip: &str, public_keys: &[String]) -> std::io::Result<()> {
    let mut buf = [0u8; 2048];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();

    let body = route(&path, client_ip, public_keys);
    let response = match body {
        Some(body) => format!("HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\n{body}", body.len()),
        None => "HTTP/1.0 400 Bad Request\r\nContent-Length: 0\r\n\r\n".to_string(),
    };

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

fn route(path: &str, client_ip: &str, public_keys: &[String]) -> Option<String> {
    let meta_prefix = format!("/{API_VERSION}/meta-data");
    let keys_prefix = format!("{meta_prefix}/public-keys");

    if path == "/" {
        Some(API_VERSION.to_string())
    } else if path == format!("{meta_prefix}/instance-id") {
        Some(format!("i-{client_ip}"))
    } else if path == format!("{meta_prefix}/local-hostname") {
        Some("localhost".to_string())
    } else if path == format!("/{API_VERSION}/user-data") {
        Some(
            [
                "#cloud-config",
                "users:",
                "  - default",
                "  - name: node",
                "    groups: users",
                "    sudo:",
                "    - ALL=(ALL) NOPASSWD:ALL",
            ]
            .join("\n"),
        )
    } else if path.starts_with(&keys_prefix) {
        Some(public_keys.join("\n"))
    } else if path.starts_with(&meta_prefix) {
        Some(["instance-id", "local-hostname", "public-keys"].join("\n"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_returns_api_version() {
        assert_eq!(route("/", "1.2.3.4", &[]), Some("2009-04-04".to_string()));
    }

    #[test]
    fn instance_id_embeds_client_ip() {
        assert_eq!(route("/2009-04-04/meta-data/instance-id", "10.3.2.2", &[]), Some("i-10.3.2.2".to_string()));
    }

    #[test]
    fn unknown_path_returns_none() {
        assert_eq!(route("/nope", "1.2.3.4", &[]), None);
    }

    #[test]
    fn public_keys_listed_when_present() {
        let keys = vec!["ssh-ed25519 AAAA".to_string()];
        assert_eq!(
            route("/2009-04-04/meta-data/public-keys", "1.2.3.4", &keys),
            Some("ssh-ed25519 AAAA".to_string())
        );
    }
}
