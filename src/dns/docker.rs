//! Container-discovery registry (spec.md §4.8, C10): watches the Docker
//! event stream and answers A queries for container names.
//!
//! Grounded on `original_source/dhns/dns/docker.py`'s `Resolver`/`Storage` —
//! ref-counted name→address storage, the `start`/`die` event handling (this
//! crate also handles `rename`, a supplement noted in DESIGN.md), and the
//! compose-label name-derivation rules. `bollard` is the standard Rust
//! Docker Engine API client and stands in for the Python `docker` SDK.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::StreamExt;
use log::{info, warn};

use super::message::{a_record, DnsMessage};
use super::middleware::DnsMiddleware;

const DEFAULT_TTL: u32 = 60;

fn sanitize_name(name: &str) -> String {
    name.trim_start_matches('/')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '-')
        .collect::<String>()
        .trim_end_matches('.')
        .to_lowercase()
}

struct Entry {
    refcount: u32,
    addrs: Vec<Ipv4Addr>,
}

#[derive(Default)]
struct Storage {
    data: Mutex<HashMap<String, Entry>>,
}

impl Storage {
    fn append(&self, key: String, addrs: Vec<Ipv4Addr>) {
        info!("docker: + {key} {addrs:?}");
        let mut data = self.data.lock().unwrap();
        data.entry(key)
            .and_modify(|e| {
                e.refcount += 1;
                e.addrs.extend(addrs.clone());
            })
            .or_insert(Entry { refcount: 1, addrs });
    }

    fn remove(&self, key: &str) {
        let mut data = self.data.lock().unwrap();
        if let Some(entry) = data.get_mut(key) {
            if entry.refcount <= 1 {
                info!("docker: D {key}");
                data.remove(key);
            } else {
                info!("docker: - {key}");
                entry.refcount -= 1;
            }
        }
    }

    fn rename(&self, old_names: &[String], new_names: Vec<(String, Vec<Ipv4Addr>)>) {
        for old in old_names {
            self.remove(old);
        }
        for (name, addrs) in new_names {
            self.append(name, addrs);
        }
    }

    fn query(&self, key: &str) -> Vec<Ipv4Addr> {
        self.data.lock().unwrap().get(key).map(|e| e.addrs.clone()).unwrap_or_default()
    }
}

/// Derived name set for one container: its own sanitized name under
/// `domain`, the compose `instance.service.project`/`service.project` forms
/// when all three labels are present, and any names from the
/// `com.dhns.domain` label (semicolon-separated, used verbatim).
fn derive_names(container_name: &str, labels: &HashMap<String, String>, domain: &str) -> Vec<String> {
    let mut names = vec![sanitize_name(container_name)];

    let instance = labels.get("com.docker.compose.container-number");
    let service = labels.get("com.docker.compose.service");
    let project = labels.get("com.docker.compose.project");
    if let (Some(instance), Some(service), Some(project)) = (instance, service, project) {
        names.push(format!("{instance}.{service}.{project}").to_lowercase());
        names.push(format!("{service}.{project}").to_lowercase());
    }

    let mut full_names: Vec<String> = names.iter().map(|n| format!("{n}.{domain}")).collect();

    if let Some(extra) = labels.get("com.dhns.domain") {
        full_names.extend(extra.split(';').map(|n| n.to_lowercase()));
    }

    full_names
}

fn extract_addrs(networks: &HashMap<String, bollard::models::EndpointSettings>) -> Vec<Ipv4Addr> {
    networks
        .values()
        .filter_map(|net| net.ip_address.as_ref())
        .filter_map(|ip| ip.parse().ok())
        .collect()
}

pub struct DockerRegistry {
    storage: Storage,
}

impl DockerRegistry {
    pub fn new() -> Self {
        Self { storage: Storage::default() }
    }

    /// Connects to the Docker daemon, seeds the registry from currently
    /// running containers, then drains the event stream indefinitely.
    /// Spawned as its own task; errors are logged and the loop exits rather
    /// than panicking the server.
    pub async fn run(self: std::sync::Arc<Self>, socket: Option<String>, domain: String) {
        let docker = match socket {
            Some(path) => Docker::connect_with_socket(&path, 120, bollard::API_DEFAULT_VERSION),
            None => Docker::connect_with_socket_defaults(),
        };
        let docker = match docker {
            Ok(d) => d,
            Err(e) => {
                warn!("docker: failed to connect: {e}");
                return;
            }
        };

        if let Ok(containers) = docker
            .list_containers(Some(ListContainersOptions::<String> { all: false, ..Default::default() }))
            .await
        {
            for summary in containers {
                if let Some(id) = summary.id {
                    self.inspect_and_append(&docker, &id, &domain).await;
                }
            }
        }

        let mut events = docker.events(Some(EventsOptions::<String> { ..Default::default() }));
        while let Some(event) = events.next().await {
            let Ok(event) = event else { continue };
            let Some(actor) = event.actor else { continue };
            let Some(id) = actor.id else { continue };
            match event.action.as_deref() {
                Some("start") => self.inspect_and_append(&docker, &id, &domain).await,
                Some("die") => self.inspect_and_remove(&docker, &id, &domain).await,
                Some("rename") => {
                    let old_name = actor.attributes.as_ref().and_then(|a| a.get("oldName")).cloned();
                    self.inspect_and_rename(&docker, &id, &domain, old_name).await;
                }
                _ => {}
            }
        }
    }

    async fn inspect_and_append(&self, docker: &Docker, id: &str, domain: &str) {
        if let Some((names, addrs)) = self.inspect(docker, id, domain).await {
            for name in names {
                self.storage.append(name, addrs.clone());
            }
        }
    }

    async fn inspect_and_remove(&self, docker: &Docker, id: &str, domain: &str) {
        if let Some((names, _addrs)) = self.inspect(docker, id, domain).await {
            for name in names {
                self.storage.remove(&name);
            }
        }
    }

    /// Moves storage from the names derived under the pre-rename container
    /// name to the names derived under the post-rename one. Labels (and so
    /// the compose/`com.dhns.domain`-derived names) are unaffected by a
    /// rename, so those keys are removed and re-appended unchanged; only the
    /// container's own sanitized name actually moves.
    async fn inspect_and_rename(&self, docker: &Docker, id: &str, domain: &str, old_name: Option<String>) {
        let Some(old_name) = old_name else {
            self.inspect_and_append(docker, id, domain).await;
            return;
        };

        let Ok(details) = docker.inspect_container(id, None::<InspectContainerOptions>).await else { return };
        let Some(new_name) = details.name else { return };
        let labels = details.config.and_then(|c| c.labels).unwrap_or_default();
        let networks = details.network_settings.and_then(|n| n.networks).unwrap_or_default();

        let old_names = derive_names(&old_name, &labels, domain);
        let addrs = extract_addrs(&networks);
        let new_names = derive_names(&new_name, &labels, domain)
            .into_iter()
            .map(|name| (name, addrs.clone()))
            .collect();

        self.storage.rename(&old_names, new_names);
    }

    async fn inspect(&self, docker: &Docker, id: &str, domain: &str) -> Option<(Vec<String>, Vec<Ipv4Addr>)> {
        let details = docker.inspect_container(id, None::<InspectContainerOptions>).await.ok()?;
        let name = details.name?;
        let labels = details.config.and_then(|c| c.labels).unwrap_or_default();
        let networks = details.network_settings.and_then(|n| n.networks).unwrap_or_default();

        let names = derive_names(&name, &labels, domain);
        let addrs = extract_addrs(&networks);
        Some((names, addrs))
    }
}

impl Default for DockerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsMiddleware for DockerRegistry {
    async fn handle_dns_query(&self, query: &DnsMessage, answer: &mut DnsMessage) -> bool {
        if !query.is_a_or_any() {
            return false;
        }

        let addrs = self.storage.query(&query.qname());
        if addrs.is_empty() {
            return false;
        }

        for addr in addrs {
            answer.add_answer(a_record(&query.qname(), DEFAULT_TTL, addr));
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_leading_slash_and_invalid_chars() {
        assert_eq!(sanitize_name("/my_app!"), "myapp");
    }

    #[test]
    fn derive_names_includes_compose_triplet() {
        let mut labels = HashMap::new();
        labels.insert("com.docker.compose.container-number".to_string(), "1".to_string());
        labels.insert("com.docker.compose.service".to_string(), "web".to_string());
        labels.insert("com.docker.compose.project".to_string(), "myproj".to_string());

        let names = derive_names("web_1", &labels, "docker");
        assert!(names.contains(&"1.web.myproj.docker".to_string()));
        assert!(names.contains(&"web.myproj.docker".to_string()));
    }

    #[test]
    fn derive_names_honors_dhns_domain_label() {
        let mut labels = HashMap::new();
        labels.insert("com.dhns.domain".to_string(), "a.example;b.example".to_string());
        let names = derive_names("box", &labels, "docker");
        assert!(names.contains(&"a.example".to_string()));
        assert!(names.contains(&"b.example".to_string()));
    }

    #[test]
    fn sanitize_lowercases_mixed_case_names() {
        assert_eq!(sanitize_name("/MyApp"), "myapp");
    }

    #[test]
    fn derive_names_lowercases_compose_and_label_derived_names() {
        let mut labels = HashMap::new();
        labels.insert("com.docker.compose.container-number".to_string(), "1".to_string());
        labels.insert("com.docker.compose.service".to_string(), "Web".to_string());
        labels.insert("com.docker.compose.project".to_string(), "MyProj".to_string());
        labels.insert("com.dhns.domain".to_string(), "Extra.Example".to_string());

        let names = derive_names("Web_1", &labels, "docker");
        assert!(names.contains(&"1.web.myproj.docker".to_string()));
        assert!(names.contains(&"web.myproj.docker".to_string()));
        assert!(names.contains(&"extra.example".to_string()));
    }

    #[test]
    fn storage_rename_moves_records_between_keys() {
        let storage = Storage::default();
        storage.append("old.docker".to_string(), vec![Ipv4Addr::new(172, 17, 0, 2)]);
        storage.rename(&["old.docker".to_string()], vec![("new.docker".to_string(), vec![Ipv4Addr::new(172, 17, 0, 2)])]);
        assert!(storage.query("old.docker").is_empty());
        assert_eq!(storage.query("new.docker"), vec![Ipv4Addr::new(172, 17, 0, 2)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn storage_refcounts_duplicate_appends() {
        let storage = Storage::default();
        storage.append("web.docker".to_string(), vec![Ipv4Addr::new(172, 17, 0, 2)]);
        storage.append("web.docker".to_string(), vec![Ipv4Addr::new(172, 17, 0, 3)]);
        assert_eq!(storage.query("web.docker").len(), 2);

        storage.remove("web.docker");
        assert_eq!(storage.query("web.docker").len(), 2);
        storage.remove("web.docker");
        assert!(storage.query("web.docker").is_empty());
    }
}
