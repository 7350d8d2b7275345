//! OS-configured upstream
//!
//! Asks the operating system which DNS servers are configured for an
//! interface and exchanges through UDP clients bound to it. Discovery is
//! platform specific: macOS is probed through `scutil`, Windows through
//! the IP helper adapter list, and other platforms are unsupported.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use hickory_proto::op::Message;

use crate::client::{batch_exchange, udp_clients_for, DnsClient};
use crate::dialer::GetDialer;
use crate::error::Result;

/// Upstream whose servers are the OS-configured resolvers of an interface
pub struct SystemClient {
    iface: String,
    get_dialer: GetDialer,
    clients: Mutex<Vec<Arc<dyn DnsClient>>>,
    me: Weak<SystemClient>,
}

impl SystemClient {
    pub fn new(iface: &str, get_dialer: GetDialer) -> Arc<Self> {
        let client = Arc::new_cyclic(|me| Self {
            iface: iface.to_string(),
            get_dialer,
            clients: Mutex::new(Vec::new()),
            me: me.clone(),
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let me = Arc::downgrade(&client);
            handle.spawn(async move {
                if let Some(client) = me.upgrade() {
                    if let Err(e) = client.update().await {
                        log::warn!("system dns init failed: {}", e);
                    }
                }
            });
        }

        client
    }

    /// Re-probe the OS and rebuild the nested clients. Only IPv4 servers
    /// are kept.
    async fn update(&self) -> Result<()> {
        let servers = probe_servers(&self.iface).await?;
        log::info!("system dns on {}: {:?}", self.iface, servers);

        let v4: Vec<Ipv4Addr> = servers
            .into_iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect();

        let clients = udp_clients_for(&v4, &self.iface, &self.get_dialer);
        *self.clients.lock().expect("system state lock poisoned") = clients;
        Ok(())
    }
}

#[async_trait]
impl DnsClient for SystemClient {
    fn servers(&self) -> Vec<String> {
        let clients = self.clients.lock().expect("system state lock poisoned");
        clients.iter().flat_map(|c| c.servers()).collect()
    }

    async fn exchange(&self, msg: &Message) -> Result<Message> {
        let mut clients = {
            let guard = self.clients.lock().expect("system state lock poisoned");
            guard.clone()
        };
        if clients.is_empty() {
            self.update().await?;
            clients = self
                .clients
                .lock()
                .expect("system state lock poisoned")
                .clone();
        }

        let result = batch_exchange(&clients, msg).await;
        if result.is_err() {
            if let Some(client) = self.me.upgrade() {
                tokio::spawn(async move {
                    if let Err(e) = client.update().await {
                        log::warn!("system dns refresh failed: {}", e);
                    }
                });
            }
        }
        result
    }
}

/// DNS servers the OS has configured for `iface`.
#[cfg(target_os = "macos")]
pub(crate) async fn probe_servers(iface: &str) -> Result<Vec<IpAddr>> {
    let _ = iface; // macOS reports per-service state, keyed off the primary
    macos::resolve_servers().await
}

#[cfg(windows)]
pub(crate) async fn probe_servers(iface: &str) -> Result<Vec<IpAddr>> {
    windows::resolve_servers(iface)
}

#[cfg(not(any(target_os = "macos", windows)))]
pub(crate) async fn probe_servers(_iface: &str) -> Result<Vec<IpAddr>> {
    Err(crate::error::Error::PlatformUnsupported)
}

#[cfg(any(target_os = "macos", test))]
mod macos {
    use super::*;

    /// Ask `scutil` for the primary service, then for that service's DNS
    /// configuration.
    #[cfg(target_os = "macos")]
    pub(super) async fn resolve_servers() -> Result<Vec<IpAddr>> {
        use crate::error::Error;

        let output = exec_scutil(&[
            "open",
            "get State:/Network/Global/IPv4",
            "d.show",
            "close",
            "quit",
        ])
        .await?;
        let service = parse_primary_service(&output)
            .ok_or_else(|| Error::Dns("scutil reported no primary service".into()))?;

        let get = format!("get State:/Network/Service/{}/DNS", service);
        let output = exec_scutil(&["open", &get, "d.show", "close", "quit"]).await?;
        let servers = parse_server_addresses(&output);
        if servers.is_empty() {
            return Err(Error::Dns(format!(
                "no dns servers configured for service {}",
                service
            )));
        }
        Ok(servers)
    }

    #[cfg(target_os = "macos")]
    async fn exec_scutil(script: &[&str]) -> Result<Vec<String>> {
        use tokio::io::AsyncWriteExt;
        use tokio::process::Command;

        let mut child = Command::new("scutil")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            for line in script {
                stdin.write_all(line.trim().as_bytes()).await?;
                stdin.write_all(b"\n").await?;
            }
        }

        let output = child.wait_with_output().await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.to_string())
            .collect())
    }

    /// The `PrimaryService : <id>` line out of the IPv4 global state.
    pub(super) fn parse_primary_service(lines: &[String]) -> Option<String> {
        for line in lines {
            let mut parts = line.splitn(2, ':');
            if parts.next()?.trim() == "PrimaryService" {
                return Some(parts.next()?.trim().to_string());
            }
        }
        None
    }

    /// Addresses inside the indented `ServerAddresses : <array> {` block,
    /// which runs until the closing `}`.
    pub(super) fn parse_server_addresses(lines: &[String]) -> Vec<IpAddr> {
        let mut servers = Vec::new();
        let mut in_block = false;
        for line in lines {
            let trimmed = line.trim();
            if in_block {
                if trimmed == "}" {
                    break;
                }
                if let Some((_, value)) = trimmed.rsplit_once(':') {
                    if let Ok(ip) = value.trim().parse::<IpAddr>() {
                        servers.push(ip);
                    }
                }
                continue;
            }
            if let Some((key, _)) = trimmed.split_once(':') {
                if key.trim() == "ServerAddresses" {
                    in_block = true;
                }
            }
        }
        servers
    }

}

#[cfg(windows)]
mod windows {
    use super::*;
    use crate::error::Error;

    /// DNS servers of the adapter whose name (or friendly name) matches.
    pub(super) fn resolve_servers(iface: &str) -> Result<Vec<IpAddr>> {
        let adapters = ipconfig::get_adapters()
            .map_err(|e| Error::Dns(format!("enumerating adapters: {}", e)))?;
        for adapter in adapters {
            if adapter.adapter_name() == iface || adapter.friendly_name() == iface {
                return Ok(adapter.dns_servers().to_vec());
            }
        }
        Err(Error::Dns(format!("adapter '{}' not found", iface)))
    }
}
