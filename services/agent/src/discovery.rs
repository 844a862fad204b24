//! mDNS/DNS-SD service advertisement for Hub discovery.
//!
//! Advertises `_capydeploy._tcp.local.` with TXT records `id`, `name`,
//! `platform`, `version` on the control-channel port.  Discovery protocol
//! design lives on the Hub side; the agent only announces itself.

use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::collections::HashMap;
use std::net::IpAddr;
use thiserror::Error;
use tracing::{info, warn};

pub const SERVICE_TYPE: &str = "_capydeploy._tcp.local.";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mDNS: {0}")]
    Mdns(#[from] mdns_sd::Error),
    #[error("no non-loopback IPv4 address found")]
    NoAddress,
}

pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    fullname: String,
}

impl MdnsAdvertiser {
    /// Register the agent's service instance.
    pub fn register(
        agent_id: &str,
        agent_name: &str,
        platform: &str,
        version: &str,
        port: u16,
    ) -> Result<Self, DiscoveryError> {
        let ip = local_ipv4().ok_or(DiscoveryError::NoAddress)?;
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "capydeploy-agent".to_owned());

        let properties: HashMap<String, String> = [
            ("id".to_owned(), agent_id.to_owned()),
            ("name".to_owned(), agent_name.to_owned()),
            ("platform".to_owned(), platform.to_owned()),
            ("version".to_owned(), version.to_owned()),
        ]
        .into();

        let info = ServiceInfo::new(
            SERVICE_TYPE,
            agent_id,
            &format!("{host}.local."),
            ip,
            port,
            properties,
        )?;
        let fullname = info.get_fullname().to_owned();

        let daemon = ServiceDaemon::new()?;
        daemon.register(info)?;
        info!(%ip, port, fullname = %fullname, "mDNS service registered");
        Ok(Self { daemon, fullname })
    }

    /// Unregister and shut the responder down.
    pub fn shutdown(self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            warn!(error = %e, "mDNS unregister failed");
        }
        let _ = self.daemon.shutdown();
        info!("mDNS service stopped");
    }
}

/// First non-loopback IPv4 address on any interface.
fn local_ipv4() -> Option<IpAddr> {
    let addrs = if_addrs::get_if_addrs().ok()?;
    addrs
        .into_iter()
        .filter(|a| !a.is_loopback())
        .map(|a| a.ip())
        .find(IpAddr::is_ipv4)
}
