//! Host-based access control, consulted when a client's credentials fail.

use crate::transport::PeerAddr;
use std::net::IpAddr;

pub trait HostAccess {
    fn allows(&self, peer: Option<PeerAddr>) -> bool;
}

/// Allow list of addresses plus a switch for local connections.
#[derive(Debug, Clone)]
pub struct HostList {
    enabled: bool,
    local: bool,
    hosts: Vec<IpAddr>,
}

impl Default for HostList {
    fn default() -> Self {
        Self {
            enabled: true,
            local: true,
            hosts: Vec::new(),
        }
    }
}

impl HostList {
    /// With access control disabled every host gets in.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn set_local(&mut self, allowed: bool) {
        self.local = allowed;
    }

    pub fn add(&mut self, host: IpAddr) {
        if !self.hosts.contains(&host) {
            self.hosts.push(host);
        }
    }

    pub fn remove(&mut self, host: IpAddr) -> bool {
        let before = self.hosts.len();
        self.hosts.retain(|h| *h != host);
        self.hosts.len() != before
    }
}

impl HostAccess for HostList {
    fn allows(&self, peer: Option<PeerAddr>) -> bool {
        if !self.enabled {
            return true;
        }
        match peer {
            Some(PeerAddr::Local) => self.local,
            Some(PeerAddr::Inet(ip)) => (self.local && ip.is_loopback()) || self.hosts.contains(&ip),
            None => false,
        }
    }
}
