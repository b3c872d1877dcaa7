//! Upstream group registry.
//!
//! # Responsibilities
//! - Resolve declared server addresses once, at build time
//! - Build one shared selector and one connector per group
//! - Hand routes the group they forward to

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use thiserror::Error;

use crate::config::UpstreamGroupConfig;
use crate::load_balancer::backend::Backend;
use crate::load_balancer::round_robin::{RoundRobin, Tier, UpstreamGroup};
use crate::load_balancer::PeerSelector;
use crate::net::connector::{Connector, TcpConnector};
use crate::net::keepalive::KeepalivePool;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cannot resolve upstream server \"{address}\": {source}")]
    Resolve {
        address: String,
        source: std::io::Error,
    },
    #[error("upstream server \"{0}\" resolved to no address")]
    NoAddress(String),
    #[error("upstream \"{0}\" has no servers")]
    Empty(String),
    #[error("duplicate upstream \"{0}\"")]
    Duplicate(String),
}

/// Everything a request needs to talk to one group.
#[derive(Debug, Clone)]
pub struct UpstreamHandle {
    pub selector: Arc<dyn PeerSelector>,
    pub connector: Arc<dyn Connector>,
}

/// Group name → handle.
#[derive(Debug, Default)]
pub struct UpstreamRegistry {
    groups: HashMap<String, UpstreamHandle>,
}

impl UpstreamRegistry {
    pub fn from_config(configs: &[UpstreamGroupConfig]) -> Result<Self, RegistryError> {
        let mut groups = HashMap::new();

        for config in configs {
            if groups.contains_key(&config.name) {
                return Err(RegistryError::Duplicate(config.name.clone()));
            }
            if config.servers.is_empty() {
                return Err(RegistryError::Empty(config.name.clone()));
            }

            let mut primary = Vec::new();
            let mut backup = Vec::new();
            for server in &config.servers {
                for addr in resolve(&server.address)? {
                    let entry = (Backend::from_config(addr, server), server.down);
                    if server.backup {
                        backup.push(entry);
                    } else {
                        primary.push(entry);
                    }
                }
            }

            let group = UpstreamGroup::new(&config.name, Tier::new(primary), Tier::new(backup));
            tracing::debug!(
                upstream = %config.name,
                servers = ?group.addresses(),
                keepalive = config.keepalive,
                "Upstream group built"
            );

            let pool = (config.keepalive > 0).then(|| Arc::new(KeepalivePool::new(config.keepalive)));
            let handle = UpstreamHandle {
                selector: Arc::new(RoundRobin::new(Arc::new(group))),
                connector: Arc::new(TcpConnector::new(pool)),
            };
            groups.insert(config.name.clone(), handle);
        }

        Ok(Self { groups })
    }

    pub fn get(&self, name: &str) -> Option<&UpstreamHandle> {
        self.groups.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

fn resolve(address: &str) -> Result<Vec<SocketAddr>, RegistryError> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(vec![addr]);
    }
    let addrs: Vec<SocketAddr> = address
        .to_socket_addrs()
        .map_err(|source| RegistryError::Resolve {
            address: address.to_string(),
            source,
        })?
        .collect();
    if addrs.is_empty() {
        return Err(RegistryError::NoAddress(address.to_string()));
    }
    Ok(addrs)
}
