//! IP allow-listing and per-pair session accounting.

use ipnet::IpNet;
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex, PoisonError},
};
use thiserror::Error;
use tracing::debug;

use crate::config::{ConfigError, PairConfig};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("{ip} is not in the allow list")]
    NotAllowed { ip: IpAddr },
    #[error("session limit of {max} reached")]
    SessionLimit { max: usize },
}

/// Addresses and networks permitted to open sessions.
#[derive(Debug, Clone)]
pub struct IpAllowList {
    entries: Vec<IpNet>,
}

impl IpAllowList {
    /// Accepts single addresses and CIDR networks. Entries may also be
    /// comma-separated within one string, as given on the command line.
    pub fn parse<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ConfigError> {
        let mut entries = Vec::new();
        for pattern in patterns {
            for entry in pattern.as_ref().split(',').map(str::trim) {
                if entry.is_empty() {
                    continue;
                }
                // Try parsing as individual IP address first
                if let Ok(ip) = entry.parse::<IpAddr>() {
                    entries.push(IpNet::from(ip.to_canonical()));
                } else if let Ok(net) = entry.parse::<IpNet>() {
                    entries.push(net.trunc());
                } else {
                    return Err(ConfigError::InvalidIpPattern(entry.to_string()));
                }
            }
        }
        Ok(Self { entries })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.entries.iter().any(|net| net.contains(&ip))
    }
}

#[derive(Debug, Default)]
struct Registry {
    total: usize,
    by_ip: HashMap<IpAddr, usize>,
}

/// Decides whether a remote address may open a session on a pair and
/// tracks how many sessions are live.
#[derive(Debug)]
pub struct AdmissionController {
    allow: Option<IpAllowList>,
    max_sessions: Option<usize>,
    registry: Mutex<Registry>,
}

impl AdmissionController {
    #[must_use]
    pub fn new(allow: Option<IpAllowList>, max_sessions: Option<usize>) -> Self {
        Self {
            allow,
            max_sessions,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Builds the controller for one pair. A blank allow list places no
    /// restriction on clients.
    pub fn from_pair(pair: &PairConfig) -> Result<Self, ConfigError> {
        let allow = pair
            .allowed_ips
            .as_deref()
            .map(IpAllowList::parse)
            .transpose()?
            .filter(|allow| !allow.is_empty());
        Ok(Self::new(allow, pair.max_sessions))
    }

    /// Admits `remote` if it passes the allow list and a session slot is
    /// free. The returned permit releases the slot when dropped.
    pub fn try_admit(self: &Arc<Self>, remote: SocketAddr) -> Result<SessionPermit, Rejection> {
        let ip = remote.ip().to_canonical();
        if let Some(allow) = &self.allow {
            if !allow.contains(ip) {
                return Err(Rejection::NotAllowed { ip });
            }
        }

        let mut registry = self.lock();
        if let Some(max) = self.max_sessions {
            if registry.total >= max {
                return Err(Rejection::SessionLimit { max });
            }
        }
        registry.total += 1;
        *registry.by_ip.entry(ip).or_default() += 1;
        debug!(client_ip = %ip, live_sessions = registry.total, "Session admitted");
        drop(registry);

        Ok(SessionPermit {
            controller: Arc::clone(self),
            remote,
        })
    }

    /// Returns the slot held by `remote`. Releasing an address with no live
    /// session is a no-op.
    pub fn release(&self, remote: SocketAddr) {
        let ip = remote.ip().to_canonical();
        let mut registry = self.lock();
        let Some(count) = registry.by_ip.get_mut(&ip) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            registry.by_ip.remove(&ip);
        }
        registry.total -= 1;
        debug!(client_ip = %ip, live_sessions = registry.total, "Session released");
    }

    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.lock().total
    }

    #[must_use]
    pub fn sessions_for(&self, ip: IpAddr) -> usize {
        self.lock()
            .by_ip
            .get(&ip.to_canonical())
            .copied()
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A live admission slot.
#[derive(Debug)]
pub struct SessionPermit {
    controller: Arc<AdmissionController>,
    remote: SocketAddr,
}

impl SessionPermit {
    #[must_use]
    pub const fn remote(&self) -> SocketAddr {
        self.remote
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.controller.release(self.remote);
    }
}
