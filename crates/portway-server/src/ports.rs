//! Tunnel port pool
//!
//! Listener ports come from `used_ports \ excluded_ports`. Random requests
//! draw candidates and prove availability by binding; the bound listener is
//! returned so the claim is atomic.

use rand::seq::SliceRandom;
use std::collections::{BTreeSet, HashSet};
use std::sync::Mutex;
use tokio::net::TcpListener;
use tracing::debug;

use crate::error::{Error, Result};

/// How many random candidates to probe before declaring the pool exhausted.
const MAX_PROBES: usize = 150;

/// Parse a port list like `"20000-20050,8080"`.
pub fn parse_port_spec(spec: &str) -> Result<BTreeSet<u16>> {
    let mut ports = BTreeSet::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: u16 = lo
                .trim()
                .parse()
                .map_err(|_| Error::Validation(format!("invalid port range {part:?}")))?;
            let hi: u16 = hi
                .trim()
                .parse()
                .map_err(|_| Error::Validation(format!("invalid port range {part:?}")))?;
            if lo == 0 || lo > hi {
                return Err(Error::Validation(format!("invalid port range {part:?}")));
            }
            ports.extend(lo..=hi);
        } else {
            let port: u16 = part
                .parse()
                .map_err(|_| Error::Validation(format!("invalid port {part:?}")))?;
            if port == 0 {
                return Err(Error::Validation(format!("invalid port {part:?}")));
            }
            ports.insert(port);
        }
    }
    Ok(ports)
}

/// The allocator. Live allocations are excluded from further draws until
/// released.
pub struct PortPool {
    candidates: Vec<u16>,
    allocated: Mutex<HashSet<u16>>,
}

impl PortPool {
    pub fn new(used_ports: &BTreeSet<u16>, excluded_ports: &BTreeSet<u16>) -> Self {
        let candidates: Vec<u16> = used_ports.difference(excluded_ports).copied().collect();
        Self {
            candidates,
            allocated: Mutex::new(HashSet::new()),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.candidates.len()
    }

    fn reserve(&self, port: u16) -> bool {
        self.allocated.lock().unwrap().insert(port)
    }

    /// Return a port to the pool after its listener closed.
    pub fn release(&self, port: u16) {
        self.allocated.lock().unwrap().remove(&port);
    }

    /// Bind a listener on `host` using `requested` or a random free pool
    /// port. The successful bind is the claim.
    pub async fn allocate(
        &self,
        host: &str,
        requested: Option<u16>,
    ) -> Result<(TcpListener, u16)> {
        match requested {
            Some(port) => {
                if !self.candidates.contains(&port) {
                    return Err(Error::Validation(format!(
                        "port {port} is not in the configured pool"
                    )));
                }
                if !self.reserve(port) {
                    return Err(Error::Conflict(format!("port {port} is already in use")));
                }
                match TcpListener::bind((host, port)).await {
                    Ok(listener) => Ok((listener, port)),
                    Err(e) => {
                        self.release(port);
                        Err(Error::Conflict(format!("port {port} is already in use: {e}")))
                    }
                }
            }
            None => {
                let mut candidates = self.candidates.clone();
                candidates.shuffle(&mut rand::thread_rng());

                for port in candidates.into_iter().take(MAX_PROBES) {
                    if !self.reserve(port) {
                        continue;
                    }
                    match TcpListener::bind((host, port)).await {
                        Ok(listener) => {
                            debug!(port, "allocated random tunnel port");
                            return Ok((listener, port));
                        }
                        Err(_) => self.release(port),
                    }
                }

                Err(Error::Conflict(
                    "no free ports available in the configured pool".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_parsing() {
        let ports = parse_port_spec("20000-20004,8080").unwrap();
        assert_eq!(ports.len(), 6);
        assert!(ports.contains(&20000));
        assert!(ports.contains(&20004));
        assert!(ports.contains(&8080));
        assert!(!ports.contains(&20005));

        assert!(parse_port_spec("5-1").is_err());
        assert!(parse_port_spec("abc").is_err());
        assert!(parse_port_spec("0").is_err());
        assert!(parse_port_spec("").unwrap().is_empty());
    }

    #[test]
    fn exclusions_are_removed() {
        let used = parse_port_spec("30000-30009").unwrap();
        let excluded = parse_port_spec("30003,30007").unwrap();
        let pool = PortPool::new(&used, &excluded);
        assert_eq!(pool.pool_size(), 8);
    }

    #[tokio::test]
    async fn requested_port_allocation() {
        let used = parse_port_spec("41000-41009").unwrap();
        let pool = PortPool::new(&used, &BTreeSet::new());

        let (listener, port) = pool.allocate("127.0.0.1", Some(41005)).await.unwrap();
        assert_eq!(port, 41005);
        assert_eq!(listener.local_addr().unwrap().port(), 41005);

        // Double allocation of the same port conflicts.
        let err = pool.allocate("127.0.0.1", Some(41005)).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        drop(listener);
        pool.release(41005);
        let (_listener, port) = pool.allocate("127.0.0.1", Some(41005)).await.unwrap();
        assert_eq!(port, 41005);
    }

    #[tokio::test]
    async fn requested_port_outside_pool_rejected() {
        let used = parse_port_spec("41100-41105").unwrap();
        let excluded = parse_port_spec("41103").unwrap();
        let pool = PortPool::new(&used, &excluded);

        let err = pool.allocate("127.0.0.1", Some(9)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = pool.allocate("127.0.0.1", Some(41103)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn random_allocation_and_exhaustion() {
        let used = parse_port_spec("41200-41202").unwrap();
        let pool = PortPool::new(&used, &BTreeSet::new());

        let mut listeners = Vec::new();
        for _ in 0..3 {
            let (listener, port) = pool.allocate("127.0.0.1", None).await.unwrap();
            assert!((41200..=41202).contains(&port));
            listeners.push(listener);
        }

        let err = pool.allocate("127.0.0.1", None).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }
}
