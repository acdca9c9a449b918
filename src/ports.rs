use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use std::collections::HashSet;
use std::net::TcpListener;

/// Upper bound on candidates probed per base port before giving up.
const SCAN_LIMIT: u16 = 256;

/// The full port assignment for one run. All values are pairwise distinct.
#[derive(Debug, Clone)]
pub struct PortMap {
    pub socks: Vec<u16>,
    pub control: Vec<u16>,
    /// DNSPort served by the dns-role instance; target of the UDP 53 redirect.
    pub dns: u16,
    pub lb_front: u16,
    pub filter_listen: Option<u16>,
}

impl PortMap {
    pub fn all_ports(&self) -> Vec<u16> {
        let mut ports = Vec::with_capacity(self.socks.len() + self.control.len() + 3);
        ports.extend_from_slice(&self.socks);
        ports.extend_from_slice(&self.control);
        ports.push(self.dns);
        ports.push(self.lb_front);
        if let Some(filter) = self.filter_listen {
            ports.push(filter);
        }
        ports
    }

    pub fn is_disjoint(&self) -> bool {
        let ports = self.all_ports();
        let unique: HashSet<u16> = ports.iter().copied().collect();
        unique.len() == ports.len()
    }
}

/// Build a conflict-free `PortMap` for the requested instance count.
///
/// Explicit ports (load-balancer front, filter) are used exactly as given
/// and never rebound elsewhere; base ports are scanned upward by probing a
/// loopback bind until enough free ports are found.
pub fn allocate(cfg: &SupervisorConfig) -> Result<PortMap, SupervisorError> {
    ensure_explicit_free(cfg.lb_front_port)?;
    let filter_listen = if cfg.filter_enabled() {
        ensure_explicit_free(cfg.filter_listen_port)?;
        Some(cfg.filter_listen_port)
    } else {
        None
    };

    let mut taken: HashSet<u16> = HashSet::new();
    taken.insert(cfg.lb_front_port);
    if let Some(port) = filter_listen {
        taken.insert(port);
    }

    let socks = scan(cfg.socks_base_port, cfg.instances, &mut taken)?;
    // One extra port from the control scan serves as the DNSPort.
    let mut control = scan(cfg.control_base_port, cfg.instances + 1, &mut taken)?;
    let dns = control.pop().expect("scan returned the requested count");

    let map = PortMap {
        socks,
        control,
        dns,
        lb_front: cfg.lb_front_port,
        filter_listen,
    };
    if !map.is_disjoint() {
        return Err(SupervisorError::PortUnavailable {
            base: cfg.socks_base_port,
            scanned: SCAN_LIMIT,
        });
    }
    Ok(map)
}

fn ensure_explicit_free(port: u16) -> Result<(), SupervisorError> {
    if port_free(port) {
        Ok(())
    } else {
        Err(SupervisorError::ExplicitPortTaken { port })
    }
}

fn scan(base: u16, count: usize, taken: &mut HashSet<u16>) -> Result<Vec<u16>, SupervisorError> {
    let mut found = Vec::with_capacity(count);
    let mut offset: u16 = 0;
    while found.len() < count {
        if offset >= SCAN_LIMIT {
            return Err(SupervisorError::PortUnavailable {
                base,
                scanned: SCAN_LIMIT,
            });
        }
        let candidate = base.checked_add(offset).ok_or(SupervisorError::PortUnavailable {
            base,
            scanned: offset,
        })?;
        offset += 1;
        if taken.contains(&candidate) {
            continue;
        }
        if port_free(candidate) {
            taken.insert(candidate);
            found.push(candidate);
        }
    }
    Ok(found)
}

fn port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
