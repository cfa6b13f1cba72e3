// Copyright (c) 2024 Botho Foundation

//! Client connection caps.
//!
//! The listener refuses a client once the relay holds `max_total` client
//! connections, or once the client's IP address holds `max_per_ip`. The
//! per-IP cap keeps one host from occupying the whole anonymity set.

use parking_lot::RwLock;
use std::{collections::HashMap, net::IpAddr};
use thiserror::Error;
use tracing::debug;

/// Connection refused by a cap.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LimitExceeded {
    /// The relay-wide cap is reached.
    #[error("connection limit reached: {current} connections (max: {max})")]
    Total {
        /// Current number of connections.
        current: usize,
        /// Relay-wide maximum.
        max: usize,
    },

    /// The cap for one IP address is reached.
    #[error("connection limit exceeded for {ip}: {current} connections (max: {max})")]
    PerIp {
        /// The IP address that was refused.
        ip: IpAddr,
        /// Current number of connections from this IP.
        current: u32,
        /// Maximum per IP.
        max: u32,
    },
}

#[derive(Debug, Default)]
struct Counts {
    total: usize,
    per_ip: HashMap<IpAddr, u32>,
}

/// Global and per-IP connection limiter.
#[derive(Debug)]
pub struct ConnectionLimiter {
    /// Maximum connections overall.
    max_total: usize,
    /// Maximum connections per IP address (0 = unlimited).
    max_per_ip: u32,
    counts: RwLock<Counts>,
}

impl ConnectionLimiter {
    /// Create a limiter.
    ///
    /// # Arguments
    ///
    /// * `max_total` - Maximum client connections of the relay
    /// * `max_per_ip` - Maximum connections per IP (0 = unlimited)
    pub fn new(max_total: usize, max_per_ip: u32) -> Self {
        Self {
            max_total,
            max_per_ip,
            counts: RwLock::new(Counts::default()),
        }
    }

    /// Current connection count for an IP address.
    pub fn connection_count(&self, ip: &IpAddr) -> u32 {
        self.counts.read().per_ip.get(ip).copied().unwrap_or(0)
    }

    /// Total number of tracked connections.
    pub fn total_connections(&self) -> usize {
        self.counts.read().total
    }

    /// Number of distinct IPs with active connections.
    pub fn unique_ips(&self) -> usize {
        self.counts.read().per_ip.len()
    }

    /// Try to register a new connection from `ip`.
    pub fn try_connect(&self, ip: IpAddr) -> Result<(), LimitExceeded> {
        let mut counts = self.counts.write();
        if counts.total >= self.max_total {
            debug!(%ip, current = counts.total, max = self.max_total, "Connection refused: relay full");
            return Err(LimitExceeded::Total {
                current: counts.total,
                max: self.max_total,
            });
        }

        let count = counts.per_ip.entry(ip).or_insert(0);
        if self.max_per_ip != 0 && *count >= self.max_per_ip {
            let current = *count;
            debug!(%ip, current, max = self.max_per_ip, "Connection refused: IP limit exceeded");
            return Err(LimitExceeded::PerIp {
                ip,
                current,
                max: self.max_per_ip,
            });
        }

        *count += 1;
        counts.total += 1;
        Ok(())
    }

    /// Register a disconnection from `ip`.
    pub fn disconnect(&self, ip: &IpAddr) {
        let mut counts = self.counts.write();
        let Some(count) = counts.per_ip.get_mut(ip) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.per_ip.remove(ip);
        }
        counts.total = counts.total.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_per_ip_limit_enforced() {
        let limiter = ConnectionLimiter::new(100, 2);
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));

        assert!(limiter.try_connect(ip).is_ok());
        assert!(limiter.try_connect(ip).is_ok());
        assert_eq!(limiter.connection_count(&ip), 2);

        assert_eq!(
            limiter.try_connect(ip),
            Err(LimitExceeded::PerIp {
                ip,
                current: 2,
                max: 2
            })
        );
    }

    #[test]
    fn test_total_limit_enforced() {
        let limiter = ConnectionLimiter::new(2, 0);
        let ip1 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let ip2 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        limiter.try_connect(ip1).unwrap();
        limiter.try_connect(ip2).unwrap();
        assert_eq!(
            limiter.try_connect(ip1),
            Err(LimitExceeded::Total { current: 2, max: 2 })
        );

        limiter.disconnect(&ip2);
        assert!(limiter.try_connect(ip1).is_ok());
    }

    #[test]
    fn test_unlimited_per_ip() {
        let limiter = ConnectionLimiter::new(1000, 0);
        let ip = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));
        for _ in 0..100 {
            assert!(limiter.try_connect(ip).is_ok());
        }
        assert_eq!(limiter.total_connections(), 100);
    }

    #[test]
    fn test_cleanup_on_disconnect() {
        let limiter = ConnectionLimiter::new(10, 10);
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        limiter.try_connect(ip).unwrap();
        assert_eq!(limiter.unique_ips(), 1);

        limiter.disconnect(&ip);
        assert_eq!(limiter.unique_ips(), 0);
        assert_eq!(limiter.total_connections(), 0);

        // Unknown IP is ignored
        limiter.disconnect(&ip);
        assert_eq!(limiter.total_connections(), 0);
    }

    #[test]
    fn test_error_display() {
        let err = LimitExceeded::PerIp {
            ip: IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
            current: 5,
            max: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("1.2.3.4"));
        assert!(msg.contains("max: 5"));
    }
}
