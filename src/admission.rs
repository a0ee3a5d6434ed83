//! Connection controller (spec §3, §4.1): global and per-remote-IP
//! admission caps, checked-and-incremented atomically so that
//! `globalCount <= maxGlobal` and `perIpCount[ip] <= maxPerIp` hold at all
//! times (spec §8 quantified invariant).
//!
//! Grounded on the `dashmap`-backed counter maps used throughout the pack
//! (e.g. `geofront`'s connection tracking, `pks-os-neon/proxy`'s
//! per-endpoint limiters) rather than on a teacher file directly: the
//! teacher (`proxy-server`) has no admission cap of its own to generalize
//! from, since it is a SOCKS proxy with no such control, so this component
//! is built fresh in the pack's idiom.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// An RAII admission permit. Dropping it releases the global and per-IP
/// counters, which keeps the "decrement on close" step (spec §4.3) from
/// ever being forgotten on an error path.
pub struct AdmissionPermit {
    controller: Arc<ConnectionControllerInner>,
    ip: IpAddr,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release(self.ip);
    }
}

struct ConnectionControllerInner {
    max_global: Option<usize>,
    max_per_ip: Option<usize>,
    global_count: AtomicUsize,
    per_ip_count: DashMap<IpAddr, usize>,
}

impl ConnectionControllerInner {
    fn release(&self, ip: IpAddr) {
        self.global_count.fetch_sub(1, Ordering::SeqCst);
        if let Some(mut entry) = self.per_ip_count.get_mut(&ip) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                drop(entry);
                self.per_ip_count.remove(&ip);
            }
        }
    }
}

#[derive(Clone)]
pub struct ConnectionController {
    inner: Arc<ConnectionControllerInner>,
}

impl ConnectionController {
    pub fn new(max_global: Option<usize>, max_per_ip: Option<usize>) -> Self {
        ConnectionController {
            inner: Arc::new(ConnectionControllerInner {
                max_global,
                max_per_ip,
                global_count: AtomicUsize::new(0),
                per_ip_count: DashMap::new(),
            }),
        }
    }

    /// Attempts to admit a new connection from `ip`. On success returns a
    /// permit that must be held for the connection's lifetime and dropped
    /// on close. On rejection, neither counter is mutated (spec §4.1: a
    /// rejected connection doesn't consume capacity).
    pub fn try_admit(&self, ip: IpAddr) -> Result<AdmissionPermit, AdmissionError> {
        if let Some(max_global) = self.inner.max_global {
            if max_global == 0 {
                return Err(AdmissionError::GlobalCapExceeded);
            }
        }
        if let Some(max_per_ip) = self.inner.max_per_ip {
            if max_per_ip == 0 {
                return Err(AdmissionError::PerIpCapExceeded);
            }
        }

        // Reserve the global slot first; if the per-IP cap then rejects,
        // back the global reservation out before returning.
        let global_after = self.inner.global_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(max_global) = self.inner.max_global {
            if global_after > max_global {
                self.inner.global_count.fetch_sub(1, Ordering::SeqCst);
                return Err(AdmissionError::GlobalCapExceeded);
            }
        }

        let mut entry = self.inner.per_ip_count.entry(ip).or_insert(0);
        *entry += 1;
        let per_ip_after = *entry;
        drop(entry);

        if let Some(max_per_ip) = self.inner.max_per_ip {
            if per_ip_after > max_per_ip {
                self.inner.global_count.fetch_sub(1, Ordering::SeqCst);
                if let Some(mut e) = self.inner.per_ip_count.get_mut(&ip) {
                    *e = e.saturating_sub(1);
                }
                return Err(AdmissionError::PerIpCapExceeded);
            }
        }

        Ok(AdmissionPermit {
            controller: self.inner.clone(),
            ip,
        })
    }

    pub fn global_count(&self) -> usize {
        self.inner.global_count.load(Ordering::SeqCst)
    }

    pub fn per_ip_count(&self, ip: IpAddr) -> usize {
        self.inner
            .per_ip_count
            .get(&ip)
            .map(|e| *e)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("global connection cap exceeded")]
    GlobalCapExceeded,
    #[error("per-IP connection cap exceeded")]
    PerIpCapExceeded,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(n: u8) -> IpAddr {
        IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, n))
    }

    #[test]
    fn zero_global_cap_rejects_everything() {
        let c = ConnectionController::new(Some(0), None);
        assert!(c.try_admit(ip(1)).is_err());
    }

    #[test]
    fn global_cap_admits_exactly_n() {
        let c = ConnectionController::new(Some(2), None);
        let a = c.try_admit(ip(1)).unwrap();
        let b = c.try_admit(ip(2)).unwrap();
        assert!(c.try_admit(ip(3)).is_err());
        assert_eq!(c.global_count(), 2);
        drop(a);
        assert_eq!(c.global_count(), 1);
        let _c = c.try_admit(ip(4)).unwrap();
        drop(b);
    }

    #[test]
    fn per_ip_cap_is_independent_of_global() {
        let c = ConnectionController::new(Some(10), Some(1));
        let _a = c.try_admit(ip(1)).unwrap();
        assert!(c.try_admit(ip(1)).is_err());
        assert!(c.try_admit(ip(2)).is_ok());
    }

    #[test]
    fn releasing_decrements_per_ip_to_zero_and_removes_entry() {
        let c = ConnectionController::new(None, Some(1));
        let permit = c.try_admit(ip(9)).unwrap();
        assert_eq!(c.per_ip_count(ip(9)), 1);
        drop(permit);
        assert_eq!(c.per_ip_count(ip(9)), 0);
    }
}
