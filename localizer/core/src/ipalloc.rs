//! Loopback address allocation.
//!
//! Each forwarded service gets a dedicated address out of a configured CIDR
//! (default `127.0.0.1/8`). On macOS the address must also be aliased onto
//! `lo0` before anything can bind to it; Linux routes the whole `127/8` out
//! of the box, so the alias step is skipped there.

use std::net::{IpAddr, Ipv4Addr};

use ahash::AHashSet;
use ipnet::Ipv4Net;
use parking_lot::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("address pool {0} is exhausted")]
    Exhausted(Ipv4Net),

    #[error("{0} is outside the configured pool {1}")]
    OutOfRange(Ipv4Addr, Ipv4Net),

    #[error("{0} is already allocated")]
    InUse(Ipv4Addr),

    #[error("failed to {verb} loopback alias for {ip}: {message}")]
    Alias {
        verb: &'static str,
        ip: Ipv4Addr,
        message: String,
    },
}

/// Controls whether acquiring an address also manages an OS-level interface
/// alias for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasMode {
    /// Alias on platforms that need it (macOS), skip elsewhere.
    Auto,
    /// Never touch the interface. For tests and constrained environments.
    Disabled,
}

#[derive(Debug, Default)]
struct Pool {
    next: u32,
    freed: Vec<Ipv4Addr>,
    in_use: AHashSet<Ipv4Addr>,
}

/// A thread-safe allocator over an IPv4 CIDR.
///
/// Released addresses are recycled before the cursor advances, so a
/// release-then-acquire for the same service tends to hand back the same
/// address.
pub struct IpAllocator {
    net: Ipv4Net,
    alias: AliasMode,
    pool: Mutex<Pool>,
}

impl IpAllocator {
    pub fn new(net: Ipv4Net, alias: AliasMode) -> Self {
        Self {
            net,
            alias,
            pool: Mutex::new(Pool {
                // Skip the network address itself.
                next: 1,
                ..Pool::default()
            }),
        }
    }

    /// The pool this allocator hands addresses out of.
    pub fn cidr(&self) -> Ipv4Net {
        self.net
    }

    /// Whether `ip` falls inside the pool.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.net.contains(&ip)
    }

    /// Reserves the next free address and installs its alias if the platform
    /// needs one. Failures are surfaced to the caller and not retried.
    pub async fn acquire(&self) -> Result<Ipv4Addr, AllocError> {
        let ip = self.grab()?;
        if let Err(err) = self.install_alias(ip).await {
            self.free(ip);
            return Err(err);
        }
        Ok(ip)
    }

    /// Reserves a specific address without touching the interface. Used at
    /// startup to keep `127.0.0.1` out of circulation.
    pub fn acquire_specific(&self, ip: Ipv4Addr) -> Result<(), AllocError> {
        if !self.net.contains(&ip) {
            return Err(AllocError::OutOfRange(ip, self.net));
        }

        let mut pool = self.pool.lock();
        if !pool.in_use.insert(ip) {
            return Err(AllocError::InUse(ip));
        }
        pool.freed.retain(|freed| *freed != ip);
        Ok(())
    }

    /// Returns `ip` to the pool, removing its alias first. The address is
    /// freed even when the alias removal fails; the error is reported so the
    /// caller can log it without aborting the rest of its cleanup.
    pub async fn release(&self, ip: Ipv4Addr) -> Result<(), AllocError> {
        let alias_result = self.remove_alias(ip).await;
        self.free(ip);
        alias_result
    }

    fn grab(&self) -> Result<Ipv4Addr, AllocError> {
        let mut pool = self.pool.lock();

        if let Some(ip) = pool.freed.pop() {
            pool.in_use.insert(ip);
            return Ok(ip);
        }

        let base = u32::from(self.net.network());
        loop {
            let offset = pool.next;
            let candidate = Ipv4Addr::from(base.wrapping_add(offset));
            if !self.net.contains(&candidate) {
                return Err(AllocError::Exhausted(self.net));
            }
            pool.next += 1;

            // The broadcast address is never usable as a host address.
            if self.net.prefix_len() < 31 && candidate == self.net.broadcast() {
                continue;
            }

            if !pool.in_use.contains(&candidate) {
                pool.in_use.insert(candidate);
                return Ok(candidate);
            }
        }
    }

    fn free(&self, ip: Ipv4Addr) {
        let mut pool = self.pool.lock();
        if pool.in_use.remove(&ip) {
            pool.freed.push(ip);
        }
    }

    async fn install_alias(&self, ip: Ipv4Addr) -> Result<(), AllocError> {
        if !self.platform_needs_alias() {
            return Ok(());
        }
        run_ifconfig(&["lo0", "alias", &ip.to_string(), "up"], "install", ip).await
    }

    async fn remove_alias(&self, ip: Ipv4Addr) -> Result<(), AllocError> {
        if !self.platform_needs_alias() {
            return Ok(());
        }
        run_ifconfig(&["lo0", "-alias", &ip.to_string()], "remove", ip).await
    }

    fn platform_needs_alias(&self) -> bool {
        self.alias == AliasMode::Auto && cfg!(target_os = "macos")
    }
}

async fn run_ifconfig(args: &[&str], verb: &'static str, ip: Ipv4Addr) -> Result<(), AllocError> {
    let output = tokio::process::Command::new("ifconfig")
        .args(args)
        .output()
        .await
        .map_err(|err| AllocError::Alias {
            verb,
            ip,
            message: err.to_string(),
        })?;

    if !output.status.success() {
        return Err(AllocError::Alias {
            verb,
            ip,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}

/// Converts an [`Ipv4Addr`] allocation into the [`IpAddr`] the rest of the
/// daemon traffics in.
pub fn to_ip_addr(ip: Ipv4Addr) -> IpAddr {
    IpAddr::V4(ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn pool(cidr: &str) -> IpAllocator {
        IpAllocator::new(cidr.parse().unwrap(), AliasMode::Disabled)
    }

    #[tokio::test]
    async fn acquires_distinct_addresses() {
        let alloc = pool("127.0.0.1/29");
        let a = alloc.acquire().await.unwrap();
        let b = alloc.acquire().await.unwrap();
        assert_ne!(a, b);
        assert!(alloc.contains(a));
        assert!(alloc.contains(b));
    }

    #[tokio::test]
    async fn never_hands_out_a_reserved_address() {
        let alloc = pool("127.0.0.1/29");
        alloc.acquire_specific("127.0.0.1".parse().unwrap()).unwrap();

        for _ in 0..5 {
            let ip = alloc.acquire().await.unwrap();
            assert_ne!(ip, "127.0.0.1".parse::<Ipv4Addr>().unwrap());
        }
    }

    #[tokio::test]
    async fn concurrent_acquires_are_exclusive() {
        let alloc = Arc::new(pool("127.0.0.0/24"));
        let mut handles = Vec::new();
        for _ in 0..32 {
            let alloc = alloc.clone();
            handles.push(tokio::spawn(async move { alloc.acquire().await.unwrap() }));
        }

        let mut seen = AHashSet::new();
        for handle in handles {
            let ip = handle.await.unwrap();
            assert!(seen.insert(ip), "{ip} was handed out twice");
            assert!(alloc.contains(ip));
        }
    }

    #[tokio::test]
    async fn released_addresses_are_recycled_first() {
        let alloc = pool("127.0.0.1/29");
        let a = alloc.acquire().await.unwrap();
        let _b = alloc.acquire().await.unwrap();

        alloc.release(a).await.unwrap();
        assert_eq!(alloc.acquire().await.unwrap(), a);
    }

    #[tokio::test]
    async fn exhaustion_is_an_error() {
        // A /30 has two usable host addresses between network and broadcast.
        let alloc = pool("127.0.0.0/30");
        alloc.acquire().await.unwrap();
        alloc.acquire().await.unwrap();
        assert!(matches!(
            alloc.acquire().await,
            Err(AllocError::Exhausted(_))
        ));
    }

    #[test]
    fn specific_acquire_rejects_out_of_range_and_duplicates() {
        let alloc = pool("127.0.0.1/29");
        assert!(matches!(
            alloc.acquire_specific("10.0.0.1".parse().unwrap()),
            Err(AllocError::OutOfRange(..))
        ));

        alloc.acquire_specific("127.0.0.2".parse().unwrap()).unwrap();
        assert!(matches!(
            alloc.acquire_specific("127.0.0.2".parse().unwrap()),
            Err(AllocError::InUse(_))
        ));
    }
}
