//! Allocation of scarce numeric resources.
//!
//! - [`RulePriorityAllocator`]: policy rule priorities for floating IPs.
//! - [`ItemAllocator`] / [`LocalSubnetPool`]: keyed leases of /31 link-local
//!   subnets, remembered across restarts through an optional state file.
//! - [`snat_table_index`]: deterministic routing table index of a subnet.

use common::{Error, Result};
use ipnetwork::{IpNetwork, Ipv4Network};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// First priority handed out for floating IP rules.
pub const FIP_PR_START: u32 = 32768;
/// End (exclusive) of the floating IP rule priority range.
pub const FIP_PR_END: u32 = FIP_PR_START + 40000;

/// Link-local range carved into router-to-FIP point-to-point subnets.
pub const FIP_LL_SUBNET: &str = "169.254.30.0/23";

/// Table indices below this value belong to the kernel and system tooling.
pub const SYSTEM_TABLE_LIMIT: u32 = 32768;

/// XOR-folding mask used for IPv6 table indices.
const MASK_30: u32 = 0x3fff_ffff;

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Allocates rule priorities from `[start, end)`.
///
/// The lowest free priority is always handed out first. Only priorities
/// below the high-water mark are tracked, so memory follows the number of
/// priorities in use rather than the width of the range.
#[derive(Debug)]
pub struct RulePriorityAllocator {
    start: u32,
    end: u32,
    pool: Mutex<PriorityPool>,
}

#[derive(Debug)]
struct PriorityPool {
    /// Every priority at or above this one is free.
    next: u32,
    /// Released priorities below `next`.
    released: BTreeSet<u32>,
}

impl RulePriorityAllocator {
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start,
            end,
            pool: Mutex::new(PriorityPool {
                next: start,
                released: BTreeSet::new(),
            }),
        }
    }

    /// Take a free priority.
    pub fn allocate(&self) -> Result<u32> {
        let mut pool = lock(&self.pool);
        if let Some(priority) = pool.released.pop_first() {
            return Ok(priority);
        }
        if pool.next >= self.end {
            return Err(Error::exhausted("rule priority pool"));
        }
        let priority = pool.next;
        pool.next += 1;
        Ok(priority)
    }

    /// Return `priority` to the pool.
    pub fn deallocate(&self, priority: u32) {
        if !(self.start..self.end).contains(&priority) {
            warn!(priority, "Ignoring release of priority outside of pool");
            return;
        }
        let mut pool = lock(&self.pool);
        if priority >= pool.next || !pool.released.insert(priority) {
            warn!(priority, "Rule priority released twice");
            return;
        }
        // Lower the mark over the free tail.
        while pool.next > self.start {
            let top = pool.next - 1;
            if !pool.released.remove(&top) {
                break;
            }
            pool.next = top;
        }
    }

    /// Number of priorities currently handed out.
    pub fn in_use(&self) -> usize {
        let pool = lock(&self.pool);
        (pool.next - self.start) as usize - pool.released.len()
    }
}

impl Default for RulePriorityAllocator {
    fn default() -> Self {
        Self::new(FIP_PR_START, FIP_PR_END)
    }
}

/// Keyed allocator over a finite pool of items.
///
/// Allocations are written to `state_file` as `key,value` lines. Entries read
/// back at start-up are "remembered": the same key gets its old item back,
/// and remembered items are only reclaimed once the free pool runs dry.
#[derive(Debug)]
pub struct ItemAllocator<T> {
    state_file: Option<PathBuf>,
    pool: BTreeSet<T>,
    allocations: HashMap<String, T>,
    remembered: HashMap<String, T>,
}

impl<T> ItemAllocator<T>
where
    T: Ord + Clone + fmt::Display + FromStr,
{
    pub fn new(state_file: Option<PathBuf>, pool: BTreeSet<T>) -> Self {
        let mut allocator = Self {
            state_file,
            pool,
            allocations: HashMap::new(),
            remembered: HashMap::new(),
        };

        for (key, item) in allocator.read() {
            if allocator.pool.remove(&item) {
                allocator.remembered.insert(key, item);
            } else {
                warn!(key = %key, item = %item, "Discarding remembered item outside of pool");
            }
        }

        allocator
    }

    /// Item currently allocated to `key`.
    pub fn get(&self, key: &str) -> Option<&T> {
        self.allocations.get(key)
    }

    /// Allocate an item for `key`, returning the existing one if present.
    pub fn allocate(&mut self, key: &str) -> Result<T> {
        if let Some(item) = self.allocations.get(key) {
            return Ok(item.clone());
        }

        if let Some(item) = self.remembered.remove(key) {
            debug!(key, item = %item, "Reusing remembered allocation");
            self.allocations.insert(key.to_string(), item.clone());
            return Ok(item);
        }

        if self.pool.is_empty() {
            if self.remembered.is_empty() {
                return Err(Error::exhausted("item pool"));
            }
            info!(
                count = self.remembered.len(),
                "Pool exhausted, reclaiming remembered allocations"
            );
            self.pool.extend(self.remembered.drain().map(|(_, item)| item));
        }

        let item = self
            .pool
            .pop_first()
            .ok_or_else(|| Error::exhausted("item pool"))?;
        self.allocations.insert(key.to_string(), item.clone());
        self.write();
        Ok(item)
    }

    /// Release the allocation of `key`; unknown keys are ignored.
    pub fn release(&mut self, key: &str) {
        if let Some(item) = self.allocations.remove(key) {
            self.pool.insert(item);
            self.write();
        }
    }

    pub fn allocations(&self) -> &HashMap<String, T> {
        &self.allocations
    }

    pub fn remembered(&self) -> &HashMap<String, T> {
        &self.remembered
    }

    fn read(&self) -> Vec<(String, T)> {
        let Some(path) = self.state_file.as_deref() else {
            return Vec::new();
        };
        match std::fs::read_to_string(path) {
            Ok(contents) => parse_state(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read allocator state");
                Vec::new()
            }
        }
    }

    fn write(&self) {
        let Some(path) = self.state_file.as_deref() else {
            return;
        };
        let mut lines: Vec<String> = self
            .allocations
            .iter()
            .map(|(key, item)| format!("{},{}\n", key, item))
            .collect();
        lines.sort();
        if let Err(e) = write_state(path, &lines.concat()) {
            warn!(path = %path.display(), error = %e, "Failed to persist allocator state");
        }
    }
}

fn parse_state<T: FromStr>(contents: &str) -> Vec<(String, T)> {
    contents
        .lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once(',')?;
            let item = value.trim().parse().ok()?;
            Some((key.trim().to_string(), item))
        })
        .collect()
}

fn write_state(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, contents)
}

/// A /31 link-local subnet identified by its base address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkLocalSubnet(Ipv4Addr);

impl LinkLocalSubnet {
    /// Router-side address of the link.
    pub fn near(&self) -> Ipv4Network {
        Self::host(self.0)
    }

    /// FIP-namespace-side address of the link.
    pub fn far(&self) -> Ipv4Network {
        Self::host(Ipv4Addr::from(u32::from(self.0) + 1))
    }

    fn host(ip: Ipv4Addr) -> Ipv4Network {
        // /31 is always a valid prefix length.
        Ipv4Network::new(ip, 31).unwrap_or_else(|_| Ipv4Network::from(ip))
    }
}

impl fmt::Display for LinkLocalSubnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/31", self.0)
    }
}

impl FromStr for LinkLocalSubnet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let net: Ipv4Network = s
            .parse()
            .map_err(|e| Error::config(format!("invalid link-local subnet {}: {}", s, e)))?;
        if net.prefix() != 31 {
            return Err(Error::config(format!("{} is not a /31", s)));
        }
        Ok(Self(net.network()))
    }
}

/// Point-to-point subnet leased to one router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkLocalLease {
    pub subnet: LinkLocalSubnet,
}

impl LinkLocalLease {
    /// `(router side, FIP namespace side)` addresses of the link.
    pub fn pair(&self) -> (Ipv4Network, Ipv4Network) {
        (self.subnet.near(), self.subnet.far())
    }
}

/// Pool of /31 subnets leased to routers, one lease per router.
#[derive(Debug)]
pub struct LocalSubnetPool {
    inner: Mutex<ItemAllocator<LinkLocalSubnet>>,
}

impl LocalSubnetPool {
    /// Split `cidr` into /31 subnets.
    pub fn new(cidr: Ipv4Network, state_file: Option<PathBuf>) -> Result<Self> {
        if cidr.prefix() > 31 {
            return Err(Error::config(format!(
                "link-local range {} is too small for /31 subnets",
                cidr
            )));
        }
        let base = u32::from(cidr.network());
        let size = 1u64 << (32 - cidr.prefix());
        let pool = (0..size)
            .step_by(2)
            .map(|offset| LinkLocalSubnet(Ipv4Addr::from(base + offset as u32)))
            .collect();

        Ok(Self {
            inner: Mutex::new(ItemAllocator::new(state_file, pool)),
        })
    }

    /// Lease a subnet to `router_id`; an existing lease is returned as is.
    pub fn lease(&self, router_id: &str) -> Result<LinkLocalLease> {
        let subnet = lock(&self.inner).allocate(router_id)?;
        Ok(LinkLocalLease { subnet })
    }

    /// Release the lease of `router_id`, if any.
    pub fn release(&self, router_id: &str) {
        lock(&self.inner).release(router_id);
    }

    /// Current lease of `router_id`.
    pub fn get(&self, router_id: &str) -> Option<LinkLocalLease> {
        lock(&self.inner)
            .get(router_id)
            .map(|subnet| LinkLocalLease { subnet: *subnet })
    }
}

/// Routing table index (and rule priority) for SNAT redirection of a subnet.
///
/// IPv4 subnets use the integer value of their network address. IPv6 subnets
/// use the CRC32 of the network's textual form, XOR-folded to 30 bits. Values
/// that would fall into the system range are lifted by the 30-bit mask.
pub fn snat_table_index(cidr: &IpNetwork) -> u32 {
    let index = match cidr {
        IpNetwork::V4(net) => u32::from(net.network()),
        IpNetwork::V6(net) => {
            let canonical = format!("{}/{}", net.network(), net.prefix());
            let hash = CRC32.checksum(canonical.as_bytes());
            (hash >> 30) ^ (hash & MASK_30)
        }
    };

    if index < SYSTEM_TABLE_LIMIT {
        index + MASK_30
    } else {
        index
    }
}
