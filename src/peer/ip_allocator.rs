//! Client IP allocator
//!
//! Hands out client addresses from the configured network in ascending
//! order, returning the first host address not already in use.
//!
//! # Usage set
//!
//! The set of used addresses is the union of addresses found in the
//! persistent peer-config file and addresses recorded on subscription rows.
//! It is seeded once when the lifecycle worker starts and then maintained
//! incrementally: an allocation marks the address before the caller
//! provisions or persists anything, so two requests can never observe the
//! same free address.
//!
//! The network address and broadcast address are never allocated.

use std::collections::HashSet;
use std::net::Ipv4Addr;

/// Default client network
pub const DEFAULT_CLIENT_NETWORK: &str = "10.0.0.0/24";

/// Error types for IP allocation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IpAllocatorError {
    /// No IPs available
    #[error("No available IP addresses in subnet")]
    Exhausted,

    /// IP is already allocated
    #[error("IP address {0} is already allocated")]
    AlreadyAllocated(Ipv4Addr),

    /// IP is reserved (network or broadcast)
    #[error("IP address {0} is reserved")]
    Reserved(Ipv4Addr),

    /// IP is not in subnet
    #[error("IP address {0} is not in configured subnet")]
    OutOfSubnet(Ipv4Addr),

    /// Invalid subnet format
    #[error("Invalid subnet format: {0}")]
    InvalidSubnet(String),
}

/// Client IP allocator
///
/// Owned by the lifecycle worker; every method that changes the usage set
/// takes `&mut self`.
#[derive(Debug, Clone)]
pub struct ClientIpAllocator {
    /// Base network address
    network: Ipv4Addr,
    /// Subnet mask (number of bits)
    prefix_len: u8,
    /// Currently used IPs
    allocated: HashSet<Ipv4Addr>,
}

impl ClientIpAllocator {
    /// Create an allocator for the given network
    ///
    /// ```
    /// use wg_provisioner::peer::ip_allocator::ClientIpAllocator;
    ///
    /// let mut allocator = ClientIpAllocator::new("10.0.0.0/24").unwrap();
    /// assert_eq!(allocator.allocate().unwrap().to_string(), "10.0.0.1");
    /// ```
    pub fn new(subnet: &str) -> Result<Self, IpAllocatorError> {
        let (network, prefix_len) = parse_subnet(subnet)?;
        Ok(Self {
            network,
            prefix_len,
            allocated: HashSet::new(),
        })
    }

    fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            !0u32 << (32 - self.prefix_len)
        }
    }

    /// Check if an IP is in the configured subnet
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = self.mask();
        (u32::from(ip) & mask) == (u32::from(self.network) & mask)
    }

    /// Check if an IP is the network or broadcast address of this subnet
    #[must_use]
    pub fn is_reserved(&self, ip: Ipv4Addr) -> bool {
        let mask = self.mask();
        let network_addr = u32::from(self.network) & mask;
        let broadcast_addr = network_addr | !mask;
        let ip_bits = u32::from(ip);

        ip_bits == network_addr || ip_bits == broadcast_addr
    }

    /// Mark addresses that are already in use
    ///
    /// Addresses outside the subnet are ignored. Returns how many
    /// addresses were newly marked.
    pub fn seed<I>(&mut self, used: I) -> usize
    where
        I: IntoIterator<Item = Ipv4Addr>,
    {
        let mut marked = 0;
        for ip in used {
            if self.contains(ip) && self.allocated.insert(ip) {
                marked += 1;
            }
        }
        marked
    }

    /// Allocate the lowest free host address
    pub fn allocate(&mut self) -> Result<Ipv4Addr, IpAllocatorError> {
        let mask = self.mask();
        let network_bits = u32::from(self.network) & mask;
        let host_mask = !mask;

        for host_part in 1..host_mask {
            let ip = Ipv4Addr::from(network_bits | host_part);
            if !self.allocated.contains(&ip) {
                self.allocated.insert(ip);
                return Ok(ip);
            }
        }

        Err(IpAllocatorError::Exhausted)
    }

    /// Allocate a specific IP address
    pub fn allocate_specific(&mut self, ip: Ipv4Addr) -> Result<(), IpAllocatorError> {
        if !self.contains(ip) {
            return Err(IpAllocatorError::OutOfSubnet(ip));
        }
        if self.is_reserved(ip) {
            return Err(IpAllocatorError::Reserved(ip));
        }
        if !self.allocated.insert(ip) {
            return Err(IpAllocatorError::AlreadyAllocated(ip));
        }
        Ok(())
    }

    /// Release an address back to the pool
    pub fn release(&mut self, ip: Ipv4Addr) -> bool {
        self.allocated.remove(&ip)
    }

    /// Check if an IP is currently in use
    #[must_use]
    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        self.allocated.contains(&ip)
    }

    /// Number of used addresses
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    /// Number of free host addresses
    #[must_use]
    pub fn available_count(&self) -> usize {
        let total = (!self.mask()).saturating_sub(1) as usize;
        let used = self
            .allocated
            .iter()
            .filter(|ip| !self.is_reserved(**ip))
            .count();
        total.saturating_sub(used)
    }

    /// Get the subnet in CIDR notation
    #[must_use]
    pub fn subnet(&self) -> String {
        format!("{}/{}", self.network, self.prefix_len)
    }
}

/// Parse a subnet string in CIDR notation
pub fn parse_subnet(subnet: &str) -> Result<(Ipv4Addr, u8), IpAllocatorError> {
    let (ip, prefix) = subnet
        .split_once('/')
        .ok_or_else(|| IpAllocatorError::InvalidSubnet(subnet.to_string()))?;

    let ip: Ipv4Addr = ip
        .trim()
        .parse()
        .map_err(|_| IpAllocatorError::InvalidSubnet(subnet.to_string()))?;
    let prefix_len: u8 = prefix
        .trim()
        .parse()
        .map_err(|_| IpAllocatorError::InvalidSubnet(subnet.to_string()))?;

    // /31 and /32 leave no host addresses once network and broadcast are excluded
    if prefix_len > 30 {
        return Err(IpAllocatorError::InvalidSubnet(subnet.to_string()));
    }

    Ok((ip, prefix_len))
}
