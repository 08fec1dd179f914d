//! VPN address allocation.
//!
//! Addresses are drawn from a single IPv4 subnet. The allocator is
//! stateless: callers pass the addresses already in use, and the lowest
//! free host address wins. Two callers racing on the same snapshot would
//! pick the same address, so allocation must happen under the caller's
//! lifecycle lock.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{Result, WireGuardError};

/// Picks free host addresses inside the VPN subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressAllocator {
    subnet: Ipv4Net,
    server_address: Ipv4Addr,
}

impl AddressAllocator {
    /// Creates an allocator for `subnet`, reserving `server_address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server address lies outside the subnet.
    pub fn new(subnet: Ipv4Net, server_address: Ipv4Addr) -> Result<Self> {
        let subnet = subnet.trunc();
        if !subnet.contains(&server_address) {
            return Err(WireGuardError::InvalidConfig(format!(
                "server address {server_address} is outside {subnet}"
            )));
        }
        Ok(Self {
            subnet,
            server_address,
        })
    }

    /// Parses the subnet from CIDR notation, e.g. `10.0.0.0/24`.
    ///
    /// # Errors
    ///
    /// Returns an error if the CIDR is invalid or does not contain the
    /// server address.
    pub fn from_cidr(cidr: &str, server_address: Ipv4Addr) -> Result<Self> {
        let subnet = cidr
            .parse::<Ipv4Net>()
            .map_err(|e| WireGuardError::InvalidCidr(format!("{cidr}: {e}")))?;
        Self::new(subnet, server_address)
    }

    /// The managed subnet.
    #[must_use]
    pub const fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    /// The address reserved for the server.
    #[must_use]
    pub const fn server_address(&self) -> Ipv4Addr {
        self.server_address
    }

    /// Returns the lowest host address not in `existing`.
    ///
    /// Network, broadcast and server addresses are never returned.
    ///
    /// # Errors
    ///
    /// Returns [`WireGuardError::AddressSpaceExhausted`] when every host
    /// address is taken.
    pub fn next_address(&self, existing: &HashSet<Ipv4Addr>) -> Result<Ipv4Addr> {
        let network = self.subnet.network();
        let broadcast = self.subnet.broadcast();
        self.subnet
            .hosts()
            .filter(|addr| *addr != network && *addr != broadcast)
            .find(|addr| *addr != self.server_address && !existing.contains(addr))
            .ok_or_else(|| WireGuardError::AddressSpaceExhausted {
                subnet: self.subnet.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn allocator(cidr: &str, server: &str) -> AddressAllocator {
        AddressAllocator::from_cidr(cidr, server.parse().expect("ip")).expect("allocator")
    }

    fn set(addrs: &[&str]) -> HashSet<Ipv4Addr> {
        addrs.iter().map(|a| a.parse().expect("ip")).collect()
    }

    #[test]
    fn first_address_skips_network_and_server() {
        let alloc = allocator("10.0.0.0/24", "10.0.0.1");
        let addr = alloc.next_address(&HashSet::new()).expect("allocate");
        assert_eq!(addr, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn lowest_gap_wins() {
        let alloc = allocator("10.0.0.0/24", "10.0.0.1");
        let existing = set(&["10.0.0.2", "10.0.0.3", "10.0.0.5"]);
        let addr = alloc.next_address(&existing).expect("allocate");
        assert_eq!(addr, Ipv4Addr::new(10, 0, 0, 4));
    }

    #[test]
    fn server_in_the_middle_is_skipped() {
        let alloc = allocator("10.0.0.0/29", "10.0.0.3");
        let existing = set(&["10.0.0.1", "10.0.0.2"]);
        let addr = alloc.next_address(&existing).expect("allocate");
        assert_eq!(addr, Ipv4Addr::new(10, 0, 0, 4));
    }

    #[test]
    fn broadcast_is_never_returned() {
        let alloc = allocator("10.0.0.0/29", "10.0.0.1");
        let existing = set(&["10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"]);
        let addr = alloc.next_address(&existing).expect("allocate");
        assert_eq!(addr, Ipv4Addr::new(10, 0, 0, 6));

        let existing = set(&["10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5", "10.0.0.6"]);
        let err = alloc.next_address(&existing).expect_err("exhausted");
        assert!(matches!(err, WireGuardError::AddressSpaceExhausted { .. }));
    }

    #[test]
    fn tiny_subnet_with_only_server_is_exhausted() {
        let alloc = allocator("10.0.0.0/30", "10.0.0.1");
        assert_eq!(
            alloc.next_address(&HashSet::new()).expect("allocate"),
            Ipv4Addr::new(10, 0, 0, 2)
        );
        let err = alloc
            .next_address(&set(&["10.0.0.2"]))
            .expect_err("exhausted");
        assert_eq!(
            err.to_string(),
            "address space exhausted: no free host address left in 10.0.0.0/30"
        );
    }

    #[test]
    fn host_bits_in_cidr_are_truncated() {
        let alloc = allocator("10.0.0.1/24", "10.0.0.1");
        assert_eq!(alloc.subnet().to_string(), "10.0.0.0/24");
    }

    #[test_case("10.0.0.0/24", "10.0.1.1" ; "server outside subnet")]
    #[test_case("10.0.0.0/33", "10.0.0.1" ; "bad prefix")]
    #[test_case("fd00::/64", "10.0.0.1" ; "ipv6 subnet")]
    fn invalid_setup_rejected(cidr: &str, server: &str) {
        let server: Ipv4Addr = server.parse().expect("ip");
        assert!(AddressAllocator::from_cidr(cidr, server).is_err());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn allocation_is_fresh_and_inside_subnet(
                taken in prop::collection::hash_set(2u8..=254, 0..200)
            ) {
                let alloc = allocator("10.0.0.0/24", "10.0.0.1");
                let existing: HashSet<Ipv4Addr> =
                    taken.iter().map(|h| Ipv4Addr::new(10, 0, 0, *h)).collect();
                let addr = alloc.next_address(&existing).expect("space left");
                prop_assert!(!existing.contains(&addr));
                prop_assert!(alloc.subnet().contains(&addr));
                prop_assert_ne!(addr, Ipv4Addr::new(10, 0, 0, 0));
                prop_assert_ne!(addr, Ipv4Addr::new(10, 0, 0, 1));
                prop_assert_ne!(addr, Ipv4Addr::new(10, 0, 0, 255));
                // Nothing lower was free.
                let last = addr.octets()[3];
                for host in 2..last {
                    prop_assert!(existing.contains(&Ipv4Addr::new(10, 0, 0, host)));
                }
            }

            #[test]
            fn sequential_allocation_is_unique(count in 1usize..100) {
                let alloc = allocator("10.0.0.0/24", "10.0.0.1");
                let mut existing = HashSet::new();
                for _ in 0..count {
                    let addr = alloc.next_address(&existing).expect("space left");
                    prop_assert!(existing.insert(addr));
                }
            }
        }
    }
}
