//! Component G (interface policy) and the packet-info ancillary data the
//! UDP socket layer extracts per datagram.
//!
//! The original keys its interface allow/deny lists off the interface
//! name resolved from `IP_PKTINFO`/`IP_RECVIF`; we keep exactly that
//! shape, with one resolved Open Question: on Linux, `ipi_ifindex == 0`
//! only ever shows up for packets handed to a socket that isn't actually
//! bound to a specific link (loopback delivered via the any-address
//! listener) — we treat it as "no interface restriction applies",
//! matching the kernel's own interpretation, rather than an error.

use std::net::IpAddr;

/// What `recvmsg`'s ancillary data told us about one received datagram:
/// the local address the kernel chose to deliver it on, and which
/// interface it arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub local_addr: IpAddr,
    pub if_index: u32,
}

impl PacketInfo {
    /// See the module note: index 0 means "not tied to a specific link".
    pub fn has_specific_interface(&self) -> bool {
        self.if_index != 0
    }
}

/// Interface/address policy, mirroring `--interface`/`--listen-address`/
/// `--except-interface`: a query is accepted when its interface name is
/// in `names`, or its destination address is in `addrs`, and is always
/// rejected when its interface name is in `except` regardless of the
/// other two lists. Both `names` and `addrs` empty means "no restriction".
#[derive(Debug, Clone, Default)]
pub struct InterfacePolicy {
    names: Vec<String>,
    addrs: Vec<IpAddr>,
    except: Vec<String>,
}

impl InterfacePolicy {
    pub fn new(names: Vec<String>, addrs: Vec<IpAddr>, except: Vec<String>) -> Self {
        Self { names, addrs, except }
    }

    /// Whether a query arriving on interface `name` (`None` if it could
    /// not be resolved) bound for `dest` should be served at all.
    pub fn permits(&self, name: Option<&str>, dest: IpAddr) -> bool {
        if let Some(name) = name {
            if self.except.iter().any(|d| d == name) {
                return false;
            }
        }
        if self.names.is_empty() && self.addrs.is_empty() {
            return true;
        }
        let name_matches = name.is_some_and(|n| self.names.iter().any(|a| a == n));
        let addr_matches = self.addrs.iter().any(|a| *a == dest);
        name_matches || addr_matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(octets: [u8; 4]) -> IpAddr {
        IpAddr::from(octets)
    }

    #[test]
    fn zero_index_has_no_specific_interface() {
        let info = PacketInfo {
            local_addr: "127.0.0.1".parse().unwrap(),
            if_index: 0,
        };
        assert!(!info.has_specific_interface());
    }

    #[test]
    fn empty_lists_permit_everything_not_excepted() {
        let policy = InterfacePolicy::new(vec![], vec![], vec!["eth1".into()]);
        assert!(policy.permits(Some("eth0"), v4([10, 0, 0, 1])));
        assert!(!policy.permits(Some("eth1"), v4([10, 0, 0, 1])));
    }

    #[test]
    fn except_overrides_names() {
        let policy = InterfacePolicy::new(vec!["eth0".into()], vec![], vec!["eth0".into()]);
        assert!(!policy.permits(Some("eth0"), v4([10, 0, 0, 1])));
    }

    #[test]
    fn nonempty_names_list_excludes_unlisted() {
        let policy = InterfacePolicy::new(vec!["eth0".into()], vec![], vec![]);
        assert!(policy.permits(Some("eth0"), v4([10, 0, 0, 1])));
        assert!(!policy.permits(Some("eth1"), v4([10, 0, 0, 1])));
    }

    #[test]
    fn destination_address_permits_independent_of_interface_name() {
        let policy = InterfacePolicy::new(vec![], vec![v4([10, 0, 0, 1])], vec![]);
        assert!(policy.permits(None, v4([10, 0, 0, 1])));
        assert!(!policy.permits(None, v4([10, 0, 0, 2])));
        // An interface name that doesn't match `names` still passes
        // because the destination address matches `addrs`.
        assert!(policy.permits(Some("eth9"), v4([10, 0, 0, 1])));
    }

    #[test]
    fn unresolved_interface_name_does_not_trigger_except() {
        let policy = InterfacePolicy::new(vec![], vec![], vec!["eth1".into()]);
        assert!(policy.permits(None, v4([10, 0, 0, 1])));
    }
}
