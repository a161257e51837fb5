/// Ordered IPv4 route table with first-match lookup.
///
/// Order is the caller's: routes are never sorted, so a subnet route placed
/// before a default route wins for addresses in that subnet.
use alloc::vec::Vec;
use core::fmt;

use smoltcp::wire::{Ipv4Address, Ipv4Cidr};

use super::NicId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub destination: Ipv4Cidr,
    /// Next hop. `None` for directly attached subnets.
    pub gateway: Option<Ipv4Address>,
    pub nic: NicId,
}

impl Route {
    /// Directly attached subnet; `destination` host bits are cleared.
    pub fn subnet(destination: Ipv4Cidr, nic: NicId) -> Self {
        Self {
            destination: destination.network(),
            gateway: None,
            nic,
        }
    }

    pub fn via(destination: Ipv4Cidr, gateway: Ipv4Address, nic: NicId) -> Self {
        Self {
            destination: destination.network(),
            gateway: Some(gateway),
            nic,
        }
    }

    /// `0.0.0.0/0` through `gateway`.
    pub fn default_via(gateway: Ipv4Address, nic: NicId) -> Self {
        Self::via(Ipv4Cidr::new(Ipv4Address::UNSPECIFIED, 0), gateway, nic)
    }

    pub fn is_default(&self) -> bool {
        self.destination.prefix_len() == 0
    }

    pub fn matches(&self, addr: &Ipv4Address) -> bool {
        self.destination.contains_addr(addr)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.gateway {
            Some(gw) => write!(f, "{} via {} nic {}", self.destination, gw, self.nic),
            None => write!(f, "{} nic {}", self.destination, self.nic),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `route` after every existing route.
    pub fn push(&mut self, route: Route) {
        self.routes.push(route);
    }

    /// Insert `route` just ahead of the first default route, or at the end
    /// when there is none. Other routes keep their relative order.
    pub fn insert_before_default(&mut self, route: Route) {
        match self.routes.iter().position(Route::is_default) {
            Some(at) => self.routes.insert(at, route),
            None => self.routes.push(route),
        }
    }

    /// First route matching `addr`, in table order.
    pub fn lookup(&self, addr: &Ipv4Address) -> Option<&Route> {
        self.routes.iter().find(|r| r.matches(addr))
    }

    pub fn contains(&self, route: &Route) -> bool {
        self.routes.contains(route)
    }

    /// Drop every route through `nic`.
    pub fn remove_nic(&mut self, nic: NicId) {
        self.routes.retain(|r| r.nic != nic);
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Route> {
        self.routes.iter()
    }

    pub fn as_slice(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl From<Vec<Route>> for RouteTable {
    fn from(routes: Vec<Route>) -> Self {
        Self { routes }
    }
}

impl<'a> IntoIterator for &'a RouteTable {
    type Item = &'a Route;
    type IntoIter = core::slice::Iter<'a, Route>;

    fn into_iter(self) -> Self::IntoIter {
        self.routes.iter()
    }
}
