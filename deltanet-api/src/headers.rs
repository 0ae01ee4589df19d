// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Header-space predicates.
//!
//! A [`HeaderSpace`] is a conjunction of per-field inclusion sets: a
//! packet matches when, for every constrained field, its value falls
//! in that field's set. An empty set leaves the field unconstrained.
//! The address fields additionally carry exclusion sets, which is how
//! negated matches are expressed.

use core::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::flow::Flow;
use crate::ip::Ipv4Cidr;

/// An inclusive range of port numbers. A single port is expressed as
/// `start == end`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn single(port: u16) -> Self {
        Self { start: port, end: port }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }
}

impl Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// A constraint over the eight TCP flag bits. `None` leaves a flag
/// unconstrained; `Some(b)` requires the flag to have value `b`.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
pub struct TcpFlags {
    pub ack: Option<bool>,
    pub cwr: Option<bool>,
    pub ece: Option<bool>,
    pub fin: Option<bool>,
    pub psh: Option<bool>,
    pub rst: Option<bool>,
    pub syn: Option<bool>,
    pub urg: Option<bool>,
}

impl TcpFlags {
    pub fn is_unconstrained(&self) -> bool {
        *self == TcpFlags::default()
    }

    pub fn matches(&self, flow: &Flow) -> bool {
        fn ok(want: Option<bool>, have: bool) -> bool {
            want.map_or(true, |w| w == have)
        }

        ok(self.ack, flow.tcp_ack)
            && ok(self.cwr, flow.tcp_cwr)
            && ok(self.ece, flow.tcp_ece)
            && ok(self.fin, flow.tcp_fin)
            && ok(self.psh, flow.tcp_psh)
            && ok(self.rst, flow.tcp_rst)
            && ok(self.syn, flow.tcp_syn)
            && ok(self.urg, flow.tcp_urg)
    }
}

/// A conjunction of per-field inclusion sets over packet headers.
///
/// Every field follows the same convention: an empty `Vec` means "any
/// value". `tcp_flags` is a disjunction of alternatives, each of which
/// constrains several flag bits at once.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct HeaderSpace {
    pub dst_ips: Vec<Ipv4Cidr>,
    pub not_dst_ips: Vec<Ipv4Cidr>,
    pub src_ips: Vec<Ipv4Cidr>,
    pub not_src_ips: Vec<Ipv4Cidr>,
    pub dst_ports: Vec<PortRange>,
    pub src_ports: Vec<PortRange>,
    pub ip_protocols: Vec<u8>,
    pub icmp_types: Vec<u8>,
    pub icmp_codes: Vec<u8>,
    pub tcp_flags: Vec<TcpFlags>,
}

impl HeaderSpace {
    /// A header space placing no constraint on any field.
    pub fn any() -> Self {
        Self::default()
    }

    /// A header space constraining only the destination IP.
    pub fn for_dst_ip(cidr: Ipv4Cidr) -> Self {
        Self { dst_ips: vec![cidr], ..Default::default() }
    }

    /// Evaluate this predicate against one concrete flow.
    pub fn matches(&self, flow: &Flow) -> bool {
        if !self.dst_ips.is_empty()
            && !self.dst_ips.iter().any(|c| c.is_member(flow.dst_ip))
        {
            return false;
        }

        if self.not_dst_ips.iter().any(|c| c.is_member(flow.dst_ip)) {
            return false;
        }

        if !self.src_ips.is_empty()
            && !self.src_ips.iter().any(|c| c.is_member(flow.src_ip))
        {
            return false;
        }

        if self.not_src_ips.iter().any(|c| c.is_member(flow.src_ip)) {
            return false;
        }

        if !self.dst_ports.is_empty()
            && !self.dst_ports.iter().any(|r| r.contains(flow.dst_port))
        {
            return false;
        }

        if !self.src_ports.is_empty()
            && !self.src_ports.iter().any(|r| r.contains(flow.src_port))
        {
            return false;
        }

        if !self.ip_protocols.is_empty()
            && !self.ip_protocols.contains(&flow.ip_protocol)
        {
            return false;
        }

        if !self.icmp_types.is_empty()
            && !self.icmp_types.contains(&flow.icmp_type)
        {
            return false;
        }

        if !self.icmp_codes.is_empty()
            && !self.icmp_codes.contains(&flow.icmp_code)
        {
            return false;
        }

        if !self.tcp_flags.is_empty()
            && !self.tcp_flags.iter().any(|t| t.matches(flow))
        {
            return false;
        }

        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn match_empty_space() {
        let hs = HeaderSpace::any();
        assert!(hs.matches(&Flow::default()));
    }

    #[test]
    fn match_dst_ip() {
        let hs =
            HeaderSpace::for_dst_ip("10.0.0.0/8".parse().unwrap());
        let mut flow = Flow::default();
        flow.dst_ip = "10.1.2.3".parse().unwrap();
        assert!(hs.matches(&flow));
        flow.dst_ip = "11.1.2.3".parse().unwrap();
        assert!(!hs.matches(&flow));
    }

    #[test]
    fn match_negated_ip() {
        let mut hs =
            HeaderSpace::for_dst_ip("10.0.0.0/8".parse().unwrap());
        hs.not_dst_ips.push("10.9.0.0/16".parse().unwrap());
        let mut flow = Flow::default();
        flow.dst_ip = "10.1.2.3".parse().unwrap();
        assert!(hs.matches(&flow));
        flow.dst_ip = "10.9.2.3".parse().unwrap();
        assert!(!hs.matches(&flow));
    }

    #[test]
    fn match_ports_and_flags() {
        let mut hs = HeaderSpace::any();
        hs.dst_ports.push(PortRange::new(80, 443));
        hs.tcp_flags.push(TcpFlags {
            syn: Some(true),
            ack: Some(false),
            ..Default::default()
        });

        let mut flow = Flow::default();
        flow.dst_port = 80;
        flow.tcp_syn = true;
        assert!(hs.matches(&flow));

        flow.tcp_ack = true;
        assert!(!hs.matches(&flow));

        flow.tcp_ack = false;
        flow.dst_port = 8080;
        assert!(!hs.matches(&flow));
    }
}
