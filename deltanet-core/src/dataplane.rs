// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The state the engine consumes from an upstream data-plane
//! producer: per-router FIBs, interface ACLs, and the topology.
//!
//! All maps are ordered so that construction walks routers and
//! interfaces in a deterministic order regardless of how the producer
//! assembled them.

use core::fmt::{self, Display};
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use deltanet_api::{Flow, HeaderSpace, Ipv4Cidr};

/// The action of an ACL line.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum LineAction {
    Accept,
    Deny,
}

impl Display for LineAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LineAction::Accept => write!(f, "accept"),
            LineAction::Deny => write!(f, "deny"),
        }
    }
}

/// One line of an access list: a named header-space predicate plus
/// the action taken when it matches.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AclLine {
    pub name: String,
    pub action: LineAction,
    pub header_space: HeaderSpace,
}

impl AclLine {
    pub fn new<S: ToString>(
        name: S,
        action: LineAction,
        header_space: HeaderSpace,
    ) -> Self {
        Self { name: name.to_string(), action, header_space }
    }
}

/// The result of running an ACL against one concrete flow: the action
/// taken and the line that matched, if any. `match_line == None`
/// means the flow fell through to the default deny.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FilterResult {
    pub action: LineAction,
    pub match_line: Option<usize>,
}

/// An ordered access list.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IpAccessList {
    pub name: String,
    pub lines: Vec<AclLine>,
}

impl IpAccessList {
    pub fn new<S: ToString>(name: S, lines: Vec<AclLine>) -> Self {
        Self { name: name.to_string(), lines }
    }

    /// Evaluate the list against a concrete flow, first match wins.
    pub fn filter(&self, flow: &Flow) -> FilterResult {
        for (i, line) in self.lines.iter().enumerate() {
            if line.header_space.matches(flow) {
                return FilterResult { action: line.action, match_line: Some(i) };
            }
        }

        FilterResult { action: LineAction::Deny, match_line: None }
    }
}

/// A router interface with its optional packet filters. The lists are
/// shared because the graph's ACL nodes hold onto them as well.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Interface {
    pub name: String,
    pub outgoing_filter: Option<Arc<IpAccessList>>,
    pub incoming_filter: Option<Arc<IpAccessList>>,
}

impl Interface {
    pub fn new<S: ToString>(name: S) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }
}

/// One router's configuration as far as this engine is concerned: its
/// name and interfaces.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RouterConfig {
    pub name: String,
    pub interfaces: BTreeMap<String, Interface>,
}

impl RouterConfig {
    pub fn new<S: ToString>(name: S) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    pub fn add_interface(&mut self, iface: Interface) {
        self.interfaces.insert(iface.name.clone(), iface);
    }
}

/// All routers, keyed by name.
pub type Network = BTreeMap<String, RouterConfig>;

/// One row of a router's forwarding table. An `out_iface` of
/// `"null_interface"` is a null route.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FibRow {
    pub prefix: Ipv4Cidr,
    pub out_iface: String,
}

impl FibRow {
    pub fn new<S: ToString>(prefix: Ipv4Cidr, out_iface: S) -> Self {
        Self { prefix, out_iface: out_iface.to_string() }
    }
}

/// A `router:iface` endpoint.
#[derive(
    Clone, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct NodeIface {
    pub node: String,
    pub iface: String,
}

impl NodeIface {
    pub fn new<S: ToString>(node: S, iface: S) -> Self {
        Self { node: node.to_string(), iface: iface.to_string() }
    }
}

impl Display for NodeIface {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.iface)
    }
}

/// A directed topology edge.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Edge {
    pub src: NodeIface,
    pub dst: NodeIface,
}

impl Edge {
    pub fn new(src: NodeIface, dst: NodeIface) -> Self {
        Self { src, dst }
    }
}

/// The data plane handed to the engine: per-router FIB rows in table
/// order, and the topology edges.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DataPlane {
    pub fibs: BTreeMap<String, Vec<FibRow>>,
    pub edges: Vec<Edge>,
}

#[cfg(test)]
mod test {
    use super::*;
    use deltanet_api::Flow;

    #[test]
    fn filter_first_match_wins() {
        let acl = IpAccessList::new(
            "acl",
            vec![
                AclLine::new(
                    "deny-10",
                    LineAction::Deny,
                    HeaderSpace::for_dst_ip("10.0.0.0/8".parse().unwrap()),
                ),
                AclLine::new(
                    "allow-all",
                    LineAction::Accept,
                    HeaderSpace::any(),
                ),
            ],
        );

        let mut flow = Flow::default();
        flow.dst_ip = "10.1.2.3".parse().unwrap();
        let res = acl.filter(&flow);
        assert_eq!(res.action, LineAction::Deny);
        assert_eq!(res.match_line, Some(0));

        flow.dst_ip = "11.1.2.3".parse().unwrap();
        let res = acl.filter(&flow);
        assert_eq!(res.action, LineAction::Accept);
        assert_eq!(res.match_line, Some(1));
    }

    #[test]
    fn filter_default_deny() {
        let acl = IpAccessList::new("empty", vec![]);
        let res = acl.filter(&Flow::default());
        assert_eq!(res.action, LineAction::Deny);
        assert_eq!(res.match_line, None);
    }
}
