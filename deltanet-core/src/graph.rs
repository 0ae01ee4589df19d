// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The node and link fabric of the labelled graph.
//!
//! Node index 0 is always the drop node; every router and every
//! interface ACL gets a node of its own. A topology edge expands into
//! a chain of one to four links depending on which side carries a
//! filter, and every ACL node's adjacency list starts with its link to
//! the drop node followed by its forward link, in that order, so rule
//! creation can address the two by position.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::dataplane::{DataPlane, IpAccessList, Network, NodeIface};
use crate::{BuildError, Direction};

pub const DROP_NODE_NAME: &str = "(none)";
pub const NULL_IFACE: &str = "null_interface";
pub const ENTER_OUT_ACL: &str = "enter-outbound-acl";
pub const EXIT_OUT_ACL: &str = "exit-outbound-acl";
pub const ENTER_IN_ACL: &str = "enter-inbound-acl";
pub const EXIT_IN_ACL: &str = "exit-inbound-acl";

#[derive(Clone, Debug)]
pub enum NodeKind {
    /// The sink all dropping links lead to.
    Drop,
    Router,
    Acl {
        acl: Arc<IpAccessList>,
        dir: Direction,
        /// The node the reachability search attributes this filter
        /// to: the router its chain delivers traffic to.
        owner: usize,
    },
}

#[derive(Clone, Debug)]
pub struct GraphNode {
    pub name: String,
    pub index: usize,
    pub kind: NodeKind,
}

impl GraphNode {
    pub fn is_drop(&self) -> bool {
        matches!(self.kind, NodeKind::Drop)
    }

    /// The router this node answers for in a query's source/sink
    /// sets. Routers (and the drop node) answer for themselves.
    pub fn owner(&self) -> usize {
        match self.kind {
            NodeKind::Acl { owner, .. } => owner,
            _ => self.index,
        }
    }

    pub fn acl(&self) -> Option<(&Arc<IpAccessList>, Direction)> {
        match &self.kind {
            NodeKind::Acl { acl, dir, .. } => Some((acl, *dir)),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GraphLink {
    pub index: usize,
    pub src: usize,
    pub src_iface: String,
    pub dst: usize,
    pub dst_iface: String,
}

#[derive(Debug)]
pub struct Graph {
    pub(crate) nodes: Vec<GraphNode>,
    pub(crate) links: Vec<GraphLink>,
    pub(crate) adjacency: Vec<Vec<usize>>,
    // Routers (and the drop node) by name.
    pub(crate) node_map: BTreeMap<String, usize>,
    // ACL nodes by their synthesized unique name.
    pub(crate) acl_map: BTreeMap<String, usize>,
    // A router interface to the first link of its outgoing chain.
    pub(crate) link_map: BTreeMap<NodeIface, usize>,
}

pub fn acl_node_name(
    dir: Direction,
    router: &str,
    iface: &str,
    acl: &str,
) -> String {
    format!("ACL-{}-{}-{}-{}", dir, router, iface, acl)
}

impl Graph {
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn links(&self) -> &[GraphLink] {
        &self.links
    }

    pub fn adjacency(&self, node: usize) -> &[usize] {
        &self.adjacency[node]
    }

    fn add_node(&mut self, name: String, kind: NodeKind) -> usize {
        let index = self.nodes.len();
        self.nodes.push(GraphNode { name, index, kind });
        self.adjacency.push(Vec::new());
        index
    }

    fn add_link(
        &mut self,
        src: usize,
        src_iface: &str,
        dst: usize,
        dst_iface: &str,
    ) -> usize {
        let index = self.links.len();
        self.links.push(GraphLink {
            index,
            src,
            src_iface: src_iface.to_string(),
            dst,
            dst_iface: dst_iface.to_string(),
        });
        self.adjacency[src].push(index);
        index
    }

    pub fn build(network: &Network, dp: &DataPlane) -> Result<Self, BuildError> {
        let mut g = Graph {
            nodes: Vec::new(),
            links: Vec::new(),
            adjacency: Vec::new(),
            node_map: BTreeMap::new(),
            acl_map: BTreeMap::new(),
            link_map: BTreeMap::new(),
        };

        // The drop node sits at index 0.
        let drop_idx = g.add_node(DROP_NODE_NAME.to_string(), NodeKind::Drop);
        g.node_map.insert(DROP_NODE_NAME.to_string(), drop_idx);

        // Routers and their ACL nodes. An outbound ACL's owner starts
        // out as its own router and is pointed at the neighbor when
        // the chains are wired below.
        for (router, config) in network {
            let router_idx = g.add_node(router.clone(), NodeKind::Router);
            g.node_map.insert(router.clone(), router_idx);

            for (iface_name, iface) in &config.interfaces {
                if let Some(out_acl) = &iface.outgoing_filter {
                    let name = acl_node_name(
                        Direction::Out,
                        router,
                        iface_name,
                        &out_acl.name,
                    );
                    let idx = g.add_node(
                        name.clone(),
                        NodeKind::Acl {
                            acl: Arc::clone(out_acl),
                            dir: Direction::Out,
                            owner: router_idx,
                        },
                    );
                    g.acl_map.insert(name, idx);
                }
                if let Some(in_acl) = &iface.incoming_filter {
                    let name = acl_node_name(
                        Direction::In,
                        router,
                        iface_name,
                        &in_acl.name,
                    );
                    let idx = g.add_node(
                        name.clone(),
                        NodeKind::Acl {
                            acl: Arc::clone(in_acl),
                            dir: Direction::In,
                            owner: router_idx,
                        },
                    );
                    g.acl_map.insert(name, idx);
                }
            }
        }

        // Every ACL node's drop link goes in first so that it is slot
        // 0 of the adjacency list.
        for idx in 0..g.nodes.len() {
            if matches!(g.nodes[idx].kind, NodeKind::Acl { .. }) {
                g.add_link(idx, NULL_IFACE, drop_idx, NULL_IFACE);
            }
        }

        // Collect the directed interface pairs: the topology edges, a
        // null interface per router, and a sink edge for every
        // interface without a neighbor.
        let null_pair = NodeIface::new(DROP_NODE_NAME, NULL_IFACE);
        let mut edge_map: BTreeMap<NodeIface, NodeIface> = BTreeMap::new();
        for edge in &dp.edges {
            edge_map.insert(edge.src.clone(), edge.dst.clone());
        }
        for (router, config) in network {
            edge_map.insert(
                NodeIface::new(router.as_str(), NULL_IFACE),
                null_pair.clone(),
            );
            for iface_name in config.interfaces.keys() {
                edge_map
                    .entry(NodeIface::new(router.as_str(), iface_name.as_str()))
                    .or_insert_with(|| null_pair.clone());
            }
        }

        for (nip1, nip2) in &edge_map {
            let src = *g
                .node_map
                .get(&nip1.node)
                .ok_or_else(|| BuildError::UnknownRouter(nip1.node.clone()))?;

            if nip1.iface == NULL_IFACE {
                let l = g.add_link(src, NULL_IFACE, drop_idx, NULL_IFACE);
                g.link_map.insert(nip1.clone(), l);
                continue;
            }

            let config1 = network.get(&nip1.node).ok_or_else(|| {
                BuildError::UnknownRouter(nip1.node.clone())
            })?;
            let iface1 =
                config1.interfaces.get(&nip1.iface).ok_or_else(|| {
                    BuildError::UnknownInterface {
                        router: nip1.node.clone(),
                        iface: nip1.iface.clone(),
                    }
                })?;
            let iface2 = network
                .get(&nip2.node)
                .and_then(|c| c.interfaces.get(&nip2.iface));

            let out_acl = iface1.outgoing_filter.as_ref();
            let in_acl = iface2.and_then(|i| i.incoming_filter.as_ref());

            if let Some(out_acl) = out_acl {
                let out_name = acl_node_name(
                    Direction::Out,
                    &nip1.node,
                    &nip1.iface,
                    &out_acl.name,
                );
                let out_idx = g.acl_map[&out_name];

                // Attribute the filter to the router it guards
                // delivery to.
                if let Some(&tgt) = g.node_map.get(&nip2.node) {
                    if tgt != drop_idx {
                        if let NodeKind::Acl { owner, .. } =
                            &mut g.nodes[out_idx].kind
                        {
                            *owner = tgt;
                        }
                    }
                }

                let l1 =
                    g.add_link(src, &nip1.iface, out_idx, ENTER_OUT_ACL);
                g.link_map.insert(nip1.clone(), l1);

                if let Some(in_acl) = in_acl {
                    let in_name = acl_node_name(
                        Direction::In,
                        &nip2.node,
                        &nip2.iface,
                        &in_acl.name,
                    );
                    let in_idx = g.acl_map[&in_name];
                    g.add_link(out_idx, EXIT_OUT_ACL, in_idx, ENTER_IN_ACL);
                    let tgt = g.node_map[&nip2.node];
                    g.add_link(in_idx, EXIT_IN_ACL, tgt, &nip2.iface);
                } else {
                    let tgt =
                        *g.node_map.get(&nip2.node).ok_or_else(|| {
                            BuildError::UnknownRouter(nip2.node.clone())
                        })?;
                    g.add_link(out_idx, EXIT_OUT_ACL, tgt, &nip2.iface);
                }
            } else if let Some(in_acl) = in_acl {
                let in_name = acl_node_name(
                    Direction::In,
                    &nip2.node,
                    &nip2.iface,
                    &in_acl.name,
                );
                let in_idx = g.acl_map[&in_name];
                let l1 = g.add_link(src, &nip1.iface, in_idx, ENTER_IN_ACL);
                g.link_map.insert(nip1.clone(), l1);
                let tgt = g.node_map[&nip2.node];
                g.add_link(in_idx, EXIT_IN_ACL, tgt, &nip2.iface);
            } else {
                let tgt = *g.node_map.get(&nip2.node).ok_or_else(|| {
                    BuildError::UnknownRouter(nip2.node.clone())
                })?;
                let l = g.add_link(src, &nip1.iface, tgt, &nip2.iface);
                g.link_map.insert(nip1.clone(), l);
            }
        }

        Ok(g)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dataplane::{
        AclLine, DataPlane, Edge, Interface, IpAccessList, LineAction,
        RouterConfig,
    };
    use deltanet_api::HeaderSpace;
    use std::collections::BTreeMap;

    fn bare_router(name: &str, ifaces: &[&str]) -> RouterConfig {
        let mut r = RouterConfig::new(name);
        for i in ifaces {
            r.add_interface(Interface::new(*i));
        }
        r
    }

    #[test]
    fn plain_edge_is_one_link() {
        let mut network: Network = BTreeMap::new();
        network.insert("r1".into(), bare_router("r1", &["eth0"]));
        network.insert("r2".into(), bare_router("r2", &["eth0"]));
        let dp = DataPlane {
            fibs: BTreeMap::new(),
            edges: vec![Edge::new(
                NodeIface::new("r1", "eth0"),
                NodeIface::new("r2", "eth0"),
            )],
        };

        let g = Graph::build(&network, &dp).unwrap();
        assert_eq!(g.nodes[0].name, DROP_NODE_NAME);

        let l = g.link_map[&NodeIface::new("r1", "eth0")];
        let link = &g.links[l];
        assert_eq!(g.nodes[link.src].name, "r1");
        assert_eq!(g.nodes[link.dst].name, "r2");

        // r2:eth0 has no neighbor of its own, so it leads to the sink.
        let l2 = g.link_map[&NodeIface::new("r2", "eth0")];
        assert!(g.nodes[g.links[l2].dst].is_drop());

        // Every router gets a null link to the sink.
        let null = g.link_map[&NodeIface::new("r1", NULL_IFACE)];
        assert!(g.nodes[g.links[null].dst].is_drop());
        assert_eq!(g.links[null].src_iface, NULL_IFACE);
    }

    #[test]
    fn filtered_edge_grows_acl_chain() {
        let acl = Arc::new(IpAccessList::new(
            "fw",
            vec![AclLine::new("all", LineAction::Accept, HeaderSpace::any())],
        ));

        let mut r1 = bare_router("r1", &[]);
        let mut iface = Interface::new("eth0");
        iface.outgoing_filter = Some(Arc::clone(&acl));
        r1.add_interface(iface);

        let mut r2 = bare_router("r2", &[]);
        let mut iface = Interface::new("eth0");
        iface.incoming_filter = Some(Arc::clone(&acl));
        r2.add_interface(iface);

        let mut network: Network = BTreeMap::new();
        network.insert("r1".into(), r1);
        network.insert("r2".into(), r2);
        let dp = DataPlane {
            fibs: BTreeMap::new(),
            edges: vec![Edge::new(
                NodeIface::new("r1", "eth0"),
                NodeIface::new("r2", "eth0"),
            )],
        };

        let g = Graph::build(&network, &dp).unwrap();

        // r1:eth0 -> ACL-OUT -> ACL-IN -> r2:eth0.
        let l1 = &g.links[g.link_map[&NodeIface::new("r1", "eth0")]];
        let out_idx = l1.dst;
        assert_eq!(g.nodes[out_idx].name, "ACL-OUT-r1-eth0-fw");
        assert_eq!(l1.dst_iface, ENTER_OUT_ACL);

        // The outbound filter answers for the neighbor it guards.
        assert_eq!(g.nodes[out_idx].owner(), g.node_map["r2"]);

        // Drop link first, then the forward link.
        let out_adj = g.adjacency(out_idx);
        assert!(g.nodes[g.links[out_adj[0]].dst].is_drop());
        assert_eq!(g.links[out_adj[0]].src_iface, NULL_IFACE);
        let l2 = &g.links[out_adj[1]];
        assert_eq!(l2.src_iface, EXIT_OUT_ACL);
        let in_idx = l2.dst;
        assert_eq!(g.nodes[in_idx].name, "ACL-IN-r2-eth0-fw");
        assert_eq!(g.nodes[in_idx].owner(), g.node_map["r2"]);

        let in_adj = g.adjacency(in_idx);
        assert!(g.nodes[g.links[in_adj[0]].dst].is_drop());
        let l3 = &g.links[in_adj[1]];
        assert_eq!(l3.src_iface, EXIT_IN_ACL);
        assert_eq!(g.nodes[l3.dst].name, "r2");
    }

    #[test]
    fn unknown_router_in_topology() {
        let mut network: Network = BTreeMap::new();
        network.insert("r1".into(), bare_router("r1", &["eth0"]));
        let dp = DataPlane {
            fibs: BTreeMap::new(),
            edges: vec![Edge::new(
                NodeIface::new("ghost", "eth0"),
                NodeIface::new("r1", "eth0"),
            )],
        };

        assert_eq!(
            Graph::build(&network, &dp).unwrap_err(),
            BuildError::UnknownRouter("ghost".into()),
        );
    }
}
