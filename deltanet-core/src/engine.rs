// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The forwarding graph itself: equivalence classes, edge labels, and
//! the reachability search.
//!
//! Construction ingests every FIB row and ACL line as a [`Rule`] and
//! inserts them one at a time. Inserting a rule refines the current
//! classes so that the rule's rectangle is exactly a union of classes,
//! then updates each covered class's owner map and moves its label bit
//! to the winning rule's link. After every insertion the graph answers
//! "which classes leave this link" in O(1) per link.
//!
//! Two refinement strategies are available. The classic one keeps the
//! classes a disjoint partition by physically splitting rectangles.
//! The difference-of-cubes one instead allocates a class for the
//! not-yet-attributed sliver of each overlap and records parent/child
//! arcs in a DAG, so a class's true region is its rectangle minus its
//! descendants'.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use bitvec::vec::BitVec;
use num_bigint::BigUint;
use num_traits::{CheckedSub, Zero};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use deltanet_api::{
    BackendType, FlowDisposition, FlowHistory, FlowTrace, FlowTraceHop,
    ForwardingAction, HeaderSpace,
};

use crate::dataplane::{DataPlane, Network};
use crate::graph::{Graph, NodeKind, NULL_IFACE};
use crate::kdtree::KdTree;
use crate::rect::HyperRectangle;
use crate::rule::Rule;
use crate::space::GeometricSpaceFactory;
use crate::{BuildError, Direction};

/// The seed for the deterministic shuffle applied before bulk
/// insertion; shuffling evens out the KD-tree splits.
const SHUFFLE_SEED: u64 = 7;

/// The disposition set of a query, packed for the inner search loop.
#[derive(Clone, Copy, Debug, Default)]
struct ActionFlags(u32);

impl ActionFlags {
    const ACCEPT: u32 = 1 << 0;
    const DROP: u32 = 1 << 1;
    const DROP_ACL: u32 = 1 << 2;
    const DROP_ACL_IN: u32 = 1 << 3;
    const DROP_ACL_OUT: u32 = 1 << 4;
    const DROP_NULL_ROUTE: u32 = 1 << 5;
    const DROP_NO_ROUTE: u32 = 1 << 6;

    fn from_actions(actions: &BTreeSet<ForwardingAction>) -> Self {
        let mut bits = 0;
        for action in actions {
            bits |= match action {
                ForwardingAction::Accept => Self::ACCEPT,
                ForwardingAction::Drop => Self::DROP,
                ForwardingAction::DropAcl => Self::DROP_ACL,
                ForwardingAction::DropAclIn => Self::DROP_ACL_IN,
                ForwardingAction::DropAclOut => Self::DROP_ACL_OUT,
                ForwardingAction::DropNullRoute => Self::DROP_NULL_ROUTE,
                ForwardingAction::DropNoRoute => Self::DROP_NO_ROUTE,
            };
        }
        Self(bits)
    }

    fn any(self, mask: u32) -> bool {
        self.0 & mask != 0
    }
}

/// A reconstructed search path: the links walked from `source` to the
/// node the search stopped at (empty when that node is a source), and
/// the node whose outgoing link decided the disposition.
struct Path {
    links: Vec<usize>,
    source: usize,
    decided_at: usize,
}

#[derive(Debug)]
pub struct ForwardingGraph {
    pub(crate) backend: BackendType,
    pub(crate) factory: GeometricSpaceFactory,
    pub(crate) graph: Graph,

    // Equivalence classes indexed by alpha; the arrays below are all
    // parallel to this one and append-only.
    pub(crate) ecs: Vec<HyperRectangle>,
    // Per-class map from graph node to the highest-priority rule
    // currently matching the class at that node.
    pub(crate) owner: Vec<HashMap<usize, usize>>,
    // Difference-of-cubes: per-class child sets and attributed volume.
    pub(crate) dag: Vec<BTreeSet<usize>>,
    pub(crate) volumes: Vec<BigUint>,

    // Per-link label columns, indexed by alpha.
    pub(crate) labels: Vec<BitVec>,

    // Every rule ever inserted; owner maps refer into this arena.
    pub(crate) rules: Vec<Rule>,

    pub(crate) kdtree: KdTree,
}

impl ForwardingGraph {
    /// Build the labelled graph from the network configurations and
    /// the computed data plane.
    pub fn new(
        network: &Network,
        dp: &DataPlane,
        backend: BackendType,
    ) -> Result<Self, BuildError> {
        let t0 = Instant::now();

        let graph = Graph::build(network, dp)?;
        let factory = GeometricSpaceFactory::for_network(network);

        let mut full = factory.full_space();
        full.set_alpha(0);
        let mut kdtree = KdTree::new(factory.num_fields());
        kdtree.insert(full.clone());

        let labels = vec![BitVec::new(); graph.links().len()];
        let volume = full.volume();
        let mut fg = ForwardingGraph {
            backend,
            factory,
            graph,
            ecs: vec![full],
            owner: vec![HashMap::new()],
            dag: vec![BTreeSet::new()],
            volumes: vec![volume],
            labels,
            rules: Vec::new(),
            kdtree,
        };

        // The FIB rules.
        let mut rules = Vec::new();
        for (router, rows) in &dp.fibs {
            if !fg.graph.node_map.contains_key(router) {
                return Err(BuildError::UnknownRouter(router.clone()));
            }
            for row in rows {
                rules.push(Rule::from_fib(&fg.factory, &fg.graph, router, row)?);
            }
        }

        // The ACL rules. Line `i` of an `n`-line list gets priority
        // `n - i`; the default deny sits below them all at 0 and joins
        // the non-ACL bucket.
        let mut acl_rules = Vec::new();
        for idx in 0..fg.graph.nodes.len() {
            let acl = match &fg.graph.nodes[idx].kind {
                NodeKind::Acl { acl, .. } => Arc::clone(acl),
                _ => continue,
            };
            let adj = fg.graph.adjacency(idx);
            let drop_link = adj[0];
            let accept_link = match adj.get(1) {
                Some(l) => *l,
                None => {
                    // Nothing was ever wired through this filter, so no
                    // packet can reach it either.
                    debug!(acl = %fg.graph.nodes[idx].name, "filter has no forward link, skipping");
                    continue;
                }
            };

            let n = acl.lines.len() as u32;
            for (i, line) in acl.lines.iter().enumerate() {
                acl_rules.push(Rule::from_acl_line(
                    &fg.factory,
                    &acl.name,
                    line,
                    drop_link,
                    accept_link,
                    n - i as u32,
                )?);
            }
            rules.push(Rule::default_deny(&fg.factory, drop_link));
        }

        // Sort for a deterministic starting order, shuffle with a
        // fixed seed for KD-tree balance, and load the ACL rules first
        // so their axes get split early.
        rules.sort_by(|a, b| a.rect.cmp(&b.rect));
        let mut rng = StdRng::seed_from_u64(SHUFFLE_SEED);
        rules.shuffle(&mut rng);
        let mut ordered = acl_rules;
        ordered.extend(rules);

        let num_rules = ordered.len();
        for rule in ordered {
            let idx = fg.rules.len();
            fg.rules.push(rule);
            match backend {
                BackendType::Deltanet => fg.add_rule(idx),
                BackendType::DeltanetDoc => fg.add_rule_doc(idx),
            }
        }

        info!(
            backend = %backend,
            rules = num_rules,
            classes = fg.ecs.len(),
            elapsed = ?t0.elapsed(),
            "built labelled graph",
        );

        Ok(fg)
    }

    pub fn backend(&self) -> BackendType {
        self.backend
    }

    pub fn num_ecs(&self) -> usize {
        self.ecs.len()
    }

    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    fn set_label(&mut self, link: usize, alpha: usize) {
        let bits = &mut self.labels[link];
        if bits.len() <= alpha {
            bits.resize(alpha + 1, false);
        }
        bits.set(alpha, true);
    }

    fn clear_label(&mut self, link: usize, alpha: usize) {
        let bits = &mut self.labels[link];
        if alpha < bits.len() {
            bits.set(alpha, false);
        }
    }

    pub(crate) fn has_label(&self, link: usize, alpha: usize) -> bool {
        self.labels[link].get(alpha).map(|b| *b).unwrap_or(false)
    }

    /// Classic insertion: split every intersecting class around the
    /// rule's rectangle so the classes stay a disjoint partition, then
    /// update labels for the classes the rectangle covers.
    fn add_rule(&mut self, r_idx: usize) {
        let hr = self.rules[r_idx].rect.clone();
        let mut overlapping: Vec<usize> = Vec::new();
        let mut delta: Vec<(usize, usize)> = Vec::new();

        for alpha in self.kdtree.intersect(&hr) {
            let other = self.ecs[alpha].clone();
            let o = hr
                .overlap(&other)
                .expect("intersection reported but overlap is empty");

            let parts = match other.subtract(&o) {
                // The class lies entirely inside the rule.
                None => {
                    overlapping.push(alpha);
                    continue;
                }
                Some(parts) => parts,
            };

            self.kdtree.delete(&other);
            let mut first = true;
            for mut part in parts {
                let part_alpha = if first {
                    // The split class keeps its slot, with new bounds.
                    first = false;
                    self.ecs[alpha].set_bounds(part.bounds().to_vec());
                    alpha
                } else {
                    let fresh = self.ecs.len();
                    part.set_alpha(fresh);
                    self.ecs.push(part);
                    self.owner.push(HashMap::new());
                    delta.push((alpha, fresh));
                    fresh
                };

                self.kdtree.insert(self.ecs[part_alpha].clone());
                if self.ecs[part_alpha] == o {
                    overlapping.push(part_alpha);
                }
            }
        }

        self.update_rules(r_idx, &overlapping, &delta);
    }

    /// Difference-of-cubes insertion: rather than splitting, allocate
    /// a class for the sliver of each overlap not already attributed
    /// to a descendant, and record the parent/child arc.
    fn add_rule_doc(&mut self, r_idx: usize) {
        let hr = self.rules[r_idx].rect.clone();
        let mut overlapping: Vec<usize> = Vec::new();
        let mut delta: Vec<(usize, usize)> = Vec::new();
        let mut cache: HashMap<usize, (BigUint, Option<usize>)> =
            HashMap::new();

        let others = self.kdtree.intersect(&hr);
        for &alpha in &others {
            self.add_rule_doc_rec(
                &hr,
                alpha,
                &others,
                &mut cache,
                &mut overlapping,
                &mut delta,
            );
        }

        self.update_rules(r_idx, &overlapping, &delta);
    }

    /// Returns the volume of the overlap between `added` and `other`
    /// together with the class that ended up representing it, if any.
    /// The cache
    /// guards against revisiting a class reachable along several DAG
    /// paths within one insertion.
    fn add_rule_doc_rec(
        &mut self,
        added: &HyperRectangle,
        other_alpha: usize,
        others: &[usize],
        cache: &mut HashMap<usize, (BigUint, Option<usize>)>,
        overlapping: &mut Vec<usize>,
        delta: &mut Vec<(usize, usize)>,
    ) -> (BigUint, Option<usize>) {
        if let Some(hit) = cache.get(&other_alpha) {
            return hit.clone();
        }

        let other = self.ecs[other_alpha].clone();
        let o = added
            .overlap(&other)
            .expect("intersection reported but overlap is empty");
        let o_vol = o.volume();

        // The class itself is the overlap.
        if other == o {
            overlapping.push(other_alpha);
            let ret = (o_vol, Some(other_alpha));
            cache.insert(other_alpha, ret.clone());
            return ret;
        }

        // Descend into the class's children that the new rule also
        // touches; whatever volume they account for is not ours. The
        // children may overlap one another, so their total can reach
        // or exceed the overlap's own volume, in which case there is
        // no sliver left to represent.
        let mut children_vol = BigUint::zero();
        let mut child_ecs: Vec<usize> = Vec::new();
        let children = self.dag[other_alpha].clone();
        for &cand in others {
            if !children.contains(&cand) {
                continue;
            }
            let (vol, ec) = self.add_rule_doc_rec(
                added, cand, others, cache, overlapping, delta,
            );
            children_vol += vol;
            if let Some(ec) = ec {
                child_ecs.push(ec);
            }
        }

        if children_vol < o_vol {
            let slice = &o_vol - &children_vol;
            let new_assigned = self.volumes[other_alpha]
                .checked_sub(&slice)
                .expect("attributed more volume than the class has");

            // The sliver is exactly the class's remaining region; no
            // new class needed.
            if new_assigned.is_zero() {
                overlapping.push(other_alpha);
                let ret = (o_vol, Some(other_alpha));
                cache.insert(other_alpha, ret.clone());
                return ret;
            }

            self.volumes[other_alpha] = new_assigned;

            let beta = self.ecs.len();
            let mut rect = o.clone();
            rect.set_alpha(beta);
            self.ecs.push(rect.clone());
            self.volumes.push(slice);
            self.owner.push(HashMap::new());
            self.dag.push(child_ecs.into_iter().collect());
            self.dag[other_alpha].insert(beta);
            self.kdtree.insert(rect);
            overlapping.push(beta);
            delta.push((other_alpha, beta));

            let ret = (o_vol, Some(beta));
            cache.insert(other_alpha, ret.clone());
            return ret;
        }

        let ret = (o_vol, None);
        cache.insert(other_alpha, ret.clone());
        ret
    }

    /// Propagate a newly inserted rule into owner maps and labels.
    ///
    /// Classes split off a parent first inherit the parent's owners
    /// and labels wholesale; then every class covered by the rule
    /// compares it against the incumbent at the rule's source node and
    /// moves its label if the new rule wins. Ties keep the incumbent.
    fn update_rules(
        &mut self,
        r_idx: usize,
        overlapping: &[usize],
        delta: &[(usize, usize)],
    ) {
        for &(parent, child) in delta {
            let inherited = self.owner[parent].clone();
            for &rule in inherited.values() {
                let link = self.rules[rule].link;
                self.set_label(link, child);
            }
            self.owner[child] = inherited;
        }

        let r_link = self.rules[r_idx].link;
        let r_priority = self.rules[r_idx].priority;
        let source = self.graph.links()[r_link].src;

        for &alpha in overlapping {
            let incumbent = self.owner[alpha].get(&source).copied();
            let wins = match incumbent {
                None => true,
                Some(inc) => self.rules[inc].priority < r_priority,
            };
            if !wins {
                continue;
            }

            self.set_label(r_link, alpha);
            if let Some(inc) = incumbent {
                let inc_link = self.rules[inc].link;
                if inc_link != r_link {
                    self.clear_label(inc_link, alpha);
                }
            }
            self.owner[alpha].insert(source, r_idx);
        }
    }

    /// Find one flow matching the header space that takes one of the
    /// requested dispositions from some source to some sink, or report
    /// that none exists via an empty history.
    pub fn reachable(
        &self,
        h: &HeaderSpace,
        actions: &BTreeSet<ForwardingAction>,
        sources: &BTreeSet<String>,
        sinks: &BTreeSet<String>,
    ) -> FlowHistory {
        let t0 = Instant::now();

        let mut src_nodes: Vec<usize> = Vec::new();
        for name in sources {
            match self.graph.node_map.get(name) {
                Some(&idx) => src_nodes.push(idx),
                None => debug!(router = %name, "query source not in graph"),
            }
        }
        let mut sink_nodes: BTreeSet<usize> = BTreeSet::new();
        for name in sinks {
            match self.graph.node_map.get(name) {
                Some(&idx) => {
                    sink_nodes.insert(idx);
                }
                None => debug!(router = %name, "query sink not in graph"),
            }
        }

        let flags = ActionFlags::from_actions(actions);
        let relevant = match self.backend {
            BackendType::Deltanet => self.find_relevant_ecs(h),
            BackendType::DeltanetDoc => self.find_relevant_ecs_doc(h),
        };

        for (alpha, overlap) in &relevant {
            if let Some((path, disposition)) =
                self.search(*alpha, flags, &src_nodes, &sink_nodes)
            {
                debug!(elapsed = ?t0.elapsed(), %disposition, "reachability query");
                return self.answer(overlap, &path, disposition);
            }
        }

        debug!(elapsed = ?t0.elapsed(), "reachability query found no witness");
        FlowHistory::new()
    }

    /// The classes a query header space touches, each with its
    /// overlapping region so an example flow can be cut from it.
    fn find_relevant_ecs(
        &self,
        h: &HeaderSpace,
    ) -> BTreeMap<usize, HyperRectangle> {
        let space = self.factory.from_header_space(h);
        let mut relevant = BTreeMap::new();
        for rect in space.rectangles() {
            for alpha in self.kdtree.intersect(rect) {
                let overlap = rect
                    .overlap(&self.ecs[alpha])
                    .expect("intersection reported but overlap is empty");
                relevant.insert(alpha, overlap);
            }
        }
        relevant
    }

    /// Like [`Self::find_relevant_ecs`], but under difference of
    /// cubes a class is only relevant if the overlap retains positive
    /// volume after its descendants' claims are subtracted out.
    fn find_relevant_ecs_doc(
        &self,
        h: &HeaderSpace,
    ) -> BTreeMap<usize, HyperRectangle> {
        let space = self.factory.from_header_space(h);
        let mut relevant = BTreeMap::new();
        for rect in space.rectangles() {
            let mut cache: HashMap<usize, BigUint> = HashMap::new();
            for alpha in self.kdtree.intersect(rect) {
                let overlap = rect
                    .overlap(&self.ecs[alpha])
                    .expect("intersection reported but overlap is empty");
                let vol = self.attributed_volume(&mut cache, alpha, &overlap);
                if !vol.is_zero() {
                    relevant.insert(alpha, overlap);
                }
            }
        }
        relevant
    }

    fn attributed_volume(
        &self,
        cache: &mut HashMap<usize, BigUint>,
        alpha: usize,
        overlap: &HyperRectangle,
    ) -> BigUint {
        if let Some(vol) = cache.get(&alpha) {
            return vol.clone();
        }

        let mut children_vol = BigUint::zero();
        for &child in &self.dag[alpha] {
            if let Some(co) = self.ecs[child].overlap(overlap) {
                children_vol += self.attributed_volume(cache, child, &co);
            }
        }

        // Overlapping children can claim more than the region holds;
        // attribution bottoms out at zero rather than going negative.
        let vol = overlap
            .volume()
            .checked_sub(&children_vol)
            .unwrap_or_else(BigUint::zero);
        cache.insert(alpha, vol.clone());
        vol
    }

    /// Breadth-first search over the links labelled with `alpha`,
    /// stopping at the first edge that witnesses a requested
    /// disposition at a sink.
    fn search(
        &self,
        alpha: usize,
        flags: ActionFlags,
        sources: &[usize],
        sinks: &BTreeSet<usize>,
    ) -> Option<(Path, FlowDisposition)> {
        let nodes = self.graph.nodes();
        let mut todo: VecDeque<usize> = sources.iter().copied().collect();
        let mut predecessors: Vec<Option<usize>> = vec![None; nodes.len()];
        let mut visited = vec![false; nodes.len()];

        while let Some(current) = todo.pop_front() {
            let is_sink = sinks.contains(&nodes[current].owner());
            visited[current] = true;

            let mut num_links = 0;
            for &l in self.graph.adjacency(current) {
                if !self.has_label(l, alpha) {
                    continue;
                }
                num_links += 1;

                let link = &self.graph.links()[l];
                let neighbor = link.dst;
                if !visited[neighbor] {
                    todo.push_back(neighbor);
                    predecessors[neighbor] = Some(l);
                }

                if !is_sink || !nodes[neighbor].is_drop() {
                    continue;
                }

                // The packet is dropped here; figure out what that
                // means for the query.
                if flags.any(ActionFlags::ACCEPT)
                    && link.src_iface != NULL_IFACE
                {
                    // Delivered out a connected interface at the sink.
                    return Some((
                        self.reconstruct(&predecessors, neighbor, current),
                        FlowDisposition::Accepted,
                    ));
                }

                let acl_dir = match &nodes[current].kind {
                    NodeKind::Acl { dir, .. } => Some(*dir),
                    _ => None,
                };

                if flags.any(
                    ActionFlags::DROP_ACL_IN
                        | ActionFlags::DROP_ACL
                        | ActionFlags::DROP,
                ) && acl_dir == Some(Direction::In)
                {
                    return Some((
                        self.reconstruct(&predecessors, neighbor, current),
                        FlowDisposition::DeniedIn,
                    ));
                }

                if flags.any(
                    ActionFlags::DROP_ACL_OUT
                        | ActionFlags::DROP_ACL
                        | ActionFlags::DROP,
                ) && acl_dir == Some(Direction::Out)
                {
                    return Some((
                        self.reconstruct(&predecessors, neighbor, current),
                        FlowDisposition::DeniedOut,
                    ));
                }

                if flags
                    .any(ActionFlags::DROP_NULL_ROUTE | ActionFlags::DROP)
                    && link.src_iface == NULL_IFACE
                {
                    return Some((
                        self.reconstruct(&predecessors, neighbor, current),
                        FlowDisposition::NullRouted,
                    ));
                }
            }

            // No labelled way out: the router does not know how to
            // forward this class at all.
            if is_sink
                && num_links == 0
                && flags.any(ActionFlags::DROP_NO_ROUTE | ActionFlags::DROP)
            {
                return Some((
                    self.reconstruct(&predecessors, current, current),
                    FlowDisposition::NoRoute,
                ));
            }
        }

        None
    }

    fn reconstruct(
        &self,
        predecessors: &[Option<usize>],
        dst: usize,
        decided_at: usize,
    ) -> Path {
        let mut links = Vec::new();
        let mut current = dst;
        while let Some(l) = predecessors[current] {
            links.push(l);
            current = self.graph.links()[l].src;
        }
        links.reverse();
        Path { links, source: current, decided_at }
    }

    /// Assemble the answer for one witness: a concrete example flow
    /// cut from the overlap region, the hop list, and a note that for
    /// ACL denials names the list and line responsible.
    fn answer(
        &self,
        overlap: &HyperRectangle,
        path: &Path,
        disposition: FlowDisposition,
    ) -> FlowHistory {
        let nodes = self.graph.nodes();
        let links = self.graph.links();

        let mut flow = self.factory.example(overlap);
        flow.ingress_node = nodes[path.source].name.clone();

        let note = match disposition {
            FlowDisposition::Accepted
            | FlowDisposition::NullRouted
            | FlowDisposition::NoRoute => disposition.to_string(),

            FlowDisposition::DeniedIn | FlowDisposition::DeniedOut => {
                let (acl, dir) = nodes[path.decided_at]
                    .acl()
                    .expect("an ACL denial is decided at an ACL node");
                let line = match acl.filter(&flow).match_line {
                    Some(i) => acl.lines[i].name.clone(),
                    None => "default deny".to_string(),
                };
                format!("DENIED_{}{{{}}}{{{}}}", dir, acl.name, line)
            }
        };

        let hops = path
            .links
            .iter()
            .map(|&l| {
                let link = &links[l];
                FlowTraceHop {
                    src_node: nodes[link.src].name.clone(),
                    src_iface: link.src_iface.clone(),
                    dst_node: nodes[link.dst].name.clone(),
                    dst_iface: link.dst_iface.clone(),
                }
            })
            .collect();

        let mut history = FlowHistory::new();
        history.add_trace(flow, FlowTrace { disposition, hops, note });
        history
    }

    /// A serializable snapshot of the engine's shape, for debugging.
    pub fn dump(&self) -> EngineDump {
        let links = self
            .graph
            .links()
            .iter()
            .map(|l| LinkDump {
                src: self.graph.nodes()[l.src].name.clone(),
                src_iface: l.src_iface.clone(),
                dst: self.graph.nodes()[l.dst].name.clone(),
                dst_iface: l.dst_iface.clone(),
                labels: self.labels[l.index].count_ones(),
            })
            .collect();

        EngineDump {
            backend: self.backend,
            num_ecs: self.ecs.len(),
            num_rules: self.rules.len(),
            links,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EngineDump {
    pub backend: BackendType,
    pub num_ecs: usize,
    pub num_rules: usize,
    pub links: Vec<LinkDump>,
}

/// One link and how many classes it currently forwards.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LinkDump {
    pub src: String,
    pub src_iface: String,
    pub dst: String,
    pub dst_iface: String,
    pub labels: usize,
}
