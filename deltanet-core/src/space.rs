// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Conversion between header-space predicates and geometry.
//!
//! The factory owns the set of packet fields the engine models for a
//! given network and the ordering of those fields as rectangle axes.
//! Only fields referenced by some ACL are modelled; the destination
//! IP is always modelled because every FIB rule constrains it.

use deltanet_api::{Flow, HeaderSpace, TcpFlags};

use crate::dataplane::{AclLine, Network};
use crate::rect::HyperRectangle;

/// The bit-fields of a packet header the engine can model.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum PacketField {
    DstIp,
    SrcIp,
    DstPort,
    SrcPort,
    IpProto,
    IcmpType,
    IcmpCode,
    TcpAck,
    TcpCwr,
    TcpEce,
    TcpFin,
    TcpPsh,
    TcpRst,
    TcpSyn,
    TcpUrg,
}

pub const TCP_FLAG_FIELDS: [PacketField; 8] = [
    PacketField::TcpAck,
    PacketField::TcpCwr,
    PacketField::TcpEce,
    PacketField::TcpFin,
    PacketField::TcpPsh,
    PacketField::TcpRst,
    PacketField::TcpSyn,
    PacketField::TcpUrg,
];

impl PacketField {
    /// The full half-open domain of the field.
    pub fn domain(self) -> (u64, u64) {
        use PacketField::*;

        match self {
            DstIp | SrcIp => (0, 1 << 32),
            DstPort | SrcPort => (0, 1 << 16),
            IpProto | IcmpType | IcmpCode => (0, 1 << 8),
            TcpAck | TcpCwr | TcpEce | TcpFin | TcpPsh | TcpRst | TcpSyn
            | TcpUrg => (0, 2),
        }
    }

    fn is_tcp_flag(self) -> bool {
        TCP_FLAG_FIELDS.contains(&self)
    }

    /// For a flag field, the constraint the given alternative places
    /// on it.
    fn flag_constraint(self, flags: &TcpFlags) -> Option<bool> {
        use PacketField::*;

        match self {
            TcpAck => flags.ack,
            TcpCwr => flags.cwr,
            TcpEce => flags.ece,
            TcpFin => flags.fin,
            TcpPsh => flags.psh,
            TcpRst => flags.rst,
            TcpSyn => flags.syn,
            TcpUrg => flags.urg,
            _ => None,
        }
    }
}

/// An ordered union of rectangles produced from one predicate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GeometricSpace {
    rects: Vec<HyperRectangle>,
}

impl GeometricSpace {
    pub fn rectangles(&self) -> &[HyperRectangle] {
        &self.rects
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct GeometricSpaceFactory {
    fields: Vec<PacketField>,
}

impl GeometricSpaceFactory {
    /// Build a factory over an explicit field set. The destination IP
    /// is always modelled; axis order is the declaration order of
    /// [`PacketField`].
    pub fn new(mut fields: Vec<PacketField>) -> Self {
        if !fields.contains(&PacketField::DstIp) {
            fields.push(PacketField::DstIp);
        }
        fields.sort();
        fields.dedup();
        Self { fields }
    }

    /// Build a factory modelling only the fields some ACL in the
    /// network actually matches on.
    pub fn for_network(network: &Network) -> Self {
        let mut fields = vec![PacketField::DstIp];

        let mut add_acl = |hs: &HeaderSpace| {
            if !hs.src_ips.is_empty() || !hs.not_src_ips.is_empty() {
                fields.push(PacketField::SrcIp);
            }
            if !hs.dst_ports.is_empty() {
                fields.push(PacketField::DstPort);
            }
            if !hs.src_ports.is_empty() {
                fields.push(PacketField::SrcPort);
            }
            if !hs.ip_protocols.is_empty() {
                fields.push(PacketField::IpProto);
            }
            if !hs.icmp_types.is_empty() {
                fields.push(PacketField::IcmpType);
            }
            if !hs.icmp_codes.is_empty() {
                fields.push(PacketField::IcmpCode);
            }
            if !hs.tcp_flags.is_empty() {
                fields.extend(TCP_FLAG_FIELDS);
            }
        };

        for config in network.values() {
            for iface in config.interfaces.values() {
                for acl in [&iface.outgoing_filter, &iface.incoming_filter]
                    .into_iter()
                    .flatten()
                {
                    for line in &acl.lines {
                        add_acl(&line.header_space);
                    }
                }
            }
        }

        Self::new(fields)
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &[PacketField] {
        &self.fields
    }

    pub fn field_index(&self, field: PacketField) -> Option<usize> {
        self.fields.iter().position(|f| *f == field)
    }

    /// The rectangle covering the entire modelled header space.
    pub fn full_space(&self) -> HyperRectangle {
        let mut bounds = Vec::with_capacity(2 * self.fields.len());
        for f in &self.fields {
            let (lo, hi) = f.domain();
            bounds.push(lo);
            bounds.push(hi);
        }
        HyperRectangle::new(bounds)
    }

    /// Convert a header space into a union of rectangles. Disjunctions
    /// on a field fan out via cross product; negated address sets are
    /// handled by interval subtraction. The result may be empty when
    /// the predicate is unsatisfiable.
    ///
    /// Constraints on fields the factory does not model (possible in
    /// queries, since the field set is chosen from the ACLs alone) are
    /// ignored.
    pub fn from_header_space(&self, hs: &HeaderSpace) -> GeometricSpace {
        let mut axes: Vec<Vec<(u64, u64)>> =
            Vec::with_capacity(self.fields.len());

        for f in &self.fields {
            let domain = f.domain();
            let ivs = match f {
                PacketField::DstIp => subtract_intervals(
                    cidr_intervals(&hs.dst_ips, domain),
                    cidr_intervals(&hs.not_dst_ips, EMPTY),
                ),
                PacketField::SrcIp => subtract_intervals(
                    cidr_intervals(&hs.src_ips, domain),
                    cidr_intervals(&hs.not_src_ips, EMPTY),
                ),
                PacketField::DstPort => range_intervals(&hs.dst_ports, domain),
                PacketField::SrcPort => range_intervals(&hs.src_ports, domain),
                PacketField::IpProto => {
                    value_intervals(&hs.ip_protocols, domain)
                }
                PacketField::IcmpType => {
                    value_intervals(&hs.icmp_types, domain)
                }
                PacketField::IcmpCode => {
                    value_intervals(&hs.icmp_codes, domain)
                }
                // Flag axes start out unconstrained; the per-alternative
                // clipping below narrows them.
                _ => vec![domain],
            };

            if ivs.is_empty() {
                return GeometricSpace { rects: vec![] };
            }
            axes.push(ivs);
        }

        // Cross product over the scalar axes.
        let mut rects = vec![];
        let mut picks = vec![0usize; axes.len()];
        'outer: loop {
            let mut bounds = Vec::with_capacity(2 * axes.len());
            for (axis, pick) in axes.iter().zip(&picks) {
                let (lo, hi) = axis[*pick];
                bounds.push(lo);
                bounds.push(hi);
            }
            rects.push(HyperRectangle::new(bounds));

            for i in (0..axes.len()).rev() {
                picks[i] += 1;
                if picks[i] < axes[i].len() {
                    continue 'outer;
                }
                picks[i] = 0;
            }
            break;
        }

        // Each TCP-flag alternative constrains several flag axes at
        // once, so it multiplies whole rectangles rather than a single
        // axis. When the factory models no flag axes the constraints
        // are ignored like any other unmodelled field.
        let have_flag_axes = self.fields.iter().any(|f| f.is_tcp_flag());
        if !hs.tcp_flags.is_empty() && have_flag_axes {
            let mut flagged =
                Vec::with_capacity(rects.len() * hs.tcp_flags.len());
            for base in &rects {
                for alt in &hs.tcp_flags {
                    let mut bounds = base.bounds().to_vec();
                    for (i, f) in self.fields.iter().enumerate() {
                        if !f.is_tcp_flag() {
                            continue;
                        }
                        if let Some(bit) = f.flag_constraint(alt) {
                            bounds[2 * i] = bit as u64;
                            bounds[2 * i + 1] = bit as u64 + 1;
                        }
                    }
                    flagged.push(HyperRectangle::new(bounds));
                }
            }
            rects = flagged;
        }

        GeometricSpace { rects }
    }

    /// The geometry of an ACL line's match predicate. Callers that
    /// need a single rectangle take the first; a line with negations
    /// generally fans out into several.
    pub fn from_acl(&self, line: &AclLine) -> GeometricSpace {
        self.from_header_space(&line.header_space)
    }

    /// A concrete header inside `rect`: the low corner on every axis.
    pub fn example(&self, rect: &HyperRectangle) -> Flow {
        let mut flow = Flow::default();
        for (i, f) in self.fields.iter().enumerate() {
            let v = rect.lo(i);
            match f {
                PacketField::DstIp => flow.dst_ip = (v as u32).into(),
                PacketField::SrcIp => flow.src_ip = (v as u32).into(),
                PacketField::DstPort => flow.dst_port = v as u16,
                PacketField::SrcPort => flow.src_port = v as u16,
                PacketField::IpProto => flow.ip_protocol = v as u8,
                PacketField::IcmpType => flow.icmp_type = v as u8,
                PacketField::IcmpCode => flow.icmp_code = v as u8,
                PacketField::TcpAck => flow.tcp_ack = v == 1,
                PacketField::TcpCwr => flow.tcp_cwr = v == 1,
                PacketField::TcpEce => flow.tcp_ece = v == 1,
                PacketField::TcpFin => flow.tcp_fin = v == 1,
                PacketField::TcpPsh => flow.tcp_psh = v == 1,
                PacketField::TcpRst => flow.tcp_rst = v == 1,
                PacketField::TcpSyn => flow.tcp_syn = v == 1,
                PacketField::TcpUrg => flow.tcp_urg = v == 1,
            }
        }
        flow
    }
}

/// An unset CIDR exclusion set maps to no intervals at all, unlike an
/// unset inclusion set, which maps to the field's whole domain.
const EMPTY: (u64, u64) = (0, 0);

/// Intervals for a CIDR set; an empty set maps to `empty_domain`.
fn cidr_intervals(
    cidrs: &[deltanet_api::Ipv4Cidr],
    empty_domain: (u64, u64),
) -> Vec<(u64, u64)> {
    if cidrs.is_empty() {
        if empty_domain == EMPTY {
            return vec![];
        }
        return vec![empty_domain];
    }
    merge_intervals(cidrs.iter().map(|c| c.interval()).collect())
}

fn range_intervals(
    ranges: &[deltanet_api::PortRange],
    domain: (u64, u64),
) -> Vec<(u64, u64)> {
    if ranges.is_empty() {
        return vec![domain];
    }
    merge_intervals(
        ranges
            .iter()
            .map(|r| (u64::from(r.start), u64::from(r.end) + 1))
            .collect(),
    )
}

fn value_intervals(values: &[u8], domain: (u64, u64)) -> Vec<(u64, u64)> {
    if values.is_empty() {
        return vec![domain];
    }
    merge_intervals(
        values.iter().map(|v| (u64::from(*v), u64::from(*v) + 1)).collect(),
    )
}

/// Sort and coalesce overlapping or adjacent intervals.
fn merge_intervals(mut ivs: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    ivs.retain(|(lo, hi)| lo < hi);
    ivs.sort_unstable();
    let mut out: Vec<(u64, u64)> = Vec::with_capacity(ivs.len());
    for (lo, hi) in ivs {
        match out.last_mut() {
            Some((_, phi)) if lo <= *phi => *phi = (*phi).max(hi),
            _ => out.push((lo, hi)),
        }
    }
    out
}

/// Remove `subs` from `ivs`; both inputs must be sorted and disjoint.
fn subtract_intervals(
    ivs: Vec<(u64, u64)>,
    subs: Vec<(u64, u64)>,
) -> Vec<(u64, u64)> {
    if subs.is_empty() {
        return ivs;
    }

    let mut out = Vec::new();
    for (mut lo, hi) in ivs {
        for &(slo, shi) in &subs {
            if shi <= lo || hi <= slo {
                continue;
            }
            if lo < slo {
                out.push((lo, slo));
            }
            lo = lo.max(shi);
            if lo >= hi {
                break;
            }
        }
        if lo < hi {
            out.push((lo, hi));
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use deltanet_api::{HeaderSpace, PortRange, TcpFlags};
    use std::collections::BTreeMap;

    fn ip_only_factory() -> GeometricSpaceFactory {
        GeometricSpaceFactory::for_network(&BTreeMap::new())
    }

    #[test]
    fn minimal_field_set() {
        let f = ip_only_factory();
        assert_eq!(f.fields(), &[PacketField::DstIp]);
        assert_eq!(f.full_space().bounds(), &[0, 1 << 32]);
    }

    #[test]
    fn full_space_matches_domains() {
        let f = GeometricSpaceFactory::new(vec![
            PacketField::DstIp,
            PacketField::DstPort,
            PacketField::IpProto,
        ]);
        assert_eq!(f.full_space().bounds(), &[0, 1 << 32, 0, 1 << 16, 0, 256]);
    }

    #[test]
    fn header_space_fan_out() {
        let f = GeometricSpaceFactory::new(vec![
            PacketField::DstIp,
            PacketField::DstPort,
        ]);
        let mut hs = HeaderSpace::any();
        hs.dst_ips.push("10.0.0.0/8".parse().unwrap());
        hs.dst_ips.push("192.168.0.0/16".parse().unwrap());
        hs.dst_ports.push(PortRange::new(80, 80));
        hs.dst_ports.push(PortRange::new(443, 443));

        let space = f.from_header_space(&hs);
        // Two address intervals crossed with two port intervals.
        assert_eq!(space.rectangles().len(), 4);
    }

    #[test]
    fn negation_splits_interval() {
        let f = ip_only_factory();
        let mut hs = HeaderSpace::for_dst_ip("10.0.0.0/8".parse().unwrap());
        hs.not_dst_ips.push("10.128.0.0/9".parse().unwrap());

        let space = f.from_header_space(&hs);
        let (lo, hi) =
            "10.0.0.0/9".parse::<deltanet_api::Ipv4Cidr>().unwrap().interval();
        assert_eq!(space.rectangles().len(), 1);
        assert_eq!(space.rectangles()[0].bounds(), &[lo, hi]);
    }

    #[test]
    fn unsatisfiable_space_is_empty() {
        let f = ip_only_factory();
        let mut hs = HeaderSpace::for_dst_ip("10.0.0.0/8".parse().unwrap());
        hs.not_dst_ips.push("10.0.0.0/8".parse().unwrap());
        assert!(f.from_header_space(&hs).is_empty());
    }

    #[test]
    fn tcp_flag_alternatives_multiply() {
        let mut fields = vec![PacketField::DstIp];
        fields.extend(TCP_FLAG_FIELDS);
        let f = GeometricSpaceFactory::new(fields);

        let mut hs = HeaderSpace::any();
        hs.tcp_flags.push(TcpFlags { syn: Some(true), ..Default::default() });
        hs.tcp_flags.push(TcpFlags {
            ack: Some(true),
            rst: Some(false),
            ..Default::default()
        });

        let space = f.from_header_space(&hs);
        assert_eq!(space.rectangles().len(), 2);

        let syn_axis = f.field_index(PacketField::TcpSyn).unwrap();
        let r0 = &space.rectangles()[0];
        assert_eq!((r0.lo(syn_axis), r0.hi(syn_axis)), (1, 2));
    }

    #[test]
    fn example_picks_low_corner() {
        let f = GeometricSpaceFactory::new(vec![
            PacketField::DstIp,
            PacketField::DstPort,
        ]);
        let hs = HeaderSpace::for_dst_ip("10.1.2.3/32".parse().unwrap());
        let space = f.from_header_space(&hs);
        let flow = f.example(&space.rectangles()[0]);
        assert_eq!(flow.dst_ip, "10.1.2.3".parse().unwrap());
        assert_eq!(flow.dst_port, 0);
    }
}
