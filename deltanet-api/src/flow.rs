// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Concrete flows and query answers.

use core::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::ip::Ipv4Addr;

/// One concrete packet header, used as the witness for a reachability
/// answer. Fields the engine does not model for a given network keep
/// their default values.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Flow {
    pub ingress_node: String,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub ip_protocol: u8,
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub tcp_ack: bool,
    pub tcp_cwr: bool,
    pub tcp_ece: bool,
    pub tcp_fin: bool,
    pub tcp_psh: bool,
    pub tcp_rst: bool,
    pub tcp_syn: bool,
    pub tcp_urg: bool,
}

impl Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{},{}:{},{},ingress={}",
            self.src_ip,
            self.src_port,
            self.dst_ip,
            self.dst_port,
            self.ip_protocol,
            self.ingress_node,
        )
    }
}

/// What ultimately happened to a flow.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum FlowDisposition {
    Accepted,
    DeniedIn,
    DeniedOut,
    NullRouted,
    NoRoute,
}

impl Display for FlowDisposition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FlowDisposition::Accepted => write!(f, "ACCEPTED"),
            FlowDisposition::DeniedIn => write!(f, "DENIED_IN"),
            FlowDisposition::DeniedOut => write!(f, "DENIED_OUT"),
            FlowDisposition::NullRouted => write!(f, "NULL_ROUTED"),
            FlowDisposition::NoRoute => write!(f, "NO_ROUTE"),
        }
    }
}

/// The dispositions a query asks for. `Drop` covers every drop
/// variant; `DropAcl` covers both ACL directions.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum ForwardingAction {
    Accept,
    Drop,
    DropAcl,
    DropAclIn,
    DropAclOut,
    DropNullRoute,
    DropNoRoute,
}

/// One hop of a witness trace: the link traversed, named by its
/// endpoints and interfaces.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowTraceHop {
    pub src_node: String,
    pub src_iface: String,
    pub dst_node: String,
    pub dst_iface: String,
}

impl Display for FlowTraceHop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_node, self.src_iface, self.dst_node, self.dst_iface,
        )
    }
}

/// The trace of one witness flow through the network.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowTrace {
    pub disposition: FlowDisposition,
    pub hops: Vec<FlowTraceHop>,
    pub note: String,
}

/// The answer to a reachability query: at most one (flow, trace) pair
/// per query in the current engine. An empty history means no flow
/// with the requested dispositions exists.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FlowHistory {
    pub traces: Vec<(Flow, FlowTrace)>,
}

impl FlowHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_trace(&mut self, flow: Flow, trace: FlowTrace) {
        self.traces.push((flow, trace));
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }
}

#[test]
fn disposition_names() {
    assert_eq!(FlowDisposition::DeniedOut.to_string(), "DENIED_OUT");
    assert_eq!(FlowDisposition::NoRoute.to_string(), "NO_ROUTE");
}
