// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Datamodel types shared between producers of data-plane state and
//! the deltanet reachability engine.
//!
//! Everything here crosses the engine boundary and is therefore
//! serde-serializable: addresses and CIDRs, header-space predicates,
//! concrete flows, traces, and the backend selector. The engine itself
//! lives in the `deltanet-core` crate.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

use core::fmt::{self, Display};

use serde::{Deserialize, Serialize};

pub mod flow;
pub mod headers;
pub mod ip;

pub use flow::{
    Flow, FlowDisposition, FlowHistory, FlowTrace, FlowTraceHop,
    ForwardingAction,
};
pub use headers::{HeaderSpace, PortRange, TcpFlags};
pub use ip::{IpError, Ipv4Addr, Ipv4Cidr};

/// Which equivalence-class representation backs the engine.
///
/// * `Deltanet`: the classic representation; live classes partition
///   header space into disjoint hyperrectangles.
/// * `DeltanetDoc`: difference of cubes; classes may nest, and each
///   class is its rectangle minus the rectangles of its descendants.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum BackendType {
    Deltanet,
    DeltanetDoc,
}

impl Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BackendType::Deltanet => write!(f, "deltanet"),
            BackendType::DeltanetDoc => write!(f, "deltanet-doc"),
        }
    }
}
