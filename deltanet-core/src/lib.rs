// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An edge-labelled graph capturing the forwarding behavior of all
//! packets in a network data plane.
//!
//! Packets are sliced into equivalence classes which get refined as
//! forwarding and ACL rules are added. Each link of the graph carries
//! the set of classes it forwards, so a reachability query reduces to
//! a per-class graph search.
//!
//! Nodes come in two flavors: routers and ACL nodes. Treating ACLs as
//! nodes of their own makes the cause of a packet drop visible in the
//! search itself -- an ACL entry is just a forwarding rule that sends
//! traffic either onward to the neighbor or to the drop node. A
//! distinguished drop node also absorbs null routes and dead-end
//! interfaces.
//!
//! The geometry lives in [`rect`] and [`space`]; collision detection
//! between classes in [`kdtree`]; the graph fabric in [`graph`]; rule
//! refinement and the search in [`engine`].

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

use core::fmt::{self, Display};

use serde::{Deserialize, Serialize};

pub mod dataplane;
pub mod engine;
pub mod graph;
pub mod kdtree;
pub mod rect;
pub mod rule;
pub mod space;


pub use deltanet_api as api;
pub use engine::ForwardingGraph;

/// The direction a filter applies to, relative to its interface.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum Direction {
    In,
    Out,
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::In => write!(f, "IN"),
            Direction::Out => write!(f, "OUT"),
        }
    }
}

/// A fatal problem with the configuration handed to construction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BuildError {
    UnknownRouter(String),
    UnknownInterface { router: String, iface: String },
    EmptyAclLine { acl: String, line: String },
}

impl Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use BuildError::*;

        match self {
            UnknownRouter(router) => {
                write!(f, "unknown router: {}", router)
            }

            UnknownInterface { router, iface } => {
                write!(f, "unknown interface: {}:{}", router, iface)
            }

            EmptyAclLine { acl, line } => {
                write!(f, "ACL {} line {} matches no packets", acl, line)
            }
        }
    }
}

impl std::error::Error for BuildError {}
