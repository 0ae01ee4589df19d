// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Forwarding rules.
//!
//! A rule is a link, a rectangle of headers it applies to, and a
//! priority. FIB rows become rules whose rectangle constrains only
//! the destination-IP axis and whose priority is the prefix length,
//! so longest-prefix match falls out of plain priority comparison.
//! ACL lines become rules on the ACL node's drop or forward link with
//! priority `N - lineIndex`; the synthesized default deny sits at
//! priority 0 beneath them all.

use core::fmt::{self, Display};

use crate::dataplane::{AclLine, FibRow, LineAction, NodeIface};
use crate::graph::Graph;
use crate::rect::HyperRectangle;
use crate::space::GeometricSpaceFactory;
use crate::BuildError;

#[derive(Clone, Debug)]
pub struct Rule {
    pub link: usize,
    pub rect: HyperRectangle,
    pub priority: u32,
}

impl Rule {
    /// The rule for one FIB row: forward the prefix out the row's
    /// interface (which may be the router's null link).
    pub fn from_fib(
        factory: &GeometricSpaceFactory,
        graph: &Graph,
        router: &str,
        fib: &FibRow,
    ) -> Result<Self, BuildError> {
        let nip = NodeIface::new(router, fib.out_iface.as_str());
        let link = *graph.link_map.get(&nip).ok_or_else(|| {
            BuildError::UnknownInterface {
                router: router.to_string(),
                iface: fib.out_iface.clone(),
            }
        })?;

        let full = factory.full_space();
        let mut bounds = full.bounds().to_vec();
        let (lo, hi) = fib.prefix.interval();
        bounds[0] = lo;
        bounds[1] = hi;

        Ok(Self {
            link,
            rect: HyperRectangle::new(bounds),
            priority: u32::from(fib.prefix.prefix_len()),
        })
    }

    /// The rule for one ACL line. Lines whose predicates fan out into
    /// several rectangles are truncated to the first one, which
    /// underapproximates the matched set; kept for compatibility with
    /// the reference behavior.
    pub fn from_acl_line(
        factory: &GeometricSpaceFactory,
        acl_name: &str,
        line: &AclLine,
        drop_link: usize,
        accept_link: usize,
        priority: u32,
    ) -> Result<Self, BuildError> {
        let space = factory.from_acl(line);
        let rect = space.rectangles().first().cloned().ok_or_else(|| {
            BuildError::EmptyAclLine {
                acl: acl_name.to_string(),
                line: line.name.clone(),
            }
        })?;

        let link = match line.action {
            LineAction::Accept => accept_link,
            LineAction::Deny => drop_link,
        };

        Ok(Self { link, rect, priority })
    }

    /// The default deny appended below every ACL's explicit lines.
    pub fn default_deny(
        factory: &GeometricSpaceFactory,
        drop_link: usize,
    ) -> Self {
        Self { link: drop_link, rect: factory.full_space(), priority: 0 }
    }
}

impl Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "link={} prio={} {}", self.link, self.priority, self.rect)
    }
}
