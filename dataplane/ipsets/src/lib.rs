//! IPSet state for the NPM dataplane.
//!
//! The [`IpSetStore`] holds every address set staged on the node alongside the content last
//! applied to the host. Sets come in two kinds:
//!
//! - A `Set` holds IP members, each owned by the pod key that added it.
//! - A `List` holds other sets by name. Lists may nest but may not form cycles.
//!
//! Sets are referenced by lists and by network policies. A referenced set cannot be deleted; the
//! store counts referrers by name so that a policy may reference a set before it is created.
//!
//! ```text
//! [ NetworkPolicy ] -> [ List ] -> [ Set ] <- [ Pod IP ]
//!         \_____________________________/
//! ```
//!
//! The [`PodTracker`] maps each pod key to its current IP and the sets it joined, so that when a
//! pod's IP changes the old IP is retracted everywhere before the new one is added.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod pod;
mod store;

#[cfg(test)]
mod tests;

pub use self::{
    pod::{PodMembership, PodTracker},
    store::{IpSetStore, IpSetView, Referrer, SetPlan},
};
