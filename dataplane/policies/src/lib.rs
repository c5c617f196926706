//! Network policy state for the NPM dataplane.
//!
//! The [`PolicyStore`] holds staged policies alongside the versions installed on the host.
//! Policies reference ipsets by name; those references are registered with the
//! [`IpSetStore`](npm_dataplane_ipsets::IpSetStore) when a policy is staged, so that referenced
//! sets cannot be deleted, but they are only validated when a plan is made. Sets and policies may
//! be observed in any order.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod diff;
mod store;


pub use self::{
    diff::{apply_edits, rule_edits},
    store::{PolicyPlan, PolicyStore},
};
