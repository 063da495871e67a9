//! fc-cri shared types - common code for the host runtime and the guest agent.
//!
//! This crate contains the pieces that must be identical on both sides of the
//! host-guest boundary: the error taxonomy, the agent wire protocol, and the
//! well-known constants (ports, drive ids, CID base).

pub mod constants;
pub mod errors;
pub mod protocol;

pub use errors::{FcError, FcResult};
