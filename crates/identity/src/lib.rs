//! Officer identity for the kill-switch control plane.
//!
//! Holds every enrolled officer's public key share and revocation status, and
//! derives the group verification key that receiving platforms are
//! provisioned with. Officers are enrolled by an external process; this crate
//! never sees officer private keys.

pub mod error;
pub mod officer;
pub mod store;

pub use error::{IdentityError, Result};
pub use officer::{OfficerIdentity, Revocation};
pub use store::KeyShareStore;
