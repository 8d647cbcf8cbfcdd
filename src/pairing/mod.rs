//! Device pairing for the bridge gateway.
//!
//! A trusted local caller mints a short one-time code, a remote device
//! redeems it for a long-lived bearer credential, and every later request
//! presents that credential for validation.

pub mod code;
pub mod events;
pub mod persist;
mod service;
pub mod sweeper;
pub mod token;

pub use code::PairingCode;
pub use events::PairingEvent;
pub use persist::{PersistedState, spawn_autosave};
pub use service::PairingService;
pub use sweeper::{SweepStats, Sweeper};
pub use token::{Credential, DEFAULT_PERMISSIONS, Permission, hash_token};
