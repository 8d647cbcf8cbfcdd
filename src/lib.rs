//! Pairing-code-to-token authentication for the bridge gateway.
//!
//! [`PairingService`] owns the pairing registry and the credential store.
//! [`http::router`] exposes it over HTTP and the `bridge-auth` binary wires
//! both together with the background sweeper and autosave.

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod pairing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AuthConfig;
pub use error::{ConfigError, Error, PairingError, PersistError, Result};
pub use pairing::{Credential, PairingCode, PairingEvent, PairingService, Permission};
