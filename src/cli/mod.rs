//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running the pairing server (`serve`)
//! - Inspecting and revoking paired devices (`devices list`, `devices revoke`)

mod devices;
mod serve;

pub use devices::{DevicesCommand, run_devices_command};
pub use serve::{ServeArgs, run_serve_command};

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::AuthConfig;

#[derive(Parser, Debug)]
#[command(name = "bridge-auth")]
#[command(about = "Pair mobile devices with this machine and manage their access tokens")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Credential file (defaults to BRIDGE_AUTH_STORAGE_PATH, then ~/.echohelix/auth.json)
    #[arg(short, long, global = true)]
    pub storage: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the pairing HTTP server
    Serve(ServeArgs),

    /// Manage paired devices
    #[command(subcommand)]
    Devices(DevicesCommand),
}

impl Cli {
    /// Resolve the service configuration for this invocation.
    ///
    /// The CLI always persists: without an explicit path the default
    /// location is used.
    pub fn auth_config(&self) -> anyhow::Result<AuthConfig> {
        let mut config = AuthConfig::from_env()?;
        if let Some(path) = &self.storage {
            config.storage_path = Some(path.clone());
        }
        if config.storage_path.is_none() {
            config.storage_path = Some(AuthConfig::default_storage_path());
        }
        Ok(config)
    }
}
