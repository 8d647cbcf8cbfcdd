//! Device management CLI commands.
//!
//! These operate on the credential file directly, so they work while the
//! server is stopped. A running server does not see the change until it
//! restarts.

use clap::Subcommand;

use crate::config::AuthConfig;
use crate::pairing::{Credential, PairingService};

#[derive(Subcommand, Debug, Clone)]
pub enum DevicesCommand {
    /// List devices with a live credential
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Revoke the credential bound to a device
    Revoke {
        /// Device identifier
        device_id: String,
    },
}

/// Run a devices command.
pub async fn run_devices_command(cmd: DevicesCommand, config: AuthConfig) -> anyhow::Result<()> {
    let service = PairingService::open(config).await;
    match cmd {
        DevicesCommand::List { json } => list_devices(&service, json).await,
        DevicesCommand::Revoke { device_id } => revoke_device(&service, &device_id).await,
    }
}

async fn list_devices(service: &PairingService, json: bool) -> anyhow::Result<()> {
    let devices = service.list_active().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No paired devices.");
        return Ok(());
    }

    println!("Paired devices ({}):", devices.len());
    println!();
    for credential in &devices {
        println!("{}", format_device(credential));
    }
    Ok(())
}

async fn revoke_device(service: &PairingService, device_id: &str) -> anyhow::Result<()> {
    if !service.revoke_device(device_id).await {
        anyhow::bail!("No paired device with ID '{}'", device_id);
    }
    service.save().await?;
    println!("Revoked device '{}'.", device_id);
    Ok(())
}

fn format_device(credential: &Credential) -> String {
    let name = if credential.device_name.is_empty() {
        "(unnamed)"
    } else {
        credential.device_name.as_str()
    };
    format!(
        "  {:<24} {:<20} last used {}  expires {}  [{}]",
        credential.device_id,
        name,
        credential.last_used_at.format("%Y-%m-%d %H:%M"),
        credential.expires_at.format("%Y-%m-%d"),
        credential.fingerprint(),
    )
}
