//! # Device Gateway CLI
//!
//! Drives the gateway against the simulated device fleet:
//! - Discover devices and show their details and resource links
//! - Read and update resources
//! - Own and disown devices
//!
//! ## Usage
//!
//! ```bash
//! # Discover devices over IPv4 and IPv6 multicast
//! device-gateway discover --ipv6
//!
//! # Read a resource
//! device-gateway get <device-id> /light/1
//!
//! # Update a resource of an unowned device
//! device-gateway update <device-id> /light/1 '{"power": 40}'
//!
//! # Own a device with a pre-shared key
//! device-gateway --psk-subject alice --psk-key 0123456789abcdef own <device-id>
//!
//! # Walk through discovery, ownership and a resource update
//! device-gateway --psk-subject alice --psk-key 0123456789abcdef demo
//! ```
//!
//! Configuration is read from the `GATEWAY_*` environment variables first;
//! command-line flags override it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use device_gateway::{DeviceGateway, SimulatedFleet};
use shared::{
    config::GatewayConfig,
    constants::{CONTENT_TYPE_JSON, RESOURCE_HREF_DEVICE},
    types::{Content, DiscoveryFilter, IpFamily},
};

#[derive(Parser)]
#[command(name = "device-gateway")]
#[command(about = "Local gateway for discovering, owning and operating IoT devices")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Pre-shared key subject to initialize the gateway with
    #[arg(long, requires = "psk_key")]
    psk_subject: Option<String>,

    /// Pre-shared key
    #[arg(long, requires = "psk_subject")]
    psk_key: Option<String>,

    /// Discovery timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover devices
    Discover {
        /// Also query the IPv6 multicast groups
        #[arg(long)]
        ipv6: bool,

        /// Unicast discovery endpoints (host or host:port)
        #[arg(long, short = 'e')]
        endpoint: Vec<String>,

        /// Keep only devices with this resource type
        #[arg(long, short = 't')]
        resource_type: Vec<String>,
    },

    /// Refresh and show one device
    Show {
        device_id: String,
    },

    /// Show the resource links of a device
    Links {
        device_id: String,
    },

    /// Read a resource
    Get {
        device_id: String,
        href: String,

        /// Interface to read through
        #[arg(long, short = 'i')]
        interface: Option<String>,
    },

    /// Update a resource with a JSON body
    Update {
        device_id: String,
        href: String,
        body: String,
    },

    /// Take ownership of a device
    Own {
        device_id: String,
    },

    /// Reset an owned device
    Disown {
        device_id: String,
    },

    /// Show the gateway configuration
    Configuration,

    /// Discover, own, update and disown every demo device that supports it
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level: Level = cli
        .log_level
        .parse()
        .with_context(|| format!("invalid log level '{}'", cli.log_level))?;
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!(version = shared::VERSION, "Starting device gateway");

    let mut config = GatewayConfig::from_env()?;
    if let Some(timeout) = cli.timeout_ms {
        config.discovery.timeout_ms = timeout;
    }
    config.validate()?;

    let fleet = SimulatedFleet::demo();
    let gateway = DeviceGateway::new(config, Arc::new(fleet))?;

    if let (Some(subject), Some(key)) = (&cli.psk_subject, &cli.psk_key) {
        gateway.initialize_with_psk(subject, key).await?;
    }

    match cli.command {
        Commands::Discover {
            ipv6,
            endpoint,
            resource_type,
        } => {
            let mut use_multicast = vec![IpFamily::V4];
            if ipv6 {
                use_multicast.push(IpFamily::V6);
            }
            if !endpoint.is_empty() {
                use_multicast.clear();
            }
            let devices = gateway
                .discover_devices(DiscoveryFilter {
                    use_multicast,
                    use_endpoints: endpoint,
                    type_filter: resource_type,
                    ..Default::default()
                })
                .await?;
            print_json(&devices)?;
        }
        Commands::Show { device_id } => {
            discover(&gateway).await?;
            print_json(&gateway.get_device(&device_id).await?)?;
        }
        Commands::Links { device_id } => {
            discover(&gateway).await?;
            print_json(&gateway.get_device_resource_links(&device_id).await?)?;
        }
        Commands::Get {
            device_id,
            href,
            interface,
        } => {
            discover(&gateway).await?;
            let content = gateway
                .get_resource(&device_id, &href, interface.as_deref())
                .await?;
            print_content(&content)?;
        }
        Commands::Update {
            device_id,
            href,
            body,
        } => {
            discover(&gateway).await?;
            let content = Content::new(CONTENT_TYPE_JSON, body.into_bytes());
            let response = gateway.update_resource(&device_id, &href, &content).await?;
            print_content(&response)?;
        }
        Commands::Own { device_id } => {
            discover(&gateway).await?;
            if let Some(challenge) = gateway.own_device(&device_id).await? {
                // certificate gateways finish the transfer with a signed chain
                print_json(&challenge)?;
                return Ok(());
            }
            print_json(&gateway.get_device(&device_id).await?)?;
        }
        Commands::Disown { device_id } => {
            discover(&gateway).await?;
            gateway.own_device(&device_id).await?;
            gateway.disown_device(&device_id).await?;
            println!("Device {device_id} disowned");
        }
        Commands::Configuration => {
            print_json(&gateway.get_configuration())?;
        }
        Commands::Demo => {
            run_demo(&gateway).await?;
        }
    }

    gateway.clear_cache().await;
    Ok(())
}

/// Populate the device cache over IPv4 multicast
async fn discover(gateway: &DeviceGateway) -> Result<()> {
    let devices = gateway
        .discover_devices(DiscoveryFilter {
            use_multicast: vec![IpFamily::V4],
            ..Default::default()
        })
        .await?;
    info!(devices = devices.len(), "Discovery finished");
    Ok(())
}

async fn run_demo(gateway: &DeviceGateway) -> Result<()> {
    let devices = gateway
        .discover_devices(DiscoveryFilter {
            use_multicast: vec![IpFamily::V4, IpFamily::V6],
            ..Default::default()
        })
        .await?;
    println!("Discovered {} devices", devices.len());

    for device in devices {
        let id = device.id.to_string();
        println!("\n{id} ({:?})", device.ownership_status);

        if let Err(e) = gateway.own_device(&id).await {
            println!("  cannot own: {e}");
            continue;
        }
        println!("  owned");

        let rename = Content::new(CONTENT_TYPE_JSON, br#"{"n": "demo"}"#.to_vec());
        gateway
            .update_resource(&id, RESOURCE_HREF_DEVICE, &rename)
            .await?;
        let summary = gateway.get_device(&id).await?;
        if let Some(content) = &summary.content {
            println!("  device resource: {}", render(content)?);
        }

        gateway.disown_device(&id).await?;
        println!("  disowned");
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_content(content: &Content) -> Result<()> {
    println!("{}", render(content)?);
    Ok(())
}

/// Render device content as JSON text
fn render(content: &Content) -> Result<String> {
    if content.is_empty() {
        return Ok(String::new());
    }
    let value: serde_json::Value = if content.content_type == CONTENT_TYPE_JSON {
        serde_json::from_slice(&content.data)?
    } else {
        serde_cbor::from_slice(&content.data).context("cannot decode CBOR content")?
    };
    Ok(serde_json::to_string_pretty(&value)?)
}
