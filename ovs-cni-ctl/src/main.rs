//! ovs-cni-ctl
//!
//! Operator tool over the bridge driver:
//! - list bridges, bridge ports and errored interfaces
//! - look up, add and delete container ports
//! - stream table updates from a monitor

use anyhow::{Context, Result};
use clap::Parser;
use ovs_bridge::{BridgeDriver, DriverConfig, OvsDriver, PortRequest};
use ovs_ovsdb::{NotificationHandler, TableUpdates};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "ovs-cni-ctl")]
#[command(about = "Manage CNI container ports on Open vSwitch bridges")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// JSON driver configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Comma-separated OVSDB endpoints (overrides the config file)
    #[arg(short, long)]
    endpoints: Option<String>,

    /// Ownership marker for created and deleted ports
    #[arg(long)]
    owner: Option<String>,

    /// Connect and call timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// List bridge names
    Bridges,
    /// List the ports attached to a bridge
    Ports {
        #[arg(short, long, default_value = "br0")]
        bridge: String,
    },
    /// List interfaces reporting an error
    Errors,
    /// Find the port created for a container interface
    Lookup {
        /// Container network namespace path
        #[arg(long)]
        netns: String,
        /// Interface name inside the container
        #[arg(long, default_value = "eth0")]
        cont_iface: String,
    },
    /// Show the link state of a port's interface
    State { port: String },
    /// Create a port and attach it to a bridge
    AddPort {
        /// Host-side interface name
        name: String,
        #[arg(short, long, default_value = "br0")]
        bridge: String,
        #[arg(long)]
        netns: String,
        #[arg(long, default_value = "eth0")]
        cont_iface: String,
        /// Access VLAN tag (0 for untagged)
        #[arg(long, default_value_t = 0)]
        vlan: u16,
        /// Trunk VLANs, comma separated
        #[arg(long, value_delimiter = ',')]
        trunks: Vec<u16>,
        /// Explicit vlan_mode
        #[arg(long)]
        vlan_mode: Option<String>,
        /// OVN logical port written to external_ids:iface-id
        #[arg(long)]
        ovn_port: Option<String>,
        /// Interface type, e.g. internal or dpdk
        #[arg(long = "type")]
        iface_type: Option<String>,
        #[arg(long)]
        ofport: Option<u16>,
    },
    /// Delete a port this owner created
    DelPort {
        name: String,
        #[arg(short, long, default_value = "br0")]
        bridge: String,
    },
    /// Print table updates until interrupted
    Watch,
}

impl Args {
    fn driver_config(&self) -> Result<DriverConfig> {
        let mut config = match &self.config {
            Some(path) => DriverConfig::from_file(path)?,
            None => DriverConfig::default(),
        };
        if let Some(endpoints) = &self.endpoints {
            config.endpoints = endpoints.clone();
        }
        if let Some(owner) = &self.owner {
            config.owner = owner.clone();
        }
        if let Some(timeout) = self.timeout {
            config.timeout_seconds = timeout;
        }
        Ok(config)
    }
}

/// Prints every monitor update as one JSON line
struct UpdatePrinter {
    closed: Notify,
}

impl NotificationHandler for UpdatePrinter {
    fn update(&self, context: &Value, updates: &TableUpdates) {
        print_updates(context, updates);
    }

    fn disconnected(&self) {
        self.closed.notify_one();
    }
}

fn print_updates(context: &Value, updates: &TableUpdates) {
    for (table, rows) in updates {
        for (uuid, update) in rows {
            let kind = match (&update.old, &update.new) {
                (None, Some(_)) => "insert",
                (Some(_), None) => "delete",
                _ => "modify",
            };
            let line = json!({
                "monitor": context,
                "table": table,
                "uuid": uuid.to_string(),
                "action": kind,
                "row": update.new.as_ref().or(update.old.as_ref()),
            });
            println!("{}", line);
        }
    }
}

fn print_list(items: &[String]) {
    for item in items {
        println!("{}", item);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ovs_cni_ctl=info".parse()?)
                .add_directive("ovs_bridge=info".parse()?)
                .add_directive("ovs_ovsdb=warn".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = args.driver_config()?;

    match args.command {
        Commands::Bridges => {
            let driver = OvsDriver::connect(&config).await?;
            print_list(&driver.bridge_list().await?);
            driver.close().await;
        }
        Commands::Ports { bridge } => {
            let driver = OvsDriver::connect(&config).await?;
            print_list(&driver.list_bridge_ports(&bridge).await?);
            driver.close().await;
        }
        Commands::Errors => {
            let driver = OvsDriver::connect(&config).await?;
            print_list(&driver.find_interfaces_with_error().await?);
            driver.close().await;
        }
        Commands::Lookup { netns, cont_iface } => {
            let driver = OvsDriver::connect(&config).await?;
            match driver.get_ovs_port_for_cont_iface(&cont_iface, &netns).await? {
                Some(port) => println!("{}", port),
                None => warn!("No port owned by '{}' for {}:{}", config.owner, netns, cont_iface),
            }
            driver.close().await;
        }
        Commands::State { port } => {
            let driver = OvsDriver::connect(&config).await?;
            println!("{}", driver.get_of_port_op_state(&port).await?);
            driver.close().await;
        }
        Commands::AddPort {
            name,
            bridge,
            netns,
            cont_iface,
            vlan,
            trunks,
            vlan_mode,
            ovn_port,
            iface_type,
            ofport,
        } => {
            let driver = BridgeDriver::connect(&config, bridge).await?;
            let mut request = PortRequest::new(name, netns, cont_iface)
                .vlan_tag(vlan)
                .trunks(trunks);
            request.port_type = vlan_mode;
            request.ovn_port_name = ovn_port;
            request.interface_type = iface_type;
            request.ofport_request = ofport;

            let uuid = driver
                .create_port(&request)
                .await
                .with_context(|| format!("adding port {}", request.intf_name))?;
            println!("{}", uuid);
            driver.close().await;
        }
        Commands::DelPort { name, bridge } => {
            let driver = BridgeDriver::connect(&config, bridge).await?;
            if let Err(e) = driver.delete_port(&name).await {
                warn!("{}", e.suggestion());
                return Err(e).with_context(|| format!("deleting port {}", name));
            }
            driver.close().await;
        }
        Commands::Watch => {
            let driver = OvsDriver::connect(&config).await?;
            let printer = Arc::new(UpdatePrinter {
                closed: Notify::new(),
            });
            driver.client().register(printer.clone());

            let initial = driver.client().monitor_all("ovs-cni-ctl").await?;
            print_updates(&json!("ovs-cni-ctl"), &initial);
            info!("Watching {} ({} tables)", config.endpoints, initial.len());

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    driver.close().await;
                }
                _ = printer.closed.notified() => {
                    anyhow::bail!("connection to {} lost", config.endpoints);
                }
            }
        }
    }

    Ok(())
}
