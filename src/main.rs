use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use leasewarden::{
    AddressFamily, Assignment, ClientId, Config, EventSink, ExpiryReaper, FanoutSink,
    JsonLinesSink, LeaseManager, LeaseSession, LogSink, Result, StoreReaper, derive_v6,
};

#[derive(Parser)]
#[command(name = "leasewarden")]
#[command(author, version, about = "A DHCP-style lease manager", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the expiry reaper until interrupted, saving leases after every sweep.
    Run,
    /// Assign an address to a client (families: v4, v6, DHCPv4, DHCPv6).
    Assign { mac: String, family: AddressFamily },
    /// Extend a client's active lease.
    Renew { mac: String, family: AddressFamily },
    /// Release a client's lease.
    Release { mac: String, family: AddressFamily },
    /// Print the IPv6 address a client would receive.
    DeriveV6 { mac: String },
    ShowConfig,
    ListLeases {
        #[arg(long)]
        family: Option<AddressFamily>,
    },
    CleanupLeases,
}

fn build_sink(config: &Config) -> Arc<dyn EventSink> {
    let mut sink = FanoutSink::new().with(Arc::new(LogSink));
    if let Some(path) = &config.events_file {
        sink = sink.with(Arc::new(JsonLinesSink::new(path)));
    }
    Arc::new(sink)
}

fn print_assignment(assignment: &Assignment) {
    let lease = &assignment.lease;
    println!("{:<16} {}", "MAC Address", lease.client);
    println!("{:<16} {}", "Family", lease.family);
    println!("{:<16} {}", "Assigned IP", lease.address);
    println!("{:<16} {} seconds", "Lease Time", lease.lease_duration_seconds);
    println!("{:<16} {}", "MAC Sum Parity", assignment.parity());
    println!(
        "{:<16} {}",
        "Expires At",
        lease.expires_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(error) = &assignment.sink_error {
        println!("{:<16} {}", "Event Error", error);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Arc::new(Config::load_or_create(&cli.config)?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting lease manager with config: {:?}", cli.config);
            info!(
                "IPv4 pool: {} - {} ({} allocatable), IPv6 prefix: {}/64",
                config.v4_range_start,
                config.v4_range_end,
                config.allocatable_v4_count(),
                config.v6_prefix
            );

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let reaper = if config.leases_file.is_some() {
                StoreReaper::new(Arc::clone(&config), build_sink(&config)).spawn(shutdown_rx)
            } else {
                let manager = Arc::new(LeaseManager::new(Arc::clone(&config), build_sink(&config)));
                ExpiryReaper::new(manager).spawn(shutdown_rx)
            };

            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal, stopping reaper...");
            let _ = shutdown_tx.send(true);
            if let Err(error) = reaper.await {
                tracing::error!("Reaper task failed: {}", error);
            }
            Ok(())
        }
        Commands::Assign { mac, family } => {
            let session = LeaseSession::open(Arc::clone(&config), build_sink(&config)).await?;
            let assignment = session.manager().assign(&mac, family).await?;
            session.commit().await?;
            print_assignment(&assignment);
            Ok(())
        }
        Commands::Renew { mac, family } => {
            let session = LeaseSession::open(Arc::clone(&config), build_sink(&config)).await?;
            let assignment = session.manager().renew(&mac, family).await?;
            session.commit().await?;
            print_assignment(&assignment);
            Ok(())
        }
        Commands::Release { mac, family } => {
            let session = LeaseSession::open(Arc::clone(&config), build_sink(&config)).await?;
            let released = session.manager().release(&mac, family).await?;
            session.commit().await?;
            println!(
                "Released {} from {}.",
                released.lease.address, released.lease.client
            );
            Ok(())
        }
        Commands::DeriveV6 { mac } => {
            let client = ClientId::parse(&mac)?;
            println!("{}", derive_v6(config.v6_prefix, &client));
            Ok(())
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&*config)?);
            Ok(())
        }
        Commands::ListLeases { family } => {
            let session = LeaseSession::open(Arc::clone(&config), build_sink(&config)).await?;
            let manager = session.manager();
            let leases = match family {
                Some(family) => manager.list_active(family).await,
                None => {
                    let mut leases = Vec::new();
                    for family in AddressFamily::ALL {
                        leases.extend(manager.list_active(family).await);
                    }
                    leases
                }
            };

            if leases.is_empty() {
                println!("No active leases.");
            } else {
                println!(
                    "{:<19} {:<6} {:<40} {:<24} {:<10}",
                    "Client", "Family", "Address", "Expires At", "Remaining"
                );
                println!("{}", "-".repeat(103));

                let now = manager.now();
                for lease in leases {
                    println!(
                        "{:<19} {:<6} {:<40} {:<24} {:<10}",
                        lease.client,
                        lease.family,
                        lease.address,
                        lease.expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
                        format!("{}s", lease.remaining_seconds_at(now))
                    );
                }
            }

            Ok(())
        }
        Commands::CleanupLeases => {
            let report = StoreReaper::new(Arc::clone(&config), build_sink(&config))
                .sweep()
                .await?;
            println!("Cleaned up {} expired lease(s).", report.reclaimed);
            Ok(())
        }
    }
}
