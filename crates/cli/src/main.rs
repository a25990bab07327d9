// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 sshfwd Contributors

// sshfwd - CLI
// Edit tunnel definitions and run them in the foreground

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sshfwd_common::network::DEFAULT_BIND_ADDRESS;
use sshfwd_common::{
    find_config_file, format_host_port, is_loopback_address, BastionConfig, ConfigLoader, Endpoint,
    Error as ConfigError, TunnelConfig, TunnelState, TunnelStatus,
};
use sshfwd_engine::{EngineSettings, TunnelManager};

#[derive(Parser)]
#[command(name = "sshfwd")]
#[command(about = "Forward local ports through SSH", long_about = None)]
#[command(version)]
struct Cli {
    /// Tunnel definitions file (default: ./.sshfwd.yaml, then ~/.local/state/sshfwd/config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured tunnels
    List {
        /// Only tunnels with this tag
        #[arg(short, long)]
        tag: Option<String>,
    },

    /// Add a tunnel definition
    Add {
        /// Tunnel name (also its id)
        name: String,

        /// Local port to listen on
        #[arg(short, long)]
        local_port: u16,

        /// Host to reach (the SSH server itself when no bastion is given)
        #[arg(short = 'H', long)]
        remote_host: String,

        /// Port to reach on the remote side
        #[arg(short = 'p', long)]
        remote_port: u16,

        /// Local bind address (default: 0.0.0.0)
        #[arg(short, long)]
        bind_address: Option<String>,

        /// Grouping tag
        #[arg(short, long)]
        tag: Option<String>,

        /// Jump host as [user@]host[:port]
        #[arg(long)]
        bastion: Option<String>,
    },

    /// Remove a tunnel definition
    Remove {
        /// Tunnel name
        name: String,
    },

    /// Start tunnels and keep them running until Ctrl+C
    Up {
        /// Tunnel names (default: all)
        names: Vec<String>,

        /// Only tunnels with this tag
        #[arg(short, long)]
        tag: Option<String>,

        /// Seconds between metrics lines (0 disables them)
        #[arg(short, long, default_value = "5")]
        stats_interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "sshfwd=debug,sshfwd_engine=debug,sshfwd_common=debug"
    } else {
        "sshfwd=info,sshfwd_engine=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let path = find_config_file(cli.config.as_deref()).context("Failed to locate config file")?;
    debug!("Using config file {}", path.display());
    let loader = ConfigLoader::new(path);

    match cli.command {
        Commands::List { tag } => list_tunnels(&loader, tag.as_deref()),
        Commands::Add {
            name,
            local_port,
            remote_host,
            remote_port,
            bind_address,
            tag,
            bastion,
        } => {
            let bastion = match bastion {
                Some(spec) => parse_bastion(&spec)?,
                None => BastionConfig::default(),
            };
            let config = TunnelConfig {
                name,
                local_port,
                remote_port,
                remote_host,
                tag: tag.unwrap_or_default(),
                bind_address: bind_address.unwrap_or_default(),
                bastion,
            };
            add_tunnel(&loader, config)
        }
        Commands::Remove { name } => remove_tunnel(&loader, &name),
        Commands::Up {
            names,
            tag,
            stats_interval,
        } => run_tunnels(&loader, &names, tag.as_deref(), stats_interval).await,
    }
}

/// Load definitions, treating a missing file as an empty set
fn load_tunnels(loader: &ConfigLoader) -> Result<Vec<TunnelConfig>> {
    match loader.load() {
        Ok(tunnels) => Ok(tunnels),
        Err(ConfigError::ConfigRead { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            Ok(Vec::new())
        }
        Err(e) => Err(e).context(format!("Failed to load {}", loader.path().display())),
    }
}

fn parse_bastion(spec: &str) -> Result<BastionConfig> {
    let endpoint = Endpoint::parse(spec);
    if endpoint.host.is_empty() {
        return Err(ConfigError::InvalidEndpoint(spec.to_string()).into());
    }
    Ok(BastionConfig::from_endpoint(spec))
}

fn list_tunnels(loader: &ConfigLoader, tag: Option<&str>) -> Result<()> {
    let mut tunnels = load_tunnels(loader)?;
    tunnels.retain(|t| tag.map_or(true, |tag| t.tag == tag));

    if tunnels.is_empty() {
        println!("{}", "No tunnels configured.".yellow());
        println!(
            "Create one with: {}",
            "sshfwd add <name> -l <port> -H <host> -p <port>".cyan()
        );
        return Ok(());
    }

    tunnels.sort_by(|a, b| a.name.cmp(&b.name));
    println!("{}", tunnels_table(&tunnels));
    Ok(())
}

fn bind_address(tunnel: &TunnelConfig) -> &str {
    if tunnel.bind_address.is_empty() {
        DEFAULT_BIND_ADDRESS
    } else {
        &tunnel.bind_address
    }
}

fn tunnels_table(tunnels: &[TunnelConfig]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
        ["Name", "Local", "Target", "Via", "Tag"]
            .into_iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold).fg(Color::Cyan)),
    );

    for tunnel in tunnels {
        let hop = tunnel.ssh_hop();
        let via = if hop.user.is_empty() {
            hop.to_string()
        } else {
            format!("{}@{}", hop.user, hop)
        };

        table.add_row(vec![
            Cell::new(&tunnel.name).fg(Color::Green),
            Cell::new(format_host_port(bind_address(tunnel), tunnel.local_port)),
            Cell::new(tunnel.dial_target().to_string()),
            Cell::new(via),
            Cell::new(&tunnel.tag),
        ]);
    }
    table
}

fn add_tunnel(loader: &ConfigLoader, config: TunnelConfig) -> Result<()> {
    config.validate()?;

    let mut tunnels = load_tunnels(loader)?;
    if tunnels.iter().any(|t| t.name == config.name) {
        return Err(ConfigError::DuplicateTunnel(config.name).into());
    }

    let bind = bind_address(&config);
    if !is_loopback_address(bind) {
        println!(
            "{}",
            format!(
                "⚠️  Binding to {} (accessible from local network/VMs)",
                bind
            )
            .yellow()
        );
    }

    let name = config.name.clone();
    tunnels.push(config);
    loader
        .save(&tunnels)
        .with_context(|| format!("Failed to save {}", loader.path().display()))?;

    println!(
        "{} Added tunnel {} to {}",
        "✓".green(),
        name.bold(),
        loader.path().display()
    );
    Ok(())
}

fn remove_tunnel(loader: &ConfigLoader, name: &str) -> Result<()> {
    let mut tunnels = load_tunnels(loader)?;
    let before = tunnels.len();
    tunnels.retain(|t| t.name != name);
    if tunnels.len() == before {
        return Err(ConfigError::TunnelNotFound(name.to_string()).into());
    }

    loader
        .save(&tunnels)
        .with_context(|| format!("Failed to save {}", loader.path().display()))?;
    println!("{} Removed tunnel {}", "✓".green(), name.bold());
    Ok(())
}

/// Pick tunnels by explicit name, else by tag, else all of them
fn select_tunnels(
    tunnels: Vec<TunnelConfig>,
    names: &[String],
    tag: Option<&str>,
) -> std::result::Result<Vec<TunnelConfig>, ConfigError> {
    if !names.is_empty() {
        if let Some(missing) = names.iter().find(|n| !tunnels.iter().any(|t| &t.name == *n)) {
            return Err(ConfigError::TunnelNotFound(missing.clone()));
        }
        return Ok(tunnels
            .into_iter()
            .filter(|t| names.contains(&t.name))
            .collect());
    }

    Ok(tunnels
        .into_iter()
        .filter(|t| tag.map_or(true, |tag| t.tag == tag))
        .collect())
}

async fn run_tunnels(
    loader: &ConfigLoader,
    names: &[String],
    tag: Option<&str>,
    stats_interval: u64,
) -> Result<()> {
    let selected = select_tunnels(load_tunnels(loader)?, names, tag)?;
    if selected.is_empty() {
        bail!("No tunnels selected in {}", loader.path().display());
    }

    let manager = TunnelManager::with_defaults(EngineSettings::default())
        .context("Failed to initialise tunnel engine")?;
    let streams = manager
        .take_event_streams()
        .context("Event streams already taken")?;

    let mut logs = streams.logs;
    let log_printer = tokio::spawn(async move {
        while let Some(line) = logs.recv().await {
            if line.contains(" ERROR ") {
                eprintln!("{}", line.red());
            } else {
                eprintln!("{}", line.dimmed());
            }
        }
    });
    let mut statuses = streams.statuses;
    let status_printer = tokio::spawn(async move {
        while let Some(status) = statuses.recv().await {
            println!("{}", format_status(&status));
        }
    });

    let mut started = 0usize;
    for config in &selected {
        let tunnel = manager.create_tunnel(config.id(), config.clone()).await;
        match manager.start_tunnel(&tunnel).await {
            Ok(()) => {
                started += 1;
                let addr = tunnel
                    .local_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_default();
                println!(
                    "{} {} listening on {} → {}",
                    "✓".green(),
                    config.name.bold(),
                    addr,
                    config.dial_target()
                );
            }
            Err(e) => eprintln!("{} {}: {}", "✗".red(), config.name.bold(), e),
        }
    }

    if started == 0 {
        manager.cleanup().await;
        bail!("No tunnel could be started");
    }
    info!("{} tunnel(s) running, press Ctrl+C to stop", started);

    let stats_period = (stats_interval > 0).then(|| Duration::from_secs(stats_interval));
    let mut ticker = tokio::time::interval(stats_period.unwrap_or(Duration::from_secs(3600)));
    ticker.tick().await;

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                break;
            }
            _ = ticker.tick(), if stats_period.is_some() => {
                for id in manager.tunnel_ids().await {
                    println!("{} {}", format!("[{}]", id).cyan(), manager.get_metrics_snapshot(&id).await);
                }
            }
        }
    }

    println!("{}", "Stopping tunnels...".yellow());
    manager.cleanup().await;
    let _ = log_printer.await;
    let _ = status_printer.await;
    Ok(())
}

fn format_status(status: &TunnelStatus) -> String {
    let state = match status.state {
        TunnelState::Active => status.state.as_str().green(),
        TunnelState::Connecting => status.state.as_str().yellow(),
        TunnelState::Error => status.state.as_str().red(),
        TunnelState::Stopped => status.state.as_str().dimmed(),
    };
    format!("{} {} {}", format!("[{}]", status.id).cyan(), state.bold(), status.message)
}
