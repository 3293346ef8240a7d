// xtralien -- command-line client for Xtralien instruments.
//
// Usage:
//   xtralien discover
//   xtralien discover --broadcast 192.168.1.255 --timeout-ms 500
//   xtralien send --host 192.168.1.20 smu1 measure
//   xtralien send --port-path /dev/ttyACM0 --no-response smu1 set voltage 1.5
//   xtralien serial --host 192.168.1.20
//   xtralien ports

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use xtralien_core::config::{Config, ConfigBuilder};
use xtralien_devices::{available_ports, CallOptions, Device, DiscoveryOptions, Format};

/// Talk to Xtralien instruments over the network or USB.
#[derive(Parser)]
#[command(name = "xtralien", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `xtralien_devices=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

/// Which instrument to talk to. With neither flag the first one found is used.
#[derive(Args)]
struct Target {
    /// Network address of the instrument
    #[arg(long, conflicts_with = "port_path")]
    host: Option<String>,

    /// Serial port of a USB instrument (e.g. /dev/ttyACM0, COM3)
    #[arg(long)]
    port_path: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// List instruments answering a discovery broadcast.
    Discover {
        /// Address to send the probe to
        #[arg(long)]
        broadcast: Option<String>,

        /// Quiet period that ends discovery
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Send one command and print the reply as JSON.
    Send {
        #[command(flatten)]
        target: Target,

        /// Reply format: auto, strip, array, matrix, number or none
        #[arg(long, default_value = "auto", value_parser = parse_format)]
        format: Format,

        /// Do not wait for a reply
        #[arg(long)]
        no_response: bool,

        /// Command tokens, e.g. `smu1 measure`
        #[arg(required = true)]
        tokens: Vec<String>,
    },

    /// Print the decoded serial number.
    Serial {
        #[command(flatten)]
        target: Target,
    },

    /// List serial ports on this host.
    Ports,
}

fn parse_format(s: &str) -> std::result::Result<Format, String> {
    s.parse().map_err(|e| format!("{e}"))
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut builder = ConfigBuilder::new().with_environment_prefix("XTRALIEN");
    if let Some(path) = &cli.config {
        builder = builder.with_config_file(path);
    }
    let mut config = builder.build().context("loading configuration")?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    Ok(config)
}

async fn connect(target: &Target, config: &Config) -> Result<Device> {
    let device = match (&target.host, &target.port_path) {
        (Some(host), _) => Device::network_with_config(host, config)
            .await
            .with_context(|| format!("connecting to {host}"))?,
        (None, Some(path)) => Device::open(Some(path), None, config)
            .await
            .with_context(|| format!("opening {path}"))?,
        (None, None) => Device::try_first(config)
            .await
            .context("looking for an instrument")?,
    };
    debug!(device = %device, "Connected");
    Ok(device)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    xtralien_core::init_with_config(&config)?;
    xtralien_devices::init()?;

    match cli.command {
        Command::Discover {
            broadcast,
            timeout_ms,
        } => {
            let mut options = DiscoveryOptions::from(&config);
            if let Some(address) = broadcast {
                options = options.with_broadcast_address(address);
            }
            if let Some(ms) = timeout_ms {
                options = options.with_timeout(Duration::from_millis(ms));
            }

            let devices = xtralien_devices::discover(&options, &config).await?;
            let endpoints: Vec<_> = devices.iter().filter_map(Device::endpoint).collect();
            println!("{}", serde_json::to_string_pretty(&endpoints)?);
            for device in devices {
                device.close().await?;
            }
        }

        Command::Send {
            target,
            format,
            no_response,
            tokens,
        } => {
            let device = connect(&target, &config).await?;
            let mut options = CallOptions::new().with_format(format);
            if no_response {
                options = options.no_response();
            }

            let reply = device.call(&tokens, options).await;
            device.close().await?;
            println!("{}", serde_json::to_string_pretty(&reply?)?);
        }

        Command::Serial { target } => {
            let device = connect(&target, &config).await?;
            let serial = device.serial_number().await;
            device.close().await?;
            println!("{}", serde_json::to_string_pretty(&serial?)?);
        }

        Command::Ports => {
            for port in available_ports()? {
                println!("{port}");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_send_arguments() {
        let cli = Cli::parse_from([
            "xtralien", "send", "--host", "10.0.0.2", "--format", "array", "smu1", "measure",
        ]);
        match cli.command {
            Command::Send {
                target,
                format,
                no_response,
                tokens,
            } => {
                assert_eq!(target.host.as_deref(), Some("10.0.0.2"));
                assert_eq!(format, Format::Array);
                assert!(!no_response);
                assert_eq!(tokens, ["smu1", "measure"]);
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn test_rejects_unknown_format_and_two_targets() {
        assert!(Cli::try_parse_from(["xtralien", "send", "--format", "csv", "x"]).is_err());
        assert!(Cli::try_parse_from([
            "xtralien", "serial", "--host", "10.0.0.2", "--port-path", "COM3"
        ])
        .is_err());
    }

    #[test]
    fn test_log_level_overrides_config() {
        let cli = Cli::parse_from(["xtralien", "--log-level", "trace", "ports"]);
        assert_eq!(load_config(&cli).unwrap().logging.level, "trace");
    }
}
