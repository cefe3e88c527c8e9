use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rmd_panel::bus::{ChannelBus, Outbound, Reply};
use rmd_panel::config::PanelConfig;
use rmd_panel::panel::RmdPanel;
use rmd_panel::rmd::{
    self, decode_pid, encode_pid, fields, FirmwareProfile, MotionCommand, PidParameters,
    BUILTIN_PROFILES, SUBSYSTEM,
};
use rmd_panel::session::{PanelEvent, Session};
use rmd_panel::state::ConnectionState;

#[derive(Parser)]
#[command(name = "rmd-panel", about = "RMD actuator command codec and control panel")]
struct Cli {
    /// Panel configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Firmware profile, overriding the config
    #[arg(short, long)]
    profile: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pack PID gains into the 64-bit wire word
    EncodePid {
        #[arg(long)]
        ip: u8,
        #[arg(long)]
        ii: u8,
        #[arg(long)]
        vp: u8,
        #[arg(long)]
        vi: u8,
        #[arg(long)]
        kp: u8,
        #[arg(long)]
        ki: u8,
    },
    /// Unpack a PID wire word (decimal or 0x-prefixed hex)
    DecodePid {
        #[arg(value_parser = parse_word)]
        word: u64,
    },
    /// Pack a motion command
    EncodeMotion {
        /// Target position [deg]
        #[arg(long, allow_hyphen_values = true)]
        position: f64,
        /// Target velocity [deg/s]
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        velocity: f64,
        #[arg(long, default_value_t = 0.0)]
        kp: f64,
        #[arg(long, default_value_t = 0.0)]
        kd: f64,
        /// Feed-forward torque [N·m]
        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        torque: f64,
        /// Saturate out-of-range inputs instead of failing
        #[arg(long)]
        clamp: bool,
    },
    /// Decode a fault bitmask
    Errors {
        #[arg(value_parser = parse_word)]
        mask: u64,
    },
    /// Decode a run state index
    State { index: i64 },
    /// List built-in firmware profiles, or print one as TOML
    Profiles { name: Option<String> },
    /// Run a panel session against an in-process loopback device
    Simulate {
        /// Target position [deg]
        #[arg(long, default_value_t = 90.0, allow_hyphen_values = true)]
        position: f64,
        /// How long to run [ms]
        #[arg(long, default_value_t = 4000)]
        duration_ms: u64,
    },
}

fn parse_word(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid word {}: {}", text, e))
}

/// Load the config file, if any, and apply command line overrides
///
/// Runs before tracing is set up, so it must not log.
fn resolve_config(cli: &Cli) -> Result<PanelConfig> {
    let mut config = match &cli.config {
        Some(path) => PanelConfig::load(path)?,
        None => PanelConfig::default(),
    };
    if let Some(profile) = &cli.profile {
        config.profile = profile.clone();
        config.profile_path = None;
    }
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    match &cli.config {
        Some(path) => info!("Loaded config from {}", path.display()),
        None => info!("No config file, using defaults"),
    }

    let profile = config
        .firmware_profile()
        .context("Failed to select firmware profile")?;

    match cli.command {
        Command::EncodePid {
            ip,
            ii,
            vp,
            vi,
            kp,
            ki,
        } => {
            let word = encode_pid(&PidParameters {
                ip,
                ii,
                vp,
                vi,
                kp,
                ki,
            });
            println!("0x{:016X} ({})", word, word);
        }
        Command::DecodePid { word } => {
            let pid = decode_pid(word);
            println!(
                "ip={} ii={} vp={} vi={} kp={} ki={}",
                pid.ip, pid.ii, pid.vp, pid.vi, pid.kp, pid.ki
            );
        }
        Command::EncodeMotion {
            position,
            velocity,
            kp,
            kd,
            torque,
            clamp,
        } => {
            let mut command = MotionCommand::new(position, velocity, kp, kd, torque);
            if clamp {
                command = command.clamped(&profile.motion);
            }
            let word = command.encode(&profile.motion)?;
            println!("word    0x{:016X}", word.value());
            println!("value   0x{:08X}", word.low());
            println!("address 0x{:08X}", word.high());
            println!(
                "codes   pos={} vel={} kp={} kd={} t={}",
                word.position_code(),
                word.velocity_code(),
                word.position_gain_code(),
                word.velocity_gain_code(),
                word.feed_forward_code()
            );
        }
        Command::Errors { mask } => {
            let mask = u32::try_from(mask).context("Error mask wider than 32 bits")?;
            println!(
                "{}",
                rmd::describe_errors(mask, &profile, &ConnectionState::Connected)
            );
        }
        Command::State { index } => {
            println!(
                "{}",
                rmd::describe_state(index, &profile, &ConnectionState::Connected)
            );
        }
        Command::Profiles { name: None } => {
            for name in BUILTIN_PROFILES {
                let p = FirmwareProfile::builtin(name)?;
                println!(
                    "{:<12} states={} errors={} poll={}ms guard={}ms",
                    p.name,
                    p.states.len(),
                    p.errors.len(),
                    p.poll_period_ms,
                    p.guard_timeout_ms
                );
            }
        }
        Command::Profiles { name: Some(name) } => {
            let p = FirmwareProfile::builtin(&name)?;
            print!("{}", toml::to_string_pretty(&p).context("Failed to render profile")?);
        }
        Command::Simulate {
            position,
            duration_ms,
        } => simulate(&config, profile, position, Duration::from_millis(duration_ms)).await?,
    }

    Ok(())
}

/// Drive a session against a loopback device that answers polls and
/// prints every outbound message
async fn simulate(
    config: &PanelConfig,
    profile: FirmwareProfile,
    position: f64,
    duration: Duration,
) -> Result<()> {
    let (bus, mut outbound) = ChannelBus::new();
    let (events, events_rx) = mpsc::unbounded_channel();
    let (replies, replies_rx) = mpsc::unbounded_channel();

    let panel = RmdPanel::new(bus, config.instance, profile)
        .with_baudrate_write(config.enable_baudrate_write);
    let session = tokio::spawn(Session::new(panel, config.link_timeout()).run(events_rx, replies_rx));

    let start = Instant::now();
    let device = tokio::spawn(async move {
        let mut pid = 0i64;
        while let Some(message) = outbound.recv().await {
            println!("{:>6} ms  {}", start.elapsed().as_millis(), message);
            let answer = match message {
                Outbound::Command {
                    field, instance, ..
                } => {
                    let value = match field {
                        fields::CONNECTED => Some(1),
                        fields::VOLTAGE => Some(240),
                        fields::ERRORS | fields::STATE => Some(0),
                        fields::PID => Some(pid),
                        _ => None,
                    };
                    value.map(|v| Reply::new(SUBSYSTEM, field, instance, v))
                }
                Outbound::Value {
                    field: fields::PID,
                    value,
                    ..
                } => {
                    pid = value;
                    None
                }
                Outbound::Value { .. } => None,
            };
            if let Some(reply) = answer {
                if replies.send(reply).is_err() {
                    break;
                }
            }
        }
    });

    events.send(PanelEvent::Show)?;
    events.send(PanelEvent::ReadPid)?;
    events.send(PanelEvent::Motion(MotionCommand::new(position, 0.0, 50.0, 1.0, 0.0)))?;

    tokio::time::sleep(duration).await;
    drop(events);

    let panel = session.await.context("Session task panicked")??;
    info!(
        "Simulation done: connection={:?} run_state={:?} errors={:?}",
        panel.connection(),
        panel.run_state(),
        panel.error_text()
    );
    if panel.guard().is_armed() {
        warn!("Motion guard still armed at exit");
    }
    drop(panel);
    device.await.context("Loopback device task panicked")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_word() {
        assert_eq!(parse_word("0x10"), Ok(16));
        assert_eq!(parse_word("0XfF"), Ok(255));
        assert_eq!(parse_word("42"), Ok(42));
        assert!(parse_word("0xZZ").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "rmd-panel",
            "--profile",
            "rmd-legacy",
            "encode-motion",
            "--position",
            "-90",
            "--torque",
            "-2.5",
            "--clamp",
        ])
        .unwrap();
        assert_eq!(cli.profile.as_deref(), Some("rmd-legacy"));
        assert!(matches!(
            cli.command,
            Command::EncodeMotion { clamp: true, .. }
        ));
    }

    #[test]
    fn test_resolve_config_applies_profile_override() {
        let path = std::env::temp_dir().join(format!("rmd-panel-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "instance = 3\nprofile = \"rmd-x\"\nprofile_path = \"/nonexistent.toml\"\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "rmd-panel",
            "--config",
            path.to_str().unwrap(),
            "--profile",
            "rmd-legacy",
            "profiles",
        ])
        .unwrap();
        let config = resolve_config(&cli).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.instance, 3);
        assert_eq!(config.profile, "rmd-legacy");
        assert_eq!(config.profile_path, None);
    }

    #[test]
    fn test_resolve_config_defaults_without_file() {
        let cli = Cli::try_parse_from(["rmd-panel", "profiles"]).unwrap();
        assert_eq!(resolve_config(&cli).unwrap(), PanelConfig::default());
    }
}
