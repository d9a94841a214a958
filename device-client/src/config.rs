use crate::quic::ReconnectPolicy;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "device-client", version, about = "Edge camera control client")]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect to the server and serve control events (default)
    Run,
    /// Capture loop of a stream producer; frames go to stdout as JSON Lines
    #[command(hide = true)]
    Produce(ProduceArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ProduceArgs {
    #[arg(long)]
    pub model: String,
}

#[derive(Debug, Clone, Args)]
pub struct Config {
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub server_host: String,

    #[arg(long, env = "SERVER_PORT", default_value_t = 3001)]
    pub server_port: u16,

    /// Base storage directory, `~/.edgecam` when unset
    #[arg(long, env = "EDGECAM_HOME")]
    pub edgecam_home: Option<PathBuf>,

    #[arg(long, env = "CLIENT_ID", default_value = "id-camera")]
    pub client_id: String,

    #[arg(long, env = "CONNECT_ATTEMPTS", default_value_t = 5)]
    pub connect_attempts: u32,

    #[arg(long, env = "CONNECT_DELAY_SECS", default_value_t = 2)]
    pub connect_delay_secs: u64,

    #[arg(
        long,
        env = "FRAME_QUEUE_CAPACITY",
        default_value_t = 8,
        value_parser = clap::value_parser!(u16).range(1..=4096)
    )]
    pub frame_queue_capacity: u16,

    #[arg(long, env = "TEARDOWN_TIMEOUT_MS", default_value_t = 2000)]
    pub teardown_timeout_ms: u64,

    #[arg(long, env = "CAMERA_FPS", default_value_t = 30)]
    pub camera_fps: u32,
}

impl Config {
    pub fn home(&self) -> PathBuf {
        self.edgecam_home.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".edgecam")
        })
    }

    /// Resolves `SERVER_HOST:SERVER_PORT`, accepting host names as well as
    /// literal addresses.
    pub fn server_addr(&self) -> Result<SocketAddr> {
        let target = format!("{}:{}", self.server_host, self.server_port);
        target
            .to_socket_addrs()
            .with_context(|| format!("Invalid server address: {}", target))?
            .next()
            .with_context(|| format!("No address for {}", target))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            attempts: self.connect_attempts.max(1),
            delay: Duration::from_secs(self.connect_delay_secs),
        }
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_produce_subcommand_takes_global_options_first() {
        let cli = Cli::try_parse_from([
            "device-client",
            "--edgecam-home",
            "/tmp/edgecam",
            "--camera-fps",
            "15",
            "produce",
            "--model",
            "mobilenet",
        ])
        .unwrap();

        assert_eq!(cli.config.home(), PathBuf::from("/tmp/edgecam"));
        assert_eq!(cli.config.camera_fps, 15);
        match cli.command {
            Some(Command::Produce(args)) => assert_eq!(args.model, "mobilenet"),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_frame_queue_capacity_is_bounded() {
        let cli = Cli::try_parse_from(["device-client", "--frame-queue-capacity", "64"]).unwrap();
        assert_eq!(cli.config.frame_queue_capacity, 64);

        for value in ["0", "4097", "18446744073709551615"] {
            let result = Cli::try_parse_from(["device-client", "--frame-queue-capacity", value]);
            assert!(result.is_err(), "accepted {}", value);
        }
    }

    #[test]
    fn test_reconnect_policy_from_flags() {
        let cli = Cli::try_parse_from([
            "device-client",
            "--connect-attempts",
            "3",
            "--connect-delay-secs",
            "1",
            "--server-host",
            "127.0.0.1",
            "--server-port",
            "4000",
        ])
        .unwrap();

        let policy = cli.config.reconnect_policy();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.delay, Duration::from_secs(1));
        assert_eq!(cli.config.server_addr().unwrap(), "127.0.0.1:4000".parse().unwrap());
    }
}
