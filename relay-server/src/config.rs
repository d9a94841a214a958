use anyhow::{Context, Result};
use clap::Parser;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "relay-server", version, about = "Edge camera control and frame relay server")]
pub struct Config {
    /// Bind address for both QUIC (UDP) and HTTP (TCP)
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub server_host: String,

    #[arg(long, env = "SERVER_PORT", default_value_t = 3001)]
    pub server_port: u16,

    /// Base storage directory, `~/.edgecam` when unset
    #[arg(long, env = "EDGECAM_HOME")]
    pub edgecam_home: Option<PathBuf>,

    /// Client that HTTP control requests are sent to
    #[arg(long, env = "TARGET_CLIENT_ID", default_value = "id-camera")]
    pub target_client_id: String,

    #[arg(long, env = "CALL_TIMEOUT_SECS", default_value_t = 5)]
    pub call_timeout_secs: u64,

    /// Frames buffered per SSE subscriber before it starts skipping
    #[arg(long, env = "FRAME_BUFFER", default_value_t = 64)]
    pub frame_buffer: usize,
}

impl Config {
    pub fn home(&self) -> PathBuf {
        self.edgecam_home.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".edgecam")
        })
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let target = format!("{}:{}", self.server_host, self.server_port);
        target
            .to_socket_addrs()
            .with_context(|| format!("Invalid listen address: {}", target))?
            .next()
            .with_context(|| format!("No address for {}", target))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let config = Config::try_parse_from([
            "relay-server",
            "--server-host",
            "127.0.0.1",
            "--server-port",
            "4100",
            "--call-timeout-secs",
            "2",
            "--edgecam-home",
            "/var/lib/edgecam",
        ])
        .unwrap();

        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:4100".parse().unwrap());
        assert_eq!(config.call_timeout(), Duration::from_secs(2));
        assert_eq!(config.home(), PathBuf::from("/var/lib/edgecam"));
    }
}
