use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "periscope",
    author,
    version,
    about = "Signaling and pairing server for pooled recording agents"
)]
pub struct Cli {
    /// Address to bind the listener to.
    #[arg(long, env = "PERISCOPE_LISTEN_ADDR", default_value = "127.0.0.1:8000")]
    pub listen_addr: String,

    /// How long detached pairing entries are kept for late result delivery.
    #[arg(long, env = "PERISCOPE_CLAIM_RETENTION_SECS", default_value_t = 3600)]
    pub claim_retention_secs: u64,

    /// Interval between retention sweeps of the pairing table.
    #[arg(long, env = "PERISCOPE_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Maximum time to wait for a claimed slot's agent to attach before
    /// failing the start. 0 disables the timeout.
    #[arg(long, env = "PERISCOPE_ATTACH_TIMEOUT_SECS", default_value_t = 0)]
    pub attach_timeout_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "PERISCOPE_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub claim_retention: Duration,
    pub sweep_interval: Duration,
    pub attach_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let attach_timeout = match cli.attach_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Ok(ServerConfig {
            listen_addr,
            claim_retention: Duration::from_secs(cli.claim_retention_secs),
            sweep_interval: Duration::from_secs(cli.sweep_interval_secs),
            attach_timeout,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_into_a_config() {
        let cli = Cli::parse_from(["periscope"]);
        let config = ServerConfig::try_from(cli).expect("defaults are valid");
        assert_eq!(config.listen_addr.port(), 8000);
        assert_eq!(config.attach_timeout, None);
        assert_eq!(config.claim_retention, Duration::from_secs(3600));
    }

    #[test]
    fn attach_timeout_zero_means_disabled() {
        let cli = Cli::parse_from(["periscope", "--attach-timeout-secs", "30"]);
        let config = ServerConfig::try_from(cli).expect("valid");
        assert_eq!(config.attach_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn bad_listen_addr_is_rejected() {
        let cli = Cli::parse_from(["periscope", "--listen-addr", "not-an-addr"]);
        assert!(ServerConfig::try_from(cli).is_err());
    }
}
