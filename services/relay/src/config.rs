use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use cloudterm_provision::digitalocean::DEFAULT_BASE_URL;
use cloudterm_provision::PollPolicy;

use crate::bridge::{BridgeConfig, DEFAULT_SSH_PORT};
use crate::ssh::DEFAULT_TERM;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub ssh_port: u16,
    pub ssh_term: String,
    pub ssh_connect_timeout: Duration,
    pub provider_url: String,
    pub poll_interval: Duration,
    pub poll_max_attempts: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = parse_or(&lookup, "CLOUDTERM_LISTEN_ADDR", "127.0.0.1:3000".parse()?)?;

        let log_level = lookup("CLOUDTERM_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let ssh_port = parse_or(&lookup, "CLOUDTERM_SSH_PORT", DEFAULT_SSH_PORT)?;
        anyhow::ensure!(ssh_port != 0, "CLOUDTERM_SSH_PORT must be non-zero");

        let ssh_term = lookup("CLOUDTERM_SSH_TERM").unwrap_or_else(|| DEFAULT_TERM.to_string());

        let ssh_connect_timeout = Duration::from_secs(parse_or(
            &lookup,
            "CLOUDTERM_SSH_CONNECT_TIMEOUT_SECS",
            20u64,
        )?);

        let provider_url =
            lookup("CLOUDTERM_PROVIDER_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let defaults = PollPolicy::default();
        let poll_interval = Duration::from_secs(parse_or(
            &lookup,
            "CLOUDTERM_POLL_INTERVAL_SECS",
            defaults.interval.as_secs(),
        )?);
        let poll_max_attempts =
            parse_or(&lookup, "CLOUDTERM_POLL_MAX_ATTEMPTS", defaults.max_attempts)?;
        anyhow::ensure!(
            poll_max_attempts > 0,
            "CLOUDTERM_POLL_MAX_ATTEMPTS must be at least 1"
        );

        Ok(Self {
            listen_addr,
            log_level,
            ssh_port,
            ssh_term,
            ssh_connect_timeout,
            provider_url,
            poll_interval,
            poll_max_attempts,
        })
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: self.poll_interval,
            max_attempts: self.poll_max_attempts,
        }
    }

    pub fn bridge(&self) -> BridgeConfig {
        BridgeConfig {
            default_port: self.ssh_port,
            connect_timeout: self.ssh_connect_timeout,
            ..BridgeConfig::default()
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}
