use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;

use crate::rpc::HandlerOptions;

pub const DEFAULT_RECV_ADDR: &str = "127.0.0.1:9997";
pub const DEFAULT_SEND_ADDR: &str = "127.0.0.1:9996";
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub recv_addr: String,
    pub send_addr: String,
    pub call_timeout: Duration,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("BROKER_RECV_ADDR must be a valid socket address")]
    InvalidRecvAddr,
    #[error("BROKER_SEND_ADDR must be a valid socket address")]
    InvalidSendAddr,
    #[error("RPC_CALL_TIMEOUT_MS must be a positive integer")]
    InvalidCallTimeout,
    #[error("RPC_MAX_FRAME_BYTES must be a positive integer")]
    InvalidMaxFrameBytes,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let recv_addr = var("BROKER_RECV_ADDR").unwrap_or_else(|| DEFAULT_RECV_ADDR.to_string());
        let send_addr = var("BROKER_SEND_ADDR").unwrap_or_else(|| DEFAULT_SEND_ADDR.to_string());
        let call_timeout_ms = var("RPC_CALL_TIMEOUT_MS")
            .map(|value| {
                value
                    .parse::<u64>()
                    .ok()
                    .filter(|millis| *millis > 0)
                    .ok_or(ConfigError::InvalidCallTimeout)
            })
            .transpose()?
            .unwrap_or(DEFAULT_CALL_TIMEOUT_MS);
        let max_frame_bytes = var("RPC_MAX_FRAME_BYTES")
            .map(|value| {
                value
                    .parse::<usize>()
                    .ok()
                    .filter(|bytes| *bytes > 0)
                    .ok_or(ConfigError::InvalidMaxFrameBytes)
            })
            .transpose()?
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);

        let config = Self {
            recv_addr,
            send_addr,
            call_timeout: Duration::from_millis(call_timeout_ms),
            max_frame_bytes,
        };

        let _ = config.recv_socket()?;
        let _ = config.send_socket()?;
        Ok(config)
    }

    pub fn recv_socket(&self) -> Result<SocketAddr, ConfigError> {
        self.recv_addr
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidRecvAddr)
    }

    pub fn send_socket(&self) -> Result<SocketAddr, ConfigError> {
        self.send_addr
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSendAddr)
    }

    pub fn handler_options(&self) -> HandlerOptions {
        HandlerOptions {
            call_timeout: self.call_timeout,
            ..HandlerOptions::default()
        }
    }
}
