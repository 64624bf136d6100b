use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;

// Gateway service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // TCP listener bind address.
    pub listen_bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Max frame size accepted on client streams.
    pub max_frame_bytes: usize,
}

const DEFAULT_GATEWAY_CONFIG_PATH: &str = "/usr/local/viaduct/config.yml";
const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct GatewayConfigOverride {
    listen_bind: Option<String>,
    metrics_bind: Option<String>,
    max_frame_bytes: Option<usize>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let listen_bind = std::env::var("VIADUCT_LISTEN_BIND")
            .unwrap_or_else(|_| "0.0.0.0:7400".to_string())
            .parse()
            .with_context(|| "parse VIADUCT_LISTEN_BIND")?;
        let metrics_bind = std::env::var("VIADUCT_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse VIADUCT_METRICS_BIND")?;
        let max_frame_bytes = std::env::var("VIADUCT_MAX_FRAME_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);
        Ok(Self {
            listen_bind,
            metrics_bind,
            max_frame_bytes,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        let override_path = std::env::var("VIADUCT_GATEWAY_CONFIG").ok();
        let config_path = override_path
            .clone()
            .unwrap_or_else(|| DEFAULT_GATEWAY_CONFIG_PATH.to_string());
        let contents = match fs::read_to_string(&config_path) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if override_path.is_some() {
                    return Err(err)
                        .with_context(|| format!("read VIADUCT_GATEWAY_CONFIG: {config_path}"));
                }
                None
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read gateway config: {config_path}"));
            }
        };
        if let Some(contents) = contents {
            // YAML overrides allow ops-friendly config files.
            let override_cfg: GatewayConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse gateway config yaml")?;
            if let Some(value) = override_cfg.listen_bind {
                config.listen_bind = value.parse().with_context(|| "parse listen_bind")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.max_frame_bytes
                && value > 0
            {
                config.max_frame_bytes = value;
            }
        }
        Ok(config)
    }
}
