use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    3000
}

impl Config {
    /// Load from an optional `configuration` file and `APP__*` variables.
    /// A plain `PORT` variable is honoured when `APP__PORT` is not set.
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        Self::with_port_fallback(env::var("PORT").ok())
    }

    fn with_port_fallback(port: Option<String>) -> Result<Self, AppError> {
        let mut builder = Cfg::builder();
        if let Some(port) = port.filter(|p| !p.is_empty()) {
            builder = builder.set_default("port", port)?;
        }

        let config = builder
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}
