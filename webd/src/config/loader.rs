//! Configuration loading: defaults, then file, then environment
//! (`WEBD_` prefix), then command-line flags — later sources win.

use super::ServerConfig;
use anyhow::{Context, Result};
use clap::Parser;
use ::config::{Config as ConfigLoader, Environment, File, FileFormat};
use std::path::Path;

/// Command-line interface for the server.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(long, short = 'c', default_value = "webd.toml")]
    pub config: String,

    /// Host address to bind to (overrides config file)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides config file)
    #[arg(long)]
    pub port: Option<u16>,

    /// Log level (overrides config file)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate: bool,

    /// Print default configuration and exit
    #[arg(long)]
    pub print_default_config: bool,
}

/// Loads and validates the server configuration.
pub fn load_config() -> Result<ServerConfig> {
    let cli = CliArgs::parse();

    if cli.print_default_config {
        println!("{}", default_config_toml()?);
        std::process::exit(0);
    }

    let mut config = load_config_file(&cli.config)?;
    apply_cli_overrides(&mut config, &cli);

    config.validate().map_err(|errors| {
        anyhow::anyhow!("configuration validation failed:\n{}", errors.join("\n"))
    })?;

    if cli.validate {
        println!("configuration OK");
        std::process::exit(0);
    }

    Ok(config)
}

fn load_config_file(path: &str) -> Result<ServerConfig> {
    let mut builder = ConfigLoader::builder();
    if Path::new(path).exists() {
        builder = builder.add_source(File::new(path, FileFormat::Toml));
    }
    builder = builder.add_source(Environment::with_prefix("WEBD").separator("__"));

    let loaded = builder
        .build()
        .with_context(|| format!("loading configuration from {path}"))?;

    loaded
        .try_deserialize::<ServerConfig>()
        .context("deserializing configuration")
}

fn apply_cli_overrides(config: &mut ServerConfig, cli: &CliArgs) {
    if let Some(host) = &cli.host {
        config.network.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.network.port = port;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
}

fn default_config_toml() -> Result<String> {
    toml::to_string_pretty(&ServerConfig::default()).context("serializing default configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes_to_toml() {
        let rendered = default_config_toml().unwrap();
        assert!(rendered.contains("[network]"));
        assert!(rendered.contains("[engine]"));
        assert!(rendered.contains("[runtime]"));
    }

    #[test]
    fn cli_overrides_take_precedence() {
        let mut config = ServerConfig::default();
        let cli = CliArgs {
            config: "webd.toml".to_string(),
            host: Some("127.0.0.1".to_string()),
            port: Some(9999),
            log_level: Some("debug".to_string()),
            validate: false,
            print_default_config: false,
        };
        apply_cli_overrides(&mut config, &cli);
        assert_eq!(config.network.host, "127.0.0.1");
        assert_eq!(config.network.port, 9999);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let config = load_config_file("/definitely/not/a/real/path/webd.toml").unwrap();
        assert_eq!(config.network.port, ServerConfig::default().network.port);
    }
}
