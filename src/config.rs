use anyhow::Error;
use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long)]
    pub conf: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Base URL of the credential/history backend.
    pub backend_url: String,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    /// Delay between disconnecting the old leg and accepting the new one in
    /// answer-replacing call waiting. The device gives no teardown-complete
    /// signal, so this is a fixed settle window.
    pub settle_delay_ms: u64,
    /// Credentials are renewed this many seconds before their TTL expires.
    pub token_refresh_skew_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:5000".to_string(),
            log_level: Some("info".to_string()),
            log_file: None,
            settle_delay_ms: 300,
            token_refresh_skew_secs: 300,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }
}
