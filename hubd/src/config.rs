use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use hub_server::HubConfig;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug,Error)]
pub enum ConfigError
{
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("format error: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug,Deserialize)]
pub struct ListenerConfig
{
    pub address: String,
}

#[derive(Debug,Deserialize)]
#[serde(rename_all="kebab-case")]
pub struct DaemonConfig
{
    #[serde(default)]
    pub hub: HubConfig,

    pub listeners: Vec<ListenerConfig>,
}

impl DaemonConfig
{
    pub fn load_file<P: AsRef<Path>>(filename: P) -> Result<Self, ConfigError>
    {
        let file = File::open(filename)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}

impl Default for DaemonConfig
{
    fn default() -> Self
    {
        Self {
            hub: HubConfig::default(),
            listeners: vec![ListenerConfig { address: "0.0.0.0:411".to_string() }],
        }
    }
}
