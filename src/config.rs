//! Config file
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Folder in which the torrent files are downloaded and assembled.
    pub download_dir: String,

    /// Port where the client will listen for peer connections.
    pub port: u16,

    /// Length in bytes of a block request, 16 KiB for almost every client
    /// in the wild.
    pub block_length: u32,

    /// How many block requests are pipelined to a peer in a single batch.
    pub request_per_call: u32,

    /// Frames above this length are a protocol violation and get the peer
    /// disconnected.
    pub max_message_length: u32,

    /// Maximum number of peer sessions kept at once.
    pub max_peers: u32,
}

pub static CONFIG: LazyLock<Config> = LazyLock::new(|| Config::load().unwrap());

impl Config {
    /// Try to load the configuration. Environmental variables have privilege
    /// over values from the configuration file, which has privilege over the
    /// defaults.
    pub fn load() -> Result<Self, Error> {
        // config.toml, the .toml part is omitted.
        let config_file = std::env::var("XDG_CONFIG_HOME")
            .map(|v| format!("{v}/maelstrom/config"))
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_default();
                format!("{home}/.config/maelstrom/config")
            });

        config::Config::builder()
            .add_source(config::File::with_name(&config_file).required(false))
            .add_source(config::Environment::default())
            .set_default("download_dir", ".")
            .unwrap()
            .set_default("port", 8000)
            .unwrap()
            .set_default("block_length", 16384)
            .unwrap()
            .set_default("request_per_call", 6)
            .unwrap()
            .set_default("max_message_length", 131072)
            .unwrap()
            .set_default("max_peers", 50)
            .unwrap()
            .build()?
            .try_deserialize::<Config>()
            .map_err(Error::FromConfigError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::load().unwrap();

        assert_eq!(config.block_length, 16384);
        assert_eq!(config.request_per_call, 6);
        assert_eq!(config.max_message_length, 1 << 17);
        assert_eq!(config.max_peers, 50);
    }
}
