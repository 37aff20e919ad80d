//! Engine configuration.
//!
//! Every knob has a conventional default; `validate` runs at session
//! creation so bad values surface synchronously instead of as runtime
//! misbehavior.
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Invalid configuration: {0}")]
pub struct ConfigError(pub String);

#[derive(Debug, Clone)]
pub struct Config {
    /// TCP listener for inbound peers; also advertised to trackers.
    pub listen_port: u16,
    /// UDP port for the DHT node. 0 picks an ephemeral port.
    pub dht_port: u16,
    /// When false the DHT is never started.
    pub enable_dht: bool,
    /// When false no inbound peer listener is opened; outbound
    /// connectivity alone is enough to download.
    pub enable_listener: bool,
    /// Cap on concurrent peer sessions per torrent.
    pub max_peers_per_torrent: usize,
    /// Pipeline depth: block requests kept in flight per peer.
    pub outstanding_requests_per_peer: usize,
    /// Request granularity. Must be a power of two no larger than the
    /// torrent's piece length.
    pub block_size_bytes: u32,
    pub announce_timeout: Duration,
    pub dht_query_timeout: Duration,
    pub piece_request_timeout: Duration,
    /// Directory the content is written under.
    pub download_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_port: 6881,
            dht_port: 6881,
            enable_dht: true,
            enable_listener: true,
            max_peers_per_torrent: 50,
            outstanding_requests_per_peer: 4,
            block_size_bytes: 16384,
            announce_timeout: Duration::from_secs(15),
            dht_query_timeout: Duration::from_secs(5),
            piece_request_timeout: Duration::from_secs(30),
            download_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Checks the torrent-independent invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size_bytes == 0 || !self.block_size_bytes.is_power_of_two() {
            return Err(ConfigError(format!(
                "block_size_bytes must be a power of two, got {}",
                self.block_size_bytes
            )));
        }
        if self.outstanding_requests_per_peer == 0 {
            return Err(ConfigError(
                "outstanding_requests_per_peer must be at least 1".to_string(),
            ));
        }
        if self.max_peers_per_torrent == 0 {
            return Err(ConfigError(
                "max_peers_per_torrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The per-torrent check: the block size must not exceed the piece
    /// length.
    pub fn validate_for(&self, piece_length: i64) -> Result<(), ConfigError> {
        self.validate()?;
        if i64::from(self.block_size_bytes) > piece_length {
            return Err(ConfigError(format!(
                "block_size_bytes {} exceeds piece length {piece_length}",
                self.block_size_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::default().validate_for(16384).is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_blocks() {
        let config = Config {
            block_size_bytes: 15000,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_blocks_larger_than_a_piece() {
        assert!(Config::default().validate_for(8192).is_err());
    }

    #[test]
    fn rejects_zero_pipeline() {
        let config = Config {
            outstanding_requests_per_peer: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
