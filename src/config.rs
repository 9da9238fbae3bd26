//! CLI 参数、协议常量与服务配置默认值。

use clap::Parser;
use std::time::Duration;

use crate::engine::EngineConfig;
use crate::http::ProtocolSettings;

pub const TUS_VERSION: &str = "1.0.0";
pub const TUS_EXTENSIONS: &str = "creation,termination";

pub const DEFAULT_UPLOAD_URL: &str = "/file-upload";
pub const DEFAULT_UPLOAD_DIR: &str = "uploads";
pub const DEFAULT_MAX_SIZE: u64 = 4 * 1024 * 1024 * 1024;
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;
pub const DEFAULT_METADATA_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_IO_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 900;
pub const STORE_PURGE_INTERVAL_SECS: u64 = 60;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "axo-tus", version, about = "AxoTus resumable upload server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "AXO_TUS_UPLOAD_DIR",
        default_value = DEFAULT_UPLOAD_DIR,
        help = "Directory completed uploads are published to"
    )]
    pub upload_dir: String,
    #[arg(
        short = 'u',
        long,
        env = "AXO_TUS_UPLOAD_URL",
        default_value = DEFAULT_UPLOAD_URL,
        help = "URL path of the upload endpoint"
    )]
    pub upload_url: String,
    #[arg(
        long,
        env = "AXO_TUS_PUBLIC_URL",
        help = "Public base URL used in Location headers (derived from Host when unset)"
    )]
    pub public_url: Option<String>,
    #[arg(
        short = 'b',
        long,
        env = "AXO_TUS_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_TUS_PORT",
        default_value_t = 5005,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(long, env = "AXO_TUS_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "AXO_TUS_MAX_SIZE",
        default_value_t = DEFAULT_MAX_SIZE,
        help = "Max upload length in bytes (0 to disable)"
    )]
    pub max_size: u64,
    #[arg(
        long,
        env = "AXO_TUS_MAX_CHUNK_SIZE",
        default_value_t = DEFAULT_MAX_CHUNK_SIZE,
        help = "Max PATCH body size in bytes"
    )]
    pub max_chunk_size: usize,
    #[arg(
        long,
        env = "AXO_TUS_METADATA_TTL_SECS",
        default_value_t = DEFAULT_METADATA_TTL_SECS,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Upload session metadata expiration in seconds"
    )]
    pub metadata_ttl_secs: u64,
    #[arg(
        long,
        env = "AXO_TUS_IO_TIMEOUT_SECS",
        default_value_t = DEFAULT_IO_TIMEOUT_SECS,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Timeout for a single metadata store or storage call"
    )]
    pub io_timeout_secs: u64,
    #[arg(
        long,
        env = "AXO_TUS_LOCK_WAIT_TIMEOUT_SECS",
        default_value_t = DEFAULT_LOCK_WAIT_TIMEOUT_SECS,
        help = "Max wait for the publish lock when completing an upload"
    )]
    pub lock_wait_timeout_secs: u64,
    #[arg(
        long,
        env = "AXO_TUS_SWEEP_INTERVAL_SECS",
        default_value_t = DEFAULT_SWEEP_INTERVAL_SECS,
        help = "Orphaned upload cleanup interval in seconds (0 to disable)"
    )]
    pub sweep_interval_secs: u64,
    #[cfg(feature = "redis")]
    #[arg(
        long,
        env = "AXO_TUS_REDIS_URL",
        help = "Redis URL for upload metadata (in-memory store when unset)"
    )]
    pub redis_url: Option<String>,
}

impl Args {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            metadata_ttl: Duration::from_secs(self.metadata_ttl_secs),
            io_timeout: Duration::from_secs(self.io_timeout_secs),
            lock_timeout: Duration::from_secs(self.lock_wait_timeout_secs),
            max_size: self.max_size,
        }
    }

    pub fn protocol_settings(&self) -> ProtocolSettings {
        let upload_url = format!("/{}", self.upload_url.trim_matches('/'));
        ProtocolSettings {
            upload_url,
            public_url: self.public_url.clone(),
            max_size: self.max_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let args = Args::try_parse_from(["axo-tus"]).expect("parse");
        let config = args.engine_config();
        assert_eq!(config.metadata_ttl, Duration::from_secs(3600));
        assert_eq!(config.max_size, 4_294_967_296);

        let settings = args.protocol_settings();
        assert_eq!(settings.upload_url, "/file-upload");
    }

    #[test]
    fn upload_url_is_normalized() {
        let args = Args::try_parse_from(["axo-tus", "--upload-url", "files/"]).expect("parse");
        assert_eq!(args.protocol_settings().upload_url, "/files");
    }

    #[test]
    fn zero_ttl_is_rejected() {
        assert!(Args::try_parse_from(["axo-tus", "--metadata-ttl-secs", "0"]).is_err());
    }
}
