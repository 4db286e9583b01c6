//! Command-line configuration.
//!
//! Parses and validates the options enumerated in the design into an
//! immutable [`Config`] record. This is the proxy's only external
//! collaborator for startup configuration: no file format, no remote
//! config source, no hot reload.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::error::AppError;

/// Localhost HTTP caching proxy in front of an S3-compatible remote cache.
#[derive(Parser, Debug)]
#[command(name = "remote-cache-proxy", about, version)]
pub struct CliArgs {
    /// Address to bind the HTTP server on.
    #[arg(long, env = "CACHE_PROXY_HOST", default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port to bind the HTTP server on.
    #[arg(long, env = "CACHE_PROXY_PORT", default_value_t = 7799)]
    pub port: u16,

    /// S3 bucket holding the remote cache.
    #[arg(long, env = "CACHE_PROXY_BUCKET")]
    pub bucket: String,

    /// Key prefix prepended to every object in the bucket.
    #[arg(long, env = "CACHE_PROXY_S3_PREFIX", default_value = "")]
    pub s3_prefix: String,

    /// Custom S3-compatible endpoint URL. Unset uses AWS S3 directly.
    #[arg(long, env = "CACHE_PROXY_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    /// AWS region for the bucket.
    #[arg(long, env = "CACHE_PROXY_REGION", default_value = "us-east-1")]
    pub region: String,

    /// Minutes of inactivity before the process shuts itself down. 0 disables.
    #[arg(long, env = "CACHE_PROXY_IDLE_MINUTES", default_value_t = 0)]
    pub idle_minutes: u64,

    /// Per-request socket timeout, in seconds.
    #[arg(long, env = "CACHE_PROXY_SOCKET_TIMEOUT_SECONDS", default_value_t = 60)]
    pub socket_timeout_seconds: u64,

    /// Consecutive remote errors before the breaker opens.
    #[arg(long, env = "CACHE_PROXY_ERRORS_BEFORE_PAUSING", default_value_t = 5)]
    pub errors_before_pausing: u32,

    /// Minutes the breaker stays open before auto-closing.
    #[arg(long, env = "CACHE_PROXY_PAUSE_MINUTES", default_value_t = 2)]
    pub pause_minutes: u64,

    /// Downgrade non-credential remote errors to cache-bypassed responses
    /// instead of failing the build.
    #[arg(long, env = "CACHE_PROXY_ALLOW_OFFLINE", default_value_t = false)]
    pub allow_offline: bool,

    /// Allow caching of GCC-style `.o: \` depfiles (disabled by default).
    #[arg(long, env = "CACHE_PROXY_ALLOW_GCC_DEPFILES", default_value_t = false)]
    pub allow_gcc_depfiles: bool,

    /// Maximum size of a single cached/uploaded entry, in bytes. 0 means no cap.
    #[arg(long, env = "CACHE_PROXY_MAX_ENTRY_SIZE_BYTES", default_value_t = 0)]
    pub max_entry_size_bytes: u64,

    /// Maximum total bytes held in the in-memory cache.
    #[arg(
        long,
        env = "CACHE_PROXY_MAX_CACHE_BYTES",
        default_value_t = 512 * 1024 * 1024
    )]
    pub max_cache_bytes: u64,

    /// Enable asynchronous (detached) uploads.
    #[arg(long, env = "CACHE_PROXY_ASYNC_UPLOAD", default_value_t = true)]
    pub async_upload_enabled: bool,

    /// Directory used to spool `PUT` bodies before upload.
    #[arg(
        long,
        env = "CACHE_PROXY_CACHE_DIR",
        default_value = "/tmp/remote-cache-proxy"
    )]
    pub async_upload_cache_dir: PathBuf,

    /// Maximum total bytes allowed in flight across all pending uploads.
    #[arg(long, env = "CACHE_PROXY_MAX_PENDING_UPLOAD_MB", default_value_t = 200)]
    pub max_pending_upload_mb: u64,

    /// Optional file to additionally write logs to (stdout is always used).
    #[arg(long, env = "CACHE_PROXY_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

/// Validated, immutable configuration consumed by the rest of the process.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub bucket: String,
    pub s3_prefix: String,
    pub s3_endpoint: Option<String>,
    pub region: String,
    pub idle_minutes: u64,
    pub socket_timeout_seconds: u64,
    pub errors_before_pausing: u32,
    pub pause_minutes: u64,
    pub allow_offline: bool,
    pub allow_gcc_depfiles: bool,
    pub max_entry_size_bytes: u64,
    pub max_cache_bytes: u64,
    pub async_upload_enabled: bool,
    pub async_upload_cache_dir: PathBuf,
    pub max_pending_upload_bytes: u64,
    pub log_file: Option<PathBuf>,
}

impl CliArgs {
    /// Validates the parsed CLI args into an immutable [`Config`].
    pub fn into_config(self) -> Result<Config, AppError> {
        if self.bucket.trim().is_empty() {
            return Err(AppError::InvalidConfig("bucket must not be empty".into()));
        }
        if self.errors_before_pausing == 0 {
            return Err(AppError::InvalidConfig(
                "errors-before-pausing must be at least 1".into(),
            ));
        }

        let max_pending_upload_bytes = self.max_pending_upload_mb.saturating_mul(1024 * 1024);

        Ok(Config {
            host: self.host,
            port: self.port,
            bucket: self.bucket,
            s3_prefix: self.s3_prefix,
            s3_endpoint: self.s3_endpoint,
            region: self.region,
            idle_minutes: self.idle_minutes,
            socket_timeout_seconds: self.socket_timeout_seconds,
            errors_before_pausing: self.errors_before_pausing,
            pause_minutes: self.pause_minutes,
            allow_offline: self.allow_offline,
            allow_gcc_depfiles: self.allow_gcc_depfiles,
            max_entry_size_bytes: self.max_entry_size_bytes,
            max_cache_bytes: self.max_cache_bytes,
            async_upload_enabled: self.async_upload_enabled,
            async_upload_cache_dir: self.async_upload_cache_dir,
            max_pending_upload_bytes,
            log_file: self.log_file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> CliArgs {
        CliArgs::parse_from(["remote-cache-proxy", "--bucket", "my-bucket"])
    }

    #[test]
    fn rejects_empty_bucket() {
        let mut args = base_args();
        args.bucket = "  ".into();
        assert!(args.into_config().is_err());
    }

    #[test]
    fn converts_pending_upload_mb_to_bytes() {
        let mut args = base_args();
        args.max_pending_upload_mb = 10;
        let config = args.into_config().unwrap();
        assert_eq!(config.max_pending_upload_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn rejects_zero_errors_before_pausing() {
        let mut args = base_args();
        args.errors_before_pausing = 0;
        assert!(args.into_config().is_err());
    }
}
