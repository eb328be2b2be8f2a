use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::types::{AccessKeys, SkipLogic};

pub mod args;

#[derive(Debug, Clone)]
pub struct Config {
    pub bucket: String,
    /// Optional key prefix inside the bucket; the `data/` and `meta/`
    /// namespaces live underneath it. Empty means bucket root.
    pub prefix: String,
    pub credentials: AccessKeys,
    pub ssl: bool,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    pub crypto_keyid: Option<String>,
    /// Bulk concurrency: how many files are in flight at once.
    pub worker_size: u16,
    pub skip_logic: SkipLogic,
    pub transfer_config: TransferConfig,
    pub retry_config: RetryConfig,
    pub timeout_config: TimeoutConfig,
    pub filter_config: FilterConfig,
    pub show_progress: bool,
    pub quiet: bool,
    pub debug_level: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    /// Fixed upload part size in bytes.
    pub part_size: u64,
    /// Concurrent in-flight part uploads per transfer.
    pub parallel_part_uploads: u16,
    /// Read-ahead bound for pipe and subprocess feeds.
    pub high_watermark: u64,
    pub low_watermark: u64,
}

impl TransferConfig {
    pub fn is_multipart_upload_required(&self, content_length: u64) -> bool {
        self.part_size < content_length
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub retry_count: u32,
    pub initial_backoff_milliseconds: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    pub operation_timeout_seconds: u64,
    pub stall_timeout_seconds: u64,
}

#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    pub only: Vec<String>,
    pub exclude: Vec<String>,
}

/// On-disk shape of `~/.sfs3.conf`. Every key is optional; the environment
/// overrides whatever the file provides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfFile {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// `<bucket>[/<prefix>]`
    pub bucket: Option<String>,
    pub ssl: Option<bool>,
    pub crypto_keyid: Option<String>,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub part_size: Option<u64>,
    pub retry_count: Option<u32>,
    pub timeout: Option<u64>,
    pub stall_timeout: Option<u64>,
}

pub fn default_conf_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".sfs3.conf"))
}

/// Loads the YAML configuration file. A missing file is not an error; an
/// unreadable or malformed one is.
pub fn load_conf_file(path: &Path) -> Result<ConfFile> {
    if !path.exists() {
        return Ok(ConfFile::default());
    }

    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&data)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Splits a `<bucket>[/<prefix>]` value into bucket and normalized prefix.
pub fn split_bucket_and_prefix(value: &str) -> (String, String) {
    match value.split_once('/') {
        Some((bucket, prefix)) => (
            bucket.to_string(),
            prefix.trim_matches('/').to_string(),
        ),
        None => (value.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn split_bucket_without_prefix() {
        init_dummy_tracing_subscriber();

        let (bucket, prefix) = split_bucket_and_prefix("my-bucket");
        assert_eq!(bucket, "my-bucket");
        assert_eq!(prefix, "");
    }

    #[test]
    fn split_bucket_with_prefix() {
        init_dummy_tracing_subscriber();

        let (bucket, prefix) = split_bucket_and_prefix("my-bucket/backup/daily/");
        assert_eq!(bucket, "my-bucket");
        assert_eq!(prefix, "backup/daily");
    }

    #[test]
    fn load_missing_conf_file_is_default() {
        init_dummy_tracing_subscriber();

        let conf = load_conf_file(Path::new("/nonexistent/sfs3.conf")).unwrap();
        assert!(conf.access_key.is_none());
        assert!(conf.bucket.is_none());
    }

    #[test]
    fn load_conf_file_yaml() {
        init_dummy_tracing_subscriber();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "access_key: AKID").unwrap();
        writeln!(file, "secret_key: SECRET").unwrap();
        writeln!(file, "bucket: my-bucket/prefix").unwrap();
        writeln!(file, "ssl: true").unwrap();
        writeln!(file, "crypto_keyid: CAFEBABE").unwrap();

        let conf = load_conf_file(file.path()).unwrap();
        assert_eq!(conf.access_key.as_deref(), Some("AKID"));
        assert_eq!(conf.secret_key.as_deref(), Some("SECRET"));
        assert_eq!(conf.bucket.as_deref(), Some("my-bucket/prefix"));
        assert_eq!(conf.ssl, Some(true));
        assert_eq!(conf.crypto_keyid.as_deref(), Some("CAFEBABE"));
    }

    #[test]
    fn load_conf_file_rejects_malformed_yaml() {
        init_dummy_tracing_subscriber();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "access_key: [unterminated").unwrap();

        assert!(load_conf_file(file.path()).is_err());
    }

    #[test]
    fn multipart_threshold() {
        init_dummy_tracing_subscriber();

        let transfer_config = TransferConfig {
            part_size: 100 * 1024 * 1024,
            parallel_part_uploads: 4,
            high_watermark: 10 * 1024 * 1024,
            low_watermark: 5 * 1024 * 1024,
        };

        assert!(!transfer_config.is_multipart_upload_required(100 * 1024 * 1024));
        assert!(transfer_config.is_multipart_upload_required(100 * 1024 * 1024 + 1));
    }

    fn init_dummy_tracing_subscriber() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("dummy=trace")
            .try_init();
    }
}
