use std::ffi::OsString;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use crate::config::{
    Config, FilterConfig, RetryConfig, TimeoutConfig, TransferConfig, default_conf_path,
    load_conf_file, split_bucket_and_prefix,
};
use crate::types::{AccessKeys, SkipLogic};

const DEFAULT_WORKER_SIZE: u16 = 4;
const DEFAULT_PARALLEL_PART_UPLOADS: u16 = 4;
const DEFAULT_PART_SIZE: u64 = 100 * 1024 * 1024;
const DEFAULT_RETRY_COUNT: u32 = 3;
const DEFAULT_INITIAL_BACKOFF_MILLISECONDS: u64 = 500;
const DEFAULT_OPERATION_TIMEOUT_SECONDS: u64 = 10;
const DEFAULT_STALL_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_HIGH_WATERMARK: u64 = 10 * 1024 * 1024;
const DEFAULT_LOW_WATERMARK: u64 = 5 * 1024 * 1024;

const NO_BUCKET_CONFIGURED: &str =
    "no bucket configured. set `bucket` in ~/.sfs3.conf or SFS3_BUCKET.\n";
const NO_CREDENTIALS_CONFIGURED: &str =
    "no credentials configured. set `access_key`/`secret_key` in ~/.sfs3.conf, \
     SFS3_ACCESS_KEY/SFS3_SECRET_KEY or AWS_ACCESS_KEY/AWS_SECRET_KEY.\n";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sfs3",
    version,
    about = "Bulk, resumable, integrity-checked transfer between a local filesystem and S3",
    arg_required_else_help = true
)]
pub struct CliArgs {
    /// Alternative configuration file (default ~/.sfs3.conf).
    #[arg(short = 'C', long = "config", global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Suppress the status display and non-error output.
    #[arg(short = 'q', long = "quiet", global = true)]
    pub quiet: bool,

    /// Force the periodic status display on.
    #[arg(long = "progress", global = true, overrides_with = "no_progress")]
    pub progress: bool,

    /// Force the periodic status display off.
    #[arg(long = "no-progress", global = true)]
    pub no_progress: bool,

    /// Debug output; repeat for more detail.
    #[arg(short = 'd', global = true, action = ArgAction::Count)]
    pub debug: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct BulkOptions {
    /// Number of concurrent transfers.
    #[arg(short = 'c', value_name = "N")]
    pub concurrency: Option<u16>,

    /// Transfer everything; never skip up-to-date files.
    #[arg(long = "all", conflicts_with = "md5sum")]
    pub all: bool,

    /// Skip only when the local MD5 matches the remote sidecar.
    #[arg(long = "md5sum")]
    pub md5sum: bool,

    /// Keep only paths matching at least one of these globs.
    #[arg(long = "only", value_name = "GLOB")]
    pub only: Vec<String>,

    /// Drop paths matching any of these globs.
    #[arg(long = "exclude", value_name = "GLOB")]
    pub exclude: Vec<String>,
}

impl BulkOptions {
    pub fn skip_logic(&self) -> SkipLogic {
        if self.all {
            SkipLogic::All
        } else if self.md5sum {
            SkipLogic::Md5sum
        } else {
            SkipLogic::Stat
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List remote files.
    Ls {
        #[arg(short = 'l')]
        long_format: bool,
        #[arg(short = 'r')]
        recursive: bool,
        path: Option<String>,
    },
    /// Download one file. LOCAL may be `-` for stdout.
    Get {
        /// Overwrite an existing local file.
        #[arg(long)]
        force: bool,
        s3_path: String,
        local_path: Option<String>,
    },
    /// Upload one file. LOCAL may be `-` for stdin.
    Put {
        /// Overwrite an existing remote object.
        #[arg(long)]
        force: bool,
        /// Number of concurrent part uploads.
        #[arg(short = 'c', value_name = "N")]
        concurrency: Option<u16>,
        local_path: String,
        s3_path: Option<String>,
    },
    /// Delete remote files matching a glob.
    Rm {
        /// Delete a whole tree.
        #[arg(short = 'r')]
        recursive: bool,
        pattern: String,
    },
    /// Upload a local tree.
    Push {
        local_root: String,
        s3_root: String,
        #[command(flatten)]
        bulk: BulkOptions,
    },
    /// Download a remote tree.
    Pull {
        s3_root: String,
        local_root: String,
        #[command(flatten)]
        bulk: BulkOptions,
    },
    /// Compare a remote tree against a local tree.
    Cmp {
        s3_root: String,
        local_root: String,
        #[command(flatten)]
        bulk: BulkOptions,
    },
    /// Verify remote md5sum sidecars against the stored content.
    Md5check {
        s3_root: String,
        #[command(flatten)]
        bulk: BulkOptions,
    },
    /// Print the version.
    Version,
}

pub fn parse_from_args<I, T>(args: I) -> Result<CliArgs, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    CliArgs::try_parse_from(args)
}

/// Settings read from the process environment. `SFS3_<KEY>` overrides the
/// configuration file; `AWS_ACCESS_KEY`/`AWS_SECRET_KEY` override both.
#[derive(Debug, Clone, Default)]
pub struct EnvSettings {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: Option<String>,
    pub ssl: Option<bool>,
    pub crypto_keyid: Option<String>,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub part_size: Option<u64>,
    pub aws_access_key: Option<String>,
    pub aws_secret_key: Option<String>,
}

impl EnvSettings {
    pub fn from_env() -> Self {
        Self {
            access_key: std::env::var("SFS3_ACCESS_KEY").ok(),
            secret_key: std::env::var("SFS3_SECRET_KEY").ok(),
            bucket: std::env::var("SFS3_BUCKET").ok(),
            ssl: std::env::var("SFS3_SSL").ok().map(|v| parse_bool(&v)),
            crypto_keyid: std::env::var("SFS3_CRYPTO_KEYID").ok(),
            region: std::env::var("SFS3_REGION").ok(),
            endpoint_url: std::env::var("SFS3_ENDPOINT_URL").ok(),
            part_size: std::env::var("SFS3_PART_SIZE")
                .ok()
                .and_then(|v| v.parse().ok()),
            aws_access_key: std::env::var("AWS_ACCESS_KEY").ok(),
            aws_secret_key: std::env::var("AWS_SECRET_KEY").ok(),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl TryFrom<CliArgs> for Config {
    type Error = String;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let conf_path = args
            .config
            .clone()
            .or_else(default_conf_path)
            .ok_or_else(|| "cannot determine home directory for ~/.sfs3.conf\n".to_string())?;
        let conf = load_conf_file(&conf_path).map_err(|e| format!("{e:#}\n"))?;

        build_config(&args, conf, EnvSettings::from_env())
    }
}

/// Merges file, `SFS3_*` environment and `AWS_*` environment settings, in
/// that order of increasing precedence, and validates the result.
pub fn build_config(
    args: &CliArgs,
    conf: crate::config::ConfFile,
    env: EnvSettings,
) -> Result<Config, String> {
    let access_key = env
        .aws_access_key
        .or(env.access_key)
        .or(conf.access_key)
        .ok_or_else(|| NO_CREDENTIALS_CONFIGURED.to_string())?;
    let secret_key = env
        .aws_secret_key
        .or(env.secret_key)
        .or(conf.secret_key)
        .ok_or_else(|| NO_CREDENTIALS_CONFIGURED.to_string())?;

    let bucket_value = env
        .bucket
        .or(conf.bucket)
        .ok_or_else(|| NO_BUCKET_CONFIGURED.to_string())?;
    let (bucket, prefix) = split_bucket_and_prefix(&bucket_value);
    if bucket.is_empty() {
        return Err(NO_BUCKET_CONFIGURED.to_string());
    }

    let ssl = env.ssl.or(conf.ssl).unwrap_or(true);
    let crypto_keyid = env.crypto_keyid.or(conf.crypto_keyid);
    let region = env.region.or(conf.region);
    let endpoint_url = env.endpoint_url.or(conf.endpoint_url);
    let part_size = env.part_size.or(conf.part_size).unwrap_or(DEFAULT_PART_SIZE);
    if part_size == 0 {
        return Err("part_size must be greater than zero\n".to_string());
    }

    let (worker_size, parallel_part_uploads, skip_logic, filter_config) = match &args.command {
        Command::Put { concurrency, .. } => (
            DEFAULT_WORKER_SIZE,
            concurrency.unwrap_or(DEFAULT_PARALLEL_PART_UPLOADS),
            SkipLogic::Stat,
            FilterConfig::default(),
        ),
        Command::Push { bulk, .. }
        | Command::Pull { bulk, .. }
        | Command::Cmp { bulk, .. }
        | Command::Md5check { bulk, .. } => (
            bulk.concurrency.unwrap_or(DEFAULT_WORKER_SIZE),
            DEFAULT_PARALLEL_PART_UPLOADS,
            bulk.skip_logic(),
            FilterConfig {
                only: bulk.only.clone(),
                exclude: bulk.exclude.clone(),
            },
        ),
        _ => (
            DEFAULT_WORKER_SIZE,
            DEFAULT_PARALLEL_PART_UPLOADS,
            SkipLogic::Stat,
            FilterConfig::default(),
        ),
    };

    if worker_size == 0 {
        return Err("concurrency must be greater than zero\n".to_string());
    }

    // Custom endpoints (minio and friends) need path-style addressing;
    // virtual-hosted style stays the default against AWS itself.
    let force_path_style = endpoint_url.is_some();

    Ok(Config {
        bucket,
        prefix,
        credentials: AccessKeys {
            access_key,
            secret_key,
        },
        ssl,
        region,
        endpoint_url,
        force_path_style,
        crypto_keyid,
        worker_size,
        skip_logic,
        transfer_config: TransferConfig {
            part_size,
            parallel_part_uploads,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            low_watermark: DEFAULT_LOW_WATERMARK,
        },
        retry_config: RetryConfig {
            retry_count: conf.retry_count.unwrap_or(DEFAULT_RETRY_COUNT),
            initial_backoff_milliseconds: DEFAULT_INITIAL_BACKOFF_MILLISECONDS,
        },
        timeout_config: TimeoutConfig {
            operation_timeout_seconds: conf
                .timeout
                .unwrap_or(DEFAULT_OPERATION_TIMEOUT_SECONDS),
            stall_timeout_seconds: conf
                .stall_timeout
                .unwrap_or(DEFAULT_STALL_TIMEOUT_SECONDS),
        },
        filter_config,
        show_progress: !args.no_progress && !args.quiet,
        quiet: args.quiet,
        debug_level: args.debug,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfFile;

    fn conf_with_credentials() -> ConfFile {
        ConfFile {
            access_key: Some("file_access".to_string()),
            secret_key: Some("file_secret".to_string()),
            bucket: Some("file-bucket/backup".to_string()),
            ssl: Some(false),
            crypto_keyid: Some("CAFEBABE".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn parse_push_with_filters() {
        init_dummy_tracing_subscriber();

        let args = parse_from_args(vec![
            "sfs3", "push", "./tree", "tree", "-c", "8", "--md5sum", "--only", "**.log",
            "--exclude", "tmp/**",
        ])
        .unwrap();

        let Command::Push {
            local_root,
            s3_root,
            bulk,
        } = &args.command
        else {
            panic!("expected push");
        };

        assert_eq!(local_root, "./tree");
        assert_eq!(s3_root, "tree");
        assert_eq!(bulk.concurrency, Some(8));
        assert_eq!(bulk.skip_logic(), SkipLogic::Md5sum);
        assert_eq!(bulk.only, vec!["**.log"]);
        assert_eq!(bulk.exclude, vec!["tmp/**"]);
    }

    #[test]
    fn parse_all_and_md5sum_conflict() {
        init_dummy_tracing_subscriber();

        assert!(
            parse_from_args(vec!["sfs3", "push", "./tree", "tree", "--all", "--md5sum"]).is_err()
        );
    }

    #[test]
    fn parse_global_flags_after_subcommand() {
        init_dummy_tracing_subscriber();

        let args =
            parse_from_args(vec!["sfs3", "ls", "-r", "-q", "-dd", "--no-progress"]).unwrap();
        assert!(args.quiet);
        assert!(args.no_progress);
        assert_eq!(args.debug, 2);
    }

    #[test]
    fn build_config_from_file_only() {
        init_dummy_tracing_subscriber();

        let args = parse_from_args(vec!["sfs3", "ls"]).unwrap();
        let config = build_config(&args, conf_with_credentials(), EnvSettings::default()).unwrap();

        assert_eq!(config.bucket, "file-bucket");
        assert_eq!(config.prefix, "backup");
        assert_eq!(config.credentials.access_key, "file_access");
        assert!(!config.ssl);
        assert_eq!(config.crypto_keyid.as_deref(), Some("CAFEBABE"));
        assert_eq!(config.worker_size, 4);
        assert_eq!(config.transfer_config.part_size, 100 * 1024 * 1024);
        assert_eq!(config.retry_config.retry_count, 3);
        assert_eq!(config.timeout_config.stall_timeout_seconds, 30);
    }

    #[test]
    fn build_config_sfs3_env_overrides_file() {
        init_dummy_tracing_subscriber();

        let args = parse_from_args(vec!["sfs3", "ls"]).unwrap();
        let env = EnvSettings {
            access_key: Some("env_access".to_string()),
            bucket: Some("env-bucket".to_string()),
            ..Default::default()
        };
        let config = build_config(&args, conf_with_credentials(), env).unwrap();

        assert_eq!(config.credentials.access_key, "env_access");
        assert_eq!(config.credentials.secret_key, "file_secret");
        assert_eq!(config.bucket, "env-bucket");
        assert_eq!(config.prefix, "");
    }

    #[test]
    fn build_config_aws_env_overrides_sfs3_env() {
        init_dummy_tracing_subscriber();

        let args = parse_from_args(vec!["sfs3", "ls"]).unwrap();
        let env = EnvSettings {
            access_key: Some("sfs3_access".to_string()),
            secret_key: Some("sfs3_secret".to_string()),
            aws_access_key: Some("aws_access".to_string()),
            aws_secret_key: Some("aws_secret".to_string()),
            ..Default::default()
        };
        let config = build_config(&args, conf_with_credentials(), env).unwrap();

        assert_eq!(config.credentials.access_key, "aws_access");
        assert_eq!(config.credentials.secret_key, "aws_secret");
    }

    #[test]
    fn build_config_requires_bucket() {
        init_dummy_tracing_subscriber();

        let args = parse_from_args(vec!["sfs3", "ls"]).unwrap();
        let conf = ConfFile {
            access_key: Some("a".to_string()),
            secret_key: Some("s".to_string()),
            ..Default::default()
        };

        let result = build_config(&args, conf, EnvSettings::default());
        assert!(result.unwrap_err().contains("no bucket configured"));
    }

    #[test]
    fn build_config_requires_credentials() {
        init_dummy_tracing_subscriber();

        let args = parse_from_args(vec!["sfs3", "ls"]).unwrap();
        let conf = ConfFile {
            bucket: Some("bucket".to_string()),
            ..Default::default()
        };

        let result = build_config(&args, conf, EnvSettings::default());
        assert!(result.unwrap_err().contains("no credentials configured"));
    }

    #[test]
    fn put_concurrency_sets_parallel_part_uploads() {
        init_dummy_tracing_subscriber();

        let args = parse_from_args(vec!["sfs3", "put", "-c", "12", "./file", "key"]).unwrap();
        let config = build_config(&args, conf_with_credentials(), EnvSettings::default()).unwrap();

        assert_eq!(config.transfer_config.parallel_part_uploads, 12);
        assert_eq!(config.worker_size, 4);
    }

    #[test]
    fn push_concurrency_sets_worker_size() {
        init_dummy_tracing_subscriber();

        let args = parse_from_args(vec!["sfs3", "push", "./tree", "tree", "-c", "9"]).unwrap();
        let config = build_config(&args, conf_with_credentials(), EnvSettings::default()).unwrap();

        assert_eq!(config.worker_size, 9);
    }

    #[test]
    fn parse_bool_values() {
        init_dummy_tracing_subscriber();

        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(parse_bool("Yes"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
    }

    fn init_dummy_tracing_subscriber() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("dummy=trace")
            .try_init();
    }
}
