use std::collections::HashMap;
use std::fmt;
use std::fmt::{Debug, Formatter};

use chrono::{DateTime, TimeZone, Utc};
use zeroize_derive::{Zeroize, ZeroizeOnDrop};

pub mod async_callback;
pub mod error;
pub mod token;

/// User-metadata key carrying the source file's modification time,
/// `YYYY-MM-DDTHH:MM:SSZ` in UTC. On the wire it appears as `x-amz-meta-mtime`.
pub const MTIME_METADATA_KEY: &str = "mtime";

/// User-metadata key identifying the GPG recipient of an encrypted object.
/// Present iff the content object holds ciphertext.
pub const KEYID_METADATA_KEY: &str = "keyid";

pub const MD5SUM_SIDECAR: &str = "md5sum";
pub const CRYPTOKEY_SIDECAR: &str = "cryptokey";

/// Sidecar value written for GPG-encrypted objects. The `<scheme>:<hex-iv>`
/// shape is kept for compatibility; the GPG scheme has no IV.
pub const GPG_CRYPTOKEY_VALUE: &str = "gpg:";

/// One entry of a bucket listing, stripped down to what the transfer engine
/// consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// The result of a HEAD on a content object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectStat {
    pub content_length: u64,
    pub e_tag: Option<String>,
    pub user_meta: HashMap<String, String>,
}

impl ObjectStat {
    pub fn mtime(&self) -> Option<DateTime<Utc>> {
        parse_mtime(self.user_meta.get(MTIME_METADATA_KEY)?)
    }

    pub fn keyid(&self) -> Option<&str> {
        self.user_meta.get(KEYID_METADATA_KEY).map(|v| v.as_str())
    }
}

/// Opaque identifier of one active transfer. The progress aggregator owns the
/// slot table; pipelines only ever hold the id.
pub type TransferId = u64;

/// Events posted by transfer workers and consumed by the progress aggregator.
#[derive(Debug, PartialEq)]
pub enum TransferStatistics {
    /// The bulk run discovered its complete work set.
    TotalDiscovered { files: u64, bytes: u64 },
    /// A slot became active.
    TransferStart {
        id: TransferId,
        key: String,
        total_bytes: u64,
    },
    /// Bytes moved on the wire for an active slot.
    TransferBytes { id: TransferId, bytes: u64 },
    TransferComplete {
        id: TransferId,
        key: String,
        bytes: u64,
    },
    TransferSkip {
        id: TransferId,
        key: String,
        bytes: u64,
    },
    TransferAbort {
        id: TransferId,
        key: String,
        bytes: u64,
    },
}

/// A transfer's handle for posting byte counts against its slot. Cloned
/// freely; every send is best-effort (a closed aggregator never fails a
/// transfer).
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    sender: async_channel::Sender<TransferStatistics>,
    id: TransferId,
}

impl ProgressHandle {
    pub fn new(sender: async_channel::Sender<TransferStatistics>, id: TransferId) -> Self {
        Self { sender, id }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub async fn add_bytes(&self, bytes: u64) {
        let _ = self
            .sender
            .send(TransferStatistics::TransferBytes { id: self.id, bytes })
            .await;
    }

    /// For use inside `poll_read`; the aggregator channel is unbounded, so
    /// this never actually blocks.
    pub fn add_bytes_blocking(&self, bytes: u64) {
        let _ = self
            .sender
            .send_blocking(TransferStatistics::TransferBytes { id: self.id, bytes });
    }
}

/// The rule set deciding whether an up-to-date remote object may be left
/// untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SkipLogic {
    /// Always transfer.
    All,
    /// Skip iff size, mtime and md5sum sidecar presence match.
    #[default]
    Stat,
    /// `Stat`, plus the local MD5 must equal the remote sidecar value.
    Md5sum,
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AccessKeys {
    pub access_key: String,
    pub secret_key: String,
}

impl Debug for AccessKeys {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut keys = f.debug_struct("AccessKeys");
        keys.field("access_key", &self.access_key)
            .field("secret_key", &"** redacted **");
        keys.finish()
    }
}

/// Formats an mtime the way it is stored in the `Mtime` user-metadata header:
/// UTC, second precision, trailing `Z`.
pub fn format_mtime(mtime: DateTime<Utc>) -> String {
    mtime.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub fn parse_mtime(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

pub fn mtime_from_unix_seconds(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).single().unwrap_or_default()
}

/// Truncates a filesystem timestamp to the second precision the `Mtime`
/// header round-trips.
pub fn mtime_from_system_time(time: std::time::SystemTime) -> DateTime<Utc> {
    let mtime: DateTime<Utc> = time.into();
    mtime_from_unix_seconds(mtime.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_mtime_second_precision() {
        init_dummy_tracing_subscriber();

        let mtime = mtime_from_unix_seconds(1380896764);
        assert_eq!(format_mtime(mtime), "2013-10-04T14:26:04Z");
    }

    #[test]
    fn parse_mtime_round_trip() {
        init_dummy_tracing_subscriber();

        let parsed = parse_mtime("2013-10-04T17:40:59Z").unwrap();
        assert_eq!(parsed.timestamp(), 1380908459);
        assert_eq!(format_mtime(parsed), "2013-10-04T17:40:59Z");
    }

    #[test]
    fn parse_mtime_rejects_garbage() {
        init_dummy_tracing_subscriber();

        assert!(parse_mtime("").is_none());
        assert!(parse_mtime("yesterday").is_none());
        assert!(parse_mtime("2013-10-04").is_none());
    }

    #[test]
    fn object_stat_mtime_header() {
        init_dummy_tracing_subscriber();

        let mut stat = ObjectStat::default();
        assert_eq!(stat.mtime(), None);

        stat.user_meta.insert(
            MTIME_METADATA_KEY.to_string(),
            "2013-10-04T14:26:04Z".to_string(),
        );
        assert_eq!(stat.mtime().unwrap().timestamp(), 1380896764);
    }

    #[test]
    fn object_stat_keyid_header() {
        init_dummy_tracing_subscriber();

        let mut stat = ObjectStat::default();
        assert_eq!(stat.keyid(), None);

        stat.user_meta
            .insert(KEYID_METADATA_KEY.to_string(), "ABCD1234".to_string());
        assert_eq!(stat.keyid(), Some("ABCD1234"));
    }

    #[test]
    fn debug_print_access_keys() {
        init_dummy_tracing_subscriber();

        let access_keys = AccessKeys {
            access_key: "my_access_key".to_string(),
            secret_key: "my_secret_key".to_string(),
        };
        let debug_string = format!("{access_keys:?}");

        assert!(debug_string.contains("my_access_key"));
        assert!(!debug_string.contains("my_secret_key"));
        assert!(debug_string.contains("** redacted **"));
    }

    fn init_dummy_tracing_subscriber() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("dummy=trace")
            .try_init();
    }
}
