use anyhow::Error;
use thiserror::Error;

/// Semantic failure kinds of the transfer engine. The object store client
/// attaches one of these to every error it surfaces; higher layers decide
/// between resume, abort and absent-is-fine by downcasting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("object not found")]
    NotFound,
    /// Any non-2xx response. Status 0 means the request never produced a
    /// response (connect failure, dispatch failure).
    #[error("http error: status {status}")]
    Http { status: u16 },
    #[error("no bytes received for {seconds} seconds")]
    StallTimeout { seconds: u64 },
    #[error("md5 mismatch: expected {expected}, got {got}")]
    Md5Mismatch { expected: String, got: String },
    #[error("authentication or permission failure")]
    Auth,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("local i/o error: {0}")]
    Io(String),
    #[error("encryption pipeline failure: {0}")]
    Crypto(String),
    #[error("cancelled")]
    Cancelled,
}

pub fn transfer_error_kind(e: &Error) -> Option<&TransferError> {
    e.downcast_ref::<TransferError>()
}

pub fn is_cancelled_error(e: &Error) -> bool {
    matches!(transfer_error_kind(e), Some(TransferError::Cancelled))
}

pub fn is_not_found_error(e: &Error) -> bool {
    matches!(transfer_error_kind(e), Some(TransferError::NotFound))
}

/// The download retry rule: 5xx and 400 are retriable (S3 occasionally throws
/// 400 transiently), other 4xx are not. Stalls and md5 mismatches restart the
/// attempt; auth, config, local i/o and crypto failures do not.
pub fn is_retriable_error(e: &Error) -> bool {
    match transfer_error_kind(e) {
        Some(TransferError::Http { status }) => {
            *status == 0 || *status == 400 || *status >= 500
        }
        Some(TransferError::StallTimeout { .. }) => true,
        Some(TransferError::Md5Mismatch { .. }) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn is_cancelled_error_test() {
        assert!(is_cancelled_error(&anyhow!(TransferError::Cancelled)));
        assert!(!is_cancelled_error(&anyhow!(TransferError::NotFound)));
        assert!(!is_cancelled_error(&anyhow!("plain error")));
    }

    #[test]
    fn is_not_found_error_test() {
        assert!(is_not_found_error(&anyhow!(TransferError::NotFound)));
        assert!(!is_not_found_error(&anyhow!(TransferError::Auth)));
    }

    #[test]
    fn retriable_http_statuses() {
        assert!(is_retriable_error(&anyhow!(TransferError::Http {
            status: 500
        })));
        assert!(is_retriable_error(&anyhow!(TransferError::Http {
            status: 503
        })));
        assert!(is_retriable_error(&anyhow!(TransferError::Http {
            status: 400
        })));
        assert!(is_retriable_error(&anyhow!(TransferError::Http {
            status: 0
        })));

        assert!(!is_retriable_error(&anyhow!(TransferError::Http {
            status: 403
        })));
        assert!(!is_retriable_error(&anyhow!(TransferError::Http {
            status: 404
        })));
        assert!(!is_retriable_error(&anyhow!(TransferError::Http {
            status: 412
        })));
    }

    #[test]
    fn retriable_other_kinds() {
        assert!(is_retriable_error(&anyhow!(TransferError::StallTimeout {
            seconds: 30
        })));
        assert!(is_retriable_error(&anyhow!(TransferError::Md5Mismatch {
            expected: "aa".to_string(),
            got: "bb".to_string()
        })));

        assert!(!is_retriable_error(&anyhow!(TransferError::NotFound)));
        assert!(!is_retriable_error(&anyhow!(TransferError::Auth)));
        assert!(!is_retriable_error(&anyhow!(TransferError::Io(
            "broken".to_string()
        ))));
        assert!(!is_retriable_error(&anyhow!(TransferError::Crypto(
            "gpg exited 2".to_string()
        ))));
        assert!(!is_retriable_error(&anyhow!("untagged error")));
    }

    #[test]
    fn kind_survives_context_chain() {
        let e = anyhow!(TransferError::NotFound).context("get_file failed.");
        assert!(is_not_found_error(&e));
    }
}
