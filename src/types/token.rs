pub type TransferCancellationToken = tokio_util::sync::CancellationToken;

pub fn create_transfer_cancellation_token() -> TransferCancellationToken {
    tokio_util::sync::CancellationToken::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_cancellation_token() {
        let token = create_transfer_cancellation_token();
        assert!(!token.is_cancelled());

        token.cancel();
        assert!(token.is_cancelled());
    }
}
