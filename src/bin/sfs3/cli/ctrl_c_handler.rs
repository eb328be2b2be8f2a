use sfs3::types::token::TransferCancellationToken;
use tracing::warn;

/// First ctrl-c cancels every in-flight transfer; partial local output files
/// are left for inspection. A second ctrl-c kills the process.
pub fn spawn_ctrl_c_handler(cancellation_token: TransferCancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling transfers.");
            cancellation_token.cancel();
        }

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt, exiting immediately.");
            std::process::exit(130);
        }
    });
}
