//! End-to-end GPG encryption.
//!
//! Upload passes plaintext through `gpg --encrypt --recipient <keyid>`;
//! download passes ciphertext through `gpg --decrypt --use-agent`, with
//! passphrase prompts proxied over the transient UNIX socket served by
//! [`agent_proxy`]. The engine only ever sees streams: the plaintext MD5 is
//! taken on the cleartext side of the subprocess in both directions.

use std::process::Stdio;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::storage::watermark::spawn_watermarked_reader;
use crate::types::error::TransferError;

pub mod agent_proxy;

struct GpgProcess {
    child: Child,
}

impl GpgProcess {
    fn spawn(mut command: Command) -> Result<Self> {
        let child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                anyhow::Error::new(e).context(TransferError::Crypto(
                    "failed to spawn gpg".to_string(),
                ))
            })?;

        Ok(Self { child })
    }

    fn take_stdin(&mut self) -> Result<ChildStdin> {
        self.child
            .stdin
            .take()
            .ok_or_else(|| anyhow!(TransferError::Crypto("gpg stdin unavailable".to_string())))
    }

    fn take_stdout(&mut self) -> Result<ChildStdout> {
        self.child
            .stdout
            .take()
            .ok_or_else(|| anyhow!(TransferError::Crypto("gpg stdout unavailable".to_string())))
    }

    /// Reaps the subprocess; a non-zero exit is a crypto failure carrying
    /// whatever gpg printed on stderr.
    async fn wait(mut self) -> Result<()> {
        let mut stderr_output = String::new();
        if let Some(mut stderr) = self.child.stderr.take() {
            let _ = stderr.read_to_string(&mut stderr_output).await;
        }

        let status = self
            .child
            .wait()
            .await
            .context(TransferError::Crypto("failed to wait for gpg".to_string()))?;

        if !status.success() {
            return Err(anyhow!(TransferError::Crypto(format!(
                "gpg exited with {status}: {}",
                stderr_output.trim()
            ))));
        }

        trace!("gpg exited successfully.");
        Ok(())
    }
}

/// Encryption side: plaintext in, ciphertext out.
pub struct GpgEncryptor {
    ciphertext: Option<ChildStdout>,
    feed: JoinHandle<Result<()>>,
}

impl GpgEncryptor {
    /// Spawns gpg and a feed task copying `plaintext` into its stdin through
    /// a high/low watermark buffer, so a fast producer blocks when gpg (or
    /// the uploader behind it) is slow.
    pub fn spawn<R>(
        keyid: &str,
        plaintext: R,
        high_watermark: u64,
        low_watermark: u64,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut command = Command::new("gpg");
        command.args([
            "--encrypt",
            "--recipient",
            keyid,
            "--batch",
            "--yes",
            "--quiet",
            "--output",
            "-",
        ]);

        let mut process = GpgProcess::spawn(command)?;
        let mut stdin = process.take_stdin()?;
        let ciphertext = process.take_stdout()?;

        debug!(keyid = keyid, "gpg encryption pipeline started.");

        let feed = tokio::spawn(async move {
            let mut buffered = spawn_watermarked_reader(
                plaintext,
                high_watermark as usize,
                low_watermark as usize,
            );
            tokio::io::copy(&mut buffered, &mut stdin)
                .await
                .context(TransferError::Crypto(
                    "failed to feed plaintext to gpg".to_string(),
                ))?;
            drop(stdin);

            process.wait().await
        });

        Ok(Self {
            ciphertext: Some(ciphertext),
            feed,
        })
    }

    pub fn take_ciphertext(&mut self) -> Result<ChildStdout> {
        self.ciphertext
            .take()
            .ok_or_else(|| anyhow!(TransferError::Crypto("ciphertext already taken".to_string())))
    }

    /// Must be called after the ciphertext stream is fully consumed.
    pub async fn finish(self) -> Result<()> {
        self.feed
            .await
            .context("gpg feed task panicked.")?
    }
}

/// Decryption side: the caller writes ciphertext into the stdin half and
/// reads plaintext from the stdout half.
pub struct GpgDecryptor {
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    waiter: JoinHandle<Result<()>>,
}

impl GpgDecryptor {
    pub fn spawn(agent_info: Option<&str>) -> Result<Self> {
        let mut command = Command::new("gpg");
        command.args(["--decrypt", "--batch", "--quiet", "--use-agent", "--output", "-"]);
        if let Some(agent_info) = agent_info {
            command.env("GPG_AGENT_INFO", agent_info);
        }

        let mut process = GpgProcess::spawn(command)?;
        let stdin = process.take_stdin()?;
        let stdout = process.take_stdout()?;

        debug!("gpg decryption pipeline started.");

        let waiter = tokio::spawn(async move { process.wait().await });

        Ok(Self {
            stdin: Some(stdin),
            stdout: Some(stdout),
            waiter,
        })
    }

    pub fn take_stdin(&mut self) -> Result<ChildStdin> {
        self.stdin
            .take()
            .ok_or_else(|| anyhow!(TransferError::Crypto("gpg stdin already taken".to_string())))
    }

    pub fn take_stdout(&mut self) -> Result<ChildStdout> {
        self.stdout
            .take()
            .ok_or_else(|| anyhow!(TransferError::Crypto("gpg stdout already taken".to_string())))
    }

    /// Must be called after `stdin` was dropped and `stdout` drained.
    pub async fn finish(self) -> Result<()> {
        self.waiter
            .await
            .context("gpg wait task panicked.")?
    }
}
