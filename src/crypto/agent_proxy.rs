//! Minimal Assuan-style passphrase agent.
//!
//! `gpg --use-agent` is pointed at a transient UNIX socket via
//! `GPG_AGENT_INFO`. The proxy answers the three commands the decryption
//! pipeline needs (`OPTION`, `GET_PASSPHRASE`, `BYE`); command arguments are
//! percent-encoded on the wire and decoded before use. The socket lives in a
//! private temporary directory and is removed on drop.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::types::error::TransferError;

/// Assuan data lines escape '%', CR and LF.
const ASSUAN_ESCAPE: &AsciiSet = &CONTROLS.add(b'%');

pub struct AgentProxy {
    socket_path: PathBuf,
    accept_task: JoinHandle<()>,
    _socket_dir: tempfile::TempDir,
}

impl AgentProxy {
    pub fn spawn(passphrase: String) -> Result<Self> {
        let socket_dir = tempfile::Builder::new()
            .prefix("sfs3-agent-")
            .tempdir()
            .context(TransferError::Io(
                "failed to create agent socket directory".to_string(),
            ))?;
        let socket_path = socket_dir.path().join("S.gpg-agent");

        let listener = UnixListener::bind(&socket_path).with_context(|| {
            TransferError::Io(format!(
                "failed to bind agent socket {}",
                socket_path.display()
            ))
        })?;

        debug!(socket = %socket_path.display(), "passphrase agent listening.");

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let passphrase = passphrase.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, &passphrase).await {
                                warn!(error = e.to_string(), "agent connection failed.");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = e.to_string(), "agent accept failed.");
                        return;
                    }
                }
            }
        });

        Ok(Self {
            socket_path,
            accept_task,
            _socket_dir: socket_dir,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Value for the `GPG_AGENT_INFO` environment variable of the gpg
    /// subprocess.
    pub fn agent_info(&self) -> String {
        format!("{}:0:1", self.socket_path.display())
    }
}

impl Drop for AgentProxy {
    fn drop(&mut self) {
        self.accept_task.abort();
        // The tempdir removes the socket file itself.
    }
}

async fn serve_connection(stream: UnixStream, passphrase: &str) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();

    write_half.write_all(b"OK Pleased to meet you\n").await?;

    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or("").to_ascii_uppercase();

        match command.as_str() {
            "OPTION" | "RESET" | "NOP" => {
                write_half.write_all(b"OK\n").await?;
            }
            "GET_PASSPHRASE" => {
                let arguments: Vec<String> = words
                    .map(|argument| {
                        percent_decode_str(argument)
                            .decode_utf8_lossy()
                            .to_string()
                    })
                    .collect();
                trace!(arguments = ?arguments, "GET_PASSPHRASE");

                let escaped = utf8_percent_encode(passphrase, ASSUAN_ESCAPE).to_string();
                write_half
                    .write_all(format!("D {escaped}\nOK\n").as_bytes())
                    .await?;
            }
            "BYE" => {
                write_half.write_all(b"OK closing connection\n").await?;
                return Ok(());
            }
            _ => {
                write_half
                    .write_all(b"ERR 275 Unknown command\n")
                    .await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn read_line(reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn speaks_the_minimal_protocol() {
        init_dummy_tracing_subscriber();

        let proxy = AgentProxy::spawn("s3cret word".to_string()).unwrap();
        assert!(proxy.agent_info().ends_with(":0:1"));

        let stream = UnixStream::connect(proxy.socket_path()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        assert_eq!(read_line(&mut reader).await, "OK Pleased to meet you\n");

        write_half.write_all(b"OPTION ttyname=/dev/tty\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "OK\n");

        write_half
            .write_all(b"GET_PASSPHRASE cache_1 X Passphrase Enter%20passphrase%3A\n")
            .await
            .unwrap();
        assert_eq!(read_line(&mut reader).await, "D s3cret word\n");
        assert_eq!(read_line(&mut reader).await, "OK\n");

        write_half.write_all(b"UNKNOWN\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "ERR 275 Unknown command\n");

        write_half.write_all(b"BYE\n").await.unwrap();
        assert_eq!(read_line(&mut reader).await, "OK closing connection\n");

        // The server closes after BYE.
        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn escapes_percent_in_passphrase() {
        init_dummy_tracing_subscriber();

        let proxy = AgentProxy::spawn("50%\noff".to_string()).unwrap();
        let stream = UnixStream::connect(proxy.socket_path()).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        read_line(&mut reader).await;
        write_half
            .write_all(b"GET_PASSPHRASE c X P D\n")
            .await
            .unwrap();
        assert_eq!(read_line(&mut reader).await, "D 50%25%0Aoff\n");
    }

    fn init_dummy_tracing_subscriber() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("dummy=trace")
            .try_init();
    }
}
