//! Notification side channel (spec.md §6): a best-effort, fire-and-
//! forget length-delimited JSON feed over a UNIX-domain socket, for
//! external tooling (e.g. an editor plugin) that wants to know when a
//! watched file has produced a fresh artifact.
//!
//! Grounded on `crates/cuenv/src/coordinator/protocol.rs::WireMessage`'s
//! 4-byte-big-endian length-prefix framing; unlike that protocol this
//! channel is one-way and reconnects per message, since spec.md §6
//! describes "connect-and-write is best-effort... a broken socket
//! silently no-ops after one warning" rather than a held session.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::warn;

/// One event on the side channel (spec.md §6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotifyEvent {
    Initialized,
    Clear,
    ChangedFile { file: String, ready: bool },
    Error { file: String, message: String },
}

/// Writes `NotifyEvent`s to a configured socket path, if any. Silent
/// after the first connection failure so a missing listener never
/// produces a flood of warnings.
pub struct NotifyChannel {
    socket_path: Option<PathBuf>,
    warned: AtomicBool,
}

impl NotifyChannel {
    #[must_use]
    pub fn new(socket_path: Option<PathBuf>) -> Self {
        Self { socket_path, warned: AtomicBool::new(false) }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub async fn send(&self, event: &NotifyEvent) {
        let Some(path) = &self.socket_path else { return };
        let payload = match serde_json::to_vec(event) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialize notification side channel event");
                return;
            }
        };
        if let Err(e) = write_framed(path, &payload).await {
            if !self.warned.swap(true, Ordering::SeqCst) {
                warn!(error = %e, path = %path.display(), "notification side channel unavailable, further failures will be silent");
            }
        }
    }
}

#[cfg(unix)]
async fn write_framed(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;

    let mut stream = UnixStream::connect(path).await?;
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

#[cfg(not(unix))]
async fn write_framed(_path: &Path, _payload: &[u8]) -> std::io::Result<()> {
    Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "notification side channel requires unix sockets"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn disabled_channel_is_a_no_op() {
        let channel = NotifyChannel::disabled();
        channel.send(&NotifyEvent::Initialized).await;
    }

    #[tokio::test]
    async fn writes_length_prefixed_json_to_the_socket() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket_path = dir.path().join("shadowdog.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await.unwrap();
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await.unwrap();
            body
        });

        let channel = NotifyChannel::new(Some(socket_path));
        channel.send(&NotifyEvent::ChangedFile { file: "dist/app.txt".to_string(), ready: true }).await;

        let body = accept.await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["type"], "CHANGED_FILE");
        assert_eq!(parsed["file"], "dist/app.txt");
        assert_eq!(parsed["ready"], true);
    }

    #[tokio::test]
    async fn missing_socket_warns_once_and_stays_silent() {
        let channel = NotifyChannel::new(Some(PathBuf::from("/nonexistent/shadowdog-test.sock")));
        channel.send(&NotifyEvent::Initialized).await;
        assert!(channel.warned.load(Ordering::SeqCst));
        channel.send(&NotifyEvent::Clear).await;
    }
}
