//! Bulk-transfer TCP endpoint.
//!
//! Offloads high-throughput file payloads off the framed control channel.
//! Single-use: one token, one connection, one upload session.
//!
//! Wire format:
//!
//! ```text
//! HANDSHAKE (Hub -> Agent):     [32 bytes: hex token ASCII]
//! AUTH RESPONSE (Agent -> Hub): [1 byte: 0x01=OK, 0x00=rejected]
//!
//! PER FILE (Hub -> Agent):
//!   [2 bytes BE: path_len]       # 0 = end-of-stream marker, stop
//!   [path_len bytes: relative_path UTF-8]
//!   [8 bytes BE: file_size]
//!   [file_size bytes: raw file data]
//! ```

use crate::pairing::constant_time_eq;
use crate::uploads::{PathError, validate_relative_path};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{info, warn};

pub const TOKEN_LEN: usize = 32;
const BUFFER_SIZE: usize = 256 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

const AUTH_OK: u8 = 0x01;
const AUTH_REJECTED: u8 = 0x00;

#[derive(Debug, Error)]
pub enum DataChannelError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("connect timeout")]
    ConnectTimeout,
    #[error("auth timeout")]
    AuthTimeout,
    #[error("invalid token")]
    InvalidToken,
    #[error("unexpected EOF during file data")]
    UnexpectedEof,
    #[error("invalid path: {0}")]
    UnsafePath(#[from] PathError),
    #[error("path is not valid UTF-8")]
    PathNotUtf8,
    #[error("cancelled")]
    Cancelled,
}

/// Ephemeral TCP endpoint for receiving file data from the Hub.
pub struct DataChannelServer {
    listener: TcpListener,
    port: u16,
    token: String,
    cancel: Arc<AtomicBool>,
}

impl DataChannelServer {
    /// Bind an ephemeral port on all interfaces and mint a fresh token.
    pub async fn bind() -> std::io::Result<Self> {
        let listener = TcpListener::bind("0.0.0.0:0").await?;
        let port = listener.local_addr()?.port();
        let mut raw = [0u8; 16];
        rand::thread_rng().fill(&mut raw);
        let token = hex::encode(raw);
        info!(port, "data channel listening");
        Ok(Self {
            listener,
            port,
            token,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Flag observed at chunk boundaries; setting it aborts the loop.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Accept one connection, authenticate it, and receive files into
    /// `install_dir`.  Returns total payload bytes received.
    ///
    /// The listener is dropped after the first accept, so later connection
    /// attempts are refused.  `progress` is invoked per read with
    /// (total_bytes, current_file); throttling is the caller's concern.
    pub async fn accept_and_receive<F>(
        self,
        install_dir: PathBuf,
        progress: F,
    ) -> Result<u64, DataChannelError>
    where
        F: Fn(u64, &str),
    {
        let (stream, peer) = match timeout(CONNECT_TIMEOUT, self.listener.accept()).await {
            Ok(accepted) => accepted?,
            Err(_) => return Err(DataChannelError::ConnectTimeout),
        };
        // Single-use: stop accepting anything further.
        drop(self.listener);
        info!(peer = %peer, "data channel connection");

        let mut stream = stream;
        authenticate(&mut stream, &self.token).await?;

        receive_files(&mut stream, &install_dir, &self.cancel, progress).await
    }
}

async fn authenticate(stream: &mut TcpStream, expected: &str) -> Result<(), DataChannelError> {
    let mut buf = [0u8; TOKEN_LEN];
    match timeout(AUTH_TIMEOUT, stream.read_exact(&mut buf)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(DataChannelError::AuthTimeout),
    }

    if !constant_time_eq(&buf, expected.as_bytes()) {
        warn!("data channel: invalid token");
        let _ = stream.write_all(&[AUTH_REJECTED]).await;
        return Err(DataChannelError::InvalidToken);
    }
    stream.write_all(&[AUTH_OK]).await?;
    info!("data channel authenticated");
    Ok(())
}

async fn receive_files<F>(
    stream: &mut TcpStream,
    install_dir: &Path,
    cancel: &AtomicBool,
    progress: F,
) -> Result<u64, DataChannelError>
where
    F: Fn(u64, &str),
{
    tokio::fs::create_dir_all(install_dir).await?;
    let mut total_bytes: u64 = 0;
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(DataChannelError::Cancelled);
        }

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let path_len = u16::from_be_bytes(len_buf) as usize;
        if path_len == 0 {
            info!(total_bytes, "data channel: end marker received");
            return Ok(total_bytes);
        }

        let mut path_buf = vec![0u8; path_len];
        stream.read_exact(&mut path_buf).await?;
        let relative_path =
            String::from_utf8(path_buf).map_err(|_| DataChannelError::PathNotUtf8)?;

        let mut size_buf = [0u8; 8];
        stream.read_exact(&mut size_buf).await?;
        let file_size = u64::from_be_bytes(size_buf);

        validate_relative_path(&relative_path)?;

        let full_path = install_dir.join(&relative_path);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&full_path).await?;

        let mut remaining = file_size;
        while remaining > 0 {
            if cancel.load(Ordering::SeqCst) {
                return Err(DataChannelError::Cancelled);
            }
            let to_read = remaining.min(BUFFER_SIZE as u64) as usize;
            let n = stream.read(&mut buf[..to_read]).await?;
            if n == 0 {
                return Err(DataChannelError::UnexpectedEof);
            }
            file.write_all(&buf[..n]).await?;
            remaining -= n as u64;
            total_bytes += n as u64;
            progress(total_bytes, &relative_path);
        }
        file.flush().await?;
        info!(path = %relative_path, file_size, "data channel: file received");
    }
}
