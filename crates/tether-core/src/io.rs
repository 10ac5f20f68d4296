//! Stream copying with detach-sequence detection.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const COPY_BUFFER: usize = 32 * 1024;

/// Why a detachable copy stopped early.
#[derive(Debug, Error)]
pub enum CopyError {
    /// The detach key sequence was read from the input.
    #[error("detached from container")]
    Detached,

    /// Reading or writing failed.
    #[error("stream copy failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Copies `reader` into `writer` until end of input, returning the number
/// of bytes written.
///
/// Bytes matching a prefix of `keys` are held back. If the whole sequence
/// arrives the copy stops with [`CopyError::Detached`] and the sequence
/// itself is never written; if the match breaks off, the held bytes are
/// written through unchanged. An empty `keys` disables detection.
///
/// # Errors
///
/// Returns [`CopyError::Detached`] when the key sequence is read and
/// [`CopyError::Io`] when either stream fails.
pub async fn copy_detachable<R, W>(reader: &mut R, writer: &mut W, keys: &[u8]) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0_u8; COPY_BUFFER];
    let mut pending = Vec::with_capacity(COPY_BUFFER);
    let mut matched = 0_usize;
    let mut written = 0_u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            pending.extend_from_slice(&keys[..matched]);
            written += flush(writer, &mut pending).await?;
            return Ok(written);
        }

        for &byte in &buf[..n] {
            if !keys.is_empty() && byte == keys[matched] {
                matched += 1;
                if matched == keys.len() {
                    let _ = flush(writer, &mut pending).await?;
                    tracing::debug!("detach sequence received");
                    return Err(CopyError::Detached);
                }
                continue;
            }
            if matched > 0 {
                pending.extend_from_slice(&keys[..matched]);
                matched = 0;
                // The breaking byte may itself open a new sequence.
                if byte == keys[0] {
                    matched = 1;
                    continue;
                }
            }
            pending.push(byte);
        }
        written += flush(writer, &mut pending).await?;
    }
}

async fn flush<W>(writer: &mut W, pending: &mut Vec<u8>) -> std::io::Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if pending.is_empty() {
        return Ok(0);
    }
    writer.write_all(pending).await?;
    writer.flush().await?;
    let len = pending.len() as u64;
    pending.clear();
    Ok(len)
}
