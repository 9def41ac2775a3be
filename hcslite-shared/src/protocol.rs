//! Shim pipe protocol.
//!
//! Requests travel as length-delimited JSON; the response is either the fixed
//! success marker or free-form UTF-8 error text, followed by a half-close of
//! the write side. The receiver drains to EOF before returning so the server
//! can complete cleanup before the sender proceeds. The same marker-or-text
//! convention is used by shim children on their stderr pipe to signal setup
//! success to the parent.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::shim::{MAX_MESSAGE_BYTES, SUCCESS_MARKER};
use crate::errors::{HcsliteError, HcsliteResult};

/// Operations served by the VM shim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShimOp {
    CreateContainer,
    UnmountContainer,
    UnmountContainerDiskOnly,
    SyncNamespace,
}

impl std::fmt::Display for ShimOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShimOp::CreateContainer => "create-container",
            ShimOp::UnmountContainer => "unmount-container",
            ShimOp::UnmountContainerDiskOnly => "unmount-container-disk-only",
            ShimOp::SyncNamespace => "sync-namespace",
        };
        write!(f, "{}", name)
    }
}

/// A request sent to the VM shim. Every request names a container.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShimRequest {
    pub id: String,
    pub op: ShimOp,
}

/// Write one length-delimited JSON message.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> HcsliteResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() as u64 > MAX_MESSAGE_BYTES as u64 {
        return Err(HcsliteError::Protocol(format!(
            "message of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_MESSAGE_BYTES
        )));
    }
    writer.write_u32_le(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-delimited JSON message.
pub async fn read_message<R, T>(reader: &mut R) -> HcsliteResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32_le().await?;
    if len > MAX_MESSAGE_BYTES {
        return Err(HcsliteError::Protocol(format!(
            "declared message length {} exceeds the {} byte limit",
            len, MAX_MESSAGE_BYTES
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Write the success marker.
pub async fn write_success<W: AsyncWrite + Unpin>(writer: &mut W) -> HcsliteResult<()> {
    writer.write_all(SUCCESS_MARKER).await?;
    writer.flush().await?;
    Ok(())
}

/// Write an error as free-form UTF-8 text.
pub async fn write_error_text<W: AsyncWrite + Unpin>(
    writer: &mut W,
    err: &HcsliteError,
) -> HcsliteResult<()> {
    writer.write_all(err.to_string().as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Drain a response stream to EOF and decide success or failure.
///
/// A stream that carries exactly the success marker is success. Anything
/// else is an error message from the peer; an empty stream means the peer
/// died before reporting.
pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> HcsliteResult<()> {
    let mut body = Vec::new();
    reader.read_to_end(&mut body).await?;
    if body == SUCCESS_MARKER {
        return Ok(());
    }
    if body.is_empty() {
        return Err(HcsliteError::Protocol(
            "peer closed the pipe without a response".into(),
        ));
    }
    Err(HcsliteError::Protocol(
        String::from_utf8_lossy(&body).into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_round_trips_through_the_frame() {
        let request = ShimRequest {
            id: "container-7".into(),
            op: ShimOp::UnmountContainerDiskOnly,
        };

        let mut wire = Vec::new();
        write_message(&mut wire, &request).await.unwrap();

        let mut reader = wire.as_slice();
        let decoded: ShimRequest = read_message(&mut reader).await.unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn op_names_match_the_wire_contract() {
        let json = serde_json::to_string(&ShimOp::CreateContainer).unwrap();
        assert_eq!(json, "\"create-container\"");
        let json = serde_json::to_string(&ShimOp::SyncNamespace).unwrap();
        assert_eq!(json, "\"sync-namespace\"");
    }

    #[tokio::test]
    async fn oversized_declared_length_is_rejected() {
        let mut wire = Vec::new();
        tokio::io::AsyncWriteExt::write_u32_le(&mut wire, MAX_MESSAGE_BYTES + 1)
            .await
            .unwrap();
        let mut reader = wire.as_slice();
        let err = read_message::<_, ShimRequest>(&mut reader)
            .await
            .unwrap_err();
        assert!(matches!(err, HcsliteError::Protocol(_)));
    }

    #[tokio::test]
    async fn success_marker_reads_as_success() {
        let mut wire = Vec::new();
        write_success(&mut wire).await.unwrap();
        assert!(read_response(&mut wire.as_slice()).await.is_ok());
    }

    #[tokio::test]
    async fn error_text_reads_as_protocol_error() {
        let mut wire = Vec::new();
        write_error_text(&mut wire, &HcsliteError::AlreadyStopped)
            .await
            .unwrap();
        let err = read_response(&mut wire.as_slice()).await.unwrap_err();
        assert!(err.to_string().contains("already stopped"));
    }

    #[tokio::test]
    async fn empty_stream_means_the_peer_died() {
        let err = read_response(&mut [].as_slice()).await.unwrap_err();
        assert!(matches!(err, HcsliteError::Protocol(_)));
    }
}
