//! Streaming upload and download composition.
//!
//! A transfer couples the synchronous stream codec with an HTTP body through
//! a byte pipe: the codec runs on a dedicated blocking thread bridged onto
//! the async side, and the caller's end observes codec failures when the
//! pipe drains. Long-lived handles hold their pooled sender until closed.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::TryStreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;
use tokio_util::io::{StreamReader, SyncIoBridge};

use crate::error::{ClientError, Result};
use crate::multipart::FormBuilder;
use crate::pool::PooledSender;
use crate::sender::{parse_response, Sender};
use crate::types::UploadResponse;

pub(crate) const PIPE_BUF_SIZE: usize = 64 * 1024;

/// Reader over a pipe fed by a blocking codec task. At end of stream the
/// task's result is surfaced, so a codec failure reads as an error instead
/// of silent truncation.
pub(crate) struct CipherTaskReader {
    inner: DuplexStream,
    task: Option<JoinHandle<icedrive_crypto::Result<()>>>,
}

impl AsyncRead for CipherTaskReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) if buf.filled().len() == before => {
                // pipe drained: report how the codec task ended
                let Some(mut task) = self.task.take() else {
                    return Poll::Ready(Ok(()));
                };
                match Pin::new(&mut task).poll(cx) {
                    Poll::Ready(Ok(Ok(()))) => Poll::Ready(Ok(())),
                    Poll::Ready(Ok(Err(err))) => {
                        Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidData, err)))
                    }
                    Poll::Ready(Err(join_err)) => {
                        Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, join_err)))
                    }
                    Poll::Pending => {
                        self.task = Some(task);
                        Poll::Pending
                    }
                }
            }
            other => other,
        }
    }
}

/// Encrypt an async plaintext reader into the framed wire format.
///
/// Must be called from within a tokio runtime; the codec itself runs on a
/// blocking thread.
pub(crate) fn encrypt_reader<R>(plain: R, key_hex: String, plaintext_size: u64) -> CipherTaskReader
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (writer, reader) = tokio::io::duplex(PIPE_BUF_SIZE);
    let mut src = SyncIoBridge::new(plain);
    let mut dst = SyncIoBridge::new(writer);
    let task = tokio::task::spawn_blocking(move || {
        icedrive_crypto::stream::encrypt_stream(&mut dst, &mut src, &key_hex, plaintext_size)
    });
    CipherTaskReader {
        inner: reader,
        task: Some(task),
    }
}

/// Decrypt an identity-encoded download body into plaintext.
pub(crate) fn decrypt_response(response: reqwest::Response, key_hex: String) -> CipherTaskReader {
    let stream = response
        .bytes_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    let body = StreamReader::new(Box::pin(stream));

    let (writer, reader) = tokio::io::duplex(PIPE_BUF_SIZE);
    let mut src = SyncIoBridge::new(body);
    let mut dst = SyncIoBridge::new(writer);
    let task = tokio::task::spawn_blocking(move || {
        icedrive_crypto::stream::decrypt_stream(&mut dst, &mut src, &key_hex)
    });
    CipherTaskReader {
        inner: reader,
        task: Some(task),
    }
}

/// Static fields of one upload request.
pub(crate) struct UploadParams {
    pub folder_id: u64,
    pub file_name: String,
    pub moddate: f64,
    pub content_type: String,
}

/// First endpoint from geo discovery.
pub(crate) async fn first_upload_endpoint(sender: &Sender) -> Result<String> {
    let endpoints = sender.upload_endpoints().await?;
    endpoints
        .into_iter()
        .next()
        .ok_or(ClientError::NoUploadEndpoints)
}

/// POST one multipart upload whose `files[]` part streams from `part`.
/// Crypto uploads carry the encrypted name and the `crypto` marker; `part`
/// is then expected to be ciphertext already.
pub(crate) async fn upload_via<R>(
    sender: &Sender,
    endpoint: &str,
    params: &UploadParams,
    encrypted_name_hex: Option<&str>,
    part: R,
) -> Result<UploadResponse>
where
    R: AsyncRead + Send + 'static,
{
    let mut form = FormBuilder::new();
    form.field("folderId", &params.folder_id.to_string());
    form.field("moddate", &format!("{}", params.moddate));
    if let Some(name_hex) = encrypted_name_hex {
        form.field("custom_filename", name_hex);
        form.field("crypto", "1");
    }
    let streaming = form.into_streaming("files[]", &params.file_name, &params.content_type);
    let content_type = streaming.content_type.clone();
    let resp = sender
        .post_stream(endpoint, &content_type, streaming.body(part))
        .await?;
    parse_response(&resp)
}

/// Write handle for a streaming upload. Bytes written here become the
/// `files[]` part (encrypted in flight for crypto uploads); `finish`
/// completes the request and returns the server's response. The pooled
/// sender is held by the request task and released when it completes.
pub struct UploadWriter {
    pipe: DuplexStream,
    task: JoinHandle<Result<UploadResponse>>,
}

impl UploadWriter {
    pub(crate) fn new(pipe: DuplexStream, task: JoinHandle<Result<UploadResponse>>) -> Self {
        Self { pipe, task }
    }

    /// Signal end of input and wait for the service's response.
    pub async fn finish(mut self) -> Result<UploadResponse> {
        self.pipe.shutdown().await?;
        match (&mut self.task).await {
            Ok(result) => result,
            Err(join_err) => Err(ClientError::Io(io::Error::new(
                io::ErrorKind::Other,
                join_err,
            ))),
        }
    }
}

impl AsyncWrite for UploadWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.pipe).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.pipe).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.pipe).poll_shutdown(cx)
    }
}

/// Read handle for a streaming download; plaintext for crypto items. Holds
/// its pooled sender exclusively until dropped.
pub struct DownloadStream {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    _sender: PooledSender,
}

impl DownloadStream {
    pub(crate) fn plain(response: reqwest::Response, sender: PooledSender) -> Self {
        let stream = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        Self {
            inner: Box::new(StreamReader::new(Box::pin(stream))),
            _sender: sender,
        }
    }

    pub(crate) fn decrypted(
        response: reqwest::Response,
        key_hex: String,
        sender: PooledSender,
    ) -> Self {
        Self {
            inner: Box::new(decrypt_response(response, key_hex)),
            _sender: sender,
        }
    }
}

impl AsyncRead for DownloadStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    const KEY: &str = "1111111111111111111111111111111111111111111111111111111111111111";

    #[tokio::test]
    async fn test_encrypt_reader_roundtrips_through_codec() {
        let plain: Vec<u8> = (0..70_000).map(|i| (i % 256) as u8).collect();
        let mut cipher_reader =
            encrypt_reader(std::io::Cursor::new(plain.clone()), KEY.to_string(), 70_000);
        let mut cipher = Vec::new();
        cipher_reader.read_to_end(&mut cipher).await.unwrap();
        assert_eq!(cipher.len(), 32 + 70_000);

        let mut out = Vec::new();
        icedrive_crypto::stream::decrypt_stream(
            &mut out,
            &mut std::io::Cursor::new(cipher),
            KEY,
        )
        .unwrap();
        assert_eq!(out, plain);
    }

    #[tokio::test]
    async fn test_encrypt_reader_surfaces_codec_error() {
        // declared size disagrees with the source, so the codec must fail
        // and the reader must end with an error rather than clean EOF
        let plain = vec![0u8; 100];
        let mut cipher_reader =
            encrypt_reader(std::io::Cursor::new(plain), KEY.to_string(), 999);
        let mut sink = Vec::new();
        let err = cipher_reader.read_to_end(&mut sink).await.unwrap_err();
        assert!(err.to_string().contains("length mismatch"));
    }
}
