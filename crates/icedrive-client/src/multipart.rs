//! Multipart/form-data bodies with the boundary convention the service's
//! web clients use (`----geckoformboundary` plus 16 random bytes in hex).
//!
//! reqwest's own multipart support cannot pin a custom boundary, so the
//! bodies are assembled by hand: fully buffered for small forms, or as a
//! prologue / file stream / epilogue triple for uploads.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

pub(crate) fn random_boundary() -> String {
    let mut raw = [0u8; 16];
    OsRng.fill_bytes(&mut raw);
    format!("----geckoformboundary{}", hex::encode(raw))
}

fn escape_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Builder for a multipart/form-data body.
pub struct FormBuilder {
    boundary: String,
    buf: BytesMut,
}

impl FormBuilder {
    pub fn new() -> Self {
        Self {
            boundary: random_boundary(),
            buf: BytesMut::new(),
        }
    }

    /// `Content-Type` header value for this form.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Append a simple text field.
    pub fn field(&mut self, name: &str, value: &str) -> &mut Self {
        self.buf.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                self.boundary, name, value
            )
            .as_bytes(),
        );
        self
    }

    /// Close the form, returning the full body.
    pub fn finish(mut self) -> Bytes {
        self.buf
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        self.buf.freeze()
    }

    /// Turn the form into a streaming body: everything so far plus the file
    /// part header as the prologue, the part body supplied separately, and
    /// the closing boundary as the epilogue.
    pub fn into_streaming(
        mut self,
        name: &str,
        filename: &str,
        content_type: &str,
    ) -> StreamingForm {
        let form_content_type = self.content_type();
        self.buf.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                self.boundary,
                name,
                escape_quoted(filename),
                content_type
            )
            .as_bytes(),
        );
        StreamingForm {
            content_type: form_content_type,
            prologue: self.buf.freeze(),
            epilogue: Bytes::from(format!("\r\n--{}--\r\n", self.boundary)),
        }
    }
}

impl Default for FormBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A form split around one streamed file part.
pub struct StreamingForm {
    pub content_type: String,
    pub prologue: Bytes,
    pub epilogue: Bytes,
}

impl StreamingForm {
    /// Compose the full request body around the given part reader.
    pub fn body<R>(self, part: R) -> reqwest::Body
    where
        R: AsyncRead + Send + 'static,
    {
        let stream = futures::stream::iter([Ok::<_, std::io::Error>(self.prologue)])
            .chain(ReaderStream::new(part))
            .chain(futures::stream::iter([Ok(self.epilogue)]));
        reqwest::Body::wrap_stream(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundary_shape() {
        let b = random_boundary();
        assert!(b.starts_with("----geckoformboundary"));
        let hex_part = &b["----geckoformboundary".len()..];
        assert_eq!(hex_part.len(), 32);
        assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_buffered_form_layout() {
        let mut form = FormBuilder::new();
        let boundary = form.content_type();
        let boundary = boundary.split("boundary=").nth(1).unwrap().to_string();
        form.field("request", "move").field("folderId", "42");
        let body = String::from_utf8(form.finish().to_vec()).unwrap();

        assert!(body.contains(&format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"request\"\r\n\r\nmove\r\n"
        )));
        assert!(body.contains("name=\"folderId\"\r\n\r\n42\r\n"));
        assert!(body.ends_with(&format!("--{boundary}--\r\n")));
    }

    #[test]
    fn test_streaming_form_wraps_part() {
        let mut form = FormBuilder::new();
        form.field("crypto", "1");
        let sf = form.into_streaming("files[]", "we \"quote\".bin", "application/octet-stream");

        let prologue = String::from_utf8(sf.prologue.to_vec()).unwrap();
        assert!(prologue.contains("name=\"files[]\"; filename=\"we \\\"quote\\\".bin\""));
        assert!(prologue.contains("Content-Type: application/octet-stream\r\n\r\n"));
        assert!(prologue.contains("name=\"crypto\"\r\n\r\n1\r\n"));
        let epilogue = String::from_utf8(sf.epilogue.to_vec()).unwrap();
        assert!(epilogue.starts_with("\r\n--"));
        assert!(epilogue.ends_with("--\r\n"));
    }
}
