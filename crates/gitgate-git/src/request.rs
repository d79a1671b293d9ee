//! Inbound request metadata and body buffering.

use crate::{GitError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Bytes, BytesMut};
use flate2::write::{GzDecoder, ZlibDecoder};
use std::io::Write;
use tracing::debug;

/// Content encoding of a request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentEncoding {
    /// No encoding; bytes pass through.
    #[default]
    Identity,
    /// gzip.
    Gzip,
    /// zlib-wrapped deflate.
    Deflate,
}

impl ContentEncoding {
    /// Maps a `content-encoding` header value. Unknown values pass through.
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("gzip") || v.eq_ignore_ascii_case("x-gzip") => {
                Self::Gzip
            }
            Some(v) if v.eq_ignore_ascii_case("deflate") => Self::Deflate,
            _ => Self::Identity,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }
}

/// The request headers a session reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHeaders {
    /// `content-encoding`.
    pub content_encoding: ContentEncoding,
    /// `content-length`.
    pub content_length: Option<u64>,
    /// `authorization`.
    pub authorization: Option<String>,
}

impl RequestHeaders {
    /// Collects the relevant headers from name/value pairs.
    ///
    /// Names are matched case-insensitively. An unparsable `content-length`
    /// counts as absent.
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut headers = Self::default();
        for (name, value) in pairs {
            if name.eq_ignore_ascii_case("content-encoding") {
                headers.content_encoding = ContentEncoding::from_header(Some(value));
            } else if name.eq_ignore_ascii_case("content-length") {
                headers.content_length = value.trim().parse().ok();
            } else if name.eq_ignore_ascii_case("authorization") {
                headers.authorization = Some(value.to_string());
            }
        }
        headers
    }

    /// Username from a `Basic` authorization header, if any.
    ///
    /// The password is discarded.
    pub fn basic_username(&self) -> Option<String> {
        let value = self.authorization.as_deref()?;
        let mut tokens = value.split(' ');
        if tokens.next() != Some("Basic") {
            return None;
        }

        let decoded = match STANDARD.decode(tokens.next()?.trim()) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(error = %e, "ignoring malformed basic credentials");
                return None;
            }
        };
        let credentials = String::from_utf8_lossy(&decoded);
        credentials.split(':').next().map(str::to_string)
    }
}

enum Decoder {
    Identity(BytesMut),
    Gzip(GzDecoder<Vec<u8>>),
    Deflate(ZlibDecoder<Vec<u8>>),
}

/// Accumulates a request body until its declared length has arrived.
///
/// The declared length counts the bytes on the wire, so for encoded bodies it
/// is compared against the encoded byte count while decoded bytes are kept.
pub struct BodyBuffer {
    encoding: ContentEncoding,
    decoder: Decoder,
    target: Option<u64>,
    received: u64,
    complete: bool,
}

impl BodyBuffer {
    /// Creates a buffer expecting `target` wire bytes.
    pub fn new(encoding: ContentEncoding, target: Option<u64>) -> Self {
        let decoder = match encoding {
            ContentEncoding::Identity => Decoder::Identity(BytesMut::new()),
            ContentEncoding::Gzip => Decoder::Gzip(GzDecoder::new(Vec::new())),
            ContentEncoding::Deflate => Decoder::Deflate(ZlibDecoder::new(Vec::new())),
        };
        Self {
            encoding,
            decoder,
            target,
            received: 0,
            complete: target == Some(0),
        }
    }

    /// Wire bytes accepted so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Returns true once the declared length has arrived.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Appends a wire chunk and reports whether the body is complete.
    ///
    /// Bytes beyond the declared length are ignored.
    pub fn append(&mut self, chunk: &[u8]) -> Result<bool> {
        if self.complete {
            return Ok(true);
        }

        let chunk = match self.target {
            Some(target) => {
                let room = target.saturating_sub(self.received);
                let room = usize::try_from(room).unwrap_or(usize::MAX);
                &chunk[..chunk.len().min(room)]
            }
            None => chunk,
        };
        self.received += chunk.len() as u64;

        let written = match &mut self.decoder {
            Decoder::Identity(buf) => {
                buf.extend_from_slice(chunk);
                Ok(())
            }
            Decoder::Gzip(d) => d.write_all(chunk),
            Decoder::Deflate(d) => d.write_all(chunk),
        };
        written.map_err(|source| GitError::Decode {
            encoding: self.encoding.name(),
            source,
        })?;

        self.complete = self.target == Some(self.received);
        Ok(self.complete)
    }

    /// Marks the body complete regardless of the declared length.
    pub fn complete_now(&mut self) {
        self.complete = true;
    }

    /// Returns the decoded body.
    pub fn finish(self) -> Result<Bytes> {
        let encoding = self.encoding.name();
        let decoded = match self.decoder {
            Decoder::Identity(buf) => return Ok(buf.freeze()),
            Decoder::Gzip(d) => d.finish(),
            Decoder::Deflate(d) => d.finish(),
        };
        decoded
            .map(Bytes::from)
            .map_err(|source| GitError::Decode { encoding, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_headers_from_pairs() {
        let headers = RequestHeaders::from_pairs([
            ("Content-Encoding", "gzip"),
            ("Content-Length", "42"),
            ("Authorization", "Basic YWxpY2U6c2VjcmV0"),
            ("User-Agent", "git/2.45.0"),
        ]);
        assert_eq!(headers.content_encoding, ContentEncoding::Gzip);
        assert_eq!(headers.content_length, Some(42));
        assert_eq!(headers.basic_username().as_deref(), Some("alice"));
    }

    #[test]
    fn test_bad_content_length_is_absent() {
        let headers = RequestHeaders::from_pairs([("content-length", "lots")]);
        assert_eq!(headers.content_length, None);
    }

    #[test]
    fn test_unknown_encoding_passes_through() {
        assert_eq!(
            ContentEncoding::from_header(Some("br")),
            ContentEncoding::Identity
        );
        assert_eq!(ContentEncoding::from_header(None), ContentEncoding::Identity);
    }

    #[test]
    fn test_basic_username() {
        let encoded = STANDARD.encode("alice:secret");
        let headers = RequestHeaders {
            authorization: Some(format!("Basic {}", encoded)),
            ..Default::default()
        };
        assert_eq!(headers.basic_username().as_deref(), Some("alice"));
    }

    #[test]
    fn test_basic_username_ignores_other_schemes() {
        let headers = RequestHeaders {
            authorization: Some("Bearer abc.def".to_string()),
            ..Default::default()
        };
        assert!(headers.basic_username().is_none());

        let headers = RequestHeaders {
            authorization: Some("Basic !!!not-base64".to_string()),
            ..Default::default()
        };
        assert!(headers.basic_username().is_none());
    }

    #[test]
    fn test_identity_buffer_completes_at_length() {
        let mut buf = BodyBuffer::new(ContentEncoding::Identity, Some(10));
        assert!(!buf.append(b"0009d").unwrap());
        assert!(buf.append(b"one\n0000extra").unwrap());
        assert_eq!(buf.received(), 10);
        assert_eq!(buf.finish().unwrap(), Bytes::from_static(b"0009done\n0"));
    }

    #[test]
    fn test_buffer_without_length_never_completes() {
        let mut buf = BodyBuffer::new(ContentEncoding::Identity, None);
        assert!(!buf.append(b"0009done\n").unwrap());
        assert!(!buf.is_complete());
        buf.complete_now();
        assert!(buf.is_complete());
    }

    #[test]
    fn test_zero_length_is_complete() {
        let buf = BodyBuffer::new(ContentEncoding::Identity, Some(0));
        assert!(buf.is_complete());
        assert!(buf.finish().unwrap().is_empty());
    }

    #[test]
    fn test_gzip_buffer_decodes_in_chunks() {
        let body = b"0032want e69de29bb2d1d6434b8b29ae775ad8c2e48c5391\n00000009done\n";
        let wire = gzip(body);

        let mut buf = BodyBuffer::new(ContentEncoding::Gzip, Some(wire.len() as u64));
        let (head, tail) = wire.split_at(wire.len() / 2);
        assert!(!buf.append(head).unwrap());
        assert!(buf.append(tail).unwrap());
        assert_eq!(buf.finish().unwrap(), Bytes::from_static(body));
    }

    #[test]
    fn test_declared_length_beyond_u32() {
        let target = u64::from(u32::MAX) + 11;
        let mut buffer = BodyBuffer::new(ContentEncoding::Identity, Some(target));

        assert!(!buffer.append(b"0009done
").unwrap());
        assert_eq!(buffer.received(), 9);
        assert!(!buffer.is_complete());
    }

    #[test]
    fn test_deflate_buffer() {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"0009done\n").unwrap();
        let wire = enc.finish().unwrap();

        let mut buf = BodyBuffer::new(ContentEncoding::Deflate, Some(wire.len() as u64));
        assert!(buf.append(&wire).unwrap());
        assert_eq!(buf.finish().unwrap(), Bytes::from_static(b"0009done\n"));
    }

    #[test]
    fn test_corrupt_gzip_fails() {
        let mut buf = BodyBuffer::new(ContentEncoding::Gzip, Some(16));
        let result = buf
            .append(b"definitely-not-gz")
            .and_then(|_| buf.finish().map(|_| true));
        assert!(matches!(result, Err(GitError::Decode { .. })));
    }
}
