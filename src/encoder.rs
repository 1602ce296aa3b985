//! Streaming response encoder
//!
//! Two modes:
//!
//! - **Buffered**: serialize once; bodies above the threshold are gzip-compressed and
//!   marked with `Content-Encoding: gzip`.
//! - **Incremental**: emit `[`, the items separated by `,`, then `]` as they arrive. With
//!   per-item compression every chunk is its own gzip member; concatenated members are a
//!   valid gzip stream.
//!
//! If the item stream yields an error part-way, consumption stops and the array is closed
//! with one final `{"stream_error": "..."}` element, so the body is always valid JSON.

use std::convert::Infallible;
use std::fmt::Display;
use std::io::Write;

use axum::body::Body;
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, error};

use crate::error::{GatewayError, Result};

pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct StreamingEncoder {
    threshold: usize,
}

impl Default for StreamingEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESSION_THRESHOLD)
    }
}

/// A fully serialized response body
#[derive(Debug, Clone)]
pub struct EncodedBody {
    pub bytes: Bytes,
    pub compressed: bool,
}

impl IntoResponse for EncodedBody {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.bytes));
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        if self.compressed {
            headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }
        response
    }
}

enum Phase<S> {
    Open(S),
    Items { items: S, first: bool },
    Done,
}

impl StreamingEncoder {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    /// Buffered encoding; `allow_compression` is false when the client did not send
    /// `Accept-Encoding: gzip`
    pub fn encode<T: Serialize>(&self, value: &T, allow_compression: bool) -> Result<EncodedBody> {
        let json = serde_json::to_vec(value)?;

        if !allow_compression || json.len() <= self.threshold {
            return Ok(EncodedBody {
                bytes: Bytes::from(json),
                compressed: false,
            });
        }

        let original = json.len();
        let compressed = gzip(&json)
            .map_err(|err| GatewayError::Serialization(format!("gzip failed: {}", err)))?;
        debug!(original, compressed = compressed.len(), "Compressed response body");
        Ok(EncodedBody {
            bytes: Bytes::from(compressed),
            compressed: true,
        })
    }

    /// Encode `items` as a JSON array, one chunk per element
    pub fn encode_incremental<S, T, E>(
        &self,
        items: S,
        compress_items: bool,
    ) -> impl Stream<Item = Bytes> + Send + 'static
    where
        S: Stream<Item = std::result::Result<T, E>> + Send + 'static,
        T: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        stream::unfold(Phase::Open(Box::pin(items)), |phase| async move {
            match phase {
                Phase::Open(items) => Some((
                    Bytes::from_static(b"["),
                    Phase::Items { items, first: true },
                )),
                Phase::Items { mut items, first } => {
                    let chunk = match items.next().await {
                        None => return Some((Bytes::from_static(b"]"), Phase::Done)),
                        Some(Ok(item)) => match serde_json::to_vec(&item) {
                            Ok(json) => json,
                            Err(err) => return Some((error_tail(first, &err), Phase::Done)),
                        },
                        Some(Err(err)) => return Some((error_tail(first, &err), Phase::Done)),
                    };

                    let mut buf = Vec::with_capacity(chunk.len() + 1);
                    if !first {
                        buf.push(b',');
                    }
                    buf.extend_from_slice(&chunk);
                    Some((Bytes::from(buf), Phase::Items { items, first: false }))
                }
                Phase::Done => None,
            }
        })
        .map(move |chunk| {
            if compress_items {
                compress_chunk(chunk)
            } else {
                chunk
            }
        })
    }

    /// Incremental encoding wrapped in an HTTP response
    pub fn incremental_response<S, T, E>(&self, items: S, compress_items: bool) -> Response
    where
        S: Stream<Item = std::result::Result<T, E>> + Send + 'static,
        T: Serialize + Send + 'static,
        E: Display + Send + 'static,
    {
        let body = self
            .encode_incremental(items, compress_items)
            .map(Ok::<_, Infallible>);
        let mut response = Response::new(Body::from_stream(body));
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        if compress_items {
            headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }
        response
    }
}

fn error_tail(first: bool, err: &dyn Display) -> Bytes {
    let message = err.to_string();
    error!(error = %message, "Item stream failed, closing array with an error element");

    let element = serde_json::json!({ "stream_error": message });
    let mut buf = Vec::new();
    if !first {
        buf.push(b',');
    }
    buf.extend_from_slice(element.to_string().as_bytes());
    buf.push(b']');
    Bytes::from(buf)
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn compress_chunk(chunk: Bytes) -> Bytes {
    match gzip(&chunk) {
        Ok(compressed) => Bytes::from(compressed),
        Err(err) => {
            // Skip the chunk; the members already sent still decode
            error!(error = %err, "Failed to compress stream chunk");
            Bytes::new()
        }
    }
}

pub fn accepts_gzip(headers: &axum::http::HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|encoding| {
            let encoding = encoding.trim();
            encoding == "gzip" || encoding.starts_with("gzip;") || encoding == "*"
        })
}
