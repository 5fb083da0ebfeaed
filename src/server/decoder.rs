//! Decode boundary between raw socket reads and request framing events.
//!
//! Accumulates incoming bytes in a `BytesMut` and runs a two-state machine
//! over them: waiting for a complete request head, then consuming the
//! declared `Content-Length` worth of body. Header-line parsing is
//! delegated to `httparse`; chunked transfer encoding is not supported by
//! the protocol and not handled here.
//!
//! The decoder deliberately preserves fragmentation: body bytes are
//! emitted as [`RequestPart::Body`] chunks exactly as they arrive, and a
//! single read containing several pipelined requests yields all of their
//! events in order. Reassembly is the pipeline buffer's job, not ours.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Upper bound on header lines per request.
const MAX_HEADERS: usize = 32;

/// Errors from the decode boundary. Any of these closes the connection.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The request head could not be parsed.
    #[error("malformed request head: {0}")]
    Head(httparse::Error),

    /// The Content-Length header was present but not a valid length.
    #[error("invalid Content-Length header")]
    ContentLength,
}

/// Parsed request head, the minimum the router needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// HTTP method, e.g. "GET".
    pub method: String,
    /// Request target path.
    pub path: String,
    /// Declared body length in bytes (0 when absent).
    pub content_length: usize,
}

/// One framing event. For each request the decoder emits exactly one
/// `Head`, zero or more `Body` chunks, then one `End`, in that order.
#[derive(Debug)]
pub enum RequestPart {
    Head(RequestHead),
    Body(Bytes),
    End,
}

#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for a complete header section.
    Head,
    /// Head emitted; `remaining` body bytes still expected.
    Body { remaining: usize },
}

/// Push-based decoder turning raw reads into [`RequestPart`] events.
pub struct HttpDecoder {
    buffer: BytesMut,
    state: State,
}

impl HttpDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::Head,
        }
    }

    /// Feed one chunk of bytes and drain every framing event it completes.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] for a malformed head; the caller is
    /// expected to log it and close the connection.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<RequestPart>, DecodeError> {
        self.buffer.extend_from_slice(chunk);

        let mut parts = Vec::new();
        loop {
            match self.state {
                State::Head => {
                    let parsed = {
                        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                        let mut request = httparse::Request::new(&mut headers);
                        match request.parse(&self.buffer) {
                            Ok(httparse::Status::Complete(head_len)) => {
                                let content_length = content_length(request.headers)?;
                                Some((
                                    head_len,
                                    RequestHead {
                                        method: request.method.unwrap_or_default().to_owned(),
                                        path: request.path.unwrap_or_default().to_owned(),
                                        content_length,
                                    },
                                ))
                            }
                            Ok(httparse::Status::Partial) => None,
                            Err(e) => return Err(DecodeError::Head(e)),
                        }
                    };

                    match parsed {
                        Some((head_len, head)) => {
                            self.buffer.advance(head_len);
                            let content_length = head.content_length;
                            parts.push(RequestPart::Head(head));
                            if content_length == 0 {
                                parts.push(RequestPart::End);
                            } else {
                                self.state = State::Body {
                                    remaining: content_length,
                                };
                            }
                        }
                        None => break,
                    }
                }
                State::Body { remaining } => {
                    if self.buffer.is_empty() {
                        break;
                    }
                    let take = remaining.min(self.buffer.len());
                    parts.push(RequestPart::Body(self.buffer.split_to(take).freeze()));
                    if take == remaining {
                        parts.push(RequestPart::End);
                        self.state = State::Head;
                    } else {
                        self.state = State::Body {
                            remaining: remaining - take,
                        };
                        break;
                    }
                }
            }
        }

        Ok(parts)
    }
}

impl Default for HttpDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn content_length(headers: &[httparse::Header<'_>]) -> Result<usize, DecodeError> {
    for header in headers {
        if header.name.eq_ignore_ascii_case("content-length") {
            return std::str::from_utf8(header.value)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .ok_or(DecodeError::ContentLength);
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heads(parts: &[RequestPart]) -> Vec<&RequestHead> {
        parts
            .iter()
            .filter_map(|p| match p {
                RequestPart::Head(h) => Some(h),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn bodyless_request_in_one_read() {
        let mut decoder = HttpDecoder::new();
        let parts = decoder
            .push(b"GET /2018-06-01/runtime/invocation/next HTTP/1.1\r\nHost: x\r\n\r\n")
            .expect("well-formed");
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[0], RequestPart::Head(h)
            if h.method == "GET" && h.path.ends_with("/invocation/next") && h.content_length == 0));
        assert!(matches!(parts[1], RequestPart::End));
    }

    #[test]
    fn head_split_across_reads() {
        let mut decoder = HttpDecoder::new();
        let parts = decoder.push(b"GET /invocation/next HT").expect("partial head");
        assert!(parts.is_empty());
        let parts = decoder.push(b"TP/1.1\r\n\r\n").expect("completed head");
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn body_fragments_are_preserved() {
        let mut decoder = HttpDecoder::new();
        let parts = decoder
            .push(b"POST /invocation/abc/response HTTP/1.1\r\nContent-Length: 11\r\n\r\nhell")
            .expect("head plus partial body");
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[1], RequestPart::Body(b) if &b[..] == b"hell"));

        let parts = decoder.push(b"o worl").expect("more body");
        assert_eq!(parts.len(), 1);
        assert!(matches!(&parts[0], RequestPart::Body(b) if &b[..] == b"o worl"));

        let parts = decoder.push(b"d").expect("final body byte");
        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[0], RequestPart::Body(b) if &b[..] == b"d"));
        assert!(matches!(parts[1], RequestPart::End));
    }

    #[test]
    fn pipelined_requests_in_one_read() {
        let mut decoder = HttpDecoder::new();
        let wire = b"POST /invocation/a/response HTTP/1.1\r\nContent-Length: 2\r\n\r\nok\
                     POST /invocation/b/response HTTP/1.1\r\nContent-Length: 3\r\n\r\nyes";
        let parts = decoder.push(wire).expect("two pipelined requests");
        let heads = heads(&parts);
        assert_eq!(heads.len(), 2);
        assert_eq!(heads[0].path, "/invocation/a/response");
        assert_eq!(heads[1].path, "/invocation/b/response");
        assert_eq!(
            parts
                .iter()
                .filter(|p| matches!(p, RequestPart::End))
                .count(),
            2
        );
    }

    #[test]
    fn malformed_head_is_an_error() {
        let mut decoder = HttpDecoder::new();
        let result = decoder.push(b"\x00\x01garbage\r\n\r\n");
        assert!(matches!(result, Err(DecodeError::Head(_))));
    }

    #[test]
    fn bad_content_length_is_an_error() {
        let mut decoder = HttpDecoder::new();
        let result =
            decoder.push(b"POST /x HTTP/1.1\r\nContent-Length: banana\r\n\r\n");
        assert!(matches!(result, Err(DecodeError::ContentLength)));
    }
}
