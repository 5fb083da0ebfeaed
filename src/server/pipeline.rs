//! FIFO reassembly of pipelined requests from framing events.
//!
//! A persistent connection may carry several requests before any response
//! is written, and a request's body may arrive in any number of fragments.
//! The buffer turns the decoder's head/body/end events back into complete
//! requests, in arrival order.
//!
//! Body chunks always belong to whichever request is currently being
//! received on the wire, which is always the *oldest* entry whose end
//! marker has not arrived — so `Body` appends to the front of the queue
//! and `End` pops it. Queue length therefore equals the number of requests
//! whose head has arrived but whose end has not.
//!
//! Precondition: the buffer is owned by a single connection task and never
//! shared, so no locking is needed. Porting to a multi-threaded event loop
//! would require adding synchronization.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tracing::warn;

use super::decoder::{RequestHead, RequestPart};

/// A request whose head has arrived but whose end marker has not.
#[derive(Debug)]
struct PendingRequest {
    head: RequestHead,
    body: Option<BytesMut>,
}

/// A fully received request, ready for routing.
#[derive(Debug)]
pub struct CompletedRequest {
    pub head: RequestHead,
    pub body: Option<Bytes>,
}

/// Accumulator turning framing events into ordered complete requests.
#[derive(Debug, Default)]
pub struct RequestBuffer {
    queue: VecDeque<PendingRequest>,
}

impl RequestBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests received in part but not yet completed.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Apply one framing event; returns the completed request when the
    /// event was an end marker.
    ///
    /// Events violating the per-request head/body/end order (a body chunk
    /// or end marker with nothing pending) are logged and dropped rather
    /// than poisoning the connection.
    pub fn push(&mut self, part: RequestPart) -> Option<CompletedRequest> {
        match part {
            RequestPart::Head(head) => {
                self.queue.push_back(PendingRequest { head, body: None });
                None
            }
            RequestPart::Body(chunk) => {
                match self.queue.front_mut() {
                    Some(pending) => {
                        pending
                            .body
                            .get_or_insert_with(|| BytesMut::with_capacity(chunk.len()))
                            .extend_from_slice(&chunk);
                    }
                    None => warn!("body chunk with no pending request, dropping"),
                }
                None
            }
            RequestPart::End => match self.queue.pop_front() {
                Some(pending) => Some(CompletedRequest {
                    head: pending.head,
                    body: pending.body.map(BytesMut::freeze),
                }),
                None => {
                    warn!("end marker with no pending request, dropping");
                    None
                }
            },
        }
    }
}
