use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::channel::ReceivedFrame;
use crate::request::{RequestError, RequestResult, Response};

pub(super) struct PendingRequest<M> {
    seq: u32,
    sent: Instant,
    deadline: Instant,
    reply: oneshot::Sender<RequestResult<M>>,
}

impl<M> PendingRequest<M> {
    pub(super) fn respond(self, frame: ReceivedFrame<M>, now: Instant) {
        let result = match frame.message {
            Ok(message) => Ok(Response {
                msg_type: frame.msg_type,
                flags: frame.flags,
                seq: frame.seq,
                sseq: frame.sseq,
                message,
                rtt: now.saturating_duration_since(self.sent),
            }),
            Err(e) => Err(RequestError::InvalidResponse(e.to_string())),
        };
        self.complete(result);
    }

    pub(super) fn fail(self, error: RequestError) {
        debug!(seq = self.seq, "request failed: {}", error);
        self.complete(Err(error));
    }

    fn complete(self, result: RequestResult<M>) {
        if self.reply.send(result).is_err() {
            trace!(seq = self.seq, "requester is gone");
        }
    }
}

/// `a` was assigned before `b`, taking wrap-around into account
fn is_before(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

/// The requests in flight on one channel, in a ring indexed by `seq % capacity`.
///
/// The window spans the sequence numbers from the oldest pending request to the newest. Sequence
///  numbers are shared with all other messages on the channel, so the window can exceed the ring
///  with fewer than `capacity` requests pending, and requests that fall out of it fail with
///  `TooManyOutstanding`.
pub(super) struct RequestWindow<M> {
    slots: Vec<Option<PendingRequest<M>>>,
    len: usize,
    evict_older_on_response: bool,
}

impl<M> RequestWindow<M> {
    pub(super) fn new(capacity: usize, evict_older_on_response: bool) -> RequestWindow<M> {
        assert!(capacity > 0);
        RequestWindow {
            slots: (0..capacity).map(|_| None).collect(),
            len: 0,
            evict_older_on_response,
        }
    }

    pub(super) fn len(&self) -> usize {
        self.len
    }

    fn index(&self, seq: u32) -> usize {
        seq as usize % self.slots.len()
    }

    pub(super) fn register(&mut self, seq: u32, timeout: Duration, now: Instant) -> oneshot::Receiver<RequestResult<M>> {
        let capacity = self.slots.len() as u32;
        self.fail_where(
            |p| is_before(p.seq, seq) && seq.wrapping_sub(p.seq) >= capacity,
            RequestError::TooManyOutstanding,
        );

        let (reply, receiver) = oneshot::channel();
        let index = self.index(seq);
        let pending = PendingRequest {
            seq,
            sent: now,
            deadline: now + timeout,
            reply,
        };
        match self.slots[index].replace(pending) {
            Some(previous) => previous.fail(RequestError::TooManyOutstanding),
            None => self.len += 1,
        }
        trace!(seq, pending = self.len, "registered request");
        receiver
    }

    /// Removes the request with sequence number `seq`, if it is pending
    pub(super) fn remove(&mut self, seq: u32) -> Option<PendingRequest<M>> {
        let index = self.index(seq);
        match &self.slots[index] {
            Some(p) if p.seq == seq => {
                self.len -= 1;
                self.slots[index].take()
            }
            _ => None,
        }
    }

    /// Removes the request that a response with `sseq` answers. If configured, older requests
    ///  are evicted.
    pub(super) fn take_response(&mut self, sseq: u32) -> Option<PendingRequest<M>> {
        let pending = self.remove(sseq)?;
        if self.evict_older_on_response {
            self.fail_where(|p| is_before(p.seq, sseq), RequestError::Evicted);
        }
        Some(pending)
    }

    /// Fails expired requests with `Timeout`. Returns the time until the next deadline.
    pub(super) fn check_timeouts(&mut self, now: Instant) -> Option<Duration> {
        self.fail_where(|p| p.deadline <= now, RequestError::Timeout);

        self.slots.iter()
            .flatten()
            .map(|p| p.deadline - now)
            .min()
    }

    pub(super) fn fail_all(&mut self, error: RequestError) {
        self.fail_where(|_| true, error);
    }

    fn fail_where(&mut self, predicate: impl Fn(&PendingRequest<M>) -> bool, error: RequestError) {
        if self.len == 0 {
            return;
        }
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(&predicate) {
                if let Some(pending) = slot.take() {
                    self.len -= 1;
                    pending.fail(error.clone());
                }
            }
        }
    }
}
