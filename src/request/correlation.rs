use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use crate::channel::{FrameSink, ObjChannel, ReceivedFrame};
use crate::codec::reader_writer::MessageCodec;
use crate::config::RequestConfig;
use crate::connection::MessageRejected;
use crate::request::handlers::{HandlerRegistry, HandlerReply};
use crate::request::window::RequestWindow;
use crate::request::{IncomingRequest, RequestError, RequestResult};

/// Matches responses to pending requests and dispatches everything else to handlers
pub(super) struct RequestCore<C: MessageCodec> {
    window: Mutex<RequestWindow<C::Message>>,
    handlers: Arc<HandlerRegistry<C::Message>>,
    config: RequestConfig,
}

impl<C: MessageCodec> RequestCore<C> {
    pub(super) fn new(config: RequestConfig, handlers: Arc<HandlerRegistry<C::Message>>) -> RequestCore<C> {
        RequestCore {
            window: Mutex::new(RequestWindow::new(config.capacity, config.evict_older_on_response)),
            handlers,
            config,
        }
    }

    pub(super) fn config(&self) -> &RequestConfig {
        &self.config
    }

    pub(super) fn handlers(&self) -> &Arc<HandlerRegistry<C::Message>> {
        &self.handlers
    }

    pub(super) fn register(&self, seq: u32, timeout: Duration) -> oneshot::Receiver<RequestResult<C::Message>> {
        self.window.lock().unwrap()
            .register(seq, timeout, Instant::now())
    }

    /// Forgets a request without completing it
    pub(super) fn cancel(&self, seq: u32) {
        self.window.lock().unwrap()
            .remove(seq);
    }

    pub(super) fn outstanding(&self) -> usize {
        self.window.lock().unwrap().len()
    }

    pub(super) fn check_timeouts(&self) -> Option<Duration> {
        self.window.lock().unwrap()
            .check_timeouts(Instant::now())
    }

    fn dispatch(&self, channel: &ObjChannel<C>, frame: ReceivedFrame<C::Message>) {
        let message = match frame.message {
            Ok(message) => message,
            Err(e) => {
                debug!(msg_type = frame.msg_type, seq = frame.seq, "dropping undecodable message: {}", e);
                return;
            }
        };
        let Some(handler) = self.handlers.find(frame.msg_type) else {
            debug!(msg_type = frame.msg_type, seq = frame.seq, "no handler for message type");
            return;
        };

        let seq = frame.seq;
        let request = IncomingRequest {
            msg_type: frame.msg_type,
            flags: frame.flags,
            seq,
            message,
        };
        match handler.handle(request) {
            HandlerReply::Reply(reply) => respond(channel, reply, seq),
            HandlerReply::NoReply => {}
            HandlerReply::Later(reply) => {
                let channel = channel.clone();
                match Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            if let Some(reply) = reply.await {
                                respond(&channel, reply, seq);
                            }
                        });
                    }
                    Err(e) => warn!(seq, "dropping asynchronous reply without a tokio runtime: {}", e),
                }
            }
        }
    }
}

fn respond<C: MessageCodec>(channel: &ObjChannel<C>, reply: C::Message, sseq: u32) {
    if let Err(e) = channel.write_response(reply, sseq) {
        debug!(sseq, "sending response failed: {}", e);
    }
}

impl<C: MessageCodec> FrameSink<C> for RequestCore<C> {
    fn on_frame(&self, channel: &ObjChannel<C>, frame: ReceivedFrame<C::Message>) {
        if !frame.is_response() {
            self.dispatch(channel, frame);
            return;
        }

        let pending = self.window.lock().unwrap()
            .take_response(frame.sseq);
        match pending {
            Some(pending) => pending.respond(frame, Instant::now()),
            None => debug!(sseq = frame.sseq, "dropping response without a pending request"),
        }
    }

    fn on_tick(&self, _channel: &ObjChannel<C>) -> Option<Duration> {
        self.check_timeouts()
    }

    fn on_send_failed(&self, seq: u32, rejected: &MessageRejected) {
        let pending = self.window.lock().unwrap()
            .remove(seq);
        if let Some(pending) = pending {
            pending.fail(RequestError::SendFailed(rejected.0.clone()));
        }
    }

    fn on_close(&self) {
        self.window.lock().unwrap()
            .fail_all(RequestError::ConnectionClosed);
    }
}
