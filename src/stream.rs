use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use bytes::Bytes;
use tracing::debug;

/// A user message received on a stream
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Payload {
    pub stream_id: u16,
    pub payload_protocol_id: u32,
    pub data: Bytes,
}

/// The data channel layer's view of an inbound stream
#[cfg_attr(test, mockall::automock)]
pub trait StreamListener: Send + Sync {
    fn on_payload(&self, payload_protocol_id: u32, data: Bytes);
}

/// One stream of an association. Streams carry no state of their own apart from the listener
///  for received messages; sending goes through the association with the stream's id.
pub struct Stream {
    id: u16,
    listener: Option<Arc<dyn StreamListener>>,
}
impl Debug for Stream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "STREAM{{{}{}}}", self.id, if self.listener.is_some() { "" } else { ":unlistened" })
    }
}

impl Stream {
    pub fn new(id: u16, listener: Option<Arc<dyn StreamListener>>) -> Stream {
        Stream {
            id,
            listener,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn set_listener(&mut self, listener: Arc<dyn StreamListener>) {
        self.listener = Some(listener);
    }

    pub(crate) fn deliver(&self, payload: Payload) {
        match &self.listener {
            Some(listener) => listener.on_payload(payload.payload_protocol_id, payload.data),
            None => debug!("no listener on stream {} - discarding {} bytes of payload", self.id, payload.data.len()),
        }
    }
}
