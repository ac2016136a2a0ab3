use crate::chunk::Chunk;

/// Sink for outgoing chunks. The association's control queue implements this, collecting chunks
///  until the embedding code reads them as packets.
#[cfg_attr(test, mockall::automock)]
pub trait Transmitter {
    fn enqueue(&mut self, chunk: Chunk);
}
