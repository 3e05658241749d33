use std::time::Duration;

use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    time,
};

use super::{ChannelError, ChannelStats, EventChannel, SequenceTracker};
use crate::{RawRecord, record::RECORD_SIZE};

/// Reads back-to-back fixed-size records from a byte stream, like a FIFO
/// written by the probe loader or a file with recorded events.
pub struct StreamChannel<R> {
    reader: R,
    buffer: BytesMut,
    tracker: SequenceTracker,
    eof: bool,
}

impl<R> StreamChannel<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(RECORD_SIZE * 4),
            tracker: SequenceTracker::default(),
            eof: false,
        }
    }
}

impl<R> EventChannel for StreamChannel<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next(&mut self, timeout: Duration) -> Result<RawRecord, ChannelError> {
        let deadline = time::Instant::now() + timeout;
        loop {
            if self.buffer.len() >= RECORD_SIZE {
                let record = RawRecord::new(self.buffer.split_to(RECORD_SIZE).freeze());
                self.tracker.observe_record(&record);
                return Ok(record);
            }
            if self.eof {
                if !self.buffer.is_empty() {
                    log::warn!(
                        "Discarding {} trailing bytes, shorter than a record",
                        self.buffer.len()
                    );
                    self.buffer.clear();
                }
                return Err(ChannelError::Closed);
            }
            self.buffer.reserve(RECORD_SIZE);
            // read_buf is cancel safe: nothing is lost when the timeout fires
            match time::timeout_at(deadline, self.reader.read_buf(&mut self.buffer)).await {
                Err(_) => return Err(ChannelError::Timeout),
                Ok(Ok(0)) => self.eof = true,
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return Err(ChannelError::Io(err)),
            }
        }
    }

    fn stats(&self) -> ChannelStats {
        self.tracker.stats()
    }
}
