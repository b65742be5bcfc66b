//! A single self-contained protocol message: a 12-byte header (magic,
//! message id, total frame size) followed by an encoded argument list.
//! Grounded on `pomp_msg.c`.

use crate::{
    buffer::Buffer,
    error::{PompError, Result},
    wire::{HEADER_MAGIC, HEADER_SIZE},
};

/// A message under construction or ready to send/dispatch.
///
/// The header is not written incrementally: encoder writes land directly
/// in the payload region starting at byte 12, and [`Message::finish`]
/// retroactively stamps the header once the final size is known. After
/// `finish`, the message is immutable (`finished() == true`) and further
/// encoder writes are rejected.
#[derive(Clone)]
pub struct Message {
    msgid: u32,
    finished: bool,
    buf: Buffer,
}

impl Message {
    /// Starts a new, empty message for `msgid`. Nothing is written to the
    /// underlying buffer yet; encoder writes begin at offset
    /// [`HEADER_SIZE`].
    pub fn new(msgid: u32) -> Self {
        Self { msgid, finished: false, buf: Buffer::new(0) }
    }

    /// Wraps an already-encoded, already-finished frame (e.g. one just read
    /// off the wire by the framer). Validates the header magic and that the
    /// declared size matches the buffer's actual length.
    pub fn from_buffer(buf: Buffer) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(PompError::InvalidArgument("frame shorter than header"));
        }
        let mut pos = 0;
        let mut magic = [0u8; 4];
        buf.read(&mut pos, &mut magic)?;
        if magic != HEADER_MAGIC {
            return Err(PompError::InvalidArgument("bad frame magic"));
        }
        let mut idbytes = [0u8; 4];
        buf.read(&mut pos, &mut idbytes)?;
        let msgid = u32::from_le_bytes(idbytes);
        let mut lenbytes = [0u8; 4];
        buf.read(&mut pos, &mut lenbytes)?;
        let declared_len = u32::from_le_bytes(lenbytes) as usize;
        if declared_len != buf.len() {
            return Err(PompError::InvalidArgument("frame size mismatch"));
        }
        Ok(Self { msgid, finished: true, buf })
    }

    /// Builds a message around a buffer the framer has already stamped a
    /// valid 12-byte header into. Used internally by the streaming decoder,
    /// which fills the payload incrementally rather than all at once.
    pub(crate) fn new_framed(msgid: u32, buf: Buffer) -> Self {
        Self { msgid, finished: true, buf }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.msgid
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[inline]
    pub fn buffer(&self) -> &Buffer {
        &self.buf
    }

    /// Position where encoder writes should start for a freshly-initialized
    /// message: right after the reserved header region.
    #[inline]
    pub fn payload_start(&self) -> usize {
        HEADER_SIZE
    }

    /// Stamps the 12-byte header (magic, id, total size) at the front of
    /// the buffer and marks the message immutable. The size field is at
    /// least [`HEADER_SIZE`] even if no payload was ever written.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Err(PompError::InvalidArgument("message already finished"));
        }
        self.buf.ensure_capacity(HEADER_SIZE)?;
        let total_len = self.buf.len().max(HEADER_SIZE);
        if self.buf.len() < HEADER_SIZE {
            self.buf.set_len(HEADER_SIZE)?;
        }
        let mut pos = 0;
        self.buf.write(&mut pos, &HEADER_MAGIC)?;
        self.buf.write(&mut pos, &self.msgid.to_le_bytes())?;
        self.buf.write(&mut pos, &(total_len as u32).to_le_bytes())?;
        self.finished = true;
        Ok(())
    }

    /// Resets to an unused state, releasing the buffer (and any fds it
    /// carries).
    pub fn clear(&mut self) -> Result<()> {
        self.msgid = 0;
        self.finished = false;
        self.buf.clear()
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.msgid)
            .field("finished", &self.finished)
            .field("len", &self.buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_stamps_header_only_message() {
        let mut msg = Message::new(42);
        msg.finish().unwrap();
        assert!(msg.is_finished());
        assert_eq!(msg.buffer().len(), HEADER_SIZE);

        let mut pos = 0;
        let mut magic = [0u8; 4];
        msg.buffer().read(&mut pos, &mut magic).unwrap();
        assert_eq!(magic, HEADER_MAGIC);
    }

    #[test]
    fn finish_twice_fails() {
        let mut msg = Message::new(1);
        msg.finish().unwrap();
        assert!(msg.finish().is_err());
    }

    #[test]
    fn from_buffer_roundtrips_a_finished_message() {
        let mut msg = Message::new(7);
        let mut pos = msg.payload_start();
        msg.buffer().write(&mut pos, b"hello").unwrap();
        msg.finish().unwrap();

        let restored = Message::from_buffer(msg.buffer().clone()).unwrap();
        assert_eq!(restored.id(), 7);
        assert!(restored.is_finished());
    }

    #[test]
    fn from_buffer_rejects_bad_magic() {
        let buf = Buffer::new_with_data(&[0u8; 12]);
        assert!(Message::from_buffer(buf).is_err());
    }
}
