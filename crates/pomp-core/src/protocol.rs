//! Streaming frame extractor: turns an arbitrary sequence of byte chunks
//! (as delivered by a non-blocking socket read) into a sequence of complete
//! [`Message`] frames, one byte-at-a-time-safe step at a time. Grounded on
//! `pomp_prot.c`.

use crate::{
    buffer::Buffer,
    error::Result,
    message::Message,
    wire::{HEADER_MAGIC, HEADER_SIZE},
};

#[derive(Debug)]
enum State {
    /// Waiting for magic byte `idx` (0..4) of the next frame.
    Magic { idx: usize },
    Header { buf: [u8; HEADER_SIZE], have: usize },
    Payload { msg: Message, offset: usize, size: usize },
}

/// Per-connection decode state. One frame is extracted at a time; call
/// [`Framer::feed`] repeatedly over the same input slice (advancing by the
/// returned consumed count) to drain everything a read produced.
pub struct Framer {
    state: State,
    /// A finished message handed back via [`Framer::release`], kept around so
    /// its buffer's allocation can be reused for the next frame instead of
    /// allocating fresh.
    spare: Option<Buffer>,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self { state: State::Magic { idx: 0 }, spare: None }
    }

    /// Gives a message back to the framer once the caller is done with it.
    /// If the framer is not itself mid-payload, the message's buffer may be
    /// kept around and reused for the next frame's allocation.
    pub fn release(&mut self, mut msg: Message) {
        if matches!(self.state, State::Payload { .. }) {
            return;
        }
        let _ = msg.clear();
        self.spare = Some(msg.buffer().clone());
    }

    fn take_payload_buffer(&mut self, size: usize) -> Result<Buffer> {
        if let Some(buf) = self.spare.take() {
            if !buf.is_shared() {
                buf.ensure_capacity(size)?;
                return Ok(buf);
            }
        }
        let buf = Buffer::new(size);
        buf.ensure_capacity(size)?;
        Ok(buf)
    }

    /// Consumes a prefix of `data`, returning how many bytes were consumed
    /// and, if a frame completed during this call, the finished [`Message`].
    /// At most one message is produced per call even if `data` contains more
    /// than one complete frame; call again with the remaining slice to
    /// extract further frames.
    pub fn feed(&mut self, data: &[u8]) -> Result<(usize, Option<Message>)> {
        let mut consumed = 0;
        while consumed < data.len() {
            match &mut self.state {
                State::Magic { idx } => {
                    let b = data[consumed];
                    consumed += 1;
                    if b == HEADER_MAGIC[*idx] {
                        *idx += 1;
                        if *idx == HEADER_MAGIC.len() {
                            self.state = State::Header { buf: [0u8; HEADER_SIZE], have: HEADER_MAGIC.len() };
                            let State::Header { buf, .. } = &mut self.state else { unreachable!() };
                            buf[..HEADER_MAGIC.len()].copy_from_slice(&HEADER_MAGIC);
                        }
                    } else {
                        tracing::warn!(byte = b, "resyncing frame decoder on bad magic byte");
                        *idx = 0;
                        if b == HEADER_MAGIC[0] {
                            *idx = 1;
                        }
                    }
                }
                State::Header { buf, have } => {
                    let want = HEADER_SIZE - *have;
                    let take = want.min(data.len() - consumed);
                    buf[*have..*have + take].copy_from_slice(&data[consumed..consumed + take]);
                    *have += take;
                    consumed += take;
                    if *have == HEADER_SIZE {
                        let mut idbytes = [0u8; 4];
                        idbytes.copy_from_slice(&buf[4..8]);
                        let msgid = u32::from_le_bytes(idbytes);
                        let mut sizebytes = [0u8; 4];
                        sizebytes.copy_from_slice(&buf[8..12]);
                        let size = u32::from_le_bytes(sizebytes) as usize;

                        if size < HEADER_SIZE {
                            tracing::warn!(size, "resyncing frame decoder on invalid header size");
                            self.state = State::Magic { idx: 0 };
                            continue;
                        }

                        let payload_buf = self.take_payload_buffer(size)?;
                        payload_buf.set_len(HEADER_SIZE)?;
                        let mut pos = 0;
                        payload_buf.write(&mut pos, buf)?;
                        let msg = build_message(msgid, payload_buf);

                        if size == HEADER_SIZE {
                            self.state = State::Magic { idx: 0 };
                            return Ok((consumed, Some(msg)));
                        }
                        self.state = State::Payload { msg, offset: HEADER_SIZE, size };
                    }
                }
                State::Payload { msg, offset, size } => {
                    let remaining = size.saturating_sub(*offset);
                    let take = remaining.min(data.len() - consumed);
                    if take > 0 {
                        msg.buffer().write(offset, &data[consumed..consumed + take])?;
                        consumed += take;
                    }
                    if *offset >= *size {
                        let State::Payload { msg, .. } =
                            std::mem::replace(&mut self.state, State::Magic { idx: 0 })
                        else {
                            unreachable!()
                        };
                        return Ok((consumed, Some(msg)));
                    }
                    if take == 0 {
                        break;
                    }
                }
            }
        }
        Ok((consumed, None))
    }
}

fn build_message(msgid: u32, buf: Buffer) -> Message {
    // `Message::from_buffer` validates the declared size against the
    // buffer's current length, which does not hold mid-frame (the buffer is
    // pre-sized to the full payload before any payload bytes arrive). The
    // framer builds the message directly and tracks completion itself.
    Message::new_framed(msgid, buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Encoder;

    fn encode_sample() -> Vec<u8> {
        let mut enc = Encoder::new(7);
        enc.write_u32(99).unwrap();
        let msg = enc.finish().unwrap();
        msg.buffer().with_data(|d| d.to_vec())
    }

    #[test]
    fn feeds_whole_frame_at_once() {
        let bytes = encode_sample();
        let mut framer = Framer::new();
        let (consumed, msg) = framer.feed(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        let msg = msg.expect("frame complete");
        assert_eq!(msg.id(), 7);
    }

    #[test]
    fn feeds_byte_at_a_time() {
        let bytes = encode_sample();
        let mut framer = Framer::new();
        let mut got = None;
        for &b in &bytes {
            let (consumed, msg) = framer.feed(&[b]).unwrap();
            assert_eq!(consumed, 1);
            if let Some(m) = msg {
                got = Some(m);
            }
        }
        let msg = got.expect("frame complete");
        assert_eq!(msg.id(), 7);
    }

    #[test]
    fn feeds_two_concatenated_frames_byte_at_a_time() {
        let one = encode_sample();
        let mut both = one.clone();
        both.extend_from_slice(&one);

        let mut framer = Framer::new();
        let mut completions = Vec::new();
        for &b in &both {
            let (consumed, msg) = framer.feed(&[b]).unwrap();
            assert_eq!(consumed, 1);
            completions.push(msg.map(|m| m.id()));
        }

        let complete_at: Vec<usize> =
            completions.iter().enumerate().filter_map(|(i, m)| m.map(|_| i)).collect();
        assert_eq!(complete_at, vec![one.len() - 1, both.len() - 1], "a frame completes exactly at its last byte");
        assert_eq!(completions.iter().filter(|m| m.is_some()).count(), 2);
        for (i, m) in completions.iter().enumerate() {
            if complete_at.contains(&i) {
                assert_eq!(*m, Some(7));
            } else {
                assert!(m.is_none());
            }
        }
    }

    #[test]
    fn resyncs_on_bad_magic() {
        let bytes = encode_sample();
        let mut garbage = vec![0x00u8, 0x11, 0x22];
        garbage.extend_from_slice(&bytes);
        let mut framer = Framer::new();
        let mut got = None;
        let mut rest = garbage.as_slice();
        while !rest.is_empty() && got.is_none() {
            let (consumed, msg) = framer.feed(rest).unwrap();
            rest = &rest[consumed..];
            got = msg;
        }
        assert_eq!(got.expect("frame complete").id(), 7);
    }

    #[test]
    fn only_eleven_header_bytes_yields_zero_messages() {
        let bytes = encode_sample();
        let mut framer = Framer::new();
        let (consumed, msg) = framer.feed(&bytes[..HEADER_SIZE - 1]).unwrap();
        assert_eq!(consumed, HEADER_SIZE - 1);
        assert!(msg.is_none());
    }

    #[test]
    fn rejects_header_with_size_below_minimum() {
        let mut bad = Vec::new();
        bad.extend_from_slice(&HEADER_MAGIC);
        bad.extend_from_slice(&7u32.to_le_bytes());
        bad.extend_from_slice(&4u32.to_le_bytes());
        let mut framer = Framer::new();
        let (consumed, msg) = framer.feed(&bad).unwrap();
        assert_eq!(consumed, bad.len());
        assert!(msg.is_none());
    }
}
