//! Frame decoder: reads masked client frames off a buffered byte stream,
//! reassembles fragmented messages, and performs incremental UTF-8
//! validation on TEXT messages as their bytes arrive.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader, ReadBuf};

use crate::error::Error;
use crate::frame::{MessageType, OpCode, MAX_CONTROL_PAYLOAD};
use crate::utf8::{is_valid_utf8, Utf8Validator};

/// What a complete read cycle produced.
pub(crate) enum DecodedItem {
    Message { kind: MessageType, payload: Vec<u8> },
    Ping { payload: Vec<u8> },
    Pong { payload: Vec<u8> },
    Close { code: Option<u16>, reason: Vec<u8> },
}

struct InProgress {
    opcode: OpCode,
    // Reserve-then-extend growth per fragment, never reallocated under
    // aliasing; finalized into a contiguous buffer only once, at FIN.
    buf: BytesMut,
    utf8: Option<Utf8Validator>,
}

/// Prepends bytes already read off the wire (leftover handshake bytes) ahead
/// of whatever the inner reader yields next.
struct Prefixed<R> {
    prefix: Vec<u8>,
    prefix_pos: usize,
    inner: R,
}

impl<R> Prefixed<R> {
    fn new(prefix: Vec<u8>, inner: R) -> Self {
        Self {
            prefix,
            prefix_pos: 0,
            inner,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Prefixed<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.prefix_pos < this.prefix.len() {
            let remaining = &this.prefix[this.prefix_pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.prefix_pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

pub(crate) struct FrameDecoder<R> {
    reader: BufReader<Prefixed<R>>,
    fragment: Option<InProgress>,
}

impl<R: AsyncRead + Unpin> FrameDecoder<R> {
    pub(crate) fn new(reader: R, leftover: Vec<u8>, read_buffer_size: usize) -> Self {
        Self {
            reader: BufReader::with_capacity(read_buffer_size, Prefixed::new(leftover, reader)),
            fragment: None,
        }
    }

    /// Reads frames until a complete, deliverable item is assembled: a whole
    /// TXT/BIN message (after reassembling any CONT frames) or a control
    /// frame. `max_frame_len` bounds the running sum of fragment lengths.
    pub(crate) async fn read_item(&mut self, max_frame_len: usize) -> Result<DecodedItem, Error> {
        loop {
            let (fin, opcode, mut payload) = self.read_raw_frame(max_frame_len).await?;

            match opcode {
                OpCode::Ping => {
                    return Ok(DecodedItem::Ping { payload });
                }
                OpCode::Pong => {
                    return Ok(DecodedItem::Pong { payload });
                }
                OpCode::Close => {
                    let code = parse_close_code(&payload)?;
                    let reason = if payload.len() > 2 {
                        payload.split_off(2)
                    } else {
                        Vec::new()
                    };
                    if !is_valid_utf8(&reason) {
                        return Err(Error::InvalidUtf8);
                    }
                    return Ok(DecodedItem::Close { code, reason });
                }
                OpCode::Text | OpCode::Binary => {
                    let utf8 = if opcode == OpCode::Text {
                        let mut validator = Utf8Validator::new();
                        validator.push_slice(&payload);
                        if validator.is_rejected() {
                            return Err(Error::InvalidUtf8);
                        }
                        Some(validator)
                    } else {
                        None
                    };
                    if fin {
                        if let Some(ref v) = utf8 {
                            if !v.is_accepted() {
                                return Err(Error::InvalidUtf8);
                            }
                        }
                        return Ok(DecodedItem::Message {
                            kind: opcode.into(),
                            payload,
                        });
                    }
                    self.fragment = Some(InProgress {
                        opcode,
                        buf: BytesMut::from(payload.as_slice()),
                        utf8,
                    });
                }
                OpCode::Continue => {
                    let Some(mut in_progress) = self.fragment.take() else {
                        return Err(Error::UnexpectedContinuation);
                    };
                    if let Some(ref mut v) = in_progress.utf8 {
                        v.push_slice(&payload);
                        if v.is_rejected() {
                            return Err(Error::InvalidUtf8);
                        }
                    }
                    in_progress.buf.extend_from_slice(&payload);

                    if fin {
                        if let Some(ref v) = in_progress.utf8 {
                            if !v.is_accepted() {
                                return Err(Error::InvalidUtf8);
                            }
                        }
                        return Ok(DecodedItem::Message {
                            kind: in_progress.opcode.into(),
                            payload: in_progress.buf.to_vec(),
                        });
                    }
                    self.fragment = Some(in_progress);
                }
            }
        }
    }

    /// Reads exactly one wire frame and enforces the structural invariants
    /// that don't depend on reassembly state (RSV bits, masking, opcode
    /// validity, control-frame shape) plus the ones that do (CONT legality,
    /// data-opcode-while-fragmented).
    async fn read_raw_frame(&mut self, max_frame_len: usize) -> Result<(bool, OpCode, Vec<u8>), Error> {
        let mut header = [0u8; 2];
        self.reader.read_exact(&mut header).await?;

        let fin = header[0] & 0b1000_0000 != 0;
        let rsv = header[0] & 0b0111_0000;
        if rsv != 0 {
            return Err(Error::ReservedBitsSet);
        }
        let opcode = OpCode::from_byte(header[0] & 0b0000_1111)?;

        if !fin && opcode.is_control() {
            return Err(Error::ControlFrameMalformed);
        }
        if opcode == OpCode::Continue && self.fragment.is_none() {
            return Err(Error::UnexpectedContinuation);
        }
        if opcode.is_data() && self.fragment.is_some() {
            return Err(Error::FragmentedMessageInProgress);
        }

        let masked = header[1] & 0b1000_0000 != 0;
        if !masked {
            return Err(Error::FrameNotMasked);
        }

        let mut len = (header[1] & 0b0111_1111) as u64;
        if opcode.is_control() && len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(Error::ControlFrameMalformed);
        }

        if len == 126 {
            let mut ext = [0u8; 2];
            self.reader.read_exact(&mut ext).await?;
            len = u16::from_be_bytes(ext) as u64;
        } else if len == 127 {
            let mut ext = [0u8; 8];
            self.reader.read_exact(&mut ext).await?;
            len = u64::from_be_bytes(ext);
        }
        if opcode.is_control() && len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(Error::ControlFrameMalformed);
        }

        let running_total = self.fragment.as_ref().map_or(0, |f| f.buf.len()) + len as usize;
        if running_total > max_frame_len {
            return Err(Error::FrameTooLarge);
        }

        let mut mask = [0u8; 4];
        self.reader.read_exact(&mut mask).await?;

        let mut payload = vec![0u8; len as usize];
        self.reader.read_exact(&mut payload).await?;
        crate::frame::apply_mask(&mut payload, mask);

        Ok((fin, opcode, payload))
    }
}

/// Validates a received CLOSE code against the application-valid ranges.
fn parse_close_code(payload: &[u8]) -> Result<Option<u16>, Error> {
    if payload.len() < 2 {
        return Ok(None);
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    match code {
        1000..=1003 | 1007..=1011 | 3000..=4999 => Ok(Some(code)),
        _ => Err(Error::InvalidCloseCode(code)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_ranges() {
        assert_eq!(parse_close_code(&[]).unwrap(), None);
        assert_eq!(parse_close_code(&1000u16.to_be_bytes()).unwrap(), Some(1000));
        assert_eq!(parse_close_code(&1011u16.to_be_bytes()).unwrap(), Some(1011));
        assert_eq!(parse_close_code(&3000u16.to_be_bytes()).unwrap(), Some(3000));
        assert_eq!(parse_close_code(&4999u16.to_be_bytes()).unwrap(), Some(4999));
        assert!(parse_close_code(&1004u16.to_be_bytes()).is_err());
        assert!(parse_close_code(&5000u16.to_be_bytes()).is_err());
    }
}
