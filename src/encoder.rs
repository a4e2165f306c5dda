//! Frame encoder: header construction for the never-masked, never-fragmented
//! outbound direction.

use crate::frame::OpCode;

/// Builds the header bytes (first byte, length indicator, extended length)
/// for a server-to-client frame. Server frames are always FIN=1 and never
/// masked.
pub(crate) fn encode_header(opcode: OpCode, payload_len: usize) -> Vec<u8> {
    let first_byte = 0b1000_0000 | opcode.as_u8();
    let mut header = Vec::with_capacity(10);
    header.push(first_byte);

    if payload_len <= 125 {
        header.push(payload_len as u8);
    } else if payload_len <= u16::MAX as usize {
        header.push(126);
        header.extend_from_slice(&(payload_len as u16).to_be_bytes());
    } else {
        header.push(127);
        header.extend_from_slice(&(payload_len as u64).to_be_bytes());
    }

    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_length_uses_single_byte() {
        let header = encode_header(OpCode::Text, 5);
        assert_eq!(header, vec![0x81, 0x05]);
    }

    #[test]
    fn length_above_u16_max_uses_64_bit_extension() {
        let header = encode_header(OpCode::Binary, 70_000);
        assert_eq!(header[0], 0x82);
        assert_eq!(header[1], 127);
        assert_eq!(&header[2..], &(70_000u64).to_be_bytes());
    }

    #[test]
    fn length_126_boundary_uses_64_bit_extension() {
        let header = encode_header(OpCode::Text, 65536);
        assert_eq!(header[1], 127);
        assert_eq!(&header[2..], &(65536u64).to_be_bytes());
    }

    #[test]
    fn length_65535_uses_16_bit_extension() {
        let header = encode_header(OpCode::Text, 65535);
        assert_eq!(header[1], 126);
        assert_eq!(&header[2..4], &(65535u16).to_be_bytes());
    }

    #[test]
    fn length_zero_is_single_byte() {
        let header = encode_header(OpCode::Text, 0);
        assert_eq!(header, vec![0x81, 0x00]);
    }

    #[test]
    fn control_frame_header_never_masks() {
        let header = encode_header(OpCode::Close, 2);
        assert_eq!(header[0] & 0b1000_0000, 0b1000_0000); // FIN set
        assert_eq!(header[1] & 0b1000_0000, 0); // length byte, no mask bit possible on send
    }
}
