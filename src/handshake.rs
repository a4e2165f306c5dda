//! The HTTP Upgrade handshake: reads the request looking for
//! `Sec-WebSocket-Key`, computes the accept token, and writes the 101
//! response. Bytes read past the request's terminating blank line are
//! excess frame-stream data and are handed back to the caller so the frame
//! decoder can start from them instead of re-reading the socket.

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::{timeout, Duration};

use crate::error::Error;

const MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_REQUEST_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 32;
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct HandshakeOutcome {
    /// Frame-stream bytes already read off the wire past the blank line.
    pub(crate) leftover: Vec<u8>,
}

/// Drives the handshake to completion: reads the request, writes the 101
/// response on success. On failure the caller is expected to drop the
/// socket without writing anything, per the silent-close policy for
/// handshake errors.
pub(crate) async fn perform(
    read_half: &mut OwnedReadHalf,
    write_half: &mut OwnedWriteHalf,
) -> Result<HandshakeOutcome, Error> {
    let (key, leftover) = read_request(read_half).await?;
    let accept = compute_accept(&key);
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    );
    write_half
        .write_all(response.as_bytes())
        .await
        .map_err(Error::HandshakeIo)?;

    Ok(HandshakeOutcome { leftover })
}

/// Reads bytes until `httparse` can parse a complete request out of the
/// buffer, extracts the `Sec-WebSocket-Key` value, and returns it along
/// with whatever bytes were read past the end of the headers (the start of
/// the frame stream, if the client pipelined anything behind the request).
async fn read_request(read_half: &mut OwnedReadHalf) -> Result<(String, Vec<u8>), Error> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if buf.len() > MAX_REQUEST_BYTES {
            return Err(Error::HandshakeIncomplete);
        }

        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut header_storage);
        match request.parse(&buf)? {
            httparse::Status::Complete(body_start) => {
                let key = request
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("sec-websocket-key"))
                    .map(|h| String::from_utf8_lossy(h.value).trim().to_string())
                    .ok_or(Error::HandshakeMissingKey)?;
                let leftover = buf[body_start..].to_vec();
                return Ok((key, leftover));
            }
            httparse::Status::Partial => {}
        }

        let n = timeout(HANDSHAKE_READ_TIMEOUT, read_half.read(&mut chunk))
            .await
            .map_err(|_| Error::HandshakeIncomplete)?
            .map_err(Error::HandshakeIo)?;
        if n == 0 {
            return Err(Error::HandshakeIncomplete);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

pub(crate) fn compute_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(MAGIC_GUID.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_value_matches_rfc6455_example() {
        // The canonical example from RFC 6455 section 1.3.
        let accept = compute_accept("dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn parses_key_from_complete_request() {
        let buf = b"GET / HTTP/1.1\r\nHost: x\r\nSec-WebSocket-Key: abc123==\r\n\r\nleftover-bytes".to_vec();
        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut header_storage);
        let httparse::Status::Complete(body_start) = request.parse(&buf).unwrap() else {
            panic!("expected a complete request");
        };
        let key = request
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("sec-websocket-key"))
            .map(|h| String::from_utf8_lossy(h.value).trim().to_string())
            .unwrap();
        assert_eq!(key, "abc123==");
        assert_eq!(&buf[body_start..], b"leftover-bytes");
    }

    #[test]
    fn partial_request_is_not_complete() {
        let buf = b"GET / HTTP/1.1\r\nHost: x\r\n".to_vec();
        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut header_storage);
        assert!(matches!(
            request.parse(&buf).unwrap(),
            httparse::Status::Partial
        ));
    }
}
