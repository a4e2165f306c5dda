//! Streaming UTF-8 validator, driven one byte at a time so it can straddle
//! TEXT/CONTINUATION frame boundaries without buffering the whole message.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Accept,
    Reject,
    /// Mid code point: holds the number of continuation bytes still expected
    /// and the lowest/highest allowed value for the *next* byte (used only to
    /// reject overlong encodings and surrogate halves on the second byte).
    Expect { remaining: u8, low: u8, high: u8 },
}

/// A table-driven DFA over UTF-8 byte sequences. `Reject` is sticky: once hit,
/// further bytes cannot un-reject the stream.
#[derive(Debug, Clone, Copy)]
pub struct Utf8Validator {
    state: State,
}

impl Default for Utf8Validator {
    fn default() -> Self {
        Self {
            state: State::Accept,
        }
    }
}

impl Utf8Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one byte through the DFA.
    pub fn push(&mut self, byte: u8) {
        self.state = match self.state {
            State::Reject => State::Reject,
            State::Accept => Self::start(byte),
            State::Expect {
                remaining,
                low,
                high,
            } => {
                if byte < low || byte > high {
                    State::Reject
                } else if remaining == 1 {
                    State::Accept
                } else {
                    State::Expect {
                        remaining: remaining - 1,
                        low: 0x80,
                        high: 0xBF,
                    }
                }
            }
        };
    }

    fn start(byte: u8) -> State {
        match byte {
            0x00..=0x7F => State::Accept,
            0xC2..=0xDF => State::Expect {
                remaining: 1,
                low: 0x80,
                high: 0xBF,
            },
            0xE0 => State::Expect {
                remaining: 2,
                low: 0xA0,
                high: 0xBF,
            },
            0xE1..=0xEC | 0xEE..=0xEF => State::Expect {
                remaining: 2,
                low: 0x80,
                high: 0xBF,
            },
            0xED => State::Expect {
                remaining: 2,
                low: 0x80,
                high: 0x9F,
            },
            0xF0 => State::Expect {
                remaining: 3,
                low: 0x90,
                high: 0xBF,
            },
            0xF1..=0xF3 => State::Expect {
                remaining: 3,
                low: 0x80,
                high: 0xBF,
            },
            0xF4 => State::Expect {
                remaining: 3,
                low: 0x80,
                high: 0x8F,
            },
            _ => State::Reject,
        }
    }

    /// Feeds an entire slice through the DFA.
    pub fn push_slice(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push(b);
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.state, State::Reject)
    }

    /// True only at a complete, valid code point boundary (end-of-message check).
    pub fn is_accepted(&self) -> bool {
        matches!(self.state, State::Accept)
    }
}

/// One-shot check used for the CLOSE frame's reason payload, which is never fragmented.
pub fn is_valid_utf8(bytes: &[u8]) -> bool {
    let mut validator = Utf8Validator::new();
    validator.push_slice(bytes);
    validator.is_accepted()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ascii() {
        assert!(is_valid_utf8(b"hello, world"));
    }

    #[test]
    fn accepts_multibyte_sequences() {
        assert!(is_valid_utf8("héllo wörld 日本語".as_bytes()));
    }

    #[test]
    fn rejects_truncated_continuation() {
        assert!(!is_valid_utf8(&[0xC3]));
        assert!(!is_valid_utf8(&[0xE2, 0x82]));
    }

    #[test]
    fn rejects_bad_continuation_byte() {
        // 0xC3 0x28 - 0x28 is not a valid continuation byte.
        assert!(!is_valid_utf8(&[0xC3, 0x28]));
    }

    #[test]
    fn rejects_overlong_and_surrogate_encodings() {
        assert!(!is_valid_utf8(&[0xE0, 0x80, 0x80])); // overlong
        assert!(!is_valid_utf8(&[0xED, 0xA0, 0x80])); // surrogate half
    }

    #[test]
    fn incremental_feed_matches_one_shot() {
        let text = "partial utf8 é across frames 漢字".as_bytes();
        let mut incremental = Utf8Validator::new();
        for chunk in text.chunks(3) {
            incremental.push_slice(chunk);
        }
        assert!(incremental.is_accepted());
        assert!(is_valid_utf8(text));
    }

    #[test]
    fn rejection_is_sticky() {
        let mut validator = Utf8Validator::new();
        validator.push_slice(&[0xFF]);
        assert!(validator.is_rejected());
        validator.push(b'a');
        assert!(validator.is_rejected());
    }
}
