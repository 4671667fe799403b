//! Sum handler.
//!
//! The argument bytes are captured when the command is recognized, then
//! drained one token per writable turn. The running total lives on the
//! stream, so each connection has its own accumulator.

use super::parser::next_token;
use super::{Response, Step};
use bytes::{Bytes, BytesMut};

/// An in-progress sum over captured argument bytes.
#[derive(Debug)]
pub struct SumStream {
    /// Raw argument bytes, not yet fully tokenized.
    pending: Bytes,
    /// Offset of the first unprocessed byte in `pending`.
    cursor: usize,
    total: i64,
}

impl SumStream {
    pub fn new(pending: Bytes) -> Self {
        Self {
            pending,
            cursor: 0,
            total: 0,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn total(&self) -> i64 {
        self.total
    }

    /// Consume the next token, or write the total once none remain.
    ///
    /// The per-token continuation marker is empty, so a sum's response is
    /// just the success marker followed by `<total>\n`.
    pub fn produce(&mut self, out: &mut BytesMut) -> Step {
        match next_token(&self.pending, self.cursor) {
            Some((token, cursor)) => {
                self.total = self
                    .total
                    .wrapping_add(parse_integer(&self.pending[token]));
                self.cursor = cursor;
                Step::Continue
            }
            None => {
                self.cursor = self.pending.len();
                out.extend_from_slice(format!("{}\n", self.total).as_bytes());
                Step::Done
            }
        }
    }
}

/// Start a sum command, capturing its argument bytes.
pub fn begin(args: &[u8], out: &mut BytesMut) -> SumStream {
    out.extend_from_slice(Response::success());
    SumStream::new(Bytes::copy_from_slice(args))
}

/// Permissive integer parse.
///
/// Reads an optional sign and the longest run of leading digits. Input with
/// no digits is 0; values beyond `i64` saturate.
pub fn parse_integer(token: &[u8]) -> i64 {
    let (negative, digits) = match token.first() {
        Some(b'-') => (true, &token[1..]),
        Some(b'+') => (false, &token[1..]),
        _ => (false, token),
    };

    let mut value: i64 = 0;
    for &b in digits.iter().take_while(|b| b.is_ascii_digit()) {
        let digit = i64::from(b - b'0');
        value = if negative {
            value.saturating_mul(10).saturating_sub(digit)
        } else {
            value.saturating_mul(10).saturating_add(digit)
        };
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(stream: &mut SumStream) -> (Vec<u8>, usize) {
        let mut out = BytesMut::new();
        let mut turns = 0;
        loop {
            turns += 1;
            if stream.produce(&mut out) == Step::Done {
                return (out.to_vec(), turns);
            }
        }
    }

    #[test]
    fn test_sum_basic() {
        let mut out = BytesMut::new();
        let mut stream = begin(b"1 2 3", &mut out);
        assert_eq!(&out[..], b"S ");

        let (out, turns) = drain(&mut stream);
        assert_eq!(out, b"6\n");
        assert_eq!(turns, 4);
    }

    #[test]
    fn test_sum_no_tokens() {
        let mut stream = SumStream::new(Bytes::from_static(b"   "));
        let (out, turns) = drain(&mut stream);
        assert_eq!(out, b"0\n");
        assert_eq!(turns, 1);
    }

    #[test]
    fn test_sum_is_resumable() {
        let mut stream = SumStream::new(Bytes::from_static(b"10 -4\r\n 7"));
        let mut out = BytesMut::new();

        assert_eq!(stream.produce(&mut out), Step::Continue);
        assert_eq!(stream.total(), 10);
        let after_first = stream.cursor();

        assert_eq!(stream.produce(&mut out), Step::Continue);
        assert_eq!(stream.total(), 6);
        assert!(stream.cursor() > after_first);

        assert_eq!(stream.produce(&mut out), Step::Continue);
        assert_eq!(stream.total(), 13);
        assert!(out.is_empty());

        assert_eq!(stream.produce(&mut out), Step::Done);
        assert_eq!(&out[..], b"13\n");
    }

    #[test]
    fn test_malformed_tokens_count_as_zero() {
        let mut stream = SumStream::new(Bytes::from_static(b"abc 5 x9 12z"));
        let (out, _) = drain(&mut stream);
        assert_eq!(out, b"17\n");
    }

    #[test]
    fn test_streams_do_not_share_totals() {
        let mut a = SumStream::new(Bytes::from_static(b"100"));
        let mut b = SumStream::new(Bytes::from_static(b"1"));
        let mut out = BytesMut::new();

        a.produce(&mut out);
        assert_eq!(drain(&mut b).0, b"1\n");
        assert_eq!(drain(&mut a).0, b"100\n");
    }

    #[test]
    fn test_parse_integer() {
        assert_eq!(parse_integer(b"42"), 42);
        assert_eq!(parse_integer(b"-17"), -17);
        assert_eq!(parse_integer(b"+8"), 8);
        assert_eq!(parse_integer(b"12abc"), 12);
        assert_eq!(parse_integer(b"abc"), 0);
        assert_eq!(parse_integer(b"-"), 0);
        assert_eq!(parse_integer(b"99999999999999999999"), i64::MAX);
        assert_eq!(parse_integer(b"-99999999999999999999"), i64::MIN);
    }
}
