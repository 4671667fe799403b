//! Ping handler.
//!
//! Synchronous and single-chunk: any line starting with `ping` is answered
//! with the fixed success response, whatever follows the prefix.

use super::Response;
use bytes::BytesMut;

/// Write the pong response to the outbound buffer.
pub fn respond(out: &mut BytesMut) {
    out.extend_from_slice(Response::pong());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pong() {
        let mut out = BytesMut::new();
        respond(&mut out);
        assert_eq!(&out[..], b"S pong\n");
    }
}
