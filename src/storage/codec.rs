//! Framing codec for log records.
//!
//! Each record occupies two lines in the log: a header `<payload_length>
//! <checksum>\n` followed by the payload bytes and a trailing `\n`. Both
//! header fields are decimal ASCII separated by a single space, and the
//! checksum is CRC-32 (IEEE) over exactly `payload_length` payload bytes.
//! The codec frames and verifies raw payloads; interpreting them as records
//! is the engine's job.

use crate::error::{Error, Result};

use std::io::BufRead;

/// Payloads are single-line JSON objects, and are expected to be small.
const MAX_PAYLOAD_LEN: u64 = 1 << 31;

/// A decoded frame: the verified payload, its checksum, and the header
/// length needed to compute payload offsets within the log.
#[derive(Debug, PartialEq)]
pub struct Frame {
    pub payload: Vec<u8>,
    pub checksum: u32,
    pub header_len: usize,
}

impl Frame {
    /// Total encoded length of the frame, including both newlines.
    pub fn encoded_len(&self) -> usize {
        self.header_len + self.payload.len() + 1
    }
}

/// Computes the CRC-32 (IEEE) checksum of a payload.
pub fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Encodes a payload into a framed record.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let header = format!("{} {}\n", payload.len(), checksum(payload));
    let mut buf = Vec::with_capacity(header.len() + payload.len() + 1);
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(payload);
    buf.push(b'\n');
    buf
}

/// Reads and verifies the next frame, or returns None on a clean EOF at a
/// frame boundary. Torn or damaged frames error with `MalformedHeader`,
/// `MalformedFrame`, or `ChecksumMismatch`.
pub fn read_frame<R: BufRead>(r: &mut R) -> Result<Option<Frame>> {
    let mut header = Vec::new();
    if r.read_until(b'\n', &mut header)? == 0 {
        return Ok(None);
    }
    if header.pop() != Some(b'\n') {
        return Err(Error::MalformedFrame("unterminated header line".to_string()));
    }
    let line = std::str::from_utf8(&header)
        .map_err(|_| Error::MalformedHeader(String::from_utf8_lossy(&header).into_owned()))?;
    let (payload_len, stored) = parse_header(line)?;

    let mut payload = vec![0; payload_len];
    r.read_exact(&mut payload).map_err(|err| match err.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            Error::MalformedFrame("payload extends beyond end of input".to_string())
        }
        _ => Error::Io(err),
    })?;
    let mut newline = [0u8; 1];
    match r.read_exact(&mut newline) {
        Ok(()) if newline[0] == b'\n' => {}
        Err(err) if err.kind() != std::io::ErrorKind::UnexpectedEof => return Err(err.into()),
        _ => return Err(Error::MalformedFrame("payload missing trailing newline".to_string())),
    }

    let computed = checksum(&payload);
    if computed != stored {
        return Err(Error::ChecksumMismatch { stored, computed });
    }
    Ok(Some(Frame { payload, checksum: stored, header_len: line.len() + 1 }))
}

/// Parses a header line into payload length and checksum. Both fields must
/// be plain ASCII decimals; a sign, a second space, or a missing field is
/// malformed.
fn parse_header(line: &str) -> Result<(usize, u32)> {
    let malformed = || Error::MalformedHeader(line.to_string());
    let (len, crc) = line.split_once(' ').ok_or_else(malformed)?;
    if len.is_empty() || crc.is_empty() {
        return Err(malformed());
    }
    if !len.bytes().all(|b| b.is_ascii_digit()) || !crc.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let len: u64 = len.parse().map_err(|_| malformed())?;
    if len > MAX_PAYLOAD_LEN {
        return Err(malformed());
    }
    let crc = crc.parse().map_err(|_| malformed())?;
    Ok((len as usize, crc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use test_case::test_case;

    /// CRC-32/IEEE check value for the standard test vector.
    #[test]
    fn crc32_check_value() {
        assert_eq!(checksum(b"123456789"), 0xcbf43926);
    }

    /// A frame is the decimal header line, the payload, and a newline.
    #[test]
    fn encode_layout() {
        let payload = br#"{"op":"delete","key":"a"}"#;
        let expect = format!("{} {}\n", payload.len(), checksum(payload));
        let mut expect = expect.into_bytes();
        expect.extend_from_slice(payload);
        expect.push(b'\n');
        assert_eq!(encode(payload), expect);
    }

    /// Encode then decode is the identity, and offsets line up.
    #[test]
    fn roundtrip() -> Result<()> {
        let payload = br#"{"op":"put","key":"k","value":[1,2,3],"expiry":0}"#;
        let encoded = encode(payload);
        let frame = read_frame(&mut Cursor::new(&encoded))?.expect("frame expected");
        assert_eq!(frame.payload, payload);
        assert_eq!(frame.checksum, checksum(payload));
        assert_eq!(frame.encoded_len(), encoded.len());
        assert_eq!(&encoded[frame.header_len..frame.header_len + payload.len()], payload);
        Ok(())
    }

    /// Consecutive frames decode in sequence, then a clean EOF.
    #[test]
    fn sequence() -> Result<()> {
        let mut encoded = encode(b"first");
        encoded.extend(encode(b"second"));
        let mut r = Cursor::new(&encoded);
        assert_eq!(read_frame(&mut r)?.expect("first frame").payload, b"first");
        assert_eq!(read_frame(&mut r)?.expect("second frame").payload, b"second");
        assert!(read_frame(&mut r)?.is_none());
        Ok(())
    }

    /// Empty input is a clean EOF, not an error.
    #[test]
    fn empty_input() -> Result<()> {
        assert!(read_frame(&mut Cursor::new(b""))?.is_none());
        Ok(())
    }

    #[test_case(b"7\n{\"x\":1}\n".as_slice(); "single header field")]
    #[test_case(b"a 1\npayload\n".as_slice(); "non numeric length")]
    #[test_case(b"7 x\npayload\n".as_slice(); "non numeric checksum")]
    #[test_case(b"7  1\npayload\n".as_slice(); "double space")]
    #[test_case(b"+7 1\npayload\n".as_slice(); "signed length")]
    #[test_case(b"7 -1\npayload\n".as_slice(); "signed checksum")]
    #[test_case(b" 7 1\npayload\n".as_slice(); "leading space")]
    #[test_case(b"\npayload\n".as_slice(); "empty header")]
    #[test_case(b"99999999999999999999 1\np\n".as_slice(); "length overflow")]
    fn malformed_header(input: &[u8]) {
        let result = read_frame(&mut Cursor::new(input));
        assert!(matches!(result, Err(Error::MalformedHeader(_))), "got {result:?}");
    }

    /// A flipped payload byte fails the checksum.
    #[test]
    fn corrupt_payload() {
        let mut encoded = encode(b"payload");
        let at = encoded.len() - 2;
        encoded[at] ^= 0xff;
        let result = read_frame(&mut Cursor::new(&encoded));
        assert!(matches!(result, Err(Error::ChecksumMismatch { .. })), "got {result:?}");
    }

    /// A missing trailing newline is a torn frame, even if the payload is
    /// intact.
    #[test]
    fn missing_trailing_newline() {
        let mut encoded = encode(b"payload");
        encoded.pop();
        let result = read_frame(&mut Cursor::new(&encoded));
        assert!(matches!(result, Err(Error::MalformedFrame(_))), "got {result:?}");
    }

    /// Every strict prefix of a frame errors; none panics or decodes.
    #[test]
    fn truncation_always_errors() {
        let encoded = encode(br#"{"op":"put","key":"k","value":"v","expiry":0}"#);
        for cut in 1..encoded.len() {
            let result = read_frame(&mut Cursor::new(&encoded[..cut]));
            assert!(result.is_err(), "prefix of {cut} bytes decoded: {result:?}");
        }
    }
}
