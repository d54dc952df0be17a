use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Maximum number of decimal digits in the length prefix.
///
/// The prefix plus its newline must appear within the first
/// `MAX_LENGTH_DIGITS + 1` bytes of a frame.
pub const MAX_LENGTH_DIGITS: usize = 9;

const MAX_HEADER_LEN: usize = MAX_LENGTH_DIGITS + 1;
const MAX_BODY_LEN: usize = 999_999_999;

/// A framed message addressed to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The channel this message belongs to. Empty for control frames.
    pub channel: String,
    /// The message payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a data frame.
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// Create a control frame carrying an already-serialized JSON payload.
    pub fn control(payload: impl Into<Bytes>) -> Self {
        Self::new(String::new(), payload)
    }

    /// Whether this frame carries a control message.
    pub fn is_control(&self) -> bool {
        self.channel.is_empty()
    }

    /// Length of the body, as written in the length prefix.
    pub fn body_len(&self) -> usize {
        self.channel.len() + 1 + self.payload.len()
    }

    /// The total wire size of this frame (prefix + body).
    pub fn wire_size(&self) -> usize {
        let body = self.body_len();
        body.to_string().len() + 1 + body
    }
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// LEN "\n" CHANNEL "\n" PAYLOAD
/// ```
/// where `LEN` is the decimal byte count of `CHANNEL "\n" PAYLOAD`.
pub fn encode_frame(channel: &str, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if channel.contains('\n') {
        return Err(FrameError::InvalidChannel(format!(
            "channel id {channel:?} contains a newline"
        )));
    }

    let body_len = channel.len() + 1 + payload.len();
    if body_len > MAX_BODY_LEN {
        return Err(FrameError::FrameTooLarge {
            size: body_len,
            max: MAX_BODY_LEN,
        });
    }

    let prefix = body_len.to_string();
    dst.reserve(prefix.len() + 1 + body_len);
    dst.put_slice(prefix.as_bytes());
    dst.put_u8(b'\n');
    dst.put_slice(channel.as_bytes());
    dst.put_u8(b'\n');
    dst.put_slice(payload);
    Ok(())
}

/// Parse the length prefix.
///
/// Returns `Ok(None)` when the newline has not arrived yet, otherwise the
/// prefix length (including its newline) and the declared body length.
fn parse_header(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let window = &buf[..buf.len().min(MAX_HEADER_LEN)];
    let Some(newline) = window.iter().position(|&b| b == b'\n') else {
        if buf.len() >= MAX_HEADER_LEN {
            return Err(FrameError::HeaderTooLong {
                max: MAX_LENGTH_DIGITS,
            });
        }
        return Ok(None);
    };

    let digits = &buf[..newline];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(FrameError::InvalidLength(
            String::from_utf8_lossy(digits).into_owned(),
        ));
    }

    // At most MAX_LENGTH_DIGITS ASCII digits always fit in a usize.
    let length = digits
        .iter()
        .fold(0usize, |acc, &d| acc * 10 + usize::from(d - b'0'));
    // A body always carries at least the channel's newline.
    if length == 0 {
        return Err(FrameError::InvalidLength(
            String::from_utf8_lossy(digits).into_owned(),
        ));
    }

    Ok(Some((newline + 1, length)))
}

fn split_body(body: &[u8]) -> (&[u8], &[u8]) {
    match body.iter().position(|&b| b == b'\n') {
        Some(idx) => (&body[..idx], &body[idx + 1..]),
        None => (body, &[]),
    }
}

fn channel_from_bytes(raw: &[u8]) -> Result<String> {
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|err| FrameError::InvalidChannel(err.to_string()))
}

/// Try to parse one frame from the front of `buffer`.
///
/// Returns `(consumed, Some(frame))` when a complete frame is present, or
/// `(0, None)` when more bytes are needed. The buffer itself is not modified.
pub fn consume_frame(buffer: &[u8]) -> Result<(usize, Option<Frame>)> {
    let Some((header_len, length)) = parse_header(buffer)? else {
        return Ok((0, None));
    };

    let end = header_len + length;
    if buffer.len() < end {
        return Ok((0, None));
    }

    let (channel, payload) = split_body(&buffer[header_len..end]);
    let frame = Frame {
        channel: channel_from_bytes(channel)?,
        payload: Bytes::copy_from_slice(payload),
    };

    Ok((end, Some(frame)))
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer without copying the
/// payload.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Frame>> {
    let Some((header_len, length)) = parse_header(src)? else {
        return Ok(None); // Need more data
    };

    let total = header_len + length;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None); // Need more data
    }

    src.advance(header_len);
    let mut body = src.split_to(length);
    let split = body.iter().position(|&b| b == b'\n');
    let channel = match split {
        Some(idx) => {
            let channel = body.split_to(idx);
            body.advance(1);
            channel
        }
        None => body.split_to(body.len()),
    };

    Ok(Some(Frame {
        channel: channel_from_bytes(&channel)?,
        payload: body.freeze(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let mut buf = BytesMut::new();
        encode_frame("ch1", b"hi", &mut buf).unwrap();
        assert_eq!(buf.as_ref(), b"6\nch1\nhi");
    }

    #[test]
    fn test_encode_decode_data_frame() {
        let mut buf = BytesMut::new();
        encode_frame("4:1", b"hello, bridge!", &mut buf).unwrap();

        let frame = decode_frame(&mut buf).unwrap().unwrap();

        assert_eq!(frame.channel, "4:1");
        assert_eq!(frame.payload.as_ref(), b"hello, bridge!");
        assert!(!frame.is_control());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_control_frame() {
        let mut buf = BytesMut::from(&b"20\n\n{\"command\":\"ready\"}"[..]);
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert!(frame.is_control());
        assert_eq!(frame.payload.as_ref(), b"{\"command\":\"ready\"}");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_incomplete_header() {
        let mut buf = BytesMut::from(&b"12"[..]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_decode_incomplete_payload() {
        let mut buf = BytesMut::new();
        encode_frame("ch", b"hello", &mut buf).unwrap();
        buf.truncate(buf.len() - 2);

        assert!(decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_header_too_long() {
        let mut buf = BytesMut::from(&b"1234567890123"[..]);
        let result = decode_frame(&mut buf);
        assert!(matches!(result, Err(FrameError::HeaderTooLong { .. })));
    }

    #[test]
    fn test_nine_digit_header_is_accepted() {
        let mut buf = BytesMut::from(&b"000000003\nab\n"[..]);
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.channel, "ab");
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_non_numeric_length() {
        let mut buf = BytesMut::from(&b"1x\nab"[..]);
        let result = decode_frame(&mut buf);
        assert!(matches!(result, Err(FrameError::InvalidLength(_))));

        let mut buf = BytesMut::from(&b"\nab"[..]);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(FrameError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_zero_length_is_rejected() {
        let mut buf = BytesMut::from(&b"0\n"[..]);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(FrameError::InvalidLength(_))
        ));
        assert!(matches!(
            consume_frame(b"000\n1\nx"),
            Err(FrameError::InvalidLength(_))
        ));
    }

    #[test]
    fn test_body_without_newline_is_all_channel() {
        let mut buf = BytesMut::from(&b"3\nabc"[..]);
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.channel, "abc");
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_invalid_utf8_channel() {
        let mut buf = BytesMut::from(&b"3\n\xff\nx"[..]);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(FrameError::InvalidChannel(_))
        ));
    }

    #[test]
    fn test_multiple_frames() {
        let mut buf = BytesMut::new();
        encode_frame("a", b"first", &mut buf).unwrap();
        encode_frame("b", b"second", &mut buf).unwrap();

        let f1 = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(f1.channel, "a");
        assert_eq!(f1.payload.as_ref(), b"first");

        let f2 = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(f2.channel, "b");
        assert_eq!(f2.payload.as_ref(), b"second");

        assert!(buf.is_empty());
    }

    #[test]
    fn test_consume_frame_reports_consumed_bytes() {
        let mut wire = BytesMut::new();
        encode_frame("x", b"12345", &mut wire).unwrap();
        let first_len = wire.len();
        encode_frame("y", b"", &mut wire).unwrap();

        let (consumed, frame) = consume_frame(&wire).unwrap();
        assert_eq!(consumed, first_len);
        assert_eq!(frame.unwrap().payload.as_ref(), b"12345");

        let (consumed, frame) = consume_frame(&wire[first_len..]).unwrap();
        assert_eq!(consumed, wire.len() - first_len);
        assert_eq!(frame.unwrap().channel, "y");

        let (consumed, frame) = consume_frame(&wire[..first_len - 1]).unwrap();
        assert_eq!(consumed, 0);
        assert!(frame.is_none());
    }

    #[test]
    fn test_reject_newline_in_channel() {
        let mut buf = BytesMut::new();
        let err = encode_frame("a\nb", b"", &mut buf).unwrap_err();
        assert!(matches!(err, FrameError::InvalidChannel(_)));
    }

    #[test]
    fn test_frame_wire_size() {
        let frame = Frame::new("ch1", Bytes::from_static(b"test"));
        let mut buf = BytesMut::new();
        encode_frame(&frame.channel, &frame.payload, &mut buf).unwrap();
        assert_eq!(frame.wire_size(), buf.len());
    }
}
