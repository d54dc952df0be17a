use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead};

use crate::codec::{decode_frame, Frame};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// `tokio_util` codec for the length-prefixed wire format.
///
/// Decoding never yields a partial frame. A stream that ends in the middle of
/// a frame fails with [`FrameError::ConnectionClosed`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        decode_frame(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match decode_frame(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

/// Reads complete frames from any `AsyncRead` stream.
///
/// Partial reads are buffered; callers only see complete frames.
#[derive(Debug)]
pub struct FrameReader<T> {
    inner: FramedRead<T, FrameCodec>,
}

impl<T: AsyncRead + Unpin> FrameReader<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner: FramedRead::with_capacity(inner, FrameCodec, INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Next frame, or `Ok(None)` on a clean end of stream between frames.
    ///
    /// Cancel safe: a frame is never lost when the future is dropped.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.inner.next().await.transpose()
    }

    /// Read the next complete frame.
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        self.next_frame().await?.ok_or(FrameError::ConnectionClosed)
    }

    pub fn get_ref(&self) -> &T {
        self.inner.get_ref()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::codec::encode_frame;

    #[tokio::test]
    async fn read_multiple_frames() {
        let mut wire = BytesMut::new();
        encode_frame("1", b"one", &mut wire).unwrap();
        encode_frame("", br#"{"command":"ping"}"#, &mut wire).unwrap();
        encode_frame("3", b"three", &mut wire).unwrap();

        let mut reader = FrameReader::new(&wire[..]);

        let f1 = reader.read_frame().await.unwrap();
        let f2 = reader.read_frame().await.unwrap();
        let f3 = reader.read_frame().await.unwrap();

        assert_eq!((f1.channel.as_str(), f1.payload.as_ref()), ("1", b"one".as_ref()));
        assert!(f2.is_control());
        assert_eq!((f3.channel.as_str(), f3.payload.as_ref()), ("3", b"three".as_ref()));
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_writes_are_reassembled() {
        let mut wire = BytesMut::new();
        encode_frame("slow", b"byte by byte", &mut wire).unwrap();

        let (mut tx, rx) = tokio::io::duplex(4);
        let writer = tokio::spawn(async move {
            for byte in wire.iter() {
                tx.write_all(&[*byte]).await.unwrap();
            }
        });

        let mut reader = FrameReader::new(rx);
        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame.channel, "slow");
        assert_eq!(frame.payload.as_ref(), b"byte by byte");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn connection_closed_cleanly() {
        let mut reader = FrameReader::new(&b""[..]);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[tokio::test]
    async fn connection_closed_mid_frame() {
        let mut reader = FrameReader::new(&b"10\nch\nonly"[..]);
        let err = reader.next_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
        assert!(!err.is_protocol_error());
    }

    #[tokio::test]
    async fn garbage_header_is_a_protocol_error() {
        let mut reader = FrameReader::new(&b"abc\nxyz"[..]);
        let err = reader.read_frame().await.unwrap_err();
        assert!(err.is_protocol_error());
        assert_eq!(err.problem(), "protocol-error");
    }
}
