use bytes::{Bytes, BytesMut};
use futures_util::SinkExt;
use tokio::io::AsyncWrite;
use tokio_util::codec::{Encoder, FramedWrite};

use crate::codec::{encode_frame, Frame};
use crate::control::ControlMessage;
use crate::error::{FrameError, Result};
use crate::reader::FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        encode_frame(&frame.channel, &frame.payload, dst)
    }
}

/// Writes complete frames to any `AsyncWrite` stream.
#[derive(Debug)]
pub struct FrameWriter<T> {
    inner: FramedWrite<T, FrameCodec>,
}

impl<T: AsyncWrite + Unpin> FrameWriter<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner: FramedWrite::new(inner, FrameCodec),
        }
    }

    /// Write a complete frame and flush it.
    pub async fn write_frame(&mut self, frame: Frame) -> Result<()> {
        self.inner.send(frame).await
    }

    /// Encode and send a payload on a channel.
    pub async fn send(&mut self, channel: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.write_frame(Frame::new(channel, payload)).await
    }

    pub async fn send_control(&mut self, message: &ControlMessage) -> Result<()> {
        self.write_frame(message.to_frame()).await
    }

    /// Queue a frame without flushing.
    pub async fn feed(&mut self, frame: Frame) -> Result<()> {
        self.inner.feed(frame).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await
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
    use super::*;
    use crate::control::COMMAND_INIT;
    use crate::reader::FrameReader;

    #[tokio::test]
    async fn write_layout() {
        let mut writer = FrameWriter::new(Vec::new());
        writer.send("ch1", Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(writer.get_ref().as_slice(), b"6\nch1\nhi");
    }

    #[tokio::test]
    async fn control_over_pipe() {
        let (left, right) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        let init = ControlMessage::new(COMMAND_INIT).with("version", 1);
        writer.send_control(&init).await.unwrap();
        writer.send("4", Bytes::from_static(b"data")).await.unwrap();

        let first = reader.read_frame().await.unwrap();
        assert!(first.is_control());
        assert_eq!(ControlMessage::parse(&first.payload).unwrap(), init);

        let second = reader.read_frame().await.unwrap();
        assert_eq!(second.channel, "4");
        assert_eq!(second.payload.as_ref(), b"data");
    }

    #[tokio::test]
    async fn newline_in_channel_is_refused() {
        let mut writer = FrameWriter::new(Vec::new());
        let err = writer.send("a\nb", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, FrameError::InvalidChannel(_)));
        assert!(writer.get_ref().is_empty());
    }
}
