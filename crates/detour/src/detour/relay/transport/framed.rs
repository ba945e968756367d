use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::detour::relay::transport::{
    BoxedSink, BoxedSource, FrameSink, FrameSource, MAX_FRAME_BYTES, TransportError,
};

/// Frame framing over a byte stream.
///
/// Each frame is encoded as: `u32be len` + `payload`.
pub struct FrameReader<R> {
    inner: R,
}

impl<R> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

pub struct FrameWriter<W> {
    inner: W,
}

impl<W> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R> FrameSource for FrameReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        let n = match self.inner.read_u32().await {
            Ok(n) => n,
            // EOF on a frame boundary is a clean close.
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if n > MAX_FRAME_BYTES {
            return Err(TransportError::FrameTooLarge(n));
        }
        let mut buf = vec![0u8; n as usize];
        self.inner.read_exact(&mut buf).await?;
        Ok(Some(Bytes::from(buf)))
    }
}

#[async_trait]
impl<W> FrameSink for FrameWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let n: u32 = frame
            .len()
            .try_into()
            .map_err(|_| TransportError::FrameTooLarge(u32::MAX))?;
        if n > MAX_FRAME_BYTES {
            return Err(TransportError::FrameTooLarge(n));
        }
        self.inner.write_u32(n).await?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

/// Splits any duplex byte stream into a framed source and sink.
pub fn framed<S>(stream: S) -> (BoxedSource, BoxedSink)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (rd, wr) = tokio::io::split(stream);
    (
        Box::new(FrameReader::new(rd)),
        Box::new(FrameWriter::new(wr)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_keep_boundaries() {
        let (a, b) = tokio::io::duplex(1024);
        let (_a_src, mut a_sink) = framed(a);
        let (mut b_src, _b_sink) = framed(b);

        a_sink.send(Bytes::from_static(b"one")).await.unwrap();
        a_sink.send(Bytes::new()).await.unwrap();
        a_sink.send(Bytes::from_static(b"three")).await.unwrap();

        assert_eq!(b_src.recv().await.unwrap().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(b_src.recv().await.unwrap().unwrap(), Bytes::new());
        assert_eq!(b_src.recv().await.unwrap().unwrap(), Bytes::from_static(b"three"));
    }

    #[tokio::test]
    async fn eof_on_boundary_is_clean_close() {
        let (a, b) = tokio::io::duplex(64);
        let (mut src, _sink) = framed(b);
        drop(a);
        assert!(src.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_oversized_length_without_reading_payload() {
        let (mut a, b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            a.write_u32(MAX_FRAME_BYTES + 1).await.unwrap();
        });
        let mut src = FrameReader::new(b);
        match src.recv().await {
            Err(TransportError::FrameTooLarge(n)) => assert!(n > MAX_FRAME_BYTES),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let (mut a, b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            a.write_u32(10).await.unwrap();
            a.write_all(b"abc").await.unwrap();
        });
        let mut src = FrameReader::new(b);
        assert!(matches!(src.recv().await, Err(TransportError::Io(_))));
    }
}
