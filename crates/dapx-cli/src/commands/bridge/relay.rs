//! Framed relay between one reader and one writer

use dapx_logging::{debug, trace};
use dapx_proxy::framing::{encode_body, FrameDecoder};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 64 * 1024;

/// Copy complete DAP frames from `reader` to `writer` until EOF.
///
/// Frames are re-encoded on the way out so a partial frame is never
/// forwarded. The writer is shut down when the reader ends.
pub(super) async fn relay<R, W>(mut reader: R, mut writer: W, direction: &'static str) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            debug!("{}: stream closed", direction);
            if decoder.buffered_len() > 0 {
                debug!(
                    "{}: dropping {} bytes of incomplete frame",
                    direction,
                    decoder.buffered_len()
                );
            }
            if let Err(e) = writer.shutdown().await {
                debug!("{}: failed to shut down writer: {}", direction, e);
            }
            return Ok(());
        }

        decoder.push(&buf[..n]);
        while let Some(body) = decoder.next_body() {
            trace!("{}: {} bytes", direction, body.len());
            writer.write_all(&encode_body(&body)).await?;
        }
        writer.flush().await?;
    }
}
