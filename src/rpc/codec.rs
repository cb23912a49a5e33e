//! Newline-delimited JSON framing for peer connections.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use crate::error::{RaftError, Result};
use crate::rpc::message::Frame;

/// Upper bound on one encoded frame. Heartbeats and votes are tiny; this only
/// guards against a corrupt peer streaming an endless line.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub type FrameReader<R> = FramedRead<R, LinesCodec>;

pub fn frame_reader<R: AsyncRead>(reader: R) -> FrameReader<R> {
    FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_LEN))
}

pub fn encode(frame: &Frame) -> Result<Vec<u8>> {
    let mut buf = serde_json::to_vec(frame)?;
    buf.push(b'\n');
    Ok(buf)
}

pub fn decode(line: &str) -> Result<Frame> {
    Ok(serde_json::from_str(line)?)
}

/// Next frame from the connection, `None` on clean EOF.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Option<Result<Frame>> {
    match reader.next().await? {
        Ok(line) => Some(decode(&line)),
        Err(LinesCodecError::Io(e)) => Some(Err(RaftError::Io(e))),
        Err(LinesCodecError::MaxLineLengthExceeded) => Some(Err(RaftError::Io(
            std::io::Error::new(std::io::ErrorKind::InvalidData, "frame exceeds maximum length"),
        ))),
    }
}

/// Drain `outbound` onto the connection until the channel closes or a write
/// fails.
pub async fn run_writer<W: AsyncWrite + Unpin>(
    writer: W,
    mut outbound: mpsc::Receiver<Frame>,
) -> Result<()> {
    let mut writer = BufWriter::new(writer);
    while let Some(frame) = outbound.recv().await {
        writer.write_all(&encode(&frame)?).await?;
        writer.flush().await?;
    }
    Ok(())
}
