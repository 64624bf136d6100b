// Frame encoding and decoding over TCP streams with size limits.
use bytes::{Bytes, BytesMut};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use viaduct_gateway::TransportError;
use viaduct_wire::{Frame, FrameHeader};

// Low-level frame reader with a max payload cap. End of stream at a frame
// boundary is `Ok(None)`; a peer vanishing mid-frame is the closed sentinel.
pub async fn read_frame_limited<R>(
    recv: &mut R,
    max_payload_bytes: usize,
    scratch: &mut BytesMut,
) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; FrameHeader::LEN];
    match recv.read_exact(&mut header_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) if is_disconnect(&err) => return Err(TransportError::Closed),
        Err(err) => return Err(err.into()),
    }

    let header = FrameHeader::decode(Bytes::copy_from_slice(&header_bytes))?;
    let length = header.length as usize;
    if length > max_payload_bytes {
        return Err(TransportError::Protocol(viaduct_wire::Error::FrameTooLarge));
    }
    scratch.clear();
    scratch.resize(length, 0u8);
    match recv.read_exact(&mut scratch[..]).await {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof || is_disconnect(&err) => {
            return Err(TransportError::Closed);
        }
        Err(err) => return Err(err.into()),
    }
    Ok(Some(Frame {
        header,
        payload: scratch.split().freeze(),
    }))
}

// Low-level frame writer.
pub async fn write_frame<W>(send: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut header_bytes = [0u8; FrameHeader::LEN];
    frame.header.encode_into(&mut header_bytes);
    send.write_all(&header_bytes).await.map_err(map_io)?;
    send.write_all(&frame.payload).await.map_err(map_io)?;
    send.flush().await.map_err(map_io)?;
    Ok(())
}

fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
    )
}

fn map_io(err: std::io::Error) -> TransportError {
    if is_disconnect(&err) {
        TransportError::Closed
    } else {
        TransportError::Io(err)
    }
}
