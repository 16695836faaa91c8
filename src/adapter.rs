// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Length-prefixed transport framing on top of any `AsyncRead + AsyncWrite`
//! connection: a 4-byte big-endian total length followed by the stream's
//! header+body bytes, bounded by `transport_limit`. Grounded on
//! `client/common.rs`'s `io_with_timeout` helper and `client/client.rs`'s
//! read loop (read header, then read exactly that many payload bytes).

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::codec::Stream;
use crate::error::{ErrorLevel, RpcError};

const LENGTH_PREFIX_LEN: usize = 4;

async fn io_with_timeout<F, T>(dur: Duration, fut: F) -> Result<T, RpcError>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match timeout(dur, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(RpcError::net(1, ErrorLevel::Warn, e.to_string())),
        Err(_) => Err(RpcError::client_timeout()),
    }
}

/// Reads one length-prefixed frame and decodes it into a [`Stream`].
/// `transport_limit` bounds the declared length to stop a corrupt or
/// malicious peer from asking us to allocate an unbounded buffer.
pub async fn read_frame<R>(
    reader: &mut R,
    read_timeout: Duration,
    transport_limit: usize,
) -> Result<Stream, RpcError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
    io_with_timeout(read_timeout, reader.read_exact(&mut len_buf)).await?;
    let total_len = u32::from_be_bytes(len_buf) as usize;
    if total_len > transport_limit {
        return Err(RpcError::transport(
            2,
            ErrorLevel::Error,
            format!("frame length {total_len} exceeds transport_limit {transport_limit}"),
        ));
    }
    if total_len < crate::codec::HEADER_LEN {
        return Err(RpcError::protocol(
            30,
            ErrorLevel::Warn,
            format!("frame length {total_len} shorter than header"),
        ));
    }
    let mut body = BytesMut::zeroed(total_len);
    io_with_timeout(read_timeout, reader.read_exact(&mut body)).await?;
    Stream::from_bytes(&body)
}

/// Serializes `stream` and writes it as one length-prefixed frame.
pub async fn write_frame<W>(
    writer: &mut W,
    write_timeout: Duration,
    transport_limit: usize,
    stream: &Stream,
) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = stream.to_bytes();
    if bytes.len() > transport_limit {
        return Err(RpcError::transport(
            3,
            ErrorLevel::Error,
            format!("frame length {} exceeds transport_limit {transport_limit}", bytes.len()),
        ));
    }
    let len_prefix = (bytes.len() as u32).to_be_bytes();
    io_with_timeout(write_timeout, writer.write_all(&len_prefix)).await?;
    io_with_timeout(write_timeout, writer.write_all(&bytes)).await?;
    io_with_timeout(write_timeout, writer.flush()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StreamKind;

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let mut buf = Vec::new();
        let mut stream = Stream::new();
        stream.set_kind(StreamKind::RpcRequest);
        stream.set_callback_id(5);
        stream.write_string("payload");
        write_frame(&mut buf, Duration::from_secs(1), 1 << 20, &stream).await.expect("write");

        let mut cursor = std::io::Cursor::new(buf);
        let mut decoded = read_frame(&mut cursor, Duration::from_secs(1), 1 << 20).await.expect("read");
        assert_eq!(decoded.callback_id(), 5);
        assert_eq!(decoded.read_string().expect("read"), "payload");
    }

    #[tokio::test]
    async fn rejects_frame_over_transport_limit() {
        let mut buf = Vec::new();
        let mut stream = Stream::new();
        stream.write_bytes(&vec![0u8; 1024]);
        write_frame(&mut buf, Duration::from_secs(1), 1 << 20, &stream).await.expect("write");
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor, Duration::from_secs(1), 16).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);
    }
}
