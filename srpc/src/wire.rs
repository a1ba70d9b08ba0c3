// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Line and frame primitives shared by the client and server halves.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::{Error, MAX_FRAME_LEN};

pub(crate) type Reader = BufReader<OwnedReadHalf>;
pub(crate) type Writer = BufWriter<OwnedWriteHalf>;

/// Read one newline-terminated line, stripping the terminator (and any
/// carriage return). `None` means the peer closed the connection cleanly.
pub(crate) async fn read_line_opt(reader: &mut Reader) -> Result<Option<String>, Error> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

pub(crate) async fn read_line(reader: &mut Reader) -> Result<String, Error> {
    read_line_opt(reader).await?.ok_or(Error::Closed)
}

pub(crate) async fn read_frame(reader: &mut Reader) -> Result<Vec<u8>, Error> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

pub(crate) async fn write_frame(writer: &mut Writer, payload: &[u8]) -> Result<(), Error> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    Ok(())
}
