//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Client-side mirror of the wire protocol: for one file, open a
//! connection (with retry on the whole upload, not per-chunk), exchange
//! `HELLO` for an assigned `image_id`, stream `IMAGE_INFO` + chunks +
//! `IMAGE_COMPLETE`, and wait for the final `ACK`. A progress callback is
//! invoked at start, per chunk, and on completion/failure, mirroring
//! `§4.6`'s `(message, progress)` contract.

use std::fs::File;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};

use crate::config::ClientConfig;
use crate::protocol::{
    ImageInfo, MessageHeader, MessageType, ProcessingType, DEFAULT_CHUNK_SIZE, IMAGE_INFO_LEN,
};
use crate::tls;
use crate::transport::{Connection, RecvOutcome};

/// Uploads one file, retrying the whole connection/handshake/upload on
/// failure. Each retry restarts from `HELLO`, so the server assigns a fresh
/// `image_id` per attempt. Returns the `image_id` the server acknowledged.
pub fn upload_file(
    path: &Path,
    config: &ClientConfig,
    processing_type: ProcessingType,
    mut progress: impl FnMut(&str, f32),
) -> Result<String> {
    let attempts = config.max_retries.max(1);
    let mut last_err = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            let backoff = Duration::from_millis(config.retry_backoff_ms * attempt as u64);
            progress(&format!("retrying in {:?}", backoff), 0.0);
            std::thread::sleep(backoff);
        }
        match try_upload_once(path, config, processing_type, &mut progress) {
            Ok(image_id) => return Ok(image_id),
            Err(e) => {
                progress(&format!("upload attempt {} failed: {:#}", attempt + 1, e), 0.0);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("upload failed with no attempts made")))
}

fn try_upload_once(
    path: &Path,
    config: &ClientConfig,
    processing_type: ProcessingType,
    progress: &mut impl FnMut(&str, f32),
) -> Result<String> {
    progress(&format!("connecting to {}:{}", config.host, config.port), 0.0);
    let mut conn = connect(config)?;
    conn.set_timeout(Duration::from_secs(config.connect_timeout))?;

    conn.send_header(&MessageHeader::without_id(MessageType::Hello, 0))
        .context("Failed to send HELLO")?;
    let image_id = recv_expected(&mut conn, MessageType::ImageIdResponse)?.image_id_str();

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());
    let format = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let total_size = file
        .metadata()
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();
    ensure!(total_size > 0, "{} is empty", path.display());
    ensure!(total_size <= u32::MAX as u64, "{} is too large to upload", path.display());

    let info = ImageInfo {
        filename: filename.clone(),
        total_size: total_size as u32,
        total_chunks: ((total_size as usize + config.chunk_size - 1) / config.chunk_size) as u32,
        processing_type: processing_type as u8,
        format: format.clone(),
    };
    let info_bytes = info.encode();
    debug_assert_eq!(info_bytes.len(), IMAGE_INFO_LEN);
    conn.send_header(&MessageHeader::new(MessageType::ImageInfo, info_bytes.len() as u32, &image_id))
        .context("Failed to send IMAGE_INFO header")?;
    conn.send_exact(&info_bytes).context("Failed to send IMAGE_INFO payload")?;

    progress("uploading", 0.0);
    let chunk_size = if config.chunk_size == 0 { DEFAULT_CHUNK_SIZE } else { config.chunk_size };
    let mut sent: u64 = 0;
    let mut buf = vec![0u8; chunk_size];
    while sent < total_size {
        let n = file.read(&mut buf).context("Failed to read from file")?;
        if n == 0 {
            bail!("{} ended after {} of {} declared bytes", path.display(), sent, total_size);
        }
        conn.send_header(&MessageHeader::new(MessageType::ImageChunk, n as u32, &image_id))
            .context("Failed to send IMAGE_CHUNK header")?;
        conn.send_exact(&buf[..n]).context("Failed to send IMAGE_CHUNK payload")?;
        sent += n as u64;
        progress("uploading", sent as f32 / total_size as f32);
    }

    let mut complete_payload = format.into_bytes();
    complete_payload.push(0);
    conn.send_header(&MessageHeader::new(MessageType::ImageComplete, complete_payload.len() as u32, &image_id))
        .context("Failed to send IMAGE_COMPLETE header")?;
    conn.send_exact(&complete_payload).context("Failed to send IMAGE_COMPLETE payload")?;

    let ack = recv_expected(&mut conn, MessageType::Ack)?;
    let ack_id = ack.image_id_str();
    ensure!(ack_id == image_id, "ACK carried image_id '{}', expected '{}'", ack_id, image_id);

    progress("complete", 1.0);
    Ok(image_id)
}

fn connect(config: &ClientConfig) -> Result<Connection> {
    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve {}:{}", config.host, config.port))?
        .next()
        .with_context(|| format!("No address found for {}:{}", config.host, config.port))?;

    let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(config.connect_timeout))
        .with_context(|| format!("Failed to connect to {}", addr))?;

    if config.wants_tls()? {
        let tls_config = tls::client_config();
        let tls_stream = tls::connect(stream, tls_config, &config.host)?;
        Ok(Connection::TlsClient(Box::new(tls_stream)))
    } else {
        Ok(Connection::Plain(stream))
    }
}

/// Reads the next frame and validates its type, draining and discarding its
/// payload (every reply this client expects has either no payload or a
/// payload already consumed by the caller via the header's `image_id`).
fn recv_expected(conn: &mut Connection, expected: MessageType) -> Result<MessageHeader> {
    let header = match conn.recv_header()? {
        Some(h) => h,
        None => bail!("connection closed before sending the expected {:?} frame", expected),
    };
    let got = MessageType::from_u8(header.msg_type)
        .with_context(|| format!("received unknown message type {}", header.msg_type))?;
    ensure!(got == expected, "expected {:?}, got {:?}", expected, got);
    if header.length > 0 {
        match conn.recv_exact(header.length as usize)? {
            RecvOutcome::Ok(_) => {}
            RecvOutcome::Eof => bail!("connection closed mid-payload reading {:?}", expected),
        }
    }
    Ok(header)
}
