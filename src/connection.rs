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

//! Per-connection state machine: `AwaitHello -> AwaitInfo -> Receiving ->
//! Terminal`. One call to `handle()` per accepted connection, run on its
//! own OS thread by the listener; no mutable state is shared between
//! connections.

use std::time::Duration;

use anyhow::{bail, Result};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::logging::Logger;
use crate::processor::OutputConfig;
use crate::protocol::{
    ImageInfo, MessageHeader, MessageType, ProcessingType, IMAGE_INFO_LEN,
};
use crate::scheduler::{ProcessingJob, Scheduler};
use crate::transport::{Connection, RecvOutcome};

/// Upper bound on the payload length accepted for frames that carry no
/// meaningfully sized payload: `HELLO` (ignored), `IMAGE_COMPLETE`'s format
/// string, and anything sent as an unrecognized message type. Without this,
/// a single frame claiming a multi-gigabyte `length` would make `recv_exact`
/// eagerly allocate a buffer of that size; this process aborts on
/// allocation failure (`panic = 'abort'`), so that's a remote DoS, not just
/// a slow read.
const MAX_CONTROL_PAYLOAD_LEN: u32 = 1024;

enum State {
    AwaitHello,
    AwaitInfo {
        image_id: String,
    },
    Receiving {
        image_id: String,
        filename: String,
        format: String,
        processing_type: ProcessingType,
        capacity: usize,
        buffer: Vec<u8>,
    },
}

pub fn handle(mut conn: Connection, config: &ServerConfig, scheduler: &Scheduler, logger: &Logger) {
    if let Err(e) = conn.set_timeout(Duration::from_secs(config.connection_timeout_secs)) {
        logger.log(&format!("Failed to set connection timeout: {:#}", e));
        return;
    }

    let output_config = config.output_config();
    let mut state = State::AwaitHello;

    loop {
        let header = match conn.recv_header() {
            Ok(Some(h)) => h,
            Ok(None) => {
                if let State::Receiving { .. } = &state {
                    logger.log("Connection closed mid-upload; discarding partial buffer, no ACK sent");
                }
                return;
            }
            Err(e) => {
                logger.log(&format!("Transport error awaiting next frame: {:#}", e));
                return;
            }
        };

        let msg_type = match MessageType::from_u8(header.msg_type) {
            Some(t) => t,
            None => {
                if let Err(e) = read_bounded_payload(&mut conn, header.length, MAX_CONTROL_PAYLOAD_LEN) {
                    logger.log(&format!("Failed to drain unknown frame: {:#}", e));
                    return;
                }
                continue;
            }
        };

        let current = std::mem::replace(&mut state, State::AwaitHello);
        state = match step(
            current, msg_type, &header, &mut conn, &output_config, config.max_image_size, scheduler, logger,
        ) {
            Some(next) => next,
            None => return,
        };
    }
}

/// Advances the state machine by exactly one frame. Returns `None` when the
/// connection should be closed (policy violation, transport error, or
/// successful completion after `ACK`).
fn step(
    state: State,
    msg_type: MessageType,
    header: &MessageHeader,
    conn: &mut Connection,
    output_config: &OutputConfig,
    max_image_size: u32,
    scheduler: &Scheduler,
    logger: &Logger,
) -> Option<State> {
    use MessageType::*;
    use State::*;

    match (state, msg_type) {
        (AwaitHello, Hello) => {
            read_bounded_payload(conn, header.length, MAX_CONTROL_PAYLOAD_LEN).ok()?;
            let image_id = Uuid::new_v4().to_string();
            send_id_response(conn, &image_id).ok()?;
            Some(AwaitInfo { image_id })
        }
        (AwaitInfo { .. }, Hello) => {
            read_bounded_payload(conn, header.length, MAX_CONTROL_PAYLOAD_LEN).ok()?;
            let image_id = Uuid::new_v4().to_string();
            send_id_response(conn, &image_id).ok()?;
            Some(AwaitInfo { image_id })
        }
        (AwaitInfo { image_id }, ImageInfo) => {
            if header.length as usize != IMAGE_INFO_LEN {
                logger.log(&format!(
                    "IMAGE_INFO has wrong payload length {} (expected {})",
                    header.length, IMAGE_INFO_LEN
                ));
                return None;
            }
            let payload = read_payload(conn, header.length).ok()?;
            let info = match ImageInfo::decode(&payload) {
                Ok(info) => info,
                Err(e) => {
                    logger.log(&format!("Failed to decode IMAGE_INFO: {:#}", e));
                    return None;
                }
            };
            if info.total_size == 0 {
                logger.log("IMAGE_INFO declared total_size of 0");
                return None;
            }
            if info.total_size > max_image_size {
                logger.log(&format!(
                    "IMAGE_INFO declared total_size {} exceeds configured maximum {}",
                    info.total_size, max_image_size
                ));
                return None;
            }
            let capacity = info.total_size as usize;
            let mut buffer = Vec::new();
            if buffer.try_reserve_exact(capacity).is_err() {
                logger.log(&format!("Failed to allocate {} bytes for incoming image", capacity));
                return None;
            }
            Some(Receiving {
                image_id,
                filename: crate::protocol::sanitize_filename(&info.filename),
                format: info.format,
                processing_type: ProcessingType::from_u8(info.processing_type),
                capacity,
                buffer,
            })
        }
        (Receiving { image_id, filename, format, processing_type, capacity, mut buffer }, ImageChunk) => {
            let len = header.length as usize;
            if buffer.len() + len > capacity {
                logger.log("IMAGE_CHUNK would overflow declared total_size; closing connection");
                return None;
            }
            let chunk = read_payload(conn, header.length).ok()?;
            buffer.extend_from_slice(&chunk);
            Some(Receiving { image_id, filename, format, processing_type, capacity, buffer })
        }
        (Receiving { image_id, filename, format, processing_type, capacity, buffer }, ImageComplete) => {
            if buffer.len() != capacity {
                logger.log("IMAGE_COMPLETE received before buffer was fully filled; closing connection");
                return None;
            }
            let payload = read_bounded_payload(conn, header.length, MAX_CONTROL_PAYLOAD_LEN).ok()?;
            let final_format = parse_format_override(&payload).unwrap_or(format);

            let job = ProcessingJob {
                data: buffer,
                image_id: image_id.clone(),
                filename,
                format: final_format,
                processing_type,
                total_size: capacity as u32,
            };

            match scheduler.enqueue(job) {
                Ok(()) => {
                    // The client's receipt of ACK is the server's
                    // commitment to the image: it is only sent once the
                    // buffer has been handed to the scheduler.
                    let _ = send_ack(conn, &image_id);
                    None
                }
                Err(_job) => {
                    logger.log("Scheduler is shutting down; dropping completed image, no ACK sent");
                    None
                }
            }
        }
        _ => {
            // Every other (state, message) pair closes the connection per
            // the connection handler's transition table.
            None
        }
    }
}

fn read_payload(conn: &mut Connection, length: u32) -> Result<Vec<u8>> {
    match conn.recv_exact(length as usize)? {
        RecvOutcome::Ok(bytes) => Ok(bytes),
        RecvOutcome::Eof => bail!("peer closed the connection before sending a declared payload"),
    }
}

/// Like `read_payload`, but rejects the frame outright when its declared
/// `length` exceeds `max` instead of allocating a buffer of that size.
/// Used for every frame whose payload is a small fixed-purpose string or
/// is never expected to carry a payload at all.
fn read_bounded_payload(conn: &mut Connection, length: u32, max: u32) -> Result<Vec<u8>> {
    if length > max {
        bail!("payload length {} exceeds the {}-byte bound for this frame", length, max);
    }
    read_payload(conn, length)
}

fn send_id_response(conn: &mut Connection, image_id: &str) -> Result<()> {
    conn.send_header(&MessageHeader::new(MessageType::ImageIdResponse, 0, image_id))
}

fn send_ack(conn: &mut Connection, image_id: &str) -> Result<()> {
    conn.send_header(&MessageHeader::new(MessageType::Ack, 0, image_id))
}

/// `IMAGE_COMPLETE`'s payload is the format as a zero-terminated ASCII
/// string; empty or absent falls back to the format declared in
/// `IMAGE_INFO`.
fn parse_format_override(payload: &[u8]) -> Option<String> {
    if payload.is_empty() {
        return None;
    }
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    if end == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&payload[..end]).into_owned())
}
