//! Per-connection read loop
//!
//! Registers the connection, reads until the peer closes, the socket fails
//! or the port is removed, then tears the connection down. Failures here
//! stay with this connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::connection::Connection;
use super::log::SessionLog;
use crate::events::OperatorEvent;
use crate::listener::registry::Shared;
use crate::transfer::{receive_file, TransferError, TransferHeader};

/// Serve one accepted socket until it is done
pub(crate) async fn serve_connection(
    shared: Arc<Shared>,
    port: u16,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let (mut reader, writer) = stream.into_split();
    let conn = Arc::new(Connection::new(
        peer,
        port,
        writer,
        shared.config.buffer_limit,
        shared.sink.clone(),
    ));

    if !shared.register(conn.clone()) {
        debug!("Port {} removed before {} was registered", port, peer);
        conn.close().await;
        return;
    }

    info!("Connection received: {} (port {})", peer, port);
    shared
        .sink
        .emit(OperatorEvent::ConnectionOpened { port, peer });

    let log = SessionLog::new(&shared.config.log_dir, port, peer);
    if let Err(e) = read_loop(&shared, &conn, &mut reader, &log).await {
        warn!("Connection {} read error: {}", peer, e);
    }

    // Teardown
    if conn.in_shell_mode() {
        if let Err(e) = conn.stop_shell().await {
            debug!("Shell stop for {} reported: {}", peer, e);
        }
    }
    shared.unregister(&conn);
    conn.close().await;

    info!("Connection closed: {} (port {})", peer, port);
    shared
        .sink
        .emit(OperatorEvent::ConnectionClosed { port, peer });
}

async fn read_loop(
    shared: &Shared,
    conn: &Arc<Connection>,
    reader: &mut OwnedReadHalf,
    log: &SessionLog,
) -> std::io::Result<()> {
    let peer = conn.peer();
    let shutdown = conn.shutdown_token();
    let mut buf = vec![0u8; shared.config.read_chunk_size.max(1)];
    // Incomplete UTF-8 sequence carried over from the previous read
    let mut remainder: Vec<u8> = Vec::new();
    // Start of a transfer control line still waiting for its newline
    let mut held: Vec<u8> = Vec::new();

    while conn.is_active() {
        let n = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Read loop for {} cancelled", peer);
                break;
            }
            result = reader.read(&mut buf) => result?,
        };

        if n == 0 {
            debug!("Peer {} closed the connection", peer);
            break;
        }

        let joined: Vec<u8>;
        let chunk: &[u8] = if held.is_empty() {
            &buf[..n]
        } else {
            held.extend_from_slice(&buf[..n]);
            joined = std::mem::take(&mut held);
            &joined
        };

        if conn.in_shell_mode() {
            if let Err(e) = conn.shell_command(chunk, true).await {
                warn!("Shell command from {} failed: {}", peer, e);
                if let Err(e) = conn.stop_shell().await {
                    debug!("Shell stop for {} reported: {}", peer, e);
                }
            }
            continue;
        }

        let mut text_bytes = chunk;
        if remainder.is_empty() {
            if TransferHeader::is_incomplete(chunk) {
                held = chunk.to_vec();
                continue;
            }
            match TransferHeader::sniff(chunk) {
                Some(Ok((header, offset))) => {
                    let payload = &chunk[offset..];
                    match receive_inbound(shared, conn, reader, payload, &header, log).await {
                        Inbound::Done(rest) => text_bytes = rest,
                        Inbound::StreamEnded => break,
                    }
                }
                Some(Err(e)) => debug!("Not a transfer header from {}: {}", peer, e),
                None => {}
            }
        }

        handle_text(shared, conn, log, &mut remainder, text_bytes).await;
    }

    if !held.is_empty() {
        handle_text(shared, conn, log, &mut remainder, &held).await;
    }

    Ok(())
}

/// Buffer, show and log received text, carrying an incomplete UTF-8
/// sequence over to the next read
async fn handle_text(
    shared: &Shared,
    conn: &Connection,
    log: &SessionLog,
    remainder: &mut Vec<u8>,
    bytes: &[u8],
) {
    if bytes.is_empty() {
        return;
    }

    let mut to_decode = std::mem::take(remainder);
    to_decode.extend_from_slice(bytes);

    let safe_end = find_utf8_safe_boundary(&to_decode);
    if safe_end < to_decode.len() {
        *remainder = to_decode[safe_end..].to_vec();
        to_decode.truncate(safe_end);
    }
    if to_decode.is_empty() {
        return;
    }

    let peer = conn.peer();
    match String::from_utf8(to_decode) {
        Ok(text) => {
            shared.deliver(conn, text.clone());
            if let Err(e) = log.append(&text).await {
                warn!("Failed to write session log {:?}: {}", log.path(), e);
            }
        }
        Err(e) => {
            let bytes = e.as_bytes().len();
            warn!("Binary data received and skipped: {} ({} bytes)", peer, bytes);
            shared.sink.emit(OperatorEvent::BinarySkipped {
                port: conn.port(),
                peer,
                bytes,
            });
        }
    }
}

enum Inbound<'a> {
    /// Bytes of the chunk past the payload
    Done(&'a [u8]),
    StreamEnded,
}

/// Receive a file whose header was found at the start of a chunk.
///
/// `payload` holds the bytes already read past the header; the rest comes
/// from the socket.
async fn receive_inbound<'a>(
    shared: &Shared,
    conn: &Connection,
    reader: &mut OwnedReadHalf,
    payload: &'a [u8],
    header: &TransferHeader,
    log: &SessionLog,
) -> Inbound<'a> {
    let peer = conn.peer();
    info!(
        "Receiving file {:?} from {} ({} encoded bytes)",
        header.filename, peer, header.encoded_len
    );

    let shutdown = conn.shutdown_token();
    let mut source = payload.chain(&mut *reader);
    let received = tokio::select! {
        _ = shutdown.cancelled() => None,
        result = receive_file(
            &mut source,
            &header.filename,
            header.encoded_len,
            &shared.config.downloads_dir,
        ) => Some(result),
    };
    let Some(result) = received else {
        debug!("Transfer of {:?} from {} cancelled", header.filename, peer);
        return Inbound::StreamEnded;
    };
    let (rest, _) = source.into_inner();

    let record = match result {
        Ok(path) => {
            let record = format!("File received: {}", path.display());
            shared
                .sink
                .emit(OperatorEvent::FileReceived { peer, path });
            record
        }
        Err(e) => {
            warn!("File transfer from {} failed: {}", peer, e);
            let record = format!("File transfer failed: {}", e);
            let ended = matches!(e, TransferError::Truncated { .. });
            shared.sink.emit(OperatorEvent::FileReceiveFailed {
                peer,
                error: e.to_string(),
            });
            if ended {
                if let Err(e) = log.append(&record).await {
                    warn!("Failed to write session log {:?}: {}", log.path(), e);
                }
                return Inbound::StreamEnded;
            }
            record
        }
    };

    if let Err(e) = log.append(&record).await {
        warn!("Failed to write session log {:?}: {}", log.path(), e);
    }
    Inbound::Done(rest)
}

/// Find the largest prefix of `buf` that does not end inside a multi-byte
/// UTF-8 character.
fn find_utf8_safe_boundary(buf: &[u8]) -> usize {
    let mut i = buf.len();

    // A UTF-8 character is at most 4 bytes
    while i > 0 && i > buf.len().saturating_sub(4) {
        let byte = buf[i - 1];

        // ASCII; anything after it would be orphaned continuation bytes
        if byte & 0x80 == 0 {
            return buf.len();
        }

        // Continuation byte (10xxxxxx)
        if byte & 0xC0 == 0x80 {
            i -= 1;
            continue;
        }

        let char_len = if byte & 0xF8 == 0xF0 {
            4
        } else if byte & 0xF0 == 0xE0 {
            3
        } else if byte & 0xE0 == 0xC0 {
            2
        } else {
            // Not a valid start byte; let the decoder reject it
            return buf.len();
        };

        let start = i - 1;
        return if buf.len() - start >= char_len {
            buf.len()
        } else {
            start
        };
    }

    buf.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf8_boundary_ascii() {
        assert_eq!(find_utf8_safe_boundary(b"hello"), 5);
        assert_eq!(find_utf8_safe_boundary(b""), 0);
    }

    #[test]
    fn test_utf8_boundary_complete() {
        assert_eq!(find_utf8_safe_boundary("héllo wörld".as_bytes()), 13);
        assert_eq!(find_utf8_safe_boundary("日本".as_bytes()), 6);
    }

    #[test]
    fn test_utf8_boundary_split_character() {
        // "日" is E6 97 A5
        let data: &[u8] = &[b'a', 0xE6, 0x97];
        assert_eq!(find_utf8_safe_boundary(data), 1);

        // Incomplete emoji
        let data: &[u8] = &[0xF0, 0x9F, 0x98];
        assert_eq!(find_utf8_safe_boundary(data), 0);
    }

    #[test]
    fn test_utf8_boundary_leaves_invalid_bytes_to_decoder() {
        let data: &[u8] = &[0xFF, 0xFE, 0x00, 0x9F];
        assert_eq!(find_utf8_safe_boundary(data), data.len());

        // Lead byte followed by too many continuation bytes
        let data: &[u8] = &[0xC3, 0xA9, 0xA9];
        assert_eq!(find_utf8_safe_boundary(data), data.len());
    }
}
