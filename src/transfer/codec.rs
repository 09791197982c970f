//! Transfer header framing and the send/receive halves of the protocol

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Control line prefix
pub const FILE_TRANSFER_PREFIX: &str = "FILE_TRANSFER:";

/// Longest control line accepted when sniffing an inbound chunk
const MAX_HEADER_LEN: usize = 4096;

/// Error type for file transfer operations
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("Malformed transfer header: {0}")]
    MalformedHeader(String),

    #[error("Transfer truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    #[error("Base64 decode error: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed `FILE_TRANSFER` control line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    pub filename: String,
    /// Length of the base64 payload that follows, in bytes
    pub encoded_len: usize,
}

impl TransferHeader {
    pub fn new(filename: impl Into<String>, encoded_len: usize) -> Self {
        Self {
            filename: filename.into(),
            encoded_len,
        }
    }

    /// Render the control line, including the terminating newline
    pub fn encode(&self) -> String {
        format!("{}{}:{}\n", FILE_TRANSFER_PREFIX, self.filename, self.encoded_len)
    }

    /// Parse a control line. The trailing newline is optional.
    ///
    /// The length is the last `:`-separated field, so file names may
    /// themselves contain colons.
    pub fn parse(line: &str) -> Result<Self, TransferError> {
        let line = line.trim_end_matches(['\n', '\r']);
        let rest = line
            .strip_prefix(FILE_TRANSFER_PREFIX)
            .ok_or_else(|| TransferError::MalformedHeader(line.to_string()))?;
        let (filename, len) = rest
            .rsplit_once(':')
            .ok_or_else(|| TransferError::MalformedHeader(line.to_string()))?;
        if filename.is_empty() {
            return Err(TransferError::MalformedHeader(line.to_string()));
        }
        let encoded_len = len
            .trim()
            .parse::<usize>()
            .map_err(|_| TransferError::MalformedHeader(line.to_string()))?;
        Ok(Self::new(filename, encoded_len))
    }

    /// Look for a control line at the start of a received chunk.
    ///
    /// Returns `None` when the chunk is not a transfer, otherwise the parse
    /// result together with the offset of the first payload byte.
    pub fn sniff(chunk: &[u8]) -> Option<Result<(Self, usize), TransferError>> {
        if !chunk.starts_with(FILE_TRANSFER_PREFIX.as_bytes()) {
            return None;
        }
        let newline = chunk
            .iter()
            .take(MAX_HEADER_LEN)
            .position(|&b| b == b'\n')?;
        let line = match std::str::from_utf8(&chunk[..newline]) {
            Ok(line) => line,
            Err(_) => {
                return Some(Err(TransferError::MalformedHeader(
                    String::from_utf8_lossy(&chunk[..newline]).into_owned(),
                )))
            }
        };
        Some(Self::parse(line).map(|header| (header, newline + 1)))
    }

    /// Whether `chunk` may be the start of a control line whose newline has
    /// not arrived yet
    pub fn is_incomplete(chunk: &[u8]) -> bool {
        let prefix = FILE_TRANSFER_PREFIX.as_bytes();
        let matches_prefix = if chunk.len() < prefix.len() {
            prefix.starts_with(chunk)
        } else {
            chunk.starts_with(prefix)
        };
        matches_prefix
            && !chunk.is_empty()
            && chunk.len() < MAX_HEADER_LEN
            && !chunk.contains(&b'\n')
    }
}

/// Send a file: control line followed immediately by the base64 payload.
///
/// Returns a human-readable confirmation.
pub async fn send_file<W>(writer: &mut W, path: &Path) -> Result<String, TransferError>
where
    W: AsyncWrite + Unpin,
{
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TransferError::FileNotFound(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TransferError::InvalidFileName(path.display().to_string()))?;

    let encoded = BASE64.encode(&data);
    let header = TransferHeader::new(filename, encoded.len());

    writer.write_all(header.encode().as_bytes()).await?;
    writer.write_all(encoded.as_bytes()).await?;
    writer.flush().await?;

    info!(
        "Sent file {} ({} bytes, {} encoded)",
        filename,
        data.len(),
        encoded.len()
    );
    Ok(format!("File {} sent successfully ({} bytes)", filename, data.len()))
}

/// Receive exactly `size` base64 bytes from `reader`, decode them and write
/// the result to `dir/filename`. An existing file of the same name is
/// overwritten.
///
/// Only the final component of `filename` is used.
pub async fn receive_file<R>(
    reader: &mut R,
    filename: &str,
    size: usize,
    dir: &Path,
) -> Result<PathBuf, TransferError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    // Consume the whole payload before anything can fail so the stream
    // stays framed
    let mut encoded = Vec::new();
    (&mut *reader)
        .take(size as u64)
        .read_to_end(&mut encoded)
        .await?;
    if encoded.len() < size {
        return Err(TransferError::Truncated {
            expected: size,
            received: encoded.len(),
        });
    }

    let name = Path::new(filename)
        .file_name()
        .ok_or_else(|| TransferError::InvalidFileName(filename.to_string()))?;

    let data = BASE64.decode(&encoded)?;

    tokio::fs::create_dir_all(dir).await?;
    let save_path = dir.join(name);
    tokio::fs::write(&save_path, &data).await?;

    debug!("Received {} bytes into {:?}", data.len(), save_path);
    Ok(save_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_header_encode() {
        let header = TransferHeader::new("report.pdf", 128);
        assert_eq!(header.encode(), "FILE_TRANSFER:report.pdf:128\n");
    }

    #[test]
    fn test_header_parse_with_colon_in_name() {
        let header = TransferHeader::parse("FILE_TRANSFER:a:b.txt:12\r\n").unwrap();
        assert_eq!(header.filename, "a:b.txt");
        assert_eq!(header.encoded_len, 12);
    }

    #[test]
    fn test_header_parse_rejects_garbage() {
        assert!(TransferHeader::parse("hello").is_err());
        assert!(TransferHeader::parse("FILE_TRANSFER:name.txt").is_err());
        assert!(TransferHeader::parse("FILE_TRANSFER::12").is_err());
        assert!(TransferHeader::parse("FILE_TRANSFER:x:-1").is_err());
    }

    #[test]
    fn test_sniff() {
        assert!(TransferHeader::sniff(b"just a message\n").is_none());
        // Header without its newline yet is not treated as a transfer
        assert!(TransferHeader::sniff(b"FILE_TRANSFER:a.txt:4").is_none());

        let (header, offset) = TransferHeader::sniff(b"FILE_TRANSFER:a.txt:4\naGk=")
            .unwrap()
            .unwrap();
        assert_eq!(header, TransferHeader::new("a.txt", 4));
        assert_eq!(offset, 22);
    }

    #[tokio::test]
    async fn test_send_then_receive_roundtrip() {
        let temp = tempdir().unwrap();
        let src = temp.path().join("payload.bin");
        let original: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        tokio::fs::write(&src, &original).await.unwrap();

        let mut wire = Vec::new();
        let message = send_file(&mut wire, &src).await.unwrap();
        assert!(message.contains("payload.bin"));

        let (header, offset) = TransferHeader::sniff(&wire).unwrap().unwrap();
        assert_eq!(header.filename, "payload.bin");
        assert_eq!(header.encoded_len, wire.len() - offset);

        let downloads = temp.path().join("downloads");
        let mut payload = &wire[offset..];
        let saved = receive_file(&mut payload, &header.filename, header.encoded_len, &downloads)
            .await
            .unwrap();

        assert_eq!(saved, downloads.join("payload.bin"));
        assert_eq!(tokio::fs::read(&saved).await.unwrap(), original);
    }

    #[tokio::test]
    async fn test_send_missing_file() {
        let temp = tempdir().unwrap();
        let mut wire = Vec::new();
        let result = send_file(&mut wire, &temp.path().join("missing.txt")).await;
        assert!(matches!(result, Err(TransferError::FileNotFound(_))));
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn test_receive_reads_exactly_size() {
        let temp = tempdir().unwrap();
        let mut input: &[u8] = b"aGk=trailing";
        let saved = receive_file(&mut input, "hi.txt", 4, temp.path()).await.unwrap();
        assert_eq!(tokio::fs::read(saved).await.unwrap(), b"hi");
        assert_eq!(input, b"trailing");
    }

    #[tokio::test]
    async fn test_receive_truncated() {
        let temp = tempdir().unwrap();
        let mut input: &[u8] = b"aGk";
        let result = receive_file(&mut input, "hi.txt", 4, temp.path()).await;
        assert!(matches!(
            result,
            Err(TransferError::Truncated {
                expected: 4,
                received: 3
            })
        ));
    }

    #[tokio::test]
    async fn test_receive_overwrites_and_strips_directories() {
        let temp = tempdir().unwrap();
        let mut first: &[u8] = b"b25l";
        receive_file(&mut first, "../../note.txt", 4, temp.path())
            .await
            .unwrap();
        let mut second: &[u8] = b"dHdv";
        let saved = receive_file(&mut second, "note.txt", 4, temp.path())
            .await
            .unwrap();

        assert_eq!(saved, temp.path().join("note.txt"));
        assert_eq!(tokio::fs::read(saved).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_receive_rejects_parent_name() {
        let temp = tempdir().unwrap();
        let mut input: &[u8] = b"aGk=";
        let result = receive_file(&mut input, "..", 4, temp.path()).await;
        assert!(matches!(result, Err(TransferError::InvalidFileName(_))));
    }

    #[tokio::test]
    async fn test_rejected_name_still_consumes_payload() {
        let temp = tempdir().unwrap();
        let mut input: &[u8] = b"aGVsbG8=next\n";
        let result = receive_file(&mut input, "..", 8, temp.path()).await;
        assert!(matches!(result, Err(TransferError::InvalidFileName(_))));
        assert_eq!(input, b"next\n");
    }

    #[test]
    fn test_is_incomplete() {
        assert!(TransferHeader::is_incomplete(b"FILE_TR"));
        assert!(TransferHeader::is_incomplete(b"FILE_TRANSFER:a.txt:"));
        assert!(!TransferHeader::is_incomplete(b""));
        assert!(!TransferHeader::is_incomplete(b"FILE_TRANSFER:a.txt:4\naGk="));
        assert!(!TransferHeader::is_incomplete(b"FILM night\n"));
        assert!(!TransferHeader::is_incomplete(b"hello"));

        let mut long = b"FILE_TRANSFER:".to_vec();
        long.resize(MAX_HEADER_LEN, b'a');
        assert!(!TransferHeader::is_incomplete(&long));
    }
}
