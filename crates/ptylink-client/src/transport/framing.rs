//! Line reassembly for stream transports.
//!
//! Socket and stdio transports receive arbitrary read chunks; this reader
//! stitches them back into newline-terminated frames with a hard size cap
//! so a misbehaving peer cannot balloon memory.

use std::io::{Error, ErrorKind};

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Read one newline-terminated line into `buf`, consuming at most
/// `max_size` bytes.
///
/// Returns the number of bytes consumed; 0 means EOF with nothing pending.
/// Bytes received before an EOF without a newline are still appended, so
/// the final unterminated frame of a dying peer is not lost. UTF-8 is
/// validated once over the whole frame, not per read chunk, so multi-byte
/// characters may straddle chunk boundaries.
pub(crate) async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut String,
    max_size: usize,
) -> std::io::Result<usize> {
    let mut bytes = Vec::new();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            // EOF; flush whatever arrived before it
            break;
        }

        let newline = available.iter().position(|&b| b == b'\n');
        let take = newline.map_or(available.len(), |pos| pos + 1);

        if bytes.len() + take > max_size {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("frame exceeded {} byte limit", max_size),
            ));
        }

        bytes.extend_from_slice(&available[..take]);
        reader.consume(take);

        if newline.is_some() {
            break;
        }
    }

    let line = std::str::from_utf8(&bytes).map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
    buf.push_str(line);
    Ok(bytes.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_reads_single_line() {
        let cursor = std::io::Cursor::new(b"{\"type\":\"hello\"}\nrest".to_vec());
        let mut reader = BufReader::new(cursor);
        let mut buf = String::new();

        let n = read_line_bounded(&mut reader, &mut buf, 1024).await.unwrap();
        assert_eq!(buf, "{\"type\":\"hello\"}\n");
        assert_eq!(n, buf.len());
    }

    #[tokio::test]
    async fn test_handles_utf8_across_chunks() {
        let data = "hello 世界\n".as_bytes().to_vec();
        let cursor = std::io::Cursor::new(data);
        // One-byte buffer forces multi-byte characters to straddle reads
        let mut reader = BufReader::with_capacity(1, cursor);
        let mut buf = String::new();

        let n = read_line_bounded(&mut reader, &mut buf, 1024).await.unwrap();
        assert!(n > 0);
        assert_eq!(buf, "hello 世界\n");
    }

    #[tokio::test]
    async fn test_eof_returns_zero() {
        let cursor = std::io::Cursor::new(Vec::new());
        let mut reader = BufReader::new(cursor);
        let mut buf = String::new();

        let n = read_line_bounded(&mut reader, &mut buf, 1024).await.unwrap();
        assert_eq!(n, 0);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_eof_flushes_unterminated_tail() {
        let cursor = std::io::Cursor::new(b"partial frame".to_vec());
        let mut reader = BufReader::new(cursor);
        let mut buf = String::new();

        let n = read_line_bounded(&mut reader, &mut buf, 1024).await.unwrap();
        assert_eq!(buf, "partial frame");
        assert_eq!(n, buf.len());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let cursor = std::io::Cursor::new(vec![b'x'; 64]);
        let mut reader = BufReader::new(cursor);
        let mut buf = String::new();

        let err = read_line_bounded(&mut reader, &mut buf, 16)
            .await
            .expect_err("frame over the cap must error");
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
