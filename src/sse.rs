//! Server-sent-event framing over an async reader.
//!
//! Blocks are delimited by blank lines; a block may span multiple `data:`
//! lines. The reader never buffers more than one block and enforces line
//! and block size limits so a misbehaving upstream cannot balloon memory.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

#[derive(Clone, Copy, Debug)]
pub struct SseLimits {
    pub max_line_bytes: usize,
    pub max_block_bytes: usize,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 256 * 1024,
            max_block_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Reads SSE blocks one at a time. Returned blocks keep their raw lines
/// (with line terminators) but not the trailing blank line.
pub struct SseBlockReader<R> {
    reader: R,
    limits: SseLimits,
    line: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> SseBlockReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            limits: SseLimits::default(),
            line: Vec::new(),
        }
    }

    /// Next block, or `None` at end of stream. A final unterminated block
    /// is returned before `None`.
    pub async fn next_block(&mut self) -> std::io::Result<Option<String>> {
        let mut block = String::new();
        loop {
            let has_line = self.read_line().await?;
            if !has_line {
                if block.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(block));
            }

            let line = std::str::from_utf8(&self.line).map_err(|err| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid SSE UTF-8: {err}"),
                )
            })?;

            if line.trim_end_matches(['\r', '\n']).is_empty() {
                if block.is_empty() {
                    continue;
                }
                return Ok(Some(block));
            }

            if block.len().saturating_add(line.len()) > self.limits.max_block_bytes {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "SSE block exceeds max_block_bytes={}",
                        self.limits.max_block_bytes
                    ),
                ));
            }
            block.push_str(line);
        }
    }

    async fn read_line(&mut self) -> std::io::Result<bool> {
        self.line.clear();
        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                return Ok(!self.line.is_empty());
            }

            let newline_pos = buf.iter().position(|b| *b == b'\n');
            let take_len = newline_pos.map(|pos| pos + 1).unwrap_or(buf.len());

            if self.line.len().saturating_add(take_len) > self.limits.max_line_bytes {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "SSE line exceeds max_line_bytes={}",
                        self.limits.max_line_bytes
                    ),
                ));
            }

            self.line.extend_from_slice(&buf[..take_len]);
            self.reader.consume(take_len);

            if newline_pos.is_some() {
                return Ok(true);
            }
        }
    }
}

/// Joins the payloads of a block's `data:` lines.
pub fn extract_sse_data(block: &str) -> String {
    let mut data_lines = Vec::<&str>::new();
    for line in block.split('\n') {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim());
        }
    }
    data_lines.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn blocks(input: &str) -> Vec<String> {
        let mut reader = SseBlockReader::new(input.as_bytes());
        let mut out = Vec::new();
        while let Some(block) = reader.next_block().await.unwrap() {
            out.push(block);
        }
        out
    }

    #[tokio::test]
    async fn splits_on_blank_lines() {
        let out = blocks("data: one\n\ndata: two\n\n").await;
        assert_eq!(out, vec!["data: one\n", "data: two\n"]);
    }

    #[tokio::test]
    async fn returns_trailing_unterminated_block() {
        let out = blocks("data: tail").await;
        assert_eq!(out, vec!["data: tail"]);
    }

    #[tokio::test]
    async fn skips_leading_blank_lines() {
        let out = blocks("\n\ndata: x\n\n").await;
        assert_eq!(out, vec!["data: x\n"]);
    }

    #[tokio::test]
    async fn keeps_event_lines_inside_block() {
        let out = blocks("event: message_start\ndata: {}\n\n").await;
        assert_eq!(out, vec!["event: message_start\ndata: {}\n"]);
    }

    #[test]
    fn data_extraction_joins_multiline_payloads() {
        assert_eq!(extract_sse_data("data: a\ndata: b\n"), "a\nb");
        assert_eq!(extract_sse_data("event: ping\ndata: {\"x\":1}\n"), "{\"x\":1}");
        assert_eq!(extract_sse_data(": comment\n"), "");
        assert_eq!(extract_sse_data("data: [DONE]\n"), "[DONE]");
    }
}
