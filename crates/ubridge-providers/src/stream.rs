use ubridge_core::types::FinishReason;

/// Events emitted while draining a provider's streaming response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental text content from the model.
    TextDelta { text: String },

    /// Model wants to call a tool.
    ToolUse {
        id: String,
        name: String,
        args: serde_json::Value,
    },

    /// Stream completed.
    Done {
        model: String,
        tokens_in: u32,
        tokens_out: u32,
        finish_reason: FinishReason,
    },

    /// Error during streaming.
    Error { message: String },
}

/// Reassembles lines from an HTTP byte stream.
///
/// Provider streams (SSE and NDJSON alike) are line-oriented, but reqwest
/// chunks split anywhere, including inside a multi-byte character. Bytes
/// accumulate here until a newline lands; only complete lines are decoded,
/// so a split UTF-8 sequence is never fed to the parser.
#[derive(Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb one chunk and return the lines it completed, CR/LF stripped.
    /// Lines that are not valid UTF-8 are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Ok(text) = String::from_utf8(line) {
                lines.push(text);
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_split_across_chunks_reassemble() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"data: {\"a\"").is_empty());
        let lines = buf.push(b":1}\ndata: ");
        assert_eq!(lines, ["data: {\"a\":1}"]);
        assert_eq!(buf.push(b"[DONE]\n"), ["data: [DONE]"]);
    }

    #[test]
    fn crlf_and_blank_lines_are_preserved_as_content() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"first\r\n\r\nsecond\n");
        assert_eq!(lines, ["first", "", "second"]);
    }

    #[test]
    fn multibyte_chars_survive_chunk_splits() {
        let text = "déjà vu\n".as_bytes();
        let mut buf = LineBuffer::new();
        // Split inside the two-byte 'é'.
        assert!(buf.push(&text[..2]).is_empty());
        assert_eq!(buf.push(&text[2..]), ["déjà vu"]);
    }

    #[test]
    fn trailing_partial_line_stays_buffered() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"no newline yet").is_empty());
        assert_eq!(buf.push(b" done\n"), ["no newline yet done"]);
    }
}
