// Incremental decoding of the server-sent-event chat stream
//
// The chat endpoint responds with a newline-delimited stream where payload
// lines carry a `data: ` prefix and the literal `[DONE]` payload marks the
// end of generation. Chunks arrive at arbitrary byte boundaries, so the
// decoder carries both partial UTF-8 sequences and partial lines across
// reads; the decoded output must be identical however the stream is split.

/// Sentinel payload that terminates a stream.
pub(crate) const DONE_SENTINEL: &str = "[DONE]";

/// Extract the payload of an SSE data line. Lines without the `data: `
/// prefix (comments, keep-alives, other fields) carry no payload. An empty
/// remainder is a real, empty payload.
pub(crate) fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data: ")
}

#[derive(Debug, Default)]
pub(crate) struct SseLineDecoder {
    bytes: Vec<u8>,
    text: String,
}

impl SseLineDecoder {
    /// Feed one chunk of raw bytes, returning every line it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.bytes.extend_from_slice(chunk);
        self.decode_pending();
        self.drain_lines()
    }

    /// Flush the trailing partial line once the stream has ended.
    pub fn finish(mut self) -> Option<String> {
        if !self.bytes.is_empty() {
            let tail = String::from_utf8_lossy(&self.bytes).into_owned();
            self.text.push_str(&tail);
            self.bytes.clear();
        }
        if self.text.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.text);
        if line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }

    // Move every decodable byte into the text buffer. A trailing incomplete
    // multi-byte sequence stays buffered until the next chunk; an invalid
    // sequence becomes U+FFFD so a corrupt byte cannot stall the stream.
    fn decode_pending(&mut self) {
        loop {
            match std::str::from_utf8(&self.bytes) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    self.bytes.clear();
                    return;
                }
                Err(err) => {
                    let valid_len = err.valid_up_to();
                    self.text
                        .push_str(&String::from_utf8_lossy(&self.bytes[..valid_len]));
                    match err.error_len() {
                        Some(bad_len) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            self.bytes.drain(..valid_len + bad_len);
                        }
                        None => {
                            self.bytes.drain(..valid_len);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn drain_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(newline_idx) = self.text.find('\n') {
            let mut line: String = self.text.drain(..=newline_idx).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }
}
