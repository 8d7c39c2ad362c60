use bytes::Bytes;

/// One parsed server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSentEvent {
    pub id: Option<String>,
    pub event_type: Option<String>,
    pub data: String,
}

/// Splits a raw byte stream into complete SSE messages.
///
/// Boundaries are blank lines in any of the three line-ending conventions
/// (`\n\n`, `\r\n\r\n`, `\r\r`). Bytes are buffered until a boundary is seen, so
/// chunks split inside a line or inside a multi-byte character are safe.
/// Emitted messages have every line ending normalized to `\n` and carry no
/// trailing boundary.
#[derive(Debug, Default)]
pub struct SseFramer {
    buffer: Vec<u8>,
    scanned: usize,
}

const BOUNDARIES: [&[u8]; 3] = [b"\r\n\r\n", b"\n\n", b"\r\r"];
const LONGEST_BOUNDARY: usize = 4;

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<String> {
        self.push(chunk.as_ref())
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();

        while let Some((start, len)) = self.next_boundary() {
            let rest = self.buffer.split_off(start + len);
            let mut message = std::mem::replace(&mut self.buffer, rest);
            message.truncate(start);
            self.scanned = 0;
            if let Some(message) = normalize_message(&message) {
                messages.push(message);
            }
        }

        // A boundary may straddle the next chunk; rescan the tail only.
        self.scanned = self.buffer.len().saturating_sub(LONGEST_BOUNDARY - 1);
        messages
    }

    /// Flushes whatever is left once the upstream has closed.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        normalize_message(&rest)
    }

    pub fn has_pending(&self) -> bool {
        self.buffer.iter().any(|b| !b.is_ascii_whitespace())
    }

    fn next_boundary(&self) -> Option<(usize, usize)> {
        let haystack = &self.buffer[self.scanned..];
        let mut best: Option<(usize, usize)> = None;
        for boundary in BOUNDARIES {
            if let Some(pos) = find(haystack, boundary) {
                let candidate = (self.scanned + pos, boundary.len());
                best = match best {
                    Some(current) if current.0 <= candidate.0 => Some(current),
                    _ => Some(candidate),
                };
            }
        }
        best
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn normalize_message(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let trimmed = text.trim_matches('\n');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl ServerSentEvent {
    /// Parses one framed message. Comment lines and unknown fields are ignored;
    /// repeated `data` lines are joined with `\n`.
    pub fn parse(message: &str) -> Self {
        let mut event = ServerSentEvent::default();
        let mut data_lines: Vec<&str> = Vec::new();

        for line in message.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "data" => data_lines.push(value),
                "event" => event.event_type = Some(value.to_string()),
                "id" => event.id = Some(value.to_string()),
                _ => {}
            }
        }

        event.data = data_lines.join("\n");
        event
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        out.push_str(&encode_sse(self.event_type.as_deref(), &self.data));
        out
    }
}

/// True when a framed message carries nothing but comments (keep-alive pings).
pub fn is_comment_only(message: &str) -> bool {
    message
        .lines()
        .all(|line| line.is_empty() || line.starts_with(':'))
}

pub fn encode_sse(event: Option<&str>, data: &str) -> String {
    let mut out = String::new();
    if let Some(event) = event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

pub fn encode_comment(text: &str) -> String {
    format!(": {text}\n\n")
}

pub const OPENAI_DONE_FRAME: &str = "data: [DONE]\n\n";
