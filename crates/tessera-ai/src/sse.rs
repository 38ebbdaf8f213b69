//! Incremental `text/event-stream` decoding.

/// One decoded frame's joined `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Data(String),
    Done,
}

/// Frame decoder fed with arbitrary byte slices as they arrive.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    /// Prefix of `pending` already known to hold no newline.
    scanned: usize,
    data_lines: Vec<String>,
    finished: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a `[DONE]` sentinel has been seen. Later input is ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed bytes and drain every frame completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if self.finished {
            return frames;
        }
        self.pending.extend_from_slice(bytes);

        let buffer = std::mem::take(&mut self.pending);
        let mut line_start = 0;
        let mut cursor = self.scanned;
        while let Some(offset) = buffer[cursor..].iter().position(|byte| *byte == b'\n') {
            let newline = cursor + offset;
            let line = String::from_utf8_lossy(&buffer[line_start..newline]);
            let frame = self.accept_line(line.trim_end_matches('\r'));
            line_start = newline + 1;
            cursor = line_start;
            if let Some(frame) = frame {
                let done = frame == SseFrame::Done;
                frames.push(frame);
                if done {
                    self.finished = true;
                    self.scanned = 0;
                    return frames;
                }
            }
        }

        self.pending = if line_start == 0 {
            buffer
        } else {
            buffer[line_start..].to_vec()
        };
        self.scanned = self.pending.len();
        frames
    }

    /// Flush a trailing frame not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if self.finished {
            return None;
        }
        if !self.pending.is_empty() {
            let raw = std::mem::take(&mut self.pending);
            self.scanned = 0;
            let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
            if let Some(frame) = self.accept_line(&line) {
                return Some(frame);
            }
        }
        self.finished = true;
        self.emit()
    }

    fn accept_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.emit();
        }
        if let Some(data) = line.strip_prefix("data:") {
            self.data_lines
                .push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
        None
    }

    fn emit(&mut self) -> Option<SseFrame> {
        if self.data_lines.is_empty() {
            return None;
        }
        let data = self.data_lines.join("\n");
        self.data_lines.clear();
        if data.trim() == "[DONE]" {
            Some(SseFrame::Done)
        } else if data.trim().is_empty() {
            None
        } else {
            Some(SseFrame::Data(data))
        }
    }
}
