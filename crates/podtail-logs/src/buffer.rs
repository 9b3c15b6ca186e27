use podtail_types::{Event, EventSource};

const DELIMITER: u8 = b'\n';

/// Splits an arbitrarily chunked byte stream into line events
///
/// Bytes after the last delimiter are held until a later chunk completes
/// the line; a partial line is never emitted on its own.
pub struct LineBuffer {
    source: EventSource,
    partial: Vec<u8>,
}

impl LineBuffer {
    pub fn new(source: EventSource) -> Self {
        Self {
            source,
            partial: Vec::new(),
        }
    }

    /// Append `chunk` and return every line it completes, in order
    pub fn process(&mut self, chunk: &[u8]) -> Vec<Event> {
        let mut events = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == DELIMITER) {
            let mut line = std::mem::take(&mut self.partial);
            line.extend_from_slice(&rest[..pos]);
            events.push(Event::new(self.source.clone(), line));
            rest = &rest[pos + 1..];
        }

        self.partial.extend_from_slice(rest);
        events
    }

    /// Bytes buffered for the current incomplete line
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}
