/// Default cap on retained screen output per session, in characters.
pub const DEFAULT_MAX_SCREEN_CHARS: usize = 50_000;

/// Recent terminal output for one session, capped at `capacity` characters.
///
/// Appends past the cap drop the oldest characters, so a late-joining client
/// can be handed the tail of the session instead of a blank screen.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    text: String,
    chars: usize,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            text: String::new(),
            chars: 0,
            capacity,
        }
    }

    pub fn append(&mut self, chunk: &str) {
        let incoming = chunk.chars().count();
        if incoming >= self.capacity {
            let skip = incoming - self.capacity;
            self.text = chunk.chars().skip(skip).collect();
            self.chars = self.capacity;
            return;
        }

        self.text.push_str(chunk);
        self.chars += incoming;

        if self.chars > self.capacity {
            let excess = self.chars - self.capacity;
            let cut = self
                .text
                .char_indices()
                .nth(excess)
                .map_or(self.text.len(), |(idx, _)| idx);
            self.text.drain(..cut);
            self.chars = self.capacity;
        }
    }

    pub fn snapshot(&self) -> &str {
        &self.text
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.chars
    }

    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SCREEN_CHARS)
    }
}
