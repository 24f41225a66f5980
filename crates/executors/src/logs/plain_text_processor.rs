//! Clusters plain-text streams into normalized entries using size and
//! time-gap heuristics. Used for executor stderr and for line-oriented
//! agents with no structured output format.

use std::time::{Duration, Instant};

use bon::bon;
use json_patch::Patch;

use super::{
    NormalizedEntry,
    utils::{ConversationPatch, EntryIndexProvider},
};

/// Buffer collecting streamed text into lines. Complete lines keep their
/// trailing newline; at most one trailing partial line is held.
#[derive(Debug, Default)]
struct PlainTextBuffer {
    lines: Vec<String>,
    total_len: usize,
}

impl PlainTextBuffer {
    fn ingest(&mut self, text_chunk: String) {
        debug_assert!(!text_chunk.is_empty());

        let current_partial = if self.lines.last().is_some_and(|l| !l.ends_with('\n')) {
            let partial = self.lines.pop().unwrap();
            self.total_len = self.total_len.saturating_sub(partial.len());
            partial
        } else {
            String::new()
        };

        let combined = current_partial + &text_chunk;
        let size = combined.len();
        self.lines
            .extend(combined.split_inclusive('\n').map(ToString::to_string));
        self.total_len += size;
    }

    fn drain_lines(&mut self, n: usize) -> Vec<String> {
        let n = n.min(self.lines.len());
        let drained: Vec<String> = self.lines.drain(..n).collect();
        for line in &drained {
            self.total_len = self.total_len.saturating_sub(line.len());
        }
        drained
    }

    fn drain_size(&mut self, len: usize) -> Vec<String> {
        let mut drained_len = 0;
        let mut lines_to_drain = 0;
        for line in &self.lines {
            if drained_len >= len && lines_to_drain > 0 {
                break;
            }
            drained_len += line.len();
            lines_to_drain += 1;
        }
        self.drain_lines(lines_to_drain)
    }

    fn flush(&mut self) -> Vec<String> {
        let result = self.lines.drain(..).collect();
        self.total_len = 0;
        result
    }

    fn lines(&self) -> &[String] {
        &self.lines
    }

    fn total_len(&self) -> usize {
        self.total_len
    }

    fn is_empty(&self) -> bool {
        self.total_len == 0
    }
}

pub type NormalizedEntryProducerFn = Box<dyn Fn(String) -> NormalizedEntry + Send + 'static>;

/// Plain text log processor with configurable entry splitting. Emits an add
/// patch when a new entry begins and replace patches while it grows.
pub struct PlainTextLogProcessor {
    buffer: PlainTextBuffer,
    index_provider: EntryIndexProvider,
    entry_size_threshold: Option<usize>,
    time_gap: Option<Duration>,
    normalized_entry_producer: NormalizedEntryProducerFn,
    last_chunk_arrival_time: Instant,
    current_entry_index: Option<usize>,
}

impl PlainTextLogProcessor {
    /// Process incoming text and return JSON patches for any entries.
    pub fn process(&mut self, text_chunk: String) -> Vec<Patch> {
        if text_chunk.is_empty() {
            return vec![];
        }

        let mut patches = Vec::new();

        // Content arriving after the configured gap starts a new entry;
        // useful for stderr where bursts belong together.
        if !self.buffer.is_empty()
            && self
                .time_gap
                .is_some_and(|gap| self.last_chunk_arrival_time.elapsed() >= gap)
        {
            let lines = self.buffer.flush();
            if !lines.is_empty() {
                patches.push(self.create_patch(lines));
            }
            self.current_entry_index = None;
        }

        self.last_chunk_arrival_time = Instant::now();
        self.buffer.ingest(text_chunk);

        // Break oversized entries apart.
        if let Some(size_threshold) = self.entry_size_threshold {
            while self.buffer.total_len() >= size_threshold {
                let lines = self.buffer.drain_size(size_threshold);
                if lines.is_empty() {
                    break;
                }
                patches.push(self.create_patch(lines));
                self.current_entry_index = None;
            }
        }

        // Stream the partial entry without consuming the buffer.
        if !self.buffer.is_empty() {
            patches.push(self.create_patch(self.buffer.lines().to_vec()));
        }
        patches
    }

    fn create_patch(&mut self, lines: Vec<String>) -> Patch {
        let content = lines.concat();
        let entry = (self.normalized_entry_producer)(content);

        match self.current_entry_index {
            Some(index) => ConversationPatch::replace(index, entry),
            None => {
                let index = self.index_provider.next();
                self.current_entry_index = Some(index);
                ConversationPatch::add_normalized_entry(index, entry)
            }
        }
    }
}

#[bon]
impl PlainTextLogProcessor {
    /// When both `size_threshold` and `time_gap` are `None`, a default size
    /// threshold of 8 KiB is used.
    #[builder]
    pub fn new(
        normalized_entry_producer: impl Fn(String) -> NormalizedEntry + 'static + Send,
        size_threshold: Option<usize>,
        time_gap: Option<Duration>,
        index_provider: EntryIndexProvider,
    ) -> Self {
        Self {
            buffer: PlainTextBuffer::default(),
            index_provider,
            entry_size_threshold: if size_threshold.is_none() && time_gap.is_none() {
                Some(8 * 1024)
            } else {
                size_threshold
            },
            time_gap,
            normalized_entry_producer: Box::new(normalized_entry_producer),
            last_chunk_arrival_time: Instant::now(),
            current_entry_index: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::NormalizedEntryType;

    fn producer(content: String) -> NormalizedEntry {
        NormalizedEntry {
            timestamp: None,
            entry_type: NormalizedEntryType::SystemMessage,
            content,
            metadata: None,
        }
    }

    #[test]
    fn buffer_keeps_partial_lines() {
        let mut buffer = PlainTextBuffer::default();
        buffer.ingest("line1\npartial".to_string());
        assert_eq!(buffer.lines().len(), 2);

        buffer.ingest(" more\n".to_string());
        assert_eq!(buffer.lines()[1], "partial more\n");
    }

    #[test]
    fn drain_size_takes_whole_lines() {
        let mut buffer = PlainTextBuffer::default();
        buffer.ingest("short\nlonger line\nvery long line here\n".to_string());

        let drained = buffer.drain_size(10);
        assert_eq!(drained, vec!["short\n", "longer line\n"]);
    }

    #[test]
    fn processor_emits_add_then_replace() {
        let mut processor = PlainTextLogProcessor::builder()
            .normalized_entry_producer(producer)
            .index_provider(EntryIndexProvider::new())
            .build();

        let first = processor.process("hello\n".to_string());
        assert_eq!(first.len(), 1);

        // Growth of the same entry arrives as a replace on the same index.
        let second = processor.process("world\n".to_string());
        assert_eq!(second.len(), 1);
        let ops = serde_json::to_value(&second[0]).unwrap();
        assert_eq!(ops[0]["op"], "replace");
    }

    #[test]
    fn size_threshold_splits_entries() {
        let mut processor = PlainTextLogProcessor::builder()
            .normalized_entry_producer(producer)
            .size_threshold(8)
            .index_provider(EntryIndexProvider::new())
            .build();

        let patches = processor.process("aaaaaaaaaa\nbbbbbbbbbb\n".to_string());
        // Two completed entries, no partial remainder
        assert_eq!(patches.len(), 2);
    }
}
