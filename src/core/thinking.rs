//! Incremental separation of inline `<think>` blocks from visible text.

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SplitChunk {
    pub visible: String,
    pub reasoning: String,
}

impl SplitChunk {
    pub fn is_empty(&self) -> bool {
        self.visible.is_empty() && self.reasoning.is_empty()
    }
}

/// Streaming splitter for content that may wrap reasoning in
/// `<think>...</think>`.
///
/// Tags may straddle chunk boundaries. Text that could be the start of a tag
/// is held back until the next chunk disambiguates it, so visible output
/// never contains a partial tag.
#[derive(Debug, Default)]
pub struct ThinkingSplitter {
    pending: String,
    in_thinking: bool,
}

impl ThinkingSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> SplitChunk {
        self.pending.push_str(chunk);
        let mut out = SplitChunk::default();

        loop {
            let tag = if self.in_thinking { CLOSE_TAG } else { OPEN_TAG };
            if let Some(position) = self.pending.find(tag) {
                let before: String = self.pending.drain(..position).collect();
                self.pending.drain(..tag.len());
                self.emit(&before, &mut out);
                self.in_thinking = !self.in_thinking;
                continue;
            }

            let keep = partial_tag_suffix(&self.pending, tag);
            let split_at = self.pending.len() - keep;
            let ready: String = self.pending.drain(..split_at).collect();
            self.emit(&ready, &mut out);
            break;
        }

        out
    }

    /// Flushes held-back text once the stream has ended.
    ///
    /// An unterminated `<think>` block is treated as reasoning.
    pub fn finish(&mut self) -> SplitChunk {
        let rest = std::mem::take(&mut self.pending);
        let mut out = SplitChunk::default();
        self.emit(&rest, &mut out);
        out
    }

    fn emit(&self, text: &str, out: &mut SplitChunk) {
        if self.in_thinking {
            out.reasoning.push_str(text);
        } else {
            out.visible.push_str(text);
        }
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`.
fn partial_tag_suffix(text: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|len| text.ends_with(&tag[..*len]))
        .unwrap_or(0)
}
