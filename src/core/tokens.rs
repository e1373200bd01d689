//! Token estimation.
//!
//! Counts are a deterministic heuristic over Unicode word boundaries. They are
//! used for per-conversation bookkeeping, not for enforcing provider limits,
//! so stability matters more than exactness: the same text and model always
//! produce the same count.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

use crate::api::ChatMessage;

/// Fixed cost charged per chat message for role and framing tokens.
pub const MESSAGE_OVERHEAD_TOKENS: u64 = 4;
/// Fixed cost charged once per request for priming the assistant reply.
pub const REPLY_PRIMING_TOKENS: u64 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: Self) -> Self::Output {
        TokenUsage {
            input_tokens: self.input_tokens.saturating_add(rhs.input_tokens),
            output_tokens: self.output_tokens.saturating_add(rhs.output_tokens),
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Average characters per token for a model family.
fn chars_per_token(model: &str) -> usize {
    let model = model.to_ascii_lowercase();
    let denser_vocab = ["claude", "llama", "mistral", "qwen"];
    if denser_vocab.iter().any(|family| model.contains(family)) {
        3
    } else {
        4
    }
}

fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x3040..=0x30FF      // Hiragana, Katakana
        | 0x3400..=0x4DBF    // CJK Extension A
        | 0x4E00..=0x9FFF    // CJK Unified Ideographs
        | 0xAC00..=0xD7AF    // Hangul syllables
        | 0xF900..=0xFAFF    // CJK compatibility ideographs
        | 0x20000..=0x2FFFF)
}

/// Estimates the number of tokens `text` costs for `model`.
pub fn count_tokens(text: &str, model: &str) -> u64 {
    let divisor = chars_per_token(model);
    let mut total = 0u64;

    for segment in text.split_word_bounds() {
        if segment.chars().all(char::is_whitespace) {
            continue;
        }

        let cjk = segment.chars().filter(|ch| is_cjk(*ch)).count();
        let other = segment
            .chars()
            .filter(|ch| !is_cjk(*ch) && !ch.is_whitespace())
            .count();

        total += cjk as u64;
        if other == 0 {
            continue;
        }
        if segment.chars().any(char::is_alphanumeric) {
            total += other.div_ceil(divisor) as u64;
        } else {
            // Punctuation and symbols: roughly one token per grapheme.
            total += segment.graphemes(true).count() as u64;
        }
    }

    total
}

/// Input-side cost of a rendered chat request.
pub fn count_message_tokens(messages: &[ChatMessage], model: &str) -> u64 {
    if messages.is_empty() {
        return 0;
    }
    let body: u64 = messages
        .iter()
        .map(|message| MESSAGE_OVERHEAD_TOKENS + count_tokens(&message.content, model))
        .sum();
    body + REPLY_PRIMING_TOKENS
}

/// Token usage for one completion.
///
/// `prompt` is an optional system/template preamble that is sent ahead of
/// `messages`. The function is pure: the same triple always yields the same
/// counts.
pub fn account(
    prompt: Option<&str>,
    messages: &[ChatMessage],
    completion: &str,
    model: &str,
) -> TokenUsage {
    let prompt_tokens = prompt
        .filter(|text| !text.is_empty())
        .map(|text| MESSAGE_OVERHEAD_TOKENS + count_tokens(text, model))
        .unwrap_or(0);
    let input_tokens = prompt_tokens + count_message_tokens(messages, model);
    TokenUsage::new(input_tokens, count_tokens(completion, model))
}
