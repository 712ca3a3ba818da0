//! Sentence segmentation for streamed response text
//!
//! The response generator produces text in arbitrary fragments. This module
//! keeps one growing buffer and turns it into sentence units suited for one
//! synthesis request each:
//!
//! 1. Split on `.`, `!` or `?` followed by whitespace (or end of input once
//!    the stream is finished).
//! 2. A candidate shorter than `min_sentence_chars` is carried into the next
//!    one, so "Ok." is never synthesized alone.
//! 3. Consecutive short sentences (under `merge_below_chars`) are merged into
//!    one unit until it reaches `target_chars`.
//! 4. While more text is expected, a merged run still under the target is
//!    put back into the buffer, since the next fragment may extend it.
//!
//! Held-back text is always re-parsed from the buffer, so the units produced
//! do not depend on where the fragment boundaries fell.

use crate::config::SegmenterConfig;

/// Streaming sentence segmenter
#[derive(Debug)]
pub struct SentenceSegmenter {
    config: SegmenterConfig,
    buffer: String,
    aborted: bool,
}

impl SentenceSegmenter {
    /// Create an empty segmenter
    #[must_use]
    pub const fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
            aborted: false,
        }
    }

    /// Append a fragment, returning every unit that is now final
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        if self.aborted {
            return Vec::new();
        }
        self.buffer.push_str(fragment);
        self.drain(false)
    }

    /// Flush everything left as final units, regardless of length
    pub fn finish(&mut self) -> Vec<String> {
        if self.aborted {
            return Vec::new();
        }
        self.drain(true)
    }

    /// Discard buffered text; nothing is emitted until [`Self::reset`]
    pub fn abort(&mut self) {
        self.buffer.clear();
        self.aborted = true;
    }

    /// Start a new utterance
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.aborted = false;
    }

    /// Whether [`Self::abort`] was called since the last reset
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Text waiting for more input
    #[must_use]
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    fn drain(&mut self, finalized: bool) -> Vec<String> {
        let buffer = std::mem::take(&mut self.buffer);
        let (candidates, rest) = split_sentences(&buffer, finalized);

        let mut units = Vec::new();
        let mut carry = String::new();
        let mut run = String::new();

        for candidate in candidates {
            let sentence = join(&carry, candidate);
            carry.clear();

            let len = sentence.chars().count();
            if len < self.config.min_sentence_chars {
                carry = sentence;
            } else if len < self.config.merge_below_chars {
                run = join(&run, &sentence);
                if run.chars().count() >= self.config.target_chars {
                    units.push(std::mem::take(&mut run));
                }
            } else {
                if !run.is_empty() {
                    units.push(std::mem::take(&mut run));
                }
                units.push(sentence);
            }
        }

        let held = join(&run, &carry);
        if finalized {
            if !held.is_empty() {
                units.push(held);
            }
        } else {
            self.buffer = held;
            self.buffer.push_str(rest);
        }

        if !units.is_empty() {
            tracing::trace!(
                units = units.len(),
                buffered = self.buffer.len(),
                finalized,
                "sentence units ready"
            );
        }

        units
    }
}

/// Split off complete sentences, returning them trimmed plus the raw remainder
///
/// A boundary is a terminal mark followed by whitespace; the whitespace stays
/// with the remainder. With `finalized` the remainder becomes a sentence too.
fn split_sentences(text: &str, finalized: bool) -> (Vec<&str>, &str) {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let Some(&(next_index, next)) = chars.peek() else {
            break;
        };
        if next.is_whitespace() {
            let sentence = text[start..next_index].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = i + c.len_utf8();
        }
    }

    let rest = &text[start..];
    if finalized {
        let last = rest.trim();
        if !last.is_empty() {
            sentences.push(last);
        }
        return (sentences, "");
    }
    (sentences, rest)
}

fn join(head: &str, tail: &str) -> String {
    match (head.is_empty(), tail.is_empty()) {
        (true, _) => tail.to_string(),
        (false, true) => head.to_string(),
        (false, false) => format!("{head} {tail}"),
    }
}
