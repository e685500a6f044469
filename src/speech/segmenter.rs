//! Text segmenter for synthesis input.
//!
//! Turns free text into ordered utterance units: line breaks are
//! normalized, blocks are split on line-break runs, whitespace is
//! collapsed, blocks are split after sentence-ending punctuation
//! (`.!?` followed by whitespace), and anything longer than the
//! character cap is hard-wrapped at code-point boundaries.
//!
//! [`Segmenter::split_complete`] is the streaming variant: given the
//! unconsumed buffer of a session it decides which units are safe to
//! emit now and which raw tail must stay buffered.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default utterance length cap in characters.
pub const DEFAULT_MAX_CHARS: usize = 320;

/// Characters that end a sentence.
const SENTENCE_DELIMITERS: &[char] = &['.', '!', '?'];

static LINE_BREAKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n+").expect("valid regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]\s+").expect("valid regex"));
/// A boundary no later text can move: a line break, or terminal
/// punctuation already followed by whitespace.
static SEAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n|[.!?]\s").expect("valid regex"));

/// How a streaming session decides which units of a partial buffer to emit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HoldBack {
    /// Emit only up to the last sealed boundary. Streamed output then
    /// matches segmenting the concatenated text.
    #[default]
    Sealed,
    /// Emit everything when the buffer ends in whitespace or punctuation,
    /// otherwise hold back the last unit. Fewer than two units are held.
    Trailing,
}

/// Configurable text segmenter.
#[derive(Debug, Clone, Copy)]
pub struct Segmenter {
    /// Maximum characters per unit; `0` disables hard wrapping.
    pub max_chars: usize,
    pub hold_back: HoldBack,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self {
            max_chars: DEFAULT_MAX_CHARS,
            hold_back: HoldBack::Sealed,
        }
    }
}

impl Segmenter {
    pub fn new(max_chars: usize, hold_back: HoldBack) -> Self {
        Self {
            max_chars,
            hold_back,
        }
    }

    /// Split `text` into ordered, trimmed, non-empty units.
    pub fn segment(&self, text: &str) -> Vec<String> {
        let text = normalize_newlines(text);
        let mut units = Vec::new();

        for block in LINE_BREAKS.split(&text) {
            let block = WHITESPACE.replace_all(block, " ");
            let block = block.trim();
            if block.is_empty() {
                continue;
            }
            for sentence in split_sentences(block) {
                units.extend(hard_wrap(sentence, self.max_chars));
            }
        }

        units
    }

    /// Decide which units of an unfinished buffer are complete.
    ///
    /// Returns the units to emit and the raw tail to keep buffered.
    pub fn split_complete(&self, buffer: &str) -> (Vec<String>, String) {
        match self.hold_back {
            HoldBack::Sealed => self.split_sealed(buffer),
            HoldBack::Trailing => self.split_trailing(buffer),
        }
    }

    fn split_sealed(&self, buffer: &str) -> (Vec<String>, String) {
        let buffer = normalize_newlines(buffer);

        // Every seal match starts with a one-byte character.
        let (head, tail) = match SEAL.find_iter(&buffer).last() {
            Some(m) => buffer.split_at(m.start() + 1),
            None => ("", buffer.as_str()),
        };

        let mut units = self.segment(head);

        // An open sentence that already exceeds the cap releases its full
        // pieces. The rest must not start with whitespace, since the next
        // call trims the start of the tail.
        let collapsed = WHITESPACE.replace_all(tail, " ");
        let collapsed = collapsed.trim_start();
        let chars: Vec<(usize, char)> = collapsed.char_indices().collect();
        if self.max_chars > 0 && chars.len() > self.max_chars {
            let full = (chars.len() - 1) / self.max_chars;
            let cut = (1..=full)
                .rev()
                .map(|k| chars[k * self.max_chars])
                .find(|(_, c)| !c.is_whitespace())
                .map(|(i, _)| i);
            if let Some(cut) = cut {
                let (done, rest) = collapsed.split_at(cut);
                units.extend(hard_wrap(done, self.max_chars));
                return (units, rest.to_string());
            }
        }

        (units, tail.to_string())
    }

    fn split_trailing(&self, buffer: &str) -> (Vec<String>, String) {
        let mut units = self.segment(buffer);
        if units.is_empty() {
            return (units, buffer.to_string());
        }

        let ends_open = buffer
            .chars()
            .last()
            .is_some_and(|c| c.is_whitespace() || SENTENCE_DELIMITERS.contains(&c));
        if ends_open {
            return (units, String::new());
        }
        if units.len() < 2 {
            return (Vec::new(), buffer.to_string());
        }

        let tail = units.pop().unwrap_or_default();
        (units, tail)
    }
}

/// Replace `\r\n` and lone `\r` with `\n`.
pub fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Split a collapsed block after each terminal punctuation run.
fn split_sentences(block: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    for m in SENTENCE_END.find_iter(block) {
        let piece = block[start..m.start() + 1].trim();
        if !piece.is_empty() {
            out.push(piece);
        }
        start = m.end();
    }
    let last = block[start..].trim();
    if !last.is_empty() {
        out.push(last);
    }
    out
}

/// Hard-wrap `text` into pieces of at most `max_chars` characters.
pub fn hard_wrap(text: &str, max_chars: usize) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if max_chars == 0 || text.chars().count() <= max_chars {
        return vec![trimmed.to_string()];
    }

    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars)
        .map(|chunk| chunk.iter().collect::<String>().trim().to_string())
        .filter(|piece| !piece.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(max_chars: usize) -> Segmenter {
        Segmenter::new(max_chars, HoldBack::Sealed)
    }

    fn trailing() -> Segmenter {
        Segmenter::new(DEFAULT_MAX_CHARS, HoldBack::Trailing)
    }

    /// Feed pushes through `split_complete` the way a session does and
    /// flush the remainder at the end.
    fn stream(seg: &Segmenter, pushes: &[&str]) -> Vec<String> {
        let mut buffer = String::new();
        let mut out = Vec::new();
        for push in pushes {
            buffer.push_str(push);
            let (units, tail) = seg.split_complete(&buffer);
            out.extend(units);
            buffer = tail;
        }
        out.extend(seg.segment(&buffer));
        out
    }

    #[test]
    fn splits_sentences_and_lines() {
        let seg = Segmenter::default();
        let units = seg.segment("Hello world. How are you?\r\nFine!  Thanks");
        assert_eq!(units, vec!["Hello world.", "How are you?", "Fine!", "Thanks"]);
    }

    #[test]
    fn collapses_whitespace() {
        let seg = Segmenter::default();
        assert_eq!(seg.segment("  a \t  b   c  "), vec!["a b c"]);
    }

    #[test]
    fn punctuation_without_space_does_not_split() {
        let seg = Segmenter::default();
        assert_eq!(seg.segment("v1.2 is out.Next"), vec!["v1.2 is out.Next"]);
    }

    #[test]
    fn lone_carriage_return_is_a_line_break() {
        let seg = Segmenter::default();
        assert_eq!(seg.segment("one\rtwo"), vec!["one", "two"]);
    }

    #[test]
    fn empty_and_whitespace_only() {
        let seg = Segmenter::default();
        assert!(seg.segment("").is_empty());
        assert!(seg.segment(" \n\n \t ").is_empty());
    }

    #[test]
    fn hard_wrap_respects_code_points() {
        let pieces = hard_wrap("あいうえおかき", 3);
        assert_eq!(pieces, vec!["あいう", "えおか", "き"]);
    }

    #[test]
    fn hard_wrap_trims_and_drops_empty() {
        let pieces = hard_wrap("abc   def", 3);
        assert_eq!(pieces, vec!["abc", "def"]);
    }

    #[test]
    fn overlong_sentence_is_wrapped() {
        let seg = sealed(10);
        let units = seg.segment("abcdefghijklmnopqrstuvwxy.");
        assert_eq!(units, vec!["abcdefghij", "klmnopqrst", "uvwxy."]);
        assert!(units.iter().all(|u| u.chars().count() <= 10));
    }

    #[test]
    fn sealed_holds_open_sentence() {
        let seg = Segmenter::default();
        let (units, tail) = seg.split_complete("Hello ");
        assert!(units.is_empty());
        assert_eq!(tail, "Hello ");
    }

    #[test]
    fn sealed_emits_through_last_seal() {
        let seg = Segmenter::default();
        let (units, tail) = seg.split_complete("Hello world. Next sent");
        assert_eq!(units, vec!["Hello world."]);
        assert_eq!(tail, " Next sent");
    }

    #[test]
    fn sealed_line_break_seals() {
        let seg = Segmenter::default();
        let (units, tail) = seg.split_complete("first line\nsecond");
        assert_eq!(units, vec!["first line"]);
        assert_eq!(tail, "second");
    }

    #[test]
    fn streamed_pushes_match_whole_text() {
        let seg = Segmenter::default();
        let pushes = ["Hello ", "world. ", "Next sentence."];
        let whole = seg.segment(&pushes.concat());
        assert_eq!(stream(&seg, &pushes), whole);
        assert_eq!(whole, vec!["Hello world.", "Next sentence."]);
    }

    #[test]
    fn trailing_period_joins_previous_text() {
        let seg = Segmenter::default();
        let out = stream(&seg, &["It was a dark and stormy night", "."]);
        assert_eq!(out, vec!["It was a dark and stormy night."]);
    }

    #[test]
    fn token_by_token_matches_whole_text() {
        let seg = sealed(12);
        let text = "The quick brown fox jumps over the lazy dog. It barked!\nThen silence fell over everything";
        let pushes: Vec<String> = text.chars().map(|c| c.to_string()).collect();
        let refs: Vec<&str> = pushes.iter().map(String::as_str).collect();
        assert_eq!(stream(&seg, &refs), seg.segment(text));
    }

    #[test]
    fn sealed_releases_overlong_open_sentence() {
        let seg = sealed(5);
        let (units, tail) = seg.split_complete("abcdefghijkl");
        assert_eq!(units, vec!["abcde", "fghij"]);
        assert_eq!(tail, "kl");
    }

    #[test]
    fn trailing_holds_single_unit() {
        let (units, tail) = trailing().split_complete("Hello");
        assert!(units.is_empty());
        assert_eq!(tail, "Hello");
    }

    #[test]
    fn trailing_holds_last_unit() {
        let (units, tail) = trailing().split_complete("One. Two. Thr");
        assert_eq!(units, vec!["One.", "Two."]);
        assert_eq!(tail, "Thr");
    }

    #[test]
    fn trailing_emits_all_on_terminal() {
        let (units, tail) = trailing().split_complete("One. Two.");
        assert_eq!(units, vec!["One.", "Two."]);
        assert!(tail.is_empty());
    }

    #[test]
    fn hold_back_deserializes_lowercase() {
        let hb: HoldBack = serde_json::from_str("\"trailing\"").unwrap();
        assert_eq!(hb, HoldBack::Trailing);
    }
}
