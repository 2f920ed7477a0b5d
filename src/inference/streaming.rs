//! Streaming detokenizer
//!
//! Turns the growing sequence of generated token ids into printable text
//! increments. Text is released word by word: a trailing partial word stays
//! buffered until a space, a newline, a CJK character or the end of the
//! stream, since the next token may still change how it decodes.

use thiserror::Error;

use crate::inference::engine::Detokenizer;
use crate::types::{MessageType, Token};

/// Streaming errors
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Detokenization failed: {0}")]
    Decode(String),
}

/// Outcome of a streaming step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// Keep generating
    Continue,
    /// The callback asked to stop
    Cancelled,
}

impl StreamStatus {
    pub fn is_cancelled(self) -> bool {
        matches!(self, StreamStatus::Cancelled)
    }
}

/// Session-scoped decoder state.
///
/// One instance per generation call. `feed` is called once per decoding step
/// and `finish` once when the stream ends.
pub struct StreamDecoder<D, F> {
    tokenizer: D,
    on_chunk: F,
    token_cache: Vec<Token>,
    /// Characters of the decoded cache already emitted
    print_len: usize,
    skip_prompt: bool,
    next_tokens_are_prompt: bool,
    output: String,
}

impl<D, F> StreamDecoder<D, F>
where
    D: Detokenizer,
    F: FnMut(&str, MessageType) -> bool,
{
    pub fn new(tokenizer: D, skip_prompt: bool, on_chunk: F) -> Self {
        Self {
            tokenizer,
            on_chunk,
            token_cache: Vec::new(),
            print_len: 0,
            skip_prompt,
            next_tokens_are_prompt: true,
            output: String::new(),
        }
    }

    /// Feed a batched step. Only a batch of exactly one sequence is accepted.
    pub fn feed_batch(&mut self, batch: &[Vec<Token>]) -> Result<StreamStatus, StreamError> {
        match batch {
            [row] => self.feed(row),
            _ => Err(StreamError::InvalidInput(format!(
                "streaming supports batch size 1, got {}",
                batch.len()
            ))),
        }
    }

    /// Feed the tokens produced by one decoding step
    pub fn feed(&mut self, tokens: &[Token]) -> Result<StreamStatus, StreamError> {
        if self.skip_prompt && self.next_tokens_are_prompt {
            self.next_tokens_are_prompt = false;
            return Ok(StreamStatus::Continue);
        }

        self.token_cache.extend_from_slice(tokens);
        let text = self.decode_cache()?;

        let printable = if text.ends_with('\n') {
            let chunk = tail_from(&text, self.print_len).to_string();
            self.token_cache.clear();
            self.print_len = 0;
            chunk
        } else if text.chars().next_back().is_some_and(is_cjk_char) {
            let chunk = tail_from(&text, self.print_len).to_string();
            self.print_len += chunk.chars().count();
            chunk
        } else {
            let chunk = through_last_space(&text, self.print_len).to_string();
            self.print_len += chunk.chars().count();
            chunk
        };

        Ok(self.emit(&printable))
    }

    /// Flush whatever is still buffered and get ready for a new session.
    ///
    /// A `false` from the callback here only reports
    /// [`StreamStatus::Cancelled`]; the stream is already over.
    pub fn finish(&mut self) -> Result<StreamStatus, StreamError> {
        let printable = if self.token_cache.is_empty() {
            String::new()
        } else {
            let text = self.decode_cache()?;
            let chunk = tail_from(&text, self.print_len).to_string();
            self.token_cache.clear();
            self.print_len = 0;
            chunk
        };

        self.next_tokens_are_prompt = true;
        Ok(self.emit(&printable))
    }

    pub fn token_cache(&self) -> &[Token] {
        &self.token_cache
    }

    pub fn print_len(&self) -> usize {
        self.print_len
    }

    pub fn next_tokens_are_prompt(&self) -> bool {
        self.next_tokens_are_prompt
    }

    /// Everything emitted so far in this session
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn into_output(self) -> String {
        self.output
    }

    fn decode_cache(&self) -> Result<String, StreamError> {
        self.tokenizer
            .detokenize(&self.token_cache)
            .map_err(|e| StreamError::Decode(e.to_string()))
    }

    fn emit(&mut self, chunk: &str) -> StreamStatus {
        self.output.push_str(chunk);
        if (self.on_chunk)(chunk, MessageType::Chunk) {
            StreamStatus::Continue
        } else {
            tracing::debug!("Chunk callback requested stop");
            StreamStatus::Cancelled
        }
    }
}

/// Whether `c` is a CJK ideograph.
///
/// Only the CJK Unified Ideographs blocks and their extensions count. Hangul,
/// Hiragana and Katakana are written with spaces and use the word rule.
pub fn is_cjk_char(c: char) -> bool {
    matches!(
        c as u32,
        0x4E00..=0x9FFF
            | 0x3400..=0x4DBF
            | 0x20000..=0x2A6DF
            | 0x2A700..=0x2B73F
            | 0x2B740..=0x2B81F
            | 0x2B820..=0x2CEAF
            | 0xF900..=0xFAFF
            | 0x2F800..=0x2FA1F
    )
}

/// Byte offset of the `chars`-th character, clamped to the end of `text`.
fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map_or(text.len(), |(idx, _)| idx)
}

fn tail_from(text: &str, chars: usize) -> &str {
    &text[byte_offset(text, chars)..]
}

/// Text from `chars` up to and including the last space after it.
fn through_last_space(text: &str, chars: usize) -> &str {
    let start = byte_offset(text, chars);
    let rest = &text[start..];
    match rest.rfind(' ') {
        Some(idx) => &rest[..=idx],
        None => "",
    }
}
