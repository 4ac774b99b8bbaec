use super::Token;
use crate::core::DecodingError;

/// The prompt followed by every token generated so far.
///
/// Append-only: tokens are never removed or reordered once pushed.
#[derive(Debug, Clone)]
pub struct TokenSequenceBuffer {
    tokens: Vec<Token>,
    prompt_len: usize,
}

impl TokenSequenceBuffer {
    /// Start a buffer from a non-empty prompt, reserving room for `capacity`
    /// generated tokens.
    pub fn new(prompt: &[Token], capacity: usize) -> Result<Self, DecodingError> {
        if prompt.is_empty() {
            return Err(DecodingError::invalid(
                "prompt_tokens",
                "must contain at least one token",
            ));
        }

        let mut tokens = Vec::with_capacity(prompt.len() + capacity);
        tokens.extend_from_slice(prompt);

        Ok(Self {
            tokens,
            prompt_len: prompt.len(),
        })
    }

    pub fn push(&mut self, token: Token) {
        self.tokens.push(token);
    }

    /// The full sequence: prompt and generated tokens.
    pub fn as_slice(&self) -> &[Token] {
        &self.tokens
    }

    pub fn prompt(&self) -> &[Token] {
        &self.tokens[..self.prompt_len]
    }

    pub fn generated(&self) -> &[Token] {
        &self.tokens[self.prompt_len..]
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Never true: a buffer always holds its prompt.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Consume the buffer, keeping only the generated tokens.
    pub fn into_generated(mut self) -> Vec<Token> {
        self.tokens.drain(..self.prompt_len);
        self.tokens
    }
}
