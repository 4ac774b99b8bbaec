use crate::decoding::Token;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokenizers::Tokenizer;

/// Streaming output of [`ContrastivePipeline::completion_stream`](super::ContrastivePipeline::completion_stream).
pub struct CompletionStream<'a> {
    inner: Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send + 'a>>,
}

impl<'a> CompletionStream<'a> {
    pub(crate) fn new(inner: impl Stream<Item = anyhow::Result<String>> + Send + 'a) -> Self {
        Self {
            inner: Box::pin(inner),
        }
    }

    /// Collect the entire stream into a single `String`.
    pub async fn collect(mut self) -> anyhow::Result<String> {
        use futures::StreamExt;
        let mut out = String::new();
        while let Some(chunk) = self.inner.next().await {
            out.push_str(&chunk?);
        }
        Ok(out)
    }

    /// Take the first `n` chunks from the stream.
    pub async fn take(mut self, n: usize) -> anyhow::Result<Vec<String>> {
        use futures::StreamExt;
        let mut out = Vec::new();
        for _ in 0..n {
            match self.inner.next().await {
                Some(chunk) => out.push(chunk?),
                None => break,
            }
        }
        Ok(out)
    }
}

impl<'a> Stream for CompletionStream<'a> {
    type Item = anyhow::Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.as_mut().poll_next(cx)
    }
}

/// Turns a growing token sequence into text deltas.
///
/// Byte-level tokens can split a UTF-8 character; text is held back until
/// the decoded sequence no longer ends in a replacement character.
pub(crate) struct IncrementalDecoder<'t> {
    tokenizer: &'t Tokenizer,
    tokens: Vec<Token>,
    emitted: usize,
}

impl<'t> IncrementalDecoder<'t> {
    pub(crate) fn new(tokenizer: &'t Tokenizer) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            emitted: 0,
        }
    }

    pub(crate) fn push(&mut self, token: Token) -> anyhow::Result<Option<String>> {
        self.tokens.push(token);
        let text = self
            .tokenizer
            .decode(&self.tokens, true)
            .map_err(anyhow::Error::msg)?;

        if text.ends_with('\u{fffd}') {
            return Ok(None);
        }
        match text.get(self.emitted..) {
            Some(delta) if !delta.is_empty() => {
                let delta = delta.to_string();
                self.emitted = text.len();
                Ok(Some(delta))
            }
            _ => Ok(None),
        }
    }

    /// Emit whatever is still held back once generation has ended, including
    /// a trailing replacement character for an incomplete UTF-8 sequence.
    pub(crate) fn finish(&mut self) -> anyhow::Result<Option<String>> {
        let text = self
            .tokenizer
            .decode(&self.tokens, true)
            .map_err(anyhow::Error::msg)?;

        match text.get(self.emitted..) {
            Some(rest) if !rest.is_empty() => {
                let rest = rest.to_string();
                self.emitted = text.len();
                Ok(Some(rest))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::pre_tokenizers::byte_level::ByteLevel;

    const A: Token = 0;
    const B: Token = 1;
    /// Lead byte 0xC3 of a two-byte character.
    const LEAD: Token = 2;
    /// Continuation byte 0xA9; `LEAD` + `TRAIL` is "é".
    const TRAIL: Token = 3;

    fn byte_level_tokenizer() -> Tokenizer {
        let vocab = [("a", A), ("b", B), ("Ã", LEAD), ("©", TRAIL), ("[UNK]", 4)]
            .into_iter()
            .map(|(token, id)| (token.to_string(), id))
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("[UNK]".to_string())
            .build()
            .unwrap();

        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_decoder(Some(ByteLevel::default()));
        tokenizer
    }

    fn stream_all(tokenizer: &Tokenizer, tokens: &[Token]) -> (Vec<Option<String>>, Option<String>) {
        let mut decoder = IncrementalDecoder::new(tokenizer);
        let deltas = tokens
            .iter()
            .map(|&token| decoder.push(token).unwrap())
            .collect();
        (deltas, decoder.finish().unwrap())
    }

    #[test]
    fn test_ascii_deltas_pass_through() {
        let tokenizer = byte_level_tokenizer();
        let (deltas, rest) = stream_all(&tokenizer, &[A, B, A]);

        assert_eq!(
            deltas,
            vec![Some("a".to_string()), Some("b".to_string()), Some("a".to_string())]
        );
        assert_eq!(rest, None);
    }

    #[test]
    fn test_split_character_is_joined() {
        let tokenizer = byte_level_tokenizer();
        let (deltas, rest) = stream_all(&tokenizer, &[A, LEAD, TRAIL]);

        assert_eq!(
            deltas,
            vec![Some("a".to_string()), None, Some("é".to_string())]
        );
        assert_eq!(rest, None);
    }

    #[test]
    fn test_finish_flushes_incomplete_character() {
        let tokenizer = byte_level_tokenizer();
        let tokens = [A, LEAD];
        let (deltas, rest) = stream_all(&tokenizer, &tokens);

        assert_eq!(deltas, vec![Some("a".to_string()), None]);
        assert_eq!(rest.as_deref(), Some("\u{fffd}"));

        let streamed: String = deltas.into_iter().flatten().chain(rest).collect();
        let full = tokenizer.decode(&tokens, true).unwrap();
        assert_eq!(streamed, full);
    }
}
