use crate::Result;

/// The external tokenizer.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> Result<String>;
    fn eos_token_id(&self) -> u32;

    /// The tokenizer's own padding token, if it defines one.
    fn pad_token_id(&self) -> Option<u32> {
        None
    }

    /// Padding token to use: the tokenizer's, or end-of-sequence otherwise.
    fn resolved_pad_token_id(&self) -> u32 {
        self.pad_token_id().unwrap_or_else(|| self.eos_token_id())
    }
}

impl<T: Tokenizer + ?Sized> Tokenizer for std::sync::Arc<T> {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        (**self).encode(text)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        (**self).decode(ids)
    }

    fn eos_token_id(&self) -> u32 {
        (**self).eos_token_id()
    }

    fn pad_token_id(&self) -> Option<u32> {
        (**self).pad_token_id()
    }
}
