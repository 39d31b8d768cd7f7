use std::path::Path;

use nanoserve_core::{Result, ServeError, Tokenizer};
use tokenizers::Tokenizer as HfTokenizer;

/// HuggingFace `tokenizer.json` behind the engine's tokenizer boundary.
pub struct HfTokenizerAdapter {
    inner: HfTokenizer,
    eos_token_id: u32,
    pad_token_id: Option<u32>,
}

impl HfTokenizerAdapter {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = HfTokenizer::from_file(path).map_err(|e| {
            ServeError::Upstream(format!("failed to load {}: {e}", path.display()))
        })?;

        // tokenizer_config.json next to the tokenizer is the most reliable
        // source for special tokens.
        let config = path.parent().and_then(|dir| {
            let text = std::fs::read_to_string(dir.join("tokenizer_config.json")).ok()?;
            serde_json::from_str::<serde_json::Value>(&text).ok()
        });

        let config_eos = config
            .as_ref()
            .and_then(|c| special_token_id(&inner, c, "eos_token"));
        let eos_token_id = config_eos
            .or_else(|| inner.token_to_id("</s>"))
            .or_else(|| inner.token_to_id("<|endoftext|>"))
            .or_else(|| inner.token_to_id("<|im_end|>"))
            .or_else(|| inner.token_to_id("<|eot_id|>"))
            .unwrap_or(2);

        let pad_token_id = config
            .as_ref()
            .and_then(|c| special_token_id(&inner, c, "pad_token"))
            .or_else(|| inner.token_to_id("<pad>"))
            .or_else(|| inner.token_to_id("[PAD]"));

        Ok(Self {
            inner,
            eos_token_id,
            pad_token_id,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

/// Resolve `{name}_id`, or the `{name}` string (plain or `{"content": ...}`).
fn special_token_id(inner: &HfTokenizer, config: &serde_json::Value, name: &str) -> Option<u32> {
    if let Some(id) = config.get(format!("{name}_id")).and_then(|v| v.as_u64()) {
        return Some(id as u32);
    }
    let token = config.get(name).and_then(|v| {
        v.as_str()
            .or_else(|| v.get("content").and_then(|c| c.as_str()))
    })?;
    inner.token_to_id(token)
}

impl Tokenizer for HfTokenizerAdapter {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| ServeError::Upstream(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| ServeError::Upstream(e.to_string()))
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }
}

/// Byte-level fallback: ids 0..=255 are raw bytes, 256 is end-of-sequence.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const EOS: u32 = 256;
    pub const VOCAB_SIZE: usize = 257;
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    /// Ids outside the byte range are skipped; invalid UTF-8 is replaced.
    fn decode(&self, ids: &[u32]) -> Result<String> {
        let bytes: Vec<u8> = ids.iter().filter_map(|&id| u8::try_from(id).ok()).collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_token_id(&self) -> u32 {
        Self::EOS
    }
}
