//! Tokenizer Contract
//!
//! Text ↔ id conversion happens outside this crate: the corpus arrives
//! already tokenized and generation works on ids. What the crate does need is
//! a way to check that an external tokenizer agrees with the model on the
//! vocabulary, and a way to turn sampled ids back into text. [`Tokenizer`] is
//! that seam.
//!
//! Two special tokens are required, each mapped to a fixed id above the
//! learned vocabulary:
//!
//! | Symbol  | Default id |
//! |---------|------------|
//! | `<eos>` | 10000      |
//! | `<pad>` | 10001      |

use crate::config::Config;
use crate::error::{Result, ScribeError};
use std::collections::HashMap;
use std::path::Path;

pub const EOS_SYMBOL: &str = "<eos>";
pub const PAD_SYMBOL: &str = "<pad>";

/// The two reserved ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpecialTokens {
    pub eos: usize,
    pub pad: usize,
}

impl SpecialTokens {
    pub fn from_config(config: &Config) -> Self {
        Self {
            eos: config.eos_id,
            pad: config.pad_id,
        }
    }

    /// Symbol → id mapping, as handed to [`Tokenizer::register_special_tokens`].
    pub fn mapping(&self) -> HashMap<String, usize> {
        HashMap::from([
            (EOS_SYMBOL.to_string(), self.eos),
            (PAD_SYMBOL.to_string(), self.pad),
        ])
    }
}

/// What the crate expects from an external tokenizer.
pub trait Tokenizer {
    /// Load a trained tokenizer.
    fn load(path: &Path) -> Result<Self>
    where
        Self: Sized;

    fn encode(&self, text: &str) -> Vec<usize>;

    fn decode(&self, ids: &[usize]) -> String;

    fn register_special_tokens(&mut self, tokens: &HashMap<String, usize>);

    /// Number of ids, special tokens included.
    fn vocab_size(&self) -> usize;
}

impl Config {
    /// Fail unless `tokenizer` produces exactly the ids this model can embed.
    pub fn check_tokenizer(&self, tokenizer: &dyn Tokenizer) -> Result<()> {
        if tokenizer.vocab_size() != self.vocab_size {
            return Err(ScribeError::Config(format!(
                "tokenizer vocabulary has {} ids, model expects {}",
                tokenizer.vocab_size(),
                self.vocab_size
            )));
        }
        let specials = SpecialTokens::from_config(self);
        for (symbol, id) in [(EOS_SYMBOL, specials.eos), (PAD_SYMBOL, specials.pad)] {
            if id >= tokenizer.vocab_size() {
                return Err(ScribeError::Config(format!(
                    "special token {} (id {}) is outside the tokenizer vocabulary",
                    symbol, id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Whitespace-separated decimal ids; enough to exercise the contract.
    pub(crate) struct DigitTokenizer {
        pub base_vocab: usize,
        pub specials: HashMap<String, usize>,
    }

    impl Tokenizer for DigitTokenizer {
        fn load(_path: &Path) -> Result<Self> {
            Ok(Self {
                base_vocab: 10,
                specials: HashMap::new(),
            })
        }

        fn encode(&self, text: &str) -> Vec<usize> {
            text.split_whitespace()
                .map(|word| {
                    self.specials
                        .get(word)
                        .copied()
                        .or_else(|| word.parse().ok())
                        .unwrap_or(0)
                })
                .collect()
        }

        fn decode(&self, ids: &[usize]) -> String {
            ids.iter()
                .map(|id| {
                    self.specials
                        .iter()
                        .find(|(_, &v)| v == *id)
                        .map(|(k, _)| k.clone())
                        .unwrap_or_else(|| id.to_string())
                })
                .collect::<Vec<_>>()
                .join(" ")
        }

        fn register_special_tokens(&mut self, tokens: &HashMap<String, usize>) {
            self.specials.extend(tokens.iter().map(|(k, &v)| (k.clone(), v)));
        }

        fn vocab_size(&self) -> usize {
            self.base_vocab + self.specials.len()
        }
    }

    #[test]
    fn test_vocab_must_include_specials() {
        let config = Config::tiny(12);
        let mut tokenizer = DigitTokenizer::load(Path::new("unused")).unwrap();
        assert!(config.check_tokenizer(&tokenizer).is_err());

        tokenizer.register_special_tokens(&SpecialTokens::from_config(&config).mapping());
        config.check_tokenizer(&tokenizer).unwrap();
        assert_eq!(tokenizer.encode("3 <eos>"), vec![3, 10]);
        assert_eq!(tokenizer.decode(&[4, 11]), "4 <pad>");
    }

    #[test]
    fn test_mismatched_vocab_fails_fast() {
        let config = Config::tiny(40);
        let mut tokenizer = DigitTokenizer::load(Path::new("unused")).unwrap();
        tokenizer.register_special_tokens(&SpecialTokens::from_config(&config).mapping());
        let err = config.check_tokenizer(&tokenizer).unwrap_err();
        assert!(matches!(err, ScribeError::Config(_)));
    }
}
