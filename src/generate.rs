//! Text Generation
//!
//! A [`Generator`] holds everything one sampling run needs: the prompt ids,
//! how many tokens to add and a seeded random generator. The same seed and
//! weights always produce the same continuation.
//!
//! ```rust,no_run
//! # use scribe::{Checkpoint, Generator};
//! let checkpoint = Checkpoint::load("checkpoints/chkpt_5000.bin")?;
//! let mut model = checkpoint.model;
//! let mut generator = Generator::new(vec![12, 7, 431], 50, 1337);
//! let ids = generator.run(&mut model)?;
//! # Ok::<(), scribe::ScribeError>(())
//! ```

use crate::error::{Result, ScribeError};
use crate::model::LanguageModel;
use crate::tokenizer::Tokenizer;
use crate::train::InferenceGuard;
use rand::rngs::StdRng;
use rand::SeedableRng;

pub struct Generator {
    prompt: Vec<usize>,
    max_new_tokens: usize,
    rng: StdRng,
    stop_token: Option<usize>,
}

impl Generator {
    pub fn new(prompt: Vec<usize>, max_new_tokens: usize, seed: u64) -> Self {
        Self {
            prompt,
            max_new_tokens,
            rng: StdRng::seed_from_u64(seed),
            stop_token: None,
        }
    }

    /// Cut the output right after the first sampled `token`.
    ///
    /// Sampling still runs for `max_new_tokens` steps; only the returned
    /// sequence is shortened.
    pub fn with_stop_token(mut self, token: usize) -> Self {
        self.stop_token = Some(token);
        self
    }

    pub fn prompt(&self) -> &[usize] {
        &self.prompt
    }

    /// Sample a continuation and return prompt plus new ids.
    ///
    /// The model runs without dropout; its previous mode is restored
    /// afterwards.
    pub fn run(&mut self, model: &mut LanguageModel) -> Result<Vec<usize>> {
        if self.prompt.is_empty() {
            return Err(ScribeError::Input("prompt is empty".to_string()));
        }
        let model = InferenceGuard::new(model);
        let mut sequences = model.generate(
            std::slice::from_ref(&self.prompt),
            self.max_new_tokens,
            &mut self.rng,
        )?;
        let mut ids = sequences.pop().unwrap_or_default();

        if let Some(stop) = self.stop_token {
            let new_tokens = &ids[self.prompt.len()..];
            if let Some(offset) = new_tokens.iter().position(|&id| id == stop) {
                ids.truncate(self.prompt.len() + offset + 1);
            }
        }
        Ok(ids)
    }

    /// [`run`](Self::run), then turn the ids into text.
    pub fn run_text(
        &mut self,
        model: &mut LanguageModel,
        tokenizer: &dyn Tokenizer,
    ) -> Result<String> {
        let ids = self.run(model)?;
        Ok(tokenizer.decode(&ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::tokenizer::tests::DigitTokenizer;
    use crate::tokenizer::SpecialTokens;
    use std::collections::HashMap;

    fn tiny_model() -> LanguageModel {
        LanguageModel::new(&Config::tiny(12)).unwrap()
    }

    #[test]
    fn test_output_is_prompt_plus_new_tokens() {
        let mut model = tiny_model();
        let mut generator = Generator::new(vec![1, 2, 3], 5, 7);
        let ids = generator.run(&mut model).unwrap();
        assert_eq!(ids.len(), 8);
        assert_eq!(&ids[..3], &[1, 2, 3]);
        assert!(ids.iter().all(|&id| id < 12));
    }

    #[test]
    fn test_same_seed_same_output() {
        let mut model = tiny_model();
        let a = Generator::new(vec![4], 20, 99).run(&mut model).unwrap();
        let b = Generator::new(vec![4], 20, 99).run(&mut model).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_restores_training_mode() {
        let mut model = tiny_model();
        model.set_training(true);
        Generator::new(vec![0], 2, 1).run(&mut model).unwrap();
        assert!(model.is_training());

        model.set_training(false);
        Generator::new(vec![0], 2, 1).run(&mut model).unwrap();
        assert!(!model.is_training());
    }

    #[test]
    fn test_stop_token_truncates_after_first_hit() {
        let mut model = tiny_model();
        // a huge bias on id 3 makes it the only plausible sample
        if let Some(bias) = model.lm_head.bias.as_mut() {
            bias.data[3] = 100.0;
        }
        let mut generator = Generator::new(vec![1, 2], 6, 5).with_stop_token(3);
        let ids = generator.run(&mut model).unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_stop_token_in_prompt_is_ignored() {
        let mut model = tiny_model();
        if let Some(bias) = model.lm_head.bias.as_mut() {
            bias.data[5] = 100.0;
        }
        let ids = Generator::new(vec![3, 3], 4, 5)
            .with_stop_token(3)
            .run(&mut model)
            .unwrap();
        assert_eq!(ids, vec![3, 3, 5, 5, 5, 5]);
    }

    #[test]
    fn test_empty_prompt_is_rejected() {
        let mut model = tiny_model();
        let err = Generator::new(Vec::new(), 3, 0).run(&mut model).unwrap_err();
        assert!(matches!(err, ScribeError::Input(_)));
    }

    #[test]
    fn test_run_text_decodes_through_tokenizer() {
        let config = Config::tiny(12);
        let mut model = LanguageModel::new(&config).unwrap();
        if let Some(bias) = model.lm_head.bias.as_mut() {
            bias.data[config.eos_id] = 100.0;
        }
        let mut tokenizer = DigitTokenizer {
            base_vocab: 10,
            specials: HashMap::new(),
        };
        tokenizer.register_special_tokens(&SpecialTokens::from_config(&config).mapping());

        let text = Generator::new(vec![7], 1, 3)
            .run_text(&mut model, &tokenizer)
            .unwrap();
        assert_eq!(text, "7 <eos>");
    }
}
