use crate::{
    error::ServiceError,
    model::{GenerateOptions, TokenIds},
};

/// Total length cap applied when a request sets neither `max_new_tokens`
/// nor `max_length`.
pub const DEFAULT_MAX_LENGTH: usize = 20;
pub const DEFAULT_TOP_K: usize = 50;

/// Token ids the decoder needs to know about, as configured for the model.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecialTokens {
    pub eos: Vec<i64>,
    pub pad: i64,
    pub bos: Option<i64>,
    pub decoder_start: i64,
}

/// Fully resolved decoding parameters for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeSettings {
    pub max_new_tokens: usize,
    pub min_new_tokens: usize,
    pub no_repeat_ngram_size: usize,
    pub do_sample: bool,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
    pub repetition_penalty: f64,
    pub num_beams: usize,
    pub num_return_sequences: usize,
    pub length_penalty: f64,
    pub early_stopping: bool,
    pub eos: Vec<i64>,
    pub pad: i64,
    pub collect_scores: bool,
}

impl DecodeSettings {
    /// `input_len` is the length of the sequence decoding starts from: the
    /// prompt for decoder-only models, the decoder start token otherwise.
    pub fn resolve(
        options: &GenerateOptions,
        special: &SpecialTokens,
        input_len: usize,
    ) -> Result<Self, ServiceError> {
        let max_new_tokens = options
            .max_new_tokens
            .or_else(|| options.max_length.map(|max| max.saturating_sub(input_len)))
            .unwrap_or_else(|| DEFAULT_MAX_LENGTH.saturating_sub(input_len));

        let num_beams = options.num_beams.unwrap_or(1);
        let num_return_sequences = options.num_return_sequences.unwrap_or(1);
        let temperature = options.temperature.unwrap_or(1.0);
        let top_p = options.top_p.unwrap_or(1.0);
        let repetition_penalty = options.repetition_penalty.unwrap_or(1.0);

        if num_beams == 0 {
            return Err(invalid("`num_beams` must be at least 1"));
        }
        if num_return_sequences == 0 {
            return Err(invalid("`num_return_sequences` must be at least 1"));
        }
        if !options.do_sample && num_beams == 1 && num_return_sequences > 1 {
            return Err(invalid(
                "greedy decoding returns a single sequence; set `num_beams` or `do_sample` \
                 to request several `num_return_sequences`",
            ));
        }
        if num_beams > 1 && num_return_sequences > num_beams {
            return Err(invalid(format!(
                "`num_return_sequences` ({num_return_sequences}) must not exceed `num_beams` ({num_beams})"
            )));
        }
        if options.do_sample && !(temperature > 0.0) {
            return Err(invalid(format!(
                "`temperature` must be strictly positive when sampling, got {temperature}"
            )));
        }
        if !(0.0..=1.0).contains(&top_p) {
            return Err(invalid(format!("`top_p` must be in [0, 1], got {top_p}")));
        }
        if !(repetition_penalty > 0.0) {
            return Err(invalid(format!(
                "`repetition_penalty` must be strictly positive, got {repetition_penalty}"
            )));
        }

        let eos = options
            .eos_token_id
            .clone()
            .map(TokenIds::into_vec)
            .unwrap_or_else(|| special.eos.clone());

        // `min_length` counts the starting sequence, like `max_length`.
        let min_new_tokens = options.min_new_tokens.unwrap_or(0).max(
            options
                .min_length
                .map_or(0, |min| min.saturating_sub(input_len)),
        );

        Ok(Self {
            max_new_tokens,
            min_new_tokens,
            no_repeat_ngram_size: options.no_repeat_ngram_size.unwrap_or(0),
            do_sample: options.do_sample,
            temperature,
            top_k: options.top_k.unwrap_or(DEFAULT_TOP_K),
            top_p,
            repetition_penalty,
            num_beams,
            num_return_sequences,
            length_penalty: options.length_penalty.unwrap_or(1.0),
            early_stopping: options.early_stopping,
            eos,
            pad: options.pad_token_id.unwrap_or(special.pad),
            collect_scores: options.output_scores,
        })
    }

    pub fn is_eos(&self, token: i64) -> bool {
        self.eos.contains(&token)
    }

    /// Length-normalized score of a finished or running sequence.
    pub fn normalized_score(&self, sum_logprobs: f32, generated_len: usize) -> f32 {
        sum_logprobs / (generated_len.max(1) as f32).powf(self.length_penalty as f32)
    }
}

fn invalid(message: impl Into<String>) -> ServiceError {
    ServiceError::BadRequest(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn special() -> SpecialTokens {
        SpecialTokens {
            eos: vec![50256],
            pad: 50256,
            bos: Some(50256),
            decoder_start: 50256,
        }
    }

    #[test]
    fn max_length_counts_the_prompt() {
        let options = GenerateOptions {
            max_length: Some(12),
            ..Default::default()
        };
        let settings = DecodeSettings::resolve(&options, &special(), 5).unwrap();
        assert_eq!(settings.max_new_tokens, 7);

        let defaults = DecodeSettings::resolve(&GenerateOptions::default(), &special(), 5).unwrap();
        assert_eq!(defaults.max_new_tokens, DEFAULT_MAX_LENGTH - 5);
    }

    #[test]
    fn min_length_counts_the_prompt() {
        let options = GenerateOptions {
            min_length: Some(8),
            ..Default::default()
        };
        let settings = DecodeSettings::resolve(&options, &special(), 5).unwrap();
        assert_eq!(settings.min_new_tokens, 3);

        let both = GenerateOptions {
            min_length: Some(8),
            min_new_tokens: Some(4),
            ..Default::default()
        };
        let settings = DecodeSettings::resolve(&both, &special(), 5).unwrap();
        assert_eq!(settings.min_new_tokens, 4);

        let short = GenerateOptions {
            min_length: Some(3),
            ..Default::default()
        };
        let settings = DecodeSettings::resolve(&short, &special(), 5).unwrap();
        assert_eq!(settings.min_new_tokens, 0);
    }

    #[test]
    fn max_new_tokens_wins_over_max_length() {
        let options = GenerateOptions {
            max_new_tokens: Some(3),
            max_length: Some(100),
            ..Default::default()
        };
        let settings = DecodeSettings::resolve(&options, &special(), 5).unwrap();
        assert_eq!(settings.max_new_tokens, 3);
    }

    #[test]
    fn greedy_rejects_several_return_sequences() {
        let options = GenerateOptions {
            num_return_sequences: Some(2),
            ..Default::default()
        };
        assert!(DecodeSettings::resolve(&options, &special(), 1).is_err());

        let sampled = GenerateOptions {
            num_return_sequences: Some(2),
            do_sample: true,
            ..Default::default()
        };
        assert!(DecodeSettings::resolve(&sampled, &special(), 1).is_ok());
    }

    #[test]
    fn beams_bound_return_sequences() {
        let options = GenerateOptions {
            num_beams: Some(2),
            num_return_sequences: Some(3),
            ..Default::default()
        };
        assert!(DecodeSettings::resolve(&options, &special(), 1).is_err());
    }

    #[test]
    fn sampling_needs_positive_temperature() {
        let options = GenerateOptions {
            do_sample: true,
            temperature: Some(0.0),
            ..Default::default()
        };
        assert!(DecodeSettings::resolve(&options, &special(), 1).is_err());
    }

    #[test]
    fn request_overrides_special_tokens() {
        let options = GenerateOptions {
            eos_token_id: Some(TokenIds::Many(vec![1, 2])),
            pad_token_id: Some(0),
            ..Default::default()
        };
        let settings = DecodeSettings::resolve(&options, &special(), 1).unwrap();
        assert!(settings.is_eos(2));
        assert!(!settings.is_eos(50256));
        assert_eq!(settings.pad, 0);
    }

    #[test]
    fn length_penalty_normalizes_scores() {
        let options = GenerateOptions {
            length_penalty: Some(1.0),
            ..Default::default()
        };
        let settings = DecodeSettings::resolve(&options, &special(), 1).unwrap();
        assert_eq!(settings.normalized_score(-4.0, 4), -1.0);
        assert_eq!(settings.normalized_score(-4.0, 0), -4.0);
    }
}
