use clap::ValueEnum;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::ServiceError;

/// Architecture tag selecting how the pretrained model is loaded and driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum ModelKind {
    /// Decoder-only causal language model.
    #[value(name = "CLM")]
    #[serde(rename = "CLM")]
    Clm,
    #[value(name = "T5")]
    #[serde(rename = "T5")]
    T5,
    #[value(name = "EVA")]
    #[serde(rename = "EVA")]
    Eva,
}

impl ModelKind {
    pub fn is_encoder_decoder(self) -> bool {
        !matches!(self, ModelKind::Clm)
    }
}

/// Generation parameters forwarded to the decoding routine.
///
/// Unknown keys are rejected so a typo surfaces as a 400 instead of being
/// silently ignored. `null` means "use the default" for every field.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerateOptions {
    pub max_new_tokens: Option<usize>,
    pub max_length: Option<usize>,
    pub min_new_tokens: Option<usize>,
    pub min_length: Option<usize>,
    #[serde(default, deserialize_with = "null_as_false")]
    pub do_sample: bool,
    pub temperature: Option<f64>,
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    pub repetition_penalty: Option<f64>,
    pub num_beams: Option<usize>,
    pub num_return_sequences: Option<usize>,
    pub length_penalty: Option<f64>,
    pub no_repeat_ngram_size: Option<usize>,
    #[serde(default, deserialize_with = "null_as_false")]
    pub early_stopping: bool,
    #[serde(default, deserialize_with = "null_as_false")]
    pub return_dict_in_generate: bool,
    #[serde(default, deserialize_with = "null_as_false")]
    pub output_scores: bool,
    pub eos_token_id: Option<TokenIds>,
    pub pad_token_id: Option<i64>,
}

fn null_as_false<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or_default())
}

/// A token id field that may be given as a single id or a list of ids.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    One(i64),
    Many(Vec<i64>),
}

impl TokenIds {
    pub fn into_vec(self) -> Vec<i64> {
        match self {
            TokenIds::One(id) => vec![id],
            TokenIds::Many(ids) => ids,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub context: String,
    pub output_logits: bool,
    pub options: GenerateOptions,
}

impl GenerationRequest {
    /// Splits a raw JSON body into the prompt, the logits flag and the
    /// remaining generation options.
    pub fn from_slice(body: &[u8]) -> Result<Self, ServiceError> {
        let mut fields: Map<String, Value> =
            serde_json::from_slice(body).map_err(ServiceError::InvalidPayload)?;

        let context = match fields.remove("context") {
            Some(Value::String(context)) => context,
            Some(other) => {
                return Err(ServiceError::BadRequest(format!(
                    "`context` must be a string, got {other}"
                )));
            }
            None => return Err(ServiceError::MissingField("context")),
        };

        let output_logits = match fields.remove("output_logits") {
            Some(value) => serde_json::from_value::<Option<bool>>(value)
                .map_err(ServiceError::InvalidOptions)?
                .unwrap_or_default(),
            None => false,
        };

        let options =
            serde_json::from_value(Value::Object(fields)).map_err(ServiceError::InvalidOptions)?;

        Ok(Self {
            context,
            output_logits,
            options,
        })
    }
}

/// What a generator hands back for one prompt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedText {
    pub sequences: Vec<String>,
    pub sequences_scores: Vec<f32>,
    /// Processed scores per decoding step, one row per live sequence.
    pub scores: Vec<Vec<Vec<f32>>>,
    pub beam_indices: Option<Vec<Vec<i64>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailedOutput {
    pub sequences: Vec<String>,
    pub sequences_scores: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scores: Option<Vec<Vec<Vec<f32>>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beam_indices: Option<Vec<Vec<i64>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GenerationOutput {
    Texts(Vec<String>),
    Detailed(DetailedOutput),
}

impl GenerationOutput {
    pub fn shape(generated: GeneratedText, return_dict: bool, output_logits: bool) -> Self {
        if !return_dict {
            return GenerationOutput::Texts(generated.sequences);
        }

        let (scores, beam_indices) = if output_logits {
            (Some(generated.scores), generated.beam_indices)
        } else {
            (None, None)
        };

        GenerationOutput::Detailed(DetailedOutput {
            sequences: generated.sequences,
            sequences_scores: generated.sequences_scores,
            scores,
            beam_indices,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationResponse {
    pub compute_time: f64,
    pub context: String,
    pub output: GenerationOutput,
}
