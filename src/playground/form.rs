use serde::{Deserialize, Serialize};

use super::examples::{EXAMPLE_PROMPTS, default_temperature, example_index};

pub const MAX_PROMPT_CHARS: usize = 10_000;
pub const MAX_NEW_TOKENS_RANGE: (u32, u32) = (1, 128);
pub const N_RANGE: (u32, u32) = (1, 10);
pub const TEMPERATURE_RANGE: (f64, f64) = (0.0, 1.5);
pub const TOP_P_RANGE: (f64, f64) = (0.0, 1.0);

/// Values of the generation form, as submitted or as initially displayed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GenerationForm {
    pub context: String,
    pub max_new_tokens: u32,
    pub n: u32,
    /// Checkboxes are only submitted when ticked.
    #[serde(default, deserialize_with = "checkbox")]
    pub do_sample: bool,
    pub temperature: f64,
    pub top_p: f64,
}

impl GenerationForm {
    /// Form pre-filled with the given example prompt.
    pub fn for_example(example: usize) -> Self {
        let example = example.min(EXAMPLE_PROMPTS.len() - 1);
        let context = EXAMPLE_PROMPTS[example].to_string();
        let temperature = default_temperature(example_index(&context));

        Self {
            context,
            max_new_tokens: 10,
            n: 3,
            do_sample: true,
            temperature,
            top_p: 0.95,
        }
    }

    /// Pins every field to what the widgets allow.
    pub fn clamped(mut self) -> Self {
        self.context = self.context.chars().take(MAX_PROMPT_CHARS).collect();
        self.max_new_tokens = self
            .max_new_tokens
            .clamp(MAX_NEW_TOKENS_RANGE.0, MAX_NEW_TOKENS_RANGE.1);
        self.n = self.n.clamp(N_RANGE.0, N_RANGE.1);
        self.temperature = self.temperature.clamp(TEMPERATURE_RANGE.0, TEMPERATURE_RANGE.1);
        self.top_p = self.top_p.clamp(TOP_P_RANGE.0, TOP_P_RANGE.1);
        self
    }

    pub fn selected_example(&self) -> usize {
        example_index(&self.context)
    }

    /// The `N` slider drives both the beam width and the number of returned
    /// sequences.
    pub fn payload(&self) -> GeneratePayload {
        GeneratePayload {
            context: self.context.replace("\r\n", "\n"),
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            do_sample: self.do_sample,
            num_beams: self.n,
            num_return_sequences: self.n,
        }
    }
}

/// JSON body sent to the generation endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratePayload {
    pub context: String,
    pub max_new_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub do_sample: bool,
    pub num_beams: u32,
    pub num_return_sequences: u32,
}

fn checkbox<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    Ok(matches!(value.as_str(), "on" | "true" | "1"))
}
