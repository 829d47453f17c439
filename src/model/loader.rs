use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, anyhow, bail};
use hf_hub::{Repo, RepoType, api::sync::Api};
use parking_lot::Mutex;
use serde::Deserialize;
use tch::{CModule, Device, IValue, Kind, Tensor, no_grad};
use tokenizers::Tokenizer;

use crate::{
    config::ServerConfig,
    error::ServiceError,
    model::{
        GenerateOptions, GeneratedText, ModelKind, TokenIds,
        decoding::decode,
        settings::{DecodeSettings, SpecialTokens},
    },
};

const TOKENIZER_FILE: &str = "tokenizer.json";
const CONFIG_FILE: &str = "config.json";
const GENERATION_CONFIG_FILE: &str = "generation_config.json";

/// Where the artifacts of one model live on disk.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub tokenizer: PathBuf,
    pub module: PathBuf,
    pub config: Option<PathBuf>,
    pub generation_config: Option<PathBuf>,
}

impl ModelFiles {
    /// Uses `huggingface_model` as a local directory when it is one, and
    /// fetches from the Hub otherwise.
    pub fn resolve(config: &ServerConfig) -> anyhow::Result<Self> {
        let local = Path::new(&config.huggingface_model);
        if local.is_dir() {
            return Self::from_dir(local, &config.model_file);
        }

        tracing::info!(repo = %config.huggingface_model, revision = ?config.revision, "fetching model from the hub");
        let api = Api::new().context("failed to initialise the hub client")?;
        let repo = match &config.revision {
            Some(revision) => Repo::with_revision(
                config.huggingface_model.clone(),
                RepoType::Model,
                revision.clone(),
            ),
            None => Repo::model(config.huggingface_model.clone()),
        };
        let repo = api.repo(repo);

        Ok(Self {
            tokenizer: repo
                .get(TOKENIZER_FILE)
                .with_context(|| format!("failed to fetch {TOKENIZER_FILE}"))?,
            module: repo
                .get(&config.model_file)
                .with_context(|| format!("failed to fetch {}", config.model_file))?,
            config: repo.get(CONFIG_FILE).ok(),
            generation_config: repo.get(GENERATION_CONFIG_FILE).ok(),
        })
    }

    pub fn from_dir(dir: &Path, model_file: &str) -> anyhow::Result<Self> {
        let tokenizer = dir.join(TOKENIZER_FILE);
        let module = dir.join(model_file);
        for required in [&tokenizer, &module] {
            if !required.exists() {
                bail!("model artifact missing: {}", required.display());
            }
        }
        let optional = |name: &str| Some(dir.join(name)).filter(|path| path.exists());

        Ok(Self {
            tokenizer,
            module,
            config: optional(CONFIG_FILE),
            generation_config: optional(GENERATION_CONFIG_FILE),
        })
    }
}

/// Token ids as they appear in `config.json` / `generation_config.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenConfig {
    pub eos_token_id: Option<TokenIds>,
    pub pad_token_id: Option<i64>,
    pub bos_token_id: Option<i64>,
    pub decoder_start_token_id: Option<i64>,
}

impl TokenConfig {
    fn read(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).with_context(|| format!("invalid {}", path.display()))
    }

    /// Fields set in `other` win.
    fn merge(self, other: TokenConfig) -> Self {
        Self {
            eos_token_id: other.eos_token_id.or(self.eos_token_id),
            pad_token_id: other.pad_token_id.or(self.pad_token_id),
            bos_token_id: other.bos_token_id.or(self.bos_token_id),
            decoder_start_token_id: other.decoder_start_token_id.or(self.decoder_start_token_id),
        }
    }

    /// Fills whatever the config leaves out from the tokenizer vocabulary.
    pub fn special_tokens(self, kind: ModelKind, tokenizer: &Tokenizer) -> SpecialTokens {
        let lookup = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| tokenizer.token_to_id(name))
                .map(i64::from)
        };

        let eos = self
            .eos_token_id
            .map(TokenIds::into_vec)
            .or_else(|| lookup(&["</s>", "<|endoftext|>", "<eos>"]).map(|id| vec![id]))
            .unwrap_or_default();
        let bos = self.bos_token_id.or_else(|| lookup(&["<s>", "<bos>"]));
        let pad = self
            .pad_token_id
            .or_else(|| lookup(&["<pad>"]))
            .or_else(|| eos.first().copied())
            .unwrap_or(0);
        let decoder_start = self
            .decoder_start_token_id
            .or(if kind == ModelKind::Eva { bos } else { None })
            .unwrap_or(pad);

        SpecialTokens {
            eos,
            pad,
            bos,
            decoder_start,
        }
    }
}

/// A loaded TorchScript model together with its tokenizer.
pub struct ModelInstance {
    name: String,
    kind: ModelKind,
    device: Device,
    tokenizer: Tokenizer,
    special: SpecialTokens,
    module: Mutex<CModule>,
}

impl ModelInstance {
    pub fn load(config: &ServerConfig) -> anyhow::Result<Self> {
        let files = ModelFiles::resolve(config)?;
        let device = config.device();
        let kind = config.model_type;

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("failed to load {}: {e}", files.tokenizer.display()))?;

        let mut tokens = TokenConfig::default();
        for path in [&files.config, &files.generation_config].into_iter().flatten() {
            tokens = tokens.merge(TokenConfig::read(path)?);
        }
        let special = tokens.special_tokens(kind, &tokenizer);
        if special.eos.is_empty() {
            tracing::warn!("no EOS token configured, generation only stops at the length limit");
        }

        let mut module = CModule::load_on_device(&files.module, device)
            .with_context(|| format!("failed to load {}", files.module.display()))?;
        module.set_eval();

        tracing::info!(
            model = %config.huggingface_model,
            ?kind,
            ?device,
            eos = ?special.eos,
            pad = special.pad,
            "model loaded"
        );

        Ok(Self {
            name: config.huggingface_model.clone(),
            kind,
            device,
            tokenizer,
            special,
            module: Mutex::new(module),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generate(
        &self,
        context: &str,
        options: &GenerateOptions,
    ) -> Result<GeneratedText, ServiceError> {
        let encoding = self
            .tokenizer
            .encode(context, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        let mut input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        if input_ids.is_empty() {
            match self.special.bos {
                Some(bos) => input_ids.push(bos),
                None => {
                    return Err(ServiceError::BadRequest(
                        "`context` produced no tokens".into(),
                    ));
                }
            }
        }

        let start = if self.kind.is_encoder_decoder() {
            vec![self.special.decoder_start]
        } else {
            input_ids.clone()
        };
        let settings = DecodeSettings::resolve(options, &self.special, start.len())?;
        tracing::debug!(
            prompt_tokens = input_ids.len(),
            max_new_tokens = settings.max_new_tokens,
            num_beams = settings.num_beams,
            do_sample = settings.do_sample,
            "decoding"
        );

        let decoded = no_grad(|| {
            let module = self.module.lock();
            if self.kind.is_encoder_decoder() {
                let encoder_input = Tensor::from_slice(&input_ids)
                    .unsqueeze(0)
                    .to_device(self.device);
                decode(
                    |rows| {
                        let encoder_input = encoder_input.repeat([rows.size()[0], 1]);
                        self.forward(
                            &module,
                            &[IValue::Tensor(encoder_input), IValue::Tensor(rows.shallow_clone())],
                        )
                    },
                    &start,
                    &settings,
                    self.device,
                )
            } else {
                decode(
                    |rows| self.forward(&module, &[IValue::Tensor(rows.shallow_clone())]),
                    &start,
                    &settings,
                    self.device,
                )
            }
        })?;

        let ids: Vec<Vec<u32>> = decoded
            .sequences
            .iter()
            .map(|row| row.iter().map(|&id| id as u32).collect())
            .collect();
        let batch: Vec<&[u32]> = ids.iter().map(Vec::as_slice).collect();
        let sequences = self
            .tokenizer
            .decode_batch(&batch, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;

        Ok(GeneratedText {
            sequences,
            sequences_scores: decoded.sequences_scores,
            scores: decoded.scores,
            beam_indices: decoded.beam_indices,
        })
    }

    /// Runs the module and returns the logits of the last position, `[N, V]`.
    fn forward(&self, module: &CModule, inputs: &[IValue]) -> Result<Tensor, ServiceError> {
        let output = module.forward_is(inputs)?;

        // traced exports return either the logits or a tuple led by them
        let logits = match output {
            IValue::Tensor(t) => t,
            IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                IValue::Tensor(t) => t.shallow_clone(),
                _ => {
                    return Err(ServiceError::Inference(
                        "expected tensor as first tuple element".into(),
                    ));
                }
            },
            _ => {
                return Err(ServiceError::Inference(
                    "unexpected model output format".into(),
                ));
            }
        };

        Ok(logits.select(1, -1).to_kind(Kind::Float))
    }
}
