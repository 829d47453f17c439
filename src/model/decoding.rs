//! Decoding loops driving a model's forward pass: greedy, multinomial
//! sampling, beam search and beam sampling.
//!
//! The model is seen only through a `step` closure that takes the running
//! token rows `[N, L]` and returns next-token logits `[N, V]`.

use tch::{Device, Kind, Tensor};

use crate::{error::ServiceError, model::settings::DecodeSettings};

/// Token ids produced by one decoding run, before detokenization.
#[derive(Debug, Clone, Default)]
pub struct Decoded {
    pub sequences: Vec<Vec<i64>>,
    pub sequences_scores: Vec<f32>,
    pub scores: Vec<Vec<Vec<f32>>>,
    pub beam_indices: Option<Vec<Vec<i64>>>,
}

pub fn decode<F>(
    step: F,
    start: &[i64],
    settings: &DecodeSettings,
    device: Device,
) -> Result<Decoded, ServiceError>
where
    F: FnMut(&Tensor) -> Result<Tensor, ServiceError>,
{
    if settings.num_beams > 1 {
        beam_search(step, start, settings, device)
    } else {
        sample(step, start, settings, device)
    }
}

fn sample<F>(
    mut step: F,
    start: &[i64],
    settings: &DecodeSettings,
    device: Device,
) -> Result<Decoded, ServiceError>
where
    F: FnMut(&Tensor) -> Result<Tensor, ServiceError>,
{
    let count = settings.num_return_sequences;
    let mut rows = vec![start.to_vec(); count];
    let mut finished = vec![false; count];
    let mut sum_logprobs = vec![0f32; count];
    let mut lengths = vec![0usize; count];
    let mut scores = Vec::new();

    for generated in 0..settings.max_new_tokens {
        let input = rows_tensor(&rows, device);
        let mut processed = constrain(step(&input)?, &rows, generated, settings);

        let next = if settings.do_sample {
            processed = warp(processed, settings);
            processed
                .softmax(-1, Kind::Float)
                .multinomial(1, false)
                .squeeze_dim(1)
        } else {
            processed.argmax(-1, false)
        };

        if settings.collect_scores {
            scores.push(to_f32_rows(&processed)?);
        }

        let chosen = processed
            .log_softmax(-1, Kind::Float)
            .gather(1, &next.unsqueeze(1), false)
            .squeeze_dim(1);
        let next = to_i64s(&next)?;
        let chosen = to_f32s(&chosen)?;

        for (row, tokens) in rows.iter_mut().enumerate() {
            if finished[row] {
                tokens.push(settings.pad);
                continue;
            }
            tokens.push(next[row]);
            sum_logprobs[row] += chosen[row];
            lengths[row] += 1;
            finished[row] = settings.is_eos(next[row]);
        }

        if finished.iter().all(|&done| done) {
            break;
        }
    }

    let sequences_scores = sum_logprobs
        .iter()
        .zip(&lengths)
        .map(|(&sum, &len)| settings.normalized_score(sum, len))
        .collect();

    Ok(Decoded {
        sequences: rows,
        sequences_scores,
        scores,
        beam_indices: None,
    })
}

fn beam_search<F>(
    mut step: F,
    start: &[i64],
    settings: &DecodeSettings,
    device: Device,
) -> Result<Decoded, ServiceError>
where
    F: FnMut(&Tensor) -> Result<Tensor, ServiceError>,
{
    let beams = settings.num_beams;
    let prompt_len = start.len();

    let mut rows = vec![start.to_vec(); beams];
    // Deterministic search starts from a single live beam so the first step
    // does not pick the same token `beams` times.
    let initial: Vec<f32> = (0..beams)
        .map(|beam| if beam == 0 || settings.do_sample { 0.0 } else { -1e9 })
        .collect();
    // `beam_scores` ranks candidates and holds warped scores when sampling;
    // `sum_logprobs` always holds the plain log-probability of each beam.
    let mut beam_scores = initial.clone();
    let mut sum_logprobs = initial;
    let mut histories: Vec<Vec<i64>> = vec![Vec::new(); beams];
    let mut hypotheses = BeamHypotheses::new(beams, settings.early_stopping);
    let mut scores = Vec::new();
    let mut done = false;

    for generated in 0..settings.max_new_tokens {
        let input = rows_tensor(&rows, device);
        let log_probs = constrain(
            step(&input)?.log_softmax(-1, Kind::Float),
            &rows,
            generated,
            settings,
        );
        let processed = if settings.do_sample {
            warp(log_probs.shallow_clone(), settings)
        } else {
            log_probs.shallow_clone()
        };
        if settings.collect_scores {
            scores.push(to_f32_rows(&processed)?);
        }

        let running = Tensor::from_slice(&beam_scores)
            .to_device(processed.device())
            .unsqueeze(1);
        let totals = processed + running;
        let vocab = totals.size()[1];
        let (candidate_scores, candidate_ids) =
            select_candidates(&totals.view([-1]), 2 * beams, settings.do_sample)?;
        let candidate_logprobs = to_f32s(&log_probs.reshape([-1]).index_select(
            0,
            &Tensor::from_slice(&candidate_ids).to_device(log_probs.device()),
        ))?;

        let mut next: Vec<Candidate> = Vec::with_capacity(beams);
        for (rank, ((&score, &id), &logprob)) in candidate_scores
            .iter()
            .zip(&candidate_ids)
            .zip(&candidate_logprobs)
            .enumerate()
        {
            let beam = (id / vocab) as usize;
            let token = id % vocab;
            let sum = sum_logprobs[beam] + logprob;

            if settings.is_eos(token) {
                if rank >= beams {
                    continue;
                }
                let mut tokens = rows[beam].clone();
                tokens.push(token);
                let mut path = histories[beam].clone();
                path.push(beam as i64);
                hypotheses.add(Hypothesis {
                    tokens,
                    score: settings.normalized_score(sum, generated + 1),
                    beam_indices: path,
                });
            } else {
                next.push(Candidate {
                    beam,
                    token,
                    score,
                    sum,
                });
            }

            if next.len() == beams {
                break;
            }
        }

        let Some(&filler) = next.first() else {
            break;
        };
        while next.len() < beams {
            next.push(Candidate {
                score: -1e9,
                sum: -1e9,
                ..filler
            });
        }

        let best_running = next
            .iter()
            .map(|candidate| candidate.sum)
            .fold(f32::NEG_INFINITY, f32::max);

        rows = next
            .iter()
            .map(|candidate| {
                let mut tokens = rows[candidate.beam].clone();
                tokens.push(candidate.token);
                tokens
            })
            .collect();
        histories = next
            .iter()
            .map(|candidate| {
                let mut path = histories[candidate.beam].clone();
                path.push(candidate.beam as i64);
                path
            })
            .collect();
        beam_scores = next.iter().map(|candidate| candidate.score).collect();
        sum_logprobs = next.iter().map(|candidate| candidate.sum).collect();

        if hypotheses.is_done(settings.normalized_score(best_running, generated + 1)) {
            done = true;
            break;
        }
    }

    if !done {
        for (beam, tokens) in rows.into_iter().enumerate() {
            let generated = tokens.len() - prompt_len;
            hypotheses.add(Hypothesis {
                tokens,
                score: settings.normalized_score(sum_logprobs[beam], generated),
                beam_indices: histories[beam].clone(),
            });
        }
    }

    let best: Vec<Hypothesis> = hypotheses
        .into_sorted()
        .into_iter()
        .take(settings.num_return_sequences)
        .collect();

    Ok(Decoded {
        sequences_scores: best.iter().map(|h| h.score).collect(),
        beam_indices: Some(best.iter().map(|h| h.beam_indices.clone()).collect()),
        sequences: best.into_iter().map(|h| h.tokens).collect(),
        scores,
    })
}

/// One extension of a live beam considered at a decoding step.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    beam: usize,
    token: i64,
    score: f32,
    sum: f32,
}

#[derive(Debug, Clone)]
struct Hypothesis {
    tokens: Vec<i64>,
    score: f32,
    beam_indices: Vec<i64>,
}

/// The `capacity` best finished sequences seen so far.
struct BeamHypotheses {
    capacity: usize,
    early_stopping: bool,
    kept: Vec<Hypothesis>,
}

impl BeamHypotheses {
    fn new(capacity: usize, early_stopping: bool) -> Self {
        Self {
            capacity,
            early_stopping,
            kept: Vec::with_capacity(capacity + 1),
        }
    }

    fn worst(&self) -> f32 {
        self.kept
            .iter()
            .map(|h| h.score)
            .fold(f32::INFINITY, f32::min)
    }

    fn add(&mut self, hypothesis: Hypothesis) {
        if self.kept.len() >= self.capacity && hypothesis.score <= self.worst() {
            return;
        }
        self.kept.push(hypothesis);
        if self.kept.len() > self.capacity {
            let worst = self
                .kept
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.score.total_cmp(&b.1.score))
                .map(|(idx, _)| idx);
            if let Some(idx) = worst {
                self.kept.remove(idx);
            }
        }
    }

    /// `best_running` is the normalized score of the best live beam.
    fn is_done(&self, best_running: f32) -> bool {
        if self.kept.len() < self.capacity {
            false
        } else if self.early_stopping {
            true
        } else {
            best_running <= self.worst()
        }
    }

    fn into_sorted(mut self) -> Vec<Hypothesis> {
        self.kept.sort_by(|a, b| b.score.total_cmp(&a.score));
        self.kept
    }
}

fn select_candidates(
    flat: &Tensor,
    wanted: usize,
    sample: bool,
) -> Result<(Vec<f32>, Vec<i64>), ServiceError> {
    let total = flat.size()[0];
    if sample {
        let available = flat.isfinite().sum(Kind::Int64).int64_value(&[]);
        let count = (wanted as i64).min(available).max(1);
        let picked = flat.softmax(-1, Kind::Float).multinomial(count, false);
        let (sorted, order) = flat.gather(0, &picked, false).sort(0, true);
        let ids = picked.gather(0, &order, false);
        Ok((to_f32s(&sorted)?, to_i64s(&ids)?))
    } else {
        let (values, ids) = flat.topk((wanted as i64).min(total), 0, true, true);
        Ok((to_f32s(&values)?, to_i64s(&ids)?))
    }
}

/// Repetition penalty, n-gram blocking and minimum-length EOS suppression.
fn constrain(
    scores: Tensor,
    rows: &[Vec<i64>],
    generated: usize,
    settings: &DecodeSettings,
) -> Tensor {
    let mut scores = scores;
    let vocab = scores.size()[1];

    if settings.repetition_penalty != 1.0 {
        let seen = rows_tensor(rows, scores.device());
        let previous = scores.gather(1, &seen, false);
        let penalized = (&previous * settings.repetition_penalty)
            .where_self(&previous.lt(0.0), &(&previous / settings.repetition_penalty));
        scores = scores.scatter(1, &seen, &penalized);
    }

    if settings.no_repeat_ngram_size > 0 {
        let banned: Vec<i64> = rows
            .iter()
            .enumerate()
            .flat_map(|(row, tokens)| {
                banned_ngram_tokens(tokens, settings.no_repeat_ngram_size)
                    .into_iter()
                    .filter(move |&token| (0..vocab).contains(&token))
                    .map(move |token| row as i64 * vocab + token)
            })
            .collect();
        if !banned.is_empty() {
            let banned = Tensor::from_slice(&banned).to_device(scores.device());
            scores = scores
                .reshape([-1])
                .index_fill(0, &banned, f64::NEG_INFINITY)
                .reshape([-1, vocab]);
        }
    }

    if generated < settings.min_new_tokens {
        let eos: Vec<i64> = settings
            .eos
            .iter()
            .copied()
            .filter(|&id| (0..vocab).contains(&id))
            .collect();
        if !eos.is_empty() {
            let eos = Tensor::from_slice(&eos).to_device(scores.device());
            scores = scores.index_fill(1, &eos, f64::NEG_INFINITY);
        }
    }

    scores
}

/// Tokens that would complete an n-gram of `size` already present in `row`.
fn banned_ngram_tokens(row: &[i64], size: usize) -> Vec<i64> {
    if size == 0 || row.len() + 1 < size {
        return Vec::new();
    }
    let prefix = &row[row.len() + 1 - size..];
    row.windows(size)
        .filter(|gram| &gram[..size - 1] == prefix)
        .map(|gram| gram[size - 1])
        .collect()
}

/// Temperature, top-k and top-p warpers; only applied when sampling.
fn warp(scores: Tensor, settings: &DecodeSettings) -> Tensor {
    let mut scores = scores;
    let vocab = scores.size()[1];

    if settings.temperature != 1.0 {
        scores = scores / settings.temperature;
    }

    if settings.top_k > 0 && (settings.top_k as i64) < vocab {
        let (top, _) = scores.topk(settings.top_k as i64, -1, true, true);
        let threshold = top.select(-1, settings.top_k as i64 - 1).unsqueeze(-1);
        scores = scores.masked_fill(&scores.lt_tensor(&threshold), f64::NEG_INFINITY);
    }

    if settings.top_p < 1.0 {
        let (sorted, order) = scores.sort(-1, false);
        let cumulative = sorted
            .softmax(-1, Kind::Float)
            .cumsum(-1, Kind::Float);
        let remove = cumulative.le(1.0 - settings.top_p);
        // the most likely token always survives
        let _ = remove.narrow(-1, vocab - 1, 1).fill_(0);
        let mask = remove.scatter(-1, &order, &remove);
        scores = scores.masked_fill(&mask, f64::NEG_INFINITY);
    }

    scores
}

fn rows_tensor(rows: &[Vec<i64>], device: Device) -> Tensor {
    let width = rows.first().map_or(0, Vec::len) as i64;
    let flat: Vec<i64> = rows.iter().flatten().copied().collect();
    Tensor::from_slice(&flat)
        .reshape([rows.len() as i64, width])
        .to_device(device)
}

fn to_i64s(tensor: &Tensor) -> Result<Vec<i64>, ServiceError> {
    Ok(Vec::<i64>::try_from(
        &tensor.to_device(Device::Cpu).to_kind(Kind::Int64).view([-1]),
    )?)
}

fn to_f32s(tensor: &Tensor) -> Result<Vec<f32>, ServiceError> {
    Ok(Vec::<f32>::try_from(
        &tensor.to_device(Device::Cpu).to_kind(Kind::Float).view([-1]),
    )?)
}

fn to_f32_rows(tensor: &Tensor) -> Result<Vec<Vec<f32>>, ServiceError> {
    Ok(Vec::<Vec<f32>>::try_from(
        &tensor.to_device(Device::Cpu).to_kind(Kind::Float),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DecodeSettings {
        DecodeSettings {
            max_new_tokens: 10,
            min_new_tokens: 0,
            no_repeat_ngram_size: 0,
            do_sample: false,
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            num_beams: 1,
            num_return_sequences: 1,
            length_penalty: 1.0,
            early_stopping: false,
            eos: vec![3],
            pad: 0,
            collect_scores: false,
        }
    }

    fn fixed_logits(rows: &Tensor, values: [f32; 4]) -> Tensor {
        let n = rows.size()[0];
        Tensor::from_slice(&values).unsqueeze(0).repeat([n, 1])
    }

    #[test]
    fn greedy_follows_argmax_until_eos() {
        let step = |rows: &Tensor| {
            let values = if rows.size()[1] < 3 {
                [0.0, 5.0, 1.0, 0.0]
            } else {
                [0.0, 0.0, 0.0, 9.0]
            };
            Ok(fixed_logits(rows, values))
        };

        let decoded = decode(step, &[0], &settings(), Device::Cpu).unwrap();
        assert_eq!(decoded.sequences, vec![vec![0, 1, 1, 3]]);
        assert!(decoded.sequences_scores[0] < 0.0);
        assert!(decoded.beam_indices.is_none());
    }

    #[test]
    fn greedy_stops_at_max_new_tokens_and_collects_scores() {
        let settings = DecodeSettings {
            max_new_tokens: 2,
            collect_scores: true,
            ..settings()
        };
        let step = |rows: &Tensor| Ok(fixed_logits(rows, [0.0, 5.0, 1.0, 0.0]));

        let decoded = decode(step, &[2, 2], &settings, Device::Cpu).unwrap();
        assert_eq!(decoded.sequences, vec![vec![2, 2, 1, 1]]);
        assert_eq!(decoded.scores.len(), 2);
        assert_eq!(decoded.scores[0].len(), 1);
        assert_eq!(decoded.scores[0][0].len(), 4);
    }

    #[test]
    fn min_new_tokens_suppresses_eos() {
        let settings = DecodeSettings {
            min_new_tokens: 2,
            max_new_tokens: 3,
            ..settings()
        };
        let step = |rows: &Tensor| Ok(fixed_logits(rows, [0.0, 1.0, 0.0, 9.0]));

        let decoded = decode(step, &[0], &settings, Device::Cpu).unwrap();
        assert_eq!(decoded.sequences, vec![vec![0, 1, 1, 3]]);
    }

    #[test]
    fn sampling_returns_the_requested_number_of_rows() {
        let settings = DecodeSettings {
            do_sample: true,
            num_return_sequences: 3,
            max_new_tokens: 4,
            ..settings()
        };
        let step = |rows: &Tensor| Ok(fixed_logits(rows, [1.0, 1.0, 1.0, 1.0]));

        let decoded = decode(step, &[0], &settings, Device::Cpu).unwrap();
        assert_eq!(decoded.sequences.len(), 3);
        assert!(decoded.sequences.iter().all(|row| row.len() <= 5 && row[0] == 0));
        // rows stay aligned, finished rows are padded
        assert!(decoded.sequences.iter().all(|row| row.len() == decoded.sequences[0].len()));
    }

    #[test]
    fn beam_search_keeps_best_hypotheses_in_order() {
        let settings = DecodeSettings {
            num_beams: 2,
            num_return_sequences: 2,
            ..settings()
        };
        let step = |rows: &Tensor| Ok(fixed_logits(rows, [1.0, 2.0, 0.5, 3.0]));

        let decoded = decode(step, &[0], &settings, Device::Cpu).unwrap();
        assert_eq!(decoded.sequences, vec![vec![0, 3], vec![0, 1, 3]]);
        assert!(decoded.sequences_scores[0] > decoded.sequences_scores[1]);
        assert_eq!(decoded.beam_indices.map(|paths| paths.len()), Some(2));
    }

    #[test]
    fn top_p_keeps_only_the_nucleus() {
        let settings = DecodeSettings {
            top_p: 0.5,
            ..settings()
        };
        let scores = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0]).unsqueeze(0);
        let warped = to_f32s(&warp(scores, &settings)).unwrap();

        assert!(warped[..3].iter().all(|v| v.is_infinite()));
        assert_eq!(warped[3], 4.0);
    }

    #[test]
    fn top_k_masks_everything_below_the_kth_score() {
        let settings = DecodeSettings {
            top_k: 2,
            ..settings()
        };
        let scores = Tensor::from_slice(&[1.0f32, 4.0, 3.0, 2.0]).unsqueeze(0);
        let warped = to_f32s(&warp(scores, &settings)).unwrap();

        assert!(warped[0].is_infinite() && warped[3].is_infinite());
        assert_eq!(&warped[1..3], &[4.0, 3.0]);
    }

    #[test]
    fn repetition_penalty_discounts_seen_tokens() {
        let settings = DecodeSettings {
            repetition_penalty: 2.0,
            ..settings()
        };
        let scores = Tensor::from_slice(&[1.0f32, -1.0, 2.0]).unsqueeze(0);
        let penalized = to_f32s(&constrain(scores, &[vec![0, 1]], 0, &settings)).unwrap();

        assert_eq!(penalized, vec![0.5, -2.0, 2.0]);
    }

    #[test]
    fn beam_search_records_the_beam_each_token_came_from() {
        let settings = DecodeSettings {
            num_beams: 2,
            num_return_sequences: 2,
            max_new_tokens: 3,
            ..settings()
        };
        // Next-token logits depend only on the last token of each row.
        let step = |rows: &Tensor| -> Result<Tensor, ServiceError> {
            let last = to_i64s(&rows.select(1, -1))?;
            let values: Vec<f32> = last
                .iter()
                .flat_map(|&token| match token {
                    0 => [0.0, 2.0, 1.9, -5.0],
                    1 => [0.0, 3.0, 2.0, -5.0],
                    _ => [-5.0, -5.0, -5.0, 5.0],
                })
                .collect();
            Ok(Tensor::from_slice(&values).reshape([last.len() as i64, 4]))
        };

        let decoded = decode(step, &[0], &settings, Device::Cpu).unwrap();
        assert_eq!(decoded.sequences, vec![vec![0, 2, 3], vec![0, 1, 1, 1]]);
        assert_eq!(decoded.beam_indices, Some(vec![vec![0, 1], vec![0, 0, 0]]));
        assert!(decoded.sequences_scores[0] > decoded.sequences_scores[1]);
    }

    #[test]
    fn beam_sampling_scores_each_step_once() {
        let settings = DecodeSettings {
            do_sample: true,
            temperature: 0.35,
            num_beams: 2,
            num_return_sequences: 2,
            max_new_tokens: 3,
            eos: vec![99],
            ..settings()
        };
        let step = |rows: &Tensor| Ok(fixed_logits(rows, [1.0, 1.0, 1.0, 1.0]));

        let decoded = decode(step, &[0], &settings, Device::Cpu).unwrap();
        assert_eq!(decoded.sequences.len(), 2);
        assert!(decoded.sequences.iter().all(|row| row.len() == 4 && row[0] == 0));
        assert!(decoded.sequences_scores[0] >= decoded.sequences_scores[1]);
        // every token has probability 1/4, whatever the temperature
        let per_token = 0.25f32.ln();
        assert!(
            decoded
                .sequences_scores
                .iter()
                .all(|score| (score - per_token).abs() < 1e-4),
            "{:?}",
            decoded.sequences_scores
        );
        assert_eq!(decoded.beam_indices.map(|paths| paths[0].len()), Some(3));
    }

    #[test]
    fn no_repeat_ngram_size_blocks_repeated_pairs() {
        let settings = DecodeSettings {
            no_repeat_ngram_size: 2,
            max_new_tokens: 4,
            ..settings()
        };
        let step = |rows: &Tensor| Ok(fixed_logits(rows, [0.0, 5.0, 1.0, 0.0]));

        let decoded = decode(step, &[0], &settings, Device::Cpu).unwrap();
        assert_eq!(decoded.sequences, vec![vec![0, 1, 1, 2, 1]]);
    }

    #[test]
    fn banned_tokens_complete_seen_ngrams() {
        assert_eq!(banned_ngram_tokens(&[5, 6, 7, 5, 6], 3), vec![7]);
        assert_eq!(banned_ngram_tokens(&[4, 2], 1), vec![4, 2]);
        assert!(banned_ngram_tokens(&[1], 3).is_empty());
        assert!(banned_ngram_tokens(&[1, 1], 0).is_empty());
    }
}
