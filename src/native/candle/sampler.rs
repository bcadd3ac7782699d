//! Logit transforms for the sampler stages this backend understands.
//!
//! Filtering stages mask rejected candidates with `-inf`; the final draw is
//! a seeded multinomial over what is left.

use std::collections::HashMap;

use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use tracing::trace;

use crate::native::SamplerStage;

pub(super) struct LogitsSampler {
    stages: Vec<SamplerStage>,
    processor: LogitsProcessor,
}

impl LogitsSampler {
    pub fn new(stages: Vec<SamplerStage>) -> Self {
        let seed = stages.iter().find_map(|stage| match stage {
            SamplerStage::Dist { seed } => Some(*seed),
            _ => None,
        });
        let processor = match seed {
            Some(seed) => LogitsProcessor::from_sampling(u64::from(seed), Sampling::All { temperature: 1.0 }),
            None => LogitsProcessor::from_sampling(0, Sampling::ArgMax),
        };

        for stage in &stages {
            if matches!(
                stage,
                SamplerStage::Dry { .. } | SamplerStage::Xtc { .. } | SamplerStage::MirostatV2 { .. }
            ) {
                trace!(stage = stage.name(), "stage not available in this backend, skipped");
            }
        }

        Self { stages, processor }
    }

    pub fn sample(&mut self, logits: &mut [f32], history: &[u32]) -> Result<u32> {
        for stage in &self.stages {
            apply_stage(stage, logits, history);
        }
        let tensor = Tensor::new(&*logits, &Device::Cpu)?;
        Ok(self.processor.sample(&tensor)?)
    }
}

pub(super) fn apply_stage(stage: &SamplerStage, logits: &mut [f32], history: &[u32]) {
    match stage {
        SamplerStage::LogitBias(bias) => {
            for (&token, &value) in bias {
                if let Some(logit) = usize::try_from(token).ok().and_then(|t| logits.get_mut(t)) {
                    *logit += value;
                }
            }
        }
        SamplerStage::Penalties {
            last_n,
            repeat,
            frequency,
            presence,
        } => apply_penalties(logits, history, *last_n, *repeat, *frequency, *presence),
        SamplerStage::Temperature(t) if *t <= 0.0 => keep_argmax(logits),
        SamplerStage::Temperature(t) => {
            if (*t - 1.0).abs() > f32::EPSILON {
                logits.iter_mut().for_each(|l| *l /= *t);
            }
        }
        SamplerStage::TopNSigma(n) => top_n_sigma(logits, *n),
        SamplerStage::TopK(k) => top_k(logits, *k),
        SamplerStage::TopP { p, min_keep } => top_p(logits, *p, *min_keep),
        SamplerStage::MinP { p, min_keep } => min_p(logits, *p, *min_keep),
        SamplerStage::Typical { p, min_keep } => typical(logits, *p, *min_keep),
        _ => {}
    }
}

fn apply_penalties(logits: &mut [f32], history: &[u32], last_n: i32, repeat: f32, frequency: f32, presence: f32) {
    if last_n == 0 || (repeat == 1.0 && frequency == 0.0 && presence == 0.0) {
        return;
    }
    let window = match usize::try_from(last_n) {
        Ok(n) => &history[history.len().saturating_sub(n)..],
        Err(_) => history,
    };

    let mut counts: HashMap<u32, usize> = HashMap::new();
    for &token in window {
        *counts.entry(token).or_default() += 1;
    }

    for (token, count) in counts {
        let Some(logit) = logits.get_mut(token as usize) else {
            continue;
        };
        *logit = if *logit > 0.0 { *logit / repeat } else { *logit * repeat };
        *logit -= count as f32 * frequency + presence;
    }
}

fn keep_argmax(logits: &mut [f32]) {
    let best = logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(idx, _)| idx);
    for (idx, logit) in logits.iter_mut().enumerate() {
        if Some(idx) != best {
            *logit = f32::NEG_INFINITY;
        }
    }
}

fn top_k(logits: &mut [f32], k: i32) {
    let Ok(k) = usize::try_from(k) else { return };
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut sorted: Vec<f32> = logits.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let threshold = sorted[k - 1];
    logits.iter_mut().filter(|l| **l < threshold).for_each(|l| *l = f32::NEG_INFINITY);
}

fn top_n_sigma(logits: &mut [f32], n: f32) {
    let finite: Vec<f32> = logits.iter().copied().filter(|l| l.is_finite()).collect();
    if finite.is_empty() {
        return;
    }
    let max = finite.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mean = finite.iter().sum::<f32>() / finite.len() as f32;
    let var = finite.iter().map(|l| (l - mean).powi(2)).sum::<f32>() / finite.len() as f32;
    let threshold = max - n * var.sqrt();
    logits.iter_mut().filter(|l| **l < threshold).for_each(|l| *l = f32::NEG_INFINITY);
}

/// Softmax over the finite logits, as `(index, prob)` sorted by prob desc.
fn ranked_probs(logits: &[f32]) -> Vec<(usize, f32)> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut ranked: Vec<(usize, f32)> = logits
        .iter()
        .enumerate()
        .filter(|(_, l)| l.is_finite())
        .map(|(idx, l)| (idx, (l - max).exp()))
        .collect();
    let sum: f32 = ranked.iter().map(|(_, p)| p).sum();
    if sum > 0.0 {
        ranked.iter_mut().for_each(|(_, p)| *p /= sum);
    }
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
}

fn keep_only(logits: &mut [f32], keep: &[usize]) {
    let mut mask = vec![false; logits.len()];
    for &idx in keep {
        mask[idx] = true;
    }
    for (logit, kept) in logits.iter_mut().zip(mask) {
        if !kept {
            *logit = f32::NEG_INFINITY;
        }
    }
}

fn top_p(logits: &mut [f32], p: f32, min_keep: usize) {
    if p >= 1.0 {
        return;
    }
    let ranked = ranked_probs(logits);
    let mut cumulative = 0.0;
    let mut keep = Vec::new();
    for (idx, prob) in ranked {
        keep.push(idx);
        cumulative += prob;
        if cumulative >= p && keep.len() >= min_keep.max(1) {
            break;
        }
    }
    keep_only(logits, &keep);
}

fn min_p(logits: &mut [f32], p: f32, min_keep: usize) {
    if p <= 0.0 {
        return;
    }
    let ranked = ranked_probs(logits);
    let Some(&(_, top)) = ranked.first() else { return };
    let keep: Vec<usize> = ranked
        .iter()
        .enumerate()
        .filter(|(rank, (_, prob))| *prob >= p * top || *rank < min_keep.max(1))
        .map(|(_, (idx, _))| *idx)
        .collect();
    keep_only(logits, &keep);
}

fn typical(logits: &mut [f32], p: f32, min_keep: usize) {
    if p >= 1.0 {
        return;
    }
    let ranked = ranked_probs(logits);
    let entropy: f32 = ranked
        .iter()
        .filter(|(_, prob)| *prob > 0.0)
        .map(|(_, prob)| -prob * prob.ln())
        .sum();

    let mut by_surprise: Vec<(usize, f32, f32)> = ranked
        .iter()
        .map(|&(idx, prob)| (idx, prob, (-prob.ln() - entropy).abs()))
        .collect();
    by_surprise.sort_by(|a, b| a.2.total_cmp(&b.2));

    let mut cumulative = 0.0;
    let mut keep = Vec::new();
    for (idx, prob, _) in by_surprise {
        keep.push(idx);
        cumulative += prob;
        if cumulative >= p && keep.len() >= min_keep.max(1) {
            break;
        }
    }
    keep_only(logits, &keep);
}
