//! Decode loop of one submitted job, run on its own thread.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Error as E, Result};
use candle_core::{DType, Device, Tensor};
use inference_protocol::{FinishReason, FinishRecord};
use tracing::{debug, warn};

use super::sampler::LogitsSampler;
use super::{lock, CandleModel};
use crate::native::{SamplerStage, TokenId, WorkRequest};

/// Push side of a readback buffer. The worker appends, the kernel polls.
#[derive(Default)]
pub(super) struct ReadbackBuffer {
    inner: Mutex<BufferState>,
}

#[derive(Default)]
struct BufferState {
    chunks: VecDeque<(String, TokenId)>,
    status: Option<String>,
    finished: bool,
}

impl ReadbackBuffer {
    fn push(&self, text: String, token: TokenId) {
        lock(&self.inner).chunks.push_back((text, token));
    }

    fn finish(&self, status: String) {
        let mut state = lock(&self.inner);
        state.status = Some(status);
        state.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        lock(&self.inner).finished
    }

    pub fn pop(&self) -> Option<(String, TokenId)> {
        lock(&self.inner).chunks.pop_front()
    }

    pub fn status(&self) -> Option<String> {
        lock(&self.inner).status.clone()
    }
}

pub(super) struct Job {
    pub model: Arc<CandleModel>,
    pub n_ctx: u32,
    pub buffer: Arc<ReadbackBuffer>,
    pub stages: Vec<SamplerStage>,
    pub request: WorkRequest,
    pub cancel: Arc<AtomicBool>,
}

struct Outcome {
    prompt_tokens: u32,
    gen_tokens: u32,
    prompt_sec: f64,
    gen_sec: f64,
    reason: FinishReason,
    stop_token: String,
}

impl Outcome {
    fn early(reason: FinishReason, prompt_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            gen_tokens: 0,
            prompt_sec: 0.0,
            gen_sec: 0.0,
            reason,
            stop_token: String::new(),
        }
    }

    fn into_record(self) -> FinishRecord {
        let rate = |tokens: u32, secs: f64| if secs > 0.0 { f64::from(tokens) / secs } else { 0.0 };
        FinishRecord {
            prompt_tokens: self.prompt_tokens,
            gen_tokens: self.gen_tokens,
            prompt_sec: self.prompt_sec,
            gen_sec: self.gen_sec,
            prompt_tokens_per_sec: rate(self.prompt_tokens, self.prompt_sec),
            gen_tokens_per_sec: rate(self.gen_tokens, self.gen_sec),
            finish_reason: self.reason,
            stop_token: self.stop_token,
        }
    }
}

pub(super) fn run(job: Job) {
    finish_guarded(&job.buffer, || decode(&job));
}

/// Runs `body` and always finishes `buffer`, even when the decode panics.
fn finish_guarded(buffer: &ReadbackBuffer, body: impl FnOnce() -> Result<Outcome>) {
    let outcome = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            warn!(error = %e, "decode failed");
            Outcome::early(FinishReason::BatchDecode, 0)
        }
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            warn!(panic = %message, "decode panicked");
            Outcome::early(FinishReason::BatchDecode, 0)
        }
    };

    let status = serde_json::to_string(&outcome.into_record()).unwrap_or_default();
    buffer.finish(status);
}

/// Pushes `text[start..end]` when the range is non-empty and on char boundaries.
fn push_range(buffer: &ReadbackBuffer, text: &str, start: usize, end: usize, token: TokenId) -> bool {
    match text.get(start..end) {
        Some(piece) if !piece.is_empty() => {
            buffer.push(piece.to_string(), token);
            true
        }
        _ => false,
    }
}

fn decode(job: &Job) -> Result<Outcome> {
    let model = &job.model;
    let request = &job.request;

    if !request.rewind_strings.is_empty() {
        debug!(count = request.rewind_strings.len(), "banned strings are not enforced by this backend");
    }

    let prompt_ids = match model.tokenizer.encode(request.prompt.as_str(), request.add_special) {
        Ok(encoding) => encoding.get_ids().to_vec(),
        Err(e) => {
            warn!(error = %e, "prompt tokenization failed");
            return Ok(Outcome::early(FinishReason::TokenEncode, 0));
        }
    };
    if prompt_ids.is_empty() {
        return Ok(Outcome::early(FinishReason::TokenEncode, 0));
    }

    let prompt_tokens = prompt_ids.len() as u32;
    let max_seq = match request.max_seq_len {
        0 => job.n_ctx,
        n => n.min(job.n_ctx),
    } as usize;
    if prompt_ids.len() >= max_seq {
        return Ok(Outcome::early(FinishReason::CtxExceeded, prompt_tokens));
    }

    let mut stop_ids: Vec<u32> = request
        .stop_tokens
        .iter()
        .filter_map(|t| u32::try_from(*t).ok())
        .collect();
    stop_ids.extend(model.special.eos);
    stop_ids.extend(model.special.eot);

    let device = Device::Cpu;
    let mut weights = lock(&model.weights);

    let started = Instant::now();
    let input = Tensor::new(prompt_ids.as_slice(), &device)?.unsqueeze(0)?;
    let mut logits = to_logits(weights.forward(&input, 0)?)?;
    let prompt_sec = started.elapsed().as_secs_f64();

    let mut sampler = LogitsSampler::new(job.stages.clone());
    let mut history = prompt_ids.clone();
    let mut generated: Vec<u32> = Vec::new();
    let mut text = String::new();
    let mut emitted = 0usize;
    let gen_started = Instant::now();

    let finish = |gen_tokens: usize, reason: FinishReason, stop_token: String| Outcome {
        prompt_tokens,
        gen_tokens: gen_tokens as u32,
        prompt_sec,
        gen_sec: gen_started.elapsed().as_secs_f64(),
        reason,
        stop_token,
    };

    loop {
        if job.cancel.load(Ordering::Acquire) {
            return Ok(finish(generated.len(), FinishReason::Aborted, String::new()));
        }

        if (generated.len() as u32) < request.min_tokens {
            for &id in &stop_ids {
                if let Some(logit) = logits.get_mut(id as usize) {
                    *logit = f32::NEG_INFINITY;
                }
            }
        }

        let next = sampler.sample(&mut logits, &history)?;
        if stop_ids.contains(&next) {
            let piece = model.tokenizer.id_to_token(next).unwrap_or_default();
            return Ok(finish(generated.len(), FinishReason::StopToken, piece));
        }

        history.push(next);
        generated.push(next);
        let decoded = model.tokenizer.decode(&generated, true).map_err(E::msg)?;
        // An incomplete UTF-8 sequence decodes to a replacement char; wait for more.
        if !decoded.ends_with('\u{FFFD}') && decoded.len() >= text.len() {
            text = decoded;
        }

        if let Some((pos, stop)) = first_stop(&text, &request.stop_strings) {
            push_range(&job.buffer, &text, emitted, pos, next as TokenId);
            return Ok(finish(generated.len(), FinishReason::StopString, stop.to_string()));
        }

        // The detokenized text can be rewritten behind the cursor; resync on a boundary.
        if !text.is_char_boundary(emitted) {
            emitted = floor_boundary(&text, emitted);
        }
        let pending = text.get(emitted..).unwrap_or_default();
        let safe = text.len() - held_prefix_len(pending, &request.stop_strings);
        if push_range(&job.buffer, &text, emitted, safe, next as TokenId) {
            emitted = safe;
        }

        if generated.len() as u32 >= request.max_tokens || history.len() >= max_seq {
            push_range(&job.buffer, &text, emitted, text.len(), next as TokenId);
            return Ok(finish(generated.len(), FinishReason::MaxNewTokens, String::new()));
        }

        let input = Tensor::new(&[next], &device)?.unsqueeze(0)?;
        logits = to_logits(weights.forward(&input, history.len() - 1)?)?;
    }
}

fn to_logits(raw: Tensor) -> Result<Vec<f32>> {
    Ok(raw.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
}

fn floor_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Earliest complete stop string in `text`.
fn first_stop<'a>(text: &str, stops: &'a [String]) -> Option<(usize, &'a str)> {
    stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()).map(|pos| (pos, s.as_str())))
        .min_by_key(|(pos, _)| *pos)
}

/// Length of the longest tail of `pending` that could still grow into a stop string.
fn held_prefix_len(pending: &str, stops: &[String]) -> usize {
    let mut held = 0;
    for stop in stops.iter().filter(|s| !s.is_empty()) {
        for (idx, _) in pending.char_indices() {
            let tail = &pending[idx..];
            if tail.len() > held && stop.starts_with(tail) {
                held = tail.len();
                break;
            }
        }
    }
    held
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stops(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn earliest_stop_wins() {
        let list = stops(&["World", "lo"]);
        assert_eq!(first_stop("Hello World", &list), Some((3, "lo")));
        assert_eq!(first_stop("Hi", &list), None);
    }

    #[test]
    fn partial_stop_is_held_back() {
        let list = stops(&["</answer>"]);
        assert_eq!(held_prefix_len("result </ans", &list), 5);
        assert_eq!(held_prefix_len("result", &list), 0);
    }

    #[test]
    fn buffer_reports_status_after_finish() {
        let buffer = ReadbackBuffer::default();
        buffer.push("a".to_string(), 5);
        assert!(!buffer.is_finished());
        buffer.finish("{}".to_string());
        assert!(buffer.is_finished());
        assert_eq!(buffer.pop(), Some(("a".to_string(), 5)));
        assert_eq!(buffer.pop(), None);
        assert_eq!(buffer.status().as_deref(), Some("{}"));
    }

    fn finished_reason(buffer: &ReadbackBuffer) -> FinishReason {
        let status = buffer.status().expect("status");
        let record: FinishRecord = serde_json::from_str(&status).expect("record");
        record.finish_reason
    }

    #[test]
    fn panicking_decode_still_finishes_the_buffer() {
        let buffer = ReadbackBuffer::default();
        finish_guarded(&buffer, || panic!("tensor shape mismatch"));
        assert!(buffer.is_finished());
        assert_eq!(finished_reason(&buffer), FinishReason::BatchDecode);
    }

    #[test]
    fn failed_decode_finishes_with_batch_decode() {
        let buffer = ReadbackBuffer::default();
        finish_guarded(&buffer, || Err(anyhow::anyhow!("forward failed")));
        assert!(buffer.is_finished());
        assert_eq!(finished_reason(&buffer), FinishReason::BatchDecode);
    }

    #[test]
    fn ranges_off_char_boundaries_are_skipped() {
        let buffer = ReadbackBuffer::default();
        let text = "h\u{e9}llo";
        // Byte 2 sits inside the two-byte 'é'.
        assert!(!push_range(&buffer, text, 2, text.len(), 1));
        assert!(!push_range(&buffer, text, 0, 99, 1));
        assert!(!push_range(&buffer, text, 3, 3, 1));
        assert!(push_range(&buffer, text, 0, 3, 1));
        assert_eq!(buffer.pop(), Some(("h\u{e9}".to_string(), 1)));
        assert_eq!(floor_boundary(text, 2), 1);
        assert_eq!(floor_boundary(text, 40), text.len());
    }

    #[test]
    fn record_rates_guard_zero_durations() {
        let record = Outcome::early(FinishReason::CtxExceeded, 12).into_record();
        assert_eq!(record.prompt_tokens, 12);
        assert_eq!(record.prompt_tokens_per_sec, 0.0);
        assert_eq!(record.finish_reason, FinishReason::CtxExceeded);
    }
}
