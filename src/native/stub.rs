//! Deterministic in-memory backend.
//!
//! Nothing runs in the background: the buffer advances only when it is read,
//! which makes ordering and release bookkeeping observable from tests.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};

use inference_protocol::{FinishReason, FinishRecord};

use super::{
    BufferPtr, BundleId, ContextPtr, JobId, ModelPtr, NativeCapabilities, NativeError,
    NativeLibrary, NativeResult, ProcessorPtr, ResourceBundle, SamplerPtr, SamplerStage,
    SpecialToken, TokenId, WorkRequest,
};

const STUB_VOCAB: &[&str] = &[
    " the", " model", " says", " hello", " and", " then", " stops", " here", " again", " now",
    " quietly", " fast",
];
const DEFAULT_REPLY_LEN: usize = 8;
const DEFAULT_CTX_LEN: u32 = 4096;
const TOKEN_BASE: TokenId = 100;

/// Scripted outcome for one submitted job.
#[derive(Debug, Clone, PartialEq)]
pub struct StubReply {
    pub pieces: Vec<String>,
    pub finish_reason: FinishReason,
    pub stop_token: String,
    /// Reads that return nothing before the first fragment shows up.
    pub stall_reads: usize,
}

impl StubReply {
    pub fn text(pieces: &[&str]) -> Self {
        Self {
            pieces: pieces.iter().map(|p| p.to_string()).collect(),
            finish_reason: FinishReason::StopToken,
            stop_token: "</s>".to_string(),
            stall_reads: 0,
        }
    }

    pub fn stopped_by(mut self, reason: FinishReason, stop_token: &str) -> Self {
        self.finish_reason = reason;
        self.stop_token = stop_token.to_string();
        self
    }

    pub fn stalled(mut self, reads: usize) -> Self {
        self.stall_reads = reads;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StubSubmission {
    pub bundle: BundleId,
    pub request: WorkRequest,
    pub stages: Vec<SamplerStage>,
}

impl StubSubmission {
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(SamplerStage::name).collect()
    }
}

/// Blocks stub model loads until released or dropped.
pub struct LoadGate {
    tx: Sender<()>,
}

impl LoadGate {
    pub fn release(self) {
        let _ = self.tx.send(());
    }
}

#[derive(Debug, Default)]
struct StubBuffer {
    bundle: u64,
    submitted: bool,
    cancelled: bool,
    pending: VecDeque<(String, TokenId)>,
    stall_reads: usize,
    emitted: u32,
    prompt_tokens: u32,
    finish_reason: Option<FinishReason>,
    stop_token: String,
}

impl StubBuffer {
    fn is_finished(&self) -> bool {
        self.submitted && (self.cancelled || self.pending.is_empty())
    }
}

#[derive(Default)]
struct StubState {
    next_id: u64,
    models: HashMap<u64, String>,
    contexts: HashMap<u64, u32>,
    processors: HashMap<u64, u64>,
    chains: HashMap<u64, Vec<SamplerStage>>,
    bundles: HashMap<u64, ResourceBundle>,
    buffers: HashMap<u64, StubBuffer>,
    jobs: HashMap<u64, u64>,
    replies: VecDeque<StubReply>,
    submissions: Vec<StubSubmission>,
    releases: HashMap<u64, usize>,
    released_while_running: usize,
    cancels: usize,
    memory_clears: usize,
    freed_models: usize,
    fail_next_allocation: bool,
}

impl StubState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct StubLibrary {
    state: Mutex<StubState>,
    load_gate: Mutex<Option<Receiver<()>>>,
    capabilities: NativeCapabilities,
    chat_template: Option<String>,
}

impl Default for StubLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl StubLibrary {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StubState::default()),
            load_gate: Mutex::new(None),
            capabilities: NativeCapabilities {
                llguidance: true,
                gbnf: true,
            },
            chat_template: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: NativeCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_chat_template(mut self, template: impl Into<String>) -> Self {
        self.chat_template = Some(template.into());
        self
    }

    /// Queues the outcome of the next submitted job. Unscripted jobs get a
    /// deterministic reply derived from prompt, seed and temperature.
    pub fn push_reply(&self, reply: StubReply) {
        self.state().replies.push_back(reply);
    }

    /// Makes the next model load block until the gate is released.
    pub fn hold_loads(&self) -> LoadGate {
        let (tx, rx) = mpsc::channel();
        *self.load_gate.lock().unwrap_or_else(PoisonError::into_inner) = Some(rx);
        LoadGate { tx }
    }

    /// Makes the next `create_resources` call fail.
    pub fn fail_next_allocation(&self) {
        self.state().fail_next_allocation = true;
    }

    pub fn submissions(&self) -> Vec<StubSubmission> {
        self.state().submissions.clone()
    }

    pub fn submit_count(&self) -> usize {
        self.state().submissions.len()
    }

    pub fn release_count(&self, bundle: BundleId) -> usize {
        self.state().releases.get(&bundle.0).copied().unwrap_or(0)
    }

    pub fn total_releases(&self) -> usize {
        self.state().releases.values().sum()
    }

    pub fn released_while_running(&self) -> usize {
        self.state().released_while_running
    }

    pub fn cancel_count(&self) -> usize {
        self.state().cancels
    }

    pub fn memory_clears(&self) -> usize {
        self.state().memory_clears
    }

    pub fn freed_models(&self) -> usize {
        self.state().freed_models
    }

    pub fn live_models(&self) -> usize {
        self.state().models.len()
    }

    fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_for_gate(&self) {
        let gate = self
            .load_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(rx) = gate {
            let _ = rx.recv();
        }
    }
}

fn prompt_hash(prompt: &str) -> u64 {
    prompt.bytes().fold(0xcbf2_9ce4_8422_2325, |acc, b| {
        (acc ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

fn scripted_default(request: &WorkRequest, stages: &[SamplerStage]) -> StubReply {
    let greedy = stages
        .iter()
        .any(|stage| matches!(stage, SamplerStage::Temperature(t) if *t <= 0.0));
    let stride = if greedy {
        1
    } else {
        u64::from(request.seed % 7) + 2
    };
    let start = prompt_hash(&request.prompt);
    let pieces = (0..DEFAULT_REPLY_LEN as u64)
        .map(|i| {
            let idx = start.wrapping_add(i.wrapping_mul(stride)) % STUB_VOCAB.len() as u64;
            STUB_VOCAB[idx as usize].to_string()
        })
        .collect();

    StubReply {
        pieces,
        finish_reason: FinishReason::StopToken,
        stop_token: "</s>".to_string(),
        stall_reads: 0,
    }
}

impl NativeLibrary for StubLibrary {
    fn load_model(
        &self,
        path: &Path,
        _gpu_layers: i32,
        progress: &mut dyn FnMut(f32) -> bool,
    ) -> NativeResult<Option<ModelPtr>> {
        self.wait_for_gate();

        for step in [0.25_f32, 0.5, 1.0] {
            if !progress(step) {
                return Ok(None);
            }
        }

        let mut state = self.state();
        let id = state.next_id();
        state.models.insert(id, path.display().to_string());
        Ok(Some(ModelPtr(id)))
    }

    fn init_context(&self, model: ModelPtr, ctx_len: u32, _batches: u32) -> NativeResult<ContextPtr> {
        let mut state = self.state();
        if !state.models.contains_key(&model.0) {
            return Err(NativeError::msg("unknown model handle"));
        }
        let id = state.next_id();
        let len = if ctx_len == 0 { DEFAULT_CTX_LEN } else { ctx_len };
        state.contexts.insert(id, len);
        Ok(ContextPtr(id))
    }

    fn make_processor(&self, _model: ModelPtr, context: ContextPtr, _slots: u32) -> NativeResult<ProcessorPtr> {
        let mut state = self.state();
        let id = state.next_id();
        state.processors.insert(id, context.0);
        Ok(ProcessorPtr(id))
    }

    fn context_max_seq_len(&self, context: ContextPtr) -> u32 {
        self.state()
            .contexts
            .get(&context.0)
            .copied()
            .unwrap_or(DEFAULT_CTX_LEN)
    }

    fn clear_memory(&self, _context: ContextPtr) {
        self.state().memory_clears += 1;
    }

    fn free_processor(&self, processor: ProcessorPtr) {
        self.state().processors.remove(&processor.0);
    }

    fn free_context(&self, context: ContextPtr) {
        self.state().contexts.remove(&context.0);
    }

    fn free_model(&self, model: ModelPtr) {
        let mut state = self.state();
        if state.models.remove(&model.0).is_some() {
            state.freed_models += 1;
        }
    }

    fn special_token_id(&self, _model: ModelPtr, kind: SpecialToken) -> Option<TokenId> {
        Some(match kind {
            SpecialToken::Bos => 1,
            SpecialToken::Eos => 2,
            SpecialToken::Eot => 3,
        })
    }

    fn token_to_text(&self, _model: ModelPtr, token: TokenId) -> Option<String> {
        match token {
            1 => Some("<s>".to_string()),
            2 => Some("</s>".to_string()),
            3 => Some("<|im_end|>".to_string()),
            t if t >= TOKEN_BASE => STUB_VOCAB
                .get((t - TOKEN_BASE) as usize)
                .map(|p| p.to_string()),
            _ => None,
        }
    }

    fn add_bos_by_default(&self, _model: ModelPtr) -> bool {
        true
    }

    fn chat_template(&self, _model: ModelPtr) -> Option<String> {
        self.chat_template.clone()
    }

    fn capabilities(&self) -> NativeCapabilities {
        self.capabilities
    }

    fn sampler_append(&self, chain: SamplerPtr, _model: ModelPtr, stage: &SamplerStage) -> NativeResult<SamplerPtr> {
        let mut state = self.state();
        let stages = state
            .chains
            .get_mut(&chain.0)
            .ok_or_else(|| NativeError::msg("unknown sampler chain"))?;
        stages.push(stage.clone());
        Ok(chain)
    }

    fn create_resources(&self) -> NativeResult<ResourceBundle> {
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_allocation) {
            return Err(NativeError::msg("readback buffer allocation failed"));
        }
        let id = state.next_id();
        let bundle = ResourceBundle {
            id: BundleId(id),
            buffer: BufferPtr(id),
            sampler: SamplerPtr(id),
        };
        state.chains.insert(id, Vec::new());
        state.buffers.insert(
            id,
            StubBuffer {
                bundle: id,
                ..StubBuffer::default()
            },
        );
        state.bundles.insert(id, bundle);
        Ok(bundle)
    }

    fn buffer_is_finished(&self, buffer: BufferPtr) -> bool {
        self.state()
            .buffers
            .get(&buffer.0)
            .map(StubBuffer::is_finished)
            .unwrap_or(true)
    }

    fn buffer_read_next(&self, buffer: BufferPtr) -> Option<(String, TokenId)> {
        let mut state = self.state();
        let buf = state.buffers.get_mut(&buffer.0)?;
        if buf.cancelled {
            buf.pending.clear();
            return None;
        }
        if buf.stall_reads > 0 {
            buf.stall_reads -= 1;
            return None;
        }
        let next = buf.pending.pop_front()?;
        buf.emitted += 1;
        Some(next)
    }

    fn buffer_read_status(&self, buffer: BufferPtr) -> Option<String> {
        let state = self.state();
        let buf = state.buffers.get(&buffer.0)?;
        if !buf.is_finished() {
            return None;
        }

        let finish_reason = if buf.cancelled {
            FinishReason::Aborted
        } else {
            buf.finish_reason.unwrap_or(FinishReason::StopToken)
        };
        let stop_token = if buf.cancelled {
            String::new()
        } else {
            buf.stop_token.clone()
        };
        let record = FinishRecord {
            prompt_tokens: buf.prompt_tokens,
            gen_tokens: buf.emitted,
            prompt_sec: 0.0,
            gen_sec: 0.0,
            prompt_tokens_per_sec: 0.0,
            gen_tokens_per_sec: 0.0,
            finish_reason,
            stop_token,
        };
        serde_json::to_string(&record).ok()
    }

    fn release_resources(&self, bundle: BundleId) {
        let mut state = self.state();
        let running = state
            .buffers
            .get(&bundle.0)
            .is_some_and(|buf| buf.submitted && !buf.is_finished());
        if running {
            state.released_while_running += 1;
        }
        state.buffers.remove(&bundle.0);
        state.chains.remove(&bundle.0);
        state.bundles.remove(&bundle.0);
        *state.releases.entry(bundle.0).or_insert(0) += 1;
    }

    fn submit_work(
        &self,
        _processor: ProcessorPtr,
        bundle: &ResourceBundle,
        chain: SamplerPtr,
        request: &WorkRequest,
    ) -> NativeResult<JobId> {
        let mut state = self.state();
        let stages = state.chains.get(&chain.0).cloned().unwrap_or_default();
        let mut reply = match state.replies.pop_front() {
            Some(reply) => reply,
            None => scripted_default(request, &stages),
        };

        if request.max_tokens > 0 && reply.pieces.len() > request.max_tokens as usize {
            reply.pieces.truncate(request.max_tokens as usize);
            reply.finish_reason = FinishReason::MaxNewTokens;
            reply.stop_token.clear();
        }

        let job = state.next_id();
        let buf = state
            .buffers
            .get_mut(&bundle.buffer.0)
            .ok_or_else(|| NativeError::msg("unknown readback buffer"))?;
        buf.submitted = true;
        buf.prompt_tokens = request.prompt.split_whitespace().count() as u32;
        buf.stall_reads = reply.stall_reads;
        buf.finish_reason = Some(reply.finish_reason);
        buf.stop_token = reply.stop_token.clone();
        buf.pending = reply
            .pieces
            .iter()
            .map(|piece| {
                let token = STUB_VOCAB
                    .iter()
                    .position(|v| v == piece)
                    .map(|i| TOKEN_BASE + i as TokenId)
                    .unwrap_or(TOKEN_BASE - 1);
                (piece.clone(), token)
            })
            .collect();
        let buffer_id = buf.bundle;

        state.jobs.insert(job, buffer_id);
        state.submissions.push(StubSubmission {
            bundle: bundle.id,
            request: request.clone(),
            stages,
        });
        Ok(JobId(job))
    }

    fn cancel_work(&self, _processor: ProcessorPtr, job: JobId) -> bool {
        let mut state = self.state();
        state.cancels += 1;
        let Some(buffer_id) = state.jobs.get(&job.0).copied() else {
            return false;
        };
        match state.buffers.get_mut(&buffer_id) {
            Some(buf) if !buf.is_finished() => {
                buf.cancelled = true;
                true
            }
            _ => false,
        }
    }
}
