//! In-process backend on candle quantized GGUF weights.
//!
//! Runs on the CPU device. Every submitted job decodes on its own thread
//! and writes into its readback buffer; jobs on one model serialize on the
//! weights lock. Grammar-constrained sampling is not available here.

mod backend;
mod sampler;
mod tokenizer;
mod worker;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use candle_core::Device;
use tracing::{debug, info};

use self::backend::{ModelFamily, RuntimeModel};
use self::tokenizer::SpecialIds;
use self::worker::{Job, ReadbackBuffer};
use super::{
    BufferPtr, BundleId, ContextPtr, JobId, ModelPtr, NativeCapabilities, NativeError,
    NativeLibrary, NativeResult, ProcessorPtr, ResourceBundle, SamplerPtr, SamplerStage,
    SpecialToken, TokenId, WorkRequest,
};

const FALLBACK_CTX_LEN: u32 = 4096;

pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default)]
pub struct CandleOptions {
    pub tokenizer_path: Option<PathBuf>,
    pub tokenizer_repo: Option<String>,
}

pub(super) struct CandleModel {
    weights: Mutex<RuntimeModel>,
    tokenizer: tokenizers::Tokenizer,
    family: ModelFamily,
    special: SpecialIds,
    chat_template: Option<String>,
    context_length: u32,
}

struct CandleContext {
    model: Arc<CandleModel>,
    n_ctx: u32,
}

struct CandleProcessor {
    context: Arc<CandleContext>,
    jobs: Mutex<HashMap<u64, Arc<AtomicBool>>>,
}

struct Bundle {
    buffer: Arc<ReadbackBuffer>,
    stages: Vec<SamplerStage>,
}

#[derive(Default)]
struct Tables {
    models: HashMap<u64, Arc<CandleModel>>,
    contexts: HashMap<u64, Arc<CandleContext>>,
    processors: HashMap<u64, Arc<CandleProcessor>>,
    bundles: HashMap<u64, Bundle>,
}

pub struct CandleLibrary {
    options: CandleOptions,
    device: Device,
    tables: Mutex<Tables>,
    next_id: AtomicU64,
}

impl CandleLibrary {
    pub fn new(options: CandleOptions) -> Self {
        Self {
            options,
            device: Device::Cpu,
            tables: Mutex::new(Tables::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        lock(&self.tables)
    }

    fn model(&self, model: ModelPtr) -> Option<Arc<CandleModel>> {
        self.tables().models.get(&model.0).cloned()
    }

    fn buffer(&self, buffer: BufferPtr) -> Option<Arc<ReadbackBuffer>> {
        self.tables()
            .bundles
            .get(&buffer.0)
            .map(|bundle| Arc::clone(&bundle.buffer))
    }
}

impl NativeLibrary for CandleLibrary {
    fn load_model(
        &self,
        path: &Path,
        gpu_layers: i32,
        progress: &mut dyn FnMut(f32) -> bool,
    ) -> NativeResult<Option<ModelPtr>> {
        if !progress(0.0) {
            return Ok(None);
        }
        debug!(gpu_layers, "candle backend runs on the CPU device, gpu layer count ignored");

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let family = ModelFamily::from_filename(&file_name);
        info!(path = %path.display(), ?family, "loading GGUF weights");

        let loaded = RuntimeModel::load_from_gguf(path, family, &self.device)?;
        if !progress(0.7) {
            return Ok(None);
        }

        let tokenizer = tokenizer::load_tokenizer(
            path,
            self.options.tokenizer_path.as_deref(),
            self.options.tokenizer_repo.as_deref(),
        )?;
        let special = tokenizer::resolve_special_tokens(&tokenizer, family).map_err(NativeError)?;
        debug!(?special, "special tokens resolved");
        if !progress(1.0) {
            return Ok(None);
        }

        let model = CandleModel {
            weights: Mutex::new(loaded.model),
            tokenizer,
            family,
            special,
            chat_template: loaded.chat_template,
            context_length: loaded.context_length.unwrap_or(FALLBACK_CTX_LEN),
        };
        let id = self.next_id();
        self.tables().models.insert(id, Arc::new(model));
        Ok(Some(ModelPtr(id)))
    }

    fn init_context(&self, model: ModelPtr, ctx_len: u32, batches: u32) -> NativeResult<ContextPtr> {
        let model = self
            .model(model)
            .ok_or_else(|| NativeError::msg("unknown model handle"))?;
        let n_ctx = match ctx_len {
            0 => model.context_length,
            n => n,
        };
        debug!(n_ctx, batches, "context created");

        let id = self.next_id();
        self.tables()
            .contexts
            .insert(id, Arc::new(CandleContext { model, n_ctx }));
        Ok(ContextPtr(id))
    }

    fn make_processor(&self, _model: ModelPtr, context: ContextPtr, slots: u32) -> NativeResult<ProcessorPtr> {
        let mut tables = self.tables();
        let context = tables
            .contexts
            .get(&context.0)
            .cloned()
            .ok_or_else(|| NativeError::msg("unknown context handle"))?;
        debug!(slots, "processor created, jobs share one weights lock");

        let id = self.next_id();
        tables.processors.insert(
            id,
            Arc::new(CandleProcessor {
                context,
                jobs: Mutex::new(HashMap::new()),
            }),
        );
        Ok(ProcessorPtr(id))
    }

    fn context_max_seq_len(&self, context: ContextPtr) -> u32 {
        self.tables()
            .contexts
            .get(&context.0)
            .map(|ctx| ctx.n_ctx)
            .unwrap_or(FALLBACK_CTX_LEN)
    }

    fn clear_memory(&self, _context: ContextPtr) {
        // Every job starts at position 0, which rebuilds the KV cache.
    }

    fn free_processor(&self, processor: ProcessorPtr) {
        self.tables().processors.remove(&processor.0);
    }

    fn free_context(&self, context: ContextPtr) {
        self.tables().contexts.remove(&context.0);
    }

    fn free_model(&self, model: ModelPtr) {
        self.tables().models.remove(&model.0);
    }

    fn special_token_id(&self, model: ModelPtr, kind: SpecialToken) -> Option<TokenId> {
        let model = self.model(model)?;
        let id = match kind {
            SpecialToken::Bos => model.special.bos,
            SpecialToken::Eos => model.special.eos,
            SpecialToken::Eot => model.special.eot,
        }?;
        TokenId::try_from(id).ok()
    }

    fn token_to_text(&self, model: ModelPtr, token: TokenId) -> Option<String> {
        let model = self.model(model)?;
        model.tokenizer.id_to_token(u32::try_from(token).ok()?)
    }

    fn add_bos_by_default(&self, model: ModelPtr) -> bool {
        self.model(model)
            .map(|m| m.family.adds_bos() && m.special.bos.is_some())
            .unwrap_or(false)
    }

    fn chat_template(&self, model: ModelPtr) -> Option<String> {
        self.model(model)?.chat_template.clone()
    }

    fn capabilities(&self) -> NativeCapabilities {
        NativeCapabilities::default()
    }

    fn sampler_append(&self, chain: SamplerPtr, _model: ModelPtr, stage: &SamplerStage) -> NativeResult<SamplerPtr> {
        if matches!(stage, SamplerStage::Grammar { .. } | SamplerStage::Llguidance { .. }) {
            return Err(NativeError::msg(format!(
                "{} sampling is not available in the candle backend",
                stage.name()
            )));
        }

        let mut tables = self.tables();
        let bundle = tables
            .bundles
            .get_mut(&chain.0)
            .ok_or_else(|| NativeError::msg("unknown sampler chain"))?;
        bundle.stages.push(stage.clone());
        Ok(chain)
    }

    fn create_resources(&self) -> NativeResult<ResourceBundle> {
        let id = self.next_id();
        self.tables().bundles.insert(
            id,
            Bundle {
                buffer: Arc::new(ReadbackBuffer::default()),
                stages: Vec::new(),
            },
        );
        Ok(ResourceBundle {
            id: BundleId(id),
            buffer: BufferPtr(id),
            sampler: SamplerPtr(id),
        })
    }

    fn buffer_is_finished(&self, buffer: BufferPtr) -> bool {
        self.buffer(buffer).map(|b| b.is_finished()).unwrap_or(true)
    }

    fn buffer_read_next(&self, buffer: BufferPtr) -> Option<(String, TokenId)> {
        self.buffer(buffer)?.pop()
    }

    fn buffer_read_status(&self, buffer: BufferPtr) -> Option<String> {
        self.buffer(buffer)?.status()
    }

    fn release_resources(&self, bundle: BundleId) {
        self.tables().bundles.remove(&bundle.0);
    }

    fn submit_work(
        &self,
        processor: ProcessorPtr,
        bundle: &ResourceBundle,
        chain: SamplerPtr,
        request: &WorkRequest,
    ) -> NativeResult<JobId> {
        let (processor, buffer, stages) = {
            let tables = self.tables();
            let processor = tables
                .processors
                .get(&processor.0)
                .cloned()
                .ok_or_else(|| NativeError::msg("unknown processor handle"))?;
            let buffer = tables
                .bundles
                .get(&bundle.id.0)
                .map(|b| Arc::clone(&b.buffer))
                .ok_or_else(|| NativeError::msg("unknown resource bundle"))?;
            let stages = tables
                .bundles
                .get(&chain.0)
                .map(|b| b.stages.clone())
                .ok_or_else(|| NativeError::msg("unknown sampler chain"))?;
            (processor, buffer, stages)
        };

        let id = self.next_id();
        let cancel = Arc::new(AtomicBool::new(false));
        lock(&processor.jobs).insert(id, Arc::clone(&cancel));

        let job = Job {
            model: Arc::clone(&processor.context.model),
            n_ctx: processor.context.n_ctx,
            buffer,
            stages,
            request: request.clone(),
            cancel,
        };

        let jobs_owner = Arc::clone(&processor);
        std::thread::Builder::new()
            .name(format!("candle-job-{}", id))
            .spawn(move || {
                worker::run(job);
                lock(&jobs_owner.jobs).remove(&id);
            })
            .map_err(|e| {
                lock(&processor.jobs).remove(&id);
                NativeError::msg(format!("cannot spawn decode thread: {}", e))
            })?;

        Ok(JobId(id))
    }

    fn cancel_work(&self, processor: ProcessorPtr, job: JobId) -> bool {
        let Some(processor) = self.tables().processors.get(&processor.0).cloned() else {
            return false;
        };
        let jobs = lock(&processor.jobs);
        match jobs.get(&job.0) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }
}
