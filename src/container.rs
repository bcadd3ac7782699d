use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ModelConfig;
use crate::errors::{KernelError, KernelResult, Phase};
use crate::native::{ContextPtr, ModelPtr, NativeLibrary, ProcessorPtr, SpecialToken, TokenId};
use crate::sampling::EndTokens;
use crate::templating::PromptTemplate;

const UNLOAD_POLL: Duration = Duration::from_millis(10);
const LOAD_REQUEST_ID: &str = "model-load";

/// Called with load progress in `[0, 1]`; returning false aborts the load.
pub type ProgressCallback = Box<dyn FnMut(f32) -> bool + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Unloaded,
    Loading,
    Loaded,
    Unloading,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::Unloading => "unloading",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub id: TokenId,
    pub piece: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos: Option<Token>,
    pub eos: Option<Token>,
    pub eot: Option<Token>,
    pub add_bos: bool,
}

impl SpecialTokens {
    fn query(lib: &dyn NativeLibrary, model: ModelPtr) -> Self {
        let lookup = |kind: SpecialToken| {
            lib.special_token_id(model, kind).map(|id| Token {
                id,
                piece: lib.token_to_text(model, id).unwrap_or_default(),
            })
        };

        Self {
            bos: lookup(SpecialToken::Bos),
            eos: lookup(SpecialToken::Eos),
            eot: lookup(SpecialToken::Eot),
            add_bos: lib.add_bos_by_default(model),
        }
    }

    pub fn end_tokens(&self) -> EndTokens {
        EndTokens {
            eos: self.eos.as_ref().map(|t| t.id),
            eot: self.eot.as_ref().map(|t| t.id),
        }
    }

    pub fn bos_piece(&self) -> &str {
        self.bos.as_ref().map(|t| t.piece.as_str()).unwrap_or("")
    }

    pub fn eos_piece(&self) -> &str {
        self.eos.as_ref().map(|t| t.piece.as_str()).unwrap_or("")
    }
}

/// The loaded model: native model, context and processor plus the
/// tokenizer facts and template derived from them.
///
/// Native resources are freed when the last reference is dropped.
pub struct ModelHandle {
    lib: Arc<dyn NativeLibrary>,
    model: ModelPtr,
    context: ContextPtr,
    processor: ProcessorPtr,
    name: String,
    path: PathBuf,
    max_seq_len: u32,
    tokens: SpecialTokens,
    template: Option<PromptTemplate>,
    closing: AtomicBool,
    jobs: Mutex<HashMap<String, CancellationToken>>,
}

impl ModelHandle {
    pub fn lib(&self) -> Arc<dyn NativeLibrary> {
        Arc::clone(&self.lib)
    }

    pub fn model_ptr(&self) -> ModelPtr {
        self.model
    }

    pub fn context_ptr(&self) -> ContextPtr {
        self.context
    }

    pub fn processor_ptr(&self) -> ProcessorPtr {
        self.processor
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_seq_len(&self) -> u32 {
        self.max_seq_len
    }

    pub fn tokens(&self) -> &SpecialTokens {
        &self.tokens
    }

    pub fn template(&self) -> Option<&PromptTemplate> {
        self.template.as_ref()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Clears the context's cached tokens before an independent request.
    pub fn reset_memory(&self) {
        self.lib.clear_memory(self.context);
    }

    pub(crate) fn register_job(&self, request_id: &str, token: CancellationToken) {
        self.jobs_lock().insert(request_id.to_string(), token);
    }

    pub(crate) fn unregister_job(&self, request_id: &str) {
        self.jobs_lock().remove(request_id);
    }

    fn cancel_jobs(&self) -> usize {
        let jobs = self.jobs_lock();
        for token in jobs.values() {
            token.cancel();
        }
        jobs.len()
    }

    fn jobs_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        self.lib.free_processor(self.processor);
        self.lib.free_context(self.context);
        self.lib.free_model(self.model);
        info!(model = %self.name, "native model freed");
    }
}

struct Slot {
    state: ContainerState,
    model: Option<Arc<ModelHandle>>,
}

/// Owner of the single loaded model.
///
/// Load and unload take an exclusive lock with `try_lock`: a second
/// lifecycle call while one is running fails instead of queueing.
pub struct ModelContainer {
    lib: Arc<dyn NativeLibrary>,
    lifecycle: AsyncMutex<()>,
    slot: RwLock<Slot>,
}

impl ModelContainer {
    pub fn new(lib: Arc<dyn NativeLibrary>) -> Self {
        Self {
            lib,
            lifecycle: AsyncMutex::new(()),
            slot: RwLock::new(Slot {
                state: ContainerState::Unloaded,
                model: None,
            }),
        }
    }

    pub fn lib(&self) -> Arc<dyn NativeLibrary> {
        Arc::clone(&self.lib)
    }

    pub async fn state(&self) -> ContainerState {
        self.slot.read().await.state
    }

    /// Handle of the loaded model, if any.
    pub async fn current(&self) -> Option<Arc<ModelHandle>> {
        self.slot.read().await.model.clone()
    }

    pub async fn load_model(&self, config: &ModelConfig, progress: ProgressCallback) -> KernelResult<LoadOutcome> {
        let _lifecycle = self
            .lifecycle
            .try_lock()
            .map_err(|_| KernelError::LoadInProgress)?;

        let path = config.model_path().ok_or(KernelError::MissingModelName)?;
        let name = config.model_name.clone().unwrap_or_default();

        if let Some(current) = self.current().await {
            if current.name() == name {
                return Err(KernelError::AlreadyLoaded(name));
            }
            info!(current = %current.name(), next = %name, "switching models");
        }
        self.unload_locked(false).await;

        self.slot.write().await.state = ContainerState::Loading;
        info!(model = %name, path = %path.display(), "loading model");

        let lib = Arc::clone(&self.lib);
        let load_config = config.clone();
        let joined = tokio::task::spawn_blocking(move || {
            load_native(lib, &load_config, name, path, progress)
        })
        .await;

        let mut slot = self.slot.write().await;
        match joined {
            Ok(Ok(Some(handle))) => {
                info!(
                    model = %handle.name(),
                    max_seq_len = handle.max_seq_len(),
                    chat = handle.template().is_some(),
                    "model loaded"
                );
                slot.model = Some(Arc::new(handle));
                slot.state = ContainerState::Loaded;
                Ok(LoadOutcome::Loaded)
            }
            Ok(Ok(None)) => {
                slot.state = ContainerState::Unloaded;
                info!("model load aborted by progress callback");
                Ok(LoadOutcome::Aborted)
            }
            Ok(Err(err)) => {
                slot.state = ContainerState::Unloaded;
                Err(err)
            }
            Err(join) => {
                slot.state = ContainerState::Unloaded;
                Err(KernelError::native(LOAD_REQUEST_ID, Phase::Load, format!("load task failed: {}", join)))
            }
        }
    }

    /// Unloads the current model; a no-op when nothing is loaded.
    ///
    /// New generations are refused right away. With `skip_wait` every
    /// in-flight job is cancelled; either way native memory is only freed
    /// once no generation holds the handle.
    pub async fn unload_model(&self, skip_wait: bool) -> KernelResult<()> {
        let _lifecycle = self
            .lifecycle
            .try_lock()
            .map_err(|_| KernelError::LoadInProgress)?;
        self.unload_locked(skip_wait).await;
        Ok(())
    }

    async fn unload_locked(&self, skip_wait: bool) {
        let model = {
            let mut slot = self.slot.write().await;
            match slot.model.take() {
                Some(model) => {
                    slot.state = ContainerState::Unloading;
                    model
                }
                None => return,
            }
        };

        model.closing.store(true, Ordering::Release);
        if skip_wait {
            let cancelled = model.cancel_jobs();
            if cancelled > 0 {
                info!(jobs = cancelled, "cancelled in-flight generations for unload");
            }
        }

        let name = model.name().to_string();
        let mut model = model;
        loop {
            match Arc::try_unwrap(model) {
                Ok(handle) => {
                    drop(handle);
                    break;
                }
                Err(shared) => {
                    model = shared;
                    tokio::time::sleep(UNLOAD_POLL).await;
                }
            }
        }

        self.slot.write().await.state = ContainerState::Unloaded;
        info!(model = %name, "model unloaded");
    }
}

fn load_native(
    lib: Arc<dyn NativeLibrary>,
    config: &ModelConfig,
    name: String,
    path: PathBuf,
    mut progress: ProgressCallback,
) -> KernelResult<Option<ModelHandle>> {
    let fail = |phase: Phase, e: crate::native::NativeError| KernelError::native(LOAD_REQUEST_ID, phase, e);

    let model = match lib.load_model(&path, config.num_gpu_layers, &mut *progress) {
        Ok(Some(model)) => model,
        Ok(None) => return Ok(None),
        Err(e) => return Err(fail(Phase::Load, e)),
    };

    let context = match lib.init_context(model, config.max_seq_len, config.chunk_size) {
        Ok(context) => context,
        Err(e) => {
            lib.free_model(model);
            return Err(fail(Phase::Context, e));
        }
    };

    let processor = match lib.make_processor(model, context, config.num_slots.max(1)) {
        Ok(processor) => processor,
        Err(e) => {
            lib.free_context(context);
            lib.free_model(model);
            return Err(fail(Phase::Context, e));
        }
    };

    let tokens = SpecialTokens::query(lib.as_ref(), model);
    let template = resolve_template(lib.as_ref(), model, config);
    let max_seq_len = lib.context_max_seq_len(context);

    Ok(Some(ModelHandle {
        lib,
        model,
        context,
        processor,
        name,
        path,
        max_seq_len,
        tokens,
        template,
        closing: AtomicBool::new(false),
        jobs: Mutex::new(HashMap::new()),
    }))
}

/// Configured template file first, then the model's embedded template.
fn resolve_template(lib: &dyn NativeLibrary, model: ModelPtr, config: &ModelConfig) -> Option<PromptTemplate> {
    let built = match &config.prompt_template {
        Some(name) => PromptTemplate::from_file(&config.templates_dir.join(format!("{}.jinja", name))),
        None => match lib.chat_template(model) {
            Some(source) => PromptTemplate::from_source("from_gguf", source),
            None => {
                warn!("model has no embedded chat template; chat completions disabled");
                return None;
            }
        },
    };

    match built {
        Ok(template) => {
            info!(template = %template.name(), "prompt template ready");
            Some(template)
        }
        Err(e) => {
            warn!(error = %e, "prompt template could not be loaded; chat completions disabled");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::StubLibrary;

    fn container_with(lib: Arc<StubLibrary>) -> Arc<ModelContainer> {
        Arc::new(ModelContainer::new(lib))
    }

    fn always() -> ProgressCallback {
        Box::new(|_| true)
    }

    #[tokio::test]
    async fn load_then_reload_same_name_is_rejected() {
        let lib = Arc::new(StubLibrary::new());
        let container = container_with(Arc::clone(&lib));
        let config = ModelConfig::for_model("tiny.gguf");

        let outcome = container.load_model(&config, always()).await.expect("load");
        assert_eq!(outcome, LoadOutcome::Loaded);
        assert_eq!(container.state().await, ContainerState::Loaded);

        let err = container.load_model(&config, always()).await.expect_err("duplicate load");
        assert!(matches!(err, KernelError::AlreadyLoaded(name) if name == "tiny.gguf"));
    }

    #[tokio::test]
    async fn loading_another_model_unloads_the_first() {
        let lib = Arc::new(StubLibrary::new());
        let container = container_with(Arc::clone(&lib));

        container
            .load_model(&ModelConfig::for_model("a.gguf"), always())
            .await
            .expect("load a");
        container
            .load_model(&ModelConfig::for_model("b.gguf"), always())
            .await
            .expect("load b");

        assert_eq!(lib.freed_models(), 1);
        assert_eq!(lib.live_models(), 1);
        let current = container.current().await.expect("model");
        assert_eq!(current.name(), "b.gguf");
    }

    #[tokio::test]
    async fn concurrent_load_fails_fast() {
        let lib = Arc::new(StubLibrary::new());
        let container = container_with(Arc::clone(&lib));
        let gate = lib.hold_loads();

        let first = {
            let container = Arc::clone(&container);
            tokio::spawn(async move {
                container
                    .load_model(&ModelConfig::for_model("slow.gguf"), Box::new(|_| true))
                    .await
            })
        };

        while container.state().await != ContainerState::Loading {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let second = tokio::time::timeout(
            Duration::from_millis(100),
            container.load_model(&ModelConfig::for_model("other.gguf"), always()),
        )
        .await
        .expect("second load must not wait");
        assert!(matches!(second, Err(KernelError::LoadInProgress)));

        let unload = container.unload_model(false).await;
        assert!(matches!(unload, Err(KernelError::LoadInProgress)));

        gate.release();
        let outcome = first.await.expect("join").expect("first load");
        assert_eq!(outcome, LoadOutcome::Loaded);
    }

    #[tokio::test]
    async fn progress_callback_can_abort() {
        let lib = Arc::new(StubLibrary::new());
        let container = container_with(Arc::clone(&lib));

        let outcome = container
            .load_model(&ModelConfig::for_model("big.gguf"), Box::new(|p| p < 0.5))
            .await
            .expect("aborted load is not an error");
        assert_eq!(outcome, LoadOutcome::Aborted);
        assert_eq!(container.state().await, ContainerState::Unloaded);
        assert!(container.current().await.is_none());
        assert_eq!(lib.live_models(), 0);
    }

    #[tokio::test]
    async fn unload_is_idempotent_and_frees_once() {
        let lib = Arc::new(StubLibrary::new());
        let container = container_with(Arc::clone(&lib));
        container
            .load_model(&ModelConfig::for_model("m.gguf"), always())
            .await
            .expect("load");

        container.unload_model(false).await.expect("unload");
        container.unload_model(false).await.expect("second unload");
        assert_eq!(lib.freed_models(), 1);
        assert_eq!(container.state().await, ContainerState::Unloaded);
    }

    #[tokio::test]
    async fn missing_model_name_is_rejected() {
        let container = container_with(Arc::new(StubLibrary::new()));
        let err = container
            .load_model(&ModelConfig::default(), always())
            .await
            .expect_err("no name");
        assert!(matches!(err, KernelError::MissingModelName));
    }

    #[tokio::test]
    async fn special_tokens_come_from_the_library() {
        let container = container_with(Arc::new(StubLibrary::new()));
        container
            .load_model(&ModelConfig::for_model("m.gguf"), always())
            .await
            .expect("load");

        let model = container.current().await.expect("model");
        assert_eq!(model.tokens().bos_piece(), "<s>");
        assert_eq!(
            model.tokens().end_tokens(),
            EndTokens {
                eos: Some(2),
                eot: Some(3)
            }
        );
        assert_eq!(model.max_seq_len(), 4096);
        assert!(model.template().is_none());
    }
}
