use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use inference_protocol::{FinishChunk, FinishReason, FinishRecord, GenerationChunk};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cancel::{CancelListener, RequestContext};
use crate::config::{GenerationConfig, LoggingConfig};
use crate::container::{ModelContainer, ModelHandle};
use crate::errors::{KernelError, KernelResult, Phase};
use crate::logging::{log_generation_params, log_section};
use crate::native::WorkRequest;
use crate::readback::{GenerationResources, PollBackoff, ReadbackBridge, ReadbackItem};
use crate::sampling::{resolve_seed, SamplerChainBuilder, SamplingConfig};

pub type GenerationStream = BoxStream<'static, KernelResult<GenerationChunk>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationOptions {
    pub backoff: PollBackoff,
    pub log_prompt: bool,
    pub log_generation_params: bool,
}

impl GenerationOptions {
    pub fn from_config(generation: &GenerationConfig, logging: &LoggingConfig) -> Self {
        Self {
            backoff: PollBackoff::new(generation.poll_initial(), generation.poll_max()),
            log_prompt: logging.log_prompt,
            log_generation_params: logging.log_generation_params,
        }
    }
}

/// Runs requests against whatever model the container currently holds.
#[derive(Clone)]
pub struct Generator {
    container: Arc<ModelContainer>,
    options: GenerationOptions,
}

impl Generator {
    pub fn new(container: Arc<ModelContainer>, options: GenerationOptions) -> Self {
        Self { container, options }
    }

    pub fn container(&self) -> &Arc<ModelContainer> {
        &self.container
    }

    /// Lazy chunk stream: nothing touches the model until the first poll.
    ///
    /// Data chunks arrive in generation order, followed by exactly one
    /// finish chunk or one error. Dropping the stream early cancels the job.
    pub fn generate_stream(
        &self,
        prompt: impl Into<String>,
        config: SamplingConfig,
        cancel: CancellationToken,
    ) -> GenerationStream {
        let pending = PendingGeneration {
            container: Arc::clone(&self.container),
            options: self.options,
            request_id: new_request_id(),
            prompt: prompt.into(),
            config,
            cancel,
        };

        stream::unfold(StreamPhase::Pending(Box::new(pending)), |phase| async move {
            match phase {
                StreamPhase::Pending(pending) => match pending.start().await {
                    Ok(running) => running.advance().await,
                    Err(err) => Some((Err(err), StreamPhase::Done)),
                },
                StreamPhase::Running(running) => running.advance().await,
                StreamPhase::Done => None,
            }
        })
        .boxed()
    }

    /// Drains a whole generation and returns the finish chunk carrying the full text.
    pub async fn generate_once(
        &self,
        prompt: impl Into<String>,
        config: SamplingConfig,
        cancel: CancellationToken,
    ) -> KernelResult<FinishChunk> {
        let mut stream = self.generate_stream(prompt, config, cancel);

        while let Some(chunk) = stream.next().await {
            if let GenerationChunk::Finish(finish) = chunk? {
                return Ok(finish);
            }
        }

        Err(KernelError::native("-", Phase::Readback, "stream ended without a finish chunk"))
    }
}

fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

enum StreamPhase {
    Pending(Box<PendingGeneration>),
    Running(Box<RunningGeneration>),
    Done,
}

struct PendingGeneration {
    container: Arc<ModelContainer>,
    options: GenerationOptions,
    request_id: String,
    prompt: String,
    config: SamplingConfig,
    cancel: CancellationToken,
}

impl PendingGeneration {
    async fn start(self) -> KernelResult<Box<RunningGeneration>> {
        let model = self.container.current().await.ok_or(KernelError::NoModelLoaded)?;
        if model.is_closing() {
            return Err(KernelError::ModelClosing);
        }

        let request_id = self.request_id;
        let ctx = RequestContext::new(request_id.clone(), &self.cancel);
        let lib = model.lib();

        // Requests are independent: no KV state carries over.
        model.reset_memory();

        let mut resources = GenerationResources::allocate(&model)?;
        let seed = resolve_seed(self.config.seed);
        let chain = SamplerChainBuilder::new(lib.as_ref(), model.model_ptr(), resources.bundle().sampler)
            .build(&self.config, model.tokens().end_tokens(), seed)
            .map_err(|e| KernelError::native(&request_id, Phase::Sampler, e))?;

        let work = WorkRequest {
            prompt: self.prompt,
            max_tokens: self.config.max_tokens.unwrap_or_else(|| model.max_seq_len()),
            min_tokens: self.config.min_tokens,
            max_seq_len: model.max_seq_len(),
            seed,
            rewind_strings: self.config.banned_strings.clone(),
            stop_strings: self.config.stop_strings(),
            stop_tokens: self.config.stop_tokens(),
            add_special: self.config.add_bos_token.unwrap_or(model.tokens().add_bos),
        };

        if self.options.log_prompt {
            log_section("Prompt", &work.prompt);
        }
        if self.options.log_generation_params {
            log_generation_params(&request_id, seed, &self.config);
        }

        let processor = model.processor_ptr();
        let job = lib
            .submit_work(processor, resources.bundle(), chain.into_ptr(), &work)
            .map_err(|e| KernelError::native(&request_id, Phase::Submit, e))?;
        resources.mark_submitted();

        model.register_job(&request_id, ctx.token());
        let listener = {
            let lib = Arc::clone(&lib);
            ctx.arm(move || {
                lib.cancel_work(processor, job);
            })
        };
        debug!(request_id = %request_id, job = job.0, "generation submitted");

        Ok(Box::new(RunningGeneration {
            ctx,
            bridge: ReadbackBridge::new(resources, self.options.backoff),
            _listener: listener,
            model,
            produced: false,
            log_response: self.options.log_prompt,
            text: String::new(),
        }))
    }
}

struct RunningGeneration {
    ctx: Arc<RequestContext>,
    bridge: ReadbackBridge,
    _listener: CancelListener,
    model: Arc<ModelHandle>,
    produced: bool,
    log_response: bool,
    text: String,
}

impl RunningGeneration {
    async fn advance(mut self: Box<Self>) -> Option<(KernelResult<GenerationChunk>, StreamPhase)> {
        let item = self.bridge.next(&self.ctx).await?;

        match item {
            Ok(ReadbackItem::Data(chunk)) => {
                self.produced = true;
                self.text.push_str(&chunk.text);
                Some((Ok(GenerationChunk::Data(chunk)), StreamPhase::Running(self)))
            }
            Ok(ReadbackItem::Finish(record)) => {
                let result = self.finish(record).map(GenerationChunk::Finish);
                Some((result, StreamPhase::Done))
            }
            Err(err) => {
                self.ctx.finish();
                Some((Err(err), StreamPhase::Done))
            }
        }
    }

    /// Maps the native status to a finish chunk carrying the whole response.
    fn finish(&mut self, record: FinishRecord) -> KernelResult<FinishChunk> {
        self.ctx.finish();
        let request_id = self.ctx.request_id();

        match record.finish_reason {
            FinishReason::CtxExceeded => {
                return Err(KernelError::ContextExceeded {
                    request_id: request_id.to_string(),
                    max_seq_len: self.model.max_seq_len(),
                })
            }
            FinishReason::BatchDecode => {
                return Err(KernelError::native(
                    request_id,
                    Phase::Generate,
                    "decode failed; the model may need a restart",
                ))
            }
            FinishReason::TokenEncode => {
                return Err(KernelError::native(request_id, Phase::Generate, "prompt could not be tokenized"))
            }
            FinishReason::Aborted if !self.produced => {
                return Err(KernelError::Cancelled {
                    request_id: request_id.to_string(),
                })
            }
            _ => {}
        }

        if self.log_response {
            log_section("Response", &self.text);
        }
        info!(
            request_id,
            prompt_tokens = record.prompt_tokens,
            gen_tokens = record.gen_tokens,
            prompt_tps = record.prompt_tokens_per_sec,
            gen_tps = record.gen_tokens_per_sec,
            finish_reason = ?record.finish_reason,
            "generation finished"
        );

        let mut finish = FinishChunk::from_record(request_id, record);
        finish.text = std::mem::take(&mut self.text);
        Ok(finish)
    }
}

impl Drop for RunningGeneration {
    fn drop(&mut self) {
        if !self.bridge.is_done() {
            debug!(request_id = %self.ctx.request_id(), "stream dropped before finish, cancelling job");
            self.ctx.cancel();
        }
        self.model.unregister_job(self.ctx.request_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::ModelConfig;
    use crate::native::stub::StubReply;
    use crate::native::StubLibrary;

    async fn loaded(lib: &Arc<StubLibrary>) -> Generator {
        let container = Arc::new(ModelContainer::new(Arc::clone(lib) as Arc<dyn crate::native::NativeLibrary>));
        container
            .load_model(&ModelConfig::for_model("stub.gguf"), Box::new(|_| true))
            .await
            .expect("load stub model");
        let options = GenerationOptions {
            backoff: PollBackoff::new(Duration::from_millis(1), Duration::from_millis(4)),
            ..GenerationOptions::default()
        };
        Generator::new(container, options)
    }

    fn greedy(max_tokens: u32, seed: i64) -> SamplingConfig {
        SamplingConfig {
            max_tokens: Some(max_tokens),
            temperature: 0.0,
            seed: Some(seed),
            ..SamplingConfig::default()
        }
    }

    #[tokio::test]
    async fn data_chunks_precede_a_single_finish() {
        let lib = Arc::new(StubLibrary::new());
        lib.push_reply(StubReply::text(&[" one", " two", " three"]).stalled(3));
        let generator = loaded(&lib).await;

        let chunks: Vec<_> = generator
            .generate_stream("Hi", SamplingConfig::default(), CancellationToken::new())
            .collect()
            .await;

        assert_eq!(chunks.len(), 4);
        let kinds: Vec<bool> = chunks
            .iter()
            .map(|c| c.as_ref().expect("chunk").is_finish())
            .collect();
        assert_eq!(kinds, vec![false, false, false, true]);

        let texts: Vec<String> = chunks[..3]
            .iter()
            .map(|c| match c {
                Ok(GenerationChunk::Data(d)) => d.text.clone(),
                other => panic!("unexpected chunk {:?}", other),
            })
            .collect();
        assert_eq!(texts, vec![" one", " two", " three"]);
        assert_eq!(lib.total_releases(), 1);
        assert_eq!(lib.released_while_running(), 0);
    }

    #[tokio::test]
    async fn stream_finish_carries_the_full_text() {
        let lib = Arc::new(StubLibrary::new());
        lib.push_reply(StubReply::text(&["Hel", "lo", " there"]));
        let generator = loaded(&lib).await;

        let chunks: Vec<_> = generator
            .generate_stream("Hi", SamplingConfig::default(), CancellationToken::new())
            .collect()
            .await;

        match chunks.last() {
            Some(Ok(GenerationChunk::Finish(finish))) => assert_eq!(finish.text, "Hello there"),
            other => panic!("expected finish, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn allocation_failure_submits_nothing() {
        let lib = Arc::new(StubLibrary::new());
        let generator = loaded(&lib).await;
        lib.fail_next_allocation();

        let err = generator
            .generate_once("Hi", SamplingConfig::default(), CancellationToken::new())
            .await
            .expect_err("allocation failure");
        assert!(matches!(err, KernelError::BufferAllocation(_)), "got {err}");
        assert_eq!(err.code(), "BUFFER_ALLOCATION");
        assert_eq!(lib.submit_count(), 0);
        assert_eq!(lib.total_releases(), 0);

        let next = generator
            .generate_once("Hi", greedy(3, 7), CancellationToken::new())
            .await
            .expect("recovers on the next request");
        assert_eq!(next.gen_tokens, 3);
        assert_eq!(lib.submit_count(), 1);
    }

    #[tokio::test]
    async fn greedy_generation_is_repeatable() {
        let lib = Arc::new(StubLibrary::new());
        let generator = loaded(&lib).await;

        let first = generator
            .generate_once("Hi", greedy(5, 42), CancellationToken::new())
            .await
            .expect("first run");
        let second = generator
            .generate_once("Hi", greedy(5, 42), CancellationToken::new())
            .await
            .expect("second run");

        assert!(!first.text.is_empty());
        assert_eq!(first.text, second.text);
        assert_eq!(first.gen_tokens, 5);
        assert_eq!(first.finish_reason, FinishReason::MaxNewTokens);
        assert_eq!(lib.memory_clears(), 2);
    }

    #[tokio::test]
    async fn cancel_before_output_is_a_cancellation_error() {
        let lib = Arc::new(StubLibrary::new());
        lib.push_reply(StubReply::text(&[" late"]).stalled(usize::MAX));
        let generator = loaded(&lib).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
            trigger.cancel();
        });

        let err = generator
            .generate_once("Hi", SamplingConfig::default(), cancel)
            .await
            .expect_err("cancelled");
        assert!(err.is_cancellation(), "got {err}");

        let bundle = lib.submissions()[0].bundle;
        assert_eq!(lib.release_count(bundle), 1);
        assert_eq!(lib.released_while_running(), 0);
        assert_eq!(lib.cancel_count(), 1);
    }

    #[tokio::test]
    async fn cancel_after_output_finishes_as_aborted() {
        let lib = Arc::new(StubLibrary::new());
        lib.push_reply(StubReply::text(&[" a", " b", " c"]));
        let generator = loaded(&lib).await;

        let cancel = CancellationToken::new();
        let mut stream = generator.generate_stream("Hi", SamplingConfig::default(), cancel.clone());
        let first = stream.next().await.expect("chunk").expect("data");
        assert!(!first.is_finish());

        cancel.cancel();
        let mut last = None;
        while let Some(chunk) = stream.next().await {
            last = Some(chunk.expect("no error after output"));
        }
        match last {
            Some(GenerationChunk::Finish(finish)) => {
                assert_eq!(finish.finish_reason, FinishReason::Aborted)
            }
            other => panic!("expected finish, got {:?}", other),
        }
        assert_eq!(lib.total_releases(), 1);
    }

    #[tokio::test]
    async fn dropped_stream_cancels_and_releases_after_finish() {
        let lib = Arc::new(StubLibrary::new());
        lib.push_reply(StubReply::text(&[" a", " b", " c"]));
        let generator = loaded(&lib).await;

        let mut stream = generator.generate_stream("Hi", SamplingConfig::default(), CancellationToken::new());
        stream.next().await.expect("chunk").expect("data");
        drop(stream);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(lib.cancel_count(), 1);
        assert_eq!(lib.total_releases(), 1);
        assert_eq!(lib.released_while_running(), 0);
    }

    #[tokio::test]
    async fn native_failures_map_to_errors() {
        let lib = Arc::new(StubLibrary::new());
        lib.push_reply(StubReply::text(&[]).stopped_by(FinishReason::CtxExceeded, ""));
        lib.push_reply(StubReply::text(&[" x"]).stopped_by(FinishReason::BatchDecode, ""));
        let generator = loaded(&lib).await;

        let err = generator
            .generate_once("Hi", SamplingConfig::default(), CancellationToken::new())
            .await
            .expect_err("context exceeded");
        assert!(matches!(err, KernelError::ContextExceeded { max_seq_len: 4096, .. }));

        let err = generator
            .generate_once("Hi", SamplingConfig::default(), CancellationToken::new())
            .await
            .expect_err("decode failure");
        assert!(matches!(err, KernelError::NativeInference { phase: Phase::Generate, .. }));
    }

    #[tokio::test]
    async fn requests_fail_without_a_model() {
        let lib: Arc<dyn crate::native::NativeLibrary> = Arc::new(StubLibrary::new());
        let generator = Generator::new(Arc::new(ModelContainer::new(lib)), GenerationOptions::default());

        let err = generator
            .generate_once("Hi", SamplingConfig::default(), CancellationToken::new())
            .await
            .expect_err("no model");
        assert!(matches!(err, KernelError::NoModelLoaded));
    }

    #[tokio::test]
    async fn forced_unload_cancels_and_waits_for_running_generation() {
        let lib = Arc::new(StubLibrary::new());
        lib.push_reply(StubReply::text(&[" a", " b"]).stalled(5));
        let generator = loaded(&lib).await;

        let mut stream = generator.generate_stream("Hi", SamplingConfig::default(), CancellationToken::new());
        stream.next().await.expect("chunk").expect("data");

        let container = Arc::clone(generator.container());
        let unload = tokio::spawn(async move { container.unload_model(true).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(lib.freed_models(), 0);

        let mut last = None;
        while let Some(chunk) = stream.next().await {
            last = Some(chunk.expect("chunk"));
        }
        assert!(matches!(
            last,
            Some(GenerationChunk::Finish(FinishChunk { finish_reason: FinishReason::Aborted, .. }))
        ));
        drop(stream);

        unload.await.expect("join").expect("unload");
        assert_eq!(lib.cancel_count(), 1);
        assert_eq!(lib.freed_models(), 1);
        assert_eq!(lib.total_releases(), 1);
    }

    #[tokio::test]
    async fn closing_model_refuses_new_work() {
        let lib = Arc::new(StubLibrary::new());
        lib.push_reply(StubReply::text(&[" a", " b"]).stalled(5));
        let generator = loaded(&lib).await;

        let mut running = generator.generate_stream("Hi", SamplingConfig::default(), CancellationToken::new());
        running.next().await.expect("chunk").expect("data");

        let container = Arc::clone(generator.container());
        let unload = tokio::spawn(async move { container.unload_model(false).await });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = generator
            .generate_once("Hi", SamplingConfig::default(), CancellationToken::new())
            .await
            .expect_err("refused");
        assert!(matches!(err, KernelError::NoModelLoaded | KernelError::ModelClosing));

        drop(running);
        unload.await.expect("join").expect("unload");
    }
}
