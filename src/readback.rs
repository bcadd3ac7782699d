use std::sync::Arc;
use std::time::Duration;

use inference_protocol::{FinishRecord, StreamChunk};
use tracing::{debug, warn};

use crate::cancel::RequestContext;
use crate::container::ModelHandle;
use crate::errors::{KernelError, KernelResult, Phase};
use crate::native::{NativeLibrary, ResourceBundle};

/// Capped exponential delay between empty buffer polls.
///
/// The native buffer has no completion callback, so the bridge polls it.
/// A successful read resets the delay to `initial`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl PollBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(2), Duration::from_millis(32))
    }
}

/// Buffer and sampler of one request, released exactly once.
///
/// Release only happens once the native side reports the buffer finished.
/// Dropped while a job is still writing, the release is handed to a
/// background drainer that waits for the finish first.
pub struct GenerationResources {
    lib: Arc<dyn NativeLibrary>,
    bundle: ResourceBundle,
    // Keeps native model memory alive for as long as the job may touch it.
    model: Option<Arc<ModelHandle>>,
    submitted: bool,
    released: bool,
}

impl GenerationResources {
    pub fn allocate(model: &Arc<ModelHandle>) -> KernelResult<Self> {
        let lib = model.lib();
        let bundle = lib
            .create_resources()
            .map_err(|e| KernelError::BufferAllocation(e.to_string()))?;
        Ok(Self {
            lib,
            bundle,
            model: Some(Arc::clone(model)),
            submitted: false,
            released: false,
        })
    }

    pub fn bundle(&self) -> &ResourceBundle {
        &self.bundle
    }

    pub(crate) fn mark_submitted(&mut self) {
        self.submitted = true;
    }

    fn is_finished(&self) -> bool {
        self.lib.buffer_is_finished(self.bundle.buffer)
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.lib.release_resources(self.bundle.id);
        debug!(bundle = self.bundle.id.0, "generation resources released");
    }
}

impl Drop for GenerationResources {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if !self.submitted || self.is_finished() {
            self.release();
            return;
        }

        let lib = Arc::clone(&self.lib);
        let bundle = self.bundle;
        let model = self.model.take();
        self.released = true;

        let drain = move || -> bool {
            if !lib.buffer_is_finished(bundle.buffer) {
                return false;
            }
            while lib.buffer_read_next(bundle.buffer).is_some() {}
            lib.release_resources(bundle.id);
            true
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let mut backoff = PollBackoff::default();
                    while !drain() {
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                    drop(model);
                });
            }
            Err(_) => {
                warn!(bundle = bundle.id.0, "no runtime for deferred release, draining on a thread");
                std::thread::spawn(move || {
                    let mut backoff = PollBackoff::default();
                    while !drain() {
                        std::thread::sleep(backoff.next_delay());
                    }
                    drop(model);
                });
            }
        }
    }
}

/// Item pulled from the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadbackItem {
    Data(StreamChunk),
    Finish(FinishRecord),
}

/// Pull-style view over the native push buffer.
///
/// Yields data in buffer order, then exactly one finish record. Once the
/// buffer reports finished, the remaining data is drained, the status is
/// read once, and the resources are released before the record is handed
/// out.
pub struct ReadbackBridge {
    resources: GenerationResources,
    backoff: PollBackoff,
    done: bool,
}

impl ReadbackBridge {
    pub fn new(resources: GenerationResources, backoff: PollBackoff) -> Self {
        Self {
            resources,
            backoff,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Next item, or `None` after the finish record was returned.
    ///
    /// A cancelled context is forwarded to the native side; the bridge keeps
    /// draining until the buffer reports finished.
    pub async fn next(&mut self, ctx: &RequestContext) -> Option<KernelResult<ReadbackItem>> {
        if self.done {
            return None;
        }

        let lib = Arc::clone(&self.resources.lib);
        let buffer = self.resources.bundle.buffer;

        loop {
            if ctx.is_cancelled() {
                ctx.forward();
            }

            let finished = lib.buffer_is_finished(buffer);
            if let Some((text, token)) = lib.buffer_read_next(buffer) {
                self.backoff.reset();
                return Some(Ok(ReadbackItem::Data(StreamChunk { text, token })));
            }

            if !finished {
                tokio::time::sleep(self.backoff.next_delay()).await;
                continue;
            }

            self.done = true;
            let status = lib.buffer_read_status(buffer);
            self.resources.release();

            let result = status
                .ok_or_else(|| {
                    KernelError::native(ctx.request_id(), Phase::Readback, "buffer finished without a status record")
                })
                .and_then(|raw| {
                    serde_json::from_str::<FinishRecord>(&raw).map_err(|e| {
                        KernelError::native(ctx.request_id(), Phase::Readback, format!("malformed status record: {}", e))
                    })
                });
            return Some(result.map(ReadbackItem::Finish));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap_and_resets() {
        let mut backoff = PollBackoff::new(Duration::from_millis(2), Duration::from_millis(10));
        let delays: Vec<u128> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![2, 4, 8, 10, 10]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(2));
    }

    #[test]
    fn cap_never_drops_below_initial() {
        let mut backoff = PollBackoff::new(Duration::from_millis(20), Duration::from_millis(5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
    }
}
