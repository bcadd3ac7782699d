use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Test-and-set flag that lets exactly one caller through.
#[derive(Debug, Default)]
pub struct FinishLatch(AtomicBool);

impl FinishLatch {
    /// True only for the first caller.
    pub fn fire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_fired(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

type Canceller = Box<dyn FnOnce() + Send>;

/// Per-request identity and cancellation state.
///
/// The internal token is a child of the caller's token: cancelling the
/// caller's token cancels the request, never the reverse. Forwarding the
/// cancel to the native side and natural completion share one latch, so
/// whichever happens first wins and the other becomes a no-op.
pub struct RequestContext {
    request_id: String,
    cancel: CancellationToken,
    latch: FinishLatch,
    forwarded: AtomicBool,
    canceller: Mutex<Option<Canceller>>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>, external: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            request_id: request_id.into(),
            cancel: external.child_token(),
            latch: FinishLatch::default(),
            forwarded: AtomicBool::new(false),
            canceller: Mutex::new(None),
        })
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once a cancel actually reached the native side.
    pub fn cancel_forwarded(&self) -> bool {
        self.forwarded.load(Ordering::Acquire)
    }

    /// Installs the native cancel hook and starts watching the token.
    /// Must run inside a tokio runtime.
    pub fn arm(self: &Arc<Self>, canceller: impl FnOnce() + Send + 'static) -> CancelListener {
        *self.canceller.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(canceller));

        let ctx = Arc::clone(self);
        let handle = tokio::spawn(async move {
            ctx.cancel.cancelled().await;
            ctx.forward();
        });
        CancelListener { handle }
    }

    /// Cancels the request from inside the process.
    pub fn cancel(&self) -> bool {
        self.cancel.cancel();
        self.forward()
    }

    /// Forwards the cancel to the native side, at most once.
    pub fn forward(&self) -> bool {
        if !self.latch.fire() {
            return false;
        }

        self.forwarded.store(true, Ordering::Release);
        let canceller = self
            .canceller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(canceller) = canceller {
            debug!(request_id = %self.request_id, "forwarding cancel to native processor");
            canceller();
        }
        true
    }

    /// Marks natural completion. Later cancels become no-ops.
    pub fn finish(&self) -> bool {
        let first = self.latch.fire();
        if first {
            self.canceller
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }
        first
    }
}

/// Listener task watching the request's token; aborted on drop.
pub struct CancelListener {
    handle: JoinHandle<()>,
}

impl Drop for CancelListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
