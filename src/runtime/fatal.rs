use anyhow::Error as AnyError;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Captures the first unrecoverable error and stops the process by cancelling
/// the root token. Later errors are only returned to their caller.
#[derive(Clone)]
pub struct FatalErrorHandler {
    inner: Arc<FatalInner>,
}

struct FatalInner {
    triggered: AtomicBool,
    shutdown: CancellationToken,
    captured: Mutex<Option<Arc<AnyError>>>,
}

impl fmt::Debug for FatalErrorHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FatalErrorHandler")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

impl FatalErrorHandler {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(FatalInner {
                triggered: AtomicBool::new(false),
                shutdown,
                captured: Mutex::new(None),
            }),
        }
    }

    pub fn trigger(&self, context: &str, error: AnyError) -> AnyError {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            return error;
        }

        tracing::error!(context, error = %format!("{error:#}"), "fatal error; initiating shutdown");
        let message = format!("{error:#}");
        *self.inner.captured.lock() = Some(Arc::new(error));
        self.inner.shutdown.cancel();
        anyhow::anyhow!(message)
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Message of the captured error, if any.
    pub fn error(&self) -> Option<String> {
        self.inner
            .captured
            .lock()
            .as_ref()
            .map(|error| format!("{error:#}"))
    }

    /// Whether the captured error carries the given typed cause.
    pub fn captured_is<E>(&self) -> bool
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.inner
            .captured
            .lock()
            .as_ref()
            .map_or(false, |error| error.chain().any(|cause| cause.is::<E>()))
    }
}
