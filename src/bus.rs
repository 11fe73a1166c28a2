//! In-process publish/subscribe bus with a closed set of typed signals.
//!
//! Each signal owns a [`Channel`] holding its listeners in registration order.
//! Dispatch is synchronous: it returns once every listener registered at the
//! moment of the call has run. A listener that errors or panics is logged and
//! counted; the rest still run.

use crate::model::{AppliedBlock, IndexedBlock, RawBlock};
use crate::runtime::telemetry::Telemetry;
use futures::FutureExt as _;
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub type Listener<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

/// Wraps a closure into a shareable listener handle. Keep the handle to remove it later.
pub fn listener<T, F>(f: F) -> Listener<T>
where
    F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

struct Registration<T> {
    listener: Listener<T>,
    active: AtomicBool,
}

/// Result of a single dispatch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub invoked: usize,
    pub failed: usize,
}

pub struct Channel<T> {
    name: &'static str,
    entries: RwLock<Vec<Arc<Registration<T>>>>,
    failures: AtomicU64,
    telemetry: Option<Arc<Telemetry>>,
}

impl<T> Channel<T> {
    fn new(name: &'static str, telemetry: Option<Arc<Telemetry>>) -> Self {
        Self {
            name,
            entries: RwLock::new(Vec::new()),
            failures: AtomicU64::new(0),
            telemetry,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Registers `listener`. Returns `false` if this exact handle is already registered.
    pub fn add(&self, listener: Listener<T>) -> bool {
        let mut entries = self.entries.write();
        if entries
            .iter()
            .any(|entry| Arc::ptr_eq(&entry.listener, &listener))
        {
            return false;
        }
        entries.push(Arc::new(Registration {
            listener,
            active: AtomicBool::new(true),
        }));
        true
    }

    pub fn remove(&self, listener: &Listener<T>) -> bool {
        let mut entries = self.entries.write();
        match entries
            .iter()
            .position(|entry| Arc::ptr_eq(&entry.listener, listener))
        {
            Some(index) => {
                let entry = entries.remove(index);
                entry.active.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Total listener failures observed on this channel.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn dispatch(&self, payload: &T) -> DispatchReport {
        let snapshot: Vec<_> = self.entries.read().clone();
        let mut report = DispatchReport::default();

        for entry in snapshot {
            // Removed after the snapshot was taken but before its turn.
            if !entry.active.load(Ordering::SeqCst) {
                continue;
            }
            report.invoked += 1;

            let outcome = catch_unwind(AssertUnwindSafe(|| (entry.listener)(payload)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("{err:#}")),
                Err(panic) => Some(format!("listener panicked: {}", panic_message(panic.as_ref()))),
            };

            if let Some(error) = failure {
                report.failed += 1;
                self.failures.fetch_add(1, Ordering::Relaxed);
                if let Some(telemetry) = &self.telemetry {
                    telemetry.record_listener_failure();
                }
                tracing::warn!(signal = self.name, error = %error, "signal listener failed");
            }
        }

        report
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("listeners", &self.len())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs a future and turns a panic into an error, for spawned background tasks.
pub(crate) async fn catch_task_panic<F>(future: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!(
            "task panicked: {}",
            panic_message(panic.as_ref())
        )),
    }
}

/// Why the validator cache is being rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadReason {
    Startup,
    ModulesChanged,
    AuditMismatch,
    /// A block event could not be applied to the cache.
    Resync,
    Rebuild,
    Requested(String),
}

/// Marker trait tying a signal kind to its payload type and channel.
pub trait Signal: 'static {
    type Payload: 'static;
    const NAME: &'static str;

    fn channel(bus: &EventBus) -> &Channel<Self::Payload>;
}

macro_rules! signals {
    ($($(#[$doc:meta])* $kind:ident => $field:ident: $payload:ty = $name:literal;)+) => {
        $(
            $(#[$doc])*
            #[derive(Debug, Clone, Copy)]
            pub struct $kind;

            impl Signal for $kind {
                type Payload = $payload;
                const NAME: &'static str = $name;

                fn channel(bus: &EventBus) -> &Channel<$payload> {
                    &bus.$field
                }
            }
        )+

        /// Process-wide set of signal channels, owned by the composition root.
        #[derive(Debug)]
        pub struct EventBus {
            $($field: Channel<$payload>,)+
        }

        impl EventBus {
            pub fn new() -> Self {
                Self::build(None)
            }

            /// Like [`EventBus::new`], but every listener failure is also counted in `telemetry`.
            pub fn with_telemetry(telemetry: Arc<Telemetry>) -> Self {
                Self::build(Some(telemetry))
            }

            fn build(telemetry: Option<Arc<Telemetry>>) -> Self {
                Self {
                    $($field: Channel::new($name, telemetry.clone()),)+
                }
            }
        }
    };
}

signals! {
    /// The node announced a new block.
    NodeNewBlock => node_new_block: RawBlock = "node.newBlock";
    /// The node rolled a block back.
    NodeDeleteBlock => node_delete_block: RawBlock = "node.deleteBlock";
    /// A canonical block was persisted.
    NewBlock => new_block: AppliedBlock = "newBlock";
    /// A canonical block was removed from the store.
    DeleteBlock => delete_block: IndexedBlock = "deleteBlock";
    ReloadValidators => reload_validators: ReloadReason = "reloadValidators";
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn get<S: Signal>(&self) -> &Channel<S::Payload> {
        S::channel(self)
    }

    pub fn dispatch<S: Signal>(&self, payload: &S::Payload) -> DispatchReport {
        S::channel(self).dispatch(payload)
    }
}
