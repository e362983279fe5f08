//! Tokio hosting for executers.

use std::sync::OnceLock;
use std::time::Duration;

use quarry_common::ActorId;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter};

use crate::config::ExecuterSettings;
use crate::executer::{Executer, ExecuterReply, ExecutionStrategy};
use crate::messages::{EventSender, ExecuterEvent, TxRequest};
use crate::services::{ExecuterServices, Timer};

static INIT: OnceLock<()> = OnceLock::new();

/// Installs the global fmt subscriber once. `RUST_LOG` overrides the
/// default `info` level.
pub fn init_tracing() {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_fmt().with_env_filter(filter).with_target(true).try_init();
    });
}

/// Timer backed by the tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioTimer {
    handle: tokio::runtime::Handle,
}

impl TokioTimer {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Binds to the runtime of the calling context.
    pub fn try_current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, event: ExecuterEvent, reply: EventSender) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            // The executer may be gone by now.
            let _ = reply.send(event);
        });
    }
}

/// Running executer: its inbox and the task driving it.
pub struct ExecuterHandle {
    pub id: ActorId,
    pub sender: EventSender,
    pub join: JoinHandle<()>,
}

impl ExecuterHandle {
    /// Posts an event into the executer inbox. Returns `false` once the
    /// executer has terminated.
    pub fn send(&self, event: ExecuterEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

/// Spawns an executer for `request` on the current tokio runtime.
pub fn spawn_executer(
    id: ActorId,
    settings: ExecuterSettings,
    services: ExecuterServices,
    strategy: Box<dyn ExecutionStrategy>,
    request: TxRequest,
) -> (ExecuterHandle, oneshot::Receiver<ExecuterReply>) {
    let (sender, mut inbox) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = oneshot::channel();
    let mut executer = Executer::new(id, settings, services, strategy, sender.clone(), reply_tx);
    if sender.send(ExecuterEvent::TxRequest(Box::new(request))).is_err() {
        warn!(executer = %id, "inbox closed before the request was posted");
    }

    let join = tokio::spawn(async move {
        while let Some(event) = inbox.recv().await {
            executer.handle(event);
            if executer.is_terminated() {
                break;
            }
        }
        debug!(executer = %executer.id(), state = ?executer.state(), "executer loop stopped");
    });

    (ExecuterHandle { id, sender, join }, reply_rx)
}
