use crate::code::Code;
use crate::errors::ExecutionError;
use crate::interception::InterceptionBus;
use crate::macros::MacroArena;
use crate::model::MachineModelStore;
use crate::sync::{with_cancel, CancellationSource, CancellationToken, OrderedGuard, OrderedMutex, Ticket};
use crate::types::{CodeChannel, CodeFlags, CodeType, InternalCodeType};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

// ─── Per-channel state ────────────────────────────────────────

/// A file opened by `M28`. While present, every non-`M29` code on the
/// channel is appended to it instead of being executed.
#[derive(Debug)]
pub struct FileBeingWritten {
    pub virtual_path: String,
    pub physical_path: PathBuf,
    pub file: tokio::fs::File,
}

struct ChannelState {
    start_locks: [Arc<OrderedMutex>; InternalCodeType::COUNT],
    finish_locks: [Arc<OrderedMutex>; InternalCodeType::COUNT],
    cancellation: Mutex<CancellationSource>,
    file_being_written: Arc<tokio::sync::Mutex<Option<FileBeingWritten>>>,
}

// ─── Execution slot ───────────────────────────────────────────

/// Ordering state of one admitted code. The start guard bounds admission,
/// the finish ticket/guard bound completion. Codes emitted by an interceptor
/// on its own connection bypass ordering entirely and carry no locks.
pub struct ExecutionSlot {
    pub token: CancellationToken,
    pub class: Option<InternalCodeType>,
    start_guard: Option<OrderedGuard>,
    finish_lock: Option<Arc<OrderedMutex>>,
    finish_ticket: Option<Ticket>,
    finish_guard: Option<OrderedGuard>,
}

impl ExecutionSlot {
    fn bypass(token: CancellationToken) -> ExecutionSlot {
        ExecutionSlot {
            token,
            class: None,
            start_guard: None,
            finish_lock: None,
            finish_ticket: None,
            finish_guard: None,
        }
    }

    /// Fixes this code's completion-queue position. Must happen while the
    /// start lock is still held so that completion order equals admission
    /// order.
    pub fn register_finish(&mut self) {
        if self.finish_ticket.is_none() && self.finish_guard.is_none() {
            if let Some(lock) = &self.finish_lock {
                self.finish_ticket = Some(lock.enqueue());
            }
        }
    }

    /// Registers the finish position and lets the next admission begin.
    pub fn start_next(&mut self) {
        self.register_finish();
        self.start_guard = None;
    }

    pub fn holds_start(&self) -> bool {
        self.start_guard.is_some()
    }

    pub fn release_start(&mut self) {
        self.start_guard = None;
    }

    /// Waits for every earlier code on this (channel, class) to finish.
    /// Deliberately not cancellable: completion ordering holds on success,
    /// handler error and cancellation alike.
    pub async fn wait_for_finish(&mut self) {
        self.register_finish();
        if let Some(ticket) = self.finish_ticket.take() {
            self.finish_guard = Some(ticket.wait().await);
        }
    }

    pub fn release_finish(&mut self) {
        self.finish_ticket = None;
        self.finish_guard = None;
    }
}

// ─── Scheduler ────────────────────────────────────────────────

/// Owns the start/finish lock matrix, the per-channel cancellation sources
/// and the per-channel file-capture slots. One instance per daemon, shared
/// by every request handler.
pub struct Scheduler {
    channels: [ChannelState; CodeChannel::COUNT],
    global_tx: watch::Sender<bool>,
    global_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        let (global_tx, global_rx) = watch::channel(false);
        let channels = std::array::from_fn(|_| ChannelState {
            start_locks: std::array::from_fn(|_| OrderedMutex::new()),
            finish_locks: std::array::from_fn(|_| OrderedMutex::new()),
            cancellation: Mutex::new(CancellationSource::new(global_rx.clone())),
            file_being_written: Arc::new(tokio::sync::Mutex::new(None)),
        });
        Scheduler {
            channels,
            global_tx,
            global_rx,
        }
    }

    /// Admits a code: classifies it, waits for its start lock in FIFO order
    /// and returns the slot that tracks its ordering state. Fails with
    /// `Cancelled` when the channel is cancelled before admission.
    pub async fn wait_for_execution(
        &self,
        code: &mut Code,
        bus: &InterceptionBus,
        macros: &MacroArena,
        model: &MachineModelStore,
    ) -> Result<ExecutionSlot, ExecutionError> {
        let state = &self.channels[code.channel.index()];
        let token = state.cancellation.lock().unwrap().token();

        // A code emitted by an interceptor on the connection it is currently
        // intercepting must not wait behind the intercepted code.
        if let Some(connection) = code.connection {
            if let Some(snapshot) = bus.code_being_intercepted(connection) {
                if snapshot.channel == code.channel {
                    if snapshot.is_from_macro {
                        code.flags |= CodeFlags::IS_FROM_MACRO;
                    }
                    if code.macro_handle.is_none() {
                        code.macro_handle = snapshot.macro_handle;
                    }
                    tracing::debug!(channel = %code.channel, "bypassing scheduler for nested interceptor code");
                    return Ok(ExecutionSlot::bypass(token));
                }
            }
        }

        let class = self.classify(code, model).await;
        let (start_lock, finish_lock) = self.locks_for(code, class, macros, state);

        let ticket = start_lock.enqueue();
        let start_guard = with_cancel(&token, ticket.wait()).await?;
        tracing::trace!(channel = %code.channel, ?class, code = %code.short_form(), "code admitted");

        Ok(ExecutionSlot {
            token,
            class: Some(class),
            start_guard: Some(start_guard),
            finish_lock: Some(finish_lock),
            finish_ticket: None,
            finish_guard: None,
        })
    }

    async fn classify(&self, code: &Code, model: &MachineModelStore) -> InternalCodeType {
        if code.flags.contains(CodeFlags::IS_PRIORITIZED) {
            InternalCodeType::Prioritized
        } else if code.flags.contains(CodeFlags::IS_FROM_MACRO) {
            InternalCodeType::Macro
        } else if model.is_waiting_for_acknowledgement(code.channel).await
            && !code.is_major(CodeType::MCode, 0)
            && !code.is_major(CodeType::MCode, 1)
        {
            InternalCodeType::Acknowledgement
        } else {
            InternalCodeType::Regular
        }
    }

    /// Macro codes with an attached handle serialize on the macro's own gate
    /// so that nested macros only serialize with their siblings.
    fn locks_for(
        &self,
        code: &Code,
        class: InternalCodeType,
        macros: &MacroArena,
        state: &ChannelState,
    ) -> (Arc<OrderedMutex>, Arc<OrderedMutex>) {
        if class == InternalCodeType::Macro {
            if let Some(handle) = code.macro_handle {
                if let Some(state) = macros.get(handle) {
                    return (state.start_lock.clone(), state.finish_lock.clone());
                }
            }
        }
        (
            state.start_locks[class.index()].clone(),
            state.finish_locks[class.index()].clone(),
        )
    }

    /// Cancels every code on the channel that has not started yet. Codes
    /// already past their start lock keep their (already fired) token but
    /// only observe it at their next await point.
    pub fn cancel_pending(&self, channel: CodeChannel) {
        let state = &self.channels[channel.index()];
        let mut source = state.cancellation.lock().unwrap();
        let old = std::mem::replace(&mut *source, CancellationSource::new(self.global_rx.clone()));
        old.cancel();
        tracing::debug!(%channel, "pending codes cancelled");
    }

    /// Process-wide cancellation.
    pub fn cancel_everything(&self) {
        let _ = self.global_tx.send(true);
        tracing::warn!("all channels cancelled");
    }

    pub fn file_being_written(
        &self,
        channel: CodeChannel,
    ) -> Arc<tokio::sync::Mutex<Option<FileBeingWritten>>> {
        self.channels[channel.index()].file_being_written.clone()
    }
}

impl Default for Scheduler {
    fn default() -> Scheduler {
        Scheduler::new()
    }
}
