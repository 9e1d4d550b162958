use crate::code::Code;
use crate::errors::ExecutionError;
use crate::types::{CodeChannel, CodeFlags, CodeResult, ConnectionId, MacroHandle};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// When an interceptor sees a code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InterceptionMode {
    /// Before local handling.
    Pre,
    /// After local handling declined the code.
    Post,
    /// After the result has been finalized.
    Executed,
}

/// An interceptor's answer for one code. Singular per code per interceptor
/// per mode.
#[derive(Clone, Debug)]
pub enum InterceptionVerdict {
    /// Adopt this result and short-circuit the remaining pipeline.
    Resolve(Option<CodeResult>),
    /// Let the pipeline continue.
    Ignore,
    /// Abort the code.
    Cancel,
}

/// External observer of codes. The IPC layer adapts its wire connections to
/// this trait; tests implement it directly.
#[async_trait]
pub trait CodeInterceptor: Send + Sync {
    async fn intercept(&self, code: &Code, mode: InterceptionMode) -> InterceptionVerdict;
}

/// What the scheduler needs to know about a code currently being held inside
/// an interceptor round-trip.
#[derive(Clone, Copy, Debug)]
pub struct InterceptedSnapshot {
    pub channel: CodeChannel,
    pub is_from_macro: bool,
    pub macro_handle: Option<MacroHandle>,
}

struct Registration {
    connection: ConnectionId,
    mode: InterceptionMode,
    /// `None` watches every channel.
    channels: Option<HashSet<CodeChannel>>,
    interceptor: Arc<dyn CodeInterceptor>,
}

/// Outcome of a full interception pass in one mode.
pub enum InterceptionOutcome {
    Resolved {
        connection: ConnectionId,
        result: Option<CodeResult>,
    },
    Continue,
}

/// Delivers codes to registered interceptors in registration order and
/// collects their verdicts.
pub struct InterceptionBus {
    registrations: Mutex<Vec<Registration>>,
    intercepting: Mutex<HashMap<ConnectionId, InterceptedSnapshot>>,
}

impl InterceptionBus {
    pub fn new() -> InterceptionBus {
        InterceptionBus {
            registrations: Mutex::new(Vec::new()),
            intercepting: Mutex::new(HashMap::new()),
        }
    }

    /// Registers an interceptor for one mode. Returns the connection id used
    /// to address it (and to detect nested codes it emits).
    pub fn register(
        &self,
        mode: InterceptionMode,
        channels: Option<HashSet<CodeChannel>>,
        interceptor: Arc<dyn CodeInterceptor>,
    ) -> ConnectionId {
        let connection = ConnectionId::new_v4();
        self.register_connection(connection, mode, channels, interceptor);
        connection
    }

    /// Registers under an existing connection id (an IPC connection may
    /// intercept several modes at once).
    pub fn register_connection(
        &self,
        connection: ConnectionId,
        mode: InterceptionMode,
        channels: Option<HashSet<CodeChannel>>,
        interceptor: Arc<dyn CodeInterceptor>,
    ) {
        self.registrations.lock().unwrap().push(Registration {
            connection,
            mode,
            channels,
            interceptor,
        });
    }

    pub fn unregister(&self, connection: ConnectionId) {
        self.registrations
            .lock()
            .unwrap()
            .retain(|r| r.connection != connection);
    }

    /// The code currently being intercepted on the given connection, if any.
    pub fn code_being_intercepted(&self, connection: ConnectionId) -> Option<InterceptedSnapshot> {
        self.intercepting.lock().unwrap().get(&connection).copied()
    }

    /// Runs one interception pass. In `Pre`/`Post` mode the first `Resolve`
    /// or `Cancel` verdict ends the pass; in `Executed` mode every
    /// interceptor is notified and verdicts are ignored, except that the
    /// interceptor that resolved the code is skipped.
    pub async fn intercept(
        &self,
        code: &Code,
        mode: InterceptionMode,
    ) -> Result<InterceptionOutcome, ExecutionError> {
        let targets: Vec<(ConnectionId, Arc<dyn CodeInterceptor>)> = {
            let registrations = self.registrations.lock().unwrap();
            registrations
                .iter()
                .filter(|r| r.mode == mode)
                .filter(|r| {
                    r.channels
                        .as_ref()
                        .map(|set| set.contains(&code.channel))
                        .unwrap_or(true)
                })
                .map(|r| (r.connection, r.interceptor.clone()))
                .collect()
        };

        let snapshot = InterceptedSnapshot {
            channel: code.channel,
            is_from_macro: code.flags.contains(CodeFlags::IS_FROM_MACRO),
            macro_handle: code.macro_handle,
        };

        for (connection, interceptor) in targets {
            if mode == InterceptionMode::Executed && code.resolved_by == Some(connection) {
                continue;
            }

            self.intercepting
                .lock()
                .unwrap()
                .insert(connection, snapshot);
            let verdict = interceptor.intercept(code, mode).await;
            self.intercepting.lock().unwrap().remove(&connection);

            if mode == InterceptionMode::Executed {
                continue;
            }
            match verdict {
                InterceptionVerdict::Resolve(result) => {
                    tracing::debug!(code = %code.short_form(), ?mode, "code resolved by interceptor");
                    return Ok(InterceptionOutcome::Resolved { connection, result });
                }
                InterceptionVerdict::Cancel => {
                    tracing::debug!(code = %code.short_form(), ?mode, "code cancelled by interceptor");
                    return Err(ExecutionError::Cancelled);
                }
                InterceptionVerdict::Ignore => {}
            }
        }
        Ok(InterceptionOutcome::Continue)
    }
}

impl Default for InterceptionBus {
    fn default() -> InterceptionBus {
        InterceptionBus::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CodeType, Message};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        verdict: InterceptionVerdict,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CodeInterceptor for Scripted {
        async fn intercept(&self, _code: &Code, _mode: InterceptionMode) -> InterceptionVerdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdict.clone()
        }
    }

    fn scripted(verdict: InterceptionVerdict) -> Arc<Scripted> {
        Arc::new(Scripted {
            verdict,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn first_resolve_short_circuits_later_interceptors() {
        let bus = InterceptionBus::new();
        let resolver = scripted(InterceptionVerdict::Resolve(Some(
            Message::success("handled").into(),
        )));
        let ignored = scripted(InterceptionVerdict::Ignore);
        bus.register(InterceptionMode::Pre, None, resolver.clone());
        bus.register(InterceptionMode::Pre, None, ignored.clone());

        let code = Code::new(CodeChannel::Http, CodeType::MCode, Some(117));
        match bus.intercept(&code, InterceptionMode::Pre).await.unwrap() {
            InterceptionOutcome::Resolved { result, .. } => {
                assert_eq!(result.unwrap().0[0].content, "handled");
            }
            InterceptionOutcome::Continue => panic!("expected resolution"),
        }
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ignored.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_verdict_raises_cancelled() {
        let bus = InterceptionBus::new();
        bus.register(
            InterceptionMode::Pre,
            None,
            scripted(InterceptionVerdict::Cancel),
        );
        let code = Code::new(CodeChannel::Http, CodeType::GCode, Some(1));
        let result = bus.intercept(&code, InterceptionMode::Pre).await;
        assert!(matches!(result, Err(ExecutionError::Cancelled)));
    }

    #[tokio::test]
    async fn executed_mode_notifies_everyone_but_the_resolver() {
        let bus = InterceptionBus::new();
        let a = scripted(InterceptionVerdict::Ignore);
        let b = scripted(InterceptionVerdict::Cancel);
        let resolver_conn = bus.register(InterceptionMode::Executed, None, a.clone());
        bus.register(InterceptionMode::Executed, None, b.clone());

        let mut code = Code::new(CodeChannel::Http, CodeType::MCode, Some(105));
        code.resolved_by = Some(resolver_conn);
        let outcome = bus.intercept(&code, InterceptionMode::Executed).await.unwrap();
        assert!(matches!(outcome, InterceptionOutcome::Continue));
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
        // Cancel verdicts are meaningless after execution.
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn channel_filter_limits_delivery() {
        let bus = InterceptionBus::new();
        let watcher = scripted(InterceptionVerdict::Ignore);
        let mut channels = HashSet::new();
        channels.insert(CodeChannel::Usb);
        bus.register(InterceptionMode::Pre, Some(channels), watcher.clone());

        let http = Code::new(CodeChannel::Http, CodeType::GCode, Some(1));
        bus.intercept(&http, InterceptionMode::Pre).await.unwrap();
        assert_eq!(watcher.calls.load(Ordering::SeqCst), 0);

        let usb = Code::new(CodeChannel::Usb, CodeType::GCode, Some(1));
        bus.intercept(&usb, InterceptionMode::Pre).await.unwrap();
        assert_eq!(watcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn intercepted_code_is_visible_during_the_round_trip() {
        struct Probe {
            bus: Arc<InterceptionBus>,
            connection: Mutex<Option<ConnectionId>>,
        }

        #[async_trait]
        impl CodeInterceptor for Probe {
            async fn intercept(&self, _code: &Code, _mode: InterceptionMode) -> InterceptionVerdict {
                let connection = self.connection.lock().unwrap().unwrap();
                assert!(self.bus.code_being_intercepted(connection).is_some());
                InterceptionVerdict::Ignore
            }
        }

        let bus = Arc::new(InterceptionBus::new());
        let probe = Arc::new(Probe {
            bus: bus.clone(),
            connection: Mutex::new(None),
        });
        let connection = bus.register(InterceptionMode::Pre, None, probe.clone());
        *probe.connection.lock().unwrap() = Some(connection);

        let code = Code::new(CodeChannel::Daemon, CodeType::GCode, Some(4));
        bus.intercept(&code, InterceptionMode::Pre).await.unwrap();
        assert!(bus.code_being_intercepted(connection).is_none());
    }
}
