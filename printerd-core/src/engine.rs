use crate::code::Code;
use crate::errors::ExecutionError;
use crate::expressions;
use crate::firmware::FirmwareInterface;
use crate::handlers;
use crate::interception::{InterceptionBus, InterceptionMode, InterceptionOutcome};
use crate::macros::{MacroArena, MacroState};
use crate::model::MachineModelStore;
use crate::paths::{self, FileDirectory};
use crate::scheduler::{ExecutionSlot, Scheduler};
use crate::settings::Settings;
use crate::sync::with_cancel;
use crate::types::{
    CodeChannel, CodeFlags, CodeResult, CodeType, ConnectionId, KeywordType, Message, MessageType,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;

/// CodeExecutor is the top-level facade that wires together the scheduler,
/// interception bus, internal handlers and firmware dispatcher. Request
/// handlers delegate to this.
pub struct CodeExecutor {
    pub settings: Settings,
    pub scheduler: Scheduler,
    pub bus: InterceptionBus,
    pub firmware: Arc<dyn FirmwareInterface>,
    pub model: Arc<MachineModelStore>,
    pub macros: MacroArena,
    started_at: Instant,
}

impl CodeExecutor {
    pub fn new(
        settings: Settings,
        firmware: Arc<dyn FirmwareInterface>,
        model: Arc<MachineModelStore>,
    ) -> Arc<CodeExecutor> {
        Arc::new(CodeExecutor {
            settings,
            scheduler: Scheduler::new(),
            bus: InterceptionBus::new(),
            firmware,
            model,
            macros: MacroArena::new(),
            started_at: Instant::now(),
        })
    }

    /// Executes one code through the full pipeline. Asynchronous codes are
    /// detached after admission and yield no result. Boxed so that macro
    /// handlers can re-enter the executor.
    pub fn execute(
        self: &Arc<Self>,
        code: Code,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CodeResult>, ExecutionError>> + Send + 'static>>
    {
        let this = self.clone();
        Box::pin(async move {
            let mut code = code;
            let slot = this
                .scheduler
                .wait_for_execution(&mut code, &this.bus, &this.macros, &this.model)
                .await?;

            if code.flags.contains(CodeFlags::ASYNCHRONOUS) {
                tokio::spawn(async move {
                    let short = code.short_form();
                    if let Err(e) = this.run(&mut code, slot).await {
                        if !e.is_cancelled() {
                            tracing::warn!(code = %short, error = %e, "fire-and-forget code failed");
                        }
                    }
                });
                return Ok(None);
            }

            this.run(&mut code, slot).await?;
            Ok(code.result.take())
        })
    }

    /// Runs an admitted code and releases its ordering locks on every path.
    async fn run(
        self: &Arc<Self>,
        code: &mut Code,
        mut slot: ExecutionSlot,
    ) -> Result<(), ExecutionError> {
        let outcome = self.run_guarded(code, &mut slot).await;
        slot.release_start();
        slot.release_finish();
        outcome
    }

    async fn run_guarded(
        self: &Arc<Self>,
        code: &mut Code,
        slot: &mut ExecutionSlot,
    ) -> Result<(), ExecutionError> {
        // An M28 capture swallows everything on the channel except M29.
        if !code.is_major(CodeType::MCode, 29) {
            let writer = self.scheduler.file_being_written(code.channel);
            let mut guard = writer.lock().await;
            if let Some(capture) = guard.as_mut() {
                capture
                    .file
                    .write_all(format!("{code}\n").as_bytes())
                    .await?;
                capture.file.flush().await?;
                code.result = Some(CodeResult::new());
                return Ok(());
            }
        }
        self.process(code, slot).await
    }

    /// Drives the phases of one code and finalizes on every path, so that
    /// completion ordering survives handler errors and cancellation.
    async fn process(
        self: &Arc<Self>,
        code: &mut Code,
        slot: &mut ExecutionSlot,
    ) -> Result<(), ExecutionError> {
        match self.process_phases(code, slot).await {
            Ok(()) => self.finalize(code, slot).await,
            Err(e) => {
                if e.is_cancelled() {
                    code.result = None;
                }
                if let Err(hook_error) = self.finalize(code, slot).await {
                    tracing::error!(
                        code = %code.short_form(),
                        error = %hook_error,
                        "finalization failed after pipeline error"
                    );
                }
                Err(e)
            }
        }
    }

    async fn process_phases(
        self: &Arc<Self>,
        code: &mut Code,
        slot: &mut ExecutionSlot,
    ) -> Result<(), ExecutionError> {
        if !code.flags.contains(CodeFlags::IS_INTERNALLY_PROCESSED)
            && self.process_internally(code).await?
        {
            return Ok(());
        }

        if code.code_type == CodeType::Comment {
            code.result = Some(CodeResult::new());
            return Ok(());
        }

        if code.channel == CodeChannel::File {
            let _job = self.model.lock_job().await;
            if self.model.is_job_paused().await {
                return Err(ExecutionError::Cancelled);
            }
        }

        eprintln!("DEBUG dispatching {} to firmware", code.short_form());
        let reply = self.firmware.process_code(code);
        if code.flags.contains(CodeFlags::UNBUFFERED) {
            slot.register_finish();
        } else {
            slot.start_next();
        }
        let result = with_cancel(&slot.token, reply).await??;
        eprintln!("DEBUG got reply for {}", code.short_form());
        code.result = Some(result);
        Ok(())
    }

    /// Local resolution attempt: pre-interception, host-side expression
    /// evaluation, internal handlers, post-interception, `echo`.
    async fn process_internally(
        self: &Arc<Self>,
        code: &mut Code,
    ) -> Result<bool, ExecutionError> {
        if let Some(keyword) = code.keyword {
            if keyword != KeywordType::Echo {
                return Err(ExecutionError::Protocol(format!(
                    "cannot execute {} keyword in the code pipeline",
                    keyword.as_str()
                )));
            }
        }

        if !code.flags.contains(CodeFlags::IS_PRE_PROCESSED) {
            let outcome = self.bus.intercept(code, InterceptionMode::Pre).await?;
            code.flags |= CodeFlags::IS_PRE_PROCESSED;
            if let InterceptionOutcome::Resolved { connection, result } = outcome {
                adopt_interceptor_result(code, connection, result);
                return Ok(true);
            }
        }

        if code.keyword.is_none() && expressions::contains_host_fields(code) {
            self.flush_or_cancel(code).await?;
            let model_json = self.model.to_json().await;
            expressions::evaluate_in_place(code, &model_json)?;
        }

        if code.keyword.is_none() {
            match handlers::process(self, code).await {
                Ok(Some(result)) => {
                    code.result = Some(result);
                    code.flags |= CodeFlags::IS_INTERNALLY_PROCESSED;
                    return Ok(true);
                }
                Ok(None) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::error!(code = %code.short_form(), error = %e, "internal handler failed");
                    return Err(ExecutionError::Handler(e.to_string()));
                }
            }
        }

        if !code.flags.contains(CodeFlags::IS_POST_PROCESSED) {
            let outcome = self.bus.intercept(code, InterceptionMode::Post).await?;
            code.flags |= CodeFlags::IS_POST_PROCESSED;
            if let InterceptionOutcome::Resolved { connection, result } = outcome {
                adopt_interceptor_result(code, connection, result);
                return Ok(true);
            }
        }

        if code.keyword == Some(KeywordType::Echo) {
            self.flush_or_cancel(code).await?;
            let model_json = self.model.to_json().await;
            let argument = code.keyword_argument.clone().unwrap_or_default();
            let content = expressions::evaluate_echo(&argument, &model_json)?;
            code.result = Some(Message::success(content).into());
            code.flags |= CodeFlags::IS_INTERNALLY_PROCESSED;
            return Ok(true);
        }

        Ok(false)
    }

    async fn finalize(
        self: &Arc<Self>,
        code: &mut Code,
        slot: &mut ExecutionSlot,
    ) -> Result<(), ExecutionError> {
        slot.wait_for_finish().await;
        self.code_executed(code).await
    }

    /// Post-processing of the finalized result: handler hooks, error
    /// prefixing, compatibility cosmetics, logging, executed interceptors.
    async fn code_executed(self: &Arc<Self>, code: &mut Code) -> Result<(), ExecutionError> {
        if !code.flags.contains(CodeFlags::RESOLVED_BY_INTERCEPTOR) {
            if let Err(e) = handlers::code_executed(self, code).await {
                tracing::error!(code = %code.short_form(), error = %e, "executed hook failed");
            }
        }

        let compatibility = self.model.compatibility(code.channel).await;
        let prefix = code.short_form();
        let is_m105 = code.is_major(CodeType::MCode, 105);
        let channel = code.channel;

        if let Some(result) = code.result.as_mut() {
            for message in &mut result.0 {
                if message.mtype == MessageType::Error && !message.content.starts_with(&prefix) {
                    message.content = format!("{prefix}: {}", message.content);
                }
            }

            if compatibility.wants_ok() {
                if is_m105 {
                    match result.0.first_mut() {
                        Some(first) if !first.content.starts_with("ok") => {
                            first.content = format!("ok {}", first.content);
                        }
                        None => result.push(Message::success("ok")),
                        _ => {}
                    }
                } else {
                    match result.0.last_mut() {
                        Some(last) => last.content.push_str("\nok\n"),
                        None => result.push(Message::success("ok\n")),
                    }
                }
            } else if let Some(last) = result.0.last_mut() {
                if !last.content.is_empty() && !last.content.ends_with('\n') {
                    last.content.push('\n');
                }
            }

            if channel != CodeChannel::File {
                for message in &result.0 {
                    match message.mtype {
                        MessageType::Warning => {
                            tracing::warn!(code = %prefix, "{}", message.content.trim_end())
                        }
                        MessageType::Error => {
                            tracing::error!(code = %prefix, "{}", message.content.trim_end())
                        }
                        MessageType::Success => {}
                    }
                }
            }
        }

        let _ = self.bus.intercept(code, InterceptionMode::Executed).await;
        Ok(())
    }

    /// Waits for the transport to drain the code's channel; a refused flush
    /// cancels the code.
    pub(crate) async fn flush_or_cancel(&self, code: &Code) -> Result<(), ExecutionError> {
        if !self.firmware.flush_code(code).await? {
            return Err(ExecutionError::Cancelled);
        }
        Ok(())
    }

    // ── Macro files ──

    /// Runs a macro file to completion and returns its accumulated output.
    /// Codes inherit the channel and serialize on the macro's own gate.
    pub async fn run_macro_file(
        self: &Arc<Self>,
        file_name: &str,
        category: FileDirectory,
        channel: CodeChannel,
    ) -> Result<CodeResult, ExecutionError> {
        eprintln!("DEBUG run_macro_file start {}", file_name);
        let path = paths::to_physical(&self.settings, file_name, category);
        let state = self.macros.allocate(file_name, path, channel);
        tracing::debug!(file = %state.file_name, %channel, "macro file started");
        let result = self.run_macro_lines(&state).await;
        eprintln!("DEBUG run_macro_file done {} ok={}", file_name, result.is_ok());
        self.macros.release(state.handle);
        if let Err(e) = &result {
            tracing::warn!(file = %state.file_name, error = %e, "macro file failed");
        }
        result
    }

    async fn run_macro_lines(
        self: &Arc<Self>,
        state: &Arc<MacroState>,
    ) -> Result<CodeResult, ExecutionError> {
        use tokio::io::AsyncBufReadExt;

        let file = tokio::fs::File::open(&state.path).await?;
        let mut lines = tokio::io::BufReader::new(file).lines();

        let mut collected = CodeResult::new();
        let mut line_number = 0u64;
        let mut position = 0u64;
        while let Some(line) = lines.next_line().await? {
            line_number += 1;
            let length = line.len() as u64 + 1;

            let mut code = Code::parse(state.channel, &line)?;
            code.flags |= CodeFlags::IS_FROM_MACRO;
            code.macro_handle = Some(state.handle);
            code.file_position = Some(position);
            if code.line_number.is_none() {
                code.line_number = Some(line_number);
            }
            position += length;

            eprintln!("DEBUG macro line executing: {}", line);
            if let Some(result) = self.execute(code).await? {
                collected.0.extend(result.0);
            }
            eprintln!("DEBUG macro line done: {}", line);
        }
        Ok(collected)
    }

    // ── Diagnostics ──

    /// Daemon-side portion of the M122 report.
    pub(crate) async fn diagnostics(&self) -> String {
        let model = self.model.read().await;
        let mut text = String::from("=== Control daemon diagnostics ===\n");
        text.push_str(&format!("Version: {}\n", env!("CARGO_PKG_VERSION")));
        text.push_str(&format!(
            "Uptime: {}s\n",
            self.started_at.elapsed().as_secs()
        ));
        text.push_str(&format!("Machine status: {:?}\n", model.state.status));
        for input in &model.inputs {
            text.push_str(&format!(
                "Channel {}: {:?}{}\n",
                input.name,
                input.compatibility,
                if input.relative_extrusion {
                    ", relative extrusion"
                } else {
                    ""
                }
            ));
        }
        if let Some(file) = &model.job.file {
            text.push_str(&format!(
                "Job: {} at byte {}/{}\n",
                file.file_name, model.job.file_position, file.size
            ));
        }
        text.push_str(&format!("Active macros: {}", self.macros.active_count()));
        text
    }
}

fn adopt_interceptor_result(
    code: &mut Code,
    connection: ConnectionId,
    result: Option<CodeResult>,
) {
    code.flags |= CodeFlags::RESOLVED_BY_INTERCEPTOR | CodeFlags::IS_INTERNALLY_PROCESSED;
    code.resolved_by = Some(connection);
    code.result = Some(result.unwrap_or_default());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::MockFirmware;
    use crate::interception::{CodeInterceptor, InterceptionVerdict};
    use crate::types::Compatibility;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Engine wired to a mock transport over a throwaway SD tree.
    fn fixture() -> (
        Arc<CodeExecutor>,
        Arc<MockFirmware>,
        Arc<MachineModelStore>,
        TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["gcodes", "sys", "macros", "filaments", "www", "scans"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        let settings = Settings::with_base(dir.path());
        let firmware = MockFirmware::new();
        let model = Arc::new(MachineModelStore::new());
        model.mark_fully_synced();
        let executor = CodeExecutor::new(settings, firmware.clone(), model.clone());
        (executor, firmware, model, dir)
    }

    async fn run(executor: &Arc<CodeExecutor>, channel: CodeChannel, text: &str) -> CodeResult {
        executor
            .execute(Code::parse(channel, text).unwrap())
            .await
            .unwrap()
            .expect("expected a result")
    }

    /// Executed-mode interceptor that records short forms and result
    /// presence in hook order.
    struct Recorder {
        seen: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl CodeInterceptor for Recorder {
        async fn intercept(&self, code: &Code, _mode: InterceptionMode) -> InterceptionVerdict {
            self.seen
                .lock()
                .unwrap()
                .push((code.short_form(), code.result.is_some()));
            InterceptionVerdict::Ignore
        }
    }

    fn install_recorder(executor: &Arc<CodeExecutor>) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        executor
            .bus
            .register(InterceptionMode::Executed, None, recorder.clone());
        recorder
    }

    // ── Pipeline basics ──

    #[tokio::test]
    async fn comment_codes_produce_an_empty_result_without_dispatch() {
        let (executor, firmware, _model, _dir) = fixture();
        let recorder = install_recorder(&executor);

        let result = run(&executor, CodeChannel::Usb, "; just a note").await;
        assert!(result.is_empty());
        assert!(result.is_successful());
        assert_eq!(firmware.dispatched_count(), 0);
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_codes_are_forwarded_to_the_firmware() {
        let (executor, firmware, _model, _dir) = fixture();
        firmware.push_response(Message::success("T:20.1").into());

        let result = run(&executor, CodeChannel::Usb, "M105").await;
        assert_eq!(result.0[0].content, "T:20.1\n");
        assert_eq!(firmware.dispatched(), vec!["M105"]);
    }

    #[tokio::test]
    async fn conditional_keywords_violate_the_pipeline_contract() {
        let (executor, _firmware, _model, _dir) = fixture();
        let error = executor
            .execute(Code::parse(CodeChannel::Usb, "if true").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(error, ExecutionError::Protocol(_)));
    }

    #[tokio::test]
    async fn asynchronous_codes_detach_and_still_run() {
        let (executor, firmware, _model, _dir) = fixture();
        let mut code = Code::parse(CodeChannel::Usb, "G4 S1").unwrap();
        code.flags |= CodeFlags::ASYNCHRONOUS;

        let result = executor.execute(code).await.unwrap();
        assert!(result.is_none());

        while firmware.dispatched_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(firmware.dispatched(), vec!["G4"]);
    }

    // ── Ordering properties ──

    #[tokio::test]
    async fn executed_hooks_fire_in_admission_order_despite_reply_reordering() {
        let (executor, firmware, _model, _dir) = fixture();
        let recorder = install_recorder(&executor);
        firmware.set_gated(true);

        let f1 = executor.execute(Code::parse(CodeChannel::Http, "G1 X1").unwrap());
        let f2 = executor.execute(Code::parse(CodeChannel::Http, "G4 P0").unwrap());
        let f3 = executor.execute(Code::parse(CodeChannel::Http, "G28").unwrap());
        let all = tokio::spawn(async move { tokio::join!(f1, f2, f3) });

        // All three pipeline to the transport before any reply arrives.
        while firmware.waiting_count() < 3 {
            tokio::task::yield_now().await;
        }

        // Replies arrive in reverse order.
        firmware.release_newest();
        firmware.release_newest();
        firmware.release_newest();

        let (r1, r2, r3) = all.await.unwrap();
        r1.unwrap();
        r2.unwrap();
        r3.unwrap();

        let seen = recorder.seen.lock().unwrap();
        let order: Vec<&str> = seen.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(order, vec!["G1", "G4", "G28"]);
    }

    #[tokio::test]
    async fn prioritized_codes_overtake_queued_regulars() {
        let (executor, firmware, _model, _dir) = fixture();
        let recorder = install_recorder(&executor);
        firmware.set_gated(true);

        // An unbuffered code keeps the Regular start lock until its reply,
        // so later regulars stay unadmitted.
        let mut blocker = Code::parse(CodeChannel::Http, "G1 X1").unwrap();
        blocker.flags |= CodeFlags::UNBUFFERED;
        let blocker = tokio::spawn(executor.execute(blocker));
        while firmware.waiting_count() < 1 {
            tokio::task::yield_now().await;
        }

        let queued: Vec<_> = (0..2)
            .map(|i| {
                let code = Code::parse(CodeChannel::Http, &format!("G4 P{i}")).unwrap();
                tokio::spawn(executor.execute(code))
            })
            .collect();
        tokio::task::yield_now().await;

        let mut urgent = Code::parse(CodeChannel::Http, "M112").unwrap();
        urgent.flags |= CodeFlags::IS_PRIORITIZED;
        let urgent = tokio::spawn(executor.execute(urgent));
        while firmware.waiting_count() < 2 {
            tokio::task::yield_now().await;
        }

        // Only the prioritized dispatch is released; the regulars are still
        // gated or unadmitted.
        firmware.release_newest();
        urgent.await.unwrap().unwrap();
        {
            let seen = recorder.seen.lock().unwrap();
            let order: Vec<&str> = seen.iter().map(|(s, _)| s.as_str()).collect();
            assert_eq!(order, vec!["M112"]);
        }

        let mut tasks: Vec<_> = queued.into_iter().collect();
        tasks.push(blocker);
        for task in tasks {
            while !task.is_finished() {
                firmware.release_all();
                tokio::task::yield_now().await;
            }
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn cancel_pending_spares_in_flight_codes_but_nulls_their_result() {
        let (executor, firmware, _model, _dir) = fixture();
        let recorder = install_recorder(&executor);
        firmware.set_gated(true);

        let mut in_flight = Code::parse(CodeChannel::Telnet, "G1 X1").unwrap();
        in_flight.flags |= CodeFlags::UNBUFFERED;
        let in_flight = tokio::spawn(executor.execute(in_flight));
        while firmware.waiting_count() < 1 {
            tokio::task::yield_now().await;
        }

        let waiting = tokio::spawn(executor.execute(
            Code::parse(CodeChannel::Telnet, "G4 P0").unwrap(),
        ));
        tokio::task::yield_now().await;

        executor.scheduler.cancel_pending(CodeChannel::Telnet);

        // The unadmitted code fails outright and never reaches the firmware.
        let error = waiting.await.unwrap().unwrap_err();
        assert!(error.is_cancelled());

        // The in-flight code observes cancellation at its await point but
        // still reaches its executed hook, with a null result.
        let error = in_flight.await.unwrap().unwrap_err();
        assert!(error.is_cancelled());
        assert_eq!(firmware.dispatched_count(), 1);

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], ("G1".to_string(), false));
    }

    // ── Interception ──

    struct Resolver;

    #[async_trait]
    impl CodeInterceptor for Resolver {
        async fn intercept(&self, _code: &Code, _mode: InterceptionMode) -> InterceptionVerdict {
            InterceptionVerdict::Resolve(Some(Message::success("from interceptor").into()))
        }
    }

    #[tokio::test]
    async fn pre_resolution_skips_the_firmware_and_notifies_executed_hooks() {
        let (executor, firmware, _model, _dir) = fixture();
        executor
            .bus
            .register(InterceptionMode::Pre, None, Arc::new(Resolver));
        let recorder = install_recorder(&executor);

        let result = run(&executor, CodeChannel::Http, "M117 \"hi\"").await;
        assert_eq!(result.0[0].content, "from interceptor\n");
        assert_eq!(firmware.dispatched_count(), 0);
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn interceptor_cancel_aborts_the_code() {
        struct Canceller;

        #[async_trait]
        impl CodeInterceptor for Canceller {
            async fn intercept(
                &self,
                _code: &Code,
                _mode: InterceptionMode,
            ) -> InterceptionVerdict {
                InterceptionVerdict::Cancel
            }
        }

        let (executor, firmware, _model, _dir) = fixture();
        executor
            .bus
            .register(InterceptionMode::Pre, None, Arc::new(Canceller));

        let error = executor
            .execute(Code::parse(CodeChannel::Http, "G1 X1").unwrap())
            .await
            .unwrap_err();
        assert!(error.is_cancelled());
        assert_eq!(firmware.dispatched_count(), 0);
    }

    // ── M28 capture ──

    #[tokio::test]
    async fn m28_captures_codes_until_m29() {
        let (executor, firmware, _model, dir) = fixture();

        let result = run(&executor, CodeChannel::Usb, "M28 \"capture.g\"").await;
        assert_eq!(result.0[0].content, "Writing to file: capture.g\n");

        let captured = run(&executor, CodeChannel::Usb, "G1 X5 Y10").await;
        assert!(captured.is_empty());
        let captured = run(&executor, CodeChannel::Usb, "G4 P100").await;
        assert!(captured.is_empty());
        assert_eq!(firmware.dispatched_count(), 0);

        let result = run(&executor, CodeChannel::Usb, "M29").await;
        assert_eq!(result.0[0].content, "Done saving file.\n");

        let content =
            std::fs::read_to_string(dir.path().join("gcodes").join("capture.g")).unwrap();
        assert_eq!(content, "G1 X5 Y10\nG4 P100\n");

        // The capture is over; codes flow to the firmware again.
        run(&executor, CodeChannel::Usb, "G1 X0").await;
        assert_eq!(firmware.dispatched(), vec!["G1"]);
    }

    // ── Job control scenarios ──

    async fn select_test_file(
        executor: &Arc<CodeExecutor>,
        dir: &TempDir,
    ) -> std::path::PathBuf {
        let path = dir.path().join("gcodes").join("part.g");
        std::fs::write(&path, "G28\nG1 X10\nG1 X20\n").unwrap();
        let result = run(executor, CodeChannel::Http, "M23 \"part.g\"").await;
        assert!(result.is_successful(), "M23 failed: {result}");
        path
    }

    #[tokio::test]
    async fn m25_inside_the_print_file_pauses_after_its_own_dispatch() {
        let (executor, firmware, model, dir) = fixture();
        select_test_file(&executor, &dir).await;
        run(&executor, CodeChannel::Http, "M24").await;
        assert!(model.is_printing().await);
        assert!(!model.is_job_paused().await);

        let result = run(&executor, CodeChannel::File, "M25").await;
        assert!(result.is_successful());
        assert!(model.is_job_paused().await);
        assert!(firmware.dispatched().contains(&"M25".to_string()));
    }

    #[tokio::test]
    async fn file_channel_codes_are_cancelled_while_paused() {
        let (executor, firmware, model, dir) = fixture();
        select_test_file(&executor, &dir).await;
        run(&executor, CodeChannel::Http, "M24").await;
        run(&executor, CodeChannel::File, "M25").await;
        assert!(model.is_job_paused().await);

        let dispatched = firmware.dispatched_count();
        let error = executor
            .execute(Code::parse(CodeChannel::File, "G1 X30").unwrap())
            .await
            .unwrap_err();
        assert!(error.is_cancelled());
        assert_eq!(firmware.dispatched_count(), dispatched);
    }

    #[tokio::test]
    async fn selecting_a_file_from_another_channel_is_rejected_while_printing() {
        let (executor, _firmware, _model, dir) = fixture();
        select_test_file(&executor, &dir).await;
        run(&executor, CodeChannel::Http, "M24").await;

        let result = run(&executor, CodeChannel::Telnet, "M23 \"part.g\"").await;
        assert!(!result.is_successful());
        assert!(result.0[0].content.contains("already being printed"));
    }

    #[tokio::test]
    async fn m0_invalidates_the_selected_job() {
        let (executor, _firmware, model, dir) = fixture();
        select_test_file(&executor, &dir).await;
        run(&executor, CodeChannel::Http, "M24").await;

        let result = run(&executor, CodeChannel::Http, "M0").await;
        assert!(result.is_successful());
        assert!(model.read().await.job.file.is_none());
        assert!(!model.is_printing().await);
    }

    // ── Local M-code handlers ──

    #[tokio::test]
    async fn m20_lists_files_in_the_native_format() {
        let (executor, firmware, _model, dir) = fixture();
        std::fs::write(dir.path().join("gcodes").join("a.g"), "G28\n").unwrap();
        std::fs::write(dir.path().join("gcodes").join("b.g"), "G28\n").unwrap();

        let result = run(&executor, CodeChannel::Http, "M20").await;
        assert_eq!(result.0[0].content, "GCode files:\n\"a.g\",\"b.g\"\n");
        assert_eq!(firmware.dispatched_count(), 0);
    }

    #[tokio::test]
    async fn m20_s2_reports_json() {
        let (executor, _firmware, _model, dir) = fixture();
        std::fs::write(dir.path().join("gcodes").join("a.g"), "G28\n").unwrap();

        let result = run(&executor, CodeChannel::Http, "M20 S2").await;
        let json: serde_json::Value =
            serde_json::from_str(result.0[0].content.trim_end()).unwrap();
        assert_eq!(json["err"], 0);
        assert_eq!(json["files"][0], "a.g");
    }

    #[tokio::test]
    async fn m30_deletes_files_and_returns_an_empty_result() {
        let (executor, _firmware, _model, dir) = fixture();
        let path = dir.path().join("gcodes").join("old.g");
        std::fs::write(&path, "G28\n").unwrap();

        let result = run(&executor, CodeChannel::Http, "M30 \"old.g\"").await;
        assert!(result.is_successful());
        assert!(result.is_empty());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn m38_hashes_the_physical_file() {
        let (executor, _firmware, _model, dir) = fixture();
        std::fs::write(dir.path().join("gcodes").join("hash.g"), "hello").unwrap();

        let result = run(&executor, CodeChannel::Usb, "M38 \"hash.g\"").await;
        assert_eq!(
            result.0[0].content,
            "AAF4C61DDCC5E8A2DABEDE0F3B482CD9AEA9434D\n"
        );
    }

    #[tokio::test]
    async fn m470_and_m471_manage_directories_and_renames() {
        let (executor, _firmware, _model, dir) = fixture();

        let result = run(&executor, CodeChannel::Http, "M470 P\"jobs/done\"").await;
        assert!(result.is_successful());
        assert!(dir.path().join("gcodes/jobs/done").is_dir());

        std::fs::write(dir.path().join("gcodes").join("x.g"), "G28\n").unwrap();
        let result = run(
            &executor,
            CodeChannel::Http,
            "M471 S\"x.g\" T\"jobs/x.g\"",
        )
        .await;
        assert!(result.is_successful());
        assert!(result.is_empty());
        assert!(dir.path().join("gcodes/jobs/x.g").is_file());
    }

    #[tokio::test]
    async fn m122_with_dsf_argument_reports_local_diagnostics() {
        let (executor, firmware, _model, _dir) = fixture();
        let result = run(&executor, CodeChannel::Usb, "M122 B0 \"DSF\"").await;
        assert!(result.0[0].content.contains("diagnostics"));
        assert_eq!(firmware.dispatched_count(), 0);
    }

    #[tokio::test]
    async fn m997_without_binaries_reports_the_missing_iap_file() {
        let (executor, firmware, _model, _dir) = fixture();
        let result = run(&executor, CodeChannel::Http, "M997").await;
        assert!(!result.is_successful());
        assert!(result.0[0]
            .content
            .starts_with("M997: Failed to find IAP file"));
        assert_eq!(firmware.firmware_update_count(), 0);
    }

    #[tokio::test]
    async fn m997_streams_iap_and_firmware_binaries() {
        let (executor, firmware, _model, dir) = fixture();
        std::fs::write(dir.path().join("sys").join("MainboardIAP.bin"), b"iap").unwrap();
        std::fs::write(
            dir.path().join("sys").join("MainboardFirmware.bin"),
            b"firmware",
        )
        .unwrap();

        let result = run(&executor, CodeChannel::Http, "M997").await;
        assert!(result.is_successful(), "{result}");
        assert_eq!(firmware.firmware_update_count(), 1);
    }

    #[tokio::test]
    async fn m82_m83_toggle_relative_extrusion() {
        let (executor, _firmware, model, _dir) = fixture();
        run(&executor, CodeChannel::Usb, "M83").await;
        assert!(model.relative_extrusion(CodeChannel::Usb).await);
        run(&executor, CodeChannel::Usb, "M82").await;
        assert!(!model.relative_extrusion(CodeChannel::Usb).await);
    }

    #[tokio::test]
    async fn m555_switches_channel_compatibility_after_its_own_reply() {
        let (executor, _firmware, model, _dir) = fixture();
        let result = run(&executor, CodeChannel::Usb, "M555 P2").await;
        assert!(result.is_successful());
        assert_eq!(
            model.compatibility(CodeChannel::Usb).await,
            Compatibility::Marlin
        );

        // The next reply carries the Marlin terminator.
        let result = run(&executor, CodeChannel::Usb, "M27").await;
        assert_eq!(result.0[0].content, "Not SD printing.\nok\n");
    }

    #[tokio::test]
    async fn m105_gets_the_marlin_ok_prefix() {
        let (executor, firmware, model, _dir) = fixture();
        model
            .set_compatibility(CodeChannel::Usb, Compatibility::Marlin)
            .await;
        firmware.push_response(Message::success("T:200.0").into());

        let result = run(&executor, CodeChannel::Usb, "M105").await;
        assert_eq!(result.0[0].content, "ok T:200.0");
    }

    #[tokio::test]
    async fn m291_blocking_message_boxes_are_rejected() {
        let (executor, _firmware, _model, _dir) = fixture();
        let result = run(&executor, CodeChannel::Http, "M291 P\"hi\" S2").await;
        assert!(!result.is_successful());
        assert!(result.0[0].content.contains("not supported"));
    }

    #[tokio::test]
    async fn m998_is_reported_as_unsupported_with_a_prefix() {
        let (executor, _firmware, _model, _dir) = fixture();
        let result = run(&executor, CodeChannel::Http, "M998").await;
        assert_eq!(result.0[0].content, "M998: Code is not supported\n");
    }

    #[tokio::test]
    async fn m374_and_m375_round_trip_the_height_map() {
        let (executor, firmware, _model, dir) = fixture();
        firmware.store_height_map(crate::firmware::HeightMap {
            points: vec![vec![0.1, 0.2], vec![0.3, 0.4]],
        });

        let result = run(&executor, CodeChannel::Http, "M374").await;
        assert!(result.is_successful(), "{result}");
        assert!(dir.path().join("sys/heightmap.csv").is_file());

        firmware.store_height_map(crate::firmware::HeightMap::default());
        let result = run(&executor, CodeChannel::Http, "M375").await;
        assert!(result.is_successful(), "{result}");
        assert_eq!(
            firmware.stored_height_map().points,
            vec![vec![0.1, 0.2], vec![0.3, 0.4]]
        );
    }

    #[tokio::test]
    async fn m550_sets_and_reports_the_hostname() {
        let (executor, _firmware, model, _dir) = fixture();
        let result = run(&executor, CodeChannel::Http, "M550 P\"corexy\"").await;
        assert!(result.is_successful());
        assert_eq!(model.read().await.network.hostname, "corexy");

        let result = run(&executor, CodeChannel::Http, "M550").await;
        assert_eq!(result.0[0].content, "Hostname: corexy\n");
    }

    #[tokio::test]
    async fn m500_writes_the_configuration_override() {
        let (executor, _firmware, _model, dir) = fixture();
        run(&executor, CodeChannel::Usb, "M550 P\"unit\"").await;
        run(&executor, CodeChannel::Usb, "M83").await;

        let result = run(&executor, CodeChannel::Usb, "M500").await;
        assert!(result.is_successful());
        let content =
            std::fs::read_to_string(dir.path().join("sys/config-override.g")).unwrap();
        assert!(content.contains("M550 P\"unit\""));
        assert!(content.contains("M83"));
    }

    #[tokio::test]
    async fn m929_starts_and_stops_event_logging() {
        let (executor, _firmware, model, dir) = fixture();
        let result = run(&executor, CodeChannel::Http, "M929 P\"log.txt\" S1").await;
        assert!(result.is_successful());
        assert!(dir.path().join("sys/log.txt").is_file());
        assert!(model.read().await.state.log_file.is_some());

        let result = run(&executor, CodeChannel::Http, "M929 S0").await;
        assert!(result.is_successful());
        assert!(model.read().await.state.log_file.is_none());
    }

    #[tokio::test]
    async fn filament_codes_track_the_loaded_filament() {
        let (executor, _firmware, model, dir) = fixture();
        std::fs::create_dir_all(dir.path().join("filaments/PLA")).unwrap();
        std::fs::write(dir.path().join("filaments/PLA/load.g"), "M117 \"load\"\n").unwrap();

        let result = run(&executor, CodeChannel::Http, "M701 S\"PLA\"").await;
        assert!(result.is_successful(), "{result}");
        assert_eq!(
            model.read().await.state.loaded_filament.as_deref(),
            Some("PLA")
        );

        let result = run(&executor, CodeChannel::Http, "M702").await;
        assert!(result.is_successful());
        assert!(model.read().await.state.loaded_filament.is_none());

        let result = run(&executor, CodeChannel::Http, "M703").await;
        assert!(!result.is_successful());
    }

    // ── Expressions & echo ──

    #[tokio::test]
    async fn echo_evaluates_against_the_object_model() {
        let (executor, firmware, _model, _dir) = fixture();
        let result = run(&executor, CodeChannel::Usb, "echo \"tool\", state.currentTool").await;
        assert_eq!(result.0[0].content, "tool 0\n");
        assert_eq!(firmware.dispatched_count(), 0);
    }

    #[tokio::test]
    async fn host_side_expressions_are_evaluated_before_dispatch() {
        let (executor, firmware, _model, _dir) = fixture();
        run(
            &executor,
            CodeChannel::Usb,
            "M117 P{volumes[0].freeSpace}",
        )
        .await;
        assert_eq!(firmware.dispatched_count(), 1);
        // The expression was replaced before the code went out.
        let sent = firmware.dispatched();
        assert_eq!(sent, vec!["M117"]);
    }

    // ── Macros ──

    #[tokio::test]
    async fn macro_files_collect_results_in_line_order() {
        let (executor, firmware, _model, dir) = fixture();
        std::fs::write(
            dir.path().join("macros/home.g"),
            "G28\nM117 \"homed\"\n",
        )
        .unwrap();

        let result = executor
            .run_macro_file("home.g", FileDirectory::Macros, CodeChannel::Daemon)
            .await
            .unwrap();
        assert!(result.is_successful());
        assert_eq!(firmware.dispatched(), vec!["G28", "M117"]);
        assert_eq!(executor.macros.active_count(), 0);
    }

    #[tokio::test]
    async fn sibling_macros_do_not_serialize_with_each_other() {
        let (executor, firmware, _model, dir) = fixture();
        std::fs::write(dir.path().join("macros/a.g"), "G1 X1\n").unwrap();
        std::fs::write(dir.path().join("macros/b.g"), "G1 X2\n").unwrap();
        firmware.set_gated(true);

        let a = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .run_macro_file("a.g", FileDirectory::Macros, CodeChannel::Daemon)
                    .await
            })
        };
        let b = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .run_macro_file("b.g", FileDirectory::Macros, CodeChannel::Daemon)
                    .await
            })
        };

        // Both macros get a code in flight concurrently; a shared Macro
        // class lock would hold the second one back.
        while firmware.waiting_count() < 2 {
            tokio::task::yield_now().await;
        }
        firmware.release_all();
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn g29_runs_the_probing_macro_when_present() {
        let (executor, firmware, _model, dir) = fixture();
        std::fs::write(dir.path().join("sys/mesh.g"), "G30 P0\n").unwrap();

        let result = run(&executor, CodeChannel::Http, "G29").await;
        assert!(result.is_successful());
        assert_eq!(firmware.dispatched(), vec!["G30"]);

        std::fs::remove_file(dir.path().join("sys/mesh.g")).unwrap();
        run(&executor, CodeChannel::Http, "G29").await;
        assert_eq!(firmware.dispatched(), vec!["G30", "G29"]);
    }

    // ── Tool changes ──

    #[tokio::test]
    async fn accepted_tool_changes_update_the_model() {
        let (executor, _firmware, model, _dir) = fixture();
        run(&executor, CodeChannel::Usb, "T2").await;
        assert_eq!(model.read().await.state.current_tool, 2);
    }
}
