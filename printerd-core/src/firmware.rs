use crate::code::Code;
use crate::errors::ExecutionError;
use crate::types::{CodeChannel, CodeResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Bed compensation grid as exchanged with the controller.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HeightMap {
    pub points: Vec<Vec<f64>>,
}

/// The transport to the firmware controller. Dispatch is internally
/// serialized by the transport's own mailbox; `flush_*` resolve once the
/// transport has drained outstanding work for the channel.
#[async_trait]
pub trait FirmwareInterface: Send + Sync {
    /// Forwards a code and resolves with the firmware's reply.
    async fn process_code(&self, code: &Code) -> Result<CodeResult, ExecutionError>;

    /// Waits for the channel to become quiescent. `false` means the wait was
    /// aborted (e.g. emergency stop) and the caller must treat its code as
    /// cancelled.
    async fn flush_channel(&self, channel: CodeChannel) -> Result<bool, ExecutionError>;

    /// Like `flush_channel`, keyed by the code (macro-aware transports flush
    /// only up to the code's position).
    async fn flush_code(&self, code: &Code) -> Result<bool, ExecutionError>;

    /// Stops motion and waits for standstill on behalf of the channel.
    async fn lock_movement_and_wait(&self, channel: CodeChannel) -> Result<bool, ExecutionError>;

    /// Releases all locks owned by the channel.
    async fn unlock_all(&self, channel: CodeChannel) -> Result<(), ExecutionError>;

    async fn get_height_map(&self) -> Result<HeightMap, ExecutionError>;

    async fn set_height_map(&self, map: HeightMap) -> Result<(), ExecutionError>;

    /// Streams the IAP binary and the new firmware image to the controller.
    async fn update_firmware(&self, iap: Vec<u8>, firmware: Vec<u8>) -> Result<(), ExecutionError>;
}

// ─── Test double ──────────────────────────────────────────────

struct MockInner {
    processed: Vec<Code>,
    responses: VecDeque<CodeResult>,
    gated: bool,
    waiting: Vec<oneshot::Sender<()>>,
    flush_result: bool,
    height_map: HeightMap,
    firmware_updates: usize,
}

/// In-memory `FirmwareInterface` for tests. Replies with queued canned
/// results (empty result by default) and can gate `process_code` so a test
/// controls completion order explicitly.
pub struct MockFirmware {
    inner: Mutex<MockInner>,
}

impl MockFirmware {
    pub fn new() -> Arc<MockFirmware> {
        Arc::new(MockFirmware {
            inner: Mutex::new(MockInner {
                processed: Vec::new(),
                responses: VecDeque::new(),
                gated: false,
                waiting: Vec::new(),
                flush_result: true,
                height_map: HeightMap::default(),
                firmware_updates: 0,
            }),
        })
    }

    /// Queue a canned reply for the next dispatched code.
    pub fn push_response(&self, result: CodeResult) {
        self.inner.lock().unwrap().responses.push_back(result);
    }

    /// When gated, `process_code` blocks until `release_one`/`release_all`.
    pub fn set_gated(&self, gated: bool) {
        self.inner.lock().unwrap().gated = gated;
    }

    pub fn set_flush_result(&self, ok: bool) {
        self.inner.lock().unwrap().flush_result = ok;
    }

    /// Releases the longest-waiting gated dispatch. Returns false when none
    /// is waiting.
    pub fn release_one(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.waiting.is_empty() {
            return false;
        }
        let tx = inner.waiting.remove(0);
        let _ = tx.send(());
        true
    }

    /// Releases the most recent gated dispatch, for reply-reordering tests.
    pub fn release_newest(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.waiting.pop() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn release_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for tx in inner.waiting.drain(..) {
            let _ = tx.send(());
        }
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.lock().unwrap().waiting.len()
    }

    /// Short forms of every dispatched code, in dispatch order.
    pub fn dispatched(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .processed
            .iter()
            .map(Code::short_form)
            .collect()
    }

    pub fn dispatched_count(&self) -> usize {
        self.inner.lock().unwrap().processed.len()
    }

    pub fn firmware_update_count(&self) -> usize {
        self.inner.lock().unwrap().firmware_updates
    }

    pub fn stored_height_map(&self) -> HeightMap {
        self.inner.lock().unwrap().height_map.clone()
    }

    pub fn store_height_map(&self, map: HeightMap) {
        self.inner.lock().unwrap().height_map = map;
    }
}

#[async_trait]
impl FirmwareInterface for MockFirmware {
    async fn process_code(&self, code: &Code) -> Result<CodeResult, ExecutionError> {
        let gate = {
            let mut inner = self.inner.lock().unwrap();
            inner.processed.push(code.clone());
            if inner.gated {
                let (tx, rx) = oneshot::channel();
                inner.waiting.push(tx);
                Some(rx)
            } else {
                None
            }
        };
        if let Some(rx) = gate {
            rx.await
                .map_err(|_| ExecutionError::Transport("mock gate dropped".to_string()))?;
        }
        let canned = self.inner.lock().unwrap().responses.pop_front();
        Ok(canned.unwrap_or_default())
    }

    async fn flush_channel(&self, _channel: CodeChannel) -> Result<bool, ExecutionError> {
        Ok(self.inner.lock().unwrap().flush_result)
    }

    async fn flush_code(&self, _code: &Code) -> Result<bool, ExecutionError> {
        Ok(self.inner.lock().unwrap().flush_result)
    }

    async fn lock_movement_and_wait(&self, _channel: CodeChannel) -> Result<bool, ExecutionError> {
        Ok(self.inner.lock().unwrap().flush_result)
    }

    async fn unlock_all(&self, _channel: CodeChannel) -> Result<(), ExecutionError> {
        Ok(())
    }

    async fn get_height_map(&self) -> Result<HeightMap, ExecutionError> {
        Ok(self.inner.lock().unwrap().height_map.clone())
    }

    async fn set_height_map(&self, map: HeightMap) -> Result<(), ExecutionError> {
        self.inner.lock().unwrap().height_map = map;
        Ok(())
    }

    async fn update_firmware(
        &self,
        _iap: Vec<u8>,
        _firmware: Vec<u8>,
    ) -> Result<(), ExecutionError> {
        self.inner.lock().unwrap().firmware_updates += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CodeType, Message};

    #[tokio::test]
    async fn mock_replies_with_canned_results_in_order() {
        let firmware = MockFirmware::new();
        firmware.push_response(Message::success("first").into());

        let code = Code::new(CodeChannel::Usb, CodeType::GCode, Some(1));
        let result = firmware.process_code(&code).await.unwrap();
        assert_eq!(result.0[0].content, "first");

        let result = firmware.process_code(&code).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(firmware.dispatched(), vec!["G1", "G1"]);
    }

    #[tokio::test]
    async fn gated_dispatches_wait_for_release() {
        let firmware = MockFirmware::new();
        firmware.set_gated(true);

        let fw = firmware.clone();
        let task = tokio::spawn(async move {
            let code = Code::new(CodeChannel::Usb, CodeType::GCode, Some(28));
            fw.process_code(&code).await.unwrap()
        });

        while firmware.waiting_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(firmware.release_one());
        task.await.unwrap();
    }
}
