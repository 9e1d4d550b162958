//! Local interpretation of a curated subset of codes. Each sub-handler is a
//! switch on the major number returning `Some(result)` to mark the code
//! internally resolved or `None` to defer to the firmware.

pub(crate) mod gcodes;
pub(crate) mod mcodes;
pub(crate) mod tcodes;

use crate::code::Code;
use crate::engine::CodeExecutor;
use crate::errors::ExecutionError;
use crate::types::{CodeResult, CodeType};
use std::sync::Arc;

pub(crate) async fn process(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    match code.code_type {
        CodeType::GCode => gcodes::process(executor, code).await,
        CodeType::MCode => mcodes::process(executor, code).await,
        CodeType::TCode => tcodes::process(executor, code).await,
        _ => Ok(None),
    }
}

/// Handler-specific hooks that run once the result has been finalized.
pub(crate) async fn code_executed(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<(), ExecutionError> {
    match code.code_type {
        CodeType::MCode => mcodes::code_executed(executor, code).await,
        CodeType::TCode => tcodes::code_executed(executor, code).await,
        _ => Ok(()),
    }
}
