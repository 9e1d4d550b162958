use crate::code::Code;
use crate::engine::CodeExecutor;
use crate::errors::ExecutionError;
use crate::types::CodeResult;
use std::sync::Arc;

/// Tool changes are the firmware's business; nothing resolves locally.
pub(crate) async fn process(
    _executor: &Arc<CodeExecutor>,
    _code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    Ok(None)
}

/// Records the selected tool once the firmware has accepted the change.
pub(crate) async fn code_executed(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<(), ExecutionError> {
    let successful = code
        .result
        .as_ref()
        .map(CodeResult::is_successful)
        .unwrap_or(false);
    if let (Some(tool), true, true) = (code.major, successful, code.parameters.is_empty()) {
        executor.model.write().await.state.current_tool = tool;
    }
    Ok(())
}
