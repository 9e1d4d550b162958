use crate::code::Code;
use crate::engine::CodeExecutor;
use crate::errors::ExecutionError;
use crate::paths::{self, FileDirectory};
use crate::types::CodeResult;
use std::sync::Arc;

pub(crate) async fn process(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    match code.major {
        // Mesh bed probing runs the probing macro when one is present;
        // otherwise the firmware performs the probe itself.
        Some(29) => {
            let s = match code.parameter('S') {
                Some(p) => p.as_int()?,
                None => 0,
            };
            if s != 0 {
                return Ok(None);
            }
            let mesh = paths::directory(&executor.settings, FileDirectory::System).join("mesh.g");
            if !mesh.is_file() {
                return Ok(None);
            }
            executor.flush_or_cancel(code).await?;
            let result = executor
                .run_macro_file("mesh.g", FileDirectory::System, code.channel)
                .await?;
            Ok(Some(result))
        }
        _ => Ok(None),
    }
}
