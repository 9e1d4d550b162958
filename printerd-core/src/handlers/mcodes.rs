use crate::code::Code;
use crate::engine::CodeExecutor;
use crate::errors::ExecutionError;
use crate::model::JobFile;
use crate::paths::{self, FileDirectory};
use crate::scheduler::FileBeingWritten;
use crate::types::{CodeFlags, CodeResult, Compatibility, Message};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde_json::json;
use sha1::{Digest, Sha1};
use std::sync::Arc;

fn empty() -> Option<CodeResult> {
    Some(CodeResult::new())
}

fn error_result(message: impl Into<String>) -> Option<CodeResult> {
    Some(Message::error(message).into())
}

pub(crate) async fn process(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    match code.major {
        // Cancel the print in progress. The code itself still goes to the
        // firmware to stop the machine.
        Some(0) | Some(1) => {
            executor.flush_or_cancel(code).await?;
            let _job = executor.model.lock_job().await;
            if executor.model.read().await.job.file.is_some() {
                executor.model.invalidate_job_file().await;
            }
            Ok(None)
        }

        Some(20) => list_files(executor, code).await,

        Some(23) => select_file(executor, code).await,

        Some(24) => {
            let _job = executor.model.lock_job().await;
            if executor.model.read().await.job.file.is_none() {
                return Ok(error_result("Cannot print, no file selected"));
            }
            // Resumed in the executed hook once the firmware confirms.
            Ok(None)
        }

        // The pause takes effect in the executed hook once the firmware has
        // confirmed it; a pause inside the print file must not cancel its
        // own dispatch.
        Some(25) | Some(226) => Ok(None),

        Some(26) => {
            let _job = executor.model.lock_job().await;
            if let Some(s) = code.parameter('S') {
                if executor.model.read().await.job.file.is_none() {
                    return Ok(error_result("Not printing a file"));
                }
                let position = s.as_uint()? as u64;
                executor.model.set_job_position(position).await;
            }
            Ok(empty())
        }

        Some(27) => {
            let model = executor.model.read().await;
            let content = match &model.job.file {
                Some(file) => {
                    format!("SD printing byte {}/{}", model.job.file_position, file.size)
                }
                None => "Not SD printing.".to_string(),
            };
            Ok(Some(Message::success(content).into()))
        }

        Some(28) => begin_file_write(executor, code).await,

        Some(29) => {
            let slot = executor.scheduler.file_being_written(code.channel);
            let closed = slot.lock().await.take();
            match closed {
                Some(_) => Ok(Some(Message::success("Done saving file.").into())),
                None => Ok(None),
            }
        }

        Some(30) => {
            let Some(file) = code.file_argument().map(str::to_string) else {
                return Ok(error_result("Filename expected"));
            };
            let physical =
                paths::to_physical(&executor.settings, &file, FileDirectory::GCodes);
            match tokio::fs::remove_file(&physical).await {
                Ok(()) => Ok(empty()),
                Err(e) => Ok(error_result(format!("Failed to delete file {file}: {e}"))),
            }
        }

        Some(32) => select_file(executor, code).await,

        Some(36) => file_info(executor, code).await,

        Some(37) => simulate_file(executor, code).await,

        Some(38) => compute_sha1(executor, code).await,

        Some(39) => storage_info(executor, code).await,

        // Extrusion mode is tracked in the executed hook.
        Some(82) | Some(83) => Ok(None),

        // Emergency codes go straight to the transport, no flush.
        Some(112) | Some(999) => Ok(None),

        Some(122) => {
            let b = code.parameter('B').map(|p| p.as_int()).transpose()?;
            let argument = code.file_argument().map(str::to_string);
            if b == Some(0) && argument.as_deref() == Some("DSF") {
                return Ok(Some(
                    Message::success(executor.diagnostics().await).into(),
                ));
            }
            Ok(None)
        }

        Some(291) => {
            if let Some(s) = code.parameter('S') {
                if s.as_int()? >= 2 {
                    // Blocking message boxes cannot be expressed over this
                    // transport.
                    return Ok(error_result("Code is not supported"));
                }
            }
            Ok(None)
        }

        Some(374) => save_height_map(executor, code).await,

        Some(375) => load_height_map(executor, code).await,

        Some(470) => {
            let Some(dir) = code.parameter('P').map(|p| p.raw.clone()) else {
                return Ok(error_result("Missing directory name"));
            };
            let physical = paths::to_physical(&executor.settings, &dir, FileDirectory::GCodes);
            match tokio::fs::create_dir_all(&physical).await {
                Ok(()) => Ok(empty()),
                Err(e) => Ok(error_result(format!(
                    "Failed to create directory {dir}: {e}"
                ))),
            }
        }

        Some(471) => rename_path(executor, code).await,

        Some(500) => save_settings(executor, code).await,

        Some(503) => {
            let physical = paths::to_physical(
                &executor.settings,
                &executor.settings.config_file,
                FileDirectory::System,
            );
            match tokio::fs::read_to_string(&physical).await {
                Ok(content) => Ok(Some(Message::success(content).into())),
                Err(_) => Ok(error_result("Configuration file not found")),
            }
        }

        Some(505) => {
            let Some(dir) = code.parameter('P').map(|p| p.raw.clone()) else {
                return Ok(error_result("Missing directory name"));
            };
            executor.model.write().await.directories.system = dir;
            Ok(empty())
        }

        Some(550) => {
            match code.parameter('P') {
                Some(name) => {
                    executor.model.write().await.network.hostname = name.raw.clone();
                    Ok(empty())
                }
                None => {
                    let hostname = executor.model.read().await.network.hostname.clone();
                    Ok(Some(Message::success(format!("Hostname: {hostname}")).into()))
                }
            }
        }

        // Compatibility is applied in the executed hook so the reply to this
        // very code still uses the old framing.
        Some(555) => Ok(None),

        Some(701) => load_filament(executor, code).await,

        Some(702) => unload_filament(executor, code).await,

        Some(703) => configure_filament(executor, code).await,

        Some(905) => set_date_time(executor, code).await,

        Some(929) => configure_event_log(executor, code).await,

        Some(997) => update_firmware(executor, code).await,

        Some(998) => Ok(error_result("Code is not supported")),

        _ => Ok(None),
    }
}

// ─── File listing & info ──────────────────────────────────────

async fn list_files(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    let virtual_dir = match code.parameter('P') {
        Some(p) => p.raw.clone(),
        None => executor.model.read().await.directories.gcodes.clone(),
    };
    let s = code.parameter('S').map(|p| p.as_int()).transpose()?.unwrap_or(0);
    let physical = paths::to_physical(&executor.settings, &virtual_dir, FileDirectory::GCodes);

    let mut reader = match tokio::fs::read_dir(&physical).await {
        Ok(reader) => reader,
        Err(e) => {
            return Ok(error_result(format!(
                "Failed to list files in {virtual_dir}: {e}"
            )))
        }
    };

    let mut entries: Vec<(String, bool, u64, DateTime<Utc>)> = Vec::new();
    while let Ok(Some(entry)) = reader.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_default();
        entries.push((name, metadata.is_dir(), metadata.len(), modified));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let content = match s {
        2 => {
            let files: Vec<String> = entries
                .iter()
                .map(|(name, is_dir, _, _)| {
                    if *is_dir {
                        format!("*{name}")
                    } else {
                        name.clone()
                    }
                })
                .collect();
            json!({"dir": virtual_dir, "first": 0, "files": files, "next": 0, "err": 0})
                .to_string()
        }
        3 => {
            let files: Vec<serde_json::Value> = entries
                .iter()
                .map(|(name, is_dir, size, modified)| {
                    json!({
                        "type": if *is_dir { "d" } else { "f" },
                        "name": name,
                        "size": size,
                        "date": modified.format("%Y-%m-%dT%H:%M:%S").to_string(),
                    })
                })
                .collect();
            json!({"dir": virtual_dir, "first": 0, "files": files, "next": 0, "err": 0})
                .to_string()
        }
        _ => {
            let compatibility = executor.model.compatibility(code.channel).await;
            match compatibility {
                Compatibility::Marlin | Compatibility::NanoDlp => {
                    let names: Vec<&str> =
                        entries.iter().map(|(name, _, _, _)| name.as_str()).collect();
                    format!("Begin file list:\n{}\nEnd file list", names.join("\n"))
                }
                _ => {
                    let names: Vec<String> = entries
                        .iter()
                        .map(|(name, _, _, _)| format!("\"{name}\""))
                        .collect();
                    format!("GCode files:\n{}", names.join(","))
                }
            }
        }
    };
    Ok(Some(Message::success(content).into()))
}

async fn file_info(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    let Some(file) = code.file_argument().map(str::to_string) else {
        return Ok(error_result("Filename expected"));
    };
    let physical = paths::to_physical(&executor.settings, &file, FileDirectory::GCodes);
    let metadata = match tokio::fs::metadata(&physical).await {
        Ok(metadata) => metadata,
        Err(_) => {
            return Ok(Some(Message::success(json!({"err": 1}).to_string()).into()));
        }
    };

    // Slicers leave a "generated by" comment near the top of the file.
    let generated_by = tokio::fs::read(&physical)
        .await
        .ok()
        .and_then(|data| {
            let head = String::from_utf8_lossy(&data[..data.len().min(4096)]).to_string();
            head.lines()
                .filter_map(|line| line.trim().strip_prefix(';'))
                .find_map(|comment| {
                    let lower = comment.to_ascii_lowercase();
                    lower
                        .find("generated by")
                        .map(|at| comment[at + "generated by".len()..].trim().to_string())
                })
        })
        .unwrap_or_default();

    let modified = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_default();
    let info = json!({
        "err": 0,
        "fileName": paths::to_virtual(&executor.settings, &physical),
        "size": metadata.len(),
        "lastModified": modified.format("%Y-%m-%dT%H:%M:%S").to_string(),
        "generatedBy": generated_by,
    });
    Ok(Some(Message::success(info.to_string()).into()))
}

// ─── Job control ──────────────────────────────────────────────

/// Shared by M23 and M32; M32 additionally resumes in its executed hook.
async fn select_file(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    let Some(file) = code.file_argument().map(str::to_string) else {
        return Ok(error_result("Filename expected"));
    };
    let physical = paths::to_physical(&executor.settings, &file, FileDirectory::GCodes);
    let metadata = match tokio::fs::metadata(&physical).await {
        Ok(metadata) => metadata,
        Err(_) => return Ok(error_result(format!("Could not find file {file}"))),
    };

    let _job = executor.model.lock_job().await;
    if executor.model.is_printing().await
        && executor.model.job_channel().await != Some(code.channel)
    {
        return Ok(error_result(
            "Cannot set file to print, because a file is already being printed",
        ));
    }

    let virtual_name = paths::to_virtual(&executor.settings, &physical);
    executor
        .model
        .select_job_file(
            JobFile {
                file_name: virtual_name.clone(),
                physical_path: physical,
                size: metadata.len(),
            },
            code.channel,
        )
        .await;
    Ok(Some(
        Message::success(format!("File {virtual_name} selected for printing")).into(),
    ))
}

async fn simulate_file(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    let Some(file) = code.file_argument().map(str::to_string) else {
        // Plain S toggles are the firmware's business.
        return Ok(None);
    };
    let physical = paths::to_physical(&executor.settings, &file, FileDirectory::GCodes);
    let metadata = match tokio::fs::metadata(&physical).await {
        Ok(metadata) => metadata,
        Err(_) => return Ok(error_result(format!("Could not find file {file}"))),
    };

    let _job = executor.model.lock_job().await;
    let virtual_name = paths::to_virtual(&executor.settings, &physical);
    executor
        .model
        .select_job_file(
            JobFile {
                file_name: virtual_name.clone(),
                physical_path: physical,
                size: metadata.len(),
            },
            code.channel,
        )
        .await;
    executor.model.enter_simulation().await;
    Ok(Some(
        Message::success(format!("Simulating file {virtual_name}")).into(),
    ))
}

// ─── File capture ─────────────────────────────────────────────

async fn begin_file_write(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    let Some(file) = code.file_argument().map(str::to_string) else {
        return Ok(error_result("Filename expected"));
    };
    let physical = paths::to_physical(&executor.settings, &file, FileDirectory::GCodes);
    if let Some(parent) = physical.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return Ok(error_result(format!("Failed to open file {file}: {e}")));
        }
    }
    let handle = match tokio::fs::File::create(&physical).await {
        Ok(handle) => handle,
        Err(e) => return Ok(error_result(format!("Failed to open file {file}: {e}"))),
    };

    let slot = executor.scheduler.file_being_written(code.channel);
    *slot.lock().await = Some(FileBeingWritten {
        virtual_path: file.clone(),
        physical_path: physical,
        file: handle,
    });
    Ok(Some(Message::success(format!("Writing to file: {file}")).into()))
}

// ─── Hashing & storage ────────────────────────────────────────

async fn compute_sha1(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    let Some(file) = code.file_argument().map(str::to_string) else {
        return Ok(error_result("Filename expected"));
    };
    let physical = paths::to_physical(&executor.settings, &file, FileDirectory::GCodes);
    let data = match tokio::fs::read(&physical).await {
        Ok(data) => data,
        Err(e) => {
            return Ok(error_result(format!(
                "Failed to compute SHA-1 checksum for {file}: {e}"
            )))
        }
    };
    let digest = tokio::task::spawn_blocking(move || {
        let mut hasher = Sha1::new();
        hasher.update(&data);
        hex::encode(hasher.finalize()).to_uppercase()
    })
    .await
    .map_err(|e| ExecutionError::Handler(e.to_string()))?;
    Ok(Some(Message::success(digest).into()))
}

async fn storage_info(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    let slot = code.parameter('P').map(|p| p.as_int()).transpose()?.unwrap_or(0);
    let s = code.parameter('S').map(|p| p.as_int()).transpose()?.unwrap_or(0);

    let model = executor.model.read().await;
    let Some(volume) = model.volumes.get(slot as usize) else {
        return Ok(error_result(format!("Invalid storage slot {slot}")));
    };

    let content = if s == 2 {
        json!({
            "SDinfo": {
                "slot": slot,
                "present": volume.mounted,
                "capacity": volume.capacity,
                "free": volume.free_space,
            }
        })
        .to_string()
    } else if volume.mounted {
        const GB: f64 = 1_000_000_000.0;
        format!(
            "SD card in slot {slot}: capacity {:.2}Gb, free space {:.2}Gb",
            volume.capacity as f64 / GB,
            volume.free_space as f64 / GB,
        )
    } else {
        format!("No SD card detected in slot {slot}")
    };
    Ok(Some(Message::success(content).into()))
}

// ─── Height maps ──────────────────────────────────────────────

fn height_map_file(executor: &Arc<CodeExecutor>, code: &Code) -> (String, std::path::PathBuf) {
    let file = code
        .parameter('P')
        .map(|p| p.raw.clone())
        .unwrap_or_else(|| "heightmap.csv".to_string());
    let physical = paths::to_physical(&executor.settings, &file, FileDirectory::System);
    (file, physical)
}

async fn save_height_map(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    executor.flush_or_cancel(code).await?;
    if !executor
        .firmware
        .lock_movement_and_wait(code.channel)
        .await?
    {
        return Err(ExecutionError::Cancelled);
    }
    let map = executor.firmware.get_height_map().await;
    executor.firmware.unlock_all(code.channel).await?;
    let map = map?;
    let (file, physical) = height_map_file(executor, code);

    let content: String = map
        .points
        .iter()
        .map(|row| {
            row.iter()
                .map(|v| format!("{v:.3}"))
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect::<Vec<_>>()
        .join("\n");
    match tokio::fs::write(&physical, content).await {
        Ok(()) => Ok(Some(
            Message::success(format!("Height map saved to file {file}")).into(),
        )),
        Err(e) => Ok(error_result(format!(
            "Failed to save height map to file {file}: {e}"
        ))),
    }
}

async fn load_height_map(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    executor.flush_or_cancel(code).await?;
    let (file, physical) = height_map_file(executor, code);
    let content = match tokio::fs::read_to_string(&physical).await {
        Ok(content) => content,
        Err(e) => {
            return Ok(error_result(format!(
                "Failed to load height map from file {file}: {e}"
            )))
        }
    };

    let mut points = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let mut row = Vec::new();
        for cell in line.split(',') {
            match cell.trim().parse::<f64>() {
                Ok(v) => row.push(v),
                Err(_) => return Ok(error_result(format!("Invalid height map file {file}"))),
            }
        }
        points.push(row);
    }

    if !executor
        .firmware
        .lock_movement_and_wait(code.channel)
        .await?
    {
        return Err(ExecutionError::Cancelled);
    }
    let outcome = executor
        .firmware
        .set_height_map(crate::firmware::HeightMap { points })
        .await;
    executor.firmware.unlock_all(code.channel).await?;
    outcome?;
    Ok(Some(
        Message::success(format!("Height map loaded from file {file}")).into(),
    ))
}

// ─── Directories & settings ───────────────────────────────────

async fn rename_path(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    let Some(source) = code.parameter('S').map(|p| p.raw.clone()) else {
        return Ok(error_result("Missing source path"));
    };
    let Some(target) = code.parameter('T').map(|p| p.raw.clone()) else {
        return Ok(error_result("Missing target path"));
    };
    let overwrite = match code.parameter('D') {
        Some(p) => p.as_bool()?,
        None => false,
    };

    let from = paths::to_physical(&executor.settings, &source, FileDirectory::GCodes);
    let to = paths::to_physical(&executor.settings, &target, FileDirectory::GCodes);
    if overwrite && tokio::fs::metadata(&to).await.is_ok() {
        let _ = tokio::fs::remove_file(&to).await;
    }
    match tokio::fs::rename(&from, &to).await {
        Ok(()) => Ok(empty()),
        Err(e) => Ok(error_result(format!(
            "Failed to rename {source} to {target}: {e}"
        ))),
    }
}

async fn save_settings(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    executor.flush_or_cancel(code).await?;
    let physical = paths::to_physical(
        &executor.settings,
        &executor.settings.configuration_override_file,
        FileDirectory::System,
    );

    let model = executor.model.read().await;
    let mut content = String::from("; This is a system-generated file - do not modify!\n");
    content.push_str(&format!("M550 P\"{}\"\n", model.network.hostname));
    for input in &model.inputs {
        if input.relative_extrusion {
            content.push_str(&format!("M83 ; {}\n", input.name));
        }
    }
    drop(model);

    match tokio::fs::write(&physical, content).await {
        Ok(()) => Ok(empty()),
        Err(e) => Ok(error_result(format!("Failed to save settings: {e}"))),
    }
}

// ─── Filament management ──────────────────────────────────────

async fn load_filament(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    eprintln!("DEBUG load_filament: waiting for full sync");
    executor.model.wait_for_full_sync().await;
    eprintln!("DEBUG load_filament: synced");
    let Some(name) = code.parameter('S').map(|p| p.raw.clone()) else {
        return Ok(error_result("Missing filament name"));
    };
    let dir = paths::directory(&executor.settings, FileDirectory::Filaments).join(&name);
    eprintln!("DEBUG load_filament: dir={:?} is_dir={}", dir, dir.is_dir());
    if !dir.is_dir() {
        return Ok(error_result(format!("Filament {name} does not exist")));
    }

    if dir.join("load.g").is_file() {
        eprintln!("DEBUG load_filament: running load.g");
        executor
            .run_macro_file(&format!("{name}/load.g"), FileDirectory::Filaments, code.channel)
            .await?;
        eprintln!("DEBUG load_filament: ran load.g");
    }
    executor.model.write().await.state.loaded_filament = Some(name);
    eprintln!("DEBUG load_filament: done");
    Ok(empty())
}

async fn unload_filament(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    executor.model.wait_for_full_sync().await;
    let Some(name) = executor.model.read().await.state.loaded_filament.clone() else {
        return Ok(error_result("No filament loaded"));
    };

    let dir = paths::directory(&executor.settings, FileDirectory::Filaments).join(&name);
    if dir.join("unload.g").is_file() {
        executor
            .run_macro_file(
                &format!("{name}/unload.g"),
                FileDirectory::Filaments,
                code.channel,
            )
            .await?;
    }
    executor.model.write().await.state.loaded_filament = None;
    Ok(empty())
}

async fn configure_filament(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    executor.model.wait_for_full_sync().await;
    let Some(name) = executor.model.read().await.state.loaded_filament.clone() else {
        return Ok(error_result("No filament loaded"));
    };

    let dir = paths::directory(&executor.settings, FileDirectory::Filaments).join(&name);
    if dir.join("config.g").is_file() {
        let result = executor
            .run_macro_file(
                &format!("{name}/config.g"),
                FileDirectory::Filaments,
                code.channel,
            )
            .await?;
        return Ok(Some(result));
    }
    Ok(empty())
}

// ─── Clock, event log, firmware ───────────────────────────────

async fn set_date_time(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    let date = code.parameter('P').map(|p| p.raw.clone());
    let time = code.parameter('S').map(|p| p.raw.clone());

    if date.is_none() && time.is_none() {
        let current = executor.model.read().await.state.date_time.clone();
        let content = current.unwrap_or_else(|| "Date and time not set".to_string());
        return Ok(Some(Message::success(content).into()));
    }

    let date = match date {
        Some(raw) => match NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
            Ok(date) => date,
            Err(_) => return Ok(error_result(format!("Invalid date {raw}"))),
        },
        None => Utc::now().date_naive(),
    };
    let time = match time {
        Some(raw) => match NaiveTime::parse_from_str(&raw, "%H:%M:%S") {
            Ok(time) => time,
            Err(_) => return Ok(error_result(format!("Invalid time {raw}"))),
        },
        None => NaiveTime::default(),
    };
    executor.model.write().await.state.date_time =
        Some(date.and_time(time).format("%Y-%m-%dT%H:%M:%S").to_string());
    Ok(empty())
}

async fn configure_event_log(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    let Some(s) = code.parameter('S') else {
        let enabled = executor.model.read().await.state.log_file.is_some();
        let content = if enabled {
            "Event logging is enabled"
        } else {
            "Event logging is disabled"
        };
        return Ok(Some(Message::success(content).into()));
    };

    if s.as_int()? <= 0 {
        executor.model.write().await.state.log_file = None;
        return Ok(empty());
    }

    let file = code
        .file_argument()
        .map(str::to_string)
        .unwrap_or_else(|| executor.settings.event_log_file.clone());
    let physical = paths::to_physical(&executor.settings, &file, FileDirectory::System);
    if let Some(parent) = physical.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    if let Err(e) = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&physical)
        .await
    {
        return Ok(error_result(format!("Failed to open log file {file}: {e}")));
    }
    executor.model.write().await.state.log_file =
        Some(paths::to_virtual(&executor.settings, &physical));
    Ok(empty())
}

async fn update_firmware(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<Option<CodeResult>, ExecutionError> {
    executor.flush_or_cancel(code).await?;
    let s = code.parameter('S').map(|p| p.as_int()).transpose()?.unwrap_or(0);
    if s != 0 {
        // Expansion board updates are streamed by the firmware itself.
        return Ok(None);
    }

    let Some(board) = executor.model.read().await.boards.first().cloned() else {
        return Ok(error_result("No board information available"));
    };

    let iap_path =
        paths::to_physical(&executor.settings, &board.iap_file_name, FileDirectory::System);
    let iap = match tokio::fs::read(&iap_path).await {
        Ok(data) => data,
        Err(_) => {
            return Ok(error_result(format!(
                "Failed to find IAP file {}",
                board.iap_file_name
            )))
        }
    };

    let firmware_path = paths::to_physical(
        &executor.settings,
        &board.firmware_file_name,
        FileDirectory::System,
    );
    let firmware = match tokio::fs::read(&firmware_path).await {
        Ok(data) => data,
        Err(_) => {
            return Ok(error_result(format!(
                "Failed to find firmware file {}",
                board.firmware_file_name
            )))
        }
    };

    executor.firmware.update_firmware(iap, firmware).await?;
    Ok(empty())
}

// ─── Executed hooks ───────────────────────────────────────────

pub(crate) async fn code_executed(
    executor: &Arc<CodeExecutor>,
    code: &mut Code,
) -> Result<(), ExecutionError> {
    let successful = code
        .result
        .as_ref()
        .map(CodeResult::is_successful)
        .unwrap_or(false);

    match code.major {
        Some(24) | Some(32) | Some(37) if successful => {
            let _job = executor.model.lock_job().await;
            executor.model.resume_job().await;
        }
        Some(25) | Some(226) if successful => {
            let _job = executor.model.lock_job().await;
            if executor.model.read().await.job.file.is_some()
                && !executor.model.is_job_paused().await
            {
                executor.model.pause_job().await;
            }
        }
        Some(82) => executor.model.set_relative_extrusion(code.channel, false).await,
        Some(83) => executor.model.set_relative_extrusion(code.channel, true).await,
        Some(122)
            if successful && !code.flags.contains(CodeFlags::IS_INTERNALLY_PROCESSED) =>
        {
            let diagnostics = executor.diagnostics().await;
            if let Some(result) = code.result.as_mut() {
                result.push(Message::success(diagnostics));
            }
        }
        Some(555) if successful => {
            if let Some(p) = code.parameter('P') {
                if let Some(compatibility) = Compatibility::from_value(p.as_int()?) {
                    executor
                        .model
                        .set_compatibility(code.channel, compatibility)
                        .await;
                }
            }
        }
        _ => {}
    }
    Ok(())
}
