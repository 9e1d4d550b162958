use crate::types::{CodeChannel, Compatibility};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, OwnedMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

// ─── Model types ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineStatus {
    #[default]
    Idle,
    Processing,
    Simulating,
    Paused,
    Halted,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineState {
    pub status: MachineStatus,
    pub current_tool: i32,
    pub loaded_filament: Option<String>,
    pub log_file: Option<String>,
    pub date_time: Option<String>,
}

/// The file selected for printing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFile {
    pub file_name: String,
    pub physical_path: PathBuf,
    pub size: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub file: Option<JobFile>,
    pub file_position: u64,
    pub paused: bool,
    pub simulating: bool,
    /// Channel the print was started from.
    pub channel: Option<CodeChannel>,
}

/// Per-channel input state mirrored from the firmware.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputChannel {
    pub name: CodeChannel,
    pub compatibility: Compatibility,
    pub waiting_for_acknowledgement: bool,
    pub relative_extrusion: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub hostname: String,
}

impl Default for Network {
    fn default() -> Network {
        Network {
            hostname: "printerd".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    pub name: String,
    pub firmware_file_name: String,
    pub iap_file_name: String,
}

impl Default for Board {
    fn default() -> Board {
        Board {
            name: "Mainboard".to_string(),
            firmware_file_name: "MainboardFirmware.bin".to_string(),
            iap_file_name: "MainboardIAP.bin".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub mounted: bool,
    pub capacity: u64,
    pub free_space: u64,
    pub path: String,
}

impl Default for Volume {
    fn default() -> Volume {
        Volume {
            mounted: true,
            capacity: 0,
            free_space: 0,
            path: "0:/".to_string(),
        }
    }
}

/// Virtual directory roots as used on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directories {
    pub gcodes: String,
    pub system: String,
    pub macros: String,
    pub filaments: String,
    pub web: String,
    pub scans: String,
}

impl Default for Directories {
    fn default() -> Directories {
        Directories {
            gcodes: "0:/gcodes".to_string(),
            system: "0:/sys".to_string(),
            macros: "0:/macros".to_string(),
            filaments: "0:/filaments".to_string(),
            web: "0:/www".to_string(),
            scans: "0:/scans".to_string(),
        }
    }
}

/// Snapshot of the object model as far as the execution core needs it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineModel {
    pub state: MachineState,
    pub job: Job,
    pub inputs: Vec<InputChannel>,
    pub network: Network,
    pub boards: Vec<Board>,
    pub volumes: Vec<Volume>,
    pub directories: Directories,
}

impl Default for MachineModel {
    fn default() -> MachineModel {
        MachineModel {
            state: MachineState::default(),
            job: Job::default(),
            inputs: CodeChannel::ALL
                .iter()
                .map(|&name| InputChannel {
                    name,
                    compatibility: Compatibility::default(),
                    waiting_for_acknowledgement: false,
                    relative_extrusion: false,
                })
                .collect(),
            network: Network::default(),
            boards: vec![Board::default()],
            volumes: vec![Volume::default()],
            directories: Directories::default(),
        }
    }
}

// ─── Store ────────────────────────────────────────────────────

/// Read-write-locked holder of the machine model. Readers share, writers are
/// exclusive; handlers hold access only across the narrowest possible
/// region. Job mutations additionally serialize on the job lock.
pub struct MachineModelStore {
    model: RwLock<MachineModel>,
    job_lock: Arc<tokio::sync::Mutex<()>>,
    full_sync_tx: watch::Sender<bool>,
}

impl MachineModelStore {
    pub fn new() -> MachineModelStore {
        let (full_sync_tx, _) = watch::channel(false);
        MachineModelStore {
            model: RwLock::new(MachineModel::default()),
            job_lock: Arc::new(tokio::sync::Mutex::new(())),
            full_sync_tx,
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, MachineModel> {
        self.model.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, MachineModel> {
        self.model.write().await
    }

    /// JSON projection used by expression evaluation and the JSON report
    /// handlers.
    pub async fn to_json(&self) -> serde_json::Value {
        let model = self.model.read().await;
        serde_json::to_value(&*model).unwrap_or(serde_json::Value::Null)
    }

    /// Serializes job mutations (pause/resume/select/invalidate).
    pub async fn lock_job(&self) -> OwnedMutexGuard<()> {
        self.job_lock.clone().lock_owned().await
    }

    // ── Channel state ──

    pub async fn compatibility(&self, channel: CodeChannel) -> Compatibility {
        self.model.read().await.inputs[channel.index()].compatibility
    }

    pub async fn set_compatibility(&self, channel: CodeChannel, compatibility: Compatibility) {
        self.model.write().await.inputs[channel.index()].compatibility = compatibility;
    }

    pub async fn is_waiting_for_acknowledgement(&self, channel: CodeChannel) -> bool {
        self.model.read().await.inputs[channel.index()].waiting_for_acknowledgement
    }

    pub async fn set_waiting_for_acknowledgement(&self, channel: CodeChannel, waiting: bool) {
        self.model.write().await.inputs[channel.index()].waiting_for_acknowledgement = waiting;
    }

    pub async fn set_relative_extrusion(&self, channel: CodeChannel, relative: bool) {
        self.model.write().await.inputs[channel.index()].relative_extrusion = relative;
    }

    pub async fn relative_extrusion(&self, channel: CodeChannel) -> bool {
        self.model.read().await.inputs[channel.index()].relative_extrusion
    }

    // ── Job state ──

    pub async fn is_job_paused(&self) -> bool {
        self.model.read().await.job.paused
    }

    pub async fn is_printing(&self) -> bool {
        let model = self.model.read().await;
        model.job.file.is_some() && model.state.status != MachineStatus::Idle
    }

    pub async fn job_channel(&self) -> Option<CodeChannel> {
        self.model.read().await.job.channel
    }

    pub async fn select_job_file(&self, file: JobFile, channel: CodeChannel) {
        let mut model = self.model.write().await;
        model.job.file = Some(file);
        model.job.file_position = 0;
        model.job.paused = false;
        model.job.simulating = false;
        model.job.channel = Some(channel);
    }

    pub async fn invalidate_job_file(&self) {
        let mut model = self.model.write().await;
        model.job = Job::default();
        model.state.status = MachineStatus::Idle;
    }

    pub async fn pause_job(&self) {
        let mut model = self.model.write().await;
        if model.job.file.is_some() {
            model.job.paused = true;
            model.state.status = MachineStatus::Paused;
        }
    }

    /// Resumes dispatching of the selected job file.
    pub async fn resume_job(&self) {
        let mut model = self.model.write().await;
        if model.job.file.is_some() {
            model.job.paused = false;
            model.state.status = if model.job.simulating {
                MachineStatus::Simulating
            } else {
                MachineStatus::Processing
            };
        }
    }

    pub async fn set_job_position(&self, position: u64) {
        self.model.write().await.job.file_position = position;
    }

    pub async fn enter_simulation(&self) {
        let mut model = self.model.write().await;
        model.job.simulating = true;
    }

    // ── Model synchronisation ──

    /// Called by the transport once the full object model has been read back
    /// from the firmware.
    pub fn mark_fully_synced(&self) {
        let _ = self.full_sync_tx.send(true);
    }

    /// Blocks until the model has been synchronized at least once.
    pub async fn wait_for_full_sync(&self) {
        let mut rx = self.full_sync_tx.subscribe();
        let _ = rx.wait_for(|synced| *synced).await;
    }
}

impl Default for MachineModelStore {
    fn default() -> MachineModelStore {
        MachineModelStore::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn job_lifecycle_tracks_status() {
        let store = MachineModelStore::new();
        assert!(!store.is_printing().await);

        store
            .select_job_file(
                JobFile {
                    file_name: "0:/gcodes/part.g".to_string(),
                    physical_path: PathBuf::from("/tmp/gcodes/part.g"),
                    size: 1234,
                },
                CodeChannel::Http,
            )
            .await;
        store.resume_job().await;
        assert!(store.is_printing().await);
        assert_eq!(store.job_channel().await, Some(CodeChannel::Http));

        store.pause_job().await;
        assert!(store.is_job_paused().await);
        assert_eq!(store.read().await.state.status, MachineStatus::Paused);

        store.invalidate_job_file().await;
        assert!(!store.is_printing().await);
        assert!(store.read().await.job.file.is_none());
    }

    #[tokio::test]
    async fn json_projection_uses_camel_case() {
        let store = MachineModelStore::new();
        let json = store.to_json().await;
        assert!(json["network"]["hostname"].is_string());
        assert!(json["inputs"].as_array().unwrap().len() == CodeChannel::COUNT);
        assert!(json["state"]["currentTool"].is_i64());
    }

    #[tokio::test]
    async fn full_sync_wakes_waiters() {
        let store = Arc::new(MachineModelStore::new());
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_for_full_sync().await })
        };
        store.mark_fully_synced();
        waiter.await.unwrap();
    }
}
