//! Configuration system for dlchan.
//!
//! Uses `figment` for layered configuration merging:
//! built-in defaults → user config → workspace config → explicit file → environment variables.

use crate::error::ConfigError;
use chrono::NaiveDateTime;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration of a challenge deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DlchanConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub challenge: ChallengeConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Where stores, artifacts, locks and logs live. Relative paths are resolved
/// against the workspace directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Uploaded artifacts waiting for (or under) evaluation.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    /// Artifacts that improved the table.
    #[serde(default = "default_best_models_dir")]
    pub best_models_dir: PathBuf,
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_queue_file")]
    pub queue_file: String,
    #[serde(default = "default_score_file")]
    pub score_file: String,
    #[serde(default = "default_history_file")]
    pub history_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            upload_dir: default_upload_dir(),
            best_models_dir: default_best_models_dir(),
            lock_dir: default_lock_dir(),
            log_dir: default_log_dir(),
            queue_file: default_queue_file(),
            score_file: default_score_file(),
            history_file: default_history_file(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_best_models_dir() -> PathBuf {
    PathBuf::from("uploads/best")
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("data/locks")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("data/logs")
}

fn default_queue_file() -> String {
    "runqueue.json".to_string()
}

fn default_score_file() -> String {
    "scoretable.json".to_string()
}

fn default_history_file() -> String {
    "evalhist.csv".to_string()
}

/// The held-out evaluation set and its geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Display name shown next to the countdown.
    #[serde(default = "default_dataset_name")]
    pub name: String,
    /// Evaluation set, relative to the data directory.
    #[serde(default = "default_eval_file")]
    pub eval_file: PathBuf,
    /// Training set offered for download, relative to the data directory.
    #[serde(default = "default_train_file")]
    pub train_file: PathBuf,
    /// Used when labels are not one-hot encoded.
    #[serde(default = "default_classes")]
    pub classes: usize,
    #[serde(default = "default_one")]
    pub channels: usize,
    /// Stacked maps of 2-D models that do not declare their own.
    #[serde(default = "default_one")]
    pub maps: usize,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            name: default_dataset_name(),
            eval_file: default_eval_file(),
            train_file: default_train_file(),
            classes: default_classes(),
            channels: default_one(),
            maps: default_one(),
        }
    }
}

fn default_dataset_name() -> String {
    "evaluation".to_string()
}

fn default_eval_file() -> PathBuf {
    PathBuf::from("evalset.json")
}

fn default_train_file() -> PathBuf {
    PathBuf::from("trainset.json")
}

fn default_classes() -> usize {
    2
}

fn default_one() -> usize {
    1
}

/// Evaluator loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Seconds between queue polls.
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Shuffle the evaluation set before each run.
    #[serde(default)]
    pub shuffle: bool,
    /// Fixed shuffle seed; without one every run gets a fresh permutation.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Drop submissions left over from a previous run at startup.
    #[serde(default = "default_true")]
    pub clear_queue_on_start: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            period_secs: default_period_secs(),
            batch_size: default_batch_size(),
            shuffle: false,
            seed: None,
            clear_queue_on_start: default_true(),
        }
    }
}

impl EvaluationConfig {
    pub fn shuffle_mode(&self) -> ShuffleMode {
        match (self.shuffle, self.seed) {
            (false, _) => ShuffleMode::Disabled,
            (true, None) => ShuffleMode::Fresh,
            (true, Some(seed)) => ShuffleMode::Seeded(seed),
        }
    }
}

fn default_period_secs() -> u64 {
    5
}

fn default_batch_size() -> usize {
    32
}

fn default_true() -> bool {
    true
}

/// How the evaluation set is ordered before each run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShuffleMode {
    Disabled,
    /// A new random permutation every run.
    Fresh,
    /// The same permutation every run.
    Seeded(u64),
}

/// Submission window and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeConfig {
    /// Local time after which submissions are refused. Open forever when unset.
    #[serde(default)]
    pub end_date: Option<NaiveDateTime>,
    #[serde(default = "default_max_model_size")]
    pub max_model_size: u64,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            end_date: None,
            max_model_size: default_max_model_size(),
        }
    }
}

fn default_max_model_size() -> u64 {
    16 * 1024 * 1024
}

impl ChallengeConfig {
    pub fn is_closed(&self, now: NaiveDateTime) -> bool {
        self.end_date.is_some_and(|end| end < now)
    }

    /// Countdown to the end date as `H:MM:SS`, `00:00:00` once it has passed
    /// and `None` when there is no end date.
    pub fn time_left(&self, now: NaiveDateTime) -> Option<String> {
        let end = self.end_date?;
        if end < now {
            return Some("00:00:00".to_string());
        }
        let secs = (end - now).num_seconds();
        let (hours, rest) = (secs / 3600, secs % 3600);
        Some(format!("{}:{:02}:{:02}", hours, rest / 60, rest % 60))
    }
}

/// Status gateway bind address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

/// Absolute locations of every file a deployment touches.
#[derive(Debug, Clone, PartialEq)]
pub struct StoragePaths {
    pub queue_file: PathBuf,
    pub score_file: PathBuf,
    pub history_file: PathBuf,
    pub upload_dir: PathBuf,
    pub best_models_dir: PathBuf,
    pub log_dir: PathBuf,
    pub eval_dataset: PathBuf,
    pub train_dataset: PathBuf,
    pub queue_lock: PathBuf,
    pub score_lock: PathBuf,
    pub evaluation_lock: PathBuf,
    pub history_lock: PathBuf,
}

impl DlchanConfig {
    /// Resolve every configured location against `workspace`.
    pub fn paths(&self, workspace: &Path) -> StoragePaths {
        let storage = &self.storage;
        let data = workspace.join(&storage.data_dir);
        let locks = workspace.join(&storage.lock_dir);
        StoragePaths {
            queue_file: data.join(&storage.queue_file),
            score_file: data.join(&storage.score_file),
            history_file: data.join(&storage.history_file),
            upload_dir: workspace.join(&storage.upload_dir),
            best_models_dir: workspace.join(&storage.best_models_dir),
            log_dir: workspace.join(&storage.log_dir),
            eval_dataset: data.join(&self.dataset.eval_file),
            train_dataset: data.join(&self.dataset.train_file),
            queue_lock: locks.join("queue.lock"),
            score_lock: locks.join("score.lock"),
            evaluation_lock: locks.join("evaluation.lock"),
            history_lock: locks.join("history.lock"),
        }
    }

    /// Reject values the evaluator cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.evaluation.batch_size == 0, "evaluation.batch_size must be positive"),
            (self.evaluation.period_secs == 0, "evaluation.period_secs must be positive"),
            (self.dataset.classes == 0, "dataset.classes must be positive"),
            (self.dataset.channels == 0, "dataset.channels must be positive"),
            (self.dataset.maps == 0, "dataset.maps must be positive"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(ConfigError::Invalid {
                message: (*message).to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Load configuration by merging layers.
///
/// Order: defaults → `<config dir>/dlchan/config.toml` →
/// `<workspace>/.dlchan/config.toml` → `config_file` → `DLCHAN_*` environment
/// variables (`__` separates nested keys, e.g. `DLCHAN_EVALUATION__BATCH_SIZE`).
pub fn load_config(
    workspace: Option<&Path>,
    config_file: Option<&Path>,
) -> Result<DlchanConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(DlchanConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(file) = config_file {
        if !file.exists() {
            return Err(ConfigError::FileNotFound {
                path: file.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(file));
    }

    figment = figment.merge(Env::prefixed("DLCHAN_").split("__"));

    let config: DlchanConfig = figment.extract().map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}

/// `<user config dir>/config.toml`, if the platform has one.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "dlchan", "dlchan")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".dlchan").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 11, 30)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = DlchanConfig::default();
        assert_eq!(config.evaluation.batch_size, 32);
        assert_eq!(config.evaluation.shuffle_mode(), ShuffleMode::Disabled);
        assert!(config.evaluation.clear_queue_on_start);
        assert_eq!(config.gateway.port, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws_dir = dir.path().join(".dlchan");
        std::fs::create_dir_all(&ws_dir).unwrap();
        std::fs::write(
            ws_dir.join("config.toml"),
            r#"
[dataset]
name = "ecg5"
classes = 5
channels = 3

[evaluation]
shuffle = true
seed = 7

[challenge]
end_date = "2024-11-30T23:59:59"
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.dataset.name, "ecg5");
        assert_eq!(config.dataset.classes, 5);
        assert_eq!(config.dataset.channels, 3);
        assert_eq!(config.dataset.maps, 1);
        assert_eq!(config.evaluation.shuffle_mode(), ShuffleMode::Seeded(7));
        assert_eq!(config.challenge.end_date, Some(at(23, 59, 59)));
    }

    #[test]
    fn test_explicit_file_overrides_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let ws_dir = dir.path().join(".dlchan");
        std::fs::create_dir_all(&ws_dir).unwrap();
        std::fs::write(ws_dir.join("config.toml"), "[gateway]\nport = 8000\n").unwrap();
        let explicit = dir.path().join("prod.toml");
        std::fs::write(&explicit, "[gateway]\nport = 9000\n").unwrap();

        let config = load_config(Some(dir.path()), Some(&explicit)).unwrap();
        assert_eq!(config.gateway.port, 9000);
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = load_config(None, Some(Path::new("/nonexistent/dlchan.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("bad.toml");
        std::fs::write(&explicit, "[evaluation]\nbatch_size = 0\n").unwrap();
        let err = load_config(None, Some(&explicit)).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_shuffle_modes() {
        let mut evaluation = EvaluationConfig {
            shuffle: true,
            ..EvaluationConfig::default()
        };
        assert_eq!(evaluation.shuffle_mode(), ShuffleMode::Fresh);
        evaluation.seed = Some(42);
        assert_eq!(evaluation.shuffle_mode(), ShuffleMode::Seeded(42));
        evaluation.shuffle = false;
        assert_eq!(evaluation.shuffle_mode(), ShuffleMode::Disabled);
    }

    #[test]
    fn test_time_left() {
        let challenge = ChallengeConfig {
            end_date: Some(at(23, 0, 0)),
            ..ChallengeConfig::default()
        };
        assert_eq!(challenge.time_left(at(21, 58, 30)).as_deref(), Some("1:01:30"));
        assert_eq!(challenge.time_left(at(23, 0, 1)).as_deref(), Some("00:00:00"));
        assert!(!challenge.is_closed(at(23, 0, 0)));
        assert!(challenge.is_closed(at(23, 0, 1)));
        assert_eq!(ChallengeConfig::default().time_left(at(0, 0, 0)), None);
        assert!(!ChallengeConfig::default().is_closed(at(0, 0, 0)));
    }

    #[test]
    fn test_paths_resolve_against_workspace() {
        let config = DlchanConfig::default();
        let paths = config.paths(Path::new("/srv/chan"));
        assert_eq!(paths.queue_file, PathBuf::from("/srv/chan/data/runqueue.json"));
        assert_eq!(paths.best_models_dir, PathBuf::from("/srv/chan/uploads/best"));
        assert_eq!(paths.eval_dataset, PathBuf::from("/srv/chan/data/evalset.json"));
        assert_eq!(
            paths.evaluation_lock,
            PathBuf::from("/srv/chan/data/locks/evaluation.lock")
        );
    }
}
