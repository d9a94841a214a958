// 模型配置存储与校验
//
// Records are kept in `<home>/models/models.toml`, one table per model name.
// Both the device (selection, producer start-up) and the server (HTTP read
// endpoints) open the same file, so every read goes back to disk.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub const MODELS_DIR: &str = "models";
pub const MODELS_FILE: &str = "models.toml";

/// 模型记录（存储格式）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Filled from the table key on load.
    #[serde(default)]
    pub model_name: String,
    pub model_file: String,
    pub model_type: String,
    pub model_post_processor: String,
    pub model_color_format: String,
    /// Literal `"true"` / `"false"`, checked at selection time.
    pub model_preserve_aspect_ratio: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels_file: Option<String>,
}

impl ModelRecord {
    /// Eagerly checks everything the producer will need, so that a bad record
    /// is rejected when it is selected rather than when the stream starts.
    pub fn validate(&self) -> Result<ModelConfig> {
        let post_processor = self.model_post_processor.parse::<PostProcessor>()?;
        let color_format = self.model_color_format.parse::<ColorFormat>()?;
        let preserve_aspect_ratio = match self.model_preserve_aspect_ratio.to_lowercase().as_str() {
            "true" => true,
            "false" => false,
            _ => {
                return Err(RelayError::InvalidModelConfig(
                    "Preserve aspect ratio should be either 'true' or 'false'.".to_string(),
                ))
            }
        };

        if self.model_file.trim().is_empty() {
            return Err(RelayError::InvalidModelConfig(format!(
                "model '{}' has no model_file",
                self.model_name
            )));
        }

        Ok(ModelConfig {
            name: self.model_name.clone(),
            model_file: PathBuf::from(&self.model_file),
            model_type: self.model_type.to_lowercase(),
            post_processor,
            color_format,
            preserve_aspect_ratio,
            labels_file: self.labels_file.as_ref().map(PathBuf::from),
        })
    }
}

/// 已校验的模型配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    pub name: String,
    pub model_file: PathBuf,
    pub model_type: String,
    pub post_processor: PostProcessor,
    pub color_format: ColorFormat,
    pub preserve_aspect_ratio: bool,
    pub labels_file: Option<PathBuf>,
}

/// 后处理器注册表
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PostProcessor {
    Cls,
    ClsSoftmax,
    OdBcsn,
    OdBscn,
    OdEfficientdetLite0,
    Posenet,
    Segment,
}

impl PostProcessor {
    pub const ALL: [PostProcessor; 7] = [
        PostProcessor::Cls,
        PostProcessor::ClsSoftmax,
        PostProcessor::OdBcsn,
        PostProcessor::OdBscn,
        PostProcessor::OdEfficientdetLite0,
        PostProcessor::Posenet,
        PostProcessor::Segment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PostProcessor::Cls => "pp_cls",
            PostProcessor::ClsSoftmax => "pp_cls_softmax",
            PostProcessor::OdBcsn => "pp_od_bcsn",
            PostProcessor::OdBscn => "pp_od_bscn",
            PostProcessor::OdEfficientdetLite0 => "pp_od_efficientdet_lite0",
            PostProcessor::Posenet => "pp_posenet",
            PostProcessor::Segment => "pp_segment",
        }
    }

    pub fn is_object_detection(&self) -> bool {
        matches!(
            self,
            PostProcessor::OdBcsn | PostProcessor::OdBscn | PostProcessor::OdEfficientdetLite0
        )
    }

    pub fn is_classification(&self) -> bool {
        matches!(self, PostProcessor::Cls | PostProcessor::ClsSoftmax)
    }
}

impl FromStr for PostProcessor {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim();
        let key = key.strip_prefix("pp_").unwrap_or(key);
        match key {
            "cls" => Ok(PostProcessor::Cls),
            "cls_softmax" => Ok(PostProcessor::ClsSoftmax),
            "od_bcsn" => Ok(PostProcessor::OdBcsn),
            "od_bscn" => Ok(PostProcessor::OdBscn),
            "od_efficientdet_lite0" => Ok(PostProcessor::OdEfficientdetLite0),
            "posenet" => Ok(PostProcessor::Posenet),
            "segment" => Ok(PostProcessor::Segment),
            _ => Err(RelayError::InvalidModelConfig(format!(
                "Unknown post processor function: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for PostProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 像素颜色格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorFormat {
    Rgb,
    Bgr,
}

impl FromStr for ColorFormat {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "RGB" => Ok(ColorFormat::Rgb),
            "BGR" => Ok(ColorFormat::Bgr),
            _ => Err(RelayError::InvalidModelConfig(format!("Unknown color format: {}", s))),
        }
    }
}

impl fmt::Display for ColorFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColorFormat::Rgb => f.write_str("RGB"),
            ColorFormat::Bgr => f.write_str("BGR"),
        }
    }
}

/// 模型存储接口
pub trait ModelStore: Send + Sync {
    fn get(&self, name: &str) -> Result<ModelRecord>;
    fn list(&self) -> Result<Vec<ModelRecord>>;
    fn put(&self, record: ModelRecord) -> Result<()>;
    fn delete(&self, name: &str) -> Result<()>;
}

/// Looks a model up and validates it. Shared by select handling on the
/// device and the server's read endpoints.
pub fn resolve_model(store: &dyn ModelStore, name: &str) -> Result<ModelConfig> {
    store.get(name)?.validate()
}

/// TOML-backed model store rooted at `<home>/models`.
pub struct TomlModelStore {
    model_dir: PathBuf,
    config_file: PathBuf,
    write_lock: Mutex<()>,
}

impl TomlModelStore {
    pub fn open(home: &Path) -> Result<Self> {
        let model_dir = home.join(MODELS_DIR);
        fs::create_dir_all(&model_dir)?;

        let config_file = model_dir.join(MODELS_FILE);
        if !config_file.exists() {
            fs::write(&config_file, "")?;
            info!("Created empty model store at {:?}", config_file);
        }

        Ok(Self {
            model_dir,
            config_file,
            write_lock: Mutex::new(()),
        })
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    /// Directory holding a model's files.
    pub fn dir_for(&self, name: &str) -> PathBuf {
        self.model_dir.join(name)
    }

    /// Label lines of a model, if it has a readable labels file.
    pub fn labels(&self, name: &str) -> Result<Option<Vec<String>>> {
        let record = self.get(name)?;
        let Some(labels_file) = record.labels_file else {
            return Ok(None);
        };
        match fs::read_to_string(&labels_file) {
            Ok(content) => Ok(Some(content.lines().map(str::to_string).collect())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Renames a model, moving its directory and relocating any file paths
    /// that live under the old directory.
    pub fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        if old_name == new_name {
            return Ok(());
        }

        let _guard = self.lock()?;
        let mut models = self.load()?;
        if models.contains_key(new_name) {
            return Err(RelayError::ModelExists(new_name.to_string()));
        }
        let mut record = models
            .remove(old_name)
            .ok_or_else(|| RelayError::ModelNotFound(old_name.to_string()))?;

        let old_dir = self.dir_for(old_name);
        let new_dir = self.dir_for(new_name);
        record.model_name = new_name.to_string();
        record.model_file = relocate(&record.model_file, &old_dir, &new_dir);
        record.labels_file = record
            .labels_file
            .map(|path| relocate(&path, &old_dir, &new_dir));

        if old_dir.exists() {
            fs::rename(&old_dir, &new_dir)?;
        }

        models.insert(new_name.to_string(), record);
        self.save(&models)?;
        info!("Renamed model '{}' to '{}'", old_name, new_name);
        Ok(())
    }

    /// Replaces an existing record.
    pub fn update(&self, mut record: ModelRecord) -> Result<()> {
        let _guard = self.lock()?;
        let mut models = self.load()?;
        if !models.contains_key(&record.model_name) {
            return Err(RelayError::ModelNotFound(record.model_name));
        }
        record.model_preserve_aspect_ratio = record.model_preserve_aspect_ratio.to_lowercase();
        info!("Updating model '{}'", record.model_name);
        models.insert(record.model_name.clone(), record);
        self.save(&models)
    }

    /// Writes an uploaded file into the model's directory and returns its
    /// path. Only the final component of `file_name` is used.
    pub fn write_file(&self, name: &str, file_name: &str, data: &[u8]) -> Result<PathBuf> {
        let file_name = Path::new(file_name)
            .file_name()
            .ok_or_else(|| RelayError::InvalidModelConfig(format!("invalid file name '{}'", file_name)))?;
        let dir = self.dir_for(name);
        fs::create_dir_all(&dir)?;
        let path = dir.join(file_name);
        fs::write(&path, data)?;
        debug!("Wrote {} bytes to {:?}", data.len(), path);
        Ok(path)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| RelayError::StoreError("model store lock poisoned".to_string()))
    }

    fn load(&self) -> Result<BTreeMap<String, ModelRecord>> {
        let content = fs::read_to_string(&self.config_file)?;
        let mut models: BTreeMap<String, ModelRecord> = toml::from_str(&content)?;
        for (name, record) in models.iter_mut() {
            record.model_name = name.clone();
        }
        Ok(models)
    }

    fn save(&self, models: &BTreeMap<String, ModelRecord>) -> Result<()> {
        let content = toml::to_string_pretty(models)?;
        let tmp = self.config_file.with_extension("toml.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.config_file)?;
        debug!("Saved {} model record(s)", models.len());
        Ok(())
    }
}

impl ModelStore for TomlModelStore {
    fn get(&self, name: &str) -> Result<ModelRecord> {
        self.load()?
            .remove(name)
            .ok_or_else(|| RelayError::ModelNotFound(name.to_string()))
    }

    fn list(&self) -> Result<Vec<ModelRecord>> {
        Ok(self.load()?.into_values().collect())
    }

    fn put(&self, mut record: ModelRecord) -> Result<()> {
        let _guard = self.lock()?;
        let mut models = self.load()?;
        if models.contains_key(&record.model_name) {
            return Err(RelayError::ModelExists(record.model_name));
        }
        record.model_preserve_aspect_ratio = record.model_preserve_aspect_ratio.to_lowercase();
        info!("Adding model '{}'", record.model_name);
        models.insert(record.model_name.clone(), record);
        self.save(&models)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let _guard = self.lock()?;
        let mut models = self.load()?;
        if models.remove(name).is_none() {
            return Err(RelayError::ModelNotFound(name.to_string()));
        }
        self.save(&models)?;

        // 清理模型目录，失败只记录
        let dir = self.dir_for(name);
        if let Err(e) = fs::remove_dir_all(&dir) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove model directory {:?}: {}", dir, e);
            }
        }
        info!("Deleted model '{}'", name);
        Ok(())
    }
}

fn relocate(path: &str, old_dir: &Path, new_dir: &Path) -> String {
    match Path::new(path).strip_prefix(old_dir) {
        Ok(rest) => new_dir.join(rest).to_string_lossy().into_owned(),
        Err(_) => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(name: &str, post_processor: &str, preserve: &str) -> ModelRecord {
        ModelRecord {
            model_name: name.to_string(),
            model_file: format!("/opt/models/{}/network.rpk", name),
            model_type: "RPK".to_string(),
            model_post_processor: post_processor.to_string(),
            model_color_format: "RGB".to_string(),
            model_preserve_aspect_ratio: preserve.to_string(),
            labels_file: None,
        }
    }

    #[test]
    fn test_validate_accepts_registry_names() {
        for pp in PostProcessor::ALL {
            let config = record("m", pp.as_str(), "true").validate().unwrap();
            assert_eq!(config.post_processor, pp);
        }

        let config = record("m", "od_bscn", "FALSE").validate().unwrap();
        assert_eq!(config.post_processor, PostProcessor::OdBscn);
        assert!(!config.preserve_aspect_ratio);
        assert_eq!(config.model_type, "rpk");
    }

    #[test]
    fn test_validate_rejects_bad_records() {
        let result = record("m", "pp_yolo", "true").validate();
        assert!(matches!(result, Err(RelayError::InvalidModelConfig(_))));

        let result = record("m", "pp_cls", "yes").validate();
        assert!(matches!(result, Err(RelayError::InvalidModelConfig(_))));

        let mut bad_color = record("m", "pp_cls", "true");
        bad_color.model_color_format = "YUV".to_string();
        assert!(matches!(bad_color.validate(), Err(RelayError::InvalidModelConfig(_))));
    }

    #[test]
    fn test_store_put_get_list_delete() {
        let home = TempDir::new().unwrap();
        let store = TomlModelStore::open(home.path()).unwrap();
        assert!(store.list().unwrap().is_empty());

        store.put(record("mobilenet", "pp_cls", "True")).unwrap();
        store.put(record("posenet", "pp_posenet", "false")).unwrap();

        let fetched = store.get("mobilenet").unwrap();
        assert_eq!(fetched.model_name, "mobilenet");
        assert_eq!(fetched.model_preserve_aspect_ratio, "true");
        assert_eq!(store.list().unwrap().len(), 2);

        assert!(matches!(
            store.put(record("mobilenet", "pp_cls", "true")),
            Err(RelayError::ModelExists(_))
        ));

        store.delete("posenet").unwrap();
        assert!(matches!(store.get("posenet"), Err(RelayError::ModelNotFound(_))));
        assert!(matches!(store.delete("posenet"), Err(RelayError::ModelNotFound(_))));
    }

    #[test]
    fn test_resolve_model_reports_missing_and_invalid() {
        let home = TempDir::new().unwrap();
        let store = TomlModelStore::open(home.path()).unwrap();
        store.put(record("broken", "pp_unknown", "true")).unwrap();

        assert!(matches!(
            resolve_model(&store, "does-not-exist"),
            Err(RelayError::ModelNotFound(_))
        ));
        assert!(matches!(
            resolve_model(&store, "broken"),
            Err(RelayError::InvalidModelConfig(_))
        ));
    }

    #[test]
    fn test_update_replaces_existing_record_only() {
        let home = TempDir::new().unwrap();
        let store = TomlModelStore::open(home.path()).unwrap();
        store.put(record("mobilenet", "pp_cls", "true")).unwrap();

        let mut changed = record("mobilenet", "pp_cls_softmax", "FALSE");
        changed.model_color_format = "BGR".to_string();
        store.update(changed).unwrap();

        let fetched = store.get("mobilenet").unwrap();
        assert_eq!(fetched.model_post_processor, "pp_cls_softmax");
        assert_eq!(fetched.model_preserve_aspect_ratio, "false");
        assert_eq!(fetched.model_color_format, "BGR");

        assert!(matches!(
            store.update(record("missing", "pp_cls", "true")),
            Err(RelayError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_write_file_stays_inside_model_dir() {
        let home = TempDir::new().unwrap();
        let store = TomlModelStore::open(home.path()).unwrap();

        let path = store.write_file("net", "../../escape.rpk", b"weights").unwrap();
        assert_eq!(path, store.dir_for("net").join("escape.rpk"));
        assert_eq!(fs::read(&path).unwrap(), b"weights");

        assert!(matches!(
            store.write_file("net", "..", b""),
            Err(RelayError::InvalidModelConfig(_))
        ));
    }

    #[test]
    fn test_rename_relocates_only_paths_under_model_dir() {
        let home = TempDir::new().unwrap();
        let store = TomlModelStore::open(home.path()).unwrap();

        let old_dir = store.dir_for("net");
        fs::create_dir_all(&old_dir).unwrap();
        fs::write(old_dir.join("labels.txt"), "cat\ndog\n").unwrap();

        let mut rec = record("net", "pp_cls", "true");
        rec.model_file = old_dir.join("network.rpk").to_string_lossy().into_owned();
        rec.labels_file = Some(old_dir.join("labels.txt").to_string_lossy().into_owned());
        store.put(rec).unwrap();

        // A path that merely contains the old directory as a substring stays put.
        let mut other = record("other", "pp_cls", "true");
        other.model_file = format!("/backup{}/network.rpk", old_dir.display());
        store.put(other.clone()).unwrap();

        store.rename("net", "net2").unwrap();

        let renamed = store.get("net2").unwrap();
        let new_dir = store.dir_for("net2");
        assert_eq!(PathBuf::from(&renamed.model_file), new_dir.join("network.rpk"));
        assert_eq!(store.labels("net2").unwrap(), Some(vec!["cat".to_string(), "dog".to_string()]));
        assert!(!old_dir.exists());
        assert!(matches!(store.get("net"), Err(RelayError::ModelNotFound(_))));
        assert_eq!(store.get("other").unwrap().model_file, other.model_file);
    }
}
