use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use toml_edit::{DocumentMut, Item, value};

use crate::codec::DEFAULT_QUALITY;
use crate::metadata::CameraIdentity;
use crate::naming::{DEFAULT_PREFIX, DEFAULT_START_INDEX};

/// Default on-disk config filename
pub const DEFAULT_CONFIG_PATH: &str = "wideevo.toml";

pub const DEFAULT_ARCHIVE_NAME: &str = "WideEvo_Photos.zip";

/// Written to disk when no config file exists yet.
const DEFAULT_CONFIG: &str = r#"# WideEvo photo normalizer

[server]
bind_address = "0.0.0.0:8080"

[logging]
# filter = "info,wideevo_server=debug"

[batch]
prefix = "DSCF"
start_index = 1
# JPEG quality, 1-100
quality = 95
# workers = 4
output_dir = "output"
archive_name = "WideEvo_Photos.zip"

# Identity strings written into every photo's EXIF block.
[camera]
# make = "FUJIFILM"
# model = "X-T30"
# software = "Digital Camera X-T30 Ver1.00"
# serial_number = "9AB12345"
# internal_serial_number = "FF02B1234567 593433313432 2021:03:01 9AB12345"
# lens_make = "FUJIFILM"
# lens_model = "XF18-55mmF2.8-4 R LM OIS"
# lens_serial_number = "1A234567"
# Four characters each
# exif_version = "0232"
# fujifilm_version = "0130"
"#;

/// Strongly typed representation of the configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    pub server: Option<Server>,
    pub logging: Option<Logging>,
    #[serde(default)]
    pub batch: BatchSettings,
    #[serde(default)]
    pub camera: Camera,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Server {
    pub bind_address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Logging {
    pub filter: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct BatchSettings {
    pub prefix: Option<String>,
    pub start_index: Option<u32>,
    pub quality: Option<u8>,
    /// Concurrent photos per batch. Defaults to the available parallelism.
    pub workers: Option<usize>,
    pub output_dir: Option<PathBuf>,
    pub archive_name: Option<String>,
}

impl BatchSettings {
    pub fn prefix(&self) -> &str {
        self.prefix
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_PREFIX)
    }

    pub fn start_index(&self) -> u32 {
        self.start_index.unwrap_or(DEFAULT_START_INDEX)
    }

    pub fn quality(&self) -> u8 {
        self.quality.unwrap_or(DEFAULT_QUALITY)
    }

    pub fn workers(&self) -> usize {
        self.workers.filter(|w| *w > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("output"))
    }

    pub fn archive_name(&self) -> &str {
        self.archive_name
            .as_deref()
            .unwrap_or(DEFAULT_ARCHIVE_NAME)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Camera {
    pub make: Option<String>,
    pub model: Option<String>,
    pub software: Option<String>,
    pub serial_number: Option<String>,
    pub internal_serial_number: Option<String>,
    pub lens_make: Option<String>,
    pub lens_model: Option<String>,
    pub lens_serial_number: Option<String>,
    pub exif_version: Option<String>,
    pub fujifilm_version: Option<String>,
}

impl From<&Camera> for CameraIdentity {
    fn from(c: &Camera) -> Self {
        CameraIdentity {
            make: c.make.clone(),
            model: c.model.clone(),
            software: c.software.clone(),
            serial_number: c.serial_number.clone(),
            internal_serial_number: c.internal_serial_number.clone(),
            lens_make: c.lens_make.clone(),
            lens_model: c.lens_model.clone(),
            lens_serial_number: c.lens_serial_number.clone(),
            exif_version: c.exif_version.clone(),
            fujifilm_version: c.fujifilm_version.clone(),
        }
    }
}

/// Prefixes end up in file names, so keep them to a single path component.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.is_empty() {
        bail!("prefix must not be empty");
    }
    if prefix.contains(['/', '\\']) || prefix.contains("..") {
        bail!("prefix '{}' must not contain path separators", prefix);
    }
    Ok(())
}

/// Internal manager state kept behind an `Arc<RwLock<_>>`.
#[derive(Debug)]
pub struct ConfigManager {
    path: PathBuf,
    doc: DocumentMut,
}

pub type SharedConfig = Arc<RwLock<ConfigManager>>;

impl ConfigManager {
    /// Load existing config file. If the file does not exist, creates it from the built-in default.
    pub async fn load(path: Option<PathBuf>) -> Result<SharedConfig> {
        let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        if !path.exists() {
            fs::write(&path, DEFAULT_CONFIG)
                .await
                .with_context(|| format!("writing default config to {}", path.display()))?;
            // Logging is not initialised yet at this point.
            println!("Created default config file: {}", path.display());
        }

        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading config file {}", path.display()))?;
        let doc = text
            .parse::<DocumentMut>()
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(Arc::new(RwLock::new(Self { path, doc })))
    }

    pub async fn path(cfg: &SharedConfig) -> PathBuf {
        cfg.read().await.path.clone()
    }

    /// Convert current document to strongly typed struct.
    pub async fn to_struct(cfg: &SharedConfig) -> Result<Config> {
        let guard = cfg.read().await;
        let typed: Config = toml_edit::de::from_document(guard.doc.clone())?;
        Ok(typed)
    }

    async fn set_batch_value(cfg: &SharedConfig, key: &str, v: Item) -> Result<()> {
        let mut guard = cfg.write().await;
        let batch = guard.doc["batch"].or_insert(Item::Table(toml_edit::Table::new()));
        if let Item::Table(tbl) = batch {
            tbl[key] = v;
            Ok(())
        } else {
            bail!("batch is not a table");
        }
    }

    /// Set the filename prefix used for new batches.
    pub async fn set_prefix(cfg: &SharedConfig, prefix: &str) -> Result<()> {
        validate_prefix(prefix)?;
        Self::set_batch_value(cfg, "prefix", value(prefix)).await
    }

    pub async fn set_start_index(cfg: &SharedConfig, start_index: u32) -> Result<()> {
        Self::set_batch_value(cfg, "start_index", value(start_index as i64)).await
    }

    /// Set JPEG quality (1-100).
    pub async fn set_quality(cfg: &SharedConfig, quality: u8) -> Result<()> {
        if !(1..=100).contains(&quality) {
            bail!("quality {} is outside 1..=100", quality);
        }
        Self::set_batch_value(cfg, "quality", value(quality as i64)).await
    }

    pub async fn set_workers(cfg: &SharedConfig, workers: usize) -> Result<()> {
        if workers == 0 {
            bail!("workers must be at least 1");
        }
        Self::set_batch_value(cfg, "workers", value(workers as i64)).await
    }

    /// Atomic write of current document to disk (best-effort durability via rename).
    pub async fn save(cfg: &SharedConfig) -> Result<()> {
        let (path, contents) = {
            let guard = cfg.read().await;
            (guard.path.clone(), guard.doc.to_string())
        };
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, contents)
            .await
            .with_context(|| format!("writing tmp config {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming tmp config to {}", path.display()))?;
        Ok(())
    }
}

/// Resolve a config-relative directory against the config file's location.
pub fn resolve_relative(config_path: &Path, dir: &Path) -> PathBuf {
    if dir.is_absolute() {
        return dir.to_path_buf();
    }
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(dir),
        _ => dir.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wideevo.toml");
        let cfg = ConfigManager::load(Some(path.clone())).await.unwrap();
        assert!(path.exists());

        let typed = ConfigManager::to_struct(&cfg).await.unwrap();
        assert_eq!(typed.batch.prefix(), "DSCF");
        assert_eq!(typed.batch.start_index(), 1);
        assert_eq!(typed.batch.quality(), 95);
        assert_eq!(typed.batch.archive_name(), "WideEvo_Photos.zip");
        assert!(typed.batch.workers() >= 1);
        assert_eq!(
            typed.server.and_then(|s| s.bind_address).as_deref(),
            Some("0.0.0.0:8080")
        );
        assert_eq!(CameraIdentity::from(&typed.camera), CameraIdentity::default());
    }

    #[tokio::test]
    async fn setters_persist_and_keep_comments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wideevo.toml");
        let cfg = ConfigManager::load(Some(path.clone())).await.unwrap();
        ConfigManager::set_prefix(&cfg, "IMG_").await.unwrap();
        ConfigManager::set_start_index(&cfg, 120).await.unwrap();
        ConfigManager::set_quality(&cfg, 88).await.unwrap();
        ConfigManager::set_workers(&cfg, 2).await.unwrap();
        ConfigManager::save(&cfg).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("# JPEG quality, 1-100"));

        let reloaded = ConfigManager::load(Some(path)).await.unwrap();
        let typed = ConfigManager::to_struct(&reloaded).await.unwrap();
        assert_eq!(typed.batch.prefix(), "IMG_");
        assert_eq!(typed.batch.start_index(), 120);
        assert_eq!(typed.batch.quality(), 88);
        assert_eq!(typed.batch.workers(), 2);
    }

    #[tokio::test]
    async fn invalid_settings_are_rejected() {
        let dir = TempDir::new().unwrap();
        let cfg = ConfigManager::load(Some(dir.path().join("c.toml")))
            .await
            .unwrap();
        assert!(ConfigManager::set_quality(&cfg, 0).await.is_err());
        assert!(ConfigManager::set_quality(&cfg, 101).await.is_err());
        assert!(ConfigManager::set_workers(&cfg, 0).await.is_err());
        assert!(ConfigManager::set_prefix(&cfg, "").await.is_err());
        assert!(ConfigManager::set_prefix(&cfg, "../x").await.is_err());
        assert!(ConfigManager::set_prefix(&cfg, "a/b").await.is_err());
    }

    #[tokio::test]
    async fn camera_section_feeds_exif_identity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wideevo.toml");
        std::fs::write(
            &path,
            "[camera]\nmake = \"FUJIFILM\"\nmodel = \"X100V\"\nlens_model = \"WCL-X100 II\"\nexif_version = \"0232\"\n",
        )
        .unwrap();
        let cfg = ConfigManager::load(Some(path)).await.unwrap();
        let typed = ConfigManager::to_struct(&cfg).await.unwrap();
        let id = CameraIdentity::from(&typed.camera);
        assert_eq!(id.make.as_deref(), Some("FUJIFILM"));
        assert_eq!(id.model.as_deref(), Some("X100V"));
        assert_eq!(id.software, None);
        assert_eq!(id.lens_model.as_deref(), Some("WCL-X100 II"));
        assert_eq!(id.exif_version.as_deref(), Some("0232"));
        assert_eq!(id.serial_number, None);
        // sections that are absent fall back to defaults
        assert_eq!(typed.batch.prefix(), "DSCF");
    }

    #[test]
    fn relative_dirs_follow_config_location() {
        assert_eq!(
            resolve_relative(Path::new("/etc/wideevo/wideevo.toml"), Path::new("out")),
            PathBuf::from("/etc/wideevo/out")
        );
        assert_eq!(
            resolve_relative(Path::new("wideevo.toml"), Path::new("out")),
            PathBuf::from("out")
        );
        assert_eq!(
            resolve_relative(Path::new("/a/c.toml"), Path::new("/abs")),
            PathBuf::from("/abs")
        );
    }
}
