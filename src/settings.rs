//! Persistence contract and the stores built on it.
//!
//! The fleet never needs persistence for correctness; it only restores prior desired
//! state across restarts. Every store is a named JSON value:
//!
//! - `configuration`: saved configuration sets, `{ set name: [configuration, ...] }`
//! - `PIStages` / `StandaStages`: stage catalogs, `{ stage model: { type, ... } }`
//!
//! [`JsonSettingsVault`] keeps one `<name>.json` file per store in a directory;
//! [`MemorySettingsStore`] keeps them in memory.

use crate::model::{Configuration, StageKind};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Store holding saved configuration sets.
pub const CONFIGURATION_STORE: &str = "configuration";
/// Store holding the PI stage catalog.
pub const PI_STAGES_STORE: &str = "PIStages";
/// Store holding the Standa stage catalog.
pub const STANDA_STAGES_STORE: &str = "StandaStages";

/// Failure reading or writing a settings store.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// Filesystem failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed store contents.
    #[error("store {name} is not valid JSON: {source}")]
    Json {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    /// Store names are ASCII letters, digits, `_` and `-`.
    #[error("invalid store name {0:?}")]
    InvalidName(String),

    /// Valid JSON in the wrong shape.
    #[error("store {0} has an unexpected layout")]
    Layout(String),
}

/// Result of a settings operation.
pub type SettingsResult<T> = std::result::Result<T, SettingsError>;

/// Named JSON stores.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// The stored value, or `None` if the store does not exist.
    async fn load(&self, name: &str) -> SettingsResult<Option<Value>>;

    /// Replace the store's value, creating it if needed.
    async fn save(&self, name: &str, value: &Value) -> SettingsResult<()>;
}

fn check_name(name: &str) -> SettingsResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(SettingsError::InvalidName(name.to_string()))
    }
}

// =============================================================================
// JSON file vault
// =============================================================================

/// One JSON file per store inside a directory.
#[derive(Debug, Clone)]
pub struct JsonSettingsVault {
    dir: PathBuf,
}

impl JsonSettingsVault {
    /// A vault over `dir`; the directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the stores.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Names of every store present on disk.
    pub async fn names(&self) -> SettingsResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(SettingsError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };
        let mut names = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|source| SettingsError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let Some(entry) = entry else { break };
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl SettingsStore for JsonSettingsVault {
    async fn load(&self, name: &str) -> SettingsResult<Option<Value>> {
        check_name(name)?;
        let path = self.path(name);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(SettingsError::Io { path, source }),
        };
        let value = serde_json::from_str(&text).map_err(|source| SettingsError::Json {
            name: name.to_string(),
            source,
        })?;
        debug!(store = name, path = %path.display(), "loaded settings store");
        Ok(Some(value))
    }

    async fn save(&self, name: &str, value: &Value) -> SettingsResult<()> {
        check_name(name)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| SettingsError::Io {
                path: self.dir.clone(),
                source,
            })?;
        let text = serde_json::to_string_pretty(value).map_err(|source| SettingsError::Json {
            name: name.to_string(),
            source,
        })?;
        let path = self.path(name);
        // Write then rename so a crash never leaves a truncated store behind.
        let staging = self.dir.join(format!(".{name}.json.tmp"));
        tokio::fs::write(&staging, text)
            .await
            .map_err(|source| SettingsError::Io {
                path: staging.clone(),
                source,
            })?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|source| SettingsError::Io {
                path: path.clone(),
                source,
            })?;
        debug!(store = name, path = %path.display(), "saved settings store");
        Ok(())
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Stores kept in memory, for tests and simulation.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    stores: RwLock<HashMap<String, Value>>,
}

impl MemorySettingsStore {
    /// An empty store set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed store `name` with `value`.
    pub fn with_store(self, name: &str, value: Value) -> Self {
        self.stores.write().insert(name.to_string(), value);
        self
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn load(&self, name: &str) -> SettingsResult<Option<Value>> {
        check_name(name)?;
        Ok(self.stores.read().get(name).cloned())
    }

    async fn save(&self, name: &str, value: &Value) -> SettingsResult<()> {
        check_name(name)?;
        self.stores.write().insert(name.to_string(), value.clone());
        Ok(())
    }
}

// =============================================================================
// Stage catalog
// =============================================================================

/// What the catalog knows about one stage model.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Linear or rotational
    #[serde(rename = "type", alias = "Kind", default)]
    pub kind: StageKind,
    /// Units per motor step (Standa)
    #[serde(alias = "Calibration", default)]
    pub calibration: Option<f64>,
    /// Travel range
    #[serde(alias = "MinMax", default)]
    pub min_max: Option<[f64; 2]>,
}

/// Stage models known to one family.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageCatalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl StageCatalog {
    /// A catalog from `(model, entry)` pairs.
    pub fn new(entries: impl IntoIterator<Item = (String, CatalogEntry)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Parse a catalog stored as an object keyed by model.
    pub fn from_value(name: &str, value: Value) -> SettingsResult<Self> {
        let entries = serde_json::from_value(value).map_err(|source| SettingsError::Json {
            name: name.to_string(),
            source,
        })?;
        Ok(Self { entries })
    }

    /// Load catalog `name`; a missing store yields an empty catalog.
    pub async fn load(store: &dyn SettingsStore, name: &str) -> SettingsResult<Self> {
        match store.load(name).await? {
            Some(value) => Self::from_value(name, value),
            None => {
                warn!(store = name, "stage catalog not found, every stage is treated as linear");
                Ok(Self::default())
            }
        }
    }

    /// Entry for `model`, if known.
    pub fn get(&self, model: &str) -> Option<&CatalogEntry> {
        self.entries.get(model)
    }

    /// Look up a model; unknown models are linear with no further data.
    pub fn classify(&self, model: &str) -> CatalogEntry {
        match self.entries.get(model) {
            Some(entry) => entry.clone(),
            None => {
                warn!(model, "stage model not in catalog, assuming linear");
                CatalogEntry::default()
            }
        }
    }

    /// Known models, sorted.
    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of known models.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the catalog knows no model.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Saved configuration sets
// =============================================================================

/// Named snapshots of the fleet's configurations, kept in the `configuration` store.
///
/// Sets are stored as raw JSON so a set saved by an older build still loads item by
/// item; parsing happens when the set is re-submitted.
#[derive(Clone)]
pub struct ConfigurationSets {
    store: Arc<dyn SettingsStore>,
}

impl std::fmt::Debug for ConfigurationSets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationSets").finish_non_exhaustive()
    }
}

impl ConfigurationSets {
    /// Sets kept in `store`.
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    /// Every saved set by name.
    pub async fn all(&self) -> SettingsResult<BTreeMap<String, Vec<Value>>> {
        match self.store.load(CONFIGURATION_STORE).await? {
            None => Ok(BTreeMap::new()),
            Some(Value::Object(map)) => map
                .into_iter()
                .map(|(name, items)| match items {
                    Value::Array(items) => Ok((name, items)),
                    _ => Err(SettingsError::Layout(CONFIGURATION_STORE.to_string())),
                })
                .collect(),
            Some(_) => Err(SettingsError::Layout(CONFIGURATION_STORE.to_string())),
        }
    }

    /// Names of the saved sets.
    pub async fn names(&self) -> SettingsResult<Vec<String>> {
        Ok(self.all().await?.into_keys().collect())
    }

    /// Raw items of set `name`.
    pub async fn get(&self, name: &str) -> SettingsResult<Option<Vec<Value>>> {
        Ok(self.all().await?.remove(name))
    }

    /// Save `configurations` under `name`, replacing any set of that name.
    pub async fn save(&self, name: &str, configurations: &[Configuration]) -> SettingsResult<()> {
        let items = configurations
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| SettingsError::Json {
                name: CONFIGURATION_STORE.to_string(),
                source,
            })?;
        let mut sets = self.all().await?;
        sets.insert(name.to_string(), items);
        self.write(sets).await
    }

    /// Remove set `name`; returns whether it existed.
    pub async fn remove(&self, name: &str) -> SettingsResult<bool> {
        let mut sets = self.all().await?;
        if sets.remove(name).is_none() {
            return Ok(false);
        }
        self.write(sets).await?;
        Ok(true)
    }

    async fn write(&self, sets: BTreeMap<String, Vec<Value>>) -> SettingsResult<()> {
        let value = Value::Object(
            sets.into_iter()
                .map(|(name, items)| (name, Value::Array(items)))
                .collect(),
        );
        self.store.save(CONFIGURATION_STORE, &value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VirtualStageConfig;
    use serde_json::json;

    #[tokio::test]
    async fn test_vault_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let vault = JsonSettingsVault::new(dir.path().join("settings"));
        assert_eq!(vault.load("test").await.unwrap(), None);

        vault.save("test", &json!({"weewoo": true})).await.unwrap();
        assert_eq!(
            vault.load("test").await.unwrap(),
            Some(json!({"weewoo": true}))
        );
        assert_eq!(vault.names().await.unwrap(), vec!["test".to_string()]);
    }

    #[tokio::test]
    async fn test_vault_rejects_path_names() {
        let dir = tempfile::tempdir().unwrap();
        let vault = JsonSettingsVault::new(dir.path());
        assert!(matches!(
            vault.save("../escape", &json!({})).await,
            Err(SettingsError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_store_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        let vault = JsonSettingsVault::new(dir.path());
        assert!(matches!(
            vault.load("broken").await,
            Err(SettingsError::Json { .. })
        ));
    }

    #[tokio::test]
    async fn test_catalog_classification() {
        let store = MemorySettingsStore::new().with_store(
            PI_STAGES_STORE,
            json!({
                "L-406.20DD10": {"type": "linear"},
                "M-060.DG": {"type": "rotational"}
            }),
        );
        let catalog = StageCatalog::load(&store, PI_STAGES_STORE).await.unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.classify("M-060.DG").kind, StageKind::Rotational);
        assert_eq!(catalog.classify("unknown").kind, StageKind::Linear);

        let missing = StageCatalog::load(&store, STANDA_STAGES_STORE).await.unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn test_standa_catalog_aliases() {
        let catalog = StageCatalog::from_value(
            STANDA_STAGES_STORE,
            json!({"8MT173-25": {"Kind": "linear", "Calibration": 0.0025, "MinMax": [0.0, 25.0]}}),
        )
        .unwrap();
        let entry = catalog.get("8MT173-25").unwrap();
        assert_eq!(entry.calibration, Some(0.0025));
        assert_eq!(entry.min_max, Some([0.0, 25.0]));
    }

    #[tokio::test]
    async fn test_configuration_sets() {
        let sets = ConfigurationSets::new(Arc::new(MemorySettingsStore::new()));
        assert!(sets.names().await.unwrap().is_empty());

        let config = Configuration::Virtual(VirtualStageConfig::new(1, 10.0));
        sets.save("bench", std::slice::from_ref(&config))
            .await
            .unwrap();
        let items = sets.get("bench").await.unwrap().unwrap();
        assert_eq!(items[0]["controller_type"], "Virtual");

        assert!(sets.remove("bench").await.unwrap());
        assert!(!sets.remove("bench").await.unwrap());
    }
}
