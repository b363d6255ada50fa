//! Storage layer for persistent settings (a single JSON file)

use crate::error::BundleKitError;
use bundlekit_types::Settings;
use std::path::{Path, PathBuf};
use tokio::fs;
use url::Url;

/// File name of the settings document inside the data directory
pub const SETTINGS_FILE: &str = "settings.json";

/// Storage manager for bundlekit settings
#[derive(Clone, Debug)]
pub struct SettingsStore {
    /// Data directory
    data_dir: PathBuf,
}

impl SettingsStore {
    /// Create a new storage instance
    pub async fn new(data_dir: PathBuf) -> Result<Self, BundleKitError> {
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    /// Load settings, falling back to defaults when nothing was saved yet
    pub async fn load(&self) -> Result<Settings, BundleKitError> {
        let path = self.path();
        if !fs::try_exists(&path).await? {
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(&path).await?;
        let settings: Settings = serde_json::from_str(&content)?;
        validate(&settings)?;
        Ok(settings)
    }

    /// Save settings
    pub async fn save(&self, settings: &Settings) -> Result<(), BundleKitError> {
        validate(settings)?;
        let content = serde_json::to_string_pretty(settings)?;

        // Write-then-rename so a crash never leaves a truncated document
        let temp = self.data_dir.join(format!("{}.tmp", SETTINGS_FILE));
        fs::write(&temp, content).await?;
        fs::rename(&temp, self.path()).await?;
        Ok(())
    }
}

/// Reject settings the engine cannot run with
pub fn validate(settings: &Settings) -> Result<(), BundleKitError> {
    if settings.buffer_size == 0 {
        return Err(BundleKitError::Config("buffer_size must be positive".into()));
    }
    for base in &settings.base_urls {
        Url::parse(base)
            .map_err(|e| BundleKitError::Config(format!("base URL {}: {}", base, e)))?;
    }
    Ok(())
}

/// Return a copy of `settings` with one field replaced
///
/// `value` is read as JSON first and as a plain string otherwise, so
/// `max_retries 3` and `user_agent my-agent` both work.
pub fn set_value(settings: &Settings, key: &str, value: &str) -> Result<Settings, BundleKitError> {
    let mut document = serde_json::to_value(settings)?;
    let fields = document
        .as_object_mut()
        .ok_or_else(|| BundleKitError::Config("settings are not an object".into()))?;
    if !fields.contains_key(key) {
        return Err(BundleKitError::Config(format!("unknown setting: {}", key)));
    }

    let parsed = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    fields.insert(key.to_string(), parsed);

    let updated: Settings = serde_json::from_value(document)
        .map_err(|e| BundleKitError::Config(format!("{}: {}", key, e)))?;
    validate(&updated)?;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundlekit_types::ChecksumKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_defaults_when_missing() {
        let temp_dir = TempDir::new().unwrap();
        let store = SettingsStore::new(temp_dir.path().join("data")).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Settings::default());
        assert!(temp_dir.path().join("data").is_dir());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let store = SettingsStore::new(temp_dir.path().to_path_buf()).await.unwrap();

        let settings = Settings {
            base_urls: vec!["http://cdn.local/bundles/".into()],
            max_retries: 9,
            checksum: ChecksumKind::Md5,
            ..Settings::default()
        };
        store.save(&settings).await.unwrap();

        assert_eq!(store.load().await.unwrap(), settings);
        assert!(!temp_dir.path().join("settings.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_save_rejects_bad_base_url() {
        let temp_dir = TempDir::new().unwrap();
        let store = SettingsStore::new(temp_dir.path().to_path_buf()).await.unwrap();

        let settings = Settings {
            base_urls: vec!["not a url".into()],
            ..Settings::default()
        };
        assert!(matches!(
            store.save(&settings).await,
            Err(BundleKitError::Config(_))
        ));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_set_value() {
        let settings = Settings::default();

        let updated = set_value(&settings, "max_retries", "3").unwrap();
        assert_eq!(updated.max_retries, 3);

        let updated = set_value(&updated, "user_agent", "my-agent").unwrap();
        assert_eq!(updated.user_agent, "my-agent");

        let updated = set_value(&updated, "checksum", "md5").unwrap();
        assert_eq!(updated.checksum, ChecksumKind::Md5);

        let updated =
            set_value(&updated, "base_urls", r#"["http://a.local/","http://b.local/"]"#).unwrap();
        assert_eq!(updated.base_urls.len(), 2);
    }

    #[test]
    fn test_set_value_errors() {
        let settings = Settings::default();
        assert!(matches!(
            set_value(&settings, "no_such_key", "1"),
            Err(BundleKitError::Config(_))
        ));
        assert!(matches!(
            set_value(&settings, "max_retries", "many"),
            Err(BundleKitError::Config(_))
        ));
        assert!(matches!(
            set_value(&settings, "buffer_size", "0"),
            Err(BundleKitError::Config(_))
        ));
    }
}
