use anyhow::{Context, Result};
use arbiter_core::EngineConfig;
use std::path::{Path, PathBuf};
use toml::Table;

/// Environment variable overriding the project config directory.
pub const PROJECT_CONFIG_DIR_ENV: &str = "ARBITER_PROJECT_CONFIG_DIR";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load merged configuration (defaults, then user, then project), with
    /// an optional explicit file on top
    pub fn load_with(explicit: Option<&Path>) -> Result<EngineConfig> {
        let mut layers: Vec<PathBuf> = Vec::new();
        if let Some(user_path) = Self::user_config_path() {
            layers.push(user_path);
        }
        layers.push(Self::project_config_path());

        let mut merged = Self::merge_layers(&layers)?;

        // An explicit file must exist
        if let Some(path) = explicit {
            let table = Self::read_table(path)?
                .with_context(|| format!("Config file not found: {}", path.display()))?;
            Self::merge_tables(&mut merged, table);
        }

        Self::finalize(merged)
    }

    /// Load a single file over the defaults. A missing file yields defaults.
    pub fn load_from_path(path: &Path) -> Result<EngineConfig> {
        Self::finalize(Self::merge_layers(&[path.to_path_buf()])?)
    }

    /// Get user config path (`$XDG_CONFIG_HOME/arbiter/config.toml` or platform equivalent)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("arbiter").join("config.toml"))
    }

    /// Get project config path
    /// Can be overridden with ARBITER_PROJECT_CONFIG_DIR (useful for isolated tests)
    pub fn project_config_path() -> PathBuf {
        if let Ok(dir) = std::env::var(PROJECT_CONFIG_DIR_ENV) {
            PathBuf::from(dir).join("config.toml")
        } else {
            PathBuf::from(".arbiter/config.toml")
        }
    }

    /// Merge existing layers in order; later layers win key by key.
    fn merge_layers(paths: &[PathBuf]) -> Result<Table> {
        let mut merged = Table::new();
        for path in paths {
            if let Some(table) = Self::read_table(path)? {
                Self::merge_tables(&mut merged, table);
            }
        }
        Ok(merged)
    }

    fn read_table(path: &Path) -> Result<Option<Table>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let table: Table = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(table))
    }

    /// Recursive merge: nested tables merge, everything else is replaced
    fn merge_tables(base: &mut Table, overlay: Table) {
        for (key, value) in overlay {
            if let toml::Value::Table(overlay_table) = value {
                if let Some(toml::Value::Table(base_table)) = base.get_mut(&key) {
                    Self::merge_tables(base_table, overlay_table);
                    continue;
                }
                base.insert(key, toml::Value::Table(overlay_table));
            } else {
                base.insert(key, value);
            }
        }
    }

    /// Apply defaults for unset keys and validate
    fn finalize(merged: Table) -> Result<EngineConfig> {
        let config: EngineConfig = toml::Value::Table(merged)
            .try_into()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut file = std::fs::File::create(path).unwrap();
        writeln!(file, "{}", contents).unwrap();
    }

    #[test]
    fn test_load_nonexistent_returns_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nonexistent.toml");

        let config = ConfigLoader::load_from_path(&path).unwrap();

        assert_eq!(config.aggregator.batch_size, 10);
        assert_eq!(config.control.group, "arbiter");
    }

    #[test]
    fn test_load_from_valid_toml() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        write(
            &path,
            r#"
[bandit]
alpha = 0.25

[aggregator]
flush_interval = "30s"
"#,
        );

        let config = ConfigLoader::load_from_path(&path).unwrap();

        assert!((config.bandit.alpha - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.aggregator.flush_interval, Duration::from_secs(30));
        assert_eq!(config.aggregator.batch_size, 10);
    }

    #[test]
    fn test_load_invalid_toml_returns_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("invalid.toml");
        write(&path, "this is not valid toml {{");

        assert!(ConfigLoader::load_from_path(&path).is_err());
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        write(&path, "[weights]\ntemperature = 0.0");

        let err = ConfigLoader::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("temperature"));
    }

    #[test]
    fn test_merge_tables_overlay_overrides_per_key() {
        let mut base: Table = toml::from_str(
            r#"
[aggregator]
batch_size = 20
learning_rate = 0.2
"#,
        )
        .unwrap();
        let overlay: Table = toml::from_str(
            r#"
[aggregator]
batch_size = 5

[delay]
decay_rate = 0.05
"#,
        )
        .unwrap();

        ConfigLoader::merge_tables(&mut base, overlay);
        let config = ConfigLoader::finalize(base).unwrap();

        assert_eq!(config.aggregator.batch_size, 5);
        // Untouched key in a merged section keeps the base value
        assert!((config.aggregator.learning_rate - 0.2).abs() < f64::EPSILON);
        assert!((config.delay.decay_rate - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merge_layers_later_wins() {
        let temp_dir = TempDir::new().unwrap();
        let first = temp_dir.path().join("user.toml");
        let second = temp_dir.path().join("project.toml");
        write(&first, "[control]\ngroup = \"user\"\npoll_batch_size = 8");
        write(&second, "[control]\ngroup = \"project\"");

        let merged = ConfigLoader::merge_layers(&[first, second]).unwrap();
        let config = ConfigLoader::finalize(merged).unwrap();

        assert_eq!(config.control.group, "project");
        assert_eq!(config.control.poll_batch_size, 8);
    }

    #[test]
    #[serial]
    fn test_project_config_path_honours_env() {
        let temp_dir = TempDir::new().unwrap();
        // SAFETY: serialized with the other env-mutating tests
        unsafe { std::env::set_var(PROJECT_CONFIG_DIR_ENV, temp_dir.path()) };

        let path = ConfigLoader::project_config_path();

        unsafe { std::env::remove_var(PROJECT_CONFIG_DIR_ENV) };
        assert_eq!(path, temp_dir.path().join("config.toml"));
    }

    #[test]
    #[serial]
    fn test_load_with_explicit_file_on_top() {
        let temp_dir = TempDir::new().unwrap();
        let project_dir = temp_dir.path().join("project");
        write(
            &project_dir.join("config.toml"),
            "[tracker]\ncapacity = 500\nrecent_window = 50",
        );
        let explicit = temp_dir.path().join("explicit.toml");
        write(&explicit, "[tracker]\nrecent_window = 25");

        // SAFETY: serialized with the other env-mutating tests
        unsafe { std::env::set_var(PROJECT_CONFIG_DIR_ENV, &project_dir) };
        let result = ConfigLoader::load_with(Some(&explicit));
        unsafe { std::env::remove_var(PROJECT_CONFIG_DIR_ENV) };

        let config = result.unwrap();
        assert_eq!(config.tracker.capacity, 500);
        assert_eq!(config.tracker.recent_window, 25);
    }

    #[test]
    #[serial]
    fn test_load_with_missing_explicit_file_fails() {
        let temp_dir = TempDir::new().unwrap();
        // SAFETY: serialized with the other env-mutating tests
        unsafe { std::env::set_var(PROJECT_CONFIG_DIR_ENV, temp_dir.path()) };
        let result = ConfigLoader::load_with(Some(&temp_dir.path().join("missing.toml")));
        unsafe { std::env::remove_var(PROJECT_CONFIG_DIR_ENV) };

        assert!(result.is_err());
    }
}
