//! configuration.yaml loading
//!
//! Two custom tags are understood:
//! - `!include path` - replace the node with the contents of another YAML
//!   file, resolved relative to the including file
//! - `!secret key` - substitute a value from `secrets.yaml` in the config
//!   directory

use crate::core_config::{CoreConfig, CORE_SECTION};
use crate::error::{ConfigError, ConfigResult};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

pub const CONFIG_FILE: &str = "configuration.yaml";
pub const SECRETS_FILE: &str = "secrets.yaml";

const DEFAULT_CONFIG: &str = "\
openpeerpower:
  name: Home
  latitude: 0.0
  longitude: 0.0
  elevation: 0
  unit_system: metric
  time_zone: UTC
";

/// YAML loader bound to a config directory
#[derive(Debug)]
pub struct YamlLoader {
    config_dir: PathBuf,
    secrets: Option<HashMap<String, Value>>,
    include_stack: Vec<PathBuf>,
}

impl YamlLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            secrets: None,
            include_stack: Vec::new(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Load a file, relative paths resolving against the config directory
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> ConfigResult<Value> {
        let path = self.config_dir.join(path.as_ref());
        self.read(path)
    }

    fn read(&mut self, path: PathBuf) -> ConfigResult<Value> {
        debug!("Loading YAML file: {:?}", path);

        if self.include_stack.contains(&path) {
            return Err(ConfigError::CircularInclude { path });
        }
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;

        self.include_stack.push(path.clone());
        let result = self.load_str(&content, &path);
        self.include_stack.pop();
        result
    }

    /// Parse YAML text that claims to come from `source`
    pub fn load_str(&mut self, content: &str, source: &Path) -> ConfigResult<Value> {
        let value: Value = serde_yaml::from_str(content).map_err(|e| ConfigError::ParseYaml {
            path: source.to_path_buf(),
            source: e,
        })?;
        self.resolve(value, source)
    }

    fn resolve(&mut self, value: Value, source: &Path) -> ConfigResult<Value> {
        match value {
            Value::Tagged(tagged) => {
                let tag = tagged.tag.to_string();
                trace!("Resolving tag {}", tag);
                match tag.as_str() {
                    "!include" => {
                        let target = tag_argument(&tag, &tagged.value)?;
                        let base = source.parent().unwrap_or(&self.config_dir);
                        let path = base.join(target);
                        self.read(path)
                    }
                    "!secret" => {
                        let key = tag_argument(&tag, &tagged.value)?.to_string();
                        self.secret(&key)
                    }
                    _ => {
                        warn!("Unknown YAML tag {}, keeping value", tag);
                        self.resolve(tagged.value, source)
                    }
                }
            }
            Value::Mapping(map) => {
                let mut resolved = serde_yaml::Mapping::with_capacity(map.len());
                for (key, value) in map {
                    resolved.insert(key, self.resolve(value, source)?);
                }
                Ok(Value::Mapping(resolved))
            }
            Value::Sequence(seq) => seq
                .into_iter()
                .map(|v| self.resolve(v, source))
                .collect::<ConfigResult<Vec<_>>>()
                .map(Value::Sequence),
            other => Ok(other),
        }
    }

    fn secret(&mut self, key: &str) -> ConfigResult<Value> {
        if self.secrets.is_none() {
            self.secrets = Some(self.read_secrets()?);
        }
        self.secrets
            .as_ref()
            .and_then(|secrets| secrets.get(key))
            .cloned()
            .ok_or_else(|| ConfigError::SecretNotFound {
                key: key.to_string(),
            })
    }

    fn read_secrets(&self) -> ConfigResult<HashMap<String, Value>> {
        let path = self.config_dir.join(SECRETS_FILE);
        if !path.exists() {
            debug!("No {} in {:?}", SECRETS_FILE, self.config_dir);
            return Ok(HashMap::new());
        }
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;
        let secrets: Option<HashMap<String, Value>> = serde_yaml::from_str(&content)
            .map_err(|source| ConfigError::ParseYaml { path, source })?;
        Ok(secrets.unwrap_or_default())
    }
}

fn tag_argument<'a>(tag: &str, value: &'a Value) -> ConfigResult<&'a str> {
    value
        .as_str()
        .ok_or_else(|| ConfigError::invalid(tag, "argument must be a string"))
}

/// A loaded configuration: the core section plus one section per
/// integration domain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    pub core: CoreConfig,
    pub integrations: BTreeMap<String, serde_json::Value>,
}

impl Configuration {
    /// Load `configuration.yaml` from `config_dir`
    pub fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let mut loader = YamlLoader::new(config_dir.as_ref());
        let root = loader.load_file(CONFIG_FILE)?;
        Self::from_value(root)
    }

    /// Parse configuration text with no config directory behind it
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let mut loader = YamlLoader::new(".");
        let root = loader.load_str(content, Path::new(CONFIG_FILE))?;
        Self::from_value(root)
    }

    /// Split a resolved YAML document into core and integration sections
    ///
    /// Integration sections are not validated here; each integration
    /// validates its own.
    pub fn from_value(root: Value) -> ConfigResult<Self> {
        let map = match root {
            Value::Null => return Ok(Self::default()),
            Value::Mapping(map) => map,
            _ => return Err(ConfigError::invalid("<root>", "configuration must be a mapping")),
        };

        let mut core = None;
        let mut integrations = BTreeMap::new();
        for (key, section) in map {
            let key = key
                .as_str()
                .ok_or_else(|| ConfigError::invalid("<root>", "keys must be strings"))?
                .to_string();
            if key == CORE_SECTION {
                core = Some(section);
                continue;
            }
            let json = serde_json::to_value(&section).map_err(|e| ConfigError::invalid(&key, e))?;
            integrations.insert(key, json);
        }

        Ok(Self {
            core: CoreConfig::from_yaml(core.as_ref())?,
            integrations,
        })
    }

    /// Configured integration domains, in name order
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.integrations.keys().map(String::as_str)
    }

    /// Section of one integration; `Null` when the domain is configured
    /// with no options
    pub fn integration(&self, domain: &str) -> Option<&serde_json::Value> {
        self.integrations.get(domain)
    }
}

/// Make sure `config_dir` exists, is a directory and is writable, creating
/// it and a default `configuration.yaml` when missing
pub fn ensure_config_dir(config_dir: impl AsRef<Path>) -> ConfigResult<PathBuf> {
    let dir = config_dir.as_ref();
    let unusable = |reason: String| ConfigError::ConfigDir {
        path: dir.to_path_buf(),
        reason,
    };

    if !dir.exists() {
        info!("Creating config directory {:?}", dir);
        fs::create_dir_all(dir).map_err(|e| unusable(e.to_string()))?;
    }
    if !dir.is_dir() {
        return Err(unusable("not a directory".to_string()));
    }
    let metadata = fs::metadata(dir).map_err(|e| unusable(e.to_string()))?;
    if metadata.permissions().readonly() {
        return Err(unusable("not writable".to_string()));
    }

    let config_file = dir.join(CONFIG_FILE);
    if !config_file.exists() {
        info!("Writing default {} to {:?}", CONFIG_FILE, dir);
        fs::write(&config_file, DEFAULT_CONFIG).map_err(|e| unusable(e.to_string()))?;
    }

    Ok(dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_load_core_and_integrations() {
        let dir = TempDir::new().unwrap();
        write_file(
            dir.path(),
            CONFIG_FILE,
            r#"
openpeerpower:
  name: Cottage
  time_zone: Europe/Amsterdam
demo_light:
  lights: 3
sun:
"#,
        );

        let config = Configuration::load(dir.path()).unwrap();
        assert_eq!(config.core.name, "Cottage");
        assert_eq!(config.core.time_zone, chrono_tz::Europe::Amsterdam);
        assert_eq!(config.domains().collect::<Vec<_>>(), vec!["demo_light", "sun"]);
        assert_eq!(config.integration("demo_light").unwrap()["lights"], 3);
        assert_eq!(config.integration("sun"), Some(&serde_json::Value::Null));
        assert_eq!(config.integration("missing"), None);
    }

    #[test]
    fn test_include_and_secret() {
        let dir = TempDir::new().unwrap();
        write_file(
            dir.path(),
            CONFIG_FILE,
            "openpeerpower: !include core/core.yaml\nnotify:\n  token: !secret notify_token\n",
        );
        write_file(dir.path(), "core/core.yaml", "name: !include name.yaml\n");
        write_file(dir.path(), "core/name.yaml", "Included\n");
        write_file(dir.path(), SECRETS_FILE, "notify_token: abc123\n");

        let config = Configuration::load(dir.path()).unwrap();
        assert_eq!(config.core.name, "Included");
        assert_eq!(config.integration("notify").unwrap()["token"], "abc123");
    }

    #[test]
    fn test_missing_secret() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), CONFIG_FILE, "api:\n  password: !secret nope\n");
        assert!(matches!(
            Configuration::load(dir.path()),
            Err(ConfigError::SecretNotFound { key }) if key == "nope"
        ));
    }

    #[test]
    fn test_circular_include() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), CONFIG_FILE, "a: !include a.yaml\n");
        write_file(dir.path(), "a.yaml", "b: !include configuration.yaml\n");
        assert!(matches!(
            Configuration::load(dir.path()),
            Err(ConfigError::CircularInclude { .. })
        ));
    }

    #[test]
    fn test_bad_yaml_and_shape() {
        assert!(matches!(
            Configuration::from_yaml_str("openpeerpower: [unclosed"),
            Err(ConfigError::ParseYaml { .. })
        ));
        assert!(matches!(
            Configuration::from_yaml_str("- just\n- a list\n"),
            Err(ConfigError::InvalidConfiguration { .. })
        ));
        assert_eq!(Configuration::from_yaml_str("").unwrap(), Configuration::default());
    }

    #[test]
    fn test_ensure_config_dir_creates_default() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("nested").join("config");

        let created = ensure_config_dir(&dir).unwrap();
        assert!(created.join(CONFIG_FILE).exists());

        let config = Configuration::load(&created).unwrap();
        assert_eq!(config.core, CoreConfig::default());
        assert!(config.integrations.is_empty());

        // existing file is left alone
        write_file(&dir, CONFIG_FILE, "openpeerpower:\n  name: Kept\n");
        ensure_config_dir(&dir).unwrap();
        assert_eq!(Configuration::load(&dir).unwrap().core.name, "Kept");
    }

    #[test]
    fn test_config_dir_must_be_directory() {
        let root = TempDir::new().unwrap();
        let file = root.path().join("file");
        fs::write(&file, "").unwrap();
        assert!(matches!(
            ensure_config_dir(&file),
            Err(ConfigError::ConfigDir { .. })
        ));
    }
}
