use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::env;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "failed to read config at {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(
                    f,
                    "failed to parse config at {}: {}",
                    path.display(),
                    source
                )
            }
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Merged view of the packaged default, user-global and project-local
/// configuration documents. Later documents override earlier ones; any key
/// can additionally be overridden through an `ATOM_*` environment variable.
#[derive(Debug, Clone)]
pub struct Config {
    merged: Value,
}

impl Config {
    pub fn load(project_dir: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = Value::Mapping(Mapping::new());
        // Merge precedence: default < global < project (later overrides earlier).
        for path in config_paths(project_dir) {
            let value = read_yaml(&path)?;
            merged = merge_values(merged, value);
        }
        Ok(Self { merged })
    }

    /// Empty configuration, used when no documents should be consulted.
    pub fn empty() -> Self {
        Self {
            merged: Value::Mapping(Mapping::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let normalized = normalize_key(key)?;
        if let Some(value) = env_override(&normalized) {
            return Some(value);
        }
        lookup_value(&self.merged, &normalized).and_then(value_to_string)
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|value| value.trim().parse().ok())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key)
            .and_then(|value| match value.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            })
    }

    pub fn list(&self) -> Vec<(String, String)> {
        let mut entries: BTreeMap<String, String> = BTreeMap::new();
        flatten_value("", &self.merged, &mut entries);
        entries.into_iter().collect()
    }
}

/// User-scope root: `$ATOM_HOME`, else `~/.atom`.
pub fn atom_home() -> PathBuf {
    if let Ok(path) = env::var("ATOM_HOME") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".atom"))
        .unwrap_or_else(|| PathBuf::from(".atom"))
}

fn config_paths(project_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    let default_path = default_config_path();
    if default_path.exists() {
        paths.push(default_path);
    }

    let global_path = global_config_path();
    if global_path.exists() {
        paths.push(global_path);
    }

    if let Some(project_dir) = project_dir {
        if project_dir.is_dir() {
            let project_name =
                env::var("ATOM_PROJECT_CONFIG_NAME").unwrap_or_else(|_| ".atom.yaml".to_string());
            let project_path = project_dir.join(project_name);
            if project_path.exists() {
                paths.push(project_path);
            }
        }
    }

    paths
}

fn default_config_path() -> PathBuf {
    if let Ok(path) = env::var("ATOM_DEFAULT_CONFIG") {
        return PathBuf::from(path);
    }

    let installed_default = atom_home().join("config").join("default.yaml");
    if installed_default.exists() {
        return installed_default;
    }

    let manifest_default = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("config")
        .join("default.yaml");
    if manifest_default.exists() {
        return manifest_default;
    }

    PathBuf::from("config/default.yaml")
}

fn global_config_path() -> PathBuf {
    if let Ok(path) = env::var("ATOM_GLOBAL_CONFIG") {
        return PathBuf::from(path);
    }
    atom_home().join("config.yaml")
}

fn read_yaml(path: &Path) -> Result<Value, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn merge_values(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(mut base_map), Value::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => merge_values(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            Value::Mapping(base_map)
        }
        (_, overlay_value) => overlay_value,
    }
}

fn lookup_value<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in key.split('.') {
        match current {
            Value::Mapping(map) => {
                current = lookup_mapping_value(map, part)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

fn lookup_mapping_value<'a>(map: &'a Mapping, part: &str) -> Option<&'a Value> {
    let direct = Value::String(part.to_string());
    if let Some(value) = map.get(&direct) {
        return Some(value);
    }
    for (key, value) in map {
        let Some(text) = key.as_str() else {
            continue;
        };
        if normalize_segment(text) == part {
            return Some(value);
        }
    }
    None
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Null => Some(String::new()),
        Value::Sequence(values) => {
            let mut rendered = Vec::new();
            for item in values {
                rendered.push(value_to_string(item).unwrap_or_default());
            }
            Some(rendered.join(","))
        }
        Value::Mapping(_) => None,
        Value::Tagged(tagged) => value_to_string(&tagged.value),
    }
}

fn flatten_value(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Mapping(map) => {
            for (key, value) in map {
                let key = match key.as_str() {
                    Some(text) => text,
                    None => continue,
                };
                let next_prefix = if prefix.is_empty() {
                    key.to_string()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_value(&next_prefix, value, out);
            }
        }
        _ => {
            if let Some(rendered) = value_to_string(value) {
                if !prefix.is_empty() {
                    out.insert(prefix.to_string(), rendered);
                }
            }
        }
    }
}

fn env_override(key: &str) -> Option<String> {
    let env_key = format!("ATOM_{}", key_to_env(key));
    env::var(env_key).ok()
}

fn key_to_env(key: &str) -> String {
    key.chars()
        .map(|ch| match ch {
            '.' | '-' => '_',
            _ => ch.to_ascii_uppercase(),
        })
        .collect()
}

fn normalize_key(key: &str) -> Option<String> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return None;
    }
    let normalized = trimmed
        .split('.')
        .map(normalize_segment)
        .collect::<Vec<_>>()
        .join(".");
    Some(normalized)
}

fn normalize_segment(segment: &str) -> String {
    segment
        .trim()
        .chars()
        .map(|ch| match ch {
            '-' => '_',
            _ => ch.to_ascii_lowercase(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn env_guard() -> std::sync::MutexGuard<'static, ()> {
        crate::test_support::env_lock()
    }

    fn set_env(key: &str, value: impl AsRef<std::ffi::OsStr>) {
        unsafe {
            env::set_var(key, value);
        }
    }

    fn remove_env(key: &str) {
        unsafe {
            env::remove_var(key);
        }
    }

    fn clear_overrides() {
        for key in [
            "ATOM_DEFAULT_CONFIG",
            "ATOM_GLOBAL_CONFIG",
            "ATOM_PROJECT_CONFIG_NAME",
            "ATOM_HOME",
            "ATOM_AGENT_COMMAND",
            "ATOM_DEFAULTS_MAX_ITERATIONS",
        ] {
            remove_env(key);
        }
    }

    #[test]
    fn load_merges_default_global_and_project() {
        let _guard = env_guard();
        clear_overrides();
        let temp = tempfile::tempdir().unwrap();
        let default_path = temp.path().join("default.yaml");
        let global_path = temp.path().join("global.yaml");
        let project_dir = temp.path().join("project");
        fs::create_dir_all(&project_dir).unwrap();

        fs::write(
            &default_path,
            "defaults:\n  max_iterations: 25\n  exit_signal: EXIT_LOOP_NOW\n",
        )
        .unwrap();
        fs::write(&global_path, "defaults:\n  max_iterations: 10\n").unwrap();
        fs::write(
            project_dir.join(".atom.yaml"),
            "defaults:\n  exit_signal: ALL_DONE\n",
        )
        .unwrap();

        set_env("ATOM_DEFAULT_CONFIG", &default_path);
        set_env("ATOM_GLOBAL_CONFIG", &global_path);

        let config = Config::load(Some(&project_dir)).unwrap();
        assert_eq!(config.get_u64("defaults.max_iterations"), Some(10));
        assert_eq!(config.get("defaults.exit_signal").as_deref(), Some("ALL_DONE"));

        clear_overrides();
    }

    #[test]
    fn env_override_beats_files() {
        let _guard = env_guard();
        clear_overrides();
        let temp = tempfile::tempdir().unwrap();
        let default_path = temp.path().join("default.yaml");
        fs::write(&default_path, "defaults:\n  max_iterations: 25\n").unwrap();
        set_env("ATOM_DEFAULT_CONFIG", &default_path);
        set_env("ATOM_GLOBAL_CONFIG", temp.path().join("missing.yaml"));
        set_env("ATOM_DEFAULTS_MAX_ITERATIONS", "3");

        let config = Config::load(None).unwrap();
        assert_eq!(config.get_u64("defaults.max_iterations"), Some(3));

        clear_overrides();
    }

    #[test]
    fn get_renders_sequences_and_scalars() {
        let _guard = env_guard();
        clear_overrides();
        let temp = tempfile::tempdir().unwrap();
        let default_path = temp.path().join("default.yaml");
        fs::write(
            &default_path,
            "retry:\n  network_keywords:\n    - network\n    - timeout\n  enabled: true\n",
        )
        .unwrap();
        set_env("ATOM_DEFAULT_CONFIG", &default_path);
        set_env("ATOM_GLOBAL_CONFIG", temp.path().join("missing.yaml"));

        let config = Config::load(None).unwrap();
        assert_eq!(
            config.get("retry.network_keywords").as_deref(),
            Some("network,timeout")
        );
        assert_eq!(config.get_bool("retry.enabled"), Some(true));
        assert!(config.get("retry.missing").is_none());

        clear_overrides();
    }

    #[test]
    fn lookup_is_case_and_hyphen_insensitive() {
        let _guard = env_guard();
        clear_overrides();
        let temp = tempfile::tempdir().unwrap();
        let default_path = temp.path().join("default.yaml");
        fs::write(&default_path, "Agent:\n  Command: claude\n").unwrap();
        set_env("ATOM_DEFAULT_CONFIG", &default_path);
        set_env("ATOM_GLOBAL_CONFIG", temp.path().join("missing.yaml"));

        let config = Config::load(None).unwrap();
        assert_eq!(config.get("agent.command").as_deref(), Some("claude"));

        clear_overrides();
    }

    #[test]
    fn list_flattens_dotted_keys() {
        let _guard = env_guard();
        clear_overrides();
        let temp = tempfile::tempdir().unwrap();
        let default_path = temp.path().join("default.yaml");
        fs::write(
            &default_path,
            "defaults:\n  exit_signal: EXIT_LOOP_NOW\nagent:\n  command: claude\n",
        )
        .unwrap();
        set_env("ATOM_DEFAULT_CONFIG", &default_path);
        set_env("ATOM_GLOBAL_CONFIG", temp.path().join("missing.yaml"));

        let config = Config::load(None).unwrap();
        let entries = config.list();
        assert!(entries.contains(&("agent.command".to_string(), "claude".to_string())));
        assert!(entries.contains(&(
            "defaults.exit_signal".to_string(),
            "EXIT_LOOP_NOW".to_string()
        )));

        clear_overrides();
    }

    #[test]
    fn atom_home_prefers_env() {
        let _guard = env_guard();
        clear_overrides();
        set_env("ATOM_HOME", "/tmp/atom-home-test");
        assert_eq!(atom_home(), PathBuf::from("/tmp/atom-home-test"));
        clear_overrides();
    }
}
