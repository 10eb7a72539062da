use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default config file template with comments, used by `config init`.
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# agentchrome configuration file

# Chrome launch defaults
# [launch]
# executable = "/path/to/chrome"
# channel = "stable"        # stable, beta, dev, canary
# headless = false
# extra_args = ["--disable-gpu"]

# Browser automation tuning (load synchronizer, serializer)
# [browser]
# idle_threshold_ms = 500
# load_timeout_ms = 15000
# dom_timeout_ms = 30000
# poll_interval_ms = 100
# max_lines = 500
"#;

// ---------------------------------------------------------------------------
// Config structs (parsed from TOML)
// ---------------------------------------------------------------------------

/// Represents the parsed TOML config file. All fields optional.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigFile {
    pub launch: LaunchConfig,
    pub browser: BrowserTuningConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub executable: Option<String>,
    pub channel: Option<String>,
    pub headless: Option<bool>,
    pub extra_args: Option<Vec<String>>,
}

/// Tuning knobs for the load synchronizer (C5) and serializer (C9), exposed
/// so callers can adjust timeouts/output size without touching code.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrowserTuningConfig {
    pub idle_threshold_ms: Option<u64>,
    pub load_timeout_ms: Option<u64>,
    pub dom_timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub max_lines: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved config (all defaults filled in)
// ---------------------------------------------------------------------------

/// Fully resolved configuration with all defaults filled in.
#[derive(Debug, Serialize)]
pub struct ResolvedConfig {
    pub config_path: Option<PathBuf>,
    pub launch: ResolvedLaunch,
    pub browser: ResolvedBrowserTuning,
}

#[derive(Debug, Serialize)]
pub struct ResolvedLaunch {
    pub executable: Option<String>,
    pub channel: String,
    pub headless: bool,
    pub extra_args: Vec<String>,
}

/// Fully resolved browser tuning, with the same defaults
/// [`crate::load_sync::LoadSyncConfig`] and [`crate::serializer`] use on
/// their own when no config file overrides them.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedBrowserTuning {
    pub idle_threshold_ms: u64,
    pub load_timeout_ms: u64,
    pub dom_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub max_lines: usize,
}

impl ResolvedBrowserTuning {
    /// Build the [`crate::load_sync::LoadSyncConfig`] this resolved config
    /// describes, for callers that load tuning from a file and feed it
    /// straight into [`crate::browser::BrowserConfig`].
    #[must_use]
    pub fn to_load_sync_config(&self) -> crate::load_sync::LoadSyncConfig {
        crate::load_sync::LoadSyncConfig {
            idle_threshold: std::time::Duration::from_millis(self.idle_threshold_ms),
            poll_interval: std::time::Duration::from_millis(self.poll_interval_ms),
            overall_timeout: std::time::Duration::from_millis(self.load_timeout_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    /// I/O error reading/writing config file.
    Io(std::io::Error),
    /// Config file already exists (for `config init`).
    AlreadyExists(PathBuf),
    /// Could not determine config directory.
    NoConfigDir,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config file error: {e}"),
            Self::AlreadyExists(p) => {
                write!(f, "Config file already exists: {}", p.display())
            }
            Self::NoConfigDir => write!(f, "could not determine config directory"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ConfigError> for crate::error::AppError {
    fn from(e: ConfigError) -> Self {
        use crate::error::ExitCode;
        Self {
            message: e.to_string(),
            code: ExitCode::GeneralError,
            custom_json: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Config file search
// ---------------------------------------------------------------------------

/// Find the first config file that exists, checking locations in priority order.
///
/// Search order:
/// 1. `explicit_path` (from `--config` flag)
/// 2. `$AGENTCHROME_CONFIG` environment variable
/// 3. `./.agentchrome.toml` (project-local)
/// 4. `<config_dir>/agentchrome/config.toml` (XDG / platform config dir)
/// 5. `~/.agentchrome.toml` (home directory fallback)
#[must_use]
pub fn find_config_file(explicit_path: Option<&Path>) -> Option<PathBuf> {
    find_config_file_with(explicit_path, std::env::var("AGENTCHROME_CONFIG").ok())
}

/// Testable variant of [`find_config_file`] that accepts an explicit env value.
#[must_use]
pub fn find_config_file_with(
    explicit_path: Option<&Path>,
    env_config: Option<String>,
) -> Option<PathBuf> {
    // 1. Explicit --config path
    if let Some(p) = explicit_path {
        if p.exists() {
            return Some(p.to_path_buf());
        }
    }

    // 2. $AGENTCHROME_CONFIG
    if let Some(env_path) = env_config {
        let p = PathBuf::from(env_path);
        if p.exists() {
            return Some(p);
        }
    }

    // 3. ./.agentchrome.toml (project-local)
    let local = PathBuf::from(".agentchrome.toml");
    if local.exists() {
        return Some(local);
    }

    // 4. XDG / platform config dir
    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("agentchrome").join("config.toml");
        if xdg.exists() {
            return Some(xdg);
        }
    }

    // 5. ~/.agentchrome.toml
    if let Some(home) = dirs::home_dir() {
        let home_config = home.join(".agentchrome.toml");
        if home_config.exists() {
            return Some(home_config);
        }
    }

    None
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Load and parse a config file. Returns the file path (if found) and the parsed config.
///
/// On parse errors, prints a warning to stderr and returns `ConfigFile::default()`.
#[must_use]
pub fn load_config(explicit_path: Option<&Path>) -> (Option<PathBuf>, ConfigFile) {
    let path = find_config_file(explicit_path);
    match &path {
        Some(p) => {
            let config = load_config_from(p);
            (path, config)
        }
        None => (None, ConfigFile::default()),
    }
}

/// Load and parse a config file from a specific path.
///
/// On parse errors, prints a warning to stderr and returns `ConfigFile::default()`.
#[must_use]
pub fn load_config_from(path: &Path) -> ConfigFile {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!(
                "warning: could not read config file {}: {e}",
                path.display()
            );
            return ConfigFile::default();
        }
    };

    parse_config(&contents, path)
}

/// Parse TOML content into a `ConfigFile`.
///
/// Uses a two-pass strategy: first tries strict parsing (to detect unknown keys),
/// then falls back to lenient parsing if strict fails due to unknown fields.
#[must_use]
pub fn parse_config(contents: &str, path: &Path) -> ConfigFile {
    // First pass: strict (deny_unknown_fields via a wrapper)
    match toml::from_str::<StrictConfigFile>(contents) {
        Ok(strict) => strict.into(),
        Err(strict_err) => {
            // Second pass: lenient
            match toml::from_str::<ConfigFile>(contents) {
                Ok(config) => {
                    // Strict failed but lenient succeeded → unknown keys
                    eprintln!(
                        "warning: unknown keys in config file {}: {strict_err}",
                        path.display()
                    );
                    config
                }
                Err(parse_err) => {
                    // Both failed → invalid TOML
                    eprintln!(
                        "warning: could not parse config file {}: {parse_err}",
                        path.display()
                    );
                    ConfigFile::default()
                }
            }
        }
    }
}

/// Strict variant used for the first-pass parse to detect unknown keys.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictConfigFile {
    #[serde(default)]
    launch: StrictLaunchConfig,
    #[serde(default)]
    browser: StrictBrowserTuningConfig,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictLaunchConfig {
    executable: Option<String>,
    channel: Option<String>,
    headless: Option<bool>,
    extra_args: Option<Vec<String>>,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictBrowserTuningConfig {
    idle_threshold_ms: Option<u64>,
    load_timeout_ms: Option<u64>,
    dom_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    max_lines: Option<usize>,
}

impl From<StrictConfigFile> for ConfigFile {
    fn from(s: StrictConfigFile) -> Self {
        Self {
            launch: LaunchConfig {
                executable: s.launch.executable,
                channel: s.launch.channel,
                headless: s.launch.headless,
                extra_args: s.launch.extra_args,
            },
            browser: BrowserTuningConfig {
                idle_threshold_ms: s.browser.idle_threshold_ms,
                load_timeout_ms: s.browser.load_timeout_ms,
                dom_timeout_ms: s.browser.dom_timeout_ms,
                poll_interval_ms: s.browser.poll_interval_ms,
                max_lines: s.browser.max_lines,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Config resolution
// ---------------------------------------------------------------------------

/// Defaults mirrored from [`crate::load_sync::LoadSyncConfig::default`] and
/// [`crate::serializer::DEFAULT_MAX_LINES`] so the config file and the
/// programmatic defaults never drift apart.
const DEFAULT_IDLE_THRESHOLD_MS: u64 = 500;
const DEFAULT_LOAD_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_DOM_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Resolve a config file into a fully-populated `ResolvedConfig` with all defaults.
#[must_use]
pub fn resolve_config(file: &ConfigFile, config_path: Option<PathBuf>) -> ResolvedConfig {
    ResolvedConfig {
        config_path,
        launch: ResolvedLaunch {
            executable: file.launch.executable.clone(),
            channel: file
                .launch
                .channel
                .clone()
                .unwrap_or_else(|| "stable".to_string()),
            headless: file.launch.headless.unwrap_or(false),
            extra_args: file.launch.extra_args.clone().unwrap_or_default(),
        },
        browser: ResolvedBrowserTuning {
            idle_threshold_ms: file
                .browser
                .idle_threshold_ms
                .unwrap_or(DEFAULT_IDLE_THRESHOLD_MS),
            load_timeout_ms: file.browser.load_timeout_ms.unwrap_or(DEFAULT_LOAD_TIMEOUT_MS),
            dom_timeout_ms: file.browser.dom_timeout_ms.unwrap_or(DEFAULT_DOM_TIMEOUT_MS),
            poll_interval_ms: file
                .browser
                .poll_interval_ms
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            max_lines: file
                .browser
                .max_lines
                .unwrap_or(crate::serializer::DEFAULT_MAX_LINES),
        },
    }
}

// ---------------------------------------------------------------------------
// Config init
// ---------------------------------------------------------------------------

/// Default path for `config init`: `<config_dir>/agentchrome/config.toml`.
///
/// # Errors
///
/// Returns `ConfigError::NoConfigDir` if the platform config directory cannot be determined.
pub fn default_init_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|d| d.join("agentchrome").join("config.toml"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Create a default config file at the given path (or the default XDG path).
///
/// # Errors
///
/// - `ConfigError::AlreadyExists` if the file already exists
/// - `ConfigError::Io` on I/O failure
/// - `ConfigError::NoConfigDir` if no target path and platform config dir unknown
pub fn init_config(target_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let path = match target_path {
        Some(p) => p.to_path_buf(),
        None => default_init_path()?,
    };

    init_config_to(&path)
}

/// Testable variant of [`init_config`] that writes to an explicit path.
///
/// # Errors
///
/// - `ConfigError::AlreadyExists` if the file already exists
/// - `ConfigError::Io` on I/O failure
pub fn init_config_to(path: &Path) -> Result<PathBuf, ConfigError> {
    if path.exists() {
        return Err(ConfigError::AlreadyExists(path.to_path_buf()));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(path.to_path_buf())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_full_config() {
        let toml = r#"
[launch]
executable = "/usr/bin/chromium"
channel = "beta"
headless = true
extra_args = ["--disable-gpu", "--no-sandbox"]
"#;
        let config = parse_config(toml, Path::new("test.toml"));
        assert_eq!(
            config.launch.executable.as_deref(),
            Some("/usr/bin/chromium")
        );
        assert_eq!(config.launch.channel.as_deref(), Some("beta"));
        assert_eq!(config.launch.headless, Some(true));
        assert_eq!(
            config.launch.extra_args.as_deref(),
            Some(&["--disable-gpu".to_string(), "--no-sandbox".to_string()][..])
        );
    }

    #[test]
    fn parse_browser_tuning_table() {
        let toml = r#"
[browser]
idle_threshold_ms = 250
load_timeout_ms = 8000
poll_interval_ms = 50
max_lines = 100
"#;
        let config = parse_config(toml, Path::new("test.toml"));
        assert_eq!(config.browser.idle_threshold_ms, Some(250));
        assert_eq!(config.browser.load_timeout_ms, Some(8000));
        assert_eq!(config.browser.poll_interval_ms, Some(50));
        assert_eq!(config.browser.max_lines, Some(100));

        let resolved = resolve_config(&config, None);
        assert_eq!(resolved.browser.idle_threshold_ms, 250);
        assert_eq!(resolved.browser.load_timeout_ms, 8000);
        assert_eq!(resolved.browser.dom_timeout_ms, DEFAULT_DOM_TIMEOUT_MS);
    }

    #[test]
    fn parse_empty_config() {
        let config = parse_config("", Path::new("test.toml"));
        assert!(config.launch.executable.is_none());
        assert!(config.browser.max_lines.is_none());
    }

    #[test]
    fn parse_partial_config() {
        let toml = "[launch]\nheadless = true\n";
        let config = parse_config(toml, Path::new("test.toml"));
        assert_eq!(config.launch.headless, Some(true));
        assert!(config.launch.executable.is_none());
    }

    #[test]
    fn parse_invalid_toml_returns_default() {
        let config = parse_config("this is not valid toml [[[", Path::new("test.toml"));
        assert!(config.launch.executable.is_none());
    }

    #[test]
    fn parse_unknown_keys_warns_but_keeps_known() {
        let toml = r#"
[launch]
headless = true
unknown_key = "hello"
"#;
        let config = parse_config(toml, Path::new("test.toml"));
        assert_eq!(config.launch.headless, Some(true));
    }

    #[test]
    fn resolve_defaults() {
        let config = ConfigFile::default();
        let resolved = resolve_config(&config, None);
        assert_eq!(resolved.launch.channel, "stable");
        assert!(!resolved.launch.headless);
        assert!(resolved.launch.extra_args.is_empty());
        assert!(resolved.config_path.is_none());
        assert_eq!(resolved.browser.idle_threshold_ms, DEFAULT_IDLE_THRESHOLD_MS);
        assert_eq!(resolved.browser.load_timeout_ms, DEFAULT_LOAD_TIMEOUT_MS);
        assert_eq!(resolved.browser.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(resolved.browser.max_lines, crate::serializer::DEFAULT_MAX_LINES);
    }

    #[test]
    fn resolve_overrides() {
        let config = ConfigFile {
            launch: LaunchConfig {
                executable: Some("/usr/bin/chromium".into()),
                channel: Some("canary".into()),
                headless: Some(true),
                extra_args: Some(vec!["--no-sandbox".into()]),
            },
            browser: BrowserTuningConfig {
                idle_threshold_ms: Some(250),
                load_timeout_ms: Some(5000),
                dom_timeout_ms: Some(10_000),
                poll_interval_ms: Some(50),
                max_lines: Some(100),
            },
        };
        let path = PathBuf::from("/tmp/test.toml");
        let resolved = resolve_config(&config, Some(path.clone()));
        assert_eq!(
            resolved.launch.executable.as_deref(),
            Some("/usr/bin/chromium")
        );
        assert_eq!(resolved.launch.channel, "canary");
        assert!(resolved.launch.headless);
        assert_eq!(resolved.launch.extra_args, vec!["--no-sandbox"]);
        assert_eq!(resolved.config_path, Some(path));
        assert_eq!(resolved.browser.idle_threshold_ms, 250);
        assert_eq!(resolved.browser.load_timeout_ms, 5000);
        assert_eq!(resolved.browser.poll_interval_ms, 50);
        assert_eq!(resolved.browser.max_lines, 100);
    }

    #[test]
    fn init_config_creates_file() {
        let dir = std::env::temp_dir().join("agentchrome-test-config-init");
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("config.toml");

        let result = init_config_to(&path);
        assert!(result.is_ok());
        assert!(path.exists());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[launch]"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn init_config_refuses_overwrite() {
        let dir = std::env::temp_dir().join("agentchrome-test-config-overwrite");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "existing").unwrap();

        let result = init_config_to(&path);
        assert!(matches!(result, Err(ConfigError::AlreadyExists(_))));

        // Verify original content not overwritten
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "existing");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn find_config_with_explicit_path() {
        let dir = std::env::temp_dir().join("agentchrome-test-find-explicit");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("my-config.toml");
        std::fs::write(&path, "").unwrap();

        let found = find_config_file_with(Some(&path), None);
        assert_eq!(found, Some(path.clone()));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn find_config_with_env_var() {
        let dir = std::env::temp_dir().join("agentchrome-test-find-env");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("env-config.toml");
        std::fs::write(&path, "").unwrap();

        let found = find_config_file_with(None, Some(path.to_string_lossy().into_owned()));
        assert_eq!(found, Some(path.clone()));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn find_config_explicit_takes_priority_over_env() {
        let dir = std::env::temp_dir().join("agentchrome-test-find-priority");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let explicit = dir.join("explicit.toml");
        let env = dir.join("env.toml");
        std::fs::write(&explicit, "").unwrap();
        std::fs::write(&env, "").unwrap();

        let found =
            find_config_file_with(Some(&explicit), Some(env.to_string_lossy().into_owned()));
        assert_eq!(found, Some(explicit.clone()));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn find_config_nonexistent_returns_none() {
        let found = find_config_file_with(
            Some(Path::new("/nonexistent/path.toml")),
            Some("/also/nonexistent.toml".into()),
        );
        // May or may not find a config from project-local / home — but explicit and env should fail.
        // We can't guarantee None here due to project-local or home checks, so just verify
        // the explicit and env paths didn't match.
        if let Some(ref p) = found {
            assert_ne!(p, &PathBuf::from("/nonexistent/path.toml"));
            assert_ne!(p, &PathBuf::from("/also/nonexistent.toml"));
        }
    }

    #[test]
    fn load_config_from_nonexistent_returns_default() {
        let config = load_config_from(Path::new("/nonexistent/config.toml"));
        assert!(config.launch.executable.is_none());
    }

    #[test]
    fn config_error_display() {
        assert!(
            ConfigError::NoConfigDir
                .to_string()
                .contains("config directory")
        );

        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(ConfigError::Io(io_err).to_string().contains("denied"));

        let path = PathBuf::from("/tmp/test.toml");
        let msg = ConfigError::AlreadyExists(path).to_string();
        assert!(msg.contains("already exists"));
        assert!(msg.contains("/tmp/test.toml"));
    }

    #[test]
    fn config_serializes_to_json() {
        let config = ConfigFile::default();
        let resolved = resolve_config(&config, None);
        let json = serde_json::to_string(&resolved).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["launch"]["channel"], "stable");
        assert_eq!(parsed["browser"]["max_lines"], crate::serializer::DEFAULT_MAX_LINES);
    }
}
