//! Configuration module with TOML parsing and validation
//!
//! All runtime behavior is externalized - listeners, processors, admission
//! filters, and defense toggles all come from the TOML file. Unknown keys are
//! tolerated so configs can carry forward-compatible sections.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Global settings shared by all listeners
    #[serde(default)]
    pub global: GlobalConfig,
    /// Listener definitions
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Copy buffer size in bytes for the splice loops
    pub buffer_size: usize,
    /// Log level: debug, info, warn, error
    pub log_level: String,
    /// GeoIP admission filter
    pub geoip: GeoIpConfig,
    /// Local-time admission window
    pub time_window: TimeWindowConfig,
    /// VShell defense engine
    pub defense: DefenseConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            buffer_size: 32 * 1024,
            log_level: "info".to_string(),
            geoip: GeoIpConfig::default(),
            time_window: TimeWindowConfig::default(),
            defense: DefenseConfig::default(),
        }
    }
}

/// GeoIP filter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoIpConfig {
    /// Enable GeoIP checking
    pub enabled: bool,
    /// Path to a GeoLite2-Country database
    pub db_path: Option<PathBuf>,
    /// Regions to block: ISO country codes, continent codes, or "EU"
    pub block_regions: Vec<String>,
}

/// Time-window filter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeWindowConfig {
    /// Enable time-window filtering
    pub enabled: bool,
    /// IANA timezone, e.g. "UTC" or "Asia/Shanghai"
    pub timezone: String,
    /// Window start, "HH:MM"
    pub start_time: String,
    /// Window end, "HH:MM"
    pub end_time: String,
}

impl Default for TimeWindowConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timezone: "UTC".to_string(),
            start_time: "00:00".to_string(),
            end_time: "00:00".to_string(),
        }
    }
}

/// VShell defense engine configuration
///
/// Each detector is independently toggleable; a disabled detector is skipped
/// without affecting the others.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefenseConfig {
    /// Enable the defense engine
    pub enabled: bool,
    /// Block VShell-shaped WebSocket upgrade requests
    pub block_websocket_upgrade: bool,
    /// Block requests to known C2 path prefixes
    pub block_suspicious_paths: bool,
    /// Block VShell version handshake payloads
    pub block_version_handshake: bool,
    /// Block VShell command-token payloads
    pub block_command_patterns: bool,
    /// Block VShell encrypted-frame payloads
    pub block_encrypted_payloads: bool,
    /// Block vkey hash handshake payloads
    pub block_vkey_patterns: bool,
    /// Extra path prefixes to treat as suspicious
    pub custom_block_paths: Vec<String>,
    /// Known-bad vkeys, literal or MD5 hex
    pub blocked_vkeys: Vec<String>,
}

impl Default for DefenseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            block_websocket_upgrade: true,
            block_suspicious_paths: true,
            block_version_handshake: true,
            block_command_patterns: true,
            block_encrypted_payloads: true,
            block_vkey_patterns: true,
            custom_block_paths: Vec::new(),
            blocked_vkeys: Vec::new(),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Listener name, unique across the config
    pub name: String,
    /// TCP port to listen on, unique across the config
    pub listen_port: u16,
    /// Backend address (host:port)
    pub backend_addr: String,
    /// Transport protocol; only "tcp" is supported
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Per-connection timeouts
    #[serde(default)]
    pub timeout: TimeoutConfig,
    /// HTTP processor chain
    #[serde(default)]
    pub http: HttpProcessorConfig,
    /// TCP processor chain (only the first entry is evaluated)
    #[serde(default)]
    pub tcp: TcpProcessorConfig,
    /// Legacy route rules, folded into `http.processors` at load time
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Per-connection timeout configuration (seconds)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Enable timeouts
    pub enabled: bool,
    /// Deadline for the initial client read
    pub initial_read: u64,
    /// Deadline for the backend dial
    pub connect_backend: u64,
}

/// HTTP processor chain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpProcessorConfig {
    #[serde(default, rename = "processor")]
    pub processors: Vec<Processor>,
}

/// TCP processor chain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TcpProcessorConfig {
    #[serde(default, rename = "processor")]
    pub processors: Vec<Processor>,
}

/// A processor rule: path match condition plus action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Processor {
    /// Path pattern(s); absent means match-all
    pub path: Option<PathSpec>,
    /// Matching mode for the path patterns
    #[serde(default)]
    pub match_mode: MatchMode,
    /// Action to execute on match
    pub action: Action,
    /// Canned response for `drop` (default "404"; "close" writes nothing)
    pub response: Option<DropResponse>,
    /// Replacement path prefix for `rewrite`
    pub rewrite_to: Option<String>,
    /// File to serve for `file`
    pub file: Option<PathBuf>,
    /// Proxy target for `proxy`
    pub proxy_to: Option<String>,
}

/// Path field: a single pattern or a list of patterns
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSpec {
    Single(String),
    Many(Vec<String>),
}

impl PathSpec {
    pub fn as_slice(&self) -> &[String] {
        match self {
            PathSpec::Single(s) => std::slice::from_ref(s),
            PathSpec::Many(v) => v.as_slice(),
        }
    }
}

/// Path matching mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Prefix,
    Exact,
    /// Accepted but not implemented; evaluated as prefix
    Regex,
}

/// Processor action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Drop,
    Rewrite,
    File,
    Proxy,
}

/// Canned response selector for the `drop` action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropResponse {
    #[serde(rename = "404")]
    NotFound,
    #[serde(rename = "403")]
    Forbidden,
    #[serde(rename = "502")]
    BadGateway,
    #[serde(rename = "close")]
    Close,
}

/// Legacy route rule, kept for config compatibility only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    pub path: String,
    pub action: Action,
    pub response: Option<DropResponse>,
    pub rewrite_to: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file: read, parse, fold legacy routes,
    /// validate.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {:?}", path))?;

        config.fold_legacy_routes();
        config.validate()?;

        Ok(config)
    }

    /// Fold each listener's legacy `routes` table into its HTTP processor
    /// chain. Explicit processors keep precedence; folded routes are appended
    /// in declaration order. Only one evaluation path exists at runtime.
    pub fn fold_legacy_routes(&mut self) {
        for listener in &mut self.listeners {
            for route in listener.routes.drain(..) {
                listener.http.processors.push(Processor {
                    path: Some(PathSpec::Single(route.path)),
                    match_mode: MatchMode::Prefix,
                    action: route.action,
                    response: route.response,
                    rewrite_to: route.rewrite_to,
                    file: None,
                    proxy_to: None,
                });
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.global.buffer_size == 0 {
            return Err(anyhow!("global.buffer_size must be positive"));
        }

        match self.global.log_level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(anyhow!(
                    "global.log_level must be one of: debug, info, warn, error (got '{}')",
                    other
                ));
            }
        }

        if self.global.geoip.enabled {
            if self.global.geoip.db_path.is_none() {
                return Err(anyhow!(
                    "global.geoip.db_path is required when geoip is enabled"
                ));
            }
            if self.global.geoip.block_regions.is_empty() {
                return Err(anyhow!(
                    "global.geoip.block_regions must contain at least one region when geoip is enabled"
                ));
            }
        }

        if self.global.time_window.enabled {
            self.global
                .time_window
                .validate()
                .context("global.time_window")?;
        }

        if self.listeners.is_empty() {
            return Err(anyhow!("at least one listener must be configured"));
        }

        let mut names = std::collections::HashSet::new();
        let mut ports = std::collections::HashSet::new();

        for (i, listener) in self.listeners.iter().enumerate() {
            if listener.name.is_empty() {
                return Err(anyhow!("listener[{}]: name is required", i));
            }
            if !names.insert(listener.name.as_str()) {
                return Err(anyhow!("listener[{}]: duplicate name '{}'", i, listener.name));
            }

            if !ports.insert(listener.listen_port) {
                return Err(anyhow!(
                    "listener[{}]: duplicate listen_port {}",
                    i,
                    listener.listen_port
                ));
            }

            if listener.backend_addr.is_empty() {
                return Err(anyhow!("listener[{}]: backend_addr is required", i));
            }

            if listener.protocol != "tcp" {
                return Err(anyhow!(
                    "listener[{}]: protocol must be: tcp (got '{}')",
                    i,
                    listener.protocol
                ));
            }

            for (j, proc) in listener.http.processors.iter().enumerate() {
                validate_processor(proc, i, "http", j)?;
            }
            for (j, proc) in listener.tcp.processors.iter().enumerate() {
                validate_processor(proc, i, "tcp", j)?;
            }
        }

        Ok(())
    }
}

fn validate_processor(
    proc: &Processor,
    listener_idx: usize,
    chain: &str,
    proc_idx: usize,
) -> anyhow::Result<()> {
    match proc.action {
        Action::Rewrite => {
            if proc.rewrite_to.as_deref().map_or(true, str::is_empty) {
                return Err(anyhow!(
                    "listener[{}].{}.processor[{}]: rewrite_to is required for rewrite action",
                    listener_idx,
                    chain,
                    proc_idx
                ));
            }
        }
        Action::File => {
            if proc.file.is_none() {
                return Err(anyhow!(
                    "listener[{}].{}.processor[{}]: file is required for file action",
                    listener_idx,
                    chain,
                    proc_idx
                ));
            }
        }
        Action::Proxy => {
            if proc.proxy_to.as_deref().map_or(true, str::is_empty) {
                return Err(anyhow!(
                    "listener[{}].{}.processor[{}]: proxy_to is required for proxy action",
                    listener_idx,
                    chain,
                    proc_idx
                ));
            }
        }
        Action::Allow | Action::Drop => {}
    }

    Ok(())
}

impl TimeWindowConfig {
    /// Validate timezone and time formats
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timezone.is_empty() {
            return Err(anyhow!("timezone is required"));
        }
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| anyhow!("invalid timezone '{}'", self.timezone))?;

        crate::time_window::parse_hhmm(&self.start_time)
            .with_context(|| format!("invalid start_time '{}', expected HH:MM", self.start_time))?;
        crate::time_window::parse_hhmm(&self.end_time)
            .with_context(|| format!("invalid end_time '{}', expected HH:MM", self.end_time))?;

        Ok(())
    }
}

impl Processor {
    /// Path patterns of this processor; empty means match-all
    pub fn paths(&self) -> &[String] {
        self.path.as_ref().map_or(&[], PathSpec::as_slice)
    }

    /// Check whether a request path matches this processor
    pub fn matches(&self, path: &str) -> bool {
        let patterns = self.paths();
        if patterns.is_empty() {
            return true;
        }

        for pattern in patterns {
            let hit = match self.match_mode {
                MatchMode::Exact => path == pattern,
                // Regex mode is accepted by the config but evaluated as prefix
                MatchMode::Prefix | MatchMode::Regex => path.starts_with(pattern.as_str()),
            };
            if hit {
                return true;
            }
        }
        false
    }
}

impl ListenerConfig {
    /// First HTTP processor whose path condition matches, in declaration order
    pub fn match_http_processor(&self, path: &str) -> Option<&Processor> {
        self.http.processors.iter().find(|p| p.matches(path))
    }

    /// The TCP chain evaluates only its first processor
    pub fn tcp_processor(&self) -> Option<&Processor> {
        self.tcp.processors.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_listener() -> &'static str {
        r#"
[[listeners]]
name = "web"
listen_port = 8880
backend_addr = "127.0.0.1:9991"
"#
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str(minimal_listener()).unwrap();
        assert_eq!(config.global.buffer_size, 32 * 1024);
        assert_eq!(config.global.log_level, "info");
        assert!(!config.global.geoip.enabled);
        assert!(!config.global.time_window.enabled);
        assert!(config.global.defense.enabled);
        assert_eq!(config.listeners[0].protocol, "tcp");
        assert!(!config.listeners[0].timeout.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_path_as_string_or_array() {
        let toml_content = r#"
[[listeners]]
name = "web"
listen_port = 8880
backend_addr = "127.0.0.1:9991"

[[listeners.http.processor]]
path = "/slt"
action = "drop"
response = "404"

[[listeners.http.processor]]
path = ["/api", "/v2"]
action = "allow"
"#;
        let config: Config = toml::from_str(toml_content).unwrap();
        let procs = &config.listeners[0].http.processors;
        assert_eq!(procs[0].paths(), ["/slt"]);
        assert_eq!(procs[1].paths(), ["/api", "/v2"]);
        config.validate().unwrap();
    }

    #[test]
    fn test_first_match_wins_in_declaration_order() {
        let toml_content = r#"
[[listeners]]
name = "web"
listen_port = 8880
backend_addr = "127.0.0.1:9991"

[[listeners.http.processor]]
path = "/api/admin"
action = "drop"
response = "403"

[[listeners.http.processor]]
path = "/api"
action = "allow"

[[listeners.http.processor]]
action = "drop"
response = "close"
"#;
        let config: Config = toml::from_str(toml_content).unwrap();
        let listener = &config.listeners[0];

        let p = listener.match_http_processor("/api/admin/users").unwrap();
        assert_eq!(p.action, Action::Drop);
        assert_eq!(p.response, Some(DropResponse::Forbidden));

        let p = listener.match_http_processor("/api/x").unwrap();
        assert_eq!(p.action, Action::Allow);

        // No-path processor matches everything else
        let p = listener.match_http_processor("/other").unwrap();
        assert_eq!(p.response, Some(DropResponse::Close));
    }

    #[test]
    fn test_match_modes() {
        let exact = Processor {
            path: Some(PathSpec::Single("/status".into())),
            match_mode: MatchMode::Exact,
            action: Action::Allow,
            response: None,
            rewrite_to: None,
            file: None,
            proxy_to: None,
        };
        assert!(exact.matches("/status"));
        assert!(!exact.matches("/status/x"));

        let mut prefix = exact.clone();
        prefix.match_mode = MatchMode::Prefix;
        assert!(prefix.matches("/status/x"));

        // Regex mode degrades to prefix
        let mut regex = exact;
        regex.match_mode = MatchMode::Regex;
        assert!(regex.matches("/status/x"));
        assert!(!regex.matches("/other"));
    }

    #[test]
    fn test_duplicate_names_and_ports_rejected() {
        let dup_name = r#"
[[listeners]]
name = "web"
listen_port = 8880
backend_addr = "127.0.0.1:9991"

[[listeners]]
name = "web"
listen_port = 8881
backend_addr = "127.0.0.1:9992"
"#;
        let config: Config = toml::from_str(dup_name).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate name"), "{err}");

        let dup_port = r#"
[[listeners]]
name = "a"
listen_port = 8880
backend_addr = "127.0.0.1:9991"

[[listeners]]
name = "b"
listen_port = 8880
backend_addr = "127.0.0.1:9992"
"#;
        let config: Config = toml::from_str(dup_port).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate listen_port"), "{err}");
    }

    #[test]
    fn test_action_required_fields() {
        let missing_rewrite = r#"
[[listeners]]
name = "web"
listen_port = 8880
backend_addr = "127.0.0.1:9991"

[[listeners.http.processor]]
path = "/old"
action = "rewrite"
"#;
        let config: Config = toml::from_str(missing_rewrite).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("rewrite_to is required"), "{err}");

        let missing_file = r#"
[[listeners]]
name = "web"
listen_port = 8880
backend_addr = "127.0.0.1:9991"

[[listeners.tcp.processor]]
action = "file"
"#;
        let config: Config = toml::from_str(missing_file).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("file is required"), "{err}");
    }

    #[test]
    fn test_geoip_requires_db_and_regions() {
        let toml_content = r#"
[global.geoip]
enabled = true

[[listeners]]
name = "web"
listen_port = 8880
backend_addr = "127.0.0.1:9991"
"#;
        let config: Config = toml::from_str(toml_content).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("db_path is required"), "{err}");
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let toml_content = r#"
[global]
log_level = "verbose"

[[listeners]]
name = "web"
listen_port = 8880
backend_addr = "127.0.0.1:9991"
"#;
        let config: Config = toml::from_str(toml_content).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_legacy_routes_folded_after_processors() {
        let toml_content = r#"
[[listeners]]
name = "web"
listen_port = 8880
backend_addr = "127.0.0.1:9991"

[[listeners.http.processor]]
path = "/keep"
action = "allow"

[[listeners.routes]]
path = "/slt"
action = "drop"
response = "404"
"#;
        let mut config: Config = toml::from_str(toml_content).unwrap();
        config.fold_legacy_routes();
        config.validate().unwrap();

        let listener = &config.listeners[0];
        assert!(listener.routes.is_empty());
        assert_eq!(listener.http.processors.len(), 2);

        let folded = listener.match_http_processor("/slt/x").unwrap();
        assert_eq!(folded.action, Action::Drop);
        assert_eq!(folded.response, Some(DropResponse::NotFound));
    }

    #[test]
    fn test_unknown_keys_tolerated() {
        let toml_content = r#"
[global]
future_knob = true

[[listeners]]
name = "web"
listen_port = 8880
backend_addr = "127.0.0.1:9991"
shiny = "yes"
"#;
        let config: Config = toml::from_str(toml_content).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_time_window_validation() {
        let bad_tz = TimeWindowConfig {
            enabled: true,
            timezone: "Mars/Olympus".into(),
            start_time: "09:00".into(),
            end_time: "17:00".into(),
        };
        assert!(bad_tz.validate().is_err());

        let bad_time = TimeWindowConfig {
            enabled: true,
            timezone: "UTC".into(),
            start_time: "9am".into(),
            end_time: "17:00".into(),
        };
        assert!(bad_time.validate().is_err());

        let good = TimeWindowConfig {
            enabled: true,
            timezone: "Asia/Shanghai".into(),
            start_time: "23:00".into(),
            end_time: "02:00".into(),
        };
        good.validate().unwrap();
    }
}
