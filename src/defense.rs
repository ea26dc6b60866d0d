//! VShell defense engine
//!
//! Inspects the initial payload of every connection for seven independent
//! VShell RAT signatures, in a fixed order; the first hit produces a blocking
//! verdict and skips the remaining detectors. Sources that never trip a
//! detector are tracked per IP with a suspicion score so they can be queried
//! out of band.
//!
//! Signature background: VShell tunnels its C2 channel over a WebSocket
//! upgrade to /ws, announces its version ("4.9.x") in a length-prefixed
//! handshake, frames commands with 4-byte ASCII tokens, and ships
//! AES-GCM frames as [u32 length][12-byte nonce][ciphertext] with the
//! nonce's leading bit cleared. The pre-shared vkey crosses the wire as a
//! 32-char MD5 hex token.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::DefenseConfig;

/// Janitor wake interval
const JANITOR_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Tracker entries idle longer than this are evicted
const TRACKER_MAX_IDLE: Duration = Duration::from_secs(30 * 60);
/// Suspicion score at which a source is reported suspicious
const SUSPICION_THRESHOLD: u32 = 50;

/// Built-in C2 path prefixes, matched case-insensitively
const SUSPICIOUS_PATHS: &[&str] = &[
    "/ws",
    "/websocket",
    "/socket",
    "/connect",
    "/beacon",
    "/c2",
    "/shell",
    "/cmd",
    "/exec",
];

/// 4-byte command tokens used by the VShell framing layer
const COMMAND_TOKENS: &[&[u8; 4]] = &[
    b"conf", b"file", b"sucs", b"fail", b"ping", b"pong", b"exit", b"kill",
];

/// Known VShell version strings seen in short handshake packets
const KNOWN_VERSIONS: &[&str] = &[
    "4.9.3", "4.9.2", "4.9.1", "4.9.0", "4.8.", "4.7.", "4.6.", "4.5.",
];

/// Threat level of a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreatLevel {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThreatLevel::None => "none",
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Structured result of one scan
#[derive(Debug, Clone)]
pub struct Verdict {
    pub blocked: bool,
    pub reason: String,
    pub threat_level: ThreatLevel,
    pub details: HashMap<&'static str, String>,
}

impl Verdict {
    fn pass() -> Self {
        Self {
            blocked: false,
            reason: String::new(),
            threat_level: ThreatLevel::None,
            details: HashMap::new(),
        }
    }

    fn block(reason: impl Into<String>, threat_level: ThreatLevel) -> Self {
        Self {
            blocked: true,
            reason: reason.into(),
            threat_level,
            details: HashMap::new(),
        }
    }

    fn with_detail(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.details.insert(key, value.into());
        self
    }
}

/// Per-source tracking state
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub saw_ws_upgrade: bool,
    pub saw_handshake: bool,
    pub suspicion_score: u32,
    pub blocked_reason: Option<String>,
}

impl ConnectionTracker {
    fn new(now: Instant) -> Self {
        Self {
            first_seen: now,
            last_seen: now,
            saw_ws_upgrade: false,
            saw_handshake: false,
            suspicion_score: 0,
            blocked_reason: None,
        }
    }
}

/// Monotonic counters, updated under the same lock as the tracker map
#[derive(Debug, Clone, Default)]
pub struct DefenseStats {
    pub total_checked: u64,
    pub ws_blocked: u64,
    pub handshake_blocked: u64,
    pub payload_blocked: u64,
    pub rate_limited: u64,
}

struct DefenseInner {
    trackers: HashMap<IpAddr, ConnectionTracker>,
    stats: DefenseStats,
}

/// Process-wide defense engine, shared by all listeners
pub struct DefenseEngine {
    config: DefenseConfig,
    inner: RwLock<DefenseInner>,
    ws_key_pattern: Regex,
}

impl DefenseEngine {
    pub fn new(config: DefenseConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(DefenseInner {
                trackers: HashMap::new(),
                stats: DefenseStats::default(),
            }),
            ws_key_pattern: Regex::new(r"Sec-WebSocket-Key:\s*[A-Za-z0-9+/]{22}==")
                .expect("websocket key pattern"),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Spawn the janitor task evicting idle tracker entries every 5 minutes
    pub fn spawn_janitor(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(JANITOR_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let evicted = engine.evict_idle(TRACKER_MAX_IDLE);
                if evicted > 0 {
                    debug!("[VSHELL-DEFENSE] janitor evicted {} idle trackers", evicted);
                }
            }
        });
    }

    /// Remove tracker entries idle longer than `max_idle`; returns the count
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut inner = self.inner.write();
        let before = inner.trackers.len();
        inner
            .trackers
            .retain(|_, t| t.last_seen.elapsed() <= max_idle);
        before - inner.trackers.len()
    }

    /// Scan the initial payload of one connection. `path` is the request path
    /// when the payload was classified as HTTP, empty otherwise.
    ///
    /// Detection itself runs lock-free over immutable configuration; the
    /// writer lock is taken only to bump counters and update the tracker.
    pub fn scan(&self, client_ip: IpAddr, data: &[u8], path: &str) -> Verdict {
        if !self.config.enabled {
            return Verdict::pass();
        }

        self.inner.write().stats.total_checked += 1;

        if self.config.block_websocket_upgrade && self.is_websocket_upgrade(data) {
            self.inner.write().stats.ws_blocked += 1;
            return Verdict::block(
                "VShell WebSocket upgrade pattern detected",
                ThreatLevel::High,
            )
            .with_detail("pattern", "websocket_upgrade");
        }

        if self.config.block_suspicious_paths && self.is_suspicious_path(path) {
            return Verdict::block(
                format!("Suspicious VShell path detected: {}", path),
                ThreatLevel::Medium,
            )
            .with_detail("path", path);
        }

        if self.config.block_version_handshake && self.is_version_handshake(data) {
            self.inner.write().stats.handshake_blocked += 1;
            return Verdict::block("VShell version handshake detected", ThreatLevel::Critical)
                .with_detail("pattern", "version_handshake");
        }

        if self.config.block_command_patterns && self.is_command(data) {
            self.inner.write().stats.payload_blocked += 1;
            return Verdict::block("VShell command pattern detected", ThreatLevel::Critical)
                .with_detail("pattern", "command");
        }

        if self.config.block_encrypted_payloads && self.is_encrypted_payload(data) {
            self.inner.write().stats.payload_blocked += 1;
            return Verdict::block(
                "VShell encrypted payload pattern detected",
                ThreatLevel::High,
            )
            .with_detail("pattern", "encrypted_payload");
        }

        if self.config.block_vkey_patterns && is_vkey_hash(data) {
            self.inner.write().stats.handshake_blocked += 1;
            return Verdict::block("VShell vkey hash pattern detected", ThreatLevel::Critical)
                .with_detail("pattern", "vkey_hash");
        }

        self.update_tracker(client_ip, data);

        Verdict::pass()
    }

    /// WebSocket upgrade check: either the full VShell header triplet aimed
    /// at a /ws-style path, or an upgrade carrying a well-formed
    /// Sec-WebSocket-Key with no User-Agent at all.
    fn is_websocket_upgrade(&self, data: &[u8]) -> bool {
        let text = String::from_utf8_lossy(data);

        let has_upgrade = text.contains("Upgrade: websocket");
        let has_connection = text.contains("Connection: Upgrade");
        let has_version = text.contains("Sec-WebSocket-Version: 13");

        let is_ws_path = text.contains("GET /ws ")
            || text.contains("GET /ws/ ")
            || text.contains("GET /websocket ");

        if has_upgrade && has_connection && has_version && is_ws_path {
            return true;
        }

        if has_upgrade
            && has_connection
            && self.ws_key_pattern.is_match(&text)
            && !text.contains("User-Agent:")
        {
            return true;
        }

        false
    }

    fn is_suspicious_path(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        let path_lower = path.to_lowercase();

        SUSPICIOUS_PATHS
            .iter()
            .any(|p| path_lower.starts_with(p))
            || self
                .config
                .custom_block_paths
                .iter()
                .any(|p| path_lower.starts_with(&p.to_lowercase()))
    }

    /// Version handshake: [0x05]"4.9.3", a bare "4.9.3", the 9-byte
    /// length-prefixed form, or any known version string inside a packet
    /// shorter than 100 bytes.
    fn is_version_handshake(&self, data: &[u8]) -> bool {
        if data.len() < 6 {
            return false;
        }

        let patterns: [&[u8]; 3] = [
            &[0x05, b'4', b'.', b'9', b'.', b'3'],
            b"4.9.3",
            &[0x05, 0x00, 0x00, 0x00, b'4', b'.', b'9', b'.', b'3'],
        ];
        if patterns.iter().any(|p| contains(data, p)) {
            return true;
        }

        if data.len() < 100 {
            let text = String::from_utf8_lossy(data);
            if KNOWN_VERSIONS.iter().any(|v| text.contains(v)) {
                return true;
            }
        }

        false
    }

    /// Command check: a 4-byte token at offset 0, or anywhere in the first
    /// 16 bytes of the buffer.
    fn is_command(&self, data: &[u8]) -> bool {
        if data.len() < 4 {
            return false;
        }

        let prefix = &data[..4];
        if COMMAND_TOKENS.iter().any(|c| prefix == &c[..]) {
            return true;
        }

        COMMAND_TOKENS.iter().any(|c| {
            find(data, &c[..]).is_some_and(|idx| idx < 16)
        })
    }

    /// Encrypted frame check against the VShell message layout
    /// [u32 LE length][12-byte nonce][ciphertext + 16-byte GCM tag]; the
    /// nonce's first byte has its high bit cleared on the wire. Falls back to
    /// a byte-diversity test for framings with a mangled length field.
    fn is_encrypted_payload(&self, data: &[u8]) -> bool {
        if data.len() < 32 {
            return false;
        }

        let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if length > 0 && length < 65536 {
            let expected_total = length + 4;
            if expected_total + 16 >= data.len() && expected_total <= data.len() + 16 {
                if data[4] & 0x80 == 0 {
                    return true;
                }
            }
        }

        is_high_entropy(&data[4..]) && data.len() > 20
    }

    fn update_tracker(&self, client_ip: IpAddr, data: &[u8]) {
        // Detection outside the lock; the write guard covers only the map edit
        let ws_upgrade = contains(data, b"Upgrade: websocket");
        let handshake = self.is_version_handshake(data);
        let command = self.is_command(data);

        let now = Instant::now();
        let mut inner = self.inner.write();
        let tracker = inner
            .trackers
            .entry(client_ip)
            .or_insert_with(|| ConnectionTracker::new(now));

        tracker.last_seen = now;

        if ws_upgrade {
            tracker.saw_ws_upgrade = true;
            tracker.suspicion_score += 10;
        }
        if handshake {
            tracker.saw_handshake = true;
            tracker.suspicion_score += 50;
        }
        if command {
            tracker.suspicion_score += 100;
        }
    }

    /// Out-of-band suspicion query: (suspicious, score), threshold 50
    pub fn is_suspicious(&self, client_ip: IpAddr) -> (bool, u32) {
        let inner = self.inner.read();
        match inner.trackers.get(&client_ip) {
            Some(t) => (t.suspicion_score >= SUSPICION_THRESHOLD, t.suspicion_score),
            None => (false, 0),
        }
    }

    /// Tracker snapshot for one source, if present
    pub fn tracker(&self, client_ip: IpAddr) -> Option<ConnectionTracker> {
        self.inner.read().trackers.get(&client_ip).cloned()
    }

    /// Counter snapshot
    pub fn stats(&self) -> DefenseStats {
        self.inner.read().stats.clone()
    }

    /// True when `vkey`, literally or as its MD5 hex digest, is in the
    /// configured block list
    pub fn is_blocked_vkey(&self, vkey: &str) -> bool {
        let digest = hex::encode(Md5::digest(vkey.as_bytes()));
        self.config
            .blocked_vkeys
            .iter()
            .any(|blocked| blocked == vkey || *blocked == digest)
    }

    /// Log a blocked attempt in the defense log format
    pub fn log_blocked(&self, client_ip: IpAddr, verdict: &Verdict) {
        warn!(
            "[VSHELL-DEFENSE] BLOCKED | IP: {} | Reason: {} | Threat: {} | Details: {:?}",
            client_ip, verdict.reason, verdict.threat_level, verdict.details
        );
    }

    /// Log the signature set once at startup for operators wiring an IDS
    pub fn log_signatures(&self) {
        if !self.config.enabled {
            return;
        }
        info!("[VSHELL-DEFENSE] engine enabled; {} IDS signatures available", signatures().len());
        for sig in signatures() {
            debug!("[VSHELL-DEFENSE] signature: {}", sig);
        }
    }
}

/// Vkey hash check: at least 32 bytes and the first 32 are all hex digits
fn is_vkey_hash(data: &[u8]) -> bool {
    data.len() >= 32 && data[..32].iter().all(u8::is_ascii_hexdigit)
}

/// Byte-diversity test: encrypted data has close to uniformly distributed
/// bytes, so the distinct-byte count approaches the slice length
fn is_high_entropy(data: &[u8]) -> bool {
    if data.len() < 16 {
        return false;
    }

    let mut seen = [false; 256];
    let mut unique = 0usize;
    for &b in data {
        if !seen[b as usize] {
            seen[b as usize] = true;
            unique += 1;
        }
    }

    unique >= data.len() / 4
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    find(haystack, needle).is_some()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Snort/Suricata rules matching the wire signatures this engine blocks
pub fn signatures() -> Vec<String> {
    vec![
        r#"alert tcp any any -> any any (msg:"VShell WebSocket Upgrade"; content:"GET /ws "; content:"Upgrade: websocket"; content:"Sec-WebSocket-Version: 13"; sid:1000001; rev:1;)"#.to_string(),
        r#"alert tcp any any -> any any (msg:"VShell Version Handshake"; content:"|05|4.9.3"; sid:1000002; rev:1;)"#.to_string(),
        r#"alert tcp any any -> any any (msg:"VShell Command conf"; content:"conf"; offset:0; depth:4; sid:1000003; rev:1;)"#.to_string(),
        r#"alert tcp any any -> any any (msg:"VShell Command file"; content:"file"; offset:0; depth:4; sid:1000004; rev:1;)"#.to_string(),
        r#"alert tcp any any -> any any (msg:"VShell Beacon Pattern"; content:"{\"Id\":"; content:"\"HostName\":"; sid:1000005; rev:1;)"#.to_string(),
    ]
}
