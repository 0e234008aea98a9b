//! Declarative policy: rule evaluation, path validation, and the restrictive
//! fallback used when the policy file is missing or malformed.
use crate::errors::ClawrdenError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
    Ask,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub command: String,
    pub action: Action,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, with = "humantime_opt")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JailConfig {
    pub commands: Vec<String>,
    #[serde(default)]
    pub hardened: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_action")]
    pub default_action: Action,
    #[serde(default = "default_timeout_duration", with = "humantime")]
    pub default_timeout: Duration,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub jails: HashMap<String, JailConfig>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

fn default_action() -> Action {
    Action::Deny
}

fn default_timeout_duration() -> Duration {
    DEFAULT_TIMEOUT
}

/// Minimal `humantime`-compatible (de)serialization for a bare `Duration`,
/// written by hand to avoid adding a dependency solely for a handful of
/// duration strings (`"2m"`, `"30s"`).
mod humantime {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn format_duration(d: Duration) -> String {
        let secs = d.as_secs();
        if secs % 60 == 0 && secs > 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }

    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(num) = s.strip_suffix("ms") {
            return num
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string());
        }
        if let Some(num) = s.strip_suffix('s') {
            return num
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string());
        }
        if let Some(num) = s.strip_suffix('m') {
            return num
                .parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|e| e.to_string());
        }
        if let Some(num) = s.strip_suffix('h') {
            return num
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(|e| e.to_string());
        }
        s.parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| format!("invalid duration: {s}"))
    }
}

mod humantime_opt {
    use super::{humantime, Duration};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&humantime::format_duration(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let opt = Option::<String>::deserialize(d)?;
        match opt {
            Some(s) => humantime::parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            default_action: default_action(),
            default_timeout: default_timeout_duration(),
            allowed_paths: vec!["/app/*".to_string(), "/tmp/*".to_string()],
            jails: HashMap::new(),
            rules: Vec::new(),
        }
    }
}

/// The restrictive fallback used when the policy file fails to load: deny
/// everything except a short list of read-only utilities.
pub fn restrictive_default() -> PolicyConfig {
    let mut cfg = PolicyConfig::default();
    for cmd in ["ls", "cat", "pwd", "echo"] {
        cfg.rules.push(Rule {
            command: cmd.to_string(),
            action: Action::Allow,
            args: Vec::new(),
            reason: Some("restrictive default fallback".to_string()),
            timeout: None,
        });
    }
    cfg
}

#[derive(Debug)]
pub struct Evaluation {
    pub action: Action,
    pub timeout: Duration,
    pub reason: Option<String>,
}

pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        PolicyEngine { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Load a policy file from disk; on any read/parse failure, return the
    /// restrictive default instead of propagating the error (per §4.3).
    pub fn load_or_default(path: &Path) -> Self {
        match std::fs::read_to_string(path).ok().and_then(|s| serde_yaml::from_str(&s).ok()) {
            Some(cfg) => PolicyEngine::new(cfg),
            None => PolicyEngine::new(restrictive_default()),
        }
    }

    /// Evaluate a command+args pair against the ordered rule list.
    pub fn evaluate(&self, command: &str, args: &[String]) -> Evaluation {
        let basename = Path::new(command)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| command.to_string());
        let joined = args.join(" ");

        for rule in &self.config.rules {
            if !command_matches(&rule.command, &basename) {
                continue;
            }
            if !rule.args.is_empty() && !rule.args.iter().any(|pat| joined.contains(pat.as_str())) {
                continue;
            }
            return Evaluation {
                action: rule.action,
                timeout: rule.timeout.unwrap_or(self.config.default_timeout),
                reason: rule.reason.clone(),
            };
        }
        Evaluation {
            action: self.config.default_action,
            timeout: self.config.default_timeout,
            reason: None,
        }
    }

    /// Validate a working directory against `allowed_paths`. An empty list
    /// disables the check entirely.
    pub fn validate_path(&self, cwd: &str) -> Result<(), ClawrdenError> {
        if self.config.allowed_paths.is_empty() {
            return Ok(());
        }
        let normalized = normalize_path(cwd);
        for pattern in &self.config.allowed_paths {
            if path_matches(pattern, &normalized) {
                return Ok(());
            }
        }
        Err(ClawrdenError::PathViolation(format!(
            "{normalized} is not under any allowed path"
        )))
    }
}

/// Shell-style glob matching restricted to `*` and `?`; invalid/unparseable
/// patterns fall back to case-insensitive exact match (defensive, per §4.3).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    fn helper(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'*') => {
                helper(&p[1..], t) || (!t.is_empty() && helper(p, &t[1..]))
            }
            Some(b'?') => !t.is_empty() && helper(&p[1..], &t[1..]),
            Some(&c) => !t.is_empty() && t[0] == c && helper(&p[1..], &t[1..]),
        }
    }
    if pattern.contains('*') || pattern.contains('?') {
        helper(pattern.as_bytes(), text.as_bytes())
    } else {
        pattern.eq_ignore_ascii_case(text)
    }
}

fn command_matches(pattern: &str, basename: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    glob_match(pattern, basename)
}

fn path_matches(pattern: &str, normalized: &str) -> bool {
    if glob_match(pattern, normalized) {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        if normalized == prefix || normalized.starts_with(&format!("{prefix}/")) {
            return true;
        }
    }
    pattern == normalized
}

/// Collapse `.` and `..` components and strip a trailing slash, without
/// touching the filesystem (pure lexical normalization so traversal can't
/// be used to dodge `allowed_paths`).
pub fn normalize_path(path: &str) -> String {
    let is_absolute = path.starts_with('/');
    let mut stack: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }
    let joined = stack.join("/");
    if is_absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(cfg: PolicyConfig) -> PolicyEngine {
        PolicyEngine::new(cfg)
    }

    #[test]
    fn default_action_applies_when_no_rule_matches() {
        let engine = engine_with(PolicyConfig::default());
        let eval = engine.evaluate("sudo", &["rm".into(), "-rf".into(), "/".into()]);
        assert_eq!(eval.action, Action::Deny);
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut cfg = PolicyConfig::default();
        cfg.rules.push(Rule {
            command: "echo".into(),
            action: Action::Allow,
            args: Vec::new(),
            reason: None,
            timeout: None,
        });
        cfg.rules.push(Rule {
            command: "echo".into(),
            action: Action::Deny,
            args: Vec::new(),
            reason: None,
            timeout: None,
        });
        let engine = engine_with(cfg);
        assert_eq!(engine.evaluate("echo", &["hi".into()]).action, Action::Allow);
    }

    #[test]
    fn arg_pattern_rule_requires_substring_match() {
        let mut cfg = PolicyConfig::default();
        cfg.rules.push(Rule {
            command: "git".into(),
            action: Action::Deny,
            args: vec!["push".into()],
            reason: None,
            timeout: None,
        });
        let engine = engine_with(cfg);
        assert_eq!(engine.evaluate("git", &["push".into()]).action, Action::Deny);
        assert_eq!(
            engine.evaluate("git", &["status".into()]).action,
            Action::Deny // falls through to default (also Deny) since no args matched
        );
    }

    #[test]
    fn arg_pattern_rule_does_not_match_empty_args() {
        let mut cfg = PolicyConfig::default();
        cfg.default_action = Action::Allow;
        cfg.rules.push(Rule {
            command: "git".into(),
            action: Action::Deny,
            args: vec!["push".into()],
            reason: None,
            timeout: None,
        });
        let engine = engine_with(cfg);
        // No args: the rule's pattern can't appear in an empty joined string.
        assert_eq!(engine.evaluate("git", &[]).action, Action::Allow);
    }

    #[test]
    fn glob_star_matches_anything() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("rm*", "rm"));
        assert!(glob_match("rm*", "rm-rf"));
        assert!(!glob_match("rm*", "cp"));
    }

    #[test]
    fn exact_name_matches() {
        assert!(command_matches("echo", "echo"));
        assert!(!command_matches("echo", "echooo"));
    }

    #[test]
    fn path_app_matches_app_star_pattern() {
        let mut cfg = PolicyConfig::default();
        cfg.allowed_paths = vec!["/app/*".into()];
        let engine = engine_with(cfg);
        assert!(engine.validate_path("/app").is_ok());
        assert!(engine.validate_path("/app/sub").is_ok());
        assert!(engine.validate_path("/etc").is_err());
    }

    #[test]
    fn traversal_is_normalized_before_matching_and_rejected() {
        let mut cfg = PolicyConfig::default();
        cfg.allowed_paths = vec!["/app/*".into()];
        let engine = engine_with(cfg);
        assert_eq!(normalize_path("/app/../etc/passwd"), "/etc/passwd");
        assert!(engine.validate_path("/app/../etc/passwd").is_err());
    }

    #[test]
    fn empty_allowed_paths_disables_the_check() {
        let mut cfg = PolicyConfig::default();
        cfg.allowed_paths = Vec::new();
        let engine = engine_with(cfg);
        assert!(engine.validate_path("/anything/at/all").is_ok());
    }

    #[test]
    fn restrictive_default_allows_only_readonly_utilities() {
        let engine = engine_with(restrictive_default());
        assert_eq!(engine.evaluate("ls", &[]).action, Action::Allow);
        assert_eq!(engine.evaluate("sudo", &[]).action, Action::Deny);
    }

    #[test]
    fn policy_reload_with_unchanged_file_yields_same_evaluations() {
        let yaml = "default_action: allow\nrules:\n  - command: rm\n    action: deny\n";
        let cfg1: PolicyConfig = serde_yaml::from_str(yaml).unwrap();
        let cfg2: PolicyConfig = serde_yaml::from_str(yaml).unwrap();
        let e1 = engine_with(cfg1);
        let e2 = engine_with(cfg2);
        assert_eq!(e1.evaluate("rm", &[]).action, e2.evaluate("rm", &[]).action);
        assert_eq!(e1.evaluate("echo", &[]).action, e2.evaluate("echo", &[]).action);
    }
}
