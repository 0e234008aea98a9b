//! Allowlist/blocklist environment scrubbing applied before any executor sees
//! a request's environment. Blocklist wins over allowlist.
use once_cell::sync::Lazy;
use std::collections::HashSet;

/// Environment variable that carries the warden's own socket path to the
/// shim; stripped so a prisoner cannot discover the socket from a mirrored
/// command's environment.
pub const SOCKET_ENV_VAR: &str = "CLAWRDEN_SOCKET";

static ALLOWLIST: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "PATH", "HOME", "USER", "SHELL", "TERM", "LANG", "LC_ALL", "LANGUAGE",
    ]
    .into_iter()
    .collect()
});

static BLOCKLIST: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "LD_PRELOAD",
        "LD_LIBRARY_PATH",
        "DOCKER_HOST",
        "KUBECONFIG",
        "AWS_ACCESS_KEY_ID",
        "AWS_SECRET_ACCESS_KEY",
        "GOOGLE_APPLICATION_CREDENTIALS",
        SOCKET_ENV_VAR,
    ]
    .into_iter()
    .collect()
});

/// Scrub a `KEY=VALUE` environment entry list down to the allowlisted keys,
/// dropping anything blocklisted regardless of allowlist membership.
pub fn scrub(env: &[String]) -> Vec<String> {
    env.iter()
        .filter(|entry| {
            let key = entry.split('=').next().unwrap_or(entry.as_str());
            !BLOCKLIST.contains(key) && ALLOWLIST.contains(key)
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_allowlisted_drops_rest() {
        let env = vec![
            "PATH=/usr/bin".to_string(),
            "LD_PRELOAD=/evil.so".to_string(),
            "SECRET=x".to_string(),
        ];
        let scrubbed = scrub(&env);
        assert_eq!(scrubbed, vec!["PATH=/usr/bin".to_string()]);
    }

    #[test]
    fn blocklist_wins_even_if_key_were_allowlisted() {
        // PATH is allowlisted; a would-be blocklisted PATH-shaped override
        // of the socket var must still be dropped because it is on the
        // blocklist by key.
        let env = vec![format!("{SOCKET_ENV_VAR}=/var/run/clawrden/warden.sock")];
        assert!(scrub(&env).is_empty());
    }

    #[test]
    fn every_forwarded_entry_is_allowlisted_and_not_blocklisted() {
        let env = vec![
            "PATH=/usr/bin".to_string(),
            "HOME=/root".to_string(),
            "AWS_ACCESS_KEY_ID=abc".to_string(),
        ];
        for entry in scrub(&env) {
            let key = entry.split('=').next().unwrap();
            assert!(ALLOWLIST.contains(key));
            assert!(!BLOCKLIST.contains(key));
        }
    }
}
