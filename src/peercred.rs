//! Kernel-authoritative peer identification for an accepted Unix socket
//! connection, plus best-effort container-ID resolution via cgroup.
use std::fs;
use std::os::unix::net::UnixStream;

use crate::protocol::Identity;

/// `{pid, uid, gid}` as reported by `SO_PEERCRED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// Query `SO_PEERCRED` on the connection. Failures are the caller's to log;
/// per §4.5/§7 they are never fatal to the handler.
pub fn peer_credentials(stream: &UnixStream) -> std::io::Result<PeerCredentials> {
    use nix::sys::socket::{getsockopt, sockopt::PeerCredentials as PeerCredOpt};

    let creds = getsockopt(stream, PeerCredOpt)
        .map_err(|e| std::io::Error::other(format!("SO_PEERCRED: {e}")))?;
    Ok(PeerCredentials {
        pid: creds.pid(),
        uid: creds.uid(),
        gid: creds.gid(),
    })
}

impl From<PeerCredentials> for Identity {
    fn from(c: PeerCredentials) -> Self {
        Identity { uid: c.uid, gid: c.gid }
    }
}

/// Resolve a container ID by scanning `/proc/<pid>/cgroup` for a 64-hex-char
/// run on a line mentioning `docker` or `kubepods`. Empty string means the
/// process is host-resident (or the cgroup file couldn't be read).
pub fn resolve_container_id(pid: i32) -> String {
    let path = format!("/proc/{pid}/cgroup");
    let contents = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(_) => return String::new(),
    };
    for line in contents.lines() {
        if !line.contains("docker") && !line.contains("kubepods") {
            continue;
        }
        if let Some(id) = find_hex64_run(line) {
            return id;
        }
    }
    String::new()
}

fn find_hex64_run(line: &str) -> Option<String> {
    let bytes: Vec<char> = line.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_hexdigit() && !bytes[i].is_ascii_uppercase() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_hexdigit() && !bytes[i].is_ascii_uppercase()
            {
                i += 1;
            }
            if i - start >= 64 {
                return Some(bytes[start..start + 64].iter().collect());
            }
        } else {
            i += 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_64_hex_run_on_docker_line() {
        let id = "a".repeat(64);
        let line = format!("1:name=systemd:/docker/{id}");
        assert_eq!(find_hex64_run(&line), Some(id));
    }

    #[test]
    fn finds_64_hex_run_on_kubepods_line() {
        let id = "0123456789abcdef".repeat(4);
        let line = format!("0::/kubepods/burstable/pod123/{id}");
        assert_eq!(find_hex64_run(&line), Some(id));
    }

    #[test]
    fn rejects_shorter_runs() {
        let line = "1:name=systemd:/docker/deadbeef";
        assert_eq!(find_hex64_run(line), None);
    }

    #[test]
    fn rejects_uppercase_hex() {
        let id = "A".repeat(64);
        let line = format!("1:name=systemd:/docker/{id}");
        assert_eq!(find_hex64_run(&line), None);
    }
}
