//! Armory + jailhouse: the host-side filesystem that projects the shim into
//! containers, and its persisted state file.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::ClawrdenError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JailState {
    pub jail_id: String,
    pub commands: Vec<String>,
    pub hardened: bool,
    pub created_at: u64,
    pub jail_path: PathBuf,
}

struct Inner {
    armory_path: PathBuf,
    jailhouse_path: PathBuf,
    state_path: PathBuf,
    jails: HashMap<String, JailState>,
}

pub struct JailhouseManager {
    inner: Mutex<Inner>,
}

fn shim_path(armory_path: &Path) -> PathBuf {
    armory_path.join("clawrden-shim")
}

fn validate_command_name(name: &str) -> Result<(), ClawrdenError> {
    if name.is_empty() || name.contains('/') || name.contains("..") || name.contains('\0') {
        return Err(ClawrdenError::JailhouseConflict(format!(
            "invalid command name: {name:?}"
        )));
    }
    Ok(())
}

impl JailhouseManager {
    pub fn new(armory_path: PathBuf, jailhouse_path: PathBuf, state_path: PathBuf) -> Self {
        JailhouseManager {
            inner: Mutex::new(Inner {
                armory_path,
                jailhouse_path,
                state_path,
                jails: HashMap::new(),
            }),
        }
    }

    /// Verify the armory contains exactly the master shim, executable, and
    /// canonicalize the armory path so every symlink later created under a
    /// jail's `bin/` points at an absolute target regardless of how
    /// `--armory-path` was spelled on the command line.
    pub fn ensure_armory(&self) -> Result<(), ClawrdenError> {
        let mut guard = self.inner.lock().unwrap();
        fs::create_dir_all(&guard.armory_path)?;
        guard.armory_path = fs::canonicalize(&guard.armory_path)?;
        let shim = shim_path(&guard.armory_path);
        let meta = fs::metadata(&shim).map_err(|e| {
            ClawrdenError::JailhouseConflict(format!("armory shim missing: {e}"))
        })?;
        if !meta.is_file() {
            return Err(ClawrdenError::JailhouseConflict(
                "armory shim is not a regular file".into(),
            ));
        }
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(ClawrdenError::JailhouseConflict(
                "armory shim is not executable".into(),
            ));
        }
        Ok(())
    }

    /// Ensure roots exist and load persisted state. A missing state file is
    /// not an error (fresh install).
    pub fn start(&self) -> Result<(), ClawrdenError> {
        self.ensure_armory()?;
        let mut guard = self.inner.lock().unwrap();
        fs::create_dir_all(&guard.jailhouse_path)?;
        if guard.state_path.exists() {
            let contents = fs::read_to_string(&guard.state_path)?;
            let loaded: HashMap<String, JailState> = serde_json::from_str(&contents)
                .map_err(|e| ClawrdenError::JailhouseConflict(format!("state file: {e}")))?;
            guard.jails = loaded;
        }
        Ok(())
    }

    fn persist(guard: &Inner) -> Result<(), ClawrdenError> {
        let tmp = guard.state_path.with_extension("tmp");
        let serialized = serde_json::to_vec_pretty(&guard.jails)
            .map_err(|e| ClawrdenError::JailhouseConflict(e.to_string()))?;
        fs::write(&tmp, serialized)?;
        let mut perms = fs::metadata(&tmp)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&tmp, perms)?;
        fs::rename(&tmp, &guard.state_path)?;
        Ok(())
    }

    pub fn create_jail(
        &self,
        jail_id: &str,
        commands: &[String],
        hardened: bool,
    ) -> Result<JailState, ClawrdenError> {
        if jail_id.is_empty() {
            return Err(ClawrdenError::JailhouseConflict("empty jail id".into()));
        }
        for c in commands {
            validate_command_name(c)?;
        }
        let mut guard = self.inner.lock().unwrap();
        if guard.jails.contains_key(jail_id) {
            return Err(ClawrdenError::JailhouseExists(format!(
                "jail {jail_id} already exists"
            )));
        }
        let jail_path = guard.jailhouse_path.join(jail_id);
        let bin_path = jail_path.join("bin");
        let shim = shim_path(&guard.armory_path);

        let result = (|| -> io::Result<()> {
            fs::create_dir_all(&bin_path)?;
            fs::set_permissions(&bin_path, fs::Permissions::from_mode(0o755))?;
            for c in commands {
                symlink(&shim, bin_path.join(c))?;
            }
            Ok(())
        })();

        if let Err(e) = result {
            let _ = fs::remove_dir_all(&jail_path);
            return Err(ClawrdenError::Io(e));
        }

        let state = JailState {
            jail_id: jail_id.to_string(),
            commands: commands.to_vec(),
            hardened,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            jail_path,
        };
        guard.jails.insert(jail_id.to_string(), state.clone());
        Self::persist(&guard)?;
        Ok(state)
    }

    pub fn destroy_jail(&self, jail_id: &str) -> Result<(), ClawrdenError> {
        let mut guard = self.inner.lock().unwrap();
        let state = guard.jails.remove(jail_id).ok_or_else(|| {
            ClawrdenError::JailhouseNotFound(format!("unknown jail {jail_id}"))
        })?;
        fs::remove_dir_all(&state.jail_path)?;
        Self::persist(&guard)?;
        Ok(())
    }

    pub fn reconcile_jail(
        &self,
        jail_id: &str,
        new_commands: &[String],
    ) -> Result<JailState, ClawrdenError> {
        for c in new_commands {
            validate_command_name(c)?;
        }
        let mut guard = self.inner.lock().unwrap();
        let shim = shim_path(&guard.armory_path);
        let state = guard
            .jails
            .get(jail_id)
            .cloned()
            .ok_or_else(|| ClawrdenError::JailhouseNotFound(format!("unknown jail {jail_id}")))?;
        let bin_path = state.jail_path.join("bin");

        let old: std::collections::HashSet<&str> =
            state.commands.iter().map(|s| s.as_str()).collect();
        let new: std::collections::HashSet<&str> =
            new_commands.iter().map(|s| s.as_str()).collect();

        for dropped in old.difference(&new) {
            match fs::remove_file(bin_path.join(dropped)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(ClawrdenError::Io(e)),
            }
        }
        for added in new.difference(&old) {
            symlink(&shim, bin_path.join(added))?;
        }

        let updated = JailState { commands: new_commands.to_vec(), ..state };
        guard.jails.insert(jail_id.to_string(), updated.clone());
        Self::persist(&guard)?;
        Ok(updated)
    }

    pub fn list_jails(&self) -> Vec<JailState> {
        self.inner.lock().unwrap().jails.values().cloned().collect()
    }

    pub fn get_jail(&self, jail_id: &str) -> Option<JailState> {
        self.inner.lock().unwrap().jails.get(jail_id).cloned()
    }
}
