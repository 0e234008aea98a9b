//! Observes the policy file and reloads it with debouncing, atomically
//! swapping the active policy engine pointer and invoking callbacks.
use crate::policy::PolicyEngine;
use notify::{RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const DEBOUNCE: Duration = Duration::from_millis(500);

pub struct PolicyWatcher {
    _handle: JoinHandle<()>,
    stop: std::sync::mpsc::Sender<()>,
}

pub type Callback = Box<dyn Fn(&Arc<PolicyEngine>) + Send + Sync>;

impl PolicyWatcher {
    /// Spawn a watcher over `path`, atomically swapping `engine` on every
    /// successful reload and invoking every callback with the new engine.
    pub fn spawn(
        path: PathBuf,
        engine: Arc<RwLock<Arc<PolicyEngine>>>,
        callbacks: Vec<Callback>,
    ) -> notify::Result<Self> {
        let (event_tx, event_rx) = channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = event_tx.send(event);
            }
        })?;
        if let Some(parent) = path.parent() {
            watcher.watch(parent, RecursiveMode::NonRecursive)?;
        }

        let (stop_tx, stop_rx) = channel::<()>();
        let watch_path = path.clone();
        let handle = thread::spawn(move || {
            // Keep the watcher alive for the lifetime of the thread; its
            // drop would stop delivering events.
            let _watcher = watcher;
            let mut pending = false;
            loop {
                if stop_rx.try_recv().is_ok() {
                    break;
                }
                match event_rx.recv_timeout(DEBOUNCE) {
                    Ok(_event) => {
                        pending = true;
                        continue;
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if pending {
                            pending = false;
                            reload(&watch_path, &engine, &callbacks);
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        Ok(PolicyWatcher { _handle: handle, stop: stop_tx })
    }

    pub fn stop(&self) {
        let _ = self.stop.send(());
    }
}

fn reload(
    path: &Path,
    engine: &Arc<RwLock<Arc<PolicyEngine>>>,
    callbacks: &[Callback],
) {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return;
    };
    let Ok(cfg) = serde_yaml::from_str(&contents) else {
        return;
    };
    let new_engine = Arc::new(PolicyEngine::new(cfg));
    {
        let mut guard = engine.write().unwrap();
        *guard = new_engine.clone();
    }
    for cb in callbacks {
        cb(&new_engine);
    }
}
