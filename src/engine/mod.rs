//! The download engine: a bounded pool of workers draining shared FIFO
//! queues, with per-file resume, bounded retry, integrity checks and a
//! rate-limited console aggregator.
//!
//! Three work shapes share the same pool mechanics:
//! - file units (installers, extras, patches, language packs),
//! - depot items (content-system chunk streams),
//! - zip members (installer-as-repository fallback).
//!
//! Failure of a single unit is recorded and never aborts siblings; the
//! verb exit code carries bit 0 when anything failed. A worker that
//! cannot refresh the expired token finishes early; the remaining
//! workers keep going on the token they already hold.

pub mod mojo;
pub mod progress;
pub mod queue;
pub mod worker;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinSet;

use crate::api::GalaxyApi;
use crate::config::Config;
use crate::models::{DepotItem, GameFile};
use crate::utils;
use crate::verify::FileVerifier;
use crate::zip::ZipMember;

use self::progress::{MessageQueue, MsgKind, ProgressSlots};
use self::queue::WorkQueue;

/// State shared by every worker of one engine run.
pub struct Shared {
    pub cfg: Config,
    pub api: GalaxyApi,
    pub file_queue: WorkQueue<GameFile>,
    pub depot_queue: WorkQueue<DepotItem>,
    pub zip_queue: WorkQueue<ZipMember>,
    /// Files to hash into sidecar XML after the pool drains.
    pub xml_queue: WorkQueue<GameFile>,
    pub messages: MessageQueue,
    pub slots: ProgressSlots,
    pub remaining_bytes: AtomicU64,
    /// Serializes create_dir_all across workers.
    pub mkdir_lock: std::sync::Mutex<()>,
    /// CDN URL templates keyed by product id; dependencies never cache.
    pub cdn_templates: DashMap<String, Vec<String>>,
    pub failures: AtomicU32,
}

impl Shared {
    fn new(cfg: Config, api: GalaxyApi, workers: usize) -> Arc<Shared> {
        Arc::new(Shared {
            cfg,
            api,
            file_queue: WorkQueue::new(),
            depot_queue: WorkQueue::new(),
            zip_queue: WorkQueue::new(),
            xml_queue: WorkQueue::new(),
            messages: MessageQueue::new(),
            slots: ProgressSlots::new(workers),
            remaining_bytes: AtomicU64::new(0),
            mkdir_lock: std::sync::Mutex::new(()),
            cdn_templates: DashMap::new(),
            failures: AtomicU32::new(0),
        })
    }

    pub fn msg(&self, text: impl Into<String>, kind: MsgKind, tid: usize) {
        self.messages
            .push(progress::Message::new(text, kind, format!("[Thread #{}]", tid)));
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    /// Creates the parent directory of a target path under the global
    /// mkdir lock. Errors are reported, not fatal.
    pub fn ensure_parent_dirs(&self, path: &Path, tid: usize) -> bool {
        let Some(directory) = path.parent() else {
            return true;
        };
        let _guard = self.mkdir_lock.lock().unwrap();
        if directory.exists() {
            if !directory.is_dir() {
                self.msg(
                    format!("{} is not a directory, skipping file", directory.display()),
                    MsgKind::Warning,
                    tid,
                );
                return false;
            }
            return true;
        }
        if let Err(e) = std::fs::create_dir_all(directory) {
            self.msg(
                format!("Failed to create directory {}: {}", directory.display(), e),
                MsgKind::Error,
                tid,
            );
            return false;
        }
        true
    }
}

pub struct Engine {
    cfg: Config,
    api: GalaxyApi,
}

impl Engine {
    pub fn new(cfg: Config, api: GalaxyApi) -> Engine {
        Engine { cfg, api }
    }

    /// Runs the file-unit path over `units`. Returns the exit-code bit:
    /// nonzero iff at least one unit terminated in error.
    pub async fn run_files(&self, units: Vec<GameFile>) -> i32 {
        if units.is_empty() {
            return 0;
        }

        let workers = (self.cfg.threads as usize).min(units.len());
        let shared = Shared::new(self.cfg.clone(), self.api.clone(), workers);

        let mut total: u64 = 0;
        for gf in units {
            total += gf.size;
            shared.file_queue.push(gf);
        }
        shared.remaining_bytes.store(total, Ordering::SeqCst);

        println!("Total size: {}", utils::size_string(total));
        if self.cfg.dl.free_space_check
            && !check_free_space(Path::new(&self.cfg.dirs.directory), total)
        {
            eprintln!("Not enough free space in {}", self.cfg.dirs.directory);
            std::process::exit(1);
        }

        let mut join = JoinSet::new();
        for tid in 0..workers {
            join.spawn(worker::process_file_queue(shared.clone(), tid));
        }
        self.drive(&shared, &mut join, || shared.file_queue.len()).await;

        self.create_queued_xml(&shared);

        (shared.failures.load(Ordering::SeqCst) > 0) as i32
    }

    /// Runs the repository path over depot items into `install_path`.
    pub async fn run_depot_items(&self, items: Vec<DepotItem>, install_path: &Path) -> i32 {
        if items.is_empty() {
            return 0;
        }

        let workers = (self.cfg.threads as usize).min(items.len());
        let shared = Shared::new(self.cfg.clone(), self.api.clone(), workers);

        let mut total_compressed: u64 = 0;
        let mut total_installed: u64 = 0;
        for item in items {
            total_compressed += item.total_size_compressed;
            total_installed += item.total_size_uncompressed;
            shared.depot_queue.push(item);
        }
        shared.remaining_bytes.store(total_compressed, Ordering::SeqCst);

        println!("Files: {}", shared.depot_queue.len());
        println!("Total size installed: {}", utils::size_string(total_installed));
        if self.cfg.dl.free_space_check && !check_free_space(install_path, total_installed) {
            eprintln!("Not enough free space in {}", install_path.display());
            std::process::exit(1);
        }

        let install_path = install_path.to_path_buf();
        let mut join = JoinSet::new();
        for tid in 0..workers {
            join.spawn(worker::process_depot_queue(
                shared.clone(),
                install_path.clone(),
                tid,
            ));
        }
        self.drive(&shared, &mut join, || shared.depot_queue.len()).await;

        (shared.failures.load(Ordering::SeqCst) > 0) as i32
    }

    /// Runs the installer-as-repository path over zip members, then
    /// combines split files.
    pub async fn run_zip_members(
        &self,
        members: Vec<ZipMember>,
        split_files: HashMap<String, Vec<ZipMember>>,
    ) -> i32 {
        if members.is_empty() {
            return 0;
        }

        let workers = (self.cfg.threads as usize).min(members.len());
        let shared = Shared::new(self.cfg.clone(), self.api.clone(), workers);

        let mut total: u64 = 0;
        for member in members {
            total += member.comp_size;
            shared.zip_queue.push(member);
        }
        shared.remaining_bytes.store(total, Ordering::SeqCst);

        let mut join = JoinSet::new();
        for tid in 0..workers {
            join.spawn(mojo::process_zip_queue(shared.clone(), tid));
        }
        self.drive(&shared, &mut join, || shared.zip_queue.len()).await;

        if !split_files.is_empty() {
            mojo::combine_split_files(&split_files, true);
        }

        (shared.failures.load(Ordering::SeqCst) > 0) as i32
    }

    /// Aggregator loop: tick at the configured interval, drain worker
    /// messages, redraw the progress block, stop when every worker is
    /// finished.
    async fn drive(
        &self,
        shared: &Arc<Shared>,
        join: &mut JoinSet<()>,
        queue_len: impl Fn() -> usize,
    ) {
        let interval = Duration::from_millis(self.cfg.progress_interval_ms);
        let mut drawn_lines = 0usize;

        loop {
            tokio::time::sleep(interval).await;

            // clear the previous progress block
            if drawn_lines > 0 {
                print!("\x1b[{}A\r\x1b[J", drawn_lines);
            }

            while let Some(message) = shared.messages.try_pop() {
                println!("{}", message.formatted(self.cfg.color));
            }

            let lines = progress::render_lines(
                &shared.slots,
                queue_len(),
                shared.remaining_bytes.load(Ordering::SeqCst),
                self.cfg.threads > 1,
            );
            for line in &lines {
                println!("{}", line);
            }
            drawn_lines = lines.len();

            if shared.slots.all_finished() {
                break;
            }
        }

        while join.join_next().await.is_some() {}

        // late messages pushed between the last tick and worker exit
        while let Some(message) = shared.messages.try_pop() {
            println!("{}", message.formatted(self.cfg.color));
        }
    }

    /// Hashes downloaded files into sidecar XML (--automatic-xml-creation).
    fn create_queued_xml(&self, shared: &Arc<Shared>) {
        if shared.xml_queue.is_empty() {
            return;
        }
        println!("Starting XML creation");
        while let Some(gf) = shared.xml_queue.try_pop() {
            let slug = worker::sidecar_slug(&gf);
            match FileVerifier::create(Path::new(&gf.target_path), self.cfg.chunk_size) {
                Ok(verifier) => {
                    if let Err(e) = verifier.save(&self.cfg.xml_dir, slug) {
                        eprintln!("Failed to save XML for {}: {}", gf.target_path, e);
                    }
                }
                Err(e) => eprintln!("Failed to hash {}: {}", gf.target_path, e),
            }
        }
    }
}

/// Free-space check against the nearest existing ancestor of `path`.
/// Errs on the side of allowing the download.
pub fn check_free_space(path: &Path, needed: u64) -> bool {
    #[cfg(unix)]
    {
        let mut probe: PathBuf = std::fs::canonicalize(path)
            .unwrap_or_else(|_| path.to_path_buf());
        while !probe.exists() {
            match probe.parent() {
                Some(parent) => probe = parent.to_path_buf(),
                None => return true,
            }
        }
        let Ok(cpath) = std::ffi::CString::new(probe.to_string_lossy().as_bytes()) else {
            return true;
        };
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(cpath.as_ptr(), &mut stat) != 0 {
                return true;
            }
            let available = stat.f_bavail as u64 * stat.f_bsize as u64;
            available >= needed
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, needed);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_space_check_existing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        // zero bytes always fit
        assert!(check_free_space(tmp.path(), 0));
        // an exabyte never does
        assert!(!check_free_space(tmp.path(), 1u64 << 60));
    }

    #[test]
    fn free_space_walks_to_existing_ancestor() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("not/yet/created");
        assert!(check_free_space(&nested, 0));
    }
}
