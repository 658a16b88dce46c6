//! Worker loops for the file-unit and depot-item queues.
//!
//! Every worker owns a clone of the API client (connection pool shared
//! underneath) and drains the queue with `try_pop` until empty. A worker
//! that cannot refresh an expired token marks itself finished and
//! returns; siblings holding a valid token keep draining.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::progress::{MsgKind, ProgressEvent, ProgressSink, WorkerState};
use super::Shared;
use crate::api::{self, GalaxyApi};
use crate::models::{DepotItem, GameFile};
use crate::utils;
use crate::verify::{self, FileVerifier};

/// Sidecar directory slug for a file unit: the owning DLC when there is
/// one, the base game otherwise.
pub fn sidecar_slug(gf: &GameFile) -> &str {
    if gf.kind.is_dlc() && !gf.dlc_gamename.is_empty() {
        &gf.dlc_gamename
    } else {
        &gf.gamename
    }
}

/// Ensures the worker holds a fresh token; returns false when refresh is
/// impossible, which ends the worker.
async fn ensure_token(shared: &Shared, api: &GalaxyApi, tid: usize) -> bool {
    if !api.is_token_expired() {
        return true;
    }
    match api.refresh_login().await {
        Ok(()) => true,
        Err(e) => {
            shared.msg(format!("Failed to refresh login: {}", e), MsgKind::Error, tid);
            false
        }
    }
}

async fn probe_content_length(api: &GalaxyApi, url: &str) -> Option<u64> {
    let resp = api.http().inner().head(url).send().await.ok()?;
    resp.headers()
        .get(reqwest::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Timestamped rename suffix for a superseded version.
pub fn old_version_name(path: &str) -> String {
    format!(
        "{}.{}.old",
        path,
        chrono::Local::now().format("%Y%m%dT%H%M%S")
    )
}

pub async fn process_file_queue(shared: Arc<Shared>, tid: usize) {
    let api = shared.api.clone();
    let cfg = &shared.cfg;

    if !ensure_token(&shared, &api, tid).await {
        shared.slots.report(tid, ProgressEvent::State(WorkerState::Finished));
        return;
    }

    while let Some(gf) = shared.file_queue.try_pop() {
        shared.slots.report(tid, ProgressEvent::State(WorkerState::Starting));
        shared.remaining_bytes.fetch_sub(gf.size, Ordering::SeqCst);

        let filepath = PathBuf::from(&gf.target_path);
        let filename = filepath
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| gf.target_path.clone());

        if cfg.blacklist.is_blacklisted(&gf.target_path) {
            shared.msg(
                format!("Blacklisted file: {}", gf.target_path),
                MsgKind::Info,
                tid,
            );
            continue;
        }

        if !shared.ensure_parent_dirs(&filepath, tid) {
            shared.record_failure();
            continue;
        }

        if !ensure_token(&shared, &api, tid).await {
            shared.slots.report(tid, ProgressEvent::State(WorkerState::Finished));
            return;
        }

        // the downlink document is time-scoped and fetched per session
        let downlink_json = match api.get_json(&gf.downlink).await {
            Ok(v) => v,
            Err(e) => {
                shared.msg(
                    format!("Downlink fetch failed, skipping file: {}", e),
                    MsgKind::Warning,
                    tid,
                );
                shared.record_failure();
                continue;
            }
        };
        let Some(url) = downlink_json.get("downlink").and_then(|v| v.as_str()) else {
            shared.msg("Invalid JSON response, skipping file", MsgKind::Warning, tid);
            shared.record_failure();
            continue;
        };
        let url = url.to_string();

        // remote verifier XML exists for installers and patches only
        let mut remote_text = String::new();
        if (gf.kind.is_installer() || gf.kind.is_patch()) && cfg.dl.remote_xml {
            if let Some(xml_url) = downlink_json
                .get("checksum")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
            {
                remote_text = api.get_text(xml_url).await.unwrap_or_default();
            }
        }
        let remote_xml = if remote_text.is_empty() {
            None
        } else {
            FileVerifier::parse(&remote_text).ok()
        };

        let slug = sidecar_slug(&gf).to_string();
        let local_xml_path = verify::xml_path(&cfg.xml_dir, &slug, &filename);
        let local_xml_exists = local_xml_path.exists();

        let mut same_version = true;
        if let Some(remote) = &remote_xml {
            if let Ok(local) = FileVerifier::load(&local_xml_path) {
                if !local.md5.is_empty() && local.md5 != remote.md5 {
                    same_version = false;
                }
            }
        }

        let mut resume_from = 0u64;
        let mut is_complete = false;
        let mut had_existing = false;
        if filepath.is_file() {
            if same_version {
                had_existing = true;
                let local_size = std::fs::metadata(&filepath).map(|m| m.len()).unwrap_or(0);
                resume_from = local_size;
                if let Some(remote) = &remote_xml {
                    if local_size == remote.total_size {
                        is_complete = true;
                    }
                } else if gf.kind.is_extra() {
                    // extras carry no server XML and the API size can't
                    // be trusted; probe the server unless told otherwise
                    let expected = if shared.cfg.args.trust_api_for_extras {
                        Some(gf.size)
                    } else {
                        probe_content_length(&api, &url).await
                    };
                    if expected == Some(local_size) {
                        is_complete = true;
                    }
                }
                if is_complete {
                    shared.msg(
                        format!("Skipping complete file: {}", filename),
                        MsgKind::Info,
                        tid,
                    );
                }
            } else {
                shared.msg(
                    "Remote file is different, renaming local file",
                    MsgKind::Info,
                    tid,
                );
                let new_name = old_version_name(&gf.target_path);
                if std::fs::rename(&filepath, &new_name).is_err() {
                    shared.msg(
                        format!("Failed to rename {} to {} - skipping file", gf.target_path, new_name),
                        MsgKind::Warning,
                        tid,
                    );
                    shared.record_failure();
                    continue;
                }
                resume_from = 0;
            }
        }

        // keep the remote XML for future version checks
        if !remote_text.is_empty() && (!local_xml_exists || !same_version) {
            {
                let _guard = shared.mkdir_lock.lock().unwrap();
                if let Some(parent) = local_xml_path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
            }
            if let Err(e) = std::fs::write(&local_xml_path, &remote_text) {
                shared.msg(
                    format!("Can't create {}: {}", local_xml_path.display(), e),
                    MsgKind::Error,
                    tid,
                );
            }
        }

        if is_complete {
            continue;
        }

        let total = remote_xml
            .as_ref()
            .map(|r| r.total_size)
            .filter(|t| *t > 0)
            .unwrap_or(gf.size);
        shared.slots.report(
            tid,
            ProgressEvent::File {
                name: filename.clone(),
                total,
            },
        );
        if resume_from > 0 {
            shared.slots.report(tid, ProgressEvent::Advance(resume_from));
            shared.msg(
                format!("Resuming {} at byte {}", filename, resume_from),
                MsgKind::Info,
                tid,
            );
        }
        shared.slots.report(tid, ProgressEvent::State(WorkerState::Running));

        let result = api
            .http()
            .download_to_file(
                &url,
                None,
                &filepath,
                resume_from,
                |delta| shared.slots.report(tid, ProgressEvent::Advance(delta)),
                |attempt, err| {
                    shared.slots.report(tid, ProgressEvent::State(WorkerState::Retrying));
                    shared.msg(
                        format!("Retry {}/{}: {} ({})", attempt, cfg.retries, filename, err),
                        MsgKind::Info,
                        tid,
                    );
                    shared.slots.report(tid, ProgressEvent::State(WorkerState::Running));
                },
            )
            .await;

        match result {
            Ok(outcome) => {
                if let Some(mtime) = outcome.server_mtime {
                    let _ = utils::set_file_mtime(&filepath, mtime);
                }
                let rate = shared.slots.snapshot(tid).rate;
                shared.msg(
                    format!("Download complete: {} (@ {})", filename, utils::rate_string(rate)),
                    MsgKind::Success,
                    tid,
                );

                if cfg.dl.automatic_xml_creation
                    && (gf.kind.is_extra()
                        || (cfg.dl.remote_xml && !local_xml_exists && remote_text.is_empty()))
                {
                    shared.xml_queue.push(gf);
                }
            }
            Err(e) => {
                shared.record_failure();
                shared.msg(
                    format!("Download failed ({}): {}", e, filename),
                    MsgKind::Warning,
                    tid,
                );
                // a truncated first attempt is useless; resumable files
                // stay for the next run
                if filepath.is_file() {
                    let len = std::fs::metadata(&filepath).map(|m| m.len()).unwrap_or(0);
                    if len == 0 || !had_existing {
                        if std::fs::remove_file(&filepath).is_err() {
                            shared.msg(
                                format!("Failed to delete {}", filename),
                                MsgKind::Error,
                                tid,
                            );
                        }
                    }
                }
            }
        }
    }

    shared.slots.report(tid, ProgressEvent::State(WorkerState::Finished));
    shared.msg("Finished all tasks", MsgKind::Info, tid);
}

/// Decides where to restart a partially present depot item: `Some(j)`
/// resumes at chunk j, `None` means the file must be thrown away.
/// The byte length must sit exactly on a chunk boundary and the chunk
/// before the boundary must hash correctly.
pub fn depot_resume_chunk(item: &DepotItem, path: &Path, filesize: u64) -> Option<usize> {
    let boundary = item
        .chunks
        .iter()
        .position(|c| c.offset_uncompressed == filesize)?;
    if boundary == 0 {
        return None;
    }
    let prev = &item.chunks[boundary - 1];
    let hash = utils::file_md5_range(path, prev.offset_uncompressed, prev.size_uncompressed).ok()?;
    if hash == prev.md5_uncompressed {
        Some(boundary)
    } else {
        None
    }
}

pub async fn process_depot_queue(shared: Arc<Shared>, install_path: PathBuf, tid: usize) {
    let api = shared.api.clone();
    let cfg = &shared.cfg;

    if !ensure_token(&shared, &api, tid).await {
        shared.slots.report(tid, ProgressEvent::State(WorkerState::Finished));
        return;
    }

    while let Some(item) = shared.depot_queue.try_pop() {
        shared.slots.report(tid, ProgressEvent::State(WorkerState::Starting));
        shared
            .remaining_bytes
            .fetch_sub(item.total_size_compressed, Ordering::SeqCst);

        let path = install_path.join(&item.path);
        if !shared.ensure_parent_dirs(&path, tid) {
            shared.record_failure();
            continue;
        }

        let mut start_chunk = 0usize;
        if path.exists() {
            shared.msg(
                format!("File already exists: {}", path.display()),
                MsgKind::Info,
                tid,
            );
            let filesize = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

            if filesize == item.total_size_uncompressed {
                let intact = item.total_size_uncompressed == 0
                    || utils::file_md5(&path).map(|h| h == item.md5).unwrap_or(false);
                if intact {
                    shared.msg(format!("{}: OK", path.display()), MsgKind::Success, tid);
                    continue;
                }
                shared.msg(
                    format!("{}: MD5 mismatch", path.display()),
                    MsgKind::Warning,
                    tid,
                );
                if std::fs::remove_file(&path).is_err() {
                    shared.msg(
                        format!("{}: Failed to delete", path.display()),
                        MsgKind::Error,
                        tid,
                    );
                    shared.record_failure();
                    continue;
                }
            } else if filesize > item.total_size_uncompressed {
                shared.msg(
                    format!(
                        "{}: File is bigger than expected. Deleting old file and starting from beginning",
                        path.display()
                    ),
                    MsgKind::Info,
                    tid,
                );
                if std::fs::remove_file(&path).is_err() {
                    shared.msg(
                        format!("{}: Failed to delete", path.display()),
                        MsgKind::Error,
                        tid,
                    );
                    shared.record_failure();
                    continue;
                }
            } else {
                match depot_resume_chunk(&item, &path, filesize) {
                    Some(chunk) => {
                        shared.msg(
                            format!("{}: Resume from chunk {}", path.display(), chunk),
                            MsgKind::Info,
                            tid,
                        );
                        start_chunk = chunk;
                    }
                    None => {
                        shared.msg(
                            format!(
                                "{}: Failed to find valid resume position. Deleting old file and starting from beginning.",
                                path.display()
                            ),
                            MsgKind::Warning,
                            tid,
                        );
                        if std::fs::remove_file(&path).is_err() {
                            shared.msg(
                                format!("{}: Failed to delete", path.display()),
                                MsgKind::Error,
                                tid,
                            );
                            shared.record_failure();
                            continue;
                        }
                    }
                }
            }
        }

        if item.chunks.is_empty() {
            if let Err(e) = std::fs::File::create(&path) {
                shared.msg(
                    format!("{}: Failed to create ({})", path.display(), e),
                    MsgKind::Error,
                    tid,
                );
                shared.record_failure();
            }
            continue;
        }

        shared.slots.report(
            tid,
            ProgressEvent::File {
                name: item.path.clone(),
                total: item.total_size_compressed,
            },
        );
        let resumed_bytes: u64 = item.chunks[..start_chunk]
            .iter()
            .map(|c| c.size_compressed)
            .sum();
        if resumed_bytes > 0 {
            shared.slots.report(tid, ProgressEvent::Advance(resumed_bytes));
        }
        shared.slots.report(tid, ProgressEvent::State(WorkerState::Running));

        let mut mtime: Option<i64> = None;
        let mut failed = false;

        for (j, chunk) in item.chunks.iter().enumerate().skip(start_chunk) {
            if !ensure_token(&shared, &api, tid).await {
                shared.slots.report(tid, ProgressEvent::State(WorkerState::Finished));
                return;
            }

            let galaxy_path = api::hash_to_galaxy_path(&chunk.md5_compressed);

            // regular products reuse the secure-link templates, keyed by
            // product id; dependency links are single use
            let templates = if item.is_dependency {
                None
            } else {
                shared.cdn_templates.get(&item.product_id).map(|t| t.value().clone())
            };
            let templates = match templates {
                Some(t) => t,
                None => {
                    let link = if item.is_dependency {
                        api.dependency_link(&galaxy_path).await
                    } else {
                        api.secure_link(&item.product_id, "/").await
                    };
                    let json = match link {
                        Ok(j) => j,
                        Err(e) => {
                            shared.msg(
                                format!(
                                    "{}: secure link failed (chunk #{}: {}): {}",
                                    path.display(),
                                    j,
                                    chunk.md5_compressed,
                                    e
                                ),
                                MsgKind::Error,
                                tid,
                            );
                            failed = true;
                            break;
                        }
                    };
                    let t = api::cdn_url_templates(&json, &cfg.dl.galaxy_cdn_priority);
                    if t.is_empty() {
                        shared.msg(
                            format!("{}: Failed to get download url", path.display()),
                            MsgKind::Error,
                            tid,
                        );
                        failed = true;
                        break;
                    }
                    if !item.is_dependency {
                        shared.cdn_templates.insert(item.product_id.clone(), t.clone());
                    }
                    t
                }
            };

            let url = if item.is_dependency {
                templates[0].replace(api::GALAXY_PATH_MARKER, "")
            } else {
                templates[0].replace(api::GALAXY_PATH_MARKER, &format!("/{}", galaxy_path))
            };

            let chunk_label = format!("{} (chunk {}/{})", item.path, j + 1, item.chunks.len());
            let mut buf: Vec<u8> = Vec::with_capacity(chunk.size_compressed as usize);
            let result = api
                .http()
                .download_range_to_buffer(
                    &url,
                    None,
                    None,
                    &mut buf,
                    |delta| shared.slots.report(tid, ProgressEvent::Advance(delta)),
                    |attempt, err| {
                        shared.slots.report(tid, ProgressEvent::State(WorkerState::Retrying));
                        shared.msg(
                            format!("Retry {}/{}: {} ({})", attempt, cfg.retries, chunk_label, err),
                            MsgKind::Info,
                            tid,
                        );
                        shared.slots.report(tid, ProgressEvent::State(WorkerState::Running));
                    },
                )
                .await;

            match result {
                Ok(outcome) => {
                    if let Some(t) = outcome.server_mtime {
                        mtime = Some(t);
                    }
                }
                Err(e) => {
                    shared.msg(format!("{}: {}", chunk_label, e), MsgKind::Error, tid);
                    failed = true;
                    break;
                }
            }

            // chunks are zlib streams; append the decompressed bytes
            if let Err(e) = append_zlib_chunk(&path, &buf) {
                shared.msg(
                    format!("{}: failed to write chunk: {}", path.display(), e),
                    MsgKind::Error,
                    tid,
                );
                failed = true;
                break;
            }
        }

        if failed {
            shared.record_failure();
            shared.msg(
                format!("{}: Chunk failure, skipping file", path.display()),
                MsgKind::Error,
                tid,
            );
            continue;
        }

        if let Some(t) = mtime {
            let _ = utils::set_file_mtime(&path, t);
        }
        shared.msg(
            format!("Download complete: {}", path.display()),
            MsgKind::Success,
            tid,
        );
    }

    shared.slots.report(tid, ProgressEvent::State(WorkerState::Finished));
    shared.msg("Finished all tasks", MsgKind::Info, tid);
}

/// Decompresses one zlib chunk and appends it to the target file.
fn append_zlib_chunk(path: &Path, compressed: &[u8]) -> std::io::Result<()> {
    use std::io::Read;
    let mut decoder = flate2::read::ZlibDecoder::new(compressed);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = decoder.read(&mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
    }
    file.flush()
}

/// Post-pass for items packed inside the small-files container: copy
/// each member's byte range out of the container file, then drop the
/// container.
pub fn extract_sfc_items(items: &[DepotItem], install_path: &Path) -> std::io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};

    let Some(sfc) = items.iter().find(|i| i.is_small_files_container) else {
        return Ok(());
    };
    let sfc_path = install_path.join(&sfc.path);
    if !sfc_path.exists() {
        return Ok(());
    }

    let mut container = std::fs::File::open(&sfc_path)?;
    for item in items.iter().filter(|i| i.sfc_offset.is_some()) {
        let offset = item.sfc_offset.unwrap_or(0);
        let size = item.sfc_size.unwrap_or(0);
        let target = install_path.join(&item.path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        container.seek(SeekFrom::Start(offset))?;
        let mut remaining = size;
        let mut out = std::fs::File::create(&target)?;
        let mut buf = [0u8; 64 * 1024];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = container.read(&mut buf[..want])?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            remaining -= n as u64;
        }
    }

    std::fs::remove_file(&sfc_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DepotChunk, FileKind};

    fn item_with_chunks(sizes: &[(u64, &str)]) -> DepotItem {
        let mut item = DepotItem::default();
        for (size, md5) in sizes {
            let chunk = DepotChunk {
                md5_compressed: String::new(),
                md5_uncompressed: md5.to_string(),
                size_compressed: *size,
                size_uncompressed: *size,
                offset_compressed: item.total_size_compressed,
                offset_uncompressed: item.total_size_uncompressed,
            };
            item.total_size_compressed += size;
            item.total_size_uncompressed += size;
            item.chunks.push(chunk);
        }
        item
    }

    #[test]
    fn resume_on_exact_chunk_boundary() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("file.bin");
        let data = vec![3u8; 100];
        std::fs::write(&path, &data).unwrap();

        let first_hash = utils::chunk_md5(&data);
        let item = item_with_chunks(&[(100, first_hash.as_str()), (100, "other")]);

        assert_eq!(depot_resume_chunk(&item, &path, 100), Some(1));
    }

    #[test]
    fn resume_rejected_off_boundary_or_bad_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("file.bin");
        std::fs::write(&path, vec![3u8; 100]).unwrap();

        let item = item_with_chunks(&[(100, "not_the_hash"), (100, "other")]);
        // hash of previous chunk disagrees
        assert_eq!(depot_resume_chunk(&item, &path, 100), None);
        // size not on a boundary
        assert_eq!(depot_resume_chunk(&item, &path, 50), None);
        // boundary zero means start over anyway
        assert_eq!(depot_resume_chunk(&item, &path, 0), None);
    }

    #[test]
    fn sidecar_slug_prefers_dlc() {
        let mut gf = GameFile {
            kind: FileKind::BaseInstaller,
            gamename: "base".into(),
            title: String::new(),
            dlc_gamename: String::new(),
            dlc_title: String::new(),
            id: String::new(),
            name: String::new(),
            path: String::new(),
            size: 0,
            platform: 0,
            language: 0,
            version: String::new(),
            downlink: String::new(),
            updated: false,
            silent: false,
            score: 0,
            target_path: String::new(),
        };
        assert_eq!(sidecar_slug(&gf), "base");
        gf.kind = FileKind::DlcInstaller;
        gf.dlc_gamename = "base_dlc".into();
        assert_eq!(sidecar_slug(&gf), "base_dlc");
    }

    #[test]
    fn zlib_chunks_append_in_order() {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.bin");

        for payload in [&b"first-"[..], &b"second"[..]] {
            let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
            enc.write_all(payload).unwrap();
            let compressed = enc.finish().unwrap();
            append_zlib_chunk(&path, &compressed).unwrap();
        }

        assert_eq!(std::fs::read(&path).unwrap(), b"first-second");
    }

    #[test]
    fn sfc_extraction_slices_members() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("galaxy_smallfilescontainer"), b"aaabbbbcc").unwrap();

        let sfc = DepotItem {
            path: "galaxy_smallfilescontainer".into(),
            is_small_files_container: true,
            ..DepotItem::default()
        };
        let a = DepotItem {
            path: "dir/a.txt".into(),
            sfc_offset: Some(0),
            sfc_size: Some(3),
            ..DepotItem::default()
        };
        let b = DepotItem {
            path: "b.txt".into(),
            sfc_offset: Some(3),
            sfc_size: Some(4),
            ..DepotItem::default()
        };

        extract_sfc_items(&[sfc, a, b], tmp.path()).unwrap();
        assert_eq!(std::fs::read(tmp.path().join("dir/a.txt")).unwrap(), b"aaa");
        assert_eq!(std::fs::read(tmp.path().join("b.txt")).unwrap(), b"bbbb");
        assert!(!tmp.path().join("galaxy_smallfilescontainer").exists());
    }
}
