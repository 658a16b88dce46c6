//! Installer-as-repository fallback.
//!
//! When the content system has no builds for the configured platform,
//! a monolithic installer (shell script + zip) is treated as a synthetic
//! repository: its central directory is parsed over HTTP range requests
//! and each member is downloaded as its own byte range and inflated
//! locally. Members smaller than 5 MiB are handled in memory; larger
//! ones stream into a `.~incomplete` temp file first. Symlink members
//! carry their target as the payload.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use regex::Regex;

use super::progress::{MsgKind, ProgressEvent, ProgressSink, WorkerState};
use super::Shared;
use crate::api::GalaxyApi;
use crate::models::GameFile;
use crate::utils;
use crate::verify::FileVerifier;
use crate::zip::{self, ZipMember};

const HEAD_FETCH: u64 = 100 << 10;
const TAIL_FETCH: u64 = 200 << 10;
/// Members below this compressed size are processed fully in memory.
const IN_MEMORY_LIMIT: u64 = 5 << 20;

pub const INCOMPLETE_SUFFIX: &str = ".~incomplete";
const NOARCH_PREFIX: &str = "data/noarch/";
const SPLIT_FILES_LIST: &str = "data/noarch/support/split_files";

/// Resolves an installer file unit into its zip member list without
/// downloading the archive: head fetch for the script prelude, tail
/// fetch for the central directory.
pub async fn zip_members_for_installer(api: &GalaxyApi, gf: &GameFile) -> Result<Vec<ZipMember>> {
    let downlink_json = api.get_json(&gf.downlink).await?;
    let installer_url = downlink_json
        .get("downlink")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("downlink response without download url"))?
        .to_string();

    // total size from the checksum XML, Content-Length as fallback
    let mut file_size = 0u64;
    if let Some(xml_url) = downlink_json
        .get("checksum")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
    {
        if let Ok(text) = api.get_text(xml_url).await {
            if let Ok(verifier) = FileVerifier::parse(&text) {
                file_size = verifier.total_size;
            }
        }
    }
    if file_size == 0 {
        let resp = api.http().inner().head(&installer_url).send().await?;
        file_size = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
    }
    if file_size == 0 {
        return Err(anyhow!("failed to determine installer size"));
    }

    let mut head = Vec::new();
    api.http()
        .download_range_to_buffer(
            &installer_url,
            None,
            Some((0, HEAD_FETCH)),
            &mut head,
            |_| {},
            |_, _| {},
        )
        .await?;

    let script_size = zip::mojosetup_script_size(&head)
        .ok_or_else(|| anyhow!("failed to locate script prelude size"))?;
    let payload_size = zip::mojosetup_installer_size(&head)
        .ok_or_else(|| anyhow!("failed to locate archive payload size"))?;
    let zip_start = script_size + payload_size;

    let tail_start = file_size.saturating_sub(TAIL_FETCH);
    let mut tail = Vec::new();
    api.http()
        .download_range_to_buffer(
            &installer_url,
            None,
            Some((tail_start, file_size)),
            &mut tail,
            |_| {},
            |_, _| {},
        )
        .await?;

    let eocd_pos = zip::find_eocd(&tail).ok_or_else(|| anyhow!("zip EOCD not found"))?;
    let mut eocd = zip::read_eocd(&tail, eocd_pos).ok_or_else(|| anyhow!("bad zip EOCD"))?;

    // Zip64 takes over the saturated classic counters
    if let Some(pos64) = zip::find_eocd64(&tail) {
        if let Some(eocd64) = zip::read_eocd64(&tail, pos64) {
            if eocd.cd_start_offset == u32::MAX as u64 {
                eocd.cd_start_offset = eocd64.cd_start_offset;
            }
            if eocd.cd_records_total == u16::MAX as u64 {
                eocd.cd_records_total = eocd64.cd_records_total;
            }
        }
    }

    // the central directory may start before the tail window
    let cd_in_installer = zip_start + eocd.cd_start_offset;
    let (cd_window, cd_pos) = if cd_in_installer < tail_start {
        let mut window = Vec::new();
        api.http()
            .download_range_to_buffer(
                &installer_url,
                None,
                Some((cd_in_installer, file_size)),
                &mut window,
                |_| {},
                |_, _| {},
            )
            .await?;
        (window, 0usize)
    } else {
        let pos = (cd_in_installer - tail_start) as usize;
        (tail, pos)
    };

    let entries = zip::read_cd_entries(&cd_window, cd_pos, eocd.cd_records_total);
    if entries.is_empty() {
        return Err(anyhow!("zip central directory not found"));
    }

    Ok(zip::members_from_entries(
        entries,
        zip_start,
        cd_in_installer,
        &installer_url,
    ))
}

/// Downloads and decodes the split_files support list, returning the
/// base paths rebased onto the install path.
pub async fn split_file_base_paths(
    api: &GalaxyApi,
    members: &[ZipMember],
    install_path: &str,
) -> Vec<String> {
    let Some(list) = members.iter().find(|m| m.path.contains(SPLIT_FILES_LIST)) else {
        return Vec::new();
    };

    let mut raw = Vec::new();
    if api
        .http()
        .download_range_to_buffer(
            &list.installer_url,
            None,
            Some((list.start_offset, list.end_offset)),
            &mut raw,
            |_| {},
            |_, _| {},
        )
        .await
        .is_err()
    {
        return Vec::new();
    }

    let Ok(text) = extract_ranged_member(&raw).and_then(|b| {
        String::from_utf8(b).map_err(|e| anyhow!("split list is not utf-8: {}", e))
    }) else {
        return Vec::new();
    };

    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let rebased = line.replacen("./", &format!("{}/", install_path), 1);
            crate::paths::collapse_slashes(&rebased)
        })
        .collect()
}

/// A downloaded member range starts with its local file header; parse it
/// and inflate the payload behind it.
pub fn extract_ranged_member(raw: &[u8]) -> Result<Vec<u8>> {
    let (entry, header_len) =
        zip::read_local_entry(raw).ok_or_else(|| anyhow!("missing local file header"))?;
    let end = (header_len as u64 + entry.comp_size).min(raw.len() as u64) as usize;
    Ok(zip::extract_member(
        &raw[header_len..end],
        entry.compression_method,
    )?)
}

/// Work-list preparation: keep members under data/noarch/, rebase their
/// paths onto the install path, separate directories, classify split
/// parts and drop blacklisted paths. Returns (downloadable members,
/// split-file map keyed by base path, directories to create).
pub fn prepare_members(
    members: Vec<ZipMember>,
    install_path: &str,
    split_bases: &[String],
    blacklist: &crate::blacklist::Blacklist,
) -> (Vec<ZipMember>, HashMap<String, Vec<ZipMember>>, Vec<String>) {
    let split_re = Regex::new(r"^(.*)(\.split\d+)$").expect("static regex");

    let mut files: Vec<ZipMember> = Vec::new();
    let mut symlinks: Vec<ZipMember> = Vec::new();
    let mut split_parts: Vec<ZipMember> = Vec::new();
    let mut directories: Vec<String> = Vec::new();

    for mut member in members {
        let Some(noarch_pos) = member.path.find(NOARCH_PREFIX) else {
            continue;
        };
        let relative = &member.path[noarch_pos + NOARCH_PREFIX.len()..];
        if relative.is_empty() {
            continue;
        }
        member.path = crate::paths::collapse_slashes(&format!("{}/{}", install_path, relative));

        if member.path.ends_with('/') {
            directories.push(member.path.trim_end_matches('/').to_string());
            continue;
        }

        if blacklist.is_blacklisted(&member.path) {
            continue;
        }

        if zip::is_symlink(member.unix_mode) {
            symlinks.push(member);
            continue;
        }

        if !split_bases.is_empty() {
            if let Some(caps) = split_re.captures(&member.path.clone()) {
                let base = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                if split_bases.iter().any(|b| b == base) {
                    member.is_split_file = true;
                    member.split_base_path = base.to_string();
                    split_parts.push(member);
                    continue;
                }
            }
        }

        files.push(member);
    }

    // assign the byte range each part occupies in the combined file
    split_parts.sort_by(|a, b| a.path.cmp(&b.path));
    let mut split_map: HashMap<String, Vec<ZipMember>> = HashMap::new();
    let mut prev_base = String::new();
    let mut prev_end = 0u64;
    for part in &mut split_parts {
        part.split_start_offset = if part.split_base_path == prev_base {
            prev_end
        } else {
            0
        };
        part.split_end_offset = part.split_start_offset + part.uncomp_size;
        prev_base = part.split_base_path.clone();
        prev_end = part.split_end_offset;
        split_map
            .entry(part.split_base_path.clone())
            .or_default()
            .push(part.clone());
    }

    files.extend(split_parts);
    files.extend(symlinks);
    (files, split_map, directories)
}

pub async fn process_zip_queue(shared: Arc<Shared>, tid: usize) {
    let api = shared.api.clone();
    let cfg = &shared.cfg;

    while let Some(member) = shared.zip_queue.try_pop() {
        shared.slots.report(tid, ProgressEvent::State(WorkerState::Starting));
        shared.remaining_bytes.fetch_sub(member.comp_size, Ordering::SeqCst);

        let path = PathBuf::from(&member.path);
        let tmp_path = PathBuf::from(format!("{}{}", member.path, INCOMPLETE_SUFFIX));

        if !shared.ensure_parent_dirs(&path, tid) {
            shared.record_failure();
            continue;
        }

        if zip::is_symlink(member.unix_mode) {
            if path.is_symlink() {
                shared.msg(
                    format!("Symlink already exists: {}", path.display()),
                    MsgKind::Info,
                    tid,
                );
                continue;
            }
            if let Err(e) = create_symlink_member(&api, &member, &path).await {
                shared.record_failure();
                shared.msg(
                    format!("{}: {}", path.display(), e),
                    MsgKind::Error,
                    tid,
                );
                continue;
            }
            shared.msg(
                format!("Download complete: {}", path.display()),
                MsgKind::Success,
                tid,
            );
            continue;
        }

        // a completed combine run already holds this part's bytes
        if member.is_split_file && Path::new(&member.split_base_path).exists() {
            let same = utils::file_crc32_range(
                Path::new(&member.split_base_path),
                member.split_start_offset,
                member.uncomp_size,
            )
            .map(|crc| crc == format!("{:08x}", member.crc32))
            .unwrap_or(false);
            if same {
                shared.msg(
                    format!(
                        "{}: combined file already holds this part, skipping",
                        path.display()
                    ),
                    MsgKind::Info,
                    tid,
                );
                continue;
            }
        }

        if path.exists() {
            let filesize = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let intact = filesize == member.uncomp_size
                && utils::file_crc32(&path)
                    .map(|crc| crc == format!("{:08x}", member.crc32))
                    .unwrap_or(false);
            if intact {
                shared.msg(format!("{}: OK", path.display()), MsgKind::Success, tid);
                continue;
            }
            shared.msg(
                format!("{}: size or CRC32 mismatch. Deleting old file.", path.display()),
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

        shared.slots.report(
            tid,
            ProgressEvent::File {
                name: member.path.clone(),
                total: member.comp_size,
            },
        );
        shared.slots.report(tid, ProgressEvent::State(WorkerState::Running));

        let result = if member.comp_size < IN_MEMORY_LIMIT {
            download_member_in_memory(&shared, &api, &member, &path, tid).await
        } else {
            download_member_to_temp(&shared, &api, &member, &path, &tmp_path, tid).await
        };

        match result {
            Ok(()) => {
                #[cfg(unix)]
                let _ = utils::set_mode_bits(&path, member.unix_mode as u32);
                if let Some(ts) = member.timestamp {
                    let _ = utils::set_file_mtime(&path, ts);
                }
                shared.msg(
                    format!("Download complete: {}", path.display()),
                    MsgKind::Success,
                    tid,
                );
            }
            Err(e) => {
                shared.record_failure();
                shared.msg(format!("{}: {}", path.display(), e), MsgKind::Error, tid);
                if path.is_file() {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
    }

    shared.slots.report(tid, ProgressEvent::State(WorkerState::Finished));
    shared.msg("Finished all tasks", MsgKind::Info, tid);
}

async fn create_symlink_member(api: &GalaxyApi, member: &ZipMember, path: &Path) -> Result<()> {
    let mut raw = Vec::new();
    api.http()
        .download_range_to_buffer(
            &member.installer_url,
            None,
            Some((member.start_offset, member.end_offset)),
            &mut raw,
            |_| {},
            |_, _| {},
        )
        .await?;
    let target_bytes = extract_ranged_member(&raw)?;
    let target = String::from_utf8_lossy(&target_bytes).trim().to_string();
    if target.is_empty() {
        return Err(anyhow!("empty symlink target"));
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(&target, path)?;
    #[cfg(not(unix))]
    let _ = (target, path);
    Ok(())
}

async fn download_member_in_memory(
    shared: &Shared,
    api: &GalaxyApi,
    member: &ZipMember,
    path: &Path,
    tid: usize,
) -> Result<()> {
    let mut raw = Vec::with_capacity(member.comp_size as usize);
    api.http()
        .download_range_to_buffer(
            &member.installer_url,
            None,
            Some((member.start_offset, member.end_offset)),
            &mut raw,
            |delta| shared.slots.report(tid, ProgressEvent::Advance(delta)),
            |attempt, err| {
                shared.slots.report(tid, ProgressEvent::State(WorkerState::Retrying));
                shared.msg(
                    format!("Retry {}/{}: {} ({})", attempt, shared.cfg.retries, member.path, err),
                    MsgKind::Info,
                    tid,
                );
                shared.slots.report(tid, ProgressEvent::State(WorkerState::Running));
            },
        )
        .await?;

    let data = extract_ranged_member(&raw)?;
    std::fs::write(path, data)?;
    Ok(())
}

async fn download_member_to_temp(
    shared: &Shared,
    api: &GalaxyApi,
    member: &ZipMember,
    path: &Path,
    tmp_path: &Path,
    tid: usize,
) -> Result<()> {
    // resume a previous attempt unless it overshot
    let mut resume_from = 0u64;
    if let Ok(meta) = std::fs::metadata(tmp_path) {
        let range_len = member.end_offset - member.start_offset + 1;
        if meta.len() < range_len {
            resume_from = meta.len();
        } else if std::fs::remove_file(tmp_path).is_err() {
            return Err(anyhow!("failed to delete stale temp file"));
        }
    }
    if resume_from > 0 {
        shared.slots.report(tid, ProgressEvent::Advance(resume_from));
    }

    let mut file = if resume_from > 0 {
        std::fs::OpenOptions::new().append(true).open(tmp_path)?
    } else {
        std::fs::File::create(tmp_path)?
    };

    let mut buffered = Vec::new();
    api.http()
        .download_range_to_buffer(
            &member.installer_url,
            None,
            Some((member.start_offset + resume_from, member.end_offset)),
            &mut buffered,
            |delta| shared.slots.report(tid, ProgressEvent::Advance(delta)),
            |attempt, err| {
                shared.slots.report(tid, ProgressEvent::State(WorkerState::Retrying));
                shared.msg(
                    format!("Retry {}/{}: {} ({})", attempt, shared.cfg.retries, member.path, err),
                    MsgKind::Info,
                    tid,
                );
                shared.slots.report(tid, ProgressEvent::State(WorkerState::Running));
            },
        )
        .await?;
    file.write_all(&buffered)?;
    file.flush()?;
    drop(file);

    // inflate from the temp copy, then drop it
    let raw = std::fs::read(tmp_path)?;
    let data = extract_ranged_member(&raw)?;
    std::fs::write(path, data)?;
    std::fs::remove_file(tmp_path)?;
    Ok(())
}

/// Concatenates downloaded split parts into their base file. With
/// `append_to_first` the first part becomes the base file by rename;
/// otherwise a fresh base file is created. Parts are deleted as they are
/// consumed; either way the final append is atomic per file.
pub fn combine_split_files(split_map: &HashMap<String, Vec<ZipMember>>, append_to_first: bool) {
    for (base, parts) in split_map {
        let all_parts_exist = parts.iter().all(|p| Path::new(&p.path).exists());
        let base_exists = Path::new(base).exists();

        if !all_parts_exist {
            if base_exists {
                // parts were consumed by an earlier combine
                continue;
            }
            println!("{} is missing parts. Skipping this file.", base);
            continue;
        }

        if base_exists {
            println!("{} already exists. Deleting old file.", base);
            if std::fs::remove_file(base).is_err() {
                eprintln!("{}: Failed to delete", base);
                continue;
            }
        }

        println!("Beginning to combine {}", base);
        let (sink_path, skip_first) = if append_to_first {
            (parts[0].path.clone(), true)
        } else {
            (base.clone(), false)
        };

        let mut ok = true;
        {
            let mut sink = match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&sink_path)
            {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("Failed to open {}: {}", sink_path, e);
                    continue;
                }
            };

            for part in parts.iter().skip(skip_first as usize) {
                println!("\t{}", part.path);
                let mut input = match std::fs::File::open(&part.path) {
                    Ok(f) => f,
                    Err(e) => {
                        eprintln!("Failed to open {}: {}", part.path, e);
                        ok = false;
                        break;
                    }
                };
                let mut buf = [0u8; 64 * 1024];
                loop {
                    match input.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if sink.write_all(&buf[..n]).is_err() {
                                ok = false;
                                break;
                            }
                        }
                        Err(_) => {
                            ok = false;
                            break;
                        }
                    }
                }
                if !ok {
                    break;
                }
                let _ = std::fs::remove_file(&part.path);
            }
        }

        if !ok {
            let _ = std::fs::remove_file(&sink_path);
            continue;
        }

        if append_to_first {
            if let Err(e) = std::fs::rename(&sink_path, base) {
                eprintln!("Failed to rename {} to {}: {}", sink_path, base, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::Blacklist;

    fn member(path: &str, mode: u16, comp: u64, uncomp: u64) -> ZipMember {
        ZipMember {
            path: path.into(),
            comp_size: comp,
            uncomp_size: uncomp,
            unix_mode: mode,
            compression_method: zip::COMPRESSION_DEFLATE,
            ..ZipMember::default()
        }
    }

    #[test]
    fn prepare_filters_and_rebases() {
        let members = vec![
            member("data/noarch/", 0o040755, 0, 0),
            member("data/noarch/game/", 0o040755, 0, 0),
            member("data/noarch/game/bin", 0o100755, 10, 20),
            member("data/noarch/link", 0o120777, 5, 5),
            member("meta/whatever", 0o100644, 1, 1),
        ];
        // directory members end with a slash in real archives
        let mut members = members;
        members[1].path = "data/noarch/game/".into();

        let (files, split_map, dirs) =
            prepare_members(members, "/install", &[], &Blacklist::default());
        assert!(split_map.is_empty());
        assert_eq!(dirs, vec!["/install/game".to_string()]);
        // binary + symlink survive, meta/ dropped, symlink ordered last
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "/install/game/bin");
        assert!(zip::is_symlink(files[1].unix_mode));
    }

    #[test]
    fn prepare_respects_blacklist() {
        let bl = Blacklist::from_lines(vec!["R \\.mp4$"]);
        let members = vec![
            member("data/noarch/video.mp4", 0o100644, 10, 10),
            member("data/noarch/game.bin", 0o100644, 10, 10),
        ];
        let (files, _, _) = prepare_members(members, "/i", &[], &bl);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "/i/game.bin");
    }

    #[test]
    fn split_parts_get_cumulative_offsets() {
        let bases = vec!["/i/huge.bin".to_string()];
        let members = vec![
            member("data/noarch/huge.bin.split2", 0o100644, 10, 100),
            member("data/noarch/huge.bin.split1", 0o100644, 10, 150),
            member("data/noarch/other.bin", 0o100644, 10, 10),
        ];
        let (files, split_map, _) =
            prepare_members(members, "/i", &bases, &Blacklist::default());
        assert_eq!(files.len(), 3);

        let parts = &split_map["/i/huge.bin"];
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].path, "/i/huge.bin.split1");
        assert_eq!(parts[0].split_start_offset, 0);
        assert_eq!(parts[0].split_end_offset, 150);
        assert_eq!(parts[1].split_start_offset, 150);
        assert_eq!(parts[1].split_end_offset, 250);
    }

    #[test]
    fn combine_appends_to_first_and_renames() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("big.bin");
        let p1 = tmp.path().join("big.bin.split1");
        let p2 = tmp.path().join("big.bin.split2");
        std::fs::write(&p1, b"AAA").unwrap();
        std::fs::write(&p2, b"BB").unwrap();

        let mut map = HashMap::new();
        map.insert(
            base.to_string_lossy().into_owned(),
            vec![
                ZipMember {
                    path: p1.to_string_lossy().into_owned(),
                    ..ZipMember::default()
                },
                ZipMember {
                    path: p2.to_string_lossy().into_owned(),
                    ..ZipMember::default()
                },
            ],
        );

        combine_split_files(&map, true);
        assert_eq!(std::fs::read(&base).unwrap(), b"AAABB");
        assert!(!p1.exists());
        assert!(!p2.exists());
    }

    #[test]
    fn combine_skips_when_parts_missing_but_base_present() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("done.bin");
        std::fs::write(&base, b"COMPLETE").unwrap();

        let mut map = HashMap::new();
        map.insert(
            base.to_string_lossy().into_owned(),
            vec![ZipMember {
                path: tmp.path().join("done.bin.split1").to_string_lossy().into_owned(),
                ..ZipMember::default()
            }],
        );

        combine_split_files(&map, true);
        // untouched
        assert_eq!(std::fs::read(&base).unwrap(), b"COMPLETE");
    }

    #[test]
    fn ranged_member_extraction_parses_local_header() {
        use flate2::write::DeflateEncoder;
        use flate2::Compression;

        let payload = b"link-target";
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(payload).unwrap();
        let compressed = enc.finish().unwrap();

        // local file header followed by the deflate stream
        let name = b"data/noarch/link";
        let mut raw = Vec::new();
        raw.extend_from_slice(&zip::LOCAL_HEADER_SIGNATURE.to_le_bytes());
        raw.extend_from_slice(&20u16.to_le_bytes()); // version needed
        raw.extend_from_slice(&0u16.to_le_bytes()); // flags
        raw.extend_from_slice(&zip::COMPRESSION_DEFLATE.to_le_bytes());
        raw.extend_from_slice(&0u16.to_le_bytes()); // mod time
        raw.extend_from_slice(&0u16.to_le_bytes()); // mod date
        raw.extend_from_slice(&0u32.to_le_bytes()); // crc
        raw.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        raw.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        raw.extend_from_slice(&(name.len() as u16).to_le_bytes());
        raw.extend_from_slice(&0u16.to_le_bytes()); // extra len
        raw.extend_from_slice(name);
        raw.extend_from_slice(&compressed);

        let out = extract_ranged_member(&raw).unwrap();
        assert_eq!(out, payload);
    }
}
