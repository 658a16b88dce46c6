//! Orphan scanner: files in the download tree that the current plan no
//! longer accounts for.
//!
//! For every game the candidate directories are the game-subdir template
//! expanded once per platform (plus the platform-less form), de-duplicated.
//! Files under those directories that are neither ignorelisted,
//! blacklisted nor part of any planned target path are orphans. An
//! optional regex narrows which files are considered at all.

use std::path::{Path, PathBuf};

use regex::Regex;
use walkdir::WalkDir;

use crate::blacklist::Blacklist;
use crate::config::{Config, PLATFORMS};
use crate::models::{GameDetails, GameFile};
use crate::paths::{self, Transforms};

fn is_planned(lists: &[&Vec<GameFile>], path: &Path, blacklist: &Blacklist) -> bool {
    let path_str = path.to_string_lossy();
    if blacklist.is_blacklisted(&path_str) {
        return false;
    }
    lists
        .iter()
        .any(|list| list.iter().any(|gf| gf.target_path == path_str))
}

fn sidecar_paths(game: &GameDetails) -> Vec<&str> {
    vec![
        game.serials_path.as_str(),
        game.logo_path.as_str(),
        game.icon_path.as_str(),
        game.changelog_path.as_str(),
        game.product_json_path.as_str(),
    ]
}

/// Candidate directories where a game's files may live.
fn game_directories(cfg: &Config, game: &GameDetails, transforms: &Transforms) -> Vec<PathBuf> {
    let template = format!("{}/{}/", cfg.dirs.directory, cfg.dirs.game_subdir);
    let mut platform_ids: Vec<u32> = vec![0];
    platform_ids.extend(PLATFORMS.iter().map(|p| p.id));

    let mut dirs: Vec<PathBuf> = Vec::new();
    for platform in platform_ids {
        let expanded = paths::collapse_slashes(&paths::expand_directory_template(
            &template,
            &game.gamename,
            &game.title,
            platform,
            transforms,
        ));
        let dir = PathBuf::from(expanded);
        if dir.exists() && !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    dirs
}

/// Walks the download tree and returns the orphaned file paths.
pub fn scan(
    games: &[GameDetails],
    cfg: &Config,
    transforms: &Transforms,
    orphan_regex: &str,
) -> Vec<PathBuf> {
    let regex = Regex::new(if orphan_regex.is_empty() { ".*" } else { orphan_regex })
        .unwrap_or_else(|e| {
            eprintln!("invalid orphan regex ({}), matching everything", e);
            Regex::new(".*").expect("static regex")
        });

    let root_prefix_len = cfg.dirs.directory.len();
    let mut orphans: Vec<PathBuf> = Vec::new();

    for (i, game) in games.iter().enumerate() {
        eprint!("\x1b[KChecking for orphaned files {} / {}\r", i + 1, games.len());

        let mut candidates: Vec<PathBuf> = Vec::new();
        for dir in game_directories(cfg, game, transforms) {
            for entry in WalkDir::new(&dir).follow_links(false) {
                let Ok(entry) = entry else { continue };
                if !entry.file_type().is_file() {
                    continue;
                }
                let filepath = entry.path().to_path_buf();
                let path_str = filepath.to_string_lossy().into_owned();
                let relative = path_str.get(root_prefix_len..).unwrap_or(&path_str);

                if cfg.ignorelist.is_blacklisted(relative) {
                    continue;
                }
                if cfg.blacklist.is_blacklisted(relative) {
                    continue;
                }
                if !regex.is_match(&path_str) {
                    continue;
                }
                candidates.push(filepath);
            }
        }

        for filepath in candidates {
            let mut found = is_planned(
                &[&game.installers, &game.extras, &game.patches, &game.languagepacks],
                &filepath,
                &cfg.blacklist,
            );

            if !found {
                let path_str = filepath.to_string_lossy();
                found = sidecar_paths(game).iter().any(|p| *p == path_str);
            }

            if !found {
                for dlc in &game.dlcs {
                    if is_planned(
                        &[&dlc.installers, &dlc.extras, &dlc.patches, &dlc.languagepacks],
                        &filepath,
                        &cfg.blacklist,
                    ) {
                        found = true;
                        break;
                    }
                    let path_str = filepath.to_string_lossy();
                    if sidecar_paths(dlc).iter().any(|p| *p == path_str) {
                        found = true;
                        break;
                    }
                }
            }

            if !found {
                orphans.push(filepath);
            }
        }
    }
    eprintln!();

    orphans
}

/// Orphans of one content-system install: files under the install path
/// that no depot item produced.
pub fn galaxy_orphans(
    items: &[crate::models::DepotItem],
    install_path: &Path,
) -> Vec<PathBuf> {
    let mut orphans = Vec::new();
    for entry in WalkDir::new(install_path).follow_links(false) {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(install_path)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        if !items.iter().any(|item| item.path == relative) {
            orphans.push(entry.path().to_path_buf());
        }
    }
    orphans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Args;
    use crate::models::FileKind;

    fn config_with_dir(dir: &Path) -> Config {
        let args = Args {
            directory: dir.to_string_lossy().into_owned(),
            subdir_game: "%gamename%".into(),
            ..Args::default()
        };
        Config::from_args(args)
    }

    fn planned_file(target: &Path) -> GameFile {
        GameFile {
            kind: FileKind::BaseInstaller,
            gamename: "foo_game".into(),
            title: "Foo Game".into(),
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
            target_path: target.to_string_lossy().into_owned(),
        }
    }

    #[test]
    fn finds_files_outside_the_plan() {
        let tmp = tempfile::tempdir().unwrap();
        let game_dir = tmp.path().join("foo_game").join("extras");
        std::fs::create_dir_all(&game_dir).unwrap();
        let planned = game_dir.join("manual.pdf");
        let stray = game_dir.join("Readme_old.pdf");
        std::fs::write(&planned, b"x").unwrap();
        std::fs::write(&stray, b"y").unwrap();

        let cfg = config_with_dir(tmp.path());
        let mut game = GameDetails {
            gamename: "foo_game".into(),
            title: "Foo Game".into(),
            ..GameDetails::default()
        };
        game.extras.push(planned_file(&planned));

        let orphans = scan(&[game], &cfg, &Transforms::default(), r".*\.(pdf|zip)$");
        assert_eq!(orphans, vec![stray]);
    }

    #[test]
    fn regex_limits_candidates() {
        let tmp = tempfile::tempdir().unwrap();
        let game_dir = tmp.path().join("foo_game");
        std::fs::create_dir_all(&game_dir).unwrap();
        std::fs::write(game_dir.join("stray.bin"), b"x").unwrap();

        let cfg = config_with_dir(tmp.path());
        let game = GameDetails {
            gamename: "foo_game".into(),
            title: "Foo Game".into(),
            ..GameDetails::default()
        };

        // regex only admits pdf, so the stray .bin is not reported
        let orphans = scan(&[game.clone()], &cfg, &Transforms::default(), r".*\.pdf$");
        assert!(orphans.is_empty());

        let orphans = scan(&[game], &cfg, &Transforms::default(), "");
        assert_eq!(orphans.len(), 1);
    }

    #[test]
    fn galaxy_orphans_diff_install_tree() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("bin")).unwrap();
        std::fs::write(tmp.path().join("bin/game.exe"), b"x").unwrap();
        std::fs::write(tmp.path().join("stale.dat"), b"y").unwrap();

        let items = vec![crate::models::DepotItem {
            path: "bin/game.exe".into(),
            ..crate::models::DepotItem::default()
        }];
        let orphans = galaxy_orphans(&items, tmp.path());
        assert_eq!(orphans, vec![tmp.path().join("stale.dat")]);
    }
}
