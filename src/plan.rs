//! Planning: turning catalog entries and build manifests into concrete
//! work lists.
//!
//! For the installer path this computes target paths from the directory
//! templates, applies the priority filters and coalesces duplicates. For
//! the repository path it filters a build manifest's depots by language
//! and architecture, flattens them into depot items, resolves dependency
//! depots and computes the delete-set against a previously installed
//! build.

use anyhow::Result;
use serde_json::Value;

use crate::api::GalaxyApi;
use crate::config::{self, Config, DownloadConfig};
use crate::models::{DepotItem, GameDetails, GameFile};
use crate::paths::{self, Transforms};

/// Keeps only the best-scoring files per list under the platform and
/// language priority lists. Score is the sum of the first matching index
/// in each list; ties all survive, so "French then English" over
/// {Windows French, Windows English, Linux English} keeps Windows French
/// and Linux English.
pub fn filter_list_with_priorities(list: &mut Vec<GameFile>, dl: &DownloadConfig) {
    if dl.platform_priority.is_empty() && dl.language_priority.is_empty() {
        return;
    }

    let mut best = -1i32;
    for gf in list.iter_mut() {
        gf.score = 0;
        for (i, mask) in dl.platform_priority.iter().enumerate() {
            if gf.platform & mask != 0 {
                gf.score += i as i32;
                break;
            }
        }
        for (i, mask) in dl.language_priority.iter().enumerate() {
            if gf.language & mask != 0 {
                gf.score += i as i32;
                break;
            }
        }
        if best < 0 || gf.score < best {
            best = gf.score;
        }
    }
    list.retain(|gf| gf.score <= best);
}

/// Applies the priority filters to every file list of a game. Extras
/// carry no masks and are left alone.
pub fn filter_game_with_priorities(game: &mut GameDetails, dl: &DownloadConfig) {
    filter_list_with_priorities(&mut game.installers, dl);
    filter_list_with_priorities(&mut game.patches, dl);
    filter_list_with_priorities(&mut game.languagepacks, dl);
    for dlc in &mut game.dlcs {
        filter_list_with_priorities(&mut dlc.installers, dl);
        filter_list_with_priorities(&mut dlc.patches, dl);
        filter_list_with_priorities(&mut dlc.languagepacks, dl);
    }
}

/// Computes `target_path` for every file unit of a game, plus the sidecar
/// paths (serials, logo, icon, changelog, product JSON). Sidecars never
/// get a platform segment.
pub fn make_filepaths(game: &mut GameDetails, cfg: &Config, transforms: &Transforms) {
    let dirs = &cfg.dirs;

    let logo_ext = extension_or(&game.logo, ".jpg");
    let icon_ext = extension_or(&game.icon, ".png");

    game.serials_path = paths::make_custom_filepath(
        "serials.txt",
        &game.gamename,
        &game.title,
        "",
        "",
        false,
        dirs,
        transforms,
    );
    game.logo_path = paths::make_custom_filepath(
        &format!("logo_{}{}", game.gamename, logo_ext),
        &game.gamename,
        &game.title,
        "",
        "",
        false,
        dirs,
        transforms,
    );
    game.icon_path = paths::make_custom_filepath(
        &format!("icon_{}{}", game.gamename, icon_ext),
        &game.gamename,
        &game.title,
        "",
        "",
        false,
        dirs,
        transforms,
    );
    game.changelog_path = paths::make_custom_filepath(
        &format!("changelog_{}.html", game.gamename),
        &game.gamename,
        &game.title,
        "",
        "",
        false,
        dirs,
        transforms,
    );
    game.product_json_path = paths::make_custom_filepath(
        &format!("product_{}.json", game.gamename),
        &game.gamename,
        &game.title,
        "",
        "",
        false,
        dirs,
        transforms,
    );

    for gf in game
        .installers
        .iter_mut()
        .chain(game.extras.iter_mut())
        .chain(game.patches.iter_mut())
        .chain(game.languagepacks.iter_mut())
    {
        gf.target_path = paths::make_filepath(gf, dirs, transforms);
    }

    let base_gamename = game.gamename.clone();
    let base_title = game.title.clone();
    for dlc in &mut game.dlcs {
        dlc.serials_path = paths::make_custom_filepath(
            &format!("serials_{}.txt", dlc.gamename),
            &base_gamename,
            &base_title,
            &dlc.gamename,
            &dlc.title,
            true,
            dirs,
            transforms,
        );
        dlc.logo_path = paths::make_custom_filepath(
            &format!("logo_{}{}", dlc.gamename, logo_ext),
            &base_gamename,
            &base_title,
            &dlc.gamename,
            &dlc.title,
            true,
            dirs,
            transforms,
        );
        dlc.icon_path = paths::make_custom_filepath(
            &format!("icon_{}{}", dlc.gamename, icon_ext),
            &base_gamename,
            &base_title,
            &dlc.gamename,
            &dlc.title,
            true,
            dirs,
            transforms,
        );
        dlc.changelog_path = paths::make_custom_filepath(
            &format!("changelog_{}.html", dlc.gamename),
            &base_gamename,
            &base_title,
            &dlc.gamename,
            &dlc.title,
            true,
            dirs,
            transforms,
        );
        dlc.product_json_path = paths::make_custom_filepath(
            &format!("product_{}.json", dlc.gamename),
            &base_gamename,
            &base_title,
            &dlc.gamename,
            &dlc.title,
            true,
            dirs,
            transforms,
        );

        for gf in dlc
            .installers
            .iter_mut()
            .chain(dlc.extras.iter_mut())
            .chain(dlc.patches.iter_mut())
            .chain(dlc.languagepacks.iter_mut())
        {
            gf.target_path = paths::make_filepath(gf, dirs, transforms);
        }
    }
}

fn extension_or(url: &str, fallback: &str) -> String {
    url.rfind('.')
        .map(|p| url[p..].to_string())
        .filter(|ext| ext.len() <= 5)
        .unwrap_or_else(|| fallback.to_string())
}

/// Include-filter check for one file kind against the configured mask.
pub fn kind_included(kind: crate::models::FileKind, include: u32) -> bool {
    use crate::models::FileKind::*;
    let bit = match kind {
        BaseInstaller => config::INCLUDE_BASE_INSTALLER,
        BaseExtra => config::INCLUDE_BASE_EXTRA,
        BasePatch => config::INCLUDE_BASE_PATCH,
        BaseLangpack => config::INCLUDE_BASE_LANGPACK,
        DlcInstaller => config::INCLUDE_DLC_INSTALLER,
        DlcExtra => config::INCLUDE_DLC_EXTRA,
        DlcPatch => config::INCLUDE_DLC_PATCH,
        DlcLangpack => config::INCLUDE_DLC_LANGPACK,
        CustomBase => config::INCLUDE_BASE,
        CustomDlc => config::INCLUDE_DLC,
    };
    include & bit != 0
}

/// Flattens a build manifest into the depot-item work list:
/// language/arch filter, DLC filter, dependency resolution, product id
/// defaulting.
pub async fn depot_items_for_manifest(
    api: &GalaxyApi,
    manifest: &Value,
    dl: &DownloadConfig,
) -> Result<Vec<DepotItem>> {
    let base_product_id = manifest
        .get("baseProductId")
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_default();

    let language_regex = config::language_regex(dl.galaxy_language);
    let arch_code = config::galaxy_arch_code(dl.galaxy_arch);

    let mut items: Vec<DepotItem> = Vec::new();
    if let Some(depots) = manifest.get("depots").and_then(Value::as_array) {
        for depot in depots {
            let mut vec = api
                .filtered_depot_items(depot, &language_regex, arch_code, false)
                .await?;
            items.append(&mut vec);
        }
    }

    if dl.include & config::INCLUDE_DLC == 0 {
        items.retain(|item| item.product_id.is_empty() || item.product_id == base_product_id);
    }

    if dl.galaxy_dependencies {
        let wanted: Vec<String> = manifest
            .get("dependencies")
            .and_then(Value::as_array)
            .map(|deps| {
                deps.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if !wanted.is_empty() {
            let dependency_manifest = api.dependencies_manifest().await?;
            if let Some(depots) = dependency_manifest.get("depots").and_then(Value::as_array) {
                for depot in depots {
                    let id = depot
                        .get("dependencyId")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    if !wanted.iter().any(|w| w == id) {
                        continue;
                    }
                    let mut vec = api
                        .filtered_depot_items(depot, &language_regex, arch_code, true)
                        .await?;
                    items.append(&mut vec);
                }
            }
        }
    }

    for item in &mut items {
        if item.product_id.is_empty() {
            item.product_id = base_product_id.clone();
        }
    }

    Ok(items)
}

/// Paths present in the old build but absent from the new one; these are
/// deleted before the engine starts so an upgrade leaves no stale files.
pub fn deleted_paths(old_items: &[DepotItem], new_items: &[DepotItem]) -> Vec<String> {
    old_items
        .iter()
        .filter(|old| !new_items.iter().any(|new| new.path == old.path))
        .map(|old| old.path.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        LANGUAGE_EN, LANGUAGE_FR, PLATFORM_LINUX, PLATFORM_WINDOWS,
    };
    use crate::models::FileKind;

    fn gf(platform: u32, language: u32) -> GameFile {
        GameFile {
            kind: FileKind::BaseInstaller,
            gamename: "g".into(),
            title: "G".into(),
            dlc_gamename: String::new(),
            dlc_title: String::new(),
            id: String::new(),
            name: String::new(),
            path: format!("/g/f_{}_{}", platform, language),
            size: 0,
            platform,
            language,
            version: String::new(),
            downlink: String::new(),
            updated: false,
            silent: false,
            score: 0,
            target_path: String::new(),
        }
    }

    #[test]
    fn priority_filter_keeps_ties() {
        // French then English, Linux then Windows; no Linux French exists
        let dl = DownloadConfig {
            platform_priority: vec![PLATFORM_LINUX, PLATFORM_WINDOWS],
            language_priority: vec![LANGUAGE_FR, LANGUAGE_EN],
            ..DownloadConfig::default()
        };
        let mut list = vec![
            gf(PLATFORM_WINDOWS, LANGUAGE_FR), // score 1 + 0 = 1
            gf(PLATFORM_WINDOWS, LANGUAGE_EN), // score 1 + 1 = 2
            gf(PLATFORM_LINUX, LANGUAGE_EN),   // score 0 + 1 = 1
        ];
        filter_list_with_priorities(&mut list, &dl);
        assert_eq!(list.len(), 2);
        assert!(list.iter().any(|f| f.platform == PLATFORM_WINDOWS && f.language == LANGUAGE_FR));
        assert!(list.iter().any(|f| f.platform == PLATFORM_LINUX && f.language == LANGUAGE_EN));
    }

    #[test]
    fn priority_filter_noop_without_priorities() {
        let dl = DownloadConfig::default();
        let mut list = vec![gf(PLATFORM_WINDOWS, LANGUAGE_EN), gf(PLATFORM_LINUX, LANGUAGE_EN)];
        filter_list_with_priorities(&mut list, &dl);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn deleted_paths_diff() {
        let old = vec![
            DepotItem { path: "a".into(), ..DepotItem::default() },
            DepotItem { path: "b".into(), ..DepotItem::default() },
        ];
        let new = vec![DepotItem { path: "b".into(), ..DepotItem::default() }];
        assert_eq!(deleted_paths(&old, &new), vec!["a".to_string()]);
        assert!(deleted_paths(&new, &old).is_empty());
    }

    #[test]
    fn include_mask_covers_custom_kinds() {
        assert!(kind_included(FileKind::BaseInstaller, config::INCLUDE_BASE_INSTALLER));
        assert!(!kind_included(FileKind::BaseInstaller, config::INCLUDE_DLC));
        assert!(kind_included(FileKind::CustomBase, config::INCLUDE_BASE));
        assert!(kind_included(FileKind::CustomDlc, config::INCLUDE_DLC));
    }

    #[test]
    fn extension_fallbacks() {
        assert_eq!(extension_or("https://x/logo.png", ".jpg"), ".png");
        assert_eq!(extension_or("https://x/logo", ".jpg"), ".jpg");
        // an absurdly long "extension" is treated as no extension
        assert_eq!(extension_or("https://x/logo.somethinglong", ".jpg"), ".jpg");
    }
}
