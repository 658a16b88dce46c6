//! Target path computation.
//!
//! Local file locations are produced from the configured directory
//! templates. Placeholders:
//!
//! | placeholder | binding |
//! |---|---|
//! | %gamename% | base game slug |
//! | %gamename_firstletter% | first character, "0" for digits |
//! | %title% / %title_stripped% | base game title / punctuation stripped |
//! | %dlcname% / %dlc_title% / %dlc_title_stripped% | DLC slug / title |
//! | %platform% | lowercase platform, "no_platform" for non-platform files |
//! | %gamename_transformed% | slug after the transformation rules |
//! | %gamename_transformed_firstletter% | first character of the above |
//!
//! Substitution is a single pass over a fixed map, so applying it twice is
//! a no-op; double slashes are collapsed afterwards.

use std::path::Path;

use regex::Regex;

use crate::config::{platform_code, DirectoryConfig};
use crate::models::{FileKind, GameFile};

/// Slug transformation rules loaded from `<config>/transformations.json`,
/// a JSON object of `{"regex": "replacement"}` entries applied in order.
/// With no file present the transform is the identity.
#[derive(Clone, Debug, Default)]
pub struct Transforms {
    rules: Vec<(Regex, String)>,
}

impl Transforms {
    pub fn load(config_dir: &Path) -> Transforms {
        let path = config_dir.join("transformations.json");
        let Ok(bytes) = std::fs::read(&path) else {
            return Transforms::default();
        };
        let Ok(json) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
            log::warn!("failed to parse {}", path.display());
            return Transforms::default();
        };
        let mut rules = Vec::new();
        if let Some(map) = json.as_object() {
            for (pattern, replacement) in map {
                match Regex::new(pattern) {
                    Ok(re) => rules.push((
                        re,
                        replacement.as_str().unwrap_or_default().to_string(),
                    )),
                    Err(e) => log::warn!("bad transformation pattern {}: {}", pattern, e),
                }
            }
        }
        Transforms { rules }
    }

    pub fn apply(&self, gamename: &str) -> String {
        let mut name = gamename.to_string();
        for (re, replacement) in &self.rules {
            if re.is_match(&name) {
                name = re.replace_all(&name, replacement.as_str()).into_owned();
            }
        }
        name
    }

}

/// First character of a slug; digits group under "0".
pub fn first_letter(name: &str) -> String {
    match name.chars().next() {
        Some(c) if c.is_ascii_digit() => "0".to_string(),
        Some(c) => c.to_string(),
        None => String::new(),
    }
}

/// Title with everything but letters, digits and spaces removed.
pub fn stripped_string(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
        .collect::<String>()
        .trim()
        .to_string()
}

pub fn collapse_slashes(path: &str) -> String {
    let mut out = path.to_string();
    while out.contains("//") {
        out = out.replace("//", "/");
    }
    out
}

/// Computes the local path for a file unit from the directory templates.
pub fn make_filepath(gf: &GameFile, dirs: &DirectoryConfig, transforms: &Transforms) -> String {
    let filename = gf.path.rsplit('/').next().unwrap_or(&gf.path);

    let mut subdir = String::new();
    if dirs.use_subdirectories {
        subdir = if gf.kind.is_installer() {
            dirs.installers_subdir.clone()
        } else if gf.kind.is_extra() {
            dirs.extras_subdir.clone()
        } else if gf.kind.is_patch() {
            dirs.patches_subdir.clone()
        } else if gf.kind.is_langpack() {
            dirs.language_pack_subdir.clone()
        } else {
            String::new()
        };

        if gf.kind.is_dlc() {
            subdir = format!("{}/{}", dirs.dlc_subdir, subdir);
        }
        if !dirs.game_subdir.is_empty() {
            subdir = format!("{}/{}", dirs.game_subdir, subdir);
        }
    }

    let filepath = format!("{}/{}/{}", dirs.directory, subdir, filename);
    substitute(&filepath, gf, transforms)
}

/// Path for a locally produced sidecar file (serials, logo, icon,
/// changelog, product JSON). These live directly in the game directory
/// and never get a platform segment.
pub fn make_custom_filepath(
    filename: &str,
    gamename: &str,
    title: &str,
    dlc_gamename: &str,
    dlc_title: &str,
    is_dlc: bool,
    dirs: &DirectoryConfig,
    transforms: &Transforms,
) -> String {
    let gf = GameFile {
        kind: if is_dlc { FileKind::CustomDlc } else { FileKind::CustomBase },
        gamename: gamename.to_string(),
        title: title.to_string(),
        dlc_gamename: dlc_gamename.to_string(),
        dlc_title: dlc_title.to_string(),
        id: String::new(),
        name: String::new(),
        path: format!("/{}", filename),
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

    let mut subdir = String::new();
    if dirs.use_subdirectories {
        if is_dlc {
            subdir = dirs.dlc_subdir.clone();
        }
        if !dirs.game_subdir.is_empty() {
            subdir = if subdir.is_empty() {
                dirs.game_subdir.clone()
            } else {
                format!("{}/{}", dirs.game_subdir, subdir)
            };
        }
    }

    let filepath = format!("{}/{}/{}", dirs.directory, subdir, filename);
    substitute(&filepath, &gf, transforms)
}

/// Expands a directory template for one game and platform, used by the
/// orphan scanner to enumerate candidate directories. `platform == 0`
/// resolves the platform segment the same way platform-less files do.
pub fn expand_directory_template(
    template: &str,
    gamename: &str,
    title: &str,
    platform: u32,
    transforms: &Transforms,
) -> String {
    let gf = GameFile {
        kind: FileKind::BaseInstaller,
        gamename: gamename.to_string(),
        title: title.to_string(),
        dlc_gamename: String::new(),
        dlc_title: String::new(),
        id: String::new(),
        name: String::new(),
        path: String::new(),
        size: 0,
        platform,
        language: 0,
        version: String::new(),
        downlink: String::new(),
        updated: false,
        silent: false,
        score: 0,
        target_path: String::new(),
    };
    substitute(template, &gf, transforms)
}

fn substitute(filepath: &str, gf: &GameFile, transforms: &Transforms) -> String {
    let mut platform = platform_code(gf.platform).unwrap_or("").to_string();
    if platform.is_empty() {
        // A file without platform bits still needs the segment resolved;
        // grouping layouts like %gamename%/%platform% keep the file at
        // the game root instead of inventing a directory.
        if !filepath.contains("%gamename%/%platform%") {
            platform = "no_platform".to_string();
        }
    }

    // Sidecar artifacts are never platform specific.
    if gf.kind.is_custom() {
        platform = String::new();
    }

    let (gamename, title, dlc_gamename, dlc_title) = if gf.kind.is_dlc() {
        (
            gf.gamename.as_str(),
            gf.title.as_str(),
            gf.dlc_gamename.as_str(),
            gf.dlc_title.as_str(),
        )
    } else {
        (gf.gamename.as_str(), gf.title.as_str(), "", "")
    };

    let mut out = filepath.to_string();

    if out.contains("%gamename_transformed%") || out.contains("%gamename_transformed_firstletter%")
    {
        let transformed = transforms.apply(gamename);
        out = out.replace("%gamename_transformed_firstletter%", &first_letter(&transformed));
        out = out.replace("%gamename_transformed%", &transformed);
    }

    out = out.replace("%gamename_firstletter%", &first_letter(gamename));
    out = out.replace("%gamename%", gamename);
    out = out.replace("%title_stripped%", &stripped_string(title));
    out = out.replace("%title%", title);
    out = out.replace("%dlcname%", dlc_gamename);
    out = out.replace("%dlc_title_stripped%", &stripped_string(dlc_title));
    out = out.replace("%dlc_title%", dlc_title);
    out = out.replace("%platform%", &platform);

    collapse_slashes(&out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DirectoryConfig, PLATFORM_LINUX};
    use crate::models::FileKind;

    fn dirs() -> DirectoryConfig {
        DirectoryConfig {
            use_subdirectories: true,
            directory: "/dl".into(),
            wine_prefix: String::new(),
            game_subdir: "%gamename%".into(),
            installers_subdir: String::new(),
            extras_subdir: "extras".into(),
            patches_subdir: "patches".into(),
            language_pack_subdir: "languagepacks".into(),
            dlc_subdir: "dlc/%dlcname%".into(),
            galaxy_install_subdir: "%gamename%".into(),
        }
    }

    fn installer() -> GameFile {
        GameFile {
            kind: FileKind::BaseInstaller,
            gamename: "beneath_a_steel_sky".into(),
            title: "Beneath a Steel Sky".into(),
            dlc_gamename: String::new(),
            dlc_title: String::new(),
            id: "en3installer0".into(),
            name: "installer".into(),
            path: "/beneath_a_steel_sky/gog_beneath_a_steel_sky_2.1.0.3.sh".into(),
            size: 100,
            platform: PLATFORM_LINUX,
            language: crate::config::LANGUAGE_EN,
            version: "2.1.0.3".into(),
            downlink: String::new(),
            updated: false,
            silent: false,
            score: 0,
            target_path: String::new(),
        }
    }

    #[test]
    fn installer_path_lands_in_game_dir() {
        let path = make_filepath(&installer(), &dirs(), &Transforms::default());
        assert_eq!(
            path,
            "/dl/beneath_a_steel_sky/gog_beneath_a_steel_sky_2.1.0.3.sh"
        );
    }

    #[test]
    fn extras_get_their_subdirectory() {
        let mut gf = installer();
        gf.kind = FileKind::BaseExtra;
        gf.platform = 0;
        gf.path = "/beneath_a_steel_sky/extras/manual.pdf".into();
        let path = make_filepath(&gf, &dirs(), &Transforms::default());
        assert_eq!(path, "/dl/beneath_a_steel_sky/extras/manual.pdf");
    }

    #[test]
    fn dlc_subdir_expands_dlcname() {
        let mut gf = installer();
        gf.kind = FileKind::DlcInstaller;
        gf.dlc_gamename = "bass_ost".into();
        gf.dlc_title = "BASS OST".into();
        let path = make_filepath(&gf, &dirs(), &Transforms::default());
        assert_eq!(
            path,
            "/dl/beneath_a_steel_sky/dlc/bass_ost/gog_beneath_a_steel_sky_2.1.0.3.sh"
        );
    }

    #[test]
    fn platform_grouping_template() {
        let mut d = dirs();
        d.game_subdir = "%gamename%/%platform%".into();
        let path = make_filepath(&installer(), &d, &Transforms::default());
        assert_eq!(
            path,
            "/dl/beneath_a_steel_sky/linux/gog_beneath_a_steel_sky_2.1.0.3.sh"
        );

        // a platform-less file under the same template collapses the
        // segment instead of using no_platform
        let mut gf = installer();
        gf.platform = 0;
        let path = make_filepath(&gf, &d, &Transforms::default());
        assert_eq!(
            path,
            "/dl/beneath_a_steel_sky/gog_beneath_a_steel_sky_2.1.0.3.sh"
        );
    }

    #[test]
    fn substitution_is_a_fixed_point() {
        let d = dirs();
        let t = Transforms::default();
        let once = make_filepath(&installer(), &d, &t);
        let gf2 = GameFile {
            path: once.clone(),
            ..installer()
        };
        // substituting an already-substituted path changes nothing
        assert_eq!(substitute(&once, &gf2, &t), once);
    }

    #[test]
    fn first_letter_groups_digits() {
        assert_eq!(first_letter("7th_guest"), "0");
        assert_eq!(first_letter("alone"), "a");
        assert_eq!(first_letter(""), "");
    }

    #[test]
    fn stripped_string_drops_punctuation() {
        assert_eq!(stripped_string("S.T.A.L.K.E.R.: Clear Sky"), "STALKER Clear Sky");
    }

    #[test]
    fn custom_filepath_skips_platform() {
        let path = make_custom_filepath(
            "serials_foo.txt",
            "foo",
            "Foo",
            "",
            "",
            false,
            &dirs(),
            &Transforms::default(),
        );
        assert_eq!(path, "/dl/foo/serials_foo.txt");
    }
}
