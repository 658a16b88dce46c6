//! Data model shared across the crate: OAuth tokens, catalog entries,
//! downloadable file units, depot manifests and cloud-save records.
//!
//! Everything here is a plain value type. Wire documents are deserialized
//! with serde; the catalog cache serializes the same structures back to
//! disk, so additions to these types must keep backwards-compatible
//! defaults (`#[serde(default)]`) or bump the cache version in catalog.rs.

use serde::{Deserialize, Serialize};

/// OAuth credentials as stored in galaxy_tokens.json.
///
/// `expires_at` is absolute wall time (unix seconds). When a token file
/// predates this field, the loader computes it from the file mtime plus
/// `expires_in`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Token {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub session_id: String,
}

/// Kind of a downloadable artifact. Base-game and DLC variants are kept
/// distinct so path templates and include filters can tell them apart
/// without consulting the owning product.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    BaseInstaller,
    BaseExtra,
    BasePatch,
    BaseLangpack,
    DlcInstaller,
    DlcExtra,
    DlcPatch,
    DlcLangpack,
    /// Locally produced sidecar file owned by a base game (serials, logo...).
    CustomBase,
    /// Sidecar file owned by a DLC.
    CustomDlc,
}

impl FileKind {
    pub fn is_installer(self) -> bool {
        matches!(self, FileKind::BaseInstaller | FileKind::DlcInstaller)
    }

    pub fn is_extra(self) -> bool {
        matches!(self, FileKind::BaseExtra | FileKind::DlcExtra)
    }

    pub fn is_patch(self) -> bool {
        matches!(self, FileKind::BasePatch | FileKind::DlcPatch)
    }

    pub fn is_langpack(self) -> bool {
        matches!(self, FileKind::BaseLangpack | FileKind::DlcLangpack)
    }

    pub fn is_dlc(self) -> bool {
        matches!(
            self,
            FileKind::DlcInstaller
                | FileKind::DlcExtra
                | FileKind::DlcPatch
                | FileKind::DlcLangpack
                | FileKind::CustomDlc
        )
    }

    pub fn is_custom(self) -> bool {
        matches!(self, FileKind::CustomBase | FileKind::CustomDlc)
    }
}

/// One downloadable artifact of a product ("file unit").
///
/// `gamename`/`title` always refer to the owning base game so that path
/// templates resolve `%gamename%` consistently; for DLC files the DLC's
/// own slug and title are carried separately.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GameFile {
    pub kind: FileKind,
    pub gamename: String,
    pub title: String,
    /// DLC slug when `kind` is a DLC variant, empty otherwise.
    #[serde(default)]
    pub dlc_gamename: String,
    #[serde(default)]
    pub dlc_title: String,
    pub id: String,
    /// Display name from the product document ("installer", "manual"...).
    pub name: String,
    /// Server-side path, used to derive the local file name.
    pub path: String,
    pub size: u64,
    /// Platform bitmask (config::PLATFORM_*). Zero for extras.
    #[serde(default)]
    pub platform: u32,
    /// Language bitmask (config::LANGUAGE_*). Zero for extras. Coalesced
    /// duplicates OR their masks here.
    #[serde(default)]
    pub language: u32,
    #[serde(default)]
    pub version: String,
    /// Short-lived JSON document holding the real download URL; must be
    /// re-fetched every session.
    pub downlink: String,
    #[serde(default)]
    pub updated: bool,
    #[serde(default)]
    pub silent: bool,
    /// Priority-filter score, lower wins. Transient.
    #[serde(skip)]
    pub score: i32,
    /// Computed local target path. Empty until the planner runs.
    #[serde(default)]
    pub target_path: String,
}

impl GameFile {
    /// True when this unit carries verifier XML on the server side.
    /// Extras never do; the API cannot be trusted for them.
    pub fn has_remote_checksum(&self) -> bool {
        self.kind.is_installer() || self.kind.is_patch() || self.kind.is_langpack()
    }
}

/// A product in the user's library, possibly carrying DLC products.
/// DLCs never nest further.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct GameDetails {
    pub gamename: String,
    #[serde(default)]
    pub gamename_basegame: String,
    pub product_id: String,
    pub title: String,
    #[serde(default)]
    pub title_basegame: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub logo: String,
    #[serde(default)]
    pub serials: String,
    #[serde(default)]
    pub changelog: String,
    #[serde(default)]
    pub installers: Vec<GameFile>,
    #[serde(default)]
    pub extras: Vec<GameFile>,
    #[serde(default)]
    pub patches: Vec<GameFile>,
    #[serde(default)]
    pub languagepacks: Vec<GameFile>,
    #[serde(default)]
    pub dlcs: Vec<GameDetails>,
    /// Raw product document, persisted when --save-product-json is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_json: Option<serde_json::Value>,
    #[serde(default)]
    pub serials_path: String,
    #[serde(default)]
    pub logo_path: String,
    #[serde(default)]
    pub icon_path: String,
    #[serde(default)]
    pub changelog_path: String,
    #[serde(default)]
    pub product_json_path: String,
}

impl GameDetails {
    /// All file units of the game and its DLCs, in list order.
    pub fn all_files(&self) -> Vec<GameFile> {
        let mut v = Vec::new();
        v.extend(self.installers.iter().cloned());
        v.extend(self.patches.iter().cloned());
        v.extend(self.extras.iter().cloned());
        v.extend(self.languagepacks.iter().cloned());
        for dlc in &self.dlcs {
            v.extend(dlc.all_files());
        }
        v
    }
}

/// An entry of the paginated account game list.
#[derive(Clone, Debug, Default)]
pub struct GameListItem {
    pub gamename: String,
    pub id: String,
    pub is_new: bool,
    pub updates: u32,
    pub platform: u32,
    /// Pre-fetched account details document, present when the DLC count
    /// forced an early fetch.
    pub details_json: Option<serde_json::Value>,
}

/// One zlib-compressed, content-addressed chunk of a depot item.
/// Offsets are cumulative within the owning item.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DepotChunk {
    pub md5_compressed: String,
    pub md5_uncompressed: String,
    pub size_compressed: u64,
    pub size_uncompressed: u64,
    pub offset_compressed: u64,
    pub offset_uncompressed: u64,
}

/// Leaf of a build manifest: one file assembled from consecutive chunks.
#[derive(Clone, Debug, Default)]
pub struct DepotItem {
    pub path: String,
    pub chunks: Vec<DepotChunk>,
    pub total_size_compressed: u64,
    pub total_size_uncompressed: u64,
    /// Whole-file md5; may be empty when the manifest omits it and the
    /// item has more than one chunk.
    pub md5: String,
    pub product_id: String,
    pub is_dependency: bool,
    pub is_small_files_container: bool,
    /// Offset/size into the small-files container when the item is packed.
    pub sfc_offset: Option<u64>,
    pub sfc_size: Option<u64>,
}

/// A file in the hidden cloud-save storage.
#[derive(Clone, Debug)]
pub struct CloudSaveFile {
    /// Remote object path (relative to the container).
    pub path: String,
    /// Local absolute path.
    pub location: std::path::PathBuf,
    pub file_size: u64,
    pub last_modified: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(kind: FileKind, id: &str) -> GameFile {
        GameFile {
            kind,
            gamename: "foo".into(),
            title: "Foo".into(),
            dlc_gamename: String::new(),
            dlc_title: String::new(),
            id: id.into(),
            name: "installer".into(),
            path: "/foo/setup.sh".into(),
            size: 10,
            platform: 0,
            language: 0,
            version: String::new(),
            downlink: String::new(),
            updated: false,
            silent: false,
            score: 0,
            target_path: String::new(),
        }
    }

    #[test]
    fn file_kind_families() {
        assert!(FileKind::BaseInstaller.is_installer());
        assert!(FileKind::DlcInstaller.is_installer());
        assert!(FileKind::DlcInstaller.is_dlc());
        assert!(!FileKind::BaseInstaller.is_dlc());
        assert!(FileKind::CustomDlc.is_dlc());
        assert!(FileKind::CustomDlc.is_custom());
        assert!(!FileKind::BaseExtra.is_installer());
        assert!(FileKind::BaseExtra.is_extra());
    }

    #[test]
    fn all_files_includes_dlc_files() {
        let mut game = GameDetails::default();
        game.installers.push(file(FileKind::BaseInstaller, "1"));
        let mut dlc = GameDetails::default();
        dlc.gamename_basegame = "foo".into();
        let mut dlc_file = file(FileKind::DlcExtra, "2");
        dlc_file.dlc_gamename = "foo_dlc".into();
        dlc.extras.push(dlc_file);
        game.dlcs.push(dlc);
        assert_eq!(game.all_files().len(), 2);
    }

    #[test]
    fn remote_checksum_only_for_checksummed_kinds() {
        assert!(file(FileKind::BaseInstaller, "1").has_remote_checksum());
        assert!(file(FileKind::DlcPatch, "2").has_remote_checksum());
        assert!(file(FileKind::BaseLangpack, "3").has_remote_checksum());
        assert!(!file(FileKind::BaseExtra, "4").has_remote_checksum());
    }
}
