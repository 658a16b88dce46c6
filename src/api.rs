//! GOG service endpoints.
//!
//! [`GalaxyApi`] is the authenticated client for the modern endpoint
//! families: the product document on api.gog.com, the account listing on
//! embed.gog.com, and the content-system (builds, v1/v2 manifests,
//! secure links and dependency links). Manifest bodies may arrive
//! zlib-framed without a Content-Encoding header; parsing tolerates that
//! (see http::parse_json_lenient).
//!
//! The legacy HMAC-signed downloader endpoints live in `api::legacy`.
//!
//! Flow for building file units from a product:
//! 1. `product_info(id)` returns the expanded product document.
//! 2. `product_details_from_json` walks the four file lists (and the
//!    expanded DLC documents one level deep), fetching each entry's
//!    downlink JSON to learn the real server path.
//! 3. The planner computes target paths and the engine consumes the rest.

pub mod legacy;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::Value;

use crate::config::{self, DownloadConfig};
use crate::http::{HttpClient, HttpError};
use crate::models::{DepotChunk, DepotItem, FileKind, GameDetails, GameFile};
use crate::token::TokenStore;

/// Marker spliced into secure-link URL templates where the per-chunk
/// galaxy path goes, so one secure_link response serves every chunk of a
/// product.
pub const GALAXY_PATH_MARKER: &str = "{GALAXY_PATH}";

const GOG_API: &str = "https://api.gog.com";
const GOG_CDN: &str = "https://cdn.gog.com";
const GOG_CONTENT_SYSTEM: &str = "https://content-system.gog.com";
const GOG_EMBED: &str = "https://embed.gog.com";
const GOG_REMOTE_CONFIG: &str = "https://remote-config.gog.com";

#[derive(Clone)]
pub struct GalaxyApi {
    http: HttpClient,
    token: Arc<TokenStore>,
}

impl GalaxyApi {
    pub fn new(http: HttpClient, token: Arc<TokenStore>) -> GalaxyApi {
        GalaxyApi { http, token }
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    pub fn token(&self) -> &Arc<TokenStore> {
        &self.token
    }

    pub fn is_token_expired(&self) -> bool {
        self.token.is_expired()
    }

    /// Refreshes the stored token; used at worker start and whenever a
    /// worker observes expiry mid-queue.
    pub async fn refresh_login(&self) -> Result<()> {
        self.token.refresh(self.http.inner(), true).await
    }

    fn bearer(&self) -> Option<String> {
        if self.token.is_expired() {
            None
        } else {
            self.token.access_token_stale_ok()
        }
    }

    pub async fn get_json(&self, url: &str) -> Result<Value, HttpError> {
        self.http.get_json(url, self.bearer().as_deref()).await
    }

    pub async fn get_text(&self, url: &str) -> Result<String, HttpError> {
        self.http.get_text(url, self.bearer().as_deref()).await
    }

    pub async fn product_info(&self, product_id: &str) -> Result<Value, HttpError> {
        let url = format!(
            "{}/products/{}?expand=downloads,expanded_dlcs,description,screenshots,videos,related_products,changelog&locale=en-US",
            GOG_API, product_id
        );
        self.get_json(&url).await
    }

    pub async fn product_builds(
        &self,
        product_id: &str,
        platform: &str,
    ) -> Result<Value, HttpError> {
        let url = format!(
            "{}/products/{}/os/{}/builds?generation=2",
            GOG_CONTENT_SYSTEM, product_id, platform
        );
        self.get_json(&url).await
    }

    pub async fn manifest_v1(&self, manifest_url: &str) -> Result<Value, HttpError> {
        self.get_json(manifest_url).await
    }

    pub async fn manifest_v2(&self, hash: &str, is_dependency: bool) -> Result<Value, HttpError> {
        let galaxy_path = hash_to_galaxy_path(hash);
        let url = if is_dependency {
            format!("{}/content-system/v2/dependencies/meta/{}", GOG_CDN, galaxy_path)
        } else {
            format!("{}/content-system/v2/meta/{}", GOG_CDN, galaxy_path)
        };
        self.get_json(&url).await
    }

    pub async fn secure_link(&self, product_id: &str, path: &str) -> Result<Value, HttpError> {
        let url = format!(
            "{}/products/{}/secure_link?generation=2&path={}&_version=2",
            GOG_CONTENT_SYSTEM, product_id, path
        );
        self.get_json(&url).await
    }

    pub async fn dependency_link(&self, path: &str) -> Result<Value, HttpError> {
        let url = format!(
            "{}/open_link?generation=2&_version=2&path=/dependencies/store/{}",
            GOG_CONTENT_SYSTEM, path
        );
        self.get_json(&url).await
    }

    /// The global dependency manifest, resolved through the repository
    /// pointer document.
    pub async fn dependencies_manifest(&self) -> Result<Value, HttpError> {
        let url = format!("{}/dependencies/repository?generation=2", GOG_CONTENT_SYSTEM);
        let repository = self.get_json(&url).await?;
        match repository.get("repository_manifest").and_then(Value::as_str) {
            Some(manifest_url) => self.get_json(manifest_url).await,
            None => Ok(Value::Null),
        }
    }

    pub async fn user_data(&self) -> Result<Value, HttpError> {
        self.get_json(&format!("{}/userData.json", GOG_EMBED)).await
    }

    pub async fn game_details_json(&self, game_id: &str) -> Result<Value, HttpError> {
        let url = format!("{}/account/gameDetails/{}.json", GOG_EMBED, game_id);
        self.get_json(&url).await
    }

    /// One page of the account product listing.
    pub async fn filtered_products_page(
        &self,
        page: u32,
        hidden: bool,
        updated: bool,
        tags: &str,
    ) -> Result<Value, HttpError> {
        let mut url = format!(
            "{}/account/getFilteredProducts?hiddenFlag={}&isUpdated={}&mediaType=1&sortBy=title&system=&page={}",
            GOG_EMBED,
            hidden as u32,
            updated as u32,
            page
        );
        if !tags.is_empty() {
            url.push_str(&format!("&tags={}", tags));
        }
        self.get_json(&url).await
    }

    pub async fn wishlist(&self) -> Result<Value, HttpError> {
        self.get_json(&format!("{}/user/wishlist.json", GOG_EMBED)).await
    }

    pub async fn account_tags(&self) -> Result<Value, HttpError> {
        // tags ride along on the first listing page
        self.filtered_products_page(1, false, false, "").await
    }

    /// Galaxy client component document; carries the cloud-save location
    /// variables for a product's client id.
    pub async fn cloud_config(&self, client_id: &str) -> Result<Value, HttpError> {
        let url = format!(
            "{}/components/galaxy_client/clients/{}?component_version=2.0.51",
            GOG_REMOTE_CONFIG, client_id
        );
        self.get_json(&url).await
    }

    /// Flattens a v2 depot manifest into depot items, including the
    /// small-files container as one synthetic leading item.
    pub async fn depot_items(&self, hash: &str, is_dependency: bool) -> Result<Vec<DepotItem>> {
        let json = self.manifest_v2(hash, is_dependency).await?;
        Ok(depot_items_from_manifest(&json, is_dependency))
    }

    /// Applies the language/arch acceptance rules to one depots[] entry
    /// and, when accepted, fetches and flattens its manifest.
    pub async fn filtered_depot_items(
        &self,
        depot_json: &Value,
        language_regex: &str,
        arch_code: &str,
        is_dependency: bool,
    ) -> Result<Vec<DepotItem>> {
        if !depot_matches(depot_json, language_regex, arch_code) {
            return Ok(Vec::new());
        }

        let hash = depot_json
            .get("manifest")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("depot entry without manifest hash"))?;
        let mut items = self.depot_items(hash, is_dependency).await?;

        if let Some(product_id) = depot_json.get("productId").and_then(product_id_string) {
            for item in &mut items {
                item.product_id = product_id.clone();
            }
        }
        Ok(items)
    }

    /// Builds a catalog entry from an expanded product document. DLC
    /// documents nest one level deep; their files get the DLC kinds and
    /// carry the base game's slug for path computation.
    pub async fn product_details_from_json(
        &self,
        json: &Value,
        dl: &DownloadConfig,
        owned_ids: &[String],
    ) -> Result<GameDetails> {
        let mut game = self.product_shell(json);

        let include = dl.include;
        if include & (config::INCLUDE_BASE_INSTALLER | config::INCLUDE_DLC_INSTALLER) != 0 {
            let files = self
                .files_from_node(&game, None, &json["downloads"]["installers"], FileKind::BaseInstaller, dl)
                .await;
            game.installers = files;
        }
        if include & (config::INCLUDE_BASE_EXTRA | config::INCLUDE_DLC_EXTRA) != 0 {
            let files = self
                .files_from_node(&game, None, &json["downloads"]["bonus_content"], FileKind::BaseExtra, dl)
                .await;
            game.extras = files;
        }
        if include & (config::INCLUDE_BASE_PATCH | config::INCLUDE_DLC_PATCH) != 0 {
            let files = self
                .files_from_node(&game, None, &json["downloads"]["patches"], FileKind::BasePatch, dl)
                .await;
            game.patches = files;
        }
        if include & (config::INCLUDE_BASE_LANGPACK | config::INCLUDE_DLC_LANGPACK) != 0 {
            let files = self
                .files_from_node(&game, None, &json["downloads"]["language_packs"], FileKind::BaseLangpack, dl)
                .await;
            game.languagepacks = files;
        }

        if include & config::INCLUDE_DLC != 0 {
            if let Some(dlcs) = json.get("expanded_dlcs").and_then(Value::as_array) {
                for dlc_json in dlcs {
                    let dlc_id = dlc_json.get("id").and_then(product_id_string).unwrap_or_default();
                    if !owned_ids.is_empty() && !owned_ids.iter().any(|id| *id == dlc_id) {
                        continue;
                    }

                    let mut dlc = self.product_shell(dlc_json);
                    dlc.gamename_basegame = game.gamename.clone();
                    dlc.title_basegame = game.title.clone();

                    let owner = game.clone();
                    let installers = self
                        .files_from_node(&owner, Some(&dlc), &dlc_json["downloads"]["installers"], FileKind::DlcInstaller, dl)
                        .await;
                    let extras = self
                        .files_from_node(&owner, Some(&dlc), &dlc_json["downloads"]["bonus_content"], FileKind::DlcExtra, dl)
                        .await;
                    let patches = self
                        .files_from_node(&owner, Some(&dlc), &dlc_json["downloads"]["patches"], FileKind::DlcPatch, dl)
                        .await;
                    let languagepacks = self
                        .files_from_node(&owner, Some(&dlc), &dlc_json["downloads"]["language_packs"], FileKind::DlcLangpack, dl)
                        .await;
                    dlc.installers = installers;
                    dlc.extras = extras;
                    dlc.patches = patches;
                    dlc.languagepacks = languagepacks;

                    // DLCs without any surviving file are noise
                    if !(dlc.installers.is_empty()
                        && dlc.extras.is_empty()
                        && dlc.patches.is_empty()
                        && dlc.languagepacks.is_empty())
                    {
                        game.dlcs.push(dlc);
                    }
                }
            }
        }

        Ok(game)
    }

    fn product_shell(&self, json: &Value) -> GameDetails {
        let mut game = GameDetails {
            gamename: json.get("slug").and_then(Value::as_str).unwrap_or_default().to_string(),
            product_id: json.get("id").and_then(product_id_string).unwrap_or_default(),
            title: json.get("title").and_then(Value::as_str).unwrap_or_default().to_string(),
            ..GameDetails::default()
        };
        if let Some(icon) = json["images"]["icon"].as_str() {
            game.icon = format!("https:{}", icon);
        }
        if let Some(logo) = json["images"]["logo"].as_str() {
            game.logo = format!("https:{}", logo).replace("_glx_logo.jpg", ".jpg");
        }
        if let Some(changelog) = json.get("changelog").and_then(Value::as_str) {
            game.changelog = changelog.to_string();
        }
        game
    }

    /// Expands one downloads list node into file units, following every
    /// entry's downlink to learn the real server path.
    async fn files_from_node(
        &self,
        owner: &GameDetails,
        dlc: Option<&GameDetails>,
        node: &Value,
        kind: FileKind,
        dl: &DownloadConfig,
    ) -> Vec<GameFile> {
        let mut files: Vec<GameFile> = Vec::new();
        let Some(entries) = node.as_array() else {
            return files;
        };

        // files are looked up under the slug of the product that owns
        // the downlink, which for DLC content is the DLC itself
        let lookup_slug = dlc.map(|d| d.gamename.as_str()).unwrap_or(&owner.gamename);

        for info in entries {
            let name = info.get("name").and_then(Value::as_str).unwrap_or_default();
            let version = info.get("version").and_then(Value::as_str).unwrap_or_default();

            let mut platform = config::PLATFORM_WINDOWS;
            let mut language = config::LANGUAGE_EN;
            if !kind.is_extra() {
                platform = config::option_value(
                    info.get("os").and_then(Value::as_str).unwrap_or(""),
                    config::PLATFORMS,
                );
                language = config::option_value(
                    info.get("language").and_then(Value::as_str).unwrap_or(""),
                    config::LANGUAGES,
                );
                if platform & dl.platform == 0 {
                    continue;
                }
                if language & dl.language == 0 {
                    continue;
                }
            }

            // entries with no files and no size are service anomalies
            let count = info.get("count").and_then(Value::as_u64).unwrap_or(0);
            let total_size = info.get("total_size").and_then(Value::as_u64).unwrap_or(0);
            if count == 0 && total_size == 0 {
                continue;
            }

            let Some(file_nodes) = info.get("files").and_then(Value::as_array) else {
                continue;
            };

            for file_node in file_nodes {
                let downlink = file_node.get("downlink").and_then(Value::as_str).unwrap_or("");
                if downlink.is_empty() {
                    continue;
                }

                let downlink_json = match self.get_json(downlink).await {
                    Ok(v) => v,
                    Err(e) => {
                        log::warn!("downlink fetch failed for {}: {}", lookup_slug, e);
                        continue;
                    }
                };
                let Some(url) = downlink_json.get("downlink").and_then(Value::as_str) else {
                    continue;
                };

                let path = path_from_downlink_url(url, lookup_slug);

                // paths ending in /secure or /securex mean the service
                // handed back a dispatcher URL instead of a file
                if secure_suffix(&path) {
                    continue;
                }

                let mut gf = GameFile {
                    kind,
                    gamename: owner.gamename.clone(),
                    title: owner.title.clone(),
                    dlc_gamename: dlc.map(|d| d.gamename.clone()).unwrap_or_default(),
                    dlc_title: dlc.map(|d| d.title.clone()).unwrap_or_default(),
                    id: file_node.get("id").and_then(product_id_string).unwrap_or_default(),
                    name: name.to_string(),
                    path,
                    size: file_node.get("size").and_then(Value::as_u64).unwrap_or(0),
                    platform: 0,
                    language: 0,
                    version: version.to_string(),
                    downlink: downlink.to_string(),
                    updated: false,
                    silent: false,
                    score: 0,
                    target_path: String::new(),
                };
                if !kind.is_extra() {
                    gf.platform = platform;
                    gf.language = language;
                }

                if dl.duplicate_handler {
                    if let Some(existing) = files.iter_mut().find(|f| f.path == gf.path) {
                        if !kind.is_extra() {
                            existing.language |= gf.language;
                        }
                        continue;
                    }
                }

                files.push(gf);
            }
        }

        files
    }
}

fn product_id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn secure_suffix(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with("/secure") || lower.ends_with("/securex")
}

/// Converts a content hash to its CDN path: ab/cd/abcdef... Hashes that
/// already contain a slash pass through.
pub fn hash_to_galaxy_path(hash: &str) -> String {
    if hash.contains('/') || hash.len() < 4 {
        hash.to_string()
    } else {
        format!("{}/{}/{}", &hash[0..2], &hash[2..4], hash)
    }
}

/// True when one depots[] entry matches the wanted language and arch.
/// Languages accept "*" or a regex match; a missing osBitness field
/// accepts every arch.
pub fn depot_matches(depot_json: &Value, language_regex: &str, arch_code: &str) -> bool {
    let lang_re = match regex::Regex::new(&format!("(?i)^({})$", language_regex)) {
        Ok(re) => re,
        Err(_) => return false,
    };

    let language_ok = depot_json
        .get("languages")
        .and_then(Value::as_array)
        .map(|langs| {
            langs.iter().filter_map(Value::as_str).any(|l| l == "*" || lang_re.is_match(l))
        })
        .unwrap_or(false);

    let arch_ok = match depot_json.get("osBitness").and_then(Value::as_array) {
        Some(bits) => bits
            .iter()
            .filter_map(Value::as_str)
            .any(|b| b == "*" || b == arch_code),
        None => true,
    };

    language_ok && arch_ok
}

/// Flattens a v2 manifest document into depot items with cumulative chunk
/// offsets. A smallFilesContainer becomes one synthetic item ahead of the
/// regular items.
pub fn depot_items_from_manifest(json: &Value, is_dependency: bool) -> Vec<DepotItem> {
    let mut items = Vec::new();
    let depot = &json["depot"];

    if let Some(chunks) = depot["smallFilesContainer"]["chunks"].as_array() {
        let mut item = build_item("galaxy_smallfilescontainer", chunks, is_dependency);
        item.is_small_files_container = true;
        item.md5 = item_md5(&depot["smallFilesContainer"], &item);
        items.push(item);
    }

    if let Some(manifest_items) = depot["items"].as_array() {
        for entry in manifest_items {
            let Some(chunks) = entry["chunks"].as_array() else {
                continue;
            };
            let path = entry
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .replace('\\', "/");
            let mut item = build_item(&path, chunks, is_dependency);

            if let Some(sfc_ref) = entry.get("sfcRef") {
                item.sfc_offset = sfc_ref.get("offset").and_then(Value::as_u64);
                item.sfc_size = sfc_ref.get("size").and_then(Value::as_u64);
            }
            item.md5 = item_md5(entry, &item);
            items.push(item);
        }
    }

    items
}

fn build_item(path: &str, chunks: &[Value], is_dependency: bool) -> DepotItem {
    let mut item = DepotItem {
        path: path.to_string(),
        is_dependency,
        ..DepotItem::default()
    };
    for chunk_json in chunks {
        let chunk = DepotChunk {
            md5_compressed: chunk_json
                .get("compressedMd5")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            md5_uncompressed: chunk_json
                .get("md5")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            size_compressed: chunk_json.get("compressedSize").and_then(Value::as_u64).unwrap_or(0),
            size_uncompressed: chunk_json.get("size").and_then(Value::as_u64).unwrap_or(0),
            offset_compressed: item.total_size_compressed,
            offset_uncompressed: item.total_size_uncompressed,
        };
        item.total_size_compressed += chunk.size_compressed;
        item.total_size_uncompressed += chunk.size_uncompressed;
        item.chunks.push(chunk);
    }
    item
}

fn item_md5(entry: &Value, item: &DepotItem) -> String {
    if let Some(md5) = entry.get("md5").and_then(Value::as_str) {
        md5.to_string()
    } else if item.chunks.len() == 1 {
        item.chunks[0].md5_uncompressed.clone()
    } else {
        String::new()
    }
}

/// Orders the CDN URL templates of a secure_link response by the
/// configured endpoint priority. Every `{param}` placeholder is bound
/// from the record's parameters; the `{path}` parameter additionally gets
/// the GALAXY_PATH marker appended so chunk paths can be spliced in later
/// without a fresh secure_link round trip.
pub fn cdn_url_templates(json: &Value, priority: &[String]) -> Vec<String> {
    struct Scored {
        url: String,
        score: usize,
    }

    let mut scored: Vec<Scored> = Vec::new();
    let Some(urls) = json.get("urls").and_then(Value::as_array) else {
        return Vec::new();
    };

    for (position, record) in urls.iter().enumerate() {
        let endpoint_name = record
            .get("endpoint_name")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let score = priority
            .iter()
            .position(|p| p == endpoint_name)
            // unknown endpoints keep their response order after the known ones
            .unwrap_or(priority.len() + position);

        let mut url = record
            .get("url_format")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if let Some(params) = record.get("parameters").and_then(Value::as_object) {
            for (key, value) in params {
                let placeholder = format!("{{{}}}", key);
                let mut replacement = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if key == "path" {
                    replacement.push_str(GALAXY_PATH_MARKER);
                }
                url = url.replace(&placeholder, &replacement);
            }
        }

        scored.push(Scored { url, score });
    }

    scored.sort_by_key(|s| s.score);
    scored.into_iter().map(|s| s.url).collect()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(v) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(v);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Derives the service-side file path from a downlink URL. The URL shapes
/// vary; the path is anchored at "/<gamename>/" when present and stripped
/// of query noise (`?path=`, `&token=`, `&access_token=`).
pub fn path_from_downlink_url(downlink_url: &str, gamename: &str) -> String {
    let mut url = percent_decode(downlink_url);
    if url.ends_with('/') {
        url.pop();
    }

    let game_marker = format!("/{}/", gamename);

    let mut start = url.rfind('/').map(|p| p + 1).unwrap_or(0);
    if let Some(pos) = url.find(&game_marker) {
        start = pos;
    }

    let mut end = url.len();
    if let Some(q) = url.find('?') {
        end = q;
        if url.contains("?path=") {
            let token_pos = url.find("&token=");
            let access_token_pos = url.find("&access_token=");
            end = match (token_pos, access_token_pos) {
                (Some(a), Some(b)) => a.min(b),
                _ => url.find('&').unwrap_or(end),
            };
        }
    }

    let mut path = url[start..end.max(start)].to_string();

    if !path.contains(&game_marker) {
        path = format!("/{}/{}", gamename, path.trim_start_matches('/'));
    }

    // some URL schemes leave a trailing query fragment inside the path
    if let (Some(q), Some(s)) = (path.rfind('?'), path.rfind('/')) {
        if q > s {
            path.truncate(q);
        }
    }

    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn galaxy_path_from_hash() {
        assert_eq!(
            hash_to_galaxy_path("0123456789abcdef"),
            "01/23/0123456789abcdef"
        );
        // already a path
        assert_eq!(hash_to_galaxy_path("01/23/0123"), "01/23/0123");
    }

    #[test]
    fn depot_filter_language_and_arch() {
        let depot = json!({
            "languages": ["en-US"],
            "osBitness": ["64"],
            "manifest": "abc"
        });
        assert!(depot_matches(&depot, "en|eng|english|en[_-]US", "64"));
        assert!(!depot_matches(&depot, "de|deu|german", "64"));
        assert!(!depot_matches(&depot, "en|eng|english|en[_-]US", "32"));

        let wildcard = json!({"languages": ["*"], "manifest": "abc"});
        assert!(depot_matches(&wildcard, "de", "32"));

        let no_bitness = json!({"languages": ["en"], "manifest": "abc"});
        assert!(depot_matches(&no_bitness, "en", "64"));
    }

    #[test]
    fn manifest_flattening_accumulates_offsets() {
        let manifest = json!({
            "depot": {
                "items": [
                    {
                        "path": "bin\\game.exe",
                        "chunks": [
                            {"compressedMd5": "c1", "md5": "u1", "compressedSize": 10, "size": 20},
                            {"compressedMd5": "c2", "md5": "u2", "compressedSize": 30, "size": 40}
                        ],
                        "md5": "whole"
                    }
                ]
            }
        });
        let items = depot_items_from_manifest(&manifest, false);
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.path, "bin/game.exe");
        assert_eq!(item.md5, "whole");
        assert_eq!(item.total_size_compressed, 40);
        assert_eq!(item.total_size_uncompressed, 60);
        assert_eq!(item.chunks[1].offset_compressed, 10);
        assert_eq!(item.chunks[1].offset_uncompressed, 20);
    }

    #[test]
    fn manifest_single_chunk_md5_fallback() {
        let manifest = json!({
            "depot": {"items": [{
                "path": "a",
                "chunks": [{"compressedMd5": "c", "md5": "u", "compressedSize": 1, "size": 1}]
            }]}
        });
        let items = depot_items_from_manifest(&manifest, true);
        assert_eq!(items[0].md5, "u");
        assert!(items[0].is_dependency);
    }

    #[test]
    fn sfc_becomes_leading_synthetic_item() {
        let manifest = json!({
            "depot": {
                "smallFilesContainer": {
                    "chunks": [{"compressedMd5": "c", "md5": "u", "compressedSize": 5, "size": 9}]
                },
                "items": [{
                    "path": "tiny.txt",
                    "chunks": [{"compressedMd5": "c2", "md5": "u2", "compressedSize": 1, "size": 1}],
                    "sfcRef": {"offset": 3, "size": 1}
                }]
            }
        });
        let items = depot_items_from_manifest(&manifest, false);
        assert_eq!(items.len(), 2);
        assert!(items[0].is_small_files_container);
        assert_eq!(items[0].path, "galaxy_smallfilescontainer");
        assert_eq!(items[1].sfc_offset, Some(3));
        assert_eq!(items[1].sfc_size, Some(1));
    }

    #[test]
    fn cdn_priority_respects_configured_order() {
        let json = json!({
            "urls": [
                {
                    "endpoint_name": "fastly",
                    "url_format": "https://{host}/{path}",
                    "parameters": {"host": "f.example", "path": "token/p"}
                },
                {
                    "endpoint_name": "edgecast",
                    "url_format": "https://{host}/{path}",
                    "parameters": {"host": "e.example", "path": "token/p"}
                }
            ]
        });
        let priority = vec!["edgecast".to_string(), "fastly".to_string()];
        let templates = cdn_url_templates(&json, &priority);
        assert_eq!(templates.len(), 2);
        assert!(templates[0].contains("e.example"));
        assert!(templates[1].contains("f.example"));
        // the path parameter grew the splice marker
        assert!(templates[0].ends_with(&format!("token/p{}", GALAXY_PATH_MARKER)));
    }

    #[test]
    fn cdn_unknown_endpoints_keep_response_order() {
        let json = json!({
            "urls": [
                {"endpoint_name": "mystery_a", "url_format": "a", "parameters": {}},
                {"endpoint_name": "mystery_b", "url_format": "b", "parameters": {}},
                {"endpoint_name": "edgecast", "url_format": "e", "parameters": {}}
            ]
        });
        let priority = vec!["edgecast".to_string()];
        let templates = cdn_url_templates(&json, &priority);
        assert_eq!(templates, vec!["e", "a", "b"]);
    }

    #[test]
    fn downlink_path_extraction() {
        let url = "https://gog-cdn.example.com/files/foo_game/setup_foo_1.0.exe?token=abc";
        assert_eq!(
            path_from_downlink_url(url, "foo_game"),
            "/foo_game/setup_foo_1.0.exe"
        );

        // no gamename in url: prefixed
        let url2 = "https://cdn.example.com/dl/setup.exe";
        assert_eq!(path_from_downlink_url(url2, "foo_game"), "/foo_game/setup.exe");

        // secure-dispatch urls are flagged by the caller
        assert!(secure_suffix("/foo_game/secure"));
        assert!(secure_suffix("/foo_game/securex"));
        assert!(!secure_suffix("/foo_game/securexx_setup.exe"));
    }

    #[test]
    fn downlink_path_with_path_query() {
        let url =
            "https://example.com/secure?path=/foo_game/setup.exe&access_token=t&token=u";
        let path = path_from_downlink_url(url, "foo_game");
        assert_eq!(path, "/foo_game/setup.exe");
    }

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("a%20b%2Fc"), "a b/c");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("bad%zz"), "bad%zz");
    }
}
