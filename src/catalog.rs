//! Game catalog: the account listing, per-product details and the
//! on-disk cache.
//!
//! The cache is one JSON file at `<cache>/gamedetails.json` with
//! `{cache_version, timestamp, games[]}`. Loading distinguishes the
//! reasons a cache can't be used (missing, corrupt, stale, wrong
//! version, empty) so the caller can decide between refetching and
//! accepting stale data.
//!
//! Detail fetching runs a bounded set of concurrent workers over the
//! listing, one product document each, following downlinks to build the
//! file units.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::api::GalaxyApi;
use crate::config::{self, Config};
use crate::models::{GameDetails, GameListItem};
use crate::paths::Transforms;
use crate::plan;

pub const CACHE_VERSION: u32 = 6;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no cache file")]
    Missing,
    #[error("cache is corrupt: {0}")]
    Corrupt(String),
    #[error("cache is stale")]
    Stale,
    #[error("cache version mismatch (found {0})")]
    VersionMismatch(u32),
    #[error("cache has no games")]
    Empty,
}

#[derive(Serialize, Deserialize)]
struct CacheDocument {
    cache_version: u32,
    timestamp: String,
    games: Vec<GameDetails>,
}

fn cache_path(cfg: &Config) -> PathBuf {
    cfg.cache_dir.join("gamedetails.json")
}

/// Loads the catalog cache, enforcing the freshness gates. With
/// `accept_stale` the age gate is skipped (the user opted into stale
/// reads); version and shape gates always apply.
pub fn load_cache(cfg: &Config, accept_stale: bool) -> Result<Vec<GameDetails>, CacheError> {
    let path = cache_path(cfg);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(_) => return Err(CacheError::Missing),
    };

    let doc: Value =
        serde_json::from_slice(&bytes).map_err(|e| CacheError::Corrupt(e.to_string()))?;

    if let Some(stamp) = doc.get("timestamp").and_then(Value::as_str) {
        if !accept_stale {
            let age_ok = chrono::DateTime::parse_from_rfc3339(stamp)
                .map(|t| {
                    Utc::now().signed_duration_since(t)
                        <= chrono::Duration::minutes(cfg.cache_valid_minutes)
                })
                .unwrap_or(false);
            if !age_ok {
                return Err(CacheError::Stale);
            }
        }
    } else if !accept_stale {
        return Err(CacheError::Stale);
    }

    let version = doc
        .get("cache_version")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    if version != CACHE_VERSION {
        return Err(CacheError::VersionMismatch(version));
    }

    match doc.get("games") {
        Some(games_json) => serde_json::from_value::<Vec<GameDetails>>(games_json.clone())
            .map_err(|e| CacheError::Corrupt(e.to_string())),
        None => Err(CacheError::Empty),
    }
}

pub fn save_cache(cfg: &Config, games: &[GameDetails]) -> Result<()> {
    if games.is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(&cfg.cache_dir)?;
    let doc = CacheDocument {
        cache_version: CACHE_VERSION,
        timestamp: Utc::now().to_rfc3339(),
        games: games.to_vec(),
    };
    std::fs::write(cache_path(cfg), serde_json::to_vec_pretty(&doc)?)?;
    Ok(())
}

pub struct Catalog {
    api: GalaxyApi,
}

impl Catalog {
    pub fn new(api: GalaxyApi) -> Catalog {
        Catalog { api }
    }

    pub fn api(&self) -> &GalaxyApi {
        &self.api
    }

    /// Numeric product ids the account owns, used to drop unowned DLC
    /// documents during expansion.
    pub async fn owned_ids(&self) -> Vec<String> {
        match self.api.get_json("https://embed.gog.com/user/data/games").await {
            Ok(json) => json
                .get("owned")
                .and_then(Value::as_array)
                .map(|ids| {
                    ids.iter()
                        .map(|v| match v {
                            Value::Number(n) => n.to_string(),
                            Value::String(s) => s.clone(),
                            _ => String::new(),
                        })
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            Err(e) => {
                log::warn!("failed to fetch owned game ids: {}", e);
                Vec::new()
            }
        }
    }

    /// Walks the paginated account listing. A second pass picks up hidden
    /// products when requested; the game regex and platform detection
    /// prune early so detail fetching stays cheap.
    pub async fn game_list(&self, cfg: &Config) -> Result<Vec<GameListItem>> {
        let mut games: Vec<GameListItem> = Vec::new();
        let game_regex = if cfg.args.game.is_empty() {
            None
        } else {
            Some(regex::Regex::new(&cfg.args.game)?)
        };

        let mut hidden = false;
        loop {
            let mut page = 1u32;
            loop {
                let root = self
                    .api
                    .filtered_products_page(page, hidden, cfg.args.updated, &cfg.args.tags)
                    .await?;

                let total_pages = root.get("totalPages").and_then(Value::as_u64).unwrap_or(0);
                eprint!(
                    "\x1b[KGetting game names ({}/{})\r",
                    root.get("page").and_then(Value::as_u64).unwrap_or(0),
                    total_pages
                );

                if let Some(products) = root.get("products").and_then(Value::as_array) {
                    for product in products {
                        let mut item = GameListItem {
                            gamename: product
                                .get("slug")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            id: match product.get("id") {
                                Some(Value::Number(n)) => n.to_string(),
                                Some(Value::String(s)) => s.clone(),
                                _ => String::new(),
                            },
                            is_new: product
                                .get("isNew")
                                .and_then(Value::as_bool)
                                .unwrap_or(false),
                            ..GameListItem::default()
                        };

                        // null updates happens for DLC-only ownership
                        item.updates = match product.get("updates") {
                            Some(Value::Number(n)) => n.as_u64().unwrap_or(0) as u32,
                            Some(Value::String(s)) => s.parse().unwrap_or(0),
                            _ => 0,
                        };

                        let works_on = &product["worksOn"];
                        if works_on["Windows"].as_bool().unwrap_or(false) {
                            item.platform |= config::PLATFORM_WINDOWS;
                        }
                        if works_on["Mac"].as_bool().unwrap_or(false) {
                            item.platform |= config::PLATFORM_MAC;
                        }
                        if works_on["Linux"].as_bool().unwrap_or(false) {
                            item.platform |= config::PLATFORM_LINUX;
                        }

                        if item.platform & cfg.dl.platform == 0 {
                            continue;
                        }
                        if let Some(re) = &game_regex {
                            if !re.is_match(&item.gamename) {
                                continue;
                            }
                        }

                        // products whose shelf entry claims DLC get their
                        // account details early so the DLC tree can be
                        // cross-checked later
                        let dlc_count =
                            product.get("dlcCount").and_then(Value::as_u64).unwrap_or(0);
                        let mut fetch_details = dlc_count != 0;
                        if !fetch_details && !cfg.gamehasdlc.is_empty() {
                            fetch_details = cfg.gamehasdlc.is_blacklisted(&item.gamename);
                        }
                        if fetch_details && cfg.dl.include & config::INCLUDE_DLC != 0 {
                            if let Ok(details) = self.api.game_details_json(&item.id).await {
                                item.details_json = Some(details);
                            }
                        }

                        games.push(item);
                    }
                }

                let current = root.get("page").and_then(Value::as_u64).unwrap_or(page as u64);
                if current >= total_pages || total_pages == 0 {
                    break;
                }
                page += 1;
            }

            if cfg.args.include_hidden_products && !hidden {
                hidden = true;
                continue;
            }
            break;
        }
        eprintln!();

        if cfg.args.include_hidden_products {
            games.sort_by(|a, b| a.gamename.cmp(&b.gamename));
        }

        Ok(games)
    }

    /// Fetches full details for every listed product with a bounded
    /// worker pool.
    pub async fn game_details(
        &self,
        cfg: &Config,
        items: Vec<GameListItem>,
    ) -> Result<Vec<GameDetails>> {
        let owned_ids = Arc::new(self.owned_ids().await);
        let semaphore = Arc::new(Semaphore::new(cfg.info_threads as usize));
        let mut join = JoinSet::new();
        let total = items.len();

        for (index, item) in items.into_iter().enumerate() {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore closed");
            let api = self.api.clone();
            let dl = cfg.game_specific(&item.gamename);
            let save_product_json = cfg.dl.save_product_json;
            let owned_ids = owned_ids.clone();
            join.spawn(async move {
                let _permit = permit;
                if api.is_token_expired() {
                    if let Err(e) = api.refresh_login().await {
                        log::error!("token refresh failed: {}", e);
                        return (index, None);
                    }
                }
                let json = match api.product_info(&item.id).await {
                    Ok(v) => v,
                    Err(e) => {
                        eprintln!("failed to fetch product {}: {}", item.gamename, e);
                        return (index, None);
                    }
                };
                match api.product_details_from_json(&json, &dl, &owned_ids).await {
                    Ok(mut game) => {
                        if item.updates > 0 {
                            for gf in game
                                .installers
                                .iter_mut()
                                .chain(game.patches.iter_mut())
                                .chain(game.languagepacks.iter_mut())
                            {
                                gf.updated = true;
                            }
                        }
                        if save_product_json {
                            game.product_json = Some(json);
                        }
                        (index, Some(game))
                    }
                    Err(e) => {
                        eprintln!("failed to expand product {}: {}", item.gamename, e);
                        (index, None)
                    }
                }
            });
        }

        let mut slots: Vec<Option<GameDetails>> = (0..total).map(|_| None).collect();
        let mut done = 0usize;
        while let Some(res) = join.join_next().await {
            if let Ok((index, game)) = res {
                slots[index] = game;
                done += 1;
                eprint!("\x1b[KGetting game info {} / {}\r", done, total);
            }
        }
        eprintln!();

        Ok(slots.into_iter().flatten().collect())
    }

    /// The catalog for the current invocation: cache when allowed and
    /// fresh enough, otherwise a full fetch (persisted back to the cache
    /// file). Priority filters and target paths are applied either way.
    pub async fn games(&self, cfg: &Config, transforms: &Transforms) -> Result<Vec<GameDetails>> {
        let mut games: Option<Vec<GameDetails>> = None;

        if cfg.args.use_cache && !cfg.args.update_cache {
            match load_cache(cfg, false) {
                Ok(cached) => games = Some(cached),
                Err(e) => eprintln!("cache not used: {}", e),
            }
        }

        let mut games = match games {
            Some(g) => g,
            None => {
                let list = self.game_list(cfg).await?;
                let fetched = self.game_details(cfg, list).await?;
                if let Err(e) = save_cache(cfg, &fetched) {
                    log::warn!("failed to save catalog cache: {}", e);
                }
                fetched
            }
        };

        // regex filter applies to cached entries too
        if !cfg.args.game.is_empty() {
            let re = regex::Regex::new(&cfg.args.game)?;
            games.retain(|g| re.is_match(&g.gamename));
        }

        for game in &mut games {
            let dl = cfg.game_specific(&game.gamename);
            plan::filter_game_with_priorities(game, &dl);
            plan::make_filepaths(game, cfg, transforms);
        }

        Ok(games)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Args;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut cfg = Config::from_args(Args::default());
        cfg.cache_dir = dir.to_path_buf();
        cfg.cache_valid_minutes = 60;
        cfg
    }

    fn game(name: &str) -> GameDetails {
        GameDetails {
            gamename: name.into(),
            product_id: "1".into(),
            title: name.to_uppercase(),
            ..GameDetails::default()
        }
    }

    #[test]
    fn missing_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        assert!(matches!(load_cache(&cfg, false), Err(CacheError::Missing)));
    }

    #[test]
    fn corrupt_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        std::fs::write(tmp.path().join("gamedetails.json"), b"{not json").unwrap();
        assert!(matches!(load_cache(&cfg, false), Err(CacheError::Corrupt(_))));
    }

    #[test]
    fn roundtrip_preserves_games() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        save_cache(&cfg, &[game("alpha"), game("beta")]).unwrap();
        let loaded = load_cache(&cfg, false).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].gamename, "alpha");
        assert_eq!(loaded[1].title, "BETA");
    }

    #[test]
    fn stale_cache_rejected_unless_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        let doc = serde_json::json!({
            "cache_version": CACHE_VERSION,
            "timestamp": "2000-01-01T00:00:00+00:00",
            "games": [game("old")]
        });
        std::fs::write(
            tmp.path().join("gamedetails.json"),
            serde_json::to_vec(&doc).unwrap(),
        )
        .unwrap();
        assert!(matches!(load_cache(&cfg, false), Err(CacheError::Stale)));
        let accepted = load_cache(&cfg, true).unwrap();
        assert_eq!(accepted[0].gamename, "old");
    }

    #[test]
    fn version_mismatch_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        let doc = serde_json::json!({
            "cache_version": CACHE_VERSION + 1,
            "timestamp": Utc::now().to_rfc3339(),
            "games": []
        });
        std::fs::write(
            tmp.path().join("gamedetails.json"),
            serde_json::to_vec(&doc).unwrap(),
        )
        .unwrap();
        assert!(matches!(
            load_cache(&cfg, false),
            Err(CacheError::VersionMismatch(v)) if v == CACHE_VERSION + 1
        ));
    }

    #[test]
    fn cache_without_games_key_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        let doc = serde_json::json!({
            "cache_version": CACHE_VERSION,
            "timestamp": Utc::now().to_rfc3339()
        });
        std::fs::write(
            tmp.path().join("gamedetails.json"),
            serde_json::to_vec(&doc).unwrap(),
        )
        .unwrap();
        assert!(matches!(load_cache(&cfg, false), Err(CacheError::Empty)));
    }

    #[test]
    fn empty_game_vec_not_saved() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = test_config(tmp.path());
        save_cache(&cfg, &[]).unwrap();
        assert!(!tmp.path().join("gamedetails.json").exists());
    }
}
