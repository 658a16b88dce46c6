//! Verb orchestration: every top-level command composes the catalog, the
//! planner and the engine here.
//!
//! The flow for the usual `--download` invocation:
//! 1. catalog.games() materializes the owned products (cache or fetch),
//!    with priority filters applied and target paths computed,
//! 2. sidecar artifacts (serials, changelogs, logos, icons, product
//!    JSON) are saved according to their flags,
//! 3. the file units selected by --include land on the engine queue.
//!
//! `--galaxy-install` runs the repository path instead: build index →
//! manifest → depot items → engine; when the content system has no
//! builds for the configured platform the product's installer binary is
//! parsed as a synthetic repository (engine::mojo).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;

use crate::api::legacy::LegacyApi;
use crate::api::GalaxyApi;
use crate::catalog::Catalog;
use crate::cloud::CloudSaves;
use crate::config::{self, Config};
use crate::engine::{mojo, worker, Engine};
use crate::http::HttpClient;
use crate::models::{GameDetails, GameFile};
use crate::orphan;
use crate::paths::{self, Transforms};
use crate::plan;
use crate::token::{self, TokenStore};
use crate::utils;
use crate::verify::{self, FileVerifier};

pub struct Downloader {
    cfg: Config,
    api: GalaxyApi,
    catalog: Catalog,
    transforms: Transforms,
}

impl Downloader {
    pub fn new(cfg: Config) -> Result<Downloader> {
        let http = HttpClient::new(cfg.http.clone())?;
        let token = Arc::new(TokenStore::load(&cfg.token_path, cfg.respect_umask));
        let api = GalaxyApi::new(http, token);
        let catalog = Catalog::new(api.clone());
        let transforms = Transforms::load(&cfg.config_dir);
        Ok(Downloader {
            cfg,
            api,
            catalog,
            transforms,
        })
    }

    /// Valid session or bail with a hint; refreshes when expired.
    pub async fn ensure_login(&self) -> Result<()> {
        if !self.api.is_token_expired() {
            return Ok(());
        }
        self.api
            .refresh_login()
            .await
            .context("not logged in, use --login first")
    }

    /// Browser-assisted authorization-code login. The code is pasted back
    /// on stdin because the redirect lands on a page the client cannot
    /// intercept.
    pub async fn login(&self) -> Result<()> {
        let url = token::login_url();
        if webbrowser::open(&url).is_err() {
            println!("Please go to {}", url);
        } else {
            println!("Opened {} in your browser", url);
        }
        println!("After logging in, copy the \"code\" parameter from the redirect URL.");
        print!("Enter the authorization code: ");
        std::io::stdout().flush()?;

        let mut code = String::new();
        std::io::stdin().read_line(&mut code)?;
        let code = code.trim().trim_matches('"');
        if code.is_empty() {
            return Err(anyhow!("no authorization code given"));
        }

        self.api
            .token()
            .exchange_code(self.api.http().inner(), code)
            .await?;
        println!("Login successful.");
        Ok(())
    }

    pub async fn games(&self) -> Result<Vec<GameDetails>> {
        self.catalog.games(&self.cfg, &self.transforms).await
    }

    pub async fn list(&self) -> Result<()> {
        match self.cfg.args.list_format.as_str() {
            "games" => {
                for item in self.catalog.game_list(&self.cfg).await? {
                    println!("{}", item.gamename);
                }
            }
            "details" => {
                for game in self.games().await? {
                    print_game_details(&game);
                }
            }
            "json" => {
                let games = self.games().await?;
                println!("{}", serde_json::to_string_pretty(&games)?);
            }
            "tags" => {
                let page = self.catalog.api().account_tags().await?;
                if let Some(tags) = page.get("tags").and_then(Value::as_array) {
                    for tag in tags {
                        println!(
                            "{} = {}",
                            tag.get("id").and_then(Value::as_str).unwrap_or_default(),
                            tag.get("name").and_then(Value::as_str).unwrap_or_default()
                        );
                    }
                }
            }
            "userdata" => {
                let data = self.api.user_data().await?;
                println!("{}", serde_json::to_string_pretty(&data)?);
            }
            "wishlist" => {
                let data = self.api.wishlist().await?;
                println!("{}", serde_json::to_string_pretty(&data)?);
            }
            "transform" => {
                for item in self.catalog.game_list(&self.cfg).await? {
                    let transformed = self.transforms.apply(&item.gamename);
                    if transformed != item.gamename {
                        println!("{} -> {}", item.gamename, transformed);
                    }
                }
            }
            other => return Err(anyhow!("unknown list format: {}", other)),
        }
        Ok(())
    }

    pub async fn update_cache(&self) -> Result<()> {
        let list = self.catalog.game_list(&self.cfg).await?;
        let games = self.catalog.game_details(&self.cfg, list).await?;
        crate::catalog::save_cache(&self.cfg, &games)?;
        println!("Cached details for {} games", games.len());
        Ok(())
    }

    /// Account notification counters from the top-level user data
    /// document; re-requesting details clears the update flags.
    pub async fn update_check(&self) -> Result<()> {
        let data = self.api.user_data().await?;
        let updates = data
            .get("updates")
            .ok_or_else(|| anyhow!("invalid user data response"))?;
        println!(
            "New forum replies: {}",
            updates.get("messages").and_then(Value::as_i64).unwrap_or(0)
        );
        println!(
            "Updated games: {}",
            updates.get("products").and_then(Value::as_i64).unwrap_or(0)
        );
        println!(
            "Unread chat messages: {}",
            updates
                .get("unreadChatMessages")
                .and_then(Value::as_i64)
                .unwrap_or(0)
        );

        if updates.get("products").and_then(Value::as_i64).unwrap_or(0) > 0 {
            let mut cfg = self.cfg.clone();
            cfg.args.updated = true;
            let items = self.catalog.game_list(&cfg).await?;
            for (i, item) in items.iter().enumerate() {
                eprint!("\x1b[KClearing update flags {} / {}\r", i + 1, items.len());
                let _ = self.api.game_details_json(&item.id).await;
            }
            eprintln!();
        }
        Ok(())
    }

    /// The `--download` verb. Returns the exit-code bit.
    pub async fn download(&self) -> Result<i32> {
        let games = self.games().await?;
        let mut units: Vec<GameFile> = Vec::new();

        for game in &games {
            let dl = self.cfg.game_specific(&game.gamename);
            self.save_game_sidecars(game, &dl).await;
            for dlc in &game.dlcs {
                if dl.include & config::INCLUDE_DLC != 0 {
                    self.save_game_sidecars(dlc, &dl).await;
                }
            }
            units.extend(
                game.all_files()
                    .into_iter()
                    .filter(|gf| plan::kind_included(gf.kind, dl.include)),
            );
        }

        let engine = Engine::new(self.cfg.clone(), self.api.clone());
        Ok(engine.run_files(units).await)
    }

    async fn save_game_sidecars(&self, game: &GameDetails, dl: &config::DownloadConfig) {
        if dl.save_serials && !game.serials.is_empty() {
            self.save_text_file(&game.serials_path, &game.serials);
        }
        if dl.save_changelogs && !game.changelog.is_empty() {
            self.save_text_file(&game.changelog_path, &game.changelog);
        }
        if dl.save_product_json {
            if let Some(json) = &game.product_json {
                if let Ok(text) = serde_json::to_string_pretty(json) {
                    self.save_text_file(&game.product_json_path, &text);
                }
            }
        }
        if dl.save_logo && !game.logo.is_empty() {
            self.save_remote_file(&game.logo, &game.logo_path).await;
        }
        if dl.save_icon && !game.icon.is_empty() {
            self.save_remote_file(&game.icon, &game.icon_path).await;
        }
    }

    fn save_text_file(&self, path: &str, contents: &str) {
        let path = Path::new(path);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(path, contents) {
            eprintln!("Failed to save {}: {}", path.display(), e);
        }
    }

    async fn save_remote_file(&self, url: &str, path: &str) {
        let target = Path::new(path);
        if target.exists() {
            return;
        }
        if let Some(parent) = target.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = self
            .api
            .http()
            .download_to_file(url, None, target, 0, |_| {}, |_, _| {})
            .await
        {
            eprintln!("Failed to save {}: {}", path, e);
        }
    }

    /// `--check-status`: one line per selected file.
    /// OK = intact, ND = not downloaded, MD5 = digest mismatch,
    /// FS = size mismatch.
    pub async fn check_status(&self) -> Result<()> {
        let games = self.games().await?;

        for gf in games.iter().flat_map(|g| g.all_files()) {
            if !plan::kind_included(gf.kind, self.cfg.dl.include) {
                continue;
            }
            if self.cfg.blacklist.is_blacklisted(&gf.target_path) {
                continue;
            }

            let filepath = Path::new(&gf.target_path);
            let filename = filepath
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let slug = worker::sidecar_slug(&gf).to_string();

            if !filepath.is_file() {
                println!("ND {} {}", slug, filename);
                continue;
            }

            let filesize = std::fs::metadata(filepath).map(|m| m.len()).unwrap_or(0);
            let local_xml =
                FileVerifier::load(&verify::xml_path(&self.cfg.xml_dir, &slug, &filename)).ok();
            let xml_size = local_xml.as_ref().map(|v| v.total_size).unwrap_or(0);

            if self.cfg.args.size_only {
                let code = if xml_size > 0 && xml_size != filesize { "FS" } else { "OK" };
                println!("{} {} {} {}", code, slug, filename, filesize);
                continue;
            }

            let local_hash = match &local_xml {
                Some(v) if !v.md5.is_empty() => v.md5.clone(),
                _ => utils::file_md5(filepath).unwrap_or_default(),
            };

            let mut remote_hash = String::new();
            if gf.has_remote_checksum() {
                remote_hash = self.remote_file_hash(&gf).await.unwrap_or_default();
            }

            let code = if !remote_hash.is_empty() && remote_hash != local_hash {
                "MD5"
            } else if xml_size > 0 && xml_size != filesize {
                "FS"
            } else {
                "OK"
            };
            println!("{} {} {} {} {}", code, slug, filename, filesize, local_hash);
        }
        Ok(())
    }

    async fn remote_file_hash(&self, gf: &GameFile) -> Option<String> {
        if self.api.is_token_expired() && self.api.refresh_login().await.is_err() {
            return None;
        }
        let downlink_json = self.api.get_json(&gf.downlink).await.ok()?;
        let xml_url = downlink_json.get("checksum").and_then(Value::as_str)?;
        if xml_url.is_empty() {
            return None;
        }
        let xml = self.api.get_text(xml_url).await.ok()?;
        FileVerifier::parse(&xml).ok().map(|v| v.md5)
    }

    /// `--repair [--download]`: verifier-driven restream of corrupt
    /// chunks; whole-file redownload when sizes disagree or no verifier
    /// data exists.
    pub async fn repair(&self) -> Result<i32> {
        let games = self.games().await?;
        let mut failures = 0;

        for gf in games.iter().flat_map(|g| g.all_files()) {
            let dl = self.cfg.game_specific(&gf.gamename);
            if !plan::kind_included(gf.kind, dl.include) {
                continue;
            }
            if self.cfg.blacklist.is_blacklisted(&gf.target_path) {
                continue;
            }

            if self.api.is_token_expired() && self.api.refresh_login().await.is_err() {
                eprintln!("Failed to refresh login");
                break;
            }

            let downlink_json = match self.api.get_json(&gf.downlink).await {
                Ok(v) => v,
                Err(e) => {
                    eprintln!("Downlink fetch failed, skipping file: {}", e);
                    continue;
                }
            };
            let Some(url) = downlink_json.get("downlink").and_then(Value::as_str) else {
                eprintln!("Invalid JSON response, skipping file");
                continue;
            };

            let mut remote_xml = String::new();
            if dl.remote_xml {
                if let Some(xml_url) = downlink_json
                    .get("checksum")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                {
                    remote_xml = self.api.get_text(xml_url).await.unwrap_or_default();
                }
            }

            // extras only ever have local verifier data
            let use_local = !dl.remote_xml || (remote_xml.is_empty() && gf.kind.is_extra());
            if remote_xml.is_empty() && !use_local {
                continue;
            }

            println!("Repairing file {}", gf.target_path);
            if !self.repair_file(url, &gf, &remote_xml).await? {
                failures += 1;
            }
            println!();
        }
        Ok((failures > 0) as i32)
    }

    async fn repair_file(&self, url: &str, gf: &GameFile, remote_xml: &str) -> Result<bool> {
        let filepath = PathBuf::from(&gf.target_path);
        let filename = filepath
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let slug = worker::sidecar_slug(gf).to_string();
        let xml_file = verify::xml_path(&self.cfg.xml_dir, &slug, &filename);

        let verifier = if !remote_xml.is_empty() {
            println!("XML: Using remote file");
            FileVerifier::parse(remote_xml).ok()
        } else {
            println!("XML: Using local file");
            FileVerifier::load(&xml_file).ok()
        };

        let Some(verifier) = verifier else {
            println!("XML: Parsing failed / not valid XML");
            if self.cfg.args.download {
                println!("Downloading: {}", filepath.display());
                let ok = self.download_single(url, &filepath).await?;
                if ok && self.cfg.dl.automatic_xml_creation {
                    self.create_sidecar(&filepath, &slug);
                }
                return Ok(ok);
            }
            println!("Can't repair file.");
            return Ok(false);
        };

        println!(
            "{}\n\tMD5:\t{}\n\tChunks:\t{}\n\tSize:\t{} bytes",
            verifier.name,
            verifier.md5,
            verifier.chunks.len(),
            verifier.total_size
        );

        if !filepath.is_file() {
            println!("File doesn't exist {}", filepath.display());
            if self.cfg.args.download {
                println!("Downloading: {}", filepath.display());
                return self.download_single(url, &filepath).await;
            }
            return Ok(false);
        }

        let filesize = std::fs::metadata(&filepath)?.len();
        if filesize != verifier.total_size {
            println!("Filesizes don't match");
            println!("Incomplete download or different version");
            if !self.cfg.args.download {
                return Ok(false);
            }

            let new_name = worker::old_version_name(&gf.target_path);
            println!("Renaming old file to {}", new_name);
            std::fs::rename(&filepath, &new_name)?;
            if xml_file.exists() {
                println!("Deleting old XML data");
                let _ = std::fs::remove_file(&xml_file);
            }
            let ok = self.download_single(url, &filepath).await?;
            if ok && !xml_file.exists() {
                self.create_sidecar(&filepath, &slug);
            }
            return Ok(ok);
        }

        // restream only the disagreeing chunk ranges, three attempts each
        const CHUNK_RETRY_LIMIT: u32 = 3;
        let mut chunks_repaired = 0u32;
        for i in verifier.mismatched_chunks(&filepath)? {
            let chunk = &verifier.chunks[i];
            let len = chunk.to - chunk.from + 1;
            println!("Chunk {} ({} bytes): Failed - downloading chunk", i, len);

            let mut attempts = 0u32;
            loop {
                let mut buf = Vec::with_capacity(len as usize);
                self.api
                    .http()
                    .download_range_to_buffer(
                        url,
                        None,
                        Some((chunk.from, chunk.to)),
                        &mut buf,
                        |_| {},
                        |attempt, err| {
                            println!(
                                "Retry {}/{}: chunk {} ({})",
                                attempt, self.cfg.retries, i, err
                            )
                        },
                    )
                    .await?;

                use std::io::Seek;
                let mut file = std::fs::OpenOptions::new().write(true).open(&filepath)?;
                file.seek(std::io::SeekFrom::Start(chunk.from))?;
                file.write_all(&buf)?;
                file.flush()?;
                drop(file);

                // the counter tracks every issued restream, even one a
                // later verification rejects
                chunks_repaired += 1;

                if utils::file_md5_range(&filepath, chunk.from, len)? == chunk.md5 {
                    println!("Chunk {}: OK", i);
                    break;
                }
                attempts += 1;
                if attempts >= CHUNK_RETRY_LIMIT {
                    println!("Failed - chunk retry limit reached");
                    if self.cfg.args.report {
                        self.append_report(&format!("Repair failed: {}", gf.target_path));
                    }
                    return Ok(false);
                }
                println!("Chunk {}: Failed - retrying chunk download", i);
            }
        }

        if self.cfg.args.report {
            self.append_report(&format!(
                "Repaired [{}/{}] {}",
                chunks_repaired,
                verifier.chunks.len(),
                gf.target_path
            ));
        }
        Ok(true)
    }

    fn create_sidecar(&self, filepath: &Path, slug: &str) {
        println!("Starting automatic XML creation");
        match FileVerifier::create(filepath, self.cfg.chunk_size) {
            Ok(v) => {
                if let Err(e) = v.save(&self.cfg.xml_dir, slug) {
                    eprintln!("Failed to save XML: {}", e);
                }
            }
            Err(e) => eprintln!("Failed to hash {}: {}", filepath.display(), e),
        }
    }

    fn append_report(&self, line: &str) {
        if let Ok(mut f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.cfg.report_path)
        {
            let _ = writeln!(f, "{}", line);
        }
    }

    /// Sequential download with resume, used by repair and
    /// --download-file. Returns true on success.
    async fn download_single(&self, url: &str, filepath: &Path) -> Result<bool> {
        if let Some(parent) = filepath.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let resume_from = std::fs::metadata(filepath).map(|m| m.len()).unwrap_or(0);
        let result = self
            .api
            .http()
            .download_to_file(
                url,
                None,
                filepath,
                resume_from,
                |_| {},
                |attempt, err| {
                    println!(
                        "Retry {}/{}: {} ({})",
                        attempt,
                        self.cfg.retries,
                        filepath.display(),
                        err
                    )
                },
            )
            .await;
        match result {
            Ok(outcome) => {
                if let Some(mtime) = outcome.server_mtime {
                    let _ = utils::set_file_mtime(filepath, mtime);
                }
                Ok(true)
            }
            Err(e) => {
                eprintln!("Download failed: {}", e);
                Ok(false)
            }
        }
    }

    /// `--download-file gamename/fileid[,...]`, also accepting the
    /// gogdownloader:// protocol form.
    pub async fn download_file_ids(&self) -> Result<i32> {
        let spec = self
            .cfg
            .args
            .download_file
            .trim_start_matches("gogdownloader://")
            .to_string();
        let mut failures = 0;

        for entry in spec.split(',').filter(|s| !s.is_empty()) {
            let Some((gamename, file_id)) = entry.split_once('/') else {
                eprintln!("Invalid file id format: {} (expected gamename/fileid)", entry);
                failures += 1;
                continue;
            };

            let product_id = self.resolve_product_id(gamename).await?;
            let json = self.api.product_info(&product_id).await?;
            let dl = config::DownloadConfig {
                include: config::INCLUDE_ALL,
                platform: config::option_value("all", config::PLATFORMS),
                language: config::option_value("all", config::LANGUAGES),
                duplicate_handler: false,
                ..self.cfg.dl.clone()
            };
            let owned: Vec<String> = Vec::new();
            let game = self.api.product_details_from_json(&json, &dl, &owned).await?;

            let gf = game.all_files().into_iter().find(|f| f.id == file_id);
            let (url, server_path) = match &gf {
                Some(gf) => {
                    let downlink_json = self.api.get_json(&gf.downlink).await?;
                    let Some(url) = downlink_json.get("downlink").and_then(Value::as_str) else {
                        eprintln!("Invalid downlink response for {}", entry);
                        failures += 1;
                        continue;
                    };
                    (url.to_string(), gf.path.clone())
                }
                // the pre-OAuth2 downloader endpoints still resolve file
                // ids the product document no longer lists
                None => match self.legacy_installer_link(gamename, file_id).await {
                    Some(link) => link,
                    None => {
                        eprintln!("File id {} not found for {}", file_id, gamename);
                        failures += 1;
                        continue;
                    }
                },
            };

            let filename = server_path
                .rsplit('/')
                .next()
                .unwrap_or(&server_path)
                .to_string();
            let target = if self.cfg.args.output_file.is_empty() {
                PathBuf::from(&self.cfg.dirs.directory).join(filename)
            } else {
                PathBuf::from(&self.cfg.args.output_file)
            };

            println!("Downloading: {}", target.display());
            if !self.download_single(&url, &target).await? {
                failures += 1;
            }
        }
        Ok((failures > 0) as i32)
    }

    /// Resolves a file id through the legacy HMAC-signed downloader
    /// endpoints. Needs the old API token pair (--api-token/--api-secret).
    async fn legacy_installer_link(&self, gamename: &str, file_id: &str) -> Option<(String, String)> {
        if self.cfg.args.api_token.is_empty() || self.cfg.args.api_secret.is_empty() {
            return None;
        }
        let mut legacy = LegacyApi::new(
            self.api.http().clone(),
            self.cfg.args.api_token.clone(),
            self.cfg.args.api_secret.clone(),
        );
        if let Err(e) = legacy.init().await {
            eprintln!("Legacy API unavailable: {}", e);
            return None;
        }
        let json = match legacy.installer_link(gamename, file_id).await {
            Ok(v) => v,
            Err(_) => legacy.extra_link(gamename, file_id).await.ok()?,
        };
        let link = json["file"]["link"].as_str().or(json["link"].as_str())?;
        let path = json["file"]["path"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| link.to_string());
        Some((link.to_string(), path))
    }

    /// `--check-orphans`: list (or delete) files the plan no longer
    /// produces. Orphan checking always looks at everything, so the
    /// include/platform/language filters are widened first.
    pub async fn check_orphans(&self, orphan_regex: &str) -> Result<()> {
        let mut cfg = self.cfg.clone();
        cfg.dl.include = config::INCLUDE_ALL;
        cfg.dl.platform = config::option_value("all", config::PLATFORMS);
        cfg.dl.language = config::option_value("all", config::LANGUAGES);
        cfg.dl.platform_priority.clear();
        cfg.dl.language_priority.clear();

        let games = self.catalog.games(&cfg, &self.transforms).await?;
        let orphans = orphan::scan(&games, &cfg, &self.transforms, orphan_regex);

        if orphans.is_empty() {
            println!("No orphaned files");
            return Ok(());
        }
        for path in orphans {
            if self.cfg.dl.delete_orphans {
                println!("Deleting {}", path.display());
                if std::fs::remove_file(&path).is_err() {
                    eprintln!("Failed to delete {}", path.display());
                }
            } else {
                println!("{}", path.display());
            }
        }
        Ok(())
    }

    /// Resolves a product argument: numeric ids pass through, slugs are
    /// looked up in the account listing.
    pub async fn resolve_product_id(&self, product: &str) -> Result<String> {
        if product.chars().all(|c| c.is_ascii_digit()) && !product.is_empty() {
            return Ok(product.to_string());
        }
        let mut cfg = self.cfg.clone();
        cfg.args.game = format!("^{}$", regex::escape(product));
        let items = self.catalog.game_list(&cfg).await?;
        items
            .into_iter()
            .find(|i| i.gamename == product)
            .map(|i| i.id)
            .ok_or_else(|| anyhow!("product {} not found in your library", product))
    }

    /// Install directory for a content-system build, from the configured
    /// template.
    async fn galaxy_install_directory(&self, manifest: &Value) -> String {
        let template = self.cfg.dirs.galaxy_install_subdir.as_str();
        let product_id = manifest
            .get("baseProductId")
            .and_then(product_id_str)
            .unwrap_or_default();
        let install_dir = manifest
            .get("installDirectory")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match template {
            "%install_dir%" => install_dir,
            "%install_dir_stripped%" => paths::stripped_string(&install_dir),
            "%product_id%" => product_id,
            "%gamename%" | "%title%" | "%title_stripped%" => {
                let info = self.api.product_info(&product_id).await.unwrap_or(Value::Null);
                let gamename = info.get("slug").and_then(Value::as_str).unwrap_or_default();
                let title = info.get("title").and_then(Value::as_str).unwrap_or_default();
                match template {
                    "%gamename%" => gamename.to_string(),
                    "%title%" => title.to_string(),
                    _ => paths::stripped_string(title),
                }
            }
            other => other.to_string(),
        }
    }

    /// `--galaxy-show-builds PRODUCT[/BUILD]`.
    pub async fn galaxy_show_builds(&self, product: &str, build_index: Option<usize>) -> Result<()> {
        let product_id = self.resolve_product_id(product).await?;
        let platform = config::galaxy_platform_name(self.cfg.dl.galaxy_platform);
        let json = self.api.product_builds(&product_id, platform).await?;

        let items = json.get("items").and_then(Value::as_array);
        let Some(items) = items.filter(|i| !i.is_empty()) else {
            println!("No builds available for {}", platform);
            return Ok(());
        };

        match build_index {
            None => {
                for (i, build) in items.iter().enumerate() {
                    println!(
                        "{}: build {} ({}) generation {}{}",
                        i,
                        build.get("build_id").and_then(product_id_str).unwrap_or_default(),
                        build
                            .get("date_published")
                            .and_then(Value::as_str)
                            .unwrap_or_default(),
                        build.get("generation").and_then(Value::as_i64).unwrap_or(0),
                        build
                            .get("version_name")
                            .and_then(Value::as_str)
                            .filter(|v| !v.is_empty())
                            .map(|v| format!(" version {}", v))
                            .unwrap_or_default()
                    );
                }
            }
            Some(index) => {
                let build = items
                    .get(index)
                    .ok_or_else(|| anyhow!("build index {} out of range", index))?;
                let link = build
                    .get("link")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("build without manifest link"))?;
                // generation 1 links point at the manifest document itself
                let manifest =
                    if build.get("generation").and_then(Value::as_i64) == Some(2) {
                        let hash = link.rsplit('/').next().unwrap_or_default();
                        self.api.manifest_v2(hash, false).await?
                    } else {
                        self.api.manifest_v1(link).await?
                    };
                println!("{}", serde_json::to_string_pretty(&manifest)?);
            }
        }
        Ok(())
    }

    /// `--galaxy-install PRODUCT[/BUILD]`: the repository path, falling
    /// back to the installer-as-repository when the platform has no
    /// builds.
    pub async fn galaxy_install(&self, product: &str, build_index: Option<usize>) -> Result<i32> {
        let product_id = self.resolve_product_id(product).await?;
        let build_index = build_index.unwrap_or(0);
        let platform = config::galaxy_platform_name(self.cfg.dl.galaxy_platform);

        let builds = self.api.product_builds(&product_id, platform).await?;
        let empty = builds
            .get("items")
            .and_then(Value::as_array)
            .map(|i| i.is_empty())
            .unwrap_or(true);

        if empty && self.cfg.dl.galaxy_platform & config::PLATFORM_LINUX != 0 {
            println!("Content system has no Linux builds for this product");
            println!("Trying to use installers as repository");
            return self.galaxy_install_installer_fallback(&product_id).await;
        }

        let build = &builds["items"][build_index];
        if build.get("generation").and_then(Value::as_i64) != Some(2) {
            return Err(anyhow!("only generation 2 builds are supported"));
        }
        let link = build
            .get("link")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("build without manifest link"))?;
        let build_hash = link.rsplit('/').next().unwrap_or_default().to_string();
        let build_id = build
            .get("build_id")
            .and_then(product_id_str)
            .unwrap_or_default();

        let manifest = self.api.manifest_v2(&build_hash, false).await?;
        let title = manifest["products"][0]["name"].as_str().unwrap_or(product);

        let install_directory = if self.cfg.dirs.use_subdirectories {
            self.galaxy_install_directory(&manifest).await
        } else {
            String::new()
        };
        let install_path =
            PathBuf::from(paths::collapse_slashes(&format!(
                "{}/{}",
                self.cfg.dirs.directory, install_directory
            )));

        let mut items = plan::depot_items_for_manifest(&self.api, &manifest, &self.cfg.dl).await?;
        items.retain(|item| {
            let full = format!("{}/{}", install_path.display(), item.path);
            !self.cfg.blacklist.is_blacklisted(&full)
        });

        // upgrade delta: files of the previously installed build that the
        // new build no longer ships are deleted up front
        let info_path = install_path.join(format!("goggame-{}.info", product_id));
        if let Some(old_build_id) = utils::read_json_file(&info_path)
            .and_then(|v| v.get("buildId").and_then(product_id_str))
        {
            if old_build_id != build_id {
                if let Some(old_build) = builds["items"].as_array().and_then(|list| {
                    list.iter().find(|b| {
                        b.get("build_id").and_then(product_id_str).as_deref()
                            == Some(old_build_id.as_str())
                    })
                }) {
                    if let Some(old_link) = old_build.get("link").and_then(Value::as_str) {
                        let old_hash = old_link.rsplit('/').next().unwrap_or_default();
                        if let Ok(old_manifest) = self.api.manifest_v2(old_hash, false).await {
                            let old_items = plan::depot_items_for_manifest(
                                &self.api,
                                &old_manifest,
                                &self.cfg.dl,
                            )
                            .await
                            .unwrap_or_default();
                            for path in plan::deleted_paths(&old_items, &items) {
                                let full = install_path.join(&path);
                                println!("Deleting {}", full.display());
                                if full.exists() && std::fs::remove_file(&full).is_err() {
                                    eprintln!("Failed to delete {}", full.display());
                                }
                            }
                        }
                    }
                }
            }
        }

        println!("{}", title);
        let engine = Engine::new(self.cfg.clone(), self.api.clone());
        let result = engine.run_depot_items(items.clone(), &install_path).await;

        if let Err(e) = worker::extract_sfc_items(&items, &install_path) {
            eprintln!("Failed to unpack small files container: {}", e);
        }

        println!("Checking for orphaned files");
        let orphans = orphan::galaxy_orphans(&items, &install_path);
        println!("\t{} orphaned files", orphans.len());
        for path in orphans {
            if self.cfg.dl.delete_orphans {
                println!("Deleting {}", path.display());
                if std::fs::remove_file(&path).is_err() {
                    eprintln!("Failed to delete {}", path.display());
                }
            } else {
                println!("\t{}", path.display());
            }
        }

        Ok(result)
    }

    /// Installer-as-repository: the base game's first installer (plus
    /// each DLC's) is parsed over range requests and its members become
    /// the work list.
    async fn galaxy_install_installer_fallback(&self, product_id: &str) -> Result<i32> {
        let mut dl = self.cfg.dl.clone();
        dl.include |= config::INCLUDE_BASE_INSTALLER;
        dl.platform = dl.galaxy_platform;
        dl.language = dl.galaxy_language;

        let json = self.api.product_info(product_id).await?;
        let owned: Vec<String> = Vec::new();
        let game = self.api.product_details_from_json(&json, &dl, &owned).await?;

        let mut installers: Vec<GameFile> = Vec::new();
        if let Some(first) = game.installers.first() {
            installers.push(first.clone());
        }
        for dlc in &game.dlcs {
            if let Some(first) = dlc.installers.first() {
                installers.push(first.clone());
            }
        }
        if installers.is_empty() {
            println!("No installers found");
            return Ok(1);
        }

        let mut members = Vec::new();
        for installer in &installers {
            println!("Getting file list for {}/{}", installer.gamename, installer.id);
            let mut list = mojo::zip_members_for_installer(&self.api, installer).await?;
            members.append(&mut list);
        }

        // install directory comes from the Windows build manifest, which
        // exists even when the Linux content system is empty
        let mut install_directory = String::new();
        if self.cfg.dirs.use_subdirectories {
            if let Ok(windows_builds) = self.api.product_builds(product_id, "windows").await {
                if let Some(link) = windows_builds["items"][0]["link"].as_str() {
                    let hash = link.rsplit('/').next().unwrap_or_default();
                    if let Ok(manifest) = self.api.manifest_v2(hash, false).await {
                        install_directory = self.galaxy_install_directory(&manifest).await;
                    }
                }
            }
        }
        let install_path = paths::collapse_slashes(&format!(
            "{}/{}/",
            self.cfg.dirs.directory, install_directory
        ));

        let split_bases = mojo::split_file_base_paths(&self.api, &members, &install_path).await;
        if !split_bases.is_empty() {
            println!("Getting info about split files");
        }

        let (files, split_map, directories) =
            mojo::prepare_members(members, &install_path, &split_bases, &self.cfg.blacklist);

        println!("{}", game.title);
        println!("Files: {}", files.len());
        let total: u64 = files.iter().map(|m| m.uncomp_size).sum();
        println!("Total size installed: {}", utils::size_string(total));

        for dir in &directories {
            if let Err(e) = std::fs::create_dir_all(dir) {
                eprintln!("Failed to create directory {}: {}", dir, e);
                return Ok(1);
            }
        }

        let engine = Engine::new(self.cfg.clone(), self.api.clone());
        Ok(engine.run_zip_members(files, split_map).await)
    }

    // Cloud save verbs.

    pub async fn cloud_show(&self, product: &str, build_index: Option<usize>) -> Result<()> {
        let product_id = self.resolve_product_id(product).await?;
        let saves = CloudSaves::new(&self.api, &self.cfg);
        let locations = saves.locations(&product_id, build_index.unwrap_or(0)).await?;
        for csf in saves.remote_files(&locations).await? {
            println!(
                "{} ({} bytes, modified {})",
                csf.path,
                csf.file_size,
                csf.last_modified.to_rfc3339()
            );
        }
        Ok(())
    }

    pub async fn cloud_show_local(&self, product: &str, build_index: Option<usize>) -> Result<()> {
        let product_id = self.resolve_product_id(product).await?;
        let saves = CloudSaves::new(&self.api, &self.cfg);
        let locations = saves.locations(&product_id, build_index.unwrap_or(0)).await?;
        for csf in saves.local_files(&locations) {
            println!(
                "{} -> {} ({} bytes)",
                csf.path,
                csf.location.display(),
                csf.file_size
            );
        }
        Ok(())
    }

    pub async fn cloud_download(&self, product: &str, build_index: Option<usize>) -> Result<i32> {
        let product_id = self.resolve_product_id(product).await?;
        let saves = CloudSaves::new(&self.api, &self.cfg);
        let locations = saves.locations(&product_id, build_index.unwrap_or(0)).await?;
        let remote = saves.remote_files(&locations).await?;
        let failures = saves.download(&remote, self.cfg.args.cloud_force).await?;
        Ok((failures > 0) as i32)
    }

    pub async fn cloud_upload(&self, product: &str, build_index: Option<usize>) -> Result<i32> {
        let product_id = self.resolve_product_id(product).await?;
        let saves = CloudSaves::new(&self.api, &self.cfg);
        let locations = saves.locations(&product_id, build_index.unwrap_or(0)).await?;
        let remote = saves.remote_files(&locations).await?;
        let local = saves.local_files(&locations);
        let failures = saves.upload(&local, &remote, self.cfg.args.cloud_force).await?;
        Ok((failures > 0) as i32)
    }

    pub async fn cloud_delete(&self, product: &str, build_index: Option<usize>) -> Result<i32> {
        let product_id = self.resolve_product_id(product).await?;
        let saves = CloudSaves::new(&self.api, &self.cfg);
        let locations = saves.locations(&product_id, build_index.unwrap_or(0)).await?;
        let remote = saves.remote_files(&locations).await?;
        let failures = saves.delete(&remote).await?;
        Ok((failures > 0) as i32)
    }

    pub async fn cloud_sync(&self, product: &str, build_index: Option<usize>) -> Result<i32> {
        let product_id = self.resolve_product_id(product).await?;
        let saves = CloudSaves::new(&self.api, &self.cfg);
        let locations = saves.locations(&product_id, build_index.unwrap_or(0)).await?;
        let remote = saves.remote_files(&locations).await?;
        let local = saves.local_files(&locations);

        // each side only moves files the other side has newer
        let mut failures = saves.download(&remote, false).await?;
        failures += saves.upload(&local, &remote, false).await?;
        Ok((failures > 0) as i32)
    }
}

fn product_id_str(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn print_game_details(game: &GameDetails) {
    println!("gamename: {}", game.gamename);
    println!("product id: {}", game.product_id);
    println!("title: {}", game.title);
    if !game.icon.is_empty() {
        println!("icon: {}", game.icon);
    }
    for gf in game.all_files() {
        println!(
            "\tid: {}\n\tname: {}\n\tpath: {}\n\tsize: {}\n\tupdated: {}",
            gf.id,
            gf.name,
            gf.path,
            gf.size,
            if gf.updated { "True" } else { "False" }
        );
        if !gf.version.is_empty() {
            println!("\tversion: {}", gf.version);
        }
        println!();
    }
}

/// Splits a PRODUCT[/BUILD] argument.
pub fn parse_product_arg(arg: &str) -> (String, Option<usize>) {
    match arg.split_once('/') {
        Some((product, build)) => (product.to_string(), build.parse().ok()),
        None => (arg.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_arg_parsing() {
        assert_eq!(parse_product_arg("12345"), ("12345".to_string(), None));
        assert_eq!(parse_product_arg("12345/2"), ("12345".to_string(), Some(2)));
        assert_eq!(
            parse_product_arg("beneath_a_steel_sky"),
            ("beneath_a_steel_sky".to_string(), None)
        );
        // a non-numeric build suffix is ignored rather than misparsed
        assert_eq!(parse_product_arg("foo/bar"), ("foo".to_string(), None));
    }
}
