//! Cloud-save storage operations.
//!
//! Saves live in an object store at
//! `cloudstorage.gog.com/v1/{user_id}/{client_id}/{path}`. The client id
//! and secret come from the product's build manifest; the stored refresh
//! token is re-exchanged against that client pair (without opening a new
//! session) before any storage call. Save locations are declared in the
//! Galaxy client component document as `<?VARIABLE?>relative/path`
//! entries resolved against the install path and the Windows profile
//! inside the configured wine prefix. Only Windows builds publish cloud
//! storage metadata.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use walkdir::WalkDir;

use crate::api::GalaxyApi;
use crate::config::{self, Config};
use crate::models::CloudSaveFile;
use crate::utils;

const CLOUD_STORAGE: &str = "https://cloudstorage.gog.com/v1";

/// HTTP statuses the upload path treats as terminal (no retry). 429
/// stays retryable.
pub fn upload_status_is_terminal(status: u16) -> bool {
    matches!(status, 400 | 416 | 422)
}

fn username() -> String {
    std::env::var("USER").unwrap_or_else(|_| "user".to_string())
}

/// Resolves one location template: `<?NAME?>rest` takes the variable's
/// value as prefix; anything else passes through. Backslashes normalize
/// to forward slashes.
pub fn parse_location(location: &str, vars: &HashMap<String, String>) -> String {
    let parsed = match location.strip_prefix("<?").and_then(|rest| rest.split_once("?>")) {
        Some((name, relative)) => match vars.get(name) {
            Some(value) => format!("{}{}", value, relative),
            None => location.to_string(),
        },
        None => location.to_string(),
    };
    parsed.replace('\\', "/")
}

pub struct CloudSaves<'a> {
    api: &'a GalaxyApi,
    cfg: &'a Config,
}

impl<'a> CloudSaves<'a> {
    pub fn new(api: &'a GalaxyApi, cfg: &'a Config) -> CloudSaves<'a> {
        CloudSaves { api, cfg }
    }

    fn storage_root(&self) -> String {
        format!(
            "{}/{}/{}",
            CLOUD_STORAGE,
            self.api.token().user_id(),
            self.api.token().client_id()
        )
    }

    /// Name → local directory map for a product's save locations, after
    /// switching the session to the product's Galaxy client.
    pub async fn locations(
        &self,
        product_id: &str,
        build_index: usize,
    ) -> Result<HashMap<String, String>> {
        if self.cfg.dl.galaxy_platform & config::PLATFORM_WINDOWS == 0 {
            return Err(anyhow!("cloud saves are only published for Windows builds"));
        }

        let builds = self.api.product_builds(product_id, "windows").await?;
        let item = &builds["items"][build_index];
        if item.get("generation").and_then(Value::as_i64) != Some(2) {
            return Err(anyhow!("only generation 2 builds are supported"));
        }
        let link = item
            .get("link")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("build without manifest link"))?;
        let build_hash = link.rsplit('/').next().unwrap_or_default();
        let manifest = self.api.manifest_v2(build_hash, false).await?;

        let client_id = manifest
            .get("clientId")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("build manifest without clientId"))?
            .to_string();
        let client_secret = manifest
            .get("clientSecret")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        self.api
            .token()
            .refresh_with(self.api.http().inner(), &client_id, &client_secret, false)
            .await?;

        let install_path = format!(
            "{}/{}",
            self.cfg.dirs.directory,
            manifest
                .get("installDirectory")
                .and_then(Value::as_str)
                .unwrap_or_default()
        );
        let user = username();
        let prefix = &self.cfg.dirs.wine_prefix;
        let vars: HashMap<String, String> = [
            ("INSTALL", install_path),
            ("DOCUMENTS", format!("{}drive_c/users/{}/Documents/", prefix, user)),
            ("APPLICATION_DATA_ROAMING", format!("{}drive_c/users/{}/AppData/Roaming/", prefix, user)),
            ("APPLICATION_DATA_LOCAL", format!("{}drive_c/users/{}/AppData/Local/", prefix, user)),
            ("APPLICATION_DATA_LOCAL_LOW", format!("{}drive_c/users/{}/AppData/LocalLow/", prefix, user)),
            ("SAVED_GAMES", format!("{}drive_c/users/{}/Save Games/", prefix, user)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let component = self.api.cloud_config(&client_id).await?;
        let storage = &component["content"]["Windows"]["cloudStorage"];
        if !storage.get("enabled").and_then(Value::as_bool).unwrap_or(false) {
            return Err(anyhow!("cloud storage is not enabled for this product"));
        }

        let mut map = HashMap::new();
        if let Some(locations) = storage.get("locations").and_then(Value::as_array) {
            for entry in locations {
                let name = entry.get("name").and_then(Value::as_str).unwrap_or_default();
                let location = entry
                    .get("location")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                map.insert(name.to_string(), parse_location(location, &vars));
            }
        }
        if map.is_empty() {
            map.insert(
                "__default".to_string(),
                format!(
                    "{}/GOG.com/Galaxy/Applications/{}/Storage",
                    vars["APPLICATION_DATA_LOCAL"], client_id
                ),
            );
        }
        Ok(map)
    }

    /// Remote file list, with each object's local destination resolved
    /// through the location map.
    pub async fn remote_files(
        &self,
        locations: &HashMap<String, String>,
    ) -> Result<Vec<CloudSaveFile>> {
        let listing = self.api.get_json(&self.storage_root()).await?;
        let mut files = Vec::new();
        if let Some(entries) = listing.as_array() {
            for entry in entries {
                let path = entry.get("name").and_then(Value::as_str).unwrap_or_default();
                if path.is_empty() {
                    continue;
                }
                let (prefix, rest) = path.split_once('/').unwrap_or((path, ""));
                let Some(base) = locations.get(prefix) else {
                    continue;
                };
                let last_modified = entry
                    .get("last_modified")
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
                files.push(CloudSaveFile {
                    path: path.to_string(),
                    location: PathBuf::from(format!("{}/{}", base, rest)),
                    file_size: entry.get("bytes").and_then(Value::as_u64).unwrap_or(0),
                    last_modified,
                });
            }
        }
        Ok(files)
    }

    /// Local files under the known locations, with their remote paths.
    pub fn local_files(&self, locations: &HashMap<String, String>) -> Vec<CloudSaveFile> {
        let mut files = Vec::new();
        for (name, base) in locations {
            let base_path = Path::new(base);
            if !base_path.exists() {
                continue;
            }
            for entry in WalkDir::new(base_path).follow_links(false) {
                let Ok(entry) = entry else { continue };
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(base_path)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                let meta = entry.metadata().ok();
                let last_modified = meta
                    .as_ref()
                    .and_then(|m| m.modified().ok())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
                files.push(CloudSaveFile {
                    path: format!("{}/{}", name, relative),
                    location: entry.path().to_path_buf(),
                    file_size: meta.map(|m| m.len()).unwrap_or(0),
                    last_modified,
                });
            }
        }
        files
    }

    pub async fn download(&self, files: &[CloudSaveFile], force: bool) -> Result<u32> {
        let bearer = self.api.token().access_token()?;
        let mut failures = 0u32;

        for csf in files {
            if !force {
                // keep a newer local copy
                if let Ok(meta) = std::fs::metadata(&csf.location) {
                    if let Ok(modified) = meta.modified() {
                        if DateTime::<Utc>::from(modified) >= csf.last_modified {
                            println!("Skipping {}: local copy is newer", csf.path);
                            continue;
                        }
                    }
                }
            }

            let incomplete = PathBuf::from(format!(
                "{}{}",
                csf.location.display(),
                crate::engine::mojo::INCOMPLETE_SUFFIX
            ));
            if let Some(parent) = incomplete.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let resume_from = std::fs::metadata(&incomplete).map(|m| m.len()).unwrap_or(0);

            let url = format!("{}/{}", self.storage_root(), csf.path);
            println!("Begin download: {}", csf.path);
            let result = self
                .api
                .http()
                .download_to_file(&url, Some(&bearer), &incomplete, resume_from, |_| {}, |attempt, err| {
                    println!("Retry {}/{}: {} ({})", attempt, self.cfg.retries, csf.path, err);
                })
                .await;

            match result {
                Ok(_) => {
                    std::fs::rename(&incomplete, &csf.location)?;
                    let _ = utils::set_file_mtime(&csf.location, csf.last_modified.timestamp());
                }
                Err(e) => {
                    eprintln!("Failed to download {}: {}", csf.path, e);
                    failures += 1;
                }
            }
        }
        Ok(failures)
    }

    pub async fn upload(&self, files: &[CloudSaveFile], remote: &[CloudSaveFile], force: bool) -> Result<u32> {
        let bearer = self.api.token().access_token()?;
        let mut failures = 0u32;

        for csf in files {
            if !force {
                // keep a newer remote copy
                if let Some(existing) = remote.iter().find(|r| r.path == csf.path) {
                    if existing.last_modified >= csf.last_modified {
                        println!("Skipping {}: remote copy is newer", csf.path);
                        continue;
                    }
                }
            }

            let contents = std::fs::read(&csf.location)?;
            let md5 = utils::chunk_md5(&contents);
            let url = format!("{}/{}", self.storage_root(), csf.path);
            println!("Begin upload: {}", csf.path);

            let mut attempt = 0u32;
            loop {
                let response = self
                    .api
                    .http()
                    .inner()
                    .put(&url)
                    .bearer_auth(&bearer)
                    .header("Etag", &md5)
                    .header(
                        "X-Object-Meta-LocalLastModified",
                        csf.last_modified.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    )
                    .header(reqwest::header::CONTENT_TYPE, "Octet-Stream")
                    .body(contents.clone())
                    .send()
                    .await;

                match response {
                    Ok(resp) if resp.status().is_success() => break,
                    Ok(resp) => {
                        let status = resp.status().as_u16();
                        if upload_status_is_terminal(status) {
                            eprintln!("Upload rejected ({}): {}", status, csf.path);
                            failures += 1;
                            break;
                        }
                        if attempt >= self.cfg.retries {
                            eprintln!("Upload failed ({}): {}", status, csf.path);
                            failures += 1;
                            break;
                        }
                    }
                    Err(e) => {
                        if attempt >= self.cfg.retries {
                            eprintln!("Upload failed: {} ({})", csf.path, e);
                            failures += 1;
                            break;
                        }
                    }
                }
                attempt += 1;
                println!("Retry {}/{}: {}", attempt, self.cfg.retries, csf.path);
            }
        }
        Ok(failures)
    }

    pub async fn delete(&self, files: &[CloudSaveFile]) -> Result<u32> {
        let bearer = self.api.token().access_token()?;
        let mut failures = 0u32;
        for csf in files {
            let url = format!("{}/{}", self.storage_root(), csf.path);
            let result = self
                .api
                .http()
                .inner()
                .delete(&url)
                .bearer_auth(&bearer)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    println!("Deleted {}", csf.path);
                }
                Ok(resp) => {
                    eprintln!("Failed to delete {} ({})", csf.path, resp.status());
                    failures += 1;
                }
                Err(e) => {
                    eprintln!("Failed to delete {}: {}", csf.path, e);
                    failures += 1;
                }
            }
        }
        Ok(failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> HashMap<String, String> {
        [
            ("INSTALL", "/games/foo"),
            ("DOCUMENTS", "/prefix/drive_c/users/u/Documents/"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn location_variables_expand() {
        assert_eq!(
            parse_location("<?INSTALL?>/saves", &vars()),
            "/games/foo/saves"
        );
        assert_eq!(
            parse_location("<?DOCUMENTS?>My Games\\Foo", &vars()),
            "/prefix/drive_c/users/u/Documents/My Games/Foo"
        );
    }

    #[test]
    fn unknown_variable_passes_through() {
        assert_eq!(parse_location("<?REGISTRY?>x", &vars()), "<?REGISTRY?>x");
        assert_eq!(parse_location("plain/path", &vars()), "plain/path");
    }

    #[test]
    fn terminal_upload_statuses() {
        assert!(upload_status_is_terminal(400));
        assert!(upload_status_is_terminal(416));
        assert!(upload_status_is_terminal(422));
        assert!(!upload_status_is_terminal(429));
        assert!(!upload_status_is_terminal(500));
    }
}
