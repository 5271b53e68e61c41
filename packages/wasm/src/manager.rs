//! Plugin lifecycle management: install, uninstall, update
//!
//! Sources are dispatched by shape: `.zip` URLs download an archive, GitHub
//! repository URLs go through the latest-release feed, uploads are spooled
//! to a temp archive, anything else is a local manifest path. Metadata
//! persists through a [`PluginStore`]; the in-memory map is the registry of
//! live plugins.

use crate::registry::{PluginHandler, PluginInfo};
use crate::store::PluginStore;
use anyhow::{anyhow, bail, Context, Result};
use openlist_types::{PluginManifest, PluginRecord, PluginStatus};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::RwLock;

pub struct Manager {
    plugins: RwLock<HashMap<String, PluginInfo>>,
    plugin_dir: PathBuf,
    http: reqwest::Client,
    handlers: Vec<Arc<dyn PluginHandler>>,
    store: Arc<dyn PluginStore>,
}

impl Manager {
    /// Create a manager rooted at `<data_dir>/plugins`, load persisted
    /// plugins (skipping any whose wasm file went missing) and register
    /// them.
    pub async fn new(
        data_dir: impl AsRef<Path>,
        handlers: Vec<Arc<dyn PluginHandler>>,
        store: Arc<dyn PluginStore>,
    ) -> Result<Arc<Self>> {
        let plugin_dir = data_dir.as_ref().join("plugins");
        tokio::fs::create_dir_all(&plugin_dir)
            .await
            .context("failed to create plugin directory")?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let manager = Arc::new(Self {
            plugins: RwLock::new(HashMap::new()),
            plugin_dir,
            http,
            handlers,
            store,
        });
        manager.load_from_store().await?;
        manager.register_all().await;
        Ok(manager)
    }

    async fn load_from_store(&self) -> Result<()> {
        let records = self
            .store
            .load_all()
            .await
            .context("failed to load plugins from store")?;
        tracing::info!("Found {} installed plugins in the store.", records.len());

        let mut plugins = self.plugins.write().await;
        for record in records {
            if !tokio::fs::try_exists(&record.wasm_path).await.unwrap_or(false) {
                tracing::warn!(
                    "Plugin '{}' found in store but its wasm file is missing at {}. Skipping.",
                    record.id,
                    record.wasm_path.display()
                );
                continue;
            }
            let mut info = PluginInfo::new(record);
            info.handler = self.match_handler(&info.record.id);
            if info.handler.is_none() {
                tracing::warn!(
                    "No handler found for plugin type with ID '{}'. Skipping registration.",
                    info.record.id
                );
            }
            tracing::info!(
                "Loaded plugin metadata: {} (v{})",
                info.record.name,
                info.record.version
            );
            plugins.insert(info.record.id.clone(), info);
        }
        Ok(())
    }

    fn match_handler(&self, id: &str) -> Option<Arc<dyn PluginHandler>> {
        self.handlers
            .iter()
            .find(|h| id.starts_with(h.prefix()))
            .cloned()
    }

    /// Register every loaded plugin, writing the resulting status back.
    pub async fn register_all(&self) {
        let ids: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        for id in ids {
            self.register_one(&id).await;
        }
    }

    /// Run a plugin's handler registration outside the map lock and record
    /// the outcome.
    async fn register_one(&self, id: &str) {
        let Some(mut info) = self.plugins.write().await.remove(id) else {
            return;
        };
        if let Some(handler) = info.handler.clone() {
            match handler.register(&mut info).await {
                Ok(()) => {
                    info.record.status = PluginStatus::Active;
                    info.record.message.clear();
                }
                Err(e) => {
                    tracing::error!("Failed to register plugin '{id}': {e:#}");
                    info.record.status = PluginStatus::Error;
                    info.record.message = format!("{e:#}");
                }
            }
            if let Err(e) = self
                .store
                .update_status(id, info.record.status, &info.record.message)
                .await
            {
                tracing::error!("Failed to update status for plugin '{id}' in store: {e:#}");
            }
        }
        self.plugins.write().await.insert(id.to_string(), info);
    }

    /// All known plugin records, sorted by id.
    pub async fn list(&self) -> Vec<PluginRecord> {
        let plugins = self.plugins.read().await;
        let mut records: Vec<PluginRecord> =
            plugins.values().map(|info| info.record.clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub async fn get(&self, id: &str) -> Option<PluginRecord> {
        self.plugins.read().await.get(id).map(|info| info.record.clone())
    }

    /// Install from a source string, dispatching on its shape.
    pub async fn install(&self, source: &str) -> Result<PluginRecord> {
        if source.ends_with(".zip") {
            tracing::info!("Installing plugin from archive URL: {source}");
            return self.install_from_archive_url(source).await;
        }
        if source.starts_with("https://github.com/") {
            tracing::info!("Installing plugin from GitHub repository: {source}");
            return self.install_from_github(source).await;
        }
        tracing::info!("Installing plugin from local path: {source}");
        self.install_from_local(source, None).await
    }

    /// Install from a local manifest; the wasm file defaults to the manifest
    /// path with its extension swapped for `.wasm`.
    pub async fn install_from_local(
        &self,
        manifest_path: &str,
        wasm_path: Option<&str>,
    ) -> Result<PluginRecord> {
        let manifest_bytes = tokio::fs::read(manifest_path)
            .await
            .with_context(|| format!("failed to read manifest file '{manifest_path}'"))?;

        let wasm_path = match wasm_path {
            Some(path) => PathBuf::from(path),
            None => Path::new(manifest_path).with_extension("wasm"),
        };
        let wasm_bytes = tokio::fs::read(&wasm_path)
            .await
            .with_context(|| format!("failed to read wasm file at '{}'", wasm_path.display()))?;

        self.install_bytes(&manifest_bytes, &wasm_bytes, &format!("local:{manifest_path}"))
            .await
    }

    /// Install from an uploaded archive stream.
    pub async fn install_from_upload(
        &self,
        mut archive: impl AsyncRead + Unpin + Send,
        original_file_name: &str,
    ) -> Result<PluginRecord> {
        let mut bytes = Vec::new();
        archive
            .read_to_end(&mut bytes)
            .await
            .context("failed to read uploaded archive")?;

        let mut tmp = tempfile::NamedTempFile::new()
            .context("failed to create temporary file for upload")?;
        std::io::Write::write_all(&mut tmp, &bytes)
            .context("failed to save uploaded file to temporary location")?;

        let (manifest_bytes, wasm_bytes) = extract_plugin_from_zip(tmp.path())
            .context("failed to extract plugin from uploaded archive")?;
        self.install_bytes(
            &manifest_bytes,
            &wasm_bytes,
            &format!("upload:{original_file_name}"),
        )
        .await
    }

    /// Install from a zip archive URL.
    pub async fn install_from_archive_url(&self, url: &str) -> Result<PluginRecord> {
        let tmp = self
            .download_temp_zip(url)
            .await
            .with_context(|| format!("failed to download archive from {url}"))?;
        let (manifest_bytes, wasm_bytes) = extract_plugin_from_zip(tmp.path())
            .with_context(|| format!("failed to extract plugin from archive '{url}'"))?;
        self.install_bytes(&manifest_bytes, &wasm_bytes, url).await
    }

    /// Install the first `.zip` asset of the repository's latest release.
    pub async fn install_from_github(&self, repo_url: &str) -> Result<PluginRecord> {
        let (owner, repo) = parse_github_repo(repo_url)?;
        let release = self.fetch_latest_release(&owner, &repo).await?;

        let asset_url = release
            .assets
            .iter()
            .find(|asset| asset.name.ends_with(".zip"))
            .map(|asset| asset.browser_download_url.clone())
            .ok_or_else(|| {
                anyhow!("no .zip asset found in the latest release of {owner}/{repo}")
            })?;

        tracing::info!("Found release asset to download: {asset_url}");
        self.install_from_archive_url(&asset_url).await
    }

    async fn install_bytes(
        &self,
        manifest_bytes: &[u8],
        wasm_bytes: &[u8],
        source_url: &str,
    ) -> Result<PluginRecord> {
        let manifest: PluginManifest =
            serde_json::from_slice(manifest_bytes).context("failed to parse plugin manifest")?;
        manifest.validate().map_err(|e| anyhow!(e))?;

        let handler = self
            .match_handler(&manifest.id)
            .ok_or_else(|| anyhow!("unsupported plugin type for ID '{}'", manifest.id))?;

        let wasm_path = self
            .plugin_dir
            .join(plugin_file_name(&manifest.author, &manifest.id));

        {
            let mut plugins = self.plugins.write().await;
            if plugins.contains_key(&manifest.id) {
                bail!("plugin with id '{}' already exists", manifest.id);
            }

            tokio::fs::write(&wasm_path, wasm_bytes)
                .await
                .context("failed to save wasm file")?;

            let now = chrono::Utc::now();
            let record = PluginRecord {
                id: manifest.id.clone(),
                name: manifest.name.clone(),
                version: manifest.version.clone(),
                author: manifest.author.clone(),
                description: manifest.description.clone(),
                icon_url: manifest.icon_url.clone(),
                source_url: source_url.to_string(),
                wasm_path: wasm_path.clone(),
                status: PluginStatus::Inactive,
                message: String::new(),
                created_at: now,
                updated_at: now,
            };
            if let Err(e) = self.store.save(&record).await {
                let _ = tokio::fs::remove_file(&wasm_path).await;
                return Err(e).context("failed to save plugin metadata to store");
            }
            tracing::info!(
                "Plugin '{}' metadata saved with status: inactive.",
                record.id
            );

            let mut info = PluginInfo::new(record);
            info.handler = Some(handler);
            plugins.insert(manifest.id.clone(), info);
        }

        self.register_one(&manifest.id).await;

        self.get(&manifest.id)
            .await
            .ok_or_else(|| anyhow!("plugin '{}' disappeared during install", manifest.id))
    }

    /// Unregister, delete the metadata row, then clean up the wasm file and
    /// the map entry. Unregistration and file removal are best-effort; a
    /// store-delete failure aborts and keeps the plugin.
    pub async fn uninstall(&self, id: &str) -> Result<()> {
        let mut info = self
            .plugins
            .write()
            .await
            .remove(id)
            .ok_or_else(|| anyhow!("plugin with ID '{id}' not found"))?;

        if let Some(handler) = info.handler.clone() {
            if let Err(e) = handler.unregister(&mut info).await {
                tracing::warn!(
                    "Failed to unregister plugin '{id}', but continuing with uninstallation: {e:#}"
                );
            }
        }

        // Dropping the loaded module closes its runtime; outstanding handles
        // become invalid.
        info.plugin = None;

        if let Err(e) = self.store.delete(id).await {
            self.plugins.write().await.insert(id.to_string(), info);
            return Err(e).with_context(|| format!("failed to delete plugin '{id}' from store"));
        }

        match tokio::fs::remove_file(&info.record.wasm_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Failed to remove wasm file {}, but store entry was removed: {e}",
                info.record.wasm_path.display()
            ),
        }

        tracing::info!("Plugin '{id}' has been successfully uninstalled.");
        Ok(())
    }

    /// Returns the newer version if the plugin's GitHub source has one.
    pub async fn check_for_update(&self, id: &str) -> Result<Option<String>> {
        let (version, source_url) = {
            let plugins = self.plugins.read().await;
            let info = plugins
                .get(id)
                .ok_or_else(|| anyhow!("plugin with ID '{id}' not found"))?;
            (info.record.version.clone(), info.record.source_url.clone())
        };

        if !source_url.starts_with("https://github.com/") {
            bail!("only plugins installed from GitHub can be checked for updates");
        }

        let latest = self
            .latest_github_tag(&source_url)
            .await
            .with_context(|| format!("failed to check for updates for plugin '{id}'"))?;
        update_available(&version, &latest)
    }

    /// Check every GitHub-sourced plugin; failures are logged and skipped.
    pub async fn check_for_updates(&self) -> HashMap<String, String> {
        let candidates: Vec<(String, String, String)> = {
            let plugins = self.plugins.read().await;
            plugins
                .values()
                .filter(|info| info.record.source_url.starts_with("https://github.com/"))
                .map(|info| {
                    (
                        info.record.id.clone(),
                        info.record.version.clone(),
                        info.record.source_url.clone(),
                    )
                })
                .collect()
        };

        let mut updates = HashMap::new();
        for (id, version, source_url) in candidates {
            let latest = match self.latest_github_tag(&source_url).await {
                Ok(tag) => tag,
                Err(e) => {
                    tracing::warn!("Failed to check for updates for plugin '{id}': {e:#}");
                    continue;
                }
            };
            match update_available(&version, &latest) {
                Ok(Some(newer)) => {
                    tracing::info!("Update available for plugin '{id}': {version} -> {newer}");
                    updates.insert(id, newer);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Invalid version for plugin '{id}': {e:#}"),
            }
        }
        updates
    }

    /// Update = uninstall + reinstall from the recorded GitHub source.
    pub async fn update(&self, id: &str) -> Result<PluginRecord> {
        let source_url = {
            let plugins = self.plugins.read().await;
            let info = plugins
                .get(id)
                .ok_or_else(|| anyhow!("plugin with ID '{id}' not found"))?;
            info.record.source_url.clone()
        };
        if !source_url.starts_with("https://github.com/") {
            bail!("only plugins installed from GitHub can be updated automatically");
        }

        tracing::info!("Updating plugin '{id}' from {source_url}");
        self.uninstall(id).await.with_context(|| {
            format!("failed to uninstall old version of plugin '{id}' during update")
        })?;
        self.install(&source_url).await
    }

    async fn fetch_latest_release(&self, owner: &str, repo: &str) -> Result<GithubRelease> {
        let api_url = format!("https://api.github.com/repos/{owner}/{repo}/releases/latest");
        tracing::info!("Fetching latest release from GitHub API: {api_url}");

        let response = self
            .http
            .get(&api_url)
            .header("Accept", "application/vnd.github.v3+json")
            .header("User-Agent", "openlist-plugin-manager")
            .send()
            .await
            .with_context(|| format!("failed to call GitHub API at {api_url}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("GitHub API returned non-200 status: {status}, body: {body}");
        }

        response
            .json()
            .await
            .context("failed to parse GitHub API response")
    }

    async fn latest_github_tag(&self, repo_url: &str) -> Result<String> {
        let (owner, repo) = parse_github_repo(repo_url)?;
        let release = self.fetch_latest_release(&owner, &repo).await?;
        if release.tag_name.is_empty() {
            bail!("no tag_name found in the latest release");
        }
        Ok(release.tag_name)
    }

    async fn download_temp_zip(&self, url: &str) -> Result<tempfile::NamedTempFile> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            bail!("server returned status: {}", response.status());
        }
        let bytes = response.bytes().await?;

        let mut tmp = tempfile::NamedTempFile::new()?;
        std::io::Write::write_all(&mut tmp, &bytes)?;
        std::io::Write::flush(&mut tmp)?;
        Ok(tmp)
    }
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    #[serde(default)]
    tag_name: String,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
}

/// Strict semver comparison: `Some(latest)` iff `latest > current`.
fn update_available(current: &str, latest: &str) -> Result<Option<String>> {
    let latest_version = semver::Version::parse(latest)
        .with_context(|| format!("invalid latest version format '{latest}'"))?;
    let current_version = semver::Version::parse(current)
        .with_context(|| format!("invalid current version format '{current}'"))?;
    Ok((latest_version > current_version).then(|| latest_version.to_string()))
}

/// Pull `plugin.json` and the wasm binary out of a plugin archive.
/// Directories and unrelated members are ignored.
fn extract_plugin_from_zip(path: &Path) -> Result<(Vec<u8>, Vec<u8>)> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut manifest_bytes = None;
    let mut wasm_bytes = None;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let base = name.rsplit(['/', '\\']).next().unwrap_or(&name);
        if base == "plugin.json" {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            manifest_bytes = Some(bytes);
        } else if base.ends_with(".wasm") {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            wasm_bytes = Some(bytes);
        }
    }

    let manifest_bytes =
        manifest_bytes.ok_or_else(|| anyhow!("manifest 'plugin.json' not found in archive"))?;
    let wasm_bytes = wasm_bytes.ok_or_else(|| anyhow!("no .wasm file found in archive"))?;
    Ok((manifest_bytes, wasm_bytes))
}

/// Collapse every run of characters outside `[A-Za-z0-9_.-]` into one `_`;
/// empty input becomes `unknown`.
fn sanitize(s: &str) -> String {
    if s.is_empty() {
        return "unknown".to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut in_run = false;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

fn plugin_file_name(author: &str, id: &str) -> String {
    format!("{}-{}.wasm", sanitize(author), sanitize(id))
}

fn parse_github_repo(repo_url: &str) -> Result<(String, String)> {
    let trimmed = repo_url.trim_end_matches(".git");
    let rest = trimmed
        .strip_prefix("https://github.com/")
        .ok_or_else(|| anyhow!("invalid github repo URL format: {repo_url}"))?;
    let mut parts = rest.split('/').filter(|s| !s.is_empty());
    match (parts.next(), parts.next()) {
        (Some(owner), Some(repo)) => Ok((owner.to_string(), repo.to_string())),
        _ => bail!("invalid github repo URL format: {repo_url}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_boundaries() {
        assert_eq!(sanitize(""), "unknown");
        assert_eq!(sanitize("a/b:c"), "a_b_c");
        assert_eq!(sanitize("Open.List-v4_x"), "Open.List-v4_x");
        assert_eq!(sanitize("a//b"), "a_b");
    }

    #[test]
    fn plugin_file_names() {
        assert_eq!(
            plugin_file_name("a", "openlist.driver.demo"),
            "a-openlist.driver.demo.wasm"
        );
        assert_eq!(
            plugin_file_name("", "openlist.driver.demo"),
            "unknown-openlist.driver.demo.wasm"
        );
    }

    #[test]
    fn github_repo_parsing() {
        assert_eq!(
            parse_github_repo("https://github.com/o/r").unwrap(),
            ("o".to_string(), "r".to_string())
        );
        assert_eq!(
            parse_github_repo("https://github.com/o/r.git").unwrap(),
            ("o".to_string(), "r".to_string())
        );
        assert!(parse_github_repo("https://example.com/o/r").is_err());
        assert!(parse_github_repo("https://github.com/only-owner").is_err());
    }

    #[test]
    fn update_decision_is_strict() {
        assert_eq!(
            update_available("1.2.3", "1.2.4").unwrap(),
            Some("1.2.4".to_string())
        );
        assert_eq!(update_available("1.2.3", "1.2.3").unwrap(), None);
        assert_eq!(update_available("1.2.3", "1.2.2").unwrap(), None);
        assert!(update_available("1.2.3", "not-a-version").is_err());
    }

    fn write_zip(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut writer = zip::ZipWriter::new(tmp.reopen().unwrap());
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            if name.ends_with('/') {
                writer.add_directory(name.trim_end_matches('/'), options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                std::io::Write::write_all(&mut writer, data).unwrap();
            }
        }
        writer.finish().unwrap();
        tmp
    }

    #[test]
    fn zip_extraction_finds_manifest_and_wasm() {
        let tmp = write_zip(&[
            ("docs/", b""),
            ("README.md", b"ignored"),
            ("nested/plugin.json", br#"{"id":"openlist.driver.demo"}"#),
            ("nested/driver.wasm", b"\0asm"),
        ]);
        let (manifest, wasm) = extract_plugin_from_zip(tmp.path()).unwrap();
        assert_eq!(manifest, br#"{"id":"openlist.driver.demo"}"#);
        assert_eq!(wasm, b"\0asm");
    }

    #[test]
    fn zip_extraction_requires_both_members() {
        let tmp = write_zip(&[("plugin.json", br#"{}"#)]);
        let err = extract_plugin_from_zip(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("no .wasm file"));

        let tmp = write_zip(&[("driver.wasm", b"\0asm")]);
        let err = extract_plugin_from_zip(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("plugin.json"));
    }
}
