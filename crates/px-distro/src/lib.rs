//! Linux distributions installable over PXE: a catalog of netboot archive
//! URLs, a download cache, and extraction into a session-scoped directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use futures_util::StreamExt;
use px_common::{Error, Result};
use serde::Deserialize;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// A Linux distribution that can be installed with PXE.
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
    /// A user friendly name (but not too much, spaces are annoying on the
    /// command line).
    pub name: String,
    /// Where the netboot tar.gz archive for this distribution lives.
    pub url: String,
}

impl Distribution {
    /// The archive filename as guessed from the URL.
    pub fn filename(&self) -> String {
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|url| {
                url.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "netboot.tar.gz".to_string())
    }

    /// A stable digest of the URL, used as the cache subdirectory so that
    /// distributions sharing an archive filename never collide.
    pub fn cache_key(&self) -> String {
        let digest = ring::digest::digest(&ring::digest::SHA256, self.url.as_bytes());
        hex::encode(digest.as_ref())
    }

    /// Unpacks the netboot archive into a temporary directory, removed when
    /// the returned handle is dropped. The archive itself is downloaded into
    /// `cache_dir` once and reused afterwards.
    pub async fn unpack(&self, cache_dir: &Path) -> Result<TempDir> {
        let archive = self.fetch(cache_dir).await?;
        let dest = tempfile::Builder::new().prefix("pxeup-netboot-").tempdir()?;
        info!(
            "extracting {} to {}",
            self.name,
            dest.path().display()
        );

        let file = tokio::fs::File::open(&archive).await?;
        let decoder =
            async_compression::tokio::bufread::GzipDecoder::new(tokio::io::BufReader::new(file));
        let mut tar = tokio_tar::Archive::new(decoder);
        tar.unpack(dest.path())
            .await
            .map_err(|e| Error::Config(format!("{}: unusable archive: {e}", self.name)))?;
        Ok(dest)
    }

    /// Downloads the archive unless a cached copy exists; returns its path.
    async fn fetch(&self, cache_dir: &Path) -> Result<PathBuf> {
        let cached = cache_dir.join(self.cache_key()).join(self.filename());
        if cached.exists() {
            debug!("using cached archive {}", cached.display());
            return Ok(cached);
        }
        if let Some(parent) = cached.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("downloading {}", self.url);
        let response = reqwest::get(&self.url)
            .await
            .map_err(|e| Error::Lookup(format!("{}: {e}", self.url)))?;
        if !response.status().is_success() {
            return Err(Error::Lookup(format!(
                "{}: HTTP {}",
                self.url,
                response.status()
            )));
        }
        let total = response.content_length();

        // Download to a partial file first so an aborted transfer never
        // poisons the cache.
        let partial = cached.with_extension("part");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut last_report = Instant::now();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Lookup(format!("{}: {e}", self.url)))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if last_report.elapsed() > std::time::Duration::from_secs(5) {
                let pct = total.map(|t| (downloaded * 100) / t).unwrap_or(0);
                info!(downloaded, percent = pct, "download progress");
                last_report = Instant::now();
            }
        }
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&partial, &cached).await?;

        info!("downloaded {} ({downloaded} bytes)", self.filename());
        Ok(cached)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    url: String,
}

/// The set of known distributions, read from a JSON config file keyed by
/// distribution name.
#[derive(Debug)]
pub struct Catalog {
    distributions: BTreeMap<String, Distribution>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self> {
        let entries: BTreeMap<String, CatalogEntry> = serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        if entries.is_empty() {
            return Err(Error::Config(format!(
                "no distributions in {}",
                path.display()
            )));
        }
        let distributions = entries
            .into_iter()
            .map(|(name, entry)| {
                let distribution = Distribution {
                    name: name.clone(),
                    url: entry.url,
                };
                debug!("parsed distribution {distribution:?}");
                (name, distribution)
            })
            .collect();
        Ok(Self { distributions })
    }

    pub fn get(&self, name: &str) -> Option<&Distribution> {
        self.distributions.get(name)
    }

    /// Distribution names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.distributions.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debian() -> Distribution {
        Distribution {
            name: "debian-12".into(),
            url: "https://deb.debian.org/debian/dists/bookworm/main/installer-amd64/current/images/netboot/netboot.tar.gz".into(),
        }
    }

    #[test]
    fn test_filename_is_the_last_url_segment() {
        assert_eq!(debian().filename(), "netboot.tar.gz");
    }

    #[test]
    fn test_filename_ignores_query_strings() {
        let distro = Distribution {
            name: "x".into(),
            url: "https://example.com/images/boot.tar.gz?mirror=3".into(),
        };
        assert_eq!(distro.filename(), "boot.tar.gz");
    }

    #[test]
    fn test_filename_falls_back_for_bare_hosts() {
        let distro = Distribution {
            name: "x".into(),
            url: "https://example.com/".into(),
        };
        assert_eq!(distro.filename(), "netboot.tar.gz");
    }

    #[test]
    fn test_cache_key_is_stable_per_url() {
        let a = debian();
        assert_eq!(a.cache_key(), a.cache_key());
        assert_eq!(a.cache_key().len(), 64);

        let b = Distribution {
            name: a.name.clone(),
            url: "https://example.com/netboot.tar.gz".into(),
        };
        assert_ne!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_catalog_parse() {
        let json = r#"{
            "debian-12": {"url": "https://example.com/d12/netboot.tar.gz"},
            "ubuntu-24.04": {"url": "https://example.com/u24/netboot.tar.gz"}
        }"#;
        let catalog = Catalog::parse(json, Path::new("distros.json")).unwrap();
        assert_eq!(
            catalog.names().collect::<Vec<_>>(),
            vec!["debian-12", "ubuntu-24.04"]
        );
        assert!(catalog.get("debian-12").is_some());
        assert!(catalog.get("arch").is_none());
    }

    #[test]
    fn test_empty_catalog_is_an_error() {
        let err = Catalog::parse("{}", Path::new("distros.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
