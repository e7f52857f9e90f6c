// kiln-core/src/fetch.rs
// Source and bottle acquisition: http(s) through a blocking reqwest client,
// `file://` URLs and plain filesystem paths.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::StatusCode;
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};
use url::Url;

use crate::checksum::verify_checksum;

const DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const CONNECT_TIMEOUT_SECS: u64 = 30;
const USER_AGENT_STRING: &str = "kiln build orchestrator (Rust)";

// One lock per download path, shared by every worker in the process.
static DOWNLOAD_LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();

fn lock_for(path: &Path) -> Result<Arc<Mutex<()>>> {
    let mut locks = DOWNLOAD_LOCKS.get_or_init(Default::default).lock()?;
    Ok(Arc::clone(locks.entry(path.to_path_buf()).or_default()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Location {
    Remote(Url),
    Local(PathBuf),
}

fn parse_location(raw: &str) -> Result<Location> {
    match Url::parse(raw) {
        Ok(url) => match url.scheme() {
            "http" | "https" => Ok(Location::Remote(url)),
            "file" => url.to_file_path().map(Location::Local).map_err(|_| {
                KilnError::Generic(format!("Invalid file URL '{raw}'"))
            }),
            other => Err(KilnError::Generic(format!(
                "Unsupported URL scheme '{other}' in '{raw}'"
            ))),
        },
        // Not a URL at all: a plain path.
        Err(_) => Ok(Location::Local(PathBuf::from(raw))),
    }
}

/// File name a download of `url` is stored under.
pub fn download_file_name(url: &str, fallback: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|s| s.rsplit('/').next())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("{fallback}-download"))
}

/// Downloads-directory name for a source archive. Prefixed with the
/// checksum, so formulas whose urls end in the same file name never share
/// a download.
pub fn source_cache_name(formula_name: &str, url: &str, sha256_expected: &str) -> String {
    let filename = download_file_name(url, formula_name);
    match sha256_expected.get(..12) {
        Some(prefix) => format!("{}--{}", prefix.to_ascii_lowercase(), filename),
        None => format!("{formula_name}--{filename}"),
    }
}

/// Fetches a formula's source archive into the downloads directory, trying
/// mirrors in order. A previously downloaded file is reused when its
/// checksum still matches. Concurrent fetches of one archive are serialized.
pub fn fetch_source(
    formula_name: &str,
    url: &str,
    sha256_expected: &str,
    mirrors: &[String],
    config: &Config,
) -> Result<PathBuf> {
    let cache_path = config
        .downloads_dir()
        .join(source_cache_name(formula_name, url, sha256_expected));
    let lock = lock_for(&cache_path)?;
    let _guard = lock.lock()?;
    debug!(
        "Preparing to fetch source for '{}' from {} into {}",
        formula_name,
        url,
        cache_path.display()
    );

    if cache_path.is_file() {
        match verify_checksum(&cache_path, sha256_expected) {
            Ok(()) => {
                debug!("Using valid cached file: {}", cache_path.display());
                return Ok(cache_path);
            }
            Err(e) => {
                debug!(
                    "Cached file checksum mismatch ({}): {}. Redownloading.",
                    cache_path.display(),
                    e
                );
                if let Err(remove_err) = fs::remove_file(&cache_path) {
                    debug!(
                        "Failed to remove corrupted cached file {}: {}",
                        cache_path.display(),
                        remove_err
                    );
                }
            }
        }
    }

    fs::create_dir_all(config.downloads_dir())?;

    let mut last_error: Option<KilnError> = None;
    for current_url in std::iter::once(url).chain(mirrors.iter().map(String::as_str)) {
        debug!("Attempting download from: {}", current_url);
        match fetch_verified(current_url, &cache_path, sha256_expected) {
            Ok(path) => return Ok(path),
            Err(e) => {
                error!("Download attempt failed from {}: {}", current_url, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        KilnError::DownloadError(
            formula_name.to_string(),
            url.to_string(),
            "All download attempts failed.".to_string(),
        )
    }))
}

/// Copies or downloads `url` to `final_path`, verifying `sha256_expected`
/// (when non-empty) before the file appears at its final name. Each call
/// stages into its own temporary file next to `final_path`.
pub fn fetch_verified(url: &str, final_path: &Path, sha256_expected: &str) -> Result<PathBuf> {
    let parent = final_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut staged = tempfile::Builder::new()
        .prefix(&format!(".{}.", file_label(final_path)))
        .suffix(".download")
        .tempfile_in(parent)?;

    match parse_location(url)? {
        Location::Remote(remote) => download_to(&remote, &mut staged, final_path)?,
        Location::Local(source) => {
            debug!("Copying local source {}", source.display());
            File::open(&source)
                .and_then(|mut src| io::copy(&mut src, staged.as_file_mut()))
                .map_err(|e| {
                    KilnError::DownloadError(
                        file_label(final_path),
                        url.to_string(),
                        format!("cannot read {}: {}", source.display(), e),
                    )
                })?;
        }
    }
    staged.as_file_mut().flush()?;

    // A failed check drops `staged`, which deletes it.
    if sha256_expected.is_empty() {
        warn!(
            "Skipping checksum verification for {} - none provided.",
            final_path.display()
        );
    } else {
        verify_checksum(staged.path(), sha256_expected)?;
    }

    staged
        .persist(final_path)
        .map_err(|e| KilnError::from(e.error))?;
    debug!(
        "Moved verified file to final location: {}",
        final_path.display()
    );
    Ok(final_path.to_path_buf())
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn build_http_client() -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_STRING));
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    Client::builder()
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .default_headers(headers)
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .map_err(KilnError::from)
}

fn download_to(url: &Url, staged: &mut NamedTempFile, final_path: &Path) -> Result<()> {
    let client = build_http_client()?;
    let mut response = client.get(url.as_str()).send().map_err(|e| {
        debug!("HTTP request failed for {url}: {e}");
        KilnError::from(e)
    })?;
    let status = response.status();
    debug!("Received HTTP status: {} for {}", status, url);
    if !status.is_success() {
        let reason = match status {
            StatusCode::NOT_FOUND => "Resource not found (404)".to_string(),
            StatusCode::FORBIDDEN => "Access forbidden (403)".to_string(),
            other => format!("HTTP error {other}"),
        };
        return Err(KilnError::DownloadError(
            file_label(final_path),
            url.to_string(),
            reason,
        ));
    }
    let written = io::copy(&mut response, staged.as_file_mut())?;
    debug!(
        "Finished writing {} bytes to {}",
        written,
        staged.path().display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::sha256_file;

    #[test]
    fn locations_cover_urls_and_paths() {
        assert!(matches!(
            parse_location("https://example.org/a.tar.gz").unwrap(),
            Location::Remote(_)
        ));
        assert_eq!(
            parse_location("file:///tmp/a.tar.gz").unwrap(),
            Location::Local(PathBuf::from("/tmp/a.tar.gz"))
        );
        assert_eq!(
            parse_location("/srv/src/a.tar.gz").unwrap(),
            Location::Local(PathBuf::from("/srv/src/a.tar.gz"))
        );
        assert!(parse_location("ftp://example.org/a.tar.gz").is_err());
        assert_eq!(
            download_file_name("https://x.org/boost_1_62_0.tar.bz2?raw=1", "boost"),
            "boost_1_62_0.tar.bz2"
        );
    }

    #[test]
    fn local_sources_are_verified_before_publishing() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.tar.gz");
        fs::write(&source, b"archive bytes").unwrap();
        let sha = sha256_file(&source).unwrap();
        let config = Config::with_root(dir.path().join("root"));

        let url = format!("file://{}", source.display());
        let fetched = fetch_source("demo", &url, &sha, &[], &config).unwrap();
        assert_eq!(
            fetched,
            config.downloads_dir().join(format!("{}--src.tar.gz", &sha[..12]))
        );
        assert_eq!(fs::read(&fetched).unwrap(), b"archive bytes");

        let bad = dir.path().join("bad.tar.gz");
        let err = fetch_verified(source.to_str().unwrap(), &bad, &"0".repeat(64)).unwrap_err();
        assert!(matches!(err, KilnError::Integrity(_)));
        assert!(!bad.exists());
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".download"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn same_file_name_from_different_sources_stays_apart() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path().join("root"));
        let mut fetched = Vec::new();
        for (project, body) in [("alpha", &b"alpha source"[..]), ("beta", &b"beta source, longer"[..])] {
            let src_dir = dir.path().join(project);
            fs::create_dir_all(&src_dir).unwrap();
            let source = src_dir.join("v1.0.tar.gz");
            fs::write(&source, body).unwrap();
            let sha = sha256_file(&source).unwrap();
            let path = fetch_source(project, source.to_str().unwrap(), &sha, &[], &config).unwrap();
            fetched.push((path, body.to_vec()));
        }
        assert_ne!(fetched[0].0, fetched[1].0);
        for (path, body) in fetched {
            assert_eq!(fs::read(path).unwrap(), body);
        }
    }

    #[test]
    fn concurrent_fetches_of_one_archive_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("pkg-2.0.tar.gz");
        let payload: Vec<u8> = (0..=255u8).cycle().take(4 * 1024 * 1024).collect();
        fs::write(&source, &payload).unwrap();
        let sha = sha256_file(&source).unwrap();
        let config = Config::with_root(dir.path().join("root"));
        let url = source.display().to_string();

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let (config, url, sha) = (config.clone(), url.clone(), sha.clone());
                std::thread::spawn(move || fetch_source("pkg", &url, &sha, &[], &config))
            })
            .collect();
        for handle in handles {
            let path = handle.join().unwrap().unwrap();
            assert_eq!(sha256_file(&path).unwrap(), sha);
        }
        // Each writer also stages privately when bypassing the lock.
        let target = dir.path().join("direct").join("pkg-2.0.tar.gz");
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let (url, sha, target) = (url.clone(), sha.clone(), target.clone());
                std::thread::spawn(move || fetch_verified(&url, &target, &sha))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(fs::read(&target).unwrap(), payload);
    }

    #[test]
    fn mirrors_are_tried_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("pkg-1.0.tar.gz");
        fs::write(&source, b"payload").unwrap();
        let sha = sha256_file(&source).unwrap();
        let config = Config::with_root(dir.path().join("root"));
        let missing = dir.path().join("missing").join("pkg-1.0.tar.gz");

        let fetched = fetch_source(
            "pkg",
            missing.to_str().unwrap(),
            &sha,
            &[source.display().to_string()],
            &config,
        )
        .unwrap();
        assert!(fetched.is_file());
    }
}
