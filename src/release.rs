//! Release metadata lookup
//!
//! Finds the highest stable semantic version published for a repository.
//! Results are cached on disk per repository with a TTL so repeated runs do
//! not hit the GitHub API every time.

use crate::error::{InstallerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

const GITHUB_API: &str = "https://api.github.com";
const PER_PAGE: u32 = 100;
const HTTP_TIMEOUT: Duration = Duration::from_secs(12);

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\.(\d+)\.(\d+)").expect("version pattern is valid"));

/// Numeric major.minor.patch triple. Ordering compares major, then minor,
/// then patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Semver {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Semver {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// First `X.Y.Z` found anywhere in `s` (release tags and names).
    pub fn find(s: &str) -> Option<Self> {
        let caps = VERSION_RE.captures(s)?;
        Some(Self::new(
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
        ))
    }

    /// Strict `X.Y.Z` prefix, tolerating a leading `v` and a suffix glued to
    /// the patch number (`8.3.0RC1`, `1.2.3-rc1`).
    pub fn parse_prefix(s: &str) -> Option<Self> {
        let s = s.trim();
        let s = s
            .strip_prefix('v')
            .or_else(|| s.strip_prefix('V'))
            .unwrap_or(s);
        let mut parts = s.splitn(4, '.');
        let major = parts.next()?.trim().parse().ok()?;
        let minor = parts.next()?.trim().parse().ok()?;
        let patch_raw = parts.next()?;
        let digits: String = patch_raw
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        let patch = digits.parse().ok()?;
        Some(Self::new(major, minor, patch))
    }
}

impl fmt::Display for Semver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Where a [`ReleaseInfo`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOrigin {
    GithubApi,
    Cache,
}

/// The highest stable release found for a repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub repo: String,
    pub highest_version: String,
    pub tag: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub is_prerelease: bool,
    #[serde(default)]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: Option<ReleaseOrigin>,
}

impl ReleaseInfo {
    /// Tag for display, synthesized from the version when missing.
    pub fn display_tag(&self) -> String {
        let tag = self.tag.trim();
        if tag.is_empty() && !self.highest_version.is_empty() {
            format!("v{}", self.highest_version)
        } else {
            tag.to_string()
        }
    }
}

/// One release entry as returned by the GitHub REST API
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GithubRelease {
    #[serde(default)]
    pub tag_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
}

/// Pick the highest semantic version among `releases`.
///
/// Drafts are skipped, as are prereleases unless `include_prerelease` is set.
/// The tag is preferred over the release name when both carry a version.
pub fn select_highest(
    repo: &str,
    releases: &[GithubRelease],
    include_prerelease: bool,
) -> Result<ReleaseInfo> {
    let best = releases
        .iter()
        .filter(|r| !r.draft && (include_prerelease || !r.prerelease))
        .filter_map(|r| {
            let version = Semver::find(r.tag_name.trim())
                .or_else(|| r.name.as_deref().and_then(|n| Semver::find(n.trim())))?;
            Some((version, r))
        })
        .fold(None::<(Semver, &GithubRelease)>, |best, candidate| match best {
            Some(current) if candidate.0 <= current.0 => Some(current),
            _ => Some(candidate),
        });

    let (version, release) =
        best.ok_or_else(|| InstallerError::probe("no stable releases with semver tags found"))?;

    Ok(ReleaseInfo {
        repo: repo.to_string(),
        highest_version: version.to_string(),
        tag: release.tag_name.clone(),
        name: release.name.clone().unwrap_or_default(),
        url: release.html_url.clone(),
        is_prerelease: release.prerelease,
        fetched_at: None,
        source: None,
    })
}

/// Paged catalog of published releases
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Fetch one page of releases (1-based). An empty page means no more data.
    async fn fetch_page(&self, owner: &str, repo: &str, page: u32) -> Result<Vec<GithubRelease>>;

    /// Fetch the release GitHub marks as latest.
    async fn fetch_latest(&self, owner: &str, repo: &str) -> Result<GithubRelease>;
}

/// GitHub REST client for release metadata
pub struct GithubClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl GithubClient {
    pub fn new(token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("evo-installer/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: GITHUB_API.to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let mut request = self
            .http
            .get(url)
            .query(query)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(InstallerError::probe(format!("github releases: {status}")));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ReleaseSource for GithubClient {
    async fn fetch_page(&self, owner: &str, repo: &str, page: u32) -> Result<Vec<GithubRelease>> {
        let url = format!("{}/repos/{owner}/{repo}/releases", self.base_url);
        tracing::debug!(%url, page, "fetching releases page");
        self.get_json(
            &url,
            &[
                ("per_page", PER_PAGE.to_string()),
                ("page", page.max(1).to_string()),
            ],
        )
        .await
    }

    async fn fetch_latest(&self, owner: &str, repo: &str) -> Result<GithubRelease> {
        let url = format!("{}/repos/{owner}/{repo}/releases/latest", self.base_url);
        tracing::debug!(%url, "fetching latest release");
        self.get_json(&url, &[]).await
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    release: ReleaseInfo,
}

/// On-disk cache of detected releases, one JSON file per repository.
#[derive(Debug, Clone)]
pub struct VersionCache {
    dir: PathBuf,
}

impl VersionCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<user cache dir>/evo-installer`
    pub fn user_default() -> Option<Self> {
        let base = dirs::cache_dir().or_else(|| dirs::home_dir().map(|h| h.join(".cache")))?;
        Some(Self::new(base.join("evo-installer")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, repo: &str) -> PathBuf {
        self.dir.join(format!("release-{}.json", safe_repo_name(repo)))
    }

    /// Cached release for `repo`, if present, matching and younger than `ttl`.
    pub fn read(&self, repo: &str, ttl: Duration) -> Option<ReleaseInfo> {
        let path = self.path_for(repo);
        let raw = std::fs::read(&path).ok()?;
        let file: CacheFile = serde_json::from_slice(&raw).ok()?;
        let release = file.release;
        if release.repo != repo {
            return None;
        }
        let fetched_at = release.fetched_at?;
        let ttl = chrono::Duration::from_std(ttl).ok()?;
        if Utc::now().signed_duration_since(fetched_at) > ttl {
            tracing::debug!(path = %path.display(), "release cache expired");
            return None;
        }
        Some(release)
    }

    pub fn write(&self, release: &ReleaseInfo) -> Result<()> {
        let path = self.path_for(&release.repo);
        std::fs::create_dir_all(&self.dir)?;
        let body = serde_json::to_vec_pretty(&CacheFile {
            release: release.clone(),
        })?;
        std::fs::write(&path, body)?;
        tracing::debug!(path = %path.display(), "release cache written");
        Ok(())
    }
}

/// Filesystem-safe transliteration of `owner/repo`
fn safe_repo_name(repo: &str) -> String {
    let replaced: String = repo
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ' ' | ':' => '_',
            other => other,
        })
        .collect();
    let trimmed = replaced.trim_matches('_');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Options for [`detect_highest_stable`]
#[derive(Debug, Clone)]
pub struct DetectOptions {
    pub max_pages: u32,
    pub ttl: Duration,
    pub include_prerelease: bool,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            max_pages: 3,
            ttl: Duration::from_secs(60 * 60),
            include_prerelease: false,
        }
    }
}

/// Detect the highest stable release of `owner/repo`.
///
/// A fresh cache entry short-circuits the lookup. Otherwise up to
/// `max_pages` pages are fetched, stopping early on an empty page, and
/// `on_page` is awaited after every non-empty page.
pub async fn detect_highest_stable<F, Fut>(
    source: &dyn ReleaseSource,
    cache: Option<&VersionCache>,
    owner: &str,
    repo: &str,
    options: &DetectOptions,
    mut on_page: F,
) -> Result<ReleaseInfo>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ()>,
{
    let full_repo = format!("{owner}/{repo}");

    if let Some(mut cached) = cache.and_then(|c| c.read(&full_repo, options.ttl)) {
        cached.source = Some(ReleaseOrigin::Cache);
        return Ok(cached);
    }

    let mut all = Vec::new();
    for page in 1..=options.max_pages.max(1) {
        let items = source.fetch_page(owner, repo, page).await?;
        if items.is_empty() {
            break;
        }
        all.extend(items);
        on_page(page).await;
    }
    if all.is_empty() {
        return Err(InstallerError::probe("no releases returned"));
    }

    let mut info = select_highest(&full_repo, &all, options.include_prerelease)?;
    info.fetched_at = Some(Utc::now());
    info.source = Some(ReleaseOrigin::GithubApi);

    if let Some(cache) = cache {
        if let Err(e) = cache.write(&info) {
            tracing::warn!(error = %e, "unable to write release cache");
        }
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn release(tag: &str, draft: bool, prerelease: bool) -> GithubRelease {
        GithubRelease {
            tag_name: tag.to_string(),
            name: None,
            html_url: format!("https://example.test/{tag}"),
            draft,
            prerelease,
        }
    }

    #[test]
    fn test_semver_parse_prefix() {
        assert_eq!(Semver::parse_prefix("v1.2.3"), Some(Semver::new(1, 2, 3)));
        assert_eq!(Semver::parse_prefix("1.2.3-rc1"), Some(Semver::new(1, 2, 3)));
        assert_eq!(Semver::parse_prefix("8.3.0RC1"), Some(Semver::new(8, 3, 0)));
        assert_eq!(Semver::parse_prefix("dev"), None);
        assert_eq!(Semver::parse_prefix("8.3"), None);
    }

    #[test]
    fn test_semver_ordering() {
        assert!(Semver::new(1, 2, 4) > Semver::new(1, 2, 3));
        assert!(Semver::new(2, 0, 0) > Semver::new(1, 99, 99));
        assert_eq!(Semver::new(1, 2, 3).cmp(&Semver::new(1, 2, 3)), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_select_highest_skips_drafts_and_prereleases() {
        let releases = vec![
            release("3.3.0", false, false),
            release("3.10.1", false, false),
            release("4.0.0", true, false),
            release("3.11.0-beta", false, true),
            release("nightly", false, false),
        ];
        let info = select_highest("evolution-cms/evolution", &releases, false).unwrap();
        assert_eq!(info.highest_version, "3.10.1");
        assert_eq!(info.tag, "3.10.1");

        let info = select_highest("evolution-cms/evolution", &releases, true).unwrap();
        assert_eq!(info.highest_version, "3.11.0");
        assert!(info.is_prerelease);
    }

    #[test]
    fn test_select_highest_falls_back_to_name() {
        let mut r = release("latest", false, false);
        r.name = Some("Evolution CMS 3.2.1".to_string());
        let info = select_highest("o/r", &[r], false).unwrap();
        assert_eq!(info.highest_version, "3.2.1");
        assert_eq!(info.display_tag(), "latest");
    }

    #[test]
    fn test_select_highest_without_candidates() {
        let err = select_highest("o/r", &[release("nightly", false, false)], false).unwrap_err();
        assert!(err.to_string().contains("no stable releases"));
    }

    #[test]
    fn test_cache_path_includes_repo_name() {
        let cache = VersionCache::new("/tmp/evo");
        let path = cache.path_for("evolution-cms/evolution");
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(name, "release-evolution-cms_evolution.json");
        assert_eq!(safe_repo_name(" /:"), "unknown");
    }

    #[test]
    fn test_cache_roundtrip_and_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let cache = VersionCache::new(dir.path());
        let info = ReleaseInfo {
            repo: "o/r".to_string(),
            highest_version: "1.0.0".to_string(),
            tag: "v1.0.0".to_string(),
            name: String::new(),
            url: String::new(),
            is_prerelease: false,
            fetched_at: Some(Utc::now() - chrono::Duration::minutes(30)),
            source: Some(ReleaseOrigin::GithubApi),
        };
        cache.write(&info).unwrap();

        assert_eq!(cache.read("o/r", Duration::from_secs(3600)), Some(info.clone()));
        assert_eq!(cache.read("o/r", Duration::from_secs(60)), None);
        assert_eq!(cache.read("other/r", Duration::from_secs(3600)), None);
    }

    #[test]
    fn test_cache_without_timestamp_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let cache = VersionCache::new(dir.path());
        std::fs::write(
            cache.path_for("o/r"),
            r#"{"release":{"repo":"o/r","highest_version":"1.0.0","tag":"v1.0.0"}}"#,
        )
        .unwrap();
        assert_eq!(cache.read("o/r", Duration::from_secs(3600)), None);
    }

    struct PagedSource {
        pages: Vec<Vec<GithubRelease>>,
        calls: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl ReleaseSource for PagedSource {
        async fn fetch_page(&self, _: &str, _: &str, page: u32) -> Result<Vec<GithubRelease>> {
            self.calls.lock().unwrap().push(page);
            Ok(self
                .pages
                .get(page as usize - 1)
                .cloned()
                .unwrap_or_default())
        }

        async fn fetch_latest(&self, _: &str, _: &str) -> Result<GithubRelease> {
            Err(InstallerError::probe("not supported"))
        }
    }

    #[tokio::test]
    async fn test_detect_stops_on_empty_page_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let cache = VersionCache::new(dir.path());
        let source = PagedSource {
            pages: vec![vec![release("1.0.0", false, false)], vec![]],
            calls: Mutex::new(Vec::new()),
        };
        let mut seen = Vec::new();
        let info = detect_highest_stable(
            &source,
            Some(&cache),
            "o",
            "r",
            &DetectOptions::default(),
            |page| {
                seen.push(page);
                async {}
            },
        )
        .await
        .unwrap();

        assert_eq!(info.source, Some(ReleaseOrigin::GithubApi));
        assert_eq!(*source.calls.lock().unwrap(), vec![1, 2]);
        assert_eq!(seen, vec![1]);

        let again = detect_highest_stable(
            &source,
            Some(&cache),
            "o",
            "r",
            &DetectOptions::default(),
            |_| async {},
        )
        .await
        .unwrap();
        assert_eq!(again.source, Some(ReleaseOrigin::Cache));
        assert_eq!(again.highest_version, "1.0.0");
    }

    #[tokio::test]
    async fn test_detect_without_releases_fails() {
        let source = PagedSource {
            pages: vec![],
            calls: Mutex::new(Vec::new()),
        };
        let err = detect_highest_stable(&source, None, "o", "r", &DetectOptions::default(), |_| async {})
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no releases returned"));
    }
}
