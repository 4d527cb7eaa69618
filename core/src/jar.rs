//! Cookie jar contract and an in-memory implementation.
//!
//! # Design
//! The bridge never owns cookie state; it reads and writes the desktop
//! shell's jar through `CookieJar`. Consistency across concurrent requests is
//! the jar's business: the bridge issues independent `get`/`set`/`remove`
//! calls and accepts last-writer-wins if the jar offers nothing stronger.
//!
//! `MemoryCookieJar` follows RFC 6265 matching (§5.1.3 domain-match, §5.1.4
//! path-match, `Secure` only over https) so the bridge can run without a
//! shell and tests can observe what the bridge persisted.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use url::{Host, Url};

use crate::cookie::CookieRecord;
use crate::error::JarError;

/// Which cookies to return from `CookieJar::get`.
///
/// `url` selects the cookies a browser would send to it; the optional fields
/// narrow the result further.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieQuery {
    pub url: Url,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: Option<bool>,
}

impl CookieQuery {
    pub fn for_url(url: Url) -> Self {
        Self {
            url,
            domain: None,
            path: None,
            secure: None,
        }
    }
}

/// The desktop shell's persistent cookie store.
#[async_trait]
pub trait CookieJar: Send + Sync {
    async fn get(&self, query: &CookieQuery) -> Result<Vec<CookieRecord>, JarError>;

    /// Store `record` as if it had been set by a response from `url`.
    async fn set(&self, url: &Url, record: CookieRecord) -> Result<(), JarError>;

    /// Remove the cookie called `name` that `url` would see.
    async fn remove(&self, url: &Url, name: &str) -> Result<(), JarError>;
}

#[derive(Debug, Clone)]
struct StoredCookie {
    /// Domain and path are always resolved.
    record: CookieRecord,
    host_only: bool,
}

impl StoredCookie {
    fn domain(&self) -> &str {
        self.record.domain.as_deref().unwrap_or_default()
    }

    fn path(&self) -> &str {
        self.record.path.as_deref().unwrap_or("/")
    }

    fn matches_url(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let host_matches = if self.host_only {
            host == self.domain()
        } else {
            domain_matches(url, &host, self.domain())
        };
        host_matches && path_matches(url.path(), self.path())
    }
}

/// Cookie jar kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryCookieJar {
    cookies: RwLock<Vec<StoredCookie>>,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every live cookie, in insertion order.
    pub fn snapshot(&self) -> Vec<CookieRecord> {
        let now = Utc::now();
        self.cookies
            .read()
            .iter()
            .filter(|stored| !stored.record.is_expired(now))
            .map(|stored| stored.record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CookieJar for MemoryCookieJar {
    async fn get(&self, query: &CookieQuery) -> Result<Vec<CookieRecord>, JarError> {
        let now = Utc::now();
        let is_https = query.url.scheme() == "https";
        let mut cookies = self.cookies.write();
        cookies.retain(|stored| !stored.record.is_expired(now));

        let mut matched: Vec<&StoredCookie> = cookies
            .iter()
            .filter(|stored| stored.matches_url(&query.url))
            .filter(|stored| !stored.record.secure || is_https)
            .filter(|stored| {
                query.domain.as_deref().map_or(true, |domain| {
                    let domain = domain.trim_start_matches('.').to_ascii_lowercase();
                    stored.domain() == domain || stored.domain().ends_with(&format!(".{domain}"))
                })
            })
            .filter(|stored| query.path.as_deref().map_or(true, |path| stored.path() == path))
            .filter(|stored| query.secure.map_or(true, |secure| stored.record.secure == secure))
            .collect();
        // Longer paths first, as a browser orders its Cookie header.
        matched.sort_by_key(|stored| std::cmp::Reverse(stored.path().len()));
        Ok(matched.into_iter().map(|stored| stored.record.clone()).collect())
    }

    async fn set(&self, url: &Url, mut record: CookieRecord) -> Result<(), JarError> {
        let host = url
            .host_str()
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| JarError::new(format!("cannot set cookie for host-less url {url}")))?;

        let host_only = match record.domain.take() {
            Some(domain) => {
                let domain = domain.trim_start_matches('.').to_ascii_lowercase();
                if !domain_matches(url, &host, &domain) {
                    return Err(JarError::new(format!(
                        "cookie `{}` domain `{domain}` does not match host `{host}`",
                        record.name
                    )));
                }
                record.domain = Some(domain);
                false
            }
            None => {
                record.domain = Some(host);
                true
            }
        };
        if record.path.is_none() {
            record.path = Some(default_path(url.path()));
        }

        let mut cookies = self.cookies.write();
        cookies.retain(|stored| {
            !(stored.record.name == record.name
                && stored.record.domain == record.domain
                && stored.record.path == record.path)
        });
        if !record.is_expired(Utc::now()) {
            cookies.push(StoredCookie { record, host_only });
        }
        Ok(())
    }

    async fn remove(&self, url: &Url, name: &str) -> Result<(), JarError> {
        self.cookies
            .write()
            .retain(|stored| !(stored.record.name == name && stored.matches_url(url)));
        Ok(())
    }
}

/// RFC 6265 §5.1.3. IP hosts only match themselves.
fn domain_matches(url: &Url, host: &str, domain: &str) -> bool {
    if host == domain {
        return true;
    }
    matches!(url.host(), Some(Host::Domain(_)))
        && host.len() > domain.len()
        && host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
}

/// RFC 6265 §5.1.4.
fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

/// RFC 6265 §5.1.4 default-path: the directory of the request path.
fn default_path(request_path: &str) -> String {
    match request_path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => request_path[..index].to_string(),
    }
}
