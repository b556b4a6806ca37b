//! Domain blocklist for fetch and search results.
//!
//! Loaded from a YAML file of the form:
//!
//! ```yaml
//! domains:
//!   - domain: wikipedia.org
//!     reason: circular source
//! ```

use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum BlocklistError {
    #[error("failed to read blocklist {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid blocklist {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
struct BlocklistFile {
    #[serde(default)]
    domains: Vec<BlocklistEntry>,
}

#[derive(Debug, Deserialize)]
struct BlocklistEntry {
    domain: Option<String>,
}

/// Set of blocked domains. A host is blocked when it equals a listed domain
/// or is a subdomain of one.
#[derive(Debug, Clone, Default)]
pub struct DomainBlocklist {
    domains: HashSet<String>,
}

impl DomainBlocklist {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .map(|d| normalize_domain(d.as_ref()))
            .filter(|d| !d.is_empty())
            .collect();
        Self { domains }
    }

    /// Load a blocklist file. A missing file is an empty blocklist.
    pub fn load(path: &Path) -> Result<Self, BlocklistError> {
        if !path.exists() {
            tracing::info!("No blocklist at {}, fetching is unrestricted", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| BlocklistError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents).map_err(|source| BlocklistError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        // An empty document deserializes to unit, not to the struct.
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let file: BlocklistFile = serde_yaml::from_str(contents)?;
        Ok(Self::new(file.domains.into_iter().filter_map(|e| e.domain)))
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Check a URL. Unparseable URLs and URLs without a host are not blocked;
    /// they fail later at fetch time.
    pub fn is_blocked(&self, url: &str) -> bool {
        match url::Url::parse(url) {
            Ok(parsed) => parsed.host_str().is_some_and(|h| self.is_blocked_host(h)),
            Err(_) => false,
        }
    }

    pub fn is_blocked_host(&self, host: &str) -> bool {
        if self.domains.is_empty() {
            return false;
        }
        let host = normalize_domain(host);
        // Walk up the label chain: a.b.example.com, b.example.com, example.com, com
        let mut candidate = host.as_str();
        loop {
            if self.domains.contains(candidate) {
                return true;
            }
            match candidate.split_once('.') {
                Some((_, parent)) => candidate = parent,
                None => return false,
            }
        }
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_subdomain_match() {
        let blocklist = DomainBlocklist::new(["wikipedia.org", "imdb.com"]);
        assert!(blocklist.is_blocked("https://wikipedia.org/wiki/X"));
        assert!(blocklist.is_blocked("https://en.wikipedia.org/wiki/X"));
        assert!(blocklist.is_blocked("https://EN.Wikipedia.ORG/wiki/X"));
        assert!(blocklist.is_blocked("http://m.imdb.com/title/tt1"));
        assert!(!blocklist.is_blocked("https://notwikipedia.org/"));
        assert!(!blocklist.is_blocked("https://example.com/wikipedia.org"));
    }

    #[test]
    fn test_unparseable_url_not_blocked() {
        let blocklist = DomainBlocklist::new(["blocked.test"]);
        assert!(!blocklist.is_blocked("not a url"));
        assert!(blocklist.is_blocked("https://blocked.test/x"));
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
domains:
  - domain: wikipedia.org
    reason: circular
  - domain: wikidata.org
  - reason: entry without domain is ignored
"#;
        let blocklist = DomainBlocklist::from_yaml(yaml).unwrap();
        assert_eq!(blocklist.len(), 2);
        assert!(blocklist.is_blocked_host("www.wikidata.org"));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        let blocklist = DomainBlocklist::load(&temp.path().join("nope.yaml")).unwrap();
        assert!(blocklist.is_empty());
    }

    #[test]
    fn test_empty_file_is_empty() {
        let blocklist = DomainBlocklist::from_yaml("").unwrap();
        assert!(blocklist.is_empty());
    }
}
