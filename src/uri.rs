//! Backend address parsing.
//!
//! A backend is addressed by a URI whose scheme selects the transport:
//! `tcp://host:port`, `unix:///absolute/path` (or `unix:/absolute/path`), or a
//! bare `host:port` meaning TCP. Unix URIs may also be glob patterns or
//! directories, expanded again on every scrape.

use ahash::AHashSet as HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::ConfigError;

/// A concrete connection target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "{}", addr),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Parses a backend URI into an [`Endpoint`].
pub fn parse_uri(uri: &str) -> Result<Endpoint, ConfigError> {
    if let Some(rest) = uri.strip_prefix("unix:") {
        let path = rest.strip_prefix("//").unwrap_or(rest);
        if !Path::new(path).is_absolute() {
            return Err(ConfigError::InvalidUri {
                uri: uri.to_string(),
                reason: "Unix socket path is not an absolute path".into(),
            });
        }
        return Ok(Endpoint::Unix(PathBuf::from(path)));
    }

    let addr = uri.strip_prefix("tcp://").unwrap_or(uri);
    if addr.is_empty() || !addr.contains(':') || addr.contains('/') {
        return Err(ConfigError::InvalidUri {
            uri: uri.to_string(),
            reason: "expected host:port".into(),
        });
    }
    Ok(Endpoint::Tcp(addr.to_string()))
}

/// A set of backend URIs where Unix entries may expand to many sockets.
#[derive(Debug, Clone, Default)]
pub struct UriGlobs {
    literals: Vec<Endpoint>,
    globs: Vec<String>,
}

impl UriGlobs {
    /// Validates `uris`. Literal Unix paths must exist; directories become
    /// `<dir>/*` patterns.
    pub fn parse<S: AsRef<str>>(uris: &[S]) -> Result<Self, ConfigError> {
        let mut literals = Vec::new();
        let mut globs = Vec::new();

        for uri in uris {
            let uri = uri.as_ref();
            match parse_uri(uri)? {
                Endpoint::Unix(path) => {
                    let raw = path.to_string_lossy().to_string();
                    if raw.contains('*') {
                        globs.push(raw);
                        continue;
                    }
                    let meta = std::fs::metadata(&path).map_err(|source| ConfigError::Io {
                        path: raw.clone(),
                        source,
                    })?;
                    if meta.is_dir() {
                        globs.push(path.join("*").to_string_lossy().to_string());
                    } else {
                        literals.push(Endpoint::Unix(path));
                    }
                }
                tcp => literals.push(tcp),
            }
        }

        for pattern in &globs {
            glob::Pattern::new(pattern).map_err(|e| ConfigError::InvalidGlob {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        }

        debug!("Parsed backend URIs: literals={:?} globs={:?}", literals, globs);
        Ok(Self { literals, globs })
    }

    /// Current targets: literals followed by whatever the globs match now.
    /// Each endpoint appears once, at its first position.
    pub fn get(&self) -> Vec<Endpoint> {
        let mut endpoints = self.literals.clone();
        for pattern in &self.globs {
            let Ok(paths) = glob::glob(pattern) else {
                continue;
            };
            let matches: Vec<PathBuf> = paths.flatten().collect();
            debug!("{} => {:?}", pattern, matches);
            endpoints.extend(matches.into_iter().map(Endpoint::Unix));
        }

        let mut seen = HashSet::new();
        endpoints.retain(|endpoint| seen.insert(endpoint.clone()));
        endpoints
    }

    pub fn is_empty(&self) -> bool {
        self.literals.is_empty() && self.globs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uri_schemes() {
        assert_eq!(
            parse_uri("tcp://127.0.0.1:6379").unwrap(),
            Endpoint::Tcp("127.0.0.1:6379".into())
        );
        assert_eq!(
            parse_uri("localhost:11211").unwrap(),
            Endpoint::Tcp("localhost:11211".into())
        );
        assert_eq!(
            parse_uri("unix:///run/redis/redis.sock").unwrap(),
            Endpoint::Unix("/run/redis/redis.sock".into())
        );
        assert_eq!(
            parse_uri("unix:/run/redis.sock").unwrap(),
            Endpoint::Unix("/run/redis.sock".into())
        );
    }

    #[test]
    fn test_parse_uri_rejects_relative_unix_path() {
        let err = parse_uri("unix://run/redis.sock").unwrap_err();
        assert!(err.to_string().contains("not an absolute path"));
    }

    #[test]
    fn test_parse_uri_rejects_missing_port() {
        assert!(parse_uri("localhost").is_err());
        assert!(parse_uri("").is_err());
    }

    #[test]
    fn test_globs_are_reexpanded() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("unix://{}", dir.path().display());
        let globs = UriGlobs::parse(&[uri.as_str(), "127.0.0.1:11211"]).unwrap();

        assert_eq!(globs.get(), vec![Endpoint::Tcp("127.0.0.1:11211".into())]);

        let sock = dir.path().join("a.sock");
        std::fs::write(&sock, b"").unwrap();
        assert_eq!(
            globs.get(),
            vec![
                Endpoint::Tcp("127.0.0.1:11211".into()),
                Endpoint::Unix(sock.clone())
            ]
        );

        std::fs::remove_file(&sock).unwrap();
        assert_eq!(globs.get().len(), 1);
    }

    #[test]
    fn test_glob_pattern_and_literal_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("mc.sock");
        std::fs::write(&file, b"").unwrap();

        let literal = format!("unix://{}", file.display());
        let pattern = format!("unix://{}/*.sock", dir.path().display());
        let other = dir.path().join("other.sock");
        std::fs::write(&other, b"").unwrap();

        let globs = UriGlobs::parse(&[literal.clone(), pattern, literal]).unwrap();
        // The literal is also matched by the glob; it is polled once.
        assert_eq!(
            globs.get(),
            vec![Endpoint::Unix(file), Endpoint::Unix(other)]
        );
    }

    #[test]
    fn test_missing_literal_socket_fails() {
        assert!(UriGlobs::parse(&["unix:///nonexistent/dir/mc.sock"]).is_err());
    }
}
