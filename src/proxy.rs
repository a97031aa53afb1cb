//! Deterministic slot-to-proxy mapping and proxy list loading.

use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

/// Maps a batch slot to a proxy: `list[index % len]`, or `None` when the list is empty.
///
/// The index is the slot inside the wave, so slot `i` always lands on the same
/// proxy from one pass to the next.
#[derive(Debug, Clone, Default)]
pub struct ProxyRotator {
    proxies: Arc<[String]>,
}

impl ProxyRotator {
    pub fn new<I, S>(proxies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let proxies: Vec<String> = proxies.into_iter().map(Into::into).collect();
        Self {
            proxies: Arc::from(proxies),
        }
    }

    pub fn assign(&self, index: usize) -> Option<&str> {
        if self.proxies.is_empty() {
            return None;
        }
        Some(self.proxies[index % self.proxies.len()].as_str())
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

/// Reads a newline-delimited proxy list. Blank lines and `#` comments are skipped.
///
/// A missing or empty file yields an empty list and a warning; the engine then
/// runs without proxies.
pub async fn load_proxies(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            tracing::warn!(
                path = %path.display(),
                "proxy file not found; running without proxies"
            );
            return Ok(Vec::new());
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read proxy file {}", path.display()))
        }
    };

    let proxies = parse_proxy_list(&contents);
    if proxies.is_empty() {
        tracing::warn!(
            path = %path.display(),
            "no proxies found; running without proxies"
        );
    } else {
        tracing::info!(path = %path.display(), proxies = proxies.len(), "loaded proxy list");
    }
    Ok(proxies)
}

fn parse_proxy_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect()
}
