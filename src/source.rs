//! Flattening of multi-line config blocks into ordered lists.
//!
//! Every block drops blank lines and `#` comments and splices `file: <path>`
//! includes in place. The proxies block also accepts `url: <endpoint>` (a
//! remote list) and `env_url: <VAR>` (a remote list whose endpoint is read
//! from the environment).

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::ConfigError;

const FILE_PREFIX: &str = "file:";
const URL_PREFIX: &str = "url:";
const ENV_URL_PREFIX: &str = "env_url:";
const MAX_INCLUDE_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Inline,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    pub text: String,
    pub origin: Origin,
}

/// Fetches the body of a remote list.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, ConfigError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Fetch {
                url: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, ConfigError> {
        let fetch_error = |e: reqwest::Error| ConfigError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(fetch_error)?;
        response.text().await.map_err(fetch_error)
    }
}

type EnvReader = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub struct SourceResolver<'a> {
    base_dir: PathBuf,
    fetcher: &'a dyn Fetcher,
    env: EnvReader,
}

impl<'a> SourceResolver<'a> {
    /// Relative `file:` paths resolve against `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>, fetcher: &'a dyn Fetcher) -> Self {
        Self {
            base_dir: base_dir.into(),
            fetcher,
            env: Box::new(|name| std::env::var(name).ok()),
        }
    }

    pub fn with_env(mut self, env: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        self.env = Box::new(env);
        self
    }

    pub fn lines(&self, block: &str) -> Result<Vec<SourceLine>, ConfigError> {
        let mut out = Vec::new();
        self.collect(block, &Origin::Inline, 0, &mut out)?;
        Ok(out)
    }

    pub fn texts(&self, block: &str) -> Result<Vec<String>, ConfigError> {
        Ok(self.lines(block)?.into_iter().map(|line| line.text).collect())
    }

    /// Literal proxies, `url:` lists and `env_url:` lists, flattened in order.
    pub async fn proxies(&self, block: &str) -> Result<Vec<String>, ConfigError> {
        let mut proxies = Vec::new();
        for line in self.lines(block)? {
            if let Some(var) = line.text.strip_prefix(ENV_URL_PREFIX) {
                let var = var.trim();
                let url = (self.env)(var).ok_or_else(|| ConfigError::Env(var.to_string()))?;
                proxies.extend(self.fetch_list(url.trim()).await?);
            } else if let Some(url) = line.text.strip_prefix(URL_PREFIX) {
                proxies.extend(self.fetch_list(url.trim()).await?);
            } else {
                proxies.push(line.text);
            }
        }
        Ok(proxies)
    }

    async fn fetch_list(&self, url: &str) -> Result<Vec<String>, ConfigError> {
        let body = self.fetcher.fetch(url).await?;
        let items: Vec<String> = body
            .lines()
            .map(strip_comment)
            .flat_map(|line| line.split(|c: char| c == ',' || c.is_whitespace()))
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect();
        debug!("fetched {} entries from {url}", items.len());
        Ok(items)
    }

    fn collect(&self, block: &str, origin: &Origin, depth: usize, out: &mut Vec<SourceLine>) -> Result<(), ConfigError> {
        for raw in block.lines() {
            let line = strip_comment(raw);
            if line.is_empty() {
                continue;
            }
            if let Some(path) = line.strip_prefix(FILE_PREFIX) {
                if depth >= MAX_INCLUDE_DEPTH {
                    return Err(ConfigError::invalid("file", format!("includes nested deeper than {MAX_INCLUDE_DEPTH}")));
                }
                let path = self.resolve_path(path.trim());
                let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                self.collect(&contents, &Origin::File(path), depth + 1, out)?;
                continue;
            }
            out.push(SourceLine {
                text: line.to_string(),
                origin: origin.clone(),
            });
        }
        Ok(())
    }

    pub fn resolve_path(&self, path: &str) -> PathBuf {
        resolve_path(&self.base_dir, path)
    }
}

/// Expands `~/` and joins relative paths onto `base_dir`.
pub fn resolve_path(base_dir: &Path, path: &str) -> PathBuf {
    let expanded = expand_home(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base_dir.join(expanded)
    }
}

fn strip_comment(line: &str) -> &str {
    line.split('#').next().unwrap_or_default().trim()
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => Path::new(&home).join(rest),
        _ => PathBuf::from(path),
    }
}
