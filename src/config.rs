use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::json;
use std::path::{Path, PathBuf};

use crate::delay::DelayScheduler;
use crate::error::ConfigError;
use crate::expr::{Unit, ValueExpr};
use crate::instruction::{Address, InstructionLine, InstructionResolver, MAX_TOKEN_DECIMALS};
use crate::keys::KeyPool;
use crate::orchestrator::{BalanceProvider, BatchOptions, Broadcaster, TransferOrchestrator, TransferSigner};
use crate::pool::Routes;
use crate::source::{Fetcher, Origin, SourceResolver, resolve_path};

pub const SAMPLE_CONFIG: &str = r#"# Transfers, one per line: <from> <to> [<value>]
# A missing value falls back to default_value.
transfers: |
  9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM HN7cABqLq46Es1jh92dQQisAq662SmxELLLsHHe4YWrH 1.2t
  HN7cABqLq46Es1jh92dQQisAq662SmxELLLsHHe4YWrH 9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM 0.6balance - random(1t, 2.50t) - 100
  # file: ./more_transfers.txt

# base58 keypairs or [1,2,...] byte arrays, one per line
private_keys: |
  file: ./private_keys.txt

nodes: |
  mainnet

# http(s)/socks5 proxies; `url:` and `env_url:` fetch remote lists
proxies: |
  # url: https://example.com/proxies.txt
  # env_url: PROXIES_URL

# SPL token mint; omit for native SOL transfers
token: EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v

default_value: 0.2balance + random(1t, 2.50t) - 100
value_min_limit: 10t

# seconds between transfers
delay: random(10, 100)

round_ndigits: 5

# extra log files, appended to; relative paths start at this file's directory
# log_debug: ./logs/debug.log
# log_info: ./logs/info.log
"#;

/// The config file as written.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(deserialize_with = "block")]
    pub transfers: String,
    #[serde(deserialize_with = "block")]
    pub private_keys: String,
    #[serde(deserialize_with = "block")]
    pub nodes: String,
    #[serde(default, deserialize_with = "block")]
    pub proxies: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_decimals: Option<u8>,
    #[serde(default, deserialize_with = "scalar")]
    pub default_value: Option<String>,
    #[serde(default, deserialize_with = "scalar")]
    pub value_min_limit: Option<String>,
    #[serde(default, deserialize_with = "scalar")]
    pub delay: Option<String>,
    #[serde(default = "default_round_ndigits")]
    pub round_ndigits: u32,
    #[serde(default)]
    pub log_debug: Option<String>,
    #[serde(default)]
    pub log_info: Option<String>,
}

fn default_round_ndigits() -> u32 {
    5
}

/// A multi-line string or a YAML list of strings.
fn block<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::Null => Ok(String::new()),
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Sequence(items) => items
            .into_iter()
            .map(|item| match item {
                serde_yaml::Value::String(s) => Ok(s),
                other => Err(serde::de::Error::custom(format!("expected a string, got {other:?}"))),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|lines| lines.join("\n")),
        other => Err(serde::de::Error::custom(format!(
            "expected a string block or a list, got {other:?}"
        ))),
    }
}

/// Expressions may be written as bare YAML numbers (`delay: 5`).
fn scalar<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Option::<serde_yaml::Value>::deserialize(deserializer)? {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::String(s)) => Ok(Some(s)),
        Some(serde_yaml::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!("expected an expression, got {other:?}"))),
    }
}

/// The log files a config asks for. Read ahead of the full load so that
/// logging is in place before anything else runs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LogFiles {
    pub log_debug: Option<PathBuf>,
    pub log_info: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct LogFields {
    #[serde(default)]
    log_debug: Option<String>,
    #[serde(default)]
    log_info: Option<String>,
}

impl LogFiles {
    /// An unreadable or malformed config yields no files; the full load reports it.
    pub fn read(config_path: &Path) -> Self {
        let Ok(yaml) = std::fs::read_to_string(config_path) else {
            return Self::default();
        };
        let fields: LogFields = serde_yaml::from_str(&yaml).unwrap_or_default();
        let base_dir = config_dir(config_path);
        Self {
            log_debug: fields.log_debug.as_deref().map(|p| resolve_path(&base_dir, p.trim())),
            log_info: fields.log_info.as_deref().map(|p| resolve_path(&base_dir, p.trim())),
        }
    }
}

fn config_dir(config_path: &Path) -> PathBuf {
    config_path.parent().map(Path::to_path_buf).unwrap_or_default()
}

/// Fully resolved configuration: flat lists, parsed expressions, decoded keys.
#[derive(Debug)]
pub struct BatchConfig {
    pub path: PathBuf,
    pub instructions: Vec<InstructionLine>,
    pub keys: KeyPool,
    pub nodes: Vec<String>,
    pub proxies: Vec<String>,
    pub token: Option<Address>,
    pub token_decimals: Option<u8>,
    pub default_value: Option<ValueExpr>,
    pub value_min_limit: Option<ValueExpr>,
    pub delay: Option<ValueExpr>,
    pub round_ndigits: u32,
    pub log_debug: Option<PathBuf>,
    pub log_info: Option<PathBuf>,
}

impl BatchConfig {
    pub async fn load(path: &Path, fetcher: &dyn Fetcher) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let resolver = SourceResolver::new(config_dir(path), fetcher);
        let mut config = Self::from_yaml(&yaml, &resolver).await?;
        config.path = path.to_path_buf();
        Ok(config)
    }

    pub async fn from_yaml(yaml: &str, sources: &SourceResolver<'_>) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_yaml::from_str(yaml)?;
        Self::resolve(file, sources).await
    }

    async fn resolve(file: ConfigFile, sources: &SourceResolver<'_>) -> Result<Self, ConfigError> {
        let token = file
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| Address::parse(t).map_err(|e| ConfigError::invalid("token", e.to_string())))
            .transpose()?;
        let unit = if token.is_some() { Unit::Token } else { Unit::Sol };

        if let Some(decimals) = file.token_decimals {
            check_token_decimals(decimals)?;
        }

        let default_value = parse_expr("default_value", file.default_value.as_deref(), unit, true)?;
        let value_min_limit = parse_expr("value_min_limit", file.value_min_limit.as_deref(), unit, false)?;
        let delay = file
            .delay
            .as_deref()
            .map(|src| ValueExpr::parse(src).map_err(|e| ConfigError::invalid("delay", e.to_string())))
            .transpose()?;
        DelayScheduler::new(delay.clone())?;

        let keys = KeyPool::from_secrets(&sources.texts(&file.private_keys)?)?;

        let nodes: Vec<String> = sources
            .texts(&file.nodes)?
            .iter()
            .map(|node| public_rpc_url(node))
            .collect();
        if nodes.is_empty() {
            return Err(ConfigError::EmptyNodes);
        }

        let proxies = sources.proxies(&file.proxies).await?;

        // Inline transfers run first, then included ones, each in file order.
        let (inline, included): (Vec<_>, Vec<_>) = sources
            .lines(&file.transfers)?
            .into_iter()
            .partition(|line| line.origin == Origin::Inline);
        let instructions = inline
            .into_iter()
            .chain(included)
            .enumerate()
            .map(|(n, line)| InstructionLine::new(n + 1, line.text))
            .collect();

        Ok(Self {
            path: PathBuf::new(),
            instructions,
            keys,
            nodes,
            proxies,
            token,
            token_decimals: file.token_decimals,
            default_value,
            value_min_limit,
            delay,
            round_ndigits: file.round_ndigits,
            log_debug: file.log_debug.as_deref().map(|p| sources.resolve_path(p.trim())),
            log_info: file.log_info.as_deref().map(|p| sources.resolve_path(p.trim())),
        })
    }

    /// Sets decimals fetched from the mint, with the same bound as the config field.
    pub fn set_token_decimals(&mut self, decimals: u8) -> Result<(), ConfigError> {
        check_token_decimals(decimals)?;
        self.token_decimals = Some(decimals);
        Ok(())
    }

    pub fn unit(&self) -> Unit {
        if self.token.is_some() { Unit::Token } else { Unit::Sol }
    }

    /// Token mode needs `token_decimals` set, either in the file or fetched from the mint.
    pub fn resolver(&self) -> Result<InstructionResolver, ConfigError> {
        match (&self.token, self.token_decimals) {
            (None, _) => Ok(InstructionResolver::sol(
                self.default_value.clone(),
                self.value_min_limit.clone(),
            )),
            (Some(_), Some(decimals)) => InstructionResolver::token(
                u32::from(decimals),
                self.default_value.clone(),
                self.value_min_limit.clone(),
            ),
            (Some(token), None) => Err(ConfigError::invalid(
                "token_decimals",
                format!("decimals of {token} are unknown"),
            )),
        }
    }

    pub fn routes(&self) -> Result<Routes, ConfigError> {
        Routes::new(self.nodes.clone(), self.proxies.clone())
    }

    /// Consumes the config into a ready orchestrator and its instructions.
    pub fn into_orchestrator<C>(
        self,
        chain: C,
        options: BatchOptions,
    ) -> Result<(TransferOrchestrator<C>, Vec<InstructionLine>), ConfigError>
    where
        C: BalanceProvider + TransferSigner + Broadcaster,
    {
        let resolver = self.resolver()?;
        let routes = self.routes()?;
        let delay = DelayScheduler::new(self.delay)?;
        let orchestrator = TransferOrchestrator::new(resolver, self.keys, routes, delay, chain).with_options(options);
        Ok((orchestrator, self.instructions))
    }

    /// Printable view with secrets reduced to a count.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "transfers": self.instructions.iter().map(|i| i.text.as_str()).collect::<Vec<_>>(),
            "private_keys": self.keys.len(),
            "nodes": self.nodes,
            "proxies": self.proxies,
            "token": self.token,
            "token_decimals": self.token_decimals,
            "default_value": self.default_value.as_ref().map(ValueExpr::source),
            "value_min_limit": self.value_min_limit.as_ref().map(ValueExpr::source),
            "delay": self.delay.as_ref().map(ValueExpr::source),
            "round_ndigits": self.round_ndigits,
            "log_debug": self.log_debug,
            "log_info": self.log_info,
        })
    }
}

fn check_token_decimals(decimals: u8) -> Result<(), ConfigError> {
    if u32::from(decimals) > MAX_TOKEN_DECIMALS {
        return Err(ConfigError::invalid(
            "token_decimals",
            format!("{decimals} is above {MAX_TOKEN_DECIMALS}"),
        ));
    }
    Ok(())
}

fn parse_expr(
    field: &'static str,
    source: Option<&str>,
    unit: Unit,
    allow_balance: bool,
) -> Result<Option<ValueExpr>, ConfigError> {
    let Some(source) = source else {
        return Ok(None);
    };
    let expr = ValueExpr::parse(source).map_err(|e| ConfigError::invalid(field, e.to_string()))?;
    expr.ensure_unit(unit)
        .map_err(|e| ConfigError::invalid(field, e.to_string()))?;
    if !allow_balance {
        if expr.references_balance() {
            return Err(ConfigError::invalid(field, "`balance` is not allowed here"));
        }
        match expr.bounds() {
            Some((low, _)) if low > Decimal::ZERO => {}
            Some((low, _)) => {
                return Err(ConfigError::invalid(
                    field,
                    format!("`{expr}` can evaluate to {low}, must stay positive"),
                ));
            }
            None => return Err(ConfigError::invalid(field, format!("`{expr}` overflows"))),
        }
    }
    Ok(Some(expr))
}

/// Expands the cluster short names.
pub fn public_rpc_url(node: &str) -> String {
    match node.to_ascii_lowercase().as_str() {
        "mainnet" => "https://api.mainnet-beta.solana.com".to_string(),
        "testnet" => "https://api.testnet.solana.com".to_string(),
        "devnet" => "https://api.devnet.solana.com".to_string(),
        _ => node.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransferError;
    use async_trait::async_trait;
    use solana_sdk::signature::{Keypair, Signer};
    use std::fs;

    struct NoFetch;

    #[async_trait]
    impl Fetcher for NoFetch {
        async fn fetch(&self, url: &str) -> Result<String, ConfigError> {
            Err(ConfigError::Fetch {
                url: url.to_string(),
                message: "offline".to_string(),
            })
        }
    }

    const TO: &str = "HN7cABqLq46Es1jh92dQQisAq662SmxELLLsHHe4YWrH";

    fn yaml(sender: &Keypair, extra: &str) -> String {
        format!(
            "transfers: |\n  {from} {TO} 0.1\n  {from} {TO}\nprivate_keys: |\n  {key}\nnodes: devnet\n{extra}",
            from = sender.pubkey(),
            key = sender.to_base58_string(),
        )
    }

    async fn load(yaml: &str) -> Result<BatchConfig, ConfigError> {
        let resolver = SourceResolver::new(".", &NoFetch);
        BatchConfig::from_yaml(yaml, &resolver).await
    }

    #[test]
    fn sample_config_deserializes() {
        let file: ConfigFile = serde_yaml::from_str(SAMPLE_CONFIG).unwrap();
        assert_eq!(file.delay.as_deref(), Some("random(10, 100)"));
        assert!(file.token.is_some());
        assert!(ValueExpr::parse(file.default_value.as_deref().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn minimal_sol_config() {
        let sender = Keypair::new();
        let config = load(&yaml(&sender, "default_value: 0.5\ndelay: 3\n")).await.unwrap();

        assert_eq!(config.unit(), Unit::Sol);
        assert_eq!(config.instructions.len(), 2);
        assert_eq!(config.instructions[0].index, 1);
        assert_eq!(config.nodes, vec!["https://api.devnet.solana.com"]);
        assert!(config.proxies.is_empty());
        assert_eq!(config.delay.as_ref().unwrap().source(), "3");
        assert_eq!(config.keys.len(), 1);
        assert!(config.resolver().is_ok());

        let json = config.to_json();
        assert_eq!(json["private_keys"], 1);
        assert!(!json.to_string().contains(&sender.to_base58_string()));
    }

    #[tokio::test]
    async fn lists_are_accepted_for_blocks() {
        let sender = Keypair::new();
        let yaml = format!(
            "transfers:\n  - {from} {TO} 1\nprivate_keys:\n  - {key}\nnodes:\n  - http://a\n  - http://b\nproxies:\n  - http://p\n",
            from = sender.pubkey(),
            key = sender.to_base58_string(),
        );
        let config = load(&yaml).await.unwrap();
        assert_eq!(config.nodes, vec!["http://a", "http://b"]);
        assert_eq!(config.proxies, vec!["http://p"]);
    }

    #[tokio::test]
    async fn included_transfers_run_after_inline_ones() {
        let dir = tempfile::tempdir().unwrap();
        let sender = Keypair::new();
        let from = sender.pubkey();
        fs::write(dir.path().join("extra.txt"), format!("{from} {TO} 3\n{from} {TO} 4\n")).unwrap();
        let config_path = dir.path().join("config.yaml");
        fs::write(
            &config_path,
            format!(
                "transfers: |\n  {from} {TO} 1\n  file: extra.txt\n  {from} {TO} 2\nprivate_keys: {key}\nnodes: http://n\n",
                key = sender.to_base58_string()
            ),
        )
        .unwrap();

        let config = BatchConfig::load(&config_path, &NoFetch).await.unwrap();

        let values: Vec<_> = config
            .instructions
            .iter()
            .map(|line| line.parsed.as_ref().unwrap().value.as_ref().unwrap().source().to_string())
            .collect();
        assert_eq!(values, vec!["1", "2", "3", "4"]);
        assert_eq!(config.path, config_path);
    }

    #[test]
    fn log_files_resolve_against_the_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        fs::write(
            &config_path,
            "transfers: x\nlog_debug: logs/debug.log\nlog_info: /var/log/batch.log\n",
        )
        .unwrap();

        let files = LogFiles::read(&config_path);
        assert_eq!(files.log_debug, Some(dir.path().join("logs/debug.log")));
        assert_eq!(files.log_info, Some(PathBuf::from("/var/log/batch.log")));

        assert_eq!(LogFiles::read(&dir.path().join("missing.yaml")), LogFiles::default());
        fs::write(&config_path, "transfers: [unclosed\n").unwrap();
        assert_eq!(LogFiles::read(&config_path), LogFiles::default());
    }

    #[tokio::test]
    async fn log_files_are_part_of_the_config() {
        let sender = Keypair::new();
        let config = load(&yaml(&sender, "log_info: info.log\n")).await.unwrap();
        assert_eq!(config.log_info, Some(PathBuf::from("./info.log")));
        assert!(config.log_debug.is_none());
        assert_eq!(config.to_json()["log_info"], "./info.log");
    }

    #[tokio::test]
    async fn bad_lines_stay_per_instruction() {
        let sender = Keypair::new();
        let yaml = format!(
            "transfers: |\n  {from} {TO} 1 * 2\n  lonely\nprivate_keys: {key}\nnodes: http://n\n",
            from = sender.pubkey(),
            key = sender.to_base58_string(),
        );
        let config = load(&yaml).await.unwrap();
        assert!(matches!(config.instructions[0].parsed, Err(TransferError::Parse(_))));
        assert!(matches!(config.instructions[1].parsed, Err(TransferError::Parse(_))));
    }

    #[tokio::test]
    async fn fatal_config_errors() {
        let sender = Keypair::new();
        let cases = [
            "default_value: 1sol + 2t\n",
            "token: Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB\ndefault_value: 1sol\n",
            "value_min_limit: balance\n",
            "value_min_limit: 0\n",
            "value_min_limit: 1 - 2\n",
            "value_min_limit: random(0, 1)\n",
            "value_min_limit: 79228162514264337593543950335 + 1\n",
            "delay: balance\n",
            "delay: 5t\n",
            "token_decimals: 40\n",
            "token: not-a-mint\n",
            "proxies: \"url: https://unreachable\"\n",
            "unknown_field: 1\n",
            "private_keys: again\n",
        ];
        for extra in cases {
            assert!(load(&yaml(&sender, extra)).await.is_err(), "{extra} should fail");
        }

        let missing_include = format!(
            "transfers: |\n  file: /definitely/not/here.txt\nprivate_keys: {}\nnodes: http://n\n",
            sender.to_base58_string()
        );
        assert!(matches!(load(&missing_include).await, Err(ConfigError::Io { .. })));

        let no_nodes = format!(
            "transfers: \"\"\nprivate_keys: {}\nnodes: \"# none\"\n",
            sender.to_base58_string()
        );
        assert!(matches!(load(&no_nodes).await, Err(ConfigError::EmptyNodes)));
    }

    #[tokio::test]
    async fn token_mode_needs_decimals() {
        let sender = Keypair::new();
        let mint = "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB";
        let mut config = load(&yaml(&sender, &format!("token: {mint}\n"))).await.unwrap();
        assert_eq!(config.unit(), Unit::Token);
        assert!(config.resolver().is_err());

        assert!(matches!(
            config.set_token_decimals(30),
            Err(ConfigError::Invalid {
                field: "token_decimals",
                ..
            })
        ));
        assert!(config.token_decimals.is_none());

        config.set_token_decimals(6).unwrap();
        let resolver = config.resolver().unwrap();
        assert_eq!(resolver.unit(), Unit::Token);
        assert_eq!(resolver.decimals(), 6);

        config.token_decimals = Some(200);
        assert!(config.resolver().is_err());
    }
}
