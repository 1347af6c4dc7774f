use clap::Parser;

use std::{
    path::PathBuf,
    time::Duration,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid chain spec {0:?}, expected <chainId>=<rpc-url>")]
    InvalidChainSpec(String),
    #[error("invalid MONITOR_START_{chain_id} value {value:?}")]
    InvalidStartBlock { chain_id: u64, value: String },
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// IPFS gateway URL prefix metadata and source hashes are appended to.
    #[arg(
        long,
        env = "IPFS_URL",
        default_value = "https://ipfs.infura.io:5001/api/v0/cat?arg="
    )]
    pub ipfs_url: String,

    /// Timeout for a single gateway fetch, in milliseconds.
    #[arg(long, env = "MONITOR_FETCH_TIMEOUT", default_value = "300000")]
    pub monitor_fetch_timeout: u64,

    /// Pause between gateway fetch dispatches, in milliseconds.
    #[arg(long, env = "MONITOR_FETCH_PAUSE", default_value = "1000")]
    pub monitor_fetch_pause: u64,

    /// Age after which unserved subscriptions and assemblies are dropped,
    /// in milliseconds.
    #[arg(long, env = "MONITOR_CLEANUP_PERIOD", default_value = "1800000")]
    pub monitor_cleanup_period: u64,

    /// Pause between eth_getCode retries, in milliseconds.
    #[arg(long, env = "GET_CODE_RETRY_PAUSE", default_value = "2000")]
    pub get_code_retry_pause: u64,

    /// Pause between block fetches, in milliseconds.
    #[arg(long, env = "GET_BLOCK_PAUSE", default_value = "2000")]
    pub get_block_pause: u64,

    /// How many times to poll eth_getCode for a freshly created contract.
    #[arg(long, env = "INITIAL_GET_BYTECODE_TRIES", default_value = "3")]
    pub initial_get_bytecode_tries: u32,

    /// Substituted for `{INFURA_ID}` in chain RPC URLs.
    #[arg(long, env = "INFURA_ID", default_value = "")]
    pub infura_id: String,

    /// Refuse to start; reserved for test harnesses.
    #[arg(
        long,
        env = "TESTING",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub testing: bool,

    /// Chains to watch, as `<chainId>=<rpc-url>` pairs.
    #[arg(long = "chain", env = "MONITOR_CHAINS", value_delimiter = ',')]
    pub chains: Vec<String>,

    /// Root of the content-addressed artifact repository.
    #[arg(long, env = "REPOSITORY_PATH", default_value = "./repository")]
    pub repository_path: PathBuf,

    /// Directory holding `solc-<version>` release binaries.
    #[arg(long, env = "COMPILERS_DIR", default_value = "./compilers")]
    pub compilers_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    /// From `MONITOR_START_<chainId>`; chain head when unset.
    pub start_block: Option<u64>,
}

/// Fully resolved runtime configuration. The environment is read exactly
/// once, here; every component receives its parameters by construction.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub ipfs_url: String,
    pub fetch_timeout: Duration,
    pub fetch_pause: Duration,
    pub cleanup_time: Duration,
    pub get_code_retry_pause: Duration,
    pub get_block_pause: Duration,
    pub initial_get_bytecode_tries: u32,
    pub testing: bool,
    pub chains: Vec<ChainConfig>,
    pub repository_path: PathBuf,
    pub compilers_dir: PathBuf,
}

impl Config {
    pub fn resolve(self) -> Result<MonitorConfig, ConfigError> {
        let mut chains = Vec::with_capacity(self.chains.len());
        for spec in &self.chains {
            let (chain_id, rpc_url) = spec
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidChainSpec(spec.clone()))?;
            let chain_id: u64 = chain_id
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidChainSpec(spec.clone()))?;
            let rpc_url = rpc_url.replace("{INFURA_ID}", &self.infura_id);

            let start_block = match std::env::var(format!("MONITOR_START_{chain_id}")) {
                Ok(value) => Some(value.parse().map_err(|_| ConfigError::InvalidStartBlock {
                    chain_id,
                    value,
                })?),
                Err(_) => None,
            };

            chains.push(ChainConfig {
                chain_id,
                rpc_url,
                start_block,
            });
        }

        Ok(MonitorConfig {
            ipfs_url: self.ipfs_url,
            fetch_timeout: Duration::from_millis(self.monitor_fetch_timeout),
            fetch_pause: Duration::from_millis(self.monitor_fetch_pause),
            cleanup_time: Duration::from_millis(self.monitor_cleanup_period),
            get_code_retry_pause: Duration::from_millis(self.get_code_retry_pause),
            get_block_pause: Duration::from_millis(self.get_block_pause),
            initial_get_bytecode_tries: self.initial_get_bytecode_tries,
            testing: self.testing,
            chains,
            repository_path: self.repository_path,
            compilers_dir: self.compilers_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_chain_specs_and_infura_id() {
        let config = Config::try_parse_from([
            "contract-verifier",
            "--chain",
            "1=https://mainnet.example/v3/{INFURA_ID}",
            "--chain",
            "5=https://goerli.example/rpc",
            "--infura-id",
            "project123",
        ])
        .unwrap();

        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.chains.len(), 2);
        assert_eq!(resolved.chains[0].chain_id, 1);
        assert_eq!(
            resolved.chains[0].rpc_url,
            "https://mainnet.example/v3/project123"
        );
        assert_eq!(resolved.chains[1].rpc_url, "https://goerli.example/rpc");
        assert_eq!(resolved.fetch_pause, Duration::from_millis(1000));
        assert_eq!(resolved.cleanup_time, Duration::from_millis(1_800_000));
        assert!(!resolved.testing);
    }

    #[test]
    fn start_block_comes_from_the_environment() {
        std::env::set_var("MONITOR_START_77", "123456");
        let config = Config::try_parse_from([
            "contract-verifier",
            "--chain",
            "77=http://localhost:8545",
        ])
        .unwrap();

        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.chains[0].start_block, Some(123_456));
        std::env::remove_var("MONITOR_START_77");
    }

    #[test]
    fn malformed_chain_specs_are_rejected() {
        let config =
            Config::try_parse_from(["contract-verifier", "--chain", "not-a-spec"]).unwrap();
        assert!(matches!(
            config.resolve(),
            Err(ConfigError::InvalidChainSpec(_))
        ));
    }
}
