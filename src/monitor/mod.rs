mod chain;
pub use chain::{
    ChainClientError,
    ChainRpcClient,
    RpcBlock,
    RpcTransaction,
};

mod watcher;
pub use watcher::{
    ChainMonitor,
    WatcherConfig,
};

use crate::{
    assembler::Assembler,
    config::MonitorConfig,
    fetch::{
        FetcherConfig,
        GatewaySet,
        SourceFetcher,
    },
    verify::{
        Injector,
        Repository,
        SolcCompiler,
    },
};

use std::sync::Arc;

use tracing::{
    error,
    info,
};

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("refusing to start while TESTING is set")]
    TestingMode,
    #[error("no chains configured")]
    NoChains,
    #[error(transparent)]
    Chain(#[from] ChainClientError),
}

/// Owns the shared fetcher, assembler, and injector, plus one block watcher
/// per configured chain, for the lifetime of the process.
pub struct Monitor;

impl Monitor {
    /// Builds the pipeline and walks every configured chain until the
    /// process is stopped.
    pub async fn run(config: MonitorConfig) -> Result<(), MonitorError> {
        if config.testing {
            return Err(MonitorError::TestingMode);
        }
        if config.chains.is_empty() {
            return Err(MonitorError::NoChains);
        }

        let gateways = Arc::new(GatewaySet::new(&config.ipfs_url));
        let fetcher = SourceFetcher::new(
            gateways,
            FetcherConfig {
                fetch_timeout: config.fetch_timeout,
                fetch_pause: config.fetch_pause,
                cleanup_time: config.cleanup_time,
            },
        );
        let assembler = Assembler::new(fetcher, config.cleanup_time);

        // The monitor's injector is offline: watchers hand it the bytecode
        // they already fetched.
        let injector = Arc::new(Injector::offline(
            Repository::new(&config.repository_path),
            SolcCompiler::new(&config.compilers_dir),
        ));

        let mut watchers = Vec::new();
        for chain in &config.chains {
            let client = ChainRpcClient::new(&chain.rpc_url)?;
            let watcher = Arc::new(ChainMonitor::new(
                chain.chain_id,
                client,
                assembler.clone(),
                Arc::clone(&injector),
                WatcherConfig {
                    start_block: chain.start_block,
                    get_block_pause: config.get_block_pause,
                    get_code_retry_pause: config.get_code_retry_pause,
                    initial_get_bytecode_tries: config.initial_get_bytecode_tries,
                },
            ));
            info!(
                target: "contract_verifier::monitor",
                chain_id = chain.chain_id,
                "watching chain"
            );
            watchers.push((chain.chain_id, tokio::spawn(watcher.run())));
        }

        for (chain_id, handle) in watchers {
            if let Err(err) = handle.await {
                error!(
                    target: "contract_verifier::monitor",
                    chain_id,
                    ?err,
                    "chain watcher task failed"
                );
            }
        }
        Ok(())
    }
}
