use crate::{
    assembler::Assembler,
    monitor::chain::ChainRpcClient,
    primitives::{
        Address,
        Bytes,
        SourceAddress,
    },
    verify::{
        Compiler,
        Injector,
    },
};

use std::{
    sync::Arc,
    time::Duration,
};

use tokio::time::sleep;

use tracing::{
    debug,
    info,
    warn,
};

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// First block to walk; the chain head at startup when unset.
    pub start_block: Option<u64>,
    pub get_block_pause: Duration,
    pub get_code_retry_pause: Duration,
    pub initial_get_bytecode_tries: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            start_block: None,
            get_block_pause: Duration::from_secs(2),
            get_code_retry_pause: Duration::from_secs(2),
            initial_get_bytecode_tries: 3,
        }
    }
}

/// Walks one chain block by block, feeding every contract creation it sees
/// into the assembler and, on completion, the injector.
pub struct ChainMonitor<C> {
    chain_id: u64,
    client: ChainRpcClient,
    assembler: Assembler,
    injector: Arc<Injector<C>>,
    config: WatcherConfig,
}

impl<C: Compiler + 'static> ChainMonitor<C> {
    pub fn new(
        chain_id: u64,
        client: ChainRpcClient,
        assembler: Assembler,
        injector: Arc<Injector<C>>,
        config: WatcherConfig,
    ) -> Self {
        Self {
            chain_id,
            client,
            assembler,
            injector,
            config,
        }
    }

    /// Runs forever. A block is only advanced past once it was fetched and
    /// scanned; both a not-yet-mined block and a transport error retry the
    /// same height after `get_block_pause`, so a transient RPC failure never
    /// stalls the walk.
    pub async fn run(self: Arc<Self>) {
        let mut number = self.starting_block().await;
        info!(
            target: "contract_verifier::monitor",
            chain_id = self.chain_id,
            start_block = number,
            "starting block walk"
        );

        loop {
            match self.client.block_with_transactions(number).await {
                Ok(Some(block)) => {
                    self.scan_block(&block.transactions);
                    number += 1;
                }
                Ok(None) => {
                    debug!(
                        target: "contract_verifier::monitor",
                        chain_id = self.chain_id,
                        block = number,
                        "waiting for block"
                    );
                }
                Err(err) => {
                    warn!(
                        target: "contract_verifier::monitor",
                        chain_id = self.chain_id,
                        block = number,
                        ?err,
                        "block fetch failed"
                    );
                }
            }
            sleep(self.config.get_block_pause).await;
        }
    }

    async fn starting_block(&self) -> u64 {
        if let Some(start) = self.config.start_block {
            return start;
        }
        loop {
            match self.client.latest_block_number().await {
                Ok(head) => return head,
                Err(err) => {
                    warn!(
                        target: "contract_verifier::monitor",
                        chain_id = self.chain_id,
                        ?err,
                        "cannot read chain head"
                    );
                    sleep(self.config.get_block_pause).await;
                }
            }
        }
    }

    fn scan_block(self: &Arc<Self>, transactions: &[crate::monitor::chain::RpcTransaction]) {
        for transaction in transactions {
            if !transaction.is_creation() {
                continue;
            }
            let address = transaction.created_contract_address();
            debug!(
                target: "contract_verifier::monitor",
                chain_id = self.chain_id,
                %address,
                tx = %transaction.hash,
                "observed contract creation"
            );

            // A slow getCode retry chain must not hold up the block walk.
            let monitor = Arc::clone(self);
            tokio::spawn(async move {
                monitor
                    .process_bytecode(address, monitor.config.initial_get_bytecode_tries)
                    .await;
            });
        }
    }

    /// Reads the created contract's runtime bytecode, retrying while the RPC
    /// node's state lags the block head. Addresses with no code after the
    /// final try are dropped; a reverted creation looks exactly like this.
    async fn process_bytecode(&self, address: Address, tries: u32) {
        let mut remaining = tries;
        loop {
            remaining = remaining.saturating_sub(1);
            match self.client.code_at(address).await {
                Ok(code) if code.is_empty() => {
                    if remaining == 0 {
                        debug!(
                            target: "contract_verifier::monitor",
                            chain_id = self.chain_id,
                            %address,
                            "no bytecode after retries, dropping"
                        );
                        return;
                    }
                }
                Ok(code) => {
                    self.handle_bytecode(address, code);
                    return;
                }
                Err(err) => {
                    warn!(
                        target: "contract_verifier::monitor",
                        chain_id = self.chain_id,
                        %address,
                        ?err,
                        "eth_getCode failed"
                    );
                    if remaining == 0 {
                        return;
                    }
                }
            }
            sleep(self.config.get_code_retry_pause).await;
        }
    }

    fn handle_bytecode(&self, address: Address, code: Bytes) {
        let pointer = match SourceAddress::from_runtime_code(&code) {
            Ok(pointer) => pointer,
            Err(err) => {
                // Contracts compiled without a metadata pointer are the
                // common case, not a failure.
                debug!(
                    target: "contract_verifier::monitor",
                    chain_id = self.chain_id,
                    %address,
                    %err,
                    "no usable metadata pointer"
                );
                return;
            }
        };

        info!(
            target: "contract_verifier::monitor",
            chain_id = self.chain_id,
            %address,
            %pointer,
            "assembling sources"
        );

        let injector = Arc::clone(&self.injector);
        let chain_id = self.chain_id;
        self.assembler.assemble(pointer, move |contract| {
            tokio::spawn(async move {
                match injector
                    .inject_checked(contract, code, chain_id, address)
                    .await
                {
                    Ok(outcome) => {
                        info!(
                            target: "contract_verifier::monitor",
                            chain_id,
                            %address,
                            status = ?outcome.status,
                            path = %outcome.storage_path.display(),
                            "contract verified"
                        );
                    }
                    Err(err) => {
                        warn!(
                            target: "contract_verifier::monitor",
                            chain_id,
                            %address,
                            %err,
                            "injection failed"
                        );
                    }
                }
            });
        });
    }
}
