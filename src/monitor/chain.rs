use crate::primitives::{
    Address,
    Bytes,
    B256,
    U64,
};

use jsonrpsee::{
    core::client::{
        ClientT,
        Error as ClientError,
    },
    http_client::{
        HttpClient,
        HttpClientBuilder,
    },
    rpc_params,
};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ChainClientError {
    #[error("chain rpc error: {0}")]
    Client(#[from] ClientError),
}

/// Transaction fields the monitor cares about; creations are the
/// transactions whose `to` is absent.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: B256,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    pub nonce: U64,
}

impl RpcTransaction {
    pub fn is_creation(&self) -> bool {
        self.to.is_none()
    }

    /// Deterministic address of the contract this creation produced.
    pub fn created_contract_address(&self) -> Address {
        self.from.create(self.nonce.to::<u64>())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    pub number: U64,
    #[serde(default)]
    pub transactions: Vec<RpcTransaction>,
}

/// A chain's JSON-RPC endpoint, reduced to the three calls the monitor
/// needs.
#[derive(Debug, Clone)]
pub struct ChainRpcClient {
    client: HttpClient,
}

impl ChainRpcClient {
    pub fn new(rpc_url: &str) -> Result<Self, ChainClientError> {
        let client = HttpClientBuilder::default().build(rpc_url)?;
        Ok(Self { client })
    }

    pub async fn latest_block_number(&self) -> Result<u64, ChainClientError> {
        let number: U64 = self.client.request("eth_blockNumber", rpc_params![]).await?;
        Ok(number.to())
    }

    /// Block `number` with full transaction objects, or `None` when the
    /// chain has not reached that height yet.
    pub async fn block_with_transactions(
        &self,
        number: u64,
    ) -> Result<Option<RpcBlock>, ChainClientError> {
        let block = self
            .client
            .request(
                "eth_getBlockByNumber",
                rpc_params![format!("0x{number:x}"), true],
            )
            .await?;
        Ok(block)
    }

    /// Runtime bytecode at `address`; empty until the node has the created
    /// contract's state.
    pub async fn code_at(&self, address: Address) -> Result<Bytes, ChainClientError> {
        let code = self
            .client
            .request("eth_getCode", rpc_params![address, "latest"])
            .await?;
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_transactions_have_no_recipient() {
        let block: RpcBlock = serde_json::from_str(
            r#"{
                "number": "0x10",
                "transactions": [
                    {
                        "hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
                        "from": "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf",
                        "to": "0x2222222222222222222222222222222222222222",
                        "nonce": "0x0"
                    },
                    {
                        "hash": "0x3333333333333333333333333333333333333333333333333333333333333333",
                        "from": "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf",
                        "to": null,
                        "nonce": "0x2"
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(block.number.to::<u64>(), 0x10);
        assert!(!block.transactions[0].is_creation());
        assert!(block.transactions[1].is_creation());

        let sender = block.transactions[1].from;
        assert_eq!(
            block.transactions[1].created_contract_address(),
            sender.create(2)
        );
    }
}
