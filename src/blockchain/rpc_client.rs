// src/blockchain/rpc_client.rs
//! JSON-RPC ledger client.
//!
//! Implements [`Ledger`] on top of an ethers HTTP provider and a local signing
//! wallet. Every provider failure is translated into a tagged [`UpstreamError`]
//! here, at the boundary, so nothing downstream inspects provider error text.

use crate::blockchain::ledger::{Ledger, LedgerCall, StateQuery, StateValue, TxReceipt};
use crate::clients::http::transport_failure;
use crate::errors::classifier::{ContractTarget, Upstream, UpstreamError, UpstreamFailure};
use async_trait::async_trait;
use ethers::abi::{decode, encode, ParamType, Token};
use ethers::middleware::signer::SignerMiddlewareError;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, JsonRpcError, Middleware, Provider, ProviderError, RpcError};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, TransactionRequest, H256, U64};
use ethers::utils::{hex, id};
use std::future::Future;
use std::time::Duration;

/// Selector of Solidity's `Error(string)` revert payload.
const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// Ledger client for the subject registry contract.
///
/// This client provides:
/// - Transaction submission signed by the gateway wallet
/// - Contract state reads
/// - Receipt lookup
#[derive(Clone)]
pub struct RpcLedger {
    provider: Provider<Http>,
    client: SignerMiddleware<Provider<Http>, LocalWallet>,
    registry: Address,
    call_timeout: Duration,
}

impl RpcLedger {
    /// Connects to an RPC endpoint and binds the wallet to the node's chain id.
    ///
    /// # Errors
    /// Returns a classified-ready `UpstreamError` if the URL is invalid or the
    /// node cannot be reached within `call_timeout`.
    pub async fn connect(
        rpc_url: &str,
        wallet: LocalWallet,
        registry: Address,
        call_timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let provider = Provider::<Http>::try_from(rpc_url).map_err(|e| {
            UpstreamError::new(Upstream::Ledger, UpstreamFailure::Unknown(e.to_string()))
        })?;
        let chain_id = with_timeout(call_timeout, async {
            provider
                .get_chainid()
                .await
                .map_err(|e| map_provider_error(&e, None))
        })
        .await?
        .as_u64();

        let wallet = wallet.with_chain_id(chain_id);
        let client = SignerMiddleware::new(provider.clone(), wallet);
        log::info!("connected to ledger chain {} (registry {:?})", chain_id, registry);

        Ok(RpcLedger {
            provider,
            client,
            registry,
            call_timeout,
        })
    }

    fn call_data(call: &LedgerCall) -> Bytes {
        match call {
            LedgerCall::RegisterSubject { subject, guardian } => encode_call(
                "registerPet(string,address)",
                &[Token::String(subject.clone()), Token::Address(*guardian)],
            ),
            LedgerCall::ChangeGuardian {
                subject,
                new_guardian,
            } => encode_call(
                "changeGuardian(string,address)",
                &[Token::String(subject.clone()), Token::Address(*new_guardian)],
            ),
        }
    }

    async fn view(&self, data: Bytes, target: ContractTarget) -> Result<Bytes, UpstreamError> {
        let tx = TransactionRequest::new().to(self.registry).data(data);
        with_timeout(self.call_timeout, async {
            self.provider
                .call(&tx.into(), None)
                .await
                .map_err(|e| map_provider_error(&e, Some(target)))
        })
        .await
    }
}

#[async_trait]
impl Ledger for RpcLedger {
    async fn submit_transaction(&self, call: LedgerCall) -> Result<H256, UpstreamError> {
        let target = call.target();
        let tx = TransactionRequest::new()
            .to(self.registry)
            .data(Self::call_data(&call));
        with_timeout(self.call_timeout, async {
            self.client
                .send_transaction(tx, None)
                .await
                .map(|pending| pending.tx_hash())
                .map_err(|e| map_signer_error(e, target))
        })
        .await
    }

    async fn read_state(&self, query: StateQuery) -> Result<StateValue, UpstreamError> {
        match query {
            StateQuery::GuardianOf { subject } => {
                let raw = self
                    .view(
                        encode_call("getGuardian(string)", &[Token::String(subject)]),
                        ContractTarget::PetRegistry,
                    )
                    .await?;
                let address = decode_single(ParamType::Address, &raw)?
                    .into_address()
                    .filter(|a| !a.is_zero());
                Ok(StateValue::Address(address))
            }
            StateQuery::IsGuardian { address } => {
                let raw = self
                    .view(
                        encode_call("isGuardian(address)", &[Token::Address(address)]),
                        ContractTarget::GuardianRegistry,
                    )
                    .await?;
                let flag = decode_single(ParamType::Bool, &raw)?
                    .into_bool()
                    .unwrap_or(false);
                Ok(StateValue::Flag(flag))
            }
        }
    }

    async fn get_receipt(&self, tx_hash: H256) -> Result<Option<TxReceipt>, UpstreamError> {
        let receipt = with_timeout(self.call_timeout, async {
            self.provider
                .get_transaction_receipt(tx_hash)
                .await
                .map_err(|e| map_provider_error(&e, None))
        })
        .await?;
        Ok(receipt.map(|r| TxReceipt {
            tx_hash,
            success: r.status == Some(U64::from(1)),
            logs_emitted: r.logs.len(),
        }))
    }
}

/// Enforces the per-call timeout; an elapsed call is a retryable ledger timeout.
async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, UpstreamError>
where
    F: Future<Output = Result<T, UpstreamError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| UpstreamError::timeout(Upstream::Ledger))?
}

fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(encode(args));
    Bytes::from(data)
}

fn decode_single(kind: ParamType, raw: &[u8]) -> Result<Token, UpstreamError> {
    decode(&[kind], raw)
        .ok()
        .and_then(|mut tokens| tokens.pop())
        .ok_or_else(|| {
            UpstreamError::new(
                Upstream::Ledger,
                UpstreamFailure::Unknown("undecodable contract return data".into()),
            )
        })
}

fn map_signer_error(
    err: SignerMiddlewareError<Provider<Http>, LocalWallet>,
    target: ContractTarget,
) -> UpstreamError {
    match err {
        SignerMiddlewareError::MiddlewareError(inner) => map_provider_error(&inner, Some(target)),
        other => UpstreamError::new(Upstream::Ledger, UpstreamFailure::Unknown(other.to_string())),
    }
}

fn map_provider_error(err: &ProviderError, target: Option<ContractTarget>) -> UpstreamError {
    if let ProviderError::HTTPError(http) = err {
        return transport_failure(Upstream::Ledger, http);
    }
    let failure = match err.as_error_response() {
        Some(rpc) => rpc_failure(rpc, target),
        None => transport_from_text(&err.to_string()),
    };
    UpstreamError::new(Upstream::Ledger, failure)
}

/// The HTTP transport surfaces reqwest failures boxed inside the provider error,
/// so only their rendered text is reachable here.
fn transport_from_text(text: &str) -> UpstreamFailure {
    let lower = text.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        UpstreamFailure::Timeout
    } else if lower.contains("dns") || lower.contains("failed to lookup") {
        UpstreamFailure::Dns
    } else if lower.contains("connection refused") || lower.contains("tcp connect") {
        UpstreamFailure::ConnectionRefused
    } else if lower.contains("error sending request") || lower.contains("connection reset") {
        UpstreamFailure::Network(text.to_string())
    } else {
        UpstreamFailure::Unknown(text.to_string())
    }
}

/// Turns a JSON-RPC error object into a structured ledger failure.
fn rpc_failure(rpc: &JsonRpcError, target: Option<ContractTarget>) -> UpstreamFailure {
    let message = rpc.message.to_lowercase();
    if message.contains("nonce too low") {
        UpstreamFailure::NonceTooLow
    } else if message.contains("insufficient funds")
        || message.contains("intrinsic gas too low")
        || message.contains("gas required exceeds allowance")
    {
        UpstreamFailure::InsufficientFunds
    } else if rpc.code == 3 || message.contains("execution reverted") || message.contains("revert")
    {
        let reason = rpc
            .data
            .as_ref()
            .and_then(|data| data.as_str())
            .and_then(decode_revert_reason)
            .or_else(|| {
                rpc.message
                    .split_once("reverted: ")
                    .map(|(_, reason)| reason.to_string())
            });
        UpstreamFailure::Reverted {
            reason,
            logs_emitted: 0,
            target,
        }
    } else {
        UpstreamFailure::Rpc {
            code: rpc.code,
            message: rpc.message.clone(),
        }
    }
}

/// Decodes `Error(string)` revert data (`0x08c379a0...`).
fn decode_revert_reason(data: &str) -> Option<String> {
    let bytes = hex::decode(data.trim_start_matches("0x")).ok()?;
    if bytes.len() < 4 || bytes[..4] != ERROR_STRING_SELECTOR {
        return None;
    }
    decode(&[ParamType::String], &bytes[4..])
        .ok()?
        .pop()?
        .into_string()
}
