// src/blockchain/ledger.rs
//! Ledger capability consumed by the gateway.
//!
//! The registries holding DID documents, guardian profiles and role grants live
//! on-chain and are reached only through three operations: submit a transaction,
//! read contract state, and fetch a transaction receipt.

use crate::errors::classifier::{ContractTarget, Upstream, UpstreamError, UpstreamFailure};
use async_trait::async_trait;
use ethers::types::{Address, H256};
use std::time::Duration;

/// State-changing registry calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
    /// Registers `subject` with `guardian` as its custodian
    RegisterSubject { subject: String, guardian: Address },
    /// Moves custody of `subject` to `new_guardian`
    ChangeGuardian { subject: String, new_guardian: Address },
}

impl LedgerCall {
    pub fn target(&self) -> ContractTarget {
        match self {
            LedgerCall::RegisterSubject { .. } | LedgerCall::ChangeGuardian { .. } => {
                ContractTarget::PetRegistry
            }
        }
    }
}

/// Read-only registry queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateQuery {
    /// Current guardian of a subject (zero address if unregistered)
    GuardianOf { subject: String },
    /// Whether an address holds a registered guardian profile
    IsGuardian { address: Address },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateValue {
    Address(Option<Address>),
    Flag(bool),
}

/// Mined transaction summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub success: bool,
    pub logs_emitted: usize,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn submit_transaction(&self, call: LedgerCall) -> Result<H256, UpstreamError>;

    async fn read_state(&self, query: StateQuery) -> Result<StateValue, UpstreamError>;

    /// `None` while the transaction is still pending.
    async fn get_receipt(&self, tx_hash: H256) -> Result<Option<TxReceipt>, UpstreamError>;
}

/// Polls for a receipt until it is mined or `timeout` elapses.
///
/// A mined-but-failed transaction comes back as a `Reverted` failure carrying the
/// call's contract target; a receipt that never shows up is a retryable timeout.
pub async fn await_receipt(
    ledger: &dyn Ledger,
    tx_hash: H256,
    target: ContractTarget,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<TxReceipt, UpstreamError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(receipt) = ledger.get_receipt(tx_hash).await? {
            if receipt.success {
                return Ok(receipt);
            }
            return Err(UpstreamError::new(
                Upstream::Ledger,
                UpstreamFailure::Reverted {
                    reason: None,
                    logs_emitted: receipt.logs_emitted,
                    target: Some(target),
                },
            ));
        }
        if tokio::time::Instant::now() + poll_interval > deadline {
            return Err(UpstreamError::timeout(Upstream::Ledger));
        }
        tokio::time::sleep(poll_interval).await;
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeLedger;
    use super::*;
    use crate::errors::classifier::{classify, ErrorCode};

    #[tokio::test]
    async fn test_await_receipt_success() {
        let ledger = FakeLedger::default();
        let call = LedgerCall::RegisterSubject {
            subject: "pet".into(),
            guardian: Address::repeat_byte(1),
        };
        let hash = ledger.submit_transaction(call.clone()).await.unwrap();
        let receipt = await_receipt(
            &ledger,
            hash,
            call.target(),
            Duration::from_millis(1),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert!(receipt.success);
    }

    #[tokio::test]
    async fn test_await_receipt_reverted_is_classified() {
        let ledger = FakeLedger::default();
        *ledger.revert_next.lock().unwrap() = true;
        let hash = ledger
            .submit_transaction(LedgerCall::RegisterSubject {
                subject: "pet".into(),
                guardian: Address::repeat_byte(1),
            })
            .await
            .unwrap();
        let err = await_receipt(
            &ledger,
            hash,
            ContractTarget::PetRegistry,
            Duration::from_millis(1),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert_eq!(classify(&err).code, ErrorCode::InvalidTransaction);
    }

    #[tokio::test]
    async fn test_await_receipt_times_out() {
        let ledger = FakeLedger::default();
        let err = await_receipt(
            &ledger,
            H256::repeat_byte(9),
            ContractTarget::PetRegistry,
            Duration::from_millis(5),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();
        let classified = classify(&err);
        assert_eq!(classified.code, ErrorCode::LedgerTimeout);
        assert!(classified.retryable);
    }
}
