//! Payment transfer primitive.
//!
//! Errors are classified like provider errors elsewhere: some are definite
//! failures (nothing was sent), others leave the outcome unknown and must be
//! reconciled rather than retried blindly.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::money::Usdc;
use crate::wallet::WalletAddress;

#[derive(Debug, Clone, Serialize)]
pub struct TransferRequest {
    /// Same key on every attempt for the same settlement
    pub idempotency_key: String,
    pub to: WalletAddress,
    pub amount: Usdc,
    pub network: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum TransferStatus {
    Confirmed,
    Pending,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub transaction_hash: Option<String>,
    pub from_address: Option<String>,
    pub status: TransferStatus,
}

/// Error from the transfer provider.
#[derive(Debug, Clone)]
pub struct TransferError {
    pub kind: TransferErrorKind,
    /// HTTP status code, if applicable
    pub status_code: Option<u16>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferErrorKind {
    /// Connection could not be established; nothing was sent
    Unreachable,
    /// Provider refused the request (4xx); nothing was sent
    Rejected,
    /// Provider failed mid-request (5xx); the transfer may have happened
    ServerError,
    /// Request was sent but the exchange did not finish
    Interrupted,
    /// Response could not be understood
    ParseError,
}

impl TransferError {
    pub fn new(kind: TransferErrorKind, status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code,
            message: message.into(),
        }
    }

    /// Whether the transfer may have gone through despite the error.
    pub fn outcome_unknown(&self) -> bool {
        matches!(
            self.kind,
            TransferErrorKind::ServerError | TransferErrorKind::Interrupted | TransferErrorKind::ParseError
        )
    }

    /// Whether a later retry has a chance to succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self.kind, TransferErrorKind::Rejected)
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        let kind = if e.is_connect() || e.is_builder() {
            TransferErrorKind::Unreachable
        } else if e.is_decode() {
            TransferErrorKind::ParseError
        } else {
            TransferErrorKind::Interrupted
        };
        Self::new(kind, e.status().map(|s| s.as_u16()), e.to_string())
    }
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            TransferErrorKind::Unreachable => "Provider unreachable",
            TransferErrorKind::Rejected => "Transfer rejected",
            TransferErrorKind::ServerError => "Provider error",
            TransferErrorKind::Interrupted => "Transfer interrupted",
            TransferErrorKind::ParseError => "Unreadable provider response",
        };
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", kind, code, self.message),
            None => write!(f, "{}: {}", kind, self.message),
        }
    }
}

impl std::error::Error for TransferError {}

#[async_trait]
pub trait TransferClient: Send + Sync {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, TransferError>;

    /// Look up a transfer by idempotency key. `None` if the provider never
    /// saw the key.
    async fn lookup(&self, idempotency_key: &str) -> Result<Option<TransferReceipt>, TransferError>;
}

#[derive(Debug, Deserialize)]
struct GatewayReceipt {
    #[serde(default)]
    transaction_hash: Option<String>,
    #[serde(default)]
    from_address: Option<String>,
    status: String,
    #[serde(default)]
    error: Option<String>,
}

impl GatewayReceipt {
    fn into_receipt(self) -> Result<TransferReceipt, TransferError> {
        let status = match self.status.as_str() {
            "confirmed" | "completed" | "success" => TransferStatus::Confirmed,
            "pending" | "submitted" | "processing" => TransferStatus::Pending,
            "failed" | "rejected" => {
                TransferStatus::Failed(self.error.unwrap_or_else(|| "transfer failed".to_string()))
            }
            other => {
                return Err(TransferError::new(
                    TransferErrorKind::ParseError,
                    None,
                    format!("unknown transfer status '{}'", other),
                ))
            }
        };
        Ok(TransferReceipt {
            transaction_hash: self.transaction_hash,
            from_address: self.from_address,
            status,
        })
    }
}

/// HTTP payment gateway.
///
/// `POST {base}/transfers` with an `Idempotency-Key` header, and
/// `GET {base}/transfers/{key}` for lookups.
pub struct HttpTransferClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTransferClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, TransferError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransferError::new(TransferErrorKind::Unreachable, None, e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn read_receipt(response: reqwest::Response) -> Result<TransferReceipt, TransferError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let kind = if status.is_server_error() {
                TransferErrorKind::ServerError
            } else {
                TransferErrorKind::Rejected
            };
            return Err(TransferError::new(kind, Some(status.as_u16()), body));
        }
        let receipt: GatewayReceipt = response.json().await.map_err(TransferError::from_reqwest)?;
        receipt.into_receipt()
    }
}

#[async_trait]
impl TransferClient for HttpTransferClient {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, TransferError> {
        let response = self
            .authorize(self.client.post(format!("{}/transfers", self.base_url)))
            .header("Idempotency-Key", &request.idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(TransferError::from_reqwest)?;
        Self::read_receipt(response).await
    }

    async fn lookup(&self, idempotency_key: &str) -> Result<Option<TransferReceipt>, TransferError> {
        let response = self
            .authorize(
                self.client
                    .get(format!("{}/transfers/{}", self.base_url, idempotency_key)),
            )
            .send()
            .await
            .map_err(TransferError::from_reqwest)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::read_receipt(response).await.map(Some)
    }
}

/// Transfer client that moves no money. Each key yields a stable
/// pseudo-hash, and repeated keys return the original receipt.
#[derive(Default, Clone)]
pub struct DryRunTransferClient {
    seen: Arc<Mutex<HashMap<String, TransferReceipt>>>,
}

impl DryRunTransferClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn hash_for(key: &str) -> String {
        format!("0x{}", hex::encode(Sha256::digest(key.as_bytes())))
    }
}

#[async_trait]
impl TransferClient for DryRunTransferClient {
    async fn transfer(&self, request: &TransferRequest) -> Result<TransferReceipt, TransferError> {
        let mut seen = self.seen.lock().await;
        let receipt = seen
            .entry(request.idempotency_key.clone())
            .or_insert_with(|| TransferReceipt {
                transaction_hash: Some(Self::hash_for(&request.idempotency_key)),
                from_address: None,
                status: TransferStatus::Confirmed,
            })
            .clone();
        tracing::info!(
            key = %request.idempotency_key,
            to = %request.to,
            amount = %request.amount,
            network = %request.network,
            "Dry-run transfer"
        );
        Ok(receipt)
    }

    async fn lookup(&self, idempotency_key: &str) -> Result<Option<TransferReceipt>, TransferError> {
        Ok(self.seen.lock().await.get(idempotency_key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(key: &str) -> TransferRequest {
        TransferRequest {
            idempotency_key: key.to_string(),
            to: WalletAddress::parse("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").unwrap(),
            amount: Usdc::from_whole(5),
            network: "base-sepolia".to_string(),
        }
    }

    #[tokio::test]
    async fn test_dry_run_is_idempotent_per_key() {
        let client = DryRunTransferClient::new();
        let first = client.transfer(&request("settlement-1")).await.unwrap();
        let again = client.transfer(&request("settlement-1")).await.unwrap();
        let other = client.transfer(&request("settlement-2")).await.unwrap();

        assert_eq!(first.status, TransferStatus::Confirmed);
        assert_eq!(first, again);
        assert_ne!(first.transaction_hash, other.transaction_hash);
        assert_eq!(first.transaction_hash.as_ref().map(|h| h.len()), Some(66));

        assert_eq!(client.lookup("settlement-1").await.unwrap(), Some(first));
        assert_eq!(client.lookup("settlement-unknown").await.unwrap(), None);
    }

    #[test]
    fn test_error_classification() {
        let rejected = TransferError::new(TransferErrorKind::Rejected, Some(400), "bad address");
        assert!(!rejected.outcome_unknown());
        assert!(!rejected.is_transient());

        let unreachable = TransferError::new(TransferErrorKind::Unreachable, None, "refused");
        assert!(!unreachable.outcome_unknown());
        assert!(unreachable.is_transient());

        let server = TransferError::new(TransferErrorKind::ServerError, Some(502), "bad gateway");
        assert!(server.outcome_unknown());
        assert_eq!(server.to_string(), "Provider error (HTTP 502): bad gateway");
    }

    #[test]
    fn test_gateway_receipt_statuses() {
        let parse = |json: &str| {
            serde_json::from_str::<GatewayReceipt>(json)
                .unwrap()
                .into_receipt()
        };
        assert_eq!(
            parse(r#"{"status": "confirmed", "transaction_hash": "0xabc"}"#)
                .unwrap()
                .status,
            TransferStatus::Confirmed
        );
        assert_eq!(
            parse(r#"{"status": "failed", "error": "insufficient funds"}"#)
                .unwrap()
                .status,
            TransferStatus::Failed("insufficient funds".to_string())
        );
        assert!(parse(r#"{"status": "mystery"}"#).is_err());
    }
}
