use std::time::{Duration, Instant};

use stellar_xdr::curr::{self as xdr, Limits, ReadXdr, ScVal, TransactionEnvelope};
use tokio::time::sleep;

use crate::assembled::{ContractError, NativeResult, TxOptions};
use crate::rpc::{self, GetTransactionResponse, SendTransactionResponse};
use crate::spec;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("transaction submission failed: {0}")]
    SendFailed(String),
    #[error("transaction was submitted but its outcome was never polled; only the submission acknowledgment is available")]
    SendResultOnly,
    #[error("timed out after {} poll attempts; transaction still NOT_FOUND. It may still make it into a ledger", .attempts.len())]
    TransactionStillPending {
        attempts: Vec<GetTransactionResponse>,
    },
    #[error("transaction failed: {0}")]
    TransactionFailed(String),
    #[error("xdr processing error: {0}")]
    Xdr(#[from] xdr::Error),
    #[error(transparent)]
    Rpc(#[from] rpc::Error),
    #[error(transparent)]
    Spec(#[from] spec::Error),
}

/// A transaction that has been handed to the network: the submission
/// acknowledgment plus every poll response, in order, until a terminal
/// status or the poll budget ran out.
pub struct SentTransaction {
    pub signed: TransactionEnvelope,
    pub send_transaction_response: Option<SendTransactionResponse>,
    pub get_transaction_response_all: Vec<GetTransactionResponse>,
    pub get_transaction_response: Option<GetTransactionResponse>,
    options: TxOptions,
}

impl SentTransaction {
    /// Submits the envelope and polls it to completion within the
    /// invocation's timeout budget.
    pub(crate) async fn init(
        options: TxOptions,
        signed: TransactionEnvelope,
    ) -> Result<Self, Error> {
        let mut sent = Self {
            signed,
            send_transaction_response: None,
            get_transaction_response_all: Vec::new(),
            get_transaction_response: None,
            options,
        };
        sent.send().await?;
        Ok(sent)
    }

    async fn send(&mut self) -> Result<(), Error> {
        let response = self.options.client.send_transaction(&self.signed).await?;
        let hash = response.hash.clone();
        let status = response.status.clone();
        self.send_transaction_response = Some(response);
        if status != "PENDING" {
            let detail = self
                .send_transaction_response
                .as_ref()
                .and_then(|r| serde_json::to_string(r).ok())
                .unwrap_or(status);
            return Err(Error::SendFailed(detail));
        }

        // Poll the transaction status until it is no longer NOT_FOUND or the
        // budget runs out. After attempt i, sleep min(2^i, remaining)
        // seconds; the deadline is checked after every attempt.
        let start = Instant::now();
        let deadline = start + Duration::from_secs(self.options.timeout_in_seconds);
        let mut attempt: u32 = 0;
        loop {
            let response: GetTransactionResponse =
                self.options.client.get_transaction(&hash).await?.try_into()?;
            tracing::trace!(attempt, status = %response.status, "polled transaction {hash}");
            let terminal = response.status != "NOT_FOUND";
            self.get_transaction_response_all.push(response);
            let now = Instant::now();
            if terminal || now >= deadline {
                break;
            }
            sleep(backoff_delay(attempt, deadline - now)).await;
            attempt += 1;
        }
        self.get_transaction_response = self.get_transaction_response_all.last().cloned();

        if let Some(last) = &self.get_transaction_response {
            if last.status == "NOT_FOUND" {
                tracing::error!(
                    "transaction {hash} still NOT_FOUND after {} attempts",
                    self.get_transaction_response_all.len()
                );
                return Err(Error::TransactionStillPending {
                    attempts: self.get_transaction_response_all.clone(),
                });
            }
        }
        Ok(())
    }

    /// The invocation's parsed return value, or the ladder of failures that
    /// explains why there is none.
    pub fn result(&self) -> Result<NativeResult, Error> {
        if let Some(response) = &self.get_transaction_response {
            if let Some(retval) = response.return_value() {
                if let ScVal::Error(xdr::ScError::Contract(code)) = &retval {
                    if let Some(message) = self.options.error_types.get(code) {
                        return Ok(Err(ContractError {
                            code: *code,
                            message: message.clone(),
                        }));
                    }
                }
                let native = self
                    .options
                    .spec
                    .func_res_to_native(&self.options.method, &retval)?;
                return Ok(Ok(native));
            }
            return Err(Error::TransactionFailed(format!(
                "no return value; transaction status was {}",
                response.status
            )));
        }
        if let Some(response) = &self.send_transaction_response {
            if let Some(error_xdr) = &response.error_result_xdr {
                let decoded = xdr::TransactionResult::from_xdr_base64(error_xdr, Limits::none())?;
                return Err(Error::SendFailed(format!("{decoded:?}")));
            }
            return Err(Error::SendResultOnly);
        }
        Err(Error::TransactionFailed(
            "transaction was never submitted".to_string(),
        ))
    }
}

/// Sleep before the next poll: 2^attempt seconds, never past the remaining
/// budget.
fn backoff_delay(attempt: u32, remaining: Duration) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt)).min(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_clamped() {
        let remaining = Duration::from_secs(10);
        assert_eq!(backoff_delay(0, remaining), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, remaining), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, remaining), Duration::from_secs(4));
        assert_eq!(backoff_delay(3, remaining), Duration::from_secs(8));
        // 2^4 = 16 exceeds the budget; clamp to what is left
        assert_eq!(backoff_delay(4, remaining), Duration::from_secs(10));
        // pathological attempt counts must not overflow
        assert_eq!(backoff_delay(200, remaining), Duration::from_secs(10));
    }

    #[test]
    fn backoff_never_exceeds_remaining() {
        let remaining = Duration::from_millis(1500);
        assert_eq!(backoff_delay(0, remaining), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, remaining), remaining);
    }
}
