use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};
use stellar_xdr::curr::{
    self as xdr, AccountId, Hash, InvokeContractArgs, InvokeHostFunctionOp, Limits, Memo,
    MuxedAccount, Operation, OperationBody, Preconditions, PublicKey, ReadXdr, ScAddress,
    ScSymbol, ScVal, SequenceNumber, SorobanAuthorizationEntry, SorobanCredentials,
    SorobanTransactionData, TimeBounds, TimePoint, Transaction, TransactionEnvelope,
    TransactionExt, TransactionV1Envelope, Uint256, VecM, WriteXdr,
};

use crate::rpc::{self, SimulateHostFunctionResult, SimulateTransactionResponse};
use crate::sent::{self, SentTransaction};
use crate::signer::{self, authorize_entry, Signer};
use crate::spec;

/// Placeholder source account for simulating read calls when no real
/// account is available: the all-zero ed25519 key, used with sequence 0.
pub const NULL_ACCOUNT: &str = "GAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAWHF";

pub(crate) const DEFAULT_TRANSACTION_FEES: u32 = 100;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("transaction has not yet been built")]
    NotYetBuilt,
    #[error("transaction has not yet been simulated")]
    NotYetSimulated,
    #[error("transaction has not yet been signed")]
    NotYetSigned,
    #[error("simulation found expired ledger entries, which need to be restored before the call can succeed: {0}")]
    ExpiredState(String),
    #[error("transaction simulation failed: {0}")]
    SimulationFailed(String),
    #[error("simulation used the placeholder source account, which this rpc rejected: {0}; provide a public_key to simulate as a funded account")]
    FakeAccount(String),
    #[error("no signature needed: {0}")]
    NoSignatureNeeded(String),
    #[error("a signer is required for this operation but none was provided")]
    NoSigner,
    #[error("no public key to sign auth entries for")]
    NoPublicKey,
    #[error("transaction requires signatures from {0:?} before it can be signed and sent")]
    NeedsMoreSignatures(Vec<String>),
    #[error("no unsigned non-invoker auth entries to sign")]
    NoUnsignedNonInvokerAuthEntries,
    #[error("unexpected ({length}) simulate transaction result length")]
    UnexpectedSimulateTransactionResultSize { length: usize },
    #[error("unexpected ({count}) number of operations, expected exactly one")]
    UnexpectedOperationCount { count: usize },
    #[error("expected an invoke-host-function operation")]
    UnsupportedOperationType,
    #[error("only transaction v1 envelopes are supported")]
    UnsupportedEnvelopeType,
    #[error("function name {0} is too long")]
    FunctionNameTooLong(String),
    #[error("Fee was too large {0}")]
    LargeFee(u64),
    #[error("xdr processing error: {0}")]
    Xdr(#[from] xdr::Error),
    #[error(transparent)]
    InvalidAddress(#[from] stellar_strkey::DecodeError),
    #[error(transparent)]
    Rpc(#[from] rpc::Error),
    #[error(transparent)]
    Spec(#[from] spec::Error),
    #[error(transparent)]
    Signer(#[from] signer::Error),
    #[error(transparent)]
    Sent(#[from] sent::Error),
    #[error("json decoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// An error the contract itself declared, translated through the spec's
/// error cases. Returned as a tagged value, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractError {
    pub code: u32,
    pub message: String,
}

impl std::fmt::Display for ContractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Error(Contract, #{}): {}", self.code, self.message)
    }
}

/// The parsed outcome of a contract invocation: either the native return
/// value, or the contract's own declared error.
pub type NativeResult = Result<serde_json::Value, ContractError>;

/// The frozen context of one method invocation, shared by the assembled and
/// sent halves of the lifecycle.
#[derive(Clone)]
pub(crate) struct TxOptions {
    pub client: rpc::Client,
    pub network_passphrase: String,
    pub contract_id: stellar_strkey::Contract,
    pub method: String,
    pub args: Vec<ScVal>,
    pub spec: spec::ContractSpec,
    pub signer: Option<Arc<dyn Signer>>,
    pub public_key: Option<String>,
    pub fee: u32,
    pub timeout_in_seconds: u64,
    pub simulate: bool,
    pub error_types: HashMap<u32, String>,
}

#[derive(Default)]
pub struct SignOptions {
    /// Sign even when the simulation says this is a read call.
    pub force: bool,
    /// Overrides the client-level signer for this call.
    pub signer: Option<Arc<dyn Signer>>,
}

#[derive(Default)]
pub struct AuthorizeOptions {
    /// Ledger sequence until which the entry signatures stay valid. Defaults
    /// to the live-until ledger of the contract's persistent storage.
    pub expiration: Option<u32>,
    pub signer: Option<Arc<dyn Signer>>,
    /// The account to sign entries for. Defaults to the client-level
    /// public key.
    pub public_key: Option<String>,
}

/// A transaction that has been built for a contract method call and is being
/// walked through simulate → sign → send.
///
/// For read calls, [`Self::result`] is available right after the build-time
/// simulation with no signing at all. Write calls go through
/// [`Self::sign_and_send`], or through serialisation
/// ([`Self::to_json`]) to collect auth-entry signatures from other parties
/// first.
pub struct AssembledTransaction {
    pub(crate) options: TxOptions,
    pub(crate) raw: Option<Transaction>,
    pub(crate) built: Option<Transaction>,
    pub(crate) simulation: Option<SimulateTransactionResponse>,
    pub(crate) simulation_result: Option<SimulateHostFunctionResult>,
    pub(crate) simulation_transaction_data: Option<SorobanTransactionData>,
    pub(crate) signed: Option<TransactionEnvelope>,
}

impl AssembledTransaction {
    pub(crate) async fn build(options: TxOptions) -> Result<Self, Error> {
        let (source_account, seq_num) = match &options.public_key {
            Some(address) => {
                let account = options.client.get_account(address).await?;
                let key = stellar_strkey::ed25519::PublicKey::from_string(address)?;
                (MuxedAccount::Ed25519(Uint256(key.0)), account.seq_num.0 + 1)
            }
            None => {
                let key = stellar_strkey::ed25519::PublicKey::from_string(NULL_ACCOUNT)?;
                (MuxedAccount::Ed25519(Uint256(key.0)), 1)
            }
        };
        let raw = build_invoke_tx(&options, source_account, seq_num)?;
        let mut txn = Self {
            options,
            raw: Some(raw),
            built: None,
            simulation: None,
            simulation_result: None,
            simulation_transaction_data: None,
            signed: None,
        };
        if txn.options.simulate {
            txn.simulate().await?;
        }
        Ok(txn)
    }

    /// Runs (or re-runs) the simulation and, when it succeeds, assembles the
    /// simulated fees, footprint and auth entries into the transaction.
    ///
    /// Simulation errors and restore preambles are not raised here; they
    /// surface when the simulation data is actually used.
    pub async fn simulate(&mut self) -> Result<(), Error> {
        let tx = self
            .raw
            .as_ref()
            .or(self.built.as_ref())
            .cloned()
            .ok_or(Error::NotYetBuilt)?;
        let response = self
            .options
            .client
            .simulate_transaction(&unsigned_envelope(&tx))
            .await?;
        tracing::trace!("{response:#?}");
        // built holds the assembled transaction on success, the plain one
        // otherwise; errors and restore preambles surface from
        // simulation_data
        self.built = if response.error.is_none() && response.restore_preamble.is_none() {
            Some(assemble(&tx, &response)?)
        } else {
            Some(tx)
        };
        // a fresh simulation invalidates the cache and any prior signature
        self.simulation_result = None;
        self.simulation_transaction_data = None;
        self.signed = None;
        self.simulation = Some(response);
        Ok(())
    }

    /// The two serialisable extracts of the simulation. Memoised: the first
    /// live access writes through to the cache, and deserialised
    /// transactions read from the cache alone.
    pub fn simulation_data(
        &mut self,
    ) -> Result<(SimulateHostFunctionResult, SorobanTransactionData), Error> {
        if let (Some(result), Some(data)) = (
            &self.simulation_result,
            &self.simulation_transaction_data,
        ) {
            return Ok((result.clone(), data.clone()));
        }
        let simulation = self.simulation.as_ref().ok_or(Error::NotYetSimulated)?;
        if let Some(restore) = &simulation.restore_preamble {
            return Err(Error::ExpiredState(serde_json::to_string(restore)?));
        }
        if let Some(error) = &simulation.error {
            if self.options.public_key.is_none() && contract_error_code(error).is_none() {
                return Err(Error::FakeAccount(error.clone()));
            }
            return Err(Error::SimulationFailed(error.clone()));
        }
        let results = simulation.results()?;
        if results.len() != 1 {
            return Err(Error::UnexpectedSimulateTransactionResultSize {
                length: results.len(),
            });
        }
        let data = simulation.transaction_data()?;
        let result = results
            .into_iter()
            .next()
            .ok_or(Error::UnexpectedSimulateTransactionResultSize { length: 0 })?;
        self.simulation_result = Some(result.clone());
        self.simulation_transaction_data = Some(data.clone());
        Ok((result, data))
    }

    /// The simulated return value, parsed to a native json value.
    ///
    /// Errors the contract itself declares come back as the inner
    /// `Err(ContractError)` rather than being raised, so callers keep their
    /// pattern-match discipline. Everything else propagates.
    pub fn result(&mut self) -> Result<NativeResult, Error> {
        let (result, _) = match self.simulation_data() {
            Ok(data) => data,
            Err(Error::SimulationFailed(message)) => {
                if let Some(err) = self.lookup_contract_error(&message) {
                    return Ok(Err(err));
                }
                return Err(Error::SimulationFailed(message));
            }
            Err(e) => return Err(e),
        };
        if let ScVal::Error(xdr::ScError::Contract(code)) = &result.retval {
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
            .func_res_to_native(&self.options.method, &result.retval)?;
        Ok(Ok(native))
    }

    fn lookup_contract_error(&self, message: &str) -> Option<ContractError> {
        let code = contract_error_code(message)?;
        let message = self.options.error_types.get(&code)?.clone();
        Some(ContractError { code, message })
    }

    /// True when the simulation required no authorization and the footprint
    /// writes nothing, meaning the call can be answered from the simulation
    /// alone.
    pub fn is_read_call(&mut self) -> Result<bool, Error> {
        let (result, data) = self.simulation_data()?;
        Ok(result.auth.is_empty() && data.resources.footprint.read_write.is_empty())
    }

    /// The accounts (first-occurrence order, deduplicated) that still have
    /// to sign authorization entries before the envelope can be signed.
    /// Entries with source credentials are covered by the envelope signature
    /// and never show up here.
    pub fn needs_non_invoker_signing_by(
        &self,
        include_already_signed: bool,
    ) -> Result<Vec<String>, Error> {
        let built = self.built.as_ref().ok_or(Error::NotYetSimulated)?;
        let auth = invocation_auth(built)?;
        Ok(auth
            .iter()
            .filter_map(|entry| match &entry.credentials {
                SorobanCredentials::Address(credentials)
                    if include_already_signed || credentials.signature == ScVal::Void =>
                {
                    Some(address_to_string(&credentials.address))
                }
                _ => None,
            })
            .unique()
            .collect())
    }

    /// Signs every unsigned auth entry belonging to `public_key`, splicing
    /// the signatures into the transaction in place. The simulation is not
    /// re-run: it already sized fees for entries of the signed shape.
    pub async fn sign_auth_entries(&mut self, options: AuthorizeOptions) -> Result<(), Error> {
        let public_key = options
            .public_key
            .or_else(|| self.options.public_key.clone())
            .ok_or(Error::NoPublicKey)?;
        let signer = options
            .signer
            .or_else(|| self.options.signer.clone())
            .ok_or(Error::NoSigner)?;
        let needed = self.needs_non_invoker_signing_by(false)?;
        if needed.is_empty() {
            return Err(Error::NoUnsignedNonInvokerAuthEntries);
        }
        if !needed.contains(&public_key) {
            return Err(Error::NoSignatureNeeded(format!(
                "no unsigned auth entries for {public_key}"
            )));
        }
        let expiration = match options.expiration {
            Some(ledger) => ledger,
            None => {
                self.options
                    .client
                    .get_storage_expiration(&self.options.contract_id)
                    .await?
            }
        };
        let key = stellar_strkey::ed25519::PublicKey::from_string(&public_key)?;

        let mut tx = self.built.clone().ok_or(Error::NotYetSimulated)?;
        let mut op = match tx.operations.as_slice() {
            [op @ Operation {
                body: OperationBody::InvokeHostFunction(_),
                ..
            }] => op.clone(),
            [_] => return Err(Error::UnsupportedOperationType),
            ops => {
                return Err(Error::UnexpectedOperationCount { count: ops.len() });
            }
        };
        let Operation {
            body: OperationBody::InvokeHostFunction(ref mut body),
            ..
        } = op
        else {
            return Err(Error::UnsupportedOperationType);
        };

        let mut signed_auths = Vec::with_capacity(body.auth.len());
        for raw_auth in body.auth.iter() {
            let matches = match &raw_auth.credentials {
                SorobanCredentials::Address(credentials) => {
                    address_to_string(&credentials.address) == public_key
                }
                _ => false,
            };
            if matches {
                // signers are invoked strictly one at a time
                signed_auths.push(
                    authorize_entry(
                        raw_auth,
                        signer.as_ref(),
                        &key,
                        expiration,
                        &self.options.network_passphrase,
                    )
                    .await?,
                );
            } else {
                signed_auths.push(raw_auth.clone());
            }
        }
        body.auth = signed_auths.try_into()?;
        tx.operations = vec![op].try_into()?;
        self.built = Some(tx);
        tracing::trace!("signed auth entries for {public_key}, expiring at ledger {expiration}");
        Ok(())
    }

    /// Signs the transaction envelope. Fails when the call is a read call
    /// (unless forced), when no signer is available, or while co-signers
    /// still owe auth-entry signatures.
    ///
    /// The envelope's validity window is refreshed to `now +
    /// timeout_in_seconds` at this point, so slow multi-party flows do not
    /// produce already-expired envelopes.
    pub async fn sign(&mut self, options: SignOptions) -> Result<(), Error> {
        let mut tx = self.built.clone().ok_or(Error::NotYetSimulated)?;
        if !options.force && self.is_read_call()? {
            return Err(Error::NoSignatureNeeded(
                "this is a read call; its result is available without signing or sending. \
                 Set force to sign and send anyway"
                    .to_string(),
            ));
        }
        let signer = options
            .signer
            .or_else(|| self.options.signer.clone())
            .ok_or(Error::NoSigner)?;
        let needed = self.needs_non_invoker_signing_by(false)?;
        if !needed.is_empty() {
            return Err(Error::NeedsMoreSignatures(needed));
        }
        tx.cond = timeout_preconditions(self.options.timeout_in_seconds);
        let signed = signer
            .sign_transaction(&tx, &self.options.network_passphrase)
            .await?;
        self.built = Some(tx);
        self.signed = Some(signed);
        Ok(())
    }

    /// Submits the signed envelope and polls it to a terminal status.
    pub async fn send(&self) -> Result<SentTransaction, Error> {
        let signed = self.signed.clone().ok_or(Error::NotYetSigned)?;
        Ok(SentTransaction::init(self.options.clone(), signed).await?)
    }

    pub async fn sign_and_send(&mut self, options: SignOptions) -> Result<SentTransaction, Error> {
        if self.signed.is_none() {
            self.sign(options).await?;
        }
        self.send().await
    }

    pub fn built(&self) -> Option<&Transaction> {
        self.built.as_ref()
    }

    pub fn signed(&self) -> Option<&TransactionEnvelope> {
        self.signed.as_ref()
    }

    pub fn method(&self) -> &str {
        &self.options.method
    }

    /// The interchange form for multi-party signing flows: the built
    /// transaction plus the serialisable simulation extracts, all base64
    /// XDR inside a small json wrapper.
    pub fn to_json(&mut self) -> Result<String, Error> {
        let tx = {
            let built = self.built.as_ref().ok_or(Error::NotYetSimulated)?;
            unsigned_envelope(built).to_xdr_base64(Limits::none())?
        };
        let (simulation_result, simulation_transaction_data) = match self.simulation_data() {
            Ok((result, data)) => {
                let auth = result
                    .auth
                    .iter()
                    .map(|a| a.to_xdr_base64(Limits::none()))
                    .collect::<Result<Vec<_>, _>>()?;
                (
                    Some(SimulationResultJson {
                        auth,
                        retval: result.retval.to_xdr_base64(Limits::none())?,
                    }),
                    Some(data.to_xdr_base64(Limits::none())?),
                )
            }
            Err(Error::NotYetSimulated) => (None, None),
            Err(e) => return Err(e),
        };
        Ok(serde_json::to_string(&AssembledJson {
            method: self.options.method.clone(),
            tx,
            simulation_result,
            simulation_transaction_data,
        })?)
    }

    pub(crate) fn from_json(options: TxOptions, json: &str) -> Result<Self, Error> {
        let parsed: AssembledJson = serde_json::from_str(json)?;
        let envelope = TransactionEnvelope::from_xdr_base64(&parsed.tx, Limits::none())?;
        let TransactionEnvelope::Tx(TransactionV1Envelope { tx, .. }) = envelope else {
            return Err(Error::UnsupportedEnvelopeType);
        };
        let simulation_result = parsed
            .simulation_result
            .map(|r| -> Result<_, Error> {
                Ok(SimulateHostFunctionResult {
                    auth: r
                        .auth
                        .iter()
                        .map(|a| SorobanAuthorizationEntry::from_xdr_base64(a, Limits::none()))
                        .collect::<Result<Vec<_>, _>>()?,
                    retval: ScVal::from_xdr_base64(&r.retval, Limits::none())?,
                })
            })
            .transpose()?;
        let simulation_transaction_data = parsed
            .simulation_transaction_data
            .map(|d| SorobanTransactionData::from_xdr_base64(&d, Limits::none()))
            .transpose()?;
        Ok(Self {
            options,
            raw: None,
            built: Some(tx),
            simulation: None,
            simulation_result,
            simulation_transaction_data,
            signed: None,
        })
    }

    pub(crate) fn json_method(json: &str) -> Result<String, Error> {
        let parsed: AssembledJson = serde_json::from_str(json)?;
        Ok(parsed.method)
    }
}

#[derive(Serialize, Deserialize)]
struct AssembledJson {
    method: String,
    tx: String,
    #[serde(
        rename = "simulationResult",
        skip_serializing_if = "Option::is_none",
        default
    )]
    simulation_result: Option<SimulationResultJson>,
    #[serde(
        rename = "simulationTransactionData",
        skip_serializing_if = "Option::is_none",
        default
    )]
    simulation_transaction_data: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct SimulationResultJson {
    auth: Vec<String>,
    retval: String,
}

// Apply the result of a simulateTransaction onto the transaction, preparing
// it for signing and submission: simulated auth entries (when the tx carried
// none), the resource footprint, and a fee covering the inclusion fee plus
// the simulated resource fee.
pub(crate) fn assemble(
    raw: &Transaction,
    simulation: &SimulateTransactionResponse,
) -> Result<Transaction, Error> {
    let mut tx = raw.clone();

    if tx.operations.len() != 1 {
        return Err(Error::UnexpectedOperationCount {
            count: tx.operations.len(),
        });
    }

    let transaction_data = simulation.transaction_data()?;

    let mut op = tx.operations[0].clone();
    if let OperationBody::InvokeHostFunction(ref mut body) = &mut op.body {
        if body.auth.is_empty() {
            if simulation.results.len() != 1 {
                return Err(Error::UnexpectedSimulateTransactionResultSize {
                    length: simulation.results.len(),
                });
            }

            let auths = simulation
                .results
                .iter()
                .map(|r| {
                    VecM::try_from(
                        r.auth
                            .iter()
                            .map(|v| SorobanAuthorizationEntry::from_xdr_base64(v, Limits::none()))
                            .collect::<Result<Vec<_>, _>>()?,
                    )
                })
                .collect::<Result<Vec<_>, _>>()?;
            if !auths.is_empty() {
                body.auth = auths[0].clone();
            }
        }
    }

    // Choose larger of existing fee or inclusion + resource fee.
    let classic_tx_fee: u64 = DEFAULT_TRANSACTION_FEES.into();
    tx.fee = tx.fee.max(
        u32::try_from(classic_tx_fee + simulation.min_resource_fee)
            .map_err(|_| Error::LargeFee(simulation.min_resource_fee + classic_tx_fee))?,
    );

    tx.operations = vec![op].try_into()?;
    tx.ext = TransactionExt::V1(transaction_data);
    Ok(tx)
}

fn build_invoke_tx(
    options: &TxOptions,
    source_account: MuxedAccount,
    seq_num: i64,
) -> Result<Transaction, Error> {
    let op = Operation {
        source_account: None,
        body: OperationBody::InvokeHostFunction(InvokeHostFunctionOp {
            host_function: xdr::HostFunction::InvokeContract(InvokeContractArgs {
                contract_address: ScAddress::Contract(Hash(options.contract_id.0)),
                function_name: ScSymbol(
                    options
                        .method
                        .as_str()
                        .try_into()
                        .map_err(|_| Error::FunctionNameTooLong(options.method.clone()))?,
                ),
                args: options.args.clone().try_into()?,
            }),
            auth: VecM::default(),
        }),
    };
    Ok(Transaction {
        source_account,
        fee: options.fee,
        seq_num: SequenceNumber(seq_num),
        cond: timeout_preconditions(options.timeout_in_seconds),
        memo: Memo::None,
        operations: vec![op].try_into()?,
        ext: TransactionExt::V0,
    })
}

fn timeout_preconditions(timeout_in_seconds: u64) -> Preconditions {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    Preconditions::Time(TimeBounds {
        min_time: TimePoint(0),
        max_time: TimePoint(now + timeout_in_seconds),
    })
}

pub(crate) fn unsigned_envelope(tx: &Transaction) -> TransactionEnvelope {
    TransactionEnvelope::Tx(TransactionV1Envelope {
        tx: tx.clone(),
        signatures: VecM::default(),
    })
}

fn invocation_auth(txn: &Transaction) -> Result<&VecM<SorobanAuthorizationEntry>, Error> {
    match txn.operations.as_slice() {
        [Operation {
            body: OperationBody::InvokeHostFunction(InvokeHostFunctionOp { auth, .. }),
            ..
        }] => Ok(auth),
        [_] => Err(Error::UnsupportedOperationType),
        ops => Err(Error::UnexpectedOperationCount { count: ops.len() }),
    }
}

fn address_to_string(address: &ScAddress) -> String {
    match address {
        ScAddress::Account(AccountId(PublicKey::PublicKeyTypeEd25519(Uint256(key)))) => {
            stellar_strkey::ed25519::PublicKey(*key).to_string()
        }
        ScAddress::Contract(Hash(hash)) => stellar_strkey::Contract(*hash).to_string(),
    }
}

pub(crate) fn contract_error_code(message: &str) -> Option<u32> {
    let re = Regex::new(r"Error\(Contract, #(\d+)\)").ok()?;
    re.captures(message)?.get(1)?.as_str().parse().ok()
}
