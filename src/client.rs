use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use stellar_xdr::curr::ScVal;

use crate::assembled::{self, AssembledTransaction, TxOptions, DEFAULT_TRANSACTION_FEES};
use crate::rpc;
use crate::signer::Signer;
use crate::spec::{self, ContractSpec};

/// Default bound for both the transaction validity window and the
/// submission poll budget.
pub const DEFAULT_TIMEOUT_IN_SECONDS: u64 = 30;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Rpc(#[from] rpc::Error),
    #[error(transparent)]
    Spec(#[from] spec::Error),
    #[error(transparent)]
    Assembled(#[from] assembled::Error),
}

/// Configuration for one client instance.
#[derive(Clone)]
pub struct ClientOptions {
    /// Endpoint of the JSON-RPC service.
    pub rpc_url: String,
    /// The contract every invocation targets.
    pub contract_id: stellar_strkey::Contract,
    /// Network identification string mixed into every signature preimage.
    pub network_passphrase: String,
    /// Permit non-TLS endpoints. Off unless you are talking to a local
    /// quickstart node.
    pub allow_http: bool,
    /// Default source/invoker account for simulations and envelope signing.
    /// Without one, simulations run as a placeholder account and only read
    /// calls will work.
    pub public_key: Option<String>,
    /// Signing capability used for envelopes and auth entries, unless a
    /// call-level signer overrides it.
    pub signer: Option<Arc<dyn Signer>>,
}

/// Per-invocation overrides.
#[derive(Clone, Debug)]
pub struct MethodOptions {
    /// Inclusion fee in stroops; the platform minimum when absent.
    pub fee: Option<u32>,
    pub timeout_in_seconds: u64,
    /// Whether to run the initial simulation as part of building.
    pub simulate: bool,
}

impl Default for MethodOptions {
    fn default() -> Self {
        Self {
            fee: None,
            timeout_in_seconds: DEFAULT_TIMEOUT_IN_SECONDS,
            simulate: true,
        }
    }
}

/// A typed façade over one deployed contract: every function the spec
/// declares can be invoked by name, yielding an [`AssembledTransaction`]
/// ready to read from, sign, or ship to co-signers.
pub struct ContractClient {
    pub spec: ContractSpec,
    options: ClientOptions,
    client: rpc::Client,
    error_types: HashMap<u32, String>,
}

impl ContractClient {
    pub fn new(spec: ContractSpec, options: ClientOptions) -> Result<Self, Error> {
        let client = rpc::Client::new(&options.rpc_url, options.allow_http)?;
        let error_types = spec.error_cases().into_iter().collect();
        Ok(Self {
            spec,
            options,
            client,
            error_types,
        })
    }

    /// Builds a client from a compiled contract, reading the spec out of the
    /// wasm's `contractspecv0` custom section.
    pub fn from_wasm(wasm: &[u8], options: ClientOptions) -> Result<Self, Error> {
        Self::new(ContractSpec::from_wasm(wasm)?, options)
    }

    /// Builds a client by fetching the deployed contract's wasm from the
    /// chain: contract-data entry → wasm hash → code entry → spec section.
    /// The configured network passphrase is checked against the server
    /// first, so a mis-pointed rpc url fails fast.
    pub async fn from(options: ClientOptions) -> Result<Self, Error> {
        let client = rpc::Client::new(&options.rpc_url, options.allow_http)?;
        client
            .verify_network_passphrase(Some(&options.network_passphrase))
            .await?;
        let wasm = client.get_remote_wasm(&options.contract_id).await?;
        Self::from_wasm(&wasm, options)
    }

    /// Invokes a contract function by name. `args` is a json object keyed by
    /// parameter name (or `None` for functions that take none); the returned
    /// transaction has already been simulated unless the options say
    /// otherwise.
    pub async fn invoke(
        &self,
        method: &str,
        args: Option<&Value>,
        options: MethodOptions,
    ) -> Result<AssembledTransaction, Error> {
        let args_value = args.cloned().unwrap_or(Value::Null);
        let scvals = self.spec.func_args_to_scvals(method, &args_value)?;
        Ok(AssembledTransaction::build(self.tx_options(method, scvals, &options)).await?)
    }

    /// Rehydrates an [`AssembledTransaction`] from its json interchange
    /// form, rebinding it to this client's spec and result parsing.
    pub fn tx_from_json(&self, json: &str) -> Result<AssembledTransaction, Error> {
        let method = AssembledTransaction::json_method(json)?;
        let options = self.tx_options(&method, Vec::new(), &MethodOptions::default());
        Ok(AssembledTransaction::from_json(options, json)?)
    }

    fn tx_options(&self, method: &str, args: Vec<ScVal>, options: &MethodOptions) -> TxOptions {
        TxOptions {
            client: self.client.clone(),
            network_passphrase: self.options.network_passphrase.clone(),
            contract_id: self.options.contract_id.clone(),
            method: method.to_string(),
            args,
            spec: self.spec.clone(),
            signer: self.options.signer.clone(),
            public_key: self.options.public_key.clone(),
            fee: options.fee.unwrap_or(DEFAULT_TRANSACTION_FEES),
            timeout_in_seconds: options.timeout_in_seconds,
            simulate: options.simulate,
            error_types: self.error_types.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};
    use stellar_xdr::curr::{
        HostFunction, InvokeHostFunctionOp, MuxedAccount, Operation, OperationBody,
        Preconditions, ScSpecEntry, ScSpecFunctionInputV0, ScSpecFunctionV0, ScSpecTypeDef,
        ScSpecTypeVec, ScSpecUdtErrorEnumCaseV0, ScSpecUdtErrorEnumV0, ScSymbol, TimeBounds,
        Uint256,
    };

    fn test_spec() -> ContractSpec {
        ContractSpec::new(vec![
            ScSpecEntry::FunctionV0(ScSpecFunctionV0 {
                doc: Default::default(),
                name: ScSymbol("hello".try_into().unwrap()),
                inputs: vec![ScSpecFunctionInputV0 {
                    doc: Default::default(),
                    name: "to".try_into().unwrap(),
                    type_: ScSpecTypeDef::Symbol,
                }]
                .try_into()
                .unwrap(),
                outputs: vec![ScSpecTypeDef::Vec(Box::new(ScSpecTypeVec {
                    element_type: Box::new(ScSpecTypeDef::Symbol),
                }))]
                .try_into()
                .unwrap(),
            }),
            ScSpecEntry::FunctionV0(ScSpecFunctionV0 {
                doc: Default::default(),
                name: ScSymbol("inc".try_into().unwrap()),
                inputs: Default::default(),
                outputs: vec![ScSpecTypeDef::U32].try_into().unwrap(),
            }),
            ScSpecEntry::UdtErrorEnumV0(ScSpecUdtErrorEnumV0 {
                doc: Default::default(),
                lib: Default::default(),
                name: "Error".try_into().unwrap(),
                cases: vec![ScSpecUdtErrorEnumCaseV0 {
                    doc: "insufficient".try_into().unwrap(),
                    name: "InsufficientBalance".try_into().unwrap(),
                    value: 3,
                }]
                .try_into()
                .unwrap(),
            }),
        ])
    }

    fn test_client() -> ContractClient {
        ContractClient::new(
            test_spec(),
            ClientOptions {
                rpc_url: "https://rpc.example.com".to_string(),
                contract_id: stellar_strkey::Contract([7; 32]),
                network_passphrase: "Test SDF Network ; September 2015".to_string(),
                allow_http: false,
                public_key: None,
                signer: None,
            },
        )
        .unwrap()
    }

    fn unsimulated() -> MethodOptions {
        MethodOptions {
            simulate: false,
            ..Default::default()
        }
    }

    #[test]
    fn error_types_fold_spec_error_cases() {
        let client = test_client();
        assert_eq!(
            client.error_types,
            HashMap::from([(3, "insufficient".to_string())])
        );
    }

    #[tokio::test]
    async fn invoke_builds_invocation_from_spec() {
        let client = test_client();
        let txn = client
            .invoke("hello", Some(&json!({"to": "world"})), unsimulated())
            .await
            .unwrap();

        let raw = txn.raw.as_ref().unwrap();
        // placeholder source account, sequence bumped from 0
        assert_eq!(
            raw.source_account,
            MuxedAccount::Ed25519(Uint256([0; 32]))
        );
        assert_eq!(raw.seq_num.0, 1);
        assert_eq!(raw.fee, 100);

        let [Operation {
            body:
                OperationBody::InvokeHostFunction(InvokeHostFunctionOp {
                    host_function: HostFunction::InvokeContract(invocation),
                    ..
                }),
            ..
        }] = raw.operations.as_slice()
        else {
            panic!("expected a single invoke-host-function operation");
        };
        assert_eq!(invocation.function_name.to_utf8_string_lossy(), "hello");
        assert_eq!(
            invocation.args.to_vec(),
            vec![ScVal::Symbol(ScSymbol("world".try_into().unwrap()))]
        );

        // validity window starts at build time
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let Preconditions::Time(TimeBounds { max_time, .. }) = &raw.cond else {
            panic!("expected time bounds");
        };
        assert!(max_time.0 >= now + 20 && max_time.0 <= now + 40);
    }

    #[tokio::test]
    async fn every_spec_function_is_invocable() {
        let client = test_client();
        for func in client.spec.funcs() {
            let name = func.name.to_utf8_string_lossy();
            let args = if func.inputs.is_empty() {
                None
            } else {
                Some(json!({"to": "world"}))
            };
            client
                .invoke(&name, args.as_ref(), unsimulated())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn invoke_rejects_unknown_methods() {
        let client = test_client();
        match client.invoke("nope", None, unsimulated()).await {
            Err(Error::Spec(spec::Error::FunctionNotFound(name))) => assert_eq!(name, "nope"),
            Err(e) => panic!("expected FunctionNotFound, got: {e:?}"),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[tokio::test]
    async fn tx_from_json_rebinds_method() {
        let client = test_client();
        let mut txn = client
            .invoke("inc", None, unsimulated())
            .await
            .unwrap();
        // pretend the build-time simulation already happened
        txn.built = txn.raw.clone();

        let json = txn.to_json().unwrap();
        let restored = client.tx_from_json(&json).unwrap();
        assert_eq!(restored.method(), "inc");
        assert_eq!(
            restored.built().unwrap(),
            txn.built().unwrap()
        );
    }
}
