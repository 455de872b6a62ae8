use async_trait::async_trait;
use ed25519_dalek::ed25519::signature::Signer as _;
use sha2::{Digest, Sha256};
use stellar_xdr::curr::{
    self as xdr, DecoratedSignature, Hash, HashIdPreimage, HashIdPreimageSorobanAuthorization,
    Limits, ScMap, ScSymbol, ScVal, Signature, SignatureHint, SorobanAddressCredentials,
    SorobanAuthorizationEntry, SorobanCredentials, Transaction, TransactionEnvelope,
    TransactionSignaturePayload, TransactionSignaturePayloadTaggedTransaction,
    TransactionV1Envelope, WriteXdr,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("xdr processing error: {0}")]
    Xdr(#[from] xdr::Error),
    #[error(transparent)]
    TryFromSlice(#[from] std::array::TryFromSliceError),
    #[error("auth entry signature must be 64 bytes, got {0}")]
    InvalidSignatureLength(usize),
    #[error("signing failed: {0}")]
    Signing(String),
}

/// A signing capability: one implementation covers both the outer
/// transaction envelope and individual authorization entries, so a caller
/// cannot wire up one and forget the other.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Signs the transaction envelope for the given network, returning the
    /// envelope with the signature attached.
    async fn sign_transaction(
        &self,
        txn: &Transaction,
        network_passphrase: &str,
    ) -> Result<TransactionEnvelope, Error>;

    /// Signs the hash of an authorization-entry preimage, returning the raw
    /// 64-byte signature.
    async fn sign_auth_entry(&self, preimage: &HashIdPreimage) -> Result<Vec<u8>, Error>;
}

/// An in-process signer over a raw ed25519 key.
pub struct LocalSigner {
    key: ed25519_dalek::SigningKey,
}

impl LocalSigner {
    pub fn new(key: ed25519_dalek::SigningKey) -> Self {
        Self { key }
    }

    pub fn public_key(&self) -> stellar_strkey::ed25519::PublicKey {
        stellar_strkey::ed25519::PublicKey(self.key.verifying_key().to_bytes())
    }

    fn sign_txn_hash(&self, txn_hash: [u8; 32]) -> Result<DecoratedSignature, Error> {
        let signature = self.key.sign(&txn_hash);
        Ok(DecoratedSignature {
            hint: SignatureHint(self.key.verifying_key().to_bytes()[28..].try_into()?),
            signature: Signature(signature.to_bytes().try_into()?),
        })
    }
}

#[async_trait]
impl Signer for LocalSigner {
    async fn sign_transaction(
        &self,
        txn: &Transaction,
        network_passphrase: &str,
    ) -> Result<TransactionEnvelope, Error> {
        let tx_hash = transaction_hash(txn, network_passphrase)?;
        tracing::trace!("signing transaction {}", hex::encode(tx_hash));
        let decorated_signature = self.sign_txn_hash(tx_hash)?;
        Ok(TransactionEnvelope::Tx(TransactionV1Envelope {
            tx: txn.clone(),
            signatures: vec![decorated_signature].try_into()?,
        }))
    }

    async fn sign_auth_entry(&self, preimage: &HashIdPreimage) -> Result<Vec<u8>, Error> {
        let payload = Sha256::digest(preimage.to_xdr(Limits::none())?);
        Ok(self.key.sign(&payload).to_bytes().to_vec())
    }
}

pub fn network_id(network_passphrase: &str) -> Hash {
    Hash(Sha256::digest(network_passphrase.as_bytes()).into())
}

/// Hash of the transaction's signature payload for the given network, the
/// thing an envelope signature actually covers.
pub fn transaction_hash(txn: &Transaction, network_passphrase: &str) -> Result<[u8; 32], Error> {
    let signature_payload = TransactionSignaturePayload {
        network_id: network_id(network_passphrase),
        tagged_transaction: TransactionSignaturePayloadTaggedTransaction::Tx(txn.clone()),
    };
    Ok(Sha256::digest(signature_payload.to_xdr(Limits::none())?).into())
}

/// Produces a signed copy of one authorization entry: builds the entry's
/// preimage, has the signer sign its hash, and splices the signed
/// credentials back in, stamped with `signature_expiration_ledger`.
///
/// Entries with source credentials are returned untouched; the envelope
/// signature covers them.
pub async fn authorize_entry(
    raw: &SorobanAuthorizationEntry,
    signer: &dyn Signer,
    public_key: &stellar_strkey::ed25519::PublicKey,
    signature_expiration_ledger: u32,
    network_passphrase: &str,
) -> Result<SorobanAuthorizationEntry, Error> {
    let mut auth = raw.clone();
    let SorobanAuthorizationEntry {
        credentials: SorobanCredentials::Address(ref mut credentials),
        ..
    } = auth
    else {
        // Doesn't need special signing
        return Ok(auth);
    };
    let SorobanAddressCredentials { nonce, .. } = credentials;

    let preimage = HashIdPreimage::SorobanAuthorization(HashIdPreimageSorobanAuthorization {
        network_id: network_id(network_passphrase),
        invocation: auth.root_invocation.clone(),
        nonce: *nonce,
        signature_expiration_ledger,
    });

    let signature = signer.sign_auth_entry(&preimage).await?;
    if signature.len() != 64 {
        return Err(Error::InvalidSignatureLength(signature.len()));
    }

    let map = ScMap::sorted_from(vec![
        (
            ScVal::Symbol(ScSymbol("public_key".try_into()?)),
            ScVal::Bytes(public_key.0.to_vec().try_into().map_err(Error::Xdr)?),
        ),
        (
            ScVal::Symbol(ScSymbol("signature".try_into()?)),
            ScVal::Bytes(signature.try_into().map_err(Error::Xdr)?),
        ),
    ])
    .map_err(Error::Xdr)?;
    credentials.signature = ScVal::Vec(Some(
        vec![ScVal::Map(Some(map))].try_into().map_err(Error::Xdr)?,
    ));
    credentials.signature_expiration_ledger = signature_expiration_ledger;
    Ok(auth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stellar_xdr::curr::{
        AccountId, Hash, InvokeContractArgs, Memo, MuxedAccount, Operation, OperationBody,
        Preconditions, PublicKey, ScAddress, SequenceNumber, SorobanAuthorizedFunction,
        SorobanAuthorizedInvocation, TransactionExt, Uint256, VecM,
    };

    const PASSPHRASE: &str = "Test SDF Network ; September 2015";

    fn test_signer(seed: u8) -> LocalSigner {
        LocalSigner::new(ed25519_dalek::SigningKey::from_bytes(&[seed; 32]))
    }

    fn unsigned_address_entry(key: &stellar_strkey::ed25519::PublicKey) -> SorobanAuthorizationEntry {
        SorobanAuthorizationEntry {
            credentials: SorobanCredentials::Address(SorobanAddressCredentials {
                address: ScAddress::Account(AccountId(PublicKey::PublicKeyTypeEd25519(Uint256(
                    key.0,
                )))),
                nonce: 123,
                signature_expiration_ledger: 0,
                signature: ScVal::Void,
            }),
            root_invocation: SorobanAuthorizedInvocation {
                function: SorobanAuthorizedFunction::ContractFn(InvokeContractArgs {
                    contract_address: ScAddress::Contract(Hash([7; 32])),
                    function_name: ScSymbol("swap".try_into().unwrap()),
                    args: VecM::default(),
                }),
                sub_invocations: VecM::default(),
            },
        }
    }

    #[tokio::test]
    async fn authorize_entry_splices_signature_and_expiration() {
        let signer = test_signer(1);
        let public_key = signer.public_key();
        let raw = unsigned_address_entry(&public_key);

        let signed = authorize_entry(&raw, &signer, &public_key, 456, PASSPHRASE)
            .await
            .unwrap();

        let SorobanCredentials::Address(credentials) = &signed.credentials else {
            panic!("expected address credentials");
        };
        assert_eq!(credentials.signature_expiration_ledger, 456);
        let ScVal::Vec(Some(sigs)) = &credentials.signature else {
            panic!("expected a vec of signature maps, got {:?}", credentials.signature);
        };
        let ScVal::Map(Some(map)) = &sigs[0] else {
            panic!("expected a signature map");
        };
        let keys: Vec<String> = map
            .iter()
            .map(|entry| match &entry.key {
                ScVal::Symbol(s) => s.to_utf8_string_lossy(),
                v => panic!("unexpected key {v:?}"),
            })
            .collect();
        assert_eq!(keys, vec!["public_key", "signature"]);

        // the invocation and nonce are untouched
        assert_eq!(signed.root_invocation, raw.root_invocation);
    }

    #[tokio::test]
    async fn authorize_entry_leaves_source_credentials_alone() {
        let signer = test_signer(1);
        let mut raw = unsigned_address_entry(&signer.public_key());
        raw.credentials = SorobanCredentials::SourceAccount;

        let signed = authorize_entry(&raw, &signer, &signer.public_key(), 456, PASSPHRASE)
            .await
            .unwrap();
        assert_eq!(signed, raw);
    }

    #[tokio::test]
    async fn local_signer_envelope_signature_verifies() {
        let signer = test_signer(2);
        let txn = Transaction {
            source_account: MuxedAccount::Ed25519(Uint256(signer.public_key().0)),
            fee: 100,
            seq_num: SequenceNumber(1),
            cond: Preconditions::None,
            memo: Memo::None,
            operations: vec![Operation {
                source_account: None,
                body: OperationBody::InvokeHostFunction(xdr::InvokeHostFunctionOp {
                    host_function: xdr::HostFunction::InvokeContract(InvokeContractArgs {
                        contract_address: ScAddress::Contract(Hash([0; 32])),
                        function_name: ScSymbol::default(),
                        args: VecM::default(),
                    }),
                    auth: VecM::default(),
                }),
            }]
            .try_into()
            .unwrap(),
            ext: TransactionExt::V0,
        };

        let envelope = signer.sign_transaction(&txn, PASSPHRASE).await.unwrap();
        let TransactionEnvelope::Tx(TransactionV1Envelope { tx, signatures }) = envelope else {
            panic!("expected a v1 envelope");
        };
        assert_eq!(tx, txn);
        assert_eq!(signatures.len(), 1);

        let hash = transaction_hash(&txn, PASSPHRASE).unwrap();
        let verifying = signer.key.verifying_key();
        let sig = ed25519_dalek::Signature::from_bytes(
            signatures[0].signature.0.as_slice().try_into().unwrap(),
        );
        assert!(verifying.verify_strict(&hash, &sig).is_ok());
    }
}
