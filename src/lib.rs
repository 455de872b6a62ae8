#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]
pub mod assembled;
pub mod client;
pub mod rpc;
pub mod sent;
pub mod signer;
pub mod spec;

pub use assembled::{
    AssembledTransaction, AuthorizeOptions, ContractError, NativeResult, SignOptions,
    NULL_ACCOUNT,
};
pub use client::{ClientOptions, ContractClient, MethodOptions, DEFAULT_TIMEOUT_IN_SECONDS};
pub use sent::SentTransaction;
pub use signer::{LocalSigner, Signer};
pub use spec::ContractSpec;
