pub mod chain_gateway;
pub mod key_rotation;
pub mod multisig_coordinator;
pub mod nonce_manager;
pub mod reconciler;
pub mod transaction_builder;
pub mod transaction_engine;
pub mod wallet_registry;

pub use chain_gateway::{ChainGateway, JsonRpcGateway};
pub use multisig_coordinator::MultiSigCoordinator;
pub use reconciler::Reconciler;
pub use transaction_engine::TransactionEngine;
pub use wallet_registry::WalletRegistry;
