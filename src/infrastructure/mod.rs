pub mod db;
pub mod key_vault;
pub mod keyed_lock;
pub mod log_redact;
pub mod logging;
pub mod rpc_validator;
