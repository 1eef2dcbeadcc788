pub mod amount;
pub mod transaction_status;

pub use transaction_status::TransactionStatus;
