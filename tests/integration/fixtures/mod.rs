pub mod client;
pub mod coordinator;
pub mod link;
pub mod outbound;
pub mod store;
pub mod txn;
