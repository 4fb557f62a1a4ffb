pub mod client;
pub mod ledger;
pub mod network;
pub mod operation;
pub mod rest_api;
pub mod session;
