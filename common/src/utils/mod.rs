pub mod config;
pub mod embedding;
pub mod hashing;
pub mod rate_ledger;
pub mod tokens;
