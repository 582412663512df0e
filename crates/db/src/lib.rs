pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod repositories;

pub use connection::{connect_with_settings, DbPool};
pub use fixtures::{SeedDataset, SeedResult, VerificationResult, SEED_USER_ID};
