pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod models;
pub mod pairing;
pub mod protocol;
pub mod record;
pub mod types;
pub mod wire;
