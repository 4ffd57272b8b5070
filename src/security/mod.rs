pub mod errors;
pub mod identity;
pub mod secret_fetcher;
pub mod token_cache;
pub mod token_exchange;
pub mod vault_client;
