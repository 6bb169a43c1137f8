//! Persisted state: saved connections and their secrets.

mod connections;
mod secrets;

pub use connections::{ConnectionStore, SavedConnection};
pub use secrets::SecretStorage;
