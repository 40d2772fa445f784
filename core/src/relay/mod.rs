// Store-and-forward relay: opaque ciphertext custody plus a name directory.

pub mod client;
pub mod protocol;
pub mod server;
pub mod store;

pub use client::{RelayClient, RelayClientError};
pub use store::RelayStore;
