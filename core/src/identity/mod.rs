// Identity: signing, sealed-box encryption, and key file persistence.

mod keys;
mod sealed;
pub mod store;

pub use keys::{fingerprint_of, fingerprint_of_b64, Identity, FINGERPRINT_LEN};
