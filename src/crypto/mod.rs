//! Secret Vault
//! Mission: Two-layer protection for credentials - AEAD tokens at rest,
//! RSA-wrapped session keys in transit

mod storage;
mod transport;

pub use storage::{StorageVault, VaultError};
pub use transport::{seal_envelope, TransportEnvelope, TransportVault};
