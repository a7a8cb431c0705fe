pub mod error;
pub mod validate;
pub mod vault;

pub use error::{Result, VaultError};
pub use validate::Validation;
pub use vault::{SecretMeta, SecretType, SecretsVault, SetOptions};
