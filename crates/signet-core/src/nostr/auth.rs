use anyhow::{Context, Result};
use nostr_sdk::nips::nip49::EncryptedSecretKey;
use nostr_sdk::prelude::*;

/// Whether a stored key is NIP-49 encrypted and needs a password to unlock.
pub fn needs_password(stored: &str) -> bool {
    stored.trim().starts_with("ncryptsec")
}

/// Load signing keys from an `nsec`, a hex secret or an `ncryptsec`.
pub fn load_keys(stored: &str, password: Option<&str>) -> Result<Keys> {
    let stored = stored.trim();
    let secret_key = if needs_password(stored) {
        let password = password
            .filter(|p| !p.is_empty())
            .context("Credentials are encrypted, password required")?;
        let encrypted =
            EncryptedSecretKey::from_bech32(stored).context("Invalid ncryptsec encoding")?;
        encrypted
            .decrypt(password)
            .context("Failed to decrypt ncryptsec")?
    } else {
        SecretKey::parse(stored).context("Invalid secret key")?
    };

    Ok(Keys::new(secret_key))
}

/// Encrypt the secret half of `keys` for storage.
pub fn encrypt_keys(keys: &Keys, password: &str) -> Result<String> {
    let encrypted = keys.secret_key().encrypt(password)?;
    Ok(encrypted.to_bech32()?)
}
