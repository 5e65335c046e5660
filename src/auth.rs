use anyhow::Result;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};

/// Hash the admin password with Argon2id and a fresh salt
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?;

    Ok(hash.to_string())
}

/// Check `password` against a stored PHC hash string
///
/// A wrong password is `Ok(false)`; only an unreadable hash is an error.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| anyhow::anyhow!("Failed to parse password hash: {}", e))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Reject anything that is not a PHC hash string
pub fn check_hash(hash: &str) -> Result<()> {
    PasswordHash::new(hash).map_err(|e| anyhow::anyhow!("not a password hash: {}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_accepts_only_the_right_password() {
        let hash = hash_password("correct horse").unwrap();

        assert!(verify_password("correct horse", &hash).unwrap());
        assert!(!verify_password("battery staple", &hash).unwrap());
        assert!(!verify_password("", &hash).unwrap());
    }

    #[test]
    fn test_hashes_are_salted() {
        let first = hash_password("same").unwrap();
        let second = hash_password("same").unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with("$argon2id$"));
    }

    #[test]
    fn test_malformed_hash() {
        assert!(check_hash("plaintext").is_err());
        assert!(verify_password("x", "plaintext").is_err());
        assert!(check_hash(&hash_password("x").unwrap()).is_ok());
    }
}
