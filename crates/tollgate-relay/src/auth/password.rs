//! Password hashing and verification using argon2id.
//!
//! Static users are stored as PHC strings, one per users-file line.

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};

/// Hash a password using argon2id with a random salt.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Check that `hash` is a well-formed PHC string.
pub fn check_hash(hash: &str) -> Result<(), argon2::password_hash::Error> {
    PasswordHash::new(hash).map(|_| ())
}

/// Verify a password against a stored PHC hash.
///
/// This is deliberately slow; call it from a blocking thread.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, argon2::password_hash::Error> {
    let parsed_hash = PasswordHash::new(hash)?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify() {
        let hash = hash_password("mysecret").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("mysecret", &hash).unwrap());
        assert!(!verify_password("wrongpassword", &hash).unwrap());
    }

    #[test]
    fn malformed_hash_is_an_error() {
        assert!(check_hash("not-a-phc-string").is_err());
        assert!(verify_password("pw", "not-a-phc-string").is_err());
    }

    #[test]
    fn hashes_are_salted() {
        let h1 = hash_password("same").unwrap();
        let h2 = hash_password("same").unwrap();
        assert_ne!(h1, h2);
        check_hash(&h1).unwrap();
    }
}
