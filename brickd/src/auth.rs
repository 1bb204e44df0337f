//! Authentication handshake digest. The daemon hands out a 4-byte server
//! nonce, the client answers with its own nonce and an HMAC-SHA1 over both
//! nonces keyed with the shared secret.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

pub const NONCE_LENGTH: usize = 4;
pub const DIGEST_LENGTH: usize = 20;

type HmacSha1 = Hmac<Sha1>;

pub fn generate_server_nonce() -> [u8; NONCE_LENGTH] {
    let mut nonce = [0u8; NONCE_LENGTH];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

pub fn compute_digest(
    secret: &str,
    server_nonce: &[u8; NONCE_LENGTH],
    client_nonce: &[u8; NONCE_LENGTH],
) -> [u8; DIGEST_LENGTH] {
    let mut mac =
        HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(server_nonce);
    mac.update(client_nonce);

    let mut digest = [0u8; DIGEST_LENGTH];
    digest.copy_from_slice(&mac.finalize().into_bytes());
    digest
}

/// Constant-time comparison of the client-supplied digest.
pub fn verify_digest(
    secret: &str,
    server_nonce: &[u8; NONCE_LENGTH],
    client_nonce: &[u8; NONCE_LENGTH],
    digest: &[u8],
) -> bool {
    let mut mac =
        HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(server_nonce);
    mac.update(client_nonce);
    mac.verify_slice(digest).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_roundtrip() {
        let server_nonce = [1, 2, 3, 4];
        let client_nonce = [5, 6, 7, 8];

        let digest = compute_digest("s3cret", &server_nonce, &client_nonce);
        assert!(verify_digest("s3cret", &server_nonce, &client_nonce, &digest));
    }

    #[test]
    fn digest_depends_on_secret_and_nonces() {
        let server_nonce = [1, 2, 3, 4];
        let client_nonce = [5, 6, 7, 8];
        let digest = compute_digest("s3cret", &server_nonce, &client_nonce);

        assert!(!verify_digest("wrong", &server_nonce, &client_nonce, &digest));
        assert!(!verify_digest("s3cret", &[0; 4], &client_nonce, &digest));
        assert!(!verify_digest("s3cret", &server_nonce, &[0; 4], &digest));
        assert!(!verify_digest("s3cret", &server_nonce, &client_nonce, &digest[..19]));
    }

    #[test]
    fn server_nonces_vary() {
        // not a randomness test, just a "we didn't hardcode it" check
        let nonces: Vec<[u8; 4]> = (0..16).map(|_| generate_server_nonce()).collect();
        assert!(nonces.iter().any(|n| n != &nonces[0]) || nonces[0] != [0; 4]);
    }
}
