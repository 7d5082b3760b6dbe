use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::core::{AppError, AppResult};
use crate::infrastructure::protocol::code;

type HmacSha256 = Hmac<Sha256>;

pub const NONCE_BYTES: usize = 32;

pub fn generate_nonce() -> [u8; NONCE_BYTES] {
    let mut nonce = [0u8; NONCE_BYTES];
    rand::rng().fill_bytes(&mut nonce);
    nonce
}

pub fn encode_base64(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_base64(text: &str) -> AppResult<Vec<u8>> {
    BASE64.decode(text.as_bytes()).map_err(|error| {
        AppError::new(code::BAD_REQUEST, "invalid base64 field").with_detail(error.to_string())
    })
}

fn mac_instance(shared_key: &str) -> AppResult<HmacSha256> {
    HmacSha256::new_from_slice(shared_key.as_bytes())
        .map_err(|error| AppError::new(code::INTERNAL_ERROR, "hmac init failed").with_detail(error.to_string()))
}

/// MAC over `serverNonce ‖ clientNonce ‖ serverId ‖ clientId`, raw byte
/// concatenation with no length prefixes.
pub fn compute_mac(
    shared_key: &str,
    server_nonce: &[u8],
    client_nonce: &[u8],
    server_id: &str,
    client_id: &str,
) -> AppResult<Vec<u8>> {
    let mut mac = mac_instance(shared_key)?;
    mac.update(server_nonce);
    mac.update(client_nonce);
    mac.update(server_id.as_bytes());
    mac.update(client_id.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Constant-time comparison via the Mac verifier.
pub fn verify_mac(
    shared_key: &str,
    server_nonce: &[u8],
    client_nonce: &[u8],
    server_id: &str,
    client_id: &str,
    presented: &[u8],
) -> AppResult<bool> {
    let mut mac = mac_instance(shared_key)?;
    mac.update(server_nonce);
    mac.update(client_nonce);
    mac.update(server_id.as_bytes());
    mac.update(client_id.as_bytes());
    Ok(mac.verify_slice(presented).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_should_verify_against_itself() {
        let server_nonce = generate_nonce();
        let client_nonce = generate_nonce();
        let mac = compute_mac("secret", &server_nonce, &client_nonce, "S", "C").expect("mac");
        assert!(
            verify_mac("secret", &server_nonce, &client_nonce, "S", "C", &mac).expect("verify")
        );
    }

    #[test]
    fn wrong_key_should_never_match() {
        let server_nonce = generate_nonce();
        let client_nonce = generate_nonce();
        let mac = compute_mac("wrong", &server_nonce, &client_nonce, "S", "C").expect("mac");
        assert!(
            !verify_mac("secret", &server_nonce, &client_nonce, "S", "C", &mac).expect("verify")
        );
    }

    #[test]
    fn single_bit_flip_should_fail_verification() {
        let server_nonce = generate_nonce();
        let client_nonce = generate_nonce();
        let mut mac = compute_mac("secret", &server_nonce, &client_nonce, "S", "C").expect("mac");
        mac[7] ^= 0x01;
        assert!(
            !verify_mac("secret", &server_nonce, &client_nonce, "S", "C", &mac).expect("verify")
        );
    }

    #[test]
    fn swapping_device_ids_should_change_the_mac() {
        let server_nonce = generate_nonce();
        let client_nonce = generate_nonce();
        let forward = compute_mac("secret", &server_nonce, &client_nonce, "S", "C").expect("mac");
        let swapped = compute_mac("secret", &server_nonce, &client_nonce, "C", "S").expect("mac");
        assert_ne!(forward, swapped);
    }

    #[test]
    fn nonce_base64_should_roundtrip() {
        let nonce = generate_nonce();
        let encoded = encode_base64(&nonce);
        let decoded = decode_base64(&encoded).expect("decode");
        assert_eq!(decoded, nonce);
    }
}
