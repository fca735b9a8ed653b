// personal_sign (EIP-191) signer recovery

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha3::{Digest, Keccak256};

/// Keccak-256 of the message with the `\x19Ethereum Signed Message:\n<len>` prefix.
pub fn personal_message_hash(message: &str) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message.as_bytes());
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// Lowercase 0x address of a public key.
pub fn address_of(key: &VerifyingKey) -> String {
    let point = key.as_affine().to_encoded_point(false);
    // Drop the 0x04 tag; the address is the last 20 bytes of the hash
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

/// Recover the signing address from a 65-byte `r || s || v` hex signature.
/// Returns `None` for anything malformed or unrecoverable.
pub fn recover_signer(message: &str, signature: &str) -> Option<String> {
    let raw = signature.trim();
    let bytes = hex::decode(raw.strip_prefix("0x").unwrap_or(raw)).ok()?;
    if bytes.len() != 65 {
        return None;
    }

    let signature = Signature::from_slice(&bytes[..64]).ok()?;
    let v = match bytes[64] {
        v @ (27 | 28) => v - 27,
        v @ (0 | 1) => v,
        _ => return None,
    };
    let recovery_id = RecoveryId::from_byte(v)?;

    let digest = personal_message_hash(message);
    let key = VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id).ok()?;
    Some(address_of(&key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;

    fn key(byte: u8) -> SigningKey {
        let mut secret = [0u8; 32];
        secret[31] = byte;
        SigningKey::from_slice(&secret).unwrap()
    }

    fn sign(key: &SigningKey, message: &str) -> String {
        let (signature, recovery_id) = key.sign_prehash_recoverable(&personal_message_hash(message)).unwrap();
        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(recovery_id.to_byte() + 27);
        format!("0x{}", hex::encode(bytes))
    }

    #[test]
    fn address_of_known_key() {
        assert_eq!(
            address_of(key(1).verifying_key()),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn recovers_the_signer() {
        let signer = key(7);
        let message = "Sign this message\nNonce: abc";
        let recovered = recover_signer(message, &sign(&signer, message));
        assert_eq!(recovered, Some(address_of(signer.verifying_key())));
    }

    #[test]
    fn other_message_recovers_someone_else() {
        let signer = key(7);
        let signature = sign(&signer, "Nonce: abc");
        assert_ne!(recover_signer("Nonce: abd", &signature), Some(address_of(signer.verifying_key())));
    }

    #[test]
    fn malformed_signatures() {
        assert_eq!(recover_signer("hi", "0x1234"), None);
        assert_eq!(recover_signer("hi", "not hex"), None);
        let mut bad_v = sign(&key(3), "hi");
        bad_v.replace_range(bad_v.len() - 2.., "05");
        assert_eq!(recover_signer("hi", &bad_v), None);
    }
}
