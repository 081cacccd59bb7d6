//! Diffie-Hellman key agreement over the fixed RTMFP group
//!
//! RTMFP pins the 1024-bit MODP group from RFC 2409 (Second Oakley Group)
//! with generator 2. Public keys are the big-endian group element, 128
//! bytes long, occasionally 127 when the leading byte is zero.

use num_bigint::BigUint;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::CryptoError;

/// Nominal public key length in bytes.
pub const DH_KEY_SIZE: usize = 128;

/// RFC 2409 Second Oakley Group prime, big-endian.
const MODP1024_PRIME: [u8; DH_KEY_SIZE] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2, 0x21, 0x68, 0xC2,
    0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1, 0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67,
    0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6, 0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E,
    0x34, 0x04, 0xDD, 0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45, 0xE4, 0x85, 0xB5,
    0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9, 0xA6, 0x37, 0xED, 0x6B, 0x0B, 0xFF,
    0x5C, 0xB6, 0xF4, 0x06, 0xB7, 0xED, 0xEE, 0x38, 0x6B, 0xFB, 0x5A, 0x89, 0x9F, 0xA5, 0xAE,
    0x9F, 0x24, 0x11, 0x7C, 0x4B, 0x1F, 0xE6, 0x49, 0x28, 0x66, 0x51, 0xEC, 0xE6, 0x53, 0x81,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
];

const GENERATOR: u32 = 2;

fn group_prime() -> BigUint {
    BigUint::from_bytes_be(&MODP1024_PRIME)
}

/// A generated DH keypair bound to the RTMFP group.
pub struct DhKeyPair {
    private: BigUint,
    public: Vec<u8>,
}

impl DhKeyPair {
    /// Generate a fresh keypair. Fails only if the system RNG fails, which
    /// is terminal for the endpoint.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut secret = [0u8; DH_KEY_SIZE];
        OsRng
            .try_fill_bytes(&mut secret)
            .map_err(|e| CryptoError::Init {
                reason: e.to_string(),
            })?;

        let p = group_prime();
        let private = BigUint::from_bytes_be(&secret) % &p;
        let public = BigUint::from(GENERATOR).modpow(&private, &p).to_bytes_be();
        Ok(Self { private, public })
    }

    /// Big-endian public key; 128 bytes, or 127 when the leading byte of
    /// the group element is zero.
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Compute the shared secret with the far side's public key.
    pub fn shared_secret(&self, far_public: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if far_public.is_empty() || far_public.len() > DH_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                len: far_public.len(),
            });
        }
        let p = group_prime();
        let far = BigUint::from_bytes_be(far_public);
        // Reject the trivial subgroup: 0, 1 and p-1
        if far <= BigUint::from(1u32) || far >= &p - 1u32 {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(far.modpow(&self.private, &p).to_bytes_be())
    }
}

/// Lazily-initialized provider shared by all concurrent handshakes of one
/// endpoint. The keypair is generated on first use and read-only after.
#[derive(Default)]
pub struct DhProvider {
    keys: Option<DhKeyPair>,
}

impl DhProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialized(&self) -> bool {
        self.keys.is_some()
    }

    /// The endpoint keypair, generating it on first call.
    pub fn keys(&mut self) -> Result<&DhKeyPair, CryptoError> {
        match &mut self.keys {
            Some(keys) => Ok(keys),
            slot => {
                let keys = DhKeyPair::generate()?;
                tracing::debug!(
                    "Diffie-Hellman keypair initialized ({}-byte public key)",
                    keys.public_key().len()
                );
                Ok(slot.insert(keys))
            }
        }
    }
}
