use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

/// Verifies a detached Ed25519 signature over an update payload.
///
/// Returns `Ok(false)` for a well-formed signature that does not match, and an
/// error when the key or signature cannot be decoded.
pub fn verify_ed25519_signature_hex(
    payload: &[u8],
    public_key_hex: &str,
    signature_hex: &str,
) -> Result<bool> {
    let verifying_key = decode_verifying_key(public_key_hex)?;
    let signature = decode_signature(signature_hex)?;
    Ok(verifying_key.verify(payload, &signature).is_ok())
}

fn decode_verifying_key(public_key_hex: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(public_key_hex.trim())
        .context("failed to decode update signing public key hex")?;
    let len = bytes.len();
    let array: [u8; 32] = bytes.try_into().map_err(|_| {
        anyhow!("invalid update signing public key length: expected 32 bytes, got {len}")
    })?;
    VerifyingKey::from_bytes(&array).context("invalid update signing public key bytes")
}

fn decode_signature(signature_hex: &str) -> Result<Signature> {
    let bytes =
        hex::decode(signature_hex.trim()).context("failed to decode update signature hex")?;
    let len = bytes.len();
    let array: [u8; 64] = bytes.try_into().map_err(|_| {
        anyhow!("invalid update signature length: expected 64 bytes, got {len}")
    })?;
    Ok(Signature::from_bytes(&array))
}
