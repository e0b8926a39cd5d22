use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use spake2::{Ed25519Group, Identity, Password, Spake2};

use crate::error::{Result, TransferError};
use crate::wire::PeerRole;
use crate::{KEY_SIZE, NONCE_SIZE, SEED_SIZE, TAG_SIZE};

type HmacSha256 = Hmac<Sha256>;

const CHUNK_KEY_INFO: &[u8] = b"caesar-transfer chunk key";
const CONFIRM_KEY_INFO: &[u8] = b"caesar-transfer confirm key";

/// Keys derived from one completed PAKE exchange.
///
/// `session` encrypts chunks for the lifetime of the session. `confirm` is
/// only used for the key-confirmation round: SPAKE2 with mismatched
/// passwords yields silently different secrets, so each side proves
/// possession with an HMAC tag before any packet flows.
pub struct KeyMaterial {
    session: [u8; KEY_SIZE],
    confirm: [u8; KEY_SIZE],
}

/// Derives the PAKE identity from the transfer name.
///
/// Both sides hash the same name, so peers using identical names land in the
/// same SPAKE2 session while the name itself never crosses the wire during
/// key agreement.
fn create_identity(transfer_name: &str) -> Identity {
    let mut hasher = Sha256::default();
    hasher.update(transfer_name.as_bytes());
    Identity::new(&hasher.finalize())
}

/// Starts the PAKE with the transfer name as the low-entropy password.
///
/// Returns the in-flight SPAKE2 state and the first message to hand to the
/// peer as an opaque payload.
pub fn start_pake(transfer_name: &str) -> (Spake2<Ed25519Group>, Vec<u8>) {
    let password = Password::new(transfer_name.as_bytes());
    let identity = create_identity(transfer_name);
    Spake2::<Ed25519Group>::start_symmetric(&password, &identity)
}

/// Completes the PAKE with the peer's message and derives the session keys.
///
/// The raw shared secret is stretched through HKDF-SHA256 into two
/// independent 32-byte keys, one for the chunk cipher and one for key
/// confirmation.
pub fn finish_pake(state: Spake2<Ed25519Group>, inbound: &[u8]) -> Result<KeyMaterial> {
    let shared_secret = state
        .finish(inbound)
        .map_err(|_| TransferError::KeyMismatch)?;

    let hkdf = Hkdf::<Sha256>::new(None, shared_secret.as_ref());
    let mut session = [0u8; KEY_SIZE];
    let mut confirm = [0u8; KEY_SIZE];
    hkdf.expand(CHUNK_KEY_INFO, &mut session)
        .expect("32 bytes is a valid HKDF output length");
    hkdf.expand(CONFIRM_KEY_INFO, &mut confirm)
        .expect("32 bytes is a valid HKDF output length");

    Ok(KeyMaterial { session, confirm })
}

/// Produces this side's key-confirmation tag. The label is the role, so the
/// two directions can never be mistaken for each other.
pub fn confirmation_tag(material: &KeyMaterial, role: PeerRole) -> [u8; 32] {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(&material.confirm).expect("HMAC accepts 32-byte keys");
    mac.update(role.as_str().as_bytes());
    mac.finalize().into_bytes().into()
}

/// Verifies the peer's confirmation tag under its role label. Failure means
/// the two sides did not agree on a key, almost always a transfer-name typo.
pub fn verify_confirmation(material: &KeyMaterial, role: PeerRole, tag: &[u8]) -> Result<()> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(&material.confirm).expect("HMAC accepts 32-byte keys");
    mac.update(role.as_str().as_bytes());
    mac.verify_slice(tag).map_err(|_| TransferError::KeyMismatch)
}

// Nonce layout: four seed bytes from the handshake, then the chunk sequence
// as eight little-endian bytes. The counter keeps nonces unique within a
// session, the seed prefix keeps them distinct across sessions.
fn chunk_nonce(session_seed: &[u8; SEED_SIZE], sequence: u64) -> Nonce {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes[..4].copy_from_slice(&session_seed[..4]);
    nonce_bytes[4..].copy_from_slice(&sequence.to_le_bytes());
    Nonce::from(nonce_bytes)
}

/// Encrypt one chunk under the session key, returning the ciphertext and the
/// 16-byte authentication tag separately, as the chunk packet carries them.
pub fn seal_chunk(
    material: &KeyMaterial,
    session_seed: &[u8; SEED_SIZE],
    sequence: u64,
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_SIZE])> {
    let cipher = ChaCha20Poly1305::new((&material.session).into());
    let nonce = chunk_nonce(session_seed, sequence);

    let mut sealed = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| TransferError::SessionAborted("chunk encryption failed".to_string()))?;

    let tag_start = sealed.len() - TAG_SIZE;
    let tag: [u8; TAG_SIZE] = sealed[tag_start..].try_into().expect("16-byte tag");
    sealed.truncate(tag_start);
    Ok((sealed, tag))
}

/// Decrypt one chunk, verifying its tag. Any tampering, reordering, or key
/// disagreement surfaces here as `DecryptFailed`.
pub fn open_chunk(
    material: &KeyMaterial,
    session_seed: &[u8; SEED_SIZE],
    sequence: u64,
    ciphertext: &[u8],
    tag: &[u8; TAG_SIZE],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new((&material.session).into());
    let nonce = chunk_nonce(session_seed, sequence);

    let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(tag);

    cipher
        .decrypt(&nonce, sealed.as_slice())
        .map_err(|_| TransferError::DecryptFailed)
}
