use crate::errors::SeedError;
use crate::games::types::{GameKind, SeedCommitment, SeedReveal};
use dashmap::DashMap;
use schnorrkel::context::SigningContext;
use schnorrkel::{ExpansionMode, Keypair, MiniSecretKey, PublicKey, Signature};
use sha2::{Digest, Sha256};
use std::sync::Arc;

const VRF_SIGNING_CONTEXT: &[u8] = b"roundhouse-seed";

/// Produces a seed commitment when a round opens and discloses the seed at lock.
///
/// Implementations must be deterministic with respect to the commitment: the
/// reveal for a commitment never changes once the commitment was handed out.
pub trait SeedSource: Send + Sync {
    fn commit(&self, kind: GameKind, round_id: u64, lock_at: u64)
        -> Result<SeedCommitment, SeedError>;

    fn reveal(&self, commitment: &SeedCommitment) -> Result<SeedReveal, SeedError>;

    /// Called once a round has been retired; its reveal is no longer needed
    fn release(&self, _kind: GameKind, _round_id: u64) {}
}

/// Message bound into every commitment
pub fn input_message(kind: GameKind, round_id: u64, lock_at: u64) -> String {
    format!("{}:{}:{}", kind.tag(), round_id, lock_at)
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// VRF-backed seed source.
///
/// The keypair signs the round's input message; the seed is the SHA-256 of the
/// signature and the signature doubles as the proof. Signatures are randomized,
/// so the signature produced at commit time is kept until reveal.
pub struct VrfSeedSource {
    keypair: Arc<Keypair>,
    issued: DashMap<(GameKind, u64), (String, [u8; 32], [u8; 64])>,
}

impl VrfSeedSource {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair: Arc::new(keypair),
            issued: DashMap::new(),
        }
    }

    /// Random keypair (for testing and local runs)
    pub fn new_random() -> Self {
        use rand_core::OsRng;
        Self::new(Keypair::generate_with(OsRng))
    }

    /// Keypair expanded from a 32-byte mini secret
    pub fn from_secret(secret: &[u8]) -> Result<Self, SeedError> {
        let mini = MiniSecretKey::from_bytes(secret)
            .map_err(|e| SeedError::InvalidSeed(format!("invalid VRF secret: {:?}", e)))?;
        Ok(Self::new(mini.expand_to_keypair(ExpansionMode::Ed25519)))
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.public.to_bytes())
    }

    fn vrf_sign(&self, message: &[u8]) -> ([u8; 32], [u8; 64]) {
        let ctx = SigningContext::new(VRF_SIGNING_CONTEXT);
        let signature = self.keypair.sign(ctx.bytes(message)).to_bytes();
        (sha256(&signature), signature)
    }
}

impl SeedSource for VrfSeedSource {
    fn commit(
        &self,
        kind: GameKind,
        round_id: u64,
        lock_at: u64,
    ) -> Result<SeedCommitment, SeedError> {
        let message = input_message(kind, round_id, lock_at);
        let entry = self
            .issued
            .entry((kind, round_id))
            .or_insert_with(|| {
                let (seed, signature) = self.vrf_sign(message.as_bytes());
                (message.clone(), seed, signature)
            });
        let (issued_message, seed, _) = entry.value();
        if issued_message != &message {
            return Err(SeedError::InvalidSeed(format!(
                "round {}#{} was already committed for '{}'",
                kind, round_id, issued_message
            )));
        }

        Ok(SeedCommitment {
            kind,
            round_id,
            input_message: message,
            digest: hex::encode(sha256(seed)),
            public_key: Some(self.public_key_hex()),
        })
    }

    fn reveal(&self, commitment: &SeedCommitment) -> Result<SeedReveal, SeedError> {
        let entry = self
            .issued
            .get(&(commitment.kind, commitment.round_id))
            .ok_or_else(|| SeedError::RevealUnavailable(commitment.digest.clone()))?;
        let (_, seed, signature) = entry.value();

        Ok(SeedReveal {
            seed: hex::encode(seed),
            proof: Some(hex::encode(signature)),
        })
    }

    fn release(&self, kind: GameKind, round_id: u64) {
        self.issued.remove(&(kind, round_id));
    }
}

/// Deterministic seed source for replays, simulations and tests
#[derive(Clone)]
pub struct HashChainSeedSource {
    master: [u8; 32],
}

impl HashChainSeedSource {
    pub fn new(master: [u8; 32]) -> Self {
        Self { master }
    }

    /// Master secret derived from an arbitrary passphrase
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self::new(sha256(passphrase.as_bytes()))
    }

    fn seed_for(&self, message: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.master);
        hasher.update(message.as_bytes());
        hasher.finalize().into()
    }
}

impl SeedSource for HashChainSeedSource {
    fn commit(
        &self,
        kind: GameKind,
        round_id: u64,
        lock_at: u64,
    ) -> Result<SeedCommitment, SeedError> {
        let message = input_message(kind, round_id, lock_at);
        let seed = self.seed_for(&message);
        Ok(SeedCommitment {
            kind,
            round_id,
            input_message: message,
            digest: hex::encode(sha256(&seed)),
            public_key: None,
        })
    }

    fn reveal(&self, commitment: &SeedCommitment) -> Result<SeedReveal, SeedError> {
        Ok(SeedReveal {
            seed: hex::encode(self.seed_for(&commitment.input_message)),
            proof: None,
        })
    }
}

/// Checks a reveal against its commitment and returns the verified seed.
///
/// Anyone holding a settled round's commitment and reveal can call this.
pub fn verify_reveal(
    commitment: &SeedCommitment,
    reveal: &SeedReveal,
) -> Result<[u8; 32], SeedError> {
    let seed: [u8; 32] = hex::decode(&reveal.seed)
        .map_err(|e| SeedError::InvalidSeed(format!("seed is not hex: {}", e)))?
        .try_into()
        .map_err(|_| SeedError::InvalidSeed("seed must be 32 bytes".to_string()))?;

    if hex::encode(sha256(&seed)) != commitment.digest.to_ascii_lowercase() {
        return Err(SeedError::InvalidSeed(
            "seed does not hash to the committed digest".to_string(),
        ));
    }

    let Some(public_key_hex) = &commitment.public_key else {
        return Ok(seed);
    };

    let proof = reveal
        .proof
        .as_ref()
        .ok_or_else(|| SeedError::InvalidSeed("missing VRF proof".to_string()))?;
    let proof_bytes = hex::decode(proof)
        .map_err(|e| SeedError::InvalidSeed(format!("proof is not hex: {}", e)))?;
    let public_key_bytes = hex::decode(public_key_hex)
        .map_err(|e| SeedError::InvalidSeed(format!("public key is not hex: {}", e)))?;

    let public_key = PublicKey::from_bytes(&public_key_bytes)
        .map_err(|e| SeedError::InvalidSeed(format!("invalid public key: {:?}", e)))?;
    let signature = Signature::from_bytes(&proof_bytes)
        .map_err(|e| SeedError::InvalidSeed(format!("invalid signature: {:?}", e)))?;

    let ctx = SigningContext::new(VRF_SIGNING_CONTEXT);
    public_key
        .verify(ctx.bytes(commitment.input_message.as_bytes()), &signature)
        .map_err(|_| SeedError::InvalidSeed("VRF proof does not verify".to_string()))?;

    // The seed must be derived from the proof, not chosen freely
    if sha256(&proof_bytes) != seed {
        return Err(SeedError::InvalidSeed(
            "seed is not derived from the VRF proof".to_string(),
        ));
    }

    Ok(seed)
}
