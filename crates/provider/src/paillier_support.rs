//! Paillier and Pedersen material for the ECDSA keygen hand-off.
//!
//! P1 generates a Paillier keypair and Pedersen parameters once per key and
//! ships them to P2 inside its first signing message, together with a
//! correct-key proof and a DLN proof over the Pedersen parameters.

use curv::arithmetic::traits::*;
use curv::BigInt;
use paillier::{DecryptionKey, EncryptionKey, KeyGeneration, Paillier};
use serde::{Deserialize, Serialize};
use zk_paillier::zkproofs::{CompositeDLogProof, DLogStatement, NiCorrectKeyProof, SALT_STRING};

use crate::{ProviderError, ProviderResult};

/// Paillier keypair held by P1. Expensive to generate; cached per key by the
/// coordinator's key store.
#[derive(Clone, Serialize, Deserialize)]
pub struct PaillierKeypair {
    pub ek: EncryptionKey,
    pub dk: DecryptionKey,
}

impl PaillierKeypair {
    pub fn generate() -> Self {
        let (ek, dk) = Paillier::keypair().keys();
        Self { ek, dk }
    }

    /// Non-interactive proof that `ek` is a correctly formed Paillier key.
    pub fn correct_key_proof(&self) -> NiCorrectKeyProof {
        NiCorrectKeyProof::proof(&self.dk, None)
    }
}

impl std::fmt::Debug for PaillierKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaillierKeypair")
            .field("n_bits", &self.ek.n.bit_length())
            .finish()
    }
}

/// Pedersen parameters (N~, h1, h2) with the discrete-log trapdoor retained
/// so the holder can produce DLN proofs.
#[derive(Clone, Serialize, Deserialize)]
pub struct DlnParams {
    pub n_tilde: BigInt,
    pub h1: BigInt,
    pub h2: BigInt,
    xhi: BigInt,
}

impl DlnParams {
    pub fn generate() -> Self {
        let (ek_tilde, _dk_tilde) = Paillier::keypair().keys();
        let n_tilde = ek_tilde.n;
        let (h1, h1_inv) = loop {
            let candidate = BigInt::sample_below(&n_tilde);
            if let Some(inverse) = BigInt::mod_inv(&candidate, &n_tilde) {
                break (candidate, inverse);
            }
        };
        let bound = BigInt::from(2).pow(256u32);
        let xhi = BigInt::sample_below(&bound);
        let h2 = BigInt::mod_pow(&h1_inv, &xhi, &n_tilde);
        Self {
            n_tilde,
            h1,
            h2,
            xhi,
        }
    }

    pub fn statement(&self) -> DLogStatement {
        DLogStatement {
            N: self.n_tilde.clone(),
            g: self.h1.clone(),
            ni: self.h2.clone(),
        }
    }

    pub fn prove(&self) -> CompositeDLogProof {
        CompositeDLogProof::prove(&self.statement(), &self.xhi)
    }
}

impl std::fmt::Debug for DlnParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DlnParams")
            .field("n_tilde_bits", &self.n_tilde.bit_length())
            .finish()
    }
}

/// Verify a DLN proof against a Pedersen statement.
pub fn dln_verify(proof: &CompositeDLogProof, statement: &DLogStatement) -> ProviderResult<()> {
    proof
        .verify(statement)
        .map_err(|_| ProviderError::ProofRejected("DLN proof".to_string()))
}

/// Verify a Paillier correct-key proof.
pub fn correct_key_verify(
    proof: &NiCorrectKeyProof,
    ek: &EncryptionKey,
) -> ProviderResult<()> {
    proof
        .verify(ek, SALT_STRING)
        .map_err(|_| ProviderError::ProofRejected("Paillier correct-key proof".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dln_proof_roundtrip() {
        let params = DlnParams::generate();
        let proof = params.prove();
        assert!(dln_verify(&proof, &params.statement()).is_ok());

        let other = DlnParams::generate();
        assert!(dln_verify(&proof, &other.statement()).is_err());
    }

    #[test]
    fn correct_key_proof_roundtrip() {
        let keypair = PaillierKeypair::generate();
        let proof = keypair.correct_key_proof();
        assert!(correct_key_verify(&proof, &keypair.ek).is_ok());
    }
}
