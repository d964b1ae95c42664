//! Two-party Ed25519 (Schnorr) signing.
//!
//! Symmetric flow: both signers commit to a nonce point, reveal it with a
//! Schnorr proof, then exchange partial signatures s_i = r_i + k·w_i where
//! w_i is the Lagrange-weighted share. The combined s = s1 + s2 is verified
//! against the group public key before the signature is released.

use curv::cryptographic_primitives::proofs::sigma_dlog::DLogProof;
use curv::elliptic::curves::{Ed25519, Point, Scalar};
use curv::BigInt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use tracing::debug;

use curv::arithmetic::traits::*;
use tss_types::ParticipantId;

use crate::curves::{
    commit, digest_of, lagrange_at_zero, point_from_hex, sample_blind, scalar_from_hex,
    verify_commitment,
};
use crate::{Ed25519SignContext, Ed25519SignatureData, KeyShare, ProviderError, ProviderResult};

#[derive(Serialize, Deserialize)]
pub(crate) struct NonceCommitMsg {
    pub commitment: BigInt,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct NonceRevealMsg {
    pub nonce_point: Point<Ed25519>,
    pub blind: BigInt,
    pub proof: DLogProof<Ed25519, Sha256>,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct PartialSigMsg {
    pub partial: Scalar<Ed25519>,
    pub nonce_point: Point<Ed25519>,
}

/// Challenge k = SHA-512(R || A || m) mod l, the standard Ed25519 layout
/// with the pre-hashed message in place of m.
fn challenge(
    combined_nonce: &Point<Ed25519>,
    public_key: &Point<Ed25519>,
    message_hash: &[u8],
) -> Scalar<Ed25519> {
    let mut hasher = Sha512::new();
    hasher.update(&*combined_nonce.to_bytes(true));
    hasher.update(&*public_key.to_bytes(true));
    hasher.update(message_hash);
    let digest = hasher.finalize();
    Scalar::from_bigint(&(BigInt::from_bytes(&digest) % Scalar::<Ed25519>::group_order()))
}

pub struct Ed25519Signer {
    weighted_share: Scalar<Ed25519>,
    public_key: Point<Ed25519>,
    message_hash: Vec<u8>,
    round: u8,
    nonce: Option<Scalar<Ed25519>>,
    nonce_point: Option<Point<Ed25519>>,
    blind: Option<BigInt>,
    peer_commitment: Option<BigInt>,
    combined_nonce: Option<Point<Ed25519>>,
    partial: Option<Scalar<Ed25519>>,
    k: Option<Scalar<Ed25519>>,
}

impl Ed25519Signer {
    pub fn new(
        share: &KeyShare,
        signers: (ParticipantId, ParticipantId),
        message_hash: &[u8],
    ) -> ProviderResult<Self> {
        let party = share.participant_id;
        if party != signers.0 && party != signers.1 {
            return Err(ProviderError::Primitive(format!(
                "holder {party} is not in the signer pair"
            )));
        }
        let secret = scalar_from_hex::<Ed25519>(&share.secret_share)?;
        let lambda = lagrange_at_zero::<Ed25519>(
            share.threshold,
            share.participants.len() as u16,
            party.0,
            &[signers.0 .0, signers.1 .0],
        );
        Ok(Self {
            weighted_share: lambda * secret,
            public_key: point_from_hex(&share.public_key)?,
            message_hash: message_hash.to_vec(),
            round: 0,
            nonce: None,
            nonce_point: None,
            blind: None,
            peer_commitment: None,
            combined_nonce: None,
            partial: None,
            k: None,
        })
    }

    fn encode<T: Serialize>(msg: &T) -> ProviderResult<String> {
        serde_json::to_string(msg).map_err(ProviderError::malformed)
    }

    fn decode<T: for<'de> Deserialize<'de>>(raw: &str) -> ProviderResult<T> {
        serde_json::from_str(raw).map_err(ProviderError::malformed)
    }
}

impl Ed25519SignContext for Ed25519Signer {
    fn round1(&mut self) -> ProviderResult<String> {
        assert_eq!(self.round, 0, "ed25519 round1 invoked out of order");
        self.round = 1;

        let nonce = Scalar::<Ed25519>::random();
        let nonce_point = Point::<Ed25519>::generator() * &nonce;
        let blind = sample_blind();
        let commitment = commit(&digest_of(&nonce_point)?, &blind);

        self.nonce = Some(nonce);
        self.nonce_point = Some(nonce_point);
        self.blind = Some(blind);
        Self::encode(&NonceCommitMsg { commitment })
    }

    fn round2(&mut self, inbound: &str) -> ProviderResult<String> {
        assert_eq!(self.round, 1, "ed25519 round2 invoked out of order");
        self.round = 2;

        let msg: NonceCommitMsg = Self::decode(inbound)?;
        self.peer_commitment = Some(msg.commitment);

        Self::encode(&NonceRevealMsg {
            nonce_point: self
                .nonce_point
                .clone()
                .ok_or_else(|| ProviderError::MissingMaterial("nonce point".to_string()))?,
            blind: self
                .blind
                .clone()
                .ok_or_else(|| ProviderError::MissingMaterial("nonce blind".to_string()))?,
            proof: DLogProof::<Ed25519, Sha256>::prove(
                self.nonce
                    .as_ref()
                    .ok_or_else(|| ProviderError::MissingMaterial("nonce".to_string()))?,
            ),
        })
    }

    fn round3(&mut self, inbound: &str) -> ProviderResult<String> {
        assert_eq!(self.round, 2, "ed25519 round3 invoked out of order");
        self.round = 3;

        let msg: NonceRevealMsg = Self::decode(inbound)?;
        let commitment = self
            .peer_commitment
            .as_ref()
            .ok_or_else(|| ProviderError::MissingMaterial("peer commitment".to_string()))?;
        verify_commitment(commitment, &digest_of(&msg.nonce_point)?, &msg.blind)?;
        DLogProof::verify(&msg.proof)
            .map_err(|_| ProviderError::ProofRejected("peer nonce proof".to_string()))?;
        if msg.proof.pk != msg.nonce_point {
            return Err(ProviderError::ProofRejected(
                "peer nonce proof does not match nonce point".to_string(),
            ));
        }

        let own_nonce_point = self
            .nonce_point
            .clone()
            .ok_or_else(|| ProviderError::MissingMaterial("nonce point".to_string()))?;
        let combined = own_nonce_point + msg.nonce_point;
        let k = challenge(&combined, &self.public_key, &self.message_hash);
        let nonce = self
            .nonce
            .as_ref()
            .ok_or_else(|| ProviderError::MissingMaterial("nonce".to_string()))?;
        let partial = nonce + k.clone() * &self.weighted_share;

        self.combined_nonce = Some(combined.clone());
        self.k = Some(k);
        self.partial = Some(partial.clone());
        debug!("ed25519 round 3: partial signature produced");
        Self::encode(&PartialSigMsg {
            partial,
            nonce_point: combined,
        })
    }

    fn finalize(&mut self, inbound: &str) -> ProviderResult<Ed25519SignatureData> {
        assert_eq!(self.round, 3, "ed25519 finalize invoked out of order");
        self.round = 4;

        let msg: PartialSigMsg = Self::decode(inbound)?;
        let combined = self
            .combined_nonce
            .as_ref()
            .ok_or_else(|| ProviderError::MissingMaterial("combined nonce".to_string()))?;
        if msg.nonce_point != *combined {
            return Err(ProviderError::Primitive(
                "signers disagree on the combined nonce".to_string(),
            ));
        }
        let own = self
            .partial
            .as_ref()
            .ok_or_else(|| ProviderError::MissingMaterial("own partial".to_string()))?;
        let k = self
            .k
            .as_ref()
            .ok_or_else(|| ProviderError::MissingMaterial("challenge".to_string()))?;

        let s = own + &msg.partial;
        let lhs = Point::<Ed25519>::generator() * &s;
        let rhs = combined + &self.public_key * k;
        if lhs != rhs {
            return Err(ProviderError::Primitive(
                "combined Ed25519 signature failed verification".to_string(),
            ));
        }

        debug!("ed25519 signature combined and verified");
        Ok(Ed25519SignatureData {
            r: hex::encode(&*combined.to_bytes(true)),
            s: hex::encode(s.to_bigint().to_bytes()),
        })
    }
}

/// Verify a two-party Ed25519 signature against a hex-encoded public key and
/// a message hash. Encodings match what the signer emits: compressed point
/// hex for R, big-endian scalar hex for s.
pub fn ed25519_verify(
    public_key: &str,
    message_hash: &[u8],
    signature: &Ed25519SignatureData,
) -> bool {
    let (Ok(pk), Ok(r)) = (
        point_from_hex::<Ed25519>(public_key),
        point_from_hex::<Ed25519>(&signature.r),
    ) else {
        return false;
    };
    let Ok(s) = scalar_from_hex::<Ed25519>(&signature.s) else {
        return false;
    };
    let k = challenge(&r, &pk, message_hash);
    Point::<Ed25519>::generator() * &s == r + pk * k
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dkg::tests::run_dkg;
    use crate::refresh::tests::run_refresh;
    use crate::Ed25519SignContext;

    pub(crate) fn run_sign(
        shares: &[KeyShare],
        signers: (u16, u16),
        message_hash: &[u8],
    ) -> Ed25519SignatureData {
        let pair = (ParticipantId(signers.0), ParticipantId(signers.1));
        let mut a = Ed25519Signer::new(&shares[(signers.0 - 1) as usize], pair, message_hash)
            .unwrap();
        let mut b = Ed25519Signer::new(&shares[(signers.1 - 1) as usize], pair, message_hash)
            .unwrap();

        let (c_a, c_b) = (a.round1().unwrap(), b.round1().unwrap());
        let (r_a, r_b) = (a.round2(&c_b).unwrap(), b.round2(&c_a).unwrap());
        let (p_a, p_b) = (a.round3(&r_b).unwrap(), b.round3(&r_a).unwrap());
        let sig_a = a.finalize(&p_b).unwrap();
        let sig_b = b.finalize(&p_a).unwrap();
        assert_eq!(sig_a, sig_b);
        sig_a
    }

    #[test]
    fn two_of_three_signature_verifies() {
        let shares = run_dkg::<Ed25519>(3, 2);
        let hash = Sha256::digest(b"Hello, Ed25519 Threshold Signature!");
        let signature = run_sign(&shares, (1, 3), &hash);
        assert!(ed25519_verify(&shares[0].public_key, &hash, &signature));
        assert_eq!(signature.combined().len(), signature.r.len() + signature.s.len());
    }

    #[test]
    fn signature_rejects_wrong_message() {
        let shares = run_dkg::<Ed25519>(3, 2);
        let hash = Sha256::digest(b"Hello, Ed25519 Threshold Signature!");
        let signature = run_sign(&shares, (2, 3), &hash);
        let other = Sha256::digest(b"tampered");
        assert!(!ed25519_verify(&shares[0].public_key, &other, &signature));
    }

    #[test]
    fn signature_after_refresh_verifies_under_original_key() {
        let shares = run_dkg::<Ed25519>(3, 2);
        let original_key = shares[0].public_key.clone();

        let refreshed: Vec<KeyShare> = run_refresh::<Ed25519>(&shares, (1, 3), &[2])
            .into_iter()
            .map(|outcome| outcome.key_share)
            .collect();

        // Participant 2 lost its share and got a fresh one; (1, 2) can sign.
        let hash = Sha256::digest(b"Hello, Ed25519 Threshold Signature!");
        let signature = run_sign(&refreshed, (1, 2), &hash);
        assert!(ed25519_verify(&original_key, &hash, &signature));
    }
}
