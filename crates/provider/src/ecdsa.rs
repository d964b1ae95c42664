//! Two-party ECDSA signing over secp256k1.
//!
//! P1 and P2 hold Lagrange-weighted additive shares w1 + w2 = x of the group
//! key. The nonce is multiplicative: R = k1·k2·G. P2 evaluates the partial
//! signature homomorphically under P1's Paillier key, and P1 decrypts,
//! normalizes and verifies the final (r, s) before handing it back.

use curv::arithmetic::traits::*;
use curv::cryptographic_primitives::proofs::sigma_dlog::DLogProof;
use curv::elliptic::curves::{Point, Scalar, Secp256k1};
use curv::BigInt;
use paillier::{
    Add, Decrypt, Encrypt, EncryptionKey, Mul, Paillier, RawCiphertext, RawPlaintext,
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;
use zk_paillier::zkproofs::{CompositeDLogProof, DLogStatement, NiCorrectKeyProof};

use tss_types::ParticipantId;

use crate::curves::{
    commit, digest_of, lagrange_at_zero, point_from_hex, sample_blind, verify_commitment,
};
use crate::paillier_support::{correct_key_verify, dln_verify, DlnParams, PaillierKeypair};
use crate::{
    EcdsaP1Context, EcdsaP2Context, EcdsaSignatureData, KeyShare, ProviderError, ProviderResult,
};

/// Paillier material P1 ships to P2 alongside its nonce commitment.
#[derive(Serialize, Deserialize)]
pub(crate) struct Handoff {
    pub ek: EncryptionKey,
    pub c_key: BigInt,
    pub correct_key_proof: NiCorrectKeyProof,
    pub statement: DLogStatement,
    pub dln_proof: CompositeDLogProof,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct P1Round1Msg {
    pub commitment: BigInt,
    pub handoff: Handoff,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct P2Round1Msg {
    pub nonce_point: Point<Secp256k1>,
    pub proof: DLogProof<Secp256k1, Sha256>,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct P1Round2Msg {
    pub nonce_point: Point<Secp256k1>,
    pub blind: BigInt,
    pub proof: DLogProof<Secp256k1, Sha256>,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct P2Round2Msg {
    pub ciphertext: BigInt,
}

fn weighted_share(
    share: &KeyShare,
    party: ParticipantId,
    signers: (ParticipantId, ParticipantId),
) -> ProviderResult<Scalar<Secp256k1>> {
    let secret = crate::curves::scalar_from_hex::<Secp256k1>(&share.secret_share)?;
    let lambda = lagrange_at_zero::<Secp256k1>(
        share.threshold,
        share.participants.len() as u16,
        party.0,
        &[signers.0 .0, signers.1 .0],
    );
    Ok(lambda * secret)
}

fn decode<T: for<'de> Deserialize<'de>>(raw: &str) -> ProviderResult<T> {
    serde_json::from_str(raw).map_err(ProviderError::malformed)
}

fn encode<T: Serialize>(msg: &T) -> ProviderResult<String> {
    serde_json::to_string(msg).map_err(ProviderError::malformed)
}

/// P1 signing context (participants[0] of the signer pair).
pub struct EcdsaP1 {
    w1: Scalar<Secp256k1>,
    public_key: Point<Secp256k1>,
    message_hash: Vec<u8>,
    paillier: PaillierKeypair,
    dln: DlnParams,
    round: u8,
    k1: Option<Scalar<Secp256k1>>,
    nonce_point: Option<Point<Secp256k1>>,
    blind: Option<BigInt>,
    peer_nonce_point: Option<Point<Secp256k1>>,
}

impl EcdsaP1 {
    pub fn new(
        share: &KeyShare,
        signers: (ParticipantId, ParticipantId),
        paillier: PaillierKeypair,
        dln: DlnParams,
        message_hash: &[u8],
    ) -> ProviderResult<Self> {
        Ok(Self {
            w1: weighted_share(share, signers.0, signers)?,
            public_key: point_from_hex(&share.public_key)?,
            message_hash: message_hash.to_vec(),
            paillier,
            dln,
            round: 0,
            k1: None,
            nonce_point: None,
            blind: None,
            peer_nonce_point: None,
        })
    }
}

impl EcdsaP1Context for EcdsaP1 {
    fn round1(&mut self) -> ProviderResult<String> {
        assert_eq!(self.round, 0, "ecdsa p1 round1 invoked out of order");
        self.round = 1;

        let k1 = Scalar::<Secp256k1>::random();
        let nonce_point = Point::<Secp256k1>::generator() * &k1;
        let blind = sample_blind();
        let commitment = commit(&digest_of(&nonce_point)?, &blind);

        let c_key = Paillier::encrypt(
            &self.paillier.ek,
            RawPlaintext::from(self.w1.to_bigint()),
        )
        .0
        .into_owned();

        let msg = P1Round1Msg {
            commitment,
            handoff: Handoff {
                ek: self.paillier.ek.clone(),
                c_key,
                correct_key_proof: self.paillier.correct_key_proof(),
                statement: self.dln.statement(),
                dln_proof: self.dln.prove(),
            },
        };

        self.k1 = Some(k1);
        self.nonce_point = Some(nonce_point);
        self.blind = Some(blind);
        debug!("ecdsa p1 round 1: commitment and paillier hand-off");
        encode(&msg)
    }

    fn round2(&mut self, inbound: &str) -> ProviderResult<String> {
        assert_eq!(self.round, 1, "ecdsa p1 round2 invoked out of order");
        self.round = 2;

        let msg: P2Round1Msg = decode(inbound)?;
        DLogProof::verify(&msg.proof)
            .map_err(|_| ProviderError::ProofRejected("P2 nonce proof".to_string()))?;
        if msg.proof.pk != msg.nonce_point {
            return Err(ProviderError::ProofRejected(
                "P2 nonce proof does not match nonce point".to_string(),
            ));
        }
        self.peer_nonce_point = Some(msg.nonce_point);

        let k1 = self
            .k1
            .as_ref()
            .ok_or_else(|| ProviderError::MissingMaterial("p1 nonce".to_string()))?;
        let reply = P1Round2Msg {
            nonce_point: self
                .nonce_point
                .clone()
                .ok_or_else(|| ProviderError::MissingMaterial("p1 nonce point".to_string()))?,
            blind: self
                .blind
                .clone()
                .ok_or_else(|| ProviderError::MissingMaterial("p1 blind".to_string()))?,
            proof: DLogProof::<Secp256k1, Sha256>::prove(k1),
        };
        encode(&reply)
    }

    fn round3(&mut self, inbound: &str) -> ProviderResult<EcdsaSignatureData> {
        assert_eq!(self.round, 2, "ecdsa p1 round3 invoked out of order");
        self.round = 3;

        let msg: P2Round2Msg = decode(inbound)?;
        let q = Scalar::<Secp256k1>::group_order();
        let k1 = self
            .k1
            .as_ref()
            .ok_or_else(|| ProviderError::MissingMaterial("p1 nonce".to_string()))?;
        let peer_nonce = self
            .peer_nonce_point
            .as_ref()
            .ok_or_else(|| ProviderError::MissingMaterial("p2 nonce point".to_string()))?;

        let combined = peer_nonce * k1;
        let r = combined
            .x_coord()
            .ok_or_else(|| ProviderError::Primitive("nonce point at infinity".to_string()))?
            % q;

        let decrypted = Paillier::decrypt(&self.paillier.dk, RawCiphertext::from(msg.ciphertext))
            .0
            .into_owned()
            % q;
        let k1_inv = k1
            .invert()
            .ok_or_else(|| ProviderError::Primitive("zero nonce".to_string()))?;
        let s_unnormalized = (k1_inv * Scalar::<Secp256k1>::from_bigint(&decrypted)).to_bigint();
        let s = std::cmp::min(s_unnormalized.clone(), q - &s_unnormalized);

        if !verify_bigint(&self.public_key, &self.message_hash, &r, &s) {
            return Err(ProviderError::Primitive(
                "assembled ECDSA signature failed verification".to_string(),
            ));
        }
        debug!("ecdsa p1 round 3: signature assembled and verified");
        Ok(EcdsaSignatureData {
            r: hex::encode(r.to_bytes()),
            s: hex::encode(s.to_bytes()),
        })
    }
}

/// P2 signing context (participants[1] of the signer pair).
pub struct EcdsaP2 {
    w2: Scalar<Secp256k1>,
    message: BigInt,
    round: u8,
    ek: Option<EncryptionKey>,
    c_key: Option<BigInt>,
    peer_commitment: Option<BigInt>,
    k2: Option<Scalar<Secp256k1>>,
}

impl EcdsaP2 {
    pub fn new(
        share: &KeyShare,
        signers: (ParticipantId, ParticipantId),
        message_hash: &[u8],
    ) -> ProviderResult<Self> {
        Ok(Self {
            w2: weighted_share(share, signers.1, signers)?,
            message: BigInt::from_bytes(message_hash),
            round: 0,
            ek: None,
            c_key: None,
            peer_commitment: None,
            k2: None,
        })
    }
}

impl EcdsaP2Context for EcdsaP2 {
    fn round1(&mut self, inbound: &str) -> ProviderResult<String> {
        assert_eq!(self.round, 0, "ecdsa p2 round1 invoked out of order");
        self.round = 1;

        let msg: P1Round1Msg = decode(inbound)?;
        correct_key_verify(&msg.handoff.correct_key_proof, &msg.handoff.ek)?;
        dln_verify(&msg.handoff.dln_proof, &msg.handoff.statement)?;

        self.ek = Some(msg.handoff.ek);
        self.c_key = Some(msg.handoff.c_key);
        self.peer_commitment = Some(msg.commitment);

        let k2 = Scalar::<Secp256k1>::random();
        let reply = P2Round1Msg {
            nonce_point: Point::<Secp256k1>::generator() * &k2,
            proof: DLogProof::<Secp256k1, Sha256>::prove(&k2),
        };
        self.k2 = Some(k2);
        debug!("ecdsa p2 round 1: hand-off verified, nonce proof sent");
        encode(&reply)
    }

    fn round2(&mut self, inbound: &str) -> ProviderResult<String> {
        assert_eq!(self.round, 1, "ecdsa p2 round2 invoked out of order");
        self.round = 2;

        let msg: P1Round2Msg = decode(inbound)?;
        let commitment = self
            .peer_commitment
            .as_ref()
            .ok_or_else(|| ProviderError::MissingMaterial("p1 commitment".to_string()))?;
        verify_commitment(commitment, &digest_of(&msg.nonce_point)?, &msg.blind)?;
        DLogProof::verify(&msg.proof)
            .map_err(|_| ProviderError::ProofRejected("P1 nonce proof".to_string()))?;
        if msg.proof.pk != msg.nonce_point {
            return Err(ProviderError::ProofRejected(
                "P1 nonce proof does not match opened commitment".to_string(),
            ));
        }

        let q = Scalar::<Secp256k1>::group_order();
        let k2 = self
            .k2
            .as_ref()
            .ok_or_else(|| ProviderError::MissingMaterial("p2 nonce".to_string()))?;
        let ek = self
            .ek
            .as_ref()
            .ok_or_else(|| ProviderError::MissingMaterial("paillier key".to_string()))?;
        let c_key = self
            .c_key
            .as_ref()
            .ok_or_else(|| ProviderError::MissingMaterial("encrypted share".to_string()))?;

        let combined = &msg.nonce_point * k2;
        let r = combined
            .x_coord()
            .ok_or_else(|| ProviderError::Primitive("nonce point at infinity".to_string()))?
            % q;
        let r_scalar = Scalar::<Secp256k1>::from_bigint(&r);
        let k2_inv = k2
            .invert()
            .ok_or_else(|| ProviderError::Primitive("zero nonce".to_string()))?;

        // v = k2^-1 (m + r w2) mod q, u = k2^-1 r mod q; the masked plaintext
        // v + rho q hides v while decrypting to v mod q.
        let m_scalar = Scalar::<Secp256k1>::from_bigint(&self.message);
        let v = k2_inv.clone() * (m_scalar + r_scalar.clone() * &self.w2);
        let u = k2_inv * r_scalar;
        let rho = BigInt::sample_below(&(q * q));
        let masked = v.to_bigint() + rho * q;

        let c_v = Paillier::encrypt(ek, RawPlaintext::from(masked));
        let c_u = Paillier::mul(
            ek,
            RawCiphertext::from(c_key.clone()),
            RawPlaintext::from(u.to_bigint()),
        );
        let ciphertext = Paillier::add(ek, c_v, c_u).0.into_owned();

        debug!("ecdsa p2 round 2: partial signature ciphertext produced");
        encode(&P2Round2Msg { ciphertext })
    }
}

fn verify_bigint(
    public_key: &Point<Secp256k1>,
    message_hash: &[u8],
    r: &BigInt,
    s: &BigInt,
) -> bool {
    let q = Scalar::<Secp256k1>::group_order();
    if r <= &BigInt::zero() || r >= q || s <= &BigInt::zero() || s >= q {
        return false;
    }
    let s_inv = match BigInt::mod_inv(s, q) {
        Some(inv) => inv,
        None => return false,
    };
    let m = BigInt::from_bytes(message_hash) % q;
    let u1 = Scalar::<Secp256k1>::from_bigint(&BigInt::mod_mul(&m, &s_inv, q));
    let u2 = Scalar::<Secp256k1>::from_bigint(&BigInt::mod_mul(r, &s_inv, q));
    let point = Point::<Secp256k1>::generator() * &u1 + public_key * &u2;
    match point.x_coord() {
        Some(x) => x % q == *r,
        None => false,
    }
}

/// Verify an ECDSA signature against a hex-encoded compressed public key and
/// a message hash.
pub fn ecdsa_verify(
    public_key: &str,
    message_hash: &[u8],
    signature: &EcdsaSignatureData,
) -> bool {
    let Ok(point) = point_from_hex::<Secp256k1>(public_key) else {
        return false;
    };
    let (Ok(r), Ok(s)) = (hex::decode(&signature.r), hex::decode(&signature.s)) else {
        return false;
    };
    verify_bigint(
        &point,
        message_hash,
        &BigInt::from_bytes(&r),
        &BigInt::from_bytes(&s),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dkg::tests::run_dkg;
    use sha2::Digest;

    pub(crate) fn run_sign(
        shares: &[KeyShare],
        signers: (u16, u16),
        message_hash: &[u8],
    ) -> EcdsaSignatureData {
        let pair = (ParticipantId(signers.0), ParticipantId(signers.1));
        let mut p1 = EcdsaP1::new(
            &shares[(signers.0 - 1) as usize],
            pair,
            PaillierKeypair::generate(),
            DlnParams::generate(),
            message_hash,
        )
        .unwrap();
        let mut p2 = EcdsaP2::new(&shares[(signers.1 - 1) as usize], pair, message_hash).unwrap();

        let m1 = p1.round1().unwrap();
        let m2 = p2.round1(&m1).unwrap();
        let m3 = p1.round2(&m2).unwrap();
        let m4 = p2.round2(&m3).unwrap();
        p1.round3(&m4).unwrap()
    }

    #[test]
    fn two_party_signature_verifies() {
        let shares = run_dkg::<Secp256k1>(2, 2);
        let hash = sha2::Sha256::digest(b"Hello, ECDSA MPC!");
        let signature = run_sign(&shares, (1, 2), &hash);
        assert!(ecdsa_verify(&shares[0].public_key, &hash, &signature));
    }

    #[test]
    fn threshold_pair_from_three_party_key_signs() {
        let shares = run_dkg::<Secp256k1>(3, 2);
        let hash = sha2::Sha256::digest(b"Hello, ECDSA MPC!");
        let signature = run_sign(&shares, (1, 3), &hash);
        assert!(ecdsa_verify(&shares[0].public_key, &hash, &signature));
    }

    #[test]
    fn signature_rejects_wrong_message() {
        let shares = run_dkg::<Secp256k1>(2, 2);
        let hash = sha2::Sha256::digest(b"Hello, ECDSA MPC!");
        let signature = run_sign(&shares, (1, 2), &hash);
        let other = sha2::Sha256::digest(b"another message");
        assert!(!ecdsa_verify(&shares[0].public_key, &other, &signature));
    }
}
