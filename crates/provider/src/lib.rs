//! Crypto provider: the only crate that touches primitive libraries.
//!
//! The protocol engine stays curve- and scheme-agnostic; it drives the
//! [`CryptoProvider`] capability set and treats every sub-message as an
//! opaque string. [`CurvProvider`] is the production implementation built on
//! the curv/kzen stack (Feldman VSS, Schnorr proofs, Paillier, DLN proofs).
//!
//! Setup objects expose `round1`/`round2`/`round3` with strictly increasing
//! invocation order. Calling a round out of order is a caller bug and
//! panics; it is not a recoverable condition.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use tss_types::{CurveKind, ParticipantId};

mod curves;
mod dkg;
mod ecdsa;
mod eddsa;
mod paillier_support;
mod refresh;

pub use ecdsa::{ecdsa_verify, EcdsaP1, EcdsaP2};
pub use eddsa::{ed25519_verify, Ed25519Signer};
pub use paillier_support::{DlnParams, PaillierKeypair};

/// Errors surfaced by primitive calls. The coordinator converts these into
/// `session_failed` transitions; they are never retried.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("primitive failure: {0}")]
    Primitive(String),
    #[error("proof rejected: {0}")]
    ProofRejected(String),
    #[error("malformed sub-message: {0}")]
    Malformed(String),
    #[error("missing material: {0}")]
    MissingMaterial(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

impl ProviderError {
    pub(crate) fn malformed(e: impl std::fmt::Display) -> Self {
        ProviderError::Malformed(e.to_string())
    }
}

/// A participant's slice of a threshold key, plus the public material every
/// holder shares. Scalars and points are hex-encoded so the struct can cross
/// crate boundaries and live in the in-memory key store without dragging
/// curve types along.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyShare {
    pub participant_id: ParticipantId,
    pub threshold: u16,
    pub participants: Vec<ParticipantId>,
    pub curve: CurveKind,
    /// Secret scalar, hex big-endian. Never leaves the process except in
    /// completion notifications, which are explicitly demo-grade.
    pub secret_share: String,
    /// Group public key, hex compressed point.
    pub public_key: String,
    /// Per-participant public shares, hex compressed points.
    pub public_shares: BTreeMap<u16, String>,
}

/// Result of a refresh: the replacement share plus the one it supersedes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshOutcome {
    pub key_share: KeyShare,
    pub old_share: String,
}

/// ECDSA signature, hex big-endian scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcdsaSignatureData {
    pub r: String,
    pub s: String,
}

/// Ed25519 signature: 32-byte R point and 32-byte s scalar, hex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ed25519SignatureData {
    pub r: String,
    pub s: String,
}

impl Ed25519SignatureData {
    /// Canonical 64-byte `R || s` rendering.
    pub fn combined(&self) -> String {
        format!("{}{}", self.r, self.s)
    }
}

/// Per-peer sub-messages produced by one round action, keyed by destination.
pub type OutboundMap = BTreeMap<ParticipantId, String>;

/// Inbound sub-messages for one round, tagged with their source.
pub type InboundList = [(ParticipantId, String)];

/// Three-round distributed key generation.
pub trait DkgSetup: Send {
    fn round1(&mut self) -> ProviderResult<OutboundMap>;
    fn round2(&mut self, inbound: &InboundList) -> ProviderResult<OutboundMap>;
    fn round3(&mut self, inbound: &InboundList) -> ProviderResult<KeyShare>;
}

/// Three-round share refresh. Structurally identical to DKG; seeded with the
/// holder's current share (or none, for a holder whose share is being
/// reconstructed) and the devote pair contributing secret material.
pub trait RefreshSetup: Send {
    fn round1(&mut self) -> ProviderResult<OutboundMap>;
    fn round2(&mut self, inbound: &InboundList) -> ProviderResult<OutboundMap>;
    fn round3(&mut self, inbound: &InboundList) -> ProviderResult<RefreshOutcome>;
}

/// P1 side of the two-party ECDSA signing flow.
pub trait EcdsaP1Context: Send {
    /// Nonce commitment plus the Paillier hand-off bundle.
    fn round1(&mut self) -> ProviderResult<String>;
    /// Consumes P2's Schnorr proof and nonce point; opens the commitment.
    fn round2(&mut self, inbound: &str) -> ProviderResult<String>;
    /// Consumes the homomorphically evaluated ciphertext; produces (r, s),
    /// verified against the group key before it is returned.
    fn round3(&mut self, inbound: &str) -> ProviderResult<EcdsaSignatureData>;
}

/// P2 side of the two-party ECDSA signing flow.
pub trait EcdsaP2Context: Send {
    /// Consumes P1's commitment and hand-off bundle; produces proof + nonce.
    fn round1(&mut self, inbound: &str) -> ProviderResult<String>;
    /// Consumes P1's decommitment; produces the evaluated ciphertext.
    fn round2(&mut self, inbound: &str) -> ProviderResult<String>;
}

/// Symmetric two-party Ed25519 signing: commit, reveal, partial signature,
/// then a local combine step once the peer's partial arrives.
pub trait Ed25519SignContext: Send {
    fn round1(&mut self) -> ProviderResult<String>;
    fn round2(&mut self, inbound: &str) -> ProviderResult<String>;
    fn round3(&mut self, inbound: &str) -> ProviderResult<String>;
    fn finalize(&mut self, inbound: &str) -> ProviderResult<Ed25519SignatureData>;
}

/// Capability set the protocol engine programs against.
pub trait CryptoProvider: Send + Sync {
    fn new_dkg_setup(
        &self,
        party: ParticipantId,
        participants: &[ParticipantId],
        threshold: u16,
        curve: CurveKind,
    ) -> ProviderResult<Box<dyn DkgSetup>>;

    #[allow(clippy::too_many_arguments)]
    fn new_refresh_setup(
        &self,
        party: ParticipantId,
        participants: &[ParticipantId],
        threshold: u16,
        devote: (ParticipantId, ParticipantId),
        share: Option<&KeyShare>,
        group_public_key: &str,
        curve: CurveKind,
    ) -> ProviderResult<Box<dyn RefreshSetup>>;

    fn new_ecdsa_p1(
        &self,
        share: &KeyShare,
        signers: (ParticipantId, ParticipantId),
        paillier: &PaillierKeypair,
        dln: &DlnParams,
        message_hash: &[u8],
    ) -> ProviderResult<Box<dyn EcdsaP1Context>>;

    fn new_ecdsa_p2(
        &self,
        share: &KeyShare,
        signers: (ParticipantId, ParticipantId),
        message_hash: &[u8],
    ) -> ProviderResult<Box<dyn EcdsaP2Context>>;

    fn new_ed25519_sign(
        &self,
        share: &KeyShare,
        signers: (ParticipantId, ParticipantId),
        message_hash: &[u8],
    ) -> ProviderResult<Box<dyn Ed25519SignContext>>;

    /// Paillier keypair for the ECDSA hand-off. Expensive; callers cache it.
    fn paillier_keypair(&self) -> ProviderResult<PaillierKeypair>;

    /// Pedersen parameters (N~, h1, h2) with the trapdoor retained for DLN
    /// proof generation.
    fn pedersen_parameters(&self) -> ProviderResult<DlnParams>;
}

/// Production provider over the curv/kzen primitive stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct CurvProvider;

impl CurvProvider {
    pub fn new() -> Self {
        CurvProvider
    }
}

impl CryptoProvider for CurvProvider {
    fn new_dkg_setup(
        &self,
        party: ParticipantId,
        participants: &[ParticipantId],
        threshold: u16,
        curve: CurveKind,
    ) -> ProviderResult<Box<dyn DkgSetup>> {
        match curve {
            CurveKind::Secp256k1 => Ok(Box::new(dkg::DkgParty::<
                curv::elliptic::curves::Secp256k1,
            >::new(party, participants, threshold)?)),
            CurveKind::Ed25519 => Ok(Box::new(
                dkg::DkgParty::<curv::elliptic::curves::Ed25519>::new(
                    party,
                    participants,
                    threshold,
                )?,
            )),
        }
    }

    fn new_refresh_setup(
        &self,
        party: ParticipantId,
        participants: &[ParticipantId],
        threshold: u16,
        devote: (ParticipantId, ParticipantId),
        share: Option<&KeyShare>,
        group_public_key: &str,
        curve: CurveKind,
    ) -> ProviderResult<Box<dyn RefreshSetup>> {
        match curve {
            CurveKind::Secp256k1 => Ok(Box::new(refresh::RefreshParty::<
                curv::elliptic::curves::Secp256k1,
            >::new(
                party, participants, threshold, devote, share, group_public_key,
            )?)),
            CurveKind::Ed25519 => Ok(Box::new(refresh::RefreshParty::<
                curv::elliptic::curves::Ed25519,
            >::new(
                party, participants, threshold, devote, share, group_public_key,
            )?)),
        }
    }

    fn new_ecdsa_p1(
        &self,
        share: &KeyShare,
        signers: (ParticipantId, ParticipantId),
        paillier: &PaillierKeypair,
        dln: &DlnParams,
        message_hash: &[u8],
    ) -> ProviderResult<Box<dyn EcdsaP1Context>> {
        Ok(Box::new(EcdsaP1::new(
            share,
            signers,
            paillier.clone(),
            dln.clone(),
            message_hash,
        )?))
    }

    fn new_ecdsa_p2(
        &self,
        share: &KeyShare,
        signers: (ParticipantId, ParticipantId),
        message_hash: &[u8],
    ) -> ProviderResult<Box<dyn EcdsaP2Context>> {
        Ok(Box::new(EcdsaP2::new(share, signers, message_hash)?))
    }

    fn new_ed25519_sign(
        &self,
        share: &KeyShare,
        signers: (ParticipantId, ParticipantId),
        message_hash: &[u8],
    ) -> ProviderResult<Box<dyn Ed25519SignContext>> {
        Ok(Box::new(Ed25519Signer::new(share, signers, message_hash)?))
    }

    fn paillier_keypair(&self) -> ProviderResult<PaillierKeypair> {
        Ok(PaillierKeypair::generate())
    }

    fn pedersen_parameters(&self) -> ProviderResult<DlnParams> {
        Ok(DlnParams::generate())
    }
}
