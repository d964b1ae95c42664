//! Feldman-VSS distributed key generation, generic over the curve.
//!
//! Round 1 broadcasts a hash commitment to the party's VSS commitment
//! vector. Round 2 reveals the vector together with the dealt share for each
//! destination and a Schnorr proof of the secret contribution. Round 3
//! verifies everything and combines the dealt shares into the local key
//! share.

use curv::cryptographic_primitives::proofs::sigma_dlog::DLogProof;
use curv::cryptographic_primitives::secret_sharing::feldman_vss::VerifiableSS;
use curv::elliptic::curves::{Curve, Point, Scalar};
use curv::BigInt;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use tracing::debug;

use tss_types::ParticipantId;

use crate::curves::{
    commit, digest_of, eval_commitments, point_to_hex, sample_blind, scalar_to_hex,
    verify_commitment,
};
use crate::{DkgSetup, KeyShare, OutboundMap, ProviderError, ProviderResult};

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Round1Msg {
    pub commitment: BigInt,
}

#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "E: Curve", deserialize = "E: Curve"))]
pub(crate) struct Round2Msg<E: Curve> {
    pub vss: VerifiableSS<E, Sha256>,
    pub share: Scalar<E>,
    pub blind: BigInt,
    pub proof: DLogProof<E, Sha256>,
}

pub(crate) struct DkgParty<E: Curve> {
    party: ParticipantId,
    participants: Vec<ParticipantId>,
    threshold: u16,
    round: u8,
    vss: Option<VerifiableSS<E, Sha256>>,
    dealt: Vec<Scalar<E>>,
    blind: Option<BigInt>,
    proof: Option<DLogProof<E, Sha256>>,
    peer_commitments: BTreeMap<ParticipantId, BigInt>,
}

impl<E: Curve> DkgParty<E> {
    pub(crate) fn new(
        party: ParticipantId,
        participants: &[ParticipantId],
        threshold: u16,
    ) -> ProviderResult<Self> {
        validate_members(party, participants, threshold)?;
        Ok(Self {
            party,
            participants: participants.to_vec(),
            threshold,
            round: 0,
            vss: None,
            dealt: Vec::new(),
            blind: None,
            proof: None,
            peer_commitments: BTreeMap::new(),
        })
    }

    fn peers(&self) -> impl Iterator<Item = ParticipantId> + '_ {
        self.participants.iter().copied().filter(|p| *p != self.party)
    }

    fn encode<T: Serialize>(msg: &T) -> ProviderResult<String> {
        serde_json::to_string(msg).map_err(ProviderError::malformed)
    }
}

impl<E: Curve> DkgSetup for DkgParty<E> {
    fn round1(&mut self) -> ProviderResult<OutboundMap> {
        assert_eq!(self.round, 0, "dkg round1 invoked out of order");
        self.round = 1;

        let secret = Scalar::<E>::random();
        let n = self.participants.len() as u16;
        let (vss, shares) = VerifiableSS::<E, Sha256>::share(self.threshold - 1, n, &secret);
        let blind = sample_blind();
        let commitment = commit(&digest_of(&vss.commitments)?, &blind);
        let proof = DLogProof::<E, Sha256>::prove(&secret);

        self.dealt = shares.to_vec();
        self.vss = Some(vss);
        self.blind = Some(blind);
        self.proof = Some(proof);

        let msg = Self::encode(&Round1Msg { commitment })?;
        debug!(party = %self.party, "dkg round 1 commitment dealt");
        Ok(self.peers().map(|p| (p, msg.clone())).collect())
    }

    fn round2(&mut self, inbound: &crate::InboundList) -> ProviderResult<OutboundMap> {
        assert_eq!(self.round, 1, "dkg round2 invoked out of order");
        self.round = 2;

        for (from, raw) in inbound {
            let msg: Round1Msg = serde_json::from_str(raw).map_err(ProviderError::malformed)?;
            self.peer_commitments.insert(*from, msg.commitment);
        }

        let vss = self
            .vss
            .as_ref()
            .ok_or_else(|| ProviderError::MissingMaterial("round1 state".to_string()))?;
        let blind = self
            .blind
            .as_ref()
            .ok_or_else(|| ProviderError::MissingMaterial("round1 blind".to_string()))?;
        let proof = self
            .proof
            .as_ref()
            .ok_or_else(|| ProviderError::MissingMaterial("round1 proof".to_string()))?;

        let mut out = OutboundMap::new();
        for peer in self.peers() {
            let share = self.dealt[(peer.0 - 1) as usize].clone();
            out.insert(
                peer,
                Self::encode(&Round2Msg::<E> {
                    vss: vss.clone(),
                    share,
                    blind: blind.clone(),
                    proof: proof.clone(),
                })?,
            );
        }
        Ok(out)
    }

    fn round3(&mut self, inbound: &crate::InboundList) -> ProviderResult<KeyShare> {
        assert_eq!(self.round, 2, "dkg round3 invoked out of order");
        self.round = 3;

        let own_vss = self
            .vss
            .take()
            .ok_or_else(|| ProviderError::MissingMaterial("round1 state".to_string()))?;

        let mut schemes: Vec<(ParticipantId, VerifiableSS<E, Sha256>)> = vec![(self.party, own_vss)];
        let mut secret = self.dealt[(self.party.0 - 1) as usize].clone();

        for (from, raw) in inbound {
            let msg: Round2Msg<E> = serde_json::from_str(raw).map_err(ProviderError::malformed)?;
            let commitment = self.peer_commitments.get(from).ok_or_else(|| {
                ProviderError::MissingMaterial(format!("round1 commitment from {from}"))
            })?;
            verify_commitment(commitment, &digest_of(&msg.vss.commitments)?, &msg.blind)?;
            DLogProof::verify(&msg.proof).map_err(|_| {
                ProviderError::ProofRejected(format!("contribution proof from {from}"))
            })?;
            if msg.proof.pk != msg.vss.commitments[0] {
                return Err(ProviderError::ProofRejected(format!(
                    "contribution proof from {from} does not match commitment"
                )));
            }
            msg.vss
                .validate_share(&msg.share, self.party.0)
                .map_err(|_| {
                    ProviderError::ProofRejected(format!("dealt share from {from} invalid"))
                })?;

            secret = secret + &msg.share;
            schemes.push((*from, msg.vss));
        }

        let public_key = schemes
            .iter()
            .map(|(_, vss)| vss.commitments[0].clone())
            .reduce(|a, b| a + b)
            .ok_or_else(|| ProviderError::MissingMaterial("vss contributions".to_string()))?;

        let mut public_shares = BTreeMap::new();
        for p in &self.participants {
            let point = schemes
                .iter()
                .map(|(_, vss)| eval_commitments(&vss.commitments, p.0))
                .reduce(|a, b| a + b)
                .ok_or_else(|| ProviderError::MissingMaterial("vss contributions".to_string()))?;
            public_shares.insert(p.0, point_to_hex(&point));
        }

        // Local consistency: the combined share must sit on the combined
        // commitment polynomial.
        let expected = Point::<E>::generator() * &secret;
        if point_to_hex(&expected)
            != public_shares
                .get(&self.party.0)
                .cloned()
                .unwrap_or_default()
        {
            return Err(ProviderError::Primitive(
                "combined share inconsistent with commitments".to_string(),
            ));
        }

        debug!(party = %self.party, "dkg complete");
        Ok(KeyShare {
            participant_id: self.party,
            threshold: self.threshold,
            participants: self.participants.clone(),
            curve: curve_kind::<E>(),
            secret_share: scalar_to_hex(&secret),
            public_key: point_to_hex(&public_key),
            public_shares,
        })
    }
}

/// Curve tag for a curv curve type. The provider only instantiates the two
/// curves the coordinator knows about.
pub(crate) fn curve_kind<E: Curve>() -> tss_types::CurveKind {
    if E::CURVE_NAME == curv::elliptic::curves::Ed25519::CURVE_NAME {
        tss_types::CurveKind::Ed25519
    } else {
        tss_types::CurveKind::Secp256k1
    }
}

pub(crate) fn validate_members(
    party: ParticipantId,
    participants: &[ParticipantId],
    threshold: u16,
) -> ProviderResult<()> {
    let n = participants.len() as u16;
    if threshold == 0 || threshold > n {
        return Err(ProviderError::Primitive(format!(
            "threshold {threshold} out of range for {n} participants"
        )));
    }
    // Dealt shares are evaluated at the participant id, so ids must be the
    // contiguous range 1..=N.
    let mut sorted: Vec<u16> = participants.iter().map(|p| p.0).collect();
    sorted.sort_unstable();
    if sorted != (1..=n).collect::<Vec<u16>>() {
        return Err(ProviderError::Primitive(format!(
            "participant ids must be 1..={n}"
        )));
    }
    if !participants.contains(&party) {
        return Err(ProviderError::Primitive(format!(
            "party {party} not in participant set"
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::curves::{lagrange_at_zero, point_from_hex, scalar_from_hex};
    use crate::DkgSetup;
    use curv::elliptic::curves::{Ed25519, Secp256k1};

    /// Drive a full in-memory DKG across `n` parties and return the shares.
    pub(crate) fn run_dkg<E: Curve>(n: u16, threshold: u16) -> Vec<KeyShare> {
        let ids: Vec<ParticipantId> = (1..=n).map(ParticipantId).collect();
        let mut parties: Vec<DkgParty<E>> = ids
            .iter()
            .map(|id| DkgParty::<E>::new(*id, &ids, threshold).unwrap())
            .collect();

        let round1: Vec<OutboundMap> = parties.iter_mut().map(|p| p.round1().unwrap()).collect();
        let round2: Vec<OutboundMap> = parties
            .iter_mut()
            .enumerate()
            .map(|(i, p)| {
                let inbound = gather(&ids, &round1, i);
                p.round2(&inbound).unwrap()
            })
            .collect();
        parties
            .iter_mut()
            .enumerate()
            .map(|(i, p)| {
                let inbound = gather(&ids, &round2, i);
                p.round3(&inbound).unwrap()
            })
            .collect()
    }

    /// Collect the messages destined for party `i` from every other party.
    pub(crate) fn gather(
        ids: &[ParticipantId],
        outputs: &[OutboundMap],
        recipient: usize,
    ) -> Vec<(ParticipantId, String)> {
        outputs
            .iter()
            .enumerate()
            .filter(|(sender, _)| *sender != recipient)
            .map(|(sender, out)| (ids[sender], out[&ids[recipient]].clone()))
            .collect()
    }

    #[test]
    fn three_party_dkg_agrees_on_public_key() {
        let shares = run_dkg::<Secp256k1>(3, 2);
        assert_eq!(shares[0].public_key, shares[1].public_key);
        assert_eq!(shares[1].public_key, shares[2].public_key);
        for share in &shares {
            assert_ne!(share.secret_share, "");
            assert_eq!(share.public_shares.len(), 3);
        }
    }

    #[test]
    fn any_two_shares_reconstruct_the_key() {
        let shares = run_dkg::<Secp256k1>(3, 2);
        let q = point_from_hex::<Secp256k1>(&shares[0].public_key).unwrap();
        for subset in [[1u16, 2], [1, 3], [2, 3]] {
            let mut secret = Scalar::<Secp256k1>::zero();
            for id in subset {
                let x = scalar_from_hex::<Secp256k1>(
                    &shares[(id - 1) as usize].secret_share,
                )
                .unwrap();
                secret = secret + lagrange_at_zero::<Secp256k1>(2, 3, id, &subset) * x;
            }
            assert_eq!(Point::<Secp256k1>::generator() * &secret, q);
        }
    }

    #[test]
    fn ed25519_dkg_produces_nonzero_shares_below_order() {
        let shares = run_dkg::<Ed25519>(3, 2);
        assert_eq!(shares[0].public_key, shares[2].public_key);
        for share in &shares {
            let scalar = scalar_from_hex::<Ed25519>(&share.secret_share).unwrap();
            assert!(!scalar.is_zero());
        }
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn round_reinvocation_panics() {
        let ids: Vec<ParticipantId> = (1..=3).map(ParticipantId).collect();
        let mut party = DkgParty::<Secp256k1>::new(ids[0], &ids, 2).unwrap();
        party.round1().unwrap();
        let _ = party.round1();
    }

    #[test]
    fn rejects_non_contiguous_ids() {
        let ids = vec![ParticipantId(1), ParticipantId(2), ParticipantId(5)];
        assert!(DkgParty::<Secp256k1>::new(ids[0], &ids, 2).is_err());
    }
}
