//! Share refresh with a two-member devote list.
//!
//! The two devoted participants re-share their Lagrange-weighted shares with
//! fresh polynomials; the dealt secrets sum to the group secret, so the
//! group public key is invariant while every share (including a lost one)
//! is replaced. Non-devote participants still send an empty contribution
//! every round, so fan-in stays uniform at N-1.

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
    commit, digest_of, eval_commitments, lagrange_at_zero, point_from_hex, point_to_hex,
    sample_blind, scalar_from_hex, scalar_to_hex, verify_commitment,
};
use crate::dkg::{curve_kind, validate_members};
use crate::{
    KeyShare, OutboundMap, ProviderError, ProviderResult, RefreshOutcome, RefreshSetup,
};

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RefreshRound1Msg {
    /// Present only for devote members.
    pub commitment: Option<BigInt>,
}

#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "E: Curve", deserialize = "E: Curve"))]
pub(crate) struct Contribution<E: Curve> {
    pub vss: VerifiableSS<E, Sha256>,
    pub share: Scalar<E>,
    pub blind: BigInt,
    pub proof: DLogProof<E, Sha256>,
}

#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "E: Curve", deserialize = "E: Curve"))]
pub(crate) struct RefreshRound2Msg<E: Curve> {
    pub contribution: Option<Contribution<E>>,
}

pub(crate) struct RefreshParty<E: Curve> {
    party: ParticipantId,
    participants: Vec<ParticipantId>,
    threshold: u16,
    devote: (ParticipantId, ParticipantId),
    old_share: Option<Scalar<E>>,
    group_public_key: Point<E>,
    round: u8,
    vss: Option<VerifiableSS<E, Sha256>>,
    dealt: Vec<Scalar<E>>,
    blind: Option<BigInt>,
    proof: Option<DLogProof<E, Sha256>>,
    peer_commitments: BTreeMap<ParticipantId, BigInt>,
}

impl<E: Curve> RefreshParty<E> {
    pub(crate) fn new(
        party: ParticipantId,
        participants: &[ParticipantId],
        threshold: u16,
        devote: (ParticipantId, ParticipantId),
        share: Option<&KeyShare>,
        group_public_key: &str,
    ) -> ProviderResult<Self> {
        validate_members(party, participants, threshold)?;
        if threshold != 2 {
            // Two devoted members can only reconstruct a degree-1 secret.
            return Err(ProviderError::Primitive(format!(
                "a two-member devote list requires threshold 2, got {threshold}"
            )));
        }
        if devote.0 == devote.1
            || !participants.contains(&devote.0)
            || !participants.contains(&devote.1)
        {
            return Err(ProviderError::Primitive(format!(
                "devote pair ({}, {}) invalid for participant set",
                devote.0, devote.1
            )));
        }
        let is_devote = party == devote.0 || party == devote.1;
        let old_share = match share {
            Some(ks) => Some(scalar_from_hex::<E>(&ks.secret_share)?),
            None if is_devote => {
                return Err(ProviderError::MissingMaterial(format!(
                    "devote member {party} has no share to contribute"
                )))
            }
            None => None,
        };
        Ok(Self {
            party,
            participants: participants.to_vec(),
            threshold,
            devote,
            old_share,
            group_public_key: point_from_hex(group_public_key)?,
            round: 0,
            vss: None,
            dealt: Vec::new(),
            blind: None,
            proof: None,
            peer_commitments: BTreeMap::new(),
        })
    }

    fn is_devote(&self) -> bool {
        self.party == self.devote.0 || self.party == self.devote.1
    }

    fn peers(&self) -> impl Iterator<Item = ParticipantId> + '_ {
        self.participants.iter().copied().filter(|p| *p != self.party)
    }

    fn encode<T: Serialize>(msg: &T) -> ProviderResult<String> {
        serde_json::to_string(msg).map_err(ProviderError::malformed)
    }

    fn local_contribution(&self) -> ProviderResult<Option<Contribution<E>>> {
        if !self.is_devote() {
            return Ok(None);
        }
        let vss = self
            .vss
            .as_ref()
            .ok_or_else(|| ProviderError::MissingMaterial("round1 state".to_string()))?;
        Ok(Some(Contribution {
            vss: vss.clone(),
            share: self.dealt[(self.party.0 - 1) as usize].clone(),
            blind: self
                .blind
                .clone()
                .ok_or_else(|| ProviderError::MissingMaterial("round1 blind".to_string()))?,
            proof: self
                .proof
                .clone()
                .ok_or_else(|| ProviderError::MissingMaterial("round1 proof".to_string()))?,
        }))
    }
}

impl<E: Curve> RefreshSetup for RefreshParty<E> {
    fn round1(&mut self) -> ProviderResult<OutboundMap> {
        assert_eq!(self.round, 0, "refresh round1 invoked out of order");
        self.round = 1;

        let commitment = if self.is_devote() {
            let old_share = self
                .old_share
                .as_ref()
                .ok_or_else(|| ProviderError::MissingMaterial("devote share".to_string()))?;
            let lambda = lagrange_at_zero::<E>(
                self.threshold,
                self.participants.len() as u16,
                self.party.0,
                &[self.devote.0 .0, self.devote.1 .0],
            );
            let weighted = lambda * old_share;
            let n = self.participants.len() as u16;
            let (vss, shares) = VerifiableSS::<E, Sha256>::share(self.threshold - 1, n, &weighted);
            let blind = sample_blind();
            let commitment = commit(&digest_of(&vss.commitments)?, &blind);
            self.proof = Some(DLogProof::<E, Sha256>::prove(&weighted));
            self.dealt = shares.to_vec();
            self.vss = Some(vss);
            self.blind = Some(blind);
            Some(commitment)
        } else {
            None
        };

        let msg = Self::encode(&RefreshRound1Msg { commitment })?;
        debug!(party = %self.party, devote = self.is_devote(), "refresh round 1");
        Ok(self.peers().map(|p| (p, msg.clone())).collect())
    }

    fn round2(&mut self, inbound: &crate::InboundList) -> ProviderResult<OutboundMap> {
        assert_eq!(self.round, 1, "refresh round2 invoked out of order");
        self.round = 2;

        for (from, raw) in inbound {
            let msg: RefreshRound1Msg =
                serde_json::from_str(raw).map_err(ProviderError::malformed)?;
            if let Some(commitment) = msg.commitment {
                self.peer_commitments.insert(*from, commitment);
            }
        }

        let mut out = OutboundMap::new();
        for peer in self.peers() {
            let contribution = if self.is_devote() {
                let vss = self
                    .vss
                    .as_ref()
                    .ok_or_else(|| ProviderError::MissingMaterial("round1 state".to_string()))?;
                Some(Contribution {
                    vss: vss.clone(),
                    share: self.dealt[(peer.0 - 1) as usize].clone(),
                    blind: self.blind.clone().ok_or_else(|| {
                        ProviderError::MissingMaterial("round1 blind".to_string())
                    })?,
                    proof: self.proof.clone().ok_or_else(|| {
                        ProviderError::MissingMaterial("round1 proof".to_string())
                    })?,
                })
            } else {
                None
            };
            out.insert(peer, Self::encode(&RefreshRound2Msg { contribution })?);
        }
        Ok(out)
    }

    fn round3(&mut self, inbound: &crate::InboundList) -> ProviderResult<RefreshOutcome> {
        assert_eq!(self.round, 2, "refresh round3 invoked out of order");
        self.round = 3;

        let mut contributions: BTreeMap<ParticipantId, Contribution<E>> = BTreeMap::new();
        if let Some(own) = self.local_contribution()? {
            contributions.insert(self.party, own);
        }
        for (from, raw) in inbound {
            let msg: RefreshRound2Msg<E> =
                serde_json::from_str(raw).map_err(ProviderError::malformed)?;
            let Some(contribution) = msg.contribution else {
                continue;
            };
            if *from != self.devote.0 && *from != self.devote.1 {
                // Secret material from outside the devote list is ignored.
                continue;
            }
            let commitment = self.peer_commitments.get(from).ok_or_else(|| {
                ProviderError::MissingMaterial(format!("round1 commitment from {from}"))
            })?;
            verify_commitment(
                commitment,
                &digest_of(&contribution.vss.commitments)?,
                &contribution.blind,
            )?;
            DLogProof::verify(&contribution.proof).map_err(|_| {
                ProviderError::ProofRejected(format!("refresh proof from {from}"))
            })?;
            if contribution.proof.pk != contribution.vss.commitments[0] {
                return Err(ProviderError::ProofRejected(format!(
                    "refresh proof from {from} does not match commitment"
                )));
            }
            contribution
                .vss
                .validate_share(&contribution.share, self.party.0)
                .map_err(|_| {
                    ProviderError::ProofRejected(format!("dealt share from {from} invalid"))
                })?;
            contributions.insert(*from, contribution);
        }

        if contributions.len() != 2 {
            return Err(ProviderError::MissingMaterial(format!(
                "expected contributions from devote pair ({}, {}), got {}",
                self.devote.0,
                self.devote.1,
                contributions.len()
            )));
        }

        // The dealt constant terms must sum back to the group key; a devote
        // member contributing the wrong weighted share is caught here.
        let combined_key = contributions
            .values()
            .map(|c| c.vss.commitments[0].clone())
            .reduce(|a, b| a + b)
            .ok_or_else(|| ProviderError::MissingMaterial("contributions".to_string()))?;
        if combined_key != self.group_public_key {
            return Err(ProviderError::Primitive(
                "refresh would change the group public key".to_string(),
            ));
        }

        let mut new_share = Scalar::<E>::zero();
        for contribution in contributions.values() {
            new_share = new_share + &contribution.share;
        }

        let mut public_shares = BTreeMap::new();
        for p in &self.participants {
            let point = contributions
                .values()
                .map(|c| eval_commitments(&c.vss.commitments, p.0))
                .reduce(|a, b| a + b)
                .ok_or_else(|| ProviderError::MissingMaterial("contributions".to_string()))?;
            public_shares.insert(p.0, point_to_hex(&point));
        }

        let old_share = self
            .old_share
            .as_ref()
            .map(scalar_to_hex)
            .unwrap_or_default();
        debug!(party = %self.party, "refresh complete, group key preserved");
        Ok(RefreshOutcome {
            key_share: KeyShare {
                participant_id: self.party,
                threshold: self.threshold,
                participants: self.participants.clone(),
                curve: curve_kind::<E>(),
                secret_share: scalar_to_hex(&new_share),
                public_key: point_to_hex(&self.group_public_key),
                public_shares,
            },
            old_share,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dkg::tests::{gather, run_dkg};
    use curv::elliptic::curves::Ed25519;

    /// Drive a refresh over existing shares; `lost` parties contribute nil.
    pub(crate) fn run_refresh<E: Curve>(
        shares: &[KeyShare],
        devote: (u16, u16),
        lost: &[u16],
    ) -> Vec<RefreshOutcome> {
        let ids: Vec<ParticipantId> = shares.iter().map(|s| s.participant_id).collect();
        let public_key = shares[0].public_key.clone();
        let mut parties: Vec<RefreshParty<E>> = shares
            .iter()
            .map(|share| {
                let seed = if lost.contains(&share.participant_id.0) {
                    None
                } else {
                    Some(share)
                };
                RefreshParty::<E>::new(
                    share.participant_id,
                    &ids,
                    share.threshold,
                    (ParticipantId(devote.0), ParticipantId(devote.1)),
                    seed,
                    &public_key,
                )
                .unwrap()
            })
            .collect();

        let round1: Vec<OutboundMap> = parties.iter_mut().map(|p| p.round1().unwrap()).collect();
        let round2: Vec<OutboundMap> = parties
            .iter_mut()
            .enumerate()
            .map(|(i, p)| p.round2(&gather(&ids, &round1, i)).unwrap())
            .collect();
        parties
            .iter_mut()
            .enumerate()
            .map(|(i, p)| p.round3(&gather(&ids, &round2, i)).unwrap())
            .collect()
    }

    #[test]
    fn refresh_preserves_group_key_and_replaces_shares() {
        let shares = run_dkg::<Ed25519>(3, 2);
        let outcomes = run_refresh::<Ed25519>(&shares, (1, 3), &[]);
        for (old, outcome) in shares.iter().zip(&outcomes) {
            assert_eq!(outcome.key_share.public_key, old.public_key);
            assert_ne!(outcome.key_share.secret_share, old.secret_share);
            assert_eq!(outcome.old_share, old.secret_share);
        }
    }

    #[test]
    fn refresh_reconstructs_a_lost_share() {
        let shares = run_dkg::<Ed25519>(3, 2);
        let outcomes = run_refresh::<Ed25519>(&shares, (1, 3), &[2]);
        assert_eq!(outcomes[1].old_share, "");
        // The recovered share must sit on the refreshed public polynomial.
        let expected = outcomes[1].key_share.public_shares[&2].clone();
        let scalar = scalar_from_hex::<Ed25519>(&outcomes[1].key_share.secret_share).unwrap();
        assert_eq!(
            point_to_hex(&(Point::<Ed25519>::generator() * &scalar)),
            expected
        );
    }

    #[test]
    fn devote_member_without_share_is_rejected() {
        let shares = run_dkg::<Ed25519>(3, 2);
        let ids: Vec<ParticipantId> = shares.iter().map(|s| s.participant_id).collect();
        let result = RefreshParty::<Ed25519>::new(
            ParticipantId(1),
            &ids,
            2,
            (ParticipantId(1), ParticipantId(3)),
            None,
            &shares[0].public_key,
        );
        assert!(matches!(result, Err(ProviderError::MissingMaterial(_))));
    }
}
