//! Curve-generic helpers shared by the setup implementations.

use curv::arithmetic::traits::*;
use curv::cryptographic_primitives::commitments::hash_commitment::HashCommitment;
use curv::cryptographic_primitives::commitments::traits::Commitment;
use curv::cryptographic_primitives::secret_sharing::feldman_vss::{
    ShamirSecretSharing, VerifiableSS,
};
use curv::elliptic::curves::{Curve, Point, Scalar};
use curv::BigInt;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{ProviderError, ProviderResult};

pub(crate) fn scalar_to_hex<E: Curve>(scalar: &Scalar<E>) -> String {
    hex::encode(scalar.to_bigint().to_bytes())
}

pub(crate) fn scalar_from_hex<E: Curve>(encoded: &str) -> ProviderResult<Scalar<E>> {
    let bytes = hex::decode(encoded).map_err(ProviderError::malformed)?;
    Ok(Scalar::from_bigint(&BigInt::from_bytes(&bytes)))
}

pub(crate) fn point_to_hex<E: Curve>(point: &Point<E>) -> String {
    hex::encode(&*point.to_bytes(true))
}

pub(crate) fn point_from_hex<E: Curve>(encoded: &str) -> ProviderResult<Point<E>> {
    let bytes = hex::decode(encoded).map_err(ProviderError::malformed)?;
    Point::from_bytes(&bytes).map_err(ProviderError::malformed)
}

/// Digest of a serializable value, as a BigInt suitable for hash commitments.
pub(crate) fn digest_of<T: Serialize>(value: &T) -> ProviderResult<BigInt> {
    let bytes = serde_json::to_vec(value).map_err(ProviderError::malformed)?;
    Ok(BigInt::from_bytes(&Sha256::digest(&bytes)))
}

/// Hash commitment over a digest with caller-supplied blinding.
pub(crate) fn commit(digest: &BigInt, blind: &BigInt) -> BigInt {
    HashCommitment::<Sha256>::create_commitment_with_user_defined_randomness(digest, blind)
}

pub(crate) fn sample_blind() -> BigInt {
    BigInt::sample(256)
}

/// Check that a commitment opens to the given digest and blinding.
pub(crate) fn verify_commitment(
    commitment: &BigInt,
    digest: &BigInt,
    blind: &BigInt,
) -> ProviderResult<()> {
    if commit(digest, blind) != *commitment {
        return Err(ProviderError::ProofRejected(
            "hash commitment does not open".to_string(),
        ));
    }
    Ok(())
}

/// Evaluate a Feldman commitment polynomial at participant index `x`
/// (1-based), yielding that participant's public share contribution.
pub(crate) fn eval_commitments<E: Curve>(commitments: &[Point<E>], x: u16) -> Point<E> {
    let at = Scalar::<E>::from_bigint(&BigInt::from(x as u64));
    let mut acc = commitments[commitments.len() - 1].clone();
    for coefficient in commitments.iter().rev().skip(1) {
        acc = acc * &at + coefficient;
    }
    acc
}

/// Lagrange coefficient at zero for 1-based participant id `id` over the
/// 1-based id subset `subset`.
pub(crate) fn lagrange_at_zero<E: Curve>(
    threshold: u16,
    share_count: u16,
    id: u16,
    subset: &[u16],
) -> Scalar<E> {
    let params = ShamirSecretSharing {
        threshold: threshold - 1,
        share_count,
    };
    let zero_based: Vec<u16> = subset.iter().map(|s| s - 1).collect();
    VerifiableSS::<E, Sha256>::map_share_to_new_params(&params, id - 1, &zero_based)
}
