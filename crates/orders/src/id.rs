//! Human-readable order identifier.

use core::str::FromStr;
use rand::Rng;
use serde::{Deserialize, Serialize};

use trailmark_core::DomainError;

/// Public order identifier in the canonical `NNNN-NNNN-NNNN-NNNN` format.
///
/// This is the id customers see on receipts and the one external systems
/// (payment processor metadata, fulfillment partner order number) carry back
/// to us. Uniqueness is enforced by the `orders` primary key; random draws
/// are collision-probed before use (`trailmark-infra::order_id`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    /// Draw a random id. Collision checking is the caller's job.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut s = String::with_capacity(19);
        for group in 0..4 {
            if group > 0 {
                s.push('-');
            }
            for _ in 0..4 {
                s.push(char::from(b'0' + rng.gen_range(0..10u8)));
            }
        }
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_canonical(s: &str) -> bool {
        let bytes = s.as_bytes();
        if bytes.len() != 19 {
            return false;
        }
        bytes.iter().enumerate().all(|(i, b)| {
            if matches!(i, 4 | 9 | 14) {
                *b == b'-'
            } else {
                b.is_ascii_digit()
            }
        })
    }
}

impl FromStr for OrderId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Self::is_canonical(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(DomainError::invalid_id(format!(
                "OrderId: expected NNNN-NNNN-NNNN-NNNN, got {s:?}"
            )))
        }
    }
}

impl core::fmt::Display for OrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn parse_accepts_canonical_format() {
        let id: OrderId = "1234-5678-9012-3456".parse().unwrap();
        assert_eq!(id.as_str(), "1234-5678-9012-3456");
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        for bad in [
            "",
            "1234567890123456",
            "1234-5678-9012-345",
            "1234-5678-9012-34567",
            "abcd-5678-9012-3456",
            "1234_5678_9012_3456",
        ] {
            assert!(bad.parse::<OrderId>().is_err(), "accepted {bad:?}");
        }
    }

    proptest! {
        #[test]
        fn random_ids_are_canonical(seed: u64) {
            let mut rng = StdRng::seed_from_u64(seed);
            let id = OrderId::random(&mut rng);
            prop_assert!(OrderId::is_canonical(id.as_str()));
            prop_assert_eq!(id.as_str().parse::<OrderId>().unwrap(), id);
        }
    }
}
