//! Strong types for key material
//!
//! Semantic newtypes for the fixed-size keys that anchor identities,
//! replacing raw `[u8; N]`. The canonical text form of a key is URL-safe
//! unpadded base64: 43 characters for 32 bytes.

use crate::error::ValidationError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use std::fmt;

/// Byte length of a routing or insert key.
pub const KEY_LENGTH: usize = 32;

/// Character length of the canonical base64 form of a key.
pub const KEY_TEXT_LENGTH: usize = 43;

/// Macro to define fixed-size key types with strong typing.
///
/// Args:
/// - $name: The name of the struct (e.g., IdentityId)
/// - $doc: Documentation string
macro_rules! define_key {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(pub [u8; KEY_LENGTH]);

        impl $name {
            /// Returns the inner bytes as a slice.
            pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
                &self.0
            }

            /// Parse from the canonical 43-character base64 form.
            ///
            /// Checks the length limit and that the text is valid base64
            /// decoding to exactly [`KEY_LENGTH`] bytes.
            pub fn from_base64(text: &str) -> Result<Self, ValidationError> {
                if text.len() != KEY_TEXT_LENGTH {
                    return Err(ValidationError::IdLength {
                        expected: KEY_TEXT_LENGTH,
                        got: text.len(),
                    });
                }
                let bytes = URL_SAFE_NO_PAD
                    .decode(text)
                    .map_err(|e| ValidationError::IdEncoding(e.to_string()))?;
                let bytes: [u8; KEY_LENGTH] = bytes
                    .try_into()
                    .map_err(|v: Vec<u8>| ValidationError::IdLength {
                        expected: KEY_LENGTH,
                        got: v.len(),
                    })?;
                Ok(Self(bytes))
            }

            /// The canonical base64 form.
            pub fn to_base64(&self) -> String {
                URL_SAFE_NO_PAD.encode(self.0)
            }

            /// Generate fresh random key material.
            pub fn random(rng: &mut impl rand::Rng) -> Self {
                let mut bytes = [0u8; KEY_LENGTH];
                rng.fill_bytes(&mut bytes);
                Self(bytes)
            }
        }

        impl From<[u8; KEY_LENGTH]> for $name {
            fn from(bytes: [u8; KEY_LENGTH]) -> Self {
                Self(bytes)
            }
        }

        impl From<$name> for [u8; KEY_LENGTH] {
            fn from(wrapper: $name) -> [u8; KEY_LENGTH] {
                wrapper.0
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_base64())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_base64())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_base64(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_base64())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = <String as serde::Deserialize>::deserialize(deserializer)?;
                Self::from_base64(&text).map_err(serde::de::Error::custom)
            }
        }
    };
}

define_key!(
    IdentityId,
    "The stable identifier of an identity: the routing key of its public \
     key. The canonical text form is 43 characters of URL-safe unpadded \
     base64. `Ord` is lexicographic byte order of the routing key, the \
     canonical ordering of identities."
);

define_key!(
    InsertKey,
    "The private half of an identity's key pair, held only for own \
     identities. Opaque to the trust graph."
);

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn base64_roundtrip() {
        let id = IdentityId([0xab; 32]);
        let text = id.to_base64();
        assert_eq!(text.len(), KEY_TEXT_LENGTH);
        assert_eq!(IdentityId::from_base64(&text).unwrap(), id);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            IdentityId::from_base64("short"),
            Err(ValidationError::IdLength { .. })
        ));
        let too_long = "A".repeat(KEY_TEXT_LENGTH + 1);
        assert!(IdentityId::from_base64(&too_long).is_err());
    }

    #[test]
    fn rejects_invalid_alphabet() {
        let bad = "!".repeat(KEY_TEXT_LENGTH);
        assert!(matches!(
            IdentityId::from_base64(&bad),
            Err(ValidationError::IdEncoding(_))
        ));
    }

    #[test]
    fn ordering_is_total_and_stable() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut ids: Vec<IdentityId> = (0..64).map(|_| IdentityId::random(&mut rng)).collect();
        ids.sort();
        for pair in ids.windows(2) {
            assert!(pair[0] <= pair[1]);
            assert_eq!(pair[0].cmp(&pair[1]), pair[0].0.cmp(&pair[1].0));
        }
    }

    #[test]
    fn serde_as_string() {
        let id = IdentityId([3; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_base64()));
        let back: IdentityId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
