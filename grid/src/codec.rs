//! The codec contract the grid consumes to turn keys and values into the already-encoded
//! byte strings that cross the message bus. Implementations are provided for the primitive
//! types used throughout the tests; application types implement it themselves.

/// Encodes a value to bytes and decodes it back. The endpoint never inspects the bytes it
/// carries — only a `Codec` implementation does.
pub trait Codec: Clone + Send + Sync + 'static {
    fn encode(&self) -> Vec<u8>;

    /// Returns `None` on malformed input; the endpoint drops the message rather than failing
    /// the whole request.
    fn decode(bytes: &[u8]) -> Option<Self>
    where
        Self: Sized;
}

impl Codec for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        self.clone()
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        Some(bytes.to_vec())
    }
}

impl Codec for String {
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        std::str::from_utf8(bytes).ok().map(str::to_owned)
    }
}

macro_rules! impl_codec_for_int {
    ($($ty:ty),*) => {
        $(
            impl Codec for $ty {
                fn encode(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }

                fn decode(bytes: &[u8]) -> Option<Self> {
                    let arr: [u8; core::mem::size_of::<$ty>()] = bytes.try_into().ok()?;
                    Some(<$ty>::from_le_bytes(arr))
                }
            }
        )*
    };
}

impl_codec_for_int!(i32, i64, u32, u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_string() {
        let encoded = String::from("hello").encode();
        assert_eq!(String::decode(&encoded), Some("hello".to_string()));
    }

    #[test]
    fn round_trips_i64() {
        let encoded = 42i64.encode();
        assert_eq!(i64::decode(&encoded), Some(42));
    }

    #[test]
    fn decode_rejects_malformed_input() {
        assert_eq!(i64::decode(&[1, 2, 3]), None);
    }
}
