use crate::Generator;
use rand::Rng;
use shrtnr_core::ShortCode;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of every generated code.
pub const CODE_LENGTH: usize = 8;

/// Produces random eight-character alphanumeric codes.
///
/// With 62^8 possible codes collisions are rare but possible; they are
/// resolved by the store, not here.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomGenerator;

impl RandomGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl Generator for RandomGenerator {
    fn generate(&self) -> ShortCode {
        let mut rng = rand::rng();
        let code: String = (0..CODE_LENGTH)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
            .collect();
        ShortCode::new_unchecked(code)
    }
}
