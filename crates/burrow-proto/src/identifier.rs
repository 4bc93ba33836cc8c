//! Tunnel identifier rules
//!
//! Caller-chosen identifiers must be 4-64 characters of lowercase ASCII
//! alphanumerics and hyphens, starting and ending with an alphanumeric
//! (`^[a-z0-9][a-z0-9-]{2,62}[a-z0-9]$`). Broker-generated identifiers
//! follow a `<mood>-<animal>-<nn>` pattern that always satisfies the rule.

use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

pub const MIN_IDENTIFIER_LENGTH: usize = 4;
pub const MAX_IDENTIFIER_LENGTH: usize = 64;

const MOODS: &[&str] = &[
    "brave", "calm", "proud", "swift", "clever", "happy", "bright", "mighty", "gentle", "bold",
];

const ANIMALS: &[&str] = &[
    "lion", "tiger", "eagle", "whale", "otter", "falcon", "panda", "wolf", "koala", "dolphin",
];

/// Identifier validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("Identifier must be between {min} and {max} characters, got {len}")]
    InvalidLength { len: usize, min: usize, max: usize },

    #[error("Identifier may only contain lowercase letters, digits and hyphens")]
    InvalidCharacter,

    #[error("Identifier must start and end with a letter or digit")]
    EdgeHyphen,
}

/// Validate a caller-chosen identifier
pub fn validate_identifier(id: &str) -> Result<(), IdentifierError> {
    let len = id.len();
    if !(MIN_IDENTIFIER_LENGTH..=MAX_IDENTIFIER_LENGTH).contains(&len) {
        return Err(IdentifierError::InvalidLength {
            len,
            min: MIN_IDENTIFIER_LENGTH,
            max: MAX_IDENTIFIER_LENGTH,
        });
    }

    if !id
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(IdentifierError::InvalidCharacter);
    }

    if id.starts_with('-') || id.ends_with('-') {
        return Err(IdentifierError::EdgeHyphen);
    }

    Ok(())
}

/// Generate a human-friendly identifier such as `swift-otter-42`
pub fn generate_identifier() -> String {
    let mut rng = rand::thread_rng();
    let mood = MOODS.choose(&mut rng).copied().unwrap_or("calm");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("otter");
    let number: u8 = rng.gen_range(10..100);
    format!("{}-{}-{}", mood, animal, number)
}
