use std::str::FromStr;

use crate::error::RosterError;

/// A non-empty sequence of correctness bits, encoded on the wire as a string
/// of `0` and `1` characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseBits(Vec<bool>);

impl ResponseBits {
    pub fn parse(input: &str) -> Result<Self, RosterError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(RosterError::malformed(input));
        }

        trimmed
            .chars()
            .map(|c| match c {
                '0' => Ok(false),
                '1' => Ok(true),
                _ => Err(RosterError::malformed(input)),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for ResponseBits {
    type Err = RosterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<bool> for ResponseBits {
    fn from(correct: bool) -> Self {
        Self(vec![correct])
    }
}
