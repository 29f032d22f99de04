//! Fixed token vocabulary shared by the codec, generator and model
//!
//! Digits 0-9 are their own token ids. The four symbols follow them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of token ids in the vocabulary (0-9 plus `+ - = *`)
pub const VOCAB_SIZE: usize = 14;

/// Non-digit tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MathsToken {
    Plus,
    Minus,
    Equals,
    Mult,
}

impl MathsToken {
    /// Token id as fed to the model
    pub const fn id(self) -> u32 {
        match self {
            Self::Plus => 10,
            Self::Minus => 11,
            Self::Equals => 12,
            Self::Mult => 13,
        }
    }

    /// Look up a symbol token by id (digits return `None`)
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            10 => Some(Self::Plus),
            11 => Some(Self::Minus),
            12 => Some(Self::Equals),
            13 => Some(Self::Mult),
            _ => None,
        }
    }

    /// Display character
    pub const fn symbol(self) -> char {
        match self {
            Self::Plus => '+',
            Self::Minus => '-',
            Self::Equals => '=',
            Self::Mult => '*',
        }
    }

    /// Tokens that may appear between the two operands
    pub const fn is_operator(self) -> bool {
        matches!(self, Self::Plus | Self::Minus | Self::Mult)
    }

    /// Tokens that may lead the answer
    pub const fn is_sign(self) -> bool {
        matches!(self, Self::Plus | Self::Minus)
    }

    /// Parse an operator from its display character
    pub fn from_symbol(c: char) -> Option<Self> {
        match c {
            '+' => Some(Self::Plus),
            '-' => Some(Self::Minus),
            '=' => Some(Self::Equals),
            '*' | 'x' => Some(Self::Mult),
            _ => None,
        }
    }
}

impl fmt::Display for MathsToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// True if `token` is one of the ten digit tokens
pub const fn is_digit(token: u32) -> bool {
    token <= 9
}

/// Display character for any token id
pub fn token_to_char(token: u32) -> Option<char> {
    if is_digit(token) {
        char::from_digit(token, 10)
    } else {
        MathsToken::from_id(token).map(MathsToken::symbol)
    }
}

/// Render a token sequence, e.g. `222222+111111=+0333333`
///
/// Ids outside the vocabulary render as `?`.
pub fn tokens_to_string(tokens: &[u32]) -> String {
    tokens
        .iter()
        .map(|&t| token_to_char(t).unwrap_or('?'))
        .collect()
}
