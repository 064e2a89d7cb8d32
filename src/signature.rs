//! # Signature
//!
//! Parsed wildcard byte patterns such as `"44 8B ?? 41 8D"`

use std::fmt::{self, Display};
use std::str::FromStr;

use thiserror::Error;

/// Errors when parsing a textual byte pattern
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// The pattern contained no tokens at all
    #[error("Signature pattern is empty")]
    Empty,
    /// Every token was a wildcard, which would match at every address
    #[error("Signature pattern contains only wildcards")]
    AllWildcards,
    /// A token was neither a two digit hex byte nor a wildcard
    #[error("Invalid signature token '{token}' at index {index}")]
    InvalidToken {
        /// Position of the token in the pattern
        index: usize,
        /// Offending token text
        token: String,
    },
}

/// A single unit of a signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// Must match this exact byte
    Byte(u8),
    /// Matches any byte
    Any,
}

impl Token {
    /// Returns true if `byte` satisfies this token
    #[inline]
    pub fn matches(self, byte: u8) -> bool {
        match self {
            Token::Byte(b) => b == byte,
            Token::Any => true,
        }
    }
}

/// A parsed byte pattern with at least one concrete byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteSignature {
    /// Tokens in pattern order
    tokens: Vec<Token>,
    /// Index of the first concrete byte, used as the scan anchor
    anchor: usize,
}

impl ByteSignature {
    /// Parses a whitespace separated pattern. Wildcards are `?` or `??`.
    pub fn parse(pattern: &str) -> Result<Self, SignatureError> {
        let tokens = pattern
            .split_whitespace()
            .enumerate()
            .map(|(index, token)| parse_token(index, token))
            .collect::<Result<Vec<_>, _>>()?;

        if tokens.is_empty() {
            return Err(SignatureError::Empty);
        }

        let anchor = tokens
            .iter()
            .position(|t| matches!(t, Token::Byte(_)))
            .ok_or(SignatureError::AllWildcards)?;

        Ok(Self { tokens, anchor })
    }

    /// Number of bytes covered by the signature
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// True if the signature covers no bytes. Parsing rejects empty patterns.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Tokens in pattern order
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Index and value of the first concrete byte
    pub fn anchor(&self) -> (usize, u8) {
        match self.tokens[self.anchor] {
            Token::Byte(b) => (self.anchor, b),
            // `parse` guarantees the anchor is a concrete byte
            Token::Any => unreachable!("signature anchor is a wildcard"),
        }
    }

    /// Checks the signature against `window`, which must be at least `len()` long
    #[inline]
    pub fn matches_at(&self, window: &[u8]) -> bool {
        window.len() >= self.tokens.len()
            && self
                .tokens
                .iter()
                .zip(window)
                .all(|(token, &byte)| token.matches(byte))
    }
}

/// Parses one token of a pattern
fn parse_token(index: usize, token: &str) -> Result<Token, SignatureError> {
    if token == "?" || token == "??" {
        return Ok(Token::Any);
    }
    let invalid = || SignatureError::InvalidToken {
        index,
        token: token.to_string(),
    };
    // from_str_radix would accept "+F" and single digits
    if token.len() != 2 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    u8::from_str_radix(token, 16)
        .map(Token::Byte)
        .map_err(|_| invalid())
}

impl FromStr for ByteSignature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for ByteSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.tokens.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match token {
                Token::Byte(b) => write!(f, "{b:02X}")?,
                Token::Any => f.write_str("??")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Parses a pattern mixing bytes and both wildcard spellings
    fn test_parse_mixed() {
        let sig = ByteSignature::parse("44 8b ?? 41 ? FF").unwrap();
        assert_eq!(sig.len(), 6);
        assert_eq!(
            sig.tokens(),
            [
                Token::Byte(0x44),
                Token::Byte(0x8B),
                Token::Any,
                Token::Byte(0x41),
                Token::Any,
                Token::Byte(0xFF),
            ]
        );
        assert_eq!(sig.anchor(), (0, 0x44));
        assert_eq!(sig.to_string(), "44 8B ?? 41 ?? FF");
    }

    #[test]
    /// The anchor skips leading wildcards
    fn test_anchor_after_wildcards() {
        let sig: ByteSignature = "?? ?? C3".parse().unwrap();
        assert_eq!(sig.anchor(), (2, 0xC3));
    }

    #[test]
    fn test_rejects_degenerate_patterns() {
        assert_eq!(ByteSignature::parse(""), Err(SignatureError::Empty));
        assert_eq!(ByteSignature::parse("   "), Err(SignatureError::Empty));
        assert_eq!(
            ByteSignature::parse("?? ? ??"),
            Err(SignatureError::AllWildcards)
        );
    }

    #[test]
    /// Malformed tokens report their position
    fn test_rejects_bad_tokens() {
        for (pattern, index, token) in [
            ("48 8G", 1, "8G"),
            ("4 8B", 0, "4"),
            ("48 +F", 1, "+F"),
            ("48 8B0", 1, "8B0"),
            ("48 ???", 1, "???"),
        ] {
            assert_eq!(
                ByteSignature::parse(pattern),
                Err(SignatureError::InvalidToken {
                    index,
                    token: token.to_string()
                }),
                "{pattern}"
            );
        }
    }

    #[test]
    fn test_matches_at() {
        let sig = ByteSignature::parse("F3 0F ?? 11").unwrap();
        assert!(sig.matches_at(&[0xF3, 0x0F, 0x00, 0x11]));
        assert!(sig.matches_at(&[0xF3, 0x0F, 0xFF, 0x11, 0x99]));
        assert!(!sig.matches_at(&[0xF3, 0x0F, 0x00, 0x12]));
        // window too short
        assert!(!sig.matches_at(&[0xF3, 0x0F, 0x00]));
    }
}
