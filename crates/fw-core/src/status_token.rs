//! Classification of free-text device status into a closed set of tokens.
//!
//! Devices report engine and refuel state as free text ("Engine ON",
//! "PTO off", "Possible Fuel Fill", ...). The matching rules live in a
//! versioned table so a rule change is a data change that can be tested on
//! its own.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Canonical status tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StatusToken {
    EngineOn,
    EngineOff,
    PossibleFill,
    #[default]
    Unknown,
}

impl StatusToken {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EngineOn => "engine_on",
            Self::EngineOff => "engine_off",
            Self::PossibleFill => "possible_fill",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StatusToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusToken {
    type Err = UnknownStatusToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "engine_on" => Ok(Self::EngineOn),
            "engine_off" => Ok(Self::EngineOff),
            "possible_fill" => Ok(Self::PossibleFill),
            "unknown" => Ok(Self::Unknown),
            _ => Err(UnknownStatusToken(s.to_string())),
        }
    }
}

impl Serialize for StatusToken {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StatusToken {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Error type for unknown canonical token strings.
#[derive(Debug, Clone)]
pub struct UnknownStatusToken(String);

impl fmt::Display for UnknownStatusToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown status token: {}", self.0)
    }
}

impl std::error::Error for UnknownStatusToken {}

/// A single substring rule.
#[derive(Debug, Clone, Copy)]
pub struct TokenRule {
    /// Uppercase pattern matched against the normalized status text.
    pub pattern: &'static str,
    pub token: StatusToken,
}

/// An ordered, versioned set of substring rules. The first match wins.
#[derive(Debug, Clone, Copy)]
pub struct TokenRules {
    pub version: u32,
    pub rules: &'static [TokenRule],
}

/// Rules in production use.
///
/// Fill is checked first because some firmware appends the engine state to
/// the fill notice ("POSSIBLE FUEL FILL - ENGINE ON").
pub const TOKEN_RULES_V1: TokenRules = TokenRules {
    version: 1,
    rules: &[
        TokenRule {
            pattern: "POSSIBLE FUEL FILL",
            token: StatusToken::PossibleFill,
        },
        TokenRule {
            pattern: "ENGINE OFF",
            token: StatusToken::EngineOff,
        },
        TokenRule {
            pattern: "PTO OFF",
            token: StatusToken::EngineOff,
        },
        TokenRule {
            pattern: "ENGINE ON",
            token: StatusToken::EngineOn,
        },
        TokenRule {
            pattern: "PTO ON",
            token: StatusToken::EngineOn,
        },
    ],
};

impl TokenRules {
    /// Classifies raw status text. Empty or unmatched text is `Unknown`.
    pub fn classify(&self, raw: &str) -> StatusToken {
        let normalized = normalize(raw);
        if normalized.is_empty() {
            return StatusToken::Unknown;
        }
        self.rules
            .iter()
            .find(|rule| normalized.contains(rule.pattern))
            .map_or(StatusToken::Unknown, |rule| rule.token)
    }
}

/// Classifies raw status text with [`TOKEN_RULES_V1`].
pub fn classify(raw: &str) -> StatusToken {
    TOKEN_RULES_V1.classify(raw)
}

/// Uppercases, maps `_`/`-` to spaces and collapses runs of whitespace.
fn normalize(raw: &str) -> String {
    raw.to_uppercase()
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_engine_variants() {
        assert_eq!(classify("ENGINE ON"), StatusToken::EngineOn);
        assert_eq!(classify("Engine on"), StatusToken::EngineOn);
        assert_eq!(classify("pto_on"), StatusToken::EngineOn);
        assert_eq!(classify("ENGINE OFF"), StatusToken::EngineOff);
        assert_eq!(classify("  pto   off "), StatusToken::EngineOff);
    }

    #[test]
    fn classifies_fill_before_engine_state() {
        assert_eq!(classify("Possible Fuel Fill"), StatusToken::PossibleFill);
        assert_eq!(
            classify("POSSIBLE FUEL FILL - ENGINE ON"),
            StatusToken::PossibleFill
        );
    }

    #[test]
    fn empty_and_unmatched_text_is_unknown() {
        assert_eq!(classify(""), StatusToken::Unknown);
        assert_eq!(classify("   "), StatusToken::Unknown);
        assert_eq!(classify("IGNITION CYCLE"), StatusToken::Unknown);
    }

    #[test]
    fn engine_off_does_not_match_engine_on_rule() {
        let only_on = TokenRules {
            version: 0,
            rules: &[TokenRule {
                pattern: "ENGINE ON",
                token: StatusToken::EngineOn,
            }],
        };
        assert_eq!(only_on.classify("ENGINE OFF"), StatusToken::Unknown);
    }

    #[test]
    fn canonical_roundtrip_all_variants() {
        let variants = [
            StatusToken::EngineOn,
            StatusToken::EngineOff,
            StatusToken::PossibleFill,
            StatusToken::Unknown,
        ];

        for variant in &variants {
            let s = variant.to_string();
            let parsed: StatusToken = s.parse().expect("should parse");
            assert_eq!(parsed, *variant, "roundtrip failed for {variant:?}");
        }
    }

    #[test]
    fn unknown_canonical_string_errors() {
        let err = "ignition".parse::<StatusToken>().unwrap_err();
        assert_eq!(err.to_string(), "unknown status token: ignition");
    }
}
