// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use uuid::Uuid;

use crate::error::Error;

/* ---------------------------------------------------------------------------------------------- */

fn token_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^sriov-[0-9a-f-]{36}$").unwrap())
}

/// Returns `true` iff `s` has the well-formed SR-IOV token ID shape
/// (`sriov-` + canonical UUID). Stages downstream of the token stage treat
/// any other shape as "not mine" and pass through.
pub fn looks_like_sriov_token(s: &str) -> bool {
    token_id_pattern().is_match(s)
}

/// Opaque token identifier: `sriov-` prefix + canonical UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(String);

impl TokenId {
    /// Generates a fresh, well-formed token ID.
    pub fn generate() -> TokenId {
        TokenId(format!("sriov-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TokenId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if looks_like_sriov_token(s) {
            Ok(TokenId(s.to_string()))
        } else {
            Err(Error::configuration(format!("'{s}' is not a well-formed SR-IOV token ID")))
        }
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_well_formed() {
        let id = TokenId::generate();
        assert!(looks_like_sriov_token(id.as_str()));
    }

    #[test]
    fn rejects_non_sriov_shapes() {
        assert!(!looks_like_sriov_token("not-a-token"));
        assert!(!looks_like_sriov_token("sriov-too-short"));
        assert!("nsm-1234".parse::<TokenId>().is_err());
    }
}

/* ---------------------------------------------------------------------------------------------- */
