//! Trust-boundary input types: external ids, role ARNs and role references.
//!
//! Everything here is validated locally. Nothing in this module talks to the
//! network, so shape errors are always reported before a provider call.

use crate::error::BridgeError;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Length of a hex-encoded external id (256 bits).
pub const EXTERNAL_ID_LEN: usize = 64;

static ROLE_ARN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^arn:aws:iam::([0-9]{12}):role/(?:[A-Za-z0-9_+=,.@-]+/)*[A-Za-z0-9_+=,.@-]{1,64}$")
        .expect("role ARN pattern is valid")
});

/// Shared secret embedded as a condition in the remote trust policy.
#[derive(Clone, PartialEq, Eq)]
pub struct ExternalId(String);

impl ExternalId {
    /// Generates a fresh 256-bit external id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Parses and validates a caller-supplied external id.
    pub fn parse(raw: &str) -> Result<Self, BridgeError> {
        let valid = raw.len() == EXTERNAL_ID_LEN
            && raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if !valid {
            return Err(BridgeError::validation(format!(
                "External id must be exactly {} lowercase hexadecimal characters",
                EXTERNAL_ID_LEN
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExternalId(<redacted>)")
    }
}

/// IAM role ARN of the shape `arn:aws:iam::<12 digits>:role/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoleArn {
    arn: String,
    account_id: String,
}

impl RoleArn {
    pub fn parse(raw: &str) -> Result<Self, BridgeError> {
        let captures = ROLE_ARN_RE.captures(raw).ok_or_else(|| {
            BridgeError::validation(
                "Role ARN must look like arn:aws:iam::123456789012:role/RoleName",
            )
        })?;
        Ok(Self {
            arn: raw.to_string(),
            account_id: captures[1].to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.arn
    }

    /// Account id embedded in the ARN.
    pub fn account_id(&self) -> &str {
        &self.account_id
    }
}

impl fmt::Display for RoleArn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.arn)
    }
}

impl TryFrom<String> for RoleArn {
    type Error = BridgeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoleArn> for String {
    fn from(value: RoleArn) -> Self {
        value.arn
    }
}

/// Proof of a verified trust relationship.
///
/// The end user keeps this; the server never stores a copy.
#[derive(Debug, Clone)]
pub struct RoleReference {
    pub role_arn: RoleArn,
    pub external_id: ExternalId,
    pub account_id: String,
}

/// Validates both halves of a role reference in one step.
pub fn parse_credentials_pair(
    role_arn: &str,
    external_id: &str,
) -> Result<(RoleArn, ExternalId), BridgeError> {
    Ok((RoleArn::parse(role_arn)?, ExternalId::parse(external_id)?))
}
