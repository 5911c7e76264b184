// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent instance identity.
//!
//! The identity is resolved once at startup and attached to every lifecycle log line and to
//! every record the sender ships. Resolution never fails:
//!
//! 1. A non-empty operator-supplied value is used verbatim.
//! 2. Otherwise 16 bytes are drawn from the OS CSPRNG and hex-encoded (32 characters).
//! 3. If the CSPRNG is unavailable, the identity degrades to `agent-<unix-seconds>`.
//!
//! Agents falling back within the same second share an identity. That collision is a known
//! weakness of the fallback and is left as is.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::{rngs::OsRng, RngCore};
use tracing::warn;

const IDENTITY_BYTES: usize = 16;
const FALLBACK_PREFIX: &str = "agent-";

/// Opaque identifier of this running agent instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentIdentity(String);

impl AgentIdentity {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AgentIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Source of random bytes for identity generation.
pub trait EntropySource {
    fn fill(&self, dest: &mut [u8]) -> Result<(), rand::Error>;
}

/// The operating system CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, dest: &mut [u8]) -> Result<(), rand::Error> {
        OsRng.try_fill_bytes(dest)
    }
}

/// Resolves the agent identity using the OS CSPRNG.
#[must_use]
pub fn resolve(explicit: Option<&str>) -> AgentIdentity {
    resolve_with(explicit, &OsEntropy)
}

/// Resolves the agent identity drawing randomness from `entropy`.
///
/// Blank explicit values count as absent.
#[must_use]
pub fn resolve_with(explicit: Option<&str>, entropy: &dyn EntropySource) -> AgentIdentity {
    if let Some(id) = explicit.filter(|id| !id.trim().is_empty()) {
        return AgentIdentity(id.to_string());
    }

    let mut bytes = [0u8; IDENTITY_BYTES];
    match entropy.fill(&mut bytes) {
        Ok(()) => AgentIdentity(hex::encode(bytes)),
        Err(e) => {
            warn!("Secure random source unavailable, using timestamp identity: {e}");
            fallback_identity()
        }
    }
}

fn fallback_identity() -> AgentIdentity {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    AgentIdentity(format!("{FALLBACK_PREFIX}{secs}"))
}
