//! Group identity tokens.
//!
//! A token names one communication group instance. Exactly one participant
//! generates it; everyone else receives a verbatim copy out of band (the
//! rendezvous transport is not part of this crate) before calling
//! [`Communicator::create`](crate::Communicator::create).

use std::fmt::{self, Write};

use rand::RngCore;

use crate::error::{Result, RncclError};

/// Size of a serialized token (`NCCL_UNIQUE_ID_BYTES`).
pub const TOKEN_BYTES: usize = 128;

/// Opaque, immutable identifier of one communication group.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct GroupToken {
    bytes: [u8; TOKEN_BYTES],
}

impl GroupToken {
    /// Wrap raw token bytes produced by a runtime.
    pub fn from_array(bytes: [u8; TOKEN_BYTES]) -> Self {
        Self { bytes }
    }

    /// Fresh token drawn from the operating system's entropy source.
    ///
    /// Used by runtimes without a native unique-id generator. Entropy
    /// exhaustion is reported as an initialization failure.
    pub fn generate_random() -> Result<Self> {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rngs::OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| RncclError::initialization(format!("entropy source failed: {e}")))?;
        Ok(Self { bytes })
    }

    /// Deserialize a token received from another participant.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; TOKEN_BYTES] = bytes.try_into().map_err(|_| {
            RncclError::invalid_argument(
                "deserialize_token",
                format!("expected {TOKEN_BYTES} bytes, got {}", bytes.len()),
            )
        })?;
        Ok(Self { bytes })
    }

    /// Serialized form, for out-of-band transmission.
    pub fn as_bytes(&self) -> &[u8; TOKEN_BYTES] {
        &self.bytes
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }

    /// Short hex prefix, for log fields.
    pub fn short_id(&self) -> String {
        hex(&self.bytes[..8])
    }
}

impl fmt::Debug for GroupToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupToken")
            .field("bytes", &format_args!("{}", hex(&self.bytes)))
            .finish()
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
