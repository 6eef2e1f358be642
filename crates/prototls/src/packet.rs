// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Payload serialization seam.
//!
//! The framing layer only moves opaque byte ranges. A [`Packet`] turns an
//! application message into those bytes and back; schema and encoding are
//! the implementor's business.
//!
//! Provided implementations:
//!
//! - `Vec<u8>` - raw bytes, copied as-is
//! - `String` - UTF-8 text
//! - `Json<T>` - any serde type as JSON (`json` feature)

use crate::error::PacketError;

/// Application message carried in one frame.
pub trait Packet: Sized {
    /// Append the encoded message to `out`.
    ///
    /// On error the caller discards whatever was appended.
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), PacketError>;

    /// Decode a message from exactly one frame payload.
    fn decode(payload: &[u8]) -> Result<Self, PacketError>;
}

impl Packet for Vec<u8> {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), PacketError> {
        out.extend_from_slice(self);
        Ok(())
    }

    fn decode(payload: &[u8]) -> Result<Self, PacketError> {
        Ok(payload.to_vec())
    }
}

impl Packet for String {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), PacketError> {
        out.extend_from_slice(self.as_bytes());
        Ok(())
    }

    fn decode(payload: &[u8]) -> Result<Self, PacketError> {
        String::from_utf8(payload.to_vec()).map_err(|e| PacketError::new(e.to_string()))
    }
}

#[cfg(feature = "json")]
pub use self::json::Json;

#[cfg(feature = "json")]
mod json {
    use super::*;
    use serde::{de::DeserializeOwned, Serialize};

    /// JSON-encoded packet wrapper.
    ///
    /// ```ignore
    /// #[derive(Serialize, Deserialize)]
    /// struct Greeting { text: String }
    ///
    /// peer.send(&Json(Greeting { text: "Welcome!".into() }))?;
    /// let Json(reply) = peer.recv::<Json<Greeting>>()?;
    /// ```
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Json<T>(pub T);

    impl<T: Serialize + DeserializeOwned> Packet for Json<T> {
        fn encode(&self, out: &mut Vec<u8>) -> Result<(), PacketError> {
            serde_json::to_writer(out, &self.0).map_err(|e| PacketError::new(e.to_string()))
        }

        fn decode(payload: &[u8]) -> Result<Self, PacketError> {
            serde_json::from_slice(payload)
                .map(Json)
                .map_err(|e| PacketError::new(e.to_string()))
        }
    }

}
