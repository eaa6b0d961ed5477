#![forbid(unsafe_code)]

//! Fixed-width node/gateway/user identifiers.
//!
//! An [`Id`] is 33 bytes: 32 bytes of opaque identity data followed by one
//! kind byte. Equality is byte-equality, so the same underlying identity with
//! two different kind tags compares unequal. [`Id::set_kind`] derives the
//! node-kind twin of a gateway identifier for round-topology lookups.

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{HazeError, HazeResult};

/// Serialized identifier length: 32 data bytes plus one kind byte.
pub const ID_LEN: usize = 33;
const KIND_OFFSET: usize = ID_LEN - 1;

/// Kind tag carried in the last byte of an [`Id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IdKind {
    Node = 0,
    Gateway = 1,
    User = 2,
    Dummy = 3,
}

impl IdKind {
    pub fn from_byte(b: u8) -> HazeResult<Self> {
        match b {
            0 => Ok(IdKind::Node),
            1 => Ok(IdKind::Gateway),
            2 => Ok(IdKind::User),
            3 => Ok(IdKind::Dummy),
            other => Err(HazeError::Invalid(format!("unknown id kind byte {other}"))),
        }
    }
}

/// Fixed-width opaque identifier with a kind tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id([u8; ID_LEN]);

impl Id {
    /// Assemble an identifier from 32 data bytes and a kind.
    pub fn new(data: [u8; ID_LEN - 1], kind: IdKind) -> Self {
        let mut raw = [0u8; ID_LEN];
        raw[..KIND_OFFSET].copy_from_slice(&data);
        raw[KIND_OFFSET] = kind as u8;
        Id(raw)
    }

    /// Parse a serialized identifier. Fails `Invalid` on bad length or kind.
    pub fn from_bytes(bytes: &[u8]) -> HazeResult<Self> {
        if bytes.len() != ID_LEN {
            return Err(HazeError::Invalid(format!(
                "id must be {ID_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        IdKind::from_byte(bytes[KIND_OFFSET])?;
        let mut raw = [0u8; ID_LEN];
        raw.copy_from_slice(bytes);
        Ok(Id(raw))
    }

    /// Identifier derived from a short ASCII label, for fixtures and tests.
    pub fn from_label(label: &str, kind: IdKind) -> Self {
        let mut data = [0u8; ID_LEN - 1];
        let n = label.len().min(ID_LEN - 1);
        data[..n].copy_from_slice(&label.as_bytes()[..n]);
        Id::new(data, kind)
    }

    pub fn kind(&self) -> IdKind {
        // The kind byte is validated on every construction path.
        IdKind::from_byte(self.0[KIND_OFFSET]).unwrap_or(IdKind::Dummy)
    }

    /// Same identity bytes under a different kind tag.
    #[must_use]
    pub fn set_kind(&self, kind: IdKind) -> Id {
        let mut raw = self.0;
        raw[KIND_OFFSET] = kind as u8;
        Id(raw)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

/// The well-known dummy user that junk slots are attributed to.
pub const DUMMY_USER: Id = {
    let mut raw = [0u8; ID_LEN];
    raw[0] = b'd';
    raw[1] = b'u';
    raw[2] = b'm';
    raw[3] = b'm';
    raw[4] = b'y';
    raw[KIND_OFFSET] = IdKind::Dummy as u8;
    Id(raw)
};

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..{:02x}", self.0[KIND_OFFSET])
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self}, {:?})", self.kind())
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct IdVisitor;

impl<'de> Visitor<'de> for IdVisitor {
    type Value = Id;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ID_LEN} identifier bytes")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Id, E> {
        Id::from_bytes(v).map_err(|e| E::custom(e.to_string()))
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Id, A::Error> {
        let mut raw = Vec::with_capacity(ID_LEN);
        while let Some(b) = seq.next_element::<u8>()? {
            raw.push(b);
        }
        Id::from_bytes(&raw).map_err(|e| de::Error::custom(e.to_string()))
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Id, D::Error> {
        deserializer.deserialize_bytes(IdVisitor)
    }
}
