pub use alloy_primitives::{
    hex,
    keccak256,
    Address,
    Bytes,
    B256,
    U256,
    U64,
};

use cid::Cid;
use multihash::Multihash;
use multihash_codetable::{
    Code,
    MultihashDigest,
};

use std::fmt;

/// Storage network a content address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceOrigin {
    Ipfs,
    Bzzr0,
    Bzzr1,
}

impl SourceOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceOrigin::Ipfs => "ipfs",
            SourceOrigin::Bzzr0 => "bzzr0",
            SourceOrigin::Bzzr1 => "bzzr1",
        }
    }
}

impl fmt::Display for SourceOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AuxdataError {
    #[error("runtime bytecode has no valid CBOR auxdata tail")]
    MalformedTail,
    #[error("auxdata carries no recognized storage pointer")]
    NoPointer,
    #[error("auxdata pointer is not a decodable content hash")]
    UnsupportedPointer,
}

/// A content address: which network the bytes live on and the hash they are
/// retrievable by, in the natural encoding of that network (base58 for IPFS,
/// hex for swarm).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceAddress {
    pub origin: SourceOrigin,
    pub id: String,
}

impl SourceAddress {
    pub fn new(origin: SourceOrigin, id: impl Into<String>) -> Self {
        Self {
            origin,
            id: id.into(),
        }
    }

    /// Key under which fetches for this address are deduplicated.
    pub fn unique_id(&self) -> String {
        format!("{}:{}", self.origin, self.id)
    }

    /// Extracts the metadata pointer from the CBOR auxdata at the tail of a
    /// runtime bytecode. The first recognized map entry wins; entries such as
    /// the `solc` version marker are skipped.
    pub fn from_runtime_code(code: &[u8]) -> Result<Self, AuxdataError> {
        let (_, auxdata) = split_auxdata(code).ok_or(AuxdataError::MalformedTail)?;
        let value: ciborium::value::Value =
            ciborium::from_reader(auxdata).map_err(|_| AuxdataError::MalformedTail)?;

        let entries = match value {
            ciborium::value::Value::Map(entries) => entries,
            _ => return Err(AuxdataError::MalformedTail),
        };

        for (key, value) in entries {
            let origin = match key.as_text() {
                Some("ipfs") => SourceOrigin::Ipfs,
                Some("bzzr0") => SourceOrigin::Bzzr0,
                Some("bzzr1") => SourceOrigin::Bzzr1,
                _ => continue,
            };
            let bytes = match value.as_bytes() {
                Some(bytes) => bytes,
                None => return Err(AuxdataError::MalformedTail),
            };
            let id = match origin {
                SourceOrigin::Ipfs => {
                    let multihash = Multihash::<64>::from_bytes(bytes)
                        .map_err(|_| AuxdataError::UnsupportedPointer)?;
                    Cid::new_v0(multihash)
                        .map_err(|_| AuxdataError::UnsupportedPointer)?
                        .to_string()
                }
                SourceOrigin::Bzzr0 | SourceOrigin::Bzzr1 => hex::encode(bytes),
            };
            return Ok(Self { origin, id });
        }

        Err(AuxdataError::NoPointer)
    }

    /// The IPFS address (CIDv0) of the given bytes.
    pub fn ipfs_of(bytes: &[u8]) -> Result<Self, AuxdataError> {
        let digest = Code::Sha2_256.digest(bytes);
        let cid = Cid::new_v0(digest).map_err(|_| AuxdataError::UnsupportedPointer)?;
        Ok(Self::new(SourceOrigin::Ipfs, cid.to_string()))
    }
}

impl fmt::Display for SourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.origin, self.id)
    }
}

/// Splits runtime bytecode into the executable body and the CBOR auxdata
/// segment, using the trailing two-byte big-endian length. Returns `None` if
/// the declared length does not fit inside the bytecode.
pub fn split_auxdata(code: &[u8]) -> Option<(&[u8], &[u8])> {
    if code.len() < 2 {
        return None;
    }
    let declared = u16::from_be_bytes([code[code.len() - 2], code[code.len() - 1]]) as usize;
    if declared == 0 || declared + 2 > code.len() {
        return None;
    }
    let body_end = code.len() - declared - 2;
    Some((&code[..body_end], &code[body_end..code.len() - 2]))
}
