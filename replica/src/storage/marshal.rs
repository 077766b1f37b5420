//! Payload encodings for durable records.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Strategy turning a payload into bytes and back.
///
/// `unmarshal` receives exactly the bytes `marshal` produced for one record and must
/// fail rather than guess when they do not decode.
pub trait Marshal<T>: Send + Sync {
    fn marshal(&self, value: &T, out: &mut Vec<u8>) -> Result<()>;
    fn unmarshal(&self, bytes: &[u8]) -> Result<T>;
}

/// bincode encoding for any serde type
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeMarshal;

impl<T> Marshal<T> for BincodeMarshal
where
    T: Serialize + DeserializeOwned,
{
    fn marshal(&self, value: &T, out: &mut Vec<u8>) -> Result<()> {
        bincode::serialize_into(out, value).map_err(|e| Error::Marshal(e.to_string()))
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| Error::Marshal(e.to_string()))
    }
}

/// Fixed 8 byte little endian encoding for log indices
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexMarshal;

impl Marshal<u64> for IndexMarshal {
    fn marshal(&self, value: &u64, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<u64> {
        let raw: [u8; 8] = bytes
            .try_into()
            .map_err(|_| Error::Marshal(format!("index record of {} bytes", bytes.len())))?;
        Ok(u64::from_le_bytes(raw))
    }
}
