use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::error::{Result, SngError};
use crate::mask::{MaskKey, MASK_KEY_LEN};

pub const IDENTIFIER: &[u8; 6] = b"SNGPKG";
pub const DEFAULT_VERSION: u32 = 1;
/// identifier (6) + version (4) + mask key (16)
pub const HEADER_SIZE: u64 = 26;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version:  u32,
    pub mask_key: MaskKey,
}

impl Header {
    pub fn new(version: u32, mask_key: MaskKey) -> Self {
        Self { version, mask_key }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(IDENTIFIER)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_all(self.mask_key.as_bytes())?;
        Ok(())
    }

    /// Reads the identifier first and stops there if it does not match.
    pub fn read<R: Read>(mut reader: R) -> Result<Self> {
        let mut identifier = [0u8; 6];
        reader.read_exact(&mut identifier).map_err(|e| truncated(e, "identifier"))?;
        if &identifier != IDENTIFIER {
            return Err(SngError::format(format!(
                "invalid file identifier {:?}, expected \"SNGPKG\"",
                String::from_utf8_lossy(&identifier)
            )));
        }
        let version = reader.read_u32::<LittleEndian>().map_err(|e| truncated(e, "version"))?;
        let mut key = [0u8; MASK_KEY_LEN];
        reader.read_exact(&mut key).map_err(|e| truncated(e, "mask key"))?;
        Ok(Self { version, mask_key: MaskKey(key) })
    }
}

/// Map an early EOF inside a fixed-size field to a format error.
pub(crate) fn truncated(e: io::Error, what: &str) -> SngError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        SngError::format(format!("truncated while reading {what}"))
    } else {
        SngError::Io(e)
    }
}
