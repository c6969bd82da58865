//! PS-X EXE header parsing

use px_core::{EmulatorError, Result};

/// Size of the header block preceding the text section
pub const EXE_HEADER_SIZE: usize = 0x800;

const EXE_MAGIC: &[u8; 8] = b"PS-X EXE";

/// Load parameters from a PS-X EXE header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExeHeader {
    pub initial_pc: u32,
    pub initial_gp: u32,
    pub load_address: u32,
    pub file_size: u32,
    pub memfill_start: u32,
    pub memfill_size: u32,
    pub initial_sp_base: u32,
    pub initial_sp_offset: u32,
}

impl ExeHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < EXE_HEADER_SIZE {
            return Err(EmulatorError::InvalidExecutable(format!(
                "{} bytes is smaller than the header",
                data.len()
            )));
        }
        if &data[..8] != EXE_MAGIC {
            return Err(EmulatorError::InvalidExecutable("missing PS-X EXE magic".to_string()));
        }

        let word = |offset: usize| u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]]);

        Ok(Self {
            initial_pc: word(0x10),
            initial_gp: word(0x14),
            load_address: word(0x18),
            file_size: word(0x1C),
            memfill_start: word(0x28),
            memfill_size: word(0x2C),
            initial_sp_base: word(0x30),
            initial_sp_offset: word(0x34),
        })
    }

    /// Initial stack pointer, if the header sets one
    pub fn initial_sp(&self) -> Option<u32> {
        (self.initial_sp_base != 0).then(|| self.initial_sp_base.wrapping_add(self.initial_sp_offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_exe(pc: u32, load_address: u32, text: &[u32]) -> Vec<u8> {
        let mut data = vec![0u8; EXE_HEADER_SIZE];
        data[..8].copy_from_slice(EXE_MAGIC);
        data[0x10..0x14].copy_from_slice(&pc.to_le_bytes());
        data[0x18..0x1C].copy_from_slice(&load_address.to_le_bytes());
        data[0x1C..0x20].copy_from_slice(&((text.len() * 4) as u32).to_le_bytes());
        for word in text {
            data.extend_from_slice(&word.to_le_bytes());
        }
        data
    }

    #[test]
    fn test_parse_header() {
        let mut data = build_exe(0x8001_0000, 0x8001_0000, &[0; 4]);
        data[0x30..0x34].copy_from_slice(&0x801F_FF00u32.to_le_bytes());
        data[0x34..0x38].copy_from_slice(&0x10u32.to_le_bytes());

        let header = ExeHeader::parse(&data).unwrap();
        assert_eq!(header.initial_pc, 0x8001_0000);
        assert_eq!(header.file_size, 16);
        assert_eq!(header.initial_sp(), Some(0x801F_FF10));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let data = vec![0u8; EXE_HEADER_SIZE];
        assert!(matches!(ExeHeader::parse(&data), Err(EmulatorError::InvalidExecutable(_))));
        assert!(ExeHeader::parse(&data[..16]).is_err());
    }
}
