//! Section framing.

use crate::binary::{write_name, write_u32};
use crate::error::{ensure_u32, CodegenResult};
use crate::types::SECTION_CUSTOM;

/// One encoded section: an id byte followed by a size-prefixed payload.
#[derive(Debug)]
pub struct Section {
    id: u8,
    payload: Vec<u8>,
}

impl Section {
    pub fn new(id: u8, payload: Vec<u8>) -> Self {
        Self { id, payload }
    }

    /// A custom section: `name` followed by raw `data`.
    pub fn custom(name: &str, data: &[u8]) -> CodegenResult<Self> {
        let mut payload = Vec::with_capacity(name.len() + data.len() + 5);
        write_name(&mut payload, name)?;
        payload.extend_from_slice(data);
        Ok(Self::new(SECTION_CUSTOM, payload))
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) -> CodegenResult<()> {
        out.push(self.id);
        write_u32(out, ensure_u32(self.payload.len(), "section payload size")?);
        out.extend_from_slice(&self.payload);
        Ok(())
    }
}

/// Start a vector payload with its element count.
pub(crate) fn vec_payload(count: usize, what: &str) -> CodegenResult<Vec<u8>> {
    let mut payload = Vec::new();
    write_u32(&mut payload, ensure_u32(count, what)?);
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::read_unsigned;

    #[test]
    fn size_prefix_covers_payload() {
        let section = Section::new(3, vec![0xAA; 200]);
        let mut out = Vec::new();
        section.encode_into(&mut out).unwrap();
        assert_eq!(out[0], 3);
        let mut pos = 1;
        assert_eq!(read_unsigned(&out, &mut pos).unwrap(), 200);
        assert_eq!(out.len() - pos, 200);
    }

    #[test]
    fn custom_section_starts_with_name() {
        let section = Section::custom("meta", b"{}").unwrap();
        assert_eq!(section.id(), SECTION_CUSTOM);
        assert_eq!(section.payload_bytes(), b"\x04meta{}");
    }
}
