//! PSI section parsing, assembly across packets, and CRC32.

/// Long-form section header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsiHeader {
    pub table_id: u8,
    /// Section length (12 bits).
    pub section_length: u16,
    pub table_id_extension: u16,
    /// Version number (5 bits).
    pub version_number: u8,
    pub current_next_indicator: bool,
    pub section_number: u8,
    pub last_section_number: u8,
}

#[derive(Debug, Clone)]
pub struct PsiSection<'a> {
    pub header: PsiHeader,
    /// Section body (after the 8-byte header, before CRC).
    pub data: &'a [u8],
    pub crc32: u32,
}

impl<'a> PsiSection<'a> {
    /// Parse a long-form section starting at `table_id` and check its CRC.
    pub fn parse(data: &'a [u8]) -> Result<Self, &'static str> {
        if data.len() < 3 {
            return Err("Section too short for header");
        }
        if data[1] & 0x80 == 0 {
            return Err("Short-form section");
        }

        let section_length = ((data[1] as u16 & 0x0F) << 8) | data[2] as u16;
        let total_length = 3 + section_length as usize;
        // 5 bytes of extended header plus the CRC
        if section_length < 9 {
            return Err("Section length too small");
        }
        if data.len() < total_length {
            return Err("Incomplete section data");
        }

        let crc_offset = total_length - 4;
        let crc32 = u32::from_be_bytes([
            data[crc_offset],
            data[crc_offset + 1],
            data[crc_offset + 2],
            data[crc_offset + 3],
        ]);
        if crc32_mpeg2(&data[..crc_offset]) != crc32 {
            return Err("CRC mismatch");
        }

        Ok(PsiSection {
            header: PsiHeader {
                table_id: data[0],
                section_length,
                table_id_extension: ((data[3] as u16) << 8) | data[4] as u16,
                version_number: (data[5] >> 1) & 0x1F,
                current_next_indicator: data[5] & 0x01 != 0,
                section_number: data[6],
                last_section_number: data[7],
            },
            data: &data[8..crc_offset],
            crc32,
        })
    }

    pub fn total_length(&self) -> usize {
        3 + self.header.section_length as usize
    }
}

/// Build a complete long-form section (header, `body`, CRC).
pub(crate) fn build_section(table_id: u8, extension: u16, version: u8, body: &[u8]) -> Vec<u8> {
    let section_length = 5 + body.len() + 4;
    let mut out = Vec::with_capacity(3 + section_length);
    out.push(table_id);
    out.push(0xB0 | ((section_length >> 8) as u8 & 0x0F));
    out.push(section_length as u8);
    out.extend_from_slice(&extension.to_be_bytes());
    out.push(0xC1 | ((version & 0x1F) << 1));
    out.push(0x00);
    out.push(0x00);
    out.extend_from_slice(body);
    let crc = crc32_mpeg2(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

/// Reassembles one section that may span several packets of the same PID.
#[derive(Debug, Default)]
pub struct SectionCollector {
    buffer: Vec<u8>,
    expected_length: Option<usize>,
    last_cc: Option<u8>,
}

impl SectionCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.expected_length = None;
        self.last_cc = None;
    }

    /// Feed one packet payload. Returns true once a whole section is buffered.
    pub fn add_data(&mut self, payload: &[u8], cc: u8, payload_unit_start: bool) -> bool {
        if let Some(last) = self.last_cc {
            if cc != (last + 1) & 0x0F && !payload_unit_start {
                self.clear();
                return false;
            }
        }
        self.last_cc = Some(cc);

        if payload_unit_start {
            let Some(&pointer) = payload.first() else {
                return false;
            };
            let section_start = pointer as usize + 1;
            if section_start >= payload.len() {
                return false;
            }
            self.buffer.clear();
            self.buffer.extend_from_slice(&payload[section_start..]);
            self.expected_length = None;
        } else if !self.buffer.is_empty() {
            self.buffer.extend_from_slice(payload);
        }

        if self.expected_length.is_none() && self.buffer.len() >= 3 {
            let section_length = ((self.buffer[1] as usize & 0x0F) << 8) | self.buffer[2] as usize;
            self.expected_length = Some(3 + section_length);
        }

        self.expected_length.map_or(false, |len| self.buffer.len() >= len)
    }

    pub fn get_section(&self) -> Option<&[u8]> {
        self.expected_length
            .filter(|&len| self.buffer.len() >= len)
            .map(|len| &self.buffer[..len])
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// CRC32 for MPEG-2 (polynomial 0x04C11DB7).
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    static CRC_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = (i as u32) << 24;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 0x8000_0000 != 0 {
                    (crc << 1) ^ 0x04C1_1DB7
                } else {
                    crc << 1
                };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    data.iter().fold(0xFFFF_FFFF, |crc, &byte| {
        (crc << 8) ^ CRC_TABLE[((crc >> 24) ^ byte as u32) as usize]
    })
}
