//! PAT (Program Association Table), carried on PID 0x0000.

use super::psi::{build_section, PsiSection};
use super::table_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatEntry {
    /// Program number (service ID).
    pub program_number: u16,
    /// PID of the PMT for this program.
    pub pid: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatTable {
    pub transport_stream_id: u16,
    pub version_number: u8,
    pub programs: Vec<PatEntry>,
    /// From the program_number 0 entry, if present.
    pub nit_pid: Option<u16>,
}

impl PatTable {
    pub fn parse(section: &PsiSection) -> Result<Self, &'static str> {
        if section.header.table_id != table_id::PAT {
            return Err("Not a PAT section");
        }
        if section.data.len() % 4 != 0 {
            return Err("Invalid PAT data length");
        }

        let mut pat = PatTable {
            transport_stream_id: section.header.table_id_extension,
            version_number: section.header.version_number,
            ..Default::default()
        };

        for chunk in section.data.chunks_exact(4) {
            let program_number = u16::from_be_bytes([chunk[0], chunk[1]]);
            let pid = ((chunk[2] as u16 & 0x1F) << 8) | chunk[3] as u16;
            if program_number == 0 {
                pat.nit_pid = Some(pid);
            } else {
                pat.programs.push(PatEntry { program_number, pid });
            }
        }

        Ok(pat)
    }

    pub fn get_pmt_pid(&self, program_number: u16) -> Option<u16> {
        self.programs
            .iter()
            .find(|p| p.program_number == program_number)
            .map(|p| p.pid)
    }

    /// A copy of this table listing only the programs in `keep`.
    pub fn retain_programs(&self, keep: &[u16]) -> PatTable {
        PatTable {
            programs: self
                .programs
                .iter()
                .filter(|p| keep.contains(&p.program_number))
                .copied()
                .collect(),
            ..self.clone()
        }
    }

    /// Serialize back into a complete section, CRC included.
    pub fn to_section(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(4 * (self.programs.len() + 1));
        if let Some(nit) = self.nit_pid {
            body.extend_from_slice(&[0x00, 0x00, 0xE0 | (nit >> 8) as u8, nit as u8]);
        }
        for p in &self.programs {
            body.extend_from_slice(&p.program_number.to_be_bytes());
            body.extend_from_slice(&[0xE0 | (p.pid >> 8) as u8, p.pid as u8]);
        }
        build_section(table_id::PAT, self.transport_stream_id, self.version_number, &body)
    }
}
