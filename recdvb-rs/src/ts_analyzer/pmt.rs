//! PMT (Program Map Table) parsing.

use super::psi::PsiSection;
use super::{descriptor_tag, table_id};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtStream {
    pub stream_type: u8,
    pub elementary_pid: u16,
    /// Raw ES info descriptors.
    pub descriptors: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PmtTable {
    /// Program number (service ID).
    pub program_number: u16,
    pub version_number: u8,
    pub pcr_pid: u16,
    /// Raw program info descriptors.
    pub program_info: Vec<u8>,
    pub streams: Vec<PmtStream>,
}

impl PmtTable {
    pub fn parse(section: &PsiSection) -> Result<Self, &'static str> {
        if section.header.table_id != table_id::PMT {
            return Err("Not a PMT section");
        }

        let data = section.data;
        if data.len() < 4 {
            return Err("PMT data too short");
        }

        let pcr_pid = ((data[0] as u16 & 0x1F) << 8) | data[1] as u16;
        let program_info_length = ((data[2] as usize & 0x0F) << 8) | data[3] as usize;
        if data.len() < 4 + program_info_length {
            return Err("Invalid program info length");
        }

        let mut pmt = PmtTable {
            program_number: section.header.table_id_extension,
            version_number: section.header.version_number,
            pcr_pid,
            program_info: data[4..4 + program_info_length].to_vec(),
            streams: Vec::new(),
        };

        let mut offset = 4 + program_info_length;
        while offset + 5 <= data.len() {
            let stream_type = data[offset];
            let elementary_pid = ((data[offset + 1] as u16 & 0x1F) << 8) | data[offset + 2] as u16;
            let es_info_length = ((data[offset + 3] as usize & 0x0F) << 8) | data[offset + 4] as usize;
            offset += 5;

            if offset + es_info_length > data.len() {
                break;
            }
            pmt.streams.push(PmtStream {
                stream_type,
                elementary_pid,
                descriptors: data[offset..offset + es_info_length].to_vec(),
            });
            offset += es_info_length;
        }

        Ok(pmt)
    }

    /// ECM PIDs announced by CA descriptors at program or stream level.
    pub fn ecm_pids(&self) -> Vec<u16> {
        let mut pids = ca_pids(&self.program_info);
        for s in &self.streams {
            pids.extend(ca_pids(&s.descriptors));
        }
        pids.sort_unstable();
        pids.dedup();
        pids
    }

    /// Every PID this program needs: PCR, elementary streams, and ECMs.
    pub fn component_pids(&self) -> Vec<u16> {
        let mut pids: Vec<u16> = self.streams.iter().map(|s| s.elementary_pid).collect();
        pids.push(self.pcr_pid);
        pids.extend(self.ecm_pids());
        pids.sort_unstable();
        pids.dedup();
        pids
    }
}

fn ca_pids(mut descriptors: &[u8]) -> Vec<u16> {
    let mut pids = Vec::new();
    while descriptors.len() >= 2 {
        let tag = descriptors[0];
        let len = descriptors[1] as usize;
        let Some(body) = descriptors.get(2..2 + len) else {
            break;
        };
        // CA_system_ID(16) reserved(3) CA_PID(13)
        if tag == descriptor_tag::CA && body.len() >= 4 {
            pids.push(((body[2] as u16 & 0x1F) << 8) | body[3] as u16);
        }
        descriptors = &descriptors[2 + len..];
    }
    pids
}
