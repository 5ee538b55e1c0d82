//! Service selection by SID.

use std::collections::{HashMap, HashSet};

use log::{debug, info};

use super::{Filter, Filtered, Selection, StageError};
use crate::ts_analyzer::{
    pid, PacketStash, PatTable, PmtTable, PsiSection, SectionCollector, TsPacketIterator,
    SYNC_BYTE, TS_PACKET_SIZE,
};

/// Keeps the requested services and the PSI/SI they depend on.
#[derive(Debug)]
pub struct ServiceSplitter {
    targets: Vec<u16>,
    /// Alignment for `select_target`, whose input is also written unfiltered.
    select_stash: PacketStash,
    stash: PacketStash,
    collectors: HashMap<u16, SectionCollector>,
    pat: Option<PatTable>,
    /// PMT PID -> program number, selected programs only.
    pmt_pids: HashMap<u16, u16>,
    pmts: HashMap<u16, PmtTable>,
    keep: HashSet<u16>,
    pat_section: Vec<u8>,
    pat_cc: u8,
}

impl ServiceSplitter {
    pub fn new(targets: Vec<u16>) -> Self {
        Self {
            targets,
            select_stash: PacketStash::new(),
            stash: PacketStash::new(),
            collectors: HashMap::new(),
            pat: None,
            pmt_pids: HashMap::new(),
            pmts: HashMap::new(),
            keep: HashSet::new(),
            pat_section: Vec::new(),
            pat_cc: 0,
        }
    }

    fn is_ready(&self) -> bool {
        self.pat.is_some()
            && !self.pmt_pids.is_empty()
            && self.pmt_pids.values().all(|p| self.pmts.contains_key(p))
    }

    fn scan(&mut self, aligned: &[u8]) -> Result<(), StageError> {
        for (_, packet) in TsPacketIterator::new(aligned) {
            let pid_val = packet.header.pid;
            if pid_val != pid::PAT && !self.pmt_pids.contains_key(&pid_val) {
                continue;
            }
            if !packet.header.has_payload() || packet.header.transport_error {
                continue;
            }

            let collector = self.collectors.entry(pid_val).or_default();
            let complete = collector.add_data(
                packet.payload,
                packet.header.continuity_counter,
                packet.header.payload_unit_start,
            );
            if complete {
                if let Some(section) = collector.get_section().map(|s| s.to_vec()) {
                    collector.clear();
                    self.process_section(pid_val, &section)?;
                }
            }
        }
        Ok(())
    }

    fn process_section(&mut self, pid_val: u16, data: &[u8]) -> Result<(), StageError> {
        let section = match PsiSection::parse(data) {
            Ok(s) => s,
            Err(reason) => {
                debug!("[Splitter] Dropping section on PID {:#06x}: {}", pid_val, reason);
                return Ok(());
            }
        };

        if pid_val == pid::PAT {
            return self.process_pat(&section);
        }
        if let Some(&program) = self.pmt_pids.get(&pid_val) {
            if section.header.table_id_extension != program {
                return Ok(());
            }
            if self
                .pmts
                .get(&program)
                .is_some_and(|pmt| pmt.version_number == section.header.version_number)
            {
                return Ok(());
            }
            let pmt = PmtTable::parse(&section).map_err(|reason| StageError::Malformed {
                table: "PMT",
                reason,
            })?;
            if self.pmts.contains_key(&program) {
                info!(
                    "[Splitter] PMT of service {} changed (version {})",
                    program, pmt.version_number
                );
            }
            self.pmts.insert(program, pmt);
            self.rebuild_keep();
        }
        Ok(())
    }

    fn process_pat(&mut self, section: &PsiSection) -> Result<(), StageError> {
        if self
            .pat
            .as_ref()
            .is_some_and(|pat| pat.version_number == section.header.version_number)
        {
            return Ok(());
        }
        let pat = PatTable::parse(section).map_err(|reason| StageError::Malformed {
            table: "PAT",
            reason,
        })?;

        let selected: Vec<u16> = pat
            .programs
            .iter()
            .map(|p| p.program_number)
            .filter(|p| self.targets.contains(p))
            .collect();
        if selected.is_empty() {
            return Err(StageError::ServiceNotFound(self.targets.clone()));
        }
        if selected.len() < self.targets.len() {
            info!(
                "[Splitter] Services {:?} not found, keeping {:?}",
                self.targets.iter().filter(|t| !selected.contains(t)).collect::<Vec<_>>(),
                selected
            );
        }

        self.pmt_pids = pat
            .programs
            .iter()
            .filter(|p| selected.contains(&p.program_number))
            .map(|p| (p.pid, p.program_number))
            .collect();
        self.pmts.retain(|program, _| selected.contains(program));
        self.collectors
            .retain(|pid_val, _| *pid_val == pid::PAT || self.pmt_pids.contains_key(pid_val));
        self.pat_section = pat.retain_programs(&selected).to_section();
        self.pat = Some(pat);
        self.rebuild_keep();
        Ok(())
    }

    fn rebuild_keep(&mut self) {
        self.keep = self.pmt_pids.keys().copied().collect();
        for pmt in self.pmts.values() {
            self.keep.extend(pmt.component_pids());
        }
    }

    /// Packetize the rewritten PAT, padding the last packet with 0xFF.
    fn push_pat(&mut self, out: &mut Vec<u8>) {
        let mut payload = Vec::with_capacity(self.pat_section.len() + 1);
        payload.push(0x00);
        payload.extend_from_slice(&self.pat_section);

        for (i, chunk) in payload.chunks(TS_PACKET_SIZE - 4).enumerate() {
            let start = if i == 0 { 0x40 } else { 0x00 };
            out.extend_from_slice(&[SYNC_BYTE, start, 0x00, 0x10 | self.pat_cc]);
            out.extend_from_slice(chunk);
            out.resize(out.len() + (TS_PACKET_SIZE - 4 - chunk.len()), 0xFF);
            self.pat_cc = (self.pat_cc + 1) & 0x0F;
        }
    }
}

impl Filter for ServiceSplitter {
    fn select_target(&mut self, input: &[u8]) -> Result<Selection, StageError> {
        let aligned = self.select_stash.push(input);
        self.scan(&aligned)?;
        if self.is_ready() {
            self.select_stash.clear();
            info!("[Splitter] Selected services {:?}", self.pmts.keys().collect::<Vec<_>>());
            Ok(Selection::Ready)
        } else {
            Ok(Selection::MoreNeeded)
        }
    }

    fn filter(&mut self, input: &[u8]) -> Result<Filtered, StageError> {
        let aligned = self.stash.push(input);
        self.scan(&aligned)?;
        if !self.is_ready() {
            return Ok(Filtered::PendingMetadata);
        }

        let mut out = Vec::with_capacity(aligned.len());
        for (raw, packet) in TsPacketIterator::new(&aligned) {
            let pid_val = packet.header.pid;
            if pid_val == pid::PAT {
                if packet.header.payload_unit_start {
                    self.push_pat(&mut out);
                }
            } else if pid_val < pid::SI_LIMIT || self.keep.contains(&pid_val) {
                out.extend_from_slice(raw);
            }
        }
        Ok(Filtered::Data(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts_analyzer::{build_section, pid_of, table_id, PatEntry};

    fn psi_packet(pid: u16, section: &[u8]) -> Vec<u8> {
        let mut p = vec![SYNC_BYTE, 0x40 | (pid >> 8) as u8, pid as u8, 0x10, 0x00];
        p.extend_from_slice(section);
        p.resize(TS_PACKET_SIZE, 0xFF);
        p
    }

    fn es_packet(pid: u16) -> Vec<u8> {
        let mut p = vec![0u8; TS_PACKET_SIZE];
        p[0] = SYNC_BYTE;
        p[1] = (pid >> 8) as u8;
        p[2] = pid as u8;
        p[3] = 0x10;
        p
    }

    fn pat(version: u8) -> Vec<u8> {
        PatTable {
            transport_stream_id: 0x40F1,
            version_number: version,
            programs: vec![
                PatEntry {
                    program_number: 101,
                    pid: 0x0101,
                },
                PatEntry {
                    program_number: 102,
                    pid: 0x0102,
                },
            ],
            nit_pid: Some(pid::NIT),
        }
        .to_section()
    }

    fn pmt_101() -> Vec<u8> {
        let body = [
            0xE1, 0x11, // PCR
            0xF0, 0x06, 0x09, 0x04, 0x00, 0x05, 0xE9, 0x01, // ECM 0x0901
            0x02, 0xE1, 0x11, 0xF0, 0x00, // video
            0x0F, 0xE1, 0x12, 0xF0, 0x00, // audio
        ];
        build_section(table_id::PMT, 101, 0, &body)
    }

    fn pmt_102() -> Vec<u8> {
        let body = [0xE1, 0x21, 0xF0, 0x00, 0x02, 0xE1, 0x21, 0xF0, 0x00];
        build_section(table_id::PMT, 102, 0, &body)
    }

    fn stream() -> Vec<u8> {
        let mut s = psi_packet(pid::PAT, &pat(0));
        s.extend(psi_packet(0x0101, &pmt_101()));
        s.extend(psi_packet(0x0102, &pmt_102()));
        for pid_val in [0x0111, 0x0121, 0x0112, 0x0901, 0x0012, pid::NULL] {
            s.extend(es_packet(pid_val));
        }
        s
    }

    fn pids(data: &[u8]) -> Vec<u16> {
        data.chunks_exact(TS_PACKET_SIZE).map(pid_of).collect()
    }

    #[test]
    fn test_keeps_selected_service() {
        let mut splitter = ServiceSplitter::new(vec![101]);
        assert_eq!(splitter.select_target(&stream()).unwrap(), Selection::Ready);

        let Filtered::Data(out) = splitter.filter(&stream()).unwrap() else {
            panic!("metadata should be complete");
        };
        assert_eq!(pids(&out), vec![0x0000, 0x0101, 0x0111, 0x0112, 0x0901, 0x0012]);

        let section = PsiSection::parse(&out[5..]).unwrap();
        let rewritten = PatTable::parse(&section).unwrap();
        assert_eq!(rewritten.programs.len(), 1);
        assert_eq!(rewritten.get_pmt_pid(101), Some(0x0101));
        assert_eq!(rewritten.nit_pid, Some(pid::NIT));
    }

    #[test]
    fn test_needs_pmt_before_ready() {
        let mut splitter = ServiceSplitter::new(vec![101, 102]);
        let mut partial = psi_packet(pid::PAT, &pat(0));
        partial.extend(psi_packet(0x0101, &pmt_101()));

        assert_eq!(splitter.select_target(&partial).unwrap(), Selection::MoreNeeded);
        assert_eq!(
            splitter.select_target(&psi_packet(0x0102, &pmt_102())).unwrap(),
            Selection::Ready
        );
    }

    #[test]
    fn test_pending_metadata_before_pmt() {
        let mut splitter = ServiceSplitter::new(vec![101]);
        let only_pat = psi_packet(pid::PAT, &pat(0));
        assert_eq!(splitter.filter(&only_pat).unwrap(), Filtered::PendingMetadata);
    }

    #[test]
    fn test_unknown_service() {
        let mut splitter = ServiceSplitter::new(vec![999]);
        assert!(matches!(
            splitter.select_target(&stream()),
            Err(StageError::ServiceNotFound(_))
        ));
    }

    #[test]
    fn test_corrupt_pat_is_ignored() {
        let mut section = pat(0);
        let last = section.len() - 1;
        section[last] ^= 0xFF;
        let mut splitter = ServiceSplitter::new(vec![101]);
        assert_eq!(
            splitter.select_target(&psi_packet(pid::PAT, &section)).unwrap(),
            Selection::MoreNeeded
        );
    }

    #[test]
    fn test_pat_continuity_counter_advances() {
        let mut splitter = ServiceSplitter::new(vec![101]);
        splitter.select_target(&stream()).unwrap();
        let mut input = stream();
        input.extend(psi_packet(pid::PAT, &pat(0)));
        let Filtered::Data(out) = splitter.filter(&input).unwrap() else {
            panic!("metadata should be complete");
        };
        let pat_ccs: Vec<u8> = out
            .chunks_exact(TS_PACKET_SIZE)
            .filter(|p| pid_of(p) == pid::PAT)
            .map(|p| p[3] & 0x0F)
            .collect();
        assert_eq!(pat_ccs, vec![0, 1]);
    }
}
