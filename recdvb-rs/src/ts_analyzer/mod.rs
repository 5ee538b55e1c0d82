//! MPEG-TS parsing used by the stream stages.
//!
//! Only what the service splitter needs lives here: packet headers, packet
//! re-alignment, PSI section assembly, and the PAT/PMT tables.

mod packet;
mod pat;
mod pmt;
mod psi;

pub use packet::{PacketStash, TsHeader, TsPacket, TsPacketIterator, SYNC_BYTE, TS_PACKET_SIZE};
pub use pat::{PatEntry, PatTable};
pub use pmt::{PmtStream, PmtTable};
pub use psi::{crc32_mpeg2, PsiHeader, PsiSection, SectionCollector};

pub(crate) use packet::pid_of;
pub(crate) use psi::build_section;

/// Well-known PIDs.
pub mod pid {
    pub const PAT: u16 = 0x0000;
    pub const CAT: u16 = 0x0001;
    pub const NIT: u16 = 0x0010;
    /// PIDs below this carry PSI/SI tables in ARIB streams.
    pub const SI_LIMIT: u16 = 0x0030;
    pub const NULL: u16 = 0x1FFF;
}

pub mod table_id {
    pub const PAT: u8 = 0x00;
    pub const PMT: u8 = 0x02;
}

pub mod descriptor_tag {
    /// Conditional access descriptor; carries the ECM PID inside a PMT.
    pub const CA: u8 = 0x09;
}
