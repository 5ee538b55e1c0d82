//! TS packet headers and packet alignment.

use log::warn;

/// TS packet size in bytes.
pub const TS_PACKET_SIZE: usize = 188;

/// TS sync byte (0x47).
pub const SYNC_BYTE: u8 = 0x47;

/// Consecutive sync bytes required before a phase is trusted.
const RESYNC_CHECK_PACKETS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsHeader {
    pub transport_error: bool,
    pub payload_unit_start: bool,
    /// Packet Identifier (13 bits).
    pub pid: u16,
    pub scrambling_control: u8,
    pub adaptation_field_control: u8,
    pub continuity_counter: u8,
}

impl TsHeader {
    pub fn has_adaptation_field(&self) -> bool {
        self.adaptation_field_control & 0x02 != 0
    }

    pub fn has_payload(&self) -> bool {
        self.adaptation_field_control & 0x01 != 0
    }
}

#[derive(Debug, Clone)]
pub struct TsPacket<'a> {
    pub header: TsHeader,
    /// Payload after the adaptation field, if any.
    pub payload: &'a [u8],
}

impl<'a> TsPacket<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, &'static str> {
        if data.len() < TS_PACKET_SIZE {
            return Err("Packet too short");
        }
        if data[0] != SYNC_BYTE {
            return Err("Invalid sync byte");
        }

        let header = TsHeader {
            transport_error: data[1] & 0x80 != 0,
            payload_unit_start: data[1] & 0x40 != 0,
            pid: ((data[1] as u16 & 0x1F) << 8) | data[2] as u16,
            scrambling_control: (data[3] >> 6) & 0x03,
            adaptation_field_control: (data[3] >> 4) & 0x03,
            continuity_counter: data[3] & 0x0F,
        };

        let offset = if header.has_adaptation_field() {
            5 + data[4] as usize
        } else {
            4
        };
        let payload = if header.has_payload() && offset < TS_PACKET_SIZE {
            &data[offset..TS_PACKET_SIZE]
        } else {
            &[]
        };

        Ok(TsPacket { header, payload })
    }
}

/// PID of an aligned packet without a full parse.
pub(crate) fn pid_of(packet: &[u8]) -> u16 {
    ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16
}

/// Iterates over an already aligned buffer, skipping packets with a bad sync byte.
pub struct TsPacketIterator<'a> {
    chunks: std::slice::ChunksExact<'a, u8>,
}

impl<'a> TsPacketIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            chunks: data.chunks_exact(TS_PACKET_SIZE),
        }
    }
}

impl<'a> Iterator for TsPacketIterator<'a> {
    type Item = (&'a [u8], TsPacket<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        for raw in self.chunks.by_ref() {
            if let Ok(packet) = TsPacket::parse(raw) {
                return Some((raw, packet));
            }
        }
        None
    }
}

/// Find an offset (0..TS_PACKET_SIZE-1) such that
/// `buf[offset + k*188] == 0x47` for k in 0..RESYNC_CHECK_PACKETS.
fn find_sync_offset(buf: &[u8]) -> Option<usize> {
    let need = TS_PACKET_SIZE * RESYNC_CHECK_PACKETS;
    (0..TS_PACKET_SIZE)
        .take_while(|start| start + need <= buf.len())
        .find(|&start| (0..RESYNC_CHECK_PACKETS).all(|k| buf[start + k * TS_PACKET_SIZE] == SYNC_BYTE))
}

/// Carries partial packets across reads and re-aligns the stream when the
/// sync byte drifts. Device reads are not guaranteed to end on a packet
/// boundary.
#[derive(Debug, Default)]
pub struct PacketStash {
    stash: Vec<u8>,
}

impl PacketStash {
    pub fn new() -> Self {
        Self {
            stash: Vec::with_capacity(TS_PACKET_SIZE * 32),
        }
    }

    /// Append `input` and return every whole, aligned packet now available.
    pub fn push(&mut self, input: &[u8]) -> Vec<u8> {
        self.stash.extend_from_slice(input);

        if self.stash.first().copied() != Some(SYNC_BYTE) {
            match find_sync_offset(&self.stash) {
                Some(off) => {
                    warn!("[Stream] Resync TS: dropping {} bytes", off);
                    self.stash.drain(..off);
                }
                None => {
                    // Keep at most 187 bytes to allow sync across chunk boundary.
                    let keep = TS_PACKET_SIZE - 1;
                    if self.stash.len() > keep {
                        self.stash.drain(..self.stash.len() - keep);
                    }
                    return Vec::new();
                }
            }
        }

        let full_len = (self.stash.len() / TS_PACKET_SIZE) * TS_PACKET_SIZE;
        let out = self.stash[..full_len].to_vec();
        self.stash.drain(..full_len);
        out
    }

    /// Bytes held back waiting for the rest of a packet.
    pub fn pending(&self) -> usize {
        self.stash.len()
    }

    pub fn clear(&mut self) {
        self.stash.clear();
    }
}
