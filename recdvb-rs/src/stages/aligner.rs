use log::debug;

use super::{Decoder, StageError};
use crate::ts_analyzer::{pid, pid_of, PacketStash, TS_PACKET_SIZE};

/// Realigns the stream to whole TS packets and optionally drops null packets.
pub struct PacketAligner {
    stash: PacketStash,
    strip_null: bool,
    stripped: u64,
}

impl PacketAligner {
    pub fn new(strip_null: bool) -> Self {
        Self {
            stash: PacketStash::new(),
            strip_null,
            stripped: 0,
        }
    }
}

impl Decoder for PacketAligner {
    fn decode(&mut self, input: &[u8]) -> Result<Vec<u8>, StageError> {
        let aligned = self.stash.push(input);
        if !self.strip_null {
            return Ok(aligned);
        }
        let mut out = Vec::with_capacity(aligned.len());
        for packet in aligned.chunks_exact(TS_PACKET_SIZE) {
            if pid_of(packet) == pid::NULL {
                self.stripped += 1;
            } else {
                out.extend_from_slice(packet);
            }
        }
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<u8>, StageError> {
        if self.stash.pending() > 0 {
            debug!(
                "[Aligner] Discarding {} bytes of trailing partial packet",
                self.stash.pending()
            );
            self.stash.clear();
        }
        if self.stripped > 0 {
            debug!("[Aligner] Stripped {} null packets", self.stripped);
        }
        Ok(Vec::new())
    }
}
