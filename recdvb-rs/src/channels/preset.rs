//! Transport stream IDs of the BS slots and ND transponders.

use super::Channel;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preset {
    pub channel: Channel,
    pub tsid: u32,
}

static PRESETS: &[(&str, u32)] = &[
    ("bs01_0", 0x4010),
    ("bs01_1", 0x4011),
    ("bs01_2", 0x4012),
    ("bs03_0", 0x4030),
    ("bs03_1", 0x4031),
    ("bs03_2", 0x4632),
    ("bs05_0", 0x4450),
    ("bs05_1", 0x4451),
    ("bs09_0", 0x4090),
    ("bs09_1", 0x4091),
    ("bs09_2", 0x4092),
    ("bs11_0", 0x46b0),
    ("bs11_1", 0x46b1),
    ("bs11_2", 0x46b2),
    ("bs13_0", 0x40d0),
    ("bs13_1", 0x40d1),
    ("bs13_2", 0x46d2),
    ("bs15_0", 0x40f1),
    ("bs15_1", 0x40f2),
    ("bs19_0", 0x4730),
    ("bs19_1", 0x4731),
    ("bs19_2", 0x4732),
    ("bs21_0", 0x4750),
    ("bs21_1", 0x4751),
    ("bs21_2", 0x4752),
    ("bs23_0", 0x4770),
    ("bs23_1", 0x4771),
    ("bs23_2", 0x4772),
    ("nd02", 0x6020),
    ("nd04", 0x7040),
    ("nd06", 0x7060),
    ("nd08", 0x6080),
    ("nd10", 0x60a0),
    ("nd12", 0x70c0),
    ("nd14", 0x70e0),
    ("nd16", 0x7100),
    ("nd18", 0x7120),
    ("nd20", 0x7140),
    ("nd22", 0x7160),
    ("nd24", 0x7180),
];

/// Resolve a preset name such as `bs03_1` or `ND12`.
pub fn lookup(name: &str) -> Option<Preset> {
    let channel: Channel = name.parse().ok()?;
    let key = channel.preset_name()?;
    PRESETS
        .iter()
        .find(|(n, _)| *n == key)
        .map(|&(_, tsid)| Preset { channel, tsid })
}
