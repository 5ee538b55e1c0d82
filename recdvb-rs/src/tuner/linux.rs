//! `/dev/dvb/adapterN` access through the Linux DVB API v5 ioctls.

use std::ffi::CStr;
use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use log::debug;
use nix::fcntl::OFlag;
use nix::libc::c_char;
use nix::{ioctl_none, ioctl_read, ioctl_write_int_bad, ioctl_write_ptr, request_code_none};

use super::{DeviceNode, DvbBackend, FrontendInfo, FrontendStatus, TuneRequest, Voltage};

const DTV_TUNE: u32 = 1;
const DTV_FREQUENCY: u32 = 3;
const DTV_VOLTAGE: u32 = 10;
const DTV_STREAM_ID: u32 = 42;

const DMX_IN_FRONTEND: u32 = 0;
const DMX_OUT_TS_TAP: u32 = 2;
const DMX_PES_OTHER: u32 = 20;
const DMX_IMMEDIATE_START: u32 = 4;
/// Pseudo PID selecting every packet.
const PID_PASS_ALL: u16 = 0x2000;

#[allow(dead_code)]
#[repr(C)]
struct DvbFrontendInfo {
    name: [c_char; 128],
    fe_type: u32,
    frequency_min: u32,
    frequency_max: u32,
    frequency_stepsize: u32,
    frequency_tolerance: u32,
    symbol_rate_min: u32,
    symbol_rate_max: u32,
    symbol_rate_tolerance: u32,
    notifier_delay: u32,
    caps: u32,
}

#[allow(dead_code)]
#[repr(C)]
struct DvbFrontendEvent {
    status: u32,
    parameters: [u32; 9],
}

/// `struct dtv_property`; the kernel declares it packed.
#[allow(dead_code)]
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct DtvProperty {
    cmd: u32,
    reserved: [u32; 3],
    data: u32,
    rest: [u8; 44 + mem::size_of::<usize>()],
    result: i32,
}

impl DtvProperty {
    fn new(cmd: u32, data: u32) -> Self {
        Self {
            cmd,
            reserved: [0; 3],
            data,
            rest: [0; 44 + mem::size_of::<usize>()],
            result: 0,
        }
    }
}

#[repr(C)]
struct DtvProperties {
    num: u32,
    props: *mut DtvProperty,
}

#[repr(C)]
struct DmxPesFilterParams {
    pid: u16,
    input: u32,
    output: u32,
    pes_type: u32,
    flags: u32,
}

ioctl_read!(fe_get_info, b'o', 61, DvbFrontendInfo);
ioctl_write_int_bad!(fe_set_voltage, request_code_none!(b'o', 67));
ioctl_read!(fe_read_status, b'o', 69, u32);
ioctl_read!(fe_read_snr, b'o', 72, u16);
ioctl_read!(fe_get_event, b'o', 78, DvbFrontendEvent);
ioctl_write_ptr!(fe_set_property, b'o', 82, DtvProperties);
ioctl_none!(dmx_stop, b'o', 42);
ioctl_write_ptr!(dmx_set_pes_filter, b'o', 44, DmxPesFilterParams);

/// Property list for one `FE_SET_PROPERTY`; `DTV_TUNE` always goes last.
fn property_list(request: &TuneRequest) -> Vec<DtvProperty> {
    let mut props = vec![
        DtvProperty::new(DTV_FREQUENCY, request.frequency),
        DtvProperty::new(DTV_STREAM_ID, request.stream_id),
    ];
    if let Some(voltage) = request.voltage {
        props.push(DtvProperty::new(DTV_VOLTAGE, voltage.sec_voltage()));
    }
    props.push(DtvProperty::new(DTV_TUNE, 0));
    props
}

pub struct LinuxDvb {
    root: PathBuf,
}

impl LinuxDvb {
    pub fn new(adapter: u32) -> Self {
        Self {
            root: PathBuf::from(format!("/dev/dvb/adapter{}", adapter)),
        }
    }

    fn path(&self, node: DeviceNode) -> PathBuf {
        self.root.join(node.to_string())
    }
}

impl DvbBackend for LinuxDvb {
    fn open(&self, node: DeviceNode) -> io::Result<File> {
        let path = self.path(node);
        debug!("[Tuner] Opening {}", path.display());
        match node {
            DeviceNode::Frontend | DeviceNode::Demux => {
                OpenOptions::new().read(true).write(true).open(path)
            }
            DeviceNode::Dvr => OpenOptions::new()
                .read(true)
                .custom_flags(OFlag::O_NONBLOCK.bits())
                .open(path),
        }
    }

    fn frontend_info(&self, fe: &File) -> io::Result<FrontendInfo> {
        // SAFETY: plain C struct, all-zero is a valid value.
        let mut info: DvbFrontendInfo = unsafe { mem::zeroed() };
        unsafe { fe_get_info(fe.as_raw_fd(), &mut info) }?;
        info.name[127] = 0;
        let name = unsafe { CStr::from_ptr(info.name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        Ok(FrontendInfo {
            name,
            fe_type: info.fe_type,
        })
    }

    fn set_properties(&self, fe: &File, request: &TuneRequest) -> io::Result<()> {
        let mut props = property_list(request);
        let cmd = DtvProperties {
            num: props.len() as u32,
            props: props.as_mut_ptr(),
        };
        unsafe { fe_set_property(fe.as_raw_fd(), &cmd) }?;
        Ok(())
    }

    fn set_voltage(&self, fe: &File, voltage: Voltage) -> io::Result<()> {
        unsafe { fe_set_voltage(fe.as_raw_fd(), voltage.sec_voltage() as i32) }?;
        Ok(())
    }

    fn read_event(&self, fe: &File) -> io::Result<FrontendStatus> {
        let mut event = DvbFrontendEvent {
            status: 0,
            parameters: [0; 9],
        };
        unsafe { fe_get_event(fe.as_raw_fd(), &mut event) }?;
        Ok(FrontendStatus(event.status))
    }

    fn read_status(&self, fe: &File) -> io::Result<FrontendStatus> {
        let mut status = 0u32;
        unsafe { fe_read_status(fe.as_raw_fd(), &mut status) }?;
        Ok(FrontendStatus(status))
    }

    fn read_snr(&self, fe: &File) -> io::Result<u16> {
        let mut snr = 0u16;
        unsafe { fe_read_snr(fe.as_raw_fd(), &mut snr) }?;
        Ok(snr)
    }

    fn set_pass_all_filter(&self, demux: &File) -> io::Result<()> {
        let params = DmxPesFilterParams {
            pid: PID_PASS_ALL,
            input: DMX_IN_FRONTEND,
            output: DMX_OUT_TS_TAP,
            pes_type: DMX_PES_OTHER,
            flags: DMX_IMMEDIATE_START,
        };
        unsafe { dmx_set_pes_filter(demux.as_raw_fd(), &params) }?;
        Ok(())
    }

    fn stop_filter(&self, demux: &File) -> io::Result<()> {
        unsafe { dmx_stop(demux.as_raw_fd()) }?;
        Ok(())
    }
}
