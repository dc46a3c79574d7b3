//! `/dev/ipmi<N>` character device. Requests and responses go through the
//! ioctls declared in `<linux/ipmi.h>`; the device is opened non-blocking
//! so receiving never stalls a tick.

use super::{Response, SensorBus};
use crate::agent::counters::CounterError;

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;

use libc::{c_int, c_long, c_short, c_uchar, c_uint, c_ulong};

const IPMI_SYSTEM_INTERFACE_ADDR_TYPE: c_int = 0x0c;
const IPMI_BMC_CHANNEL: c_short = 0x0f;
const IPMI_RESPONSE_RECV_TYPE: c_int = 1;

const IPMI_NETFN_SENSOR_EVENT_REQUEST: u8 = 0x04;
const IPMI_GET_SENSOR_READING_CMD: u8 = 0x2d;

/// Room for any `struct ipmi_addr` the driver reports back.
const ADDR_BUFFER: usize = 64;
const DATA_BUFFER: usize = 64;

#[repr(C)]
struct SystemInterfaceAddr {
    addr_type: c_int,
    channel: c_short,
    lun: c_uchar,
}

#[repr(C)]
struct Msg {
    netfn: c_uchar,
    cmd: c_uchar,
    data_len: u16,
    data: *mut c_uchar,
}

#[repr(C)]
struct Req {
    addr: *mut c_uchar,
    addr_len: c_uint,
    msgid: c_long,
    msg: Msg,
}

#[repr(C)]
struct Recv {
    recv_type: c_int,
    addr: *mut c_uchar,
    addr_len: c_uint,
    msgid: c_long,
    msg: Msg,
}

const fn ioc(dir: c_ulong, nr: c_ulong, size: usize) -> c_ulong {
    (dir << 30) | ((size as c_ulong) << 16) | ((b'i' as c_ulong) << 8) | nr
}

const IOC_WRITE: c_ulong = 1;
const IOC_READ: c_ulong = 2;

const IPMICTL_RECEIVE_MSG_TRUNC: c_ulong =
    ioc(IOC_READ | IOC_WRITE, 11, std::mem::size_of::<Recv>());
const IPMICTL_SEND_COMMAND: c_ulong = ioc(IOC_READ, 13, std::mem::size_of::<Req>());

struct DevIpmi {
    file: File,
}

impl SensorBus for DevIpmi {
    fn request(&mut self, sensor: u8, correlation: u64) -> std::io::Result<()> {
        let mut addr = SystemInterfaceAddr {
            addr_type: IPMI_SYSTEM_INTERFACE_ADDR_TYPE,
            channel: IPMI_BMC_CHANNEL,
            lun: 0,
        };
        let mut data = [sensor];

        let mut req = Req {
            addr: &mut addr as *mut SystemInterfaceAddr as *mut c_uchar,
            addr_len: std::mem::size_of::<SystemInterfaceAddr>() as c_uint,
            msgid: correlation as c_long,
            msg: Msg {
                netfn: IPMI_NETFN_SENSOR_EVENT_REQUEST,
                cmd: IPMI_GET_SENSOR_READING_CMD,
                data_len: data.len() as u16,
                data: data.as_mut_ptr(),
            },
        };

        // SAFETY: every pointer in `req` refers to a live local that
        // outlives the call, with lengths matching the buffers.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                IPMICTL_SEND_COMMAND as _,
                &mut req as *mut Req,
            )
        };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }

        Ok(())
    }

    fn poll(&mut self) -> std::io::Result<Option<Response>> {
        loop {
            let mut addr = [0u8; ADDR_BUFFER];
            let mut data = [0u8; DATA_BUFFER];

            let mut recv = Recv {
                recv_type: 0,
                addr: addr.as_mut_ptr(),
                addr_len: ADDR_BUFFER as c_uint,
                msgid: 0,
                msg: Msg {
                    netfn: 0,
                    cmd: 0,
                    data_len: DATA_BUFFER as u16,
                    data: data.as_mut_ptr(),
                },
            };

            // SAFETY: the address and data buffers outlive the call and
            // their capacities are passed alongside the pointers.
            let rc = unsafe {
                libc::ioctl(
                    self.file.as_raw_fd(),
                    IPMICTL_RECEIVE_MSG_TRUNC as _,
                    &mut recv as *mut Recv,
                )
            };
            if rc < 0 {
                let e = std::io::Error::last_os_error();
                if e.kind() == std::io::ErrorKind::WouldBlock {
                    return Ok(None);
                }
                return Err(e);
            }

            if recv.recv_type != IPMI_RESPONSE_RECV_TYPE {
                continue;
            }

            // data[0] is the completion code, data[1] the reading
            let len = (recv.msg.data_len as usize).min(DATA_BUFFER);
            let reading = if len > 2 { Some(data[1]) } else { None };

            return Ok(Some(Response {
                correlation: recv.msgid as u64,
                reading,
            }));
        }
    }
}

pub fn open(device: &str) -> Result<Box<dyn SensorBus>, CounterError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(device)
        .map_err(|source| CounterError::Open {
            path: device.to_string(),
            source,
        })?;

    Ok(Box::new(DevIpmi { file }))
}
