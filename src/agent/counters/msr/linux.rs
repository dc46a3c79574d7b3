use super::RawReader;
use crate::agent::counters::CounterError;

use std::fs::File;
use std::os::unix::fs::FileExt;

/// `/dev/cpu/<cpu>/msr`, where the file offset selects the register.
struct DevMsr {
    file: File,
}

impl RawReader for DevMsr {
    fn read_raw(&mut self, address: u64) -> std::io::Result<u64> {
        let mut buf = [0u8; 8];
        self.file.read_exact_at(&mut buf, address)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

pub fn open(cpu: usize) -> Result<Box<dyn RawReader>, CounterError> {
    let path = format!("/dev/cpu/{cpu}/msr");

    let file = File::open(&path).map_err(|source| CounterError::Open { path, source })?;

    Ok(Box::new(DevMsr { file }))
}
