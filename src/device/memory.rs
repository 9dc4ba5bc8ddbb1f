//! In-memory tape library used by the test suite.
//!
//! Each cartridge is a list of tape files separated by filemarks. Writing
//! truncates everything after the head, closing a handle that wrote data
//! writes a filemark, and a write that would pass the cartridge capacity
//! reports end of tape without storing anything.

use super::{Autoloader, PositionInfo, TapeDriver, TapeHandle, WriteFault};
use crate::error::{Result, TapeStreamError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

const EIO: i32 = 5;

#[derive(Debug, Clone)]
struct Cartridge {
    files: Vec<Vec<u8>>,
    capacity: usize,
}

impl Cartridge {
    fn used(&self) -> usize {
        self.files.iter().map(Vec::len).sum()
    }
}

#[derive(Debug)]
struct LibraryState {
    slots: BTreeMap<u32, Cartridge>,
    loaded: Option<u32>,
    file: usize,
    offset: usize,
    write_faults: u32,
    opens: usize,
}

#[derive(Clone)]
pub(crate) struct MemoryLibrary {
    state: Arc<Mutex<LibraryState>>,
}

impl MemoryLibrary {
    /// Library with `slots` blank cartridges (slots `1..=slots`) of
    /// `capacity` bytes each and an empty drive.
    pub fn new(slots: u32, capacity: usize) -> Self {
        let slots = (1..=slots)
            .map(|slot| {
                (
                    slot,
                    Cartridge {
                        files: vec![Vec::new()],
                        capacity,
                    },
                )
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(LibraryState {
                slots,
                loaded: None,
                file: 0,
                offset: 0,
                write_faults: 0,
                opens: 0,
            })),
        }
    }

    /// Put a cartridge in the drive by hand.
    pub fn insert(&self, slot: u32) {
        let mut state = self.state.lock();
        state.loaded = Some(slot);
        state.file = 0;
        state.offset = 0;
    }

    pub fn eject(&self) {
        self.state.lock().loaded = None;
    }

    pub fn loaded_slot(&self) -> Option<u32> {
        self.state.lock().loaded
    }

    /// Make the next `count` block writes fail with EIO.
    pub fn inject_write_faults(&self, count: u32) {
        self.state.lock().write_faults = count;
    }

    /// Concatenated contents of one tape file on a cartridge.
    pub fn tape_file(&self, slot: u32, file: usize) -> Vec<u8> {
        let state = self.state.lock();
        state
            .slots
            .get(&slot)
            .and_then(|c| c.files.get(file).cloned())
            .unwrap_or_default()
    }

    pub fn used_bytes(&self, slot: u32) -> usize {
        let state = self.state.lock();
        state.slots.get(&slot).map(Cartridge::used).unwrap_or(0)
    }

    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    pub fn driver(&self) -> Arc<dyn TapeDriver> {
        Arc::new(MemoryDriver {
            library: self.clone(),
        })
    }

    pub fn changer(&self) -> MemoryChanger {
        MemoryChanger {
            library: self.clone(),
        }
    }
}

pub(crate) struct MemoryDriver {
    library: MemoryLibrary,
}

impl TapeDriver for MemoryDriver {
    fn open(&self, device: &Path, block_size: u32) -> Result<Box<dyn TapeHandle>> {
        let mut state = self.library.state.lock();
        if state.loaded.is_none() {
            return Err(TapeStreamError::tape_device(format!(
                "{:?}: No medium found",
                device
            )));
        }
        state.opens += 1;
        Ok(Box::new(MemoryHandle {
            library: self.library.clone(),
            block_size,
            wrote: false,
        }))
    }
}

pub(crate) struct MemoryHandle {
    library: MemoryLibrary,
    block_size: u32,
    wrote: bool,
}

impl TapeHandle for MemoryHandle {
    fn write(&mut self, buf: &[u8]) -> std::result::Result<usize, WriteFault> {
        let mut guard = self.library.state.lock();
        let state = &mut *guard;

        if state.write_faults > 0 {
            state.write_faults -= 1;
            return Err(WriteFault::Io(io::Error::from_raw_os_error(EIO)));
        }

        let Some(slot) = state.loaded else {
            return Err(WriteFault::Io(io::Error::new(
                io::ErrorKind::Other,
                "No medium found",
            )));
        };
        let (file, offset) = (state.file, state.offset);
        let Some(cartridge) = state.slots.get_mut(&slot) else {
            return Err(WriteFault::Io(io::Error::new(
                io::ErrorKind::Other,
                "No medium found",
            )));
        };

        cartridge.files.truncate(file + 1);
        if let Some(current) = cartridge.files.get_mut(file) {
            current.truncate(offset);
        }
        if cartridge.used() + buf.len() > cartridge.capacity {
            return Err(WriteFault::Eot);
        }
        cartridge.files[file].extend_from_slice(buf);
        state.offset += buf.len();
        self.wrote = true;
        Ok(buf.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.library.state.lock();
        let state = &mut *guard;
        let slot = state
            .loaded
            .ok_or_else(|| TapeStreamError::tape_device("No medium found"))?;
        let cartridge = state
            .slots
            .get(&slot)
            .ok_or_else(|| TapeStreamError::tape_device("No medium found"))?;

        let Some(current) = cartridge.files.get(state.file) else {
            return Ok(0);
        };
        if state.offset >= current.len() {
            // filemark: step over it, the next read starts the next file
            if state.file + 1 < cartridge.files.len() {
                state.file += 1;
                state.offset = 0;
            }
            return Ok(0);
        }

        let n = buf.len().min(current.len() - state.offset);
        buf[..n].copy_from_slice(&current[state.offset..state.offset + n]);
        state.offset += n;
        Ok(n)
    }

    fn position_info(&mut self) -> Result<PositionInfo> {
        let state = self.library.state.lock();
        Ok(PositionInfo {
            file_number: state.file as u64,
            block_number: (state.offset / self.block_size.max(1) as usize) as u64,
            block_size: self.block_size,
        })
    }

    fn set_fixed_block_mode(&mut self, block_size: u32) -> Result<()> {
        self.block_size = block_size;
        Ok(())
    }

    fn rewind(&mut self) -> Result<()> {
        let mut state = self.library.state.lock();
        state.file = 0;
        state.offset = 0;
        Ok(())
    }
}

impl Drop for MemoryHandle {
    fn drop(&mut self) {
        if !self.wrote {
            return;
        }
        let mut guard = self.library.state.lock();
        let state = &mut *guard;
        let Some(cartridge) = state.loaded.and_then(|slot| state.slots.get_mut(&slot)) else {
            return;
        };
        cartridge.files.truncate(state.file + 1);
        cartridge.files.push(Vec::new());
        state.file += 1;
        state.offset = 0;
    }
}

pub(crate) struct MemoryChanger {
    library: MemoryLibrary,
}

impl Autoloader for MemoryChanger {
    fn load_volume(&mut self, slot: u32) -> Result<()> {
        let mut state = self.library.state.lock();
        if state.loaded.is_some() {
            return Err(TapeStreamError::tape_device("Drive is full"));
        }
        if !state.slots.contains_key(&slot) {
            return Err(TapeStreamError::tape_device(format!("Slot {} is empty", slot)));
        }
        state.loaded = Some(slot);
        state.file = 0;
        state.offset = 0;
        Ok(())
    }

    fn unload_volume(&mut self, _slot: u32) -> Result<()> {
        self.library.state.lock().loaded = None;
        Ok(())
    }

    fn current_slot(&mut self) -> Result<Option<u32>> {
        Ok(self.library.state.lock().loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_past_capacity_reports_eot() {
        let library = MemoryLibrary::new(1, 1024);
        library.insert(1);
        let mut handle = library.driver().open(Path::new("/dev/nst0"), 512).unwrap();

        assert_eq!(handle.write(&[1u8; 512]).unwrap(), 512);
        assert_eq!(handle.write(&[2u8; 512]).unwrap(), 512);
        assert!(matches!(handle.write(&[3u8; 512]), Err(WriteFault::Eot)));
        assert_eq!(library.used_bytes(1), 1024);
    }

    #[test]
    fn test_filemark_written_on_close() {
        let library = MemoryLibrary::new(1, 1 << 20);
        library.insert(1);
        let driver = library.driver();

        let mut first = driver.open(Path::new("/dev/nst0"), 4).unwrap();
        first.write(b"aaaa").unwrap();
        drop(first);
        let mut second = driver.open(Path::new("/dev/nst0"), 4).unwrap();
        assert_eq!(second.position_info().unwrap().file_number, 1);
        second.write(b"bbbb").unwrap();
        drop(second);

        let mut reader = driver.open(Path::new("/dev/nst0"), 4).unwrap();
        reader.rewind().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"aaaa");
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"bbbb");
        assert_eq!(library.tape_file(1, 1), b"bbbb".to_vec());
    }
}
