//! On-board memory management for the Red Pitaya
//!
//! The scope core of the FPGA maps its registers and
//! the two DMA rings into the physical address space,
//! which we reach through /dev/mem.
//!
//! memory locations
//! 0x40100000 - scope control registers
//! 0x1e000000 - DMA ring for channel A
//! 0x1f000000 - DMA ring for channel B
//!
//! All raw pointer access of the whole program lives
//! in this module. Everything else talks to the
//! hardware through [`RegisterAccess`] and [`DmaRing`].

extern crate memmap;

use std::error::Error;
use std::fs::File;
use std::fmt;
use std::ptr;

use memmap::{Mmap,
             MmapMut};

pub const DEV_MEM : &str = "/dev/mem";

/// Scope register block
pub const SCOPE_BASE_ADDRESS : u32   = 0x4010_0000;
pub const SCOPE_BLOCK_SIZE   : usize = 0x0010_0000;

/// The two DMA rings (16 MiB each)
pub const RAM_A_ADDRESS      : u32   = 0x1e00_0000;
pub const RAM_A_SIZE         : usize = 0x0100_0000;
pub const RAM_B_ADDRESS      : u32   = 0x1f00_0000;
pub const RAM_B_SIZE         : usize = 0x0100_0000;

/// The size of a 32bit unsigned int in byte
/// (all words in registers are u32)
pub const SIZEOF_U32 : usize = 4;

#[derive(Debug, Clone)]
pub enum MemoryError {
  DevMemNotAccessible(String),
  MMapFail(String),
}

impl fmt::Display for MemoryError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let etype = match self {
      MemoryError::DevMemNotAccessible(why) => format!("DevMemNotAccessible ({})", why),
      MemoryError::MMapFail(why)            => format!("MMapFail ({})", why),
    };
    write!(f, "<MemoryError: {}>", etype)
  }
}

impl Error for MemoryError {
}

/// Typed access to 32bit hardware registers
///
/// Offsets are byte offsets into the register block
/// (see `registers.rs`). There is no error return, a
/// block which can be accessed at all can be accessed
/// at every offset.
pub trait RegisterAccess {
  fn read32(&self, offset : u32) -> u32;
  fn write32(&self, offset : u32, value : u32);
}

fn open_dev_mem(writable : bool) -> Result<File, MemoryError> {
  match File::options().read(true).write(writable).open(DEV_MEM) {
    Err(err) => {
      error!("Can not open {DEV_MEM}! {err}");
      Err(MemoryError::DevMemNotAccessible(err.to_string()))
    }
    Ok(f) => Ok(f)
  }
}

/// Allow READ access to a region of physical memory
///
/// Remember we have a 32bit system
pub fn map_physical_mem_read(addr : u32,
                             len  : usize) -> Result<Mmap, MemoryError> {
  let file = open_dev_mem(false)?;
  let m = unsafe {
    memmap::MmapOptions::new()
      .offset(addr as u64)
      .len(len)
      .map(&file)
  };
  match m {
    Err(err) => {
      error!("Failed to mmap {len} bytes at {addr:#x}! {err}");
      Err(MemoryError::MMapFail(err.to_string()))
    }
    Ok(m) => Ok(m)
  }
}

/// Allow WRITE access to a region of physical memory
///
/// # Arguments
///
/// addr : The memory address (address8) the region
///        starts at.
/// len  : in bytes
pub fn map_physical_mem_write(addr : u32,
                              len  : usize) -> Result<MmapMut, MemoryError> {
  let file = open_dev_mem(true)?;
  let m = unsafe {
    memmap::MmapOptions::new()
      .offset(addr as u64)
      .len(len)
      .map_mut(&file)
  };
  match m {
    Err(err) => {
      error!("Failed to mmap {len} bytes at {addr:#x} for writing! {err}");
      Err(MemoryError::MMapFail(err.to_string()))
    }
    Ok(m) => Ok(m)
  }
}

/// The memory mapped scope register block
///
/// Mapped once at startup and kept for the lifetime
/// of the process. Every access is volatile, so the
/// compiler can neither reorder nor drop any of them.
pub struct RegisterBlock {
  map  : MmapMut,
  base : *mut u32,
}

// The block is only ever used from the thread which
// owns it, but it has to get there.
unsafe impl Send for RegisterBlock {}

impl RegisterBlock {
  /// Map the scope registers at their fixed address
  pub fn map() -> Result<Self, MemoryError> {
    Self::map_at(SCOPE_BASE_ADDRESS, SCOPE_BLOCK_SIZE)
  }

  pub fn map_at(addr : u32, len : usize) -> Result<Self, MemoryError> {
    let mut map = map_physical_mem_write(addr, len)?;
    let base    = map.as_mut_ptr() as *mut u32;
    debug!("Mapped {len} bytes of registers at {addr:#x}");
    Ok(Self {
      map,
      base,
    })
  }

  fn word(&self, offset : u32) -> *mut u32 {
    let offset = offset as usize;
    // registers are fixed constants, anything else is a bug
    assert!(offset % SIZEOF_U32 == 0 && offset + SIZEOF_U32 <= self.map.len(),
            "Register offset {offset:#x} outside of the mapped block!");
    // stays within the mapping, checked above
    unsafe { self.base.add(offset/SIZEOF_U32) }
  }
}

impl RegisterAccess for RegisterBlock {
  fn read32(&self, offset : u32) -> u32 {
    let p = self.word(offset);
    unsafe { ptr::read_volatile(p) }
  }

  fn write32(&self, offset : u32, value : u32) {
    trace!("Writing {value:#x} at {offset:#x}");
    let p = self.word(offset);
    unsafe { ptr::write_volatile(p, value) }
  }
}

enum RingMemory {
  Mapped(Mmap),
  Owned(Vec<u8>),
}

/// One of the hardware written circular buffers
///
/// Software only ever reads from it. The physical base
/// address is kept, since the hardware reports its
/// pointers as physical addresses.
pub struct DmaRing {
  base   : u32,
  memory : RingMemory,
}

impl DmaRing {
  /// Map a DMA ring read-only
  pub fn map(base : u32, size : usize) -> Result<Self, MemoryError> {
    let m = map_physical_mem_read(base, size)?;
    debug!("Mapped DMA ring of {size} bytes at {base:#x}");
    Ok(Self {
      base,
      memory : RingMemory::Mapped(m),
    })
  }

  /// A ring in ordinary memory which pretends
  /// to live at `base`
  pub fn from_vec(base : u32, data : Vec<u8>) -> Self {
    Self {
      base,
      memory : RingMemory::Owned(data),
    }
  }

  pub fn base(&self) -> u32 {
    self.base
  }

  pub fn size(&self) -> usize {
    self.bytes().len()
  }

  pub fn bytes(&self) -> &[u8] {
    match &self.memory {
      RingMemory::Mapped(m) => &m[..],
      RingMemory::Owned(v)  => &v[..],
    }
  }

  /// Turn a hardware pointer into an offset into the ring
  ///
  /// A pointer sitting exactly at the stop address
  /// is the same position as the start of the ring.
  pub fn to_ring_offset(&self, hw_pointer : u32) -> usize {
    (hw_pointer.wrapping_sub(self.base) as usize) % self.size()
  }
}
