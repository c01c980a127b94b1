//! POSIX shared memory segment holding the replicated property slots.
//!
//! Layout: a [`SegmentHeader`] followed by one 8-byte-aligned slot per
//! property, in id order. Only the master maps the segment writable. Slots
//! hold values that fit a single atomic word; larger values keep a reserved
//! slot so the fingerprint still reflects every declared type.

use crate::error::SegmentError;
use propsync_protocol::PropertyId;
use std::ffi::CString;
use std::fmt;
use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

/// Marks a segment written by this library ("PSYN").
pub const SEGMENT_MAGIC: u32 = 0x5053_594e;

/// Bumped whenever the header or slot layout changes.
pub const LAYOUT_VERSION: u32 = 1;

const SLOT_ALIGN: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SegmentHeader {
    magic: u32,
    version: u32,
    segment_size: u64,
    property_count: u64,
}

/// Size of the header at the start of every segment.
pub const SEGMENT_HEADER_SIZE: usize = std::mem::size_of::<SegmentHeader>();

/// Compatibility fingerprint recorded by the master and checked by slaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub segment_size: u64,
    pub property_count: u64,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size {} / {} properties",
            self.segment_size, self.property_count
        )
    }
}

/// Slot offsets for a declared property set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    offsets: Vec<usize>,
    size: usize,
}

impl Layout {
    /// Computes the layout from each property's wire size, in id order.
    pub fn new(wire_sizes: impl IntoIterator<Item = usize>) -> Self {
        let mut offsets = Vec::new();
        let mut size = SEGMENT_HEADER_SIZE;
        for wire_size in wire_sizes {
            offsets.push(size);
            size += align_up(wire_size.max(1));
        }
        Self { offsets, size }
    }

    /// Byte offset of a property's slot.
    pub fn offset(&self, id: PropertyId) -> Option<usize> {
        self.offsets.get(usize::from(id)).copied()
    }

    /// Total segment size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn property_count(&self) -> usize {
        self.offsets.len()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            segment_size: self.size as u64,
            property_count: self.offsets.len() as u64,
        }
    }
}

fn align_up(n: usize) -> usize {
    (n + SLOT_ALIGN - 1) & !(SLOT_ALIGN - 1)
}

/// A mapped segment.
pub struct Segment {
    name: CString,
    ptr: NonNull<u8>,
    len: usize,
    writable: bool,
    owner: bool,
}

// Safety: slot access goes through atomics, and the header is written once
// before the segment is shared.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Creates and maps a fresh writable segment.
    ///
    /// Fails with [`SegmentError::AlreadyExists`] if the name is taken; an
    /// existing segment is never touched. The segment is unlinked when the
    /// returned value is dropped.
    pub fn create(name: &str, layout: &Layout) -> Result<Self, SegmentError> {
        let c_name = shm_name(name)?;
        let os_err = |op| {
            let source = io::Error::last_os_error();
            SegmentError::Os {
                op,
                name: name.to_string(),
                source,
            }
        };

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o644 as libc::c_uint,
            )
        };
        if fd == -1 {
            let err = os_err("shm_open");
            if let SegmentError::Os { source, .. } = &err {
                if source.kind() == io::ErrorKind::AlreadyExists {
                    return Err(SegmentError::AlreadyExists(name.to_string()));
                }
            }
            return Err(err);
        }

        let len = layout.size();
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let err = os_err("ftruncate");
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(err);
        }

        let mapped = map(fd, len, true);
        unsafe { libc::close(fd) };
        let ptr = match mapped {
            Some(ptr) => ptr,
            None => {
                let err = os_err("mmap");
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(err);
            }
        };

        let fingerprint = layout.fingerprint();
        let header = SegmentHeader {
            magic: SEGMENT_MAGIC,
            version: LAYOUT_VERSION,
            segment_size: fingerprint.segment_size,
            property_count: fingerprint.property_count,
        };
        // Safety: the mapping is page-aligned and at least header-sized.
        unsafe { ptr::write(ptr.as_ptr() as *mut SegmentHeader, header) };

        tracing::debug!("Created shared segment {} ({} bytes)", name, len);
        Ok(Self {
            name: c_name,
            ptr,
            len,
            writable: true,
            owner: true,
        })
    }

    /// Unlinks a segment left behind by a master that is gone.
    ///
    /// Only call this while holding the name's endpoint, so the segment
    /// cannot belong to a live master. Returns false if nothing was there.
    pub fn remove_stale(name: &str) -> Result<bool, SegmentError> {
        let c_name = shm_name(name)?;
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } == 0 {
            return Ok(true);
        }
        let source = io::Error::last_os_error();
        if source.kind() == io::ErrorKind::NotFound {
            return Ok(false);
        }
        Err(SegmentError::Os {
            op: "shm_unlink",
            name: name.to_string(),
            source,
        })
    }

    /// Maps an existing segment read-only and verifies it matches `layout`.
    pub fn open(name: &str, layout: &Layout) -> Result<Self, SegmentError> {
        let c_name = shm_name(name)?;
        let os_err = |op| SegmentError::Os {
            op,
            name: name.to_string(),
            source: io::Error::last_os_error(),
        };
        let expected = layout.fingerprint();
        let incompatible = |found| SegmentError::Incompatible {
            name: name.to_string(),
            expected,
            found,
        };

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd == -1 {
            return Err(os_err("shm_open"));
        }

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            let err = os_err("fstat");
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let len = usize::try_from(stat.st_size).unwrap_or(0);
        if len < SEGMENT_HEADER_SIZE {
            unsafe { libc::close(fd) };
            return Err(incompatible(None));
        }

        let mapped = map(fd, len, false);
        unsafe { libc::close(fd) };
        let ptr = mapped.ok_or_else(|| os_err("mmap"))?;

        let segment = Self {
            name: c_name,
            ptr,
            len,
            writable: false,
            owner: false,
        };

        let header = segment.header();
        if header.magic != SEGMENT_MAGIC || header.version != LAYOUT_VERSION {
            return Err(incompatible(None));
        }
        let found = Fingerprint {
            segment_size: header.segment_size,
            property_count: header.property_count,
        };
        if found != expected || (len as u64) < found.segment_size {
            return Err(incompatible(Some(found)));
        }

        tracing::debug!("Attached shared segment {} ({} bytes)", name, len);
        Ok(segment)
    }

    fn header(&self) -> SegmentHeader {
        // Safety: `len >= SEGMENT_HEADER_SIZE` is checked before construction.
        unsafe { ptr::read(self.ptr.as_ptr() as *const SegmentHeader) }
    }

    /// Fingerprint recorded in the header.
    pub fn fingerprint(&self) -> Fingerprint {
        let header = self.header();
        Fingerprint {
            segment_size: header.segment_size,
            property_count: header.property_count,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn slot(&self, offset: usize) -> Option<&AtomicU64> {
        if offset % SLOT_ALIGN != 0 || offset < SEGMENT_HEADER_SIZE {
            return None;
        }
        if offset.checked_add(SLOT_ALIGN)? > self.len {
            return None;
        }
        // Safety: in bounds and 8-byte aligned within a page-aligned mapping.
        Some(unsafe { &*(self.ptr.as_ptr().add(offset) as *const AtomicU64) })
    }

    /// Reads the slot at `offset`.
    pub fn read_slot(&self, offset: usize) -> Option<u64> {
        self.slot(offset).map(|slot| slot.load(Ordering::Acquire))
    }

    /// Writes the slot at `offset`. Returns false on a read-only mapping.
    pub fn write_slot(&self, offset: usize, value: u64) -> bool {
        if !self.writable {
            return false;
        }
        match self.slot(offset) {
            Some(slot) => {
                slot.store(value, Ordering::Release);
                true
            }
            None => false,
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
            if self.owner {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("writable", &self.writable)
            .finish()
    }
}

fn map(fd: libc::c_int, len: usize, writable: bool) -> Option<NonNull<u8>> {
    let prot = if writable {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_READ
    };
    let mem = unsafe { libc::mmap(ptr::null_mut(), len, prot, libc::MAP_SHARED, fd, 0) };
    if mem == libc::MAP_FAILED {
        return None;
    }
    NonNull::new(mem as *mut u8)
}

/// POSIX object name for a segment: a single leading slash, no others.
fn shm_name(name: &str) -> Result<CString, SegmentError> {
    let trimmed = name.strip_prefix('/').unwrap_or(name);
    if trimmed.is_empty() || trimmed.contains('/') {
        return Err(SegmentError::InvalidName(name.to_string()));
    }
    CString::new(format!("/{}", trimmed)).map_err(|_| SegmentError::InvalidName(name.to_string()))
}
