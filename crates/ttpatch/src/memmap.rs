//! Read-only view of a UEFI memory map.
//!
//! Firmware hands the map over as a byte buffer of `EFI_MEMORY_DESCRIPTOR` records
//! laid out at a fixed stride. The stride is whatever the firmware reports as its
//! descriptor size and may be larger than [`MemoryDescriptor`]; trailing bytes of each
//! record are ignored.

use core::ffi::c_int;
use core::fmt;
use core::mem::size_of;

use bitflags::bitflags;

use crate::PhysicalAddress;
use crate::table::PAGE_SIZE;

/// The memory type tag of a record.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MemoryType(pub u32);

impl MemoryType {
    pub const RESERVED: Self = Self(0);
    pub const LOADER_CODE: Self = Self(1);
    pub const LOADER_DATA: Self = Self(2);
    pub const BOOT_SERVICES_CODE: Self = Self(3);
    pub const BOOT_SERVICES_DATA: Self = Self(4);
    pub const RUNTIME_SERVICES_CODE: Self = Self(5);
    pub const RUNTIME_SERVICES_DATA: Self = Self(6);
    /// Free memory, usable as scratch.
    pub const CONVENTIONAL: Self = Self(7);
    pub const UNUSABLE: Self = Self(8);
    pub const ACPI_RECLAIM: Self = Self(9);
    pub const ACPI_NVS: Self = Self(10);
    pub const MMIO: Self = Self(11);
    pub const MMIO_PORT_SPACE: Self = Self(12);
    pub const PAL_CODE: Self = Self(13);
    pub const PERSISTENT: Self = Self(14);
}

impl fmt::Debug for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::RESERVED => "Reserved",
            Self::LOADER_CODE => "LoaderCode",
            Self::LOADER_DATA => "LoaderData",
            Self::BOOT_SERVICES_CODE => "BootServicesCode",
            Self::BOOT_SERVICES_DATA => "BootServicesData",
            Self::RUNTIME_SERVICES_CODE => "RuntimeServicesCode",
            Self::RUNTIME_SERVICES_DATA => "RuntimeServicesData",
            Self::CONVENTIONAL => "Conventional",
            Self::UNUSABLE => "Unusable",
            Self::ACPI_RECLAIM => "AcpiReclaim",
            Self::ACPI_NVS => "AcpiNvs",
            Self::MMIO => "Mmio",
            Self::MMIO_PORT_SPACE => "MmioPortSpace",
            Self::PAL_CODE => "PalCode",
            Self::PERSISTENT => "Persistent",
            Self(other) => return write!(f, "MemoryType({})", other),
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Attribute flags of a record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryAttribute: u64 {
        const UC = 1 << 0;
        const WC = 1 << 1;
        const WT = 1 << 2;
        const WB = 1 << 3;
        const UCE = 1 << 4;
        const WP = 1 << 12;
        const RP = 1 << 13;
        const XP = 1 << 14;
        const NV = 1 << 15;
        const MORE_RELIABLE = 1 << 16;
        const RO = 1 << 17;
        const SP = 1 << 18;
        const CPU_CRYPTO = 1 << 19;
        /// The region must stay mapped once the OS has taken over.
        const RUNTIME = 1 << 63;

        const _ = !0;
    }
}

/// One `EFI_MEMORY_DESCRIPTOR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct MemoryDescriptor {
    pub ty: u32,
    pub pad: u32,
    pub physical_start: u64,
    pub virtual_start: u64,
    pub number_of_pages: u64,
    pub attribute: u64,
}

const _: () = assert!(size_of::<MemoryDescriptor>() == 40);

impl MemoryDescriptor {
    pub const fn new(
        ty: MemoryType,
        physical_start: u64,
        virtual_start: u64,
        number_of_pages: u64,
        attribute: MemoryAttribute,
    ) -> Self {
        Self {
            ty: ty.0,
            pad: 0,
            physical_start,
            virtual_start,
            number_of_pages,
            attribute: attribute.bits(),
        }
    }

    pub const fn memory_type(&self) -> MemoryType {
        MemoryType(self.ty)
    }

    pub const fn attributes(&self) -> MemoryAttribute {
        MemoryAttribute::from_bits_retain(self.attribute)
    }

    pub const fn is_runtime(&self) -> bool {
        self.attributes().contains(MemoryAttribute::RUNTIME)
    }

    /// Returns the physical base, or `None` if it does not fit in 48 bits or is not
    /// page-aligned.
    pub fn physical_base(&self) -> Option<PhysicalAddress> {
        let addr = usize::try_from(self.physical_start).ok()?;
        PhysicalAddress::try_new(addr).filter(|addr| addr.is_aligned(PAGE_SIZE))
    }

    /// Returns the number of pages as a `usize`, saturating on narrow targets.
    pub fn page_count(&self) -> usize {
        usize::try_from(self.number_of_pages).unwrap_or(usize::MAX)
    }
}

/// Errors from building a [`MemoryMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMapError {
    /// The stride is smaller than one descriptor.
    StrideTooSmall(usize),
    /// The buffer does not hold a whole number of records.
    TrailingBytes { len: usize, stride: usize },
    /// A C caller passed a negative record count.
    NegativeCount(c_int),
    /// `count * stride` does not fit the address space.
    TooLarge { count: usize, stride: usize },
}

impl fmt::Display for MemoryMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryMapError::StrideTooSmall(stride) => write!(
                f,
                "descriptor stride {} is smaller than {} bytes",
                stride,
                size_of::<MemoryDescriptor>()
            ),
            MemoryMapError::TrailingBytes { len, stride } => write!(
                f,
                "memory map of {} bytes is not a multiple of the {} byte stride",
                len, stride
            ),
            MemoryMapError::NegativeCount(count) => {
                write!(f, "record count {} is negative", count)
            }
            MemoryMapError::TooLarge { count, stride } => write!(
                f,
                "{} records of {} bytes overflow the address space",
                count, stride
            ),
        }
    }
}

/// Converts a record count received from C.
#[cfg(any(test, target_arch = "aarch64"))]
pub(crate) fn record_count(count: c_int) -> Result<usize, MemoryMapError> {
    usize::try_from(count).map_err(|_| MemoryMapError::NegativeCount(count))
}

/// A strided, read-only array of [`MemoryDescriptor`] records.
#[derive(Clone, Copy)]
pub struct MemoryMap<'a> {
    bytes: &'a [u8],
    stride: usize,
}

impl<'a> MemoryMap<'a> {
    /// Wraps a buffer of records `stride` bytes apart.
    pub fn new(bytes: &'a [u8], stride: usize) -> Result<Self, MemoryMapError> {
        if stride < size_of::<MemoryDescriptor>() {
            return Err(MemoryMapError::StrideTooSmall(stride));
        }
        if bytes.len() % stride != 0 {
            return Err(MemoryMapError::TrailingBytes {
                len: bytes.len(),
                stride,
            });
        }
        Ok(Self { bytes, stride })
    }

    /// Wraps `count` records starting at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `count * stride` bytes for `'a`, and nothing may
    /// write to that range while the map is alive.
    pub unsafe fn from_raw_parts(
        ptr: *const u8,
        count: usize,
        stride: usize,
    ) -> Result<Self, MemoryMapError> {
        if stride < size_of::<MemoryDescriptor>() {
            return Err(MemoryMapError::StrideTooSmall(stride));
        }
        let len = count
            .checked_mul(stride)
            .filter(|&len| len <= isize::MAX as usize)
            .ok_or(MemoryMapError::TooLarge { count, stride })?;
        if len == 0 {
            return Ok(Self { bytes: &[], stride });
        }
        // SAFETY: the caller guarantees `count * stride` readable bytes at `ptr`.
        let bytes = unsafe { core::slice::from_raw_parts(ptr, len) };
        Ok(Self { bytes, stride })
    }

    /// Views a slice of descriptors packed at their natural size.
    pub fn from_descriptors(descriptors: &'a [MemoryDescriptor]) -> Self {
        // SAFETY: `MemoryDescriptor` is `repr(C)` with no implicit padding, so every
        // byte of the slice is initialized.
        let bytes = unsafe {
            core::slice::from_raw_parts(
                descriptors.as_ptr().cast::<u8>(),
                core::mem::size_of_val(descriptors),
            )
        };
        Self {
            bytes,
            stride: size_of::<MemoryDescriptor>(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / self.stride
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a copy of the record at `index`.
    pub fn get(&self, index: usize) -> Option<MemoryDescriptor> {
        let start = index.checked_mul(self.stride)?;
        let record = self.bytes.get(start..start + size_of::<MemoryDescriptor>())?;
        // SAFETY: `record` holds exactly one descriptor's worth of bytes, any bit
        // pattern is a valid `MemoryDescriptor`, and the read tolerates misalignment.
        Some(unsafe { record.as_ptr().cast::<MemoryDescriptor>().read_unaligned() })
    }

    pub fn iter(&self) -> impl Iterator<Item = MemoryDescriptor> + use<'a> {
        let map = *self;
        (0..map.len()).filter_map(move |index| map.get(index))
    }
}

impl fmt::Debug for MemoryMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
