//! x86 _Global Descriptor Table_ (`GDT`) related structures.
//!
//! This table contains various `segment descriptors`, that provides the processor with the size and location of a
//! memory segment, along with various access controls and other specifiers.
//!
//! Every application processor gets its own flat 32-bit `GDT`, with a private _Task State Segment_ (`TSS`), built
//! by the bootstrap processor before the processor is started.

use alloc::boxed::Box;

use bytemuck::{Pod, Zeroable};
use modular_bitfield::bitfield;
use modular_bitfield::prelude::{B24, B4};

use crate::x86::cpu::DescriptorTablePointer;

/// Kernel code segment access byte (present, ring 0, executable, readable).
pub const KERNEL_CODE_ACCESS: u8 = 0x9A;

/// Kernel data segment access byte (present, ring 0, writable).
pub const KERNEL_DATA_ACCESS: u8 = 0x92;

/// User code segment access byte (present, ring 3, executable, readable).
pub const USER_CODE_ACCESS: u8 = 0xFA;

/// User data segment access byte (present, ring 3, writable).
pub const USER_DATA_ACCESS: u8 = 0xF2;

/// Available 32-bit `TSS` access byte.
pub const TSS_ACCESS: u8 = 0x89;

/// Flags for flat segments: 4 KiB granularity, 32-bit default operand size.
const FLAT_SEGMENT_FLAGS: u8 = 0xC;

/// Kernel data segment selector.
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;

/// Number of entries in an application processor `GDT` (null, 4 flat segments, `TSS`).
pub const AP_GDT_ENTRIES: usize = 6;

/// `segment descriptor`, as stored in a 32-bit `GDT`.
///
/// ```plaintext
/// 63      56 55  52 51   48 47        40 39                 16 15                0
/// | base_hi | flags | limit |   access   |       base_lo       |      limit_lo      |
/// ```
#[bitfield]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u64)]
pub struct SegmentDescriptor {
    limit_lo: u16,
    base_lo: B24,
    access: u8,
    limit_hi: B4,
    flags: B4,
    base_hi: u8,
}

impl SegmentDescriptor {
    /// Creates a new `segment descriptor`. Only the 20 lower bits of `limit` are used.
    #[must_use]
    pub fn segment(base: u32, limit: u32, access: u8, flags: u8) -> Self {
        Self::new()
            .with_limit_lo((limit & 0xFFFF) as u16)
            .with_limit_hi(((limit >> 16) & 0xF) as u8)
            .with_base_lo(base & 0xFF_FFFF)
            .with_base_hi((base >> 24) as u8)
            .with_access(access)
            .with_flags(flags & 0xF)
    }

    /// Creates a flat 4 GiB segment with the given access byte.
    #[must_use]
    pub fn flat(access: u8) -> Self {
        Self::segment(0, 0xF_FFFF, access, FLAT_SEGMENT_FLAGS)
    }
}

/// 32-bit _Task State Segment_.
///
/// Only `ss0` / `esp0` are used, to switch stacks when an interrupt is raised in user mode.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct TaskStateSegment {
    link: u32,
    /// Ring 0 stack pointer.
    pub esp0: u32,
    /// Ring 0 stack segment.
    pub ss0: u32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    general: [u32; 8],
    segments: [u32; 6],
    ldt: u32,
    trap: u16,
    iomap_base: u16,
}

/// Descriptor tables of a single application processor.
///
/// The structure is never freed: the processor keeps using it for its whole lifetime.
#[derive(Debug)]
#[repr(C)]
pub struct ProcessorDescriptorTables {
    gdt: [SegmentDescriptor; AP_GDT_ENTRIES],
    tss: TaskStateSegment,
    gdtr: [u8; DescriptorTablePointer::SIZE],
}

impl ProcessorDescriptorTables {
    /// Allocates and fills the descriptor tables of one processor.
    pub fn allocate() -> &'static mut Self {
        let tables = Box::leak(Box::new(Self {
            gdt: [SegmentDescriptor::new(); AP_GDT_ENTRIES],
            tss: TaskStateSegment {
                ss0: u32::from(KERNEL_DATA_SELECTOR),
                iomap_base: core::mem::size_of::<TaskStateSegment>() as u16,
                ..TaskStateSegment::default()
            },
            gdtr: [0; DescriptorTablePointer::SIZE],
        }));

        // The kernel runs in 32-bit protected mode, linear addresses fit in a descriptor base.
        let tss_base = core::ptr::addr_of!(tables.tss) as usize as u32;
        let tss_limit = (core::mem::size_of::<TaskStateSegment>() - 1) as u32;

        tables.gdt = [
            SegmentDescriptor::new(),
            SegmentDescriptor::flat(KERNEL_CODE_ACCESS),
            SegmentDescriptor::flat(KERNEL_DATA_ACCESS),
            SegmentDescriptor::flat(USER_CODE_ACCESS),
            SegmentDescriptor::flat(USER_DATA_ACCESS),
            SegmentDescriptor::segment(tss_base, tss_limit, TSS_ACCESS, 0),
        ];
        tables.gdtr = DescriptorTablePointer {
            limit: (AP_GDT_ENTRIES * 8 - 1) as u16,
            base: tables.gdt.as_ptr() as usize,
        }
        .to_bytes();

        tables
    }

    /// Address of the `GDTR` image to load with `LGDT`.
    pub fn gdtr_address(&self) -> usize {
        self.gdtr.as_ptr() as usize
    }

    /// Returns a copy of the table entries.
    pub fn entries(&self) -> [SegmentDescriptor; AP_GDT_ENTRIES] {
        self.gdt
    }

    /// Returns the _Task State Segment_.
    pub fn tss(&self) -> &TaskStateSegment {
        &self.tss
    }
}
