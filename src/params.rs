//! Engine-wide constants: epoch layout, shadow geometry, table sizes.
//!
//! The epoch is a 64-bit logical timestamp split into a thread slot id
//! (high bits) and a per-thread monotonic counter (low bits). All packed
//! word formats in `shadow` and `trace` derive their field widths from
//! the constants here.

/// Bits reserved for the thread slot id inside an epoch.
pub const TID_BITS: u32 = 16;

/// Bits reserved for the per-thread monotonic counter inside an epoch.
pub const CLK_BITS: u32 = 40;

/// Maximum number of live + quarantined thread slots.
pub const MAX_TID: usize = 1 << TID_BITS;

/// Mask extracting the counter part of an epoch.
pub const CLK_MASK: u64 = (1 << CLK_BITS) - 1;

/// Mask extracting the slot id part of an epoch.
pub const TID_MASK: u64 = (1 << TID_BITS) - 1;

/// Application bytes covered by one shadow cell.
pub const SHADOW_CELL: u64 = 8;

/// Slots per shadow cell.
pub const SHADOW_CNT: usize = 4;

/// Bits of application address covered by the direct shadow mapping.
/// Addresses are masked down to this window before indexing.
pub const APP_BITS: u32 = 28;

/// Mask applied to application addresses before the shadow lookup.
pub const APP_MASK: u64 = (1 << APP_BITS) - 1;

/// Total byte size of the shadow reservation.
pub const SHADOW_SIZE: usize =
    ((APP_MASK as usize + 1) / SHADOW_CELL as usize) * SHADOW_CNT * 8;

/// Partitions in the synchronization-variable table.
pub const SYNC_PARTS: usize = 1024;

/// Events in a per-thread trace ring buffer.
pub const TRACE_SIZE: usize = 4096;

/// Parts the trace ring is split into; each part header snapshots the
/// shadow stack so old events keep their call context.
pub const TRACE_PARTS: usize = 8;

/// Events per trace part.
pub const TRACE_PART_SIZE: usize = TRACE_SIZE / TRACE_PARTS;

/// Maximum depth of the per-thread shadow call stack.
pub const SHADOW_STACK_MAX: usize = 1024;

/// Entries per vector-clock chunk.
pub const CLOCK_CHUNK: usize = 256;

/// Thread slot id.
pub type Tid = u32;
