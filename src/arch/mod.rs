//! Per-architecture behavior behind one trait: relocation parsing,
//! classification and application, plus the machine code of stubs and
//! range-extension thunks.
//!
//! The rest of the linker is generic over [`Arch`]; the driver picks
//! [`Arm64`] or [`X8664`] once, from `-arch`.

use crate::ctx::Context;
use crate::error::Result;
use crate::input::object::ObjectFile;
use crate::input::section::Relocation;
use crate::mach::load_command::Section64;

pub mod arm64;
pub mod x86_64;

pub use arm64::Arm64;
pub use x86_64::X8664;

/// What a relocation type means to the scan pass, independent of how it
/// is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocClass {
    /// an absolute pointer; becomes a rebase or dynamic bind
    Abs,
    /// a reference through the global offset table
    Got,
    /// a reference to a thread-local variable descriptor
    Tlv,
    /// a branch instruction
    Branch,
    Other,
}

pub trait Arch: Copy + Clone + Send + Sync + 'static {
    /// the spelling `-arch` and TBD targets use
    const NAME: &'static str;
    const CPU_TYPE: u32;
    const CPU_SUBTYPE: u32;
    /// hardware page size, the granule of code-signature hashing
    const PAGE_SIZE: u64;
    const STUB_SIZE: u64;
    const STUB_HELPER_HDR_SIZE: u64;
    const STUB_HELPER_ENTRY_SIZE: u64;
    /// the relocation type meaning "absolute pointer"
    const ABS_REL: u8;

    fn reloc_name(ty: u8) -> &'static str;

    fn reloc_class(ty: u8) -> RelocClass;

    /// Reads and decodes one section's relocations. Offsets stay
    /// section-relative; the caller sorts and partitions them.
    fn parse_relocations(obj: &ObjectFile, hdr: &Section64) -> Result<Vec<Relocation>>;

    /// Applies a subsection's relocations into `buf`, the subsection's
    /// slice of the output. `subsec_addr` is its output address and
    /// `isec_type` the section type of its input section.
    #[allow(clippy::too_many_arguments)]
    fn apply_relocations(
        ctx: &Context<Self>,
        obj: &ObjectFile,
        rels: &[Relocation],
        subsec_addr: u64,
        isec_type: u32,
        osec: u32,
        buf: &mut [u8],
    );

    fn write_stubs(ctx: &Context<Self>, buf: &mut [u8]);

    fn write_stub_helper(ctx: &Context<Self>, buf: &mut [u8]);

    /// Gives the architecture a chance to lay the section out itself
    /// (ARM64 inserts thunk tables). Returns false to use the default
    /// sequential layout.
    fn compute_osec_size(_ctx: &mut Context<Self>, _osec: u32) -> bool {
        false
    }

    fn write_thunks(_ctx: &Context<Self>, _osec: u32, _buf: &mut [u8]) {}
}
