//! `LC_DATA_IN_CODE`: ranges of instruction streams that actually hold
//! data (jump tables and the like), carried over from the inputs with
//! their offsets rebased to the output.

use crate::arch::Arch;
use crate::ctx::Context;
use crate::mach::constants::SEG_TEXT;
use crate::mach::load_command::DataInCodeEntry;

pub fn build_data_in_code<A: Arch>(ctx: &Context<A>) -> Vec<DataInCodeEntry> {
    let mut contents = Vec::new();
    let text_vmaddr = ctx
        .segments
        .iter()
        .find(|seg| seg.cmd.name() == SEG_TEXT)
        .map(|seg| seg.cmd.vmaddr)
        .unwrap_or(0);

    for obj in &ctx.objs {
        if !obj.alive() || obj.data_in_code.is_empty() {
            continue;
        }
        let mut cursor = 0usize;
        for (idx, subsec) in obj.subsections.iter().enumerate() {
            if cursor == obj.data_in_code.len() {
                break;
            }
            let lo = subsec.input_addr;
            let hi = lo + subsec.input_size;
            while cursor < obj.data_in_code.len() && obj.data_in_code[cursor].offset < hi {
                let ent = obj.data_in_code[cursor];
                if ent.offset >= lo && subsec.is_alive() {
                    let addr = ctx.subsec_addr(crate::input::section::SubsecRef {
                        file: obj.file_idx,
                        idx: idx as u32,
                    }) + (ent.offset - lo) as u64;
                    contents.push(DataInCodeEntry {
                        offset: (addr - text_vmaddr) as u32,
                        length: ent.length,
                        kind: ent.kind,
                    });
                }
                cursor += 1;
            }
        }
    }
    contents
}
