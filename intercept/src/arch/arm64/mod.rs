pub mod writer;

use crate::types::{PatchError, Result};
use writer::Arm64Writer;

/// Length of the `B imm26` redirect.
pub const REDIRECT_LEN: usize = 4;

/// Largest forward distance a `B` can cover.
const BRANCH_RANGE: i128 = 1 << 27;

/// Encode an unconditional branch placed at `from` that lands on `to`.
pub fn encode_redirect(from: usize, to: usize) -> Result<[u8; REDIRECT_LEN]> {
    let delta = to as i128 - from as i128;
    if delta % 4 != 0 {
        return Err(PatchError::MisalignedTarget { from, to });
    }
    if !(-BRANCH_RANGE..BRANCH_RANGE).contains(&delta) {
        return Err(PatchError::DisplacementOutOfRange { from, to });
    }
    let mut out = [0u8; REDIRECT_LEN];
    unsafe {
        let mut w = Arm64Writer::new(out.as_mut_ptr(), out.len(), from as u64);
        w.put_b_imm(to as u64);
    }
    Ok(out)
}

fn is_adrp(insn: u32) -> bool {
    insn & 0x9F00_0000 == 0x9000_0000
}

fn is_br(insn: u32) -> bool {
    insn & 0xFFFF_FC1F == 0xD61F_0000
}

/// True when `words` opens with the `adrp ...; br xN` shape shared by PLT
/// entries and linker veneers. The branch must follow within three
/// instructions of the `adrp`.
pub fn is_indirect_thunk(words: &[u32]) -> bool {
    match words.first() {
        Some(&first) if is_adrp(first) => words.iter().skip(1).take(3).any(|&w| is_br(w)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(bytes: [u8; 4]) -> u32 {
        u32::from_le_bytes(bytes)
    }

    #[test]
    fn redirect_forward_and_backward() {
        assert_eq!(word(encode_redirect(0x1000, 0x1008).unwrap()), 0x1400_0002);
        assert_eq!(word(encode_redirect(0x1008, 0x1000).unwrap()), 0x17FF_FFFE);
    }

    #[test]
    fn redirect_range_edges() {
        let from = 0x1000_0000usize;
        let max = from + (BRANCH_RANGE as usize) - 4;
        assert_eq!(word(encode_redirect(from, max).unwrap()), 0x15FF_FFFF);
        assert_eq!(
            encode_redirect(from, max + 4),
            Err(PatchError::DisplacementOutOfRange { from, to: max + 4 })
        );

        let min = from - BRANCH_RANGE as usize;
        assert_eq!(word(encode_redirect(from, min).unwrap()), 0x1600_0000);
        assert!(encode_redirect(from, min - 4).is_err());
    }

    #[test]
    fn misaligned_target_rejected() {
        assert_eq!(
            encode_redirect(0x1000, 0x1002),
            Err(PatchError::MisalignedTarget { from: 0x1000, to: 0x1002 })
        );
    }

    fn emit(f: impl FnOnce(&mut Arm64Writer)) -> Vec<u32> {
        let mut buf = [0u8; 32];
        let len = unsafe {
            let mut w = Arm64Writer::new(buf.as_mut_ptr(), buf.len(), 0x4000);
            f(&mut w);
            w.offset()
        };
        buf[..len]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn detects_plt_and_veneer() {
        use writer::Reg;
        // adrp x16 ; ldr x17, [x16, #0x18] ; br x17
        assert!(is_indirect_thunk(&emit(|w| unsafe {
            w.put_adrp(Reg::X16, 0x1_0000);
            w.put_ldr_imm(Reg::X17, Reg::X16, 0x18);
            w.put_br(Reg::X17);
        })));
        // adrp x16 ; ldr x17, [x16, #0x18] ; add x16, x16, #0x18 ; br x17
        assert!(is_indirect_thunk(&[0x9000_0070, 0xF940_0E11, 0x9100_6210, 0xD61F_0220]));
        // adrp x16 ; add x16, x16, #imm ; br x16
        assert!(is_indirect_thunk(&[0xB000_0010, 0x9100_0210, 0xD61F_0200]));
    }

    #[test]
    fn ordinary_prologues_are_not_thunks() {
        // stp x29, x30, [sp, #-16]! ; mov x29, sp
        assert!(!is_indirect_thunk(&[0xA9BF_7BFD, 0x9100_03FD]));
        // adrp followed by ordinary code only
        assert!(!is_indirect_thunk(&[0x9000_0070, 0xD503_201F, 0xD503_201F, 0xD503_201F, 0xD61F_0220]));
        assert!(!is_indirect_thunk(&[]));
    }
}
