pub mod writer;

use crate::types::{PatchError, Result};
use writer::{X86_64Writer, ENDBR64};

/// Length of the `jmp rel32` redirect.
pub const REDIRECT_LEN: usize = 5;

/// Encode a near jump placed at `from` that lands on `to`.
pub fn encode_redirect(from: usize, to: usize) -> Result<[u8; REDIRECT_LEN]> {
    let rel = to as i128 - (from as i128 + REDIRECT_LEN as i128);
    if rel < i32::MIN as i128 || rel > i32::MAX as i128 {
        return Err(PatchError::DisplacementOutOfRange { from, to });
    }
    let mut out = [0u8; REDIRECT_LEN];
    unsafe {
        let mut w = X86_64Writer::new(out.as_mut_ptr(), out.len(), from as u64);
        w.put_jmp_near(to as u64);
    }
    Ok(out)
}

/// True when `code` starts with an indirect jump through memory, the body of
/// a PLT entry or an import stub. Accepts a leading `endbr64` and a `bnd`
/// prefix.
pub fn is_indirect_thunk(code: &[u8]) -> bool {
    let mut rest = code;
    if rest.starts_with(&ENDBR64) {
        rest = &rest[ENDBR64.len()..];
    }
    if rest.first() == Some(&0xF2) {
        rest = &rest[1..];
    }
    rest.starts_with(&[0xFF, 0x25])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_matches_hand_encoding() {
        let bytes = encode_redirect(0x1000, 0x2000).unwrap();
        // 0x2000 - 0x1005 = 0xffb
        assert_eq!(bytes, [0xE9, 0xFB, 0x0F, 0x00, 0x00]);
    }

    #[test]
    fn redirect_to_self_is_minus_five() {
        let bytes = encode_redirect(0x7000, 0x7000).unwrap();
        assert_eq!(bytes, [0xE9, 0xFB, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn redirect_at_displacement_limits() {
        let from = 0x1_0000_0000usize;
        let max = from + 5 + i32::MAX as usize;
        assert!(encode_redirect(from, max).is_ok());
        assert_eq!(
            encode_redirect(from, max + 1),
            Err(PatchError::DisplacementOutOfRange { from, to: max + 1 })
        );

        let min = from + 5 - (1usize << 31);
        assert!(encode_redirect(from, min).is_ok());
        assert!(encode_redirect(from, min - 1).is_err());
    }

    fn emit(f: impl FnOnce(&mut X86_64Writer)) -> Vec<u8> {
        let mut buf = [0u8; 16];
        unsafe {
            let mut w = X86_64Writer::new(buf.as_mut_ptr(), buf.len(), 0x40_0000);
            f(&mut w);
            buf[..w.offset()].to_vec()
        }
    }

    #[test]
    fn detects_plt_shapes() {
        assert!(is_indirect_thunk(&emit(|w| unsafe { w.put_jmp_rip_indirect(2) })));
        // endbr64 ; bnd jmp [rip + disp]
        assert!(is_indirect_thunk(&emit(|w| unsafe {
            w.put_endbr64();
            w.put_bytes(&[0xF2]);
            w.put_jmp_rip_indirect(0x2FE2);
        })));
        assert!(is_indirect_thunk(&[0xF2, 0xFF, 0x25, 0, 0, 0, 0]));
    }

    #[test]
    fn ordinary_prologues_are_not_thunks() {
        // push rbp ; mov rbp, rsp
        assert!(!is_indirect_thunk(&[0x55, 0x48, 0x89, 0xE5]));
        // endbr64 ; push rbp
        assert!(!is_indirect_thunk(&[0xF3, 0x0F, 0x1E, 0xFA, 0x55]));
        // jmp rel32
        assert!(!is_indirect_thunk(&[0xE9, 0, 0, 0, 0]));
        assert!(!is_indirect_thunk(&[]));
    }
}
