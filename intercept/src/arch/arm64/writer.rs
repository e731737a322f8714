#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    X0 = 0,
    X1 = 1,
    X2 = 2,
    X3 = 3,
    X8 = 8,
    X16 = 16,
    X17 = 17,
    X30 = 30,
}

/// Forward-only AArch64 instruction emitter. Every instruction is one
/// little-endian word; `pc` is the address the next word will execute at.
#[derive(Debug)]
pub struct Arm64Writer {
    base: *mut u8,
    code: *mut u8,
    pc: u64,
    size: usize,
}

impl Arm64Writer {
    /// # Safety
    /// `buffer` must be valid for writes of `size` bytes for the writer's lifetime.
    pub unsafe fn new(buffer: *mut u8, size: usize, pc: u64) -> Self {
        Self {
            base: buffer,
            code: buffer,
            pc,
            size,
        }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn offset(&self) -> usize {
        (self.code as usize).saturating_sub(self.base as usize)
    }

    fn can_write(&self, bytes: usize) -> bool {
        self.offset() + bytes <= self.size
    }

    unsafe fn put_u32(&mut self, insn: u32) {
        debug_assert!(self.can_write(4));
        (self.code as *mut u32).write_unaligned(insn.to_le());
        self.code = self.code.add(4);
        self.pc = self.pc.wrapping_add(4);
    }

    /// `B <target>` with the displacement truncated to imm26.
    /// Callers check alignment and the ±128 MiB range first.
    pub unsafe fn put_b_imm(&mut self, target: u64) {
        let imm26 = ((target as i64 - self.pc as i64) >> 2) as u32 & 0x03FF_FFFF;
        self.put_u32(0x1400_0000 | imm26);
    }

    /// `MOVZ Wd, #imm16`
    pub unsafe fn put_movz_w(&mut self, rd: Reg, imm16: u16) {
        self.put_u32(0x5280_0000 | ((imm16 as u32) << 5) | rd as u32);
    }

    /// `ADRP Xd, <page of target>`, relative to the current pc's page.
    pub unsafe fn put_adrp(&mut self, rd: Reg, target: u64) {
        let pages = ((target as i64 >> 12) - (self.pc as i64 >> 12)) as u32;
        let immlo = pages & 0x3;
        let immhi = (pages >> 2) & 0x7_FFFF;
        self.put_u32(0x9000_0000 | (immlo << 29) | (immhi << 5) | rd as u32);
    }

    /// `LDR Xt, [Xn, #offset]` with a scaled unsigned offset.
    pub unsafe fn put_ldr_imm(&mut self, rt: Reg, rn: Reg, offset: u32) {
        let imm12 = (offset / 8) & 0xFFF;
        self.put_u32(0xF940_0000 | (imm12 << 10) | ((rn as u32) << 5) | rt as u32);
    }

    /// `BR Xn`
    pub unsafe fn put_br(&mut self, rn: Reg) {
        self.put_u32(0xD61F_0000 | ((rn as u32) << 5));
    }

    pub unsafe fn put_ret(&mut self) {
        self.put_u32(0xD65F_03C0);
    }
}
