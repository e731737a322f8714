#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
}

/// Forward-only x86-64 instruction emitter over a caller-owned buffer.
///
/// `pc` tracks the address the bytes will execute at, which is what every
/// relative displacement is computed against.
#[derive(Debug)]
pub struct X86_64Writer {
    base: *mut u8,
    code: *mut u8,
    pc: u64,
    size: usize,
}

impl X86_64Writer {
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

    unsafe fn emit(&mut self, byte: u8) {
        debug_assert!(self.can_write(1));
        self.code.write(byte);
        self.code = self.code.add(1);
        self.pc = self.pc.wrapping_add(1);
    }

    unsafe fn emit_u32_le(&mut self, val: u32) {
        debug_assert!(self.can_write(4));
        (self.code as *mut u32).write_unaligned(val);
        self.code = self.code.add(4);
        self.pc = self.pc.wrapping_add(4);
    }

    /// `jmp rel32`: E9 cd (5 bytes). `target` is an absolute address.
    ///
    /// The displacement is truncated to 32 bits; callers check the range first.
    pub unsafe fn put_jmp_near(&mut self, target: u64) {
        self.emit(0xE9);
        let rel = (target as i64) - (self.pc as i64 + 4);
        self.emit_u32_le(rel as u32);
    }

    /// `jmp [rip + disp32]`: FF 25 cd, the shape of PLT and import stubs.
    pub unsafe fn put_jmp_rip_indirect(&mut self, disp: i32) {
        self.emit(0xFF);
        self.emit(0x25);
        self.emit_u32_le(disp as u32);
    }

    /// `mov r32, imm32`: B8+rd id (5 bytes). Zero-extends into the 64-bit register.
    pub unsafe fn put_mov_reg_imm32(&mut self, reg: Reg, imm: u32) {
        self.emit(0xB8 + reg as u8);
        self.emit_u32_le(imm);
    }

    /// `endbr64`: F3 0F 1E FA
    pub unsafe fn put_endbr64(&mut self) {
        self.put_bytes(&ENDBR64);
    }

    /// `ret`: C3
    pub unsafe fn put_ret(&mut self) {
        self.emit(0xC3);
    }

    pub unsafe fn put_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.can_write(bytes.len()));
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.code, bytes.len());
        self.code = self.code.add(bytes.len());
        self.pc = self.pc.wrapping_add(bytes.len() as u64);
    }
}

pub(crate) const ENDBR64: [u8; 4] = [0xF3, 0x0F, 0x1E, 0xFA];
