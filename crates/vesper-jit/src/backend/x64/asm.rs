//! Minimal x86-64 encoder.
//!
//! Emits exactly the instruction forms the block compiler uses: 64/32-bit
//! register ALU, disp32 memory operands (always the long form, so encoding
//! never depends on displacement size), imm64 moves, and rel32 branches
//! through a label/fixup table patched in [`Asm::finish`].

pub const RAX: u8 = 0;
pub const RCX: u8 = 1;
pub const RDX: u8 = 2;
pub const RBX: u8 = 3;
pub const RSI: u8 = 6;
pub const RDI: u8 = 7;
pub const R8: u8 = 8;
pub const R9: u8 = 9;
pub const R12: u8 = 12;
pub const R13: u8 = 13;
pub const R14: u8 = 14;
pub const R15: u8 = 15;

/// Condition codes of the `jcc`/`setcc` family (the ones in use).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Cc {
    E = 0x4,
    Ne = 0x5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(usize);

pub struct Asm {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, usize)>,
}

impl Asm {
    pub fn new() -> Self {
        Asm {
            code: Vec::with_capacity(256),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.code.len());
    }

    /// Patch all rel32 fixups and return the code bytes.
    pub fn finish(mut self) -> Vec<u8> {
        for (pos, label) in self.fixups.drain(..) {
            let target = self.labels[label].expect("unbound label");
            let rel = target as i64 - (pos as i64 + 4);
            self.code[pos..pos + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        self.code
    }

    // --- raw emission -----------------------------------------------------

    #[inline]
    fn u8(&mut self, b: u8) {
        self.code.push(b);
    }

    #[inline]
    fn u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn u64(&mut self, v: u64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn rex(&mut self, w: bool, reg: u8, rm: u8) {
        let rex = 0x40 | ((w as u8) << 3) | (((reg >> 3) & 1) << 2) | ((rm >> 3) & 1);
        if rex != 0x40 {
            self.u8(rex);
        }
    }

    #[inline]
    fn modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        self.u8((mode << 6) | ((reg & 7) << 3) | (rm & 7));
    }

    /// `[base + disp32]` operand; emits the SIB byte rsp/r12 bases require.
    fn mem(&mut self, reg: u8, base: u8, disp: i32) {
        if base & 7 == 4 {
            self.modrm(0b10, reg, 4);
            // scale 0, no index, base in SIB.
            self.u8(0x24);
        } else {
            self.modrm(0b10, reg, base);
        }
        self.u32(disp as u32);
    }

    // --- moves ------------------------------------------------------------

    pub fn mov_rr(&mut self, dst: u8, src: u8) {
        self.rex(true, src, dst);
        self.u8(0x89);
        self.modrm(0b11, src, dst);
    }

    /// 32-bit register move; zero-extends into the full register.
    pub fn mov_rr32(&mut self, dst: u8, src: u8) {
        self.rex(false, src, dst);
        self.u8(0x89);
        self.modrm(0b11, src, dst);
    }

    pub fn mov_ri64(&mut self, dst: u8, imm: u64) {
        self.rex(true, 0, dst);
        self.u8(0xB8 + (dst & 7));
        self.u64(imm);
    }

    pub fn mov_r_m(&mut self, dst: u8, base: u8, disp: i32) {
        self.rex(true, dst, base);
        self.u8(0x8B);
        self.mem(dst, base, disp);
    }

    pub fn mov_m_r(&mut self, base: u8, disp: i32, src: u8) {
        self.rex(true, src, base);
        self.u8(0x89);
        self.mem(src, base, disp);
    }

    /// `mov qword [base+disp], imm32` (sign-extended).
    pub fn mov_m_imm32(&mut self, base: u8, disp: i32, imm: i32) {
        self.rex(true, 0, base);
        self.u8(0xC7);
        self.mem(0, base, disp);
        self.u32(imm as u32);
    }

    // --- ALU --------------------------------------------------------------

    fn alu_rr(&mut self, opcode: u8, w: bool, dst: u8, src: u8) {
        self.rex(w, src, dst);
        self.u8(opcode);
        self.modrm(0b11, src, dst);
    }

    pub fn add_rr(&mut self, w: bool, dst: u8, src: u8) {
        self.alu_rr(0x01, w, dst, src);
    }

    pub fn sub_rr(&mut self, w: bool, dst: u8, src: u8) {
        self.alu_rr(0x29, w, dst, src);
    }

    pub fn and_rr(&mut self, w: bool, dst: u8, src: u8) {
        self.alu_rr(0x21, w, dst, src);
    }

    pub fn or_rr(&mut self, w: bool, dst: u8, src: u8) {
        self.alu_rr(0x09, w, dst, src);
    }

    pub fn xor_rr(&mut self, w: bool, dst: u8, src: u8) {
        self.alu_rr(0x31, w, dst, src);
    }

    pub fn test_rr(&mut self, w: bool, a: u8, b: u8) {
        self.alu_rr(0x85, w, a, b);
    }

    pub fn imul_rr(&mut self, w: bool, dst: u8, src: u8) {
        self.rex(w, dst, src);
        self.u8(0x0F);
        self.u8(0xAF);
        self.modrm(0b11, dst, src);
    }

    pub fn not_r(&mut self, w: bool, reg: u8) {
        self.rex(w, 0, reg);
        self.u8(0xF7);
        self.modrm(0b11, 2, reg);
    }

    /// `cmp qword [base+disp], imm8`.
    pub fn cmp_m_imm8(&mut self, base: u8, disp: i32, imm: i8) {
        self.rex(true, 0, base);
        self.u8(0x83);
        self.mem(7, base, disp);
        self.u8(imm as u8);
    }

    // --- shifts by CL -----------------------------------------------------

    fn shift_cl(&mut self, w: bool, ext: u8, reg: u8) {
        self.rex(w, 0, reg);
        self.u8(0xD3);
        self.modrm(0b11, ext, reg);
    }

    /// Hardware masks the count by 31/63, matching the IR's modulo-width
    /// shift rule.
    pub fn shl_cl(&mut self, w: bool, reg: u8) {
        self.shift_cl(w, 4, reg);
    }

    pub fn shr_cl(&mut self, w: bool, reg: u8) {
        self.shift_cl(w, 5, reg);
    }

    pub fn sar_cl(&mut self, w: bool, reg: u8) {
        self.shift_cl(w, 7, reg);
    }

    pub fn ror_cl(&mut self, w: bool, reg: u8) {
        self.shift_cl(w, 1, reg);
    }

    // --- extensions -------------------------------------------------------

    pub fn movzx8(&mut self, dst: u8, src: u8) {
        self.rex(true, dst, src);
        self.u8(0x0F);
        self.u8(0xB6);
        self.modrm(0b11, dst, src);
    }

    pub fn movzx16(&mut self, dst: u8, src: u8) {
        self.rex(true, dst, src);
        self.u8(0x0F);
        self.u8(0xB7);
        self.modrm(0b11, dst, src);
    }

    pub fn movsx8(&mut self, dst: u8, src: u8) {
        self.rex(true, dst, src);
        self.u8(0x0F);
        self.u8(0xBE);
        self.modrm(0b11, dst, src);
    }

    pub fn movsx16(&mut self, dst: u8, src: u8) {
        self.rex(true, dst, src);
        self.u8(0x0F);
        self.u8(0xBF);
        self.modrm(0b11, dst, src);
    }

    pub fn movsxd(&mut self, dst: u8, src: u8) {
        self.rex(true, dst, src);
        self.u8(0x63);
        self.modrm(0b11, dst, src);
    }

    pub fn cmov(&mut self, cc: Cc, dst: u8, src: u8) {
        self.rex(true, dst, src);
        self.u8(0x0F);
        self.u8(0x40 | cc as u8);
        self.modrm(0b11, dst, src);
    }

    // --- stack, calls, branches -------------------------------------------

    pub fn push_r(&mut self, reg: u8) {
        if reg >= 8 {
            self.u8(0x41);
        }
        self.u8(0x50 + (reg & 7));
    }

    pub fn pop_r(&mut self, reg: u8) {
        if reg >= 8 {
            self.u8(0x41);
        }
        self.u8(0x58 + (reg & 7));
    }

    pub fn call_r(&mut self, reg: u8) {
        if reg >= 8 {
            self.u8(0x41);
        }
        self.u8(0xFF);
        self.modrm(0b11, 2, reg);
    }

    pub fn ret(&mut self) {
        self.u8(0xC3);
    }

    pub fn jmp(&mut self, label: Label) {
        self.u8(0xE9);
        self.fixups.push((self.code.len(), label.0));
        self.u32(0);
    }

    pub fn jcc(&mut self, cc: Cc, label: Label) {
        self.u8(0x0F);
        self.u8(0x80 | cc as u8);
        self.fixups.push((self.code.len(), label.0));
        self.u32(0);
    }
}
