use lazy_static::lazy_static;
use std::collections::HashMap;
use std::fmt::Display;

const REX_W: u8 = 0b0100_1000;
const REX_R: u8 = 0b0100_0100;
const REX_B: u8 = 0b0100_0001;

const ESCAPE_PREFIX: u8 = 0x0F;

const MOD_DISP8: u8 = 0b01;
const MOD_DISP32: u8 = 0b10;
const MOD_REG: u8 = 0b11;

pub mod register {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Register {
        pub code: u8,
        pub ext: bool,
    }

    impl Register {
        const fn new(code: u8, ext: bool) -> Self {
            Self { code, ext }
        }
    }

    macro_rules! registers {
        ( $($name:ident = ($code:literal, $ext:literal)),* $(,)? ) => {
            $( pub const $name: Register = Register::new($code, $ext); )*
        };
    }

    registers!(
        RAX = (0x0, false),
        RCX = (0x1, false),
        RDX = (0x2, false),
        RBX = (0x3, false),
        RSP = (0x4, false),
        RBP = (0x5, false),
        RSI = (0x6, false),
        RDI = (0x7, false),
        R8 = (0x0, true),
        R9 = (0x1, true),
        R10 = (0x2, true),
    );
}

use register::Register;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    Reg(Register),
    Imm32(u32),
    Imm64(u64),
    /// `[base + disp]`. The encoder always emits a displacement byte, so a
    /// base of RBP never collapses into the RIP-relative form.
    Mem {
        base: Register,
        disp: i32,
    },
    /// Displacement operand of a near call/jump.
    Rel32(i32),
}

impl Operand {
    fn imm_bytes(&self) -> Vec<u8> {
        match self {
            Operand::Imm32(v) => v.to_le_bytes().to_vec(),
            Operand::Imm64(v) => v.to_le_bytes().to_vec(),
            Operand::Rel32(v) => v.to_le_bytes().to_vec(),
            _ => unreachable!("operand {self} carries no immediate"),
        }
    }
}

impl Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::None => write!(f, "none"),
            Operand::Reg(r) => write!(f, "r{}{}", r.code, if r.ext { "x" } else { "" }),
            Operand::Imm32(v) => write!(f, "imm32(0x{v:x})"),
            Operand::Imm64(v) => write!(f, "imm64(0x{v:x})"),
            Operand::Mem { base, disp } => write!(f, "[r{}{disp:+}]", base.code),
            Operand::Rel32(v) => write!(f, "rel32({v:+})"),
        }
    }
}

impl From<Register> for Operand {
    fn from(value: Register) -> Self {
        Operand::Reg(value)
    }
}

impl From<u32> for Operand {
    fn from(value: u32) -> Self {
        Operand::Imm32(value)
    }
}

impl From<u64> for Operand {
    fn from(value: u64) -> Self {
        Operand::Imm64(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandEncoding {
    /// modrm, reg field is the source: `op r/m, reg`.
    MR,
    /// modrm, reg field is the destination: `op reg, r/m`.
    RM,
    /// modrm with a fixed reg field and an imm32: `op r/m, imm32`.
    MI,
    /// opcode + register, imm64: `op reg, imm64`.
    OI,
    /// opcode + register, no immediate (push/pop).
    O,
    /// rel32 displacement (call).
    D,
    /// no operands (ret, leave).
    ZO,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MnemonicName {
    Mov,
    Add,
    Sub,
    Imul,
    Push,
    Pop,
    Call,
    Ret,
    Leave,
}

/// An instruction template plus its operands. Templates live in the
/// statics below; `.op1()`/`.op2()` clone a template into a concrete
/// instruction, and `encode` turns it into bytes while remembering where
/// the patchable immediate/displacement field landed (`value_loc`).
#[derive(Debug, Clone)]
pub struct Mnemonic {
    name: MnemonicName,
    opcodes: HashMap<OperandEncoding, u8>,
    reg_field: u8,
    has_rex_w: bool,
    has_escape: bool,
    op1: Operand,
    op2: Operand,
}

pub struct Encoded {
    pub bytes: Vec<u8>,
    /// Offset of the last immediate/displacement field within `bytes`.
    pub value_loc: usize,
}

impl Mnemonic {
    fn new(name: MnemonicName) -> Self {
        Mnemonic {
            name,
            opcodes: HashMap::new(),
            reg_field: 0,
            has_rex_w: true,
            has_escape: false,
            op1: Operand::None,
            op2: Operand::None,
        }
    }

    fn opcode(mut self, encoding: OperandEncoding, opcode: u8) -> Self {
        self.opcodes.insert(encoding, opcode);
        self
    }

    fn reg(mut self, reg_field: u8) -> Self {
        self.reg_field = reg_field;
        self
    }

    fn no_rex_w(mut self) -> Self {
        self.has_rex_w = false;
        self
    }

    fn escape(mut self) -> Self {
        self.has_escape = true;
        self
    }

    pub fn op1(&self, op: impl Into<Operand>) -> Self {
        assert_eq!(self.op1, Operand::None, "op1 already assigned");
        let mut cloned = self.clone();
        cloned.op1 = op.into();
        cloned
    }

    pub fn op2(&self, op: impl Into<Operand>) -> Self {
        assert_eq!(self.op2, Operand::None, "op2 already assigned");
        let mut cloned = self.clone();
        cloned.op2 = op.into();
        cloned
    }

    pub fn no_op(&self) -> Self {
        self.clone()
    }

    fn encoding(&self) -> OperandEncoding {
        match (self.op1, self.op2) {
            (Operand::Reg(_), Operand::Reg(_)) => {
                if self.opcodes.contains_key(&OperandEncoding::MR) {
                    OperandEncoding::MR
                } else {
                    OperandEncoding::RM
                }
            }
            (Operand::Mem { .. }, Operand::Reg(_)) => OperandEncoding::MR,
            (Operand::Reg(_), Operand::Mem { .. }) => OperandEncoding::RM,
            (Operand::Reg(_), Operand::Imm64(_)) => OperandEncoding::OI,
            (Operand::Reg(_), Operand::Imm32(_)) => OperandEncoding::MI,
            (Operand::Reg(_), Operand::None) => OperandEncoding::O,
            (Operand::Rel32(_), Operand::None) => OperandEncoding::D,
            (Operand::None, Operand::None) => OperandEncoding::ZO,
            _ => panic!("no encoding for operands {}, {}", self.op1, self.op2),
        }
    }

    pub fn encode(&self) -> Encoded {
        let encoding = self.encoding();
        let opcode = *self
            .opcodes
            .get(&encoding)
            .unwrap_or_else(|| panic!("{:?} has no {encoding:?} form", self.name));

        // (reg field, rm operand) for the modrm encodings.
        let (reg, rm) = match encoding {
            OperandEncoding::MR => (reg_of(self.op2), self.op1),
            OperandEncoding::RM => (reg_of(self.op1), self.op2),
            OperandEncoding::MI => (
                Register {
                    code: self.reg_field,
                    ext: false,
                },
                self.op1,
            ),
            _ => (
                Register {
                    code: 0,
                    ext: false,
                },
                self.op1,
            ),
        };

        let mut rex = 0u8;
        if self.has_rex_w {
            rex |= REX_W;
        }
        if reg.ext {
            rex |= REX_R;
        }
        match rm {
            Operand::Reg(r) if r.ext => rex |= REX_B,
            Operand::Mem { base, .. } if base.ext => rex |= REX_B,
            _ => (),
        }

        let mut bytes = vec![];
        if rex != 0 {
            bytes.push(rex);
        }
        if self.has_escape {
            bytes.push(ESCAPE_PREFIX);
        }

        let mut value_loc = 0;
        match encoding {
            OperandEncoding::MR | OperandEncoding::RM | OperandEncoding::MI => {
                bytes.push(opcode);
                match rm {
                    Operand::Reg(r) => {
                        bytes.push(MOD_REG << 6 | reg.code << 3 | r.code);
                    }
                    Operand::Mem { base, disp } => {
                        debug_assert!(base.code != register::RSP.code, "rsp base needs a SIB byte");
                        if (-128..=127).contains(&disp) {
                            bytes.push(MOD_DISP8 << 6 | reg.code << 3 | base.code);
                            bytes.push(disp as i8 as u8);
                        } else {
                            bytes.push(MOD_DISP32 << 6 | reg.code << 3 | base.code);
                            bytes.extend(disp.to_le_bytes());
                        }
                    }
                    _ => panic!("invalid r/m operand {rm}"),
                }
                if encoding == OperandEncoding::MI {
                    value_loc = bytes.len();
                    bytes.extend(self.op2.imm_bytes());
                }
            }
            OperandEncoding::OI | OperandEncoding::O => {
                let r = reg_of(self.op1);
                bytes.push(opcode + r.code);
                if encoding == OperandEncoding::OI {
                    value_loc = bytes.len();
                    bytes.extend(self.op2.imm_bytes());
                }
            }
            OperandEncoding::D => {
                bytes.push(opcode);
                value_loc = bytes.len();
                bytes.extend(self.op1.imm_bytes());
            }
            OperandEncoding::ZO => {
                bytes.push(opcode);
            }
        }

        Encoded { bytes, value_loc }
    }
}

fn reg_of(op: Operand) -> Register {
    match op {
        Operand::Reg(r) => r,
        _ => panic!("expected register operand, found {op}"),
    }
}

impl Display for Mnemonic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {}, {}", self.name, self.op1, self.op2)
    }
}

lazy_static! {
    pub static ref MOV: Mnemonic = Mnemonic::new(MnemonicName::Mov)
        .opcode(OperandEncoding::MR, 0x89)
        .opcode(OperandEncoding::RM, 0x8B)
        .opcode(OperandEncoding::OI, 0xB8);
    pub static ref ADD: Mnemonic = Mnemonic::new(MnemonicName::Add)
        .opcode(OperandEncoding::MR, 0x01)
        .opcode(OperandEncoding::MI, 0x81);
    pub static ref SUB: Mnemonic = Mnemonic::new(MnemonicName::Sub)
        .opcode(OperandEncoding::MR, 0x29)
        .opcode(OperandEncoding::MI, 0x81)
        .reg(5);
    pub static ref IMUL: Mnemonic = Mnemonic::new(MnemonicName::Imul)
        .opcode(OperandEncoding::RM, 0xAF)
        .escape();
    pub static ref PUSH: Mnemonic = Mnemonic::new(MnemonicName::Push)
        .opcode(OperandEncoding::O, 0x50)
        .no_rex_w();
    pub static ref POP: Mnemonic = Mnemonic::new(MnemonicName::Pop)
        .opcode(OperandEncoding::O, 0x58)
        .no_rex_w();
    pub static ref CALL: Mnemonic = Mnemonic::new(MnemonicName::Call)
        .opcode(OperandEncoding::D, 0xE8)
        .no_rex_w();
    pub static ref RET: Mnemonic = Mnemonic::new(MnemonicName::Ret)
        .opcode(OperandEncoding::ZO, 0xC3)
        .no_rex_w();
    pub static ref LEAVE: Mnemonic = Mnemonic::new(MnemonicName::Leave)
        .opcode(OperandEncoding::ZO, 0xC9)
        .no_rex_w();
}

#[cfg(test)]
mod tests {
    use super::register::*;
    use super::*;
    use rstest::*;

    #[rstest]
    #[case::reg_reg(MOV.op1(RDI).op2(RAX), vec![0x48, 0x89, 0xC7])]
    #[case::rsp_to_rbp(MOV.op1(RBP).op2(RSP), vec![0x48, 0x89, 0xE5])]
    #[case::imm64(
        MOV.op1(RAX).op2(0x1122334455667788_u64),
        vec![0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
    )]
    #[case::imm64_ext(MOV.op1(R9).op2(5_u64), vec![0x49, 0xB9, 5, 0, 0, 0, 0, 0, 0, 0])]
    #[case::store(MOV.op1(Operand::Mem { base: RBP, disp: -8 }).op2(RDI), vec![0x48, 0x89, 0x7D, 0xF8])]
    #[case::load(MOV.op1(RAX).op2(Operand::Mem { base: RBP, disp: -8 }), vec![0x48, 0x8B, 0x45, 0xF8])]
    #[case::load_disp32(
        MOV.op1(RAX).op2(Operand::Mem { base: RBP, disp: -0x100 }),
        vec![0x48, 0x8B, 0x85, 0x00, 0xFF, 0xFF, 0xFF]
    )]
    #[case::load_ext(MOV.op1(R8).op2(Operand::Mem { base: RBP, disp: -16 }), vec![0x4C, 0x8B, 0x45, 0xF0])]
    fn test_mov(#[case] instruction: Mnemonic, #[case] expected: Vec<u8>) {
        assert_eq!(instruction.encode().bytes, expected);
    }

    #[rstest]
    #[case::add(ADD.op1(RAX).op2(RCX), vec![0x48, 0x01, 0xC8])]
    #[case::sub(SUB.op1(RAX).op2(RCX), vec![0x48, 0x29, 0xC8])]
    #[case::sub_imm(SUB.op1(RSP).op2(0x20_u32), vec![0x48, 0x81, 0xEC, 0x20, 0x00, 0x00, 0x00])]
    #[case::imul(IMUL.op1(RAX).op2(RCX), vec![0x48, 0x0F, 0xAF, 0xC1])]
    fn test_alu(#[case] instruction: Mnemonic, #[case] expected: Vec<u8>) {
        assert_eq!(instruction.encode().bytes, expected);
    }

    #[rstest]
    #[case::push(PUSH.op1(RBP), vec![0x55])]
    #[case::pop(POP.op1(RBP), vec![0x5D])]
    #[case::push_ext(PUSH.op1(R9), vec![0x41, 0x51])]
    #[case::ret(RET.no_op(), vec![0xC3])]
    #[case::leave(LEAVE.no_op(), vec![0xC9])]
    fn test_stack_and_flow(#[case] instruction: Mnemonic, #[case] expected: Vec<u8>) {
        assert_eq!(instruction.encode().bytes, expected);
    }

    #[rstest]
    fn test_call_value_loc() {
        let encoded = CALL.op1(Operand::Rel32(0)).encode();
        assert_eq!(encoded.bytes, vec![0xE8, 0, 0, 0, 0]);
        assert_eq!(encoded.value_loc, 1);
    }

    #[rstest]
    fn test_movabs_value_loc() {
        let encoded = MOV.op1(RAX).op2(0_u64).encode();
        assert_eq!(encoded.value_loc, 2);
    }

    #[rstest]
    #[should_panic]
    fn test_missing_encoding() {
        IMUL.op1(RAX).op2(0x10_u32).encode();
    }
}
