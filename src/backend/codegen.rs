use std::collections::BTreeMap;

use tracing::trace;

use super::mnemonics::{register, Mnemonic, Operand, ADD, CALL, IMUL, LEAVE, MOV, PUSH, RET, SUB};
use crate::build::reloc::{RelocKind, Relocation};
use crate::error::{BuildError, Result};
use crate::ir::{self, BinOp, Inst};

/// System V argument registers, in order.
const ARG_REGISTERS: [register::Register; 6] = [
    register::RDI,
    register::RSI,
    register::RDX,
    register::RCX,
    register::R8,
    register::R9,
];

/// Machine code for one placement unit, with the relocations the linker
/// must apply once target addresses are known.
#[derive(Debug, Clone)]
pub struct SectionCode {
    pub bytes: Vec<u8>,
    pub relocations: Vec<Relocation>,
}

/// Lowers one isolated IR function. Every value lives in its own 8-byte
/// frame slot; RAX and RCX are scratch. Frames stay 16-byte aligned so
/// call sites need no fixup.
pub fn compile_function(func: &ir::Function) -> Result<SectionCode> {
    if func.placement.is_none() {
        return Err(BuildError::Codegen {
            function: func.name.clone(),
            message: "no placement unit assigned; isolation pass did not run".to_string(),
        });
    }
    let mut encoder = FunctionEncoder::new(func)?;
    encoder.visit_body()?;
    Ok(encoder.finish())
}

struct FunctionEncoder<'a> {
    func: &'a ir::Function,
    slots: BTreeMap<&'a str, i32>,
    frame_size: u32,
    bytes: Vec<u8>,
    relocations: Vec<Relocation>,
}

impl<'a> FunctionEncoder<'a> {
    fn new(func: &'a ir::Function) -> Result<Self> {
        let mut slots = BTreeMap::new();
        let mut next = 0i32;
        let mut assign = |name: &'a str, slots: &mut BTreeMap<&'a str, i32>| {
            if !slots.contains_key(name) {
                next -= 8;
                slots.insert(name, next);
            }
        };

        for param in &func.params {
            assign(param, &mut slots);
        }
        for inst in &func.body {
            match inst {
                Inst::Copy { dst, .. }
                | Inst::Bin { dst, .. }
                | Inst::Addr { dst, .. }
                | Inst::Call { dst, .. } => assign(dst, &mut slots),
                Inst::Ret { .. } => (),
            }
        }

        let used = (slots.len() * 8) as u32;
        let frame_size = (used + 15) & !15;

        if func.params.len() > ARG_REGISTERS.len() {
            return Err(BuildError::Codegen {
                function: func.name.clone(),
                message: format!("more than {} parameters", ARG_REGISTERS.len()),
            });
        }

        Ok(FunctionEncoder {
            func,
            slots,
            frame_size,
            bytes: vec![],
            relocations: vec![],
        })
    }

    fn visit_body(&mut self) -> Result<()> {
        self.add(PUSH.op1(register::RBP));
        self.add(MOV.op1(register::RBP).op2(register::RSP));
        if self.frame_size > 0 {
            self.add(SUB.op1(register::RSP).op2(self.frame_size));
        }

        for (i, param) in self.func.params.iter().enumerate() {
            let slot = self.slot(param)?;
            self.add(
                MOV.op1(Operand::Mem {
                    base: register::RBP,
                    disp: slot,
                })
                .op2(ARG_REGISTERS[i]),
            );
        }

        let body = self.func.body.clone();
        for inst in &body {
            self.visit_inst(inst)?;
        }
        Ok(())
    }

    fn visit_inst(&mut self, inst: &Inst) -> Result<()> {
        match inst {
            Inst::Copy { dst, src } => {
                self.load(register::RAX, src)?;
                self.store(dst)?;
            }
            Inst::Bin { op, dst, lhs, rhs } => {
                self.load(register::RAX, lhs)?;
                self.load(register::RCX, rhs)?;
                match op {
                    BinOp::Add => self.add(ADD.op1(register::RAX).op2(register::RCX)),
                    BinOp::Sub => self.add(SUB.op1(register::RAX).op2(register::RCX)),
                    BinOp::Mul => self.add(IMUL.op1(register::RAX).op2(register::RCX)),
                };
                self.store(dst)?;
            }
            Inst::Addr { dst, global } => {
                let field = self.add(MOV.op1(register::RAX).op2(0u64));
                self.relocations.push(Relocation {
                    offset: field,
                    symbol: global.clone(),
                    kind: RelocKind::Abs64,
                    addend: 0,
                });
                self.store(dst)?;
            }
            Inst::Call { dst, callee, args } => {
                if args.len() > ARG_REGISTERS.len() {
                    return Err(BuildError::Codegen {
                        function: self.func.name.clone(),
                        message: format!("call to {callee:?} with more than 6 arguments"),
                    });
                }
                for (i, arg) in args.iter().enumerate() {
                    self.load(ARG_REGISTERS[i], arg)?;
                }
                let field = self.add(CALL.op1(Operand::Rel32(0)));
                self.relocations.push(Relocation {
                    offset: field,
                    symbol: callee.clone(),
                    kind: RelocKind::PcRel32,
                    addend: -4,
                });
                self.store(dst)?;
            }
            Inst::Ret { value } => {
                self.load(register::RAX, value)?;
                self.add(LEAVE.no_op());
                self.add(RET.no_op());
            }
        }
        Ok(())
    }

    fn load(&mut self, reg: register::Register, operand: &ir::Operand) -> Result<()> {
        match operand {
            ir::Operand::Literal(n) => {
                self.add(MOV.op1(reg).op2(*n as u64));
            }
            ir::Operand::Value(name) => {
                let slot = self.slot(name)?;
                self.add(MOV.op1(reg).op2(Operand::Mem {
                    base: register::RBP,
                    disp: slot,
                }));
            }
        }
        Ok(())
    }

    fn store(&mut self, dst: &str) -> Result<()> {
        let slot = self.slot(dst)?;
        self.add(
            MOV.op1(Operand::Mem {
                base: register::RBP,
                disp: slot,
            })
            .op2(register::RAX),
        );
        Ok(())
    }

    fn slot(&self, name: &str) -> Result<i32> {
        self.slots
            .get(name)
            .copied()
            .ok_or_else(|| BuildError::Codegen {
                function: self.func.name.clone(),
                message: format!("no frame slot for value {name:?}"),
            })
    }

    /// Appends one instruction and returns the offset of its patchable
    /// immediate field within the function body.
    fn add(&mut self, mnemonic: Mnemonic) -> usize {
        trace!(%mnemonic, offset = self.bytes.len(), "emit");
        let encoded = mnemonic.encode();
        let field = self.bytes.len() + encoded.value_loc;
        self.bytes.extend(encoded.bytes);
        field
    }

    fn finish(self) -> SectionCode {
        SectionCode {
            bytes: self.bytes,
            relocations: self.relocations,
        }
    }
}
