//! Decoded instructions and the byte-level decoder.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{DecompileError, Result};
use crate::opcodes::{Opcode, OpcodeSet, OperandLen};

/// Byte-level layout flags shared by every instruction of a script.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeFormat {
    /// Console images store multi-byte operands big-endian.
    pub swap_endian: bool,
    /// RDR widens the switch case count to a u16.
    pub extended: bool,
}

#[derive(Debug, Clone)]
pub struct Instruction {
    opcode: Opcode,
    operands: Vec<u8>,
    offset: usize,
}

impl Instruction {
    pub fn new(opcode: Opcode, operands: Vec<u8>, offset: usize) -> Self {
        Instruction { opcode, operands, offset }
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn byte_len(&self) -> usize {
        1 + self.operands.len()
    }

    /// Structuring may decide an instruction is dead (already-consumed jump);
    /// it is then retargeted to a no-op rather than removed, keeping offsets
    /// stable.
    pub fn nop_out(&mut self) {
        self.opcode = Opcode::Nop;
    }

    pub fn operand(&self, index: usize) -> u8 {
        self.operands[index]
    }

    pub fn operands_as_int(&self, fmt: CodeFormat) -> i64 {
        match self.operands.len() {
            1 => self.operands[0] as i64,
            2 => {
                if fmt.swap_endian {
                    BigEndian::read_i16(&self.operands) as i64
                } else {
                    LittleEndian::read_i16(&self.operands) as i64
                }
            }
            3 => {
                if fmt.swap_endian {
                    ((self.operands[0] as i64) << 16)
                        | ((self.operands[1] as i64) << 8)
                        | self.operands[2] as i64
                } else {
                    ((self.operands[2] as i64) << 16)
                        | ((self.operands[1] as i64) << 8)
                        | self.operands[0] as i64
                }
            }
            4 => {
                if fmt.swap_endian {
                    BigEndian::read_i32(&self.operands) as i64
                } else {
                    LittleEndian::read_i32(&self.operands) as i64
                }
            }
            n => panic!("invalid operand count {n}"),
        }
    }

    pub fn operands_as_uint(&self, fmt: CodeFormat) -> u32 {
        match self.operands.len() {
            1 => self.operands[0] as u32,
            2 => {
                if fmt.swap_endian {
                    BigEndian::read_u16(&self.operands) as u32
                } else {
                    LittleEndian::read_u16(&self.operands) as u32
                }
            }
            3 => {
                ((self.operands[2] as u32) << 16)
                    | ((self.operands[1] as u32) << 8)
                    | self.operands[0] as u32
            }
            4 => {
                if fmt.swap_endian {
                    BigEndian::read_u32(&self.operands)
                } else {
                    LittleEndian::read_u32(&self.operands)
                }
            }
            n => panic!("invalid operand count {n}"),
        }
    }

    pub fn float(&self, fmt: CodeFormat) -> f32 {
        debug_assert_eq!(self.operands.len(), 4);
        if fmt.swap_endian {
            BigEndian::read_f32(&self.operands)
        } else {
            LittleEndian::read_f32(&self.operands)
        }
    }

    /// Absolute target of a jump: relative i16 applied past the 3-byte
    /// instruction.
    pub fn jump_target(&self, fmt: CodeFormat) -> i64 {
        debug_assert!(self.opcode.is_jump());
        let rel = if fmt.swap_endian {
            BigEndian::read_i16(&self.operands)
        } else {
            LittleEndian::read_i16(&self.operands)
        };
        self.offset as i64 + 3 + rel as i64
    }

    /// An unconditional backward jump is the back-edge of a structured loop.
    pub fn is_while_jump(&self, fmt: CodeFormat) -> bool {
        self.opcode == Opcode::J
            && self.jump_target(fmt) > 0
            && self.operands_as_int(fmt) < 0
    }

    pub fn native_param_count(&self) -> usize {
        debug_assert_eq!(self.opcode, Opcode::Native);
        (self.operands[0] >> 2) as usize
    }

    pub fn native_return_count(&self) -> usize {
        debug_assert_eq!(self.opcode, Opcode::Native);
        (self.operands[0] & 0x3) as usize
    }

    /// Native table index; stored byte-swapped on every platform.
    pub fn native_index(&self) -> usize {
        debug_assert_eq!(self.opcode, Opcode::Native);
        BigEndian::read_u16(&self.operands[1..3]) as usize
    }

    pub fn switch_case_count(&self, fmt: CodeFormat) -> usize {
        debug_assert_eq!(self.opcode, Opcode::Switch);
        if fmt.extended {
            if fmt.swap_endian {
                BigEndian::read_u16(&self.operands) as usize
            } else {
                LittleEndian::read_u16(&self.operands) as usize
            }
        } else {
            self.operands[0] as usize
        }
    }

    /// Raw case value of entry `index` in the jump table.
    pub fn switch_case_value(&self, index: usize, fmt: CodeFormat) -> i64 {
        debug_assert!(index < self.switch_case_count(fmt));
        let base = if fmt.extended { 2 } else { 1 };
        let raw = LittleEndian::read_i32(&self.operands[base + index * 6..]);
        if fmt.swap_endian { raw.swap_bytes() as i64 } else { raw as i64 }
    }

    /// Absolute target offset of case `index`.
    pub fn switch_target(&self, index: usize, fmt: CodeFormat) -> i64 {
        debug_assert!(index < self.switch_case_count(fmt));
        if fmt.extended {
            let rel = LittleEndian::read_i16(&self.operands[6 + index * 6..]);
            let rel = if fmt.swap_endian { rel.swap_bytes() } else { rel };
            self.offset as i64 + 8 + 1 + (index as i64) * 6 + rel as i64
        } else {
            let rel = LittleEndian::read_i16(&self.operands[5 + index * 6..]);
            let rel = if fmt.swap_endian { rel.swap_bytes() } else { rel };
            self.offset as i64 + 8 + (index as i64) * 6 + rel as i64
        }
    }

    pub fn imm_int_push(&self) -> i64 {
        self.opcode
            .imm_int_push()
            .unwrap_or_else(|| panic!("{:?} is not an immediate int push", self.opcode))
    }

    pub fn imm_float_push(&self) -> f32 {
        self.opcode
            .imm_float_push()
            .unwrap_or_else(|| panic!("{:?} is not an immediate float push", self.opcode))
    }
}

/// Total byte length of the instruction whose opcode byte sits at `pos`, or
/// an error if the payload runs past the end of `code`.
pub fn instruction_len(
    code: &[u8],
    pos: usize,
    op: Opcode,
    fmt: CodeFormat,
) -> Result<usize> {
    let total = match op.operand_len() {
        OperandLen::Fixed(n) => 1 + n,
        OperandLen::Enter => {
            let name_len = *code.get(pos + 4).ok_or(DecompileError::TruncatedOperands {
                offset: pos,
                need: 4,
                have: code.len().saturating_sub(pos + 1),
            })? as usize;
            5 + name_len
        }
        OperandLen::Switch => {
            if fmt.extended {
                let lo = *code.get(pos + 1).ok_or(DecompileError::TruncatedOperands {
                    offset: pos,
                    need: 2,
                    have: code.len().saturating_sub(pos + 1),
                })? as usize;
                let hi = *code.get(pos + 2).ok_or(DecompileError::TruncatedOperands {
                    offset: pos,
                    need: 2,
                    have: code.len().saturating_sub(pos + 1),
                })? as usize;
                let count = if fmt.swap_endian { (lo << 8) | hi } else { (hi << 8) | lo };
                3 + 6 * count
            } else {
                let count = *code.get(pos + 1).ok_or(DecompileError::TruncatedOperands {
                    offset: pos,
                    need: 1,
                    have: 0,
                })? as usize;
                2 + 6 * count
            }
        }
    };
    if pos + total > code.len() {
        return Err(DecompileError::TruncatedOperands {
            offset: pos,
            need: total - 1,
            have: code.len() - pos - 1,
        });
    }
    Ok(total)
}

/// Decode the instruction at `pos`, returning it and the next cursor
/// position. `Opcode::Last` means the raw byte fell outside the edition's
/// table.
pub fn decode_at(
    code: &[u8],
    pos: usize,
    set: &dyn OpcodeSet,
    fmt: CodeFormat,
) -> Result<(Instruction, usize)> {
    let raw = code[pos];
    let op = set.map(raw);
    if op == Opcode::Last {
        return Err(DecompileError::UnknownOpcode { raw, offset: pos });
    }
    let total = instruction_len(code, pos, op, fmt)?;
    let operands = code[pos + 1..pos + total].to_vec();
    Ok((Instruction::new(op, operands, pos), pos + total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::VOpcodeSet;

    fn fmt() -> CodeFormat {
        CodeFormat::default()
    }

    #[test]
    fn jump_target_is_relative_to_instruction_end() {
        // J +5 at offset 10 lands at 18.
        let ins = Instruction::new(Opcode::J, vec![5, 0], 10);
        assert_eq!(ins.jump_target(fmt()), 18);
        // Backward jump.
        let ins = Instruction::new(Opcode::J, vec![0xF6, 0xFF], 20);
        assert_eq!(ins.jump_target(fmt()), 13);
        assert!(ins.is_while_jump(fmt()));
    }

    #[test]
    fn native_operand_packing() {
        // 2 params, 1 return, index 0x0102 stored big-endian.
        let ins = Instruction::new(Opcode::Native, vec![(2 << 2) | 1, 0x01, 0x02], 0);
        assert_eq!(ins.native_param_count(), 2);
        assert_eq!(ins.native_return_count(), 1);
        assert_eq!(ins.native_index(), 0x0102);
    }

    #[test]
    fn switch_entries() {
        // One case: value 7, relative offset +4.
        let mut operands = vec![1u8];
        operands.extend_from_slice(&7i32.to_le_bytes());
        operands.extend_from_slice(&4i16.to_le_bytes());
        let ins = Instruction::new(Opcode::Switch, operands, 100);
        assert_eq!(ins.switch_case_count(fmt()), 1);
        assert_eq!(ins.switch_case_value(0, fmt()), 7);
        assert_eq!(ins.switch_target(0, fmt()), 112);
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let code = [Opcode::PushConstU32 as u8, 1, 2];
        let err = decode_at(&code, 0, &VOpcodeSet, fmt()).unwrap_err();
        assert!(matches!(err, DecompileError::TruncatedOperands { .. }));
    }

    #[test]
    fn decode_rejects_out_of_table_bytes() {
        let code = [200u8];
        let err = decode_at(&code, 0, &VOpcodeSet, fmt()).unwrap_err();
        assert!(matches!(err, DecompileError::UnknownOpcode { raw: 200, .. }));
    }
}
