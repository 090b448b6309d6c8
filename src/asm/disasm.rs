//! Bytecode disassembler (debug aid).
//!
//! Reverse walk over a raw instruction stream using the shared ISA table.
//! An unassigned opcode byte is reported for that one position and the scan
//! resumes at the next byte; a truncated trailing operand is reported and
//! the scan stops without reading past the end.

use crate::isa::{isa, Opcode, OperandWidth};

/// One decoded position in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// A recognized instruction with its raw operand, if any.
    Instr {
        addr: u16,
        opcode: Opcode,
        operand: Option<u32>,
    },
    /// An unassigned opcode byte; the scan continues one byte later.
    Unknown { addr: u16, byte: u8 },
    /// A recognized opcode whose operand runs past the end of the stream.
    Truncated { addr: u16, opcode: Opcode },
}

/// Decode a raw instruction stream into structured form.
pub fn decode_stream(bytes: &[u8], base_addr: u16) -> Vec<Decoded> {
    let mut out = Vec::new();
    let mut pc = 0usize;

    while pc < bytes.len() {
        let addr = base_addr.wrapping_add(pc as u16);
        let byte = bytes[pc];

        let Some(opcode) = isa().decode(byte) else {
            out.push(Decoded::Unknown { addr, byte });
            pc += 1;
            continue;
        };

        let width = opcode.operand_width().bytes();
        if width > 0 && pc + width >= bytes.len() {
            out.push(Decoded::Truncated { addr, opcode });
            break;
        }

        let operand = match width {
            0 => None,
            1 => Some(bytes[pc + 1] as u32),
            2 => Some(u16::from_le_bytes([bytes[pc + 1], bytes[pc + 2]]) as u32),
            _ => Some(u32::from_le_bytes([
                bytes[pc + 1],
                bytes[pc + 2],
                bytes[pc + 3],
                bytes[pc + 4],
            ])),
        };
        out.push(Decoded::Instr {
            addr,
            opcode,
            operand,
        });
        pc += 1 + width;
    }

    out
}

/// Disassemble a raw instruction stream to readable text.
pub fn disassemble(bytes: &[u8], base_addr: u16) -> String {
    let mut lines = Vec::new();

    for entry in decode_stream(bytes, base_addr) {
        match entry {
            Decoded::Unknown { addr, byte } => {
                lines.push(format!("0x{addr:04X}: ??? (0x{byte:02X})"));
            }
            Decoded::Truncated { addr, opcode } => {
                lines.push(format!("0x{addr:04X}: {} <truncated>", opcode.mnemonic()));
            }
            Decoded::Instr {
                addr,
                opcode,
                operand,
            } => {
                let name = opcode.mnemonic();
                match (opcode.operand_width(), operand) {
                    (OperandWidth::None, _) => lines.push(format!("0x{addr:04X}: {name}")),
                    (OperandWidth::Byte, Some(op)) => {
                        if opcode.is_relative_branch() {
                            let signed = op as u8 as i8;
                            let target = addr.wrapping_add(2).wrapping_add(signed as u16);
                            lines.push(format!("0x{addr:04X}: {name} {signed} (-> 0x{target:04X})"));
                        } else {
                            lines.push(format!("0x{addr:04X}: {name} {op} (0x{op:02X})"));
                        }
                    }
                    (OperandWidth::Half, Some(op)) => {
                        lines.push(format!("0x{addr:04X}: {name} 0x{op:04X}"));
                    }
                    (OperandWidth::Word, Some(op)) => {
                        lines.push(format!("0x{addr:04X}: {name} 0x{op:08X}"));
                    }
                    // Width and operand presence always agree in decode_stream.
                    _ => unreachable!(),
                }
            }
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;

    #[test]
    fn test_round_trip_preserves_sequence() {
        let src = "\
start:  PUSH8 10
        PUSH16 0x1234
        PUSH32 0x89ABCDEF
        ADD
        JR start
        LOAD16 0x2000
        RET
        HALT
";
        let program = assemble(src).unwrap();
        let decoded = decode_stream(&program.code, 0);

        let expected = [
            (Opcode::Push8, Some(10u32)),
            (Opcode::Push16, Some(0x1234)),
            (Opcode::Push32, Some(0x89AB_CDEF)),
            (Opcode::Add, None),
            (Opcode::Jr, Some(0xF3)), // -13 as an unsigned byte
            (Opcode::Load16, Some(0x2000)),
            (Opcode::Ret, None),
            (Opcode::Halt, None),
        ];
        assert_eq!(decoded.len(), expected.len());
        for (entry, (opcode, operand)) in decoded.iter().zip(expected) {
            match entry {
                Decoded::Instr {
                    opcode: got_op,
                    operand: got_operand,
                    ..
                } => {
                    assert_eq!(*got_op, opcode);
                    assert_eq!(*got_operand, operand);
                }
                other => panic!("unexpected entry {other:?}"),
            }
        }
    }

    #[test]
    fn test_unknown_opcode_skips_one_byte() {
        // 0x27 is a hole between ABS and ADDF.
        let decoded = decode_stream(&[0x20, 0x27, 0x01], 0);
        assert_eq!(
            decoded,
            vec![
                Decoded::Instr {
                    addr: 0,
                    opcode: Opcode::Add,
                    operand: None
                },
                Decoded::Unknown { addr: 1, byte: 0x27 },
                Decoded::Instr {
                    addr: 2,
                    opcode: Opcode::Halt,
                    operand: None
                },
            ]
        );
    }

    #[test]
    fn test_truncated_operand_reported() {
        // LOAD16 wants two operand bytes; only one remains.
        let decoded = decode_stream(&[0x81, 0x00], 0);
        assert_eq!(
            decoded,
            vec![Decoded::Truncated {
                addr: 0,
                opcode: Opcode::Load16
            }]
        );
    }

    #[test]
    fn test_formatting() {
        let text = disassemble(&[0x40, 5, 0x50, 0xFE, 0x01], 0);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "0x0000: PUSH8 5 (0x05)");
        assert_eq!(lines[1], "0x0002: JR -2 (-> 0x0002)");
        assert_eq!(lines[2], "0x0004: HALT");
    }
}
