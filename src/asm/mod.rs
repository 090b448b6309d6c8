//! Two-pass assembler for PLCVM bytecode.
//!
//! Translates textual assembly into a raw instruction stream. Pass 1 parses
//! lines, collects labels, and assigns byte addresses; pass 2 resolves label
//! references and the entry point. Emission walks the parsed items in order
//! and writes each opcode byte followed by its little-endian operand.
//!
//! # Syntax
//!
//! ```text
//! ; comment
//! start:              ; label definition
//!     PUSH8 10        ; mnemonic with operand
//!     PUSH8 'A'       ; character literal
//!     ADD
//!     STORE16 0x1000
//!     JR start        ; relative branch to a label
//!     HALT
//! ```
//!
//! Directives: `.ORG addr` moves the address cursor, `.ENTRY label|addr`
//! sets the module entry point, `.DB`/`.BYTE v[,v...]` emits literal bytes.
//!
//! Numeric literals: decimal, `0x` hex, `0b` binary, `0o` octal (prefixes
//! case-insensitive), optional sign, and single-quoted character literals
//! with the escapes `\n \r \t \\ \' \0`. A bare identifier is always a
//! label reference, never a number.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::isa::{isa, Opcode};

mod disasm;

pub use disasm::{decode_stream, disassemble, Decoded};

/// A parse failure in pass 1. Fatal; carries the offending line.
#[derive(Debug, Error)]
#[error("line {line}: {message}\n  -> {text}")]
pub struct SyntaxError {
    /// 1-based source line number.
    pub line: usize,
    /// What went wrong.
    pub message: String,
    /// The line text (comment stripped).
    pub text: String,
}

/// A resolution failure in pass 2, or a label redefinition.
#[derive(Debug, Error)]
pub enum LinkError {
    /// A label name was defined twice; `line` is the redefinition site.
    #[error("line {line}: duplicate label '{name}'")]
    DuplicateLabel { name: String, line: usize },

    /// An instruction references a label that is never defined.
    #[error("line {line}: undefined label '{name}'")]
    UndefinedLabel { name: String, line: usize },

    /// A relative branch target is outside the signed-byte range.
    #[error("line {line}: relative branch to '{name}' out of range ({offset})")]
    BranchOutOfRange {
        name: String,
        offset: i32,
        line: usize,
    },

    /// `.ENTRY` names a label that is never defined.
    #[error("undefined entry point label '{name}'")]
    UndefinedEntry { name: String },
}

/// Any assembly failure.
#[derive(Debug, Error)]
pub enum AsmError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// A finished assembly: raw instruction stream plus entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    /// Raw bytecode, no container header.
    pub code: Vec<u8>,
    /// Code offset of the first instruction to execute.
    pub entry: u16,
}

/// Compiled regex patterns for line parsing.
struct Patterns {
    /// Leading label definition: `name:`
    label: Regex,
    /// A bare identifier (label reference, never a number).
    ident: Regex,
}

static PATTERNS: LazyLock<Patterns> = LazyLock::new(|| Patterns {
    label: Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*:").unwrap(),
    ident: Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap(),
});

#[derive(Debug)]
struct Instruction {
    opcode: Opcode,
    /// Resolved operand value; `None` until pass 2 for label references.
    operand: Option<i64>,
    /// Unresolved label reference, uppercased in pass 2.
    label_ref: Option<String>,
    line: usize,
    addr: u16,
}

#[derive(Debug)]
enum Item {
    Instr(Instruction),
    /// Literal bytes from `.DB`/`.BYTE`.
    Bytes { data: Vec<u8> },
}

#[derive(Debug)]
struct Label {
    addr: u16,
    #[allow(dead_code)]
    line: usize,
}

#[derive(Debug)]
enum Entry {
    Addr(u16),
    Label { name: String },
}

/// Parse a numeric literal.
fn parse_number(s: &str) -> Result<i64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty number".to_string());
    }

    let chars: Vec<char> = s.chars().collect();

    // Character literal, with a fixed escape set.
    if chars.len() >= 3 && chars[0] == '\'' && chars[chars.len() - 1] == '\'' {
        if chars[1] == '\\' {
            if chars.len() < 4 {
                return Err(format!("bad character literal {s}"));
            }
            return match chars[2] {
                'n' => Ok(10),
                'r' => Ok(13),
                't' => Ok(9),
                '\\' => Ok(92),
                '\'' => Ok(39),
                '0' => Ok(0),
                other => Err(format!("unknown escape '\\{other}'")),
            };
        }
        return Ok(chars[1] as i64);
    }

    let (negative, rest) = match chars[0] {
        '-' => (true, &s[1..]),
        '+' => (false, &s[1..]),
        _ => (false, s),
    };
    if rest.is_empty() {
        return Err(format!("invalid number '{s}'"));
    }

    let lower = rest.to_ascii_lowercase();
    let parsed = if let Some(digits) = lower.strip_prefix("0x") {
        i64::from_str_radix(digits, 16)
    } else if let Some(digits) = lower.strip_prefix("0b") {
        i64::from_str_radix(digits, 2)
    } else if let Some(digits) = lower.strip_prefix("0o") {
        i64::from_str_radix(digits, 8)
    } else {
        lower.parse::<i64>()
    };

    let value = parsed.map_err(|_| format!("invalid number '{s}'"))?;
    Ok(if negative { -value } else { value })
}

fn syntax(line: usize, text: &str, message: String) -> AsmError {
    AsmError::Syntax(SyntaxError {
        line,
        message,
        text: text.to_string(),
    })
}

#[derive(Debug)]
struct Assembler {
    items: Vec<Item>,
    labels: HashMap<String, Label>,
    entry: Entry,
    cursor: u16,
}

impl Assembler {
    fn new() -> Self {
        Assembler {
            items: Vec::new(),
            labels: HashMap::new(),
            entry: Entry::Addr(0),
            cursor: 0,
        }
    }

    /// Pass 1: parse one source line.
    fn parse_line(&mut self, raw: &str, line_no: usize) -> Result<(), AsmError> {
        let no_comment = match raw.find(';') {
            Some(i) => &raw[..i],
            None => raw,
        };
        let mut line = no_comment.trim();
        if line.is_empty() {
            return Ok(());
        }

        if let Some(caps) = PATTERNS.label.captures(line) {
            let name = caps.get(1).unwrap().as_str().to_uppercase();
            if self.labels.contains_key(&name) {
                return Err(LinkError::DuplicateLabel { name, line: line_no }.into());
            }
            log::debug!("label '{}' at 0x{:04X}", name, self.cursor);
            self.labels.insert(
                name,
                Label {
                    addr: self.cursor,
                    line: line_no,
                },
            );
            line = line[caps.get(0).unwrap().end()..].trim();
            if line.is_empty() {
                return Ok(());
            }
        }

        let (mnemonic, operand_str) = match line.split_once(char::is_whitespace) {
            Some((m, rest)) => (m, rest.trim()),
            None => (line, ""),
        };
        let upper = mnemonic.to_uppercase();

        if upper.starts_with('.') {
            return self.handle_directive(&upper, operand_str, line_no, line);
        }

        let opcode = isa()
            .by_mnemonic(&upper)
            .ok_or_else(|| syntax(line_no, line, format!("unknown instruction '{upper}'")))?;
        let width = opcode.operand_width();

        let (operand, label_ref) = if width.bytes() > 0 {
            if operand_str.is_empty() {
                return Err(syntax(
                    line_no,
                    line,
                    format!("instruction '{upper}' requires an operand"),
                ));
            }
            if PATTERNS.ident.is_match(operand_str) {
                (None, Some(operand_str.to_string()))
            } else {
                let value = parse_number(operand_str).map_err(|e| {
                    syntax(line_no, line, format!("invalid operand '{operand_str}': {e}"))
                })?;
                (Some(value), None)
            }
        } else {
            if !operand_str.is_empty() {
                return Err(syntax(
                    line_no,
                    line,
                    format!("instruction '{upper}' takes no operand"),
                ));
            }
            (None, None)
        };

        log::debug!(
            "0x{:04X}: {} {} ({} bytes)",
            self.cursor,
            upper,
            operand_str,
            1 + width.bytes()
        );
        self.items.push(Item::Instr(Instruction {
            opcode,
            operand,
            label_ref,
            line: line_no,
            addr: self.cursor,
        }));
        self.cursor = self.cursor.wrapping_add(1 + width.bytes() as u16);
        Ok(())
    }

    fn handle_directive(
        &mut self,
        directive: &str,
        operand: &str,
        line_no: usize,
        text: &str,
    ) -> Result<(), AsmError> {
        match directive {
            ".ORG" => {
                let value = parse_number(operand).map_err(|e| {
                    syntax(line_no, text, format!("invalid address for .ORG: {e}"))
                })?;
                self.cursor = value as u16;
                log::debug!("origin set to 0x{:04X}", self.cursor);
            }
            ".ENTRY" => {
                let operand = operand.trim();
                if PATTERNS.ident.is_match(operand) {
                    self.entry = Entry::Label {
                        name: operand.to_uppercase(),
                    };
                } else {
                    let value = parse_number(operand).map_err(|e| {
                        syntax(line_no, text, format!("invalid entry point: {e}"))
                    })?;
                    self.entry = Entry::Addr(value as u16);
                }
            }
            ".DB" | ".BYTE" => {
                let mut data = Vec::new();
                for piece in operand.split(',') {
                    let value = parse_number(piece).map_err(|e| {
                        syntax(line_no, text, format!("invalid byte value '{}': {e}", piece.trim()))
                    })?;
                    data.push((value & 0xFF) as u8);
                }
                self.cursor = self.cursor.wrapping_add(data.len() as u16);
                self.items.push(Item::Bytes { data });
            }
            _ => {
                return Err(syntax(
                    line_no,
                    text,
                    format!("unknown directive '{directive}'"),
                ));
            }
        }
        Ok(())
    }

    /// Pass 2: resolve label references and the entry point.
    fn resolve(&mut self) -> Result<u16, LinkError> {
        for item in &mut self.items {
            let Item::Instr(ins) = item else { continue };
            let Some(name) = ins.label_ref.take() else {
                continue;
            };
            let key = name.to_uppercase();
            let label = self
                .labels
                .get(&key)
                .ok_or_else(|| LinkError::UndefinedLabel {
                    name: key.clone(),
                    line: ins.line,
                })?;

            let resolved = if ins.opcode.is_relative_branch() {
                // Offset is relative to the PC after the two-byte instruction.
                let offset = label.addr as i32 - (ins.addr as i32 + 2);
                if !(-128..=127).contains(&offset) {
                    return Err(LinkError::BranchOutOfRange {
                        name: key,
                        offset,
                        line: ins.line,
                    });
                }
                offset as i64
            } else {
                label.addr as i64
            };
            ins.operand = Some(resolved);
            log::debug!("resolved '{}' -> 0x{:04X}", key, resolved);
        }

        match &self.entry {
            Entry::Addr(addr) => Ok(*addr),
            Entry::Label { name } => self
                .labels
                .get(name)
                .map(|l| l.addr)
                .ok_or_else(|| LinkError::UndefinedEntry { name: name.clone() }),
        }
    }

    /// Emit the instruction stream in source order.
    fn emit(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for item in &self.items {
            match item {
                Item::Instr(ins) => {
                    out.push(ins.opcode as u8);
                    out.extend_from_slice(
                        &ins.opcode.operand_width().encode(ins.operand.unwrap_or(0)),
                    );
                }
                Item::Bytes { data } => out.extend_from_slice(data),
            }
        }
        out
    }
}

/// Assemble source text into a raw instruction stream.
///
/// Pass 1 failures surface as [`SyntaxError`] (or an immediate duplicate-label
/// [`LinkError`]); resolution failures surface as [`LinkError`] only once the
/// whole source has parsed.
pub fn assemble(source: &str) -> Result<Program, AsmError> {
    let mut asm = Assembler::new();
    for (idx, line) in source.lines().enumerate() {
        asm.parse_line(line, idx + 1)?;
    }
    let entry = asm.resolve()?;
    let code = asm.emit();
    log::debug!("assembled {} bytes, entry 0x{:04X}", code.len(), entry);
    Ok(Program { code, entry })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoke_program() {
        let program = assemble("PUSH8 10\nPUSH8 20\nADD\nHALT\n").unwrap();
        assert_eq!(program.code, vec![0x40, 10, 0x40, 20, 0x20, 0x01]);
        assert_eq!(program.entry, 0);
    }

    #[test]
    fn test_operand_widths_and_endianness() {
        let program = assemble("PUSH16 0x1234\nPUSH32 0x01020304\nSTORE16 0x1000\n").unwrap();
        assert_eq!(
            program.code,
            vec![0x88, 0x34, 0x12, 0xC0, 0x04, 0x03, 0x02, 0x01, 0x85, 0x00, 0x10]
        );
    }

    #[test]
    fn test_comments_labels_and_case() {
        let src = "\
; full-line comment
start:  push8 1     ; mixed-case mnemonic
        jmp START   ; label lookup is case-insensitive
";
        let program = assemble(src).unwrap();
        assert_eq!(program.code, vec![0x40, 1, 0x90, 0x00, 0x00]);
    }

    #[test]
    fn test_number_grammar() {
        assert_eq!(parse_number("123").unwrap(), 123);
        assert_eq!(parse_number("-45").unwrap(), -45);
        assert_eq!(parse_number("+7").unwrap(), 7);
        assert_eq!(parse_number("0x1F").unwrap(), 31);
        assert_eq!(parse_number("0XFF").unwrap(), 255);
        assert_eq!(parse_number("0b1010").unwrap(), 10);
        assert_eq!(parse_number("0o17").unwrap(), 15);
        assert_eq!(parse_number("'A'").unwrap(), 65);
        assert_eq!(parse_number("'\\n'").unwrap(), 10);
        assert_eq!(parse_number("'\\0'").unwrap(), 0);
        assert_eq!(parse_number("'\\\\'").unwrap(), 92);
        assert!(parse_number("").is_err());
        assert!(parse_number("0xZZ").is_err());
        assert!(parse_number("'\\q'").is_err());
    }

    #[test]
    fn test_relative_branch_backward() {
        // JR at address 1: offset = 0 - (1 + 2) = -3.
        let program = assemble("loop: NOP\nJR loop\n").unwrap();
        assert_eq!(program.code, vec![0x00, 0x50, 0xFD]);
    }

    #[test]
    fn test_relative_branch_forward() {
        // JRZ at 0, target at 3: offset = 3 - 2 = 1.
        let program = assemble("JRZ skip\nNOP\nskip: HALT\n").unwrap();
        assert_eq!(program.code, vec![0x51, 0x01, 0x00, 0x01]);
    }

    #[test]
    fn test_branch_out_of_range_fails() {
        let err = assemble("JR far\n.ORG 200\nfar: HALT\n").unwrap_err();
        match err {
            AsmError::Link(LinkError::BranchOutOfRange { offset, .. }) => {
                assert_eq!(offset, 198);
            }
            other => panic!("expected BranchOutOfRange, got {other:?}"),
        }
    }

    #[test]
    fn test_forward_reference_matches_early_definition() {
        // Same final addresses, label defined after vs. before its use.
        let forward = assemble("JMP target\ntarget: HALT\n").unwrap();
        let early = assemble(".ORG 3\ntarget:\n.ORG 0\nJMP target\nHALT\n").unwrap();
        assert_eq!(forward.code, early.code);
    }

    #[test]
    fn test_duplicate_label_cites_second_line() {
        let err = assemble("LOOP:\nNOP\nLOOP:\nHALT\n").unwrap_err();
        match err {
            AsmError::Link(LinkError::DuplicateLabel { name, line }) => {
                assert_eq!(name, "LOOP");
                assert_eq!(line, 3);
            }
            other => panic!("expected DuplicateLabel, got {other:?}"),
        }
    }

    #[test]
    fn test_undefined_label_fails() {
        let err = assemble("JMP nowhere\n").unwrap_err();
        assert!(matches!(
            err,
            AsmError::Link(LinkError::UndefinedLabel { .. })
        ));
    }

    #[test]
    fn test_arity_errors() {
        assert!(matches!(
            assemble("PUSH8\n").unwrap_err(),
            AsmError::Syntax(_)
        ));
        assert!(matches!(
            assemble("ADD 3\n").unwrap_err(),
            AsmError::Syntax(_)
        ));
        assert!(matches!(
            assemble("FROB 1\n").unwrap_err(),
            AsmError::Syntax(_)
        ));
    }

    #[test]
    fn test_db_emits_bytes() {
        let program = assemble("PUSH8 1\n.DB 1, 2, 0x03\nHALT\n").unwrap();
        assert_eq!(program.code, vec![0x40, 1, 1, 2, 3, 0x01]);
    }

    #[test]
    fn test_db_advances_label_addresses() {
        let program = assemble(".DB 0, 0, 0\nhere: HALT\nJMP here\n").unwrap();
        // `here` sits after the three data bytes.
        assert_eq!(program.code, vec![0, 0, 0, 0x01, 0x90, 0x03, 0x00]);
    }

    #[test]
    fn test_entry_directive() {
        let symbolic = assemble("NOP\n.ENTRY main\nmain: HALT\n").unwrap();
        assert_eq!(symbolic.entry, 1);
        let numeric = assemble(".ENTRY 0x10\nNOP\n").unwrap();
        assert_eq!(numeric.entry, 0x10);
        let missing = assemble(".ENTRY main\nNOP\n").unwrap_err();
        assert!(matches!(
            missing,
            AsmError::Link(LinkError::UndefinedEntry { .. })
        ));
    }

    #[test]
    fn test_absolute_reference_for_non_branch() {
        // CALL takes the label's absolute address, not a relative offset.
        let program = assemble("NOP\nCALL sub\nHALT\nsub: RET\n").unwrap();
        assert_eq!(program.code, vec![0x00, 0x93, 0x05, 0x00, 0x01, 0x94]);
    }
}
