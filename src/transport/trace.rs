//! Structured trace records from the device's verbose execution mode.
//!
//! In verbose mode the firmware emits one brace-delimited JSON record per
//! executed event, interleaved with whatever else the shell prints:
//!
//! ```text
//! {"t":"opcode","op":"ADD","pc":4,"sp":1,"tos":30}
//! {"t":"task","id":0,"start":12,"end":13,"us":850,"ovr":false}
//! {"t":"error","code":3,"msg":"DIV_BY_ZERO","pc":9}
//! ```
//!
//! [`RecordScanner`] extracts complete records from the raw byte stream
//! incrementally. It tracks brace nesting *and* string-literal/escape
//! state, so a `}` inside a quoted value or a record torn across two reads
//! cannot desynchronize the scan. Records that do not decode as a known
//! kind are discarded by the capture loop.

use serde::Deserialize;

use crate::isa::{isa, Opcode};

/// One structured record emitted during a run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "t", rename_all = "lowercase")]
pub enum TraceEvent {
    /// One executed instruction.
    Opcode {
        /// Mnemonic as printed by the firmware.
        op: String,
        /// Program counter of the instruction.
        pc: u16,
        /// Stack pointer after execution.
        sp: u8,
        /// Top-of-stack value after execution.
        tos: i32,
    },
    /// A runtime fault reported by the VM.
    Error { code: u8, msg: String, pc: u16 },
    /// A task-switch / cycle summary.
    Task {
        id: u8,
        start: u32,
        end: u32,
        us: u32,
        /// Cycle overrun flag.
        ovr: bool,
    },
    /// A function-block invocation.
    Fb {
        name: String,
        id: u8,
        q: bool,
        #[serde(default)]
        et: Option<i32>,
    },
    /// Command acknowledgement record.
    Ack {
        cmd: String,
        val: String,
        ok: bool,
        #[serde(default)]
        err: Option<String>,
    },
}

impl TraceEvent {
    /// Resolve an opcode record's mnemonic against the ISA table.
    pub fn opcode(&self) -> Option<Opcode> {
        match self {
            TraceEvent::Opcode { op, .. } => isa().by_mnemonic(op),
            _ => None,
        }
    }
}

/// Last top-of-stack value among the opcode records, newest first.
pub fn last_tos(events: &[TraceEvent]) -> Option<i32> {
    events.iter().rev().find_map(|e| match e {
        TraceEvent::Opcode { tos, .. } => Some(*tos),
        _ => None,
    })
}

/// Last stack-pointer value among the opcode records, newest first.
pub fn last_sp(events: &[TraceEvent]) -> Option<u8> {
    events.iter().rev().find_map(|e| match e {
        TraceEvent::Opcode { sp, .. } => Some(*sp),
        _ => None,
    })
}

/// Incremental brace-delimited record extractor.
#[derive(Debug, Default)]
pub struct RecordScanner {
    buf: String,
    depth: usize,
    in_record: bool,
    in_string: bool,
    escaped: bool,
}

impl RecordScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of stream text; returns any records completed by it.
    ///
    /// Text outside records (prompts, echoes, line noise) is dropped.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        let mut complete = Vec::new();

        for ch in chunk.chars() {
            if !self.in_record {
                if ch == '{' {
                    self.in_record = true;
                    self.depth = 1;
                    self.in_string = false;
                    self.escaped = false;
                    self.buf.clear();
                    self.buf.push('{');
                }
                continue;
            }

            self.buf.push(ch);

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if ch == '\\' {
                    self.escaped = true;
                } else if ch == '"' {
                    self.in_string = false;
                }
                continue;
            }

            match ch {
                '"' => self.in_string = true,
                '{' => self.depth += 1,
                '}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        complete.push(std::mem::take(&mut self.buf));
                        self.in_record = false;
                    }
                }
                _ => {}
            }
        }

        complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scanner_extracts_records_from_noise() {
        let mut scanner = RecordScanner::new();
        let records = scanner.push(
            "plcvm:~$ start\r\n{\"t\":\"opcode\",\"op\":\"ADD\",\"pc\":4,\"sp\":1,\"tos\":30}\r\nnoise",
        );
        assert_eq!(
            records,
            vec![r#"{"t":"opcode","op":"ADD","pc":4,"sp":1,"tos":30}"#]
        );
    }

    #[test]
    fn test_scanner_survives_torn_reads() {
        let mut scanner = RecordScanner::new();
        assert!(scanner.push("{\"t\":\"opc").is_empty());
        let records = scanner.push("ode\",\"op\":\"NOP\",\"pc\":0,\"sp\":0,\"tos\":0}");
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_scanner_ignores_brace_inside_string() {
        let mut scanner = RecordScanner::new();
        let records = scanner.push(r#"{"t":"error","code":5,"msg":"bad }{ value","pc":2}"#);
        assert_eq!(records.len(), 1);
        let event: TraceEvent = serde_json::from_str(&records[0]).unwrap();
        assert_eq!(
            event,
            TraceEvent::Error {
                code: 5,
                msg: "bad }{ value".to_string(),
                pc: 2
            }
        );
    }

    #[test]
    fn test_scanner_handles_escaped_quote() {
        let mut scanner = RecordScanner::new();
        let records = scanner.push(r#"{"t":"error","code":1,"msg":"say \"}\"","pc":0}{"#);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_event_decoding() {
        let event: TraceEvent =
            serde_json::from_str(r#"{"t":"task","id":1,"start":10,"end":12,"us":900,"ovr":true}"#)
                .unwrap();
        assert_eq!(
            event,
            TraceEvent::Task {
                id: 1,
                start: 10,
                end: 12,
                us: 900,
                ovr: true
            }
        );

        let event: TraceEvent =
            serde_json::from_str(r#"{"t":"fb","name":"TON","id":2,"q":true,"et":150}"#).unwrap();
        assert_eq!(
            event,
            TraceEvent::Fb {
                name: "TON".to_string(),
                id: 2,
                q: true,
                et: Some(150)
            }
        );

        let event: TraceEvent =
            serde_json::from_str(r#"{"t":"ack","cmd":"start","val":"","ok":true}"#).unwrap();
        assert!(matches!(event, TraceEvent::Ack { ok: true, .. }));

        // Unknown kinds fail decode; the capture loop drops them.
        assert!(serde_json::from_str::<TraceEvent>(r#"{"t":"cycle","n":3,"us":10,"tasks":1}"#)
            .is_err());
    }

    #[test]
    fn test_opcode_resolution_against_isa() {
        let event: TraceEvent =
            serde_json::from_str(r#"{"t":"opcode","op":"ADD","pc":4,"sp":1,"tos":30}"#).unwrap();
        assert_eq!(event.opcode(), Some(Opcode::Add));

        let event: TraceEvent =
            serde_json::from_str(r#"{"t":"opcode","op":"???","pc":4,"sp":1,"tos":30}"#).unwrap();
        assert_eq!(event.opcode(), None);
    }

    #[test]
    fn test_last_tos_and_sp() {
        let events = vec![
            TraceEvent::Opcode {
                op: "PUSH8".into(),
                pc: 0,
                sp: 1,
                tos: 10,
            },
            TraceEvent::Task {
                id: 0,
                start: 0,
                end: 1,
                us: 10,
                ovr: false,
            },
            TraceEvent::Opcode {
                op: "ADD".into(),
                pc: 4,
                sp: 1,
                tos: 30,
            },
        ];
        assert_eq!(last_tos(&events), Some(30));
        assert_eq!(last_sp(&events), Some(1));
        assert_eq!(last_tos(&[]), None);
    }
}
