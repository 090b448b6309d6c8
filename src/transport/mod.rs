//! Device control and introspection over a serial link.
//!
//! The device end is a small shell: the host writes newline-terminated
//! commands and reads text back until a success token or the prompt
//! appears, bounded by a per-operation timeout. The link is synchronous
//! and half-duplex; no request overlaps another on the same session.
//!
//! A [`DeviceLink`] owns its channel exclusively for the session lifetime
//! and tracks the host-side view of the device state machine:
//!
//! ```text
//! Idle -> Loaded -> Running -> (Stopped | Idle)
//! ```
//!
//! Acknowledgement of a state-changing command does not guarantee the
//! transition has completed on the device, so `reset`/`start`/`stop` are
//! followed by a fixed settle delay. Retryable operations (`load`, `data`,
//! `poke`) get a fixed attempt budget with back-off; spending it is fatal
//! to the operation, since driving a half-loaded device would be
//! meaningless.

use std::io;
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use thiserror::Error;

use crate::config::Config;
use crate::isa::OperandWidth;

mod channel;
mod command;
mod retry;
mod trace;

pub use channel::{Channel, SerialChannel};
pub use command::{classify, Command, Expect, ResponseClass, TraceMode, PROMPT, TOKEN_ERROR, TOKEN_OK};
pub use retry::{RetryState, Verdict};
pub use trace::{last_sp, last_tos, RecordScanner, TraceEvent};

/// Hex characters per `data` chunk (16 bytes), bounded by the device
/// shell's safe line length.
pub const CHUNK_HEX_CHARS: usize = 32;

/// Attempt budget for `load`, `data`, and `poke`.
pub const RETRY_BUDGET: u32 = 3;

/// Transport failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("no serial port configured and no USB serial device found")]
    NoPort,

    #[error("{op} failed after {attempts} attempts; last response: {last_response:?}")]
    RetriesExhausted {
        op: &'static str,
        attempts: u32,
        last_response: String,
    },
}

/// Host-side view of the device execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No program loaded (or state unknown after reset).
    Idle,
    /// Bytecode uploaded and accepted.
    Loaded,
    /// Program running.
    Running,
    /// Program stopped by the host.
    Stopped,
}

/// Timing knobs for one link session.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Bounded wait for a single response.
    pub response_timeout: Duration,
    /// Settle delay after reset/start/stop.
    pub settle: Duration,
    /// Idle poll interval while waiting for input.
    pub poll: Duration,
    /// Back-off between retry attempts.
    pub retry_backoff: Duration,
    /// Pause between accepted data chunks.
    pub inter_chunk: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            response_timeout: Duration::from_secs(5),
            settle: Duration::from_millis(500),
            poll: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(500),
            inter_chunk: Duration::from_millis(50),
        }
    }
}

impl LinkConfig {
    /// Timing knobs from the host configuration.
    pub fn from_config(config: &Config) -> Self {
        LinkConfig {
            response_timeout: config.response_timeout(),
            settle: config.settle(),
            ..LinkConfig::default()
        }
    }
}

/// Matches one hex-encoded byte in a peek response line.
static HEX_PAIR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9A-Fa-f]{2}").unwrap());

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Every 2-hex-digit token following a colon, one byte each, up to `len`.
fn parse_peek_bytes(response: &str, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for line in response.lines() {
        let Some((_, data)) = line.split_once(':') else {
            continue;
        };
        for m in HEX_PAIR.find_iter(data) {
            if out.len() == len {
                return out;
            }
            if let Ok(byte) = u8::from_str_radix(m.as_str(), 16) {
                out.push(byte);
            }
        }
    }
    out
}

/// Exclusive session over one serial channel.
pub struct DeviceLink<C: Channel> {
    chan: C,
    cfg: LinkConfig,
    state: LinkState,
}

impl DeviceLink<SerialChannel> {
    /// Open a session on the configured (or auto-detected) serial port.
    pub fn open(config: &Config) -> Result<Self, TransportError> {
        let port = match config.port() {
            Some(p) => p.to_string(),
            None => autodetect_port()?,
        };
        let chan = SerialChannel::open(&port, config.baud())?;
        Ok(DeviceLink::with_channel(chan, LinkConfig::from_config(config)))
    }
}

fn autodetect_port() -> Result<String, TransportError> {
    let ports = serialport::available_ports()?;
    ports
        .into_iter()
        .find(|p| matches!(p.port_type, serialport::SerialPortType::UsbPort(_)))
        .map(|p| p.port_name)
        .ok_or(TransportError::NoPort)
}

impl<C: Channel> DeviceLink<C> {
    /// Wrap an already-open channel.
    pub fn with_channel(chan: C, cfg: LinkConfig) -> Self {
        DeviceLink {
            chan,
            cfg,
            state: LinkState::Idle,
        }
    }

    /// Current host-side view of the device state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Close the session.
    ///
    /// The channel is the session's only abort path: anything still pending
    /// on the underlying port fails as a closed-channel error.
    pub fn close(self) {}

    /// Issue one command and collect the response until the expected
    /// terminator appears or the per-operation timeout elapses.
    ///
    /// Pending input is drained first so stale partial responses from an
    /// earlier exchange cannot be misread. On timeout the accumulated
    /// (possibly incomplete) text is returned for the caller to classify.
    fn exchange(&mut self, cmd: &Command, expect: Expect) -> Result<String, TransportError> {
        self.chan.discard_input()?;
        let line = format!("{}\r\n", cmd.wire());
        self.chan.send_bytes(line.as_bytes())?;

        let deadline = Instant::now() + self.cfg.response_timeout;
        let mut response = String::new();
        let mut buf = [0u8; 256];

        while Instant::now() < deadline {
            let n = self.chan.recv_available(&mut buf)?;
            if n > 0 {
                response.push_str(&String::from_utf8_lossy(&buf[..n]));
                if command::is_terminal(&response, expect) {
                    break;
                }
            } else {
                thread::sleep(self.cfg.poll);
            }
        }
        Ok(response)
    }

    /// Issue an acknowledged command under the retry budget.
    fn exchange_acked(&mut self, cmd: &Command, op: &'static str) -> Result<(), TransportError> {
        let mut retry = RetryState::new(op, RETRY_BUDGET);
        loop {
            let response = self.exchange(cmd, Expect::Ack)?;
            if classify(&response) == ResponseClass::Ok {
                return Ok(());
            }
            match retry.failure(response) {
                Verdict::TryAgain { attempt } => {
                    log::warn!("{op} retry {attempt}");
                    thread::sleep(self.cfg.retry_backoff);
                }
                Verdict::Exhausted => return Err(retry.into_error()),
            }
        }
    }

    /// Stop execution, reset the VM, and clear persisted program state.
    pub fn reset(&mut self) -> Result<(), TransportError> {
        self.exchange(&Command::Stop, Expect::Prompt)?;
        self.exchange(&Command::Reset, Expect::Prompt)?;
        self.exchange(&Command::PersistClear, Expect::Prompt)?;
        thread::sleep(self.cfg.settle);
        self.state = LinkState::Idle;
        Ok(())
    }

    /// Upload bytecode: announce the length, then stream hex chunks.
    ///
    /// Exhausting the retry budget on the announcement or on any chunk is
    /// fatal; no further chunks are sent.
    pub fn upload(&mut self, bytecode: &[u8]) -> Result<(), TransportError> {
        self.exchange(&Command::Stop, Expect::Prompt)?;
        self.exchange(&Command::Reset, Expect::Prompt)?;

        self.exchange_acked(&Command::Load(bytecode.len() as u32), "load")?;

        let hex = hex_string(bytecode);
        let total_chunks = hex.len().div_ceil(CHUNK_HEX_CHARS);
        for (index, chunk) in hex.as_bytes().chunks(CHUNK_HEX_CHARS).enumerate() {
            // Chunk boundaries fall on hex-pair boundaries, so this is ASCII.
            let chunk = String::from_utf8_lossy(chunk).to_string();
            log::debug!("chunk {}/{}", index + 1, total_chunks);
            self.exchange_acked(&Command::Data(chunk), "data")?;
            thread::sleep(self.cfg.inter_chunk);
        }

        self.state = LinkState::Loaded;
        log::info!("uploaded {} bytes", bytecode.len());
        Ok(())
    }

    /// Start execution and return immediately (trace off).
    pub fn start(&mut self) -> Result<(), TransportError> {
        self.exchange(&Command::TraceMode(TraceMode::Off), Expect::Prompt)?;
        self.chan.discard_input()?;
        self.exchange(&Command::Start, Expect::Prompt)?;
        thread::sleep(self.cfg.settle);
        self.state = LinkState::Running;
        Ok(())
    }

    /// Stop execution (trace off first, so no records leak into later
    /// exchanges).
    pub fn stop(&mut self) -> Result<(), TransportError> {
        self.exchange(&Command::TraceMode(TraceMode::Off), Expect::Prompt)?;
        self.chan.discard_input()?;
        self.exchange(&Command::Stop, Expect::Prompt)?;
        thread::sleep(self.cfg.settle);
        self.state = LinkState::Stopped;
        Ok(())
    }

    /// Run for the given duration, then stop. For end-state-only checks.
    pub fn start_and_wait(&mut self, duration: Duration) -> Result<(), TransportError> {
        self.start()?;
        thread::sleep(duration);
        self.stop()
    }

    /// Run in verbose trace mode for the given duration, collecting every
    /// record that decodes as a known kind.
    ///
    /// The device is left running; call [`stop`](Self::stop) afterwards if
    /// the scenario needs a quiescent end state.
    pub fn start_and_capture(
        &mut self,
        duration: Duration,
    ) -> Result<Vec<TraceEvent>, TransportError> {
        self.exchange(&Command::TraceMode(TraceMode::Verbose), Expect::Prompt)?;
        self.chan.discard_input()?;
        let line = format!("{}\r\n", Command::Start.wire());
        self.chan.send_bytes(line.as_bytes())?;
        self.state = LinkState::Running;

        let mut scanner = RecordScanner::new();
        let mut events = Vec::new();
        let deadline = Instant::now() + duration;
        let mut buf = [0u8; 256];

        while Instant::now() < deadline {
            let n = self.chan.recv_available(&mut buf)?;
            if n == 0 {
                thread::sleep(self.cfg.poll);
                continue;
            }
            for record in scanner.push(&String::from_utf8_lossy(&buf[..n])) {
                match serde_json::from_str::<TraceEvent>(&record) {
                    Ok(event) => events.push(event),
                    Err(_) => log::debug!("discarding undecodable record: {record}"),
                }
            }
        }

        log::debug!("captured {} trace events", events.len());
        Ok(events)
    }

    /// Read up to `len` bytes of device memory.
    ///
    /// A short read is a valid partial result, returned as-is; boundary
    /// probing is a legitimate use.
    pub fn peek(&mut self, addr: u16, len: usize) -> Result<Vec<u8>, TransportError> {
        let response = self.exchange(&Command::Peek { addr, len }, Expect::Prompt)?;
        let bytes = parse_peek_bytes(&response, len);
        if bytes.len() < len {
            log::debug!("peek 0x{addr:04X}: short read {}/{len}", bytes.len());
        }
        Ok(bytes)
    }

    /// Write a value to device memory as one hex string in one command.
    ///
    /// No chunking: callers bound poke size themselves.
    pub fn poke(
        &mut self,
        addr: u16,
        value: i64,
        width: OperandWidth,
    ) -> Result<(), TransportError> {
        let hex = hex_string(&width.encode(value));
        self.exchange_acked(&Command::Poke { addr, hex }, "poke")
    }

    /// Scenario convenience: reset, upload, run with trace capture.
    pub fn run_module(
        &mut self,
        bytecode: &[u8],
        duration: Duration,
    ) -> Result<Vec<TraceEvent>, TransportError> {
        self.reset()?;
        self.upload(bytecode)?;
        self.start_and_capture(duration)
    }
}
