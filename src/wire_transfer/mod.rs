//! The device byte transport and its two state machines: a TX side that
//! frames and sends queued content, and an RX side that reassembles incoming
//! frames back into content-ID-keyed data. One instance, one channel, ticked
//! every `process()` call: TX advances a single step, then RX drains and
//! processes every currently buffered byte.

pub mod channel;

use crate::env_bus::{DbgChannel, EnvBus};
use crate::log;
use crate::log_macros::LogLevel::{LogDebug, LogInfo, LogWarn};
use crate::scheduler::{Success, TaskBehavior, TaskHandle};
use channel::{ByteChannel, SocketChannel, TtyChannel};
use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

const FLOW_MASTER_TO_SLAVE: u8 = 0xF0;
const FLOW_YIELD: u8 = 0xF1;

const CONTENT_CMD_OUT: u8 = 0xC0;
const CONTENT_CMD_RESP: u8 = 0xC1;
const CONTENT_NONE: u8 = 0x00;

/// Device-origin content-IDs, re-exported for the root application's fan-out
/// (it reads `dataIn` under these same keys).
pub(crate) const CONTENT_LOG: u8 = 0xC0;
pub(crate) const CONTENT_PROC_TREE: u8 = 0xC2;

const TERM_END: u8 = 0x00;
const TERM_CUT: u8 = 0x17;

const DEVICE_TIMEOUT: Duration = Duration::from_millis(500);
const REINIT_BACKOFF: Duration = Duration::from_millis(1500);
const INIT_STRING: &[u8] = b"aaaaa";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum TxState {
    DbgIfInit,
    NextFlowDetermine,
    ResponseWait,
    ReInitWait,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RxState {
    FlowControlByteRcv,
    DataIgnore,
    ContentByteRcv,
    DataRcv { content_id: u8 },
}

pub struct WireTransfer {
    env: Rc<EnvBus>,
    channel: Option<Box<dyn ByteChannel>>,
    tx_state: TxState,
    rx_state: RxState,
    rx_initial_state: RxState,
    fragments: HashMap<u8, String>,
    ms_last_received: Instant,
    ms_start: Instant,
    frame_done: bool,
    last_sent_cmd_id: u64,
}

impl WireTransfer {
    pub fn new(env: Rc<EnvBus>) -> WireTransfer {
        let rx_initial_state = match env.dbg_channel {
            DbgChannel::Tty => RxState::FlowControlByteRcv,
            DbgChannel::Socket => RxState::ContentByteRcv,
        };
        WireTransfer {
            env,
            channel: None,
            tx_state: TxState::DbgIfInit,
            rx_state: rx_initial_state,
            rx_initial_state,
            fragments: HashMap::new(),
            ms_last_received: Instant::now(),
            ms_start: Instant::now(),
            frame_done: false,
            last_sent_cmd_id: 0,
        }
    }

    fn open_channel(&mut self) -> bool {
        let opened = match self.env.dbg_channel {
            DbgChannel::Tty => TtyChannel::open().map(|c| Box::new(c) as Box<dyn ByteChannel>),
            DbgChannel::Socket => SocketChannel::connect(self.env.dbg_port).map(|c| Box::new(c) as Box<dyn ByteChannel>),
        };
        match opened {
            Ok(c) => {
                self.channel = Some(c);
                true
            }
            Err(e) => {
                log!(LogWarn, "failed to open device channel: {}", e);
                false
            }
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        if let Some(channel) = self.channel.as_mut() {
            if let Err(e) = channel.write_frame(bytes) {
                log!(LogWarn, "write to device channel failed: {}", e);
            }
        }
    }

    fn send_command_frame(&mut self, payload: &[u8]) {
        let mut frame = Vec::with_capacity(payload.len() + 3);
        frame.push(FLOW_MASTER_TO_SLAVE);
        frame.push(CONTENT_CMD_OUT);
        frame.extend_from_slice(payload);
        frame.push(TERM_END);
        self.write_bytes(&frame);
    }

    fn advance_tx(&mut self) {
        match self.tx_state {
            TxState::DbgIfInit => {
                log!(LogDebug, "wire: sending init string");
                self.send_command_frame(INIT_STRING);
                self.tx_state = TxState::NextFlowDetermine;
            }
            TxState::NextFlowDetermine => {
                let cmd_out = self.env.cmd_out();
                if cmd_out.id != self.last_sent_cmd_id {
                    self.send_command_frame(cmd_out.name.as_bytes());
                    self.last_sent_cmd_id = cmd_out.id;
                    self.env.release_cmd_out_slot();
                } else {
                    self.write_bytes(&[FLOW_YIELD]);
                    self.ms_last_received = Instant::now();
                    self.frame_done = false;
                    self.tx_state = TxState::ResponseWait;
                }
            }
            TxState::ResponseWait => {
                if self.ms_last_received.elapsed() > DEVICE_TIMEOUT {
                    if self.env.dev_online() {
                        log!(LogWarn, "device link timed out, marking offline");
                    }
                    self.env.set_dev_online(false);
                    self.rx_state = self.rx_initial_state;
                    self.ms_start = Instant::now();
                    self.tx_state = TxState::ReInitWait;
                } else if self.frame_done {
                    if !self.env.dev_online() {
                        log!(LogInfo, "device link restored");
                    }
                    self.env.set_dev_online(true);
                    self.tx_state = TxState::NextFlowDetermine;
                }
            }
            TxState::ReInitWait => {
                if self.ms_start.elapsed() >= REINIT_BACKOFF {
                    self.tx_state = TxState::DbgIfInit;
                }
            }
        }
    }

    fn advance_rx(&mut self) {
        let mut buf = [0u8; 512];
        loop {
            let n = match self.channel.as_mut() {
                Some(channel) => match channel.read_available(&mut buf) {
                    Ok(n) => n,
                    Err(e) => {
                        log!(LogWarn, "read from device channel failed: {}", e);
                        0
                    }
                },
                None => 0,
            };
            if n == 0 {
                break;
            }
            for &byte in &buf[..n] {
                self.rx_step(byte);
            }
        }
    }

    fn rx_step(&mut self, byte: u8) {
        match self.rx_state {
            RxState::FlowControlByteRcv => {
                if byte == FLOW_MASTER_TO_SLAVE {
                    self.rx_state = RxState::DataIgnore;
                } else if byte == FLOW_YIELD {
                    self.rx_state = RxState::ContentByteRcv;
                }
            }
            RxState::DataIgnore => {
                if byte == TERM_END || byte == TERM_CUT {
                    self.rx_state = self.rx_initial_state;
                }
            }
            RxState::ContentByteRcv => {
                self.ms_last_received = Instant::now();
                if byte == CONTENT_NONE {
                    self.frame_done = true;
                    self.rx_state = self.rx_initial_state;
                } else {
                    self.rx_state = RxState::DataRcv { content_id: byte };
                }
            }
            RxState::DataRcv { content_id } => {
                self.ms_last_received = Instant::now();
                match byte {
                    TERM_END => {
                        self.finalize_fragment(content_id);
                        self.frame_done = true;
                        self.rx_state = self.rx_initial_state;
                    }
                    TERM_CUT => {
                        self.frame_done = true;
                        self.rx_state = self.rx_initial_state;
                    }
                    _ => {
                        self.fragments.entry(content_id).or_default().push(byte as char);
                    }
                }
            }
        }
    }

    fn finalize_fragment(&mut self, content_id: u8) {
        match self.fragments.remove(&content_id) {
            None => {
                log!(LogWarn, "empty message for content id {:#04x}", content_id);
            }
            Some(payload) => {
                self.env.push_data_in(content_id, payload);
                if content_id == CONTENT_CMD_RESP {
                    if let Some(resp) = self.env.pop_data_in(CONTENT_CMD_RESP) {
                        let cmd_in = self.env.cmd_in();
                        if self.last_sent_cmd_id != cmd_in.id {
                            self.env.set_cmd_in(self.last_sent_cmd_id, resp);
                        }
                        // else: a duplicate response for an already-consumed id, dropped.
                    }
                }
            }
        }
    }
}

impl TaskBehavior for WireTransfer {
    fn initialize(&mut self, _handle: &TaskHandle) -> Success {
        if self.open_channel() {
            Success::Positive
        } else {
            Success::Negative(-1)
        }
    }

    fn process(&mut self, _handle: &TaskHandle) -> Success {
        self.advance_tx();
        self.advance_rx();
        Success::Pending
    }

    fn label(&self) -> &str {
        "wire_transfer"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env_bus::DbgChannel;

    // TTY-channel framing tests exercise the full flow-byte state machine:
    // this (TTY) side still sees the flow bytes that a socket peer strips.
    fn tty_transfer() -> WireTransfer {
        WireTransfer::new(Rc::new(EnvBus::new(DbgChannel::Tty, 0)))
    }

    #[test]
    fn reassembles_a_message_fragmented_across_turns() {
        let mut wt = tty_transfer();
        // F1 C2 'a' 'b' 17  F1 C2 'c' 00
        for b in [FLOW_YIELD, 0xC2, b'a', b'b', TERM_CUT] {
            wt.rx_step(b);
        }
        assert!(wt.frame_done);
        assert_eq!(wt.env.pop_data_in(0xC2), None, "cut fragment must not finalize yet");

        wt.frame_done = false;
        for b in [FLOW_YIELD, 0xC2, b'c', TERM_END] {
            wt.rx_step(b);
        }
        assert_eq!(wt.env.pop_data_in(0xC2).as_deref(), Some("abc"));
    }

    #[test]
    fn nothing_to_report_produces_no_message_but_pulses_frame_done() {
        let mut wt = tty_transfer();
        wt.rx_step(FLOW_YIELD);
        wt.rx_step(CONTENT_NONE);
        assert!(wt.frame_done);
        assert_eq!(wt.rx_state, wt.rx_initial_state);
        assert!(wt.env.pop_data_in(0).is_none());
    }

    #[test]
    fn data_ignore_discards_bytes_during_a_master_to_slave_turn() {
        let mut wt = tty_transfer();
        for b in [FLOW_MASTER_TO_SLAVE, 0xAA, 0xBB, TERM_END] {
            wt.rx_step(b);
        }
        assert_eq!(wt.rx_state, RxState::FlowControlByteRcv);

        for b in [FLOW_YIELD, CONTENT_CMD_RESP, b'r', TERM_END] {
            wt.rx_step(b);
        }
        assert_eq!(wt.env.cmd_in().resp, "r");
    }

    #[test]
    fn duplicate_command_response_is_dropped() {
        let mut wt = tty_transfer();
        wt.last_sent_cmd_id = 5;
        wt.env.set_cmd_in(5, "already-consumed".into());

        for b in [FLOW_YIELD, CONTENT_CMD_RESP, b'x', TERM_END] {
            wt.rx_step(b);
        }
        assert_eq!(wt.env.cmd_in().resp, "already-consumed");
    }

    #[test]
    fn socket_channel_starts_at_content_byte_and_omits_the_flow_byte() {
        let env = Rc::new(EnvBus::new(DbgChannel::Socket, 0));
        let mut wt = WireTransfer::new(env);
        assert_eq!(wt.rx_initial_state, RxState::ContentByteRcv);
        for b in [CONTENT_CMD_RESP, b'o', b'k', TERM_END] {
            wt.rx_step(b);
        }
        assert_eq!(wt.env.cmd_in().resp, "ok");
    }

    #[test]
    fn tx_sends_init_string_as_a_command_frame() {
        let env = Rc::new(EnvBus::new(DbgChannel::Socket, 0));
        let mut wt = WireTransfer::new(env);
        // No channel opened (unit test, no real socket); advance_tx still
        // exercises the state transition even though the write is dropped.
        wt.advance_tx();
        assert_eq!(wt.tx_state, TxState::NextFlowDetermine);
    }

    #[test]
    fn tx_yields_when_no_command_is_pending_then_times_out_to_reinit() {
        let env = Rc::new(EnvBus::new(DbgChannel::Socket, 0));
        let mut wt = WireTransfer::new(env);
        wt.tx_state = TxState::NextFlowDetermine;
        wt.advance_tx();
        assert_eq!(wt.tx_state, TxState::ResponseWait);

        wt.ms_last_received = Instant::now() - Duration::from_millis(600);
        wt.advance_tx();
        assert_eq!(wt.tx_state, TxState::ReInitWait);
        assert!(!wt.env.dev_online());

        wt.ms_start = Instant::now() - Duration::from_millis(1600);
        wt.advance_tx();
        assert_eq!(wt.tx_state, TxState::DbgIfInit);
    }

    #[test]
    fn tx_sends_pending_command_and_releases_slot_after_emit() {
        let env = Rc::new(EnvBus::new(DbgChannel::Socket, 0));
        env.acquire_cmd_out_slot("status".into());
        assert!(!env.cmd_out_slot_free());
        let mut wt = WireTransfer::new(env);
        wt.tx_state = TxState::NextFlowDetermine;
        wt.advance_tx();
        assert!(wt.env.cmd_out_slot_free(), "slot must be released once emitted");
        assert_eq!(wt.last_sent_cmd_id, 1);
    }
}
