//! Per-peer command shell. One instance per TCP client accepted on the
//! command port; started by `SwartDebugging` and never restarted once it
//! finishes.

use crate::cmd_executing::CmdExecuting;
use crate::env_bus::EnvBus;
use crate::log;
use crate::log_macros::LogLevel::LogDebug;
use crate::scheduler::{self, DriverMode, Success, TaskBehavior, TaskHandle};
use std::any::Any;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::rc::Rc;

const PROMPT: &[u8] = b"# ";
const RECV_CHUNK: usize = 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    CmdReceive,
    CmdWait,
}

/// Outcome of a single non-blocking recv attempt.
enum RecvOutcome {
    WouldBlock,
    Closed,
    Got,
}

pub struct PeerCmdCommunicating {
    env: Rc<EnvBus>,
    stream: TcpStream,
    /// Bytes received but not yet resolved into a complete line. Unlike a
    /// plain `recv` that drops whatever didn't fit a single read, this
    /// survives across ticks so a line split by the kernel across two
    /// non-blocking reads is never silently truncated.
    recv_buf: String,
    state: State,
    last_cmd: String,
    pending: Option<TaskHandle>,
}

impl PeerCmdCommunicating {
    pub fn new(env: Rc<EnvBus>, stream: TcpStream) -> io::Result<PeerCmdCommunicating> {
        Ok(PeerCmdCommunicating {
            env,
            stream,
            recv_buf: String::new(),
            state: State::CmdReceive,
            last_cmd: String::new(),
            pending: None,
        })
    }

    /// Pulls one `recv` worth of bytes off the socket into `recv_buf`.
    fn recv_more(&mut self) -> RecvOutcome {
        let mut buf = [0u8; RECV_CHUNK];
        match self.stream.read(&mut buf) {
            Ok(0) => RecvOutcome::Closed,
            Ok(n) => {
                self.recv_buf.push_str(&String::from_utf8_lossy(&buf[..n]));
                RecvOutcome::Got
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => RecvOutcome::WouldBlock,
            Err(_) => RecvOutcome::Closed,
        }
    }

    /// Pops one complete, whitespace-trimmed line out of `recv_buf`, if any.
    fn take_line(&mut self) -> Option<String> {
        let pos = self.recv_buf.find('\n')?;
        let raw: String = self.recv_buf.drain(..=pos).collect();
        Some(raw.trim_end().to_string())
    }

    fn write_all(&mut self, bytes: &[u8]) -> bool {
        self.stream.write_all(bytes).is_ok()
    }
}

impl TaskBehavior for PeerCmdCommunicating {
    fn initialize(&mut self, _handle: &TaskHandle) -> Success {
        if self.write_all(PROMPT) {
            Success::Positive
        } else {
            Success::Negative(-1)
        }
    }

    fn process(&mut self, handle: &TaskHandle) -> Success {
        match self.state {
            State::CmdReceive => {
                let line = match self.take_line() {
                    Some(line) => Some(line),
                    None => match self.recv_more() {
                        RecvOutcome::WouldBlock => None,
                        RecvOutcome::Closed => return Success::Positive,
                        RecvOutcome::Got => self.take_line(),
                    },
                };
                match line {
                    None => Success::Pending,
                    Some(line) => {
                        let cmd = if line.is_empty() { self.last_cmd.clone() } else { line };
                        if cmd.is_empty() {
                            // Empty line, no prior command to repeat: just reprompt.
                            return if self.write_all(PROMPT) {
                                Success::Pending
                            } else {
                                Success::Negative(-2)
                            };
                        }
                        self.last_cmd = cmd.clone();
                        log!(LogDebug, "peer command: {}", cmd);

                        let mut executing = CmdExecuting::new(self.env.clone());
                        executing.cmd_set(cmd);
                        let child = scheduler::start(handle, Box::new(executing), DriverMode::InParentsDriverContext);
                        self.pending = Some(child);
                        self.state = State::CmdWait;
                        Success::Pending
                    }
                }
            }
            State::CmdWait => {
                let child = match self.pending.clone() {
                    Some(c) => c,
                    None => {
                        self.state = State::CmdReceive;
                        return Success::Pending;
                    }
                };
                if !child.borrow().is_finished() {
                    return Success::Pending;
                }

                let outcome = child.borrow().success();
                let ok = match outcome {
                    Success::Positive => {
                        let resp = scheduler::with_behavior::<CmdExecuting, String>(&child, |c| c.resp().to_string())
                            .unwrap_or_default();
                        let mut out = resp;
                        out.push('\n');
                        self.write_all(out.as_bytes())
                    }
                    _ => self.write_all(b"Error executing command\n"),
                };

                // Fixes a known defect in the original: a finished CmdExecuting
                // left attached here forever, leaking one node per command.
                scheduler::del_proc(handle, &child);
                self.pending = None;
                self.state = State::CmdReceive;

                if ok && self.write_all(PROMPT) {
                    Success::Pending
                } else {
                    Success::Negative(-2)
                }
            }
        }
    }

    fn label(&self) -> &str {
        "peer_cmd_communicating"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
