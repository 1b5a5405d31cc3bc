//! The root application task: owns the wire transport and the three TCP
//! listeners, and fans device data out to whatever peers are currently
//! connected. Never finishes on its own.

use crate::env_bus::EnvBus;
use crate::log;
use crate::log_macros::LogLevel::LogDebug;
use crate::peer_cmd_communicating::PeerCmdCommunicating;
use crate::scheduler::{self, DriverMode, Success, TaskBehavior, TaskHandle};
use crate::tcp_listening::TcpListening;
use crate::wire_transfer::{CONTENT_LOG, CONTENT_PROC_TREE};
use crate::wire_transfer::WireTransfer;
use std::any::Any;
use std::io::Write;
use std::net::TcpStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

const PORT_LOG: u16 = 3000;
const PORT_PROC_TREE: u16 = 3001;
const PORT_CMD: u16 = 3002;
const PROC_TREE_RATE_LIMIT: Duration = Duration::from_millis(50);

const ANSI_CLEAR_HOME: &str = "\u{1b}[2J\u{1b}[H";

pub struct SwartDebugging {
    env: Rc<EnvBus>,
    log_peers: Vec<TcpStream>,
    proc_peers: Vec<TcpStream>,
    last_proc_snapshot: Option<String>,
    /// `None` until the first snapshot has gone out; the rate limit never
    /// holds back that first send (the original's `procTreeUpdated` flag
    /// starts `false` for the same reason).
    last_proc_update: Option<Instant>,
    log_listener: Option<TaskHandle>,
    proc_listener: Option<TaskHandle>,
    cmd_listener: Option<TaskHandle>,
}

impl SwartDebugging {
    pub fn new(env: Rc<EnvBus>) -> SwartDebugging {
        SwartDebugging {
            env,
            log_peers: Vec::new(),
            proc_peers: Vec::new(),
            last_proc_snapshot: None,
            last_proc_update: None,
            log_listener: None,
            proc_listener: None,
            cmd_listener: None,
        }
    }

    fn fan_out_log(&mut self) {
        if let Some(item) = self.env.pop_data_in(CONTENT_LOG) {
            let mut line = item;
            line.push('\n');
            self.log_peers.retain_mut(|peer| peer.write_all(line.as_bytes()).is_ok());
        }
    }

    fn fan_out_proc_tree(&mut self) {
        if let Some(item) = self.env.pop_data_in(CONTENT_PROC_TREE) {
            let is_new = self.last_proc_snapshot.as_deref() != Some(item.as_str());
            let rate_ok = self.last_proc_update.map_or(true, |t| t.elapsed() >= PROC_TREE_RATE_LIMIT);
            if is_new && rate_ok {
                let framed = format!("{}Process tree size: {}\n\n{}", ANSI_CLEAR_HOME, item.len(), item);
                self.proc_peers.retain_mut(|peer| peer.write_all(framed.as_bytes()).is_ok());
                self.last_proc_snapshot = Some(item);
                self.last_proc_update = Some(Instant::now());
            }
        }
    }

    /// Drains every currently accepted connection out of a listener child,
    /// returning an owned `Vec` so callers are free to mutate other `self`
    /// fields afterwards without holding a borrow through the `with_behavior_mut` call.
    fn drain_accepted(listener: &TaskHandle) -> Vec<TcpStream> {
        scheduler::with_behavior_mut::<TcpListening, Vec<TcpStream>>(listener, |l| {
            let mut peers = Vec::new();
            while let Some((peer, _addr)) = l.peer_get() {
                peers.push(peer);
            }
            peers
        })
        .unwrap_or_default()
    }

    fn accept_new_peers(&mut self) {
        if let Some(listener) = self.log_listener.clone() {
            self.log_peers.extend(Self::drain_accepted(&listener));
        }
        if let Some(listener) = self.proc_listener.clone() {
            for mut peer in Self::drain_accepted(&listener) {
                if let Some(snap) = self.last_proc_snapshot.as_ref() {
                    let framed = format!("{}Process tree size: {}\n\n{}", ANSI_CLEAR_HOME, snap.len(), snap);
                    let _ = peer.write_all(framed.as_bytes());
                }
                self.proc_peers.push(peer);
            }
        }
    }

    fn spawn_cmd_shell(&mut self, handle: &TaskHandle) {
        let listener = match self.cmd_listener.clone() {
            Some(l) => l,
            None => return,
        };
        // Only one peer per tick -- unlike the log and proc-tree ports,
        // extra queued connections stay queued.
        let accepted = scheduler::with_behavior_mut::<TcpListening, Option<(TcpStream, std::net::SocketAddr)>>(&listener, |l| {
            l.peer_get()
        })
        .flatten()
        .map(|(stream, _addr)| stream);

        if let Some(stream) = accepted {
            if let Err(e) = stream.set_nonblocking(true) {
                log!(LogDebug, "failed to set command peer non-blocking: {}", e);
                return;
            }
            match PeerCmdCommunicating::new(self.env.clone(), stream) {
                Ok(peer) => {
                    scheduler::start(handle, Box::new(peer), DriverMode::InParentsDriverContext);
                }
                Err(e) => log!(LogDebug, "failed to accept command peer: {}", e),
            }
        }
    }
}

impl TaskBehavior for SwartDebugging {
    fn initialize(&mut self, handle: &TaskHandle) -> Success {
        scheduler::start(handle, Box::new(WireTransfer::new(self.env.clone())), DriverMode::InParentsDriverContext);
        let log_listener = scheduler::start(handle, Box::new(TcpListening::new(PORT_LOG)), DriverMode::InParentsDriverContext);
        let proc_listener = scheduler::start(handle, Box::new(TcpListening::new(PORT_PROC_TREE)), DriverMode::InParentsDriverContext);
        let cmd_listener = scheduler::start(handle, Box::new(TcpListening::new(PORT_CMD)), DriverMode::InParentsDriverContext);

        self.log_listener = Some(log_listener);
        self.proc_listener = Some(proc_listener);
        self.cmd_listener = Some(cmd_listener);
        Success::Positive
    }

    fn process(&mut self, handle: &TaskHandle) -> Success {
        self.fan_out_log();
        self.fan_out_proc_tree();
        self.accept_new_peers();
        self.spawn_cmd_shell(handle);
        Success::Pending
    }

    fn label(&self) -> &str {
        "swart_debugging"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
