//! The process-wide shared state every task reads and writes: incoming
//! device data queued by content ID, the command in/out slot, and channel
//! configuration. Modeled as a single value every task captures an `Rc`
//! handle to at construction, rather than true global state -- the scheduler
//! is single-threaded by contract, so interior mutability (`Cell`/`RefCell`)
//! is enough; no locking.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DbgChannel {
    Tty,
    Socket,
}

/// `dataOut["cmd"]`. `name.is_empty()` is the slot-free handshake.
#[derive(Clone, Debug, Default)]
pub struct CmdOut {
    pub id: u64,
    pub name: String,
}

/// `dataIn["cmd"]`.
#[derive(Clone, Debug, Default)]
pub struct CmdIn {
    pub id: u64,
    pub resp: String,
}

pub struct EnvBus {
    pub dbg_channel: DbgChannel,
    pub dbg_port: u16,
    dev_online: Cell<bool>,
    /// Content-ID keyed FIFOs, including `0xC1` transiently (WireTransfer
    /// pushes a just-reassembled command-response frame here and then
    /// immediately pops it back out to route it into `cmd_in`, matching the
    /// spec's literal "enqueue, then dequeue for special handling" sequence).
    data_in: RefCell<HashMap<u8, VecDeque<String>>>,
    cmd_in: RefCell<CmdIn>,
    cmd_out: RefCell<CmdOut>,
}

impl EnvBus {
    pub fn new(dbg_channel: DbgChannel, dbg_port: u16) -> Self {
        EnvBus {
            dbg_channel,
            dbg_port,
            dev_online: Cell::new(false),
            data_in: RefCell::new(HashMap::new()),
            cmd_in: RefCell::new(CmdIn::default()),
            cmd_out: RefCell::new(CmdOut::default()),
        }
    }

    pub fn dev_online(&self) -> bool {
        self.dev_online.get()
    }

    pub fn set_dev_online(&self, online: bool) {
        self.dev_online.set(online);
    }

    pub fn push_data_in(&self, content_id: u8, payload: String) {
        self.data_in.borrow_mut().entry(content_id).or_default().push_back(payload);
    }

    pub fn pop_data_in(&self, content_id: u8) -> Option<String> {
        self.data_in.borrow_mut().get_mut(&content_id).and_then(VecDeque::pop_front)
    }

    pub fn cmd_in(&self) -> CmdIn {
        self.cmd_in.borrow().clone()
    }

    pub fn set_cmd_in(&self, id: u64, resp: String) {
        *self.cmd_in.borrow_mut() = CmdIn { id, resp };
    }

    pub fn cmd_out(&self) -> CmdOut {
        self.cmd_out.borrow().clone()
    }

    pub fn cmd_out_slot_free(&self) -> bool {
        self.cmd_out.borrow().name.is_empty()
    }

    /// Increments `dataOut["cmd"].id`, writes `name` into the slot, and
    /// returns the freshly-minted id as the caller's correlation token. Only
    /// valid to call when `cmd_out_slot_free()` was just observed true --
    /// the scheduler's single-threaded discipline makes that check-then-act
    /// safe across a single task's own tick.
    pub fn acquire_cmd_out_slot(&self, name: String) -> u64 {
        let mut slot = self.cmd_out.borrow_mut();
        slot.id += 1;
        slot.name = name;
        slot.id
    }

    /// The release handshake: clearing `name` is what lets the next
    /// `CmdExecuting` instance acquire the slot.
    pub fn release_cmd_out_slot(&self) {
        self.cmd_out.borrow_mut().name.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_out_slot_handshake() {
        let env = EnvBus::new(DbgChannel::Tty, 0);
        assert!(env.cmd_out_slot_free());
        let id1 = env.acquire_cmd_out_slot("status".into());
        assert!(!env.cmd_out_slot_free());
        env.release_cmd_out_slot();
        assert!(env.cmd_out_slot_free());
        let id2 = env.acquire_cmd_out_slot("status".into());
        assert!(id2 > id1, "dataOut[cmd].id must be monotonic");
    }

    #[test]
    fn data_in_queues_are_independent_per_content_id() {
        let env = EnvBus::new(DbgChannel::Tty, 0);
        env.push_data_in(0xC0, "log one".into());
        env.push_data_in(0xC2, "snapshot".into());
        env.push_data_in(0xC0, "log two".into());
        assert_eq!(env.pop_data_in(0xC0).as_deref(), Some("log one"));
        assert_eq!(env.pop_data_in(0xC2).as_deref(), Some("snapshot"));
        assert_eq!(env.pop_data_in(0xC0).as_deref(), Some("log two"));
        assert_eq!(env.pop_data_in(0xC0), None);
    }

    #[test]
    fn unknown_content_id_is_still_routed() {
        let env = EnvBus::new(DbgChannel::Tty, 0);
        env.push_data_in(0xAB, "future stream".into());
        assert_eq!(env.pop_data_in(0xAB).as_deref(), Some("future stream"));
    }
}
