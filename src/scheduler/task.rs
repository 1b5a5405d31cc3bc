use crate::log;
use crate::log_macros::LogLevel::{LogDebug, LogError, LogWarn};
use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

pub type TaskHandle = Rc<RefCell<TaskNode>>;
pub type TaskWeakHandle = Weak<RefCell<TaskNode>>;

/// Terminal result of a task. `Negative` carries a small diagnostic code; its
/// exact value is meaningful only to the task that produced it and whoever
/// reads `success()` back out (e.g. `PeerCmdCommunicating` distinguishing
/// "ok" from "error" never looks past the variant itself).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Success {
    Pending,
    Positive,
    Negative(i32),
}

impl Success {
    pub fn is_pending(self) -> bool {
        matches!(self, Success::Pending)
    }
}

/// Which tree walk, if any, advances this task. Only `InParentsDriverContext`
/// is exercised by this scheduler; the other two are reserved for subtrees
/// driven by an out-of-band driver this crate does not implement -- the tree
/// walk simply skips them, but the parent still owns them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DriverMode {
    InParentsDriverContext,
    InNewDriverContext,
    InExternalDriverContext,
}

/// The behavior a concrete task plugs into the scheduler. `handle` is this
/// task's own node, passed back in so `initialize`/`process` can call
/// `scheduler::task::start` to adopt children of their own.
pub trait TaskBehavior {
    fn initialize(&mut self, handle: &TaskHandle) -> Success;
    fn process(&mut self, handle: &TaskHandle) -> Success;

    /// Short name for diagnostics only.
    fn label(&self) -> &str {
        "task"
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub struct TaskNode {
    parent: Option<TaskWeakHandle>,
    children: Vec<TaskHandle>,
    success: Success,
    driver_mode: DriverMode,
    init_executed: bool,
    finished: bool,
    exception_occurred: bool,
    level: u32,
    driver_context_level: u32,
    /// `None` only for the duration of a tick call into the behavior itself;
    /// taking it out avoids re-entrant `RefCell` borrows when the behavior
    /// turns around and calls `start`/`del_proc` on this same node.
    behavior: Option<Box<dyn TaskBehavior>>,
}

impl TaskNode {
    pub fn success(&self) -> Success {
        self.success
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn exception_occurred(&self) -> bool {
        self.exception_occurred
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn driver_context_level(&self) -> u32 {
        self.driver_context_level
    }

    pub fn driver_mode(&self) -> DriverMode {
        self.driver_mode
    }

    pub fn children(&self) -> &[TaskHandle] {
        &self.children
    }

    pub fn parent(&self) -> Option<TaskHandle> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }
}

/// Creates the root of a tree, owned by the caller (typically `main`).
pub fn new_root(behavior: Box<dyn TaskBehavior>) -> TaskHandle {
    Rc::new(RefCell::new(TaskNode {
        parent: None,
        children: Vec::new(),
        success: Success::Pending,
        driver_mode: DriverMode::InParentsDriverContext,
        init_executed: false,
        finished: false,
        exception_occurred: false,
        level: 0,
        driver_context_level: 0,
        behavior: Some(behavior),
    }))
}

/// Adopts `behavior` as a new child of `parent`, returning a handle to it.
/// The child is appended to `parent`'s child list, so it ticks last among
/// current siblings and will not be ticked again within the root tick that
/// is currently in progress (the tree walk snapshots children before
/// recursing -- see `tick`).
pub fn start(parent: &TaskHandle, behavior: Box<dyn TaskBehavior>, driver_mode: DriverMode) -> TaskHandle {
    let (level, driver_context_level) = {
        let p = parent.borrow();
        let dcl = match driver_mode {
            DriverMode::InParentsDriverContext => p.driver_context_level,
            DriverMode::InNewDriverContext | DriverMode::InExternalDriverContext => p.driver_context_level + 1,
        };
        (p.level + 1, dcl)
    };
    let label = behavior.label().to_string();
    let child = Rc::new(RefCell::new(TaskNode {
        parent: Some(Rc::downgrade(parent)),
        children: Vec::new(),
        success: Success::Pending,
        driver_mode,
        init_executed: false,
        finished: false,
        exception_occurred: false,
        level,
        driver_context_level,
        behavior: Some(behavior),
    }));
    parent.borrow_mut().children.push(child.clone());
    log!(LogDebug, "started task '{}' at level {}", label, level);
    child
}

/// Removes `child` from `parent`'s child list and recursively destroys its
/// subtree bottom-up, clearing every back-reference along the way. Does
/// nothing but log a CRITICAL DESIGN ERROR if `child` is not actually a
/// child of `parent`.
pub fn del_proc(parent: &TaskHandle, child: &TaskHandle) {
    let idx = parent.borrow().children.iter().position(|c| Rc::ptr_eq(c, child));
    match idx {
        None => {
            log!(
                LogError,
                "CRITICAL DESIGN ERROR: delProc called on a task that is not a child of the receiver"
            );
        }
        Some(i) => {
            parent.borrow_mut().children.remove(i);
            destroy_subtree(child);
        }
    }
}

fn destroy_subtree(node: &TaskHandle) {
    let grandchildren: Vec<TaskHandle> = node.borrow().children.clone();
    for gc in &grandchildren {
        destroy_subtree(gc);
    }
    let mut n = node.borrow_mut();
    n.children.clear();
    n.parent = None;
}

/// Calls `f` with a shared reference to the concrete behavior stored in
/// `handle`, if it is of type `T`. Used by parents that need to read state
/// back out of a child (e.g. `PeerCmdCommunicating` reading a finished
/// `CmdExecuting`'s response).
pub fn with_behavior<T: 'static, R>(handle: &TaskHandle, f: impl FnOnce(&T) -> R) -> Option<R> {
    let node = handle.borrow();
    node.behavior.as_ref()?.as_any().downcast_ref::<T>().map(f)
}

/// Mutable counterpart of `with_behavior`, for callers that need to drive a
/// child's own API directly (e.g. the root application popping accepted
/// peers out of a `TcpListening` child) rather than only reading state back.
pub fn with_behavior_mut<T: 'static, R>(handle: &TaskHandle, f: impl FnOnce(&mut T) -> R) -> Option<R> {
    let mut node = handle.borrow_mut();
    node.behavior.as_mut()?.as_any_mut().downcast_mut::<T>().map(f)
}

/// Depth-first, left-to-right tree walk. Children tick before their parent;
/// a task started during this tick (via `start`) is appended to its new
/// parent's child list but, because we snapshot children before recursing,
/// will not itself be ticked until the *next* root tick.
///
/// Exposed directly (not only via `root_tick`) so callers -- and tests --
/// that hold their own tree and don't want it coupled to the process-wide
/// root singleton can drive it without touching that global state.
pub fn tick(handle: &TaskHandle) {
    let snapshot: Vec<TaskHandle> = handle.borrow().children.clone();
    for child in &snapshot {
        let should_tick = {
            let c = child.borrow();
            c.driver_mode == DriverMode::InParentsDriverContext && !c.finished && !c.exception_occurred
        };
        if should_tick {
            tick(child);
        }
    }

    let (finished, exception_occurred) = {
        let n = handle.borrow();
        (n.finished, n.exception_occurred)
    };
    if finished || exception_occurred {
        return;
    }

    let init_executed = handle.borrow().init_executed;
    let mut behavior = handle
        .borrow_mut()
        .behavior
        .take()
        .expect("task behavior missing mid-tick (re-entrant tick?)");
    let label = behavior.label().to_string();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        if init_executed {
            behavior.process(handle)
        } else {
            behavior.initialize(handle)
        }
    }));

    handle.borrow_mut().behavior = Some(behavior);

    match result {
        Err(_) => {
            log!(LogError, "unexpected failure in task '{}', marking it inert", label);
            handle.borrow_mut().exception_occurred = true;
        }
        Ok(Success::Pending) => {}
        Ok(v) => {
            if !init_executed {
                if v == Success::Positive {
                    handle.borrow_mut().init_executed = true;
                } else {
                    finish(handle, v);
                }
            } else {
                finish(handle, v);
            }
        }
    }
}

fn finish(handle: &TaskHandle, v: Success) {
    let mut n = handle.borrow_mut();
    if n.finished {
        return;
    }
    n.success = v;
    n.finished = true;
}

thread_local! {
    /// The first task ever handed to `root_tick` becomes, and remains, the
    /// tree root for the lifetime of the process. `Rc`/`RefCell` are `!Sync`
    /// by design, so this lives in a `thread_local!` rather than a
    /// `lazy_static!`/`Mutex` global -- the scheduler is single-threaded by
    /// contract, so a thread-local *is* process-wide state.
    static ROOT: RefCell<Option<TaskWeakHandle>> = RefCell::new(None);
}

/// Drives one tick of the tree rooted at the first handle ever passed in.
/// Subsequent calls may pass any handle; only the first call's handle is
/// used to seed the singleton.
pub fn root_tick(candidate: &TaskHandle) {
    ROOT.with(|r| {
        let mut r = r.borrow_mut();
        if r.is_none() {
            *r = Some(Rc::downgrade(candidate));
        }
    });
    let root = ROOT.with(|r| r.borrow().as_ref().and_then(Weak::upgrade));
    if let Some(root) = root {
        tick(&root);
    } else {
        log!(LogWarn, "root_tick called with no live root task");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc as StdRc;

    struct CountingBehavior {
        init_calls: StdRc<Cell<u32>>,
        process_calls: StdRc<Cell<u32>>,
        init_result: Success,
        process_result: Success,
    }

    impl TaskBehavior for CountingBehavior {
        fn initialize(&mut self, _handle: &TaskHandle) -> Success {
            self.init_calls.set(self.init_calls.get() + 1);
            self.init_result
        }
        fn process(&mut self, _handle: &TaskHandle) -> Success {
            self.process_calls.set(self.process_calls.get() + 1);
            self.process_result
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn fresh_root() -> TaskHandle {
        // Each test gets its own root; the thread-local singleton is only
        // ever seeded once per *thread*, so tests that care about root_tick
        // semantics drive `tick` indirectly through a throwaway root and
        // never rely on a previously-seeded singleton from another test.
        new_root(Box::new(CountingBehavior {
            init_calls: StdRc::new(Cell::new(0)),
            process_calls: StdRc::new(Cell::new(0)),
            init_result: Success::Positive,
            process_result: Success::Pending,
        }))
    }

    #[test]
    fn initialize_then_process_on_separate_ticks() {
        let init_calls = StdRc::new(Cell::new(0));
        let process_calls = StdRc::new(Cell::new(0));
        let root = new_root(Box::new(CountingBehavior {
            init_calls: init_calls.clone(),
            process_calls: process_calls.clone(),
            init_result: Success::Positive,
            process_result: Success::Pending,
        }));

        tick(&root);
        assert_eq!(init_calls.get(), 1);
        assert_eq!(process_calls.get(), 0);
        assert!(!root.borrow().is_finished());

        tick(&root);
        assert_eq!(init_calls.get(), 1);
        assert_eq!(process_calls.get(), 1);
    }

    #[test]
    fn negative_initialize_finishes_without_process() {
        let init_calls = StdRc::new(Cell::new(0));
        let process_calls = StdRc::new(Cell::new(0));
        let root = new_root(Box::new(CountingBehavior {
            init_calls: init_calls.clone(),
            process_calls: process_calls.clone(),
            init_result: Success::Negative(-7),
            process_result: Success::Pending,
        }));

        tick(&root);
        assert_eq!(init_calls.get(), 1);
        assert!(root.borrow().is_finished());
        assert_eq!(root.borrow().success(), Success::Negative(-7));

        tick(&root);
        assert_eq!(process_calls.get(), 0, "finished task must never tick again");
    }

    #[test]
    fn children_tick_before_parent_and_preserve_order() {
        let order: StdRc<RefCell<Vec<&'static str>>> = StdRc::new(RefCell::new(Vec::new()));

        struct Recorder {
            name: &'static str,
            order: StdRc<RefCell<Vec<&'static str>>>,
        }
        impl TaskBehavior for Recorder {
            fn initialize(&mut self, _h: &TaskHandle) -> Success {
                self.order.borrow_mut().push(self.name);
                Success::Positive
            }
            fn process(&mut self, _h: &TaskHandle) -> Success {
                self.order.borrow_mut().push(self.name);
                Success::Pending
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }
        }

        let root = new_root(Box::new(Recorder {
            name: "root",
            order: order.clone(),
        }));
        let first = start(
            &root,
            Box::new(Recorder {
                name: "first",
                order: order.clone(),
            }),
            DriverMode::InParentsDriverContext,
        );
        let second = start(
            &root,
            Box::new(Recorder {
                name: "second",
                order: order.clone(),
            }),
            DriverMode::InParentsDriverContext,
        );

        // `start` was called from test code, not from root's own
        // initialize/process, so both children already exist before the
        // first tick and both tick within it, in insertion order.
        tick(&root);
        assert_eq!(*order.borrow(), vec!["first", "second", "root"]);
        let _ = (first, second);
    }

    #[test]
    fn task_started_during_a_tick_does_not_tick_in_that_same_root_tick() {
        let order: StdRc<RefCell<Vec<&'static str>>> = StdRc::new(RefCell::new(Vec::new()));

        struct ChildRecorder {
            name: &'static str,
            order: StdRc<RefCell<Vec<&'static str>>>,
        }
        impl TaskBehavior for ChildRecorder {
            fn initialize(&mut self, _h: &TaskHandle) -> Success {
                self.order.borrow_mut().push(self.name);
                Success::Positive
            }
            fn process(&mut self, _h: &TaskHandle) -> Success {
                self.order.borrow_mut().push(self.name);
                Success::Pending
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }
        }

        struct Spawner {
            order: StdRc<RefCell<Vec<&'static str>>>,
            spawned: bool,
        }
        impl TaskBehavior for Spawner {
            fn initialize(&mut self, handle: &TaskHandle) -> Success {
                self.order.borrow_mut().push("root-init");
                if !self.spawned {
                    self.spawned = true;
                    start(
                        handle,
                        Box::new(ChildRecorder {
                            name: "late-child",
                            order: self.order.clone(),
                        }),
                        DriverMode::InParentsDriverContext,
                    );
                }
                Success::Pending
            }
            fn process(&mut self, _handle: &TaskHandle) -> Success {
                self.order.borrow_mut().push("root-process");
                Success::Pending
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }
        }

        let root = new_root(Box::new(Spawner {
            order: order.clone(),
            spawned: false,
        }));

        tick(&root);
        assert_eq!(*order.borrow(), vec!["root-init"], "late child must not tick this round");
        assert_eq!(root.borrow().children().len(), 1);

        order.borrow_mut().clear();
        tick(&root);
        assert_eq!(*order.borrow(), vec!["late-child", "root-process"]);
    }

    #[test]
    fn del_proc_on_non_child_is_a_noop() {
        let root = fresh_root();
        let other_root = fresh_root();
        del_proc(&root, &other_root);
        assert_eq!(root.borrow().children().len(), 0);
    }

    #[test]
    fn del_proc_removes_and_clears_parent_back_reference() {
        let root = fresh_root();
        let child = start(
            &root,
            Box::new(CountingBehavior {
                init_calls: StdRc::new(Cell::new(0)),
                process_calls: StdRc::new(Cell::new(0)),
                init_result: Success::Positive,
                process_result: Success::Pending,
            }),
            DriverMode::InParentsDriverContext,
        );
        assert_eq!(root.borrow().children().len(), 1);
        del_proc(&root, &child);
        assert_eq!(root.borrow().children().len(), 0);
        assert!(child.borrow().parent().is_none());
    }

    #[test]
    fn exception_marks_task_inert_without_unwinding_the_walk() {
        struct Panicker;
        impl TaskBehavior for Panicker {
            fn initialize(&mut self, _h: &TaskHandle) -> Success {
                Success::Positive
            }
            fn process(&mut self, _h: &TaskHandle) -> Success {
                panic!("boom");
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }
        }
        let root = new_root(Box::new(Panicker));
        tick(&root); // initialize
        let prev_hook = panic::take_hook();
        panic::set_hook(Box::new(|_| {}));
        tick(&root); // process, panics, caught
        panic::set_hook(prev_hook);
        assert!(root.borrow().exception_occurred());
        assert!(!root.borrow().is_finished());
    }

    #[test]
    fn with_behavior_reads_concrete_state_back_out() {
        struct HoldsValue(i32);
        impl TaskBehavior for HoldsValue {
            fn initialize(&mut self, _h: &TaskHandle) -> Success {
                Success::Positive
            }
            fn process(&mut self, _h: &TaskHandle) -> Success {
                Success::Pending
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }
        }
        let root = new_root(Box::new(HoldsValue(42)));
        let value = with_behavior::<HoldsValue, i32>(&root, |h| h.0);
        assert_eq!(value, Some(42));
    }
}
