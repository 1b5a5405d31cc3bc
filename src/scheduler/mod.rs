//! Cooperative hierarchical task scheduler. A `TaskNode` tree is ticked
//! depth-first, left-to-right from the root; every concrete component in
//! this crate (the wire transport, TCP listeners, command executors, peer
//! shells, the root application itself) is a `TaskBehavior` plugged into
//! this tree. Each tick walks the tree depth-first, calling `initialize`
//! once per node and then `process` every tick until it reports done.

pub mod task;

pub use task::{
    del_proc, new_root, root_tick, start, tick, with_behavior, with_behavior_mut, DriverMode, Success, TaskBehavior, TaskHandle,
};
