//! Command modules for the tracefork CLI

pub mod call_tree;
pub mod prestate;
pub mod replay;
pub mod snapshots;

pub use call_tree::call_tree;
pub use prestate::prestate;
pub use replay::{replay, ReplayOptions};
pub use snapshots::snapshots;
