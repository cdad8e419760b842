//! Windows pseudo-console backend.

mod conpty;
mod cwd;
mod handles;
mod proc_thread_attr;
mod process_tree;
mod pseudo_console;

pub use conpty::ConPtyProcess;
pub use pseudo_console::{conpty_supported, load_conpty};
