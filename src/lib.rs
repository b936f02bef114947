#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(unknown_lints)]
#![allow(clippy::collapsible_if)]
#![allow(clippy::comparison_chain)]
#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::uninlined_format_args)]

pub mod common;

pub mod chdir;
pub mod env;
pub mod exec;
pub mod fds;
pub mod flog;
pub mod fork_exec;
pub mod future_feature_flags;
pub mod gil;
pub mod global_safety;
pub mod io;
pub mod job_group;
pub mod null_terminated_array;
pub mod parser;
pub mod proc;
pub mod signal;
pub mod threads;
pub mod wait_handle;
pub mod wchar;

#[cfg(test)]
mod tests;
