#![cfg_attr(not(test), no_std)]

pub mod log;
pub mod testing;

#[doc(hidden)]
pub use paste;

pub use log::{
    LogLevel, netlog_get_level, netlog_is_enabled, netlog_register_backend, netlog_set_level,
};
