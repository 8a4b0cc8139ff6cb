//! A small preemptive real-time kernel core for single-core 32-bit
//! microcontrollers with an NVIC, a systick-style tick timer, a low-priority
//! switch exception, and a supervisor-call instruction.
//!
//! This crate is architecture-independent. An implementor of [`port::Port`]
//! supplies the context-switch, supervisor-call, and tick-timer glue; see
//! `rtk_port_cortex_m` for an Armv7-M implementation.
#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod critical;
pub mod error;
pub mod event_group;
pub mod kernel;
pub mod list;
pub mod mutex;
pub mod port;
pub mod queue;
pub mod sched;
pub mod semaphore;
pub mod task;
pub mod timer;
pub mod utils;

pub use config::*;
pub use error::{Error, Result};
pub use kernel::Kernel;
pub use port::Port;
pub use task::{TaskAttr, TaskId};
