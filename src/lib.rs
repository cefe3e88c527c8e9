//! Host-side control layer for RMD actuators on a CAN bridge: wire codecs,
//! firmware profiles, the motion guard and the panel event loop.

pub mod bus;
pub mod config;
pub mod error;
pub mod panel;
pub mod rmd;
pub mod session;
pub mod state;
