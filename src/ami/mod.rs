//! Asterisk Manager Interface.
//!
//! - `block`: parsed protocol units and their header map
//! - `codec`: stateless parsing and request encoding
//! - `relay`: long-lived TCP connection republishing AMI events on the bus

pub mod block;
pub mod codec;
pub mod relay;

pub use block::{AmiBlock, Headers};
pub use codec::{
    build_params, parse_buffer, parse_command_response, split_blocks, ActionArgs, ActionRequest,
    ArgValue,
};
pub use relay::{AmiConfig, AmiRelay};
