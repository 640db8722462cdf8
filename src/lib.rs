//! AMI Gateway - Asterisk Manager Interface bridge and transactional event bus
//!
//! Speaks Asterisk's Manager Interface over AJAM on behalf of REST callers,
//! and republishes domain and AMI events on a message broker with
//! per-unit-of-work delivery.

pub mod ajam;
pub mod ami;
pub mod api;
pub mod bus;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod health;
pub mod utils;
