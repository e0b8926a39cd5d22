//! # Commands Module
//!
//! The three CLI entry points, thin glue over the library:
//!
//! ## `send`
//! Offers one or more files for transfer:
//! - Registers a mnemonic transfer name with the relay (retrying on collision)
//! - Prints the name for the human to pass to the receiving side
//! - Runs the sender session and renders its progress hook as a progress bar
//!
//! ## `receive`
//! Fetches a transfer by name:
//! - Joins the room the sender announced
//! - Runs the receiver session into the chosen destination directory
//!
//! ## `relay`
//! Runs the rendezvous relay that pairs senders with receivers and forwards
//! their encrypted traffic without ever reading it.

pub mod receive;
pub mod relay;
pub mod send;
