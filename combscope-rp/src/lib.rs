//! # Acquisition server for the Red Pitaya scope
//!
//! Arms the scope, waits for a trigger and streams the
//! samples of both channels around the trigger to a client,
//! one TCP connection per channel and acquisition. A third
//! connection carries the handshake, which also sets the
//! target of an external temperature controller.
//!
//! * registers/memory/control - the FPGA scope core
//! * queue                    - hand over from reader to senders
//! * threads                  - reader, senders and monitoring
//! * handshake                - the control channel
//! * sim                      - a scope without FPGA
//! * api                      - putting it all together
pub mod registers;
pub mod memory;
pub mod control;
pub mod queue;
pub mod handshake;
pub mod sim;
pub mod threads;
pub mod api;

extern crate crossbeam_channel;

#[macro_use] extern crate log;
