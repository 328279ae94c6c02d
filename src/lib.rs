// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

#![crate_name = "lightning_commitments"]

//! The commitment-update core of a Lightning Network payment channel, in library form.
//!
//! This crate implements the state tracking for one funded channel: the `Commitments` value and
//! the operations which mutate it as HTLCs are added, fulfilled, failed, signed for and revoked,
//! together with the construction, signing and verification of the commitment transactions and
//! their second-stage HTLC transactions.
//!
//! There is no networking, no disk access and no chain access here - the user decodes wire
//! messages, drives the operations, persists the resulting state and hands transactions to their
//! own broadcaster. Each operation checks every way it can fail before touching any state, so a
//! returned error always leaves the `Commitments` exactly as it was.

#![forbid(unsafe_code)]

extern crate bitcoin;
#[cfg(test)] extern crate hex;
#[cfg(test)] extern crate rand;

#[macro_use]
pub mod util;
pub mod chain;
pub mod ln;
