// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! High level lightning structs and impls live here.
//!
//! You probably want to create a `commitments::Commitments` (from your channel-opening logic,
//! once the funding transaction has confirmed) and drive it with the decoded wire messages and
//! local commands your node produces.

pub mod chan_utils;
pub mod commitment_spec;
pub mod commitments;
pub mod msgs;

use bitcoin::hashes::Hash;
use bitcoin::hashes::sha256::Hash as Sha256;

/// The hash of the preimage which unlocks a payment: HTLC outputs pay to whoever can present the
/// matching [`PaymentPreimage`].
#[derive(Hash, Copy, Clone, PartialEq, Eq, Debug)]
pub struct PaymentHash(pub [u8; 32]);
/// The "secret key" of a payment: revealing it fulfills the HTLCs locked to its SHA-256 hash.
#[derive(Hash, Copy, Clone, PartialEq, Eq, Debug)]
pub struct PaymentPreimage(pub [u8; 32]);

impl PaymentPreimage {
	/// The payment hash fulfilled by this preimage.
	pub fn payment_hash(&self) -> PaymentHash {
		PaymentHash(Sha256::hash(&self.0).into_inner())
	}
}
