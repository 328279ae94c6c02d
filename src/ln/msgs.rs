// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Wire messages, as consumed and produced by the commitment engine.
//!
//! The byte-level codec for the peer protocol lives outside this crate - everything here is the
//! decoded form. Messages which sit in the pending-change pipeline (and thus get persisted as
//! part of the channel state) additionally implement Writeable/Readable.

use bitcoin::secp256k1::key::PublicKey;
use bitcoin::secp256k1::Signature;

use ln::{PaymentHash, PaymentPreimage};
use util::ser::{Readable, Writeable, Writer};

use std::error::Error;
use std::fmt;
use std::io::Read;

/// An error in decoding a message or struct.
#[derive(Debug)]
pub enum DecodeError {
	/// A length descriptor in the packet didn't describe the later data correctly
	BadLengthDescriptor,
	/// Value was invalid, eg a byte which was supposed to be a bool was something other than a 0
	/// or 1, a public key/private key/signature was invalid, etc
	InvalidValue,
	/// Buffer too short
	ShortRead,
	/// Error from std::io
	Io(::std::io::Error),
}

impl fmt::Display for DecodeError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(match *self {
			DecodeError::BadLengthDescriptor => "A length descriptor in the packet didn't describe the later data correctly",
			DecodeError::InvalidValue => "Value was invalid",
			DecodeError::ShortRead => "Packet extended beyond the provided bytes",
			DecodeError::Io(_) => "I/O error reading data",
		})
	}
}

impl Error for DecodeError {
	fn description(&self) -> &str {
		match *self {
			DecodeError::BadLengthDescriptor => "A length descriptor in the packet didn't describe the later data correctly",
			DecodeError::InvalidValue => "Value was invalid",
			DecodeError::ShortRead => "Packet extended beyond the provided bytes",
			DecodeError::Io(_) => "I/O error reading data",
		}
	}
}

impl From<::std::io::Error> for DecodeError {
	fn from(e: ::std::io::Error) -> Self {
		if e.kind() == ::std::io::ErrorKind::UnexpectedEof {
			DecodeError::ShortRead
		} else {
			DecodeError::Io(e)
		}
	}
}

/// An onion routing packet, built and interpreted by the router which sits above this crate. The
/// commitment engine carries it through the pipeline without looking inside.
#[derive(Clone, PartialEq)]
pub struct OnionPacket {
	/// The opaque onion payload
	pub data: Vec<u8>,
}

/// The reason an HTLC was failed, encrypted back along the route. Opaque at this layer.
#[derive(Clone, PartialEq)]
pub struct OnionErrorPacket {
	/// The opaque failure payload
	pub data: Vec<u8>,
}

/// An open_channel message, as received by the channel-opening logic which sits above this crate.
/// Only the parameter-validation step is provided here (see commitments::validate_open_channel).
pub struct OpenChannel {
	/// The channel id the funder selected
	pub temporary_channel_id: u64,
	/// The channel value, in satoshis
	pub funding_satoshis: u64,
	/// The amount pushed to the fundee as part of the open, in milli-satoshis
	pub push_msat: u64,
	/// Outputs below this value, in satoshis, are omitted from the funder's commitment transaction
	pub dust_limit_satoshis: u64,
	/// The minimum balance, in satoshis, the fundee must keep on their side
	pub channel_reserve_satoshis: u64,
	/// The smallest HTLC, in milli-satoshis, the funder will accept
	pub htlc_minimum_msat: u64,
	/// The feerate, in satoshis per 1000-weight, for the commitment transactions
	pub feerate_per_kw: u32,
	/// The number of blocks the fundee's to_local outputs must be delayed
	pub to_self_delay: u16,
	/// The funder's key in the 2-of-2 funding output
	pub funding_pubkey: PublicKey,
	/// The base point from which the funder's per-commitment revocation keys are derived
	pub revocation_basepoint: PublicKey,
	/// The base point from which the funder's per-commitment payment keys are derived
	pub payment_basepoint: PublicKey,
	/// The base point from which the funder's per-commitment delayed payment keys are derived
	pub delayed_payment_basepoint: PublicKey,
	/// The per-commitment point for the funder's first commitment transaction
	pub first_per_commitment_point: PublicKey,
}

/// An update_add_htlc message: the sender offers a new HTLC
#[derive(Clone, PartialEq)]
pub struct UpdateAddHTLC {
	/// The channel the HTLC is offered on
	pub channel_id: u64,
	/// The sender-assigned HTLC id, dense and strictly increasing per sender
	pub htlc_id: u64,
	/// The HTLC value, in milli-satoshis
	pub amount_msat: u64,
	/// The hash the HTLC is locked to
	pub payment_hash: PaymentHash,
	/// The block height at which the HTLC expires back to the sender
	pub cltv_expiry: u32,
	/// The routing onion for the next hop
	pub onion_routing_packet: OnionPacket,
}

/// An update_fulfill_htlc message: the recipient of an HTLC reveals its preimage
#[derive(Clone, PartialEq)]
pub struct UpdateFulfillHTLC {
	/// The channel the HTLC sits on
	pub channel_id: u64,
	/// The id the HTLC's sender assigned it
	pub htlc_id: u64,
	/// The preimage of the HTLC's payment hash
	pub payment_preimage: PaymentPreimage,
}

/// An update_fail_htlc message: the recipient of an HTLC gives it back
#[derive(Clone, PartialEq)]
pub struct UpdateFailHTLC {
	/// The channel the HTLC sits on
	pub channel_id: u64,
	/// The id the HTLC's sender assigned it
	pub htlc_id: u64,
	/// The (encrypted) reason the HTLC was failed
	pub reason: OnionErrorPacket,
}

/// A commitment_signed message: signatures for the remote peer's next commitment transaction and
/// each of its HTLC transactions, in the canonical output-index order.
#[derive(Clone)]
pub struct CommitmentSigned {
	/// The channel being signed for
	pub channel_id: u64,
	/// The signature on the new commitment transaction
	pub signature: Signature,
	/// Signatures on the new commitment's HTLC-timeout/HTLC-success transactions, sorted by the
	/// commitment output each spends
	pub htlc_signatures: Vec<Signature>,
}

/// A revoke_and_ack message: reveals the secret which revokes the sender's previous commitment
/// transaction and supplies the point for the one after the newly-signed one.
#[derive(Clone)]
pub struct RevokeAndACK {
	/// The channel being revoked on
	pub channel_id: u64,
	/// The per-commitment secret of the sender's now-revoked commitment transaction
	pub per_commitment_secret: [u8; 32],
	/// The per-commitment point for the commitment transaction after the one just signed
	pub next_per_commitment_point: PublicKey,
	/// The sender's signatures on its own new HTLC-timeout transactions, letting the recipient
	/// claim the matching outputs once the timeouts pass
	pub htlc_timeout_signatures: Vec<Signature>,
}

/// An error message, fatal to the channel it names
pub struct ErrorMessage {
	/// The channel being torn down
	pub channel_id: u64,
	/// A human-readable description of the error
	pub data: String,
}

impl Writeable for OnionPacket {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		self.data.write(w)
	}
}
impl Readable for OnionPacket {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(OnionPacket { data: Readable::read(r)? })
	}
}

impl Writeable for OnionErrorPacket {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		self.data.write(w)
	}
}
impl Readable for OnionErrorPacket {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(OnionErrorPacket { data: Readable::read(r)? })
	}
}

impl_writeable!(UpdateAddHTLC, 8+8+8+32+4, {
	channel_id,
	htlc_id,
	amount_msat,
	payment_hash,
	cltv_expiry,
	onion_routing_packet
});

impl_writeable!(UpdateFulfillHTLC, 8+8+32, {
	channel_id,
	htlc_id,
	payment_preimage
});

impl_writeable!(UpdateFailHTLC, 8+8, {
	channel_id,
	htlc_id,
	reason
});
