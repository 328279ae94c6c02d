// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The balance-and-HTLC snapshot a commitment transaction encodes, and the fold which projects a
//! new snapshot from a base one plus a run of update messages.

use ln::msgs;
use ln::msgs::DecodeError;
use ln::commitments::ChannelError;
use util::ser::{Readable, Writeable, Writer};

use std::io::Read;

/// The direction of an HTLC relative to the holder of the spec it sits in.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HTLCDirection {
	/// The spec's holder offered this HTLC and is paying
	Outbound,
	/// The spec's holder is on the receiving end
	Inbound,
}

/// An HTLC tagged with its direction. Note that direction is always relative to the side whose
/// spec this is: an HTLC we offer is Outbound in our spec and Inbound in the counterparty's.
#[derive(Clone, PartialEq)]
pub struct DirectedHTLC {
	/// Whether the spec's holder is paying or being paid
	pub direction: HTLCDirection,
	/// The update_add_htlc which created this HTLC
	pub add: msgs::UpdateAddHTLC,
}

/// One of the three update messages which can sit in the pending-change pipeline.
#[derive(Clone, PartialEq)]
pub enum UpdateMessage {
	/// An HTLC being offered
	Add(msgs::UpdateAddHTLC),
	/// An HTLC being settled with its preimage
	Fulfill(msgs::UpdateFulfillHTLC),
	/// An HTLC being given back unfulfilled
	Fail(msgs::UpdateFailHTLC),
}

/// The full state a commitment transaction commits to: the plain balances on each side, the
/// in-flight HTLCs, and the feerate the transaction pays.
///
/// Balances are signed: while a change pipeline is being folded in, one side can transiently
/// show a deficit, which the funds checks in the engine then reject.
#[derive(Clone, PartialEq)]
pub struct CommitmentSpec {
	/// The feerate, in satoshis per 1000-weight, of the commitment transaction
	pub feerate_per_kw: u64,
	/// The holder's plain balance, in milli-satoshis, excluding in-flight HTLCs
	pub to_local_msat: i64,
	/// The counterparty's plain balance, in milli-satoshis, excluding in-flight HTLCs
	pub to_remote_msat: i64,
	/// The in-flight HTLCs, in the order they were irrevocably added
	pub htlcs: Vec<DirectedHTLC>,
}

impl CommitmentSpec {
	/// The sum of both balances and every in-flight HTLC - constant for the life of the channel.
	pub fn total_funds_msat(&self) -> i64 {
		self.to_local_msat + self.to_remote_msat + self.htlcs.iter().map(|htlc| htlc.add.amount_msat as i64).sum::<i64>()
	}

	fn add_htlc(&mut self, direction: HTLCDirection, add: &msgs::UpdateAddHTLC) {
		match direction {
			HTLCDirection::Outbound => self.to_local_msat -= add.amount_msat as i64,
			HTLCDirection::Inbound => self.to_remote_msat -= add.amount_msat as i64,
		}
		self.htlcs.push(DirectedHTLC { direction, add: add.clone() });
	}

	/// Removes the fulfilled HTLC and credits its amount to the payee. The direction given is
	/// that of the HTLC being settled, ie the opposite side from whoever sent the fulfill.
	fn fulfill_htlc(&mut self, direction: HTLCDirection, htlc_id: u64) -> Result<(), ChannelError> {
		match self.htlcs.iter().position(|htlc| htlc.direction == direction && htlc.add.htlc_id == htlc_id) {
			Some(pos) => {
				let htlc = self.htlcs.remove(pos);
				match direction {
					// An inbound HTLC we fulfilled pays us
					HTLCDirection::Inbound => self.to_local_msat += htlc.add.amount_msat as i64,
					HTLCDirection::Outbound => self.to_remote_msat += htlc.add.amount_msat as i64,
				}
				Ok(())
			},
			None => Err(ChannelError::UnknownHtlc(htlc_id)),
		}
	}

	/// Removes the failed HTLC and refunds its amount to the payer.
	fn fail_htlc(&mut self, direction: HTLCDirection, htlc_id: u64) -> Result<(), ChannelError> {
		match self.htlcs.iter().position(|htlc| htlc.direction == direction && htlc.add.htlc_id == htlc_id) {
			Some(pos) => {
				let htlc = self.htlcs.remove(pos);
				match direction {
					// An inbound HTLC which failed goes back to its sender
					HTLCDirection::Inbound => self.to_remote_msat += htlc.add.amount_msat as i64,
					HTLCDirection::Outbound => self.to_local_msat += htlc.add.amount_msat as i64,
				}
				Ok(())
			},
			None => Err(ChannelError::UnknownHtlc(htlc_id)),
		}
	}

	/// Folds a run of update messages into this spec, producing the spec of the next commitment
	/// transaction. our_changes are the messages sent by the side holding this spec,
	/// their_changes the ones it received. Deterministic and order-sensitive; errs if a fulfill
	/// or fail references an HTLC id not in flight.
	pub fn reduce(&self, our_changes: &[UpdateMessage], their_changes: &[UpdateMessage]) -> Result<CommitmentSpec, ChannelError> {
		let mut spec = self.clone();
		// Adds first: a change run may settle an HTLC whose add is folded in by the same run.
		for change in our_changes.iter() {
			if let &UpdateMessage::Add(ref add) = change {
				spec.add_htlc(HTLCDirection::Outbound, add);
			}
		}
		for change in their_changes.iter() {
			if let &UpdateMessage::Add(ref add) = change {
				spec.add_htlc(HTLCDirection::Inbound, add);
			}
		}
		for change in our_changes.iter() {
			match change {
				// We can only settle HTLCs offered to us
				&UpdateMessage::Fulfill(ref fulfill) => spec.fulfill_htlc(HTLCDirection::Inbound, fulfill.htlc_id)?,
				&UpdateMessage::Fail(ref fail) => spec.fail_htlc(HTLCDirection::Inbound, fail.htlc_id)?,
				&UpdateMessage::Add(_) => {},
			}
		}
		for change in their_changes.iter() {
			match change {
				&UpdateMessage::Fulfill(ref fulfill) => spec.fulfill_htlc(HTLCDirection::Outbound, fulfill.htlc_id)?,
				&UpdateMessage::Fail(ref fail) => spec.fail_htlc(HTLCDirection::Outbound, fail.htlc_id)?,
				&UpdateMessage::Add(_) => {},
			}
		}
		Ok(spec)
	}
}

impl Writeable for DirectedHTLC {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		match self.direction {
			HTLCDirection::Outbound => 0u8.write(w)?,
			HTLCDirection::Inbound => 1u8.write(w)?,
		}
		self.add.write(w)
	}
}
impl Readable for DirectedHTLC {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let direction = match <u8 as Readable>::read(r)? {
			0 => HTLCDirection::Outbound,
			1 => HTLCDirection::Inbound,
			_ => return Err(DecodeError::InvalidValue),
		};
		Ok(DirectedHTLC { direction, add: Readable::read(r)? })
	}
}

impl Writeable for UpdateMessage {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		match *self {
			UpdateMessage::Add(ref msg) => {
				0u8.write(w)?;
				msg.write(w)
			},
			UpdateMessage::Fulfill(ref msg) => {
				1u8.write(w)?;
				msg.write(w)
			},
			UpdateMessage::Fail(ref msg) => {
				2u8.write(w)?;
				msg.write(w)
			},
		}
	}
}
impl Readable for UpdateMessage {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(match <u8 as Readable>::read(r)? {
			0 => UpdateMessage::Add(Readable::read(r)?),
			1 => UpdateMessage::Fulfill(Readable::read(r)?),
			2 => UpdateMessage::Fail(Readable::read(r)?),
			_ => return Err(DecodeError::InvalidValue),
		})
	}
}

impl Writeable for CommitmentSpec {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		self.feerate_per_kw.write(w)?;
		self.to_local_msat.write(w)?;
		self.to_remote_msat.write(w)?;
		(self.htlcs.len() as u16).write(w)?;
		for htlc in self.htlcs.iter() {
			htlc.write(w)?;
		}
		Ok(())
	}
}
impl Readable for CommitmentSpec {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let feerate_per_kw = Readable::read(r)?;
		let to_local_msat = Readable::read(r)?;
		let to_remote_msat = Readable::read(r)?;
		let htlc_count: u16 = Readable::read(r)?;
		let mut htlcs = Vec::with_capacity(htlc_count as usize);
		for _ in 0..htlc_count {
			htlcs.push(Readable::read(r)?);
		}
		Ok(CommitmentSpec { feerate_per_kw, to_local_msat, to_remote_msat, htlcs })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use ln::PaymentPreimage;
	use ln::commitments::ChannelError;
	use ln::msgs::{OnionPacket, OnionErrorPacket, UpdateAddHTLC, UpdateFulfillHTLC, UpdateFailHTLC};

	fn add(id: u64, amount_msat: u64) -> UpdateMessage {
		UpdateMessage::Add(UpdateAddHTLC {
			channel_id: 1,
			htlc_id: id,
			amount_msat,
			payment_hash: PaymentPreimage([id as u8; 32]).payment_hash(),
			cltv_expiry: 500,
			onion_routing_packet: OnionPacket { data: Vec::new() },
		})
	}

	fn fulfill(id: u64) -> UpdateMessage {
		UpdateMessage::Fulfill(UpdateFulfillHTLC {
			channel_id: 1,
			htlc_id: id,
			payment_preimage: PaymentPreimage([id as u8; 32]),
		})
	}

	fn fail(id: u64) -> UpdateMessage {
		UpdateMessage::Fail(UpdateFailHTLC {
			channel_id: 1,
			htlc_id: id,
			reason: OnionErrorPacket { data: Vec::new() },
		})
	}

	fn base_spec() -> CommitmentSpec {
		CommitmentSpec {
			feerate_per_kw: 1000,
			to_local_msat: 5_000_000,
			to_remote_msat: 5_000_000,
			htlcs: Vec::new(),
		}
	}

	#[test]
	fn test_reduce_directions_and_balances() {
		let spec = base_spec();

		// We offer 1000, they offer 2000
		let reduced = spec.reduce(&[add(1, 1000)], &[add(1, 2000)]).unwrap();
		assert_eq!(reduced.to_local_msat, 4_999_000);
		assert_eq!(reduced.to_remote_msat, 4_998_000);
		assert_eq!(reduced.htlcs.len(), 2);
		assert_eq!(reduced.total_funds_msat(), spec.total_funds_msat());

		// They fulfill ours (credits them), we fail theirs (refunds them)
		let settled = reduced.reduce(&[fail(1)], &[fulfill(1)]).unwrap();
		assert_eq!(settled.htlcs.len(), 0);
		assert_eq!(settled.to_local_msat, 4_999_000);
		assert_eq!(settled.to_remote_msat, 5_001_000);
		assert_eq!(settled.total_funds_msat(), spec.total_funds_msat());
	}

	#[test]
	fn test_reduce_add_and_settle_in_one_run() {
		// An add folded in by the same run which settles it
		let spec = base_spec();
		let reduced = spec.reduce(&[add(7, 1000), fulfill(3)], &[add(3, 2000)]).unwrap();
		assert_eq!(reduced.htlcs.len(), 1);
		assert_eq!(reduced.htlcs[0].add.htlc_id, 7);
		// Down 1000 for the offer, up 2000 for the settled inbound HTLC
		assert_eq!(reduced.to_local_msat, 5_001_000);
	}

	#[test]
	fn test_reduce_unknown_htlc() {
		let spec = base_spec();
		match spec.reduce(&[fulfill(17)], &[]) {
			Err(ChannelError::UnknownHtlc(17)) => {},
			_ => panic!("expected unknown-HTLC failure"),
		}
		// A settle may only reference the other side's HTLCs
		let reduced = spec.reduce(&[add(1, 1000)], &[]).unwrap();
		match reduced.reduce(&[fulfill(1)], &[]) {
			Err(ChannelError::UnknownHtlc(1)) => {},
			_ => panic!("expected unknown-HTLC failure"),
		}
	}

	#[test]
	fn test_reduce_composes() {
		// Folding in two runs of their changes one after the other matches folding the
		// concatenated run, as long as the HTLC ids are disjoint.
		let spec = base_spec();
		let ours = [add(1, 1000)];
		let theirs_a = [add(1, 2000), add(2, 3000)];
		let theirs_b = [add(3, 4000)];

		let step = spec.reduce(&ours, &theirs_a).unwrap().reduce(&[], &theirs_b).unwrap();
		let mut concatenated = theirs_a.to_vec();
		concatenated.extend_from_slice(&theirs_b);
		let whole = spec.reduce(&ours, &concatenated).unwrap();
		assert!(step == whole);
	}
}
