// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The commitment engine: one `Commitments` value per funded channel, mutated only by the
//! operations below as update messages and signatures flow between the peers.
//!
//! Pending changes move through a four-stage pipeline. A change we originate starts in
//! local_changes.proposed, moves to signed when we commit to it in a commitment_signed, to acked
//! when the peer revokes the commitment which excluded it, and disappears into the committed
//! specs when it is folded into a newly-signed commitment on both sides. The remote's changes
//! walk the mirror-image path through remote_changes.
//!
//! Every operation validates fully before its first write, so an error leaves the value
//! untouched and the channel (for locally-caused errors) intact. Errors caused by the peer -
//! bad signatures, bad revocation secrets, misnumbered HTLCs - must instead be treated as fatal
//! to the channel by the calling state machine.

use bitcoin::blockdata::transaction::Transaction;
use bitcoin::hash_types::Txid;

use bitcoin::secp256k1::key::{PublicKey, SecretKey};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::secp256k1;

use ln::{PaymentHash, PaymentPreimage};
use ln::chan_utils;
use ln::chan_utils::{CommitmentInput, CounterpartyCommitmentSecrets, HTLCTx, TxCreationKeys};
use ln::commitment_spec::{CommitmentSpec, HTLCDirection, UpdateMessage};
use ln::msgs;
use ln::msgs::DecodeError;
use util::logger::Logger;
use util::ser::{Readable, ReadableArgs, Writeable, Writer};

use std::fmt;
use std::io::Read;
use std::mem;
use std::sync::Arc;

/// Maximum `funding_satoshis` value, according to the BOLT #2 specification it's 2^24.
pub const MAX_FUNDING_SATOSHIS: u64 = 1 << 24;

/// The longest locked-up-on-close delay we will accept from a peer: two weeks of blocks
const MAX_TO_SELF_DELAY: u16 = 6 * 24 * 14;

/// How a commitment-engine operation can fail. Failures returned from a send_* operation are
/// local affairs and leave the channel usable; any failure out of a receive_* operation means
/// the peer broke protocol and the channel must be torn down.
pub enum ChannelError {
	/// The side adding an HTLC cannot cover its amount
	InsufficientFunds,
	/// A settle referenced an HTLC id which is not in flight
	UnknownHtlc(u64),
	/// A fulfill carried a preimage which does not hash to the HTLC's payment hash
	InvalidPreimage(u64),
	/// There are no pending changes to sign for
	CannotSignNoChanges,
	/// We already signed a commitment the peer has not revoked the predecessor of
	CannotSignAwaitingRevoke,
	/// The peer's signature on our commitment transaction does not verify
	InvalidCommitSignature,
	/// One of the peer's HTLC-transaction signatures does not verify
	InvalidHtlcSignature,
	/// The peer sent a different number of HTLC signatures than the commitment has HTLC outputs
	HtlcSigCountMismatch {
		/// The number of HTLC outputs needing a signature
		expected: usize,
		/// The number of signatures the peer actually sent
		got: usize,
	},
	/// The revealed per-commitment secret does not match the commitment it claims to revoke, or
	/// is inconsistent with secrets revealed before it
	InvalidRevocation,
	/// A revocation arrived while no signed commitment was awaiting one
	UnexpectedRevocation,
	/// The peer did not assign its HTLC ids densely and in order
	UnexpectedHtlcId {
		/// The id the peer was required to use
		expected: u64,
		/// The id it actually sent
		got: u64,
	},
	/// A parameter violated channel policy; the message describes how
	Close(&'static str),
}

impl ChannelError {
	/// Whether this error kind is by itself fatal to the channel. Note that origin matters too:
	/// even a kind which is survivable locally (eg InsufficientFunds out of a send) requires a
	/// close when a receive_* operation produced it.
	pub fn should_close(&self) -> bool {
		match *self {
			ChannelError::InsufficientFunds => false,
			ChannelError::UnknownHtlc(_) => false,
			ChannelError::InvalidPreimage(_) => false,
			ChannelError::CannotSignNoChanges => false,
			ChannelError::CannotSignAwaitingRevoke => false,
			ChannelError::InvalidCommitSignature => true,
			ChannelError::InvalidHtlcSignature => true,
			ChannelError::HtlcSigCountMismatch { .. } => true,
			ChannelError::InvalidRevocation => true,
			ChannelError::UnexpectedRevocation => true,
			ChannelError::UnexpectedHtlcId { .. } => true,
			ChannelError::Close(_) => true,
		}
	}
}

impl fmt::Debug for ChannelError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			ChannelError::InsufficientFunds => f.write_str("insufficient funds to add HTLC"),
			ChannelError::UnknownHtlc(id) => write!(f, "unknown HTLC id {}", id),
			ChannelError::InvalidPreimage(id) => write!(f, "invalid payment preimage for HTLC {}", id),
			ChannelError::CannotSignNoChanges => f.write_str("cannot sign without pending changes"),
			ChannelError::CannotSignAwaitingRevoke => f.write_str("cannot sign until the previous commitment is revoked"),
			ChannelError::InvalidCommitSignature => f.write_str("invalid commitment transaction signature"),
			ChannelError::InvalidHtlcSignature => f.write_str("invalid HTLC transaction signature"),
			ChannelError::HtlcSigCountMismatch { expected, got } => write!(f, "wrong HTLC signature count: expected {} got {}", expected, got),
			ChannelError::InvalidRevocation => f.write_str("revealed per-commitment secret does not match their commitment point"),
			ChannelError::UnexpectedRevocation => f.write_str("received revocation while not awaiting one"),
			ChannelError::UnexpectedHtlcId { expected, got } => write!(f, "peer skipped HTLC id: expected {} got {}", expected, got),
			ChannelError::Close(msg) => f.write_str(msg),
		}
	}
}

/// Our own channel parameters, fixed at open for the life of the channel. The secret material
/// here never leaves the node; only the matching public points are shared during the handshake.
pub struct LocalParams {
	/// Outputs below this value, in satoshis, are trimmed from our commitment transactions
	pub dust_limit_satoshis: u64,
	/// The delay, in blocks, we require of the remote's to_local outputs
	pub to_self_delay: u16,
	/// Our key in the 2-of-2 funding output
	pub funding_key: SecretKey,
	/// The base from which our per-commitment revocation keys are derived
	pub revocation_base_key: SecretKey,
	/// The base from which our per-commitment payment (and HTLC) keys are derived
	pub payment_base_key: SecretKey,
	/// The base from which our per-commitment delayed payment keys are derived
	pub delayed_payment_base_key: SecretKey,
	/// The seed our whole per-commitment secret chain is derived from. Never transmitted.
	pub commitment_seed: [u8; 32],
	/// Whether we funded the channel (and thus pay the commitment transaction fees)
	pub is_funder: bool,
}
impl_writeable!(LocalParams, 0, {
	dust_limit_satoshis,
	to_self_delay,
	funding_key,
	revocation_base_key,
	payment_base_key,
	delayed_payment_base_key,
	commitment_seed,
	is_funder
});

/// The remote peer's channel parameters, as exchanged during the open handshake.
pub struct RemoteParams {
	/// Outputs below this value, in satoshis, are trimmed from the remote's commitment
	/// transactions
	pub dust_limit_satoshis: u64,
	/// The delay, in blocks, the remote requires of our to_local outputs
	pub to_self_delay: u16,
	/// The remote's key in the 2-of-2 funding output
	pub funding_pubkey: PublicKey,
	/// The base point from which the remote's per-commitment revocation keys are derived
	pub revocation_basepoint: PublicKey,
	/// The base point from which the remote's per-commitment payment (and HTLC) keys are derived
	pub payment_basepoint: PublicKey,
	/// The base point from which the remote's per-commitment delayed payment keys are derived
	pub delayed_payment_basepoint: PublicKey,
}
impl_writeable!(RemoteParams, 0, {
	dust_limit_satoshis,
	to_self_delay,
	funding_pubkey,
	revocation_basepoint,
	payment_basepoint,
	delayed_payment_basepoint
});

/// The fully-signed transactions which would close the channel at the current local commitment:
/// the commitment transaction itself plus one second-stage transaction per non-dust HTLC.
#[derive(Clone)]
pub struct PublishableTxs {
	/// The commitment transaction, witness complete
	pub commit_tx: Transaction,
	/// One HTLC-timeout transaction per offered HTLC, witness complete, broadcastable once the
	/// HTLC's cltv_expiry passes
	pub htlc_timeout_txs: Vec<Transaction>,
	/// One HTLC-success transaction per received HTLC. The witness carries both signatures with
	/// an empty placeholder where the claimer inserts the payment preimage.
	pub htlc_success_txs: Vec<Transaction>,
}
impl_writeable!(PublishableTxs, 0, {
	commit_tx,
	htlc_timeout_txs,
	htlc_success_txs
});

/// The last local commitment both sides have signed. If the channel must be force-closed, the
/// transactions in here are what hits the chain.
#[derive(Clone)]
pub struct LocalCommit {
	/// The (up-counting) commitment number
	pub index: u64,
	/// The balance-and-HTLC snapshot this commitment encodes, from our point of view
	pub spec: CommitmentSpec,
	/// The signed transactions themselves
	pub publishable_txs: PublishableTxs,
}
impl_writeable!(LocalCommit, 0, {
	index,
	spec,
	publishable_txs
});

/// The last remote commitment we signed. We keep only what identifies it and what we need to
/// derive its keys - the remote holds the transactions.
#[derive(Clone)]
pub struct RemoteCommit {
	/// The (up-counting) commitment number
	pub index: u64,
	/// The balance-and-HTLC snapshot this commitment encodes, from the *remote's* point of view
	pub spec: CommitmentSpec,
	/// The txid of the remote commitment transaction, to recognize it on-chain
	pub txid: Txid,
	/// The per-commitment point the remote's keys for this commitment were derived from
	pub remote_per_commitment_point: PublicKey,
}
impl_writeable!(RemoteCommit, 0, {
	index,
	spec,
	txid,
	remote_per_commitment_point
});

/// The changes we have originated, in each stage of the pipeline.
pub struct LocalChanges {
	/// Sent to the peer but not yet included in any commitment signature of ours
	pub proposed: Vec<UpdateMessage>,
	/// Included in a commitment_signed we sent, pending the peer's revocation of its prior state
	pub signed: Vec<UpdateMessage>,
	/// Acknowledged by the peer's revocation: they can no longer broadcast any commitment
	/// excluding these
	pub acked: Vec<UpdateMessage>,
}

/// The changes the remote has originated.
pub struct RemoteChanges {
	/// Received from the peer but not yet included in any commitment signature of theirs
	pub proposed: Vec<UpdateMessage>,
	/// Irrevocably committed on our side: our revocation acknowledged them
	pub acked: Vec<UpdateMessage>,
}

/// What we know about the remote's *next* commitment: either we have already signed and sent it
/// and are waiting for the revocation of its predecessor, or we only hold the per-commitment
/// point we would build it from. Every operation which touches this must handle both arms.
pub enum RemoteNextCommitInfo {
	/// We signed and sent remote commitment n+1 and must not sign another until the remote
	/// revokes commitment n
	AwaitingRevocation(RemoteCommit),
	/// The remote's next per-commitment point; we are free to sign a new commitment for it
	Ready(PublicKey),
}

/// The full state of one funded channel's commitments, as mutated by the operations below.
///
/// The owning state machine must serialize operations per channel and persist the new value
/// before releasing any message an operation produced - re-signing after a crash-replay with a
/// stale value is how funds get lost.
pub struct Commitments {
	/// Our fixed parameters
	pub local_params: LocalParams,
	/// The remote's fixed parameters
	pub remote_params: RemoteParams,
	/// The channel id both peers carry on every message
	pub channel_id: u64,
	/// The 2-of-2 funding output every commitment spends
	pub commit_input: CommitmentInput,
	/// The current fully-signed local commitment
	pub local_commit: LocalCommit,
	/// The current fully-signed remote commitment
	pub remote_commit: RemoteCommit,
	/// Our changes, by pipeline stage
	pub local_changes: LocalChanges,
	/// The remote's changes, by pipeline stage
	pub remote_changes: RemoteChanges,
	/// The largest HTLC id we have assigned; ids are dense, so the next add uses this plus one
	pub local_current_htlc_id: u64,
	/// The largest HTLC id the remote has used; the peer must assign densely and in order
	pub remote_current_htlc_id: u64,
	/// Whether we may sign a new remote commitment, and with which point
	pub remote_next_commit_info: RemoteNextCommitInfo,
	/// Every revoked remote per-commitment secret, in compressed form. Lets us punish any old
	/// commitment the remote might ever broadcast.
	pub remote_per_commitment_secrets: CounterpartyCommitmentSecrets,
	/// The secp context used for all derivation, signing and verification
	pub secp_ctx: Secp256k1<secp256k1::All>,
	/// The logger trace output lands on
	pub logger: Arc<Logger>,
}

impl Commitments {
	/// Whether we have anything to include in a new remote commitment
	pub fn local_has_changes(&self) -> bool {
		!self.remote_changes.acked.is_empty() || !self.local_changes.proposed.is_empty()
	}

	/// Whether the remote has anything a new local commitment of theirs could include
	pub fn remote_has_changes(&self) -> bool {
		!self.local_changes.acked.is_empty() || !self.remote_changes.proposed.is_empty()
	}

	/// Offer a new HTLC to the remote. Checks, against our view of the *remote* commitment with
	/// the candidate included, that our balance covers the amount; assigns the next dense HTLC
	/// id (or the explicit id a retransmitting caller provides) and stages the update in
	/// local_changes.proposed.
	///
	/// Returns the update_add_htlc to send.
	pub fn send_add(&mut self, amount_msat: u64, cltv_expiry: u32, payment_hash: PaymentHash, onion_routing_packet: msgs::OnionPacket, id: Option<u64>) -> Result<msgs::UpdateAddHTLC, ChannelError> {
		let id = id.unwrap_or(self.local_current_htlc_id + 1);
		let add = msgs::UpdateAddHTLC {
			channel_id: self.channel_id,
			htlc_id: id,
			amount_msat,
			payment_hash,
			cltv_expiry,
			onion_routing_packet,
		};

		let mut proposed = self.local_changes.proposed.clone();
		proposed.push(UpdateMessage::Add(add.clone()));
		let reduced = self.remote_commit.spec.reduce(&self.remote_changes.acked, &proposed)?;
		if (amount_msat as i64) > reduced.to_remote_msat {
			return Err(ChannelError::InsufficientFunds);
		}

		log_trace!(self, "Offering HTLC {} with hash {} for {} msat", id, log_bytes!(payment_hash.0), amount_msat);
		self.local_changes.proposed = proposed;
		self.local_current_htlc_id = id;
		Ok(add)
	}

	/// Take in an HTLC the remote offered. The peer must assign ids densely and in order; a gap
	/// or reuse is a protocol violation. The amount check mirrors send_add, from our view of our
	/// own commitment.
	pub fn receive_add(&mut self, msg: &msgs::UpdateAddHTLC) -> Result<(), ChannelError> {
		if msg.htlc_id != self.remote_current_htlc_id + 1 {
			return Err(ChannelError::UnexpectedHtlcId { expected: self.remote_current_htlc_id + 1, got: msg.htlc_id });
		}

		let mut proposed = self.remote_changes.proposed.clone();
		proposed.push(UpdateMessage::Add(msg.clone()));
		let reduced = self.local_commit.spec.reduce(&self.local_changes.acked, &proposed)?;
		if (msg.amount_msat as i64) > reduced.to_remote_msat {
			return Err(ChannelError::InsufficientFunds);
		}

		log_trace!(self, "Received HTLC {} with hash {} for {} msat", msg.htlc_id, log_bytes!(msg.payment_hash.0), msg.amount_msat);
		self.remote_changes.proposed = proposed;
		self.remote_current_htlc_id = msg.htlc_id;
		Ok(())
	}

	/// Settle an HTLC the remote offered us, revealing its preimage.
	/// Returns the update_fulfill_htlc to send.
	pub fn send_fulfill(&mut self, htlc_id: u64, payment_preimage: PaymentPreimage) -> Result<msgs::UpdateFulfillHTLC, ChannelError> {
		match self.local_commit.spec.htlcs.iter().find(|htlc| htlc.direction == HTLCDirection::Inbound && htlc.add.htlc_id == htlc_id) {
			Some(htlc) => {
				if payment_preimage.payment_hash() != htlc.add.payment_hash {
					return Err(ChannelError::InvalidPreimage(htlc_id));
				}
			},
			None => return Err(ChannelError::UnknownHtlc(htlc_id)),
		}

		let fulfill = msgs::UpdateFulfillHTLC {
			channel_id: self.channel_id,
			htlc_id,
			payment_preimage,
		};
		self.local_changes.proposed.push(UpdateMessage::Fulfill(fulfill.clone()));
		Ok(fulfill)
	}

	/// Take in the remote's settle of an HTLC we offered, checking the revealed preimage.
	/// Returns the original update_add_htlc so the caller can settle whatever it relayed the
	/// HTLC from.
	pub fn receive_fulfill(&mut self, msg: &msgs::UpdateFulfillHTLC) -> Result<msgs::UpdateAddHTLC, ChannelError> {
		let orig_add = match self.remote_commit.spec.htlcs.iter().find(|htlc| htlc.direction == HTLCDirection::Inbound && htlc.add.htlc_id == msg.htlc_id) {
			Some(htlc) => {
				if msg.payment_preimage.payment_hash() != htlc.add.payment_hash {
					return Err(ChannelError::InvalidPreimage(msg.htlc_id));
				}
				htlc.add.clone()
			},
			None => return Err(ChannelError::UnknownHtlc(msg.htlc_id)),
		};

		self.remote_changes.proposed.push(UpdateMessage::Fulfill(msg.clone()));
		Ok(orig_add)
	}

	/// Give an HTLC the remote offered us back to them unfulfilled, with an opaque reason.
	/// Returns the update_fail_htlc to send.
	pub fn send_fail(&mut self, htlc_id: u64, reason: msgs::OnionErrorPacket) -> Result<msgs::UpdateFailHTLC, ChannelError> {
		if self.local_commit.spec.htlcs.iter().find(|htlc| htlc.direction == HTLCDirection::Inbound && htlc.add.htlc_id == htlc_id).is_none() {
			return Err(ChannelError::UnknownHtlc(htlc_id));
		}

		let fail = msgs::UpdateFailHTLC {
			channel_id: self.channel_id,
			htlc_id,
			reason,
		};
		self.local_changes.proposed.push(UpdateMessage::Fail(fail.clone()));
		Ok(fail)
	}

	/// Take in the remote's failure of an HTLC we offered.
	/// Returns the original update_add_htlc so the caller can fail backwards.
	pub fn receive_fail(&mut self, msg: &msgs::UpdateFailHTLC) -> Result<msgs::UpdateAddHTLC, ChannelError> {
		let orig_add = match self.remote_commit.spec.htlcs.iter().find(|htlc| htlc.direction == HTLCDirection::Inbound && htlc.add.htlc_id == msg.htlc_id) {
			Some(htlc) => htlc.add.clone(),
			None => return Err(ChannelError::UnknownHtlc(msg.htlc_id)),
		};

		self.remote_changes.proposed.push(UpdateMessage::Fail(msg.clone()));
		Ok(orig_add)
	}

	/// Sign a new remote commitment folding in everything we have proposed and everything of
	/// theirs we have acked. Only one signed commitment may be in flight: until the remote
	/// revokes the predecessor we refuse to sign again.
	///
	/// Returns the commitment_signed to send, with the HTLC signatures in the canonical
	/// output-index order.
	pub fn send_commit(&mut self) -> Result<msgs::CommitmentSigned, ChannelError> {
		let remote_next_point = match self.remote_next_commit_info {
			RemoteNextCommitInfo::AwaitingRevocation(_) => return Err(ChannelError::CannotSignAwaitingRevoke),
			RemoteNextCommitInfo::Ready(point) => point,
		};
		if !self.local_has_changes() {
			return Err(ChannelError::CannotSignNoChanges);
		}

		let spec = self.remote_commit.spec.reduce(&self.remote_changes.acked, &self.local_changes.proposed)?;
		let (keys, commitment_tx, htlc_timeout_txs, htlc_success_txs) =
			make_remote_txs(&self.secp_ctx, self.remote_commit.index + 1, &self.local_params, &self.remote_params, &self.commit_input, &remote_next_point, &spec)?;
		let txid = commitment_tx.txid();

		let our_sig = chan_utils::sign_input(&self.secp_ctx, &commitment_tx, 0, &self.commit_input.redeem_script, self.commit_input.value_satoshis, &self.local_params.funding_key);

		let mut sorted_htlc_txs: Vec<&HTLCTx> = htlc_timeout_txs.iter().chain(htlc_success_txs.iter()).collect();
		sorted_htlc_txs.sort_unstable_by_key(|htlc_tx| htlc_tx.tx.input[0].previous_output.vout);

		let payment_key = match chan_utils::derive_private_key(&self.secp_ctx, &remote_next_point, &self.local_params.payment_base_key) {
			Ok(key) => key,
			Err(_) => return Err(ChannelError::Close("Derived invalid key, peer is maliciously selecting parameters")),
		};
		let mut htlc_signatures = Vec::with_capacity(sorted_htlc_txs.len());
		for htlc_tx in sorted_htlc_txs.iter() {
			let htlc_redeemscript = chan_utils::get_htlc_redeemscript(&htlc_tx.htlc, &keys);
			htlc_signatures.push(chan_utils::sign_input(&self.secp_ctx, &htlc_tx.tx, 0, &htlc_redeemscript, htlc_tx.htlc.amount_msat / 1000, &payment_key));
		}

		log_trace!(self, "Signing remote commitment number {} as {} with {} HTLC signatures", self.remote_commit.index + 1, txid, htlc_signatures.len());

		// Update state now that we've passed all the can-fail calls...
		debug_assert!(self.local_changes.signed.is_empty());
		self.remote_next_commit_info = RemoteNextCommitInfo::AwaitingRevocation(RemoteCommit {
			index: self.remote_commit.index + 1,
			spec,
			txid,
			remote_per_commitment_point: remote_next_point,
		});
		self.local_changes.signed = mem::replace(&mut self.local_changes.proposed, Vec::new());
		self.remote_changes.acked = Vec::new();

		Ok(msgs::CommitmentSigned {
			channel_id: self.channel_id,
			signature: our_sig,
			htlc_signatures,
		})
	}

	/// Take in the remote's signatures over our next commitment, verify every one of them, and
	/// advance: the new local commitment becomes broadcastable and we hand back the revocation
	/// of its predecessor (with the per-commitment point two ahead, keeping the remote always
	/// one point in hand).
	///
	/// Returns the revoke_and_ack to send, carrying our signatures for our new HTLC-timeout
	/// transactions.
	pub fn receive_commit(&mut self, msg: &msgs::CommitmentSigned) -> Result<msgs::RevokeAndACK, ChannelError> {
		if !self.remote_has_changes() {
			return Err(ChannelError::CannotSignNoChanges);
		}

		let spec = self.local_commit.spec.reduce(&self.local_changes.acked, &self.remote_changes.proposed)?;
		let local_next_index = self.local_commit.index + 1;
		let local_per_commitment_point = chan_utils::per_commitment_point(&self.secp_ctx, &self.local_params.commitment_seed, local_next_index);
		let (keys, mut commitment_tx, htlc_timeout_txs, htlc_success_txs) =
			make_local_txs(&self.secp_ctx, local_next_index, &self.local_params, &self.remote_params, &self.commit_input, &local_per_commitment_point, &spec)?;
		let txid = commitment_tx.txid();

		log_trace!(self, "Checking commitment tx signature {} by key {} for local commitment number {}", log_bytes!(msg.signature.serialize_compact()[..]), log_bytes!(self.remote_params.funding_pubkey.serialize()), local_next_index);
		if chan_utils::check_sig(&self.secp_ctx, &commitment_tx, 0, &self.commit_input.redeem_script, self.commit_input.value_satoshis, &msg.signature, &self.remote_params.funding_pubkey).is_err() {
			return Err(ChannelError::InvalidCommitSignature);
		}
		let our_sig = chan_utils::sign_input(&self.secp_ctx, &commitment_tx, 0, &self.commit_input.redeem_script, self.commit_input.value_satoshis, &self.local_params.funding_key);

		let mut sorted_htlc_txs: Vec<&HTLCTx> = htlc_timeout_txs.iter().chain(htlc_success_txs.iter()).collect();
		sorted_htlc_txs.sort_unstable_by_key(|htlc_tx| htlc_tx.tx.input[0].previous_output.vout);
		if msg.htlc_signatures.len() != sorted_htlc_txs.len() {
			return Err(ChannelError::HtlcSigCountMismatch { expected: sorted_htlc_txs.len(), got: msg.htlc_signatures.len() });
		}

		let our_payment_key = match chan_utils::derive_private_key(&self.secp_ctx, &local_per_commitment_point, &self.local_params.payment_base_key) {
			Ok(key) => key,
			Err(_) => return Err(ChannelError::Close("Derived invalid key, peer is maliciously selecting parameters")),
		};

		let mut signed_htlc_timeout_txs = Vec::new();
		let mut signed_htlc_success_txs = Vec::new();
		let mut htlc_timeout_signatures = Vec::new();
		for (idx, htlc_tx) in sorted_htlc_txs.iter().enumerate() {
			let htlc_redeemscript = chan_utils::get_htlc_redeemscript(&htlc_tx.htlc, &keys);
			if chan_utils::check_sig(&self.secp_ctx, &htlc_tx.tx, 0, &htlc_redeemscript, htlc_tx.htlc.amount_msat / 1000, &msg.htlc_signatures[idx], &keys.countersignatory_payment_key).is_err() {
				return Err(ChannelError::InvalidHtlcSignature);
			}
			let our_htlc_sig = chan_utils::sign_input(&self.secp_ctx, &htlc_tx.tx, 0, &htlc_redeemscript, htlc_tx.htlc.amount_msat / 1000, &our_payment_key);
			let mut tx = htlc_tx.tx.clone();
			chan_utils::add_htlc_sigs(&mut tx, &our_htlc_sig, &msg.htlc_signatures[idx], &None, &htlc_redeemscript);
			if htlc_tx.htlc.offered {
				htlc_timeout_signatures.push(our_htlc_sig);
				signed_htlc_timeout_txs.push(tx);
			} else {
				signed_htlc_success_txs.push(tx);
			}
		}

		let our_funding_pubkey = PublicKey::from_secret_key(&self.secp_ctx, &self.local_params.funding_key);
		chan_utils::add_commitment_sigs(&mut commitment_tx, &self.commit_input.redeem_script, &our_funding_pubkey, &self.remote_params.funding_pubkey, &our_sig, &msg.signature);

		// Handing over this secret revokes the commitment we are replacing; the new point is two
		// ahead because the peer already holds the point for the commitment just signed.
		let per_commitment_secret = chan_utils::build_commitment_secret(&self.local_params.commitment_seed, chan_utils::INITIAL_COMMITMENT_NUMBER - self.local_commit.index);
		let next_per_commitment_point = chan_utils::per_commitment_point(&self.secp_ctx, &self.local_params.commitment_seed, self.local_commit.index + 2);

		log_trace!(self, "Local commitment advanced to number {} as {}", local_next_index, txid);

		// Update state now that we've passed all the can-fail calls...
		self.local_commit = LocalCommit {
			index: local_next_index,
			spec,
			publishable_txs: PublishableTxs {
				commit_tx: commitment_tx,
				htlc_timeout_txs: signed_htlc_timeout_txs,
				htlc_success_txs: signed_htlc_success_txs,
			},
		};
		self.local_changes.acked = Vec::new();
		let newly_acked = mem::replace(&mut self.remote_changes.proposed, Vec::new());
		self.remote_changes.acked.extend(newly_acked);

		Ok(msgs::RevokeAndACK {
			channel_id: self.channel_id,
			per_commitment_secret,
			next_per_commitment_point,
			htlc_timeout_signatures,
		})
	}

	/// Take in the remote's revocation of the commitment our last commitment_signed replaced.
	/// The revealed secret must be the discrete log of exactly the per-commitment point the
	/// revoked commitment was built from - that binding is what makes old states punishable.
	pub fn receive_revocation(&mut self, msg: &msgs::RevokeAndACK) -> Result<(), ChannelError> {
		let their_next_commit = match self.remote_next_commit_info {
			RemoteNextCommitInfo::Ready(_) => return Err(ChannelError::UnexpectedRevocation),
			RemoteNextCommitInfo::AwaitingRevocation(ref commit) => commit.clone(),
		};

		let per_commitment_secret = match SecretKey::from_slice(&msg.per_commitment_secret) {
			Ok(secret) => secret,
			Err(_) => return Err(ChannelError::InvalidRevocation),
		};
		if PublicKey::from_secret_key(&self.secp_ctx, &per_commitment_secret) != self.remote_commit.remote_per_commitment_point {
			return Err(ChannelError::InvalidRevocation);
		}
		if self.remote_per_commitment_secrets.provide_secret(chan_utils::INITIAL_COMMITMENT_NUMBER - self.remote_commit.index, msg.per_commitment_secret).is_err() {
			return Err(ChannelError::InvalidRevocation);
		}

		log_trace!(self, "Remote revoked commitment number {}, their commitment advanced to {}", self.remote_commit.index, their_next_commit.index);

		self.remote_commit = their_next_commit;
		self.remote_next_commit_info = RemoteNextCommitInfo::Ready(msg.next_per_commitment_point);
		let newly_acked = mem::replace(&mut self.local_changes.signed, Vec::new());
		self.local_changes.acked.extend(newly_acked);
		Ok(())
	}
}

/// Derives the keys for our own commitment with the given number and builds its transactions
/// from our view of the spec: the commitment transaction, the HTLC-timeout transactions for our
/// offered HTLCs and the HTLC-success transactions for received ones, all unsigned.
pub fn make_local_txs(secp_ctx: &Secp256k1<secp256k1::All>, commitment_number: u64, local_params: &LocalParams, remote_params: &RemoteParams, commit_input: &CommitmentInput, local_per_commitment_point: &PublicKey, spec: &CommitmentSpec) -> Result<(TxCreationKeys, Transaction, Vec<HTLCTx>, Vec<HTLCTx>), ChannelError> {
	let delayed_payment_base = PublicKey::from_secret_key(secp_ctx, &local_params.delayed_payment_base_key);
	let payment_base = PublicKey::from_secret_key(secp_ctx, &local_params.payment_base_key);
	let keys = match TxCreationKeys::derive_new(secp_ctx, local_per_commitment_point, &delayed_payment_base, &payment_base, &remote_params.revocation_basepoint, &remote_params.payment_basepoint) {
		Ok(keys) => keys,
		Err(_) => return Err(ChannelError::Close("Local tx keys generation got bogus keys")),
	};
	let (funder_payment_basepoint, fundee_payment_basepoint) = if local_params.is_funder {
		(payment_base, remote_params.payment_basepoint)
	} else {
		(remote_params.payment_basepoint, payment_base)
	};
	build_txs(commitment_number, commit_input, &keys, remote_params.to_self_delay, local_params.dust_limit_satoshis, local_params.is_funder, &funder_payment_basepoint, &fundee_payment_basepoint, spec)
}

/// The same template as make_local_txs with the two sides' roles swapped: the remote's
/// basepoints become the broadcaster keyset, ours the countersignatory one, and the funder flag
/// flips to whoever actually pays the fees.
pub fn make_remote_txs(secp_ctx: &Secp256k1<secp256k1::All>, commitment_number: u64, local_params: &LocalParams, remote_params: &RemoteParams, commit_input: &CommitmentInput, remote_per_commitment_point: &PublicKey, spec: &CommitmentSpec) -> Result<(TxCreationKeys, Transaction, Vec<HTLCTx>, Vec<HTLCTx>), ChannelError> {
	let revocation_base = PublicKey::from_secret_key(secp_ctx, &local_params.revocation_base_key);
	let payment_base = PublicKey::from_secret_key(secp_ctx, &local_params.payment_base_key);
	let keys = match TxCreationKeys::derive_new(secp_ctx, remote_per_commitment_point, &remote_params.delayed_payment_basepoint, &remote_params.payment_basepoint, &revocation_base, &payment_base) {
		Ok(keys) => keys,
		Err(_) => return Err(ChannelError::Close("Remote tx keys generation got bogus keys")),
	};
	let (funder_payment_basepoint, fundee_payment_basepoint) = if local_params.is_funder {
		(payment_base, remote_params.payment_basepoint)
	} else {
		(remote_params.payment_basepoint, payment_base)
	};
	build_txs(commitment_number, commit_input, &keys, local_params.to_self_delay, remote_params.dust_limit_satoshis, !local_params.is_funder, &funder_payment_basepoint, &fundee_payment_basepoint, spec)
}

fn build_txs(commitment_number: u64, commit_input: &CommitmentInput, keys: &TxCreationKeys, to_self_delay: u16, dust_limit_satoshis: u64, broadcaster_is_funder: bool, funder_payment_basepoint: &PublicKey, fundee_payment_basepoint: &PublicKey, spec: &CommitmentSpec) -> Result<(TxCreationKeys, Transaction, Vec<HTLCTx>, Vec<HTLCTx>), ChannelError> {
	let obscure_factor = chan_utils::get_commitment_transaction_number_obscure_factor(funder_payment_basepoint, fundee_payment_basepoint);
	let (commitment_tx, htlcs) = chan_utils::build_commitment_transaction(commitment_number, obscure_factor, commit_input, keys, to_self_delay, dust_limit_satoshis, broadcaster_is_funder, spec);
	let txid = commitment_tx.txid();

	let mut htlc_timeout_txs = Vec::new();
	let mut htlc_success_txs = Vec::new();
	for htlc in htlcs {
		let tx = chan_utils::build_htlc_transaction(&txid, spec.feerate_per_kw, to_self_delay, &htlc, &keys.broadcaster_delayed_payment_key, &keys.revocation_key);
		if htlc.offered {
			htlc_timeout_txs.push(HTLCTx { tx, htlc });
		} else {
			htlc_success_txs.push(HTLCTx { tx, htlc });
		}
	}
	Ok((keys.clone(), commitment_tx, htlc_timeout_txs, htlc_success_txs))
}

/// Sanity-checks the parameters of an incoming open_channel against channel policy before any
/// state is created for it. A failure here should be turned into a wire error for the peer and
/// the prospective channel forgotten.
pub fn validate_open_channel(msg: &msgs::OpenChannel) -> Result<(), ChannelError> {
	if msg.funding_satoshis >= MAX_FUNDING_SATOSHIS {
		return Err(ChannelError::Close("funding value > 2^24"));
	}
	if msg.channel_reserve_satoshis > msg.funding_satoshis {
		return Err(ChannelError::Close("Bogus channel_reserve_satoshis"));
	}
	if msg.push_msat > (msg.funding_satoshis - msg.channel_reserve_satoshis) * 1000 {
		return Err(ChannelError::Close("push_msat larger than funding value"));
	}
	if msg.dust_limit_satoshis > msg.funding_satoshis {
		return Err(ChannelError::Close("Peer never wants payout outputs?"));
	}
	if msg.dust_limit_satoshis > msg.channel_reserve_satoshis {
		return Err(ChannelError::Close("Bogus; channel reserve is less than dust limit"));
	}
	if msg.htlc_minimum_msat >= (msg.channel_reserve_satoshis - msg.dust_limit_satoshis) * 1000 {
		return Err(ChannelError::Close("Minimum htlc value is full channel value"));
	}
	// The reserve the peer demands of us must stay a sane fraction of the channel: cap at 5%
	if msg.channel_reserve_satoshis * 20 > msg.funding_satoshis {
		return Err(ChannelError::Close("channel_reserve_satoshis too high: more than 5% of the funding value"));
	}
	if msg.to_self_delay > MAX_TO_SELF_DELAY {
		return Err(ChannelError::Close("They wanted our payments to be delayed by a needlessly long period"));
	}
	Ok(())
}

fn write_changes<W: Writer>(changes: &Vec<UpdateMessage>, w: &mut W) -> Result<(), ::std::io::Error> {
	(changes.len() as u16).write(w)?;
	for change in changes.iter() {
		change.write(w)?;
	}
	Ok(())
}

fn read_changes<R: Read>(r: &mut R) -> Result<Vec<UpdateMessage>, DecodeError> {
	let len: u16 = Readable::read(r)?;
	let mut changes = Vec::with_capacity(len as usize);
	for _ in 0..len {
		changes.push(Readable::read(r)?);
	}
	Ok(changes)
}

impl Writeable for LocalChanges {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		write_changes(&self.proposed, w)?;
		write_changes(&self.signed, w)?;
		write_changes(&self.acked, w)
	}
}
impl Readable for LocalChanges {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(LocalChanges {
			proposed: read_changes(r)?,
			signed: read_changes(r)?,
			acked: read_changes(r)?,
		})
	}
}

impl Writeable for RemoteChanges {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		write_changes(&self.proposed, w)?;
		write_changes(&self.acked, w)
	}
}
impl Readable for RemoteChanges {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(RemoteChanges {
			proposed: read_changes(r)?,
			acked: read_changes(r)?,
		})
	}
}

impl Writeable for RemoteNextCommitInfo {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), ::std::io::Error> {
		match *self {
			RemoteNextCommitInfo::AwaitingRevocation(ref commit) => {
				0u8.write(w)?;
				commit.write(w)
			},
			RemoteNextCommitInfo::Ready(ref point) => {
				1u8.write(w)?;
				point.write(w)
			},
		}
	}
}
impl Readable for RemoteNextCommitInfo {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(match <u8 as Readable>::read(r)? {
			0 => RemoteNextCommitInfo::AwaitingRevocation(Readable::read(r)?),
			1 => RemoteNextCommitInfo::Ready(Readable::read(r)?),
			_ => return Err(DecodeError::InvalidValue),
		})
	}
}

impl Writeable for Commitments {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ::std::io::Error> {
		self.local_params.write(writer)?;
		self.remote_params.write(writer)?;
		self.channel_id.write(writer)?;
		self.commit_input.write(writer)?;
		self.local_commit.write(writer)?;
		self.remote_commit.write(writer)?;
		self.local_changes.write(writer)?;
		self.remote_changes.write(writer)?;
		self.local_current_htlc_id.write(writer)?;
		self.remote_current_htlc_id.write(writer)?;
		self.remote_next_commit_info.write(writer)?;
		self.remote_per_commitment_secrets.write(writer)?;
		Ok(())
	}
}
impl ReadableArgs<Arc<Logger>> for Commitments {
	fn read<R: Read>(reader: &mut R, logger: Arc<Logger>) -> Result<Self, DecodeError> {
		Ok(Commitments {
			local_params: Readable::read(reader)?,
			remote_params: Readable::read(reader)?,
			channel_id: Readable::read(reader)?,
			commit_input: Readable::read(reader)?,
			local_commit: Readable::read(reader)?,
			remote_commit: Readable::read(reader)?,
			local_changes: Readable::read(reader)?,
			remote_changes: Readable::read(reader)?,
			local_current_htlc_id: Readable::read(reader)?,
			remote_current_htlc_id: Readable::read(reader)?,
			remote_next_commit_info: Readable::read(reader)?,
			remote_per_commitment_secrets: Readable::read(reader)?,
			secp_ctx: Secp256k1::new(),
			logger,
		})
	}
}
