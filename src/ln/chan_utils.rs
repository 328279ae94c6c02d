// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Key derivation, script construction and transaction templates for channel commitments.
//!
//! Everything here is a pure function of its arguments: the commitments engine feeds in per-side
//! parameters and a balance snapshot, and gets back unsigned transactions plus the metadata
//! needed to sign and verify them. Signing is deliberately a separate step so that the unsigned
//! templates themselves can be checked for determinism.

use bitcoin::blockdata::script::{Script, Builder};
use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::transaction::{TxIn, TxOut, OutPoint, Transaction, SigHashType};
use bitcoin::util::bip143;

use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hashes::ripemd160::Hash as Ripemd160;
use bitcoin::hash_types::{Txid, PubkeyHash};

use bitcoin::secp256k1::key::{SecretKey, PublicKey};
use bitcoin::secp256k1::{Secp256k1, Signature};
use bitcoin::secp256k1::Error as SecpError;
use bitcoin::secp256k1;

use ln::{PaymentHash, PaymentPreimage};
use ln::commitment_spec::{CommitmentSpec, HTLCDirection};
use ln::msgs::DecodeError;
use util::byte_utils;
use util::ser::{Readable, Writeable, Writer};
use util::transaction_utils;

use std::cmp;
use std::io::Read;

pub(crate) const HTLC_SUCCESS_TX_WEIGHT: u64 = 703;
pub(crate) const HTLC_TIMEOUT_TX_WEIGHT: u64 = 663;

pub(crate) const COMMITMENT_TX_BASE_WEIGHT: u64 = 724;
pub(crate) const COMMITMENT_TX_WEIGHT_PER_HTLC: u64 = 172;

/// Per-commitment secrets walk *down* a 48-bit derivation tree: the commitment with (up-counting)
/// number n uses tree index 2^48-1-n. Later secrets are thus unguessable from earlier ones, while
/// one revealed secret compresses every secret revealed before it.
pub(crate) const INITIAL_COMMITMENT_NUMBER: u64 = (1 << 48) - 1;

/// Build the raw per-commitment secret from the seed and a derivation-tree index
pub fn build_commitment_secret(commitment_seed: &[u8; 32], idx: u64) -> [u8; 32] {
	let mut res: [u8; 32] = commitment_seed.clone();
	for i in 0..48 {
		let bitpos = 47 - i;
		if idx & (1 << bitpos) == (1 << bitpos) {
			res[bitpos / 8] ^= 1 << (bitpos & 7);
			res = Sha256::hash(&res).into_inner();
		}
	}
	res
}

/// The secret which, once revealed, revokes the commitment transaction with the given
/// (up-counting) commitment number.
pub fn per_commitment_secret(commitment_seed: &[u8; 32], commitment_number: u64) -> SecretKey {
	debug_assert!(commitment_number <= INITIAL_COMMITMENT_NUMBER);
	SecretKey::from_slice(&build_commitment_secret(commitment_seed, INITIAL_COMMITMENT_NUMBER - commitment_number)).unwrap()
}

/// The public point matching per_commitment_secret, shared with the peer ahead of time so they
/// can derive the keys for our next commitment transaction.
pub fn per_commitment_point<T: secp256k1::Signing>(secp_ctx: &Secp256k1<T>, commitment_seed: &[u8; 32], commitment_number: u64) -> PublicKey {
	PublicKey::from_secret_key(secp_ctx, &per_commitment_secret(commitment_seed, commitment_number))
}

/// Implements the per-commitment secret storage scheme from BOLT 3.
///
/// Allows us to keep track of all of the revocation secrets of our counterparty in just 50*32
/// bytes or so: a secret stored at derivation-tree index i implicitly supplies every already-seen
/// secret whose index shares i's prefix in the tree.
#[derive(Clone)]
pub struct CounterpartyCommitmentSecrets {
	old_secrets: [([u8; 32], u64); 49],
}

impl PartialEq for CounterpartyCommitmentSecrets {
	fn eq(&self, other: &Self) -> bool {
		for (&(ref secret, ref idx), &(ref o_secret, ref o_idx)) in self.old_secrets.iter().zip(other.old_secrets.iter()) {
			if secret != o_secret || idx != o_idx {
				return false
			}
		}
		true
	}
}

impl CounterpartyCommitmentSecrets {
	/// A new store with no revoked secrets yet
	pub fn new() -> Self {
		Self { old_secrets: [([0; 32], 1 << 48); 49] }
	}

	#[inline]
	fn place_secret(idx: u64) -> u8 {
		for i in 0..48 {
			if idx & (1 << i) == (1 << i) {
				return i
			}
		}
		48
	}

	/// The lowest derivation-tree index (ie most recently revoked commitment) seen so far, or
	/// 1 << 48 if none has been provided yet
	pub fn get_min_seen_secret(&self) -> u64 {
		let mut min = 1 << 48;
		for &(_, idx) in self.old_secrets.iter() {
			if idx < min {
				min = idx;
			}
		}
		min
	}

	#[inline]
	fn derive_secret(secret: [u8; 32], bits: u8, idx: u64) -> [u8; 32] {
		let mut res: [u8; 32] = secret;
		for i in 0..bits {
			let bitpos = bits - 1 - i;
			if idx & (1 << bitpos) == (1 << bitpos) {
				res[(bitpos / 8) as usize] ^= 1 << (bitpos & 7);
				res = Sha256::hash(&res).into_inner();
			}
		}
		res
	}

	/// Store the secret revealed for derivation-tree index idx, checking that every secret it
	/// claims to compress really does derive from it. Errs if the peer's chain is inconsistent.
	pub fn provide_secret(&mut self, idx: u64, secret: [u8; 32]) -> Result<(), ()> {
		let pos = Self::place_secret(idx);
		for i in 0..pos {
			let (old_secret, old_idx) = self.old_secrets[i as usize];
			if Self::derive_secret(secret, pos, old_idx) != old_secret {
				return Err(());
			}
		}
		if self.get_min_seen_secret() <= idx {
			return Ok(());
		}
		self.old_secrets[pos as usize] = (secret, idx);
		Ok(())
	}

	/// Retrieve a previously-provided secret. Can only fail if idx is below get_min_seen_secret.
	pub fn get_secret(&self, idx: u64) -> Option<[u8; 32]> {
		for i in 0..self.old_secrets.len() {
			if (idx & (!((1 << i) - 1))) == self.old_secrets[i].1 {
				return Some(Self::derive_secret(self.old_secrets[i].0, i as u8, idx))
			}
		}
		assert!(idx < self.get_min_seen_secret());
		None
	}
}

impl Writeable for CounterpartyCommitmentSecrets {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), ::std::io::Error> {
		for &(ref secret, ref idx) in self.old_secrets.iter() {
			writer.write_all(secret)?;
			writer.write_all(&byte_utils::be64_to_array(*idx))?;
		}
		Ok(())
	}
}
impl Readable for CounterpartyCommitmentSecrets {
	fn read<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
		let mut old_secrets = [([0; 32], 1 << 48); 49];
		for &mut (ref mut secret, ref mut idx) in old_secrets.iter_mut() {
			*secret = Readable::read(reader)?;
			*idx = Readable::read(reader)?;
		}

		Ok(Self { old_secrets })
	}
}

/// Derives a per-commitment-transaction private key (eg a payment key or delayed_payment key)
/// from the base secret and the per_commitment_point.
///
/// Note that this is infallible iff we trust that at least one of the two input keys are randomly
/// generated (ie our own).
pub fn derive_private_key<T: secp256k1::Signing>(secp_ctx: &Secp256k1<T>, per_commitment_point: &PublicKey, base_secret: &SecretKey) -> Result<SecretKey, SecpError> {
	let mut sha = Sha256::engine();
	sha.input(&per_commitment_point.serialize());
	sha.input(&PublicKey::from_secret_key(&secp_ctx, &base_secret).serialize());
	let res = Sha256::from_engine(sha).into_inner();

	let mut key = base_secret.clone();
	key.add_assign(&res)?;
	Ok(key)
}

/// The public equivalent of derive_private_key - derives the same per-commitment-transaction key
/// from the base point and the per-commitment point, using only public data.
pub fn derive_public_key<T: secp256k1::Signing>(secp_ctx: &Secp256k1<T>, per_commitment_point: &PublicKey, base_point: &PublicKey) -> Result<PublicKey, SecpError> {
	let mut sha = Sha256::engine();
	sha.input(&per_commitment_point.serialize());
	sha.input(&base_point.serialize());
	let res = Sha256::from_engine(sha).into_inner();

	let hashkey = PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&res)?);
	base_point.combine(&hashkey)
}

/// Derives the per-commitment revocation public key from the countersignatory's revocation
/// basepoint and the broadcaster's per-commitment point.
///
/// The per_commitment_point always comes from the potential cheater (the commitment broadcaster)
/// and the revocation_basepoint from the punisher: only once the broadcaster reveals the matching
/// per-commitment secret can the punisher compute the private form of this key.
pub fn derive_public_revocation_key<T: secp256k1::Verification>(secp_ctx: &Secp256k1<T>, per_commitment_point: &PublicKey, countersignatory_revocation_base_point: &PublicKey) -> Result<PublicKey, SecpError> {
	let rev_append_commit_hash_key = {
		let mut sha = Sha256::engine();
		sha.input(&countersignatory_revocation_base_point.serialize());
		sha.input(&per_commitment_point.serialize());

		Sha256::from_engine(sha).into_inner()
	};
	let commit_append_rev_hash_key = {
		let mut sha = Sha256::engine();
		sha.input(&per_commitment_point.serialize());
		sha.input(&countersignatory_revocation_base_point.serialize());

		Sha256::from_engine(sha).into_inner()
	};

	let mut countersignatory_contrib = countersignatory_revocation_base_point.clone();
	countersignatory_contrib.mul_assign(&secp_ctx, &rev_append_commit_hash_key)?;
	let mut broadcaster_contrib = per_commitment_point.clone();
	broadcaster_contrib.mul_assign(&secp_ctx, &commit_append_rev_hash_key)?;
	countersignatory_contrib.combine(&broadcaster_contrib)
}

/// The set of public keys which are used in the creation of one commitment transaction.
/// These are derived from the channel basepoints and the per-commitment point.
///
/// The broadcaster is the party able to broadcast the transaction being built, the
/// countersignatory the one providing the other signature (and able to punish the broadcaster
/// should the transaction turn out to be revoked). The payment basepoints double as the HTLC
/// basepoints, so the two payment keys here are also the two HTLC-script keys.
#[derive(Clone, PartialEq)]
pub struct TxCreationKeys {
	/// The broadcaster's per-commitment public key which was used to derive the other keys.
	pub per_commitment_point: PublicKey,
	/// The key to which a revoked to_local or HTLC-transaction output pays; the countersignatory
	/// can reconstruct its private half once the broadcaster reveals the per-commitment secret.
	pub revocation_key: PublicKey,
	/// The broadcaster's payment/HTLC key for this commitment
	pub broadcaster_payment_key: PublicKey,
	/// The countersignatory's payment/HTLC key for this commitment; the to_remote output pays
	/// here directly.
	pub countersignatory_payment_key: PublicKey,
	/// The key the broadcaster's main balance pays to, spendable only after the contest delay
	pub broadcaster_delayed_payment_key: PublicKey,
}
impl_writeable!(TxCreationKeys, 33*5, {
	per_commitment_point,
	revocation_key,
	broadcaster_payment_key,
	countersignatory_payment_key,
	broadcaster_delayed_payment_key
});

impl TxCreationKeys {
	/// Derive a full commitment keyset from the channel basepoints and a per-commitment point
	pub fn derive_new<T: secp256k1::Signing + secp256k1::Verification>(secp_ctx: &Secp256k1<T>, per_commitment_point: &PublicKey, broadcaster_delayed_payment_base: &PublicKey, broadcaster_payment_base: &PublicKey, countersignatory_revocation_base: &PublicKey, countersignatory_payment_base: &PublicKey) -> Result<TxCreationKeys, SecpError> {
		Ok(TxCreationKeys {
			per_commitment_point: per_commitment_point.clone(),
			revocation_key: derive_public_revocation_key(&secp_ctx, &per_commitment_point, &countersignatory_revocation_base)?,
			broadcaster_payment_key: derive_public_key(&secp_ctx, &per_commitment_point, &broadcaster_payment_base)?,
			countersignatory_payment_key: derive_public_key(&secp_ctx, &per_commitment_point, &countersignatory_payment_base)?,
			broadcaster_delayed_payment_key: derive_public_key(&secp_ctx, &per_commitment_point, &broadcaster_delayed_payment_base)?,
		})
	}
}

/// The 2-of-2 funding output every commitment transaction spends, along with the data needed to
/// sign for it.
#[derive(Clone, PartialEq)]
pub struct CommitmentInput {
	/// The funding transaction output
	pub outpoint: ::chain::transaction::OutPoint,
	/// The 2-of-2 multisig script the funding output pays to
	pub redeem_script: Script,
	/// The channel value, in satoshis
	pub value_satoshis: u64,
}
impl_writeable!(CommitmentInput, 0, {
	outpoint,
	redeem_script,
	value_satoshis
});

/// A script either spendable by the revocation key or the broadcaster_delayed_payment_key once
/// the relative-locktime OP_CSV constraint is satisfied. Encumbers the to_local output on a
/// commitment transaction and the output of each second-stage HTLC transaction.
pub fn get_revokeable_redeemscript(revocation_key: &PublicKey, contest_delay: u16, broadcaster_delayed_payment_key: &PublicKey) -> Script {
	Builder::new().push_opcode(opcodes::all::OP_IF)
	              .push_slice(&revocation_key.serialize())
	              .push_opcode(opcodes::all::OP_ELSE)
	              .push_int(contest_delay as i64)
	              .push_opcode(opcodes::all::OP_CSV)
	              .push_opcode(opcodes::all::OP_DROP)
	              .push_slice(&broadcaster_delayed_payment_key.serialize())
	              .push_opcode(opcodes::all::OP_ENDIF)
	              .push_opcode(opcodes::all::OP_CHECKSIG)
	              .into_script()
}

/// Information about an HTLC as it appears in a commitment transaction
#[derive(Clone, PartialEq)]
pub struct HTLCOutputInCommitment {
	/// Whether the HTLC was "offered" (ie outbound in relation to this commitment transaction).
	/// Note that this is not the same as whether it is outbound *from us*: on the counterparty's
	/// commitment transaction, HTLCs we offered are received HTLCs.
	pub offered: bool,
	/// The value, in msat, of the HTLC. The value as it appears in the commitment transaction is
	/// this divided by 1000.
	pub amount_msat: u64,
	/// The CLTV lock-time at which this HTLC expires.
	pub cltv_expiry: u32,
	/// The hash of the preimage which unlocks this HTLC.
	pub payment_hash: PaymentHash,
	/// The position of this HTLC's output within the commitment transaction. Fixes the canonical
	/// order in which HTLC signatures are exchanged.
	pub transaction_output_index: u32,
}
impl_writeable!(HTLCOutputInCommitment, 1 + 8 + 4 + 32 + 4, {
	offered,
	amount_msat,
	cltv_expiry,
	payment_hash,
	transaction_output_index
});

/// An unsigned second-stage HTLC transaction, paired with the commitment output it spends.
#[derive(Clone)]
pub struct HTLCTx {
	/// The HTLC-timeout or HTLC-success transaction itself
	pub tx: Transaction,
	/// The commitment HTLC output the transaction spends
	pub htlc: HTLCOutputInCommitment,
}

#[inline]
pub(crate) fn get_htlc_redeemscript_with_explicit_keys(htlc: &HTLCOutputInCommitment, broadcaster_payment_key: &PublicKey, countersignatory_payment_key: &PublicKey, revocation_key: &PublicKey) -> Script {
	let payment_hash160 = Ripemd160::hash(&htlc.payment_hash.0[..]).into_inner();
	if htlc.offered {
		Builder::new().push_opcode(opcodes::all::OP_DUP)
		              .push_opcode(opcodes::all::OP_HASH160)
		              .push_slice(&PubkeyHash::hash(&revocation_key.serialize())[..])
		              .push_opcode(opcodes::all::OP_EQUAL)
		              .push_opcode(opcodes::all::OP_IF)
		              .push_opcode(opcodes::all::OP_CHECKSIG)
		              .push_opcode(opcodes::all::OP_ELSE)
		              .push_slice(&countersignatory_payment_key.serialize()[..])
		              .push_opcode(opcodes::all::OP_SWAP)
		              .push_opcode(opcodes::all::OP_SIZE)
		              .push_int(32)
		              .push_opcode(opcodes::all::OP_EQUAL)
		              .push_opcode(opcodes::all::OP_NOTIF)
		              .push_opcode(opcodes::all::OP_DROP)
		              .push_int(2)
		              .push_opcode(opcodes::all::OP_SWAP)
		              .push_slice(&broadcaster_payment_key.serialize()[..])
		              .push_int(2)
		              .push_opcode(opcodes::all::OP_CHECKMULTISIG)
		              .push_opcode(opcodes::all::OP_ELSE)
		              .push_opcode(opcodes::all::OP_HASH160)
		              .push_slice(&payment_hash160)
		              .push_opcode(opcodes::all::OP_EQUALVERIFY)
		              .push_opcode(opcodes::all::OP_CHECKSIG)
		              .push_opcode(opcodes::all::OP_ENDIF)
		              .push_opcode(opcodes::all::OP_ENDIF)
		              .into_script()
	} else {
		Builder::new().push_opcode(opcodes::all::OP_DUP)
		              .push_opcode(opcodes::all::OP_HASH160)
		              .push_slice(&PubkeyHash::hash(&revocation_key.serialize())[..])
		              .push_opcode(opcodes::all::OP_EQUAL)
		              .push_opcode(opcodes::all::OP_IF)
		              .push_opcode(opcodes::all::OP_CHECKSIG)
		              .push_opcode(opcodes::all::OP_ELSE)
		              .push_slice(&countersignatory_payment_key.serialize()[..])
		              .push_opcode(opcodes::all::OP_SWAP)
		              .push_opcode(opcodes::all::OP_SIZE)
		              .push_int(32)
		              .push_opcode(opcodes::all::OP_EQUAL)
		              .push_opcode(opcodes::all::OP_IF)
		              .push_opcode(opcodes::all::OP_HASH160)
		              .push_slice(&payment_hash160)
		              .push_opcode(opcodes::all::OP_EQUALVERIFY)
		              .push_int(2)
		              .push_opcode(opcodes::all::OP_SWAP)
		              .push_slice(&broadcaster_payment_key.serialize()[..])
		              .push_int(2)
		              .push_opcode(opcodes::all::OP_CHECKMULTISIG)
		              .push_opcode(opcodes::all::OP_ELSE)
		              .push_opcode(opcodes::all::OP_DROP)
		              .push_int(htlc.cltv_expiry as i64)
		              .push_opcode(opcodes::all::OP_CLTV)
		              .push_opcode(opcodes::all::OP_DROP)
		              .push_opcode(opcodes::all::OP_CHECKSIG)
		              .push_opcode(opcodes::all::OP_ENDIF)
		              .push_opcode(opcodes::all::OP_ENDIF)
		              .into_script()
	}
}

/// Gets the witness redeemscript for an HTLC output in a commitment transaction.
#[inline]
pub fn get_htlc_redeemscript(htlc: &HTLCOutputInCommitment, keys: &TxCreationKeys) -> Script {
	get_htlc_redeemscript_with_explicit_keys(htlc, &keys.broadcaster_payment_key, &keys.countersignatory_payment_key, &keys.revocation_key)
}

/// Gets the redeemscript for the funding output from the two funding public keys.
/// Note that the order of funding public keys does not matter.
pub fn make_funding_redeemscript(broadcaster: &PublicKey, countersignatory: &PublicKey) -> Script {
	let broadcaster_funding_key = broadcaster.serialize();
	let countersignatory_funding_key = countersignatory.serialize();

	let builder = Builder::new().push_opcode(opcodes::all::OP_PUSHNUM_2);
	if broadcaster_funding_key[..] < countersignatory_funding_key[..] {
		builder.push_slice(&broadcaster_funding_key)
			.push_slice(&countersignatory_funding_key)
	} else {
		builder.push_slice(&countersignatory_funding_key)
			.push_slice(&broadcaster_funding_key)
	}.push_opcode(opcodes::all::OP_PUSHNUM_2).push_opcode(opcodes::all::OP_CHECKMULTISIG).into_script()
}

/// Commitment numbers are obscured in the commitment transaction's locktime and sequence fields,
/// XORed with the low 48 bits of the hash of the concatenated payment basepoints (funder's
/// first). Both sides compute the same factor for the whole life of the channel.
pub(crate) fn get_commitment_transaction_number_obscure_factor(funder_payment_basepoint: &PublicKey, fundee_payment_basepoint: &PublicKey) -> u64 {
	let mut sha = Sha256::engine();
	sha.input(&funder_payment_basepoint.serialize());
	sha.input(&fundee_payment_basepoint.serialize());
	let res = Sha256::from_engine(sha).into_inner();

	((res[26] as u64) << 5*8) |
	((res[27] as u64) << 4*8) |
	((res[28] as u64) << 3*8) |
	((res[29] as u64) << 2*8) |
	((res[30] as u64) << 1*8) |
	((res[31] as u64) << 0*8)
}

/// Builds the unsigned commitment transaction with the given (up-counting) commitment number for
/// the side whose keys, dust limit and to_self_delay are given, from that side's view of the
/// balance-and-HTLC snapshot.
///
/// The transaction fee always comes out of the funder's main output; dust outputs (including
/// HTLCs whose second-stage transaction would leave less than the dust limit after its own fee)
/// are trimmed and implicitly burned to fees.
///
/// Returns the transaction together with the HTLCs which made it into the outputs, each
/// annotated with its output index - the index order is the canonical order for exchanging HTLC
/// signatures.
pub fn build_commitment_transaction(commitment_number: u64, commitment_number_obscure_factor: u64, commit_input: &CommitmentInput, keys: &TxCreationKeys, to_self_delay: u16, dust_limit_satoshis: u64, broadcaster_is_funder: bool, spec: &CommitmentSpec) -> (Transaction, Vec<HTLCOutputInCommitment>) {
	let obscured_commitment_transaction_number = commitment_number_obscure_factor ^ commitment_number;

	let txins = {
		let mut ins: Vec<TxIn> = Vec::new();
		ins.push(TxIn {
			previous_output: commit_input.outpoint.into_bitcoin_outpoint(),
			script_sig: Script::new(),
			sequence: ((0x80 as u32) << 8*3) | ((obscured_commitment_transaction_number >> 3*8) as u32),
			witness: Vec::new(),
		});
		ins
	};

	let mut txouts: Vec<(TxOut, Option<HTLCOutputInCommitment>)> = Vec::with_capacity(spec.htlcs.len() + 2);

	for htlc in spec.htlcs.iter() {
		let offered = htlc.direction == HTLCDirection::Outbound;
		let htlc_tx_fee = if offered {
			spec.feerate_per_kw * HTLC_TIMEOUT_TX_WEIGHT / 1000
		} else {
			spec.feerate_per_kw * HTLC_SUCCESS_TX_WEIGHT / 1000
		};
		if htlc.add.amount_msat / 1000 >= dust_limit_satoshis + htlc_tx_fee {
			let htlc_in_tx = HTLCOutputInCommitment {
				offered,
				amount_msat: htlc.add.amount_msat,
				cltv_expiry: htlc.add.cltv_expiry,
				payment_hash: htlc.add.payment_hash,
				transaction_output_index: 0,
			};
			txouts.push((TxOut {
				script_pubkey: get_htlc_redeemscript(&htlc_in_tx, &keys).to_v0_p2wsh(),
				value: htlc.add.amount_msat / 1000,
			}, Some(htlc_in_tx)));
		}
	}

	let total_fee: u64 = spec.feerate_per_kw * (COMMITMENT_TX_BASE_WEIGHT + (txouts.len() as u64) * COMMITMENT_TX_WEIGHT_PER_HTLC) / 1000;
	let (to_local, to_remote) = if broadcaster_is_funder {
		(spec.to_local_msat / 1000 - total_fee as i64, spec.to_remote_msat / 1000)
	} else {
		(spec.to_local_msat / 1000, spec.to_remote_msat / 1000 - total_fee as i64)
	};

	if to_local >= dust_limit_satoshis as i64 {
		txouts.push((TxOut {
			script_pubkey: get_revokeable_redeemscript(&keys.revocation_key, to_self_delay, &keys.broadcaster_delayed_payment_key).to_v0_p2wsh(),
			value: to_local as u64,
		}, None));
	}

	if to_remote >= dust_limit_satoshis as i64 {
		txouts.push((TxOut {
			script_pubkey: Builder::new().push_opcode(opcodes::all::OP_PUSHBYTES_0)
			                             .push_slice(&PubkeyHash::hash(&keys.countersignatory_payment_key.serialize())[..])
			                             .into_script(),
			value: to_remote as u64,
		}, None));
	}

	transaction_utils::sort_outputs(&mut txouts, |a, b| {
		if let &Some(ref a_htlc) = a {
			if let &Some(ref b_htlc) = b {
				// Expiry alone is not a total order; the payment hash breaks ties so that
				// both sides place equal-valued HTLC outputs identically.
				a_htlc.cltv_expiry.cmp(&b_htlc.cltv_expiry)
					.then(a_htlc.payment_hash.0.cmp(&b_htlc.payment_hash.0))
			} else { cmp::Ordering::Equal }
		} else { cmp::Ordering::Equal }
	});

	let mut outputs: Vec<TxOut> = Vec::with_capacity(txouts.len());
	let mut htlcs_included: Vec<HTLCOutputInCommitment> = Vec::with_capacity(txouts.len());
	for (idx, mut out) in txouts.drain(..).enumerate() {
		outputs.push(out.0);
		if let Some(mut htlc) = out.1.take() {
			htlc.transaction_output_index = idx as u32;
			htlcs_included.push(htlc);
		}
	}

	(Transaction {
		version: 2,
		lock_time: ((0x20 as u32) << 8*3) | ((obscured_commitment_transaction_number & 0xffffffu64) as u32),
		input: txins,
		output: outputs,
	}, htlcs_included)
}

/// Builds the htlc-timeout (for an offered HTLC) or htlc-success (for a received one)
/// transaction which spends the given HTLC output of a commitment transaction.
pub fn build_htlc_transaction(prev_hash: &Txid, feerate_per_kw: u64, contest_delay: u16, htlc: &HTLCOutputInCommitment, broadcaster_delayed_payment_key: &PublicKey, revocation_key: &PublicKey) -> Transaction {
	let mut txins: Vec<TxIn> = Vec::new();
	txins.push(TxIn {
		previous_output: OutPoint {
			txid: prev_hash.clone(),
			vout: htlc.transaction_output_index,
		},
		script_sig: Script::new(),
		sequence: 0,
		witness: Vec::new(),
	});

	let total_fee = if htlc.offered {
			feerate_per_kw * HTLC_TIMEOUT_TX_WEIGHT / 1000
		} else {
			feerate_per_kw * HTLC_SUCCESS_TX_WEIGHT / 1000
		};

	let mut txouts: Vec<TxOut> = Vec::new();
	txouts.push(TxOut {
		script_pubkey: get_revokeable_redeemscript(revocation_key, contest_delay, broadcaster_delayed_payment_key).to_v0_p2wsh(),
		value: htlc.amount_msat / 1000 - total_fee,
	});

	Transaction {
		version: 2,
		lock_time: if htlc.offered { htlc.cltv_expiry } else { 0 },
		input: txins,
		output: txouts,
	}
}

/// Produces a signature over the given (single) input of the given transaction, committing to
/// the redeem script and input value per BIP 143.
pub fn sign_input<T: secp256k1::Signing>(secp_ctx: &Secp256k1<T>, tx: &Transaction, input_index: usize, redeem_script: &Script, value_satoshis: u64, key: &SecretKey) -> Signature {
	let sighash = hash_to_message!(&bip143::SigHashCache::new(tx).signature_hash(input_index, redeem_script, value_satoshis, SigHashType::All)[..]);
	secp_ctx.sign(&sighash, key)
}

/// Verifies a counterparty's signature over the given (single) input of the given transaction.
pub fn check_sig<T: secp256k1::Verification>(secp_ctx: &Secp256k1<T>, tx: &Transaction, input_index: usize, redeem_script: &Script, value_satoshis: u64, sig: &Signature, pubkey: &PublicKey) -> Result<(), SecpError> {
	let sighash = hash_to_message!(&bip143::SigHashCache::new(tx).signature_hash(input_index, redeem_script, value_satoshis, SigHashType::All)[..]);
	secp_ctx.verify(&sighash, sig, pubkey)
}

/// Fills in the witness of an unsigned commitment transaction with both funding signatures,
/// making it broadcastable.
pub fn add_commitment_sigs(tx: &mut Transaction, funding_redeemscript: &Script, holder_funding_key: &PublicKey, counterparty_funding_key: &PublicKey, holder_sig: &Signature, counterparty_sig: &Signature) {
	if tx.input.len() != 1 {
		panic!("Tried to sign commitment transaction that had input count != 1!");
	}
	if tx.input[0].witness.len() != 0 {
		panic!("Tried to re-sign commitment transaction");
	}

	// First push the multisig dummy, note that due to BIP147 (NULLDUMMY) it must be a zero-length element.
	tx.input[0].witness.push(Vec::new());

	if holder_funding_key.serialize()[..] < counterparty_funding_key.serialize()[..] {
		tx.input[0].witness.push(holder_sig.serialize_der().to_vec());
		tx.input[0].witness.push(counterparty_sig.serialize_der().to_vec());
	} else {
		tx.input[0].witness.push(counterparty_sig.serialize_der().to_vec());
		tx.input[0].witness.push(holder_sig.serialize_der().to_vec());
	}
	tx.input[0].witness[1].push(SigHashType::All as u8);
	tx.input[0].witness[2].push(SigHashType::All as u8);

	tx.input[0].witness.push(funding_redeemscript.as_bytes().to_vec());
}

/// Fills in the witness of an unsigned second-stage HTLC transaction. An HTLC-success
/// transaction needs the payment preimage; for an HTLC-timeout transaction (or when storing a
/// success transaction whose preimage is not yet known) an empty element takes its place.
pub fn add_htlc_sigs(tx: &mut Transaction, broadcaster_sig: &Signature, countersignatory_sig: &Signature, preimage: &Option<PaymentPreimage>, htlc_redeemscript: &Script) {
	if tx.input.len() != 1 {
		panic!("Tried to sign HTLC transaction that had input count != 1!");
	}
	if tx.input[0].witness.len() != 0 {
		panic!("Tried to re-sign HTLC transaction");
	}

	// First push the multisig dummy, note that due to BIP147 (NULLDUMMY) it must be a zero-length element.
	tx.input[0].witness.push(Vec::new());

	tx.input[0].witness.push(countersignatory_sig.serialize_der().to_vec());
	tx.input[0].witness.push(broadcaster_sig.serialize_der().to_vec());
	tx.input[0].witness[1].push(SigHashType::All as u8);
	tx.input[0].witness[2].push(SigHashType::All as u8);

	match *preimage {
		Some(ref preimage) => tx.input[0].witness.push(preimage.0.to_vec()),
		// Due to BIP146 (MINIMALIF) this must be a zero-length element to relay.
		None => tx.input[0].witness.push(Vec::new()),
	}

	tx.input[0].witness.push(htlc_redeemscript.as_bytes().to_vec());
}

#[cfg(test)]
mod tests {
	use super::*;
	use ln::commitment_spec::{CommitmentSpec, DirectedHTLC, HTLCDirection};
	use ln::msgs::{OnionPacket, UpdateAddHTLC};
	use chain::transaction;

	use bitcoin::hashes::Hash;
	use bitcoin::hashes::sha256d::Hash as Sha256dHash;
	use bitcoin::secp256k1::key::{SecretKey, PublicKey};
	use bitcoin::secp256k1::Secp256k1;

	use hex;

	#[test]
	fn test_per_commitment_secret_gen() {
		// Test vectors from BOLT 3 Appendix D:

		let mut seed = [0; 32];
		seed[0..32].clone_from_slice(&hex::decode("0000000000000000000000000000000000000000000000000000000000000000").unwrap());
		assert_eq!(build_commitment_secret(&seed, 281474976710655),
		           hex::decode("02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148").unwrap()[..]);

		seed[0..32].clone_from_slice(&hex::decode("FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF").unwrap());
		assert_eq!(build_commitment_secret(&seed, 281474976710655),
		           hex::decode("7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc").unwrap()[..]);

		assert_eq!(build_commitment_secret(&seed, 0xaaaaaaaaaaa),
		           hex::decode("56f4008fb007ca9acf0e15b054d5c9fd12ee06cea347914ddbaed70d1c13a528").unwrap()[..]);

		assert_eq!(build_commitment_secret(&seed, 0x555555555555),
		           hex::decode("9015daaeb06dba4ccc05b91b2f73bd54405f2be9f217fbacd3c5ac2e62327d31").unwrap()[..]);

		seed[0..32].clone_from_slice(&hex::decode("0101010101010101010101010101010101010101010101010101010101010101").unwrap());
		assert_eq!(build_commitment_secret(&seed, 1),
		           hex::decode("915c75942a26bb3a433a8ce2cb0427c29ec6c1775cfc78328b57f6ba7bfeaa9c").unwrap()[..]);

		// The engine-facing wrappers count commitments up from 0:
		assert_eq!(per_commitment_secret(&seed, 0)[..],
		           build_commitment_secret(&seed, INITIAL_COMMITMENT_NUMBER)[..]);
	}

	#[test]
	fn test_key_derivation() {
		// Test vectors from BOLT 3 Appendix E:
		let secp_ctx = Secp256k1::new();

		let base_secret = SecretKey::from_slice(&hex::decode("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f").unwrap()[..]).unwrap();
		let per_commitment_secret = SecretKey::from_slice(&hex::decode("1f1e1d1c1b1a191817161514131211100f0e0d0c0b0a09080706050403020100").unwrap()[..]).unwrap();

		let base_point = PublicKey::from_secret_key(&secp_ctx, &base_secret);
		assert_eq!(base_point.serialize()[..], hex::decode("036d6caac248af96f6afa7f904f550253a0f3ef3f5aa2fe6838a95b216691468e2").unwrap()[..]);

		let per_commitment_point = PublicKey::from_secret_key(&secp_ctx, &per_commitment_secret);
		assert_eq!(per_commitment_point.serialize()[..], hex::decode("025f7117a78150fe2ef97db7cfc83bd57b2e2c0d0dd25eaf467a4a1c2a45ce1486").unwrap()[..]);

		assert_eq!(derive_public_key(&secp_ctx, &per_commitment_point, &base_point).unwrap().serialize()[..],
				hex::decode("0235f2dbfaa89b57ec7b055afe29849ef7ddfeb1cefdb9ebdc43f5494984db29e5").unwrap()[..]);

		assert_eq!(derive_private_key(&secp_ctx, &per_commitment_point, &base_secret).unwrap(),
				SecretKey::from_slice(&hex::decode("cbced912d3b21bf196a766651e436aff192362621ce317704ea2f75d87e7be0f").unwrap()[..]).unwrap());

		assert_eq!(derive_public_revocation_key(&secp_ctx, &per_commitment_point, &base_point).unwrap().serialize()[..],
				hex::decode("02916e326636d19c33f13e8c0c3a03dd157f332f3e99c317c141dd865eb01f8ff0").unwrap()[..]);

		// The private and public derivations must land on the same key
		assert_eq!(PublicKey::from_secret_key(&secp_ctx, &derive_private_key(&secp_ctx, &per_commitment_point, &base_secret).unwrap()),
				derive_public_key(&secp_ctx, &per_commitment_point, &base_point).unwrap());
	}

	#[test]
	fn test_per_commitment_storage() {
		// Test vectors from BOLT 3:
		let mut secrets: Vec<[u8; 32]> = Vec::new();
		let mut monitor;

		macro_rules! test_secrets {
			() => {
				let mut idx = 281474976710655;
				for secret in secrets.iter() {
					assert_eq!(monitor.get_secret(idx).unwrap(), *secret);
					idx -= 1;
				}
				assert_eq!(monitor.get_min_seen_secret(), idx + 1);
				assert!(monitor.get_secret(idx).is_none());
			};
		}

		{
			// insert_secret correct sequence
			monitor = CounterpartyCommitmentSecrets::new();
			secrets.clear();

			secrets.push([0; 32]);
			secrets.last_mut().unwrap()[0..32].clone_from_slice(&hex::decode("7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc").unwrap());
			monitor.provide_secret(281474976710655, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push([0; 32]);
			secrets.last_mut().unwrap()[0..32].clone_from_slice(&hex::decode("c7518c8ae4660ed02894df8976fa1a3659c1a8b4b5bec0c4b872abeba4cb8964").unwrap());
			monitor.provide_secret(281474976710654, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push([0; 32]);
			secrets.last_mut().unwrap()[0..32].clone_from_slice(&hex::decode("2273e227a5b7449b6e70f1fb4652864038b1cbf9cd7c043a7d6456b7fc275ad8").unwrap());
			monitor.provide_secret(281474976710653, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push([0; 32]);
			secrets.last_mut().unwrap()[0..32].clone_from_slice(&hex::decode("27cddaa5624534cb6cb9d7da077cf2b22ab21e9b506fd4998a51d54502e99116").unwrap());
			monitor.provide_secret(281474976710652, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push([0; 32]);
			secrets.last_mut().unwrap()[0..32].clone_from_slice(&hex::decode("c65716add7aa98ba7acb236352d665cab17345fe45b55fb879ff80e6bd0c41dd").unwrap());
			monitor.provide_secret(281474976710651, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push([0; 32]);
			secrets.last_mut().unwrap()[0..32].clone_from_slice(&hex::decode("969660042a28f32d9be17344e09374b379962d03db1574df5a8a5a47e19ce3f2").unwrap());
			monitor.provide_secret(281474976710650, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push([0; 32]);
			secrets.last_mut().unwrap()[0..32].clone_from_slice(&hex::decode("a5a64476122ca0925fb344bdc1854c1c0a59fc614298e50a33e331980a220f32").unwrap());
			monitor.provide_secret(281474976710649, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push([0; 32]);
			secrets.last_mut().unwrap()[0..32].clone_from_slice(&hex::decode("05cde6323d949933f7f7b78776bcc1ea6d9b31447732e3802e1f7ac44b650e17").unwrap());
			monitor.provide_secret(281474976710648, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();
		}

		{
			// insert_secret #1 incorrect
			monitor = CounterpartyCommitmentSecrets::new();
			secrets.clear();

			secrets.push([0; 32]);
			secrets.last_mut().unwrap()[0..32].clone_from_slice(&hex::decode("02a40c85b6f28da08dfdbe0926c53fab2de6d28c10301f8f7c4073d5e42e3148").unwrap());
			monitor.provide_secret(281474976710655, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push([0; 32]);
			secrets.last_mut().unwrap()[0..32].clone_from_slice(&hex::decode("c7518c8ae4660ed02894df8976fa1a3659c1a8b4b5bec0c4b872abeba4cb8964").unwrap());
			assert!(monitor.provide_secret(281474976710654, secrets.last().unwrap().clone()).is_err());
		}

		{
			// insert_secret #5 incorrect
			monitor = CounterpartyCommitmentSecrets::new();
			secrets.clear();

			secrets.push([0; 32]);
			secrets.last_mut().unwrap()[0..32].clone_from_slice(&hex::decode("7cc854b54e3e0dcdb010d7a3fee464a9687be6e8db3be6854c475621e007a5dc").unwrap());
			monitor.provide_secret(281474976710655, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push([0; 32]);
			secrets.last_mut().unwrap()[0..32].clone_from_slice(&hex::decode("c7518c8ae4660ed02894df8976fa1a3659c1a8b4b5bec0c4b872abeba4cb8964").unwrap());
			monitor.provide_secret(281474976710654, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push([0; 32]);
			secrets.last_mut().unwrap()[0..32].clone_from_slice(&hex::decode("2273e227a5b7449b6e70f1fb4652864038b1cbf9cd7c043a7d6456b7fc275ad8").unwrap());
			monitor.provide_secret(281474976710653, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push([0; 32]);
			secrets.last_mut().unwrap()[0..32].clone_from_slice(&hex::decode("27cddaa5624534cb6cb9d7da077cf2b22ab21e9b506fd4998a51d54502e99116").unwrap());
			monitor.provide_secret(281474976710652, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push([0; 32]);
			secrets.last_mut().unwrap()[0..32].clone_from_slice(&hex::decode("631373ad5f9ef654bb3dade742d09504c567edd24320d2fcd68e3cc47e2ff6a6").unwrap());
			monitor.provide_secret(281474976710651, secrets.last().unwrap().clone()).unwrap();
			test_secrets!();

			secrets.push([0; 32]);
			secrets.last_mut().unwrap()[0..32].clone_from_slice(&hex::decode("969660042a28f32d9be17344e09374b379962d03db1574df5a8a5a47e19ce3f2").unwrap());
			assert!(monitor.provide_secret(281474976710650, secrets.last().unwrap().clone()).is_err());
		}
	}

	fn dummy_add(amount_msat: u64, cltv_expiry: u32, direction: HTLCDirection, id: u64) -> DirectedHTLC {
		DirectedHTLC {
			direction,
			add: UpdateAddHTLC {
				channel_id: 42,
				htlc_id: id,
				amount_msat,
				payment_hash: PaymentHash([id as u8; 32]),
				cltv_expiry,
				onion_routing_packet: OnionPacket { data: Vec::new() },
			},
		}
	}

	#[test]
	fn test_build_commitment_transaction() {
		let secp_ctx = Secp256k1::new();
		let seed = [41; 32];
		let per_commitment_point = per_commitment_point(&secp_ctx, &seed, 0);
		let make_key = |v: u8| PublicKey::from_secret_key(&secp_ctx, &SecretKey::from_slice(&[v; 32]).unwrap());

		let keys = TxCreationKeys::derive_new(&secp_ctx, &per_commitment_point,
			&make_key(1), &make_key(2), &make_key(3), &make_key(4)).unwrap();
		let commit_input = CommitmentInput {
			outpoint: transaction::OutPoint::new(Txid::from_hash(Sha256dHash::hash(&[1; 32])), 0),
			redeem_script: make_funding_redeemscript(&make_key(5), &make_key(6)),
			value_satoshis: 10_000_000,
		};
		let obscure_factor = get_commitment_transaction_number_obscure_factor(&make_key(2), &make_key(4));

		let spec = CommitmentSpec {
			feerate_per_kw: 1000,
			to_local_msat: 6_000_000_000,
			to_remote_msat: 2_999_000_000,
			htlcs: vec![
				dummy_add(700_000_000, 510, HTLCDirection::Outbound, 0),
				dummy_add(300_000_000, 505, HTLCDirection::Inbound, 0),
				// Trimmed: fails to clear the dust limit plus the second-stage fee
				dummy_add(1_000_000, 500, HTLCDirection::Outbound, 1),
			],
		};

		let (tx, htlcs) = build_commitment_transaction(42, obscure_factor, &commit_input, &keys, 144, 546, true, &spec);

		// Two non-dust HTLCs plus to_local and to_remote
		assert_eq!(tx.output.len(), 4);
		assert_eq!(htlcs.len(), 2);
		// The canonical ordering follows the output index
		for (idx, htlc) in htlcs.iter().enumerate() {
			if idx > 0 {
				assert!(htlc.transaction_output_index > htlcs[idx - 1].transaction_output_index);
			}
			assert_eq!(tx.output[htlc.transaction_output_index as usize].value, htlc.amount_msat / 1000);
		}

		// The commitment number can be recovered from the obscured locktime and sequence fields
		let unobscured = (((tx.input[0].sequence as u64 & 0xffffff) << 24) | (tx.lock_time as u64 & 0xffffff)) ^ obscure_factor;
		assert_eq!(unobscured, 42);

		// The second-stage transaction spends the right output and pays the delayed script
		let htlc_tx = build_htlc_transaction(&tx.txid(), spec.feerate_per_kw, 144, &htlcs[0], &keys.broadcaster_delayed_payment_key, &keys.revocation_key);
		assert_eq!(htlc_tx.input[0].previous_output.vout, htlcs[0].transaction_output_index);
		assert_eq!(htlc_tx.output[0].script_pubkey, get_revokeable_redeemscript(&keys.revocation_key, 144, &keys.broadcaster_delayed_payment_key).to_v0_p2wsh());
	}
}
