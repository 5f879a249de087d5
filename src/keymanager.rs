// SPDX-License-Identifier: LGPL-3.0-only

use std::collections::HashMap;

use num_bigint::BigUint;

use crate::{
    crypto::{AES128, DH, SHA1},
    encoding::{OTREncoder, CTR, MAC},
    OTRError,
};

pub type KeyID = u32;

const PREVIOUS: usize = 0;
const CURRENT: usize = 1;

/// `KeyManager` maintains the 2×2 matrix of session keys: our previous and
/// current DH keypairs crossed with the other party's previous and current
/// DH public keys. It owns the ratchets that advance the matrix and the
/// pool of used receiving-MAC keys awaiting revelation.
///
/// Receiving counters are tracked per (local, remote) key-id pair rather
/// than per cell: ratchet copies reinstall existing key material in other
/// cells, and the high-water mark of a pair must survive that or replayed
/// messages would be accepted after a rotation.
pub struct KeyManager {
    // indexed by [local][remote], slot 0 = previous, slot 1 = current
    keys: [[SessionKeys; 2]; 2],
    receiving_ctrs: HashMap<(KeyID, KeyID), u64>,
    old_mac_keys: Vec<MAC>,
}

impl KeyManager {
    /// `new` populates the matrix from the AKE result: the exchanged
    /// keypair and public key carry key id 1 on both sides, and a freshly
    /// generated local keypair with id 2 immediately becomes the current
    /// local key.
    #[must_use]
    pub fn new(our_keypair: DH::Keypair, their_public: BigUint) -> Self {
        let next_keypair = DH::Keypair::generate();
        let keys = [
            [
                SessionKeys::new(our_keypair.clone(), 1, their_public.clone(), 1),
                SessionKeys::new(our_keypair.clone(), 1, their_public.clone(), 1),
            ],
            [
                SessionKeys::new(next_keypair.clone(), 2, their_public.clone(), 1),
                SessionKeys::new(next_keypair, 2, their_public, 1),
            ],
        ];
        Self {
            keys,
            receiving_ctrs: HashMap::new(),
            old_mac_keys: Vec::new(),
        }
    }

    /// `encryption_keys` is the cell used for outbound encryption: our
    /// previous (acknowledged) keypair with their current public key.
    pub fn encryption_keys(&mut self) -> &mut SessionKeys {
        &mut self.keys[PREVIOUS][CURRENT]
    }

    /// `most_recent` is the (current, current) cell; its key ids decide
    /// when the ratchets fire and its local public key is advertised as
    /// `next_dh`.
    #[must_use]
    pub fn most_recent(&self) -> &SessionKeys {
        &self.keys[CURRENT][CURRENT]
    }

    /// `find` locates the cell holding the given (local, remote) key id
    /// combination.
    pub fn find(&mut self, local_keyid: KeyID, remote_keyid: KeyID) -> Option<&mut SessionKeys> {
        log::trace!(
            "Searching for session keys with (localKeyID, remoteKeyID) = ({}, {})",
            local_keyid,
            remote_keyid
        );
        self.keys
            .iter_mut()
            .flatten()
            .find(|cell| cell.local_keyid == local_keyid && cell.remote_keyid == remote_keyid)
    }

    /// `rotate_local_keys` advances our side of the matrix: the current
    /// keypair becomes the previous one and a freshly generated keypair
    /// takes its place with an incremented key id. Receiving-MAC keys of
    /// the cells rotated out are queued for revelation if they were used.
    pub fn rotate_local_keys(&mut self) {
        log::debug!("Rotating local keys.");
        self.reveal_used_mac_keys([(PREVIOUS, CURRENT), (PREVIOUS, PREVIOUS)]);
        let (current_pair, current_id) = {
            let cell = &self.keys[CURRENT][CURRENT];
            (cell.local_keypair.clone(), cell.local_keyid)
        };
        self.keys[PREVIOUS][CURRENT].set_local(current_pair.clone(), current_id);
        let (current_pair_prev, current_id_prev) = {
            let cell = &self.keys[CURRENT][PREVIOUS];
            (cell.local_keypair.clone(), cell.local_keyid)
        };
        self.keys[PREVIOUS][PREVIOUS].set_local(current_pair_prev, current_id_prev);
        let next_keypair = DH::Keypair::generate();
        self.keys[CURRENT][CURRENT].set_local(next_keypair.clone(), current_id + 1);
        self.keys[CURRENT][PREVIOUS].set_local(next_keypair, current_id + 1);
        self.prune_receiving_ctrs();
    }

    /// `rotate_remote_keys` advances the other party's side of the matrix
    /// with the public key they announced as their next DH key.
    pub fn rotate_remote_keys(&mut self, their_public: BigUint) {
        log::debug!("Rotating remote keys.");
        self.reveal_used_mac_keys([(CURRENT, PREVIOUS), (PREVIOUS, PREVIOUS)]);
        let (current_key, current_id) = {
            let cell = &self.keys[CURRENT][CURRENT];
            (cell.remote_public.clone(), cell.remote_keyid)
        };
        self.keys[CURRENT][PREVIOUS].set_remote(current_key, current_id);
        let (current_key_prev, current_id_prev) = {
            let cell = &self.keys[PREVIOUS][CURRENT];
            (cell.remote_public.clone(), cell.remote_keyid)
        };
        self.keys[PREVIOUS][PREVIOUS].set_remote(current_key_prev, current_id_prev);
        self.keys[CURRENT][CURRENT].set_remote(their_public.clone(), current_id + 1);
        self.keys[PREVIOUS][CURRENT].set_remote(their_public, current_id + 1);
        self.prune_receiving_ctrs();
    }

    /// `verify_receiving_ctr` enforces that the received counter strictly
    /// increases for the given key-id pair, then stores it as the new
    /// high-water mark.
    pub fn verify_receiving_ctr(
        &mut self,
        local_keyid: KeyID,
        remote_keyid: KeyID,
        ctr: &CTR,
    ) -> Result<(), OTRError> {
        let value = u64::from_be_bytes(*ctr);
        let highwater = self
            .receiving_ctrs
            .entry((local_keyid, remote_keyid))
            .or_insert(0);
        if value == 0 || value <= *highwater {
            return Err(OTRError::UnreadableMessage);
        }
        *highwater = value;
        Ok(())
    }

    /// Drop counter entries for key-id pairs that rotated out of the
    /// matrix for good; their ids can never recur.
    fn prune_receiving_ctrs(&mut self) {
        let min_local = self.keys.iter().flatten().map(SessionKeys::local_keyid).min();
        let min_remote = self
            .keys
            .iter()
            .flatten()
            .map(SessionKeys::remote_keyid)
            .min();
        let (min_local, min_remote) = (
            min_local.expect("BUG: matrix cannot be empty"),
            min_remote.expect("BUG: matrix cannot be empty"),
        );
        self.receiving_ctrs
            .retain(|(local, remote), _| *local >= min_local && *remote >= min_remote);
    }

    /// Queue the receiving-MAC keys of the cells that are about to rotate
    /// out, provided those keys authenticated at least one message.
    fn reveal_used_mac_keys(&mut self, cells: [(usize, usize); 2]) {
        for (local, remote) in cells {
            if self.keys[local][remote].used_receiving_mac_key {
                log::debug!("Detected used receiving-MAC key; queueing for revelation.");
                let mac_key = self.keys[local][remote].receiving_mac_key();
                self.old_mac_keys.push(mac_key);
            }
        }
    }

    /// `collect_old_mac_keys` drains the pool of used receiving-MAC keys:
    /// their concatenation, in insertion order, goes out in the data
    /// message's reveal field and the pool empties.
    pub fn collect_old_mac_keys(&mut self) -> Vec<u8> {
        log::trace!("Collecting old MAC keys to be revealed.");
        let mut buffer = Vec::with_capacity(self.old_mac_keys.len() * 20);
        for key in self.old_mac_keys.drain(..) {
            buffer.extend_from_slice(&key);
        }
        buffer
    }
}

/// `SessionKeys` is one cell of the matrix: a local keypair and a remote
/// public key, each with their key id, and the bookkeeping that belongs to
/// this combination. AES and MAC keys are derived deterministically from
/// the shared secret, so installing either half resets the cell.
pub struct SessionKeys {
    local_keypair: DH::Keypair,
    local_keyid: KeyID,
    remote_public: BigUint,
    remote_keyid: KeyID,
    /// MPI-encoded shared secret for this key combination, cached because
    /// every derived key starts from it.
    secbytes: Vec<u8>,
    /// our public key compares greater than theirs: decides which of the
    /// two derivation bytes belongs to the sending direction
    high: bool,
    sending_ctr: u64,
    used_receiving_mac_key: bool,
}

impl SessionKeys {
    fn new(
        local_keypair: DH::Keypair,
        local_keyid: KeyID,
        remote_public: BigUint,
        remote_keyid: KeyID,
    ) -> Self {
        assert!(local_keyid > 0);
        assert!(remote_keyid > 0);
        let mut keys = Self {
            local_keypair,
            local_keyid,
            remote_public,
            remote_keyid,
            secbytes: Vec::new(),
            high: false,
            sending_ctr: 0,
            used_receiving_mac_key: false,
        };
        keys.reset();
        keys
    }

    fn set_local(&mut self, keypair: DH::Keypair, keyid: KeyID) {
        assert!(keyid > 0);
        self.local_keypair = keypair;
        self.local_keyid = keyid;
        self.reset();
    }

    fn set_remote(&mut self, public: BigUint, keyid: KeyID) {
        assert!(keyid > 0);
        self.remote_public = public;
        self.remote_keyid = keyid;
        self.reset();
    }

    fn reset(&mut self) {
        let s = self.local_keypair.generate_shared_secret(&self.remote_public);
        self.secbytes = OTREncoder::new().write_mpi(&s).to_vec();
        self.high = self.local_keypair.public > self.remote_public;
        self.sending_ctr = 0;
        self.used_receiving_mac_key = false;
    }

    #[must_use]
    pub fn local_keyid(&self) -> KeyID {
        self.local_keyid
    }

    #[must_use]
    pub fn remote_keyid(&self) -> KeyID {
        self.remote_keyid
    }

    #[must_use]
    pub fn local_public(&self) -> &BigUint {
        &self.local_keypair.public
    }

    #[must_use]
    pub fn sending_aes_key(&self) -> AES128::Key {
        self.aes_key(if self.high { 0x01 } else { 0x02 })
    }

    #[must_use]
    pub fn receiving_aes_key(&self) -> AES128::Key {
        self.aes_key(if self.high { 0x02 } else { 0x01 })
    }

    #[must_use]
    pub fn sending_mac_key(&self) -> MAC {
        SHA1::digest(&self.sending_aes_key().0)
    }

    #[must_use]
    pub fn receiving_mac_key(&self) -> MAC {
        SHA1::digest(&self.receiving_aes_key().0)
    }

    fn aes_key(&self, direction_byte: u8) -> AES128::Key {
        let mut bytes = Vec::with_capacity(self.secbytes.len() + 1);
        bytes.push(direction_byte);
        bytes.extend_from_slice(&self.secbytes);
        let h1 = SHA1::digest(&bytes);
        AES128::Key(
            h1[..16]
                .try_into()
                .expect("BUG: incorrect digest slice length"),
        )
    }

    /// `next_sending_ctr` increments the sending counter and returns its
    /// value as the 8-byte top half carried on the wire. The counter must
    /// monotonically increase and must not be all 0x00, hence the
    /// increment happens before use.
    pub fn next_sending_ctr(&mut self) -> CTR {
        self.sending_ctr += 1;
        self.sending_ctr.to_be_bytes()
    }

    /// Mark the receiving-MAC key as used: once this cell rotates out, the
    /// key must be revealed.
    pub fn register_used_receiving_mac_key(&mut self) {
        self.used_receiving_mac_key = true;
    }
}
