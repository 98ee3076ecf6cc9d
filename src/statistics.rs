//! Validator statistics: per-round proposer and validator bookkeeping and the
//! epoch-end rating commit.
//!
//! All mutable state sits behind one mutex, so header execution and reverts
//! racing during bootstrap observe a consistent peer map and tx counter.

use cosmwasm_std::Uint128;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::RatingsConfig;
use crate::error::RatingError;
use crate::helpers::display_key;
use crate::rating::RatingsComputer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PeerList {
    #[default]
    Eligible,
    Waiting,
    Jailed,
    Leaving,
    Inactive,
    New,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PeerAccount {
    pub public_key: Vec<u8>,
    pub shard_id: u32,
    pub list: PeerList,
    pub index_in_list: u32,
    pub rating: u32,
    pub temp_rating: u32,
    pub leader_success: u32,
    pub leader_failure: u32,
    pub validator_success: u32,
    pub validator_failure: u32,
    pub num_selected_in_success_blocks: u32,
    pub total_leader_success: u32,
    pub total_leader_failure: u32,
    pub total_validator_success: u32,
    pub total_validator_failure: u32,
    pub consecutive_proposer_misses: u32,
    pub accumulated_fees: Uint128,
}

/// Epoch-end view of a peer account, grouped by shard by the block processor.
pub type ValidatorInfo = PeerAccount;

/// Header fields the statistics processor needs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeaderInfo {
    pub hash: Vec<u8>,
    pub shard_id: u32,
    pub nonce: u64,
    pub round: u64,
    pub epoch: u32,
    pub prev_rand_seed: Vec<u8>,
    /// Bit `i` set means consensus group member `i` signed.
    pub pub_keys_bitmap: Vec<u8>,
    pub tx_count: u64,
    pub accumulated_fees: Uint128,
}

impl HeaderInfo {
    pub fn signed(&self, index: usize) -> bool {
        self.pub_keys_bitmap
            .get(index / 8)
            .map(|byte| byte & (1 << (index % 8)) != 0)
            .unwrap_or(false)
    }
}

/// Consensus group selection, provided by the node.
pub trait NodesCoordinator: Send + Sync {
    /// Ordered consensus group for a round; the first member is the leader.
    fn consensus_group(
        &self,
        randomness: &[u8],
        round: u64,
        shard_id: u32,
        epoch: u32,
    ) -> Result<Vec<Vec<u8>>, RatingError>;

    fn eligible_validators(&self, shard_id: u32, epoch: u32) -> Result<Vec<Vec<u8>>, RatingError>;

    fn consensus_group_size(&self, shard_id: u32) -> usize;
}

#[derive(Debug, Default)]
struct StatisticsState {
    peers: BTreeMap<Vec<u8>, PeerAccount>,
    total_txs: u64,
    /// Prior accounts of the peers each processed header touched, oldest
    /// header first. `None` marks a peer the header created.
    journal: VecDeque<(Vec<u8>, PeerDelta)>,
}

type PeerDelta = BTreeMap<Vec<u8>, Option<PeerAccount>>;

/// Headers whose peer changes can still be reverted.
pub const MAX_REVERTIBLE_HEADERS: usize = 128;

impl StatisticsState {
    fn undo(&mut self, hash: &[u8]) -> bool {
        let Some(position) = self.journal.iter().position(|(h, _)| h.as_slice() == hash) else {
            return false;
        };
        // later headers were built on this one and go first
        while self.journal.len() > position {
            let Some((_, delta)) = self.journal.pop_back() else {
                break;
            };
            for (key, old) in delta {
                match old {
                    Some(account) => self.peers.insert(key, account),
                    None => self.peers.remove(&key),
                };
            }
        }
        true
    }
}

/// Copy-on-write view of the peer map used while one header is processed.
struct PeerOverlay<'a> {
    base: &'a BTreeMap<Vec<u8>, PeerAccount>,
    changed: BTreeMap<Vec<u8>, PeerAccount>,
}

impl<'a> PeerOverlay<'a> {
    fn new(base: &'a BTreeMap<Vec<u8>, PeerAccount>) -> Self {
        Self {
            base,
            changed: BTreeMap::new(),
        }
    }

    fn get_mut(&mut self, key: &[u8]) -> Option<&mut PeerAccount> {
        if !self.changed.contains_key(key) {
            let account = self.base.get(key)?.clone();
            self.changed.insert(key.to_vec(), account);
        }
        self.changed.get_mut(key)
    }
}

pub struct ValidatorStatisticsProcessor {
    ratings: RatingsComputer,
    coordinator: Arc<dyn NodesCoordinator>,
    state: Mutex<StatisticsState>,
}

impl ValidatorStatisticsProcessor {
    pub fn new(config: RatingsConfig, coordinator: Arc<dyn NodesCoordinator>) -> Result<Self, RatingError> {
        Ok(Self {
            ratings: RatingsComputer::new(config)?,
            coordinator,
            state: Mutex::new(StatisticsState::default()),
        })
    }

    pub fn ratings(&self) -> &RatingsComputer {
        &self.ratings
    }

    /// Creates a peer account at the start rating for every genesis node.
    pub fn save_initial_state(&self, nodes: &BTreeMap<u32, Vec<(Vec<u8>, PeerList)>>) {
        let start = self.ratings.start_rating();
        let mut state = self.state.lock();
        for (shard_id, keys) in nodes {
            for (index, (key, list)) in keys.iter().enumerate() {
                state.peers.insert(
                    key.clone(),
                    PeerAccount {
                        public_key: key.clone(),
                        shard_id: *shard_id,
                        list: *list,
                        index_in_list: index as u32,
                        rating: start,
                        temp_rating: start,
                        ..PeerAccount::default()
                    },
                );
            }
        }
        info!(peers = state.peers.len(), "validator statistics initial state saved");
    }

    pub fn peer(&self, key: &[u8]) -> Option<PeerAccount> {
        self.state.lock().peers.get(key).cloned()
    }

    pub fn set_peer(&self, account: PeerAccount) {
        self.state.lock().peers.insert(account.public_key.clone(), account);
    }

    pub fn total_txs(&self) -> u64 {
        self.state.lock().total_txs
    }

    /// Current peer accounts grouped by shard, in key order.
    pub fn validator_infos(&self) -> BTreeMap<u32, Vec<ValidatorInfo>> {
        let state = self.state.lock();
        let mut infos: BTreeMap<u32, Vec<ValidatorInfo>> = BTreeMap::new();
        for peer in state.peers.values() {
            infos.entry(peer.shard_id).or_default().push(peer.clone());
        }
        infos
    }

    /// Records proposer and signer outcomes of `header` and penalises the
    /// rounds missed since `previous`.
    pub fn update_peer_state(&self, header: &HeaderInfo, previous: Option<&HeaderInfo>) -> Result<(), RatingError> {
        if header.nonce == 0 {
            return Ok(());
        }
        let group = self.coordinator.consensus_group(
            &header.prev_rand_seed,
            header.round,
            header.shard_id,
            header.epoch,
        )?;
        if group.is_empty() {
            return Err(RatingError::EmptyConsensusGroup {
                shard_id: header.shard_id,
                round: header.round,
            });
        }

        let mut state = self.state.lock();
        let mut peers = PeerOverlay::new(&state.peers);
        let shard_id = header.shard_id;

        if let Some(previous) = previous {
            if previous.shard_id != shard_id || previous.round >= header.round {
                return Err(RatingError::InvalidHeader(format!(
                    "previous header round {} shard {} does not precede round {} shard {}",
                    previous.round, previous.shard_id, header.round, shard_id
                )));
            }
            self.check_for_missed_blocks(
                &mut peers,
                previous.round,
                header.round,
                &header.prev_rand_seed,
                shard_id,
                header.epoch,
            )?;
        }

        {
            let leader = peers
                .get_mut(&group[0])
                .ok_or_else(|| RatingError::PeerNotFound(display_key(&group[0])))?;
            leader.leader_success += 1;
            leader.consecutive_proposer_misses = 0;
            leader.accumulated_fees = leader.accumulated_fees.saturating_add(header.accumulated_fees);
            leader.temp_rating = self.ratings.compute_increase_proposer(shard_id, leader.temp_rating);
        }
        for (index, key) in group.iter().enumerate() {
            let peer = peers
                .get_mut(key)
                .ok_or_else(|| RatingError::PeerNotFound(display_key(key)))?;
            if header.signed(index) {
                peer.validator_success += 1;
                peer.num_selected_in_success_blocks += 1;
                peer.temp_rating = self.ratings.compute_increase_validator(shard_id, peer.temp_rating);
            } else {
                peer.validator_failure += 1;
                peer.temp_rating = self.ratings.compute_decrease_validator(shard_id, peer.temp_rating);
            }
        }

        let changed = peers.changed;
        let mut delta = PeerDelta::new();
        for (key, account) in changed {
            let old = state.peers.insert(key.clone(), account);
            delta.insert(key, old);
        }
        state.journal.retain(|(hash, _)| hash != &header.hash);
        state.journal.push_back((header.hash.clone(), delta));
        while state.journal.len() > MAX_REVERTIBLE_HEADERS {
            state.journal.pop_front();
        }
        debug!(
            shard_id,
            round = header.round,
            nonce = header.nonce,
            group = group.len(),
            "peer state updated"
        );
        Ok(())
    }

    fn check_for_missed_blocks(
        &self,
        peers: &mut PeerOverlay<'_>,
        previous_round: u64,
        current_round: u64,
        randomness: &[u8],
        shard_id: u32,
        epoch: u32,
    ) -> Result<(), RatingError> {
        if current_round <= previous_round + 1 {
            return Ok(());
        }
        let missed = current_round - previous_round - 1;
        if missed > self.ratings.max_computable_rounds() {
            return self.decrease_all(peers, missed, previous_round + 1, randomness, shard_id, epoch);
        }

        for round in previous_round + 1..current_round {
            let group = self.coordinator.consensus_group(randomness, round, shard_id, epoch)?;
            let leader_key = group
                .first()
                .ok_or(RatingError::EmptyConsensusGroup { shard_id, round })?;
            let leader = peers
                .get_mut(leader_key)
                .ok_or_else(|| RatingError::PeerNotFound(display_key(leader_key)))?;
            leader.leader_failure += 1;
            leader.consecutive_proposer_misses += 1;
            leader.temp_rating = self.ratings.compute_decrease_proposer(
                shard_id,
                leader.temp_rating,
                leader.consecutive_proposer_misses,
            );
        }
        Ok(())
    }

    /// Condensed penalty for gaps too long to replay round by round.
    fn decrease_all(
        &self,
        peers: &mut PeerOverlay<'_>,
        missed: u64,
        first_missed_round: u64,
        randomness: &[u8],
        shard_id: u32,
        epoch: u32,
    ) -> Result<(), RatingError> {
        let eligible = self.coordinator.eligible_validators(shard_id, epoch)?;
        if eligible.is_empty() {
            return Err(RatingError::NoEligibleValidators(shard_id));
        }
        let leader_probability = missed as f64 / eligible.len() as f64;
        let group_size = self.coordinator.consensus_group_size(shard_id) as f64;
        let per_validator = (leader_probability * group_size).ceil() as u32;
        let leader_penalty = leader_probability.ceil() as u32;

        let steps = self.ratings.steps(shard_id);
        for key in eligible.iter() {
            let peer = peers
                .get_mut(key)
                .ok_or_else(|| RatingError::PeerNotFound(display_key(key)))?;
            peer.validator_failure = peer.validator_failure.saturating_add(per_validator);
            let decrease = i64::from(steps.decrease_validator) * i64::from(per_validator);
            peer.temp_rating = self.ratings.apply(peer.temp_rating, -decrease);
        }

        let group = self
            .coordinator
            .consensus_group(randomness, first_missed_round, shard_id, epoch)?;
        let leader_key = group.first().ok_or(RatingError::EmptyConsensusGroup {
            shard_id,
            round: first_missed_round,
        })?;
        let leader = peers
            .get_mut(leader_key)
            .ok_or_else(|| RatingError::PeerNotFound(display_key(leader_key)))?;
        leader.leader_failure = leader.leader_failure.saturating_add(leader_penalty);
        let decrease = i64::from(steps.decrease_proposer) * i64::from(leader_penalty);
        leader.temp_rating = self.ratings.apply(leader.temp_rating, -decrease);

        debug!(shard_id, missed, per_validator, leader_penalty, "missed rounds penalised in bulk");
        Ok(())
    }

    /// Restores the peer accounts to what they were before `header` was
    /// processed. Headers processed after it are undone as well.
    pub fn revert_peer_state(&self, header: &HeaderInfo) -> Result<(), RatingError> {
        if !self.state.lock().undo(&header.hash) {
            return Err(RatingError::InvalidHeader(format!(
                "no peer state recorded for header {}",
                display_key(&header.hash)
            )));
        }
        Ok(())
    }

    /// Drops the revert records of `hash` and every header before it.
    pub fn header_final(&self, hash: &[u8]) {
        let mut state = self.state.lock();
        if let Some(position) = state.journal.iter().position(|(h, _)| h.as_slice() == hash) {
            state.journal.drain(..=position);
        }
    }

    pub fn revertible_headers(&self) -> usize {
        self.state.lock().journal.len()
    }

    pub fn header_executed(&self, header: &HeaderInfo) {
        let mut state = self.state.lock();
        state.total_txs = state.total_txs.saturating_add(header.tx_count);
    }

    /// Undoes `header_executed` and, when the header was processed, its
    /// peer state changes.
    pub fn header_reverted(&self, header: &HeaderInfo) {
        let mut state = self.state.lock();
        state.total_txs = state.total_txs.saturating_sub(header.tx_count);
        state.undo(&header.hash);
    }

    /// Penalises validators that signed too few blocks, then resets the
    /// per-epoch counters.
    pub fn process_ratings_end_of_epoch(
        &self,
        infos: &mut BTreeMap<u32, Vec<ValidatorInfo>>,
        epoch: u32,
    ) -> Result<(), RatingError> {
        if infos.values().all(Vec::is_empty) {
            return Err(RatingError::EmptyValidatorInfos);
        }
        let threshold = self.ratings.signed_blocks_threshold();
        for (shard_id, validators) in infos.iter_mut() {
            let step = self.ratings.steps(*shard_id).increase_validator;
            for info in validators.iter_mut() {
                if info.num_selected_in_success_blocks == 0 {
                    continue;
                }
                let appearances = u64::from(info.validator_success) + u64::from(info.validator_failure);
                let signed_ratio = info.validator_success as f32 / appearances as f32;
                if signed_ratio >= threshold {
                    continue;
                }
                let decrease = i64::from(step) * i64::from(info.validator_failure);
                info.temp_rating = self.ratings.apply(info.temp_rating, -decrease);
                debug!(
                    epoch,
                    shard_id,
                    key = %display_key(&info.public_key),
                    signed_ratio,
                    temp_rating = info.temp_rating,
                    "rating decreased for low signing rate"
                );
            }
        }
        self.reset_validator_statistics_at_new_epoch(infos);
        info!(epoch, "ratings committed at end of epoch");
        Ok(())
    }

    /// Folds per-epoch counters into totals, commits `temp_rating` and
    /// stores the result as the peer accounts.
    pub fn reset_validator_statistics_at_new_epoch(&self, infos: &mut BTreeMap<u32, Vec<ValidatorInfo>>) {
        let mut state = self.state.lock();
        for (shard_id, validators) in infos.iter_mut() {
            for info in validators.iter_mut() {
                info.shard_id = *shard_id;
                info.total_leader_success = info.total_leader_success.saturating_add(info.leader_success);
                info.total_leader_failure = info.total_leader_failure.saturating_add(info.leader_failure);
                info.total_validator_success = info.total_validator_success.saturating_add(info.validator_success);
                info.total_validator_failure = info.total_validator_failure.saturating_add(info.validator_failure);
                info.leader_success = 0;
                info.leader_failure = 0;
                info.validator_success = 0;
                info.validator_failure = 0;
                info.num_selected_in_success_blocks = 0;
                info.accumulated_fees = Uint128::zero();
                info.rating = info.temp_rating;
                state.peers.insert(info.public_key.clone(), info.clone());
            }
        }
        state.journal.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RatingStepsConfig;
    use crate::rating::METACHAIN_SHARD_ID;

    /// Round-robin coordinator over a fixed key set; group size is the whole
    /// set, leader rotates with the round.
    struct RoundRobin {
        keys: Vec<Vec<u8>>,
    }

    impl NodesCoordinator for RoundRobin {
        fn consensus_group(&self, _: &[u8], round: u64, _: u32, _: u32) -> Result<Vec<Vec<u8>>, RatingError> {
            let n = self.keys.len();
            Ok((0..n).map(|i| self.keys[(round as usize + i) % n].clone()).collect())
        }

        fn eligible_validators(&self, _: u32, _: u32) -> Result<Vec<Vec<u8>>, RatingError> {
            Ok(self.keys.clone())
        }

        fn consensus_group_size(&self, _: u32) -> usize {
            self.keys.len()
        }
    }

    fn keys() -> Vec<Vec<u8>> {
        vec![b"k0".to_vec(), b"k1".to_vec(), b"k2".to_vec()]
    }

    fn processor(config: RatingsConfig) -> ValidatorStatisticsProcessor {
        let processor =
            ValidatorStatisticsProcessor::new(config, Arc::new(RoundRobin { keys: keys() })).unwrap();
        let nodes: BTreeMap<u32, Vec<(Vec<u8>, PeerList)>> = BTreeMap::from([(0u32, keys().into_iter().map(|k| (k, PeerList::Eligible)).collect())]);
        processor.save_initial_state(&nodes);
        processor
    }

    fn header(round: u64, bitmap: u8) -> HeaderInfo {
        HeaderInfo {
            hash: format!("h{round}").into_bytes(),
            nonce: round,
            round,
            pub_keys_bitmap: vec![bitmap],
            tx_count: 1,
            ..HeaderInfo::default()
        }
    }

    fn end_of_epoch_config(meta_step: u32, shard_step: u32) -> RatingsConfig {
        let defaults = RatingsConfig::default();
        RatingsConfig {
            min_rating: 1_000,
            max_rating: 10_000,
            signed_blocks_threshold: 0.025,
            meta: RatingStepsConfig {
                increase_validator: meta_step,
                ..defaults.meta.clone()
            },
            shard: RatingStepsConfig {
                increase_validator: shard_step,
                ..defaults.shard.clone()
            },
            ..defaults
        }
    }

    fn low_signers() -> BTreeMap<u32, Vec<ValidatorInfo>> {
        BTreeMap::from([
            (
                METACHAIN_SHARD_ID,
                vec![PeerAccount {
                    public_key: b"meta".to_vec(),
                    temp_rating: 5_000,
                    validator_success: 2,
                    validator_failure: 98,
                    num_selected_in_success_blocks: 2,
                    ..PeerAccount::default()
                }],
            ),
            (
                0,
                vec![PeerAccount {
                    public_key: b"shard".to_vec(),
                    temp_rating: 8_000,
                    validator_success: 1,
                    validator_failure: 99,
                    num_selected_in_success_blocks: 1,
                    ..PeerAccount::default()
                }],
            ),
        ])
    }

    #[test]
    fn signed_and_unsigned_members() {
        let p = processor(RatingsConfig::default());
        // round 1: leader k1, k2 signed, k0 did not
        p.update_peer_state(&header(1, 0b011), None).unwrap();

        let leader = p.peer(b"k1").unwrap();
        assert_eq!(leader.leader_success, 1);
        assert_eq!(leader.validator_success, 1);
        assert_eq!(leader.temp_rating, 5_000 + 10 + 2);

        let missing = p.peer(b"k0").unwrap();
        assert_eq!(missing.validator_failure, 1);
        assert_eq!(missing.temp_rating, 5_000 - 4);
    }

    #[test]
    fn missed_rounds_penalise_would_be_leaders() {
        let p = processor(RatingsConfig::default());
        let first = header(1, 0b111);
        p.update_peer_state(&first, None).unwrap();
        // rounds 2 and 3 missed: k2 then k0 would have led
        p.update_peer_state(&header(4, 0b111), Some(&first)).unwrap();

        assert_eq!(p.peer(b"k2").unwrap().leader_failure, 1);
        assert_eq!(p.peer(b"k0").unwrap().leader_failure, 1);
        assert_eq!(p.peer(b"k0").unwrap().consecutive_proposer_misses, 1);
        assert_eq!(p.peer(b"k1").unwrap().leader_success, 2);
        assert_eq!(p.peer(b"k1").unwrap().consecutive_proposer_misses, 0);
    }

    #[test]
    fn long_gaps_are_penalised_in_bulk() {
        let config = RatingsConfig {
            max_computable_rounds: 2,
            ..RatingsConfig::default()
        };
        let p = processor(config);
        let first = header(1, 0b111);
        p.update_peer_state(&first, None).unwrap();
        // 6 missed rounds over 3 eligible: leaderProb 2, per validator 6, leader 2
        p.update_peer_state(&header(8, 0b111), Some(&first)).unwrap();

        assert_eq!(p.peer(b"k0").unwrap().validator_failure, 6);
        // first missed round 2 is led by k2
        assert_eq!(p.peer(b"k2").unwrap().leader_failure, 2);
        assert_eq!(p.peer(b"k1").unwrap().leader_failure, 0);
    }

    #[test]
    fn revert_restores_previous_accounts() {
        let p = processor(RatingsConfig::default());
        let before = p.peer(b"k1").unwrap();
        let h = header(1, 0b001);
        p.update_peer_state(&h, None).unwrap();
        assert_ne!(p.peer(b"k1").unwrap(), before);

        p.revert_peer_state(&h).unwrap();
        assert_eq!(p.peer(b"k1").unwrap(), before);
        assert!(matches!(p.revert_peer_state(&h), Err(RatingError::InvalidHeader(_))));
    }

    #[test]
    fn revert_records_only_touched_peers() {
        let p = processor(RatingsConfig::default());
        p.set_peer(PeerAccount {
            public_key: b"idle".to_vec(),
            rating: 5_000,
            temp_rating: 5_000,
            ..PeerAccount::default()
        });
        p.update_peer_state(&header(1, 0b111), None).unwrap();

        let state = p.state.lock();
        let (hash, delta) = state.journal.back().unwrap();
        assert_eq!(hash, &b"h1".to_vec());
        assert_eq!(delta.len(), 3);
        assert!(!delta.contains_key(b"idle".as_slice()));
    }

    #[test]
    fn reverting_an_older_header_undoes_later_ones() {
        let p = processor(RatingsConfig::default());
        let before = p.peer(b"k0").unwrap();
        let first = header(1, 0b111);
        let second = header(2, 0b111);
        p.update_peer_state(&first, None).unwrap();
        p.update_peer_state(&second, Some(&first)).unwrap();

        p.revert_peer_state(&first).unwrap();
        assert_eq!(p.peer(b"k0").unwrap(), before);
        assert_eq!(p.revertible_headers(), 0);
    }

    #[test]
    fn revert_window_is_bounded() {
        let p = processor(RatingsConfig::default());
        let mut previous = header(1, 0b111);
        p.update_peer_state(&previous, None).unwrap();
        for round in 2..=(MAX_REVERTIBLE_HEADERS as u64 + 20) {
            let next = header(round, 0b111);
            p.update_peer_state(&next, Some(&previous)).unwrap();
            previous = next;
        }
        assert_eq!(p.revertible_headers(), MAX_REVERTIBLE_HEADERS);
        assert!(p.revert_peer_state(&header(1, 0b111)).is_err());

        p.header_final(&previous.hash);
        assert_eq!(p.revertible_headers(), 0);
    }

    #[test]
    fn unknown_peer_is_an_error() {
        let p = ValidatorStatisticsProcessor::new(
            RatingsConfig::default(),
            Arc::new(RoundRobin { keys: keys() }),
        )
        .unwrap();
        assert!(matches!(
            p.update_peer_state(&header(1, 0b111), None),
            Err(RatingError::PeerNotFound(_))
        ));
    }

    #[test]
    fn end_of_epoch_below_threshold() {
        let p = processor(end_of_epoch_config(3, 1));
        let mut infos = low_signers();
        p.process_ratings_end_of_epoch(&mut infos, 1).unwrap();

        assert_eq!(infos[&METACHAIN_SHARD_ID][0].temp_rating, 4_706);
        assert_eq!(infos[&0][0].temp_rating, 7_901);
        let meta = p.peer(b"meta").unwrap();
        assert_eq!(meta.rating, 4_706);
        assert_eq!(meta.total_validator_failure, 98);
        assert_eq!(meta.validator_failure, 0);
        assert_eq!(meta.num_selected_in_success_blocks, 0);
    }

    #[test]
    fn end_of_epoch_clamps_at_min_rating() {
        let p = processor(end_of_epoch_config(100, 99));
        let mut infos = low_signers();
        p.process_ratings_end_of_epoch(&mut infos, 1).unwrap();

        assert_eq!(infos[&METACHAIN_SHARD_ID][0].temp_rating, 1_000);
        assert_eq!(infos[&0][0].temp_rating, 1_000);
    }

    #[test]
    fn end_of_epoch_rejects_empty_infos() {
        let p = processor(RatingsConfig::default());
        assert!(matches!(
            p.process_ratings_end_of_epoch(&mut BTreeMap::new(), 1),
            Err(RatingError::EmptyValidatorInfos)
        ));
    }

    #[test]
    fn concurrent_header_executed_and_reverted() {
        let p = Arc::new(processor(RatingsConfig::default()));
        let handles: Vec<_> = (0..100)
            .map(|i| {
                let p = p.clone();
                std::thread::spawn(move || {
                    let h = header(i + 1, 0b111);
                    p.header_executed(&h);
                    if i % 2 == 0 {
                        p.header_reverted(&h);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(p.total_txs(), 50);
    }
}
