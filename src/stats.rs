// Copyright 2020 Joyent, Inc.

//! Per-type and per-user RPC statistics.
//!
//! Types and users are interned into fixed tables on first sight. A sample
//! for a new key that finds no free slot is dropped. Type id 0 marks a free
//! slot; user slot 0 always belongs to uid 0.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;

use crate::msg::{MsgType, RollupStat, StatsMsg, TypeStat, UserStat};
use crate::storage::ROLLUP_COUNT;

pub const TYPE_SLOTS: usize = 200;
pub const USER_SLOTS: usize = 200;

#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    id: u32,
    count: u32,
    time: u64,
}

#[derive(Debug)]
struct StatsInner {
    time_start: i64,
    rollups: [RollupStat; ROLLUP_COUNT],
    types: Vec<Slot>,
    users: Vec<Slot>,
    root_seen: bool,
}

fn micros(elapsed: Duration) -> u64 {
    elapsed.as_micros() as u64
}

/// First slot holding `id`, else the first free slot. Slot 0 is skipped
/// when `reserved_zero` is set.
fn intern(slots: &mut [Slot], id: u32, reserved_zero: bool) -> Option<&mut Slot> {
    let first = if reserved_zero { 1 } else { 0 };
    let pos = slots[first..]
        .iter()
        .position(|s| s.id == id || s.id == 0)?;
    let slot = &mut slots[first + pos];
    slot.id = id;
    Some(slot)
}

impl StatsInner {
    fn new() -> StatsInner {
        StatsInner {
            time_start: Utc::now().timestamp(),
            rollups: Default::default(),
            types: vec![Slot::default(); TYPE_SLOTS],
            users: vec![Slot::default(); USER_SLOTS],
            root_seen: false,
        }
    }

    fn record(&mut self, msg_type: MsgType, uid: u32, time: u64) {
        if let Some(slot) = intern(&mut self.types, msg_type as u32, false) {
            slot.count += 1;
            slot.time += time;
        }
        let slot = if uid == 0 {
            self.root_seen = true;
            Some(&mut self.users[0])
        } else {
            intern(&mut self.users, uid, true)
        };
        if let Some(slot) = slot {
            slot.count += 1;
            slot.time += time;
        }
    }

    fn snapshot(&self) -> StatsMsg {
        let types = self
            .types
            .iter()
            .filter(|s| s.id != 0)
            .map(|s| TypeStat {
                msg_type: s.id as u16,
                count: s.count,
                total_time: s.time,
            })
            .collect();
        let users = self
            .users
            .iter()
            .enumerate()
            .filter(|(i, s)| if *i == 0 { self.root_seen } else { s.id != 0 })
            .map(|(_, s)| UserStat {
                uid: s.id,
                count: s.count,
                total_time: s.time,
            })
            .collect();
        StatsMsg {
            time_start: self.time_start,
            rollups: self.rollups.to_vec(),
            types,
            users,
        }
    }

    fn reset(&mut self) {
        self.time_start = Utc::now().timestamp();
        self.rollups = Default::default();
        for slot in self.types.iter_mut().chain(self.users.iter_mut()) {
            slot.count = 0;
            slot.time = 0;
        }
    }
}

#[derive(Debug)]
pub struct RpcStats {
    inner: Mutex<StatsInner>,
}

impl Default for RpcStats {
    fn default() -> Self {
        RpcStats::new()
    }
}

impl RpcStats {
    pub fn new() -> RpcStats {
        RpcStats {
            inner: Mutex::new(StatsInner::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatsInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Account one handled message.
    pub fn record(&self, msg_type: MsgType, uid: u32, elapsed: Duration) {
        self.lock().record(msg_type, uid, micros(elapsed));
    }

    /// Account one rollup run with the elapsed time of each tier.
    pub fn record_rollup(&self, timers: &[Duration; ROLLUP_COUNT]) {
        let mut inner = self.lock();
        for (stat, elapsed) in inner.rollups.iter_mut().zip(timers.iter()) {
            let time = micros(*elapsed);
            stat.count += 1;
            stat.total_time += time;
            stat.max_time = stat.max_time.max(time);
        }
    }

    pub fn snapshot(&self) -> StatsMsg {
        self.lock().snapshot()
    }

    /// Zero all counters and times. Learned ids are kept.
    pub fn reset(&self) {
        self.lock().reset()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck::quickcheck;

    fn sample_type(i: u8) -> MsgType {
        MsgType::ALL[i as usize % MsgType::ALL.len()]
    }

    #[test]
    fn root_has_its_own_slot() {
        let stats = RpcStats::new();
        stats.record(MsgType::GetAccounts, 0, Duration::from_micros(5));
        stats.record(MsgType::GetAccounts, 1000, Duration::from_micros(7));
        let snap = stats.snapshot();
        assert_eq!(snap.users.len(), 2);
        assert_eq!(snap.users[0].uid, 0);
        assert_eq!(snap.users[0].count, 1);
        assert_eq!(snap.users[1].uid, 1000);
        assert_eq!(snap.types.len(), 1);
        assert_eq!(snap.types[0].total_time, 12);
    }

    #[test]
    fn full_table_drops_new_keys() {
        let stats = RpcStats::new();
        for uid in 1..(USER_SLOTS as u32 + 10) {
            stats.record(MsgType::GetQos, uid, Duration::from_micros(1));
        }
        let snap = stats.snapshot();
        assert_eq!(snap.users.len(), USER_SLOTS - 1);
        assert_eq!(snap.type_count_sum(), u64::from(USER_SLOTS as u32 + 9));
    }

    #[test]
    fn reset_keeps_ids() {
        let stats = RpcStats::new();
        stats.record(MsgType::GetUsers, 1000, Duration::from_micros(3));
        stats.record_rollup(&[Duration::from_micros(10); ROLLUP_COUNT]);
        stats.reset();
        let first = stats.snapshot();
        assert_eq!(first.types.len(), 1);
        assert_eq!(first.types[0].count, 0);
        assert_eq!(first.users[0].uid, 1000);
        assert!(first.rollups.iter().all(|r| r.count == 0 && r.max_time == 0));

        stats.reset();
        let second = stats.snapshot();
        assert_eq!(first.types, second.types);
        assert_eq!(first.users, second.users);
        assert_eq!(first.rollups, second.rollups);
    }

    #[test]
    fn rollup_tracks_max() {
        let stats = RpcStats::new();
        stats.record_rollup(&[
            Duration::from_micros(5),
            Duration::from_micros(6),
            Duration::from_micros(7),
        ]);
        stats.record_rollup(&[
            Duration::from_micros(9),
            Duration::from_micros(1),
            Duration::from_micros(7),
        ]);
        let snap = stats.snapshot();
        assert_eq!(snap.rollups.len(), ROLLUP_COUNT);
        assert_eq!(snap.rollups[0].max_time, 9);
        assert_eq!(snap.rollups[1].max_time, 6);
        assert_eq!(snap.rollups[2].total_time, 14);
        assert_eq!(snap.rollups[2].count, 2);
    }

    quickcheck! {
        fn counts_sum_to_samples(samples: Vec<(u8, u8)>) -> bool {
            let stats = RpcStats::new();
            for (t, u) in &samples {
                stats.record(sample_type(*t), u32::from(*u), Duration::from_micros(1));
            }
            let snap = stats.snapshot();
            snap.type_count_sum() == samples.len() as u64
                && snap.user_count_sum() == samples.len() as u64
        }
    }
}
