// Copyright 2020 Joyent, Inc.

//! In-memory accounting store.
//!
//! A session stages each write as a replayable mutation and also applies it
//! to a private view: a copy of the committed store taken at the session's
//! first pending write. Reads with writes pending see that view. On
//! `commit(true)` the view is published as is when no other session has
//! committed since it was taken; otherwise the staged mutations are
//! replayed against a copy of the current store, which is published only
//! if every mutation still applies.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{Datelike, NaiveDate, NaiveDateTime, Utc};

use crate::msg::{
    AcctCoordMsg, ArchiveDumpMsg, ArchiveLoadMsg, CheckpointMsg, ClusterTresMsg,
    JobCompleteMsg, JobStartMsg, JobSuspendMsg, ModifyJobMsg, ModifyMsg, NodeStateMsg,
    RollUsageMsg, StepCompleteMsg, StepStartMsg, UsageMsg, NODE_STATE_DOWN,
};
use crate::privilege::AdminLevel;
use crate::rc::SLURM_NO_CHANGE_IN_DATA;
use crate::records::{
    AccountRec, AssocRec, ClusterRec, EventCond, EventRec, FederationRec, JobCond, JobRec,
    ObjectCond, QosRec, ReservationRec, ResourceRec, StepRec, TresRec, TxnRec, UsageRec,
    UserRec, WckeyRec, EVENT_CLUSTER, EVENT_NODE,
};
use crate::storage::{
    AcctStorage, StorageError, StorageResult, StorageSession, UsageKind, ROLLUP_COUNT,
};

pub const JOB_PENDING: u32 = 0;
pub const JOB_RUNNING: u32 = 1;
pub const JOB_SUSPENDED: u32 = 2;
pub const JOB_COMPLETE: u32 = 3;
pub const JOB_CANCELLED: u32 = 4;

pub const TXN_ADD: u16 = 1;
pub const TXN_MODIFY: u16 = 2;
pub const TXN_REMOVE: u16 = 3;

const HOUR: i64 = 3600;
const DAY: i64 = 24 * HOUR;

const TIER_HOUR: usize = 0;
const TIER_DAY: usize = 1;
const TIER_MONTH: usize = 2;

const ARCHIVE_DEFAULT: &str = "default";

fn now() -> i64 {
    Utc::now().timestamp()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn check_name(name: &str) -> StorageResult<()> {
    let bad = |c: char| c.is_whitespace() || c == ',' || c == '\'' || c == '"';
    if name.is_empty() || name.contains(bad) {
        return Err(StorageError::bad_name(name));
    }
    Ok(())
}

fn set_opt(dst: &mut Option<String>, src: &Option<String>) {
    if src.is_some() {
        *dst = src.clone();
    }
}

fn set_nonzero<T: Copy + Default + PartialEq>(dst: &mut T, src: T) {
    if src != T::default() {
        *dst = src;
    }
}

fn set_list(dst: &mut Vec<String>, src: &[String]) {
    if !src.is_empty() {
        *dst = src.to_vec();
    }
}

/// `"1=4,2=1024"` into `(tres_id, count)` pairs. Malformed pairs are skipped.
fn parse_tres(tres: &str) -> Vec<(u32, u64)> {
    tres.split(',')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let id = parts.next()?.trim().parse().ok()?;
            let count = parts.next()?.trim().parse().ok()?;
            Some((id, count))
        })
        .collect()
}

fn hour_start(t: i64) -> i64 {
    t - t.rem_euclid(HOUR)
}

fn day_start(t: i64) -> i64 {
    t - t.rem_euclid(DAY)
}

fn month_start(t: i64) -> i64 {
    NaiveDateTime::from_timestamp_opt(t, 0)
        .and_then(|dt| NaiveDate::from_ymd_opt(dt.year(), dt.month(), 1))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.timestamp())
        .unwrap_or_else(|| day_start(t))
}

const TIER_BUCKETS: [fn(i64) -> i64; ROLLUP_COUNT] = [hour_start, day_start, month_start];

fn usage_slot(kind: UsageKind) -> usize {
    match kind {
        UsageKind::Assoc => 0,
        UsageKind::Cluster => 1,
        UsageKind::Wckey => 2,
    }
}

#[derive(Clone, Copy, Debug)]
struct Actor {
    uid: u32,
    slurm_user_id: u32,
    now: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct UsageKey {
    id: u32,
    cluster: String,
    period: i64,
    tres_id: u32,
}

type UsageTable = BTreeMap<UsageKey, u64>;

#[derive(Clone, Debug, Default)]
struct Store {
    accounts: BTreeMap<String, AccountRec>,
    assocs: BTreeMap<String, AssocRec>,
    clusters: BTreeMap<String, ClusterRec>,
    federations: BTreeMap<String, FederationRec>,
    qos: BTreeMap<String, QosRec>,
    resources: BTreeMap<String, ResourceRec>,
    tres: BTreeMap<String, TresRec>,
    users: BTreeMap<String, UserRec>,
    wckeys: BTreeMap<String, WckeyRec>,
    reservations: BTreeMap<String, ReservationRec>,
    jobs: BTreeMap<u64, JobRec>,
    suspend_start: BTreeMap<u64, i64>,
    last_suspend_event: BTreeMap<u64, i64>,
    checkpoints: BTreeMap<(u64, u32), i64>,
    archives: BTreeMap<String, Vec<JobRec>>,
    events: Vec<EventRec>,
    txn: Vec<TxnRec>,
    /// Indexed by usage kind, then rollup tier.
    usage: [[UsageTable; ROLLUP_COUNT]; 3],
    last_id: u32,
    last_txn: u32,
    /// Bumped on every publish of the shared store.
    generation: u64,
}

/// An accounting object kind handled by the generic add/get/modify/remove
/// paths.
trait Entity: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn table(store: &Store) -> &BTreeMap<String, Self>;
    fn table_mut(store: &mut Store) -> &mut BTreeMap<String, Self>;
    fn key(&self) -> String;
    fn name(&self) -> &str;
    fn selected(&self, cond: &ObjectCond) -> bool;
    fn merge(&mut self, changes: &Self);

    fn id_slot(&mut self) -> Option<&mut u32> {
        None
    }

    /// Checks against the rest of the store before insertion.
    fn check(&self, _store: &Store) -> StorageResult<()> {
        Ok(())
    }

    /// Checks over the whole table after an add or modify.
    fn after_change(_store: &Store) -> StorageResult<()> {
        Ok(())
    }

    fn removed(_store: &mut Store, _rec: &Self) {}
}

impl Entity for AccountRec {
    const KIND: &'static str = "account";

    fn table(store: &Store) -> &BTreeMap<String, Self> {
        &store.accounts
    }

    fn table_mut(store: &mut Store) -> &mut BTreeMap<String, Self> {
        &mut store.accounts
    }

    fn key(&self) -> String {
        self.name.clone()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn selected(&self, cond: &ObjectCond) -> bool {
        cond.match_name(&self.name)
    }

    fn merge(&mut self, changes: &Self) {
        set_opt(&mut self.description, &changes.description);
        set_opt(&mut self.organization, &changes.organization);
        set_nonzero(&mut self.flags, changes.flags);
    }

    fn removed(store: &mut Store, rec: &Self) {
        store.assocs.retain(|_, a| a.account != rec.name);
        for user in store.users.values_mut() {
            user.coord_accts.retain(|a| *a != rec.name);
        }
    }
}

impl Entity for AssocRec {
    const KIND: &'static str = "association";

    fn table(store: &Store) -> &BTreeMap<String, Self> {
        &store.assocs
    }

    fn table_mut(store: &mut Store) -> &mut BTreeMap<String, Self> {
        &mut store.assocs
    }

    fn key(&self) -> String {
        format!(
            "C = {} A = {} U = {} P = {}",
            self.cluster,
            self.account,
            self.user.as_deref().unwrap_or(""),
            self.partition.as_deref().unwrap_or("")
        )
    }

    fn name(&self) -> &str {
        &self.account
    }

    fn selected(&self, cond: &ObjectCond) -> bool {
        cond.match_id(self.id)
            && cond.match_cluster(&self.cluster)
            && cond.match_account(&self.account)
            && (cond.users.is_empty() || cond.match_user(&self.user))
            && (cond.partitions.is_empty() || cond.match_partition(&self.partition))
    }

    fn merge(&mut self, changes: &Self) {
        set_opt(&mut self.parent_account, &changes.parent_account);
        set_nonzero(&mut self.shares, changes.shares);
        set_list(&mut self.qos, &changes.qos);
        set_nonzero(&mut self.is_def, changes.is_def);
    }

    fn id_slot(&mut self) -> Option<&mut u32> {
        Some(&mut self.id)
    }

    fn check(&self, store: &Store) -> StorageResult<()> {
        check_name(&self.cluster)?;
        if !store.clusters.contains_key(&self.cluster) {
            return Err(StorageError::error(&format!(
                "cluster {} does not exist",
                self.cluster
            )));
        }
        if !store.accounts.contains_key(&self.account) {
            return Err(StorageError::error(&format!(
                "account {} does not exist",
                self.account
            )));
        }
        Ok(())
    }
}

impl Entity for ClusterRec {
    const KIND: &'static str = "cluster";

    fn table(store: &Store) -> &BTreeMap<String, Self> {
        &store.clusters
    }

    fn table_mut(store: &mut Store) -> &mut BTreeMap<String, Self> {
        &mut store.clusters
    }

    fn key(&self) -> String {
        self.name.clone()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn selected(&self, cond: &ObjectCond) -> bool {
        cond.match_name(&self.name)
    }

    fn merge(&mut self, changes: &Self) {
        set_opt(&mut self.control_host, &changes.control_host);
        set_nonzero(&mut self.control_port, changes.control_port);
        set_nonzero(&mut self.rpc_version, changes.rpc_version);
        set_nonzero(&mut self.flags, changes.flags);
        set_opt(&mut self.tres_str, &changes.tres_str);
    }

    fn removed(store: &mut Store, rec: &Self) {
        store.assocs.retain(|_, a| a.cluster != rec.name);
        store.wckeys.retain(|_, w| w.cluster != rec.name);
    }
}

impl Entity for FederationRec {
    const KIND: &'static str = "federation";

    fn table(store: &Store) -> &BTreeMap<String, Self> {
        &store.federations
    }

    fn table_mut(store: &mut Store) -> &mut BTreeMap<String, Self> {
        &mut store.federations
    }

    fn key(&self) -> String {
        self.name.clone()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn selected(&self, cond: &ObjectCond) -> bool {
        cond.match_name(&self.name)
            && (cond.clusters.is_empty()
                || self.clusters.iter().any(|c| cond.match_cluster(c)))
    }

    fn merge(&mut self, changes: &Self) {
        set_nonzero(&mut self.flags, changes.flags);
        set_list(&mut self.clusters, &changes.clusters);
    }
}

impl Entity for QosRec {
    const KIND: &'static str = "qos";

    fn table(store: &Store) -> &BTreeMap<String, Self> {
        &store.qos
    }

    fn table_mut(store: &mut Store) -> &mut BTreeMap<String, Self> {
        &mut store.qos
    }

    fn key(&self) -> String {
        self.name.clone()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn selected(&self, cond: &ObjectCond) -> bool {
        cond.match_id(self.id) && cond.match_name(&self.name)
    }

    fn merge(&mut self, changes: &Self) {
        set_opt(&mut self.description, &changes.description);
        set_nonzero(&mut self.priority, changes.priority);
        set_list(&mut self.preempt, &changes.preempt);
        set_nonzero(&mut self.flags, changes.flags);
        set_nonzero(&mut self.grace_time, changes.grace_time);
    }

    fn id_slot(&mut self) -> Option<&mut u32> {
        Some(&mut self.id)
    }

    fn after_change(store: &Store) -> StorageResult<()> {
        if store.qos.keys().any(|name| preempts(&store.qos, name, name)) {
            return Err(StorageError::qos_preemption_loop());
        }
        Ok(())
    }
}

/// True when `from` can preempt `target` through any chain of QOS.
fn preempts(qos: &BTreeMap<String, QosRec>, from: &str, target: &str) -> bool {
    let mut seen = BTreeSet::new();
    let mut queue = vec![from.to_string()];
    while let Some(name) = queue.pop() {
        let rec = match qos.get(&name) {
            Some(rec) => rec,
            None => continue,
        };
        for next in &rec.preempt {
            if next == target {
                return true;
            }
            if seen.insert(next.clone()) {
                queue.push(next.clone());
            }
        }
    }
    false
}

impl Entity for ResourceRec {
    const KIND: &'static str = "resource";

    fn table(store: &Store) -> &BTreeMap<String, Self> {
        &store.resources
    }

    fn table_mut(store: &mut Store) -> &mut BTreeMap<String, Self> {
        &mut store.resources
    }

    fn key(&self) -> String {
        match &self.server {
            Some(server) => format!("{}@{}", self.name, server),
            None => self.name.clone(),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn selected(&self, cond: &ObjectCond) -> bool {
        cond.match_id(self.id)
            && cond.match_name(&self.name)
            && (cond.clusters.is_empty()
                || self.clusters.iter().any(|c| cond.match_cluster(c)))
    }

    fn merge(&mut self, changes: &Self) {
        set_opt(&mut self.description, &changes.description);
        set_nonzero(&mut self.count, changes.count);
        set_list(&mut self.clusters, &changes.clusters);
        set_nonzero(&mut self.flags, changes.flags);
    }

    fn id_slot(&mut self) -> Option<&mut u32> {
        Some(&mut self.id)
    }
}

impl Entity for TresRec {
    const KIND: &'static str = "tres";

    fn table(store: &Store) -> &BTreeMap<String, Self> {
        &store.tres
    }

    fn table_mut(store: &mut Store) -> &mut BTreeMap<String, Self> {
        &mut store.tres
    }

    fn key(&self) -> String {
        match &self.name {
            Some(name) => format!("{}/{}", self.tres_type, name),
            None => self.tres_type.clone(),
        }
    }

    fn name(&self) -> &str {
        &self.tres_type
    }

    fn selected(&self, cond: &ObjectCond) -> bool {
        cond.match_id(self.id)
            && (cond.match_name(&self.tres_type) || cond.match_name(&self.key()))
    }

    fn merge(&mut self, changes: &Self) {
        set_nonzero(&mut self.count, changes.count);
    }

    fn id_slot(&mut self) -> Option<&mut u32> {
        Some(&mut self.id)
    }
}

impl Entity for UserRec {
    const KIND: &'static str = "user";

    fn table(store: &Store) -> &BTreeMap<String, Self> {
        &store.users
    }

    fn table_mut(store: &mut Store) -> &mut BTreeMap<String, Self> {
        &mut store.users
    }

    fn key(&self) -> String {
        self.name.clone()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn selected(&self, cond: &ObjectCond) -> bool {
        cond.match_id(self.uid) && cond.match_name(&self.name)
    }

    fn merge(&mut self, changes: &Self) {
        set_opt(&mut self.default_acct, &changes.default_acct);
        set_opt(&mut self.default_wckey, &changes.default_wckey);
        if changes.admin_level != AdminLevel::NotSet {
            self.admin_level = changes.admin_level;
        }
    }

    fn removed(store: &mut Store, rec: &Self) {
        store
            .assocs
            .retain(|_, a| a.user.as_deref() != Some(rec.name.as_str()));
        store.wckeys.retain(|_, w| w.user != rec.name);
    }
}

impl Entity for WckeyRec {
    const KIND: &'static str = "wckey";

    fn table(store: &Store) -> &BTreeMap<String, Self> {
        &store.wckeys
    }

    fn table_mut(store: &mut Store) -> &mut BTreeMap<String, Self> {
        &mut store.wckeys
    }

    fn key(&self) -> String {
        format!("C = {} W = {} U = {}", self.cluster, self.name, self.user)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn selected(&self, cond: &ObjectCond) -> bool {
        cond.match_id(self.id)
            && cond.match_name(&self.name)
            && cond.match_cluster(&self.cluster)
            && (cond.users.is_empty() || cond.users.contains(&self.user))
    }

    fn merge(&mut self, changes: &Self) {
        set_nonzero(&mut self.is_def, changes.is_def);
    }

    fn id_slot(&mut self) -> Option<&mut u32> {
        Some(&mut self.id)
    }

    fn check(&self, _store: &Store) -> StorageResult<()> {
        check_name(&self.user)?;
        check_name(&self.cluster)
    }
}

fn fill_from_start(job: &mut JobRec, msg: &JobStartMsg) {
    job.account = msg.account.clone();
    job.partition = msg.partition.clone();
    job.wckey = msg.wckey.clone();
    job.name = msg.name.clone();
    job.uid = msg.uid;
    job.gid = msg.gid;
    job.nodes = msg.nodes.clone();
    job.submit_time = msg.submit_time;
    job.eligible_time = msg.eligible_time;
    job.start_time = msg.start_time;
    job.state = msg.state;
    job.tres_alloc = msg.tres_alloc.clone();
}

/// Operations that fail with no-change or already-present leave the store
/// untouched. Other failures may leave it half-changed.
impl Store {
    fn is_operator(&self, actor: Actor) -> bool {
        actor.uid == 0
            || actor.uid == actor.slurm_user_id
            || self
                .users
                .values()
                .any(|u| u.uid == actor.uid && u.admin_level >= AdminLevel::Operator)
    }

    fn require_operator(&self, actor: Actor) -> StorageResult<()> {
        if self.is_operator(actor) {
            Ok(())
        } else {
            Err(StorageError::access_denied())
        }
    }

    fn user_name(&self, uid: u32) -> Option<&str> {
        self.users
            .values()
            .find(|u| u.uid == uid)
            .map(|u| u.name.as_str())
    }

    fn record_txn(&mut self, actor: Actor, action: u16, kind: &str, target: &str) {
        self.last_txn += 1;
        let who = self
            .user_name(actor.uid)
            .map(|n| n.to_string())
            .unwrap_or_else(|| actor.uid.to_string());
        self.txn.push(TxnRec {
            id: self.last_txn,
            timestamp: actor.now,
            action,
            actor: who,
            target: target.to_string(),
            info: Some(kind.to_string()),
        });
    }

    fn add<T: Entity>(&mut self, actor: Actor, recs: &[T]) -> StorageResult<()> {
        self.require_operator(actor)?;
        let mut added = 0;
        for rec in recs {
            check_name(rec.name())?;
            rec.check(self)?;
            let key = rec.key();
            if T::table(self).contains_key(&key) {
                continue;
            }
            let mut rec = rec.clone();
            if let Some(id) = rec.id_slot() {
                if *id == 0 {
                    self.last_id += 1;
                    *id = self.last_id;
                }
            }
            T::table_mut(self).insert(key.clone(), rec);
            self.record_txn(actor, TXN_ADD, T::KIND, &key);
            added += 1;
        }
        if added == 0 {
            return Err(StorageError::no_change());
        }
        T::after_change(self)
    }

    fn select<T: Entity>(&self, cond: &ObjectCond) -> Vec<T> {
        T::table(self)
            .values()
            .filter(|rec| rec.selected(cond))
            .cloned()
            .collect()
    }

    fn modify<T: Entity>(&mut self, actor: Actor, msg: &ModifyMsg<T>) -> StorageResult<Vec<String>> {
        self.require_operator(actor)?;
        let mut changed = Vec::new();
        for rec in T::table_mut(self).values_mut() {
            if rec.selected(&msg.cond) {
                rec.merge(&msg.rec);
                changed.push(rec.key());
            }
        }
        if changed.is_empty() {
            return Err(StorageError::no_change());
        }
        T::after_change(self)?;
        for key in &changed {
            self.record_txn(actor, TXN_MODIFY, T::KIND, key);
        }
        Ok(changed)
    }

    fn remove<T: Entity>(&mut self, actor: Actor, cond: &ObjectCond) -> StorageResult<Vec<String>> {
        self.require_operator(actor)?;
        let keys: Vec<String> = T::table(self)
            .iter()
            .filter(|(_, rec)| rec.selected(cond))
            .map(|(key, _)| key.clone())
            .collect();
        if keys.is_empty() {
            return Err(StorageError::no_change());
        }
        for key in &keys {
            if let Some(rec) = T::table_mut(self).remove(key) {
                T::removed(self, &rec);
            }
            self.record_txn(actor, TXN_REMOVE, T::KIND, key);
        }
        Ok(keys)
    }

    fn add_coords(&mut self, actor: Actor, msg: &AcctCoordMsg) -> StorageResult<()> {
        self.require_operator(actor)?;
        for account in &msg.accounts {
            if !self.accounts.contains_key(account) {
                return Err(StorageError::error(&format!(
                    "account {} does not exist",
                    account
                )));
            }
        }
        let mut changed = Vec::new();
        for user in self.users.values_mut() {
            if !user.selected(&msg.cond) {
                continue;
            }
            for account in &msg.accounts {
                if !user.coord_accts.contains(account) {
                    user.coord_accts.push(account.clone());
                    changed.push((user.name.clone(), account.clone()));
                }
            }
        }
        if changed.is_empty() {
            return Err(StorageError::no_change());
        }
        for (user, account) in changed {
            if let Some(acct) = self.accounts.get_mut(&account) {
                if !acct.coordinators.contains(&user) {
                    acct.coordinators.push(user.clone());
                }
            }
            self.record_txn(actor, TXN_ADD, "coordinator", &format!("{} {}", user, account));
        }
        Ok(())
    }

    fn remove_coords(&mut self, actor: Actor, msg: &AcctCoordMsg) -> StorageResult<Vec<String>> {
        self.require_operator(actor)?;
        let mut changed = Vec::new();
        for user in self.users.values_mut() {
            if !user.selected(&msg.cond) {
                continue;
            }
            let before = user.coord_accts.len();
            let accounts = &msg.accounts;
            user.coord_accts
                .retain(|a| !accounts.is_empty() && !accounts.contains(a));
            if user.coord_accts.len() != before {
                changed.push(user.name.clone());
            }
        }
        if changed.is_empty() {
            return Err(StorageError::no_change());
        }
        for acct in self.accounts.values_mut() {
            if msg.accounts.is_empty() || msg.accounts.contains(&acct.name) {
                acct.coordinators.retain(|c| !changed.contains(c));
            }
        }
        for user in &changed {
            self.record_txn(actor, TXN_REMOVE, "coordinator", user);
        }
        Ok(changed)
    }

    fn modify_job(&mut self, actor: Actor, msg: &ModifyJobMsg) -> StorageResult<Vec<String>> {
        self.require_operator(actor)?;
        let mut changed = Vec::new();
        for job in self.jobs.values_mut() {
            if msg.cond.matches(job) {
                set_opt(&mut job.name, &msg.name);
                set_opt(&mut job.account, &msg.account);
                set_opt(&mut job.partition, &msg.partition);
                changed.push(job.job_id.to_string());
            }
        }
        if changed.is_empty() {
            return Err(StorageError::no_change());
        }
        for job in &changed {
            self.record_txn(actor, TXN_MODIFY, "job", job);
        }
        Ok(changed)
    }

    fn reservation_key(rec: &ReservationRec) -> String {
        format!("{}/{}", rec.cluster, rec.id)
    }

    fn add_reservation(&mut self, rec: &ReservationRec) -> StorageResult<()> {
        check_name(&rec.name)?;
        let key = Store::reservation_key(rec);
        if self.reservations.contains_key(&key) {
            return Err(StorageError::error(&format!(
                "reservation {} already exists",
                rec.name
            )));
        }
        self.reservations.insert(key, rec.clone());
        Ok(())
    }

    fn modify_reservation(&mut self, rec: &ReservationRec) -> StorageResult<()> {
        let key = Store::reservation_key(rec);
        match self.reservations.get_mut(&key) {
            Some(existing) => {
                set_opt(&mut existing.nodes, &rec.nodes);
                set_opt(&mut existing.assocs, &rec.assocs);
                set_opt(&mut existing.tres_str, &rec.tres_str);
                set_nonzero(&mut existing.time_start, rec.time_start);
                set_nonzero(&mut existing.time_end, rec.time_end);
                set_nonzero(&mut existing.flags, rec.flags);
                Ok(())
            }
            None => Err(StorageError::error(&format!(
                "reservation {} does not exist",
                rec.name
            ))),
        }
    }

    fn remove_reservation(&mut self, rec: &ReservationRec) -> StorageResult<()> {
        match self.reservations.remove(&Store::reservation_key(rec)) {
            Some(_) => Ok(()),
            None => Err(StorageError::no_change()),
        }
    }

    /// `db_index` if it names a job of `cluster`.
    fn owned_index(&self, cluster: &str, db_index: u64) -> Option<u64> {
        match self.jobs.get(&db_index) {
            Some(job) if db_index != 0 && job.cluster == cluster => Some(db_index),
            _ => None,
        }
    }

    fn job_index(&self, cluster: &str, job_id: u32, db_index: u64, submit_time: i64) -> Option<u64> {
        if let Some(index) = self.owned_index(cluster, db_index) {
            return Some(index);
        }
        self.jobs
            .values()
            .filter(|j| {
                j.cluster == cluster
                    && j.job_id == job_id
                    && (submit_time == 0 || j.submit_time == submit_time)
            })
            .map(|j| j.db_index)
            .max()
    }

    fn find_job(
        &mut self,
        cluster: &str,
        job_id: u32,
        db_index: u64,
        submit_time: i64,
    ) -> StorageResult<&mut JobRec> {
        let index = self
            .job_index(cluster, job_id, db_index, submit_time)
            .ok_or_else(|| StorageError::invalid_job(job_id))?;
        self.jobs
            .get_mut(&index)
            .ok_or_else(|| StorageError::invalid_job(job_id))
    }

    fn job_start(&mut self, cluster: &str, msg: &JobStartMsg, fresh_index: u64) -> StorageResult<u64> {
        let existing = self.owned_index(cluster, msg.db_index).or_else(|| {
            self.jobs
                .values()
                .find(|j| {
                    j.cluster == cluster
                        && j.job_id == msg.job_id
                        && j.submit_time == msg.submit_time
                })
                .map(|j| j.db_index)
        });

        if let Some(index) = existing {
            if let Some(job) = self.jobs.get_mut(&index) {
                if msg.db_index != 0 && job.start_time == msg.start_time && job.state == msg.state
                {
                    return Err(StorageError::already_present());
                }
                fill_from_start(job, msg);
            }
            return Ok(index);
        }

        // An index the caller remembers but this store does not is never
        // reused; new rows always get a fresh one.
        let index = fresh_index;
        if self.jobs.contains_key(&index) {
            return Err(StorageError::error(&format!(
                "job index {} is already in use",
                index
            )));
        }
        let mut job = JobRec {
            db_index: index,
            job_id: msg.job_id,
            cluster: cluster.to_string(),
            ..Default::default()
        };
        fill_from_start(&mut job, msg);
        self.jobs.insert(index, job);
        Ok(index)
    }

    fn job_complete(&mut self, cluster: &str, msg: &JobCompleteMsg) -> StorageResult<()> {
        let job = self.find_job(cluster, msg.job_id, msg.db_index, msg.submit_time)?;
        if job.end_time != 0 && job.end_time == msg.end_time {
            return Err(StorageError::already_present());
        }
        job.end_time = msg.end_time;
        job.state = msg.state;
        job.exit_code = msg.exit_code;
        for step in job.steps.iter_mut().filter(|s| s.time_end == 0) {
            step.time_end = msg.end_time;
            step.state = msg.state;
        }
        Ok(())
    }

    fn job_suspend(&mut self, cluster: &str, msg: &JobSuspendMsg) -> StorageResult<()> {
        let index = self.find_job(cluster, msg.job_id, msg.db_index, msg.submit_time)?.db_index;
        if self.last_suspend_event.get(&index) == Some(&msg.suspend_time) {
            return Err(StorageError::already_present());
        }
        self.last_suspend_event.insert(index, msg.suspend_time);
        let resumed_from = if msg.state == JOB_SUSPENDED {
            self.suspend_start.insert(index, msg.suspend_time);
            None
        } else {
            self.suspend_start.remove(&index)
        };
        if let Some(job) = self.jobs.get_mut(&index) {
            job.state = msg.state;
            if let Some(start) = resumed_from {
                job.suspended += (msg.suspend_time - start).max(0);
            }
        }
        Ok(())
    }

    fn step_start(&mut self, cluster: &str, msg: &StepStartMsg) -> StorageResult<()> {
        let job = self.find_job(cluster, msg.job_id, msg.db_index, 0)?;
        if job.steps.iter().any(|s| s.step_id == msg.step_id) {
            return Err(StorageError::already_present());
        }
        job.steps.push(StepRec {
            step_id: msg.step_id,
            name: msg.name.clone(),
            nodes: msg.nodes.clone(),
            time_start: msg.start_time,
            state: JOB_RUNNING,
            tres_alloc: msg.tres_alloc.clone(),
            ..Default::default()
        });
        Ok(())
    }

    fn step_complete(&mut self, cluster: &str, msg: &StepCompleteMsg) -> StorageResult<()> {
        let job = self.find_job(cluster, msg.job_id, msg.db_index, 0)?;
        match job.steps.iter_mut().find(|s| s.step_id == msg.step_id) {
            Some(step) => {
                if step.time_end != 0 && step.time_end == msg.end_time {
                    return Err(StorageError::already_present());
                }
                step.time_end = msg.end_time;
                step.state = msg.state;
                step.exit_code = msg.exit_code;
            }
            None => job.steps.push(StepRec {
                step_id: msg.step_id,
                time_end: msg.end_time,
                state: msg.state,
                exit_code: msg.exit_code,
                ..Default::default()
            }),
        }
        Ok(())
    }

    fn checkpoint(&mut self, cluster: &str, msg: &CheckpointMsg) -> StorageResult<()> {
        let index = self.find_job(cluster, msg.job_id, msg.db_index, 0)?.db_index;
        let key = (index, msg.step_id);
        if self.checkpoints.get(&key) == Some(&msg.checkpoint_time) {
            return Err(StorageError::already_present());
        }
        self.checkpoints.insert(key, msg.checkpoint_time);
        Ok(())
    }

    fn node_state(&mut self, cluster: &str, msg: &NodeStateMsg) -> StorageResult<()> {
        let open = self.events.iter_mut().filter(|e| {
            e.event_type == EVENT_NODE
                && e.cluster == cluster
                && e.time_end == 0
                && e.node.as_deref() == Some(msg.hostlist.as_str())
        });
        let mut closed = 0;
        for event in open {
            event.time_end = msg.event_time;
            closed += 1;
        }
        if msg.new_state == NODE_STATE_DOWN {
            self.events.push(EventRec {
                cluster: cluster.to_string(),
                event_type: EVENT_NODE,
                node: Some(msg.hostlist.clone()),
                state: msg.state,
                reason: msg.reason.clone(),
                reason_uid: msg.reason_uid,
                time_start: msg.event_time,
                time_end: 0,
                tres_str: msg.tres_str.clone(),
            });
        } else if closed == 0 {
            return Err(StorageError::no_change());
        }
        Ok(())
    }

    fn cluster_tres(&mut self, cluster: &str, msg: &ClusterTresMsg) -> StorageResult<()> {
        let current = self.clusters.get(cluster).and_then(|c| c.tres_str.as_ref());
        if current == msg.tres_str.as_ref() {
            return Err(StorageError::no_change());
        }
        let rec = self
            .clusters
            .entry(cluster.to_string())
            .or_insert_with(|| ClusterRec {
                name: cluster.to_string(),
                ..Default::default()
            });
        rec.tres_str = msg.tres_str.clone();
        for event in self.events.iter_mut().filter(|e| {
            e.event_type == EVENT_CLUSTER && e.cluster == cluster && e.time_end == 0
        }) {
            event.time_end = msg.event_time;
        }
        self.events.push(EventRec {
            cluster: cluster.to_string(),
            event_type: EVENT_CLUSTER,
            node: msg.cluster_nodes.clone(),
            time_start: msg.event_time,
            tres_str: msg.tres_str.clone(),
            ..Default::default()
        });
        Ok(())
    }

    fn flush_jobs(&mut self, cluster: &str, event_time: i64) -> StorageResult<()> {
        let mut flushed = 0;
        for job in self
            .jobs
            .values_mut()
            .filter(|j| j.cluster == cluster && j.end_time == 0)
        {
            job.end_time = event_time;
            job.state = JOB_CANCELLED;
            flushed += 1;
        }
        if flushed == 0 {
            return Err(StorageError::no_change());
        }
        Ok(())
    }

    fn register_ctld(&mut self, cluster: &str, host: &str, port: u16) {
        let rec = self
            .clusters
            .entry(cluster.to_string())
            .or_insert_with(|| ClusterRec {
                name: cluster.to_string(),
                ..Default::default()
            });
        rec.control_host = Some(host.to_string());
        rec.control_port = u32::from(port);
    }

    fn disconnected_controller(&mut self, cluster: &str, host: &str) -> u16 {
        match self.clusters.get_mut(cluster) {
            Some(rec) if rec.control_port != 0 => {
                rec.control_host = Some(host.to_string());
                rec.control_port as u16
            }
            _ => 0,
        }
    }

    fn problems(&self, cond: &ObjectCond) -> Vec<AssocRec> {
        self.assocs
            .values()
            .filter(|a| a.selected(cond))
            .filter(|a| {
                !self.accounts.contains_key(&a.account)
                    || !self.clusters.contains_key(&a.cluster)
                    || a
                        .user
                        .as_ref()
                        .map(|u| !self.users.contains_key(u))
                        .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    fn assoc_id_of(&self, job: &JobRec) -> Option<u32> {
        let user = self.user_name(job.uid)?;
        let account = job.account.as_deref()?;
        self.assocs
            .values()
            .find(|a| {
                a.cluster == job.cluster
                    && a.account == account
                    && a.user.as_deref() == Some(user)
            })
            .map(|a| a.id)
    }

    fn wckey_id_of(&self, job: &JobRec) -> Option<u32> {
        let user = self.user_name(job.uid)?;
        let wckey = job.wckey.as_deref()?;
        self.wckeys
            .values()
            .find(|w| w.cluster == job.cluster && w.name == wckey && w.user == user)
            .map(|w| w.id)
    }

    /// Recompute hourly usage for `[start, end)` from the jobs table.
    fn roll_hours(&mut self, start: i64, end: i64) {
        let mut fresh: [UsageTable; 3] = Default::default();
        for job in self.jobs.values() {
            if job.start_time == 0 {
                continue;
            }
            let job_end = if job.end_time == 0 { end } else { job.end_time };
            let lo = job.start_time.max(start);
            let hi = job_end.min(end);
            if lo >= hi {
                continue;
            }
            let tres = parse_tres(job.tres_alloc.as_deref().unwrap_or_default());
            let ids = [self.assoc_id_of(job), Some(0), self.wckey_id_of(job)];
            let mut period = hour_start(lo);
            while period < hi {
                let secs = (hi.min(period + HOUR) - lo.max(period)) as u64;
                for (slot, id) in ids.iter().enumerate() {
                    let id = match id {
                        Some(id) => *id,
                        None => continue,
                    };
                    for (tres_id, count) in &tres {
                        let key = UsageKey {
                            id,
                            cluster: job.cluster.clone(),
                            period,
                            tres_id: *tres_id,
                        };
                        *fresh[slot].entry(key).or_insert(0) += secs * count;
                    }
                }
                period += HOUR;
            }
        }

        let first = hour_start(start);
        for (slot, table) in fresh.iter_mut().enumerate() {
            let hours = &mut self.usage[slot][TIER_HOUR];
            hours.retain(|k, _| k.period < first || k.period >= end);
            hours.append(table);
        }
    }

    /// Rebuild `tier` by bucketing the tier below it.
    fn roll_tier(&mut self, tier: usize) {
        let bucket = TIER_BUCKETS[tier];
        for slot in 0..3 {
            let mut table = UsageTable::new();
            for (key, secs) in &self.usage[slot][tier - 1] {
                let key = UsageKey {
                    period: bucket(key.period),
                    ..key.clone()
                };
                *table.entry(key).or_insert(0) += secs;
            }
            self.usage[slot][tier] = table;
        }
    }

    fn roll_usage(&mut self, start: i64, end: i64) -> [Duration; ROLLUP_COUNT] {
        let mut timers = [Duration::default(); ROLLUP_COUNT];
        let begin = Instant::now();
        self.roll_hours(start, end);
        timers[TIER_HOUR] = begin.elapsed();
        for tier in &[TIER_DAY, TIER_MONTH] {
            let begin = Instant::now();
            self.roll_tier(*tier);
            timers[*tier] = begin.elapsed();
        }
        timers
    }

    fn usage(&self, kind: UsageKind, msg: &UsageMsg, now: i64) -> Vec<UsageRec> {
        let end = if msg.end == 0 { now } else { msg.end };
        let start = if msg.start == 0 { end - DAY } else { msg.start };
        let span = end - start;
        let tier = if span <= 2 * DAY {
            TIER_HOUR
        } else if span <= 62 * DAY {
            TIER_DAY
        } else {
            TIER_MONTH
        };
        let first = TIER_BUCKETS[tier](start);
        self.usage[usage_slot(kind)][tier]
            .iter()
            .filter(|(k, _)| k.period >= first && k.period < end)
            .filter(|(k, _)| kind == UsageKind::Cluster || msg.cond.match_id(k.id))
            .filter(|(k, _)| msg.cond.match_cluster(&k.cluster))
            .map(|(k, secs)| UsageRec {
                id: k.id,
                cluster: k.cluster.clone(),
                period_start: k.period,
                tres_id: k.tres_id,
                alloc_secs: *secs,
            })
            .collect()
    }

    /// Move finished jobs matching `cond` that ended before `before` into
    /// the named archive.
    fn archive(&mut self, name: &str, cond: &JobCond, before: i64) -> usize {
        let indexes: Vec<u64> = self
            .jobs
            .values()
            .filter(|j| j.end_time != 0 && (before == 0 || j.end_time < before))
            .filter(|j| cond.matches(j))
            .map(|j| j.db_index)
            .collect();
        if indexes.is_empty() {
            return 0;
        }
        let archive = self.archives.entry(name.to_string()).or_default();
        for index in &indexes {
            if let Some(job) = self.jobs.remove(index) {
                archive.push(job);
            }
        }
        indexes.len()
    }

    fn archive_dump(&mut self, actor: Actor, msg: &ArchiveDumpMsg) -> StorageResult<()> {
        self.require_operator(actor)?;
        let name = msg.archive_dir.as_deref().unwrap_or(ARCHIVE_DEFAULT);
        if self.archive(name, &msg.cond, msg.purge_before) == 0 {
            return Err(StorageError::no_change());
        }
        Ok(())
    }

    fn archive_load(&mut self, actor: Actor, msg: &ArchiveLoadMsg) -> StorageResult<()> {
        self.require_operator(actor)?;
        if msg.insert.is_some() {
            return Err(StorageError::error(
                "raw archive inserts are not supported by this store",
            ));
        }
        let name = msg
            .file
            .as_deref()
            .ok_or_else(|| StorageError::error("nothing to load"))?;
        let jobs = self
            .archives
            .remove(name)
            .ok_or_else(|| StorageError::error(&format!("archive {} not found", name)))?;
        for job in jobs {
            self.jobs.entry(job.db_index).or_insert(job);
        }
        Ok(())
    }
}

struct Shared {
    store: Mutex<Store>,
    slurm_user_id: u32,
    next_db_index: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    reconfigs: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Store> {
        lock(&self.store)
    }
}

/// Thread-safe in-memory accounting store.
#[derive(Clone)]
pub struct MemStorage {
    shared: Arc<Shared>,
}

impl MemStorage {
    pub fn new(slurm_user_id: u32) -> MemStorage {
        MemStorage {
            shared: Arc::new(Shared {
                store: Mutex::new(Store::default()),
                slurm_user_id,
                next_db_index: AtomicU64::new(1),
                commits: AtomicU64::new(0),
                rollbacks: AtomicU64::new(0),
                reconfigs: AtomicU64::new(0),
            }),
        }
    }

    /// Insert users directly into the committed store, bypassing access
    /// checks. Used to bootstrap administrators.
    pub fn seed_users(&self, users: Vec<UserRec>) {
        let mut store = self.shared.lock();
        for user in users {
            store.users.insert(user.name.clone(), user);
        }
        store.generation += 1;
    }

    /// Successful `commit(true)` calls across all sessions.
    pub fn commit_count(&self) -> u64 {
        self.shared.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> u64 {
        self.shared.rollbacks.load(Ordering::SeqCst)
    }

    pub fn reconfig_count(&self) -> u64 {
        self.shared.reconfigs.load(Ordering::SeqCst)
    }

    /// Committed jobs, in `db_index` order.
    pub fn jobs(&self) -> Vec<JobRec> {
        self.shared.lock().jobs.values().cloned().collect()
    }
}

impl AcctStorage for MemStorage {
    fn open_session(
        &self,
        cluster: Option<&str>,
        _uid: u32,
    ) -> StorageResult<Box<dyn StorageSession>> {
        Ok(Box::new(MemSession {
            shared: Arc::clone(&self.shared),
            cluster: cluster.map(|c| c.to_string()),
            pending: Vec::new(),
            view: None,
            closed: false,
        }))
    }

    fn admin_level(&self, uid: u32) -> AdminLevel {
        self.shared
            .lock()
            .users
            .values()
            .find(|u| u.uid == uid)
            .map(|u| u.admin_level)
            .unwrap_or_default()
    }

    fn reconfig(&self) -> StorageResult<()> {
        self.shared.reconfigs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type Mutation = Box<dyn Fn(&mut Store) -> StorageResult<()> + Send>;

fn untouched(err: &StorageError) -> bool {
    err.rc == SLURM_NO_CHANGE_IN_DATA || err.is_already_present()
}

pub struct MemSession {
    shared: Arc<Shared>,
    cluster: Option<String>,
    pending: Vec<Mutation>,
    /// The committed store with `pending` applied. Built lazily.
    view: Option<Store>,
    closed: bool,
}

impl MemSession {
    fn check_open(&self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::db_connection());
        }
        Ok(())
    }

    fn actor(&self, uid: u32) -> Actor {
        Actor {
            uid,
            slurm_user_id: self.shared.slurm_user_id,
            now: now(),
        }
    }

    fn cluster(&self) -> StorageResult<String> {
        self.cluster
            .clone()
            .ok_or_else(|| StorageError::error("connection has no cluster name"))
    }

    fn view_mut(&mut self) -> &mut Store {
        let shared = &self.shared;
        let pending = &self.pending;
        self.view.get_or_insert_with(|| {
            let mut view = shared.lock().clone();
            for op in pending {
                // Staged mutations already succeeded once against an
                // equivalent view.
                let _ = op(&mut view);
            }
            view
        })
    }

    fn read<T>(&mut self, f: impl FnOnce(&Store) -> T) -> StorageResult<T> {
        self.check_open()?;
        if self.pending.is_empty() {
            Ok(f(&self.shared.lock()))
        } else {
            Ok(f(self.view_mut()))
        }
    }

    fn write<T, F>(&mut self, op: F) -> StorageResult<T>
    where
        T: 'static,
        F: Fn(&mut Store) -> StorageResult<T> + Send + 'static,
    {
        self.check_open()?;
        if self.pending.is_empty() {
            self.view = None;
        }
        match op(self.view_mut()) {
            Ok(out) => {
                self.pending
                    .push(Box::new(move |store: &mut Store| op(store).map(|_| ())));
                Ok(out)
            }
            Err(e) => {
                if !untouched(&e) {
                    self.view = None;
                }
                Err(e)
            }
        }
    }

    fn add<T: Entity>(&mut self, uid: u32, recs: &[T]) -> StorageResult<()> {
        let actor = self.actor(uid);
        let recs = recs.to_vec();
        self.write(move |store| store.add(actor, &recs))
    }

    fn get<T: Entity>(&mut self, cond: &ObjectCond) -> StorageResult<Vec<T>> {
        self.read(|store| store.select(cond))
    }

    fn modify<T: Entity>(&mut self, uid: u32, msg: &ModifyMsg<T>) -> StorageResult<Vec<String>> {
        let actor = self.actor(uid);
        let msg = msg.clone();
        self.write(move |store| store.modify(actor, &msg))
    }

    fn remove<T: Entity>(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<String>> {
        let actor = self.actor(uid);
        let cond = cond.clone();
        self.write(move |store| store.remove::<T>(actor, &cond))
    }

    /// Run a controller write against this session's cluster.
    fn cluster_write<T, F>(&mut self, op: F) -> StorageResult<T>
    where
        T: 'static,
        F: Fn(&mut Store, &str) -> StorageResult<T> + Send + 'static,
    {
        let cluster = self.cluster()?;
        self.write(move |store| op(store, &cluster))
    }
}

impl StorageSession for MemSession {
    fn add_accounts(&mut self, uid: u32, recs: &[AccountRec]) -> StorageResult<()> {
        self.add(uid, recs)
    }

    fn add_account_coords(&mut self, uid: u32, msg: &AcctCoordMsg) -> StorageResult<()> {
        let actor = self.actor(uid);
        let msg = msg.clone();
        self.write(move |store| store.add_coords(actor, &msg))
    }

    fn add_assocs(&mut self, uid: u32, recs: &[AssocRec]) -> StorageResult<()> {
        self.add(uid, recs)
    }

    fn add_clusters(&mut self, uid: u32, recs: &[ClusterRec]) -> StorageResult<()> {
        self.add(uid, recs)
    }

    fn add_federations(&mut self, uid: u32, recs: &[FederationRec]) -> StorageResult<()> {
        self.add(uid, recs)
    }

    fn add_qos(&mut self, uid: u32, recs: &[QosRec]) -> StorageResult<()> {
        self.add(uid, recs)
    }

    fn add_resources(&mut self, uid: u32, recs: &[ResourceRec]) -> StorageResult<()> {
        self.add(uid, recs)
    }

    fn add_tres(&mut self, uid: u32, recs: &[TresRec]) -> StorageResult<()> {
        self.add(uid, recs)
    }

    fn add_users(&mut self, uid: u32, recs: &[UserRec]) -> StorageResult<()> {
        self.add(uid, recs)
    }

    fn add_wckeys(&mut self, uid: u32, recs: &[WckeyRec]) -> StorageResult<()> {
        self.add(uid, recs)
    }

    fn add_reservation(&mut self, rec: &ReservationRec) -> StorageResult<()> {
        let rec = rec.clone();
        self.write(move |store| store.add_reservation(&rec))
    }

    fn get_accounts(&mut self, _uid: u32, cond: &ObjectCond) -> StorageResult<Vec<AccountRec>> {
        self.get(cond)
    }

    fn get_assocs(&mut self, _uid: u32, cond: &ObjectCond) -> StorageResult<Vec<AssocRec>> {
        self.get(cond)
    }

    fn get_clusters(&mut self, _uid: u32, cond: &ObjectCond) -> StorageResult<Vec<ClusterRec>> {
        self.get(cond)
    }

    fn get_federations(
        &mut self,
        _uid: u32,
        cond: &ObjectCond,
    ) -> StorageResult<Vec<FederationRec>> {
        self.get(cond)
    }

    fn get_qos(&mut self, _uid: u32, cond: &ObjectCond) -> StorageResult<Vec<QosRec>> {
        self.get(cond)
    }

    fn get_resources(&mut self, _uid: u32, cond: &ObjectCond) -> StorageResult<Vec<ResourceRec>> {
        self.get(cond)
    }

    fn get_reservations(
        &mut self,
        _uid: u32,
        cond: &ObjectCond,
    ) -> StorageResult<Vec<ReservationRec>> {
        self.read(|store| {
            store
                .reservations
                .values()
                .filter(|r| {
                    cond.match_id(r.id)
                        && cond.match_name(&r.name)
                        && cond.match_cluster(&r.cluster)
                        && cond.match_window(r.time_start, r.time_end)
                })
                .cloned()
                .collect()
        })
    }

    fn get_tres(&mut self, _uid: u32, cond: &ObjectCond) -> StorageResult<Vec<TresRec>> {
        self.get(cond)
    }

    fn get_users(&mut self, _uid: u32, cond: &ObjectCond) -> StorageResult<Vec<UserRec>> {
        self.get(cond)
    }

    fn get_wckeys(&mut self, _uid: u32, cond: &ObjectCond) -> StorageResult<Vec<WckeyRec>> {
        self.get(cond)
    }

    fn get_jobs(&mut self, _uid: u32, cond: &JobCond) -> StorageResult<Vec<JobRec>> {
        self.read(|store| {
            store
                .jobs
                .values()
                .filter(|j| cond.matches(j))
                .cloned()
                .collect()
        })
    }

    fn get_events(&mut self, _uid: u32, cond: &EventCond) -> StorageResult<Vec<EventRec>> {
        self.read(|store| {
            store
                .events
                .iter()
                .filter(|e| cond.matches(e))
                .cloned()
                .collect()
        })
    }

    fn get_txn(&mut self, _uid: u32, cond: &ObjectCond) -> StorageResult<Vec<TxnRec>> {
        self.read(|store| {
            store
                .txn
                .iter()
                .filter(|t| {
                    cond.match_id(t.id)
                        && (cond.users.is_empty() || cond.users.contains(&t.actor))
                        && cond.match_window(t.timestamp, t.timestamp + 1)
                })
                .cloned()
                .collect()
        })
    }

    fn get_problems(&mut self, _uid: u32, cond: &ObjectCond) -> StorageResult<Vec<AssocRec>> {
        self.read(|store| store.problems(cond))
    }

    fn get_usage(
        &mut self,
        _uid: u32,
        kind: UsageKind,
        msg: &UsageMsg,
    ) -> StorageResult<Vec<UsageRec>> {
        let now = now();
        self.read(|store| store.usage(kind, msg, now))
    }

    fn modify_accounts(
        &mut self,
        uid: u32,
        msg: &ModifyMsg<AccountRec>,
    ) -> StorageResult<Vec<String>> {
        self.modify(uid, msg)
    }

    fn modify_assocs(&mut self, uid: u32, msg: &ModifyMsg<AssocRec>) -> StorageResult<Vec<String>> {
        self.modify(uid, msg)
    }

    fn modify_clusters(
        &mut self,
        uid: u32,
        msg: &ModifyMsg<ClusterRec>,
    ) -> StorageResult<Vec<String>> {
        self.modify(uid, msg)
    }

    fn modify_federations(
        &mut self,
        uid: u32,
        msg: &ModifyMsg<FederationRec>,
    ) -> StorageResult<Vec<String>> {
        self.modify(uid, msg)
    }

    fn modify_qos(&mut self, uid: u32, msg: &ModifyMsg<QosRec>) -> StorageResult<Vec<String>> {
        self.modify(uid, msg)
    }

    fn modify_resources(
        &mut self,
        uid: u32,
        msg: &ModifyMsg<ResourceRec>,
    ) -> StorageResult<Vec<String>> {
        self.modify(uid, msg)
    }

    fn modify_users(&mut self, uid: u32, msg: &ModifyMsg<UserRec>) -> StorageResult<Vec<String>> {
        self.modify(uid, msg)
    }

    fn modify_wckeys(&mut self, uid: u32, msg: &ModifyMsg<WckeyRec>) -> StorageResult<Vec<String>> {
        self.modify(uid, msg)
    }

    fn modify_job(&mut self, uid: u32, msg: &ModifyJobMsg) -> StorageResult<Vec<String>> {
        let actor = self.actor(uid);
        let msg = msg.clone();
        self.write(move |store| store.modify_job(actor, &msg))
    }

    fn modify_reservation(&mut self, rec: &ReservationRec) -> StorageResult<()> {
        let rec = rec.clone();
        self.write(move |store| store.modify_reservation(&rec))
    }

    fn remove_accounts(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<String>> {
        self.remove::<AccountRec>(uid, cond)
    }

    fn remove_account_coords(
        &mut self,
        uid: u32,
        msg: &AcctCoordMsg,
    ) -> StorageResult<Vec<String>> {
        let actor = self.actor(uid);
        let msg = msg.clone();
        self.write(move |store| store.remove_coords(actor, &msg))
    }

    fn remove_assocs(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<String>> {
        self.remove::<AssocRec>(uid, cond)
    }

    fn remove_clusters(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<String>> {
        self.remove::<ClusterRec>(uid, cond)
    }

    fn remove_federations(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<String>> {
        self.remove::<FederationRec>(uid, cond)
    }

    fn remove_qos(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<String>> {
        self.remove::<QosRec>(uid, cond)
    }

    fn remove_resources(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<String>> {
        self.remove::<ResourceRec>(uid, cond)
    }

    fn remove_users(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<String>> {
        self.remove::<UserRec>(uid, cond)
    }

    fn remove_wckeys(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<String>> {
        self.remove::<WckeyRec>(uid, cond)
    }

    fn remove_reservation(&mut self, rec: &ReservationRec) -> StorageResult<()> {
        let rec = rec.clone();
        self.write(move |store| store.remove_reservation(&rec))
    }

    fn job_start(&mut self, msg: &JobStartMsg) -> StorageResult<u64> {
        let msg = msg.clone();
        let fresh = self.shared.next_db_index.fetch_add(1, Ordering::SeqCst);
        self.cluster_write(move |store, cluster| store.job_start(cluster, &msg, fresh))
    }

    fn job_complete(&mut self, msg: &JobCompleteMsg) -> StorageResult<()> {
        let msg = msg.clone();
        self.cluster_write(move |store, cluster| store.job_complete(cluster, &msg))
    }

    fn job_suspend(&mut self, msg: &JobSuspendMsg) -> StorageResult<()> {
        let msg = msg.clone();
        self.cluster_write(move |store, cluster| store.job_suspend(cluster, &msg))
    }

    fn step_start(&mut self, msg: &StepStartMsg) -> StorageResult<()> {
        let msg = msg.clone();
        self.cluster_write(move |store, cluster| store.step_start(cluster, &msg))
    }

    fn step_complete(&mut self, msg: &StepCompleteMsg) -> StorageResult<()> {
        let msg = msg.clone();
        self.cluster_write(move |store, cluster| store.step_complete(cluster, &msg))
    }

    fn task_checkpoint_complete(&mut self, msg: &CheckpointMsg) -> StorageResult<()> {
        let msg = msg.clone();
        self.cluster_write(move |store, cluster| store.checkpoint(cluster, &msg))
    }

    fn node_state(&mut self, msg: &NodeStateMsg) -> StorageResult<()> {
        let msg = msg.clone();
        self.cluster_write(move |store, cluster| store.node_state(cluster, &msg))
    }

    fn cluster_tres(&mut self, msg: &ClusterTresMsg) -> StorageResult<()> {
        let msg = msg.clone();
        self.cluster_write(move |store, cluster| store.cluster_tres(cluster, &msg))
    }

    fn flush_jobs(&mut self, event_time: i64) -> StorageResult<()> {
        self.cluster_write(move |store, cluster| store.flush_jobs(cluster, event_time))
    }

    fn register_ctld(&mut self, host: &str, port: u16) -> StorageResult<()> {
        let host = host.to_string();
        self.cluster_write(move |store, cluster| {
            store.register_ctld(cluster, &host, port);
            Ok(())
        })
    }

    fn register_disconnected_controller(&mut self, host: &str) -> StorageResult<u16> {
        let host = host.to_string();
        self.cluster_write(move |store, cluster| {
            Ok(store.disconnected_controller(cluster, &host))
        })
    }

    fn roll_usage(
        &mut self,
        uid: u32,
        msg: &RollUsageMsg,
    ) -> StorageResult<[Duration; ROLLUP_COUNT]> {
        let actor = self.actor(uid);
        let end = if msg.end == 0 { actor.now } else { msg.end };
        let start = if msg.start == 0 { end - DAY } else { msg.start };
        let archive_data = msg.archive_data;
        self.write(move |store| {
            store.require_operator(actor)?;
            let timers = store.roll_usage(start, end);
            if archive_data {
                store.archive(ARCHIVE_DEFAULT, &JobCond::default(), start);
            }
            Ok(timers)
        })
    }

    fn archive_dump(&mut self, uid: u32, msg: &ArchiveDumpMsg) -> StorageResult<()> {
        let actor = self.actor(uid);
        let msg = msg.clone();
        self.write(move |store| store.archive_dump(actor, &msg))
    }

    fn archive_load(&mut self, uid: u32, msg: &ArchiveLoadMsg) -> StorageResult<()> {
        let actor = self.actor(uid);
        let msg = msg.clone();
        self.write(move |store| store.archive_load(actor, &msg))
    }

    fn commit(&mut self, commit: bool) -> StorageResult<()> {
        self.check_open()?;
        let pending = std::mem::take(&mut self.pending);
        let view = self.view.take();
        if !commit {
            self.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        let mut store = self.shared.lock();
        let next = match view {
            _ if pending.is_empty() => None,
            Some(view) if view.generation == store.generation => Some(view),
            _ => {
                let mut next = store.clone();
                for op in &pending {
                    match op(&mut next) {
                        Ok(()) => (),
                        Err(e) if untouched(&e) => (),
                        Err(e) => {
                            self.shared.rollbacks.fetch_add(1, Ordering::SeqCst);
                            return Err(e);
                        }
                    }
                }
                Some(next)
            }
        };
        if let Some(mut next) = next {
            next.generation = store.generation + 1;
            *store = next;
        }
        self.shared.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> StorageResult<()> {
        self.check_open()?;
        self.pending.clear();
        self.view = None;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::rc::{ESLURM_ACCESS_DENIED, ESLURM_BAD_NAME, ESLURM_DB_CONNECTION};

    fn storage() -> MemStorage {
        let storage = MemStorage::new(500);
        storage.seed_users(vec![UserRec::new("alice", 1000, AdminLevel::None)]);
        storage
    }

    fn account(name: &str) -> AccountRec {
        AccountRec {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn job_start(job_id: u32, db_index: u64) -> JobStartMsg {
        JobStartMsg {
            job_id,
            db_index,
            uid: 1000,
            account: Some("physics".to_string()),
            submit_time: 1000,
            start_time: 2000,
            state: JOB_RUNNING,
            tres_alloc: Some("1=4".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn writes_are_private_until_commit() {
        let storage = storage();
        let mut writer = storage.open_session(None, 0).unwrap();
        let mut reader = storage.open_session(None, 0).unwrap();

        writer.add_accounts(0, &[account("physics")]).unwrap();
        let cond = ObjectCond::default();
        assert_eq!(writer.get_accounts(0, &cond).unwrap().len(), 1);
        assert!(reader.get_accounts(0, &cond).unwrap().is_empty());

        writer.commit(true).unwrap();
        assert_eq!(reader.get_accounts(0, &cond).unwrap().len(), 1);
        assert_eq!(storage.commit_count(), 1);
    }

    #[test]
    fn rollback_discards_pending() {
        let storage = storage();
        let mut session = storage.open_session(None, 0).unwrap();
        session.add_accounts(0, &[account("physics")]).unwrap();
        session.commit(false).unwrap();
        assert!(session
            .get_accounts(0, &ObjectCond::default())
            .unwrap()
            .is_empty());
        assert_eq!(storage.rollback_count(), 1);
        assert_eq!(storage.commit_count(), 0);
    }

    #[test]
    fn admin_writes_need_an_operator() {
        let storage = storage();
        let mut session = storage.open_session(None, 1000).unwrap();
        let err = session.add_accounts(1000, &[account("physics")]).unwrap_err();
        assert_eq!(err.rc, ESLURM_ACCESS_DENIED);

        storage.seed_users(vec![UserRec::new("alice", 1000, AdminLevel::Operator)]);
        session.add_accounts(1000, &[account("physics")]).unwrap();
    }

    #[test]
    fn duplicate_adds_change_nothing() {
        let storage = storage();
        let mut session = storage.open_session(None, 0).unwrap();
        session.add_accounts(0, &[account("physics")]).unwrap();
        let err = session.add_accounts(0, &[account("physics")]).unwrap_err();
        assert_eq!(err.rc, SLURM_NO_CHANGE_IN_DATA);

        let err = session.add_accounts(0, &[account("has space")]).unwrap_err();
        assert_eq!(err.rc, ESLURM_BAD_NAME);
    }

    #[test]
    fn modify_and_remove_report_names() {
        let storage = storage();
        let mut session = storage.open_session(None, 0).unwrap();
        session
            .add_accounts(0, &[account("physics"), account("chem")])
            .unwrap();
        let changed = session
            .modify_accounts(
                0,
                &ModifyMsg {
                    cond: ObjectCond::names(&["chem"]),
                    rec: AccountRec {
                        description: Some("chemistry".to_string()),
                        ..Default::default()
                    },
                },
            )
            .unwrap();
        assert_eq!(changed, vec!["chem".to_string()]);

        let removed = session
            .remove_accounts(0, &ObjectCond::names(&["physics"]))
            .unwrap();
        assert_eq!(removed, vec!["physics".to_string()]);
        let err = session
            .remove_accounts(0, &ObjectCond::names(&["physics"]))
            .unwrap_err();
        assert_eq!(err.rc, SLURM_NO_CHANGE_IN_DATA);

        let txn = session.get_txn(0, &ObjectCond::default()).unwrap();
        assert_eq!(txn.len(), 4);
        assert_eq!(txn[3].action, TXN_REMOVE);
    }

    #[test]
    fn qos_preemption_loop_is_rejected() {
        let storage = storage();
        let mut session = storage.open_session(None, 0).unwrap();
        let qos = |name: &str, preempt: &[&str]| QosRec {
            name: name.to_string(),
            preempt: preempt.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        };
        session
            .add_qos(0, &[qos("low", &[]), qos("high", &["low"])])
            .unwrap();
        let err = session
            .modify_qos(
                0,
                &ModifyMsg {
                    cond: ObjectCond::names(&["low"]),
                    rec: qos("", &["high"]),
                },
            )
            .unwrap_err();
        assert!(err == StorageError::qos_preemption_loop());

        let ids: Vec<u32> = session
            .get_qos(0, &ObjectCond::default())
            .unwrap()
            .iter()
            .map(|q| q.id)
            .collect();
        assert!(ids.iter().all(|id| *id != 0));
    }

    #[test]
    fn job_replays_are_flagged() {
        let storage = storage();
        let mut session = storage.open_session(Some("c1"), 500).unwrap();
        let index = session.job_start(&job_start(42, 0)).unwrap();
        assert!(index != 0);

        let err = session.job_start(&job_start(42, index)).unwrap_err();
        assert!(err.is_already_present());

        let step = StepStartMsg {
            job_id: 42,
            db_index: index,
            step_id: 0,
            start_time: 2000,
            ..Default::default()
        };
        session.step_start(&step).unwrap();
        assert!(session.step_start(&step).unwrap_err().is_already_present());

        let complete = JobCompleteMsg {
            job_id: 42,
            db_index: index,
            end_time: 3000,
            state: JOB_COMPLETE,
            ..Default::default()
        };
        session.job_complete(&complete).unwrap();
        assert!(session
            .job_complete(&complete)
            .unwrap_err()
            .is_already_present());

        session.commit(true).unwrap();
        let jobs = storage.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].end_time, 3000);
        assert_eq!(jobs[0].steps[0].time_end, 3000);
    }

    #[test]
    fn staged_writes_build_on_one_view() {
        let storage = storage();
        let mut session = storage.open_session(Some("c1"), 500).unwrap();
        let mut indexes = BTreeSet::new();
        for job_id in 1..=500 {
            indexes.insert(session.job_start(&job_start(job_id, 0)).unwrap());
            if job_id % 100 == 0 {
                let seen = session.get_jobs(500, &JobCond::default()).unwrap();
                assert_eq!(seen.len(), job_id as usize);
            }
        }
        assert_eq!(indexes.len(), 500);
        assert!(storage.jobs().is_empty());

        session.commit(true).unwrap();
        assert_eq!(storage.jobs().len(), 500);
        assert_eq!(storage.commit_count(), 1);
    }

    #[test]
    fn stale_view_is_replayed_on_commit() {
        let storage = storage();
        let mut first = storage.open_session(Some("c1"), 500).unwrap();
        let mut second = storage.open_session(Some("c1"), 500).unwrap();

        first.job_start(&job_start(1, 0)).unwrap();
        second.job_start(&job_start(2, 0)).unwrap();
        second.commit(true).unwrap();
        first.commit(true).unwrap();

        let mut ids: Vec<u32> = storage.jobs().iter().map(|j| j.job_id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn failed_write_leaves_earlier_writes_staged() {
        let storage = storage();
        let mut session = storage.open_session(None, 0).unwrap();
        session.add_accounts(0, &[account("physics")]).unwrap();
        assert!(session.add_accounts(0, &[account("physics")]).is_err());
        assert!(session
            .job_complete(&JobCompleteMsg {
                job_id: 7,
                ..Default::default()
            })
            .is_err());
        let cond = ObjectCond::default();
        assert_eq!(session.get_accounts(0, &cond).unwrap().len(), 1);

        session.commit(true).unwrap();
        assert_eq!(storage.commit_count(), 1);
        let mut reader = storage.open_session(None, 0).unwrap();
        assert_eq!(reader.get_accounts(0, &cond).unwrap().len(), 1);
    }

    #[test]
    fn job_indexes_stay_within_their_cluster() {
        let storage = storage();
        let mut c1 = storage.open_session(Some("c1"), 500).unwrap();
        let mut c2 = storage.open_session(Some("c2"), 500).unwrap();

        let first = c1.job_start(&job_start(10, 0)).unwrap();
        c1.commit(true).unwrap();

        // c2 quotes c1's index for a job it has never started.
        let borrowed = c2.job_start(&job_start(20, first)).unwrap();
        let other = c2.job_start(&job_start(21, 0)).unwrap();
        c2.commit(true).unwrap();
        assert_ne!(borrowed, first);
        assert_ne!(other, first);
        assert_ne!(borrowed, other);

        let jobs = storage.jobs();
        assert_eq!(jobs.len(), 3);
        let c1_job = jobs.iter().find(|j| j.db_index == first).unwrap();
        assert_eq!((c1_job.cluster.as_str(), c1_job.job_id), ("c1", 10));

        let err = c2
            .job_complete(&JobCompleteMsg {
                job_id: 10,
                db_index: first,
                end_time: 3000,
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err, StorageError::invalid_job(10));
        c2.commit(true).unwrap();
        let c1_job = storage
            .jobs()
            .into_iter()
            .find(|j| j.db_index == first)
            .unwrap();
        assert_eq!(c1_job.end_time, 0);
    }

    #[test]
    fn unknown_job_is_invalid() {
        let storage = storage();
        let mut session = storage.open_session(Some("c1"), 500).unwrap();
        let err = session
            .job_complete(&JobCompleteMsg {
                job_id: 7,
                end_time: 10,
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err, StorageError::invalid_job(7));
    }

    #[test]
    fn suspend_accumulates_time() {
        let storage = storage();
        let mut session = storage.open_session(Some("c1"), 500).unwrap();
        let index = session.job_start(&job_start(9, 0)).unwrap();
        let suspend = |time, state| JobSuspendMsg {
            job_id: 9,
            db_index: index,
            suspend_time: time,
            state,
            ..Default::default()
        };
        session.job_suspend(&suspend(2100, JOB_SUSPENDED)).unwrap();
        assert!(session
            .job_suspend(&suspend(2100, JOB_SUSPENDED))
            .unwrap_err()
            .is_already_present());
        session.job_suspend(&suspend(2400, JOB_RUNNING)).unwrap();
        session.commit(true).unwrap();
        assert_eq!(storage.jobs()[0].suspended, 300);
    }

    #[test]
    fn rollup_fills_every_tier() {
        let storage = storage();
        let mut session = storage.open_session(Some("c1"), 500).unwrap();
        let index = session.job_start(&job_start(1, 0)).unwrap();
        session
            .job_complete(&JobCompleteMsg {
                job_id: 1,
                db_index: index,
                end_time: 2000 + 2 * HOUR,
                state: JOB_COMPLETE,
                ..Default::default()
            })
            .unwrap();
        let timers = session
            .roll_usage(
                500,
                &RollUsageMsg {
                    start: 0,
                    end: 4 * HOUR,
                    archive_data: false,
                },
            )
            .unwrap();
        assert_eq!(timers.len(), ROLLUP_COUNT);

        let usage = session
            .get_usage(
                0,
                UsageKind::Cluster,
                &UsageMsg {
                    start: 0,
                    end: 4 * HOUR,
                    ..Default::default()
                },
            )
            .unwrap();
        let total: u64 = usage.iter().map(|u| u.alloc_secs).sum();
        assert_eq!(total, 4 * 2 * HOUR as u64);
        assert!(usage.iter().all(|u| u.cluster == "c1" && u.tres_id == 1));
    }

    #[test]
    fn rollup_needs_an_operator() {
        let storage = storage();
        let mut session = storage.open_session(None, 1000).unwrap();
        let err = session
            .roll_usage(1000, &RollUsageMsg::default())
            .unwrap_err();
        assert_eq!(err.rc, ESLURM_ACCESS_DENIED);
    }

    #[test]
    fn archive_round_trip() {
        let storage = storage();
        let mut session = storage.open_session(Some("c1"), 500).unwrap();
        let index = session.job_start(&job_start(5, 0)).unwrap();
        session
            .job_complete(&JobCompleteMsg {
                job_id: 5,
                db_index: index,
                end_time: 2500,
                state: JOB_COMPLETE,
                ..Default::default()
            })
            .unwrap();
        session
            .archive_dump(
                0,
                &ArchiveDumpMsg {
                    archive_dir: Some("old".to_string()),
                    purge_before: 3000,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(session.get_jobs(0, &JobCond::default()).unwrap().is_empty());
        session
            .archive_load(
                0,
                &ArchiveLoadMsg {
                    file: Some("old".to_string()),
                    insert: None,
                },
            )
            .unwrap();
        assert_eq!(session.get_jobs(0, &JobCond::default()).unwrap().len(), 1);
    }

    #[test]
    fn controller_registration() {
        let storage = storage();
        let mut session = storage.open_session(Some("c1"), 500).unwrap();
        assert_eq!(
            session.register_disconnected_controller("ctl1").unwrap(),
            0
        );
        session.register_ctld("ctl1", 6817).unwrap();
        session.commit(true).unwrap();

        let mut other = storage.open_session(Some("c1"), 500).unwrap();
        assert_eq!(
            other.register_disconnected_controller("ctl2").unwrap(),
            6817
        );
    }

    #[test]
    fn closed_session_is_disconnected() {
        let storage = storage();
        let mut session = storage.open_session(None, 0).unwrap();
        session.close().unwrap();
        let err = session
            .get_accounts(0, &ObjectCond::default())
            .unwrap_err();
        assert_eq!(err.rc, ESLURM_DB_CONNECTION);
    }

    #[test]
    fn tres_strings() {
        assert_eq!(parse_tres("1=4,2=1024"), vec![(1, 4), (2, 1024)]);
        assert_eq!(parse_tres("bogus,3=x,5=2"), vec![(5, 2)]);
        assert!(parse_tres("").is_empty());
    }

    #[test]
    fn month_buckets() {
        // 2020-03-15 12:00:00 UTC
        assert_eq!(month_start(1_584_273_600), 1_583_020_800);
        assert_eq!(day_start(DAY + 5), DAY);
    }
}
