// Copyright 2020 Joyent, Inc.

//! Interface to the transactional accounting store.
//!
//! The dispatcher never sees tables or queries. It opens one session per
//! connection, calls typed verbs on it, and decides when the session
//! commits. Writes made through a session become visible to other sessions
//! only after `commit(true)`.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use crate::msg::{
    AcctCoordMsg, ArchiveDumpMsg, ArchiveLoadMsg, CheckpointMsg, ClusterTresMsg,
    JobCompleteMsg, JobStartMsg, JobSuspendMsg, ModifyJobMsg, ModifyMsg, NodeStateMsg,
    RollUsageMsg, StepCompleteMsg, StepStartMsg, UsageMsg,
};
use crate::privilege::AdminLevel;
use crate::rc::{
    rc_str, DB_ROW_ALREADY_PRESENT, ESLURM_ACCESS_DENIED, ESLURM_BAD_NAME, ESLURM_DB_CONNECTION,
    ESLURM_INVALID_JOB_ID, ESLURM_QOS_PREEMPTION_LOOP, SLURM_ERROR, SLURM_NO_CHANGE_IN_DATA,
};
use crate::records::{
    AccountRec, AssocRec, ClusterRec, EventCond, EventRec, FederationRec, JobCond, JobRec,
    ObjectCond, QosRec, ReservationRec, ResourceRec, TresRec, TxnRec, UsageRec, UserRec,
    WckeyRec,
};

pub mod memory;

/// Number of rollup tiers timed by `roll_usage`: hour, day, month.
pub const ROLLUP_COUNT: usize = 3;

pub const ROLLUP_NAMES: [&str; ROLLUP_COUNT] = ["hour", "day", "month"];

#[derive(Debug, Clone, PartialEq)]
pub struct StorageError {
    pub rc: i32,
    pub comment: Option<String>,
}

impl StorageError {
    pub fn new(rc: i32, comment: Option<&str>) -> StorageError {
        StorageError {
            rc,
            comment: comment.map(|c| c.to_string()),
        }
    }

    pub fn access_denied() -> StorageError {
        StorageError::new(ESLURM_ACCESS_DENIED, None)
    }

    pub fn error(comment: &str) -> StorageError {
        StorageError::new(SLURM_ERROR, Some(comment))
    }

    pub fn no_change() -> StorageError {
        StorageError::new(SLURM_NO_CHANGE_IN_DATA, None)
    }

    pub fn db_connection() -> StorageError {
        StorageError::new(ESLURM_DB_CONNECTION, None)
    }

    pub fn qos_preemption_loop() -> StorageError {
        StorageError::new(ESLURM_QOS_PREEMPTION_LOOP, None)
    }

    pub fn already_present() -> StorageError {
        StorageError::new(DB_ROW_ALREADY_PRESENT, None)
    }

    pub fn bad_name(name: &str) -> StorageError {
        StorageError::new(ESLURM_BAD_NAME, Some(&format!("invalid name '{}'", name)))
    }

    pub fn invalid_job(job_id: u32) -> StorageError {
        StorageError::new(
            ESLURM_INVALID_JOB_ID,
            Some(&format!("job {} is not known", job_id)),
        )
    }

    pub fn is_already_present(&self) -> bool {
        self.rc == DB_ROW_ALREADY_PRESENT
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.comment {
            Some(comment) => write!(f, "{} ({})", comment, self.rc),
            None => write!(f, "{} ({})", rc_str(self.rc), self.rc),
        }
    }
}

impl StdError for StorageError {}

pub type StorageResult<T> = Result<T, StorageError>;

/// Which usage table a usage query reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsageKind {
    Assoc,
    Cluster,
    Wckey,
}

pub trait AcctStorage: Send + Sync {
    /// Open the session a connection uses for its lifetime.
    fn open_session(
        &self,
        cluster: Option<&str>,
        uid: u32,
    ) -> StorageResult<Box<dyn StorageSession>>;

    /// Cached administrative level of `uid`, from committed data.
    fn admin_level(&self, uid: u32) -> AdminLevel;

    /// Re-read back-end configuration.
    fn reconfig(&self) -> StorageResult<()>;
}

/// Per-connection view of the store. Every verb taking a `uid` applies the
/// back-end's own access rules for that caller.
pub trait StorageSession: Send {
    fn add_accounts(&mut self, uid: u32, recs: &[AccountRec]) -> StorageResult<()>;
    fn add_account_coords(&mut self, uid: u32, msg: &AcctCoordMsg) -> StorageResult<()>;
    fn add_assocs(&mut self, uid: u32, recs: &[AssocRec]) -> StorageResult<()>;
    fn add_clusters(&mut self, uid: u32, recs: &[ClusterRec]) -> StorageResult<()>;
    fn add_federations(&mut self, uid: u32, recs: &[FederationRec]) -> StorageResult<()>;
    fn add_qos(&mut self, uid: u32, recs: &[QosRec]) -> StorageResult<()>;
    fn add_resources(&mut self, uid: u32, recs: &[ResourceRec]) -> StorageResult<()>;
    fn add_tres(&mut self, uid: u32, recs: &[TresRec]) -> StorageResult<()>;
    fn add_users(&mut self, uid: u32, recs: &[UserRec]) -> StorageResult<()>;
    fn add_wckeys(&mut self, uid: u32, recs: &[WckeyRec]) -> StorageResult<()>;
    fn add_reservation(&mut self, rec: &ReservationRec) -> StorageResult<()>;

    fn get_accounts(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<AccountRec>>;
    fn get_assocs(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<AssocRec>>;
    fn get_clusters(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<ClusterRec>>;
    fn get_federations(
        &mut self,
        uid: u32,
        cond: &ObjectCond,
    ) -> StorageResult<Vec<FederationRec>>;
    fn get_qos(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<QosRec>>;
    fn get_resources(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<ResourceRec>>;
    fn get_reservations(
        &mut self,
        uid: u32,
        cond: &ObjectCond,
    ) -> StorageResult<Vec<ReservationRec>>;
    fn get_tres(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<TresRec>>;
    fn get_users(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<UserRec>>;
    fn get_wckeys(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<WckeyRec>>;
    fn get_jobs(&mut self, uid: u32, cond: &JobCond) -> StorageResult<Vec<JobRec>>;
    fn get_events(&mut self, uid: u32, cond: &EventCond) -> StorageResult<Vec<EventRec>>;
    fn get_txn(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<TxnRec>>;
    /// Associations whose account, user or cluster no longer exists.
    fn get_problems(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<AssocRec>>;
    fn get_usage(
        &mut self,
        uid: u32,
        kind: UsageKind,
        msg: &UsageMsg,
    ) -> StorageResult<Vec<UsageRec>>;

    /// Modify and remove verbs return the names of the affected objects.
    fn modify_accounts(&mut self, uid: u32, msg: &ModifyMsg<AccountRec>)
        -> StorageResult<Vec<String>>;
    fn modify_assocs(&mut self, uid: u32, msg: &ModifyMsg<AssocRec>) -> StorageResult<Vec<String>>;
    fn modify_clusters(&mut self, uid: u32, msg: &ModifyMsg<ClusterRec>)
        -> StorageResult<Vec<String>>;
    fn modify_federations(
        &mut self,
        uid: u32,
        msg: &ModifyMsg<FederationRec>,
    ) -> StorageResult<Vec<String>>;
    fn modify_qos(&mut self, uid: u32, msg: &ModifyMsg<QosRec>) -> StorageResult<Vec<String>>;
    fn modify_resources(
        &mut self,
        uid: u32,
        msg: &ModifyMsg<ResourceRec>,
    ) -> StorageResult<Vec<String>>;
    fn modify_users(&mut self, uid: u32, msg: &ModifyMsg<UserRec>) -> StorageResult<Vec<String>>;
    fn modify_wckeys(&mut self, uid: u32, msg: &ModifyMsg<WckeyRec>) -> StorageResult<Vec<String>>;
    fn modify_job(&mut self, uid: u32, msg: &ModifyJobMsg) -> StorageResult<Vec<String>>;
    fn modify_reservation(&mut self, rec: &ReservationRec) -> StorageResult<()>;

    fn remove_accounts(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<String>>;
    fn remove_account_coords(&mut self, uid: u32, msg: &AcctCoordMsg)
        -> StorageResult<Vec<String>>;
    fn remove_assocs(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<String>>;
    fn remove_clusters(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<String>>;
    fn remove_federations(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<String>>;
    fn remove_qos(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<String>>;
    fn remove_resources(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<String>>;
    fn remove_users(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<String>>;
    fn remove_wckeys(&mut self, uid: u32, cond: &ObjectCond) -> StorageResult<Vec<String>>;
    fn remove_reservation(&mut self, rec: &ReservationRec) -> StorageResult<()>;

    /// Record a job start and return its `db_index`.
    fn job_start(&mut self, msg: &JobStartMsg) -> StorageResult<u64>;
    fn job_complete(&mut self, msg: &JobCompleteMsg) -> StorageResult<()>;
    fn job_suspend(&mut self, msg: &JobSuspendMsg) -> StorageResult<()>;
    fn step_start(&mut self, msg: &StepStartMsg) -> StorageResult<()>;
    fn step_complete(&mut self, msg: &StepCompleteMsg) -> StorageResult<()>;
    fn task_checkpoint_complete(&mut self, msg: &CheckpointMsg) -> StorageResult<()>;
    fn node_state(&mut self, msg: &NodeStateMsg) -> StorageResult<()>;
    fn cluster_tres(&mut self, msg: &ClusterTresMsg) -> StorageResult<()>;
    fn flush_jobs(&mut self, event_time: i64) -> StorageResult<()>;

    /// Record the controller address of this session's cluster.
    fn register_ctld(&mut self, host: &str, port: u16) -> StorageResult<()>;
    /// Port previously registered for this session's cluster, or 0.
    fn register_disconnected_controller(&mut self, host: &str) -> StorageResult<u16>;

    /// Aggregate usage and return the elapsed time of each rollup tier.
    fn roll_usage(
        &mut self,
        uid: u32,
        msg: &RollUsageMsg,
    ) -> StorageResult<[Duration; ROLLUP_COUNT]>;
    fn archive_dump(&mut self, uid: u32, msg: &ArchiveDumpMsg) -> StorageResult<()>;
    fn archive_load(&mut self, uid: u32, msg: &ArchiveLoadMsg) -> StorageResult<()>;

    /// Publish (`true`) or discard (`false`) the writes made since the last
    /// commit.
    fn commit(&mut self, commit: bool) -> StorageResult<()>;
    fn close(&mut self) -> StorageResult<()>;
}
