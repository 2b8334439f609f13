// Copyright 2020 Joyent, Inc.

//! Accounting records and query conditions carried by RPC bodies.

use num::FromPrimitive;

use crate::pack::{Buffer, Pack, UnpackError};
use crate::privilege::AdminLevel;
use crate::protocol::PROTOCOL_VERSION_CURRENT;

fn pack_opt(buf: &mut Buffer, val: &Option<String>) {
    buf.pack_str_or_null(val.as_deref());
}

fn list_matches(list: &[String], val: &str) -> bool {
    list.is_empty() || list.iter().any(|x| x == val)
}

fn opt_list_matches(list: &[String], val: &Option<String>) -> bool {
    match val {
        Some(v) => list_matches(list, v),
        None => list.is_empty(),
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccountRec {
    pub name: String,
    pub description: Option<String>,
    pub organization: Option<String>,
    pub coordinators: Vec<String>,
    pub flags: u32,
}

impl Pack for AccountRec {
    fn pack(&self, buf: &mut Buffer, version: u16) {
        buf.pack_str(&self.name);
        pack_opt(buf, &self.description);
        pack_opt(buf, &self.organization);
        buf.pack_str_array(&self.coordinators);
        if version >= PROTOCOL_VERSION_CURRENT {
            buf.pack_u32(self.flags);
        }
    }

    fn unpack(buf: &mut Buffer, version: u16) -> Result<Self, UnpackError> {
        let name = buf.unpack_str("account name")?;
        let description = buf.unpack_str_or_null()?;
        let organization = buf.unpack_str_or_null()?;
        let coordinators = buf.unpack_str_array()?;
        let flags = if version >= PROTOCOL_VERSION_CURRENT {
            buf.unpack_u32()?
        } else {
            0
        };
        Ok(AccountRec {
            name,
            description,
            organization,
            coordinators,
            flags,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UserRec {
    pub name: String,
    pub uid: u32,
    pub default_acct: Option<String>,
    pub default_wckey: Option<String>,
    pub admin_level: AdminLevel,
    pub coord_accts: Vec<String>,
}

impl UserRec {
    pub fn new(name: &str, uid: u32, admin_level: AdminLevel) -> UserRec {
        UserRec {
            name: name.to_string(),
            uid,
            admin_level,
            ..Default::default()
        }
    }
}

impl Pack for UserRec {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_str(&self.name);
        buf.pack_u32(self.uid);
        pack_opt(buf, &self.default_acct);
        pack_opt(buf, &self.default_wckey);
        buf.pack_u16(self.admin_level as u16);
        buf.pack_str_array(&self.coord_accts);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        let name = buf.unpack_str("user name")?;
        let uid = buf.unpack_u32()?;
        let default_acct = buf.unpack_str_or_null()?;
        let default_wckey = buf.unpack_str_or_null()?;
        let raw_level = buf.unpack_u16()?;
        let admin_level =
            AdminLevel::from_u16(raw_level).ok_or(UnpackError::BadValue {
                field: "admin_level",
                value: u64::from(raw_level),
            })?;
        let coord_accts = buf.unpack_str_array()?;
        Ok(UserRec {
            name,
            uid,
            default_acct,
            default_wckey,
            admin_level,
            coord_accts,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterRec {
    pub name: String,
    pub control_host: Option<String>,
    pub control_port: u32,
    pub rpc_version: u16,
    pub flags: u32,
    pub tres_str: Option<String>,
}

impl Pack for ClusterRec {
    fn pack(&self, buf: &mut Buffer, version: u16) {
        buf.pack_str(&self.name);
        pack_opt(buf, &self.control_host);
        buf.pack_u32(self.control_port);
        buf.pack_u16(self.rpc_version);
        buf.pack_u32(self.flags);
        if version >= PROTOCOL_VERSION_CURRENT {
            pack_opt(buf, &self.tres_str);
        }
    }

    fn unpack(buf: &mut Buffer, version: u16) -> Result<Self, UnpackError> {
        let name = buf.unpack_str("cluster name")?;
        let control_host = buf.unpack_str_or_null()?;
        let control_port = buf.unpack_u32()?;
        let rpc_version = buf.unpack_u16()?;
        let flags = buf.unpack_u32()?;
        let tres_str = if version >= PROTOCOL_VERSION_CURRENT {
            buf.unpack_str_or_null()?
        } else {
            None
        };
        Ok(ClusterRec {
            name,
            control_host,
            control_port,
            rpc_version,
            flags,
            tres_str,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FederationRec {
    pub name: String,
    pub flags: u32,
    pub clusters: Vec<String>,
}

impl Pack for FederationRec {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_str(&self.name);
        buf.pack_u32(self.flags);
        buf.pack_str_array(&self.clusters);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(FederationRec {
            name: buf.unpack_str("federation name")?,
            flags: buf.unpack_u32()?,
            clusters: buf.unpack_str_array()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QosRec {
    pub id: u32,
    pub name: String,
    pub description: Option<String>,
    pub priority: u32,
    pub preempt: Vec<String>,
    pub flags: u32,
    pub grace_time: u32,
}

impl Pack for QosRec {
    fn pack(&self, buf: &mut Buffer, version: u16) {
        buf.pack_u32(self.id);
        buf.pack_str(&self.name);
        pack_opt(buf, &self.description);
        buf.pack_u32(self.priority);
        buf.pack_str_array(&self.preempt);
        buf.pack_u32(self.flags);
        if version >= PROTOCOL_VERSION_CURRENT {
            buf.pack_u32(self.grace_time);
        }
    }

    fn unpack(buf: &mut Buffer, version: u16) -> Result<Self, UnpackError> {
        let id = buf.unpack_u32()?;
        let name = buf.unpack_str("qos name")?;
        let description = buf.unpack_str_or_null()?;
        let priority = buf.unpack_u32()?;
        let preempt = buf.unpack_str_array()?;
        let flags = buf.unpack_u32()?;
        let grace_time = if version >= PROTOCOL_VERSION_CURRENT {
            buf.unpack_u32()?
        } else {
            0
        };
        Ok(QosRec {
            id,
            name,
            description,
            priority,
            preempt,
            flags,
            grace_time,
        })
    }
}

/// A license-style resource served from outside the cluster.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceRec {
    pub id: u32,
    pub name: String,
    pub server: Option<String>,
    pub description: Option<String>,
    pub count: u32,
    pub clusters: Vec<String>,
    pub flags: u32,
}

impl Pack for ResourceRec {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_u32(self.id);
        buf.pack_str(&self.name);
        pack_opt(buf, &self.server);
        pack_opt(buf, &self.description);
        buf.pack_u32(self.count);
        buf.pack_str_array(&self.clusters);
        buf.pack_u32(self.flags);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(ResourceRec {
            id: buf.unpack_u32()?,
            name: buf.unpack_str("resource name")?,
            server: buf.unpack_str_or_null()?,
            description: buf.unpack_str_or_null()?,
            count: buf.unpack_u32()?,
            clusters: buf.unpack_str_array()?,
            flags: buf.unpack_u32()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WckeyRec {
    pub id: u32,
    pub name: String,
    pub user: String,
    pub cluster: String,
    pub is_def: bool,
}

impl Pack for WckeyRec {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_u32(self.id);
        buf.pack_str(&self.name);
        buf.pack_str(&self.user);
        buf.pack_str(&self.cluster);
        buf.pack_bool(self.is_def);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(WckeyRec {
            id: buf.unpack_u32()?,
            name: buf.unpack_str("wckey name")?,
            user: buf.unpack_str("wckey user")?,
            cluster: buf.unpack_str("wckey cluster")?,
            is_def: buf.unpack_bool()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReservationRec {
    pub id: u32,
    pub name: String,
    pub cluster: String,
    pub nodes: Option<String>,
    pub assocs: Option<String>,
    pub tres_str: Option<String>,
    pub time_start: i64,
    pub time_end: i64,
    pub flags: u64,
}

impl Pack for ReservationRec {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_u32(self.id);
        buf.pack_str(&self.name);
        buf.pack_str(&self.cluster);
        pack_opt(buf, &self.nodes);
        pack_opt(buf, &self.assocs);
        pack_opt(buf, &self.tres_str);
        buf.pack_time(self.time_start);
        buf.pack_time(self.time_end);
        buf.pack_u64(self.flags);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(ReservationRec {
            id: buf.unpack_u32()?,
            name: buf.unpack_str("reservation name")?,
            cluster: buf.unpack_str("reservation cluster")?,
            nodes: buf.unpack_str_or_null()?,
            assocs: buf.unpack_str_or_null()?,
            tres_str: buf.unpack_str_or_null()?,
            time_start: buf.unpack_time()?,
            time_end: buf.unpack_time()?,
            flags: buf.unpack_u64()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TresRec {
    pub id: u32,
    pub tres_type: String,
    pub name: Option<String>,
    pub count: u64,
}

impl Pack for TresRec {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_u32(self.id);
        buf.pack_str(&self.tres_type);
        pack_opt(buf, &self.name);
        buf.pack_u64(self.count);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(TresRec {
            id: buf.unpack_u32()?,
            tres_type: buf.unpack_str("tres type")?,
            name: buf.unpack_str_or_null()?,
            count: buf.unpack_u64()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AssocRec {
    pub id: u32,
    pub cluster: String,
    pub account: String,
    pub user: Option<String>,
    pub partition: Option<String>,
    pub parent_account: Option<String>,
    pub shares: u32,
    pub qos: Vec<String>,
    pub is_def: bool,
}

impl Pack for AssocRec {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_u32(self.id);
        buf.pack_str(&self.cluster);
        buf.pack_str(&self.account);
        pack_opt(buf, &self.user);
        pack_opt(buf, &self.partition);
        pack_opt(buf, &self.parent_account);
        buf.pack_u32(self.shares);
        buf.pack_str_array(&self.qos);
        buf.pack_bool(self.is_def);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(AssocRec {
            id: buf.unpack_u32()?,
            cluster: buf.unpack_str("assoc cluster")?,
            account: buf.unpack_str("assoc account")?,
            user: buf.unpack_str_or_null()?,
            partition: buf.unpack_str_or_null()?,
            parent_account: buf.unpack_str_or_null()?,
            shares: buf.unpack_u32()?,
            qos: buf.unpack_str_array()?,
            is_def: buf.unpack_bool()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepRec {
    pub step_id: u32,
    pub name: Option<String>,
    pub nodes: Option<String>,
    pub time_start: i64,
    pub time_end: i64,
    pub state: u32,
    pub exit_code: i32,
    pub tres_alloc: Option<String>,
}

impl Pack for StepRec {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_u32(self.step_id);
        pack_opt(buf, &self.name);
        pack_opt(buf, &self.nodes);
        buf.pack_time(self.time_start);
        buf.pack_time(self.time_end);
        buf.pack_u32(self.state);
        buf.pack_i32(self.exit_code);
        pack_opt(buf, &self.tres_alloc);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(StepRec {
            step_id: buf.unpack_u32()?,
            name: buf.unpack_str_or_null()?,
            nodes: buf.unpack_str_or_null()?,
            time_start: buf.unpack_time()?,
            time_end: buf.unpack_time()?,
            state: buf.unpack_u32()?,
            exit_code: buf.unpack_i32()?,
            tres_alloc: buf.unpack_str_or_null()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobRec {
    pub db_index: u64,
    pub job_id: u32,
    pub cluster: String,
    pub account: Option<String>,
    pub partition: Option<String>,
    pub wckey: Option<String>,
    pub name: Option<String>,
    pub uid: u32,
    pub gid: u32,
    pub nodes: Option<String>,
    pub submit_time: i64,
    pub eligible_time: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub suspended: i64,
    pub state: u32,
    pub exit_code: i32,
    pub tres_alloc: Option<String>,
    pub steps: Vec<StepRec>,
}

impl Pack for JobRec {
    fn pack(&self, buf: &mut Buffer, version: u16) {
        buf.pack_u64(self.db_index);
        buf.pack_u32(self.job_id);
        buf.pack_str(&self.cluster);
        pack_opt(buf, &self.account);
        pack_opt(buf, &self.partition);
        pack_opt(buf, &self.wckey);
        pack_opt(buf, &self.name);
        buf.pack_u32(self.uid);
        buf.pack_u32(self.gid);
        pack_opt(buf, &self.nodes);
        buf.pack_time(self.submit_time);
        buf.pack_time(self.eligible_time);
        buf.pack_time(self.start_time);
        buf.pack_time(self.end_time);
        buf.pack_time(self.suspended);
        buf.pack_u32(self.state);
        buf.pack_i32(self.exit_code);
        pack_opt(buf, &self.tres_alloc);
        self.steps.pack(buf, version);
    }

    fn unpack(buf: &mut Buffer, version: u16) -> Result<Self, UnpackError> {
        Ok(JobRec {
            db_index: buf.unpack_u64()?,
            job_id: buf.unpack_u32()?,
            cluster: buf.unpack_str("job cluster")?,
            account: buf.unpack_str_or_null()?,
            partition: buf.unpack_str_or_null()?,
            wckey: buf.unpack_str_or_null()?,
            name: buf.unpack_str_or_null()?,
            uid: buf.unpack_u32()?,
            gid: buf.unpack_u32()?,
            nodes: buf.unpack_str_or_null()?,
            submit_time: buf.unpack_time()?,
            eligible_time: buf.unpack_time()?,
            start_time: buf.unpack_time()?,
            end_time: buf.unpack_time()?,
            suspended: buf.unpack_time()?,
            state: buf.unpack_u32()?,
            exit_code: buf.unpack_i32()?,
            tres_alloc: buf.unpack_str_or_null()?,
            steps: Vec::<StepRec>::unpack(buf, version)?,
        })
    }
}

pub const EVENT_CLUSTER: u16 = 1;
pub const EVENT_NODE: u16 = 2;

/// A cluster or node state change reported by a controller.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventRec {
    pub cluster: String,
    pub event_type: u16,
    pub node: Option<String>,
    pub state: u32,
    pub reason: Option<String>,
    pub reason_uid: u32,
    pub time_start: i64,
    pub time_end: i64,
    pub tres_str: Option<String>,
}

impl Pack for EventRec {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_str(&self.cluster);
        buf.pack_u16(self.event_type);
        pack_opt(buf, &self.node);
        buf.pack_u32(self.state);
        pack_opt(buf, &self.reason);
        buf.pack_u32(self.reason_uid);
        buf.pack_time(self.time_start);
        buf.pack_time(self.time_end);
        pack_opt(buf, &self.tres_str);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(EventRec {
            cluster: buf.unpack_str("event cluster")?,
            event_type: buf.unpack_u16()?,
            node: buf.unpack_str_or_null()?,
            state: buf.unpack_u32()?,
            reason: buf.unpack_str_or_null()?,
            reason_uid: buf.unpack_u32()?,
            time_start: buf.unpack_time()?,
            time_end: buf.unpack_time()?,
            tres_str: buf.unpack_str_or_null()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TxnRec {
    pub id: u32,
    pub timestamp: i64,
    pub action: u16,
    pub actor: String,
    pub target: String,
    pub info: Option<String>,
}

impl Pack for TxnRec {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_u32(self.id);
        buf.pack_time(self.timestamp);
        buf.pack_u16(self.action);
        buf.pack_str(&self.actor);
        buf.pack_str(&self.target);
        pack_opt(buf, &self.info);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(TxnRec {
            id: buf.unpack_u32()?,
            timestamp: buf.unpack_time()?,
            action: buf.unpack_u16()?,
            actor: buf.unpack_str("txn actor")?,
            target: buf.unpack_str("txn target")?,
            info: buf.unpack_str_or_null()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigKv {
    pub key: String,
    pub value: String,
}

impl Pack for ConfigKv {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_str(&self.key);
        buf.pack_str(&self.value);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(ConfigKv {
            key: buf.unpack_str("config key")?,
            value: buf.unpack_str("config value")?,
        })
    }
}

/// Allocated time for one TRES over one rollup period.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UsageRec {
    pub id: u32,
    pub cluster: String,
    pub period_start: i64,
    pub tres_id: u32,
    pub alloc_secs: u64,
}

impl Pack for UsageRec {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_u32(self.id);
        buf.pack_str(&self.cluster);
        buf.pack_time(self.period_start);
        buf.pack_u32(self.tres_id);
        buf.pack_u64(self.alloc_secs);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(UsageRec {
            id: buf.unpack_u32()?,
            cluster: buf.unpack_str("usage cluster")?,
            period_start: buf.unpack_time()?,
            tres_id: buf.unpack_u32()?,
            alloc_secs: buf.unpack_u64()?,
        })
    }
}

/// Selects entities for get, modify and remove requests. Empty lists match
/// everything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectCond {
    pub ids: Vec<u32>,
    pub names: Vec<String>,
    pub clusters: Vec<String>,
    pub accounts: Vec<String>,
    pub users: Vec<String>,
    pub partitions: Vec<String>,
    pub time_start: i64,
    pub time_end: i64,
    pub with_deleted: bool,
}

impl ObjectCond {
    pub fn names(names: &[&str]) -> ObjectCond {
        ObjectCond {
            names: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn match_id(&self, id: u32) -> bool {
        self.ids.is_empty() || self.ids.contains(&id)
    }

    pub fn match_name(&self, name: &str) -> bool {
        list_matches(&self.names, name)
    }

    pub fn match_cluster(&self, cluster: &str) -> bool {
        list_matches(&self.clusters, cluster)
    }

    pub fn match_account(&self, account: &str) -> bool {
        list_matches(&self.accounts, account)
    }

    pub fn match_user(&self, user: &Option<String>) -> bool {
        opt_list_matches(&self.users, user)
    }

    pub fn match_partition(&self, partition: &Option<String>) -> bool {
        opt_list_matches(&self.partitions, partition)
    }

    /// True when `[start, end)` overlaps the window. Zero bounds are open.
    pub fn match_window(&self, start: i64, end: i64) -> bool {
        (self.time_end == 0 || start < self.time_end)
            && (self.time_start == 0 || end == 0 || end > self.time_start)
    }
}

impl Pack for ObjectCond {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_u32_array(&self.ids);
        buf.pack_str_array(&self.names);
        buf.pack_str_array(&self.clusters);
        buf.pack_str_array(&self.accounts);
        buf.pack_str_array(&self.users);
        buf.pack_str_array(&self.partitions);
        buf.pack_time(self.time_start);
        buf.pack_time(self.time_end);
        buf.pack_bool(self.with_deleted);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(ObjectCond {
            ids: buf.unpack_u32_array()?,
            names: buf.unpack_str_array()?,
            clusters: buf.unpack_str_array()?,
            accounts: buf.unpack_str_array()?,
            users: buf.unpack_str_array()?,
            partitions: buf.unpack_str_array()?,
            time_start: buf.unpack_time()?,
            time_end: buf.unpack_time()?,
            with_deleted: buf.unpack_bool()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobCond {
    pub clusters: Vec<String>,
    pub accounts: Vec<String>,
    pub uids: Vec<u32>,
    pub job_ids: Vec<u32>,
    pub usage_start: i64,
    pub usage_end: i64,
    pub flags: u32,
}

impl JobCond {
    pub fn matches(&self, job: &JobRec) -> bool {
        list_matches(&self.clusters, &job.cluster)
            && opt_list_matches(&self.accounts, &job.account)
            && (self.uids.is_empty() || self.uids.contains(&job.uid))
            && (self.job_ids.is_empty() || self.job_ids.contains(&job.job_id))
            && (self.usage_end == 0 || job.submit_time < self.usage_end)
            && (self.usage_start == 0
                || job.end_time == 0
                || job.end_time >= self.usage_start)
    }
}

impl Pack for JobCond {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_str_array(&self.clusters);
        buf.pack_str_array(&self.accounts);
        buf.pack_u32_array(&self.uids);
        buf.pack_u32_array(&self.job_ids);
        buf.pack_time(self.usage_start);
        buf.pack_time(self.usage_end);
        buf.pack_u32(self.flags);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(JobCond {
            clusters: buf.unpack_str_array()?,
            accounts: buf.unpack_str_array()?,
            uids: buf.unpack_u32_array()?,
            job_ids: buf.unpack_u32_array()?,
            usage_start: buf.unpack_time()?,
            usage_end: buf.unpack_time()?,
            flags: buf.unpack_u32()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventCond {
    pub clusters: Vec<String>,
    pub nodes: Vec<String>,
    pub event_type: u16,
    pub time_start: i64,
    pub time_end: i64,
}

impl EventCond {
    pub fn matches(&self, event: &EventRec) -> bool {
        list_matches(&self.clusters, &event.cluster)
            && opt_list_matches(&self.nodes, &event.node)
            && (self.event_type == 0 || self.event_type == event.event_type)
            && (self.time_end == 0 || event.time_start < self.time_end)
            && (self.time_start == 0
                || event.time_end == 0
                || event.time_end > self.time_start)
    }
}

impl Pack for EventCond {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_str_array(&self.clusters);
        buf.pack_str_array(&self.nodes);
        buf.pack_u16(self.event_type);
        buf.pack_time(self.time_start);
        buf.pack_time(self.time_end);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(EventCond {
            clusters: buf.unpack_str_array()?,
            nodes: buf.unpack_str_array()?,
            event_type: buf.unpack_u16()?,
            time_start: buf.unpack_time()?,
            time_end: buf.unpack_time()?,
        })
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    use quickcheck::{Arbitrary, Gen};
    use rand::Rng;

    use crate::protocol::{PROTOCOL_VERSION_MIN, PROTOCOL_VERSION_PREV};

    pub(crate) fn arb_name<G: Gen>(g: &mut G) -> String {
        let len = g.gen_range(1, 12);
        (0..len)
            .map(|_| g.gen_range(b'a', b'z' + 1) as char)
            .collect()
    }

    pub(crate) fn arb_opt_name<G: Gen>(g: &mut G) -> Option<String> {
        if g.gen() {
            Some(arb_name(g))
        } else {
            None
        }
    }

    pub(crate) fn arb_names<G: Gen>(g: &mut G) -> Vec<String> {
        let len = g.gen_range(0, 4);
        (0..len).map(|_| arb_name(g)).collect()
    }

    impl Arbitrary for AccountRec {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            AccountRec {
                name: arb_name(g),
                description: arb_opt_name(g),
                organization: arb_opt_name(g),
                coordinators: arb_names(g),
                flags: g.gen(),
            }
        }
    }

    impl Arbitrary for UserRec {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            let level = match g.gen_range(0, 4) {
                0 => AdminLevel::NotSet,
                1 => AdminLevel::None,
                2 => AdminLevel::Operator,
                _ => AdminLevel::Admin,
            };
            UserRec {
                name: arb_name(g),
                uid: g.gen(),
                default_acct: arb_opt_name(g),
                default_wckey: arb_opt_name(g),
                admin_level: level,
                coord_accts: arb_names(g),
            }
        }
    }

    impl Arbitrary for JobRec {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            let steps = (0..g.gen_range(0, 3))
                .map(|i| StepRec {
                    step_id: i,
                    name: arb_opt_name(g),
                    nodes: arb_opt_name(g),
                    time_start: g.gen(),
                    time_end: g.gen(),
                    state: g.gen(),
                    exit_code: g.gen(),
                    tres_alloc: arb_opt_name(g),
                })
                .collect();
            JobRec {
                db_index: g.gen(),
                job_id: g.gen(),
                cluster: arb_name(g),
                account: arb_opt_name(g),
                partition: arb_opt_name(g),
                wckey: arb_opt_name(g),
                name: arb_opt_name(g),
                uid: g.gen(),
                gid: g.gen(),
                nodes: arb_opt_name(g),
                submit_time: g.gen(),
                eligible_time: g.gen(),
                start_time: g.gen(),
                end_time: g.gen(),
                suspended: g.gen(),
                state: g.gen(),
                exit_code: g.gen(),
                tres_alloc: arb_opt_name(g),
                steps,
            }
        }
    }

    impl Arbitrary for ObjectCond {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            ObjectCond {
                ids: (0..g.gen_range(0, 3)).map(|_| g.gen()).collect(),
                names: arb_names(g),
                clusters: arb_names(g),
                accounts: arb_names(g),
                users: arb_names(g),
                partitions: arb_names(g),
                time_start: g.gen(),
                time_end: g.gen(),
                with_deleted: g.gen(),
            }
        }
    }

    impl Arbitrary for ClusterRec {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            ClusterRec {
                name: arb_name(g),
                control_host: arb_opt_name(g),
                control_port: g.gen(),
                rpc_version: g.gen(),
                flags: g.gen(),
                tres_str: arb_opt_name(g),
            }
        }
    }

    impl Arbitrary for FederationRec {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            FederationRec {
                name: arb_name(g),
                flags: g.gen(),
                clusters: arb_names(g),
            }
        }
    }

    impl Arbitrary for QosRec {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            QosRec {
                id: g.gen(),
                name: arb_name(g),
                description: arb_opt_name(g),
                priority: g.gen(),
                preempt: arb_names(g),
                flags: g.gen(),
                grace_time: g.gen(),
            }
        }
    }

    impl Arbitrary for ResourceRec {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            ResourceRec {
                id: g.gen(),
                name: arb_name(g),
                server: arb_opt_name(g),
                description: arb_opt_name(g),
                count: g.gen(),
                clusters: arb_names(g),
                flags: g.gen(),
            }
        }
    }

    impl Arbitrary for WckeyRec {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            WckeyRec {
                id: g.gen(),
                name: arb_name(g),
                user: arb_name(g),
                cluster: arb_name(g),
                is_def: g.gen(),
            }
        }
    }

    impl Arbitrary for ReservationRec {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            ReservationRec {
                id: g.gen(),
                name: arb_name(g),
                cluster: arb_name(g),
                nodes: arb_opt_name(g),
                assocs: arb_opt_name(g),
                tres_str: arb_opt_name(g),
                time_start: g.gen(),
                time_end: g.gen(),
                flags: g.gen(),
            }
        }
    }

    impl Arbitrary for TresRec {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            TresRec {
                id: g.gen(),
                tres_type: arb_name(g),
                name: arb_opt_name(g),
                count: g.gen(),
            }
        }
    }

    impl Arbitrary for AssocRec {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            AssocRec {
                id: g.gen(),
                cluster: arb_name(g),
                account: arb_name(g),
                user: arb_opt_name(g),
                partition: arb_opt_name(g),
                parent_account: arb_opt_name(g),
                shares: g.gen(),
                qos: arb_names(g),
                is_def: g.gen(),
            }
        }
    }

    impl Arbitrary for EventRec {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            EventRec {
                cluster: arb_name(g),
                event_type: g.gen(),
                node: arb_opt_name(g),
                state: g.gen(),
                reason: arb_opt_name(g),
                reason_uid: g.gen(),
                time_start: g.gen(),
                time_end: g.gen(),
                tres_str: arb_opt_name(g),
            }
        }
    }

    impl Arbitrary for TxnRec {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            TxnRec {
                id: g.gen(),
                timestamp: g.gen(),
                action: g.gen(),
                actor: arb_name(g),
                target: arb_name(g),
                info: arb_opt_name(g),
            }
        }
    }

    impl Arbitrary for ConfigKv {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            ConfigKv {
                key: arb_name(g),
                value: arb_name(g),
            }
        }
    }

    impl Arbitrary for UsageRec {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            UsageRec {
                id: g.gen(),
                cluster: arb_name(g),
                period_start: g.gen(),
                tres_id: g.gen(),
                alloc_secs: g.gen(),
            }
        }
    }

    impl Arbitrary for JobCond {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            JobCond {
                clusters: arb_names(g),
                accounts: arb_names(g),
                uids: (0..g.gen_range(0, 3)).map(|_| g.gen()).collect(),
                job_ids: (0..g.gen_range(0, 3)).map(|_| g.gen()).collect(),
                usage_start: g.gen(),
                usage_end: g.gen(),
                flags: g.gen(),
            }
        }
    }

    impl Arbitrary for EventCond {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            EventCond {
                clusters: arb_names(g),
                nodes: arb_names(g),
                event_type: g.gen(),
                time_start: g.gen(),
                time_end: g.gen(),
            }
        }
    }

    fn round_trip<T: Pack + PartialEq + std::fmt::Debug>(val: &T, version: u16) -> T {
        let mut buf = Buffer::new();
        val.pack(&mut buf, version);
        let out = T::unpack(&mut buf, version).unwrap();
        assert_eq!(buf.remaining(), 0);
        out
    }

    #[test]
    fn newer_fields_are_dropped_for_old_peers() {
        let acct = AccountRec {
            name: String::from("physics"),
            flags: 3,
            ..Default::default()
        };
        assert_eq!(round_trip(&acct, PROTOCOL_VERSION_CURRENT).flags, 3);
        assert_eq!(round_trip(&acct, PROTOCOL_VERSION_PREV).flags, 0);

        let cluster = ClusterRec {
            name: String::from("c1"),
            tres_str: Some(String::from("1=8,2=1024")),
            ..Default::default()
        };
        assert_eq!(round_trip(&cluster, PROTOCOL_VERSION_MIN).tres_str, None);
    }

    #[test]
    fn bad_admin_level_is_rejected() {
        let mut buf = Buffer::new();
        buf.pack_str("u");
        buf.pack_u32(1);
        buf.pack_str_or_null(None);
        buf.pack_str_or_null(None);
        buf.pack_u16(9);
        buf.pack_str_array(&[]);
        assert_eq!(
            UserRec::unpack(&mut buf, PROTOCOL_VERSION_CURRENT),
            Err(UnpackError::BadValue {
                field: "admin_level",
                value: 9
            })
        );
    }

    #[test]
    fn object_cond_matching() {
        let cond = ObjectCond {
            clusters: vec![String::from("c1")],
            users: vec![String::from("alice")],
            ..Default::default()
        };
        assert!(cond.match_name("anything"));
        assert!(cond.match_cluster("c1"));
        assert!(!cond.match_cluster("c2"));
        assert!(cond.match_user(&Some(String::from("alice"))));
        assert!(!cond.match_user(&None));
        assert!(ObjectCond::default().match_user(&None));
    }

    #[test]
    fn job_cond_time_window() {
        let job = JobRec {
            cluster: String::from("c1"),
            submit_time: 100,
            end_time: 200,
            ..Default::default()
        };
        let mut cond = JobCond::default();
        assert!(cond.matches(&job));
        cond.usage_start = 250;
        assert!(!cond.matches(&job));
        cond.usage_start = 150;
        cond.usage_end = 99;
        assert!(!cond.matches(&job));
    }
}
