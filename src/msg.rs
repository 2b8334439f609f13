// Copyright 2020 Joyent, Inc.

//! RPC message taxonomy.
//!
//! `MsgType` is the `u16` tag at the head of every frame body and `MsgBody`
//! is the matching payload. Each type has exactly one body variant, so the
//! tag alone decides how a payload is unpacked.

use num::FromPrimitive;
use num_derive::{FromPrimitive, ToPrimitive};

use crate::pack::{Buffer, Pack, UnpackError};
use crate::protocol::PROTOCOL_VERSION_CURRENT;
use crate::records::{
    AccountRec, AssocRec, ClusterRec, ConfigKv, EventCond, EventRec, FederationRec, JobCond,
    JobRec, ObjectCond, QosRec, ReservationRec, ResourceRec, TresRec, TxnRec, UsageRec, UserRec,
    WckeyRec,
};

macro_rules! messages {
    ($($name:ident = $val:expr, $label:expr => $body:ty;)*) => {
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, FromPrimitive, ToPrimitive,
        )]
        pub enum MsgType {
            $($name = $val,)*
        }

        impl MsgType {
            pub const ALL: &'static [MsgType] = &[$(MsgType::$name,)*];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(MsgType::$name => $label,)*
                }
            }

            pub fn from_u16(val: u16) -> Option<MsgType> {
                FromPrimitive::from_u16(val)
            }
        }

        #[derive(Clone, Debug, PartialEq)]
        pub enum MsgBody {
            $($name($body),)*
        }

        impl MsgBody {
            pub fn msg_type(&self) -> MsgType {
                match self {
                    $(MsgBody::$name(_) => MsgType::$name,)*
                }
            }

            pub fn pack(&self, buf: &mut Buffer, version: u16) {
                match self {
                    $(MsgBody::$name(body) => body.pack(buf, version),)*
                }
            }

            pub fn unpack(
                msg_type: MsgType,
                buf: &mut Buffer,
                version: u16,
            ) -> Result<MsgBody, UnpackError> {
                match msg_type {
                    $(MsgType::$name => {
                        Ok(MsgBody::$name(<$body as Pack>::unpack(buf, version)?))
                    })*
                }
            }
        }
    };
}

messages! {
    Init = 1400, "DBD_INIT" => LegacyInitMsg;
    Fini = 1401, "DBD_FINI" => FiniMsg;
    AddAccounts = 1402, "DBD_ADD_ACCOUNTS" => ListMsg<AccountRec>;
    AddAccountCoords = 1403, "DBD_ADD_ACCOUNT_COORDS" => AcctCoordMsg;
    AddAssocs = 1404, "DBD_ADD_ASSOCS" => ListMsg<AssocRec>;
    AddClusters = 1405, "DBD_ADD_CLUSTERS" => ListMsg<ClusterRec>;
    AddUsers = 1406, "DBD_ADD_USERS" => ListMsg<UserRec>;
    ClusterTres = 1407, "DBD_CLUSTER_TRES" => ClusterTresMsg;
    FlushJobs = 1408, "DBD_FLUSH_JOBS" => FlushJobsMsg;
    GetAccounts = 1409, "DBD_GET_ACCOUNTS" => ObjectCond;
    GetAssocs = 1410, "DBD_GET_ASSOCS" => ObjectCond;
    GetAssocUsage = 1411, "DBD_GET_ASSOC_USAGE" => UsageMsg;
    GetClusters = 1412, "DBD_GET_CLUSTERS" => ObjectCond;
    GetClusterUsage = 1413, "DBD_GET_CLUSTER_USAGE" => UsageMsg;
    Reconfig = 1414, "DBD_RECONFIG" => EmptyMsg;
    GetUsers = 1415, "DBD_GET_USERS" => ObjectCond;
    ResponseAccounts = 1416, "DBD_GOT_ACCOUNTS" => ListMsg<AccountRec>;
    ResponseAssocs = 1417, "DBD_GOT_ASSOCS" => ListMsg<AssocRec>;
    ResponseUsage = 1418, "DBD_GOT_USAGE" => ListMsg<UsageRec>;
    ResponseClusters = 1419, "DBD_GOT_CLUSTERS" => ListMsg<ClusterRec>;
    ResponseUsers = 1420, "DBD_GOT_USERS" => ListMsg<UserRec>;
    JobComplete = 1424, "DBD_JOB_COMPLETE" => JobCompleteMsg;
    JobStart = 1425, "DBD_JOB_START" => JobStartMsg;
    IdRc = 1426, "DBD_ID_RC" => IdRcMsg;
    JobSuspend = 1427, "DBD_JOB_SUSPEND" => JobSuspendMsg;
    ModifyAccounts = 1428, "DBD_MODIFY_ACCOUNTS" => ModifyMsg<AccountRec>;
    ModifyAssocs = 1429, "DBD_MODIFY_ASSOCS" => ModifyMsg<AssocRec>;
    ModifyClusters = 1430, "DBD_MODIFY_CLUSTERS" => ModifyMsg<ClusterRec>;
    ModifyUsers = 1431, "DBD_MODIFY_USERS" => ModifyMsg<UserRec>;
    NodeState = 1432, "DBD_NODE_STATE" => NodeStateMsg;
    RemoveAccounts = 1436, "DBD_REMOVE_ACCOUNTS" => ObjectCond;
    RemoveAccountCoords = 1437, "DBD_REMOVE_ACCOUNT_COORDS" => AcctCoordMsg;
    RemoveAssocs = 1438, "DBD_REMOVE_ASSOCS" => ObjectCond;
    RemoveClusters = 1439, "DBD_REMOVE_CLUSTERS" => ObjectCond;
    RemoveUsers = 1440, "DBD_REMOVE_USERS" => ObjectCond;
    RollUsage = 1441, "DBD_ROLL_USAGE" => RollUsageMsg;
    StepComplete = 1442, "DBD_STEP_COMPLETE" => StepCompleteMsg;
    StepStart = 1443, "DBD_STEP_START" => StepStartMsg;
    GetJobsCond = 1444, "DBD_GET_JOBS_COND" => JobCond;
    ResponseList = 1445, "DBD_GOT_LIST" => ListMsg<String>;
    GetTxn = 1447, "DBD_GET_TXN" => ObjectCond;
    ResponseTxn = 1448, "DBD_GOT_TXN" => ListMsg<TxnRec>;
    AddQos = 1449, "DBD_ADD_QOS" => ListMsg<QosRec>;
    GetQos = 1450, "DBD_GET_QOS" => ObjectCond;
    ResponseQos = 1451, "DBD_GOT_QOS" => ListMsg<QosRec>;
    RemoveQos = 1452, "DBD_REMOVE_QOS" => ObjectCond;
    AddWckeys = 1453, "DBD_ADD_WCKEYS" => ListMsg<WckeyRec>;
    GetWckeys = 1454, "DBD_GET_WCKEYS" => ObjectCond;
    ResponseWckeys = 1455, "DBD_GOT_WCKEYS" => ListMsg<WckeyRec>;
    RemoveWckeys = 1456, "DBD_REMOVE_WCKEYS" => ObjectCond;
    GetWckeyUsage = 1457, "DBD_GET_WCKEY_USAGE" => UsageMsg;
    AddReservation = 1458, "DBD_ADD_RESV" => ReservationRec;
    RemoveReservation = 1459, "DBD_REMOVE_RESV" => ReservationRec;
    ModifyReservation = 1460, "DBD_MODIFY_RESV" => ReservationRec;
    GetResvs = 1461, "DBD_GET_RESVS" => ObjectCond;
    ResponseResvs = 1462, "DBD_GOT_RESVS" => ListMsg<ReservationRec>;
    GetConfig = 1463, "DBD_GET_CONFIG" => EmptyMsg;
    ResponseConfig = 1464, "DBD_GOT_CONFIG" => ListMsg<ConfigKv>;
    GetProblems = 1465, "DBD_GET_PROBS" => ObjectCond;
    ResponseProblems = 1466, "DBD_GOT_PROBS" => ListMsg<AssocRec>;
    GetEvents = 1467, "DBD_GET_EVENTS" => EventCond;
    ResponseEvents = 1468, "DBD_GOT_EVENTS" => ListMsg<EventRec>;
    SendMultJobStart = 1469, "DBD_SEND_MULT_JOB_START" => ListMsg<JobStartMsg>;
    ResponseMultJobStart = 1470, "DBD_GOT_MULT_JOB_START" => ListMsg<IdRcMsg>;
    SendMultMsg = 1471, "DBD_SEND_MULT_MSG" => MultMsg;
    ResponseMultMsg = 1472, "DBD_GOT_MULT_MSG" => MultMsg;
    ModifyQos = 1473, "DBD_MODIFY_QOS" => ModifyMsg<QosRec>;
    ModifyWckeys = 1474, "DBD_MODIFY_WCKEYS" => ModifyMsg<WckeyRec>;
    ArchiveDump = 1475, "DBD_ARCHIVE_DUMP" => ArchiveDumpMsg;
    ArchiveLoad = 1476, "DBD_ARCHIVE_LOAD" => ArchiveLoadMsg;
    RegisterCtld = 1477, "DBD_REGISTER_CTLD" => RegisterCtldMsg;
    ResponseJobs = 1478, "DBD_GOT_JOBS" => ListMsg<JobRec>;
    TaskCheckpointComplete = 1479, "DBD_STEP_CHECKPOINT_COMPLETE" => CheckpointMsg;
    AddResources = 1480, "DBD_ADD_RES" => ListMsg<ResourceRec>;
    GetResources = 1481, "DBD_GET_RES" => ObjectCond;
    ResponseResources = 1482, "DBD_GOT_RES" => ListMsg<ResourceRec>;
    RemoveResources = 1483, "DBD_REMOVE_RES" => ObjectCond;
    ModifyResources = 1484, "DBD_MODIFY_RES" => ModifyMsg<ResourceRec>;
    AddTres = 1485, "DBD_ADD_TRES" => ListMsg<TresRec>;
    GetTres = 1486, "DBD_GET_TRES" => ObjectCond;
    ResponseTres = 1487, "DBD_GOT_TRES" => ListMsg<TresRec>;
    AddFederations = 1488, "DBD_ADD_FEDERATIONS" => ListMsg<FederationRec>;
    GetFederations = 1489, "DBD_GET_FEDERATIONS" => ObjectCond;
    ResponseFederations = 1490, "DBD_GOT_FEDERATIONS" => ListMsg<FederationRec>;
    ModifyFederations = 1491, "DBD_MODIFY_FEDERATIONS" => ModifyMsg<FederationRec>;
    RemoveFederations = 1492, "DBD_REMOVE_FEDERATIONS" => ObjectCond;
    ModifyJob = 1493, "DBD_MODIFY_JOB" => ModifyJobMsg;
    GetStats = 1494, "DBD_GET_STATS" => EmptyMsg;
    ResponseStats = 1495, "DBD_GOT_STATS" => StatsMsg;
    ClearStats = 1496, "DBD_CLEAR_STATS" => EmptyMsg;
    Shutdown = 1497, "DBD_SHUTDOWN" => EmptyMsg;
    AccountingUpdate = 1498, "ACCOUNTING_UPDATE_MSG" => AccountingUpdateMsg;
    CrontabGet = 2200, "REQUEST_CRONTAB" => CrontabMsg;
    CrontabUpdate = 2202, "REQUEST_UPDATE_CRONTAB" => CrontabMsg;
    CrontabRemove = 2204, "REQUEST_REMOVE_CRONTAB" => CrontabMsg;
    PersistInit = 6500, "REQUEST_PERSIST_INIT" => PersistInitMsg;
    PersistRc = 6501, "PERSIST_RC" => ReturnCodeMsg;
}

/// A decoded message. The frame version it arrived with travels with it.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub version: u16,
    pub body: MsgBody,
}

impl Message {
    pub fn new(version: u16, body: MsgBody) -> Message {
        Message { version, body }
    }

    pub fn msg_type(&self) -> MsgType {
        self.body.msg_type()
    }

    /// Connection flags. Only the init message carries any.
    pub fn flags(&self) -> u16 {
        match &self.body {
            MsgBody::PersistInit(init) => init.flags,
            _ => 0,
        }
    }
}

impl Pack for String {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_str(self);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        buf.unpack_str("list element")
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EmptyMsg;

impl Pack for EmptyMsg {
    fn pack(&self, _buf: &mut Buffer, _version: u16) {}

    fn unpack(_buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(EmptyMsg)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListMsg<T> {
    pub list: Vec<T>,
}

impl<T> ListMsg<T> {
    pub fn new(list: Vec<T>) -> ListMsg<T> {
        ListMsg { list }
    }
}

impl<T: Pack> Pack for ListMsg<T> {
    fn pack(&self, buf: &mut Buffer, version: u16) {
        self.list.pack(buf, version);
    }

    fn unpack(buf: &mut Buffer, version: u16) -> Result<Self, UnpackError> {
        Ok(ListMsg {
            list: Vec::<T>::unpack(buf, version)?,
        })
    }
}

/// Generic reply used wherever a handler reports only success or failure.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReturnCodeMsg {
    pub rc: i32,
    pub comment: Option<String>,
    pub flags: u32,
}

impl ReturnCodeMsg {
    pub fn new(rc: i32, comment: Option<&str>) -> ReturnCodeMsg {
        ReturnCodeMsg {
            rc,
            comment: comment.map(|c| c.to_string()),
            flags: 0,
        }
    }
}

impl Pack for ReturnCodeMsg {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_i32(self.rc);
        buf.pack_str_or_null(self.comment.as_deref());
        buf.pack_u32(self.flags);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(ReturnCodeMsg {
            rc: buf.unpack_i32()?,
            comment: buf.unpack_str_or_null()?,
            flags: buf.unpack_u32()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PersistInitMsg {
    pub version: u16,
    pub flags: u16,
    pub uid: u32,
    pub cluster_name: Option<String>,
    pub gid: u32,
    pub auth_token: Option<String>,
}

impl Pack for PersistInitMsg {
    fn pack(&self, buf: &mut Buffer, version: u16) {
        buf.pack_u16(self.version);
        buf.pack_u16(self.flags);
        buf.pack_u32(self.uid);
        buf.pack_str_or_null(self.cluster_name.as_deref());
        if version >= PROTOCOL_VERSION_CURRENT {
            buf.pack_u32(self.gid);
        }
        buf.pack_str_or_null(self.auth_token.as_deref());
    }

    fn unpack(buf: &mut Buffer, version: u16) -> Result<Self, UnpackError> {
        let init_version = buf.unpack_u16()?;
        let flags = buf.unpack_u16()?;
        let uid = buf.unpack_u32()?;
        let cluster_name = buf.unpack_str_or_null()?;
        let gid = if version >= PROTOCOL_VERSION_CURRENT {
            buf.unpack_u32()?
        } else {
            uid
        };
        let auth_token = buf.unpack_str_or_null()?;
        Ok(PersistInitMsg {
            version: init_version,
            flags,
            uid,
            cluster_name,
            gid,
            auth_token,
        })
    }
}

/// Pre-persistent-connection init. Recognized so it can be refused.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LegacyInitMsg {
    pub version: u16,
    pub uid: u32,
    pub cluster_name: Option<String>,
}

impl Pack for LegacyInitMsg {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_u16(self.version);
        buf.pack_u32(self.uid);
        buf.pack_str_or_null(self.cluster_name.as_deref());
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(LegacyInitMsg {
            version: buf.unpack_u16()?,
            uid: buf.unpack_u32()?,
            cluster_name: buf.unpack_str_or_null()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FiniMsg {
    pub close_conn: bool,
    pub commit: bool,
}

impl Pack for FiniMsg {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_bool(self.close_conn);
        buf.pack_bool(self.commit);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(FiniMsg {
            close_conn: buf.unpack_bool()?,
            commit: buf.unpack_bool()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModifyMsg<R> {
    pub cond: ObjectCond,
    pub rec: R,
}

impl<R: Pack> Pack for ModifyMsg<R> {
    fn pack(&self, buf: &mut Buffer, version: u16) {
        self.cond.pack(buf, version);
        self.rec.pack(buf, version);
    }

    fn unpack(buf: &mut Buffer, version: u16) -> Result<Self, UnpackError> {
        Ok(ModifyMsg {
            cond: ObjectCond::unpack(buf, version)?,
            rec: R::unpack(buf, version)?,
        })
    }
}

/// Adds or removes the users matched by `cond` as coordinators of
/// `accounts`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AcctCoordMsg {
    pub accounts: Vec<String>,
    pub cond: ObjectCond,
}

impl Pack for AcctCoordMsg {
    fn pack(&self, buf: &mut Buffer, version: u16) {
        buf.pack_str_array(&self.accounts);
        self.cond.pack(buf, version);
    }

    fn unpack(buf: &mut Buffer, version: u16) -> Result<Self, UnpackError> {
        Ok(AcctCoordMsg {
            accounts: buf.unpack_str_array()?,
            cond: ObjectCond::unpack(buf, version)?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModifyJobMsg {
    pub cond: JobCond,
    pub name: Option<String>,
    pub account: Option<String>,
    pub partition: Option<String>,
}

impl Pack for ModifyJobMsg {
    fn pack(&self, buf: &mut Buffer, version: u16) {
        self.cond.pack(buf, version);
        buf.pack_str_or_null(self.name.as_deref());
        buf.pack_str_or_null(self.account.as_deref());
        buf.pack_str_or_null(self.partition.as_deref());
    }

    fn unpack(buf: &mut Buffer, version: u16) -> Result<Self, UnpackError> {
        Ok(ModifyJobMsg {
            cond: JobCond::unpack(buf, version)?,
            name: buf.unpack_str_or_null()?,
            account: buf.unpack_str_or_null()?,
            partition: buf.unpack_str_or_null()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UsageMsg {
    pub cond: ObjectCond,
    pub start: i64,
    pub end: i64,
}

impl Pack for UsageMsg {
    fn pack(&self, buf: &mut Buffer, version: u16) {
        self.cond.pack(buf, version);
        buf.pack_time(self.start);
        buf.pack_time(self.end);
    }

    fn unpack(buf: &mut Buffer, version: u16) -> Result<Self, UnpackError> {
        Ok(UsageMsg {
            cond: ObjectCond::unpack(buf, version)?,
            start: buf.unpack_time()?,
            end: buf.unpack_time()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobStartMsg {
    pub job_id: u32,
    pub db_index: u64,
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
    pub state: u32,
    pub tres_alloc: Option<String>,
    pub container: Option<String>,
}

impl Pack for JobStartMsg {
    fn pack(&self, buf: &mut Buffer, version: u16) {
        buf.pack_u32(self.job_id);
        buf.pack_u64(self.db_index);
        buf.pack_str_or_null(self.account.as_deref());
        buf.pack_str_or_null(self.partition.as_deref());
        buf.pack_str_or_null(self.wckey.as_deref());
        buf.pack_str_or_null(self.name.as_deref());
        buf.pack_u32(self.uid);
        buf.pack_u32(self.gid);
        buf.pack_str_or_null(self.nodes.as_deref());
        buf.pack_time(self.submit_time);
        buf.pack_time(self.eligible_time);
        buf.pack_time(self.start_time);
        buf.pack_u32(self.state);
        buf.pack_str_or_null(self.tres_alloc.as_deref());
        if version >= PROTOCOL_VERSION_CURRENT {
            buf.pack_str_or_null(self.container.as_deref());
        }
    }

    fn unpack(buf: &mut Buffer, version: u16) -> Result<Self, UnpackError> {
        let job_id = buf.unpack_u32()?;
        let db_index = buf.unpack_u64()?;
        let account = buf.unpack_str_or_null()?;
        let partition = buf.unpack_str_or_null()?;
        let wckey = buf.unpack_str_or_null()?;
        let name = buf.unpack_str_or_null()?;
        let uid = buf.unpack_u32()?;
        let gid = buf.unpack_u32()?;
        let nodes = buf.unpack_str_or_null()?;
        let submit_time = buf.unpack_time()?;
        let eligible_time = buf.unpack_time()?;
        let start_time = buf.unpack_time()?;
        let state = buf.unpack_u32()?;
        let tres_alloc = buf.unpack_str_or_null()?;
        let container = if version >= PROTOCOL_VERSION_CURRENT {
            buf.unpack_str_or_null()?
        } else {
            None
        };
        Ok(JobStartMsg {
            job_id,
            db_index,
            account,
            partition,
            wckey,
            name,
            uid,
            gid,
            nodes,
            submit_time,
            eligible_time,
            start_time,
            state,
            tres_alloc,
            container,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobCompleteMsg {
    pub job_id: u32,
    pub db_index: u64,
    pub submit_time: i64,
    pub end_time: i64,
    pub state: u32,
    pub exit_code: i32,
}

impl Pack for JobCompleteMsg {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_u32(self.job_id);
        buf.pack_u64(self.db_index);
        buf.pack_time(self.submit_time);
        buf.pack_time(self.end_time);
        buf.pack_u32(self.state);
        buf.pack_i32(self.exit_code);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(JobCompleteMsg {
            job_id: buf.unpack_u32()?,
            db_index: buf.unpack_u64()?,
            submit_time: buf.unpack_time()?,
            end_time: buf.unpack_time()?,
            state: buf.unpack_u32()?,
            exit_code: buf.unpack_i32()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobSuspendMsg {
    pub job_id: u32,
    pub db_index: u64,
    pub submit_time: i64,
    pub suspend_time: i64,
    pub state: u32,
}

impl Pack for JobSuspendMsg {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_u32(self.job_id);
        buf.pack_u64(self.db_index);
        buf.pack_time(self.submit_time);
        buf.pack_time(self.suspend_time);
        buf.pack_u32(self.state);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(JobSuspendMsg {
            job_id: buf.unpack_u32()?,
            db_index: buf.unpack_u64()?,
            submit_time: buf.unpack_time()?,
            suspend_time: buf.unpack_time()?,
            state: buf.unpack_u32()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepStartMsg {
    pub job_id: u32,
    pub db_index: u64,
    pub step_id: u32,
    pub name: Option<String>,
    pub nodes: Option<String>,
    pub start_time: i64,
    pub tres_alloc: Option<String>,
}

impl Pack for StepStartMsg {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_u32(self.job_id);
        buf.pack_u64(self.db_index);
        buf.pack_u32(self.step_id);
        buf.pack_str_or_null(self.name.as_deref());
        buf.pack_str_or_null(self.nodes.as_deref());
        buf.pack_time(self.start_time);
        buf.pack_str_or_null(self.tres_alloc.as_deref());
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(StepStartMsg {
            job_id: buf.unpack_u32()?,
            db_index: buf.unpack_u64()?,
            step_id: buf.unpack_u32()?,
            name: buf.unpack_str_or_null()?,
            nodes: buf.unpack_str_or_null()?,
            start_time: buf.unpack_time()?,
            tres_alloc: buf.unpack_str_or_null()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepCompleteMsg {
    pub job_id: u32,
    pub db_index: u64,
    pub step_id: u32,
    pub end_time: i64,
    pub state: u32,
    pub exit_code: i32,
}

impl Pack for StepCompleteMsg {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_u32(self.job_id);
        buf.pack_u64(self.db_index);
        buf.pack_u32(self.step_id);
        buf.pack_time(self.end_time);
        buf.pack_u32(self.state);
        buf.pack_i32(self.exit_code);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(StepCompleteMsg {
            job_id: buf.unpack_u32()?,
            db_index: buf.unpack_u64()?,
            step_id: buf.unpack_u32()?,
            end_time: buf.unpack_time()?,
            state: buf.unpack_u32()?,
            exit_code: buf.unpack_i32()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CheckpointMsg {
    pub job_id: u32,
    pub db_index: u64,
    pub step_id: u32,
    pub checkpoint_time: i64,
    pub error_code: i32,
}

impl Pack for CheckpointMsg {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_u32(self.job_id);
        buf.pack_u64(self.db_index);
        buf.pack_u32(self.step_id);
        buf.pack_time(self.checkpoint_time);
        buf.pack_i32(self.error_code);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(CheckpointMsg {
            job_id: buf.unpack_u32()?,
            db_index: buf.unpack_u64()?,
            step_id: buf.unpack_u32()?,
            checkpoint_time: buf.unpack_time()?,
            error_code: buf.unpack_i32()?,
        })
    }
}

pub const NODE_STATE_UP: u16 = 1;
pub const NODE_STATE_DOWN: u16 = 2;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeStateMsg {
    pub hostlist: String,
    pub new_state: u16,
    pub state: u32,
    pub reason: Option<String>,
    pub reason_uid: u32,
    pub event_time: i64,
    pub tres_str: Option<String>,
}

impl Pack for NodeStateMsg {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_str(&self.hostlist);
        buf.pack_u16(self.new_state);
        buf.pack_u32(self.state);
        buf.pack_str_or_null(self.reason.as_deref());
        buf.pack_u32(self.reason_uid);
        buf.pack_time(self.event_time);
        buf.pack_str_or_null(self.tres_str.as_deref());
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        let hostlist = buf.unpack_str("hostlist")?;
        let new_state = buf.unpack_u16()?;
        if new_state != NODE_STATE_UP && new_state != NODE_STATE_DOWN {
            return Err(UnpackError::BadValue {
                field: "new_state",
                value: u64::from(new_state),
            });
        }
        Ok(NodeStateMsg {
            hostlist,
            new_state,
            state: buf.unpack_u32()?,
            reason: buf.unpack_str_or_null()?,
            reason_uid: buf.unpack_u32()?,
            event_time: buf.unpack_time()?,
            tres_str: buf.unpack_str_or_null()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterTresMsg {
    pub cluster_nodes: Option<String>,
    pub event_time: i64,
    pub tres_str: Option<String>,
}

impl Pack for ClusterTresMsg {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_str_or_null(self.cluster_nodes.as_deref());
        buf.pack_time(self.event_time);
        buf.pack_str_or_null(self.tres_str.as_deref());
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(ClusterTresMsg {
            cluster_nodes: buf.unpack_str_or_null()?,
            event_time: buf.unpack_time()?,
            tres_str: buf.unpack_str_or_null()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegisterCtldMsg {
    pub port: u16,
    pub flags: u32,
}

impl Pack for RegisterCtldMsg {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_u16(self.port);
        buf.pack_u32(self.flags);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(RegisterCtldMsg {
            port: buf.unpack_u16()?,
            flags: buf.unpack_u32()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlushJobsMsg {
    pub event_time: i64,
}

impl Pack for FlushJobsMsg {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_time(self.event_time);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(FlushJobsMsg {
            event_time: buf.unpack_time()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RollUsageMsg {
    pub start: i64,
    pub end: i64,
    pub archive_data: bool,
}

impl Pack for RollUsageMsg {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_time(self.start);
        buf.pack_time(self.end);
        buf.pack_bool(self.archive_data);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(RollUsageMsg {
            start: buf.unpack_time()?,
            end: buf.unpack_time()?,
            archive_data: buf.unpack_bool()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArchiveDumpMsg {
    pub archive_dir: Option<String>,
    pub purge_before: i64,
    pub cond: JobCond,
}

impl Pack for ArchiveDumpMsg {
    fn pack(&self, buf: &mut Buffer, version: u16) {
        buf.pack_str_or_null(self.archive_dir.as_deref());
        buf.pack_time(self.purge_before);
        self.cond.pack(buf, version);
    }

    fn unpack(buf: &mut Buffer, version: u16) -> Result<Self, UnpackError> {
        Ok(ArchiveDumpMsg {
            archive_dir: buf.unpack_str_or_null()?,
            purge_before: buf.unpack_time()?,
            cond: JobCond::unpack(buf, version)?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArchiveLoadMsg {
    pub file: Option<String>,
    pub insert: Option<String>,
}

impl Pack for ArchiveLoadMsg {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_str_or_null(self.file.as_deref());
        buf.pack_str_or_null(self.insert.as_deref());
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(ArchiveLoadMsg {
            file: buf.unpack_str_or_null()?,
            insert: buf.unpack_str_or_null()?,
        })
    }
}

/// A list of packed messages, each `u16 msg_type || payload`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MultMsg {
    pub inner: Vec<Vec<u8>>,
}

impl Pack for MultMsg {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_u32(self.inner.len() as u32);
        for inner in &self.inner {
            buf.pack_bytes(inner);
        }
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        let count = buf.unpack_u32()?;
        if count as usize > crate::pack::MAX_ARRAY_LEN {
            return Err(UnpackError::InsaneCount(count));
        }
        let mut inner = Vec::new();
        for _ in 0..count {
            inner.push(buf.unpack_bytes()?);
        }
        Ok(MultMsg { inner })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct IdRcMsg {
    pub job_id: u32,
    pub db_index: u64,
    pub rc: i32,
}

impl Pack for IdRcMsg {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_u32(self.job_id);
        buf.pack_u64(self.db_index);
        buf.pack_i32(self.rc);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(IdRcMsg {
            job_id: buf.unpack_u32()?,
            db_index: buf.unpack_u64()?,
            rc: buf.unpack_i32()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RollupStat {
    pub count: u32,
    pub total_time: u64,
    pub max_time: u64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TypeStat {
    pub msg_type: u16,
    pub count: u32,
    pub total_time: u64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UserStat {
    pub uid: u32,
    pub count: u32,
    pub total_time: u64,
}

/// Snapshot of the RPC statistics. Times are in microseconds.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatsMsg {
    pub time_start: i64,
    pub rollups: Vec<RollupStat>,
    pub types: Vec<TypeStat>,
    pub users: Vec<UserStat>,
}

impl StatsMsg {
    pub fn type_count_sum(&self) -> u64 {
        self.types.iter().map(|t| u64::from(t.count)).sum()
    }

    pub fn user_count_sum(&self) -> u64 {
        self.users.iter().map(|u| u64::from(u.count)).sum()
    }
}

impl Pack for StatsMsg {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_time(self.time_start);
        buf.pack_u32(self.rollups.len() as u32);
        for r in &self.rollups {
            buf.pack_u32(r.count);
            buf.pack_u64(r.total_time);
            buf.pack_u64(r.max_time);
        }
        buf.pack_u32(self.types.len() as u32);
        for t in &self.types {
            buf.pack_u16(t.msg_type);
            buf.pack_u32(t.count);
            buf.pack_u64(t.total_time);
        }
        buf.pack_u32(self.users.len() as u32);
        for u in &self.users {
            buf.pack_u32(u.uid);
            buf.pack_u32(u.count);
            buf.pack_u64(u.total_time);
        }
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        fn count(buf: &mut Buffer) -> Result<u32, UnpackError> {
            let count = buf.unpack_u32()?;
            if count as usize > crate::pack::MAX_ARRAY_LEN {
                return Err(UnpackError::InsaneCount(count));
            }
            Ok(count)
        }

        let time_start = buf.unpack_time()?;
        let mut rollups = Vec::new();
        for _ in 0..count(buf)? {
            rollups.push(RollupStat {
                count: buf.unpack_u32()?,
                total_time: buf.unpack_u64()?,
                max_time: buf.unpack_u64()?,
            });
        }
        let mut types = Vec::new();
        for _ in 0..count(buf)? {
            types.push(TypeStat {
                msg_type: buf.unpack_u16()?,
                count: buf.unpack_u32()?,
                total_time: buf.unpack_u64()?,
            });
        }
        let mut users = Vec::new();
        for _ in 0..count(buf)? {
            users.push(UserStat {
                uid: buf.unpack_u32()?,
                count: buf.unpack_u32()?,
                total_time: buf.unpack_u64()?,
            });
        }
        Ok(StatsMsg {
            time_start,
            rollups,
            types,
            users,
        })
    }
}

/// Pushed to registered controllers after accounting objects change.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccountingUpdateMsg {
    pub rpc_version: u16,
    pub kinds: Vec<String>,
}

impl Pack for AccountingUpdateMsg {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_u16(self.rpc_version);
        buf.pack_str_array(&self.kinds);
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(AccountingUpdateMsg {
            rpc_version: buf.unpack_u16()?,
            kinds: buf.unpack_str_array()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CrontabMsg {
    pub uid: u32,
    pub crontab: Option<String>,
}

impl Pack for CrontabMsg {
    fn pack(&self, buf: &mut Buffer, _version: u16) {
        buf.pack_u32(self.uid);
        buf.pack_str_or_null(self.crontab.as_deref());
    }

    fn unpack(buf: &mut Buffer, _version: u16) -> Result<Self, UnpackError> {
        Ok(CrontabMsg {
            uid: buf.unpack_u32()?,
            crontab: buf.unpack_str_or_null()?,
        })
    }
}
