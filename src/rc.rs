// Copyright 2020 Joyent, Inc.

//! Return codes carried in `PersistRc` bodies.

pub const SLURM_SUCCESS: i32 = 0;
pub const SLURM_ERROR: i32 = -1;

pub const EEXIST: i32 = 17;
pub const EINVAL: i32 = 22;

pub const SLURM_UNEXPECTED_MSG_ERROR: i32 = 1000;
pub const SLURM_PROTOCOL_VERSION_ERROR: i32 = 1005;
pub const SLURM_PROTOCOL_AUTHENTICATION_ERROR: i32 = 1007;
pub const SLURM_PROTOCOL_INSANE_MSG_LENGTH: i32 = 1008;
pub const SLURM_NO_CHANGE_IN_DATA: i32 = 1900;

pub const ESLURM_ACCESS_DENIED: i32 = 2002;
pub const ESLURM_INVALID_JOB_ID: i32 = 2017;
pub const ESLURM_QOS_PREEMPTION_LOOP: i32 = 2103;
pub const ESLURM_DB_CONNECTION: i32 = 7000;
pub const ESLURM_BAD_NAME: i32 = 7004;

/// Returned by the back-end when a job, step or suspend row being written is
/// already stored. Controllers replay these after reconnecting.
pub const DB_ROW_ALREADY_PRESENT: i32 = 740;

pub fn rc_str(rc: i32) -> &'static str {
    match rc {
        SLURM_SUCCESS => "No error",
        SLURM_ERROR => "Unspecified error",
        EEXIST => "File exists",
        EINVAL => "Invalid argument",
        SLURM_UNEXPECTED_MSG_ERROR => "Unexpected message received",
        SLURM_PROTOCOL_VERSION_ERROR => "Protocol version has changed, re-link your code",
        SLURM_PROTOCOL_AUTHENTICATION_ERROR => "Protocol authentication error",
        SLURM_PROTOCOL_INSANE_MSG_LENGTH => "Insane message length",
        SLURM_NO_CHANGE_IN_DATA => "Data has not changed since time specified",
        ESLURM_ACCESS_DENIED => "Access/permission denied",
        ESLURM_INVALID_JOB_ID => "Invalid job id specified",
        ESLURM_QOS_PREEMPTION_LOOP => "QOS Preemption loop detected",
        ESLURM_DB_CONNECTION => "Unable to connect to database",
        ESLURM_BAD_NAME => "Invalid name",
        DB_ROW_ALREADY_PRESENT => "Record already present",
        _ => "Unknown issue",
    }
}
