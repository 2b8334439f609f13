// Copyright 2020 Joyent, Inc.

//! Caller privilege predicates.
//!
//! Three predicates are evaluated in rising order of privilege. A uid that
//! passes `is_super_user` also passes `is_operator` for the same cache
//! state, and both are implied by `is_slurm_user`.

use std::fmt;

use num_derive::{FromPrimitive, ToPrimitive};

use crate::storage::AcctStorage;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive,
)]
pub enum AdminLevel {
    NotSet = 0,
    None = 1,
    Operator = 2,
    Admin = 3,
}

impl Default for AdminLevel {
    fn default() -> Self {
        AdminLevel::NotSet
    }
}

impl AdminLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AdminLevel::NotSet => "Not Set",
            AdminLevel::None => "None",
            AdminLevel::Operator => "Operator",
            AdminLevel::Admin => "Administrator",
        }
    }
}

/// The privilege a handler requires before it runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrivClass {
    /// No check here. The back-end applies its own checks using the uid.
    Open,
    Operator,
    Super,
    SlurmUser,
}

impl fmt::Display for PrivClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrivClass::Open => "no",
            PrivClass::Operator => "operator",
            PrivClass::Super => "super user",
            PrivClass::SlurmUser => "SlurmUser",
        };
        write!(f, "{}", name)
    }
}

/// Answers the privilege predicates for one handler invocation.
pub struct Privileges<'a> {
    slurm_user_id: u32,
    storage: &'a dyn AcctStorage,
    drop_priv: bool,
}

impl<'a> Privileges<'a> {
    pub fn new(
        slurm_user_id: u32,
        storage: &'a dyn AcctStorage,
        drop_priv: bool,
    ) -> Privileges<'a> {
        Privileges {
            slurm_user_id,
            storage,
            drop_priv: drop_priv && cfg!(feature = "drop-priv"),
        }
    }

    pub fn is_slurm_user(&self, uid: u32) -> bool {
        if self.drop_priv {
            return false;
        }
        uid == 0 || uid == self.slurm_user_id
    }

    pub fn is_operator(&self, uid: u32) -> bool {
        if self.drop_priv {
            return false;
        }
        self.is_slurm_user(uid) || self.storage.admin_level(uid) >= AdminLevel::Operator
    }

    pub fn is_super_user(&self, uid: u32) -> bool {
        if self.drop_priv {
            return false;
        }
        self.is_slurm_user(uid) || self.storage.admin_level(uid) >= AdminLevel::Admin
    }

    pub fn check(&self, class: PrivClass, uid: u32) -> bool {
        match class {
            PrivClass::Open => true,
            PrivClass::Operator => self.is_operator(uid),
            PrivClass::Super => self.is_super_user(uid),
            PrivClass::SlurmUser => self.is_slurm_user(uid),
        }
    }
}
