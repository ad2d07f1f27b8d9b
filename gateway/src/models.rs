// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;
use zeroize::ZeroizeOnDrop;

use crate::constants::{
    MAX_DATABASES_COUNT, MAX_GRANT_TTL_SECS, MAX_TABLES_COUNT, MIN_GRANT_TTL_SECS,
};
use crate::permissions::PermissionSet;

/// Administrative login used to create, grant and drop principals.
///
/// Assumed valid against every database on the server.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct AdminCredentials {
    pub user: String,
    pub password: String,
}

impl AdminCredentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

// Custom Debug implementation to prevent accidental logging of sensitive data
impl fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// A temporary principal bound to one tunnel.
///
/// `host` and `port` point at the tunnel, never at the database itself.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct EphemeralCredential {
    #[zeroize(skip)]
    pub host: String,
    #[zeroize(skip)]
    pub port: u16,
    #[zeroize(skip)]
    pub username: String,
    pub password: String,
    #[zeroize(skip)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for EphemeralCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralCredential")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Body of `POST /grants`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GrantRequest {
    #[validate(custom(function = "validate_permissions"))]
    pub permissions: PermissionSet,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(range(min = "MIN_GRANT_TTL_SECS", max = "MAX_GRANT_TTL_SECS"))]
    pub ttl_secs: Option<u64>,
}

fn validate_permissions(permissions: &PermissionSet) -> Result<(), validator::ValidationError> {
    if permissions.is_empty() {
        return Err(validator::ValidationError::new("empty_permissions"));
    }
    if permissions.database_count() > MAX_DATABASES_COUNT {
        return Err(validator::ValidationError::new("too_many_databases"));
    }
    if permissions.table_count() > MAX_TABLES_COUNT {
        return Err(validator::ValidationError::new("too_many_tables"));
    }
    Ok(())
}

/// Databases and their base tables, as offered to requesters.
pub type Catalog = BTreeMap<String, Vec<String>>;

/// Point-in-time view of an open tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub subdomain: String,
    pub port: u16,
    pub expires_at: DateTime<Utc>,
    pub active_clients: usize,
    pub queries_audited: u64,
    pub malformed_frames: u64,
}
