// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::time::Duration;

/// Verbs that may ever appear in a `GRANT` issued to an ephemeral principal.
pub const ALLOWED_VERBS: [&str; 7] = [
    "SELECT",
    "INSERT",
    "UPDATE",
    "DELETE",
    "TRUNCATE",
    "REFERENCES",
    "TRIGGER",
];

pub const PRINCIPAL_PREFIX: &str = "temp_";
pub const PRINCIPAL_RANDOM_BYTES: usize = 8;
pub const PASSWORD_LENGTH: usize = 16;

// inclusive on both ends
pub const TUNNEL_PORT_MIN: u16 = 20000;
pub const TUNNEL_PORT_MAX: u16 = 40000;

/// Database the administrative connection lands on before any grants.
pub const MAINTENANCE_DATABASE: &str = "postgres";
pub const ADMIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_GRANT_TTL: Duration = Duration::from_secs(40);

// Validation constants for GrantRequest
pub const MIN_GRANT_TTL_SECS: u64 = 1;
pub const MAX_GRANT_TTL_SECS: u64 = 24 * 60 * 60;
pub const MAX_DATABASES_COUNT: usize = 64;
pub const MAX_TABLES_COUNT: usize = 1024;
pub const MAX_REQUEST_BODY_SIZE: usize = 1024 * 1024; // 1 MB

/// Simple-query message type in the PostgreSQL frontend protocol.
pub const SIMPLE_QUERY_TAG: u8 = b'Q';
/// One type byte followed by a four-byte length.
pub const FRAME_HEADER_LEN: usize = 5;
