// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Random names, passwords and endpoints for ephemeral grants.
//!
//! Everything here is drawn from the operating system CSPRNG. Uniqueness is
//! probabilistic; duplicate endpoints are rejected by the tunnel registry.

use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;

use crate::constants::{
    PASSWORD_LENGTH, PRINCIPAL_PREFIX, PRINCIPAL_RANDOM_BYTES, TUNNEL_PORT_MAX, TUNNEL_PORT_MIN,
};

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "calm", "clever", "dapper", "eager", "fancy", "gentle", "happy", "jolly",
    "keen", "lively", "lucid", "merry", "nimble", "noble", "plucky", "quiet", "rapid", "serene",
    "shiny", "silent", "sleepy", "snappy", "steady", "sunny", "swift", "tidy", "vivid", "wise",
    "witty", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "bison", "canyon", "comet", "condor", "falcon", "ferret", "glacier",
    "harbor", "heron", "island", "jackal", "lagoon", "lynx", "meadow", "nebula", "orca", "otter",
    "panda", "pebble", "quasar", "raven", "summit", "tundra", "walrus", "willow", "wombat", "yak",
    "zebra", "puffin", "marmot",
];

/// Where a tunnel will listen and how clients address it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Subdomain label, also the tunnel registry key.
    pub label: String,
    pub port: u16,
    /// `label.app_host`
    pub host: String,
}

/// Returns a fresh principal name such as `temp_3f9c01d2a4b7e6f0`.
pub fn new_principal_name() -> String {
    let mut bytes = [0u8; PRINCIPAL_RANDOM_BYTES];
    OsRng.fill(&mut bytes);
    format!("{PRINCIPAL_PREFIX}{}", hex::encode(bytes))
}

/// Returns a [`PASSWORD_LENGTH`] character password over `[A-Za-z0-9]`.
pub fn new_password() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

pub fn new_endpoint(app_host: &str) -> Endpoint {
    let mut rng = OsRng;

    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    let suffix: u8 = rng.gen_range(0..100);
    let label = format!("{adjective}-{noun}-{suffix:02}");

    let port = rng.gen_range(TUNNEL_PORT_MIN..=TUNNEL_PORT_MAX);
    let host = format!("{label}.{app_host}");

    Endpoint { label, port, host }
}
