//! Canonical endpoint labels for request paths
//!
//! Metric labels must be drawn from a closed set to keep cardinality
//! bounded, so arbitrary request paths are collapsed onto the curated
//! prefixes below. Paths that carry a variable segment (a room id, an
//! event id, a user id) match the prefix ending just before it.

/// Sentinel label for paths not in the curated set.
pub const UNKNOWN_PATH: &str = "<unknown>";

/// Curated list of known path prefixes, matched longest-first. Entries
/// ending in '/' absorb their variable trailing segments.
static KNOWN_PREFIXES: &[&str] = &[
    "/_dendron/test",
    "/_dendron/metrics",
    "/_matrix/client/versions",
    "/_matrix/client/api/v1/login",
    "/_matrix/client/r0/login",
    "/_matrix/client/api/v1/register",
    "/_matrix/client/r0/register",
    "/_matrix/client/api/v1/events",
    "/_matrix/client/r0/events",
    "/_matrix/client/api/v1/initialSync",
    "/_matrix/client/r0/initialSync",
    "/_matrix/client/v2_alpha/sync",
    "/_matrix/client/r0/sync",
    "/_matrix/client/api/v1/publicRooms",
    "/_matrix/client/r0/publicRooms",
    "/_matrix/client/api/v1/rooms/",
    "/_matrix/client/r0/rooms/",
    "/_matrix/client/api/v1/join/",
    "/_matrix/client/r0/join/",
    "/_matrix/client/api/v1/profile/",
    "/_matrix/client/r0/profile/",
    "/_matrix/client/api/v1/presence/",
    "/_matrix/client/r0/presence/",
    "/_matrix/client/api/v1/directory/",
    "/_matrix/client/r0/directory/",
    "/_matrix/client/api/v1/pushrules/",
    "/_matrix/client/r0/pushrules/",
    "/_matrix/client/api/v1/pushers",
    "/_matrix/client/r0/pushers",
    "/_matrix/client/v2_alpha/account/",
    "/_matrix/client/r0/account/",
    "/_matrix/client/v2_alpha/keys/",
    "/_matrix/client/r0/keys/",
    "/_matrix/client/api/v1/voip/turnServer",
    "/_matrix/client/r0/voip/turnServer",
    "/_matrix/client/api/v1/createRoom",
    "/_matrix/client/r0/createRoom",
    "/_matrix/client/api/v1/user/",
    "/_matrix/client/r0/user/",
    "/_matrix/media/",
    "/_matrix/federation/v1/event/",
    "/_matrix/federation/v1/state/",
    "/_matrix/federation/v1/state_ids/",
    "/_matrix/federation/v1/backfill/",
    "/_matrix/federation/v1/get_missing_events/",
    "/_matrix/federation/v1/publicRooms",
    "/_matrix/federation/v1/send/",
    "/_matrix/federation/v1/query/",
    "/_matrix/federation/v1/make_join/",
    "/_matrix/federation/v1/send_join/",
    "/_matrix/federation/v1/invite/",
    "/_matrix/federation/v1/version",
    "/_matrix/key/v2/server",
];

/// Map a request path onto its canonical endpoint label.
///
/// Longest matching prefix wins; paths outside the curated set get the
/// [`UNKNOWN_PATH`] sentinel.
pub fn endpoint_for(path: &str) -> &'static str {
    let mut best: Option<&'static str> = None;
    for prefix in KNOWN_PREFIXES {
        if path.starts_with(prefix) && best.map_or(true, |b| prefix.len() > b.len()) {
            best = Some(prefix);
        }
    }
    best.unwrap_or(UNKNOWN_PATH)
}
