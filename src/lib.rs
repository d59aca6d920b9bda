//! # Permesi authflow
//!
//! Interactive authentication flows (signup, login, account recovery) run as
//! replayable workflows. A client creates a flow, receives the action the
//! flow waits for, and feeds inputs until the flow reports `finished`.
//!
//! ## State model
//!
//! The server stores no mutable flow state. Each accepted input is appended
//! as an immutable node to the workflow's log and the current state is
//! rebuilt by replaying that log. Clients address a point in the log with an
//! `instance_id`; appending against anything but the head is a conflict.
//!
//! ## Cross-device flows
//!
//! `GET /v1/authflows/ws/{workflow_id}` pushes a `changed` text frame when
//! the workflow advances elsewhere (for example a code confirmed on another
//! device). The frame carries no state; clients re-fetch.
//!
//! See [`authflow`] for the engine and [`api`] for the HTTP surface.

pub mod api;
pub mod authflow;
pub mod cli;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_commit_hash_is_hex_or_unknown() {
        if GIT_COMMIT_HASH == "unknown" {
            return;
        }
        assert!(GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(GIT_COMMIT_HASH.len() >= 7);
    }
}
