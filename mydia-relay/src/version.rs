//! Tunnel protocol version negotiation.
//!
//! Versions are `major.minor` strings. Two sides are compatible when they
//! share a major version; the highest such version offered by the remote
//! wins. Incompatibility is reported together with the local supported list
//! so that outdated instances can tell users to upgrade instead of silently
//! failing.

use thiserror::Error;

/// Protocol versions spoken by this relay, newest first.
pub const SUPPORTED_VERSIONS: &[&str] = &["1.0"];

#[derive(Debug, Error)]
#[error("no compatible protocol version")]
pub struct NoCompatibleVersion;

/// Picks the highest remote version whose major version we also speak.
pub fn negotiate<S: AsRef<str>>(remote_versions: &[S]) -> Result<String, NoCompatibleVersion> {
    remote_versions
        .iter()
        .map(AsRef::as_ref)
        .filter_map(|version| parse(version).map(|parsed| (parsed, version)))
        .filter(|((major, _), _)| local_majors().any(|local_major| local_major == *major))
        .max_by_key(|(parsed, _)| *parsed)
        .map(|(_, version)| version.to_owned())
        .ok_or(NoCompatibleVersion)
}

fn local_majors() -> impl Iterator<Item = u32> {
    SUPPORTED_VERSIONS.iter().filter_map(|version| Some(parse(version)?.0))
}

fn parse(version: &str) -> Option<(u32, u32)> {
    let (major, minor) = version.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::exact(&["1.0"], "1.0")]
    #[case::highest_compatible_wins(&["1.0", "1.4", "1.2"], "1.4")]
    #[case::garbage_entries_are_skipped(&["banana", "1", "1.0"], "1.0")]
    fn negotiation_succeeds(#[case] remote: &[&str], #[case] expected: &str) {
        assert_eq!(negotiate(remote).unwrap(), expected);
    }

    #[rstest]
    #[case::newer_major(&["2.0"])]
    #[case::no_shared_major(&["0.9", "2.0"])]
    #[case::garbage_only(&["banana"])]
    #[case::empty(&[])]
    fn negotiation_fails(#[case] remote: &[&str]) {
        assert!(negotiate(remote).is_err());
    }
}
