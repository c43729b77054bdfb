//! Database version extraction and upgrade-path gating.

use std::sync::LazyLock;

use regex::Regex;
use semver::Version;

use crate::error::VersionError;

static SEMVER_TRIPLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.\d+\.\d+").expect("static regex"));

const GP_VERSION_MARKER: &str = "postgres (Greenplum Database) ";
const SELECT_VERSION_MARKER: &str = "(Greenplum Database ";

/// Parse the output of `postgres --gp-version`.
///
/// Example: `postgres (Greenplum Database) 6.20.3 build commit:abc`.
pub fn parse_gp_version_output(raw: &str) -> Result<Version, VersionError> {
    let trimmed = raw.trim();
    let (_, rest) = trimmed
        .split_once(GP_VERSION_MARKER)
        .ok_or_else(|| VersionError::UnexpectedFormat {
            raw: raw.to_string(),
            expected: "postgres (Greenplum Database) #.#.#",
        })?;
    extract_triple(raw, rest)
}

/// Parse the result of `SELECT version()`.
///
/// Example: `PostgreSQL 9.4.26 (Greenplum Database 6.20.3 build ...) on x86_64`.
pub fn parse_select_version_output(raw: &str) -> Result<Version, VersionError> {
    let trimmed = raw.trim();
    let (_, rest) = trimmed
        .split_once(SELECT_VERSION_MARKER)
        .ok_or_else(|| VersionError::UnexpectedFormat {
            raw: raw.to_string(),
            expected: "PostgreSQL #.#.# (Greenplum Database #.#.#)",
        })?;
    let inner = rest.split(')').next().unwrap_or_default();
    extract_triple(raw, inner)
}

fn extract_triple(raw: &str, haystack: &str) -> Result<Version, VersionError> {
    let found = SEMVER_TRIPLE
        .find(haystack)
        .ok_or_else(|| VersionError::Parse {
            raw: raw.to_string(),
            reason: "no major.minor.patch version found".to_string(),
        })?;
    Version::parse(found.as_str()).map_err(|e| VersionError::Parse {
        raw: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Source major versions this tool can upgrade from, with their target major.
const SUPPORTED_PATHS: &[(u64, u64)] = &[(5, 6), (6, 7)];

/// Check that `source -> target` is a supported upgrade path.
///
/// The target must be exactly one major version ahead of a supported source.
pub fn validate_upgrade_path(source: &Version, target: &Version) -> Result<(), VersionError> {
    let supported = SUPPORTED_PATHS
        .iter()
        .any(|(from, to)| source.major == *from && target.major == *to);
    if supported {
        Ok(())
    } else {
        Err(VersionError::UnsupportedUpgrade {
            source_version: source.clone(),
            target: target.clone(),
        })
    }
}
