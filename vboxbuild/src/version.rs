//! Hypervisor version handling.
//!
//! `VBoxManage` reports versions as `7.0.10r158379`, hosts and tests pass
//! `v7.0` or `6.1`. Everything is normalized to a canonical `vX.Y.Z` form
//! before ordering comparisons. Flag names that changed between releases
//! are resolved by pure selector functions over that form.

use std::cmp::Ordering;
use std::fmt;

use semver::Version;
use vboxbuild_shared::errors::{BuildError, BuildResult};

/// First release that blocks NAT guests from reaching host loopback unless
/// `--nat-localhostreachable1` is set.
pub const LOCALHOST_REACHABLE_MIN: Version = Version::new(7, 0, 0);

/// First release that renamed `--audio` to `--audio-driver`.
pub const AUDIO_DRIVER_FLAG_MIN: Version = Version::new(7, 0, 0);

/// First release that accepts `--portcount` for SATA controllers.
pub const SATA_PORTCOUNT_FLAG_MIN: Version = Version::new(4, 3, 0);

/// First release with a VirtIO-SCSI storage controller.
pub const VIRTIO_CONTROLLER_MIN: Version = Version::new(6, 0, 0);

/// A parsed, zero-padded hypervisor version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalVersion(Version);

impl CanonicalVersion {
    /// Parse `X`, `X.Y` or `X.Y.Z`, with or without a leading `v`.
    ///
    /// A pre-release or build suffix is only accepted after a full
    /// `X.Y.Z` core. Components must be decimal without leading zeros.
    pub fn parse(input: &str) -> BuildResult<Self> {
        let trimmed = input.trim();
        let raw = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let invalid = || BuildError::Parse(format!("not a valid version: {:?}", input));

        let suffix_at = raw.find(['-', '+']).unwrap_or(raw.len());
        let (core, suffix) = raw.split_at(suffix_at);

        let parts: Vec<&str> = core.split('.').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(invalid());
        }
        if !suffix.is_empty() && parts.len() != 3 {
            return Err(invalid());
        }
        for part in &parts {
            let numeric = !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
            if !numeric || (part.len() > 1 && part.starts_with('0')) {
                return Err(invalid());
            }
        }

        let mut padded = parts.join(".");
        for _ in parts.len()..3 {
            padded.push_str(".0");
        }
        padded.push_str(suffix);

        Version::parse(&padded)
            .map(CanonicalVersion)
            .map_err(|_| invalid())
    }

    pub fn version(&self) -> &Version {
        &self.0
    }

    pub fn at_least(&self, min: &Version) -> bool {
        self.0.cmp_precedence(min) != Ordering::Less
    }
}

impl fmt::Display for CanonicalVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl PartialOrd for CanonicalVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CanonicalVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp_precedence(&other.0)
    }
}

/// Extract the version from raw `VBoxManage --version` output.
///
/// Keeps the leading run of digits and dots (`7.0.10r158379` -> `7.0.10`,
/// `5.2.0_RC1` -> `5.2.0`).
pub fn extract_tool_version(output: &str) -> BuildResult<String> {
    let line = output.trim();
    let end = line
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(line.len());
    let version = line[..end].trim_end_matches('.');

    if version.is_empty() {
        return Err(BuildError::Parse(format!(
            "no version found in VBoxManage output: {:?}",
            line
        )));
    }
    Ok(version.to_string())
}

/// Name of the audio driver flag for `modifyvm`.
///
/// Total over all inputs: versions that cannot be parsed get the older
/// `--audio` spelling.
pub fn audio_driver_flag(version: &str) -> &'static str {
    match CanonicalVersion::parse(version) {
        Ok(v) if v.at_least(&AUDIO_DRIVER_FLAG_MIN) => "--audio-driver",
        _ => "--audio",
    }
}

/// Name of the SATA port count flag for `storagectl`.
pub fn sata_port_count_flag(version: &str) -> &'static str {
    match CanonicalVersion::parse(version) {
        Ok(v) if !v.at_least(&SATA_PORTCOUNT_FLAG_MIN) => "--sataportcount",
        _ => "--portcount",
    }
}
