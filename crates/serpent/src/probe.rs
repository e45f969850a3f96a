use std::fmt;

/// First runtime release with per-interpreter locks.
pub const MIN_ISOLATION_VERSION: Version = Version { major: 3, minor: 12 };

/// Whether this platform may use isolated contexts at all.
pub const PLATFORM_SUPPORTS_ISOLATION: bool = cfg!(target_os = "linux");

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Result of probing the guest runtime once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub version: Option<Version>,
    pub isolation: bool,
}

impl Capabilities {
    /// Decide isolation support from a raw version banner.
    ///
    /// An unparseable banner disables isolation rather than failing.
    #[must_use]
    pub fn from_banner(banner: &str, platform_supported: bool) -> Self {
        let version = parse_version(banner);
        Self {
            version,
            isolation: platform_supported && version.is_some_and(|v| v >= MIN_ISOLATION_VERSION),
        }
    }
}

/// Parse `"3.12.1 (main, ...)"` into `3.12`.
#[must_use]
pub fn parse_version(banner: &str) -> Option<Version> {
    let mut parts = banner.trim_start().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?;
    let digits = minor
        .find(|c: char| !c.is_ascii_digit())
        .map_or(minor, |end| &minor[..end]);
    let minor = digits.parse().ok()?;
    Some(Version { major, minor })
}
