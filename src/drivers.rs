//! EC driver registry and capability-matched selection.
//!
//! Every channel implementation the binary knows about is described by a
//! [`DriverDescriptor`]. The registry is built once at startup with
//! [`registry`] and is read-only afterwards; [`select`] picks the single best
//! match for the running platform.

use std::{fmt, fs, io, str::FromStr, sync::Arc};

use log::debug;

use crate::ec::{
    EcChannel, EcTimings, dev_port,
    register_file::{ACPI_EC_PATH, EC_SYS_PATH, RegisterFileChannel},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformId {
    Linux,
    Windows,
    MacOs,
    FreeBsd,
    Other,
}

impl PlatformId {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Self::Linux,
            "windows" => Self::Windows,
            "macos" => Self::MacOs,
            "freebsd" => Self::FreeBsd,
            _ => Self::Other,
        }
    }
}

/// Numeric `major.minor.patch` prefix of an OS release string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl OsVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid OS version: {0:?}")]
pub struct ParseOsVersionError(String);

impl FromStr for OsVersion {
    type Err = ParseOsVersionError;

    /// Parses the leading numeric part, so `6.18.44-fc-v130` is `6.18.44`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let end = s
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());
        let invalid = || ParseOsVersionError(s.to_string());
        let mut numbers = s[..end]
            .split('.')
            .filter(|p| !p.is_empty())
            .map(str::parse::<u32>);
        let mut next = || numbers.next().transpose().map_err(|_| invalid());

        let major = next()?.ok_or_else(invalid)?;
        let minor = next()?.unwrap_or(0);
        let patch = next()?.unwrap_or(0);
        Ok(Self::new(major, minor, patch))
    }
}

/// The running platform as seen by the selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub id: PlatformId,
    pub version: OsVersion,
    pub description: String,
}

impl PlatformInfo {
    pub fn detect() -> io::Result<Self> {
        let id = PlatformId::current();
        if id != PlatformId::Linux {
            return Ok(Self {
                id,
                version: OsVersion::default(),
                description: std::env::consts::OS.to_string(),
            });
        }

        let release = fs::read_to_string("/proc/sys/kernel/osrelease")?;
        let version = release
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let description = fs::read_to_string("/proc/version")
            .unwrap_or_else(|_| release.clone())
            .trim()
            .to_string();

        Ok(Self {
            id,
            version,
            description,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverDescriptor {
    pub name: &'static str,
    pub platform: PlatformId,
    pub min_os_version: Option<OsVersion>,
    pub max_os_version: Option<OsVersion>,
    pub platform_string_substring: Option<&'static str>,
    pub priority: i32,
}

impl DriverDescriptor {
    pub fn matches(&self, platform: &PlatformInfo) -> bool {
        self.platform == platform.id
            && self.min_os_version.is_none_or(|min| platform.version >= min)
            && self.max_os_version.is_none_or(|max| platform.version <= max)
            && self
                .platform_string_substring
                .is_none_or(|s| platform.description.contains(s))
    }
}

pub type ChannelFactory = Box<dyn Fn(EcTimings) -> io::Result<Arc<dyn EcChannel>> + Send + Sync>;

pub struct DriverEntry {
    pub descriptor: DriverDescriptor,
    pub factory: ChannelFactory,
}

impl fmt::Debug for DriverEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverEntry")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl DriverEntry {
    pub fn new<F>(descriptor: DriverDescriptor, factory: F) -> Self
    where
        F: Fn(EcTimings) -> io::Result<Arc<dyn EcChannel>> + Send + Sync + 'static,
    {
        Self {
            descriptor,
            factory: Box::new(factory),
        }
    }

    pub fn name(&self) -> &'static str {
        self.descriptor.name
    }

    pub fn create(&self, timings: EcTimings) -> io::Result<Arc<dyn EcChannel>> {
        (self.factory)(timings)
    }
}

/// Channels compiled into this binary.
pub fn registry() -> Vec<DriverEntry> {
    vec![
        DriverEntry::new(
            DriverDescriptor {
                name: "dev_port",
                platform: PlatformId::Linux,
                min_os_version: None,
                max_os_version: None,
                platform_string_substring: None,
                priority: 10,
            },
            |timings| {
                dev_port::open_channel(timings).map(|c| Arc::new(c) as Arc<dyn EcChannel>)
            },
        ),
        DriverEntry::new(
            DriverDescriptor {
                name: "ec_sys",
                platform: PlatformId::Linux,
                min_os_version: Some(OsVersion::new(2, 6, 35)),
                max_os_version: None,
                platform_string_substring: None,
                priority: 5,
            },
            |timings| {
                RegisterFileChannel::open("ec_sys", EC_SYS_PATH, timings)
                    .map(|c| Arc::new(c) as Arc<dyn EcChannel>)
            },
        ),
        DriverEntry::new(
            DriverDescriptor {
                name: "acpi_ec",
                platform: PlatformId::Linux,
                min_os_version: None,
                max_os_version: None,
                platform_string_substring: None,
                priority: 0,
            },
            |timings| {
                RegisterFileChannel::open("acpi_ec", ACPI_EC_PATH, timings)
                    .map(|c| Arc::new(c) as Arc<dyn EcChannel>)
            },
        ),
    ]
}

/// Highest-priority matching driver; ties go to the earliest entry.
pub fn select<'a>(registry: &'a [DriverEntry], platform: &PlatformInfo) -> Option<&'a DriverEntry> {
    let mut best: Option<&DriverEntry> = None;
    for entry in registry {
        if !entry.descriptor.matches(platform) {
            debug!("EC driver {} does not match platform", entry.name());
            continue;
        }
        if best.is_none_or(|b| entry.descriptor.priority > b.descriptor.priority) {
            best = Some(entry);
        }
    }
    best
}

/// A specific driver by name, still subject to platform matching.
pub fn select_named<'a>(
    registry: &'a [DriverEntry],
    platform: &PlatformInfo,
    name: &str,
) -> Option<&'a DriverEntry> {
    registry
        .iter()
        .find(|entry| entry.name() == name && entry.descriptor.matches(platform))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec::MockEcChannel;
    use pretty_assertions::assert_eq;

    fn linux(version: &str, description: &str) -> PlatformInfo {
        PlatformInfo {
            id: PlatformId::Linux,
            version: version.parse().unwrap(),
            description: description.to_string(),
        }
    }

    fn descriptor(name: &'static str, priority: i32) -> DriverDescriptor {
        DriverDescriptor {
            name,
            platform: PlatformId::Linux,
            min_os_version: None,
            max_os_version: None,
            platform_string_substring: None,
            priority,
        }
    }

    fn entry(descriptor: DriverDescriptor) -> DriverEntry {
        DriverEntry::new(descriptor, |_| {
            Ok(Arc::new(MockEcChannel::new()) as Arc<dyn EcChannel>)
        })
    }

    #[test]
    fn parses_kernel_release_strings() {
        assert_eq!("6.18.44-fc-v130".parse::<OsVersion>(), Ok(OsVersion::new(6, 18, 44)));
        assert_eq!("5.4".parse::<OsVersion>(), Ok(OsVersion::new(5, 4, 0)));
        assert_eq!("10\n".parse::<OsVersion>(), Ok(OsVersion::new(10, 0, 0)));
        assert!("generic".parse::<OsVersion>().is_err());
    }

    #[test]
    fn parse_error_names_the_input() {
        let err = "generic".parse::<OsVersion>().unwrap_err();
        assert_eq!(err.to_string(), "invalid OS version: \"generic\"");

        let _: Box<dyn std::error::Error + Send + Sync> = Box::new(err);
    }

    #[test]
    fn highest_priority_wins() {
        let registry = vec![
            entry(descriptor("low", 0)),
            entry(descriptor("high", 10)),
            entry(descriptor("mid", 5)),
        ];

        let chosen = select(&registry, &linux("6.1.0", "Linux")).unwrap();
        assert_eq!(chosen.name(), "high");
    }

    #[test]
    fn priority_tie_goes_to_first_declared() {
        let registry = vec![entry(descriptor("first", 3)), entry(descriptor("second", 3))];

        let chosen = select(&registry, &linux("6.1.0", "Linux")).unwrap();
        assert_eq!(chosen.name(), "first");
    }

    #[test]
    fn version_bounds_are_inclusive() {
        let bounded = DriverDescriptor {
            min_os_version: Some(OsVersion::new(2, 6, 35)),
            max_os_version: Some(OsVersion::new(6, 1, 0)),
            ..descriptor("bounded", 0)
        };

        assert!(bounded.matches(&linux("2.6.35", "")));
        assert!(bounded.matches(&linux("6.1.0", "")));
        assert!(!bounded.matches(&linux("2.6.34", "")));
        assert!(!bounded.matches(&linux("6.1.1", "")));
    }

    #[test]
    fn substring_and_platform_must_match() {
        let vendor = DriverDescriptor {
            platform_string_substring: Some("clevo"),
            ..descriptor("vendor", 20)
        };
        let registry = vec![entry(vendor), entry(descriptor("generic", 1))];

        let chosen = select(&registry, &linux("6.1.0", "Linux version 6.1.0-clevo")).unwrap();
        assert_eq!(chosen.name(), "vendor");

        let chosen = select(&registry, &linux("6.1.0", "Linux version 6.1.0")).unwrap();
        assert_eq!(chosen.name(), "generic");

        let windows = PlatformInfo {
            id: PlatformId::Windows,
            ..linux("10.0.0", "clevo")
        };
        assert!(select(&registry, &windows).is_none());
    }

    #[test]
    fn named_selection_respects_platform() {
        let registry = vec![
            entry(descriptor("dev_port", 10)),
            entry(DriverDescriptor {
                min_os_version: Some(OsVersion::new(7, 0, 0)),
                ..descriptor("future", 0)
            }),
        ];
        let platform = linux("6.18.44-fc-v130", "Linux");

        assert_eq!(
            select_named(&registry, &platform, "dev_port").map(DriverEntry::name),
            Some("dev_port")
        );
        assert!(select_named(&registry, &platform, "future").is_none());
        assert!(select_named(&registry, &platform, "missing").is_none());
    }

    #[test]
    fn builtin_registry_prefers_dev_port_on_linux() {
        let registry = registry();
        let names: Vec<_> = registry.iter().map(DriverEntry::name).collect();
        assert_eq!(names, ["dev_port", "ec_sys", "acpi_ec"]);

        let chosen = select(&registry, &linux("6.18.44", "Linux")).unwrap();
        assert_eq!(chosen.name(), "dev_port");

        let old = select_named(&registry, &linux("2.6.32", "Linux"), "ec_sys");
        assert!(old.is_none());
    }
}
