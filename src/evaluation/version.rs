use std::{cmp::Ordering, sync::OnceLock};

use regex::Regex;

/// A `major.minor[.patch[-prerelease]]` version.
///
/// Looser than semver: patch is optional and defaults to zero, leading zeros are accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    major: u64,
    minor: u64,
    patch: u64,
    pre_release: Option<String>,
}

fn version_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^(\d+)\.(\d+)(\.(\d+)(-(([-\w]+\.?)*))?)?$")
            .expect("version pattern should compile")
    })
}

impl Version {
    pub fn parse(s: &str) -> Option<Version> {
        let captures = version_regex().captures(s)?;
        let major = captures.get(1)?.as_str().parse().ok()?;
        let minor = captures.get(2)?.as_str().parse().ok()?;
        let patch = match captures.get(4) {
            Some(patch) => patch.as_str().parse().ok()?,
            None => 0,
        };
        // Kept with its leading dash, which does not affect ordering.
        let pre_release = captures.get(5).map(|m| m.as_str().to_owned());
        Some(Version {
            major,
            minor,
            patch,
            pre_release,
        })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| match (&self.pre_release, &other.pre_release) {
                (None, None) => Ordering::Equal,
                // A pre-release precedes the release it belongs to.
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
