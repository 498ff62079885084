//! Extension versions and dependency version requirements.
//!
//! # Responsibility
//! - Parse `major.minor.patch` extension versions.
//! - Parse npm-style requirement strings (`^1.2.0`, `~0.4`, `>=1.0.0 <2`,
//!   `1.x || 2.x`, `1.0.0 - 1.4.0`) and evaluate them.
//!
//! # Invariants
//! - Every requirement is lowered to alternatives of comparator sets; an
//!   empty set matches any version.

use once_cell::sync::Lazy;
use regex::Regex;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

static COMPARATOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<op>\^|~|>=|<=|>|<|=)?v?(?P<major>\d+|[xX*])(?:\.(?P<minor>\d+|[xX*]))?(?:\.(?P<patch>\d+|[xX*]))?$",
    )
    .expect("valid version comparator regex")
});

/// Numeric semantic version triplet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses a strict `major.minor.patch` string.
    pub fn parse(value: &str) -> Result<Self, VersionError> {
        let normalized = value.trim();
        if normalized.is_empty() {
            return Err(VersionError::Empty);
        }
        let parts: Vec<&str> = normalized.split('.').collect();
        if parts.len() != 3
            || !parts
                .iter()
                .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
        {
            return Err(VersionError::InvalidVersion(normalized.to_string()));
        }
        let number = |part: &str| {
            part.parse::<u64>()
                .map_err(|_| VersionError::InvalidVersion(normalized.to_string()))
        };
        Ok(Self::new(
            number(parts[0])?,
            number(parts[1])?,
            number(parts[2])?,
        ))
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Comparator {
    op: Op,
    version: Version,
}

impl Comparator {
    fn new(op: Op, version: Version) -> Self {
        Self { op, version }
    }

    fn matches(&self, version: &Version) -> bool {
        match self.op {
            Op::Eq => *version == self.version,
            Op::Gt => *version > self.version,
            Op::Ge => *version >= self.version,
            Op::Lt => *version < self.version,
            Op::Le => *version <= self.version,
        }
    }
}

/// Partially specified version; `None` marks an omitted or wildcard part.
#[derive(Debug, Clone, Copy)]
struct Partial {
    major: Option<u64>,
    minor: Option<u64>,
    patch: Option<u64>,
}

impl Partial {
    fn floor(self) -> Version {
        Version::new(
            self.major.unwrap_or(0),
            self.minor.unwrap_or(0),
            self.patch.unwrap_or(0),
        )
    }

    /// Smallest version above every version the partial covers.
    ///
    /// `None` when that bound does not fit in `u64`.
    fn ceiling(self) -> Option<Ceiling> {
        Some(match (self.major, self.minor) {
            (None, _) => Ceiling::Unbounded,
            (Some(major), None) => Ceiling::Below(Version::new(major.checked_add(1)?, 0, 0)),
            (Some(major), Some(minor)) => {
                Ceiling::Below(Version::new(major, minor.checked_add(1)?, 0))
            }
        })
    }

    fn is_full(self) -> bool {
        self.patch.is_some()
    }
}

/// Upper bound of a partial version.
#[derive(Debug, Clone, Copy)]
enum Ceiling {
    /// Wildcard major; no upper bound.
    Unbounded,
    Below(Version),
}

/// Dependency version requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionReq {
    raw: String,
    alternatives: Vec<Vec<Comparator>>,
}

impl VersionReq {
    /// Requirement satisfied by every version.
    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            alternatives: vec![Vec::new()],
        }
    }

    pub fn parse(value: &str) -> Result<Self, VersionError> {
        let raw = value.trim();
        if raw.is_empty() {
            return Err(VersionError::Empty);
        }
        let alternatives = raw
            .split("||")
            .map(|alternative| parse_alternative(alternative, raw))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            raw: raw.to_string(),
            alternatives,
        })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|comparators| {
            comparators
                .iter()
                .all(|comparator| comparator.matches(version))
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl Display for VersionReq {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for VersionReq {
    type Err = VersionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

fn parse_alternative(alternative: &str, raw: &str) -> Result<Vec<Comparator>, VersionError> {
    let invalid = || VersionError::InvalidRequirement(raw.to_string());
    let mut tokens: Vec<String> = Vec::new();
    let mut pending_op: Option<&str> = None;
    for token in alternative.split_whitespace() {
        if matches!(token, "^" | "~" | ">=" | "<=" | ">" | "<" | "=") {
            if pending_op.is_some() {
                return Err(invalid());
            }
            pending_op = Some(token);
            continue;
        }
        match pending_op.take() {
            Some(op) => tokens.push(format!("{op}{token}")),
            None => tokens.push(token.to_string()),
        }
    }
    if pending_op.is_some() {
        return Err(invalid());
    }

    if tokens.is_empty() {
        return Ok(Vec::new());
    }
    if tokens.len() == 3 && tokens[1] == "-" {
        return hyphen_range(&tokens[0], &tokens[2]).ok_or_else(invalid);
    }

    let mut comparators = Vec::new();
    for token in &tokens {
        comparators.extend(desugar(token).ok_or_else(invalid)?);
    }
    Ok(comparators)
}

fn parse_partial(token: &str) -> Option<(&str, Partial)> {
    let captures = COMPARATOR_RE.captures(token)?;
    let part = |name: &str| -> Option<Option<u64>> {
        match captures.name(name).map(|m| m.as_str()) {
            None | Some("x") | Some("X") | Some("*") => Some(None),
            Some(digits) => digits.parse::<u64>().ok().map(Some),
        }
    };
    let major = part("major")?;
    let minor = major.and(part("minor")?);
    let patch = minor.and(part("patch")?);
    let op = captures.name("op").map(|m| m.as_str()).unwrap_or("");
    Some((
        op,
        Partial {
            major,
            minor,
            patch,
        },
    ))
}

fn desugar(token: &str) -> Option<Vec<Comparator>> {
    let (op, partial) = parse_partial(token)?;
    let floor = partial.floor();
    let nothing = vec![Comparator::new(Op::Lt, Version::new(0, 0, 0))];

    let comparators = match op {
        "" | "=" if partial.is_full() => vec![Comparator::new(Op::Eq, floor)],
        "" | "=" => match partial.ceiling()? {
            Ceiling::Below(ceiling) => vec![
                Comparator::new(Op::Ge, floor),
                Comparator::new(Op::Lt, ceiling),
            ],
            Ceiling::Unbounded => Vec::new(),
        },
        "^" => {
            let Some(major) = partial.major else {
                return Some(Vec::new());
            };
            let upper = match (major, partial.minor, partial.patch) {
                (0, Some(0), Some(patch)) => Version::new(0, 0, patch.checked_add(1)?),
                (0, Some(minor), _) => Version::new(0, minor.checked_add(1)?, 0),
                (major, _, _) => Version::new(major.checked_add(1)?, 0, 0),
            };
            vec![
                Comparator::new(Op::Ge, floor),
                Comparator::new(Op::Lt, upper),
            ]
        }
        "~" => match partial.ceiling()? {
            Ceiling::Below(ceiling) => vec![
                Comparator::new(Op::Ge, floor),
                Comparator::new(Op::Lt, ceiling),
            ],
            Ceiling::Unbounded => Vec::new(),
        },
        ">" if partial.is_full() => vec![Comparator::new(Op::Gt, floor)],
        ">" => match partial.ceiling()? {
            Ceiling::Below(ceiling) => vec![Comparator::new(Op::Ge, ceiling)],
            Ceiling::Unbounded => nothing,
        },
        ">=" => match partial.major {
            Some(_) => vec![Comparator::new(Op::Ge, floor)],
            None => Vec::new(),
        },
        "<" => match partial.major {
            Some(_) => vec![Comparator::new(Op::Lt, floor)],
            None => nothing,
        },
        "<=" if partial.is_full() => vec![Comparator::new(Op::Le, floor)],
        "<=" => match partial.ceiling()? {
            Ceiling::Below(ceiling) => vec![Comparator::new(Op::Lt, ceiling)],
            Ceiling::Unbounded => Vec::new(),
        },
        _ => return None,
    };
    Some(comparators)
}

fn hyphen_range(lower: &str, upper: &str) -> Option<Vec<Comparator>> {
    let (lower_op, lower) = parse_partial(lower)?;
    let (upper_op, upper) = parse_partial(upper)?;
    if !lower_op.is_empty() || !upper_op.is_empty() {
        return None;
    }
    let mut comparators = vec![Comparator::new(Op::Ge, lower.floor())];
    if upper.is_full() {
        comparators.push(Comparator::new(Op::Le, upper.floor()));
    } else if let Ceiling::Below(ceiling) = upper.ceiling()? {
        comparators.push(Comparator::new(Op::Lt, ceiling));
    }
    Some(comparators)
}

/// Version and requirement parse errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    Empty,
    InvalidVersion(String),
    InvalidRequirement(String),
}

impl Display for VersionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "version value must not be empty"),
            Self::InvalidVersion(value) => write!(
                f,
                "version is invalid: {value} (expected major.minor.patch)"
            ),
            Self::InvalidRequirement(value) => {
                write!(f, "version requirement is invalid: {value}")
            }
        }
    }
}

impl Error for VersionError {}
