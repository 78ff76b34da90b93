//! Version normalization and "is the SDK new enough" checks across the
//! Python (PEP 440) and Node (npm semver) spellings that show up in agent
//! projects.

use once_cell::sync::Lazy;
use regex::Regex;
use semver::Version;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("unparseable version `{0}`")]
    Unparseable(String),
}

/// Where the observed version string came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Pinned, exact version from a lock file.
    Lock,
    /// Constraint from a manifest (`package.json`, `pyproject.toml`, ...).
    Manifest,
}

const OPERATORS: [&str; 9] = ["~=", ">=", "<=", "==", "^", "~", ">", "<", "="];

static PARTIAL: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"^v?(\d+)(?:\.(\d+|[xX*]))?(?:\.(\d+|[xX*]))?(?:-([0-9A-Za-z.-]+)|\.?([A-Za-z][0-9A-Za-z.-]*))?(?:\+([0-9A-Za-z.-]+))?$",
    )
    .ok()
});

/// A possibly incomplete version: `1`, `1.4`, `1.4.x`, `1.3.0rc1`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Partial {
    major: u64,
    minor: Option<u64>,
    patch: Option<u64>,
    pre: String,
    build: String,
}

impl Partial {
    fn parse(raw: &str) -> Option<Self> {
        let re = PARTIAL.as_ref()?;
        let caps = re.captures(raw)?;
        let number = |idx: usize| caps.get(idx).and_then(|m| m.as_str().parse::<u64>().ok());
        let text = |idx: usize| caps.get(idx).map(|m| m.as_str().to_string());
        let minor = number(2);
        let patch = minor.and(number(3));
        Some(Self {
            major: number(1)?,
            minor,
            patch,
            pre: text(4).or_else(|| text(5)).unwrap_or_default(),
            build: text(6).unwrap_or_default(),
        })
    }

    fn floor_string(&self) -> String {
        let mut out = format!(
            "{}.{}.{}",
            self.major,
            self.minor.unwrap_or(0),
            self.patch.unwrap_or(0)
        );
        if !self.pre.is_empty() {
            out.push('-');
            out.push_str(&self.pre);
        }
        if !self.build.is_empty() {
            out.push('+');
            out.push_str(&self.build);
        }
        out
    }

    fn floor(&self) -> Result<Version, VersionError> {
        let text = self.floor_string();
        Version::parse(&text).map_err(|_| VersionError::Unparseable(text))
    }
}

fn clean(raw: &str) -> &str {
    raw.trim().trim_matches(|c| c == '"' || c == '\'').trim()
}

fn split_operator(raw: &str) -> (&str, &str) {
    let raw = clean(raw);
    for op in OPERATORS {
        if let Some(rest) = raw.strip_prefix(op) {
            return (op, rest.trim());
        }
    }
    ("", raw)
}

/// Canonical `MAJOR.MINOR.PATCH[-pre][+build]` form, or `None` when the
/// input is not a version at all.
pub fn normalize(raw: &str) -> Option<String> {
    let (_, rest) = split_operator(raw);
    Partial::parse(rest).map(|p| p.floor_string())
}

fn is_wildcard(raw: &str) -> bool {
    matches!(clean(raw), "" | "*" | "latest" | "x" | "X")
}

fn same_base(a: &Version, b: &Version) -> bool {
    a.major == b.major && a.minor == b.minor && a.patch == b.patch
}

/// `observed ≥ minimum`, where a prerelease of the minimum counts as meeting it.
fn meets(observed: &Version, minimum: &Version) -> bool {
    observed >= minimum || (!observed.pre.is_empty() && same_base(observed, minimum))
}

pub fn parse_version(raw: &str) -> Result<Version, VersionError> {
    let (_, rest) = split_operator(raw);
    Partial::parse(rest)
        .ok_or_else(|| VersionError::Unparseable(raw.trim().to_string()))?
        .floor()
}

/// Does `observed` allow an SDK at least as new as `minimum`?
pub fn is_satisfied(observed: &str, minimum: &str, kind: SourceKind) -> Result<bool, VersionError> {
    if is_wildcard(observed) {
        return Ok(true);
    }
    let minimum = parse_version(minimum)?;
    match kind {
        SourceKind::Lock => Ok(meets(&parse_version(observed)?, &minimum)),
        SourceKind::Manifest => {
            let mut last_err = None;
            for alternative in observed.split("||") {
                match range_allows(alternative, &minimum) {
                    Ok(true) => return Ok(true),
                    Ok(false) => {}
                    Err(err) => last_err = Some(err),
                }
            }
            match last_err {
                Some(err) => Err(err),
                None => Ok(false),
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Upper {
    version: Version,
    inclusive: bool,
}

impl Upper {
    fn exclusive(version: Version) -> Self {
        Self {
            version,
            inclusive: false,
        }
    }

    fn allows(&self, minimum: &Version) -> bool {
        if self.inclusive {
            meets(&self.version, minimum)
        } else {
            minimum < &self.version
        }
    }

    fn tighter(self, other: Upper) -> Upper {
        match self.version.cmp(&other.version) {
            std::cmp::Ordering::Less => self,
            std::cmp::Ordering::Greater => other,
            std::cmp::Ordering::Equal => {
                if self.inclusive { other } else { self }
            }
        }
    }
}

fn bump_major(p: &Partial) -> Version {
    Version::new(p.major + 1, 0, 0)
}

fn bump_minor(p: &Partial) -> Version {
    Version::new(p.major, p.minor.unwrap_or(0) + 1, 0)
}

fn bump_patch(p: &Partial) -> Version {
    Version::new(p.major, p.minor.unwrap_or(0), p.patch.unwrap_or(0) + 1)
}

/// Upper bound implied by a single comparator, if any.
fn comparator_upper(op: &str, version: &str) -> Result<Option<Upper>, VersionError> {
    if is_wildcard(version) {
        return Ok(None);
    }
    let partial = Partial::parse(version)
        .ok_or_else(|| VersionError::Unparseable(format!("{op}{version}")))?;
    let bound = match op {
        ">" | ">=" => None,
        "<" => Some(Upper::exclusive(partial.floor()?)),
        "<=" => {
            if partial.minor.is_none() {
                Some(Upper::exclusive(bump_major(&partial)))
            } else if partial.patch.is_none() {
                Some(Upper::exclusive(bump_minor(&partial)))
            } else {
                Some(Upper {
                    version: partial.floor()?,
                    inclusive: true,
                })
            }
        }
        "^" => Some(Upper::exclusive(if partial.major > 0 || partial.minor.is_none() {
            bump_major(&partial)
        } else if partial.minor.unwrap_or(0) > 0 || partial.patch.is_none() {
            bump_minor(&partial)
        } else {
            bump_patch(&partial)
        })),
        "~" => Some(Upper::exclusive(if partial.minor.is_some() {
            bump_minor(&partial)
        } else {
            bump_major(&partial)
        })),
        "~=" => Some(Upper::exclusive(if partial.patch.is_some() {
            bump_minor(&partial)
        } else {
            bump_major(&partial)
        })),
        // `==`, `=` and bare versions: exact, or a wildcard range when incomplete.
        _ => {
            if partial.minor.is_none() {
                Some(Upper::exclusive(bump_major(&partial)))
            } else if partial.patch.is_none() {
                Some(Upper::exclusive(bump_minor(&partial)))
            } else {
                Some(Upper {
                    version: partial.floor()?,
                    inclusive: true,
                })
            }
        }
    };
    Ok(bound)
}

/// Split a range alternative into (operator, version) comparators. Handles
/// `>=1.0,<2`, `>=1.0 <2`, `>= 1.0` and npm hyphen ranges `1.0 - 2.0`.
fn comparators(alternative: &str) -> Vec<(String, String)> {
    let alternative = clean(alternative);
    if let Some((_, high)) = alternative.split_once(" - ") {
        return vec![("<=".to_string(), high.trim().to_string())];
    }
    let mut out = Vec::new();
    let mut pending_op: Option<&str> = None;
    for token in alternative
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        if OPERATORS.contains(&token) || token == "!=" {
            pending_op = Some(token);
            continue;
        }
        if let Some(op) = pending_op.take() {
            out.push((op.to_string(), token.to_string()));
            continue;
        }
        if let Some(rest) = token.strip_prefix("!=") {
            out.push(("!=".to_string(), rest.to_string()));
            continue;
        }
        let (op, rest) = split_operator(token);
        out.push((op.to_string(), rest.to_string()));
    }
    out
}

fn range_allows(alternative: &str, minimum: &Version) -> Result<bool, VersionError> {
    let mut upper: Option<Upper> = None;
    for (op, version) in comparators(alternative) {
        if op == "!=" {
            continue;
        }
        if let Some(bound) = comparator_upper(&op, &version)? {
            upper = Some(match upper {
                Some(current) => current.tighter(bound),
                None => bound,
            });
        }
    }
    Ok(upper.is_none_or(|bound| bound.allows(minimum)))
}
