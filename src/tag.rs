// Tag parsing, transform formulas and candidate selection

use regex::Regex;
use semver::Version;
use std::cmp::Ordering;
use std::sync::LazyLock;

use crate::models::Container;

static COERCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)(?:\.(\d+))?(?:\.(\d+))?$").expect("static regex")
});

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\d+)").expect("static regex"));

static FORMULA_ARROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*=>\s*").expect("static regex"));

/// Raw distance between two versions, before pre-kinds are collapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionDiff {
    Major,
    Premajor,
    Minor,
    Preminor,
    Patch,
    Prepatch,
    Prerelease,
}

/// Parse a tag as semver. Accepts a leading `v` and coerces `1` / `1.2` to full versions.
pub fn parse(raw: &str) -> Option<Version> {
    let trimmed = raw.trim();
    let cleaned = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    if let Ok(version) = Version::parse(cleaned) {
        return Some(version);
    }
    let caps = COERCE.captures(cleaned)?;
    let part = |i: usize| -> Option<u64> {
        caps.get(i).map_or(Some(0), |m| m.as_str().parse().ok())
    };
    Some(Version::new(part(1)?, part(2)?, part(3)?))
}

/// Apply a `regex => replacement` formula. Returns the tag unchanged when the
/// formula is absent, invalid, or does not match.
pub fn transform(formula: Option<&str>, tag: &str) -> String {
    let Some(formula) = formula.filter(|f| !f.trim().is_empty()) else {
        return tag.to_string();
    };
    let mut split = FORMULA_ARROW.splitn(formula, 2);
    let (Some(pattern), Some(replacement)) = (split.next(), split.next()) else {
        return tag.to_string();
    };
    let Ok(regex) = Regex::new(pattern) else {
        return tag.to_string();
    };
    let Some(caps) = regex.captures(tag) else {
        return tag.to_string();
    };
    let mut out = String::with_capacity(replacement.len());
    let mut last = 0;
    for placeholder in PLACEHOLDER.captures_iter(replacement) {
        let (Some(whole), Some(index)) = (placeholder.get(0), placeholder.get(1)) else {
            continue;
        };
        out.push_str(&replacement[last..whole.start()]);
        let group = index.as_str().parse::<usize>().ok().and_then(|i| caps.get(i));
        match group {
            Some(m) => out.push_str(m.as_str()),
            None => return tag.to_string(),
        }
        last = whole.end();
    }
    out.push_str(&replacement[last..]);
    out
}

fn precedence(a: &Version, b: &Version) -> Ordering {
    (a.major, a.minor, a.patch, &a.pre).cmp(&(b.major, b.minor, b.patch, &b.pre))
}

/// True when `candidate` is strictly greater than `current` by semver precedence.
pub fn is_greater(candidate: &str, current: &str) -> bool {
    match (parse(candidate), parse(current)) {
        (Some(a), Some(b)) => precedence(&a, &b) == Ordering::Greater,
        _ => false,
    }
}

/// Distance between two versions (npm `semver.diff` rules). `None` when equal or unparsable.
pub fn diff(from: &str, to: &str) -> Option<VersionDiff> {
    let v1 = parse(from)?;
    let v2 = parse(to)?;
    let ordering = precedence(&v1, &v2);
    if ordering == Ordering::Equal {
        return None;
    }
    let (high, low) = if ordering == Ordering::Greater {
        (&v1, &v2)
    } else {
        (&v2, &v1)
    };
    let high_has_pre = !high.pre.is_empty();
    let low_has_pre = !low.pre.is_empty();

    if low_has_pre && !high_has_pre {
        // Prerelease to its release
        if low.patch == 0 && low.minor == 0 {
            return Some(VersionDiff::Major);
        }
        if high.patch != 0 {
            return Some(VersionDiff::Patch);
        }
        if high.minor != 0 {
            return Some(VersionDiff::Minor);
        }
        return Some(VersionDiff::Major);
    }

    let kind = if v1.major != v2.major {
        (VersionDiff::Major, VersionDiff::Premajor)
    } else if v1.minor != v2.minor {
        (VersionDiff::Minor, VersionDiff::Preminor)
    } else if v1.patch != v2.patch {
        (VersionDiff::Patch, VersionDiff::Prepatch)
    } else {
        return Some(VersionDiff::Prerelease);
    };
    Some(if high_has_pre { kind.1 } else { kind.0 })
}

/// Candidate tags for a container, best first.
///
/// Include then exclude regexes are applied to the raw list. Semver images keep only tags
/// that parse after transform and are strictly greater than the current tag, sorted
/// descending. Non-semver images never get tag candidates.
pub fn candidates(container: &Container, tags: &[String]) -> Result<Vec<String>, regex::Error> {
    let mut filtered: Vec<&String> = tags.iter().collect();

    if let Some(include) = container.include_tags.as_deref() {
        let include = Regex::new(include)?;
        filtered.retain(|tag| include.is_match(tag));
    }
    if let Some(exclude) = container.exclude_tags.as_deref() {
        let exclude = Regex::new(exclude)?;
        filtered.retain(|tag| !exclude.is_match(tag));
    }

    if !container.image.tag.semver {
        return Ok(Vec::new());
    }
    if filtered.is_empty() {
        tracing::warn!(
            container = %container.full_name(),
            "No tags found after filtering; check your regex filters"
        );
    }

    let formula = container.transform_tags.as_deref();
    let Some(current) = parse(&transform(formula, &container.image.tag.value)) else {
        return Ok(Vec::new());
    };

    let mut ranked: Vec<(Version, String)> = filtered
        .into_iter()
        .filter_map(|tag| parse(&transform(formula, tag)).map(|v| (v, tag.clone())))
        .filter(|(v, _)| precedence(v, &current) == Ordering::Greater)
        .collect();
    ranked.sort_by(|(a, _), (b, _)| precedence(b, a));
    Ok(ranked.into_iter().map(|(_, tag)| tag).collect())
}
