//! Ad sizes, viewport breakpoints and per-breakpoint size mappings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Token used for the fluid (content-driven) size instead of `"0,0"`.
pub const FLUID_TOKEN: &str = "fluid";

/// An immutable `(width, height)` pair.
///
/// `(0, 0)` is the fluid sentinel and renders as [`FLUID_TOKEN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AdSize {
    width: u32,
    height: u32,
}

impl AdSize {
    pub const FLUID: AdSize = AdSize::new(0, 0);
    pub const OUT_OF_PAGE: AdSize = AdSize::new(1, 1);
    pub const EMPTY: AdSize = AdSize::new(2, 2);
    pub const SPONSOR_LOGO: AdSize = AdSize::new(3, 3);
    pub const MPU: AdSize = AdSize::new(300, 250);
    pub const HALF_PAGE: AdSize = AdSize::new(300, 600);
    pub const LEADERBOARD: AdSize = AdSize::new(728, 90);
    pub const BILLBOARD: AdSize = AdSize::new(970, 250);
    pub const SKYSCRAPER: AdSize = AdSize::new(160, 600);
    pub const MOBILE_STICKY: AdSize = AdSize::new(320, 50);

    /// Merchandising formats are all 88px wide.
    const MERCHANDISING_WIDTH: u32 = 88;

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_fluid(&self) -> bool {
        *self == Self::FLUID
    }

    /// A size that does not reflect the dimensions the creative really renders at.
    pub fn is_proxy(&self) -> bool {
        self.is_fluid()
            || *self == Self::OUT_OF_PAGE
            || *self == Self::EMPTY
            || *self == Self::SPONSOR_LOGO
            || self.width == Self::MERCHANDISING_WIDTH
    }

    /// Concrete sizes are the ones a partner can bid on.
    pub fn is_concrete(&self) -> bool {
        !self.is_proxy()
    }
}

/// Pure predicate over the fixed proxy rule set.
pub fn classify_proxy(size: &AdSize) -> bool {
    size.is_proxy()
}

impl fmt::Display for AdSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_fluid() {
            f.write_str(FLUID_TOKEN)
        } else {
            write!(f, "{},{}", self.width, self.height)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid ad size '{0}'")]
pub struct SizeParseError(pub String);

impl FromStr for AdSize {
    type Err = SizeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case(FLUID_TOKEN) {
            return Ok(AdSize::FLUID);
        }
        let (w, h) = trimmed
            .split_once(',')
            .ok_or_else(|| SizeParseError(s.to_string()))?;
        let w = w
            .trim()
            .parse::<u32>()
            .map_err(|_| SizeParseError(s.to_string()))?;
        let h = h
            .trim()
            .parse::<u32>()
            .map_err(|_| SizeParseError(s.to_string()))?;
        Ok(AdSize::new(w, h))
    }
}

impl TryFrom<String> for AdSize {
    type Error = SizeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AdSize> for String {
    fn from(size: AdSize) -> Self {
        size.to_string()
    }
}

/// Parse a `|`-separated size list as found in placeholder data attributes,
/// e.g. `"300,250|fluid"`. Malformed entries are skipped.
pub fn parse_size_list(raw: &str) -> Vec<AdSize> {
    raw.split('|')
        .filter(|token| !token.trim().is_empty())
        .filter_map(|token| match token.parse::<AdSize>() {
            Ok(size) => Some(size),
            Err(e) => {
                log::warn!("Sizes: skipping {}", e);
                None
            }
        })
        .collect()
}

/// Named viewport tiers, ordered smallest to largest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Breakpoint {
    Mobile,
    Phablet,
    Tablet,
    Desktop,
    Wide,
}

impl Breakpoint {
    pub const ALL: [Breakpoint; 5] = [
        Breakpoint::Mobile,
        Breakpoint::Phablet,
        Breakpoint::Tablet,
        Breakpoint::Desktop,
        Breakpoint::Wide,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Breakpoint::Mobile => "mobile",
            Breakpoint::Phablet => "phablet",
            Breakpoint::Tablet => "tablet",
            Breakpoint::Desktop => "desktop",
            Breakpoint::Wide => "wide",
        }
    }

    /// Minimum viewport width (px) at which the tier applies.
    pub fn min_width(&self) -> u32 {
        match self {
            Breakpoint::Mobile => 0,
            Breakpoint::Phablet => 660,
            Breakpoint::Tablet => 740,
            Breakpoint::Desktop => 980,
            Breakpoint::Wide => 1300,
        }
    }

    pub fn from_viewport_width(width: u32) -> Breakpoint {
        Self::ALL
            .iter()
            .rev()
            .copied()
            .find(|bp| width >= bp.min_width())
            .unwrap_or(Breakpoint::Mobile)
    }

    /// The next smaller tier, if any.
    pub fn smaller(&self) -> Option<Breakpoint> {
        match self {
            Breakpoint::Mobile => None,
            Breakpoint::Phablet => Some(Breakpoint::Mobile),
            Breakpoint::Tablet => Some(Breakpoint::Phablet),
            Breakpoint::Desktop => Some(Breakpoint::Tablet),
            Breakpoint::Wide => Some(Breakpoint::Desktop),
        }
    }

    /// Name of the placeholder data attribute holding this tier's sizes.
    pub fn data_attribute(&self) -> String {
        format!("data-{}", self.name())
    }
}

impl fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Breakpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|bp| bp.name() == s)
            .ok_or_else(|| format!("unknown breakpoint '{}'", s))
    }
}

/// Caller-supplied sizes keyed by raw breakpoint name. Keys that do not name a
/// [`Breakpoint`] are dropped by [`SizeMapping::merge`].
pub type SizeOverrides = BTreeMap<String, Vec<AdSize>>;

/// One `defineSizeMapping` entry: viewport `[min_width, 0]` to candidate sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewportSizes {
    pub viewport: (u32, u32),
    pub sizes: Vec<AdSize>,
}

/// Partial mapping from breakpoint to an ordered list of candidate sizes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SizeMapping(BTreeMap<Breakpoint, Vec<AdSize>>);

impl SizeMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, breakpoint: Breakpoint, sizes: Vec<AdSize>) -> Self {
        self.0.insert(breakpoint, sizes);
        self
    }

    pub fn get(&self, breakpoint: Breakpoint) -> Option<&[AdSize]> {
        self.0.get(&breakpoint).map(Vec::as_slice)
    }

    /// True when no breakpoint carries a single candidate size.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    /// Sizes for `breakpoint`, falling back to the nearest smaller tier with
    /// an entry. Returns an empty list when nothing at or below matches.
    pub fn resolve(&self, breakpoint: Breakpoint) -> Vec<AdSize> {
        let mut current = Some(breakpoint);
        while let Some(bp) = current {
            if let Some(sizes) = self.0.get(&bp).filter(|s| !s.is_empty()) {
                return sizes.clone();
            }
            current = bp.smaller();
        }
        Vec::new()
    }

    /// Concatenate `extra` onto this mapping per breakpoint, base entries first.
    pub fn merge(&self, extra: &SizeOverrides) -> SizeMapping {
        let mut merged = self.clone();
        for (key, sizes) in extra {
            match key.parse::<Breakpoint>() {
                Ok(bp) => merged.0.entry(bp).or_default().extend(sizes.iter().copied()),
                Err(e) => log::debug!("Sizes: ignoring {}", e),
            }
        }
        merged
    }

    /// Every distinct size across all breakpoints, in first-seen order.
    pub fn all_sizes(&self) -> Vec<AdSize> {
        let mut out: Vec<AdSize> = Vec::new();
        for size in self.0.values().flatten() {
            if !out.contains(size) {
                out.push(*size);
            }
        }
        out
    }

    /// The viewport mapping handed to the ad server's size mapping builder.
    pub fn viewport_mapping(&self) -> Vec<ViewportSizes> {
        self.0
            .iter()
            .filter(|(_, sizes)| !sizes.is_empty())
            .map(|(bp, sizes)| ViewportSizes {
                viewport: (bp.min_width(), 0),
                sizes: sizes.clone(),
            })
            .collect()
    }
}

/// Free-function form of [`SizeMapping::resolve`].
pub fn resolve(mapping: &SizeMapping, breakpoint: Breakpoint) -> Vec<AdSize> {
    mapping.resolve(breakpoint)
}

/// Free-function form of [`SizeMapping::merge`].
pub fn merge(base: &SizeMapping, extra: &SizeOverrides) -> SizeMapping {
    base.merge(extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: AdSize = AdSize::new(300, 250);
    const B: AdSize = AdSize::new(728, 90);

    #[test]
    fn resolve_falls_back_to_nearest_smaller_breakpoint() {
        let mapping = SizeMapping::new()
            .with(Breakpoint::Phablet, vec![A])
            .with(Breakpoint::Desktop, vec![B]);
        assert!(mapping.resolve(Breakpoint::Mobile).is_empty());
        assert_eq!(mapping.resolve(Breakpoint::Phablet), vec![A]);
        assert_eq!(mapping.resolve(Breakpoint::Tablet), vec![A]);
        assert_eq!(mapping.resolve(Breakpoint::Desktop), vec![B]);
        assert_eq!(mapping.resolve(Breakpoint::Wide), vec![B]);
    }

    #[test]
    fn resolve_skips_empty_entries() {
        let mapping = SizeMapping::new()
            .with(Breakpoint::Mobile, vec![A])
            .with(Breakpoint::Tablet, vec![]);
        assert_eq!(resolve(&mapping, Breakpoint::Tablet), vec![A]);
    }

    #[test]
    fn classify_proxy_rules() {
        for size in [
            AdSize::new(0, 0),
            AdSize::new(1, 1),
            AdSize::new(2, 2),
            AdSize::new(88, 71),
            AdSize::new(88, 88),
            AdSize::new(3, 3),
        ] {
            assert!(classify_proxy(&size), "{} should be proxy", size);
        }
        for size in [AdSize::new(300, 250), AdSize::new(728, 90), AdSize::new(1, 2)] {
            assert!(!classify_proxy(&size), "{} should not be proxy", size);
        }
    }

    #[test]
    fn fluid_has_its_own_token() {
        assert_eq!(AdSize::FLUID.to_string(), "fluid");
        assert_eq!(AdSize::MPU.to_string(), "300,250");
        assert_eq!("fluid".parse::<AdSize>().unwrap(), AdSize::FLUID);
        assert_eq!(" 728 , 90 ".parse::<AdSize>().unwrap(), B);
        assert!("300x250".parse::<AdSize>().is_err());

        let json = serde_json::to_string(&vec![AdSize::FLUID, A]).unwrap();
        assert_eq!(json, r#"["fluid","300,250"]"#);
    }

    #[test]
    fn merge_appends_and_ignores_unknown_breakpoints() {
        let base = SizeMapping::new().with(Breakpoint::Mobile, vec![A]);
        let mut extra = SizeOverrides::new();
        extra.insert("mobile".to_string(), vec![AdSize::FLUID]);
        extra.insert("desktop".to_string(), vec![B]);
        extra.insert("leftCol".to_string(), vec![AdSize::HALF_PAGE]);

        let merged = merge(&base, &extra);
        assert_eq!(merged.get(Breakpoint::Mobile), Some(&[A, AdSize::FLUID][..]));
        assert_eq!(merged.get(Breakpoint::Desktop), Some(&[B][..]));
        assert!(!merged.all_sizes().contains(&AdSize::HALF_PAGE));
    }

    #[test]
    fn parse_size_list_skips_garbage() {
        assert_eq!(
            parse_size_list("300,250|bogus||fluid"),
            vec![A, AdSize::FLUID]
        );
    }

    #[test]
    fn viewport_mapping_lists_populated_tiers() {
        let mapping = SizeMapping::new()
            .with(Breakpoint::Mobile, vec![A])
            .with(Breakpoint::Tablet, vec![])
            .with(Breakpoint::Desktop, vec![B, A]);
        let vm = mapping.viewport_mapping();
        assert_eq!(vm.len(), 2);
        assert_eq!(vm[0].viewport, (0, 0));
        assert_eq!(vm[1].viewport, (980, 0));
        assert_eq!(mapping.all_sizes(), vec![A, B]);
    }

    #[test]
    fn breakpoint_from_viewport_width() {
        assert_eq!(Breakpoint::from_viewport_width(320), Breakpoint::Mobile);
        assert_eq!(Breakpoint::from_viewport_width(700), Breakpoint::Phablet);
        assert_eq!(Breakpoint::from_viewport_width(1000), Breakpoint::Desktop);
        assert_eq!(Breakpoint::from_viewport_width(1920), Breakpoint::Wide);
    }

    #[test]
    fn size_mapping_deserializes_from_toml() {
        let mapping: SizeMapping =
            toml::from_str("mobile = [\"300,250\"]\ndesktop = [\"728,90\", \"fluid\"]\n").unwrap();
        assert_eq!(mapping.resolve(Breakpoint::Wide), vec![B, AdSize::FLUID]);
    }
}
