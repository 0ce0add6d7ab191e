//! Municipality and district name normalization
//!
//! Source tables spell the same municipality many ways across twenty years
//! of exports: different casing, trailing legal-status qualifiers, encoding
//! debris from spreadsheet conversion, and outright historical renamings.
//! Every fix is a row in an ordered rule table so the tables can be audited
//! and extended without touching the code that applies them. Order matters:
//! the literal corrections at the end assume title-casing and artifact
//! cleanup have already run.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

/// One normalization step
#[derive(Debug, Clone, Copy)]
pub enum Step {
    /// Upper-case the first letter of every word, lower-case the rest
    TitleCase,
    /// Strip leading and trailing whitespace
    Trim,
    /// Replace every match of the pattern
    ReplaceAll(&'static str, &'static str),
    /// Replace the first match of the pattern
    Replace(&'static str, &'static str),
}

/// Municipality name chain, applied top to bottom
pub const MUNICIPALITY_RULES: &[Step] = &[
    Step::TitleCase,
    Step::ReplaceAll(r"\s-.*|\s*\(.*", ""),
    Step::Trim,
    Step::ReplaceAll(r"\n\s*", ""),
    Step::ReplaceAll(r"_X000d_", ""),
    Step::ReplaceAll(r"\\", "/"),
    Step::ReplaceAll(r"-\s*", "-"),
    Step::ReplaceAll(" De ", " de "),
    Step::ReplaceAll("-De-", "-de-"),
    Step::Replace(r"^Aroostock$", "Aroostook"),
    Step::Replace(r"^Baker Brook$", "Baker-Brook"),
    Step::Replace(r"^Grande Anse$", "Grande-Anse"),
    Step::Replace(r"^Grand Bay/Westfield$", "Grand Bay-Westfield"),
    Step::Replace(r"^Grand-Falls/Grand-Sault$", "Grand Falls/Grand-Sault"),
    Step::Replace(r"^Grand-Sault\s*/\s*Grand(\s|-)Falls$", "Grand Falls/Grand-Sault"),
    Step::Replace(r"^Lameque$", "Lamèque"),
    Step::Replace(r"^Mcadam$", "McAdam"),
    Step::Replace(r"^Neguac$", "Néguac"),
    Step::Replace(r"^Saint-Francois-de-Madawaska$", "Saint-François-de-Madawaska"),
    Step::Replace(r"^Saint-Louis de Kent$", "Saint-Louis-de-Kent"),
    Step::Replace(r"^Sainte-Marie-Saint-Rapha(e|ê)l$", "Sainte-Marie-Saint-Raphaël"),
    Step::Replace(r"^Shédiac$", "Shediac"),
    Step::Replace(r"^St-Hilaire$", "Saint-Hilaire"),
    Step::Replace(r"^St-Isidore$", "Saint-Isidore"),
    Step::Replace(r"^St\. Andrews$", "Saint Andrews"),
    Step::Replace(r"^St\. André$", "Saint-André"),
    Step::Replace(r"^St\. George$", "Saint George"),
    Step::Replace(r"^St\. Hilaire$", "Saint-Hilaire"),
    Step::Replace(r"^St\. Léonard$", "Saint-Léonard"),
    Step::Replace(r"^Ste-Anne-de-Madawaska$", "Sainte-Anne-de-Madawaska"),
    Step::Replace(r"^Town (O|o)f Rothesay$", "Rothesay"),
    Step::Replace(r"^(Village de )?Lac(\s|-)Baker$", "Lac Baker"),
];

/// Marker for towns, villages and cities in the policing source
pub const DISTRICT_SUFFIX: &str = r"\s(C|TV|V)$";

/// Corrections for per-row labels of the policing source, after the
/// town/village/city suffix has been stripped
pub const DISTRICT_RULES: &[Step] = &[
    Step::Replace(DISTRICT_SUFFIX, ""),
    Step::Replace(r"^Baker Brook$", "Baker-Brook"),
    Step::Replace(r"^Cambridge Narrows$", "Cambridge-Narrows"),
    Step::Replace(r"^Neguac", "Néguac"),
    Step::Replace(r"^Plaster Rocker$", "Plaster Rock"),
    Step::Replace(r"^Saint-Anne$", "Sainte-Anne-de-Madawaska"),
    Step::Replace(r"^Saint-François$", "Saint-François-de-Madawaska"),
    Step::Replace(r"^Ste-Marie-St-Raphael$", "Sainte-Marie-Saint-Raphaël"),
    Step::Replace(r"^Tracadie$", "Tracadie-Sheila"),
    Step::Replace(r"^Eel Riv.*", "Eel River Crossing"),
    Step::Replace(r"^Grand-Sault.*", "Grand Falls/Grand-Sault"),
    Step::Replace(r"^Nackawic.*", "Nackawic"),
];

/// Corrections for block names of the policing source
pub const DISTRICT_OWNER_RULES: &[Step] = &[
    Step::Replace(r"^Tracadie$", "Tracadie-Sheila"),
    Step::Replace(r"^Grand-Sault.*", "Grand Falls/Grand-Sault"),
    Step::Replace(r"^Nackawic.*", "Nackawic"),
];

#[derive(Debug)]
enum CompiledStep {
    TitleCase,
    Trim,
    Rewrite {
        pattern: Regex,
        replacement: &'static str,
        all: bool,
    },
}

/// A compiled, ordered rule table
#[derive(Debug)]
pub struct RuleChain {
    steps: Vec<CompiledStep>,
}

impl RuleChain {
    /// Compile a rule table
    pub fn compile(rules: &[Step]) -> Self {
        let steps = rules
            .iter()
            .map(|step| match *step {
                Step::TitleCase => CompiledStep::TitleCase,
                Step::Trim => CompiledStep::Trim,
                Step::ReplaceAll(pattern, replacement) => CompiledStep::Rewrite {
                    pattern: Regex::new(pattern).expect("invalid name rule pattern"),
                    replacement,
                    all: true,
                },
                Step::Replace(pattern, replacement) => CompiledStep::Rewrite {
                    pattern: Regex::new(pattern).expect("invalid name rule pattern"),
                    replacement,
                    all: false,
                },
            })
            .collect();
        Self { steps }
    }

    pub fn apply(&self, input: &str) -> String {
        let mut current = input.to_string();
        for step in &self.steps {
            current = match step {
                CompiledStep::TitleCase => title_case(&current),
                CompiledStep::Trim => current.trim().to_string(),
                CompiledStep::Rewrite {
                    pattern,
                    replacement,
                    all,
                } => {
                    let replaced = if *all {
                        pattern.replace_all(&current, *replacement)
                    } else {
                        pattern.replace(&current, *replacement)
                    };
                    match replaced {
                        Cow::Borrowed(_) => current,
                        Cow::Owned(s) => s,
                    }
                }
            };
        }
        current
    }
}

static MUNICIPALITY_CHAIN: Lazy<RuleChain> = Lazy::new(|| RuleChain::compile(MUNICIPALITY_RULES));
static DISTRICT_CHAIN: Lazy<RuleChain> = Lazy::new(|| RuleChain::compile(DISTRICT_RULES));
static DISTRICT_OWNER_CHAIN: Lazy<RuleChain> =
    Lazy::new(|| RuleChain::compile(DISTRICT_OWNER_RULES));
static DISTRICT_SUFFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(DISTRICT_SUFFIX).expect("invalid district suffix pattern"));

/// Normalize a raw municipality string to its canonical name
pub fn normalize_municipality(raw: &str) -> String {
    MUNICIPALITY_CHAIN.apply(raw)
}

/// True when a policing-source label names a town, village or city
pub fn has_district_suffix(label: &str) -> bool {
    DISTRICT_SUFFIX_RE.is_match(label)
}

/// Strip the suffix from a policing-source label and apply district corrections
pub fn correct_district(label: &str) -> String {
    DISTRICT_CHAIN.apply(label)
}

/// Apply block-name corrections to a policing-source block name
pub fn correct_district_owner(name: &str) -> String {
    DISTRICT_OWNER_CHAIN.apply(name)
}

/// Title-case: a letter is upper-cased when it follows a non-alphanumeric
/// character (or starts the string) and lower-cased otherwise
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut upper_next = true;
    for c in s.chars() {
        if upper_next {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        upper_next = !c.is_alphanumeric();
    }
    out
}
