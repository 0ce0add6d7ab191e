use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{ProviderMap, ProviderRow, RawProviderRow};
use crate::names::{correct_district, correct_district_owner, has_district_suffix};

/// Merged town listed under its own name; its legacy towns are spliced in
pub const SPLICED_TOWN: &str = "Florenceville-Bristol TV";
/// Legacy towns added alongside [`SPLICED_TOWN`]
pub const SPLICED_PARTS: [&str; 2] = ["Florenceville TV", "Bristol TV"];
/// Row that leaves the Fundy Shores block through the generic rules
pub const FUNDY_SHORES_EXIT: &str = "Fundy-St. Martins";

/// Configuration for Stage 2 provider resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Municipalities that share their parent's provider
    pub aliases: Vec<ProviderAlias>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAlias {
    pub municipality: String,
    pub parent: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            aliases: vec![ProviderAlias {
                municipality: "Sussex Corner".to_string(),
                parent: "Sussex".to_string(),
            }],
        }
    }
}

/// Blocks of the policing source whose rows do not follow the generic
/// null-inherits-provider rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialBlock {
    /// Rows carry their own provider until `Fundy-St. Martins`
    FundyShores,
    /// Every following row carries its own provider
    Woodstock,
}

impl SpecialBlock {
    pub fn name(self) -> &'static str {
        match self {
            SpecialBlock::FundyShores => "Fundy Shores",
            SpecialBlock::Woodstock => "Woodstock",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        [SpecialBlock::FundyShores, SpecialBlock::Woodstock]
            .into_iter()
            .find(|block| block.name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    InDistrictBlock,
    SpecialCase(SpecialBlock),
}

/// Output of the forward scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// A new block opens under this name
    Block {
        name: String,
        provider: Option<String>,
    },
    /// An entry under the currently open block
    Entry {
        label: String,
        provider: Option<String>,
    },
}

/// Forward scan over the policing source rows
///
/// Carries the current block provider across rows. A blank provider cell
/// continues the current block; a filled one opens a new block, except in
/// the special blocks where rows keep their own provider cell.
pub struct ProviderScan<I> {
    rows: I,
    state: ScanState,
    provider: Option<String>,
    started: bool,
    pending: VecDeque<ScanEvent>,
}

impl<I: Iterator<Item = RawProviderRow>> ProviderScan<I> {
    pub fn new(rows: I) -> Self {
        Self {
            rows,
            state: ScanState::InDistrictBlock,
            provider: None,
            started: false,
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    fn open_block(&mut self, row: RawProviderRow) -> ScanEvent {
        self.state = SpecialBlock::from_name(&row.label)
            .map(ScanState::SpecialCase)
            .unwrap_or(ScanState::InDistrictBlock);
        self.provider = row.code.clone();
        ScanEvent::Block {
            name: row.label,
            provider: row.code,
        }
    }

    fn inherited(&self, label: String) -> ScanEvent {
        ScanEvent::Entry {
            label,
            provider: self.provider.clone(),
        }
    }

    fn step(&mut self, row: RawProviderRow) -> ScanEvent {
        if !self.started {
            self.started = true;
            return self.open_block(row);
        }

        if row.label == SPLICED_TOWN {
            for part in SPLICED_PARTS {
                let event = self.inherited(part.to_string());
                self.pending.push_back(event);
            }
            return self.inherited(row.label);
        }

        if row.label == SpecialBlock::FundyShores.name() {
            return self.open_block(row);
        }
        if self.state == ScanState::SpecialCase(SpecialBlock::FundyShores)
            && row.label != FUNDY_SHORES_EXIT
        {
            return ScanEvent::Entry {
                label: row.label,
                provider: row.code,
            };
        }

        if row.label == SpecialBlock::Woodstock.name() {
            return self.open_block(row);
        }
        if self.state == ScanState::SpecialCase(SpecialBlock::Woodstock) {
            return ScanEvent::Entry {
                label: row.label,
                provider: row.code,
            };
        }

        if row.code.is_none() {
            self.inherited(row.label)
        } else {
            self.open_block(row)
        }
    }
}

impl<I: Iterator<Item = RawProviderRow>> Iterator for ProviderScan<I> {
    type Item = ScanEvent;

    fn next(&mut self) -> Option<ScanEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        let row = self.rows.next()?;
        Some(self.step(row))
    }
}

/// A block of the policing source and the entries listed under it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistrictBlock {
    pub name: String,
    pub entries: Vec<(String, Option<String>)>,
}

/// Group scan events into blocks, in first-seen order
///
/// Reopening a block with a name already seen clears its earlier entries but
/// keeps its position.
pub fn collect_blocks(events: impl IntoIterator<Item = ScanEvent>) -> Vec<DistrictBlock> {
    let mut blocks: Vec<DistrictBlock> = Vec::new();
    let mut current: Option<usize> = None;

    for event in events {
        match event {
            ScanEvent::Block { name, .. } => {
                let idx = match blocks.iter().position(|b| b.name == name) {
                    Some(idx) => {
                        blocks[idx].entries.clear();
                        idx
                    }
                    None => {
                        blocks.push(DistrictBlock {
                            name,
                            entries: Vec::new(),
                        });
                        blocks.len() - 1
                    }
                };
                current = Some(idx);
            }
            ScanEvent::Entry { label, provider } => {
                if let Some(idx) = current {
                    blocks[idx].entries.push((label, provider));
                }
            }
        }
    }

    blocks
}

/// Run the block scan and keep the town, village and city entries
pub fn scan_provider_rows(rows: Vec<RawProviderRow>) -> Vec<ProviderRow> {
    let blocks = collect_blocks(ProviderScan::new(rows.into_iter()));

    let rows: Vec<ProviderRow> = blocks
        .iter()
        .flat_map(|block| {
            let owner = correct_district_owner(&block.name);
            block
                .entries
                .iter()
                .filter(|(label, _)| has_district_suffix(label))
                .map(move |(label, provider)| ProviderRow {
                    district: correct_district(label),
                    municipality: owner.clone(),
                    provider: provider.clone(),
                })
        })
        .collect();

    debug!(
        "Provider scan: {} blocks, {} town/village/city rows",
        blocks.len(),
        rows.len()
    );
    rows
}

fn render(providers: &BTreeSet<Option<&str>>) -> Vec<String> {
    providers
        .iter()
        .map(|p| p.unwrap_or("<none>").to_string())
        .collect()
}

/// Execute Stage 2: resolve a provider for every municipality of the
/// vocabulary
///
/// 1. Vocabulary names matching a district label take that district's single
///    provider
/// 2. Vocabulary names matching a block name take the block's single provider,
///    which must agree with pass one
/// 3. Aliases copy their parent's provider
/// 4. Every vocabulary name must end up with a provider
pub fn resolve_providers(
    rows: &[ProviderRow],
    vocabulary: &BTreeSet<String>,
    config: &ProviderConfig,
) -> PipelineResult<ProviderMap> {
    let mut by_district: BTreeMap<&str, BTreeSet<Option<&str>>> = BTreeMap::new();
    let mut by_municipality: BTreeMap<&str, BTreeSet<Option<&str>>> = BTreeMap::new();
    for row in rows {
        by_district
            .entry(row.district.as_str())
            .or_default()
            .insert(row.provider.as_deref());
        by_municipality
            .entry(row.municipality.as_str())
            .or_default()
            .insert(row.provider.as_deref());
    }

    let mut resolved: BTreeMap<String, Option<String>> = BTreeMap::new();

    for (district, providers) in &by_district {
        if !vocabulary.contains(*district) {
            continue;
        }
        if providers.len() > 1 {
            return Err(PipelineError::ConflictingDistrictProviders {
                district: district.to_string(),
                providers: render(providers),
            });
        }
        let provider = providers.iter().next().copied().flatten();
        resolved.insert(district.to_string(), provider.map(str::to_string));
    }

    for (municipality, providers) in &by_municipality {
        if !vocabulary.contains(*municipality) {
            continue;
        }
        if providers.len() > 1 {
            return Err(PipelineError::ConflictingMunicipalityProviders {
                municipality: municipality.to_string(),
                providers: render(providers),
            });
        }
        let provider = providers.iter().next().copied().flatten().map(str::to_string);
        if let Some(previous) = resolved.get(*municipality) {
            if *previous != provider {
                return Err(PipelineError::ProviderMismatch {
                    municipality: municipality.to_string(),
                    first: previous.clone().unwrap_or_else(|| "<none>".to_string()),
                    second: provider.unwrap_or_else(|| "<none>".to_string()),
                });
            }
        }
        resolved.insert(municipality.to_string(), provider);
    }

    for alias in &config.aliases {
        if let Some(parent) = resolved.get(&alias.parent).cloned() {
            resolved.insert(alias.municipality.clone(), parent);
        }
    }

    let missing: Vec<String> = vocabulary
        .iter()
        .filter(|muni| !matches!(resolved.get(*muni), Some(Some(_))))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::MissingProvider(missing));
    }

    let mut map = ProviderMap::new();
    for (municipality, provider) in resolved {
        if let Some(provider) = provider {
            map.insert(municipality, provider);
        }
    }

    info!(
        "Stage 2: resolved policing providers for {} municipalities",
        map.len()
    );
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(label: &str, code: Option<&str>) -> RawProviderRow {
        RawProviderRow::new(label, code)
    }

    fn scan(rows: Vec<RawProviderRow>) -> Vec<DistrictBlock> {
        collect_blocks(ProviderScan::new(rows.into_iter()))
    }

    fn entries(block: &DistrictBlock) -> Vec<(&str, Option<&str>)> {
        block
            .entries
            .iter()
            .map(|(l, p)| (l.as_str(), p.as_deref()))
            .collect()
    }

    fn vocab(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_blank_provider_inherits() {
        let blocks = scan(vec![
            raw("Codiac", Some("Municipal")),
            raw("Moncton C", None),
            raw("Dieppe C", None),
            raw("Western", Some("PPSA")),
            raw("Hanwell", None),
        ]);

        assert_eq!(blocks.len(), 2);
        assert_eq!(
            entries(&blocks[0]),
            vec![("Moncton C", Some("Municipal")), ("Dieppe C", Some("Municipal"))]
        );
        assert_eq!(entries(&blocks[1]), vec![("Hanwell", Some("PPSA"))]);
    }

    #[test]
    fn test_merged_town_is_spliced() {
        let blocks = scan(vec![
            raw("Carleton", Some("PPSA")),
            raw("Florenceville-Bristol TV", Some("ignored")),
            raw("Hartland TV", None),
        ]);

        assert_eq!(
            entries(&blocks[0]),
            vec![
                ("Florenceville-Bristol TV", Some("PPSA")),
                ("Florenceville TV", Some("PPSA")),
                ("Bristol TV", Some("PPSA")),
                ("Hartland TV", Some("PPSA")),
            ]
        );
    }

    #[test]
    fn test_fundy_shores_rows_keep_their_own_provider() {
        let mut scan = ProviderScan::new(
            vec![
                raw("Southern", Some("PPSA")),
                raw("Fundy Shores", Some("PPSA")),
                raw("St. George TV", Some("MPSA")),
                raw("Blacks Harbour V", None),
                raw("Woodstock", Some("X")),
                raw("Fundy-St. Martins", Some("MPSA")),
                raw("St. Martins V", None),
                raw("Kings", Some("Municipal")),
            ]
            .into_iter(),
        );

        let mut events = Vec::new();
        for _ in 0..5 {
            events.push(scan.next().unwrap());
        }
        assert_eq!(scan.state(), ScanState::SpecialCase(SpecialBlock::FundyShores));
        events.push(scan.next().unwrap());
        assert_eq!(scan.state(), ScanState::InDistrictBlock);
        events.extend(scan.by_ref());
        assert_eq!(scan.state(), ScanState::InDistrictBlock);

        let blocks = collect_blocks(events);
        let names: Vec<_> = blocks.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["Southern", "Fundy Shores", "Fundy-St. Martins", "Kings"]);
        assert_eq!(
            entries(&blocks[1]),
            vec![
                ("St. George TV", Some("MPSA")),
                ("Blacks Harbour V", None),
                ("Woodstock", Some("X")),
            ]
        );
        assert_eq!(entries(&blocks[2]), vec![("St. Martins V", Some("MPSA"))]);
    }

    #[test]
    fn test_blank_fundy_st_martins_stays_in_fundy_shores() {
        let mut scan = ProviderScan::new(
            vec![
                raw("Fundy Shores", Some("PPSA")),
                raw("St. George TV", Some("MPSA")),
                raw("Fundy-St. Martins", None),
                raw("Kings", Some("Municipal")),
            ]
            .into_iter(),
        );

        let events: Vec<_> = scan.by_ref().collect();
        assert_eq!(scan.state(), ScanState::SpecialCase(SpecialBlock::FundyShores));

        let blocks = collect_blocks(events);
        assert_eq!(blocks.len(), 1);
        assert_eq!(
            entries(&blocks[0]),
            vec![
                ("St. George TV", Some("MPSA")),
                ("Fundy-St. Martins", Some("PPSA")),
                ("Kings", Some("Municipal")),
            ]
        );
    }

    #[test]
    fn test_woodstock_after_merged_town_splice() {
        let blocks = scan(vec![
            raw("Carleton", Some("PPSA")),
            raw("Florenceville-Bristol TV", None),
            raw("Woodstock", Some("Municipal")),
            raw("Woodstock TV", Some("Municipal")),
            raw("Hartland TV", None),
        ]);

        let names: Vec<_> = blocks.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["Carleton", "Woodstock"]);
        assert_eq!(
            entries(&blocks[0]),
            vec![
                ("Florenceville-Bristol TV", Some("PPSA")),
                ("Florenceville TV", Some("PPSA")),
                ("Bristol TV", Some("PPSA")),
            ]
        );
        assert_eq!(
            entries(&blocks[1]),
            vec![("Woodstock TV", Some("Municipal")), ("Hartland TV", None)]
        );
    }

    #[test]
    fn test_woodstock_absorbs_following_rows() {
        let blocks = scan(vec![
            raw("Woodstock", Some("Municipal")),
            raw("Woodstock TV", Some("Municipal")),
            raw("Canterbury V", Some("PPSA")),
            raw("Meductic V", None),
            raw("Fundy Shores", Some("PPSA")),
        ]);

        assert_eq!(blocks.len(), 2);
        assert_eq!(
            entries(&blocks[0]),
            vec![
                ("Woodstock TV", Some("Municipal")),
                ("Canterbury V", Some("PPSA")),
                ("Meductic V", None),
            ]
        );
    }

    #[test]
    fn test_reopened_block_is_reset() {
        let blocks = scan(vec![
            raw("Kings", Some("PPSA")),
            raw("Sussex TV", None),
            raw("Albert", Some("PPSA")),
            raw("Kings", Some("MPSA")),
            raw("Hampton TV", None),
        ]);

        let names: Vec<_> = blocks.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["Kings", "Albert"]);
        assert_eq!(entries(&blocks[0]), vec![("Hampton TV", Some("MPSA"))]);
    }

    #[test]
    fn test_scan_filters_and_corrects() {
        let rows = scan_provider_rows(vec![
            raw("Tracadie", Some("PPSA")),
            raw("Tracadie TV", None),
            raw("Parish of Saumarez", None),
            raw("Neguac V", None),
        ]);

        assert_eq!(
            rows,
            vec![
                ProviderRow::new("Tracadie-Sheila", "Tracadie-Sheila", Some("PPSA")),
                ProviderRow::new("Néguac", "Tracadie-Sheila", Some("PPSA")),
            ]
        );
    }

    #[test]
    fn test_resolution_is_total_and_consistent() {
        let rows = vec![
            ProviderRow::new("Moncton", "Codiac", Some("MPSA")),
            ProviderRow::new("Dieppe", "Codiac", Some("MPSA")),
            ProviderRow::new("Riverview", "Codiac", Some("MPSA")),
            ProviderRow::new("Sussex", "Kings", Some("PPSA")),
            ProviderRow::new("Woodstock", "Woodstock", Some("Municipal")),
        ];
        let vocabulary = vocab(&["Moncton", "Dieppe", "Riverview", "Sussex", "Sussex Corner", "Woodstock"]);

        let map = resolve_providers(&rows, &vocabulary, &ProviderConfig::default()).unwrap();

        for muni in &vocabulary {
            assert!(map.contains(muni), "{} unmapped", muni);
        }
        assert_eq!(map.get("Moncton"), map.get("Dieppe"));
        assert_eq!(map.get("Dieppe"), map.get("Riverview"));
        assert_eq!(map.get("Sussex Corner"), Some("PPSA"));
        assert_eq!(map.get("Woodstock"), Some("Municipal"));
        assert!(!map.contains("Codiac"));
    }

    #[test]
    fn test_block_name_resolves_municipality() {
        let rows = vec![ProviderRow::new("Hartland", "Carleton North", Some("PPSA"))];
        let map = resolve_providers(&rows, &vocab(&["Carleton North"]), &ProviderConfig::default())
            .unwrap();
        assert_eq!(map.get("Carleton North"), Some("PPSA"));
    }

    #[test]
    fn test_district_conflict_is_fatal() {
        let rows = vec![
            ProviderRow::new("Hampton", "Kings", Some("PPSA")),
            ProviderRow::new("Hampton", "Kennebecasis", Some("Municipal")),
        ];
        let err = resolve_providers(&rows, &vocab(&["Hampton"]), &ProviderConfig::default())
            .unwrap_err();
        match err {
            PipelineError::ConflictingDistrictProviders { district, providers } => {
                assert_eq!(district, "Hampton");
                assert_eq!(providers, vec!["Municipal", "PPSA"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_pass_two_mismatch_is_fatal() {
        let rows = vec![
            ProviderRow::new("Woodstock", "Carleton", Some("PPSA")),
            ProviderRow::new("Canterbury", "Woodstock", Some("Municipal")),
        ];
        let err = resolve_providers(&rows, &vocab(&["Woodstock"]), &ProviderConfig::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::ProviderMismatch { .. }));
    }

    #[test]
    fn test_missing_provider_names_municipality() {
        let rows = vec![ProviderRow::new("Moncton", "Codiac", Some("MPSA"))];
        let err = resolve_providers(&rows, &vocab(&["Moncton", "Hanwell"]), &ProviderConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("missing policing provider"));
        match err {
            PipelineError::MissingProvider(names) => assert_eq!(names, vec!["Hanwell"]),
            other => panic!("unexpected error: {other}"),
        }
    }
}
