use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::stage3_panel::Panels;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    Category, CategoryPanel, Column, FieldType, Table, Value, MUNICIPALITY, YEAR,
};

/// Fields that identify a row rather than measure something
pub const CONSTANT_FIELDS: [&str; 2] = [YEAR, MUNICIPALITY];

/// A merged municipality and the legacy municipalities it absorbed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmalgamationRule {
    pub target: String,
    pub sources: Vec<String>,
}

/// Declares that `field` of `category` is merged as a mean weighted by
/// `weight`, which lives in `weight_category` (same category when unset)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightSpec {
    pub category: Category,
    pub field: String,
    #[serde(default)]
    pub weight_category: Option<Category>,
    pub weight: String,
}

impl WeightSpec {
    pub fn same(category: Category, field: &str, weight: &str) -> Self {
        Self {
            category,
            field: field.to_string(),
            weight_category: None,
            weight: weight.to_string(),
        }
    }

    pub fn cross(category: Category, field: &str, weight_category: Category, weight: &str) -> Self {
        Self {
            category,
            field: field.to_string(),
            weight_category: Some(weight_category),
            weight: weight.to_string(),
        }
    }
}

/// Configuration for Stage 4 amalgamation reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmalgamationConfig {
    pub rules: Vec<AmalgamationRule>,
    pub weights: Vec<WeightSpec>,
}

impl Default for AmalgamationConfig {
    fn default() -> Self {
        Self {
            rules: vec![AmalgamationRule {
                target: "Florenceville-Bristol".to_string(),
                sources: vec!["Florenceville".to_string(), "Bristol".to_string()],
            }],
            weights: vec![
                WeightSpec::same(Category::Comparative, "Population/Kilometrage", "Total Kilometrage"),
                WeightSpec::same(Category::Comparative, "Tax Base/Kilometrage", "Total Kilometrage"),
                WeightSpec::same(
                    Category::Comparative,
                    "Tax Base/Capita",
                    "Latest Census Population",
                ),
                WeightSpec::same(
                    Category::Comparative,
                    "Fiscal Capacity",
                    "Latest Census Population",
                ),
                WeightSpec::cross(
                    Category::Comparative,
                    "Average Tax Rate",
                    Category::TaxBase,
                    "Total Tax Base for Rate",
                ),
            ],
        }
    }
}

/// How a field is combined when rows are merged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregation {
    /// Identity field: first value, Municipality replaced by the target name
    Constant,
    /// Σ(value × weight) / Σ(weight) over the named weight column
    WeightedMean { weight: String },
    Sum,
    /// Non-numeric field: first value
    First,
}

/// A weight column pulled in from another category before grouping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightJoin {
    pub from: Category,
    pub column: String,
    /// Temporary column name in the joined table
    pub alias: String,
}

/// Per-field aggregation policies for one category, resolved once from
/// configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationPlan {
    pub category: Category,
    pub policies: Vec<(String, Aggregation)>,
    pub joins: Vec<WeightJoin>,
}

impl AggregationPlan {
    /// Resolve the policy of every column of `table`
    ///
    /// Precedence: constant field, declared weight, numeric sum, first value.
    pub fn resolve(category: Category, table: &Table, weights: &[WeightSpec]) -> PipelineResult<Self> {
        let mut joins: Vec<WeightJoin> = Vec::new();
        let mut policies = Vec::with_capacity(table.width());

        for column in &table.columns {
            let declared = weights
                .iter()
                .find(|w| w.category == category && w.field == column.name);

            let policy = if CONSTANT_FIELDS.contains(&column.name.as_str()) {
                Aggregation::Constant
            } else if let Some(spec) = declared {
                let weight = match spec.weight_category {
                    Some(from) if from != category => {
                        let alias = format!("{}::{}", from, spec.weight);
                        if !joins.iter().any(|j| j.alias == alias) {
                            joins.push(WeightJoin {
                                from,
                                column: spec.weight.clone(),
                                alias: alias.clone(),
                            });
                        }
                        alias
                    }
                    _ => {
                        if table.column_index(&spec.weight).is_none() {
                            return Err(PipelineError::MissingColumn {
                                column: spec.weight.clone(),
                                context: format!("{} panel", category),
                            });
                        }
                        spec.weight.clone()
                    }
                };
                Aggregation::WeightedMean { weight }
            } else if column.ty.is_numeric() {
                Aggregation::Sum
            } else {
                Aggregation::First
            };
            policies.push((column.name.clone(), policy));
        }

        for join in &joins {
            policies.push((join.alias.clone(), Aggregation::Sum));
        }

        Ok(Self {
            category,
            policies,
            joins,
        })
    }

    /// Categories this plan reads weights from
    pub fn dependencies(&self) -> Vec<Category> {
        self.joins.iter().map(|j| j.from).collect()
    }
}

/// Left-join `column` of `other` onto `table` by (Year, Municipality)
///
/// Rows with no partner get a zero weight.
fn join_weight(table: &mut Table, other: &CategoryPanel, join: &WeightJoin) -> PipelineResult<()> {
    let col = other
        .table
        .column_index(&join.column)
        .ok_or_else(|| PipelineError::MissingColumn {
            column: join.column.clone(),
            context: format!("{} panel", join.from),
        })?;

    let mut lookup: HashMap<(i64, String), f64> = HashMap::new();
    for (row_idx, row) in other.table.rows.iter().enumerate() {
        if let Some(key) = other.table.entity_key(row_idx) {
            lookup
                .entry(key)
                .or_insert_with(|| row[col].as_f64().unwrap_or(0.0));
        }
    }

    let weights: Vec<f64> = (0..table.height())
        .map(|row| {
            table
                .entity_key(row)
                .and_then(|key| lookup.get(&key).copied())
                .unwrap_or(0.0)
        })
        .collect();

    table.columns.push(Column::new(join.alias.clone(), FieldType::Float));
    for (row, weight) in table.rows.iter_mut().zip(weights) {
        row.push(Value::Float(weight));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum ResolvedAggregation {
    Constant,
    WeightedMean(usize),
    Sum,
    First,
}

fn combine(
    policies: &[ResolvedAggregation],
    columns: &[Column],
    members: &[&Vec<Value>],
    target: &str,
) -> Vec<Value> {
    policies
        .iter()
        .zip(columns)
        .enumerate()
        .map(|(i, (policy, column))| match policy {
            ResolvedAggregation::Constant if column.name == MUNICIPALITY => {
                Value::Text(target.to_string())
            }
            ResolvedAggregation::Constant | ResolvedAggregation::First => members[0][i].clone(),
            ResolvedAggregation::Sum => match column.ty {
                FieldType::Int => {
                    Value::Int(members.iter().filter_map(|m| m[i].as_i64()).sum())
                }
                _ => Value::Float(members.iter().filter_map(|m| m[i].as_f64()).sum()),
            },
            ResolvedAggregation::WeightedMean(w) => {
                let pairs: Vec<(f64, f64)> = members
                    .iter()
                    .map(|m| (m[i].as_f64().unwrap_or(0.0), m[*w].as_f64().unwrap_or(0.0)))
                    .collect();
                let mean = weighted_mean(&pairs).unwrap_or_else(|| {
                    warn!(
                        "{}: weights for '{}' sum to zero, using plain mean",
                        target, column.name
                    );
                    pairs.iter().map(|(v, _)| v).sum::<f64>() / pairs.len() as f64
                });
                match column.ty {
                    FieldType::Int => Value::Int(mean.round() as i64),
                    _ => Value::Float(mean),
                }
            }
        })
        .collect()
}

/// Σ(v·w)/Σ(w); `None` when the weights sum to zero
pub fn weighted_mean(pairs: &[(f64, f64)]) -> Option<f64> {
    let total: f64 = pairs.iter().map(|(_, w)| w).sum();
    if total == 0.0 {
        return None;
    }
    Some(pairs.iter().map(|(v, w)| v * w).sum::<f64>() / total)
}

/// Merge the amalgamated rows of one category
fn reconcile_panel(
    panel: &CategoryPanel,
    plan: &AggregationPlan,
    panels: &Panels,
    rules: &[AmalgamationRule],
) -> PipelineResult<(CategoryPanel, usize)> {
    let mut table = panel.table.clone();
    for join in &plan.joins {
        let other = panels
            .get(&join.from)
            .ok_or_else(|| PipelineError::MissingColumn {
                column: join.column.clone(),
                context: format!("missing {} panel", join.from),
            })?;
        join_weight(&mut table, other, join)?;
    }

    let resolved: Vec<ResolvedAggregation> = plan
        .policies
        .iter()
        .map(|(_, policy)| match policy {
            Aggregation::Constant => Ok(ResolvedAggregation::Constant),
            Aggregation::Sum => Ok(ResolvedAggregation::Sum),
            Aggregation::First => Ok(ResolvedAggregation::First),
            Aggregation::WeightedMean { weight } => table
                .column_index(weight)
                .map(ResolvedAggregation::WeightedMean)
                .ok_or_else(|| PipelineError::MissingColumn {
                    column: weight.clone(),
                    context: format!("{} panel", panel.category),
                }),
        })
        .collect::<PipelineResult<_>>()?;

    let target_of: HashMap<&str, &str> = rules
        .iter()
        .flat_map(|rule| {
            rule.sources
                .iter()
                .map(move |source| (source.as_str(), rule.target.as_str()))
        })
        .collect();

    // (target, year) -> member row indices, in order of first appearance
    let mut groups: Vec<((String, i64), Vec<usize>)> = Vec::new();
    let mut group_of: HashMap<(String, i64), usize> = HashMap::new();
    let mut untouched: Vec<usize> = Vec::new();

    for row in 0..table.height() {
        let target = table
            .entity_key(row)
            .and_then(|(year, muni)| target_of.get(muni.as_str()).map(|t| (t.to_string(), year)));
        match target {
            Some(key) => {
                let idx = *group_of.entry(key.clone()).or_insert_with(|| {
                    groups.push((key, Vec::new()));
                    groups.len() - 1
                });
                groups[idx].1.push(row);
            }
            None => untouched.push(row),
        }
    }

    let mut ordered: Vec<(usize, Vec<Value>)> = untouched
        .into_iter()
        .map(|row| (row, table.rows[row].clone()))
        .collect();
    for ((target, year), members) in &groups {
        let rows: Vec<&Vec<Value>> = members.iter().map(|&m| &table.rows[m]).collect();
        debug!(
            "{}: merging {} rows into {} for {}",
            panel.category,
            rows.len(),
            target,
            year
        );
        ordered.push((members[0], combine(&resolved, &table.columns, &rows, target)));
    }
    ordered.sort_by_key(|(position, _)| *position);

    table.rows = ordered.into_iter().map(|(_, row)| row).collect();
    for join in &plan.joins {
        table.drop_column(&join.alias);
    }

    check_unique(panel.category, &table)?;
    Ok((CategoryPanel::new(panel.category, table), groups.len()))
}

fn check_unique(category: Category, table: &Table) -> PipelineResult<()> {
    let mut seen: HashSet<(i64, String)> = HashSet::new();
    for row in 0..table.height() {
        if let Some(key) = table.entity_key(row) {
            if !seen.insert(key.clone()) {
                return Err(PipelineError::DuplicateEntity {
                    category,
                    year: key.0,
                    municipality: key.1,
                });
            }
        }
    }
    Ok(())
}

/// Execute Stage 4: reaggregate amalgamated municipalities in every panel
///
/// All panels are taken together because a field may be weighted by a
/// column of another category. The weight dependencies of every category are
/// resolved against the panels as they were before any merging.
pub fn reconcile_amalgamations(panels: &Panels, config: &AmalgamationConfig) -> PipelineResult<Panels> {
    let plans: BTreeMap<Category, AggregationPlan> = panels
        .iter()
        .map(|(&category, panel)| {
            AggregationPlan::resolve(category, &panel.table, &config.weights).map(|p| (category, p))
        })
        .collect::<PipelineResult<_>>()?;

    for plan in plans.values() {
        let deps = plan.dependencies();
        if !deps.is_empty() {
            debug!("{} weights depend on {:?}", plan.category, deps);
        }
    }

    let mut reconciled = Panels::new();
    for (category, panel) in panels {
        let (merged, groups) = reconcile_panel(panel, &plans[category], panels, &config.rules)?;
        info!(
            "Stage 4: {} merged {} amalgamation groups ({} -> {} rows)",
            category,
            groups,
            panel.height(),
            merged.height()
        );
        reconciled.insert(*category, merged);
    }
    Ok(reconciled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    fn exps_panel(rows: &[(i64, &str, f64, i64)]) -> CategoryPanel {
        let mut table = Table::new(vec![
            Column::new(YEAR, FieldType::Int),
            Column::new(MUNICIPALITY, FieldType::Text),
            Column::new("Police", FieldType::Int),
            Column::new("Total Expenditures", FieldType::Float),
        ]);
        for (year, muni, total, police) in rows {
            table.rows.push(vec![
                Value::Int(*year),
                text(muni),
                Value::Int(*police),
                Value::Float(*total),
            ]);
        }
        CategoryPanel::new(Category::BudgetExpenditures, table)
    }

    fn cmp_panel(rows: &[(i64, &str, i64, f64, f64, f64)]) -> CategoryPanel {
        let mut table = Table::new(vec![
            Column::new(YEAR, FieldType::Int),
            Column::new(MUNICIPALITY, FieldType::Text),
            Column::new("Latest Census Population", FieldType::Int),
            Column::new("Total Kilometrage", FieldType::Float),
            Column::new("Population/Kilometrage", FieldType::Float),
            Column::new("Average Tax Rate", FieldType::Float),
        ]);
        for (year, muni, pop, km, density, rate) in rows {
            table.rows.push(vec![
                Value::Int(*year),
                text(muni),
                Value::Int(*pop),
                Value::Float(*km),
                Value::Float(*density),
                Value::Float(*rate),
            ]);
        }
        CategoryPanel::new(Category::Comparative, table)
    }

    fn tax_panel(rows: &[(i64, &str, i64)]) -> CategoryPanel {
        let mut table = Table::new(vec![
            Column::new(YEAR, FieldType::Int),
            Column::new(MUNICIPALITY, FieldType::Text),
            Column::new("Total Tax Base for Rate", FieldType::Int),
        ]);
        for (year, muni, base) in rows {
            table.rows.push(vec![Value::Int(*year), text(muni), Value::Int(*base)]);
        }
        CategoryPanel::new(Category::TaxBase, table)
    }

    fn florenceville_config() -> AmalgamationConfig {
        AmalgamationConfig {
            rules: vec![AmalgamationRule {
                target: "Florenceville-Bristol".to_string(),
                sources: vec!["Florenceville TV".to_string(), "Bristol TV".to_string()],
            }],
            ..AmalgamationConfig::default()
        }
    }

    fn sample_panels() -> Panels {
        let mut panels = Panels::new();
        panels.insert(
            Category::BudgetExpenditures,
            exps_panel(&[
                (2005, "Hartland", 70.0, 7),
                (2005, "Florenceville TV", 100.0, 10),
                (2005, "Woodstock", 500.0, 60),
                (2005, "Bristol TV", 50.0, 4),
                (2006, "Florenceville-Bristol", 160.0, 15),
            ]),
        );
        panels.insert(
            Category::Comparative,
            cmp_panel(&[
                (2005, "Hartland", 900, 12.0, 75.0, 1.2),
                (2005, "Florenceville TV", 800, 30.0, 26.0, 1.5),
                (2005, "Woodstock", 5000, 60.0, 83.0, 1.9),
                (2005, "Bristol TV", 700, 10.0, 70.0, 1.3),
                (2006, "Florenceville-Bristol", 1500, 40.0, 37.5, 1.4),
            ]),
        );
        panels.insert(
            Category::TaxBase,
            tax_panel(&[
                (2005, "Hartland", 40),
                (2005, "Florenceville TV", 300),
                (2005, "Woodstock", 900),
                (2005, "Bristol TV", 100),
                (2006, "Florenceville-Bristol", 420),
            ]),
        );
        panels
    }

    fn row_of<'a>(panel: &'a CategoryPanel, year: i64, muni: &str) -> &'a Vec<Value> {
        let idx = (0..panel.height())
            .find(|&r| panel.table.entity_key(r) == Some((year, muni.to_string())))
            .unwrap();
        &panel.table.rows[idx]
    }

    #[test]
    fn test_plan_precedence() {
        let panels = sample_panels();
        let plan = AggregationPlan::resolve(
            Category::Comparative,
            &panels[&Category::Comparative].table,
            &AmalgamationConfig::default().weights,
        )
        .unwrap();

        let policy = |name: &str| {
            plan.policies
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, p)| p.clone())
                .unwrap()
        };
        assert_eq!(policy(YEAR), Aggregation::Constant);
        assert_eq!(policy(MUNICIPALITY), Aggregation::Constant);
        assert_eq!(policy("Latest Census Population"), Aggregation::Sum);
        assert_eq!(
            policy("Population/Kilometrage"),
            Aggregation::WeightedMean {
                weight: "Total Kilometrage".to_string()
            }
        );
        assert_eq!(
            policy("Average Tax Rate"),
            Aggregation::WeightedMean {
                weight: "tax_base::Total Tax Base for Rate".to_string()
            }
        );
        assert_eq!(plan.dependencies(), vec![Category::TaxBase]);
    }

    #[test]
    fn test_florenceville_bristol_example() {
        let panels = sample_panels();
        let out = reconcile_amalgamations(&panels, &florenceville_config()).unwrap();

        let exps = &out[&Category::BudgetExpenditures];
        let merged = row_of(exps, 2005, "Florenceville-Bristol");
        assert_eq!(merged[3], Value::Float(150.0));
        assert_eq!(merged[2], Value::Int(14));

        let cmp = &out[&Category::Comparative];
        let merged = row_of(cmp, 2005, "Florenceville-Bristol");
        let expected = (26.0 * 30.0 + 70.0 * 10.0) / 40.0;
        assert!((merged[4].as_f64().unwrap() - expected).abs() < 1e-9);
        assert_eq!(merged[3], Value::Float(40.0));
        assert_eq!(merged[2], Value::Int(1500));
    }

    #[test]
    fn test_cross_category_weight() {
        let panels = sample_panels();
        let out = reconcile_amalgamations(&panels, &florenceville_config()).unwrap();

        let cmp = &out[&Category::Comparative];
        let merged = row_of(cmp, 2005, "Florenceville-Bristol");
        let expected = (1.5 * 300.0 + 1.3 * 100.0) / 400.0;
        assert!((merged[5].as_f64().unwrap() - expected).abs() < 1e-9);
        // the joined weight column does not leak into the output
        assert_eq!(cmp.table.width(), 6);
    }

    #[test]
    fn test_row_order_is_preserved() {
        let panels = sample_panels();
        let out = reconcile_amalgamations(&panels, &florenceville_config()).unwrap();

        let names: Vec<String> = out[&Category::BudgetExpenditures]
            .table
            .rows
            .iter()
            .map(|r| r[1].to_string())
            .collect();
        assert_eq!(
            names,
            vec!["Hartland", "Florenceville-Bristol", "Woodstock", "Florenceville-Bristol"]
        );
        assert_eq!(
            row_of(&out[&Category::BudgetExpenditures], 2005, "Woodstock"),
            row_of(&panels[&Category::BudgetExpenditures], 2005, "Woodstock")
        );
    }

    #[test]
    fn test_sum_preserves_mass_and_mean_is_bounded() {
        let panels = sample_panels();
        let out = reconcile_amalgamations(&panels, &florenceville_config()).unwrap();

        let before = &panels[&Category::Comparative];
        let members: Vec<&Vec<Value>> = ["Florenceville TV", "Bristol TV"]
            .iter()
            .map(|m| row_of(before, 2005, m))
            .collect();
        let merged = row_of(&out[&Category::Comparative], 2005, "Florenceville-Bristol");

        let population: i64 = members.iter().map(|r| r[2].as_i64().unwrap()).sum();
        assert_eq!(merged[2].as_i64(), Some(population));

        for col in [4, 5] {
            let values: Vec<f64> = members.iter().map(|r| r[col].as_f64().unwrap()).collect();
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let v = merged[col].as_f64().unwrap();
            assert!(v >= min && v <= max, "column {} value {} outside [{}, {}]", col, v, min, max);
        }
    }

    #[test]
    fn test_zero_weights_fall_back_to_mean() {
        assert_eq!(weighted_mean(&[(1.0, 0.0), (3.0, 0.0)]), None);
        let mut panels = Panels::new();
        panels.insert(
            Category::Comparative,
            cmp_panel(&[
                (2005, "Florenceville TV", 800, 0.0, 20.0, 1.0),
                (2005, "Bristol TV", 700, 0.0, 40.0, 1.0),
            ]),
        );
        panels.insert(
            Category::TaxBase,
            tax_panel(&[(2005, "Florenceville TV", 1), (2005, "Bristol TV", 1)]),
        );
        let out = reconcile_amalgamations(&panels, &florenceville_config()).unwrap();
        let merged = row_of(&out[&Category::Comparative], 2005, "Florenceville-Bristol");
        assert_eq!(merged[4], Value::Float(30.0));
    }

    #[test]
    fn test_target_already_present_is_duplicate() {
        let mut panels = Panels::new();
        panels.insert(
            Category::BudgetExpenditures,
            exps_panel(&[
                (2005, "Florenceville-Bristol", 1.0, 1),
                (2005, "Bristol TV", 2.0, 2),
            ]),
        );
        let err = reconcile_amalgamations(&panels, &florenceville_config()).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateEntity { year: 2005, .. }));
    }

    #[test]
    fn test_missing_weight_category_is_fatal() {
        let mut panels = Panels::new();
        panels.insert(
            Category::Comparative,
            cmp_panel(&[(2005, "Bristol TV", 700, 10.0, 70.0, 1.3)]),
        );
        let err = reconcile_amalgamations(&panels, &florenceville_config()).unwrap_err();
        assert!(matches!(err, PipelineError::MissingColumn { .. }));
    }
}
