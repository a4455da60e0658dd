//! Relation and domain advisor.
//!
//! Naming-convention heuristics over the ERP catalog: business domain
//! classification, importance scoring, `<Name>Id` relation inference and the
//! resulting sync order. Nothing here is enforced on the database.

mod audit;

pub use audit::{DomainSummary, SchemaAudit, TableSummary};

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::catalog::{Relation, TableDescriptor};

/// Business area a table belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum BusinessDomain {
    Sales,
    Purchase,
    Stock,
    Accounting,
    #[serde(rename = "HR")]
    Hr,
    Scheduling,
    Maintenance,
    Construction,
    System,
    Reference,
    Analytics,
    #[default]
    Other,
}

impl fmt::Display for BusinessDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BusinessDomain::Sales => "Sales",
            BusinessDomain::Purchase => "Purchase",
            BusinessDomain::Stock => "Stock",
            BusinessDomain::Accounting => "Accounting",
            BusinessDomain::Hr => "HR",
            BusinessDomain::Scheduling => "Scheduling",
            BusinessDomain::Maintenance => "Maintenance",
            BusinessDomain::Construction => "Construction",
            BusinessDomain::System => "System",
            BusinessDomain::Reference => "Reference",
            BusinessDomain::Analytics => "Analytics",
            BusinessDomain::Other => "Other",
        };
        f.write_str(s)
    }
}

/// How a rule matches a lower-cased table name.
enum Rule {
    Contains(&'static [&'static str]),
    Prefix(&'static str),
}

/// Classification rules. Evaluated in order, first match wins.
const DOMAIN_RULES: &[(BusinessDomain, Rule)] = &[
    (BusinessDomain::Sales, Rule::Contains(&["sale", "customer", "deal"])),
    (BusinessDomain::Purchase, Rule::Contains(&["purchase", "supplier"])),
    (BusinessDomain::Stock, Rule::Contains(&["stock", "item", "range"])),
    (
        BusinessDomain::Accounting,
        Rule::Contains(&["accounting", "commitment", "settlement", "bank"]),
    ),
    (BusinessDomain::Hr, Rule::Contains(&["colleague", "payroll"])),
    (BusinessDomain::Scheduling, Rule::Contains(&["schedule", "activity"])),
    (BusinessDomain::Maintenance, Rule::Contains(&["maintenance", "incident"])),
    (BusinessDomain::Construction, Rule::Contains(&["construction"])),
    (BusinessDomain::System, Rule::Prefix("ebpsys")),
    (
        BusinessDomain::Reference,
        Rule::Contains(&["country", "zipcode", "civility", "family", "type", "category"]),
    ),
    (BusinessDomain::Analytics, Rule::Contains(&["analytic", "grid"])),
];

const CORE_KEYWORDS: &[&str] = &["customer", "item", "sale", "purchase", "stock", "supplier"];
const REFERENCE_KEYWORDS: &[&str] = &["family", "type", "category", "mode"];
const SYSTEM_PREFIX: &str = "ebpsys";

/// Importance above which a table is reported as critical.
pub const CRITICAL_IMPORTANCE: u32 = 10;

/// Classify a table name into a business domain.
pub fn classify_domain(name: &str) -> BusinessDomain {
    let lower = name.to_lowercase();
    DOMAIN_RULES
        .iter()
        .find(|(_, rule)| match rule {
            Rule::Contains(words) => words.iter().any(|w| lower.contains(w)),
            Rule::Prefix(p) => lower.starts_with(p),
        })
        .map(|(domain, _)| *domain)
        .unwrap_or(BusinessDomain::Other)
}

/// Score how central a table is to the business.
pub fn score_importance(table: &TableDescriptor) -> u32 {
    let lower = table.name.to_lowercase();
    let mut score: i32 = 0;

    score += match table.estimated_row_count {
        n if n > 10_000 => 5,
        n if n > 1_000 => 3,
        n if n > 100 => 1,
        _ => 0,
    };

    if CORE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        score += 10;
    }
    if REFERENCE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        score += 5;
    }
    if lower.starts_with(SYSTEM_PREFIX) {
        score -= 5;
    }
    if table.columns.len() + table.skipped_columns.len() > 100 {
        score += 3;
    }

    score.max(0) as u32
}

/// A `<Name>Id` column pointing at a guessed table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferredRelation {
    pub source_table: String,
    pub source_column: String,
    pub candidate_table: String,
    pub resolved: bool,
}

/// Rebuild a table name from the stem of an `...Id` column.
///
/// `customer_` becomes `Customer`, `SaleDocument` stays `SaleDocument`.
fn candidate_from_stem(stem: &str) -> Option<String> {
    let mut tokens: Vec<String> = Vec::new();
    for part in stem.split('_').filter(|p| !p.is_empty()) {
        let mut current = String::new();
        let mut prev_lower = false;
        for ch in part.chars() {
            if ch.is_uppercase() && prev_lower && !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
            current.push(ch);
        }
        if !current.is_empty() {
            tokens.push(current);
        }
    }

    if tokens.is_empty() {
        return None;
    }

    Some(
        tokens
            .iter()
            .map(|t| {
                let mut chars = t.chars();
                match chars.next() {
                    Some(first) => {
                        first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                    }
                    None => String::new(),
                }
            })
            .collect(),
    )
}

/// Infer relations from `<Name>Id` columns.
///
/// Columns starting with `sys` and the `UniqueId` identity column are
/// ignored. A candidate is resolved when a table with that name (compared
/// case-insensitively) is in `known_tables`.
pub fn infer_relations(table: &TableDescriptor, known_tables: &[&str]) -> Vec<InferredRelation> {
    let known: HashMap<String, &str> = known_tables
        .iter()
        .map(|t| (t.to_lowercase(), *t))
        .collect();

    table
        .columns
        .iter()
        .filter_map(|col| {
            let name = col.name.as_str();
            let lower = name.to_lowercase();
            if lower.starts_with("sys") || lower == "uniqueid" || name.len() <= 2 {
                return None;
            }
            let split = name.len() - 2;
            if !name.is_char_boundary(split) || !name[split..].eq_ignore_ascii_case("id") {
                return None;
            }
            let stem = &name[..split];
            let candidate = candidate_from_stem(stem)?;
            let resolved = known.get(&candidate.to_lowercase()).copied();
            Some(InferredRelation {
                source_table: table.name.clone(),
                source_column: col.name.clone(),
                candidate_table: resolved.map(str::to_string).unwrap_or(candidate),
                resolved: resolved.is_some(),
            })
        })
        .collect()
}

/// Fill in domain, importance and inferred relations on every descriptor.
///
/// Declared relations are kept; inferred ones only fill columns without one.
pub fn annotate(tables: &mut [TableDescriptor]) {
    let names: Vec<String> = tables.iter().map(|t| t.name.clone()).collect();
    let known: Vec<&str> = names.iter().map(String::as_str).collect();

    for table in tables.iter_mut() {
        table.domain = classify_domain(&table.name);
        table.importance = score_importance(table);

        for rel in infer_relations(table, &known) {
            if let Some(col) = table.columns.iter_mut().find(|c| c.name == rel.source_column) {
                if col.relation.is_none() {
                    col.relation = Some(Relation::Inferred {
                        candidate_table: rel.candidate_table,
                        resolved: rel.resolved,
                    });
                }
            }
        }
    }
}

/// Order tables for syncing.
///
/// Repeatedly picks the table with the fewest referenced tables not yet
/// placed, breaking ties by higher importance and then by name. Only
/// resolved relations to other tables in the set count as dependencies.
pub fn prioritize(tables: Vec<TableDescriptor>) -> Vec<TableDescriptor> {
    let names: HashSet<String> = tables.iter().map(|t| t.name.clone()).collect();
    let deps: Vec<HashSet<String>> = tables
        .iter()
        .map(|t| {
            t.columns
                .iter()
                .filter_map(|c| c.relation.as_ref())
                .filter(|r| r.is_resolved())
                .map(|r| r.target_table().to_string())
                .filter(|target| target != &t.name && names.contains(target))
                .collect()
        })
        .collect();

    let mut remaining: Vec<(TableDescriptor, HashSet<String>)> =
        tables.into_iter().zip(deps).collect();
    let mut placed: HashSet<String> = HashSet::new();
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let best = remaining
            .iter()
            .enumerate()
            .min_by(|(_, (a, da)), (_, (b, db))| {
                let ua = da.iter().filter(|d| !placed.contains(*d)).count();
                let ub = db.iter().filter(|d| !placed.contains(*d)).count();
                ua.cmp(&ub)
                    .then(b.importance.cmp(&a.importance))
                    .then(a.name.cmp(&b.name))
            })
            .map(|(i, _)| i)
            .unwrap_or(0);

        let (table, _) = remaining.swap_remove(best);
        placed.insert(table.name.clone());
        ordered.push(table);
    }

    ordered
}
