//! Versioned bonus rule catalog.
//!
//! Rules are configuration: they are created inactive, activated, deactivated,
//! or superseded by a new version. Evaluation never reads the live catalog; it
//! works from a [`CatalogSnapshot`] frozen at the start of a pass.

mod rule;

pub use rule::{
    BonusCategory, BonusRule, ConditionSpec, DeathLocationPoints, DurationTier, MonthlyLimit,
    PatientWindowKind, PointsSpec, RollingAnchor, RuleCode, RuleDefinitionError, RuleState,
    TimeBasis,
};

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::domain::{BillingPeriod, FacilityId, InsuranceType};

/// Serialized catalog layout consumed by [`RuleCatalog::load_json`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub base_visit_points: BTreeMap<InsuranceType, i64>,
    #[serde(default)]
    pub rules: Vec<BonusRule>,
}

#[derive(Debug, Default)]
struct CatalogState {
    base_visit_points: BTreeMap<InsuranceType, i64>,
    rules: Vec<BonusRule>,
}

/// Shared, lock-guarded rule catalog.
#[derive(Debug, Default)]
pub struct RuleCatalog {
    state: RwLock<CatalogState>,
}

impl RuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from a document, activating every usable rule.
    /// Malformed rules are logged and left out rather than failing the load.
    pub fn from_document(document: CatalogDocument) -> Self {
        let catalog = Self::new();
        for (insurance_type, points) in document.base_visit_points {
            catalog.set_base_visit_points(insurance_type, points);
        }

        let mut loaded = 0usize;
        for rule in document.rules {
            let code = rule.code.clone();
            let version = rule.version;
            match catalog.create(rule) {
                Ok(_) => {
                    if let Err(error) = catalog.activate(&code, version) {
                        warn!(rule = %code.0, version, %error, "unable to activate catalog rule");
                    } else {
                        loaded += 1;
                    }
                }
                Err(error) => {
                    warn!(rule = %code.0, version, %error, "skipping catalog rule");
                }
            }
        }

        info!(rules = loaded, "bonus rule catalog loaded");
        catalog
    }

    pub fn load_json<R: Read>(reader: R) -> Result<Self, CatalogError> {
        let document: CatalogDocument = serde_json::from_reader(reader)?;
        Ok(Self::from_document(document))
    }

    pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
        let file = File::open(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_json(BufReader::new(file))
    }

    pub fn set_base_visit_points(&self, insurance_type: InsuranceType, points: i64) {
        let mut state = self.write();
        state.base_visit_points.insert(insurance_type, points);
    }

    /// Insert a new, inactive rule.
    pub fn create(&self, mut rule: BonusRule) -> Result<BonusRule, CatalogError> {
        rule.validate()?;
        let mut state = self.write();
        if state
            .rules
            .iter()
            .any(|existing| existing.code == rule.code && existing.version == rule.version)
        {
            return Err(CatalogError::DuplicateVersion {
                code: rule.code.0,
                version: rule.version,
            });
        }

        rule.state = RuleState::Inactive;
        state.rules.push(rule.clone());
        Ok(rule)
    }

    /// Activate a version, deactivating any other active version of the same code.
    pub fn activate(&self, code: &RuleCode, version: u32) -> Result<BonusRule, CatalogError> {
        let mut state = self.write();
        let index = find_index(&state.rules, code, version)?;
        if state.rules[index].state == RuleState::Superseded {
            return Err(CatalogError::Superseded {
                code: code.0.clone(),
                version,
            });
        }

        for rule in state.rules.iter_mut() {
            if rule.code == *code && rule.version != version && rule.state == RuleState::Active {
                rule.state = RuleState::Inactive;
            }
        }
        state.rules[index].state = RuleState::Active;
        info!(rule = %code.0, version, "bonus rule activated");
        Ok(state.rules[index].clone())
    }

    pub fn deactivate(&self, code: &RuleCode, version: u32) -> Result<BonusRule, CatalogError> {
        let mut state = self.write();
        let index = find_index(&state.rules, code, version)?;
        if state.rules[index].state == RuleState::Active {
            state.rules[index].state = RuleState::Inactive;
            info!(rule = %code.0, version, "bonus rule deactivated");
        }
        Ok(state.rules[index].clone())
    }

    /// Publish `replacement` as the next version of `code`. The previous
    /// versions stay in the catalog, marked superseded.
    pub fn supersede(
        &self,
        code: &RuleCode,
        mut replacement: BonusRule,
    ) -> Result<BonusRule, CatalogError> {
        replacement.code = code.clone();
        let mut state = self.write();
        let latest = state
            .rules
            .iter()
            .filter(|rule| rule.code == *code)
            .map(|rule| rule.version)
            .max()
            .ok_or_else(|| CatalogError::UnknownRule {
                code: code.0.clone(),
                version: None,
            })?;

        replacement.version = latest + 1;
        replacement.validate()?;

        for rule in state.rules.iter_mut().filter(|rule| rule.code == *code) {
            rule.state = RuleState::Superseded;
        }
        replacement.state = RuleState::Active;
        state.rules.push(replacement.clone());
        info!(rule = %code.0, version = replacement.version, "bonus rule superseded");
        Ok(replacement)
    }

    pub fn rule(&self, code: &RuleCode, version: u32) -> Option<BonusRule> {
        self.read()
            .rules
            .iter()
            .find(|rule| rule.code == *code && rule.version == version)
            .cloned()
    }

    /// Freeze the rules that can apply to one receipt key.
    pub fn snapshot(
        &self,
        insurance_type: InsuranceType,
        facility_id: &FacilityId,
        period: &BillingPeriod,
    ) -> Result<CatalogSnapshot, CatalogError> {
        let state = self.read();
        let base_visit_points = *state
            .base_visit_points
            .get(&insurance_type)
            .ok_or(CatalogError::MissingBasePoints(insurance_type))?;

        let rules: Vec<BonusRule> = state
            .rules
            .iter()
            .filter(|rule| {
                rule.state == RuleState::Active
                    && rule.insurance_type == insurance_type
                    && rule.matches_facility(facility_id)
                    && rule.overlaps(period)
            })
            .cloned()
            .collect();

        Ok(CatalogSnapshot::new(base_visit_points, rules))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CatalogState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CatalogState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn find_index(rules: &[BonusRule], code: &RuleCode, version: u32) -> Result<usize, CatalogError> {
    rules
        .iter()
        .position(|rule| rule.code == *code && rule.version == version)
        .ok_or_else(|| CatalogError::UnknownRule {
            code: code.0.clone(),
            version: Some(version),
        })
}

/// Immutable rule set used for one evaluation pass.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    base_visit_points: i64,
    rules: Arc<[BonusRule]>,
}

impl CatalogSnapshot {
    pub fn new(base_visit_points: i64, mut rules: Vec<BonusRule>) -> Self {
        rules.sort_by(|left, right| {
            left.code
                .cmp(&right.code)
                .then_with(|| left.version.cmp(&right.version))
        });
        Self {
            base_visit_points,
            rules: rules.into(),
        }
    }

    pub fn base_visit_points(&self) -> i64 {
        self.base_visit_points
    }

    pub fn rules(&self) -> &[BonusRule] {
        &self.rules
    }

    pub fn rule(&self, code: &RuleCode) -> Option<&BonusRule> {
        self.rules.iter().find(|rule| rule.code == *code)
    }

    /// Split into (matching, rest), both keeping the base visit points.
    pub fn partition<F>(&self, predicate: F) -> (CatalogSnapshot, CatalogSnapshot)
    where
        F: Fn(&BonusRule) -> bool,
    {
        let (matching, rest): (Vec<BonusRule>, Vec<BonusRule>) =
            self.rules.iter().cloned().partition(|rule| predicate(rule));
        (
            CatalogSnapshot::new(self.base_visit_points, matching),
            CatalogSnapshot::new(self.base_visit_points, rest),
        )
    }

    pub fn lookback_days(&self) -> u32 {
        self.rules
            .iter()
            .map(BonusRule::lookback_days)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error(transparent)]
    Definition(#[from] RuleDefinitionError),
    #[error("rule {code} version {version} already exists")]
    DuplicateVersion { code: String, version: u32 },
    #[error("rule {code} ({version:?}) not found")]
    UnknownRule { code: String, version: Option<u32> },
    #[error("rule {code} version {version} was superseded")]
    Superseded { code: String, version: u32 },
    #[error("no base visit points configured for {}", .0.label())]
    MissingBasePoints(InsuranceType),
    #[error("unable to read catalog {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed catalog document: {0}")]
    Parse(#[from] serde_json::Error),
}
