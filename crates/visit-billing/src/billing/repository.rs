use serde::{Deserialize, Serialize};

use super::catalog::RuleCode;
use super::domain::{BillingPeriod, PatientId, VisitId};
use super::evaluation::MonthlyUsage;
use super::receipt::{BonusApplication, MonthlyReceipt, ReceiptId, ReceiptKey};

/// Slice of a receipt's applications a recalculation replaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceScope {
    pub receipt_id: ReceiptId,
    /// `None` replaces the whole receipt; `Some` only that visit's applications.
    pub visit_id: Option<VisitId>,
    /// Rules replaced across every visit of the receipt, whatever `visit_id` says.
    #[serde(default)]
    pub rule_codes: Vec<RuleCode>,
}

impl ReplaceScope {
    pub fn receipt(receipt_id: ReceiptId) -> Self {
        Self {
            receipt_id,
            visit_id: None,
            rule_codes: Vec::new(),
        }
    }

    pub fn visit(receipt_id: ReceiptId, visit_id: VisitId) -> Self {
        Self {
            receipt_id,
            visit_id: Some(visit_id),
            rule_codes: Vec::new(),
        }
    }

    /// Widen the scope to every application of `codes` on the receipt.
    pub fn with_rules(mut self, codes: impl IntoIterator<Item = RuleCode>) -> Self {
        self.rule_codes.extend(codes);
        self
    }

    pub fn covers(&self, application: &BonusApplication) -> bool {
        if application.receipt_id != self.receipt_id {
            return false;
        }
        match &self.visit_id {
            None => true,
            Some(visit_id) => {
                application.visit_id == *visit_id
                    || self.rule_codes.contains(&application.rule_code)
            }
        }
    }
}

/// Everything one recalculation writes. Stores apply it all or nothing.
#[derive(Debug, Clone)]
pub struct ReceiptCommit {
    pub receipt: MonthlyReceipt,
    pub scope: ReplaceScope,
    pub applications: Vec<BonusApplication>,
}

/// Persistence for receipts and bonus applications.
pub trait BillingStore: Send + Sync {
    fn receipt(&self, id: &ReceiptId) -> Result<Option<MonthlyReceipt>, RepositoryError>;
    fn receipt_by_key(&self, key: &ReceiptKey) -> Result<Option<MonthlyReceipt>, RepositoryError>;
    fn applications(&self, receipt_id: &ReceiptId) -> Result<Vec<BonusApplication>, RepositoryError>;

    /// Live application counts per rule for the patient's month, leaving out
    /// whatever `excluding` covers.
    fn monthly_usage(
        &self,
        patient_id: &PatientId,
        period: &BillingPeriod,
        excluding: &ReplaceScope,
    ) -> Result<MonthlyUsage, RepositoryError>;

    /// Atomically drop the applications under `commit.scope`, insert the new
    /// set, and upsert the receipt.
    fn commit(&self, commit: ReceiptCommit) -> Result<MonthlyReceipt, RepositoryError>;

    /// Persist lifecycle or validation changes to an existing receipt.
    fn save_receipt(&self, receipt: MonthlyReceipt) -> Result<MonthlyReceipt, RepositoryError>;

    /// Remove a receipt together with its applications.
    fn delete_receipt(&self, id: &ReceiptId) -> Result<(), RepositoryError>;
}

/// Error enumeration for repository failures.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("record not found")]
    NotFound,
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

impl RepositoryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RepositoryError::Unavailable(_))
    }
}
