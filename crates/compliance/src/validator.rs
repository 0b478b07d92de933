//! Contract compliance rules.
//!
//! Rules run in a fixed order and the first failure short-circuits; warnings
//! accumulate without blocking approval. The whole module is a pure function
//! from contract facts to an outcome, which is what makes the compliance
//! service trivially replayable.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Maximum contract amount accepted without manual handling.
const MAX_AMOUNT: f64 = 50_000.0;

/// Amounts above this are approved but flagged for additional review.
const HIGH_AMOUNT_WATERMARK: f64 = 10_000.0;

/// Premium contracts below this amount are flagged as suspicious.
const PREMIUM_MIN_AMOUNT: f64 = 1_000.0;

const ALLOWED_CURRENCIES: [&str; 4] = ["USD", "EUR", "COP", "MXN"];

const MIN_PARTNER_ID_LEN: usize = 10;

/// Valid contract states after uppercase normalization. Producers spell these
/// in Spanish (the contract store's vocabulary); the English spellings are
/// accepted for newer producers.
const VALID_STATES: [&str; 6] = [
    "ACTIVO",
    "PENDIENTE",
    "SUSPENDIDO",
    "ACTIVE",
    "PENDING",
    "SUSPENDED",
];

/// Read-only projection of a contract as the validator consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractFact {
    pub partner_id: String,
    pub contract_id: String,
    pub amount: f64,
    pub currency: String,
    pub state: String,
    pub contract_type: Option<String>,
}

/// Identifier of a compliance rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleId {
    AmountLimits,
    CurrencyJurisdiction,
    PartnerReputation,
    StateValidity,
    ContractTypeRule,
    GeneralValidation,
}

impl RuleId {
    pub fn name(&self) -> &'static str {
        match self {
            RuleId::AmountLimits => "AmountLimits",
            RuleId::CurrencyJurisdiction => "CurrencyJurisdiction",
            RuleId::PartnerReputation => "PartnerReputation",
            RuleId::StateValidity => "StateValidity",
            RuleId::ContractTypeRule => "ContractTypeRule",
            RuleId::GeneralValidation => "GeneralValidation",
        }
    }

    /// Map a free-text cause back to the rule that raised it.
    ///
    /// Used when a rejection arrives as a string-only error (legacy services
    /// raise plain messages instead of structured outcomes).
    pub fn classify(cause: &str) -> RuleId {
        let cause = cause.to_lowercase();
        if cause.contains("amount") || cause.contains("limit") {
            RuleId::AmountLimits
        } else if cause.contains("currency") {
            RuleId::CurrencyJurisdiction
        } else if cause.contains("partner") {
            RuleId::PartnerReputation
        } else if cause.contains("state") {
            RuleId::StateValidity
        } else {
            RuleId::GeneralValidation
        }
    }
}

impl core::fmt::Display for RuleId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of running the rule set against one contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ComplianceOutcome {
    Approved {
        validated_rules: Vec<RuleId>,
        /// Non-fatal flags (high amount, suspicious premium pricing).
        warnings: Vec<String>,
    },
    Rejected {
        failed_rule: RuleId,
        cause: String,
    },
}

impl ComplianceOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, ComplianceOutcome::Approved { .. })
    }
}

/// Validate a contract against the compliance rule set.
///
/// Rules run in declaration order; the first rejection wins and is reported
/// as the `failed_rule`.
pub fn validate(fact: &ContractFact) -> ComplianceOutcome {
    let mut warnings = Vec::new();

    if let Err(cause) = check_amount_limits(fact, &mut warnings) {
        return ComplianceOutcome::Rejected {
            failed_rule: RuleId::AmountLimits,
            cause,
        };
    }

    if let Err(cause) = check_currency_jurisdiction(fact) {
        return ComplianceOutcome::Rejected {
            failed_rule: RuleId::CurrencyJurisdiction,
            cause,
        };
    }

    if let Err(cause) = check_partner_reputation(fact) {
        return ComplianceOutcome::Rejected {
            failed_rule: RuleId::PartnerReputation,
            cause,
        };
    }

    if let Err(cause) = check_state_validity(fact) {
        return ComplianceOutcome::Rejected {
            failed_rule: RuleId::StateValidity,
            cause,
        };
    }

    // ContractTypeRule is informational only; no type currently rejects.

    ComplianceOutcome::Approved {
        validated_rules: vec![
            RuleId::AmountLimits,
            RuleId::CurrencyJurisdiction,
            RuleId::PartnerReputation,
            RuleId::StateValidity,
        ],
        warnings,
    }
}

fn check_amount_limits(fact: &ContractFact, warnings: &mut Vec<String>) -> Result<(), String> {
    if fact.amount > MAX_AMOUNT {
        return Err(format!(
            "amount {} exceeds maximum of 50000",
            fact.amount
        ));
    }

    if fact.amount > HIGH_AMOUNT_WATERMARK {
        warn!(
            contract_id = %fact.contract_id,
            amount = fact.amount,
            "contract requires additional approval for high amount"
        );
        warnings.push(format!("amount {} requires additional approval", fact.amount));
    }

    if is_premium(fact) && fact.amount < PREMIUM_MIN_AMOUNT {
        warn!(
            contract_id = %fact.contract_id,
            amount = fact.amount,
            "premium contract with unusually low amount"
        );
        warnings.push(format!(
            "premium contract with unusually low amount {}",
            fact.amount
        ));
    }

    Ok(())
}

fn check_currency_jurisdiction(fact: &ContractFact) -> Result<(), String> {
    // Case-sensitive on purpose: "usd" is not a currency code.
    if !ALLOWED_CURRENCIES.contains(&fact.currency.as_str()) {
        return Err(format!("currency {} not allowed", fact.currency));
    }
    Ok(())
}

fn check_partner_reputation(fact: &ContractFact) -> Result<(), String> {
    if fact.partner_id.is_empty() || fact.partner_id.len() < MIN_PARTNER_ID_LEN {
        return Err("invalid partner id".to_string());
    }
    Ok(())
}

fn check_state_validity(fact: &ContractFact) -> Result<(), String> {
    let normalized = fact.state.to_uppercase();
    if !VALID_STATES.contains(&normalized.as_str()) {
        return Err(format!("state {} not valid", fact.state));
    }
    Ok(())
}

fn is_premium(fact: &ContractFact) -> bool {
    fact.contract_type
        .as_deref()
        .is_some_and(|t| t.eq_ignore_ascii_case("premium"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fact(amount: f64, currency: &str, partner_id: &str, state: &str) -> ContractFact {
        ContractFact {
            partner_id: partner_id.to_string(),
            contract_id: "C1".to_string(),
            amount,
            currency: currency.to_string(),
            state: state.to_string(),
            contract_type: None,
        }
    }

    fn base_fact() -> ContractFact {
        fact(2_500.0, "USD", "P0000000001", "ACTIVO")
    }

    #[test]
    fn clean_contract_is_approved_with_all_rules_validated() {
        let outcome = validate(&base_fact());
        match outcome {
            ComplianceOutcome::Approved {
                validated_rules,
                warnings,
            } => {
                assert_eq!(
                    validated_rules,
                    vec![
                        RuleId::AmountLimits,
                        RuleId::CurrencyJurisdiction,
                        RuleId::PartnerReputation,
                        RuleId::StateValidity,
                    ]
                );
                assert!(warnings.is_empty());
            }
            ComplianceOutcome::Rejected { .. } => panic!("expected approval"),
        }
    }

    #[test]
    fn amount_at_limit_passes_just_above_fails() {
        assert!(validate(&fact(50_000.0, "USD", "P0000000001", "ACTIVO")).is_approved());

        match validate(&fact(50_000.01, "USD", "P0000000001", "ACTIVO")) {
            ComplianceOutcome::Rejected { failed_rule, cause } => {
                assert_eq!(failed_rule, RuleId::AmountLimits);
                assert_eq!(cause, "amount 50000.01 exceeds maximum of 50000");
            }
            ComplianceOutcome::Approved { .. } => panic!("expected rejection"),
        }
    }

    #[test]
    fn over_limit_cause_carries_the_amount() {
        match validate(&fact(75_000.0, "USD", "P0000000002", "ACTIVO")) {
            ComplianceOutcome::Rejected { failed_rule, cause } => {
                assert_eq!(failed_rule, RuleId::AmountLimits);
                assert_eq!(cause, "amount 75000 exceeds maximum of 50000");
            }
            ComplianceOutcome::Approved { .. } => panic!("expected rejection"),
        }
    }

    #[test]
    fn high_amount_is_approved_with_a_warning() {
        match validate(&fact(10_000.01, "USD", "P0000000001", "ACTIVO")) {
            ComplianceOutcome::Approved { warnings, .. } => {
                assert_eq!(warnings.len(), 1);
                assert!(warnings[0].contains("additional approval"));
            }
            ComplianceOutcome::Rejected { .. } => panic!("expected approval"),
        }
    }

    #[test]
    fn cheap_premium_contract_is_approved_with_a_warning() {
        let mut f = base_fact();
        f.contract_type = Some("Premium".to_string());
        f.amount = 999.0;

        match validate(&f) {
            ComplianceOutcome::Approved { warnings, .. } => {
                assert_eq!(warnings.len(), 1);
                assert!(warnings[0].contains("low amount"));
            }
            ComplianceOutcome::Rejected { .. } => panic!("expected approval"),
        }
    }

    #[test]
    fn currency_comparison_is_case_sensitive() {
        for bad in ["usd", "BRL", "eur", ""] {
            match validate(&fact(2_500.0, bad, "P0000000001", "ACTIVO")) {
                ComplianceOutcome::Rejected { failed_rule, cause } => {
                    assert_eq!(failed_rule, RuleId::CurrencyJurisdiction);
                    assert!(cause.contains("currency"));
                }
                ComplianceOutcome::Approved { .. } => panic!("expected rejection for {bad:?}"),
            }
        }
    }

    #[test]
    fn partner_id_boundary_is_ten_characters() {
        assert!(validate(&fact(100.0, "USD", "0123456789", "ACTIVO")).is_approved());

        match validate(&fact(100.0, "USD", "012345678", "ACTIVO")) {
            ComplianceOutcome::Rejected { failed_rule, cause } => {
                assert_eq!(failed_rule, RuleId::PartnerReputation);
                assert_eq!(cause, "invalid partner id");
            }
            ComplianceOutcome::Approved { .. } => panic!("expected rejection"),
        }
    }

    #[test]
    fn state_is_normalized_before_checking() {
        assert!(validate(&fact(100.0, "USD", "P0000000001", "activo")).is_approved());
        assert!(validate(&fact(100.0, "USD", "P0000000001", "Pending")).is_approved());

        match validate(&fact(100.0, "USD", "P0000000001", "ARCHIVED")) {
            ComplianceOutcome::Rejected { failed_rule, .. } => {
                assert_eq!(failed_rule, RuleId::StateValidity);
            }
            ComplianceOutcome::Approved { .. } => panic!("expected rejection"),
        }
    }

    #[test]
    fn first_failing_rule_wins() {
        // Both the amount and the currency are bad; amount runs first.
        match validate(&fact(80_000.0, "BRL", "short", "ARCHIVED")) {
            ComplianceOutcome::Rejected { failed_rule, .. } => {
                assert_eq!(failed_rule, RuleId::AmountLimits);
            }
            ComplianceOutcome::Approved { .. } => panic!("expected rejection"),
        }
    }

    #[test]
    fn unknown_contract_type_never_rejects() {
        let mut f = base_fact();
        f.contract_type = Some("EXPERIMENTAL".to_string());
        assert!(validate(&f).is_approved());
    }

    #[test]
    fn causes_classify_back_to_their_rules() {
        assert_eq!(
            RuleId::classify("amount 75000 exceeds maximum of 50000"),
            RuleId::AmountLimits
        );
        assert_eq!(RuleId::classify("over the limit"), RuleId::AmountLimits);
        assert_eq!(RuleId::classify("currency BRL not allowed"), RuleId::CurrencyJurisdiction);
        assert_eq!(RuleId::classify("invalid partner id"), RuleId::PartnerReputation);
        assert_eq!(RuleId::classify("state ARCHIVED not valid"), RuleId::StateValidity);
        assert_eq!(RuleId::classify("something exploded"), RuleId::GeneralValidation);
    }

    proptest! {
        /// Property: validation is a pure function: identical inputs always
        /// produce identical outcomes, including the failed rule.
        #[test]
        fn validation_is_deterministic(
            amount in 0.0f64..100_000.0,
            currency in "[A-Za-z]{3}",
            partner_id in "[A-Za-z0-9]{0,20}",
            state in "[A-Za-z]{4,10}",
        ) {
            let f = ContractFact {
                partner_id,
                contract_id: "C1".to_string(),
                amount,
                currency,
                state,
                contract_type: None,
            };
            prop_assert_eq!(validate(&f), validate(&f));
        }

        /// Property: an approval always validates exactly the four blocking
        /// rules, in rule order.
        #[test]
        fn approvals_list_the_blocking_rules(amount in 0.0f64..=50_000.0) {
            let f = ContractFact { amount, ..base_fact() };
            if let ComplianceOutcome::Approved { validated_rules, .. } = validate(&f) {
                prop_assert_eq!(validated_rules, vec![
                    RuleId::AmountLimits,
                    RuleId::CurrencyJurisdiction,
                    RuleId::PartnerReputation,
                    RuleId::StateValidity,
                ]);
            } else {
                prop_assert!(false, "expected approval");
            }
        }
    }
}
