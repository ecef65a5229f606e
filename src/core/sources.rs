use super::error::PlanError;
use super::plans::{RepaymentPlan, STANDARD_TERM_YEARS};
use super::types::{BorrowerProfile, RateSchedule};

pub const UNSUBSIDIZED_ANNUAL_LIMIT: f64 = 2_000.0;
pub const DEFAULT_PRIVATE_TERM_YEARS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FederalTerms {
    pub annual_rate: f64,
    pub origination_fee: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrivateLender {
    pub name: String,
    pub annual_rate: f64,
    pub origination_fee: f64,
    pub flat_fee: f64,
    pub annual_limit: Option<f64>,
    pub terms: Vec<u32>,
}

impl PrivateLender {
    pub fn new(name: impl Into<String>, annual_rate: f64) -> Self {
        Self {
            name: name.into(),
            annual_rate,
            origination_fee: 0.0,
            flat_fee: 0.0,
            annual_limit: None,
            terms: vec![DEFAULT_PRIVATE_TERM_YEARS],
        }
    }

    pub fn with_origination_fee(mut self, fee: f64) -> Self {
        self.origination_fee = fee;
        self
    }

    /// Fee added to the principal in every year the lender is drawn.
    pub fn with_flat_fee(mut self, fee: f64) -> Self {
        self.flat_fee = fee;
        self
    }

    pub fn with_annual_limit(mut self, limit: f64) -> Self {
        self.annual_limit = Some(limit);
        self
    }

    pub fn with_terms(mut self, terms: Vec<u32>) -> Self {
        self.terms = terms;
        self
    }
}

/// A loan the borrower already holds; it enters the plan as a locked year-0 draw.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingLoan {
    pub name: String,
    pub balance: f64,
    pub plan: RepaymentPlan,
    pub subsidized: bool,
}

impl ExistingLoan {
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.name.trim().is_empty() {
            return Err(PlanError::invalid("existing_loans.name", "must not be empty"));
        }
        if !self.balance.is_finite() || self.balance < 0.0 {
            return Err(PlanError::invalid(
                "existing_loans.balance",
                format!("{}: must be >= 0", self.name),
            ));
        }
        validate_rate("existing_loans.rate", self.plan.annual_rate())?;
        if self.plan.term_years() == 0 {
            return Err(PlanError::invalid(
                "existing_loans.term_years",
                format!("{}: must be >= 1", self.name),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FundingSource {
    DirectSubsidized(FederalTerms),
    DirectUnsubsidized(FederalTerms),
    ParentPlus(FederalTerms),
    Private(PrivateLender),
    Existing(ExistingLoan),
}

impl FundingSource {
    pub fn direct_subsidized(rates: &RateSchedule) -> Self {
        FundingSource::DirectSubsidized(FederalTerms {
            annual_rate: rates.federal_subsidized_rate,
            origination_fee: rates.federal_origination_fee,
        })
    }

    pub fn direct_unsubsidized(rates: &RateSchedule) -> Self {
        FundingSource::DirectUnsubsidized(FederalTerms {
            annual_rate: rates.federal_unsubsidized_rate,
            origination_fee: rates.federal_origination_fee,
        })
    }

    pub fn parent_plus(rates: &RateSchedule) -> Self {
        FundingSource::ParentPlus(FederalTerms {
            annual_rate: rates.plus_rate,
            origination_fee: rates.plus_origination_fee,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            FundingSource::DirectSubsidized(_) => "Direct Subsidized",
            FundingSource::DirectUnsubsidized(_) => "Direct Unsubsidized",
            FundingSource::ParentPlus(_) => "Parent PLUS",
            FundingSource::Private(lender) => lender.name.as_str(),
            FundingSource::Existing(loan) => loan.name.as_str(),
        }
    }

    pub fn is_existing(&self) -> bool {
        matches!(self, FundingSource::Existing(_))
    }

    /// Yearly borrowing ceiling; `None` means unlimited.
    pub fn limit(&self, year: u32, profile: &BorrowerProfile) -> Option<f64> {
        match self {
            FundingSource::DirectSubsidized(_) => {
                if profile.subsidized_loan_eligible {
                    Some(3_500.0 + f64::from(year.min(2)) * 1_000.0)
                } else {
                    Some(0.0)
                }
            }
            FundingSource::DirectUnsubsidized(_) => Some(UNSUBSIDIZED_ANNUAL_LIMIT),
            FundingSource::ParentPlus(_) => None,
            FundingSource::Private(lender) => lender.annual_limit,
            FundingSource::Existing(loan) => Some(if year == 0 { loan.balance } else { 0.0 }),
        }
    }

    /// `(m, b)` such that the principal at graduation of a draw in `year` is `m * borrow + b`.
    pub fn principal_coefficients(&self, year: u32, profile: &BorrowerProfile) -> (f64, f64) {
        let months_to_graduation = profile.years_to_graduation.saturating_sub(year) * 12;
        let accrue = |annual_rate: f64| (1.0 + annual_rate / 12.0).powi(months_to_graduation as i32);
        match self {
            FundingSource::DirectSubsidized(terms) => (1.0 + terms.origination_fee, 0.0),
            FundingSource::DirectUnsubsidized(terms) | FundingSource::ParentPlus(terms) => (
                (1.0 + terms.origination_fee) * accrue(terms.annual_rate),
                0.0,
            ),
            FundingSource::Private(lender) => (
                (1.0 + lender.origination_fee) * accrue(lender.annual_rate),
                lender.flat_fee,
            ),
            FundingSource::Existing(loan) => {
                if loan.subsidized {
                    (1.0, 0.0)
                } else {
                    (accrue(loan.plan.annual_rate()), 0.0)
                }
            }
        }
    }

    pub fn principal(&self, borrowed: f64, year: u32, profile: &BorrowerProfile) -> f64 {
        if borrowed <= 0.0 {
            return 0.0;
        }
        let (m, b) = self.principal_coefficients(year, profile);
        m * borrowed + b
    }

    pub fn offered_plans(&self) -> Vec<RepaymentPlan> {
        match self {
            FundingSource::DirectSubsidized(terms) | FundingSource::DirectUnsubsidized(terms) => {
                federal_plans(terms.annual_rate)
            }
            FundingSource::ParentPlus(terms) => {
                vec![RepaymentPlan::standard(terms.annual_rate, STANDARD_TERM_YEARS)]
            }
            FundingSource::Private(lender) => lender
                .terms
                .iter()
                .map(|term| RepaymentPlan::standard(lender.annual_rate, *term))
                .collect(),
            FundingSource::Existing(loan) => vec![loan.plan],
        }
    }

    /// Plans the optimizer may choose from, limited to the borrower's payoff horizon.
    pub fn plan_options(&self, profile: &BorrowerProfile) -> Vec<RepaymentPlan> {
        let offered = self.offered_plans();
        if self.is_existing() {
            return offered;
        }
        offered
            .into_iter()
            .filter(|plan| {
                let term = plan.term_years();
                term > 0 && term >= profile.payoff_min_years && term <= profile.payoff_max_years
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        match self {
            FundingSource::DirectSubsidized(terms)
            | FundingSource::DirectUnsubsidized(terms)
            | FundingSource::ParentPlus(terms) => {
                validate_rate("sources.rate", terms.annual_rate)?;
                validate_rate("sources.origination_fee", terms.origination_fee)
            }
            FundingSource::Private(lender) => {
                if lender.name.trim().is_empty() {
                    return Err(PlanError::invalid("sources.name", "must not be empty"));
                }
                validate_rate("sources.rate", lender.annual_rate)?;
                validate_rate("sources.origination_fee", lender.origination_fee)?;
                if !lender.flat_fee.is_finite() || lender.flat_fee < 0.0 {
                    return Err(PlanError::invalid("sources.flat_fee", "must be >= 0"));
                }
                if let Some(limit) = lender.annual_limit {
                    if !limit.is_finite() || limit < 0.0 {
                        return Err(PlanError::invalid("sources.annual_limit", "must be >= 0"));
                    }
                }
                if lender.terms.is_empty() {
                    return Err(PlanError::invalid(
                        "sources.terms",
                        format!("{}: at least one term is required", lender.name),
                    ));
                }
                Ok(())
            }
            FundingSource::Existing(loan) => loan.validate(),
        }
    }
}

/// Subsidized, unsubsidized and Parent PLUS loans at the given rates.
pub fn federal_sources(rates: &RateSchedule) -> Vec<FundingSource> {
    vec![
        FundingSource::direct_subsidized(rates),
        FundingSource::direct_unsubsidized(rates),
        FundingSource::parent_plus(rates),
    ]
}

fn federal_plans(annual_rate: f64) -> Vec<RepaymentPlan> {
    vec![
        RepaymentPlan::standard(annual_rate, STANDARD_TERM_YEARS),
        RepaymentPlan::graduated(annual_rate),
        RepaymentPlan::extended(annual_rate),
        RepaymentPlan::repaye(annual_rate),
        RepaymentPlan::icr(annual_rate),
    ]
}

fn validate_rate(field: &str, value: f64) -> Result<(), PlanError> {
    if !value.is_finite() || value < 0.0 {
        return Err(PlanError::invalid(field, "must be a finite rate >= 0"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plans::PlanKind;

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn profile() -> BorrowerProfile {
        BorrowerProfile {
            years_to_graduation: 4,
            ..BorrowerProfile::default()
        }
    }

    #[test]
    fn subsidized_limit_steps_up_then_plateaus() {
        let source = FundingSource::direct_subsidized(&RateSchedule::default());
        let profile = profile();
        let limits: Vec<_> = (0..4).map(|year| source.limit(year, &profile)).collect();
        assert_eq!(
            limits,
            vec![Some(3_500.0), Some(4_500.0), Some(5_500.0), Some(5_500.0)]
        );
    }

    #[test]
    fn subsidized_limit_is_zero_when_ineligible() {
        let source = FundingSource::direct_subsidized(&RateSchedule::default());
        let profile = BorrowerProfile {
            subsidized_loan_eligible: false,
            ..profile()
        };
        assert_eq!(source.limit(1, &profile), Some(0.0));
    }

    #[test]
    fn subsidized_principal_only_adds_fee() {
        let rates = RateSchedule::default();
        let source = FundingSource::direct_subsidized(&rates);
        assert_approx(
            source.principal(1_000.0, 0, &profile()),
            1_000.0 * (1.0 + rates.federal_origination_fee),
        );
    }

    #[test]
    fn unsubsidized_principal_accrues_until_graduation() {
        let rates = RateSchedule::default();
        let source = FundingSource::direct_unsubsidized(&rates);
        let profile = profile();
        let monthly = rates.federal_unsubsidized_rate / 12.0;
        let expected = 1_000.0 * (1.0 + rates.federal_origination_fee) * (1.0 + monthly).powi(36);
        assert_approx(source.principal(1_000.0, 1, &profile), expected);
        assert_eq!(source.limit(3, &profile), Some(UNSUBSIDIZED_ANNUAL_LIMIT));
    }

    #[test]
    fn parent_plus_is_unlimited_with_single_standard_plan() {
        let rates = RateSchedule::default();
        let source = FundingSource::parent_plus(&rates);
        assert_eq!(source.limit(0, &profile()), None);
        let plans = source.plan_options(&profile());
        assert_eq!(plans, vec![RepaymentPlan::standard(rates.plus_rate, 10)]);
    }

    #[test]
    fn federal_family_offers_standard_graduated_extended_and_idr() {
        let source = FundingSource::direct_subsidized(&RateSchedule::default());
        let kinds: Vec<_> = source
            .plan_options(&profile())
            .iter()
            .map(|plan| plan.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                PlanKind::Standard,
                PlanKind::Graduated,
                PlanKind::Extended,
                PlanKind::Repaye,
                PlanKind::Icr
            ]
        );
    }

    #[test]
    fn plan_options_respect_payoff_horizon() {
        let source = FundingSource::direct_unsubsidized(&RateSchedule::default());
        let profile = BorrowerProfile {
            payoff_min_years: 15,
            payoff_max_years: 22,
            ..profile()
        };
        let terms: Vec<_> = source
            .plan_options(&profile)
            .iter()
            .map(|plan| plan.term_years())
            .collect();
        assert_eq!(terms, vec![20]);
    }

    #[test]
    fn zero_terms_are_never_offered() {
        let lender = PrivateLender::new("Bank", 0.05).with_terms(vec![0, 5]);
        let source = FundingSource::Private(lender);
        let terms: Vec<_> = source
            .plan_options(&profile())
            .iter()
            .map(|plan| plan.term_years())
            .collect();
        assert_eq!(terms, vec![5]);
    }

    #[test]
    fn private_flat_fee_only_applies_when_drawn() {
        let lender = PrivateLender::new("Bank", 0.06)
            .with_origination_fee(0.02)
            .with_flat_fee(150.0)
            .with_annual_limit(8_000.0);
        let source = FundingSource::Private(lender);
        let profile = profile();
        assert_eq!(source.name(), "Bank");
        assert_eq!(source.limit(2, &profile), Some(8_000.0));
        assert_approx(source.principal(0.0, 0, &profile), 0.0);

        let (m, b) = source.principal_coefficients(3, &profile);
        assert_approx(b, 150.0);
        assert_approx(m, 1.02 * (1.0 + 0.005f64).powi(12));
        assert_approx(source.principal(1_000.0, 3, &profile), m * 1_000.0 + 150.0);
    }

    #[test]
    fn private_lender_defaults_to_twenty_year_standard() {
        let source = FundingSource::Private(PrivateLender::new("Bank", 0.07));
        assert_eq!(
            source.plan_options(&profile()),
            vec![RepaymentPlan::standard(0.07, DEFAULT_PRIVATE_TERM_YEARS)]
        );
    }

    #[test]
    fn existing_loan_is_locked_to_year_zero() {
        let loan = ExistingLoan {
            name: "Car".to_string(),
            balance: 5_000.0,
            plan: RepaymentPlan::standard(0.05, 40),
            subsidized: true,
        };
        let source = FundingSource::Existing(loan);
        let profile = profile();
        assert!(source.is_existing());
        assert_eq!(source.limit(0, &profile), Some(5_000.0));
        assert_eq!(source.limit(1, &profile), Some(0.0));
        assert_approx(source.principal(5_000.0, 0, &profile), 5_000.0);
        // Existing plans bypass the payoff horizon filter.
        assert_eq!(source.plan_options(&profile).len(), 1);
    }

    #[test]
    fn unsubsidized_existing_loan_compounds_to_graduation() {
        let loan = ExistingLoan {
            name: "Old".to_string(),
            balance: 5_000.0,
            plan: RepaymentPlan::standard(0.06, 10),
            subsidized: false,
        };
        let source = FundingSource::Existing(loan);
        assert_approx(
            source.principal(5_000.0, 0, &profile()),
            5_000.0 * 1.005f64.powi(48),
        );
    }

    #[test]
    fn private_lender_validation_rejects_bad_inputs() {
        let empty_terms = FundingSource::Private(PrivateLender::new("Bank", 0.05).with_terms(vec![]));
        assert!(empty_terms.validate().is_err());
        let negative = FundingSource::Private(PrivateLender::new("Bank", -0.01));
        assert!(negative.validate().is_err());
        let unnamed = FundingSource::Private(PrivateLender::new(" ", 0.05));
        assert!(unnamed.validate().is_err());
    }
}
