use super::error::PlanError;
use super::sources::ExistingLoan;

pub const DEFAULT_POVERTY_GUIDELINE: f64 = 13_850.0;
pub const DEFAULT_POVERTY_MULTIPLIER: f64 = 1.5;

#[derive(Debug, Clone)]
pub struct BorrowerProfile {
    pub family_income: f64,
    pub subsidized_loan_eligible: bool,
    pub starting_income: f64,
    pub annual_personal_contribution: f64,
    pub annual_attendance_cost: f64,
    pub years_to_graduation: u32,
    pub income_growth_rate: f64,
    pub discretionary_fraction: f64,
    pub min_dti: f64,
    pub max_dti: f64,
    pub payoff_min_years: u32,
    pub payoff_max_years: u32,
    pub minimum_payment_only: bool,
    pub existing_loans: Vec<ExistingLoan>,
}

impl Default for BorrowerProfile {
    fn default() -> Self {
        Self {
            family_income: 0.0,
            subsidized_loan_eligible: true,
            starting_income: 40_000.0,
            annual_personal_contribution: 10_000.0,
            annual_attendance_cost: 20_000.0,
            years_to_graduation: 4,
            income_growth_rate: 0.03,
            discretionary_fraction: 0.10,
            min_dti: 0.0,
            max_dti: 1.0,
            payoff_min_years: 0,
            payoff_max_years: 30,
            minimum_payment_only: false,
            existing_loans: Vec::new(),
        }
    }
}

impl BorrowerProfile {
    /// Yearly borrowing need, one entry per enrollment year.
    pub fn borrowed_amounts(&self) -> Vec<f64> {
        let need = self.annual_attendance_cost - self.annual_personal_contribution;
        vec![need; self.years_to_graduation as usize]
    }

    pub fn income_at_year(&self, year: u32) -> f64 {
        self.starting_income * (1.0 + self.income_growth_rate).powi(year as i32)
    }

    pub fn discretionary_income(&self, year: u32, poverty: &PovertyGuideline) -> f64 {
        (self.income_at_year(year) - poverty.threshold()).max(0.0)
    }

    /// Monthly debt-service ceiling for a repayment month (0-indexed after graduation).
    pub fn monthly_debt_service_cap(&self, month: u32) -> f64 {
        self.max_dti * self.income_at_year(month / 12) / 12.0
    }

    pub fn needs_borrowing(&self) -> bool {
        self.borrowed_amounts().iter().any(|need| *need > 0.0) || !self.existing_loans.is_empty()
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        for (field, value) in [
            ("family_income", self.family_income),
            ("starting_income", self.starting_income),
            ("annual_personal_contribution", self.annual_personal_contribution),
            ("annual_attendance_cost", self.annual_attendance_cost),
            ("income_growth_rate", self.income_growth_rate),
            ("discretionary_fraction", self.discretionary_fraction),
            ("min_dti", self.min_dti),
            ("max_dti", self.max_dti),
        ] {
            if !value.is_finite() {
                return Err(PlanError::invalid(field, "must be finite"));
            }
        }

        if self.starting_income < 0.0 {
            return Err(PlanError::invalid("starting_income", "must be >= 0"));
        }
        if self.years_to_graduation == 0 {
            return Err(PlanError::invalid("years_to_graduation", "must be >= 1"));
        }
        if self.income_growth_rate <= -1.0 {
            return Err(PlanError::invalid("income_growth_rate", "must be > -100%"));
        }
        if !(0.0..=1.0).contains(&self.discretionary_fraction) {
            return Err(PlanError::invalid(
                "discretionary_fraction",
                "must be between 0 and 1",
            ));
        }
        if self.annual_attendance_cost < self.annual_personal_contribution {
            return Err(PlanError::invalid(
                "annual_attendance_cost",
                "borrowing need must be non-negative (cost of attendance below contribution)",
            ));
        }
        if self.min_dti < 0.0 || self.max_dti < 0.0 {
            return Err(PlanError::invalid("max_dti", "DTI bounds must be >= 0"));
        }
        if self.min_dti > self.max_dti {
            return Err(PlanError::invalid("min_dti", "must not exceed max_dti"));
        }
        if self.payoff_min_years > self.payoff_max_years {
            return Err(PlanError::invalid(
                "payoff_min_years",
                "must not exceed payoff_max_years",
            ));
        }
        for loan in &self.existing_loans {
            loan.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PovertyGuideline {
    pub guideline: f64,
    pub multiplier: f64,
}

impl Default for PovertyGuideline {
    fn default() -> Self {
        Self {
            guideline: DEFAULT_POVERTY_GUIDELINE,
            multiplier: DEFAULT_POVERTY_MULTIPLIER,
        }
    }
}

impl PovertyGuideline {
    pub fn threshold(&self) -> f64 {
        self.guideline * self.multiplier
    }
}

/// Federal rates and fees used when building the built-in funding sources.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSchedule {
    pub federal_subsidized_rate: f64,
    pub federal_unsubsidized_rate: f64,
    pub federal_origination_fee: f64,
    pub plus_rate: f64,
    pub plus_origination_fee: f64,
}

impl Default for RateSchedule {
    fn default() -> Self {
        Self {
            federal_subsidized_rate: 0.0653,
            federal_unsubsidized_rate: 0.0653,
            federal_origination_fee: 0.01057,
            plus_rate: 0.0894,
            plus_origination_fee: 0.04228,
        }
    }
}

/// Wall-clock budget per solve; the best plan found by then is accepted.
pub const DEFAULT_TIME_LIMIT_SECS: f64 = 60.0;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SolverBackend {
    Auto,
    Highs,
    MicroLp,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResolvedBackend {
    Highs,
    MicroLp,
}

impl ResolvedBackend {
    pub fn name(self) -> &'static str {
        match self {
            ResolvedBackend::Highs => "highs",
            ResolvedBackend::MicroLp => "microlp",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SolverSettings {
    pub backend: SolverBackend,
    pub time_limit_secs: Option<f64>,
    pub mip_rel_gap: f64,
    pub heuristic_effort: f64,
    pub big_m: Option<f64>,
    pub allocation_threshold: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            backend: SolverBackend::Auto,
            time_limit_secs: Some(DEFAULT_TIME_LIMIT_SECS),
            mip_rel_gap: 1e-4,
            heuristic_effort: 0.5,
            big_m: None,
            allocation_threshold: 1e-3,
        }
    }
}

impl SolverSettings {
    pub fn resolve_backend(&self) -> Result<ResolvedBackend, PlanError> {
        match self.backend {
            SolverBackend::Auto if cfg!(feature = "highs") => Ok(ResolvedBackend::Highs),
            SolverBackend::Auto => Ok(ResolvedBackend::MicroLp),
            SolverBackend::Highs if cfg!(feature = "highs") => Ok(ResolvedBackend::Highs),
            SolverBackend::Highs => Err(PlanError::BackendUnavailable("highs")),
            SolverBackend::MicroLp => Ok(ResolvedBackend::MicroLp),
        }
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        if let Some(limit) = self.time_limit_secs {
            if !limit.is_finite() || limit <= 0.0 {
                return Err(PlanError::invalid("time_limit_secs", "must be > 0"));
            }
        }
        if !(0.0..1.0).contains(&self.mip_rel_gap) {
            return Err(PlanError::invalid("mip_rel_gap", "must be in [0, 1)"));
        }
        if !(0.0..=1.0).contains(&self.heuristic_effort) {
            return Err(PlanError::invalid(
                "heuristic_effort",
                "must be between 0 and 1",
            ));
        }
        if let Some(big_m) = self.big_m {
            if !big_m.is_finite() || big_m <= 0.0 {
                return Err(PlanError::invalid("big_m", "must be > 0"));
            }
        }
        if !self.allocation_threshold.is_finite() || self.allocation_threshold < 0.0 {
            return Err(PlanError::invalid("allocation_threshold", "must be >= 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    pub rates: RateSchedule,
    pub poverty: PovertyGuideline,
    pub solver: SolverSettings,
}
