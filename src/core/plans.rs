use std::fmt;

use super::error::PlanError;
use super::schedule::{self, ScheduleRow};
use super::types::{BorrowerProfile, PovertyGuideline};

pub const STANDARD_TERM_YEARS: u32 = 10;
pub const GRADUATED_TERM_YEARS: u32 = 10;
pub const GRADUATED_STEP_YEARS: u32 = 2;
pub const GRADUATED_ALPHA: f64 = 1.5;
pub const EXTENDED_TERM_YEARS: u32 = 25;
pub const IDR_TERM_YEARS: u32 = 20;
pub const ICR_TERM_YEARS: u32 = 25;
pub const ICR_CAP_TERM_YEARS: u32 = 12;
pub const SAVE_DISCRETIONARY_FRACTION: f64 = 0.05;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum PlanKind {
    Standard,
    Graduated,
    Extended,
    Paye,
    Repaye,
    Save,
    Icr,
}

impl PlanKind {
    pub fn label(self) -> &'static str {
        match self {
            PlanKind::Standard => "Standard",
            PlanKind::Graduated => "Graduated",
            PlanKind::Extended => "Extended",
            PlanKind::Paye => "PAYE",
            PlanKind::Repaye => "REPAYE",
            PlanKind::Save => "SAVE",
            PlanKind::Icr => "ICR",
        }
    }

    pub fn is_income_driven(self) -> bool {
        matches!(
            self,
            PlanKind::Paye | PlanKind::Repaye | PlanKind::Save | PlanKind::Icr
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IncomeDrivenProgram {
    Paye,
    Repaye,
    Save,
    Icr,
}

/// Value identity of a repayment plan: two plans with equal keys are interchangeable.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PlanKey {
    pub kind: PlanKind,
    rate_bits: u64,
    pub term_years: u32,
}

impl PlanKey {
    pub fn annual_rate(&self) -> f64 {
        f64::from_bits(self.rate_bits)
    }
}

impl fmt::Display for PlanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}",
            self.kind.label(),
            self.annual_rate(),
            self.term_years
        )
    }
}

/// Affine minimum-payment rule for one repayment month: `slope * principal + intercept`,
/// optionally capped at `balance_cap * principal`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PaymentRule {
    pub slope: f64,
    pub intercept: f64,
    pub balance_cap: Option<f64>,
}

impl PaymentRule {
    pub fn apply(&self, principal: f64) -> f64 {
        let affine = self.slope * principal + self.intercept;
        match self.balance_cap {
            Some(cap) => affine.min(cap * principal),
            None => affine,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RepaymentPlan {
    Standard {
        annual_rate: f64,
        term_years: u32,
    },
    Graduated {
        annual_rate: f64,
        term_years: u32,
        step_years: u32,
        alpha: f64,
    },
    Extended {
        annual_rate: f64,
        term_years: u32,
    },
    IncomeDriven {
        program: IncomeDrivenProgram,
        annual_rate: f64,
        term_years: u32,
    },
}

impl RepaymentPlan {
    pub fn standard(annual_rate: f64, term_years: u32) -> Self {
        RepaymentPlan::Standard {
            annual_rate,
            term_years,
        }
    }

    pub fn graduated(annual_rate: f64) -> Self {
        RepaymentPlan::Graduated {
            annual_rate,
            term_years: GRADUATED_TERM_YEARS,
            step_years: GRADUATED_STEP_YEARS,
            alpha: GRADUATED_ALPHA,
        }
    }

    pub fn extended(annual_rate: f64) -> Self {
        RepaymentPlan::Extended {
            annual_rate,
            term_years: EXTENDED_TERM_YEARS,
        }
    }

    pub fn paye(annual_rate: f64) -> Self {
        Self::income_driven(IncomeDrivenProgram::Paye, annual_rate, IDR_TERM_YEARS)
    }

    pub fn repaye(annual_rate: f64) -> Self {
        Self::income_driven(IncomeDrivenProgram::Repaye, annual_rate, IDR_TERM_YEARS)
    }

    pub fn save(annual_rate: f64) -> Self {
        Self::income_driven(IncomeDrivenProgram::Save, annual_rate, IDR_TERM_YEARS)
    }

    pub fn icr(annual_rate: f64) -> Self {
        Self::income_driven(IncomeDrivenProgram::Icr, annual_rate, ICR_TERM_YEARS)
    }

    pub fn income_driven(program: IncomeDrivenProgram, annual_rate: f64, term_years: u32) -> Self {
        RepaymentPlan::IncomeDriven {
            program,
            annual_rate,
            term_years,
        }
    }

    pub fn kind(&self) -> PlanKind {
        match self {
            RepaymentPlan::Standard { .. } => PlanKind::Standard,
            RepaymentPlan::Graduated { .. } => PlanKind::Graduated,
            RepaymentPlan::Extended { .. } => PlanKind::Extended,
            RepaymentPlan::IncomeDriven { program, .. } => match program {
                IncomeDrivenProgram::Paye => PlanKind::Paye,
                IncomeDrivenProgram::Repaye => PlanKind::Repaye,
                IncomeDrivenProgram::Save => PlanKind::Save,
                IncomeDrivenProgram::Icr => PlanKind::Icr,
            },
        }
    }

    pub fn annual_rate(&self) -> f64 {
        match *self {
            RepaymentPlan::Standard { annual_rate, .. }
            | RepaymentPlan::Graduated { annual_rate, .. }
            | RepaymentPlan::Extended { annual_rate, .. }
            | RepaymentPlan::IncomeDriven { annual_rate, .. } => annual_rate,
        }
    }

    pub fn term_years(&self) -> u32 {
        match *self {
            RepaymentPlan::Standard { term_years, .. }
            | RepaymentPlan::Graduated { term_years, .. }
            | RepaymentPlan::Extended { term_years, .. }
            | RepaymentPlan::IncomeDriven { term_years, .. } => term_years,
        }
    }

    pub fn monthly_rate(&self) -> f64 {
        self.annual_rate() / 12.0
    }

    pub fn term_months(&self) -> u32 {
        self.term_years() * 12
    }

    pub fn key(&self) -> PlanKey {
        PlanKey {
            kind: self.kind(),
            rate_bits: self.annual_rate().to_bits(),
            term_years: self.term_years(),
        }
    }

    pub fn loan_terms(&self) -> String {
        self.key().to_string()
    }

    /// Minimum-payment rule for repayment month `month` (0 = first month after graduation).
    ///
    /// Income-driven plans pay a share of discretionary income. SAVE uses its fixed 5%. PAYE,
    /// REPAYE and ICR all use `profile.discretionary_fraction`, so ICR here does not apply the
    /// federal program's 20% share unless the profile asks for it. ICR also carries the 12-year
    /// standard payment as a cap on that share.
    pub fn payment_rule(
        &self,
        month: u32,
        profile: &BorrowerProfile,
        poverty: &PovertyGuideline,
    ) -> PaymentRule {
        let r = self.monthly_rate();
        match *self {
            RepaymentPlan::Standard { term_years, .. }
            | RepaymentPlan::Extended { term_years, .. } => PaymentRule {
                slope: annuity_factor(r, term_years * 12),
                intercept: 0.0,
                balance_cap: None,
            },
            RepaymentPlan::Graduated {
                term_years,
                step_years,
                alpha,
                ..
            } => PaymentRule {
                slope: graduated_factor(r, term_years * 12, step_years * 12, alpha, month),
                intercept: 0.0,
                balance_cap: None,
            },
            RepaymentPlan::IncomeDriven { program, .. } => {
                let fraction = match program {
                    IncomeDrivenProgram::Save => SAVE_DISCRETIONARY_FRACTION,
                    _ => profile.discretionary_fraction,
                };
                let share = fraction * profile.discretionary_income(month / 12, poverty) / 12.0;
                let balance_cap = match program {
                    IncomeDrivenProgram::Icr => Some(annuity_factor(r, ICR_CAP_TERM_YEARS * 12)),
                    _ => None,
                };
                PaymentRule {
                    slope: 0.0,
                    intercept: share.max(0.0),
                    balance_cap,
                }
            }
        }
    }

    pub fn minimum_payment(
        &self,
        month: u32,
        principal: f64,
        profile: &BorrowerProfile,
        poverty: &PovertyGuideline,
    ) -> f64 {
        self.payment_rule(month, profile, poverty).apply(principal)
    }

    pub fn replay(&self, principal: f64, trace: &[f64]) -> Vec<ScheduleRow> {
        schedule::replay(self.annual_rate(), principal, trace)
    }

    pub fn ensure_same_terms(&self, other: &RepaymentPlan) -> Result<(), PlanError> {
        let (left, right) = (self.key(), other.key());
        if left == right {
            Ok(())
        } else {
            Err(PlanError::incompatible(&left, &right))
        }
    }
}

/// Level payment per unit of principal that amortizes it over `months` at monthly rate `r`.
pub fn annuity_factor(r: f64, months: u32) -> f64 {
    if months == 0 {
        return 0.0;
    }
    if r == 0.0 {
        return 1.0 / months as f64;
    }
    let growth = (1.0 + r).powi(months as i32);
    r * growth / (growth - 1.0)
}

fn graduated_factor(r: f64, months: u32, step_months: u32, alpha: f64, month: u32) -> f64 {
    if months == 0 {
        return 0.0;
    }
    let step_months = step_months.max(1);
    let present_value: f64 = (0..months)
        .map(|k| alpha.powi((k / step_months) as i32) / (1.0 + r).powi(k as i32 + 1))
        .sum();
    if present_value <= 0.0 {
        return 0.0;
    }
    alpha.powi((month / step_months) as i32) / present_value
}
