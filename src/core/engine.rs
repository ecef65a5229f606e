use std::collections::BTreeMap;

use tracing::info;

use super::error::PlanError;
use super::plans::RepaymentPlan;
use super::schedule::{self, ScheduleRow};
use super::solver::{Borrowing, LoanKey, OptimizedPlan, optimize};
use super::sources::FundingSource;
use super::types::{BorrowerProfile, EngineConfig, ResolvedBackend};

#[derive(Debug, Clone)]
pub enum PlanOutcome {
    NothingToBorrow,
    Infeasible,
    Planned(PlanReport),
}

#[derive(Debug, Clone)]
pub struct YearAllocation {
    pub year: u32,
    pub need: f64,
    pub borrowings: Vec<Borrowing>,
}

#[derive(Debug, Clone)]
pub struct LoanSummary {
    pub source: String,
    pub plan: RepaymentPlan,
    pub loan_terms: String,
    pub borrowed: f64,
    pub principal_at_graduation: f64,
    pub first_payment: f64,
    pub total_paid: f64,
    pub total_interest: f64,
    pub months_to_payoff: u32,
    pub schedule: Vec<ScheduleRow>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CombinedMonth {
    pub month: u32,
    pub payment: f64,
    pub interest_paid: f64,
    pub principal_paid: f64,
}

#[derive(Debug, Clone)]
pub struct PlanReport {
    pub allocation: Vec<YearAllocation>,
    pub loans: Vec<LoanSummary>,
    pub combined: Vec<CombinedMonth>,
    pub total_borrowed: f64,
    pub total_paid: f64,
    pub total_interest: f64,
    pub peak_dti: f64,
    pub backend: ResolvedBackend,
}

/// Plans borrowing for `profile` across `sources` and replays every selected loan.
pub fn plan_loans(
    profile: &BorrowerProfile,
    sources: &[FundingSource],
    config: &EngineConfig,
) -> Result<PlanOutcome, PlanError> {
    profile.validate()?;
    config.solver.validate()?;

    if !profile.needs_borrowing() {
        info!("borrowing need is zero; nothing to plan");
        return Ok(PlanOutcome::NothingToBorrow);
    }

    match optimize(profile, sources, config)? {
        Some(optimized) => Ok(PlanOutcome::Planned(build_report(profile, &optimized)?)),
        None => Ok(PlanOutcome::Infeasible),
    }
}

/// Borrowings that share a source and plan, folded into one loan.
#[derive(Debug, Clone)]
struct LoanGroup {
    key: LoanKey,
    plan: RepaymentPlan,
    borrowed: f64,
}

impl LoanGroup {
    fn start(borrowing: &Borrowing) -> Self {
        Self {
            key: borrowing.key(),
            plan: borrowing.plan,
            borrowed: borrowing.amount,
        }
    }

    fn absorb(&mut self, borrowing: &Borrowing) -> Result<(), PlanError> {
        self.plan.ensure_same_terms(&borrowing.plan)?;
        self.borrowed += borrowing.amount;
        Ok(())
    }
}

fn group_borrowings(
    allocation: &BTreeMap<u32, Vec<Borrowing>>,
) -> Result<Vec<LoanGroup>, PlanError> {
    let mut groups: BTreeMap<LoanKey, LoanGroup> = BTreeMap::new();
    for borrowing in allocation.values().flatten() {
        match groups.get_mut(&borrowing.key()) {
            Some(group) => group.absorb(borrowing)?,
            None => {
                groups.insert(borrowing.key(), LoanGroup::start(borrowing));
            }
        }
    }
    Ok(groups.into_values().collect())
}

struct MonthlyAccumulator {
    months: Vec<CombinedMonth>,
}

impl MonthlyAccumulator {
    fn new() -> Self {
        Self { months: Vec::new() }
    }

    fn push(&mut self, rows: &[ScheduleRow]) {
        for row in rows {
            let idx = row.month as usize;
            while self.months.len() <= idx {
                let month = self.months.len() as u32;
                self.months.push(CombinedMonth {
                    month,
                    payment: 0.0,
                    interest_paid: 0.0,
                    principal_paid: 0.0,
                });
            }
            let slot = &mut self.months[idx];
            slot.payment += row.payment;
            slot.interest_paid += row.interest_paid;
            slot.principal_paid += row.principal_paid;
        }
    }

    fn into_months(self) -> Vec<CombinedMonth> {
        self.months
    }
}

fn build_report(
    profile: &BorrowerProfile,
    optimized: &OptimizedPlan,
) -> Result<PlanReport, PlanError> {
    let needs = profile.borrowed_amounts();
    let allocation = optimized
        .allocation
        .iter()
        .map(|(year, borrowings)| YearAllocation {
            year: *year,
            need: needs.get(*year as usize).copied().unwrap_or(0.0),
            borrowings: borrowings.clone(),
        })
        .collect();

    let mut loans = Vec::new();
    let mut acc = MonthlyAccumulator::new();
    for group in group_borrowings(&optimized.allocation)? {
        let principal = optimized
            .principals
            .get(&group.key)
            .copied()
            .unwrap_or(0.0);
        let trace = optimized
            .traces
            .get(&group.key)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let rows = group.plan.replay(principal, trace);
        acc.push(&rows);

        loans.push(LoanSummary {
            source: group.key.source.clone(),
            loan_terms: group.plan.loan_terms(),
            plan: group.plan,
            borrowed: group.borrowed,
            principal_at_graduation: principal,
            first_payment: rows.first().map(|row| row.payment).unwrap_or(0.0),
            total_paid: schedule::total_paid(&rows),
            total_interest: schedule::total_interest(&rows),
            months_to_payoff: rows.len() as u32,
            schedule: rows,
        });
    }

    let combined = acc.into_months();
    let peak_dti = combined
        .iter()
        .filter_map(|month| {
            let income = profile.income_at_year(month.month / 12) / 12.0;
            (income > 0.0).then(|| month.payment / income)
        })
        .fold(0.0, f64::max);

    let report = PlanReport {
        allocation,
        total_borrowed: loans.iter().map(|loan| loan.borrowed).sum(),
        total_paid: loans.iter().map(|loan| loan.total_paid).sum(),
        total_interest: loans.iter().map(|loan| loan.total_interest).sum(),
        loans,
        combined,
        peak_dti,
        backend: optimized.backend,
    };
    info!(
        loans = report.loans.len(),
        total_borrowed = report.total_borrowed,
        total_paid = report.total_paid,
        peak_dti = report.peak_dti,
        "built repayment report"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sources::{PrivateLender, federal_sources};
    use crate::core::types::{RateSchedule, SolverBackend, SolverSettings};

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual} (tol {tol})"
        );
    }

    fn config() -> EngineConfig {
        EngineConfig {
            solver: SolverSettings {
                backend: SolverBackend::MicroLp,
                ..SolverSettings::default()
            },
            ..EngineConfig::default()
        }
    }

    fn borrower() -> BorrowerProfile {
        BorrowerProfile {
            starting_income: 60_000.0,
            annual_personal_contribution: 1_000.0,
            annual_attendance_cost: 6_000.0,
            years_to_graduation: 2,
            income_growth_rate: 0.0,
            minimum_payment_only: true,
            ..BorrowerProfile::default()
        }
    }

    fn bank() -> FundingSource {
        FundingSource::Private(PrivateLender::new("Bank", 0.05).with_terms(vec![2]))
    }

    #[test]
    fn covered_costs_need_no_borrowing() {
        let profile = BorrowerProfile {
            annual_personal_contribution: 6_000.0,
            ..borrower()
        };
        let outcome = plan_loans(&profile, &[bank()], &config()).expect("valid inputs");
        assert!(matches!(outcome, PlanOutcome::NothingToBorrow));
    }

    #[test]
    fn invalid_profile_is_reported_before_solving() {
        let profile = BorrowerProfile {
            max_dti: -0.1,
            ..borrower()
        };
        let err = plan_loans(&profile, &[bank()], &config()).expect_err("negative DTI");
        assert!(matches!(err, PlanError::InvalidInput { .. }));
    }

    #[test]
    fn unaffordable_plan_is_infeasible_outcome() {
        let profile = BorrowerProfile {
            max_dti: 0.0,
            ..borrower()
        };
        let outcome = plan_loans(&profile, &[bank()], &config()).expect("valid inputs");
        assert!(matches!(outcome, PlanOutcome::Infeasible));
    }

    #[test]
    fn report_summarizes_replayed_loans() {
        let outcome = plan_loans(&borrower(), &[bank()], &config()).expect("valid inputs");
        let report = match outcome {
            PlanOutcome::Planned(report) => report,
            other => panic!("expected a plan, got {other:?}"),
        };

        assert_eq!(report.allocation.len(), 2);
        for year in &report.allocation {
            assert_approx_tol(year.need, 5_000.0, 1e-9);
            let drawn: f64 = year.borrowings.iter().map(|b| b.amount).sum();
            assert_approx_tol(drawn, year.need, 1e-4);
        }

        assert_eq!(report.loans.len(), 1);
        let loan = &report.loans[0];
        assert_eq!(loan.source, "Bank");
        assert_eq!(loan.loan_terms, "Standard, 0.05, 2");
        assert_approx_tol(loan.borrowed, 10_000.0, 1e-3);
        assert!(loan.principal_at_graduation > loan.borrowed);
        assert!(loan.months_to_payoff <= 24);
        assert_approx_tol(
            loan.total_interest,
            loan.total_paid - loan.principal_at_graduation,
            0.05,
        );

        let expected_first = RepaymentPlan::standard(0.05, 2).minimum_payment(
            0,
            loan.principal_at_graduation,
            &borrower(),
            &EngineConfig::default().poverty,
        );
        assert_approx_tol(loan.first_payment, expected_first, 1e-3);

        assert_eq!(report.combined.len(), loan.schedule.len());
        let combined_paid: f64 = report.combined.iter().map(|m| m.payment).sum();
        assert_approx_tol(combined_paid, report.total_paid, 1e-6);
        assert!(report.peak_dti > 0.0);
        assert!(report.peak_dti <= 1.0 + 1e-9);
    }

    #[test]
    fn borrowings_with_same_terms_are_grouped() {
        let plan = RepaymentPlan::standard(0.05, 10);
        let mut allocation = BTreeMap::new();
        for year in 0..3 {
            allocation.insert(
                year,
                vec![Borrowing {
                    amount: 1_000.0,
                    source: "Bank".to_string(),
                    plan,
                }],
            );
        }
        let groups = group_borrowings(&allocation).expect("same terms");
        assert_eq!(groups.len(), 1);
        assert_approx_tol(groups[0].borrowed, 3_000.0, 1e-9);
    }

    #[test]
    fn default_borrower_plans_with_federal_loans_on_microlp() {
        let profile = BorrowerProfile::default();
        let sources = federal_sources(&RateSchedule::default());
        let config = EngineConfig {
            solver: SolverSettings {
                backend: SolverBackend::MicroLp,
                time_limit_secs: Some(5.0),
                ..SolverSettings::default()
            },
            ..EngineConfig::default()
        };

        let report = match plan_loans(&profile, &sources, &config).expect("valid inputs") {
            PlanOutcome::Planned(report) => report,
            other => panic!("expected a plan, got {other:?}"),
        };

        assert_eq!(report.backend, ResolvedBackend::MicroLp);
        assert_eq!(report.allocation.len(), 4);
        for year in &report.allocation {
            assert_approx_tol(year.need, 10_000.0, 1e-9);
            let drawn: f64 = year.borrowings.iter().map(|b| b.amount).sum();
            assert_approx_tol(drawn, year.need, 1e-2);
        }
        assert!(report.peak_dti <= profile.max_dti + 1e-6);

        let mut sources_used: Vec<&str> = report.loans.iter().map(|l| l.source.as_str()).collect();
        let loans = sources_used.len();
        sources_used.sort_unstable();
        sources_used.dedup();
        assert_eq!(sources_used.len(), loans, "one plan per source");
        for loan in &report.loans {
            assert!(loan.schedule.last().expect("schedule").balance <= schedule::PAID_OFF_EPS);
        }
    }

    #[test]
    fn absorbing_different_terms_is_refused() {
        let first = Borrowing {
            amount: 1_000.0,
            source: "Bank".to_string(),
            plan: RepaymentPlan::standard(0.05, 10),
        };
        let second = Borrowing {
            plan: RepaymentPlan::extended(0.05),
            ..first.clone()
        };
        let mut group = LoanGroup::start(&first);
        let err = group.absorb(&second).expect_err("mismatched plans");
        assert!(matches!(err, PlanError::IncompatiblePlans { .. }));
        assert_approx_tol(group.borrowed, 1_000.0, 1e-9);
    }

    #[test]
    fn accumulator_sums_overlapping_schedules() {
        let mut acc = MonthlyAccumulator::new();
        acc.push(&schedule::replay(0.12, 200.0, &[102.0, 101.0]));
        acc.push(&schedule::replay(0.0, 50.0, &[25.0, 25.0, 25.0]));
        let months = acc.into_months();
        assert_eq!(months.len(), 2);
        assert_approx_tol(months[0].payment, 127.0, 1e-9);
        assert_approx_tol(months[0].interest_paid, 2.0, 1e-9);
        assert_approx_tol(months[1].principal_paid, 100.0 + 25.0, 1e-9);
    }
}
