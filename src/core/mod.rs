mod engine;
mod error;
mod greedy;
mod plans;
mod schedule;
mod solver;
mod sources;
mod types;

pub use engine::{CombinedMonth, LoanSummary, PlanOutcome, PlanReport, YearAllocation, plan_loans};
pub use error::PlanError;
pub use plans::{IncomeDrivenProgram, PaymentRule, PlanKey, PlanKind, RepaymentPlan, annuity_factor};
pub use schedule::{PAID_OFF_EPS, ScheduleRow, replay};
pub use solver::{Borrowing, LoanKey, OptimizedPlan, optimize};
pub use sources::{
    ExistingLoan, FederalTerms, FundingSource, PrivateLender, federal_sources,
};
pub use types::{
    BorrowerProfile, EngineConfig, PovertyGuideline, RateSchedule, ResolvedBackend, SolverBackend,
    SolverSettings,
};
