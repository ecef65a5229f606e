use axum::{
    Router,
    extract::{Json, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::core::{
    BorrowerProfile, CombinedMonth, EngineConfig, ExistingLoan, FundingSource, LoanSummary,
    PlanError, PlanOutcome, PlanReport, PrivateLender, RepaymentPlan, ScheduleRow, SolverBackend,
    YearAllocation, federal_sources, plan_loans,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliBackend {
    Auto,
    Highs,
    Microlp,
}

impl From<CliBackend> for SolverBackend {
    fn from(value: CliBackend) -> Self {
        match value {
            CliBackend::Auto => SolverBackend::Auto,
            CliBackend::Highs => SolverBackend::Highs,
            CliBackend::Microlp => SolverBackend::MicroLp,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "loanplan",
    about = "Student loan planner (yearly borrowing, plan choice and repayment schedule via MILP)"
)]
pub struct Cli {
    #[arg(long, global = true, default_value = "info", help = "Log level or filter; RUST_LOG wins")]
    pub log_level: String,
    #[arg(long, global = true, value_enum, default_value_t = CliBackend::Auto)]
    pub backend: CliBackend,
    #[arg(long, global = true, help = "Wall-clock limit per solve in seconds")]
    pub time_limit_secs: Option<f64>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: IpAddr,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Plan a single request read from a JSON file and print the report.
    Plan {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value_t = false)]
        pretty: bool,
    },
}

impl Cli {
    /// Engine defaults with the CLI solver overrides; an unavailable backend is fatal here.
    pub fn engine_config(&self) -> Result<EngineConfig, PlanError> {
        let mut config = EngineConfig::default();
        config.solver.backend = self.backend.into();
        if let Some(limit) = self.time_limit_secs {
            config.solver.time_limit_secs = Some(limit);
        }
        config.solver.validate()?;
        config.solver.resolve_backend()?;
        Ok(config)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiPlanKind {
    Standard,
    Graduated,
    Extended,
    Paye,
    Repaye,
    Save,
    Icr,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BorrowerPayload {
    family_income: Option<f64>,
    subsidized_eligible: Option<bool>,
    starting_income: Option<f64>,
    annual_contribution: Option<f64>,
    attendance_cost: Option<f64>,
    years_to_graduation: Option<u32>,
    income_growth: Option<f64>,
    discretionary_fraction: Option<f64>,
    min_dti: Option<f64>,
    max_dti: Option<f64>,
    payoff_min_years: Option<u32>,
    payoff_max_years: Option<u32>,
    minimum_payment_only: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
enum SourcePayload {
    DirectSubsidized,
    DirectUnsubsidized,
    ParentPlus,
    #[serde(rename_all = "camelCase")]
    Private {
        name: String,
        rate: f64,
        #[serde(default)]
        origination_fee: f64,
        #[serde(default)]
        flat_fee: f64,
        #[serde(default)]
        annual_limit: Option<f64>,
        #[serde(default)]
        terms: Option<Vec<u32>>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExistingLoanPayload {
    name: String,
    balance: f64,
    plan: ApiPlanKind,
    rate: f64,
    #[serde(default)]
    term_years: Option<u32>,
    #[serde(default)]
    subsidized: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RatesPayload {
    federal_subsidized_rate: Option<f64>,
    federal_unsubsidized_rate: Option<f64>,
    federal_origination_fee: Option<f64>,
    plus_rate: Option<f64>,
    plus_origination_fee: Option<f64>,
    poverty_guideline: Option<f64>,
    poverty_multiplier: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SolverPayload {
    time_limit_secs: Option<f64>,
    mip_gap: Option<f64>,
    big_m: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PlanPayload {
    borrower: BorrowerPayload,
    sources: Option<Vec<SourcePayload>>,
    existing_loans: Vec<ExistingLoanPayload>,
    rates: RatesPayload,
    solver: SolverPayload,
}

/// Borrower settings in user-facing units (rates and ratios in percent).
#[derive(Debug, Clone)]
struct BorrowerArgs {
    family_income: f64,
    subsidized_eligible: bool,
    starting_income: f64,
    annual_contribution: f64,
    attendance_cost: f64,
    years_to_graduation: u32,
    income_growth: f64,
    discretionary_fraction: f64,
    min_dti: f64,
    max_dti: f64,
    payoff_min_years: u32,
    payoff_max_years: u32,
    minimum_payment_only: bool,
}

#[derive(Debug)]
struct ApiRequest {
    profile: BorrowerProfile,
    sources: Vec<FundingSource>,
    config: EngineConfig,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum PlanResponse {
    Planned(ReportResponse),
    Infeasible { message: String },
    NothingToBorrow { message: String },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportResponse {
    backend: &'static str,
    total_borrowed: f64,
    total_paid: f64,
    total_interest: f64,
    peak_dti: f64,
    allocation: Vec<YearResponse>,
    loans: Vec<LoanResponse>,
    combined: Vec<MonthResponse>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct YearResponse {
    year: u32,
    need: f64,
    borrowings: Vec<BorrowingResponse>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BorrowingResponse {
    source: String,
    loan_terms: String,
    amount: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoanResponse {
    source: String,
    plan: &'static str,
    loan_terms: String,
    annual_rate: f64,
    term_years: u32,
    borrowed: f64,
    principal_at_graduation: f64,
    first_payment: f64,
    total_paid: f64,
    total_interest: f64,
    months_to_payoff: u32,
    schedule: Vec<MonthResponse>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MonthResponse {
    month: u32,
    payment: f64,
    principal_paid: f64,
    interest_paid: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    balance: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Request(String),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("cannot serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CommandError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandError::Request(_) | CommandError::Plan(PlanError::InvalidInput { .. }) => 2,
            _ => 1,
        }
    }
}

fn default_borrower_args() -> BorrowerArgs {
    let profile = BorrowerProfile::default();
    BorrowerArgs {
        family_income: profile.family_income,
        subsidized_eligible: profile.subsidized_loan_eligible,
        starting_income: profile.starting_income,
        annual_contribution: profile.annual_personal_contribution,
        attendance_cost: profile.annual_attendance_cost,
        years_to_graduation: profile.years_to_graduation,
        income_growth: profile.income_growth_rate * 100.0,
        discretionary_fraction: profile.discretionary_fraction * 100.0,
        min_dti: profile.min_dti * 100.0,
        max_dti: profile.max_dti * 100.0,
        payoff_min_years: profile.payoff_min_years,
        payoff_max_years: profile.payoff_max_years,
        minimum_payment_only: profile.minimum_payment_only,
    }
}

fn build_profile(
    args: BorrowerArgs,
    existing_loans: Vec<ExistingLoan>,
) -> Result<BorrowerProfile, String> {
    if args.years_to_graduation == 0 {
        return Err("yearsToGraduation must be >= 1".to_string());
    }
    if args.attendance_cost < args.annual_contribution {
        return Err("attendanceCost must be >= annualContribution".to_string());
    }
    if !(0.0..=100.0).contains(&args.discretionary_fraction) {
        return Err("discretionaryFraction must be between 0 and 100".to_string());
    }
    if args.min_dti < 0.0 || args.max_dti < 0.0 {
        return Err("minDti and maxDti must be >= 0".to_string());
    }
    if args.min_dti > args.max_dti {
        return Err("minDti must be <= maxDti".to_string());
    }
    if args.payoff_min_years > args.payoff_max_years {
        return Err("payoffMinYears must be <= payoffMaxYears".to_string());
    }

    let profile = BorrowerProfile {
        family_income: args.family_income,
        subsidized_loan_eligible: args.subsidized_eligible,
        starting_income: args.starting_income,
        annual_personal_contribution: args.annual_contribution,
        annual_attendance_cost: args.attendance_cost,
        years_to_graduation: args.years_to_graduation,
        income_growth_rate: args.income_growth / 100.0,
        discretionary_fraction: args.discretionary_fraction / 100.0,
        min_dti: args.min_dti / 100.0,
        max_dti: args.max_dti / 100.0,
        payoff_min_years: args.payoff_min_years,
        payoff_max_years: args.payoff_max_years,
        minimum_payment_only: args.minimum_payment_only,
        existing_loans,
    };
    profile.validate().map_err(|e| e.to_string())?;
    Ok(profile)
}

fn build_plan(kind: ApiPlanKind, rate: f64, term_years: Option<u32>) -> RepaymentPlan {
    let plan = match kind {
        ApiPlanKind::Standard => RepaymentPlan::standard(rate, 10),
        ApiPlanKind::Graduated => RepaymentPlan::graduated(rate),
        ApiPlanKind::Extended => RepaymentPlan::extended(rate),
        ApiPlanKind::Paye => RepaymentPlan::paye(rate),
        ApiPlanKind::Repaye => RepaymentPlan::repaye(rate),
        ApiPlanKind::Save => RepaymentPlan::save(rate),
        ApiPlanKind::Icr => RepaymentPlan::icr(rate),
    };
    let Some(term_years) = term_years else {
        return plan;
    };
    match plan {
        RepaymentPlan::Standard { annual_rate, .. } => RepaymentPlan::Standard {
            annual_rate,
            term_years,
        },
        RepaymentPlan::Graduated {
            annual_rate,
            step_years,
            alpha,
            ..
        } => RepaymentPlan::Graduated {
            annual_rate,
            term_years,
            step_years,
            alpha,
        },
        RepaymentPlan::Extended { annual_rate, .. } => RepaymentPlan::Extended {
            annual_rate,
            term_years,
        },
        RepaymentPlan::IncomeDriven {
            program,
            annual_rate,
            ..
        } => RepaymentPlan::income_driven(program, annual_rate, term_years),
    }
}

fn api_request_from_json(json: &str, base: &EngineConfig) -> Result<ApiRequest, String> {
    let payload = serde_json::from_str::<PlanPayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload, base)
}

fn api_request_from_payload(
    payload: PlanPayload,
    base: &EngineConfig,
) -> Result<ApiRequest, String> {
    let mut config = *base;
    let rates = payload.rates;
    if let Some(v) = rates.federal_subsidized_rate {
        config.rates.federal_subsidized_rate = v / 100.0;
    }
    if let Some(v) = rates.federal_unsubsidized_rate {
        config.rates.federal_unsubsidized_rate = v / 100.0;
    }
    if let Some(v) = rates.federal_origination_fee {
        config.rates.federal_origination_fee = v / 100.0;
    }
    if let Some(v) = rates.plus_rate {
        config.rates.plus_rate = v / 100.0;
    }
    if let Some(v) = rates.plus_origination_fee {
        config.rates.plus_origination_fee = v / 100.0;
    }
    if let Some(v) = rates.poverty_guideline {
        if v < 0.0 {
            return Err("povertyGuideline must be >= 0".to_string());
        }
        config.poverty.guideline = v;
    }
    if let Some(v) = rates.poverty_multiplier {
        if v < 0.0 {
            return Err("povertyMultiplier must be >= 0".to_string());
        }
        config.poverty.multiplier = v;
    }

    let solver = payload.solver;
    if let Some(v) = solver.time_limit_secs {
        config.solver.time_limit_secs = Some(v);
    }
    if let Some(v) = solver.mip_gap {
        config.solver.mip_rel_gap = v / 100.0;
    }
    if let Some(v) = solver.big_m {
        config.solver.big_m = Some(v);
    }
    config.solver.validate().map_err(|e| e.to_string())?;

    let mut args = default_borrower_args();
    let borrower = payload.borrower;
    if let Some(v) = borrower.family_income {
        args.family_income = v;
    }
    if let Some(v) = borrower.subsidized_eligible {
        args.subsidized_eligible = v;
    }
    if let Some(v) = borrower.starting_income {
        args.starting_income = v;
    }
    if let Some(v) = borrower.annual_contribution {
        args.annual_contribution = v;
    }
    if let Some(v) = borrower.attendance_cost {
        args.attendance_cost = v;
    }
    if let Some(v) = borrower.years_to_graduation {
        args.years_to_graduation = v;
    }
    if let Some(v) = borrower.income_growth {
        args.income_growth = v;
    }
    if let Some(v) = borrower.discretionary_fraction {
        args.discretionary_fraction = v;
    }
    if let Some(v) = borrower.min_dti {
        args.min_dti = v;
    }
    if let Some(v) = borrower.max_dti {
        args.max_dti = v;
    }
    if let Some(v) = borrower.payoff_min_years {
        args.payoff_min_years = v;
    }
    if let Some(v) = borrower.payoff_max_years {
        args.payoff_max_years = v;
    }
    if let Some(v) = borrower.minimum_payment_only {
        args.minimum_payment_only = v;
    }

    let existing_loans = payload
        .existing_loans
        .into_iter()
        .map(|loan| ExistingLoan {
            plan: build_plan(loan.plan, loan.rate / 100.0, loan.term_years),
            name: loan.name,
            balance: loan.balance,
            subsidized: loan.subsidized,
        })
        .collect();
    let profile = build_profile(args, existing_loans)?;

    let sources = match payload.sources {
        None => federal_sources(&config.rates),
        Some(sources) => sources
            .into_iter()
            .map(|source| match source {
                SourcePayload::DirectSubsidized => FundingSource::direct_subsidized(&config.rates),
                SourcePayload::DirectUnsubsidized => {
                    FundingSource::direct_unsubsidized(&config.rates)
                }
                SourcePayload::ParentPlus => FundingSource::parent_plus(&config.rates),
                SourcePayload::Private {
                    name,
                    rate,
                    origination_fee,
                    flat_fee,
                    annual_limit,
                    terms,
                } => {
                    let mut lender = PrivateLender::new(name, rate / 100.0)
                        .with_origination_fee(origination_fee / 100.0)
                        .with_flat_fee(flat_fee);
                    if let Some(limit) = annual_limit {
                        lender = lender.with_annual_limit(limit);
                    }
                    if let Some(terms) = terms {
                        lender = lender.with_terms(terms);
                    }
                    FundingSource::Private(lender)
                }
            })
            .collect(),
    };
    for source in &sources {
        source.validate().map_err(|e| e.to_string())?;
    }

    Ok(ApiRequest {
        profile,
        sources,
        config,
    })
}

fn build_plan_response(outcome: PlanOutcome) -> PlanResponse {
    match outcome {
        PlanOutcome::NothingToBorrow => PlanResponse::NothingToBorrow {
            message: "personal contribution covers the cost of attendance".to_string(),
        },
        PlanOutcome::Infeasible => PlanResponse::Infeasible {
            message: "no borrowing plan satisfies the debt-to-income and payoff constraints"
                .to_string(),
        },
        PlanOutcome::Planned(report) => PlanResponse::Planned(build_report_response(&report)),
    }
}

fn build_report_response(report: &PlanReport) -> ReportResponse {
    ReportResponse {
        backend: report.backend.name(),
        total_borrowed: cents(report.total_borrowed),
        total_paid: cents(report.total_paid),
        total_interest: cents(report.total_interest),
        peak_dti: report.peak_dti,
        allocation: report.allocation.iter().map(year_response).collect(),
        loans: report.loans.iter().map(loan_response).collect(),
        combined: report.combined.iter().map(combined_response).collect(),
    }
}

fn year_response(year: &YearAllocation) -> YearResponse {
    YearResponse {
        year: year.year,
        need: cents(year.need),
        borrowings: year
            .borrowings
            .iter()
            .map(|borrowing| BorrowingResponse {
                source: borrowing.source.clone(),
                loan_terms: borrowing.plan.loan_terms(),
                amount: cents(borrowing.amount),
            })
            .collect(),
    }
}

fn loan_response(loan: &LoanSummary) -> LoanResponse {
    LoanResponse {
        source: loan.source.clone(),
        plan: loan.plan.kind().label(),
        loan_terms: loan.loan_terms.clone(),
        annual_rate: loan.plan.annual_rate(),
        term_years: loan.plan.term_years(),
        borrowed: cents(loan.borrowed),
        principal_at_graduation: cents(loan.principal_at_graduation),
        first_payment: cents(loan.first_payment),
        total_paid: cents(loan.total_paid),
        total_interest: cents(loan.total_interest),
        months_to_payoff: loan.months_to_payoff,
        schedule: loan.schedule.iter().map(schedule_response).collect(),
    }
}

fn schedule_response(row: &ScheduleRow) -> MonthResponse {
    MonthResponse {
        month: row.month + 1,
        payment: cents(row.payment),
        principal_paid: cents(row.principal_paid),
        interest_paid: cents(row.interest_paid),
        balance: Some(cents(row.balance)),
    }
}

fn combined_response(month: &CombinedMonth) -> MonthResponse {
    MonthResponse {
        month: month.month + 1,
        payment: cents(month.payment),
        principal_paid: cents(month.principal_paid),
        interest_paid: cents(month.interest_paid),
        balance: None,
    }
}

fn cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Runs one planning request from a JSON file and returns the serialized response.
pub fn run_plan_file(
    path: &Path,
    base: &EngineConfig,
    pretty: bool,
) -> Result<String, CommandError> {
    let json = std::fs::read_to_string(path).map_err(|source| CommandError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let request = api_request_from_json(&json, base).map_err(CommandError::Request)?;
    let outcome = plan_loans(&request.profile, &request.sources, &request.config)?;
    let response = build_plan_response(outcome);
    let body = if pretty {
        serde_json::to_string_pretty(&response)?
    } else {
        serde_json::to_string(&response)?
    };
    Ok(body)
}

#[derive(Clone)]
struct AppState {
    engine: Arc<EngineConfig>,
}

fn app(engine: EngineConfig) -> Router {
    let state = AppState {
        engine: Arc::new(engine),
    };
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/plan", post(plan_handler))
        .fallback(not_found_handler)
        .with_state(state)
}

pub async fn run_http_server(addr: SocketAddr, engine: EngineConfig) -> std::io::Result<()> {
    let app = app(engine);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "loan planner HTTP API listening");

    axum::serve(listener, app).await
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, HealthResponse { status: "ok" })
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn plan_handler(
    State(state): State<AppState>,
    payload: Result<Json<PlanPayload>, JsonRejection>,
) -> Response {
    let payload = match payload {
        Ok(Json(payload)) => payload,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "unreadable plan request");
            return error_response(StatusCode::BAD_REQUEST, &rejection.body_text());
        }
    };
    let request = match api_request_from_payload(payload, &state.engine) {
        Ok(request) => request,
        Err(msg) => {
            warn!(error = %msg, "rejected plan request");
            return error_response(StatusCode::BAD_REQUEST, &msg);
        }
    };

    let solved = tokio::task::spawn_blocking(move || {
        plan_loans(&request.profile, &request.sources, &request.config)
    })
    .await;

    match solved {
        Ok(Ok(outcome)) => json_response(StatusCode::OK, build_plan_response(outcome)),
        Ok(Err(err @ PlanError::InvalidInput { .. })) => {
            warn!(error = %err, "rejected plan request");
            error_response(StatusCode::BAD_REQUEST, &err.to_string())
        }
        Ok(Err(err)) => {
            error!(error = %err, "planning failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
        Err(join) => {
            error!(error = %join, "planning task aborted");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "planning task aborted")
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        "no-store".parse().expect("valid header"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}
