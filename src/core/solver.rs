use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use good_lp::{
    Constraint, Expression, ProblemVariables, ResolutionError, Solution, SolverModel, Variable,
    WithInitialSolution, WithMipGap, WithTimeLimit, variable,
};
use tracing::{debug, info, warn};

use super::error::PlanError;
use super::greedy::{self, Incumbent, LaneShape};
use super::plans::{PaymentRule, PlanKey, PlanKind, RepaymentPlan};
use super::sources::FundingSource;
use super::types::{BorrowerProfile, EngineConfig, ResolvedBackend, SolverSettings};

/// Identifies one (source, plan) pairing by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoanKey {
    pub source: String,
    pub plan: PlanKey,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Borrowing {
    pub amount: f64,
    pub source: String,
    pub plan: RepaymentPlan,
}

impl Borrowing {
    pub fn key(&self) -> LoanKey {
        LoanKey {
            source: self.source.clone(),
            plan: self.plan.key(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptimizedPlan {
    /// Borrowings per enrollment year; every year is present, possibly empty.
    pub allocation: BTreeMap<u32, Vec<Borrowing>>,
    pub traces: BTreeMap<LoanKey, Vec<f64>>,
    pub principals: BTreeMap<LoanKey, f64>,
    pub total_paid: f64,
    pub backend: ResolvedBackend,
}

/// Jointly chooses yearly draws, one plan per source, and monthly payments that minimize the
/// total amount repaid. Returns `Ok(None)` when no allocation satisfies the constraints.
///
/// A greedy minimum-payment plan seeds the solver and stands in for its answer when the solve
/// fails or stops before finding anything better.
pub fn optimize(
    profile: &BorrowerProfile,
    sources: &[FundingSource],
    config: &EngineConfig,
) -> Result<Option<OptimizedPlan>, PlanError> {
    profile.validate()?;
    config.solver.validate()?;
    let backend = config.solver.resolve_backend()?;
    let catalog = catalog(profile, sources)?;
    let needs = profile.borrowed_amounts();

    let mut model = Model::new();
    let mut lanes: Vec<Lane> = Vec::new();
    for (source_index, source) in catalog.iter().enumerate() {
        let plans = source.plan_options(profile);
        if plans.is_empty() {
            debug!(source = source.name(), "no offered plan fits the payoff horizon");
            continue;
        }
        let mut choice = Affine::default();
        for plan in plans {
            let lane = add_lane(&mut model, profile, config, source, source_index, &needs, plan);
            choice = choice.with(1.0, lane.active);
            lanes.push(lane);
        }
        model.push(equal(&choice, &Affine::constant(1.0)));
    }

    let need_total: f64 = needs.iter().sum();
    if need_total > 0.0 && !lanes.iter().any(|lane| !lane.shape.existing) {
        warn!(need_total, "no funding source can cover the borrowing need");
        return Ok(None);
    }

    for (year, need) in needs.iter().enumerate() {
        let drawn = lanes
            .iter()
            .filter(|lane| !lane.shape.existing)
            .fold(Affine::default(), |acc, lane| acc.with(1.0, lane.borrow[year]));
        model.push(equal(&drawn, &Affine::constant(*need)));
    }

    let horizon = lanes.iter().map(|lane| lane.payments.len()).max().unwrap_or(0);
    for month in 0..horizon {
        let service = lanes
            .iter()
            .filter_map(|lane| lane.payments.get(month))
            .fold(Affine::default(), |acc, payment| acc.with(1.0, *payment));
        let cap = profile.monthly_debt_service_cap(month as u32);
        model.push(leq(&service, &Affine::constant(cap)));
    }

    let mut objective = Expression::with_capacity(lanes.iter().map(|l| l.payments.len()).sum());
    for lane in &lanes {
        for payment in &lane.payments {
            objective.add_mul(1.0, *payment);
        }
    }

    let shapes: Vec<LaneShape> = lanes.iter().map(|lane| lane.shape.clone()).collect();
    let incumbent = greedy::incumbent(&shapes, &needs, profile);
    let start = match &incumbent {
        Some(found) => {
            debug!(total_paid = found.total_paid, "greedy incumbent found");
            warm_start(&lanes, found)
        }
        None => {
            debug!("no greedy incumbent; solver starts cold");
            Vec::new()
        }
    };

    debug!(
        lanes = lanes.len(),
        binaries = model.binaries,
        continuous = model.continuous,
        constraints = model.constraints.len(),
        horizon_months = horizon,
        "built borrowing model"
    );
    info!(backend = backend.name(), "solving borrowing model");

    let started = Instant::now();
    let Model {
        vars, constraints, ..
    } = model;
    let solved = match backend {
        ResolvedBackend::MicroLp => {
            solve_microlp(vars, objective, constraints, &config.solver, start, &lanes)
        }
        ResolvedBackend::Highs => {
            solve_highs(vars, objective, constraints, &config.solver, start, &lanes)
        }
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let values = match (solved, incumbent) {
        (Ok(Some(values)), Some(found)) if found.total_paid < total_of(&values) => {
            debug!(elapsed_ms, "solver answer is worse than the greedy plan");
            greedy_values(found)
        }
        (Ok(Some(values)), _) => values,
        (Ok(None), Some(found)) => {
            warn!(elapsed_ms, "solver reported infeasible; keeping the greedy plan");
            greedy_values(found)
        }
        (Ok(None), None) => {
            warn!(elapsed_ms, "borrowing model is infeasible");
            return Ok(None);
        }
        (Err(err), Some(found)) => {
            warn!(elapsed_ms, error = %err, "solver failed; keeping the greedy plan");
            greedy_values(found)
        }
        (Err(err), None) => return Err(PlanError::Solver(err.to_string())),
    };

    let plan = assemble(
        &lanes,
        values,
        needs.len(),
        config.solver.allocation_threshold,
        backend,
    );
    info!(
        elapsed_ms,
        total_paid = plan.total_paid,
        loans = plan.traces.len(),
        "solved borrowing model"
    );
    Ok(Some(plan))
}

/// Caller sources plus the borrower's existing loans, validated and uniquely named.
fn catalog(
    profile: &BorrowerProfile,
    sources: &[FundingSource],
) -> Result<Vec<FundingSource>, PlanError> {
    let mut catalog: Vec<FundingSource> = sources.to_vec();
    catalog.extend(
        profile
            .existing_loans
            .iter()
            .cloned()
            .map(FundingSource::Existing),
    );

    let mut names = HashSet::new();
    for source in &catalog {
        source.validate()?;
        if !names.insert(source.name().to_string()) {
            return Err(PlanError::invalid(
                "sources",
                format!("duplicate source name {:?}", source.name()),
            ));
        }
    }
    Ok(catalog)
}

struct Model {
    vars: ProblemVariables,
    constraints: Vec<Constraint>,
    binaries: usize,
    continuous: usize,
}

impl Model {
    fn new() -> Self {
        Self {
            vars: ProblemVariables::new(),
            constraints: Vec::new(),
            binaries: 0,
            continuous: 0,
        }
    }

    fn continuous(&mut self, max: Option<f64>) -> Variable {
        self.continuous += 1;
        let def = variable().min(0.0);
        match max {
            Some(max) => self.vars.add(def.max(max)),
            None => self.vars.add(def),
        }
    }

    fn binary(&mut self) -> Variable {
        self.binaries += 1;
        self.vars.add(variable().binary())
    }

    fn push(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }
}

/// Linear form kept outside good_lp so it can be scaled and reused freely.
#[derive(Debug, Clone, Default)]
struct Affine {
    terms: Vec<(Variable, f64)>,
    constant: f64,
}

impl Affine {
    fn of(var: Variable) -> Self {
        Self::default().with(1.0, var)
    }

    fn constant(value: f64) -> Self {
        Self {
            terms: Vec::new(),
            constant: value,
        }
    }

    fn with(mut self, coefficient: f64, var: Variable) -> Self {
        if coefficient != 0.0 {
            self.terms.push((var, coefficient));
        }
        self
    }

    fn plus(mut self, value: f64) -> Self {
        self.constant += value;
        self
    }

    fn scaled(&self, factor: f64) -> Self {
        Self {
            terms: self
                .terms
                .iter()
                .map(|(var, coefficient)| (*var, coefficient * factor))
                .collect(),
            constant: self.constant * factor,
        }
    }

    fn minus(&self, other: &Affine) -> Self {
        let mut terms = self.terms.clone();
        terms.extend(other.terms.iter().map(|(var, coefficient)| (*var, -coefficient)));
        Self {
            terms,
            constant: self.constant - other.constant,
        }
    }

    fn linear(&self) -> Expression {
        let mut expression = Expression::with_capacity(self.terms.len());
        for (var, coefficient) in &self.terms {
            expression.add_mul(*coefficient, *var);
        }
        expression
    }
}

fn leq(lhs: &Affine, rhs: &Affine) -> Constraint {
    let diff = lhs.minus(rhs);
    diff.linear().leq(-diff.constant)
}

fn geq(lhs: &Affine, rhs: &Affine) -> Constraint {
    leq(rhs, lhs)
}

fn equal(lhs: &Affine, rhs: &Affine) -> Constraint {
    let diff = lhs.minus(rhs);
    diff.linear().eq(-diff.constant)
}

/// ICR selector for one repayment year: the lesser minimum and the binary that picks the cap.
#[derive(Debug, Clone, Copy)]
struct IcrSelector {
    lesser: Variable,
    pick_cap: Variable,
}

struct Lane {
    shape: LaneShape,
    active: Variable,
    borrow: Vec<Variable>,
    used: Vec<Variable>,
    icr: Vec<Option<IcrSelector>>,
    payments: Vec<Variable>,
    balances: Vec<Variable>,
    at_min: Vec<Variable>,
    at_payoff: Vec<Variable>,
}

fn year_cap(source: &FundingSource, year: u32, need: f64, profile: &BorrowerProfile) -> f64 {
    let limit = source.limit(year, profile);
    if source.is_existing() {
        return limit.unwrap_or(0.0).max(0.0);
    }
    match limit {
        Some(limit) => limit.min(need).max(0.0),
        None => need.max(0.0),
    }
}

fn add_lane(
    model: &mut Model,
    profile: &BorrowerProfile,
    config: &EngineConfig,
    source: &FundingSource,
    source_index: usize,
    needs: &[f64],
    plan: RepaymentPlan,
) -> Lane {
    let existing = source.is_existing();
    let active = model.binary();
    let mut borrow = Vec::with_capacity(needs.len());
    let mut used = Vec::with_capacity(needs.len());
    let mut caps = Vec::with_capacity(needs.len());
    let mut coefficients = Vec::with_capacity(needs.len());
    let mut principal = Affine::default();
    let mut principal_bound = 0.0;

    for (year, need) in needs.iter().enumerate() {
        let year = year as u32;
        let cap = year_cap(source, year, *need, profile);
        let draw = model.continuous(Some(cap));
        let gate = model.binary();
        model.push(leq(&Affine::of(draw), &Affine::default().with(cap, gate)));
        model.push(leq(&Affine::of(gate), &Affine::of(active)));
        if existing {
            model.push(equal(&Affine::of(draw), &Affine::constant(cap)));
        }

        let (m, b) = source.principal_coefficients(year, profile);
        principal = principal.with(m, draw).with(b, gate);
        if cap > 0.0 {
            principal_bound += m * cap + b;
        }
        borrow.push(draw);
        used.push(gate);
        caps.push(cap);
        coefficients.push((m, b));
    }

    let growth = 1.0 + plan.monthly_rate();
    let rules: Vec<PaymentRule> = (0..plan.term_months())
        .map(|month| plan.payment_rule(month, profile, &config.poverty))
        .collect();
    let big_m = config
        .solver
        .big_m
        .unwrap_or_else(|| big_m_for(principal_bound, growth, &rules, amortizes(plan.kind())));

    // ICR minimum per repayment year: min(income share, capped principal share).
    let icr: Vec<Option<IcrSelector>> = (0..plan.term_years())
        .map(|year| {
            let rule = rules[(year * 12) as usize];
            rule.balance_cap.map(|cap| {
                let lesser = model.continuous(None);
                let pick_cap = model.binary();
                let share = Affine::constant(rule.intercept);
                let capped = principal.scaled(cap);
                model.push(leq(&Affine::of(lesser), &share));
                model.push(leq(&Affine::of(lesser), &capped));
                model.push(geq(
                    &Affine::of(lesser),
                    &share.minus(&Affine::default().with(big_m, pick_cap)),
                ));
                model.push(geq(
                    &Affine::of(lesser),
                    &capped.minus(&Affine::constant(big_m).with(-big_m, pick_cap)),
                ));
                IcrSelector { lesser, pick_cap }
            })
        })
        .collect();

    let months = rules.len();
    let mut payments = Vec::with_capacity(months);
    let mut balances = Vec::with_capacity(months);
    let mut at_mins = Vec::with_capacity(months);
    let mut at_payoffs = Vec::with_capacity(months);
    let mut previous = principal.clone();
    let last = months.saturating_sub(1);
    for (month, rule) in rules.iter().enumerate() {
        let payment = model.continuous(None);
        let balance = model.continuous(None);
        let payoff = previous.scaled(growth);

        model.push(equal(
            &Affine::of(balance),
            &payoff.minus(&Affine::of(payment)),
        ));
        model.push(leq(&Affine::of(payment), &payoff));

        let minimum = match icr.get(month / 12).copied().flatten() {
            Some(selector) => Affine::of(selector.lesser),
            None => principal.scaled(rule.slope).plus(rule.intercept),
        };

        let at_min = model.binary();
        let at_payoff = model.binary();
        model.push(equal(
            &Affine::of(at_min).with(1.0, at_payoff),
            &Affine::constant(1.0),
        ));
        let min_slack = Affine::constant(big_m).with(-big_m, at_min);
        model.push(leq(&Affine::of(payment).minus(&minimum), &min_slack));
        model.push(leq(&minimum.minus(&Affine::of(payment)), &min_slack));
        let payoff_slack = Affine::constant(big_m).with(-big_m, at_payoff);
        model.push(leq(&payoff.minus(&Affine::of(payment)), &payoff_slack));
        if profile.minimum_payment_only {
            model.push(leq(&Affine::of(payment), &minimum));
        }
        if month == last {
            model.push(equal(&Affine::of(balance), &Affine::constant(0.0)));
        }

        payments.push(payment);
        balances.push(balance);
        at_mins.push(at_min);
        at_payoffs.push(at_payoff);
        previous = Affine::of(balance);
    }

    Lane {
        shape: LaneShape {
            source: source.name().to_string(),
            source_index,
            plan,
            existing,
            caps,
            coefficients,
            rules,
            growth,
        },
        active,
        borrow,
        used,
        icr,
        payments,
        balances,
        at_min: at_mins,
        at_payoff: at_payoffs,
    }
}

/// Fixed-payment plans whose minimum always covers the interest, so the balance never grows.
fn amortizes(kind: PlanKind) -> bool {
    !kind.is_income_driven() && kind != PlanKind::Graduated
}

/// Bound on any payment, payoff or minimum the lane can reach, plus headroom.
fn big_m_for(principal_bound: f64, growth: f64, rules: &[PaymentRule], amortizing: bool) -> f64 {
    let balance_bound = if amortizing {
        principal_bound
    } else {
        principal_bound * growth.powi(rules.len() as i32)
    };
    let (slope, intercept) = rules.iter().fold((0.0f64, 0.0f64), |(slope, intercept), rule| {
        (
            slope.max(rule.slope).max(rule.balance_cap.unwrap_or(0.0)),
            intercept.max(rule.intercept),
        )
    });
    (growth * balance_bound).max(slope * principal_bound) + intercept + 1.0
}

/// Greedy values for every lane variable, in the solver's warm-start format.
fn warm_start(lanes: &[Lane], incumbent: &Incumbent) -> Vec<(Variable, f64)> {
    let flag = |on: bool| if on { 1.0 } else { 0.0 };
    let mut start = Vec::new();
    for (lane, fill) in lanes.iter().zip(&incumbent.lanes) {
        start.push((lane.active, flag(fill.active)));
        start.extend(lane.borrow.iter().copied().zip(fill.borrow.iter().copied()));
        start.extend(lane.used.iter().zip(&fill.used).map(|(var, on)| (*var, flag(*on))));
        for (selector, values) in lane.icr.iter().zip(&fill.icr) {
            if let (Some(selector), Some((lesser, pick_cap))) = (selector, values) {
                start.push((selector.lesser, *lesser));
                start.push((selector.pick_cap, flag(*pick_cap)));
            }
        }
        start.extend(lane.payments.iter().copied().zip(fill.payments.iter().copied()));
        start.extend(lane.balances.iter().copied().zip(fill.balances.iter().copied()));
        for ((at_min, at_payoff), paid_off) in
            lane.at_min.iter().zip(&lane.at_payoff).zip(&fill.at_payoff)
        {
            start.push((*at_min, flag(!*paid_off)));
            start.push((*at_payoff, flag(*paid_off)));
        }
    }
    start
}

/// Applies the shared tuning: relative gap, optional wall-clock limit and the warm start.
fn tune<M>(
    problem: M,
    settings: &SolverSettings,
    start: Vec<(Variable, f64)>,
) -> Result<M, ResolutionError>
where
    M: WithMipGap + WithTimeLimit + WithInitialSolution,
{
    let mut problem = problem
        .with_mip_gap(settings.mip_rel_gap as f32)
        .map_err(|err| ResolutionError::Str(err.to_string()))?;
    if let Some(limit) = settings.time_limit_secs {
        problem = problem.with_time_limit(limit);
    }
    if !start.is_empty() {
        problem = problem.with_initial_solution(start);
    }
    Ok(problem)
}

fn finish<M>(
    mut problem: M,
    constraints: Vec<Constraint>,
) -> Result<Option<M::Solution>, ResolutionError>
where
    M: SolverModel<Error = ResolutionError>,
{
    for constraint in constraints {
        problem = problem.with(constraint);
    }
    match problem.solve() {
        Ok(solution) => Ok(Some(solution)),
        Err(ResolutionError::Infeasible) => Ok(None),
        Err(err) => Err(err),
    }
}

fn solve_microlp(
    vars: ProblemVariables,
    objective: Expression,
    constraints: Vec<Constraint>,
    settings: &SolverSettings,
    start: Vec<(Variable, f64)>,
    lanes: &[Lane],
) -> Result<Option<Vec<LaneValues>>, ResolutionError> {
    let problem = vars
        .minimise(objective)
        .using(good_lp::solvers::microlp::microlp);
    let problem = tune(problem, settings, start)?;
    Ok(finish(problem, constraints)?.map(|solution| read_lanes(&solution, lanes)))
}

#[cfg(feature = "highs")]
fn solve_highs(
    vars: ProblemVariables,
    objective: Expression,
    constraints: Vec<Constraint>,
    settings: &SolverSettings,
    start: Vec<(Variable, f64)>,
    lanes: &[Lane],
) -> Result<Option<Vec<LaneValues>>, ResolutionError> {
    let problem = vars
        .minimise(objective)
        .using(good_lp::solvers::highs::highs)
        .set_option("presolve", "on")
        .set_option("mip_heuristic_effort", settings.heuristic_effort);
    let problem = tune(problem, settings, start)?;
    Ok(finish(problem, constraints)?.map(|solution| read_lanes(&solution, lanes)))
}

#[cfg(not(feature = "highs"))]
fn solve_highs(
    _vars: ProblemVariables,
    _objective: Expression,
    _constraints: Vec<Constraint>,
    _settings: &SolverSettings,
    _start: Vec<(Variable, f64)>,
    _lanes: &[Lane],
) -> Result<Option<Vec<LaneValues>>, ResolutionError> {
    Err(ResolutionError::Str(
        PlanError::BackendUnavailable("highs").to_string(),
    ))
}

struct LaneValues {
    borrow: Vec<f64>,
    used: Vec<bool>,
    payments: Vec<f64>,
}

fn read_lanes<S: Solution>(solution: &S, lanes: &[Lane]) -> Vec<LaneValues> {
    lanes
        .iter()
        .map(|lane| LaneValues {
            borrow: lane
                .borrow
                .iter()
                .map(|var| solution.value(*var).max(0.0))
                .collect(),
            used: lane.used.iter().map(|var| solution.value(*var) > 0.5).collect(),
            payments: lane
                .payments
                .iter()
                .map(|var| solution.value(*var).max(0.0))
                .collect(),
        })
        .collect()
}

fn greedy_values(incumbent: Incumbent) -> Vec<LaneValues> {
    incumbent
        .lanes
        .into_iter()
        .map(|fill| LaneValues {
            borrow: fill.borrow,
            used: fill.used,
            payments: fill.payments,
        })
        .collect()
}

fn total_of(values: &[LaneValues]) -> f64 {
    values
        .iter()
        .map(|lane| lane.payments.iter().sum::<f64>())
        .sum()
}

fn assemble(
    lanes: &[Lane],
    values: Vec<LaneValues>,
    years: usize,
    threshold: f64,
    backend: ResolvedBackend,
) -> OptimizedPlan {
    let mut allocation: BTreeMap<u32, Vec<Borrowing>> =
        (0..years as u32).map(|year| (year, Vec::new())).collect();
    let mut traces = BTreeMap::new();
    let mut principals = BTreeMap::new();
    let mut total_paid = 0.0;

    for (lane, values) in lanes.iter().zip(values) {
        let shape = &lane.shape;
        let mut drawn = false;
        let mut principal = 0.0;
        for (year, amount) in values.borrow.iter().enumerate() {
            let (m, b) = shape.coefficients[year];
            if *amount > threshold {
                drawn = true;
                principal += m * amount;
                if values.used[year] {
                    principal += b;
                }
                if let Some(borrowings) = allocation.get_mut(&(year as u32)) {
                    borrowings.push(Borrowing {
                        amount: *amount,
                        source: shape.source.clone(),
                        plan: shape.plan,
                    });
                }
            }
        }
        if !drawn {
            continue;
        }

        let key = LoanKey {
            source: shape.source.clone(),
            plan: shape.plan.key(),
        };
        total_paid += values.payments.iter().sum::<f64>();
        traces.insert(key.clone(), values.payments);
        principals.insert(key, principal);
    }

    OptimizedPlan {
        allocation,
        traces,
        principals,
        total_paid,
        backend,
    }
}
