use super::plans::{PaymentRule, RepaymentPlan};
use super::types::BorrowerProfile;

/// Plan-choice combinations tried before settling for the best found so far.
const MAX_COMBINATIONS: usize = 512;

/// Relative slack when checking a simulated plan against the model's constraints.
const FEASIBILITY_TOL: f64 = 1e-7;

/// Numeric description of one (source, plan) lane, independent of solver variables.
#[derive(Debug, Clone)]
pub(super) struct LaneShape {
    pub source: String,
    pub source_index: usize,
    pub plan: RepaymentPlan,
    pub existing: bool,
    pub caps: Vec<f64>,
    pub coefficients: Vec<(f64, f64)>,
    pub rules: Vec<PaymentRule>,
    pub growth: f64,
}

impl LaneShape {
    /// ICR cap ratio for a repayment year, if the plan carries one.
    pub fn balance_cap(&self, year: usize) -> Option<f64> {
        self.rules.get(year * 12).and_then(|rule| rule.balance_cap)
    }

    pub fn repayment_years(&self) -> usize {
        self.rules.len().div_ceil(12)
    }

    /// Cost of one dollar drawn in `year`, used to rank lanes when filling need.
    fn draw_cost(&self, year: usize) -> f64 {
        self.coefficients[year].0 * (1.0 + self.plan.annual_rate())
    }
}

/// Values for every model variable of one lane.
#[derive(Debug, Clone)]
pub(super) struct LaneFill {
    pub active: bool,
    pub borrow: Vec<f64>,
    pub used: Vec<bool>,
    /// Per repayment year: (lesser of income share and capped principal, cap picked).
    pub icr: Vec<Option<(f64, bool)>>,
    pub payments: Vec<f64>,
    pub balances: Vec<f64>,
    pub at_payoff: Vec<bool>,
}

impl LaneFill {
    fn idle(shape: &LaneShape) -> Self {
        let months = shape.rules.len();
        Self {
            active: false,
            borrow: vec![0.0; shape.caps.len()],
            used: vec![false; shape.caps.len()],
            icr: (0..shape.repayment_years())
                .map(|year| shape.balance_cap(year).map(|_| (0.0, true)))
                .collect(),
            payments: vec![0.0; months],
            balances: vec![0.0; months],
            at_payoff: vec![true; months],
        }
    }
}

#[derive(Debug, Clone)]
pub(super) struct Incumbent {
    pub lanes: Vec<LaneFill>,
    pub total_paid: f64,
}

/// Builds a feasible assignment by trying plan combinations, filling each year's need from the
/// cheapest lanes first and paying the minimum every month.
pub(super) fn incumbent(
    shapes: &[LaneShape],
    needs: &[f64],
    profile: &BorrowerProfile,
) -> Option<Incumbent> {
    let mut groups: Vec<(usize, Vec<usize>)> = Vec::new();
    for (idx, shape) in shapes.iter().enumerate() {
        match groups.iter_mut().find(|(source, _)| *source == shape.source_index) {
            Some((_, lanes)) => lanes.push(idx),
            None => groups.push((shape.source_index, vec![idx])),
        }
    }

    let mut best: Option<Incumbent> = None;
    let mut choice = vec![0usize; groups.len()];
    for _ in 0..MAX_COMBINATIONS {
        let chosen: Vec<usize> = groups
            .iter()
            .zip(&choice)
            .map(|((_, lanes), pick)| lanes[*pick])
            .collect();
        if let Some(candidate) = evaluate(shapes, &chosen, needs, profile) {
            if best
                .as_ref()
                .is_none_or(|current| candidate.total_paid < current.total_paid)
            {
                best = Some(candidate);
            }
        }
        if !advance(&mut choice, &groups) {
            break;
        }
    }
    best
}

/// Mixed-radix increment over the per-source plan choices; false once every combination is seen.
fn advance(choice: &mut [usize], groups: &[(usize, Vec<usize>)]) -> bool {
    for (pick, (_, lanes)) in choice.iter_mut().zip(groups) {
        *pick += 1;
        if *pick < lanes.len() {
            return true;
        }
        *pick = 0;
    }
    false
}

fn evaluate(
    shapes: &[LaneShape],
    chosen: &[usize],
    needs: &[f64],
    profile: &BorrowerProfile,
) -> Option<Incumbent> {
    let mut lanes: Vec<LaneFill> = shapes.iter().map(LaneFill::idle).collect();

    for &idx in chosen {
        let shape = &shapes[idx];
        lanes[idx].active = true;
        if shape.existing {
            for (year, cap) in shape.caps.iter().enumerate() {
                lanes[idx].borrow[year] = *cap;
                lanes[idx].used[year] = *cap > 0.0;
            }
        }
    }

    for (year, need) in needs.iter().enumerate() {
        let mut ranked: Vec<usize> = chosen
            .iter()
            .copied()
            .filter(|idx| !shapes[*idx].existing)
            .collect();
        ranked.sort_by(|a, b| {
            shapes[*a]
                .draw_cost(year)
                .total_cmp(&shapes[*b].draw_cost(year))
        });

        let mut remaining = *need;
        for idx in ranked {
            if remaining <= 0.0 {
                break;
            }
            let draw = shapes[idx].caps[year].min(remaining);
            if draw > 0.0 {
                lanes[idx].borrow[year] = draw;
                lanes[idx].used[year] = true;
                remaining -= draw;
            }
        }
        if remaining > FEASIBILITY_TOL * (1.0 + need) {
            return None;
        }
    }

    for &idx in chosen {
        let shape = &shapes[idx];
        let principal: f64 = shape
            .coefficients
            .iter()
            .zip(lanes[idx].borrow.iter().zip(&lanes[idx].used))
            .map(|((m, b), (draw, used))| m * draw + if *used { *b } else { 0.0 })
            .sum();
        pay_minimums(shape, principal, profile.minimum_payment_only, &mut lanes[idx])?;
    }

    let horizon = lanes.iter().map(|lane| lane.payments.len()).max().unwrap_or(0);
    for month in 0..horizon {
        let service: f64 = lanes
            .iter()
            .filter_map(|lane| lane.payments.get(month))
            .sum();
        let cap = profile.monthly_debt_service_cap(month as u32);
        if service > cap + FEASIBILITY_TOL * (1.0 + cap) {
            return None;
        }
    }

    let total_paid = lanes
        .iter()
        .map(|lane| lane.payments.iter().sum::<f64>())
        .sum();
    Some(Incumbent { lanes, total_paid })
}

/// Pays each month's minimum, or the payoff once it is smaller, and clears the balance in the
/// final month. `None` when the final payoff exceeds the minimum under minimum-only payments.
fn pay_minimums(
    shape: &LaneShape,
    principal: f64,
    minimum_only: bool,
    fill: &mut LaneFill,
) -> Option<()> {
    for (year, slot) in fill.icr.iter_mut().enumerate() {
        if let Some(cap) = shape.balance_cap(year) {
            let share = shape.rules[year * 12].intercept;
            let capped = cap * principal;
            *slot = Some((share.min(capped), capped <= share));
        }
    }

    let last = shape.rules.len().saturating_sub(1);
    let mut balance = principal;
    for (month, rule) in shape.rules.iter().enumerate() {
        let payoff = shape.growth * balance;
        let minimum = match fill.icr.get(month / 12).copied().flatten() {
            Some((lesser, _)) => lesser,
            None => rule.slope * principal + rule.intercept,
        };

        if month == last || payoff <= minimum {
            if minimum_only && payoff > minimum + FEASIBILITY_TOL * (1.0 + minimum) {
                return None;
            }
            fill.payments[month] = payoff;
            fill.at_payoff[month] = true;
            balance = 0.0;
        } else {
            fill.payments[month] = minimum;
            fill.at_payoff[month] = false;
            balance = payoff - minimum;
        }
        fill.balances[month] = balance;
    }
    Some(())
}
