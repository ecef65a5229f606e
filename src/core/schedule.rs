/// Balance at or below which a loan counts as repaid.
pub const PAID_OFF_EPS: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleRow {
    pub month: u32,
    pub payment: f64,
    pub principal_paid: f64,
    pub interest_paid: f64,
    pub balance: f64,
}

/// Replays a payment trace against a starting balance, month by month.
///
/// Payments are taken as given; nothing is recomputed. The replay stops the first month the
/// balance reaches `PAID_OFF_EPS`. A payment that overshoots the payoff is kept as paid and only
/// the balance is clamped at zero.
pub fn replay(annual_rate: f64, principal: f64, trace: &[f64]) -> Vec<ScheduleRow> {
    let r = annual_rate / 12.0;
    let mut balance = principal;
    let mut rows = Vec::with_capacity(trace.len());

    for (month, &scheduled) in trace.iter().enumerate() {
        let interest = balance * r;
        let principal_paid = scheduled - interest;
        balance = (balance - principal_paid).max(0.0);

        rows.push(ScheduleRow {
            month: month as u32,
            payment: scheduled,
            principal_paid,
            interest_paid: interest,
            balance,
        });

        if balance <= PAID_OFF_EPS {
            break;
        }
    }

    rows
}

pub fn total_paid(rows: &[ScheduleRow]) -> f64 {
    rows.iter().map(|row| row.payment).sum()
}

pub fn total_interest(rows: &[ScheduleRow]) -> f64 {
    rows.iter().map(|row| row.interest_paid).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, proptest};

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn replay_splits_interest_and_principal() {
        let rows = replay(0.12, 1_000.0, &[110.0, 110.0]);
        assert_eq!(rows.len(), 2);
        assert_approx(rows[0].interest_paid, 10.0);
        assert_approx(rows[0].principal_paid, 100.0);
        assert_approx(rows[0].balance, 900.0);
        assert_approx(rows[1].interest_paid, 9.0);
        assert_approx(rows[1].balance, 799.0);
    }

    #[test]
    fn replay_stops_at_payoff_and_keeps_overshooting_payment() {
        let rows = replay(0.12, 100.0, &[50.0, 60.0, 60.0]);
        assert_eq!(rows.len(), 2);
        let last = rows[1];
        assert_approx(last.balance, 0.0);
        assert_approx(last.payment, 60.0);
        assert_approx(last.interest_paid, 0.51);
        assert_approx(last.principal_paid, 60.0 - 0.51);
    }

    #[test]
    fn replay_of_zero_balance_pays_nothing() {
        let rows = replay(0.05, 0.0, &[0.0, 0.0]);
        assert_eq!(rows.len(), 1);
        assert_approx(rows[0].payment, 0.0);
        assert_approx(total_paid(&rows), 0.0);
    }

    #[test]
    fn totals_sum_rows() {
        let rows = replay(0.12, 1_000.0, &[510.0, 510.0]);
        assert_approx(total_paid(&rows), 1_020.0);
        assert_approx(total_interest(&rows), 10.0 + 5.0);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(64))]

        #[test]
        fn prop_replay_keeps_payments_and_principal_reconciles(
            principal_cents in 0u32..5_000_000,
            rate_bp in 0u32..2_000,
            payments in proptest::collection::vec(0u32..200_000, 1..120)
        ) {
            let principal = principal_cents as f64 / 100.0;
            let trace: Vec<f64> = payments.iter().map(|p| *p as f64 / 100.0).collect();
            let rows = replay(rate_bp as f64 / 10_000.0, principal, &trace);

            prop_assert!(rows.len() <= trace.len());
            let repaid: f64 = rows.iter().map(|row| row.principal_paid).sum();
            let last = rows.last().map(|row| row.balance).unwrap_or(principal);
            prop_assert!(repaid >= principal - last - 1e-6 * (1.0 + principal));
            for (row, scheduled) in rows.iter().zip(&trace) {
                prop_assert!(row.payment == *scheduled);
                prop_assert!(row.balance >= 0.0);
                prop_assert!(row.payment >= 0.0);
                prop_assert!(row.interest_paid >= 0.0);
            }
        }
    }
}
