use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Fallback monthly fee when neither the student nor the class carries one
/// and no workspace setting overrides it.
pub const FALLBACK_MONTHLY_FEE: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Completed,
    Partial,
    Pending,
}

impl PaymentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(Self::Completed),
            "partial" => Some(Self::Partial),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Pending => "pending",
        }
    }
}

/// One roster row, as produced by the student loader. `monthly_fee` is already
/// resolved through the fee schedule (student override, then class default);
/// `None` means "use the engine's default".
#[derive(Debug, Clone)]
pub struct RosterStudent {
    pub id: String,
    pub name: String,
    pub class_label: Option<String>,
    pub monthly_fee: Option<f64>,
}

/// One ledger row. The loader hands the engine the full unfiltered ledger;
/// all period filtering happens here, in memory.
#[derive(Debug, Clone)]
pub struct LedgerPayment {
    pub student_id: String,
    pub amount_received: f64,
    pub balance_remaining: f64,
    pub status: PaymentStatus,
    pub payment_date: NaiveDate,
}

/// Derived per-student pending-fee summary for one month/year. Not persisted;
/// recomputed on every request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingFeeView {
    pub student_id: String,
    pub student_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_label: Option<String>,
    pub total_paid: f64,
    pub total_pending: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_payment_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_payment_amount: Option<f64>,
    pub pending_reason: String,
}

fn in_period(p: &LedgerPayment, month: u32, year: i32) -> bool {
    p.payment_date.month() == month && p.payment_date.year() == year
}

/// Joins roster against ledger for one month/year and reports every student who
/// still owes something (or has no record at all) for that period.
///
/// A student is settled for the period when at least one of their payments is
/// dated inside it with status `completed` and zero balance; settled students
/// are excluded from the output entirely, not merely marked paid. Everyone
/// else gets one view row, in roster order:
/// - `total_paid` is the all-time sum over the student's payments, not scoped
///   to the period.
/// - `total_pending` comes from the period payment's remaining balance when
///   one exists (most recent by date if there are several in the month), else
///   from the student's resolved monthly fee, else `default_fee`.
/// - `last_payment_*` reflect the student's most recent payment overall.
pub fn reconcile(
    students: &[RosterStudent],
    payments: &[LedgerPayment],
    month: u32,
    year: i32,
    default_fee: f64,
) -> Vec<PendingFeeView> {
    let mut settled: HashSet<&str> = HashSet::new();
    let mut by_student: HashMap<&str, Vec<&LedgerPayment>> = HashMap::new();
    for p in payments {
        by_student.entry(p.student_id.as_str()).or_default().push(p);
        if in_period(p, month, year)
            && p.status == PaymentStatus::Completed
            && p.balance_remaining == 0.0
        {
            settled.insert(p.student_id.as_str());
        }
    }

    let mut views = Vec::new();
    for s in students {
        if settled.contains(s.id.as_str()) {
            continue;
        }
        let mine: &[&LedgerPayment] = by_student
            .get(s.id.as_str())
            .map(|v| v.as_slice())
            .unwrap_or(&[]);

        let period_payment = mine
            .iter()
            .filter(|p| in_period(p, month, year))
            .max_by_key(|p| p.payment_date);
        let total_paid: f64 = mine.iter().map(|p| p.amount_received).sum();
        let last_payment = mine.iter().max_by_key(|p| p.payment_date);

        let (total_pending, pending_reason) = match period_payment {
            Some(p) => (
                p.balance_remaining,
                format!("Outstanding balance: {}", p.balance_remaining),
            ),
            None => (
                s.monthly_fee.unwrap_or(default_fee),
                format!("No payment record for {}/{}", month, year),
            ),
        };

        views.push(PendingFeeView {
            student_id: s.id.clone(),
            student_name: s.name.clone(),
            class_label: s.class_label.clone(),
            total_paid,
            total_pending,
            last_payment_date: last_payment.map(|p| p.payment_date.format("%Y-%m-%d").to_string()),
            last_payment_amount: last_payment.map(|p| p.amount_received),
            pending_reason,
        });
    }
    views
}

/// Sum of everything received in the period, taken straight off the ledger.
/// The summary endpoint uses this rather than re-deriving it from the
/// per-student views.
pub fn period_collected(payments: &[LedgerPayment], month: u32, year: i32) -> f64 {
    payments
        .iter()
        .filter(|p| in_period(p, month, year))
        .map(|p| p.amount_received)
        .sum()
}
