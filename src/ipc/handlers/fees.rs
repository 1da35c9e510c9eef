use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_opt_str, parse_period, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::reconcile::{
    period_collected, reconcile, LedgerPayment, PaymentStatus, RosterStudent,
    FALLBACK_MONTHLY_FEE,
};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;

/// Roster load for reconciliation: id, display name, denormalized class label,
/// and the monthly fee resolved through the schedule (student override first,
/// then the class default).
fn load_roster(
    conn: &Connection,
    class_filter: Option<&str>,
) -> Result<Vec<RosterStudent>, HandlerErr> {
    let base = "SELECT
           s.id, s.name, c.name, c.section,
           COALESCE(s.fees_amount, c.default_monthly_fee)
         FROM students s
         LEFT JOIN classes c ON c.id = s.class_id";
    let sql = match class_filter {
        Some(_) => format!("{} WHERE s.class_id = ? ORDER BY s.sort_order, s.name", base),
        None => format!("{} ORDER BY c.name, s.sort_order, s.name", base),
    };

    let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<RosterStudent> {
        let id: String = row.get(0)?;
        let name: String = row.get(1)?;
        let class_name: Option<String> = row.get(2)?;
        let class_section: Option<String> = row.get(3)?;
        let monthly_fee: Option<f64> = row.get(4)?;
        let class_label = class_name.map(|n| match class_section {
            Some(sec) if !sec.is_empty() => format!("{} {}", n, sec),
            _ => n,
        });
        Ok(RosterStudent {
            id,
            name,
            class_label,
            monthly_fee,
        })
    };

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    match class_filter {
        Some(cid) => stmt
            .query_map([cid], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    }
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

/// Full unfiltered ledger. Rows whose status or date fail to parse are a
/// corrupt workspace, reported as a query failure rather than skipped.
fn load_ledger(conn: &Connection) -> Result<Vec<LedgerPayment>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT student_id, amount_received, balance_remaining, payment_status, payment_date
             FROM payments",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let raw = stmt
        .query_map([], |row| {
            let student_id: String = row.get(0)?;
            let amount_received: f64 = row.get(1)?;
            let balance_remaining: f64 = row.get(2)?;
            let status: String = row.get(3)?;
            let date: String = row.get(4)?;
            Ok((student_id, amount_received, balance_remaining, status, date))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut ledger = Vec::with_capacity(raw.len());
    for (student_id, amount_received, balance_remaining, status, date) in raw {
        let status = PaymentStatus::parse(&status).ok_or_else(|| {
            HandlerErr::db(
                "db_query_failed",
                format!("unknown payment_status: {}", status),
            )
        })?;
        let payment_date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|_| {
            HandlerErr::db("db_query_failed", format!("bad payment_date: {}", date))
        })?;
        ledger.push(LedgerPayment {
            student_id,
            amount_received,
            balance_remaining,
            status,
            payment_date,
        });
    }
    Ok(ledger)
}

fn configured_default_fee(conn: &Connection) -> f64 {
    db::settings_get_json(conn, "fees.defaultMonthlyFee")
        .ok()
        .flatten()
        .and_then(|v| v.as_f64())
        .filter(|v| *v >= 0.0)
        .unwrap_or(FALLBACK_MONTHLY_FEE)
}

fn fees_pending(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    // Reject malformed input before any load runs.
    let (month, year) = parse_period(params)?;
    let class_filter = get_opt_str(params, "classId")?;

    let students = load_roster(conn, class_filter.as_deref())?;
    let payments = load_ledger(conn)?;
    let views = reconcile(
        &students,
        &payments,
        month,
        year,
        configured_default_fee(conn),
    );

    Ok(json!({
        "month": month,
        "year": year,
        "pending": views
    }))
}

fn fees_summary(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let (month, year) = parse_period(params)?;

    let students = load_roster(conn, None)?;
    let payments = load_ledger(conn)?;

    // Collected comes straight off the ledger, independent of the view.
    let total_collected = period_collected(&payments, month, year);
    let views = reconcile(
        &students,
        &payments,
        month,
        year,
        configured_default_fee(conn),
    );
    let total_pending: f64 = views.iter().map(|v| v.total_pending).sum();

    Ok(json!({
        "month": month,
        "year": year,
        "totalCollected": total_collected,
        "totalPending": total_pending,
        "pendingStudentCount": views.len(),
        "studentCount": students.len()
    }))
}

fn fees_set_default_monthly_fee(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let amount = params
        .get("amount")
        .and_then(|v| v.as_f64())
        .filter(|v| *v >= 0.0)
        .ok_or_else(|| HandlerErr::bad_params("amount must be a number >= 0"))?;
    db::settings_set_json(conn, "fees.defaultMonthlyFee", &json!(amount))
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(json!({ "defaultMonthlyFee": amount }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "fees.pending" => Some(with_conn(state, req, fees_pending)),
        "fees.summary" => Some(with_conn(state, req, fees_summary)),
        "fees.setDefaultMonthlyFee" => {
            Some(with_conn(state, req, fees_set_default_monthly_fee))
        }
        _ => None,
    }
}
