use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_opt_f64, get_opt_str, get_required_str, now_iso, parse_iso_date, student_exists,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::reconcile::PaymentStatus;
use chrono::Datelike;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const PAYMENT_METHODS: &[&str] = &["cash", "card", "upi", "bank_transfer", "cheque"];

#[derive(Debug, Clone)]
struct PaymentRow {
    id: String,
    student_id: String,
    amount_received: f64,
    balance_remaining: f64,
    payment_date: String,
    payment_method: String,
    payment_status: String,
    fee_month: i64,
    fee_year: i64,
    receipt_no: Option<String>,
    created_at: Option<String>,
}

impl PaymentRow {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "studentId": self.student_id,
            "amountReceived": self.amount_received,
            "balanceRemaining": self.balance_remaining,
            "paymentDate": self.payment_date,
            "paymentMethod": self.payment_method,
            "paymentStatus": self.payment_status,
            "feeMonth": self.fee_month,
            "feeYear": self.fee_year,
            "receiptNo": self.receipt_no,
            "createdAt": self.created_at
        })
    }
}

fn payment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaymentRow> {
    Ok(PaymentRow {
        id: row.get(0)?,
        student_id: row.get(1)?,
        amount_received: row.get(2)?,
        balance_remaining: row.get(3)?,
        payment_date: row.get(4)?,
        payment_method: row.get(5)?,
        payment_status: row.get(6)?,
        fee_month: row.get(7)?,
        fee_year: row.get(8)?,
        receipt_no: row.get(9)?,
        created_at: row.get(10)?,
    })
}

const PAYMENT_COLUMNS: &str = "id, student_id, amount_received, balance_remaining,
     payment_date, payment_method, payment_status, fee_month, fee_year,
     receipt_no, created_at";

fn load_payment(conn: &Connection, payment_id: &str) -> Result<PaymentRow, HandlerErr> {
    let sql = format!("SELECT {} FROM payments WHERE id = ?", PAYMENT_COLUMNS);
    conn.query_row(&sql, [payment_id], payment_from_row)
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("payment not found"))
}

fn validate_method(raw: &str) -> Result<String, HandlerErr> {
    let m = raw.trim().to_ascii_lowercase();
    if !PAYMENT_METHODS.contains(&m.as_str()) {
        return Err(HandlerErr::bad_params(format!(
            "paymentMethod must be one of {}",
            PAYMENT_METHODS.join(", ")
        )));
    }
    Ok(m)
}

fn validate_status(raw: &str) -> Result<String, HandlerErr> {
    let s = raw.trim().to_ascii_lowercase();
    PaymentStatus::parse(&s)
        .map(|v| v.as_str().to_string())
        .ok_or_else(|| {
            HandlerErr::bad_params("paymentStatus must be completed, partial or pending")
        })
}

fn require_amount(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    let v = get_opt_f64(params, key)?
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if v < 0.0 {
        return Err(HandlerErr::bad_params(format!("{} must be >= 0", key)));
    }
    Ok(v)
}

/// Record a fee collection. fee_month/fee_year always come from the payment
/// date; callers cannot set them independently, which rules out month/date
/// skew in the ledger.
fn payments_record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    if params.get("feeMonth").is_some() || params.get("feeYear").is_some() {
        return Err(HandlerErr::bad_params(
            "feeMonth/feeYear are derived from paymentDate and cannot be set",
        ));
    }

    let student_id = get_required_str(params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    let amount_received = require_amount(params, "amountReceived")?;
    let date = parse_iso_date(&get_required_str(params, "paymentDate")?, "paymentDate")?;
    let method = validate_method(&get_required_str(params, "paymentMethod")?)?;

    let balance_remaining = match get_opt_f64(params, "balanceRemaining")? {
        Some(b) if b < 0.0 => {
            return Err(HandlerErr::bad_params("balanceRemaining must be >= 0"))
        }
        Some(b) => b,
        None => 0.0,
    };
    let status = match get_opt_str(params, "paymentStatus")? {
        Some(raw) => validate_status(&raw)?,
        None if balance_remaining == 0.0 => "completed".to_string(),
        None => "partial".to_string(),
    };
    let receipt_no = get_opt_str(params, "receiptNo")?;

    let payment_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO payments(
            id, student_id, amount_received, balance_remaining, payment_date,
            payment_method, payment_status, fee_month, fee_year, receipt_no,
            created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &payment_id,
            &student_id,
            amount_received,
            balance_remaining,
            date.format("%Y-%m-%d").to_string(),
            &method,
            &status,
            date.month() as i64,
            date.year() as i64,
            &receipt_no,
            now_iso(),
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "payments" })),
    })?;

    load_payment(conn, &payment_id).map(|row| json!({ "payment": row.to_json() }))
}

/// Ledger load. Unfiltered by default: the reconciliation engine filters in
/// memory rather than pushing predicates into the query.
fn payments_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_filter = get_opt_str(params, "studentId")?;

    let (sql, args): (String, Vec<String>) = match student_filter {
        Some(sid) => (
            format!(
                "SELECT {} FROM payments WHERE student_id = ? ORDER BY payment_date DESC, created_at DESC",
                PAYMENT_COLUMNS
            ),
            vec![sid],
        ),
        None => (
            format!(
                "SELECT {} FROM payments ORDER BY payment_date DESC, created_at DESC",
                PAYMENT_COLUMNS
            ),
            vec![],
        ),
    };
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(args), payment_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let payments: Vec<serde_json::Value> = rows.iter().map(PaymentRow::to_json).collect();
    Ok(json!({ "payments": payments }))
}

fn stringify_amount(v: f64) -> String {
    format!("{}", v)
}

/// Audited update. One payment_history row per changed field. The history
/// write is best-effort: a failed audit insert must not fail the update
/// itself.
fn payments_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    if params.get("feeMonth").is_some() || params.get("feeYear").is_some() {
        return Err(HandlerErr::bad_params(
            "feeMonth/feeYear are derived from paymentDate and cannot be set",
        ));
    }

    let payment_id = get_required_str(params, "paymentId")?;
    let updated_by = get_required_str(params, "updatedBy")?;
    let reason = get_opt_str(params, "reason")?;

    let current = load_payment(conn, &payment_id)?;
    let mut next = current.clone();
    // (camelCase field name, old value, new value) for the audit trail.
    let mut changes: Vec<(&'static str, String, String)> = Vec::new();

    if params.get("amountReceived").is_some() {
        let v = require_amount(params, "amountReceived")?;
        if v != current.amount_received {
            changes.push((
                "amountReceived",
                stringify_amount(current.amount_received),
                stringify_amount(v),
            ));
            next.amount_received = v;
        }
    }
    if params.get("balanceRemaining").is_some() {
        let v = require_amount(params, "balanceRemaining")?;
        if v != current.balance_remaining {
            changes.push((
                "balanceRemaining",
                stringify_amount(current.balance_remaining),
                stringify_amount(v),
            ));
            next.balance_remaining = v;
        }
    }
    if params.get("paymentDate").is_some() {
        let date = parse_iso_date(&get_required_str(params, "paymentDate")?, "paymentDate")?;
        let formatted = date.format("%Y-%m-%d").to_string();
        if formatted != current.payment_date {
            changes.push(("paymentDate", current.payment_date.clone(), formatted.clone()));
            next.payment_date = formatted;
            next.fee_month = date.month() as i64;
            next.fee_year = date.year() as i64;
        }
    }
    if params.get("paymentMethod").is_some() {
        let m = validate_method(&get_required_str(params, "paymentMethod")?)?;
        if m != current.payment_method {
            changes.push(("paymentMethod", current.payment_method.clone(), m.clone()));
            next.payment_method = m;
        }
    }
    if params.get("paymentStatus").is_some() {
        let s = validate_status(&get_required_str(params, "paymentStatus")?)?;
        if s != current.payment_status {
            changes.push(("paymentStatus", current.payment_status.clone(), s.clone()));
            next.payment_status = s;
        }
    }
    if params.get("receiptNo").is_some() {
        let r = get_opt_str(params, "receiptNo")?;
        if r != current.receipt_no {
            changes.push((
                "receiptNo",
                current.receipt_no.clone().unwrap_or_default(),
                r.clone().unwrap_or_default(),
            ));
            next.receipt_no = r;
        }
    }

    if changes.is_empty() {
        return Ok(json!({ "payment": current.to_json(), "changedFields": [] }));
    }

    conn.execute(
        "UPDATE payments SET
            amount_received = ?, balance_remaining = ?, payment_date = ?,
            payment_method = ?, payment_status = ?, fee_month = ?, fee_year = ?,
            receipt_no = ?
         WHERE id = ?",
        rusqlite::params![
            next.amount_received,
            next.balance_remaining,
            &next.payment_date,
            &next.payment_method,
            &next.payment_status,
            next.fee_month,
            next.fee_year,
            &next.receipt_no,
            &payment_id,
        ],
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;

    let now = now_iso();
    for (field, old_value, new_value) in &changes {
        let _ = conn.execute(
            "INSERT INTO payment_history(
                id, payment_id, field_name, old_value, new_value, updated_by,
                reason, created_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                &payment_id,
                field,
                old_value,
                new_value,
                &updated_by,
                &reason,
                &now,
            ],
        );
    }

    let changed: Vec<&str> = changes.iter().map(|(f, _, _)| *f).collect();
    Ok(json!({ "payment": next.to_json(), "changedFields": changed }))
}

fn payments_history(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let payment_id = get_required_str(params, "paymentId")?;
    // Existence check so a bad id reads as not_found, not an empty trail.
    load_payment(conn, &payment_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT field_name, old_value, new_value, updated_by, reason, created_at
             FROM payment_history
             WHERE payment_id = ?
             ORDER BY created_at DESC, rowid DESC",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let entries = stmt
        .query_map([&payment_id], |row| {
            let field_name: String = row.get(0)?;
            let old_value: Option<String> = row.get(1)?;
            let new_value: Option<String> = row.get(2)?;
            let updated_by: String = row.get(3)?;
            let reason: Option<String> = row.get(4)?;
            let created_at: String = row.get(5)?;
            Ok(json!({
                "fieldName": field_name,
                "oldValue": old_value,
                "newValue": new_value,
                "updatedBy": updated_by,
                "reason": reason,
                "createdAt": created_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "history": entries }))
}

fn payments_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let payment_id = get_required_str(params, "paymentId")?;
    load_payment(conn, &payment_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    for sql in [
        "DELETE FROM payment_history WHERE payment_id = ?",
        "DELETE FROM payments WHERE id = ?",
    ] {
        if let Err(e) = tx.execute(sql, [&payment_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr::db("db_update_failed", e));
        }
    }
    tx.commit().map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(json!({ "ok": true }))
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
        "payments.record" => Some(with_conn(state, req, payments_record)),
        "payments.list" => Some(with_conn(state, req, payments_list)),
        "payments.update" => Some(with_conn(state, req, payments_update)),
        "payments.history" => Some(with_conn(state, req, payments_history)),
        "payments.delete" => Some(with_conn(state, req, payments_delete)),
        _ => None,
    }
}
