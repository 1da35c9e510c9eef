use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{class_exists, get_opt_f64, get_opt_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn classes_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    // Include student counts so the UI can show a useful dashboard.
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.section,
               c.default_monthly_fee,
               (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count
             FROM classes c
             ORDER BY c.name, c.section",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let classes = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let section: Option<String> = row.get(2)?;
            let default_monthly_fee: Option<f64> = row.get(3)?;
            let student_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "section": section,
                "defaultMonthlyFee": default_monthly_fee,
                "studentCount": student_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "classes": classes }))
}

fn classes_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let section = get_opt_str(params, "section")?;
    let default_monthly_fee = get_opt_f64(params, "defaultMonthlyFee")?;
    if let Some(fee) = default_monthly_fee {
        if fee < 0.0 {
            return Err(HandlerErr::bad_params("defaultMonthlyFee must be >= 0"));
        }
    }

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, name, section, default_monthly_fee) VALUES(?, ?, ?, ?)",
        (&class_id, &name, &section, &default_monthly_fee),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "classes" })),
    })?;

    Ok(json!({ "classId": class_id, "name": name }))
}

fn classes_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }

    if let Some(name) = get_opt_str(params, "name")? {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(HandlerErr::bad_params("name must not be empty"));
        }
        conn.execute("UPDATE classes SET name = ? WHERE id = ?", (&name, &class_id))
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if params.get("section").is_some() {
        let section = get_opt_str(params, "section")?;
        conn.execute(
            "UPDATE classes SET section = ? WHERE id = ?",
            (&section, &class_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if params.get("defaultMonthlyFee").is_some() {
        let fee = get_opt_f64(params, "defaultMonthlyFee")?;
        if let Some(f) = fee {
            if f < 0.0 {
                return Err(HandlerErr::bad_params("defaultMonthlyFee must be >= 0"));
            }
        }
        conn.execute(
            "UPDATE classes SET default_monthly_fee = ? WHERE id = ?",
            (&fee, &class_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }

    Ok(json!({ "classId": class_id }))
}

fn classes_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    let steps: &[(&str, &str)] = &[
        (
            "DELETE FROM payment_history
             WHERE payment_id IN (
               SELECT p.id FROM payments p
               JOIN students s ON s.id = p.student_id
               WHERE s.class_id = ?
             )",
            "payment_history",
        ),
        (
            "DELETE FROM payments
             WHERE student_id IN (SELECT id FROM students WHERE class_id = ?)",
            "payments",
        ),
        (
            "DELETE FROM attendance_student_months WHERE class_id = ?",
            "attendance_student_months",
        ),
        (
            "DELETE FROM attendance_months WHERE class_id = ?",
            "attendance_months",
        ),
        ("DELETE FROM students WHERE class_id = ?", "students"),
        ("DELETE FROM classes WHERE id = ?", "classes"),
    ];
    for (sql, table) in steps {
        if let Err(e) = tx.execute(sql, [&class_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr {
                code: "db_update_failed",
                message: e.to_string(),
                details: Some(json!({ "table": table })),
            });
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
        "classes.list" => Some(with_conn(state, req, |c, _p| classes_list(c))),
        "classes.create" => Some(with_conn(state, req, classes_create)),
        "classes.update" => Some(with_conn(state, req, classes_update)),
        "classes.delete" => Some(with_conn(state, req, classes_delete)),
        _ => None,
    }
}
