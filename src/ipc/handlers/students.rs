use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    class_exists, get_opt_f64, get_opt_str, get_required_str, now_iso, parse_iso_date,
    student_exists, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn student_row_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let class_id: Option<String> = row.get(1)?;
    let name: String = row.get(2)?;
    let father_name: Option<String> = row.get(3)?;
    let mother_name: Option<String> = row.get(4)?;
    let father_phone: Option<String> = row.get(5)?;
    let mother_phone: Option<String> = row.get(6)?;
    let photo_url: Option<String> = row.get(7)?;
    let date_of_birth: Option<String> = row.get(8)?;
    let fees_amount: Option<f64> = row.get(9)?;
    let class_name: Option<String> = row.get(10)?;
    let class_section: Option<String> = row.get(11)?;
    Ok(json!({
        "id": id,
        "classId": class_id,
        "name": name,
        "fatherName": father_name,
        "motherName": mother_name,
        "fatherPhone": father_phone,
        "motherPhone": mother_phone,
        "photoUrl": photo_url,
        "dateOfBirth": date_of_birth,
        "feesAmount": fees_amount,
        "className": class_name,
        "classSection": class_section
    }))
}

const STUDENT_SELECT: &str = "SELECT
       s.id, s.class_id, s.name, s.father_name, s.mother_name,
       s.father_phone, s.mother_phone, s.photo_url, s.date_of_birth,
       s.fees_amount, c.name, c.section
     FROM students s
     LEFT JOIN classes c ON c.id = s.class_id";

/// Roster load: full roster (or one class), class name/section denormalized.
/// No pagination; the reconciliation path wants everything.
fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_filter = get_opt_str(params, "classId")?;

    let sql = match &class_filter {
        Some(_) => format!(
            "{} WHERE s.class_id = ? ORDER BY s.sort_order, s.name",
            STUDENT_SELECT
        ),
        None => format!("{} ORDER BY c.name, s.sort_order, s.name", STUDENT_SELECT),
    };
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let students = match &class_filter {
        Some(cid) => stmt
            .query_map([cid], student_row_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], student_row_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    }
    .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "students": students }))
}

fn validate_optional_dob(params: &serde_json::Value) -> Result<Option<String>, HandlerErr> {
    let Some(raw) = get_opt_str(params, "dateOfBirth")? else {
        return Ok(None);
    };
    let parsed = parse_iso_date(&raw, "dateOfBirth")?;
    Ok(Some(parsed.format("%Y-%m-%d").to_string()))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let class_id = get_opt_str(params, "classId")?;
    if let Some(cid) = &class_id {
        if !class_exists(conn, cid)? {
            return Err(HandlerErr::not_found("class not found"));
        }
    }
    let fees_amount = get_opt_f64(params, "feesAmount")?;
    if let Some(f) = fees_amount {
        if f < 0.0 {
            return Err(HandlerErr::bad_params("feesAmount must be >= 0"));
        }
    }
    let date_of_birth = validate_optional_dob(params)?;

    let next_sort: i64 = match &class_id {
        Some(cid) => conn
            .query_row(
                "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?",
                [cid],
                |r| r.get(0),
            )
            .map_err(|e| HandlerErr::db("db_query_failed", e))?,
        None => 0,
    };

    let student_id = Uuid::new_v4().to_string();
    let now = now_iso();
    conn.execute(
        "INSERT INTO students(
            id, class_id, name, father_name, mother_name, father_phone,
            mother_phone, photo_url, date_of_birth, fees_amount, sort_order,
            created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &student_id,
            &class_id,
            &name,
            &get_opt_str(params, "fatherName")?,
            &get_opt_str(params, "motherName")?,
            &get_opt_str(params, "fatherPhone")?,
            &get_opt_str(params, "motherPhone")?,
            &get_opt_str(params, "photoUrl")?,
            &date_of_birth,
            &fees_amount,
            next_sort,
            &now,
            &now,
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "students" })),
    })?;

    Ok(json!({ "studentId": student_id, "name": name }))
}

fn students_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    // Partial update: only keys present in params are touched.
    let mut sets: Vec<(&str, rusqlite::types::Value)> = Vec::new();
    if let Some(name) = get_opt_str(params, "name")? {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(HandlerErr::bad_params("name must not be empty"));
        }
        sets.push(("name", name.into()));
    }
    if params.get("classId").is_some() {
        let class_id = get_opt_str(params, "classId")?;
        if let Some(cid) = &class_id {
            if !class_exists(conn, cid)? {
                return Err(HandlerErr::not_found("class not found"));
            }
        }
        sets.push((
            "class_id",
            match class_id {
                Some(v) => v.into(),
                None => rusqlite::types::Value::Null,
            },
        ));
    }
    for (key, column) in [
        ("fatherName", "father_name"),
        ("motherName", "mother_name"),
        ("fatherPhone", "father_phone"),
        ("motherPhone", "mother_phone"),
        ("photoUrl", "photo_url"),
    ] {
        if params.get(key).is_some() {
            sets.push((
                column,
                match get_opt_str(params, key)? {
                    Some(v) => v.into(),
                    None => rusqlite::types::Value::Null,
                },
            ));
        }
    }
    if params.get("dateOfBirth").is_some() {
        sets.push((
            "date_of_birth",
            match validate_optional_dob(params)? {
                Some(v) => v.into(),
                None => rusqlite::types::Value::Null,
            },
        ));
    }
    if params.get("feesAmount").is_some() {
        let fee = get_opt_f64(params, "feesAmount")?;
        if let Some(f) = fee {
            if f < 0.0 {
                return Err(HandlerErr::bad_params("feesAmount must be >= 0"));
            }
        }
        sets.push((
            "fees_amount",
            match fee {
                Some(v) => v.into(),
                None => rusqlite::types::Value::Null,
            },
        ));
    }

    if sets.is_empty() {
        return Err(HandlerErr::bad_params("no fields to update"));
    }

    let assignments: Vec<String> = sets.iter().map(|(col, _)| format!("{} = ?", col)).collect();
    let sql = format!(
        "UPDATE students SET {}, updated_at = ? WHERE id = ?",
        assignments.join(", ")
    );
    let mut values: Vec<rusqlite::types::Value> =
        sets.into_iter().map(|(_, v)| v).collect();
    values.push(now_iso().into());
    values.push(student_id.clone().into());

    conn.execute(&sql, rusqlite::params_from_iter(values))
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;

    Ok(json!({ "studentId": student_id }))
}

fn students_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    // Payments (and their audit trail) are exclusively owned by the student.
    let steps: &[&str] = &[
        "DELETE FROM payment_history
         WHERE payment_id IN (SELECT id FROM payments WHERE student_id = ?)",
        "DELETE FROM payments WHERE student_id = ?",
        "DELETE FROM attendance_student_months WHERE student_id = ?",
        "DELETE FROM students WHERE id = ?",
    ];
    for sql in steps {
        if let Err(e) = tx.execute(sql, [&student_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr::db("db_update_failed", e));
        }
    }

    tx.commit().map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn students_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let sql = format!("{} WHERE s.id = ?", STUDENT_SELECT);
    let student = conn
        .query_row(&sql, [&student_id], student_row_json)
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("student not found"))?;
    Ok(json!({ "student": student }))
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
        "students.list" => Some(with_conn(state, req, students_list)),
        "students.get" => Some(with_conn(state, req, students_get)),
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.update" => Some(with_conn(state, req, students_update)),
        "students.delete" => Some(with_conn(state, req, students_delete)),
        _ => None,
    }
}
