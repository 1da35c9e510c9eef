use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{class_exists, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;

const CODE_PRESENT: char = 'P';
const CODE_ABSENT: char = 'A';
const CODE_LATE: char = 'L';

fn parse_month_key(month: &str) -> Result<(i32, u32), HandlerErr> {
    let t = month.trim();
    let Some((y, m)) = t.split_once('-') else {
        return Err(HandlerErr::bad_params("month must be YYYY-MM"));
    };
    let year = y
        .parse::<i32>()
        .map_err(|_| HandlerErr::bad_params("month year must be numeric"))?;
    let month_num = m
        .parse::<u32>()
        .map_err(|_| HandlerErr::bad_params("month must be YYYY-MM"))?;
    if !(1..=12).contains(&month_num) {
        return Err(HandlerErr::bad_params("month must be between 01 and 12"));
    }
    Ok((year, month_num))
}

fn days_in_month(year: i32, month: u32) -> usize {
    let leap = (year % 4 == 0 && year % 100 != 0) || year % 400 == 0;
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if leap => 29,
        2 => 28,
        _ => 30,
    }
}

fn normalize_day_codes(raw: &str, days: usize) -> String {
    let mut chars: Vec<char> = raw.chars().collect();
    if chars.len() < days {
        chars.extend(std::iter::repeat(' ').take(days - chars.len()));
    } else if chars.len() > days {
        chars.truncate(days);
    }
    chars.into_iter().collect()
}

fn patch_day_code(existing: &str, days: usize, day: usize, code: Option<char>) -> String {
    let mut chars: Vec<char> = normalize_day_codes(existing, days).chars().collect();
    let idx = day.saturating_sub(1);
    if idx < chars.len() {
        chars[idx] = code.unwrap_or(' ');
    }
    chars.into_iter().collect()
}

fn tally(day_codes: &str) -> (usize, usize, usize) {
    let mut present = 0;
    let mut absent = 0;
    let mut late = 0;
    for c in day_codes.chars() {
        match c {
            CODE_PRESENT => present += 1,
            CODE_ABSENT => absent += 1,
            CODE_LATE => late += 1,
            _ => {}
        }
    }
    (present, absent, late)
}

fn parse_optional_code_char(v: Option<&serde_json::Value>) -> Result<Option<char>, HandlerErr> {
    let Some(v) = v else { return Ok(None) };
    if v.is_null() {
        return Ok(None);
    }
    let Some(s) = v.as_str() else {
        return Err(HandlerErr::bad_params("code must be string or null"));
    };
    let t = s.trim();
    if t.is_empty() {
        return Ok(None);
    }
    Ok(t.chars().next())
}

fn day_in_range(params: &serde_json::Value, days: usize) -> Result<usize, HandlerErr> {
    let day = params
        .get("day")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| HandlerErr::bad_params("missing day"))? as usize;
    if day == 0 || day > days {
        return Err(HandlerErr::bad_params("day out of range for month"));
    }
    Ok(day)
}

struct RegisterStudent {
    id: String,
    name: String,
}

fn roster_for_class(conn: &Connection, class_id: &str) -> Result<Vec<RegisterStudent>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name FROM students WHERE class_id = ? ORDER BY sort_order, name",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    stmt.query_map([class_id], |r| {
        Ok(RegisterStudent {
            id: r.get(0)?,
            name: r.get(1)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn attendance_month_open(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let month_key = get_required_str(params, "month")?;
    let (year, month_num) = parse_month_key(&month_key)?;
    let days = days_in_month(year, month_num);

    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }
    let students = roster_for_class(conn, &class_id)?;

    let type_of_day_codes_raw: Option<String> = conn
        .query_row(
            "SELECT type_of_day_codes FROM attendance_months WHERE class_id = ? AND month = ?",
            (&class_id, &month_key),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let type_of_day_codes =
        normalize_day_codes(type_of_day_codes_raw.as_deref().unwrap_or(""), days);

    let mut by_student: HashMap<String, String> = HashMap::new();
    let mut stmt = conn
        .prepare(
            "SELECT student_id, day_codes
             FROM attendance_student_months
             WHERE class_id = ? AND month = ?",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map((&class_id, &month_key), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    for (student_id, day_codes) in rows {
        by_student.insert(student_id, normalize_day_codes(&day_codes, days));
    }

    let rows_json: Vec<serde_json::Value> = students
        .iter()
        .map(|s| {
            let day_codes = by_student
                .get(&s.id)
                .cloned()
                .unwrap_or_else(|| normalize_day_codes("", days));
            let (present, absent, late) = tally(&day_codes);
            json!({
                "studentId": s.id,
                "name": s.name,
                "dayCodes": day_codes,
                "presentCount": present,
                "absentCount": absent,
                "lateCount": late
            })
        })
        .collect();

    Ok(json!({
        "month": month_key,
        "daysInMonth": days,
        "typeOfDayCodes": type_of_day_codes,
        "rows": rows_json
    }))
}

fn attendance_set_type_of_day(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let month_key = get_required_str(params, "month")?;
    let (year, month_num) = parse_month_key(&month_key)?;
    let days = days_in_month(year, month_num);
    let day = day_in_range(params, days)?;
    let code = parse_optional_code_char(params.get("code"))?;

    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }
    let existing: Option<String> = conn
        .query_row(
            "SELECT type_of_day_codes FROM attendance_months WHERE class_id = ? AND month = ?",
            (&class_id, &month_key),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let patched = patch_day_code(existing.as_deref().unwrap_or(""), days, day, code);
    conn.execute(
        "INSERT INTO attendance_months(class_id, month, type_of_day_codes)
         VALUES(?, ?, ?)
         ON CONFLICT(class_id, month) DO UPDATE SET
           type_of_day_codes = excluded.type_of_day_codes",
        (&class_id, &month_key, &patched),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance_months" })),
    })?;
    Ok(json!({ "ok": true }))
}

fn upsert_student_day(
    conn: &Connection,
    class_id: &str,
    student_id: &str,
    month_key: &str,
    days: usize,
    day: usize,
    code: Option<char>,
) -> Result<(), HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT day_codes FROM attendance_student_months
             WHERE class_id = ? AND student_id = ? AND month = ?",
            (class_id, student_id, month_key),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let patched = patch_day_code(existing.as_deref().unwrap_or(""), days, day, code);
    conn.execute(
        "INSERT INTO attendance_student_months(class_id, student_id, month, day_codes)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(class_id, student_id, month) DO UPDATE SET
           day_codes = excluded.day_codes",
        (class_id, student_id, month_key, &patched),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "attendance_student_months" })),
    })?;
    Ok(())
}

fn attendance_set_student_day(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let month_key = get_required_str(params, "month")?;
    let student_id = get_required_str(params, "studentId")?;
    let (year, month_num) = parse_month_key(&month_key)?;
    let days = days_in_month(year, month_num);
    let day = day_in_range(params, days)?;
    let code = parse_optional_code_char(params.get("code"))?;

    let in_class = conn
        .query_row(
            "SELECT 1 FROM students WHERE class_id = ? AND id = ?",
            (&class_id, &student_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .is_some();
    if !in_class {
        return Err(HandlerErr::not_found("student not found"));
    }

    upsert_student_day(conn, &class_id, &student_id, &month_key, days, day, code)?;
    Ok(json!({ "ok": true }))
}

fn attendance_bulk_stamp_day(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let month_key = get_required_str(params, "month")?;
    let (year, month_num) = parse_month_key(&month_key)?;
    let days = days_in_month(year, month_num);
    let day = day_in_range(params, days)?;
    let code = parse_optional_code_char(params.get("code"))?;
    let Some(student_ids_json) = params.get("studentIds").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing studentIds"));
    };
    let student_ids: Vec<String> = student_ids_json
        .iter()
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let mut stamped = 0usize;
    for student_id in student_ids {
        let exists = tx
            .query_row(
                "SELECT 1 FROM students WHERE class_id = ? AND id = ?",
                (&class_id, &student_id),
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?
            .is_some();
        if !exists {
            continue;
        }
        upsert_student_day(&tx, &class_id, &student_id, &month_key, days, day, code)?;
        stamped += 1;
    }
    tx.commit().map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(json!({ "stamped": stamped }))
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
        "attendance.monthOpen" => Some(with_conn(state, req, attendance_month_open)),
        "attendance.setTypeOfDay" => Some(with_conn(state, req, attendance_set_type_of_day)),
        "attendance.setStudentDay" => Some(with_conn(state, req, attendance_set_student_day)),
        "attendance.bulkStampDay" => Some(with_conn(state, req, attendance_bulk_stamp_day)),
        _ => None,
    }
}
