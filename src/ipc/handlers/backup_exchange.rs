use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{class_exists, get_required_str, now_iso, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;
use std::path::PathBuf;
use uuid::Uuid;

const STUDENTS_CSV_HEADER: &str =
    "name,fatherName,motherName,fatherPhone,motherPhone,dateOfBirth,feesAmount";

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(buf);
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    out.push(buf);
    out
}

fn handle_backup_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) => PathBuf::from(v),
        None => return err(&req.id, "bad_params", "missing outPath", None),
    };

    match backup::export_workspace_bundle(&workspace, &out_path) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "bundleFormat": summary.bundle_format,
                "entryCount": summary.entry_count,
                "outPath": out_path.to_string_lossy()
            }),
        ),
        Err(e) => err(&req.id, "backup_export_failed", format!("{e:?}"), None),
    }
}

fn handle_backup_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(v) => PathBuf::from(v),
        None => return err(&req.id, "bad_params", "missing inPath", None),
    };
    let workspace_path = match req.params.get("workspacePath").and_then(|v| v.as_str()) {
        Some(v) => PathBuf::from(v),
        None => return err(&req.id, "bad_params", "missing workspacePath", None),
    };

    // Drop any open connection before the database file is replaced.
    state.db = None;
    state.workspace = None;

    let summary = match backup::import_workspace_bundle(&in_path, &workspace_path) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "backup_import_failed", format!("{e:?}"), None),
    };
    match db::open_db(&workspace_path) {
        Ok(conn) => {
            state.workspace = Some(workspace_path.clone());
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "bundleFormatDetected": summary.bundle_format_detected,
                    "workspacePath": workspace_path.to_string_lossy()
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

fn export_students_csv(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let out_path = PathBuf::from(get_required_str(params, "outPath")?);
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT name, father_name, mother_name, father_phone, mother_phone,
                    date_of_birth, fees_amount
             FROM students WHERE class_id = ? ORDER BY sort_order, name",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map([&class_id], |r| {
            let name: String = r.get(0)?;
            let father: Option<String> = r.get(1)?;
            let mother: Option<String> = r.get(2)?;
            let father_phone: Option<String> = r.get(3)?;
            let mother_phone: Option<String> = r.get(4)?;
            let dob: Option<String> = r.get(5)?;
            let fees: Option<f64> = r.get(6)?;
            Ok((name, father, mother, father_phone, mother_phone, dob, fees))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut text = String::from(STUDENTS_CSV_HEADER);
    text.push('\n');
    let count = rows.len();
    for (name, father, mother, father_phone, mother_phone, dob, fees) in rows {
        let fields = [
            csv_quote(&name),
            csv_quote(father.as_deref().unwrap_or("")),
            csv_quote(mother.as_deref().unwrap_or("")),
            csv_quote(father_phone.as_deref().unwrap_or("")),
            csv_quote(mother_phone.as_deref().unwrap_or("")),
            csv_quote(dob.as_deref().unwrap_or("")),
            fees.map(|f| format!("{}", f)).unwrap_or_default(),
        ];
        text.push_str(&fields.join(","));
        text.push('\n');
    }

    std::fs::write(&out_path, text).map_err(|e| HandlerErr {
        code: "file_write_failed",
        message: e.to_string(),
        details: Some(json!({ "path": out_path.to_string_lossy() })),
    })?;

    Ok(json!({ "exported": count, "outPath": out_path.to_string_lossy() }))
}

/// Bulk roster entry from a CSV sheet. Bad lines produce warnings and are
/// skipped; good lines import in one transaction.
fn import_students_csv(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let in_path = PathBuf::from(get_required_str(params, "inPath")?);
    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::not_found("class not found"));
    }

    let text = std::fs::read_to_string(&in_path).map_err(|e| HandlerErr {
        code: "file_read_failed",
        message: e.to_string(),
        details: Some(json!({ "path": in_path.to_string_lossy() })),
    })?;

    struct ParsedRow {
        name: String,
        father_name: Option<String>,
        mother_name: Option<String>,
        father_phone: Option<String>,
        mother_phone: Option<String>,
        date_of_birth: Option<String>,
        fees_amount: Option<f64>,
    }

    let opt = |s: &str| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    };

    let mut parsed: Vec<ParsedRow> = Vec::new();
    let mut warnings: Vec<serde_json::Value> = Vec::new();
    for (line_no, raw_line) in text.lines().enumerate() {
        if line_no == 0 {
            continue;
        }
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        let fields = parse_csv_record(line);
        if fields.len() < 7 {
            warnings.push(json!({
                "line": line_no + 1,
                "code": "bad_columns",
                "message": "expected 7 CSV columns"
            }));
            continue;
        }
        let name = fields[0].trim().to_string();
        if name.is_empty() {
            warnings.push(json!({
                "line": line_no + 1,
                "code": "missing_name",
                "message": "name must not be empty"
            }));
            continue;
        }
        let date_of_birth = match opt(&fields[5]) {
            None => None,
            Some(raw) => match NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
                Ok(d) => Some(d.format("%Y-%m-%d").to_string()),
                Err(_) => {
                    warnings.push(json!({
                        "line": line_no + 1,
                        "code": "bad_date",
                        "message": "dateOfBirth must be YYYY-MM-DD"
                    }));
                    continue;
                }
            },
        };
        let fees_amount = match opt(&fields[6]) {
            None => None,
            Some(raw) => match raw.parse::<f64>() {
                Ok(f) if f >= 0.0 => Some(f),
                _ => {
                    warnings.push(json!({
                        "line": line_no + 1,
                        "code": "bad_fee",
                        "message": "feesAmount must be a number >= 0"
                    }));
                    continue;
                }
            },
        };
        parsed.push(ParsedRow {
            name,
            father_name: opt(&fields[1]),
            mother_name: opt(&fields[2]),
            father_phone: opt(&fields[3]),
            mother_phone: opt(&fields[4]),
            date_of_birth,
            fees_amount,
        });
    }

    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let now = now_iso();
    for (i, row) in parsed.iter().enumerate() {
        if let Err(e) = tx.execute(
            "INSERT INTO students(
                id, class_id, name, father_name, mother_name, father_phone,
                mother_phone, photo_url, date_of_birth, fees_amount, sort_order,
                created_at, updated_at
             ) VALUES(?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, ?, ?, ?)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                &class_id,
                &row.name,
                &row.father_name,
                &row.mother_name,
                &row.father_phone,
                &row.mother_phone,
                &row.date_of_birth,
                &row.fees_amount,
                next_sort + i as i64,
                &now,
                &now,
            ],
        ) {
            let _ = tx.rollback();
            return Err(HandlerErr {
                code: "db_insert_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "students" })),
            });
        }
    }
    tx.commit().map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({ "imported": parsed.len(), "warnings": warnings }))
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
        "backup.export" => Some(handle_backup_export(state, req)),
        "backup.import" => Some(handle_backup_import(state, req)),
        "exchange.exportStudentsCsv" => Some(with_conn(state, req, export_students_csv)),
        "exchange.importStudentsCsv" => Some(with_conn(state, req, import_students_csv)),
        _ => None,
    }
}
