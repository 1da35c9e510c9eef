use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_opt_str, parse_iso_date, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::{Datelike, NaiveDate};
use rusqlite::Connection;
use serde_json::json;

const DEFAULT_WINDOW_DAYS: i64 = 7;
const MAX_WINDOW_DAYS: i64 = 366;

/// Next observance of the birthday on or after `on`, plus the age being
/// turned. Feb 29 birthdays are observed on Mar 1 in non-leap years.
fn next_birthday(dob: NaiveDate, on: NaiveDate) -> (NaiveDate, i32) {
    for year in [on.year(), on.year() + 1] {
        let candidate = NaiveDate::from_ymd_opt(year, dob.month(), dob.day())
            .or_else(|| NaiveDate::from_ymd_opt(year, 3, 1));
        if let Some(d) = candidate {
            if d >= on {
                return (d, year - dob.year());
            }
        }
    }
    // Two consecutive years always yield an observance on or after `on`.
    (on, 0)
}

fn birthdays_upcoming(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let within_days = match params.get("withinDays") {
        None => DEFAULT_WINDOW_DAYS,
        Some(v) => v
            .as_i64()
            .filter(|d| (0..=MAX_WINDOW_DAYS).contains(d))
            .ok_or_else(|| {
                HandlerErr::bad_params(format!(
                    "withinDays must be between 0 and {}",
                    MAX_WINDOW_DAYS
                ))
            })?,
    };
    let on = match get_opt_str(params, "onDate")? {
        Some(raw) => parse_iso_date(&raw, "onDate")?,
        None => chrono::Utc::now().date_naive(),
    };

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, s.date_of_birth, s.father_phone, s.mother_phone, c.name
             FROM students s
             LEFT JOIN classes c ON c.id = s.class_id
             WHERE s.date_of_birth IS NOT NULL",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let dob: String = r.get(2)?;
            let father_phone: Option<String> = r.get(3)?;
            let mother_phone: Option<String> = r.get(4)?;
            let class_name: Option<String> = r.get(5)?;
            Ok((id, name, dob, father_phone, mother_phone, class_name))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut upcoming: Vec<(i64, String, serde_json::Value)> = Vec::new();
    for (id, name, dob_raw, father_phone, mother_phone, class_name) in rows {
        // Lookahead is best-effort: a malformed stored date drops the row
        // rather than failing the whole listing.
        let Ok(dob) = NaiveDate::parse_from_str(&dob_raw, "%Y-%m-%d") else {
            continue;
        };
        let (observed, turning_age) = next_birthday(dob, on);
        let days_until = (observed - on).num_days();
        if days_until > within_days {
            continue;
        }
        upcoming.push((
            days_until,
            name.clone(),
            json!({
                "studentId": id,
                "name": name,
                "className": class_name,
                "dateOfBirth": dob_raw,
                "birthdayOn": observed.format("%Y-%m-%d").to_string(),
                "daysUntil": days_until,
                "turningAge": turning_age,
                "fatherPhone": father_phone,
                "motherPhone": mother_phone
            }),
        ));
    }
    upcoming.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let birthdays: Vec<serde_json::Value> = upcoming.into_iter().map(|(_, _, v)| v).collect();
    Ok(json!({
        "onDate": on.format("%Y-%m-%d").to_string(),
        "withinDays": within_days,
        "birthdays": birthdays
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "birthdays.upcoming" => {
            let Some(conn) = state.db.as_ref() else {
                return Some(err(&req.id, "no_workspace", "select a workspace first", None));
            };
            Some(match birthdays_upcoming(conn, &req.params) {
                Ok(result) => ok(&req.id, result),
                Err(error) => error.response(&req.id),
            })
        }
        _ => None,
    }
}
