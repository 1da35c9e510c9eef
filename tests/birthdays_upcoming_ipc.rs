use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoolbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoolbookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn add_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    class_id: &str,
    name: &str,
    dob: &str,
) {
    let _ = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({
            "name": name,
            "classId": class_id,
            "dateOfBirth": dob,
            "fatherPhone": "+91-9111111111"
        }),
    );
}

#[test]
fn upcoming_window_sorts_and_wraps_the_year() {
    let workspace = temp_dir("schoolbook-birthdays");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_res = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Grade 10" }),
    );
    let class_id = class_res.get("classId").and_then(|v| v.as_str()).unwrap().to_string();

    add_student(&mut stdin, &mut reader, "3", &class_id, "New Year Kid", "2015-01-02");
    add_student(&mut stdin, &mut reader, "4", &class_id, "Same Day Kid", "2016-12-28");
    add_student(&mut stdin, &mut reader, "5", &class_id, "Far Away Kid", "2015-07-15");
    // No date of birth: never listed.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.create",
        json!({ "name": "No Dob Kid", "classId": class_id }),
    );

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "birthdays.upcoming",
        json!({ "onDate": "2025-12-28", "withinDays": 7 }),
    );
    let birthdays = res.get("birthdays").and_then(|v| v.as_array()).unwrap();
    assert_eq!(birthdays.len(), 2);
    // Same-day first, then the wrap into January.
    assert_eq!(
        birthdays[0].get("name").and_then(|v| v.as_str()),
        Some("Same Day Kid")
    );
    assert_eq!(birthdays[0].get("daysUntil").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(birthdays[0].get("turningAge").and_then(|v| v.as_i64()), Some(9));
    assert_eq!(
        birthdays[1].get("name").and_then(|v| v.as_str()),
        Some("New Year Kid")
    );
    assert_eq!(birthdays[1].get("daysUntil").and_then(|v| v.as_i64()), Some(5));
    assert_eq!(
        birthdays[1].get("birthdayOn").and_then(|v| v.as_str()),
        Some("2026-01-02")
    );
    assert_eq!(birthdays[1].get("turningAge").and_then(|v| v.as_i64()), Some(11));
    // Contact numbers ride along for the notification sender.
    assert_eq!(
        birthdays[0].get("fatherPhone").and_then(|v| v.as_str()),
        Some("+91-9111111111")
    );

    // A wider window picks up the July birthday too.
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "birthdays.upcoming",
        json!({ "onDate": "2025-12-28", "withinDays": 366 }),
    );
    let birthdays = res.get("birthdays").and_then(|v| v.as_array()).unwrap();
    assert_eq!(birthdays.len(), 3);
}
