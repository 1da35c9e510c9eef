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

fn request(
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
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
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

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert!(
        !value.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
        "{} unexpectedly succeeded",
        method
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
        .to_string()
}

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    class_id: &str,
    name: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({ "name": name, "classId": class_id }),
    );
    res.get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string()
}

fn record_payment(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    params: serde_json::Value,
) {
    let _ = request_ok(stdin, reader, id, "payments.record", params);
}

fn pending_for(result: &serde_json::Value, student_id: &str) -> Option<serde_json::Value> {
    result
        .get("pending")
        .and_then(|v| v.as_array())
        .expect("pending array")
        .iter()
        .find(|v| v.get("studentId").and_then(|s| s.as_str()) == Some(student_id))
        .cloned()
}

#[test]
fn pending_fees_reconciliation_end_to_end() {
    let workspace = temp_dir("schoolbook-fees-pending");
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
        json!({ "name": "Grade 5", "section": "A" }),
    );
    let class_id = class_res
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();

    let full = create_student(&mut stdin, &mut reader, "3", &class_id, "Asha Verma");
    let partial = create_student(&mut stdin, &mut reader, "4", &class_id, "Bilal Khan");
    let unpaid = create_student(&mut stdin, &mut reader, "5", &class_id, "Chanda Rao");

    // Asha: settled in May AND June. Bilal: partial in June. Chanda: nothing.
    record_payment(
        &mut stdin,
        &mut reader,
        "6",
        json!({
            "studentId": full,
            "amountReceived": 1000.0,
            "paymentDate": "2025-05-03",
            "paymentMethod": "cash"
        }),
    );
    record_payment(
        &mut stdin,
        &mut reader,
        "7",
        json!({
            "studentId": full,
            "amountReceived": 1000.0,
            "paymentDate": "2025-06-02",
            "paymentMethod": "upi"
        }),
    );
    record_payment(
        &mut stdin,
        &mut reader,
        "8",
        json!({
            "studentId": partial,
            "amountReceived": 800.0,
            "balanceRemaining": 200.0,
            "paymentDate": "2025-06-10",
            "paymentMethod": "cash"
        }),
    );

    let june = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "fees.pending",
        json!({ "month": 6, "year": 2025 }),
    );
    assert!(pending_for(&june, &full).is_none(), "settled student listed");

    let bilal = pending_for(&june, &partial).expect("partial payer pending");
    assert_eq!(bilal.get("totalPending").and_then(|v| v.as_f64()), Some(200.0));
    assert_eq!(bilal.get("totalPaid").and_then(|v| v.as_f64()), Some(800.0));
    assert_eq!(
        bilal.get("pendingReason").and_then(|v| v.as_str()),
        Some("Outstanding balance: 200")
    );
    assert_eq!(
        bilal.get("lastPaymentDate").and_then(|v| v.as_str()),
        Some("2025-06-10")
    );
    assert_eq!(
        bilal.get("classLabel").and_then(|v| v.as_str()),
        Some("Grade 5 A")
    );

    let chanda = pending_for(&june, &unpaid).expect("unpaid student pending");
    assert_eq!(chanda.get("totalPending").and_then(|v| v.as_f64()), Some(1000.0));
    assert_eq!(chanda.get("totalPaid").and_then(|v| v.as_f64()), Some(0.0));
    assert_eq!(
        chanda.get("pendingReason").and_then(|v| v.as_str()),
        Some("No payment record for 6/2025")
    );
    assert!(chanda.get("lastPaymentDate").is_none());

    // Settled status is month-specific: Asha paid May in full but Bilal's
    // June partial does not settle May for him.
    let may = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "fees.pending",
        json!({ "month": 5, "year": 2025 }),
    );
    assert!(pending_for(&may, &full).is_none());
    let bilal_may = pending_for(&may, &partial).expect("bilal pending in may");
    assert_eq!(
        bilal_may.get("pendingReason").and_then(|v| v.as_str()),
        Some("No payment record for 5/2025")
    );
    // All-time paid shows even for an unpaid month.
    assert_eq!(
        bilal_may.get("totalPaid").and_then(|v| v.as_f64()),
        Some(800.0)
    );
}

#[test]
fn pending_accepts_numeric_strings_and_filters_by_class() {
    let workspace = temp_dir("schoolbook-fees-filter");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_a = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "Grade 1" }),
    );
    let class_a = class_a.get("classId").and_then(|v| v.as_str()).unwrap().to_string();
    let class_b = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "classes.create",
        json!({ "name": "Grade 2" }),
    );
    let class_b = class_b.get("classId").and_then(|v| v.as_str()).unwrap().to_string();

    let s_a = create_student(&mut stdin, &mut reader, "4", &class_a, "Student A");
    let _s_b = create_student(&mut stdin, &mut reader, "5", &class_b, "Student B");

    // Query-string callers pass month/year as strings.
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "fees.pending",
        json!({ "month": "6", "year": "2025", "classId": class_a }),
    );
    let pending = res.get("pending").and_then(|v| v.as_array()).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(
        pending[0].get("studentId").and_then(|v| v.as_str()),
        Some(s_a.as_str())
    );
}

#[test]
fn fee_schedule_overrides_apply_in_order() {
    let workspace = temp_dir("schoolbook-fees-schedule");
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
        json!({ "name": "Grade 3", "defaultMonthlyFee": 900.0 }),
    );
    let class_id = class_res.get("classId").and_then(|v| v.as_str()).unwrap().to_string();

    let by_class = create_student(&mut stdin, &mut reader, "3", &class_id, "Class Fee Kid");
    let by_student = create_student(&mut stdin, &mut reader, "4", &class_id, "Own Fee Kid");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.update",
        json!({ "studentId": by_student, "feesAmount": 750.0 }),
    );
    // A student with no class falls back to the workspace default.
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "students.create",
        json!({ "name": "No Class Kid" }),
    );
    let no_class = res.get("studentId").and_then(|v| v.as_str()).unwrap().to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "fees.setDefaultMonthlyFee",
        json!({ "amount": 1100.0 }),
    );

    let pending = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "fees.pending",
        json!({ "month": 6, "year": 2025 }),
    );
    let class_kid = pending_for(&pending, &by_class).expect("class fee kid");
    assert_eq!(class_kid.get("totalPending").and_then(|v| v.as_f64()), Some(900.0));
    let own_kid = pending_for(&pending, &by_student).expect("own fee kid");
    assert_eq!(own_kid.get("totalPending").and_then(|v| v.as_f64()), Some(750.0));
    let ws_kid = pending_for(&pending, &no_class).expect("no class kid");
    assert_eq!(ws_kid.get("totalPending").and_then(|v| v.as_f64()), Some(1100.0));
}

#[test]
fn summary_totals_come_from_the_ledger() {
    let workspace = temp_dir("schoolbook-fees-summary");
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
        json!({ "name": "Grade 4" }),
    );
    let class_id = class_res.get("classId").and_then(|v| v.as_str()).unwrap().to_string();

    let paid = create_student(&mut stdin, &mut reader, "3", &class_id, "Paid Up");
    let part = create_student(&mut stdin, &mut reader, "4", &class_id, "Part Way");
    let _none = create_student(&mut stdin, &mut reader, "5", &class_id, "Not Yet");

    record_payment(
        &mut stdin,
        &mut reader,
        "6",
        json!({
            "studentId": paid,
            "amountReceived": 1000.0,
            "paymentDate": "2025-06-01",
            "paymentMethod": "card"
        }),
    );
    record_payment(
        &mut stdin,
        &mut reader,
        "7",
        json!({
            "studentId": part,
            "amountReceived": 600.0,
            "balanceRemaining": 400.0,
            "paymentDate": "2025-06-14",
            "paymentMethod": "cash"
        }),
    );
    // A May payment must not leak into the June collected total.
    record_payment(
        &mut stdin,
        &mut reader,
        "8",
        json!({
            "studentId": part,
            "amountReceived": 500.0,
            "paymentDate": "2025-05-20",
            "paymentMethod": "cash"
        }),
    );

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "fees.summary",
        json!({ "month": 6, "year": 2025 }),
    );
    assert_eq!(
        summary.get("totalCollected").and_then(|v| v.as_f64()),
        Some(1600.0)
    );
    // Part Way owes 400, Not Yet owes the 1000 default.
    assert_eq!(
        summary.get("totalPending").and_then(|v| v.as_f64()),
        Some(1400.0)
    );
    assert_eq!(
        summary.get("pendingStudentCount").and_then(|v| v.as_u64()),
        Some(2)
    );
    assert_eq!(summary.get("studentCount").and_then(|v| v.as_u64()), Some(3));
}

#[test]
fn malformed_period_is_rejected_before_reconciliation() {
    let workspace = temp_dir("schoolbook-fees-badparams");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let code = request_err_code(&mut stdin, &mut reader, "2", "fees.pending", json!({ "year": 2025 }));
    assert_eq!(code, "bad_params");
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "3",
        "fees.pending",
        json!({ "month": "june", "year": 2025 }),
    );
    assert_eq!(code, "bad_params");
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "4",
        "fees.pending",
        json!({ "month": 13, "year": 2025 }),
    );
    assert_eq!(code, "bad_params");
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "5",
        "fees.summary",
        json!({ "month": 0, "year": 2025 }),
    );
    assert_eq!(code, "bad_params");
}
