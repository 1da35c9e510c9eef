mod backup;
mod db;
mod ipc;
mod reconcile;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

fn main() {
    let mut state = ipc::AppState {
        workspace: None,
        db: None,
    };

    // Optional preselect so supervisors can start the sidecar pointed at a
    // workspace without a workspace.select round trip.
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--workspace" {
            if let Some(path) = args.next().map(PathBuf::from) {
                if let Ok(conn) = db::open_db(&path) {
                    state.workspace = Some(path);
                    state.db = Some(conn);
                }
            }
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No request id to echo back.
                let _ = writeln!(
                    stdout,
                    "{{\"ok\":false,\"error\":{{\"code\":\"bad_json\",\"message\":\"{}\"}}}}",
                    e
                );
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
