mod calc;
mod config;
mod db;
mod export;
mod forms;
mod import;
mod ipc;
mod retry;
mod telemetry;

use std::io::{self, BufRead, Write};
use tracing::{info, warn};

fn main() {
    let (cfg, cfg_err) = config::load_config_from_env();
    telemetry::init_tracing(&cfg.logging);
    config::report_load(cfg_err.as_ref());
    info!(version = env!("CARGO_PKG_VERSION"), "skilltrackd starting");

    let mut state = ipc::AppState::new(cfg);

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "stdin closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                warn!(error = %e, "unparseable request line");
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
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
    info!("skilltrackd exiting");
}
