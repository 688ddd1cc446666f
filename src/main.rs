use slotdb::{Engine, QueryOutput};
use std::io::{self, BufRead, Write};

/// Reads one JSON plan document per line and executes it against the
/// database directory given as the first argument.
fn main() {
    env_logger::init();

    let db_dir = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "./data".to_string());

    let engine = match Engine::open(&db_dir) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("failed to open database at {}: {}", db_dir, e);
            std::process::exit(1);
        }
    };

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let doc: serde_json::Value = match serde_json::from_str(line) {
            Ok(doc) => doc,
            Err(e) => {
                eprintln!("invalid plan document: {}", e);
                continue;
            }
        };

        match engine.execute(&doc) {
            Ok(output) => print_output(&output),
            Err(e) => eprintln!("error: {}", e),
        }

        stdout.flush().unwrap();
    }
}

fn print_output(output: &QueryOutput) {
    match output {
        QueryOutput::Rows(rows) => {
            for row in rows {
                match serde_json::to_string(row) {
                    Ok(line) => println!("{}", line),
                    Err(e) => eprintln!("error: {}", e),
                }
            }
        }
        QueryOutput::Inserted(ids) => {
            println!("inserted {}", ids.len());
        }
        QueryOutput::Deleted(ids) => {
            println!("deleted {}", ids.len());
        }
        QueryOutput::Updated(ids) => {
            println!("updated {}", ids.len());
        }
    }
}
