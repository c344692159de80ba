// Simulated worker process
//
// Implements the worker contract for tests and demos:
// - Readiness marker on stderr once stdin is being read
// - One JSON-RPC request per stdin line, one response per stdout line
// - Requests handled concurrently, so replies may arrive out of order
//
// Methods:
// - ping            -> "pong"
// - echo            -> params
// - sleep {ms}      -> {"slept_ms": ms} after the delay
// - hang            -> never replies
// - fail            -> server error (-32000)
// - crash {code}    -> exits immediately with `code`
// - pid             -> own process id
//
// Behavior switches (environment):
// - SIM_WORKER_STARTUP_DELAY_MS  delay before the readiness marker
// - SIM_WORKER_SKIP_READY=1      never emit the readiness marker
// - SIM_WORKER_EMIT_GARBAGE=1    write a malformed line and a stray response before each reply
// - SIM_WORKER_IGNORE_PING=1     never answer ping

use std::time::Duration;

use muxpool_protocol::{
    error_codes, write_line, LineReader, Request, Response, RpcError, READY_MARKER,
};
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy)]
struct SimConfig {
    startup_delay: Duration,
    skip_ready: bool,
    emit_garbage: bool,
    ignore_ping: bool,
}

impl SimConfig {
    fn from_env() -> Self {
        let flag = |name: &str| std::env::var(name).map(|v| v == "1").unwrap_or(false);
        Self {
            startup_delay: std::env::var("SIM_WORKER_STARTUP_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(Duration::ZERO),
            skip_ready: flag("SIM_WORKER_SKIP_READY"),
            emit_garbage: flag("SIM_WORKER_EMIT_GARBAGE"),
            ignore_ping: flag("SIM_WORKER_IGNORE_PING"),
        }
    }
}

enum Output {
    Response(Response),
    Raw(String),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    let config = SimConfig::from_env();

    if !config.startup_delay.is_zero() {
        tokio::time::sleep(config.startup_delay).await;
    }

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Output>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(output) = out_rx.recv().await {
            let written = match output {
                Output::Response(response) => write_line(&mut stdout, &response).await.is_ok(),
                Output::Raw(mut line) => {
                    line.push('\n');
                    stdout.write_all(line.as_bytes()).await.is_ok() && stdout.flush().await.is_ok()
                }
            };
            if !written {
                break;
            }
        }
    });

    if !config.skip_ready {
        eprintln!("sim worker pid {} {}", std::process::id(), READY_MARKER);
    }

    let mut lines = LineReader::new(BufReader::new(tokio::io::stdin()));
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(line) = line else {
            eprintln!("sim worker: dropping non-UTF-8 line");
            continue;
        };
        let request = match Request::parse(&line) {
            Ok(request) => request,
            Err(e) => {
                let _ = out_tx.send(Output::Response(Response::failure(
                    Value::Null,
                    RpcError::parse_error(e.to_string()),
                )));
                continue;
            }
        };
        let Some(id) = request.id.clone() else {
            continue;
        };

        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let Some(response) = handle(&config, id, &request).await else {
                return;
            };
            if config.emit_garbage {
                let _ = out_tx.send(Output::Raw("{this is not json".to_string()));
                let _ = out_tx.send(Output::Raw(
                    json!({"jsonrpc": "2.0", "id": "stray", "result": null}).to_string(),
                ));
            }
            let _ = out_tx.send(Output::Response(response));
        });
    }

    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

async fn handle(config: &SimConfig, id: Value, request: &Request) -> Option<Response> {
    let params = request.params.clone().unwrap_or(Value::Null);
    let response = match request.method.as_str() {
        "ping" if config.ignore_ping => return None,
        "ping" => Response::success(id, json!("pong")),
        "echo" => Response::success(id, params),
        "sleep" => {
            let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Response::success(id, json!({ "slept_ms": ms }))
        }
        "hang" => return None,
        "fail" => Response::failure(
            id,
            RpcError::new(error_codes::SERVER_ERROR, "simulated failure"),
        ),
        "crash" => {
            let code = params.get("code").and_then(Value::as_i64).unwrap_or(1);
            std::process::exit(code as i32);
        }
        "pid" => Response::success(id, json!(std::process::id())),
        other => Response::failure(id, RpcError::method_not_found(other)),
    };
    Some(response)
}
