//! Worker binary exercised by the integration tests.
//!
//! Serves a small set of methods on the channel named by `TETHER_CHANNEL_ID`.

use std::time::Duration;

use anyhow::Context;
use serde_json::{Value, json};
use tether::{MethodTable, ThrownValue, logging, remote_method, run_worker};

remote_method! {
    Add = "add", (i64, i64) -> i64
}

remote_method! {
    /// Sleeps for the given number of milliseconds.
    Slow = "slow", (u64,) -> String
}

remote_method! {
    Pid = "pid", () -> u32
}

remote_method! {
    /// Starts a long-lived child of the worker and returns its pid.
    SpawnGrandchild = "spawnGrandchild", () -> u32
}

fn methods() -> MethodTable {
    MethodTable::builder()
        .method::<Add, _, _>(|(a, b)| async move { Ok(a + b) })
        .raw("fail", |_| async { anyhow::bail!("boom") })
        .raw("throwValue", |_| async {
            Err(anyhow::Error::new(ThrownValue(json!({"reason": "thrown"}))))
        })
        .method::<Slow, _, _>(|(ms,)| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok("slow".to_string())
        })
        .raw("fast", |_| async { Ok(json!("fast")) })
        .method::<Pid, _, _>(|()| async { Ok(std::process::id()) })
        .method::<SpawnGrandchild, _, _>(|()| async {
            let child = std::process::Command::new("sleep")
                .arg("60")
                .spawn()
                .context("failed to spawn grandchild")?;
            Ok(child.id())
        })
        .raw("echo", |params| async move { Ok(Value::Array(params)) })
        .build()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    run_worker(methods()).await?;
    Ok(())
}
