/*
 * Copyright 2024 Oxide Computer Company
 */

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::Instant;

use anyhow::Result;
use chrono::prelude::*;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

fn spawn_reader<T>(
    tx: mpsc::UnboundedSender<Activity>,
    name: &str,
    stream: Option<T>,
) -> Option<JoinHandle<()>>
where
    T: AsyncRead + Unpin + Send + 'static,
{
    let name = name.to_string();
    let stream = stream?;

    Some(tokio::spawn(async move {
        let mut r = BufReader::new(stream);

        loop {
            let mut buf: Vec<u8> = Vec::new();

            /*
             * We have no particular control over the output from the child
             * processes we run, so we read until a newline character without
             * relying on totally valid UTF-8 output.
             */
            match r.read_until(b'\n', &mut buf).await {
                Ok(0) => {
                    /*
                     * EOF.
                     */
                    return;
                }
                Ok(_) => {
                    let s = String::from_utf8_lossy(&buf);

                    if tx.send(Activity::msg(&name, s.trim_end())).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tx.send(Activity::err(&format!(
                        "failed to read {}: {:?}",
                        name, e
                    )))
                    .ok();
                    return;
                }
            }
        }
    }))
}

#[derive(Debug, Clone)]
pub struct ExitDetails {
    pub duration_ms: u64,
    pub when: DateTime<Utc>,
    pub code: i32,
    pub killed: bool,
}

#[derive(Debug, Clone)]
pub struct OutputDetails {
    pub stream: String,
    pub msg: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug)]
pub enum Activity {
    Output(OutputDetails),
    Exit(ExitDetails),
    Complete,
}

impl Activity {
    fn exit(
        start: &Instant,
        end: &Instant,
        code: i32,
        killed: bool,
    ) -> Activity {
        Activity::Exit(ExitDetails {
            duration_ms: end.duration_since(*start).as_millis() as u64,
            when: Utc::now(),
            code,
            killed,
        })
    }

    fn msg(stream: &str, msg: &str) -> Activity {
        Activity::Output(OutputDetails {
            stream: stream.to_string(),
            msg: msg.to_string(),
            time: Utc::now(),
        })
    }

    fn err(msg: &str) -> Activity {
        Activity::msg("error", msg)
    }
}

/**
 * A child process that is running, or has recently run.  Activity arrives on
 * the channel in order, ending with an Exit record and then Complete.
 */
pub struct Running {
    pub activity: mpsc::UnboundedReceiver<Activity>,
    pub kill: Killer,
}

/**
 * Terminates the child process, if it is still running.
 */
pub struct Killer(Option<oneshot::Sender<()>>);

impl Killer {
    pub fn kill(&mut self) {
        if let Some(tx) = self.0.take() {
            tx.send(()).ok();
        }
    }
}

pub fn run(mut cmd: Command) -> Result<Running> {
    let (tx, rx) = mpsc::unbounded_channel::<Activity>();
    let (killtx, killrx) = oneshot::channel::<()>();

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let start = Instant::now();
    let mut child = cmd.spawn()?;

    let readout = spawn_reader(tx.clone(), "stdout", child.stdout.take());
    let readerr = spawn_reader(tx.clone(), "stderr", child.stderr.take());

    tokio::spawn(async move {
        let mut killed = false;
        let wait = tokio::select! {
            w = child.wait() => w,
            res = killrx => {
                /*
                 * If the Killer was dropped without being used, the child is
                 * left to run to completion.
                 */
                if res.is_ok() {
                    killed = true;
                    child.start_kill().ok();
                }
                child.wait().await
            }
        };
        let end = Instant::now();

        /*
         * Join the stdout and stderr readers here to ensure that all output
         * is passed to the channel before the exit record.
         */
        if let Some(t) = readout {
            t.await.ok();
        }
        if let Some(t) = readerr {
            t.await.ok();
        }

        match wait {
            Err(e) => {
                tx.send(Activity::err(&format!("child wait error: {:?}", e)))
                    .ok();
                tx.send(Activity::exit(&start, &end, i32::MAX, killed)).ok();
            }
            Ok(es) => {
                if let Some(sig) = es.signal() {
                    tx.send(Activity::err(&format!(
                        "child terminated by signal {}",
                        sig
                    )))
                    .ok();
                }
                let code = es.code().unwrap_or(i32::MAX);
                tx.send(Activity::exit(&start, &end, code, killed)).ok();
            }
        }

        tx.send(Activity::Complete).ok();
    });

    Ok(Running { activity: rx, kill: Killer(Some(killtx)) })
}
