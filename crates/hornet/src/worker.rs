//! Worker pool.
//!
//! Each worker drains the job queue of one file at a time: the job's
//! command template is expanded against the file record, split on
//! whitespace into an argv, and run with stdout piped. Successful jobs
//! land on `finished_jobs`; a failing job does not stop the remaining
//! jobs for the file, and the first failure's diagnostic is carried on
//! the return.

use std::io::Read;
use std::process::{Command, Stdio};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info, warn};

use crate::fileinfo::{FileInfo, Job};
use crate::pipeline::{OperatorReturn, StageContext, StageInput};

const OPERATOR: &str = "worker";

/// Run one worker until shutdown. The pool is N of these sharing one
/// input queue.
pub fn run(id: usize, ctx: StageContext) {
    info!("worker {id} started; waiting for work");
    let mut job_count: u64 = 0;

    loop {
        match ctx.next_file() {
            StageInput::Idle => continue,
            StageInput::Done => break,
            StageInput::File(mut file) => {
                let mut first_error = None;
                while let Some(mut job) = file.job_queue.pop_front() {
                    job_count += 1;
                    match execute_job(&mut job, &file, id, job_count) {
                        Ok(()) => file.finished_jobs.push(job),
                        Err(err) => {
                            warn!("[worker {id}.{job_count}] {err:#}");
                            if first_error.is_none() {
                                first_error = Some(err);
                            }
                        }
                    }
                }
                debug!(
                    "[worker {id}] finished processing jobs for <{}>",
                    file.filename
                );
                let ret = match first_error {
                    None => OperatorReturn::clean(OPERATOR, file),
                    Some(err) => OperatorReturn::failed(OPERATOR, file, err, false),
                };
                if !ctx.send_return(ret) {
                    break;
                }
            }
        }
    }
    info!("worker {id} finished; {job_count} jobs processed");
}

/// Expand, spawn, capture stdout, wait.
fn execute_job(job: &mut Job, file: &FileInfo, id: usize, count: u64) -> Result<()> {
    let command = job.template.expand(file);
    let mut tokens = command.split_whitespace();
    let Some(name) = tokens.next() else {
        bail!("job <{}> expanded to an empty command", job.name);
    };
    job.command_name = name.to_string();
    job.command_args = tokens.map(str::to_string).collect();

    debug!(
        "[worker {id}.{count}] executing command: {} {:?}",
        job.command_name, job.command_args
    );
    let start = Instant::now();
    let mut child = Command::new(&job.command_name)
        .args(&job.command_args)
        .stdout(Stdio::piped())
        .spawn()
        .with_context(|| format!("couldn't start command <{command}>"))?;

    let mut output = String::new();
    let read_result = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout pipe was not attached"))
        .and_then(|mut stdout| {
            stdout
                .read_to_string(&mut output)
                .context("error reading process output")
                .map(|_| ())
        });
    let status = child
        .wait()
        .with_context(|| format!("error waiting for <{command}>"))?;
    read_result?;

    if !status.success() {
        bail!("nonzero exit status on process [{status}]. log: {output}");
    }
    debug!(
        "[worker {id}.{count}] execution finished, elapsed time: {} ms; output:\n{output}",
        start.elapsed().as_millis()
    );
    Ok(())
}
