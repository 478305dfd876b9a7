//! Scheduler: supervisor and router for the pipeline.
//!
//! Owns every inter-stage bounded queue, spawns the stages, turns
//! ingested filenames into `FileInfo` records, and routes each stage's
//! return to the next stage. Files visit the stages in a fixed order:
//! classifier, mover, optionally the workers, optionally the shipper.
//! Workers are admitted only while fewer than the configured number are
//! busy; a file arriving while the pool is saturated skips the workers.

use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, never, select, tick, Receiver, SendTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::classifier::Classifier;
use crate::control::{ControlRequest, ShutdownToken, POLL_INTERVAL};
use crate::fileinfo::FileInfo;
use crate::mover::Mover;
use crate::pipeline::{OperatorReturn, StageContext};
use crate::shipper::Shipper;
use crate::worker;
use hornet_logging::NOTICE_TARGET;

pub struct Scheduler {
    pub queue_size: usize,
    pub n_workers: usize,
    pub summary_interval: u64,
}

struct Edge {
    files_tx: Sender<FileInfo>,
    returns_rx: Receiver<OperatorReturn>,
}

/// Outcome of a routing decision.
enum Routed {
    Ok,
    Finalized,
    /// Shutdown arrived or a queue closed; stop routing.
    Stop,
}

impl Scheduler {
    /// Run the pipeline until shutdown. Stage threads are spawned here
    /// and joined before returning.
    pub fn run(
        &self,
        classifier: Classifier,
        mover: Mover,
        shipper: Option<Shipper>,
        ingest_rx: Receiver<PathBuf>,
        requests_tx: Sender<ControlRequest>,
        shutdown: ShutdownToken,
    ) {
        let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let spawn_stage = |handles: &mut Vec<(&'static str, JoinHandle<()>)>,
                           name: &'static str,
                           run: Box<dyn FnOnce(StageContext) + Send>|
         -> Edge {
            let (files_tx, files_rx) = bounded(self.queue_size);
            let (returns_tx, returns_rx) = bounded(self.queue_size);
            let ctx = StageContext {
                files_rx,
                returns_tx,
                requests_tx: requests_tx.clone(),
                shutdown: shutdown.clone(),
            };
            handles.push((name, thread::spawn(move || run(ctx))));
            Edge {
                files_tx,
                returns_rx,
            }
        };

        let classifier_edge = spawn_stage(
            &mut handles,
            "classifier",
            Box::new(move |ctx| classifier.run(ctx)),
        );
        let mover_edge = spawn_stage(&mut handles, "mover", Box::new(move |ctx| mover.run(ctx)));
        let shipper_edge = match shipper {
            Some(shipper) => Some(spawn_stage(
                &mut handles,
                "shipper",
                Box::new(move |ctx| shipper.run(ctx)),
            )),
            None => None,
        };

        // The workers share one input queue; each gets its own clone of
        // the stage context.
        let worker_edge = {
            let (files_tx, files_rx) = bounded(self.queue_size);
            let (returns_tx, returns_rx) = bounded(self.queue_size);
            for id in 0..self.n_workers {
                let ctx = StageContext {
                    files_rx: files_rx.clone(),
                    returns_tx: returns_tx.clone(),
                    requests_tx: requests_tx.clone(),
                    shutdown: shutdown.clone(),
                };
                handles.push(("worker", thread::spawn(move || worker::run(id, ctx))));
            }
            Edge {
                files_tx,
                returns_rx,
            }
        };

        let summary = if self.summary_interval > 0 {
            tick(Duration::from_secs(self.summary_interval))
        } else {
            never()
        };
        let shutdown_poll = tick(POLL_INTERVAL);
        let shipper_returns = shipper_edge
            .as_ref()
            .map(|edge| edge.returns_rx.clone())
            .unwrap_or_else(never);

        let mut workers_working: usize = 0;
        let mut scheduled: u64 = 0;
        let mut finished: u64 = 0;

        info!("scheduler started successfully");

        'schedule: loop {
            if shutdown.is_shutdown() {
                info!("scheduler stopping on interrupt");
                break;
            }
            select! {
                recv(ingest_rx) -> msg => match msg {
                    Ok(path) => {
                        if let Some(file) = ingest(path) {
                            scheduled += 1;
                            debug!("sending <{}> to the classifier", file.filename);
                            match self.send_file(&classifier_edge, file, &shutdown, &requests_tx, "classifier") {
                                Routed::Ok | Routed::Finalized => {}
                                Routed::Stop => break 'schedule,
                            }
                        }
                    }
                    Err(_) => {
                        queue_closed("ingest", &requests_tx);
                        break 'schedule;
                    }
                },
                recv(classifier_edge.returns_rx) -> msg => match msg {
                    Ok(ret) => {
                        if let Some(file) = accept_return(ret) {
                            debug!("sending <{}> to the mover", file.filename);
                            match self.send_file(&mover_edge, file, &shutdown, &requests_tx, "mover") {
                                Routed::Ok | Routed::Finalized => {}
                                Routed::Stop => break 'schedule,
                            }
                        }
                    }
                    Err(_) => {
                        queue_closed("classifier returns", &requests_tx);
                        break 'schedule;
                    }
                },
                recv(mover_edge.returns_rx) -> msg => match msg {
                    Ok(ret) => {
                        if let Some(file) = accept_return(ret) {
                            let routed = if !file.job_queue.is_empty() && workers_working < self.n_workers {
                                debug!("sending <{}> to the workers", file.filename);
                                workers_working += 1;
                                self.send_file(&worker_edge, file, &shutdown, &requests_tx, "workers")
                            } else {
                                if !file.job_queue.is_empty() {
                                    debug!("sending <{}> to the shipper (skipping nearline)", file.filename);
                                }
                                self.ship_or_finalize(&shipper_edge, file, &shutdown, &requests_tx)
                            };
                            match routed {
                                Routed::Ok => {}
                                Routed::Finalized => finished += 1,
                                Routed::Stop => break 'schedule,
                            }
                        }
                    }
                    Err(_) => {
                        queue_closed("mover returns", &requests_tx);
                        break 'schedule;
                    }
                },
                recv(worker_edge.returns_rx) -> msg => match msg {
                    Ok(ret) => {
                        workers_working = workers_working.saturating_sub(1);
                        if let Some(file) = accept_return(ret) {
                            match self.ship_or_finalize(&shipper_edge, file, &shutdown, &requests_tx) {
                                Routed::Ok => {}
                                Routed::Finalized => finished += 1,
                                Routed::Stop => break 'schedule,
                            }
                        }
                    }
                    Err(_) => {
                        queue_closed("worker returns", &requests_tx);
                        break 'schedule;
                    }
                },
                recv(shipper_returns) -> msg => match msg {
                    Ok(ret) => {
                        if let Some(file) = accept_return(ret) {
                            finalize(&file);
                            finished += 1;
                        }
                    }
                    Err(_) => {
                        queue_closed("shipper returns", &requests_tx);
                        break 'schedule;
                    }
                },
                recv(summary) -> _ => {
                    info!("pipeline summary: {scheduled} files scheduled, {finished} finished");
                },
                recv(shutdown_poll) -> _ => {}
            }
        }

        // Close our queue ends so idle stages drain out, then wait for
        // them.
        drop(classifier_edge);
        drop(mover_edge);
        drop(worker_edge);
        drop(shipper_edge);
        for (name, handle) in handles {
            if handle.join().is_err() {
                error!("{name} task panicked");
            }
        }
        info!("scheduler finished: {scheduled} files scheduled, {finished} finished");
    }

    /// Send a file to a stage, backing off while its queue is full so
    /// shutdown can interrupt the wait.
    fn send_file(
        &self,
        edge: &Edge,
        file: FileInfo,
        shutdown: &ShutdownToken,
        requests_tx: &Sender<ControlRequest>,
        name: &str,
    ) -> Routed {
        let mut pending = file;
        loop {
            match edge.files_tx.send_timeout(pending, POLL_INTERVAL) {
                Ok(()) => return Routed::Ok,
                Err(SendTimeoutError::Timeout(file)) => {
                    if shutdown.is_shutdown() {
                        return Routed::Stop;
                    }
                    pending = file;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    queue_closed(name, requests_tx);
                    return Routed::Stop;
                }
            }
        }
    }

    fn ship_or_finalize(
        &self,
        shipper_edge: &Option<Edge>,
        file: FileInfo,
        shutdown: &ShutdownToken,
        requests_tx: &Sender<ControlRequest>,
    ) -> Routed {
        match shipper_edge {
            Some(edge) => {
                debug!("sending <{}> to the shipper", file.filename);
                self.send_file(edge, file, shutdown, requests_tx, "shipper")
            }
            None => {
                finalize(&file);
                Routed::Finalized
            }
        }
    }
}

/// Normalize an ingested path and build the file record. Non-regular
/// files are logged and discarded.
fn ingest(path: PathBuf) -> Option<FileInfo> {
    let absolute = match std::path::absolute(&path) {
        Ok(absolute) => absolute,
        Err(err) => {
            warn!(
                "unable to determine an absolute path for <{}>: {err}",
                path.display()
            );
            return None;
        }
    };
    if !absolute.is_file() {
        info!("<{}> is not a regular file; ignoring", absolute.display());
        return None;
    }
    let filename = absolute.file_name()?.to_string_lossy().into_owned();
    let hot_path = absolute.parent()?.to_path_buf();
    Some(FileInfo {
        filename,
        hot_path,
        file_hot_path: absolute,
        ..FileInfo::default()
    })
}

/// Log a stage's return; a fatal return drops the file.
fn accept_return(ret: OperatorReturn) -> Option<FileInfo> {
    if let Some(err) = &ret.error {
        if ret.fatal {
            error!("error received from the {}: {err:#}", ret.operator);
        } else {
            warn!("warning received from the {}: {err:#}", ret.operator);
        }
    }
    if ret.fatal {
        None
    } else {
        Some(ret.file)
    }
}

fn finalize(file: &FileInfo) {
    info!(target: NOTICE_TARGET, "Completed work on file <{}>", file.filename);
}

fn queue_closed(which: &str, requests_tx: &Sender<ControlRequest>) {
    warn!("the {which} queue closed unexpectedly; requesting shutdown");
    let _ = requests_tx.send(ControlRequest::StopExecution);
}
