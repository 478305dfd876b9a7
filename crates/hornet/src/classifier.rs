//! File classifier.
//!
//! Determines a file's type by matching its name against the configured
//! rules, computes the content hash when the type requests it, attaches
//! the jobs the type owns, and optionally publishes a metadata-insert
//! request on the bus.
//!
//! Types are evaluated in declaration order; a type matches only when
//! every test it has in use passes, and the first match wins.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::bus::BusHandle;
use crate::config::{ClassifierConfig, HashConfig, WorkersConfig};
use crate::fileinfo::{CommandTemplate, FileInfo, Job};
use crate::hasher::Hasher;
use crate::pipeline::{OperatorReturn, StageContext, StageInput};
use hornet_protocol::{Message, MsgOp, Value, ENCODING_MSGPACK};

const OPERATOR: &str = "classifier";

/// Marker for a per-file job queue overflowing `classifier.max-jobs`;
/// unlike other classification failures it takes the whole process down.
#[derive(Debug, thiserror::Error)]
#[error("attempting to submit more than the maximum number of jobs ({queued} > {cap})")]
pub struct JobCapExceeded {
    queued: usize,
    cap: usize,
}

/// A compiled classification rule.
struct CompiledType {
    name: String,
    /// Suffix including the leading dot.
    extension: Option<String>,
    regexp: Option<Regex>,
    do_hash: bool,
    jobs: Vec<(String, CommandTemplate)>,
}

pub struct Classifier {
    types: Vec<CompiledType>,
    base_paths: Vec<PathBuf>,
    hasher: Hasher,
    hash_required: bool,
    max_jobs: usize,
    send_file_info: bool,
    send_to: String,
    wait_for_sender: Duration,
    bus: Option<BusHandle>,
}

impl Classifier {
    /// Compile the configured types and attach each job to the types it
    /// names. Assumes the configuration has already been validated.
    pub fn new(
        classifier_config: &ClassifierConfig,
        workers_config: &WorkersConfig,
        hash_config: &HashConfig,
        watcher_roots: &[PathBuf],
        bus: Option<BusHandle>,
    ) -> Result<Classifier> {
        let mut types = Vec::with_capacity(classifier_config.types.len());
        for type_config in &classifier_config.types {
            let regexp = type_config
                .match_regexp
                .as_deref()
                .map(Regex::new)
                .transpose()
                .with_context(|| format!("compiling regexp for type <{}>", type_config.name))?;
            types.push(CompiledType {
                name: type_config.name.clone(),
                extension: type_config.match_extension.as_ref().map(|e| format!(".{e}")),
                regexp,
                do_hash: type_config.do_hash,
                jobs: Vec::new(),
            });
        }

        for job in &workers_config.jobs {
            let template = CommandTemplate::parse(&job.command)
                .with_context(|| format!("parsing command for job <{}>", job.name))?;
            for compiled in types.iter_mut().filter(|t| t.name == job.file_type) {
                debug!(
                    "type <{}> will perform job <{}>: {}",
                    compiled.name, job.name, job.command
                );
                compiled.jobs.push((job.name.clone(), template.clone()));
            }
        }

        let mut base_paths = Vec::new();
        for root in watcher_roots {
            base_paths.push(absolutize(root));
        }
        for base in &classifier_config.base_paths {
            base_paths.push(absolutize(base));
        }
        debug!("base paths: {base_paths:?}");

        Ok(Classifier {
            types,
            base_paths,
            hasher: Hasher::from_config(hash_config),
            hash_required: hash_config.required,
            max_jobs: classifier_config.max_jobs,
            send_file_info: classifier_config.send_file_info,
            send_to: classifier_config.send_to.clone(),
            wait_for_sender: Duration::from_secs(classifier_config.wait_for_sender),
            bus,
        })
    }

    /// Run the classifier until shutdown.
    pub fn run(self, ctx: StageContext) {
        if self.send_file_info && !self.wait_for_sender_active() {
            error!(
                "cannot start the classifier: sending file info was requested \
                 but the bus sender is not active"
            );
            ctx.cannot_continue();
            return;
        }

        info!("classifier started successfully");
        loop {
            match ctx.next_file() {
                StageInput::Idle => continue,
                StageInput::Done => break,
                StageInput::File(file) => {
                    let ret = self.classify(file);
                    if ret
                        .error
                        .as_ref()
                        .map(|err| err.is::<JobCapExceeded>())
                        .unwrap_or(false)
                    {
                        ctx.cannot_continue();
                    }
                    if !ctx.send_return(ret) {
                        break;
                    }
                }
            }
        }
        info!("classifier finished");
    }

    /// The bus sender can lag the pipeline at startup; give it a grace
    /// window before declaring failure.
    fn wait_for_sender_active(&self) -> bool {
        let Some(bus) = &self.bus else { return false };
        let deadline = Instant::now() + self.wait_for_sender;
        while Instant::now() < deadline {
            if bus.sender_is_active() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        bus.sender_is_active()
    }

    fn classify(&self, mut file: FileInfo) -> OperatorReturn {
        let input_path = file.hot_path.join(&file.filename);
        if !input_path.is_file() {
            let err = anyhow!("file <{}> does not exist", input_path.display());
            error!("{err}");
            return OperatorReturn::failed(OPERATOR, file, err, true);
        }

        for compiled in &self.types {
            let mut accept = true;
            if let Some(extension) = &compiled.extension {
                accept &= file.filename.ends_with(extension.as_str());
            }
            // Named captures of the matching regex, owned so the record
            // can be mutated below.
            let mut capture_fields: Vec<(String, String)> = Vec::new();
            if accept {
                if let Some(regexp) = &compiled.regexp {
                    match regexp.captures(&file.filename) {
                        Some(found)
                            if found.get(0).map(|m| m.as_str()) == Some(file.filename.as_str()) =>
                        {
                            capture_fields = regexp
                                .capture_names()
                                .flatten()
                                .filter_map(|name| {
                                    found
                                        .name(name)
                                        .map(|m| (name.to_string(), m.as_str().to_string()))
                                })
                                .collect();
                        }
                        _ => accept = false,
                    }
                }
            }
            if !accept {
                continue;
            }

            info!(
                "classifying file <{}> as type <{}>",
                file.filename, compiled.name
            );
            file.file_type = compiled.name.clone();
            file.sub_path = sub_path(&self.base_paths, &file.hot_path);

            if compiled.do_hash {
                match self.hasher.hash_file(&input_path) {
                    Ok(hash) => {
                        debug!("file <{}> hash: {hash}", file.filename);
                        file.file_hash = hash;
                    }
                    Err(err) => {
                        let err = err.context(format!("hashing <{}>", input_path.display()));
                        warn!("{err:#}");
                        return OperatorReturn::failed(OPERATOR, file, err, self.hash_required);
                    }
                }
            }

            if compiled.jobs.len() > self.max_jobs {
                let err = anyhow::Error::new(JobCapExceeded {
                    queued: compiled.jobs.len(),
                    cap: self.max_jobs,
                });
                error!("{err} for <{}>; aborting", file.filename);
                return OperatorReturn::failed(OPERATOR, file, err, true);
            }
            for (name, template) in &compiled.jobs {
                file.job_queue.push_back(Job::new(name.clone(), template.clone()));
            }

            if self.send_file_info {
                self.publish_file_info(&file, &capture_fields);
            }

            return OperatorReturn::clean(OPERATOR, file);
        }

        let err = anyhow!("unable to classify file <{}>", file.filename);
        warn!("{err}");
        OperatorReturn::failed(OPERATOR, file, err, true)
    }

    /// Metadata-insert request: the well-known fields plus one payload
    /// entry per named capture of the matching regex.
    fn publish_file_info(&self, file: &FileInfo, capture_fields: &[(String, String)]) {
        let Some(bus) = &self.bus else { return };

        let mut payload = Value::empty_map();
        payload.insert("values", Value::List(vec![Value::from("do_insert")]));
        payload.insert("file_name", file.filename.clone());
        payload.insert("file_hash", file.file_hash.clone());
        for (name, value) in capture_fields {
            debug!("adding to payload: {name}: {value}");
            payload.insert(name.clone(), value.clone());
        }

        let mut message = Message::request(
            bus.sender_info(),
            vec![self.send_to.clone()],
            ENCODING_MSGPACK,
            MsgOp::Cmd,
            None,
        );
        message.payload = payload;
        if let Err(err) = bus.send(message) {
            warn!("failed to queue the file-info message: {err:#}");
        }
    }
}

fn absolutize(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Directory of the file relative to the first matching base path; empty
/// when no base path matches.
fn sub_path(base_paths: &[PathBuf], hot_path: &Path) -> PathBuf {
    for base in base_paths {
        if let Ok(relative) = hot_path.strip_prefix(base) {
            return relative.to_path_buf();
        }
    }
    PathBuf::new()
}
