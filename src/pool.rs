//! Worker thread pool driving a shared dispatcher.

use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::Error;

/// Builder for launching a pool of workers that run a dispatcher.
pub struct PoolBuilder {
    config: Config,
}

impl PoolBuilder {
    pub fn new(config: Config) -> Self {
        PoolBuilder { config }
    }

    /// Spawn worker threads, each calling `run` on the dispatcher.
    pub fn launch(self, dispatcher: Arc<Dispatcher>) -> Result<Pool, Error> {
        let threads = if self.config.worker.threads == 0 {
            num_cpus()
        } else {
            self.config.worker.threads
        };

        info!(workers = threads, "launching dispatcher workers");

        let mut handles = Vec::with_capacity(threads);
        for worker_id in 0..threads {
            let dispatcher = dispatcher.clone();
            let worker = self.config.worker.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{worker_id}", worker.name_prefix))
                .spawn(move || {
                    if worker.pin_to_core {
                        let core = worker.core_offset + worker_id;
                        if let Err(e) = pin_to_core(core) {
                            warn!(worker_id, core, error = %e, "core pinning failed");
                        }
                    }
                    let handlers_run = dispatcher.run();
                    debug!(worker_id, handlers_run, "worker exiting");
                    handlers_run
                })
                .map_err(Error::Io)?;
            handles.push(handle);
        }

        Ok(Pool {
            dispatcher,
            handles,
        })
    }
}

/// Handle over a running worker pool.
pub struct Pool {
    dispatcher: Arc<Dispatcher>,
    handles: Vec<thread::JoinHandle<usize>>,
}

impl Pool {
    /// Interrupt the dispatcher; every worker returns from `run`.
    pub fn interrupt(&self) {
        self.dispatcher.interrupt();
    }

    /// Wait for all workers to return. Reports the total number of handlers
    /// executed, or the first worker panic observed.
    pub fn join(self) -> Result<usize, Error> {
        let mut total = 0usize;
        let mut panicked: Option<String> = None;
        for handle in self.handles {
            match handle.join() {
                Ok(handlers_run) => total += handlers_run,
                Err(payload) => {
                    let msg = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "worker panicked".to_string());
                    warn!(error = %msg, "worker panicked");
                    panicked.get_or_insert(msg);
                }
            }
        }
        match panicked {
            Some(msg) => Err(Error::WorkerPanicked(msg)),
            None => Ok(total),
        }
    }
}

/// Launch a worker pool with the given config. Convenience wrapper around
/// [`PoolBuilder`].
pub fn launch(config: Config, dispatcher: Arc<Dispatcher>) -> Result<Pool, Error> {
    PoolBuilder::new(config).launch(dispatcher)
}

/// Pin the current thread to a specific CPU core.
fn pin_to_core(core: usize) -> Result<(), Error> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Get the number of available CPU cores.
fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 { 1 } else { ret as usize }
}
