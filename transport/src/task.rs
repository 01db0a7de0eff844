use std::future::Future;
use std::time::Duration;

use anyhow::bail;
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Handed to a task's body so that it can notice a stop request
#[derive(Clone)]
pub struct StopSignal {
    receiver: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.receiver.borrow()
    }

    /// completes once a stop was requested, or the task handle was dropped
    pub async fn stopped(&mut self) {
        loop {
            let is_stopped = *self.receiver.borrow_and_update();
            if is_stopped {
                return;
            }
            if self.receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A named background task that can be stopped cooperatively. Dropping the handle requests a
///  stop and aborts the task if it is still running.
pub struct Task {
    name: String,
    stop_sender: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Task {
        Task {
            name: name.into(),
            stop_sender: watch::Sender::new(false),
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the body on the current tokio runtime. Starting a task that is already started
    ///  is an error, while a stopped task can be started again.
    pub fn start<F, Fut>(&mut self, body: F) -> anyhow::Result<()>
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.handle.is_some() {
            bail!("task {} is already started", self.name);
        }

        self.stop_sender.send_replace(false);
        let signal = StopSignal { receiver: self.stop_sender.subscribe() };
        let body = body(signal);

        let name = self.name.clone();
        self.handle = Some(tokio::spawn(async move {
            debug!("task {} started", name);
            body.await;
            debug!("task {} finished", name);
        }));
        Ok(())
    }

    /// Starts a task that calls `body` every `period` until it is stopped. A stop request is
    ///  noticed between two invocations, never during one.
    pub fn periodic<F, Fut>(name: impl Into<String>, period: Duration, mut body: F) -> anyhow::Result<Task>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period.is_zero() {
            bail!("period must not be zero");
        }

        let mut task = Task::new(name);
        task.start(move |mut stop| async move {
            let mut ticks = interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                select! {
                    _ = stop.stopped() => break,
                    _ = ticks.tick() => body().await,
                }
            }
        })?;
        Ok(task)
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// requests a stop without waiting for the task to finish
    pub fn request_stop(&self) {
        self.stop_sender.send_replace(true);
    }

    /// requests a stop and waits for the task to finish
    pub async fn stop(&mut self) {
        self.request_stop();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("task {} terminated abnormally: {}", self.name, e);
                }
            }
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.stop_sender.send_replace(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
