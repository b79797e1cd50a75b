//! Mission description and the shared handle tracking a run.

use super::error::ErrorCode;
use parking_lot::{Condvar, Mutex};
use postmux_media::stream::HoldDecision;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// One input byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub path: PathBuf,
    pub offset: u64,
    /// `None` extends to the next source of the same file, or to its end.
    pub length: Option<u64>,
}

impl SourceSpec {
    pub fn new(path: impl Into<PathBuf>, offset: u64, length: Option<u64>) -> Self {
        Self {
            path: path.into(),
            offset,
            length,
        }
    }

    /// Whole file.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(path, 0, None)
    }
}

/// Parses `path[:offset[:length]]`. Trailing parts that are not numbers
/// belong to the path.
impl FromStr for SourceSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut path = s;
        let mut numbers = Vec::new();
        while numbers.len() < 2 {
            match path.rsplit_once(':') {
                Some((head, tail)) if !head.is_empty() => match tail.parse::<u64>() {
                    Ok(value) => {
                        numbers.push(value);
                        path = head;
                    }
                    Err(_) => break,
                },
                _ => break,
            }
        }
        if path.is_empty() {
            return Err(format!("missing path in source '{}'", s));
        }
        numbers.reverse();
        Ok(Self::new(path, numbers.first().copied().unwrap_or(0), numbers.get(1).copied()))
    }
}

/// Post-processing job handed over by the download manager.
#[derive(Debug, Clone)]
pub struct Mission {
    pub algorithm: String,
    pub args: Vec<String>,
    pub sources: Vec<SourceSpec>,
    /// File receiving the result. In same-file mode every source lives here too.
    pub output: PathBuf,
    pub same_file: bool,
}

impl Mission {
    /// Same-file mission over `path`, with sources starting at `offsets`.
    pub fn same_file(algorithm: impl Into<String>, path: impl Into<PathBuf>, offsets: &[u64]) -> Self {
        let path = path.into();
        Self {
            algorithm: algorithm.into(),
            args: Vec::new(),
            sources: offsets
                .iter()
                .map(|&offset| SourceSpec::new(path.clone(), offset, None))
                .collect(),
            output: path,
            same_file: true,
        }
    }

    /// Mission writing a fresh `output` from separate sources.
    pub fn separate(algorithm: impl Into<String>, sources: Vec<SourceSpec>, output: impl Into<PathBuf>) -> Self {
        Self {
            algorithm: algorithm.into(),
            args: Vec::new(),
            sources,
            output: output.into(),
            same_file: false,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionState {
    NotStarted,
    Testing,
    Skipped,
    Processing,
    /// Waiting in a write hold for `resume()` or `abort()`.
    Paused,
    Completed,
    Failed,
}

impl MissionState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Skipped | Self::Completed | Self::Failed)
    }
}

/// Receives mission notifications. Called on the worker thread.
pub trait MissionObserver: Send + Sync {
    /// Bytes produced so far and the current expected length.
    fn on_progress(&self, _done: u64, _length: u64) {}

    /// The run entered a write hold; `handle.resume()` or `handle.abort()` ends it.
    fn on_hold(&self, _handle: &MissionHandle, _cause: &str) {}

    /// The run finished or failed with `code`.
    fn on_finished(&self, _state: MissionState, _code: ErrorCode) {}
}

#[derive(Debug)]
struct Status {
    state: MissionState,
    done: u64,
    length: u64,
    error: Option<(ErrorCode, String)>,
    decision: Option<HoldDecision>,
}

struct Shared {
    status: Mutex<Status>,
    decided: Condvar,
    observer: Option<Arc<dyn MissionObserver>>,
}

/// Shared view of a running mission. Cheap to clone.
#[derive(Clone)]
pub struct MissionHandle {
    shared: Arc<Shared>,
}

impl MissionHandle {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_observer(observer: Arc<dyn MissionObserver>) -> Self {
        Self::build(Some(observer))
    }

    fn build(observer: Option<Arc<dyn MissionObserver>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                status: Mutex::new(Status {
                    state: MissionState::NotStarted,
                    done: 0,
                    length: 0,
                    error: None,
                    decision: None,
                }),
                decided: Condvar::new(),
                observer,
            }),
        }
    }

    pub fn state(&self) -> MissionState {
        self.shared.status.lock().state
    }

    /// `(done, length)` in bytes.
    pub fn progress(&self) -> (u64, u64) {
        let status = self.shared.status.lock();
        (status.done, status.length)
    }

    /// Last reported error code, `Nothing` when none.
    pub fn error_code(&self) -> ErrorCode {
        self.shared
            .status
            .lock()
            .error
            .as_ref()
            .map(|(code, _)| *code)
            .unwrap_or(ErrorCode::Nothing)
    }

    /// Cause attached to the last reported error.
    pub fn error_cause(&self) -> Option<String> {
        self.shared.status.lock().error.as_ref().map(|(_, cause)| cause.clone())
    }

    /// Leave a write hold and retry the write.
    pub fn resume(&self) {
        self.decide(HoldDecision::Retry);
    }

    /// Leave a write hold and stop the run.
    pub fn abort(&self) {
        self.decide(HoldDecision::Abort);
    }

    fn decide(&self, decision: HoldDecision) {
        let mut status = self.shared.status.lock();
        if status.state != MissionState::Paused {
            tracing::debug!("Ignoring {:?}: mission is {:?}", decision, status.state);
            return;
        }
        status.decision = Some(decision);
        self.shared.decided.notify_all();
    }

    pub(crate) fn set_state(&self, state: MissionState) {
        self.shared.status.lock().state = state;
    }

    pub(crate) fn reset(&self, length: u64) {
        let mut status = self.shared.status.lock();
        status.state = MissionState::NotStarted;
        status.done = 0;
        status.length = length;
        status.error = None;
        status.decision = None;
    }

    pub(crate) fn report_progress(&self, done: u64) {
        let (done, length) = {
            let mut status = self.shared.status.lock();
            status.done = done;
            if status.length < done {
                status.length = done;
            }
            (status.done, status.length)
        };
        if let Some(observer) = &self.shared.observer {
            observer.on_progress(done, length);
        }
    }

    pub(crate) fn complete(&self, length: u64) {
        {
            let mut status = self.shared.status.lock();
            status.state = MissionState::Completed;
            status.done = length;
            status.length = length;
        }
        if let Some(observer) = &self.shared.observer {
            observer.on_finished(MissionState::Completed, ErrorCode::Nothing);
        }
    }

    pub(crate) fn skip(&self) {
        self.set_state(MissionState::Skipped);
        if let Some(observer) = &self.shared.observer {
            observer.on_finished(MissionState::Skipped, ErrorCode::Nothing);
        }
    }

    pub(crate) fn fail(&self, code: ErrorCode, cause: String) {
        {
            let mut status = self.shared.status.lock();
            status.state = MissionState::Failed;
            status.error = Some((code, cause));
        }
        if let Some(observer) = &self.shared.observer {
            observer.on_finished(MissionState::Failed, code);
        }
    }

    /// Pause the run and block until `resume()` or `abort()`.
    pub(crate) fn hold(&self, cause: String) -> HoldDecision {
        {
            let mut status = self.shared.status.lock();
            status.state = MissionState::Paused;
            status.decision = None;
            status.error = Some((ErrorCode::PostprocessingHold, cause.clone()));
        }
        tracing::warn!("Post-processing on hold: {}", cause);
        if let Some(observer) = &self.shared.observer {
            observer.on_hold(self, &cause);
        }

        let mut status = self.shared.status.lock();
        while status.decision.is_none() {
            self.shared.decided.wait(&mut status);
        }
        let decision = status.decision.take().unwrap_or(HoldDecision::Abort);
        status.state = MissionState::Processing;
        if decision == HoldDecision::Retry {
            status.error = None;
        }
        tracing::info!("Write hold resolved: {:?}", decision);
        decision
    }
}

impl Default for MissionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MissionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.shared.status.lock();
        f.debug_struct("MissionHandle")
            .field("state", &status.state)
            .field("done", &status.done)
            .field("length", &status.length)
            .finish()
    }
}
