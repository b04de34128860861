//! Dead-man's switch for a growing file.
//!
//! A background thread samples the file's size on a fixed interval. Two
//! consecutive equal samples raise an alert; sampling then pauses until the
//! alert is acknowledged. "Continue" clears the baseline, so the next sample
//! can never re-trigger on its own; "Stop" ends monitoring.
use crate::probe::{ProbeError, SizeProbe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

/// Where the watch is in its alert cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// No sample taken yet.
    Idle,
    /// Comparing new samples against the baseline (if any).
    Sampling,
    /// A stall was detected; waiting for acknowledgement.
    Alerting,
    /// Monitoring ended. Terminal.
    Stopped,
}

/// What a sample did to the watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// No baseline existed; this sample became it.
    Baseline,
    /// The size moved; the baseline follows it.
    Changed,
    /// Same size as the baseline: stall.
    Stalled,
    /// Not sampling (alert pending or stopped).
    Ignored,
}

/// The user's answer to an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Continue,
    Stop,
}

/// State machine for one watched resource.
#[derive(Debug)]
pub struct StallWatch {
    path: PathBuf,
    baseline: Option<String>,
    state: WatchState,
}

impl StallWatch {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            baseline: None,
            state: WatchState::Idle,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    pub fn baseline(&self) -> Option<&str> {
        self.baseline.as_deref()
    }

    /// Feed one formatted size sample.
    pub fn observe(&mut self, sample: String) -> Observation {
        match self.state {
            WatchState::Alerting | WatchState::Stopped => Observation::Ignored,
            WatchState::Idle | WatchState::Sampling => {
                self.state = WatchState::Sampling;
                match &self.baseline {
                    None => {
                        self.baseline = Some(sample);
                        Observation::Baseline
                    }
                    Some(previous) if *previous == sample => {
                        self.state = WatchState::Alerting;
                        Observation::Stalled
                    }
                    Some(_) => {
                        self.baseline = Some(sample);
                        Observation::Changed
                    }
                }
            }
        }
    }

    /// Resolve a pending alert. No effect unless Alerting.
    pub fn acknowledge(&mut self, ack: Acknowledgement) {
        if self.state != WatchState::Alerting {
            return;
        }
        match ack {
            Acknowledgement::Continue => {
                self.baseline = None;
                self.state = WatchState::Sampling;
            }
            Acknowledgement::Stop => self.state = WatchState::Stopped,
        }
    }

    /// External stop request, from any state.
    pub fn stop(&mut self) {
        self.state = WatchState::Stopped;
    }
}

/// A raised alert. The sampler stays blocked until this is answered or
/// dropped (dropping counts as Stop).
#[derive(Debug)]
pub struct AlertRequest {
    pub path: PathBuf,
    pub size: String,
    reply: oneshot::Sender<Acknowledgement>,
}

impl AlertRequest {
    pub fn respond(self, ack: Acknowledgement) {
        if self.reply.send(ack).is_err() {
            tracing::debug!("sampler gone before the alert was answered");
        }
    }
}

#[cfg(test)]
impl AlertRequest {
    pub(crate) fn for_test(
        path: PathBuf,
        size: String,
    ) -> (Self, oneshot::Receiver<Acknowledgement>) {
        let (reply, answer) = oneshot::channel();
        (Self { path, size, reply }, answer)
    }
}

/// Events published by the sampler thread.
#[derive(Debug)]
pub enum MonitorEvent {
    Sample { size: String },
    ProbeFailed { error: String },
    Alert(AlertRequest),
    /// The sampler has exited; no more events follow.
    Finished,
}

/// Handle to a running sampler thread.
pub struct StallMonitor {
    stop_tx: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl StallMonitor {
    /// Start sampling `path` every `interval` on a dedicated thread.
    pub fn spawn<P>(
        path: PathBuf,
        probe: P,
        interval: Duration,
        events: UnboundedSender<MonitorEvent>,
    ) -> std::io::Result<Self>
    where
        P: SizeProbe + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("stall-sampler".to_string())
            .spawn(move || {
                let mut watch = StallWatch::new(path);
                sample_loop(&mut watch, probe, interval, &events, &stop_rx);
                let _ = events.send(MonitorEvent::Finished);
            })?;
        Ok(Self { stop_tx, thread })
    }

    /// Ask the sampler to stop after its current probe.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    /// Wait for the sampler thread to exit.
    pub fn join(self) {
        drop(self.stop_tx);
        if self.thread.join().is_err() {
            tracing::error!("sampler thread panicked");
        }
    }
}

fn sample_loop<P: SizeProbe>(
    watch: &mut StallWatch,
    mut probe: P,
    interval: Duration,
    events: &UnboundedSender<MonitorEvent>,
    stop_rx: &mpsc::Receiver<()>,
) {
    tracing::info!(path = %watch.path().display(), ?interval, "sampler started");
    while watch.state() != WatchState::Stopped {
        match probe.sample(watch.path()) {
            Ok(size) => {
                if events
                    .send(MonitorEvent::Sample { size: size.clone() })
                    .is_err()
                {
                    watch.stop();
                    break;
                }
                let observation = watch.observe(size.clone());
                tracing::debug!(%size, ?observation, "sampled");
                if observation == Observation::Stalled {
                    let ack = raise_alert(watch.path(), size, events);
                    tracing::info!(?ack, "alert acknowledged");
                    watch.acknowledge(ack);
                    if watch.state() == WatchState::Stopped {
                        break;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "size probe failed, retrying next interval");
                report_probe_error(&e, events);
            }
        }

        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                tracing::info!("stop requested");
                watch.stop();
            }
        }
    }
    tracing::info!("sampler finished");
}

/// Publish the alert and block until it is answered.
fn raise_alert(path: &Path, size: String, events: &UnboundedSender<MonitorEvent>) -> Acknowledgement {
    let (reply, answer) = oneshot::channel();
    let request = AlertRequest {
        path: path.to_path_buf(),
        size,
        reply,
    };
    if events.send(MonitorEvent::Alert(request)).is_err() {
        return Acknowledgement::Stop;
    }
    answer.blocking_recv().unwrap_or(Acknowledgement::Stop)
}

fn report_probe_error(error: &ProbeError, events: &UnboundedSender<MonitorEvent>) {
    let _ = events.send(MonitorEvent::ProbeFailed {
        error: error.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn feed(watch: &mut StallWatch, samples: &[&str]) -> Vec<Observation> {
        samples
            .iter()
            .map(|s| watch.observe(s.to_string()))
            .collect()
    }

    #[test]
    fn test_equal_second_sample_alerts() {
        let mut watch = StallWatch::new("/data/run.dat");
        assert_eq!(watch.state(), WatchState::Idle);
        let obs = feed(&mut watch, &["10M", "10M", "10M"]);
        assert_eq!(
            obs,
            vec![
                Observation::Baseline,
                Observation::Stalled,
                Observation::Ignored
            ]
        );
        assert_eq!(watch.state(), WatchState::Alerting);
    }

    #[test]
    fn test_alert_only_after_growth_stops() {
        let mut watch = StallWatch::new("/data/run.dat");
        let obs = feed(&mut watch, &["10M", "12M", "12M"]);
        assert_eq!(
            obs,
            vec![
                Observation::Baseline,
                Observation::Changed,
                Observation::Stalled
            ]
        );
    }

    #[test]
    fn test_first_sample_never_alerts() {
        let mut watch = StallWatch::new("x");
        assert_eq!(watch.observe("0".to_string()), Observation::Baseline);
        assert_eq!(watch.state(), WatchState::Sampling);
        assert_eq!(watch.baseline(), Some("0"));
    }

    #[test]
    fn test_continue_clears_baseline() {
        let mut watch = StallWatch::new("x");
        feed(&mut watch, &["10M", "10M"]);
        watch.acknowledge(Acknowledgement::Continue);
        assert_eq!(watch.state(), WatchState::Sampling);
        assert_eq!(watch.baseline(), None);

        // Same value again: becomes the new baseline instead of alerting.
        assert_eq!(watch.observe("10M".to_string()), Observation::Baseline);
        assert_eq!(watch.observe("10M".to_string()), Observation::Stalled);
    }

    #[test]
    fn test_stop_acknowledgement_is_terminal() {
        let mut watch = StallWatch::new("x");
        feed(&mut watch, &["1K", "1K"]);
        watch.acknowledge(Acknowledgement::Stop);
        assert_eq!(watch.state(), WatchState::Stopped);
        assert_eq!(watch.observe("2K".to_string()), Observation::Ignored);
        watch.acknowledge(Acknowledgement::Continue);
        assert_eq!(watch.state(), WatchState::Stopped);
    }

    #[test]
    fn test_acknowledge_outside_alert_is_ignored() {
        let mut watch = StallWatch::new("x");
        watch.observe("1K".to_string());
        watch.acknowledge(Acknowledgement::Stop);
        assert_eq!(watch.state(), WatchState::Sampling);
        assert_eq!(watch.baseline(), Some("1K"));
    }

    #[test]
    fn test_external_stop_from_any_state() {
        let mut idle = StallWatch::new("x");
        idle.stop();
        assert_eq!(idle.state(), WatchState::Stopped);

        let mut alerting = StallWatch::new("x");
        feed(&mut alerting, &["1", "1"]);
        alerting.stop();
        assert_eq!(alerting.state(), WatchState::Stopped);
    }

    #[test]
    fn test_rounded_sizes_compare_equal() {
        // 10.1 MB and 10.2 MB both print as "11M": treated as no growth.
        let mut watch = StallWatch::new("x");
        assert_eq!(
            feed(&mut watch, &["11M", "11M"]),
            vec![Observation::Baseline, Observation::Stalled]
        );
    }

    /// Replays a fixed list of results, then fails forever.
    struct ScriptedProbe(VecDeque<Result<String, ()>>);

    impl ScriptedProbe {
        fn new(items: &[Option<&str>]) -> Self {
            Self(
                items
                    .iter()
                    .map(|i| i.map(str::to_string).ok_or(()))
                    .collect(),
            )
        }
    }

    impl SizeProbe for ScriptedProbe {
        fn sample(&mut self, _path: &Path) -> Result<String, ProbeError> {
            match self.0.pop_front() {
                Some(Ok(size)) => Ok(size),
                _ => Err(ProbeError::NoOutput),
            }
        }
    }

    fn spawn(items: &[Option<&str>]) -> (StallMonitor, UnboundedReceiver<MonitorEvent>) {
        let (tx, rx) = unbounded_channel();
        let monitor = StallMonitor::spawn(
            PathBuf::from("/data/run.dat"),
            ScriptedProbe::new(items),
            Duration::from_millis(5),
            tx,
        )
        .unwrap();
        (monitor, rx)
    }

    /// Short names for the event stream; answers alerts with `answers`.
    async fn collect(
        rx: &mut UnboundedReceiver<MonitorEvent>,
        mut answers: VecDeque<Acknowledgement>,
    ) -> Vec<String> {
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                MonitorEvent::Sample { size } => seen.push(size),
                MonitorEvent::ProbeFailed { .. } => seen.push("err".to_string()),
                MonitorEvent::Alert(request) => {
                    seen.push(format!("alert:{}", request.size));
                    request.respond(answers.pop_front().unwrap_or(Acknowledgement::Stop));
                }
                MonitorEvent::Finished => {
                    seen.push("finished".to_string());
                    break;
                }
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_sampler_alerts_and_stops() {
        let (monitor, mut rx) = spawn(&[Some("10M"), Some("10M")]);
        let seen = collect(&mut rx, VecDeque::from([Acknowledgement::Stop])).await;
        assert_eq!(seen, vec!["10M", "10M", "alert:10M", "finished"]);
        monitor.join();
    }

    #[tokio::test]
    async fn test_sampler_continue_resets_baseline() {
        let (monitor, mut rx) = spawn(&[
            Some("5M"),
            Some("5M"),
            Some("5M"),
            Some("6M"),
            Some("6M"),
        ]);
        let seen = collect(
            &mut rx,
            VecDeque::from([Acknowledgement::Continue, Acknowledgement::Stop]),
        )
        .await;
        assert_eq!(
            seen,
            vec!["5M", "5M", "alert:5M", "5M", "6M", "6M", "alert:6M", "finished"]
        );
        monitor.join();
    }

    #[tokio::test]
    async fn test_probe_failures_are_skipped() {
        let (monitor, mut rx) = spawn(&[None, Some("1M"), None, Some("1M")]);
        let seen = collect(&mut rx, VecDeque::new()).await;
        assert_eq!(seen, vec!["err", "1M", "err", "1M", "alert:1M", "finished"]);
        monitor.join();
    }

    #[tokio::test]
    async fn test_dropped_alert_counts_as_stop() {
        let (monitor, mut rx) = spawn(&[Some("3M"), Some("3M")]);
        let mut finished = false;
        while let Some(event) = rx.recv().await {
            match event {
                MonitorEvent::Alert(request) => drop(request),
                MonitorEvent::Finished => {
                    finished = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(finished);
        monitor.join();
    }

    #[tokio::test]
    async fn test_external_stop_ends_sampler() {
        let (monitor, mut rx) = spawn(&[]);
        // Let it fail a few probes first.
        tokio::time::sleep(Duration::from_millis(30)).await;
        monitor.stop();
        let mut finished = false;
        while let Some(event) = rx.recv().await {
            if matches!(event, MonitorEvent::Finished) {
                finished = true;
                break;
            }
        }
        assert!(finished);
        monitor.join();
    }
}
