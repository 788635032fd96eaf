//! Interactive terminal front end.
//!
//! The UI loop owns the terminal and a [`ShellState`]. Speed tests run as
//! tasks on the tokio runtime and chart renders on its blocking pool; both
//! report back over an `mpsc` channel so the loop never waits on the network.

use std::io::{self, Stdout, Write};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Local;
use crossterm::cursor::Show;
use crossterm::event::{poll, read, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use notify::{Config, Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::text::Line;
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use tokio::runtime::Runtime;

use crate::chart::{self, RenderedChart};
use crate::collector::Collector;
use crate::config::AppConfig;
use crate::errlog::ErrorLog;
use crate::error::{MeasurementError, RenderError};
use crate::probe::CloudflareProbe;
use crate::schedule::AutoSchedule;
use crate::stats::{self, AggregateSnapshot, Degraded};
use crate::store::SampleStore;

const MAX_MESSAGES: usize = 1000;

type Tui = Terminal<CrosstermBackend<Stdout>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Measure,
    Plot,
    ToggleAuto,
    IntervalUp,
    IntervalDown,
    Quit,
}

impl Command {
    pub fn from_key(key: KeyEvent) -> Option<Self> {
        if key.kind != KeyEventKind::Press {
            return None;
        }
        match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                Some(Command::Quit)
            }
            KeyCode::Char('m') | KeyCode::Enter => Some(Command::Measure),
            KeyCode::Char('p') => Some(Command::Plot),
            KeyCode::Char('a') => Some(Command::ToggleAuto),
            KeyCode::Char('+') | KeyCode::Char('=') | KeyCode::Up => Some(Command::IntervalUp),
            KeyCode::Char('-') | KeyCode::Char('_') | KeyCode::Down => Some(Command::IntervalDown),
            KeyCode::Char('q') | KeyCode::Esc => Some(Command::Quit),
            _ => None,
        }
    }
}

/// Background work the loop should start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Measure { auto: bool },
    Render,
}

/// Completion reports from background work.
#[derive(Debug)]
pub enum ShellEvent {
    Measured {
        auto: bool,
        outcome: Result<AggregateSnapshot, MeasurementError>,
    },
    Rendered(Result<RenderedChart, RenderError>),
}

pub struct ShellState {
    pub messages: Vec<String>,
    pub report: Vec<String>,
    pub schedule: AutoSchedule,
    pub in_flight: usize,
    pub rendering: bool,
    pub quit: bool,
    quiet: bool,
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S%.3f").to_string()
}

impl ShellState {
    pub fn new(schedule: AutoSchedule, quiet: bool) -> Self {
        ShellState {
            messages: Vec::new(),
            report: Vec::new(),
            schedule,
            in_flight: 0,
            rendering: false,
            quit: false,
            quiet,
        }
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        if !self.quiet {
            self.push(message.as_ref());
        }
    }

    /// Errors are shown even in quiet mode.
    pub fn error(&mut self, message: impl AsRef<str>) {
        self.push(message.as_ref());
    }

    fn push(&mut self, message: &str) {
        self.messages.push(format!("[{}] {}", timestamp(), message));
        if self.messages.len() > MAX_MESSAGES {
            self.messages.remove(0);
        }
    }

    pub fn handle(&mut self, command: Command, now: Instant) -> Option<Job> {
        match command {
            Command::Measure => {
                self.in_flight += 1;
                self.info("Testing internet speed, please wait...");
                Some(Job::Measure { auto: false })
            }
            Command::Plot => {
                if self.rendering {
                    self.info("A chart is already being generated");
                    return None;
                }
                self.rendering = true;
                self.info("Generating scatter plot...");
                Some(Job::Render)
            }
            Command::ToggleAuto => {
                if self.schedule.toggle(now) {
                    let minutes = self.schedule.interval_minutes();
                    self.info(format!("Auto test ON, every {} min", minutes));
                } else {
                    self.info("Auto test OFF");
                }
                None
            }
            Command::IntervalUp | Command::IntervalDown => {
                let delta = if command == Command::IntervalUp { 1 } else { -1 };
                let minutes = self.schedule.adjust_interval(delta);
                self.info(format!("Auto test interval: {} min", minutes));
                None
            }
            Command::Quit => {
                self.quit = true;
                None
            }
        }
    }

    /// Start an auto-run if one is due.
    pub fn tick(&mut self, now: Instant) -> Option<Job> {
        if !self.schedule.due(now) {
            return None;
        }
        self.schedule.on_run_started();
        self.in_flight += 1;
        self.info("Auto test started");
        Some(Job::Measure { auto: true })
    }

    pub fn on_event(&mut self, event: ShellEvent, errlog: &ErrorLog, now: Instant) {
        match event {
            ShellEvent::Measured { auto, outcome } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                if auto {
                    self.schedule.on_run_complete(now);
                }
                match outcome {
                    Ok(snapshot) => self.on_measured(snapshot, errlog),
                    Err(e) => {
                        errlog.record(format!("Speed test failed: {}", e));
                        self.report = vec![
                            "An error occurred during the speed test.".to_string(),
                            format!("Check {}.", errlog.path().display()),
                        ];
                        self.error("Speed test failed, see the error log");
                    }
                }
            }
            ShellEvent::Rendered(result) => {
                self.rendering = false;
                match result {
                    Ok(chart) => self.info(format!(
                        "Scatter plot saved to {} ({} samples)",
                        chart.path.display(),
                        chart.points
                    )),
                    Err(e) => {
                        errlog.record(format!("Failed to generate plot: {}", e));
                        self.error(format!("Could not generate plot: {}", e));
                    }
                }
            }
        }
    }

    fn on_measured(&mut self, snapshot: AggregateSnapshot, errlog: &ErrorLog) {
        if snapshot.is_degraded() {
            tracing::info!("Partial statistics: {:?}", snapshot.degraded);
        }
        if let Some(Degraded::Unreadable(reason)) = &snapshot.degraded {
            errlog.record(format!("Error reading/parsing data: {}", reason));
        }
        let s = &snapshot.latest;
        self.info(format!(
            "Speed test complete: {} Mbps down, {} Mbps up, {} ms",
            s.download_mbps, s.upload_mbps, s.ping_ms
        ));
        self.report = snapshot.report_lines();
    }

    /// Apply a reloaded configuration. Returns true when the probe settings
    /// changed and the collector has to be rebuilt.
    pub fn on_config_reloaded(&mut self, current: &mut AppConfig, mut new: AppConfig) -> bool {
        if new.schedule.interval_minutes != current.schedule.interval_minutes {
            let minutes = self.schedule.set_interval_minutes(new.schedule.interval_minutes);
            self.info(format!("Auto test interval: {} min", minutes));
        }
        if new.chart != current.chart {
            self.info("Chart settings updated");
        }
        if new.storage != current.storage {
            self.info("Storage paths changed; restart to apply");
            new.storage = current.storage.clone();
        }
        let probe_changed = new.probe != current.probe;
        if probe_changed {
            self.info("Probe settings updated");
        }
        *current = new;
        probe_changed
    }

    pub fn status_line(&self, now: Instant) -> String {
        let auto = if self.schedule.is_enabled() {
            match self.schedule.time_until_next(now) {
                Some(left) => {
                    let secs = left.as_secs();
                    format!(
                        "Auto: ON every {} min, next in {}:{:02}",
                        self.schedule.interval_minutes(),
                        secs / 60,
                        secs % 60
                    )
                }
                None if self.schedule.is_running() => format!(
                    "Auto: ON every {} min, testing now",
                    self.schedule.interval_minutes()
                ),
                None => format!("Auto: ON every {} min", self.schedule.interval_minutes()),
            }
        } else {
            format!("Auto: OFF ({} min)", self.schedule.interval_minutes())
        };

        let mut busy = Vec::new();
        if self.in_flight > 0 {
            busy.push(format!("testing x{}", self.in_flight));
        }
        if self.rendering {
            busy.push("plotting".to_string());
        }
        let busy = if busy.is_empty() {
            String::new()
        } else {
            format!(" | {}", busy.join(", "))
        };

        format!(
            "{}{} | m: test  p: plot  a: auto  +/-: interval  q: quit",
            auto, busy
        )
    }
}

/// Everything a background job needs, cheap to clone into a task.
struct Workers {
    collector: Arc<Collector<CloudflareProbe>>,
    store: Arc<SampleStore>,
    events: mpsc::Sender<ShellEvent>,
}

impl Workers {
    fn spawn(&self, job: Job, runtime: &Runtime, config: &AppConfig) {
        match job {
            Job::Measure { auto } => {
                let collector = Arc::clone(&self.collector);
                let events = self.events.clone();
                runtime.spawn(async move {
                    let outcome = match collector.collect().await {
                        Ok(sample) => Ok(stats::aggregate(collector.store(), &sample)),
                        Err(e) => Err(e),
                    };
                    let _ = events.send(ShellEvent::Measured { auto, outcome });
                });
            }
            Job::Render => {
                let store = Arc::clone(&self.store);
                let chart = config.chart.clone();
                let output = config.storage.chart_file.clone();
                let events = self.events.clone();
                runtime.spawn_blocking(move || {
                    let result = chart::render(&store, &chart, &output);
                    let _ = events.send(ShellEvent::Rendered(result));
                });
            }
        }
    }
}

pub fn run(runtime: &Runtime, mut config: AppConfig, config_path: PathBuf, quiet: bool) -> Result<()> {
    let store = Arc::new(SampleStore::new(&config.storage.data_file));
    let errlog = ErrorLog::new(&config.storage.error_log);
    let probe = CloudflareProbe::new(&config.probe)?;

    let (event_tx, event_rx) = mpsc::channel::<ShellEvent>();
    let (config_tx, config_rx) = mpsc::channel::<AppConfig>();

    let mut workers = Workers {
        collector: Arc::new(Collector::new(probe, Arc::clone(&store))),
        store,
        events: event_tx,
    };

    let mut schedule = AutoSchedule::new(config.schedule.interval_minutes);
    if config.schedule.auto_start {
        schedule.enable(Instant::now());
    }
    let mut state = ShellState::new(schedule, quiet);
    state.info(format!("Sample log: {}", config.storage.data_file.display()));
    state.info(format!("Error log: {}", config.storage.error_log.display()));
    state.info(format!("Config file: {}", config_path.display()));
    state.info("Edit the config file to change settings while running");

    spawn_config_watcher(config_path.clone(), config_tx);

    let mut terminal = setup_terminal()?;

    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let _ = disable_raw_mode();
        let _ = io::stdout().execute(LeaveAlternateScreen);
        let _ = io::stdout().execute(Show);
        original_hook(panic_info);
    }));

    let mut needs_render = true;
    let mut last_draw = Instant::now();

    let outcome: Result<()> = loop {
        match poll(Duration::from_millis(50)) {
            Ok(true) => match read() {
                Ok(Event::Key(key)) => {
                    if let Some(command) = Command::from_key(key) {
                        if let Some(job) = state.handle(command, Instant::now()) {
                            workers.spawn(job, runtime, &config);
                        }
                        needs_render = true;
                    }
                }
                Ok(Event::Resize(..)) => needs_render = true,
                Ok(_) => {}
                Err(e) => break Err(e.into()),
            },
            Ok(false) => {}
            Err(e) => break Err(e.into()),
        }

        if state.quit {
            break Ok(());
        }

        if let Some(job) = state.tick(Instant::now()) {
            workers.spawn(job, runtime, &config);
            needs_render = true;
        }

        while let Ok(event) = event_rx.try_recv() {
            state.on_event(event, &errlog, Instant::now());
            needs_render = true;
        }

        while let Ok(new_config) = config_rx.try_recv() {
            if state.on_config_reloaded(&mut config, new_config) {
                match CloudflareProbe::new(&config.probe) {
                    Ok(probe) => {
                        workers.collector =
                            Arc::new(Collector::new(probe, Arc::clone(&workers.store)));
                    }
                    Err(e) => {
                        errlog.record(format!("Could not rebuild speed probe: {}", e));
                        state.error("Could not apply probe settings, keeping the old ones");
                    }
                }
            }
            needs_render = true;
        }

        // Keep the countdown ticking.
        if state.schedule.is_enabled() && last_draw.elapsed() >= Duration::from_secs(1) {
            needs_render = true;
        }

        if needs_render {
            let now = Instant::now();
            if let Err(e) = terminal.draw(|f| draw(f, &state, now)) {
                break Err(e.into());
            }
            needs_render = false;
            last_draw = now;
        }
    };

    restore_terminal(&mut terminal)?;
    if state.in_flight > 0 {
        tracing::info!("Exiting with {} speed test(s) still running", state.in_flight);
    }
    outcome
}

fn setup_terminal() -> Result<Tui> {
    enable_raw_mode()?;
    let mut stdout_handle = io::stdout();
    stdout_handle.execute(EnterAlternateScreen)?;
    stdout_handle.flush()?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout_handle))?;
    terminal.clear()?;
    terminal.hide_cursor()?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut Tui) -> Result<()> {
    terminal.show_cursor()?;
    disable_raw_mode()?;
    terminal.backend_mut().execute(LeaveAlternateScreen)?;
    Ok(())
}

fn spawn_config_watcher(path: PathBuf, config_tx: mpsc::Sender<AppConfig>) {
    std::thread::spawn(move || {
        let (tx, rx) = mpsc::channel();
        let mut watcher = match RecommendedWatcher::new(tx, Config::default()) {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!("Config watcher unavailable: {}", e);
                return;
            }
        };

        if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
            tracing::debug!("Not watching {}: {}", path.display(), e);
            return;
        }

        while let Ok(event) = rx.recv() {
            if let Ok(NotifyEvent { kind, .. }) = event {
                if matches!(kind, notify::EventKind::Modify(_)) {
                    reload(&path, &config_tx);
                }
            }
        }
    });
}

fn reload(path: &Path, config_tx: &mpsc::Sender<AppConfig>) {
    match AppConfig::load(path) {
        Ok(config) => {
            let _ = config_tx.send(config);
        }
        Err(e) => tracing::warn!("Ignoring config change: {}", e),
    }
}

fn draw(f: &mut Frame, state: &ShellState, now: Instant) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(1), Constraint::Length(3)].as_ref())
        .split(f.size());

    let panes = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)].as_ref())
        .split(chunks[0]);

    let report: Vec<Line> = if state.report.is_empty() {
        vec![Line::from("Press m to test your internet speed.")]
    } else {
        state.report.iter().map(|l| Line::from(l.as_str())).collect()
    };
    let report_widget = Paragraph::new(report)
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).title("Latest Test"));
    f.render_widget(report_widget, panes[0]);

    let messages: Vec<Line> = state
        .messages
        .iter()
        .rev()
        .take(panes[1].height as usize)
        .rev()
        .map(|m| Line::from(m.as_str()))
        .collect();
    let messages_widget =
        Paragraph::new(messages).block(Block::default().borders(Borders::ALL).title("Speed Log"));
    f.render_widget(messages_widget, panes[1]);

    let status = Paragraph::new(state.status_line(now))
        .block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(status, chunks[1]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::tests::sample;

    fn state() -> ShellState {
        ShellState::new(AutoSchedule::new(5), false)
    }

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn keys_map_to_commands() {
        assert_eq!(Command::from_key(key(KeyCode::Char('m'))), Some(Command::Measure));
        assert_eq!(Command::from_key(key(KeyCode::Char('p'))), Some(Command::Plot));
        assert_eq!(Command::from_key(key(KeyCode::Char('a'))), Some(Command::ToggleAuto));
        assert_eq!(Command::from_key(key(KeyCode::Char('+'))), Some(Command::IntervalUp));
        assert_eq!(Command::from_key(key(KeyCode::Char('-'))), Some(Command::IntervalDown));
        assert_eq!(Command::from_key(key(KeyCode::Char('q'))), Some(Command::Quit));
        assert_eq!(
            Command::from_key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(Command::Quit)
        );
        assert_eq!(Command::from_key(key(KeyCode::Char('c'))), None);
        assert_eq!(
            Command::from_key(KeyEvent::new_with_kind(
                KeyCode::Char('m'),
                KeyModifiers::NONE,
                KeyEventKind::Release
            )),
            None
        );
    }

    #[test]
    fn concurrent_measurements_are_allowed() {
        let mut s = state();
        let now = Instant::now();
        assert_eq!(s.handle(Command::Measure, now), Some(Job::Measure { auto: false }));
        assert_eq!(s.handle(Command::Measure, now), Some(Job::Measure { auto: false }));
        assert_eq!(s.in_flight, 2);
    }

    #[test]
    fn only_one_render_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let errlog = ErrorLog::new(dir.path().join("error_log.txt"));
        let mut s = state();
        let now = Instant::now();

        assert_eq!(s.handle(Command::Plot, now), Some(Job::Render));
        assert_eq!(s.handle(Command::Plot, now), None);

        s.on_event(
            ShellEvent::Rendered(Err(RenderError::InsufficientData("empty".into()))),
            &errlog,
            now,
        );
        assert!(!s.rendering);
        assert_eq!(s.handle(Command::Plot, now), Some(Job::Render));

        let logged = std::fs::read_to_string(errlog.path()).unwrap();
        assert!(logged.contains(" - Error: Failed to generate plot: "));
    }

    #[test]
    fn auto_mode_fires_then_waits_for_completion() {
        let dir = tempfile::tempdir().unwrap();
        let errlog = ErrorLog::new(dir.path().join("error_log.txt"));
        let mut s = state();
        let t0 = Instant::now();

        assert_eq!(s.handle(Command::ToggleAuto, t0), None);
        assert_eq!(s.tick(t0), Some(Job::Measure { auto: true }));
        assert_eq!(s.tick(t0), None);

        let done = t0 + Duration::from_secs(20);
        s.on_event(
            ShellEvent::Measured {
                auto: true,
                outcome: Err(MeasurementError::Service("no servers".into())),
            },
            &errlog,
            done,
        );

        assert_eq!(s.in_flight, 0);
        assert_eq!(s.tick(done + Duration::from_secs(299)), None);
        assert_eq!(
            s.tick(done + Duration::from_secs(300)),
            Some(Job::Measure { auto: true })
        );
        assert!(s.report[0].contains("error occurred"));
        assert!(std::fs::read_to_string(errlog.path())
            .unwrap()
            .contains("Speed test failed"));
    }

    #[test]
    fn successful_measurement_fills_the_report() {
        let dir = tempfile::tempdir().unwrap();
        let errlog = ErrorLog::new(dir.path().join("error_log.txt"));
        let mut s = state();
        let now = Instant::now();
        s.handle(Command::Measure, now);

        let latest = sample("08:00:00", 80.0, 20.0);
        let snapshot = AggregateSnapshot::degenerate(&latest, Degraded::FirstSample);
        s.on_event(
            ShellEvent::Measured {
                auto: false,
                outcome: Ok(snapshot),
            },
            &errlog,
            now,
        );

        assert_eq!(s.in_flight, 0);
        assert!(s.report.iter().any(|l| l == "Download: 80 Mbps (10 MB/s)"));
        assert!(s.report.iter().any(|l| l.contains("N/A (first test)")));
        assert!(!errlog.path().exists());
    }

    #[test]
    fn interval_keys_clamp() {
        let mut s = ShellState::new(AutoSchedule::new(120), true);
        let now = Instant::now();
        s.handle(Command::IntervalUp, now);
        assert_eq!(s.schedule.interval_minutes(), 120);
        s.handle(Command::IntervalDown, now);
        assert_eq!(s.schedule.interval_minutes(), 119);
        // quiet mode keeps informational messages out
        assert!(s.messages.is_empty());
    }

    #[test]
    fn reloaded_config_applies_interval_but_not_storage() {
        let mut s = state();
        let mut current = AppConfig::default();
        let mut new = AppConfig::default();
        new.schedule.interval_minutes = 30;
        new.storage.data_file = PathBuf::from("elsewhere.txt");
        new.chart.title = "Home Line".to_string();

        let probe_changed = s.on_config_reloaded(&mut current, new);

        assert!(!probe_changed);
        assert_eq!(s.schedule.interval_minutes(), 30);
        assert_eq!(current.schedule.interval_minutes, 30);
        assert_eq!(current.chart.title, "Home Line");
        assert_eq!(current.storage, AppConfig::default().storage);
    }

    #[test]
    fn status_line_shows_countdown() {
        let dir = tempfile::tempdir().unwrap();
        let errlog = ErrorLog::new(dir.path().join("error_log.txt"));
        let mut s = state();
        let t0 = Instant::now();
        assert!(s.status_line(t0).starts_with("Auto: OFF (5 min)"));

        s.handle(Command::ToggleAuto, t0);
        s.tick(t0);
        assert!(s.status_line(t0).starts_with("Auto: ON every 5 min, testing now"));
        s.on_event(
            ShellEvent::Measured {
                auto: true,
                outcome: Err(MeasurementError::Service("x".into())),
            },
            &errlog,
            t0,
        );
        assert!(s
            .status_line(t0 + Duration::from_secs(60))
            .starts_with("Auto: ON every 5 min, next in 4:00"));
    }
}
