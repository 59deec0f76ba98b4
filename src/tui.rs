use std::collections::VecDeque;
use std::io;
use std::sync::mpsc::TryRecvError;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use camino::Utf8PathBuf;
use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};

use crate::app::{ProgressEvent, ProgressSink, ProgressSinkKind};
use crate::error::SyncError;
use crate::store::Store;
use crate::worker::CancelToken;

const EVENTS_MAX: usize = 6;
const LOGS_MAX: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    Operational,
    Logs,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Resolve,
    Discover,
    Fetch,
    Verify,
    Store,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::Resolve => "Resolve",
            Phase::Discover => "Discover",
            Phase::Fetch => "Fetch",
            Phase::Verify => "Verify",
            Phase::Store => "Store",
        }
    }

    fn index(self) -> usize {
        match self {
            Phase::Resolve => 0,
            Phase::Discover => 1,
            Phase::Fetch => 2,
            Phase::Verify => 3,
            Phase::Store => 4,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct StoreSummary {
    files: usize,
    bytes: u64,
}

#[derive(Debug)]
struct AppState {
    status: String,
    phase: Phase,
    req_rate: f64,
    latency_ms: Option<u128>,
    retries: u32,
    ok: u64,
    failed: u64,
    events: VecDeque<String>,
    logs: VecDeque<String>,
    view: View,
    store_summary: StoreSummary,
    summary: Vec<String>,
    started: Instant,
    active: bool,
    finished: bool,
    cancelling: bool,
    request_count: u64,
    last_scan: Instant,
}

pub struct Tui {
    kind: ProgressSinkKind,
    state: Arc<Mutex<AppState>>,
    data_root: Utf8PathBuf,
    cancel: CancelToken,
    log_scroll: u16,
}

struct TuiProgress {
    state: Arc<Mutex<AppState>>,
}

impl ProgressSink for TuiProgress {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut state) = self.state.lock() {
            let message = event.message.trim().to_string();
            if let Some((phase, payload)) = parse_phase(&message) {
                state.phase = phase;
                state.status = payload.to_string();
            } else if let Some(latency) = parse_latency(&message) {
                state.latency_ms = Some(latency);
            } else if message.starts_with("retry") {
                state.retries = state.retries.saturating_add(1);
            } else if message.starts_with("item.ok") {
                state.ok = state.ok.saturating_add(1);
            } else if message.starts_with("item.failed") {
                state.failed = state.failed.saturating_add(1);
            }

            if message == "service.request" {
                state.request_count = state.request_count.saturating_add(1);
                return;
            }
            if message.starts_with("service.response") {
                return;
            }

            push_event(&mut state.events, message.clone());
            push_log(&mut state.logs, format!("[{}] {message}", timestamp()));
        }
    }
}

impl Tui {
    pub fn new(kind: ProgressSinkKind, data_root: Utf8PathBuf, cancel: CancelToken) -> Self {
        let store_summary = compute_store_summary(&data_root);
        Self {
            kind,
            state: Arc::new(Mutex::new(AppState {
                status: "ready".to_string(),
                phase: Phase::Resolve,
                req_rate: 0.0,
                latency_ms: None,
                retries: 0,
                ok: 0,
                failed: 0,
                events: VecDeque::new(),
                logs: VecDeque::new(),
                view: View::Operational,
                store_summary,
                summary: Vec::new(),
                started: Instant::now(),
                active: false,
                finished: false,
                cancelling: false,
                request_count: 0,
                last_scan: Instant::now(),
            })),
            data_root,
            cancel,
            log_scroll: 0,
        }
    }

    pub fn run<F, R>(&mut self, f: F) -> miette::Result<R>
    where
        F: FnOnce(&dyn ProgressSink) -> Result<R, SyncError> + Send + 'static,
        R: Send + 'static,
    {
        self.set_active(true);

        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let (tx, rx) = std::sync::mpsc::channel();
        let sink = TuiProgress {
            state: self.state.clone(),
        };
        let handle = thread::spawn(move || tx.send(f(&sink)));

        let mut tick = 0usize;
        let result = loop {
            self.refresh_metrics();
            if let Ok(state) = self.state.lock() {
                let elapsed = state.started.elapsed();
                terminal
                    .draw(|frame| draw_ui(frame, self, &state, tick, elapsed))
                    .into_diagnostic()?;
            }

            match rx.try_recv() {
                Ok(result) => break Some(result),
                Err(TryRecvError::Disconnected) => break None,
                Err(TryRecvError::Empty) => {}
            }

            if event::poll(Duration::from_millis(120)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    if self.handle_key(key) {
                        self.request_cancel();
                    }
                }
            }

            tick = tick.wrapping_add(1);
        };

        self.set_active(false);
        disable_raw_mode().into_diagnostic()?;
        let mut stdout = io::stdout();
        stdout.execute(LeaveAlternateScreen).into_diagnostic()?;
        handle.join().ok();
        match result {
            Some(result) => result.map_err(miette::Report::new),
            None => Err(miette::miette!("worker thread stopped without a result")),
        }
    }

    pub fn finish(&mut self, summary: Vec<String>) -> miette::Result<()> {
        if let Ok(mut state) = self.state.lock() {
            state.summary = summary;
            state.view = View::Operational;
            state.status = "done, press q to exit".to_string();
        }

        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        loop {
            if let Ok(state) = self.state.lock() {
                let elapsed = state.started.elapsed();
                terminal
                    .draw(|frame| draw_ui(frame, self, &state, 0, elapsed))
                    .into_diagnostic()?;
            }
            if event::poll(Duration::from_millis(200)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    if self.handle_key(key) || key.code == KeyCode::Enter {
                        break;
                    }
                }
            }
        }

        disable_raw_mode().into_diagnostic()?;
        let mut stdout = io::stdout();
        stdout.execute(LeaveAlternateScreen).into_diagnostic()?;
        Ok(())
    }

    fn handle_key(&mut self, key: KeyEvent) -> bool {
        if key.kind != KeyEventKind::Press {
            return false;
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return true,
            KeyCode::F(1) | KeyCode::Char('?') => self.toggle_view(View::Help),
            KeyCode::F(4) | KeyCode::Char('l') => self.toggle_view(View::Logs),
            KeyCode::PageUp => self.scroll_logs(5),
            KeyCode::PageDown => self.scroll_logs(-5),
            _ => {}
        }
        false
    }

    fn request_cancel(&self) {
        self.cancel.cancel();
        if let Ok(mut state) = self.state.lock() {
            if !state.cancelling {
                state.cancelling = true;
                state.status = "cancelling after in-flight requests".to_string();
                push_log(&mut state.logs, format!("[{}] cancel requested", timestamp()));
            }
        }
    }

    fn toggle_view(&self, view: View) {
        if let Ok(mut state) = self.state.lock() {
            state.view = if state.view == view {
                View::Operational
            } else {
                view
            };
        }
    }

    fn set_active(&self, active: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.active = active;
            state.finished = !active;
            if active {
                state.started = Instant::now();
                state.request_count = 0;
                state.retries = 0;
                state.ok = 0;
                state.failed = 0;
                state.latency_ms = None;
                state.phase = Phase::Resolve;
            }
        }
    }

    fn refresh_metrics(&self) {
        if let Ok(mut state) = self.state.lock() {
            if state.active {
                let elapsed = state.started.elapsed().as_secs_f64().max(0.1);
                state.req_rate = (state.request_count as f64) / elapsed;
            } else {
                state.req_rate = 0.0;
            }
            if state.last_scan.elapsed() >= Duration::from_secs(2) {
                state.store_summary = compute_store_summary(&self.data_root);
                state.last_scan = Instant::now();
            }
        }
    }

    fn scroll_logs(&mut self, delta: i16) {
        let max = self
            .state
            .lock()
            .map(|state| state.logs.len())
            .unwrap_or(0);
        let max_scroll = max.saturating_sub(1) as i16;
        let next = (self.log_scroll as i16 + delta).clamp(0, max_scroll);
        self.log_scroll = next as u16;
    }
}

fn draw_ui(
    frame: &mut ratatui::Frame,
    tui: &Tui,
    state: &AppState,
    tick: usize,
    elapsed: Duration,
) {
    match state.view {
        View::Operational => draw_operational(frame, tui, state, tick, elapsed),
        View::Logs => draw_logs(frame, tui, state, tick),
        View::Help => draw_help(frame),
    }
}

fn draw_operational(
    frame: &mut ratatui::Frame,
    tui: &Tui,
    state: &AppState,
    tick: usize,
    elapsed: Duration,
) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(2),
        ])
        .split(frame.area());

    frame.render_widget(draw_header(state, tui, tick), chunks[0]);

    let main = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(chunks[1]);
    frame.render_widget(draw_status_panel(state, elapsed), main[0]);
    frame.render_widget(draw_details_panel(state), main[1]);
    frame.render_widget(draw_footer(state), chunks[2]);
}

fn draw_logs(frame: &mut ratatui::Frame, tui: &Tui, state: &AppState, tick: usize) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(2),
        ])
        .split(frame.area());

    frame.render_widget(draw_header(state, tui, tick), chunks[0]);
    frame.render_widget(draw_logs_view(state, tui.log_scroll), chunks[1]);
    frame.render_widget(draw_footer(state), chunks[2]);
}

fn draw_help(frame: &mut ratatui::Frame) {
    let block = Block::default().borders(Borders::ALL).title("Help");
    let lines = vec![
        Line::from("q / Esc   cancel the running pass (stops between items)"),
        Line::from("F4 / l    toggle logs, PgUp/PgDown to scroll"),
        Line::from("F1 / ?    toggle this help"),
        Line::from("Commands: run | retry | reconcile | status"),
    ];
    let view = Paragraph::new(lines).block(block).wrap(Wrap { trim: true });
    frame.render_widget(view, frame.area());
}

fn draw_header(state: &AppState, tui: &Tui, tick: usize) -> Paragraph<'static> {
    let hb = if tick % 2 == 0 { "*" } else { " " };
    let op_label = match tui.kind {
        ProgressSinkKind::Run => "Run",
        ProgressSinkKind::Retry => "Retry",
        ProgressSinkKind::Reconcile => "Reconcile",
        ProgressSinkKind::Status => "Status",
    };
    let header_line = Line::from(vec![
        Span::styled(
            "GEOLAYER-SYNC",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
        Span::raw("   Op: "),
        Span::styled(op_label, Style::default().fg(Color::Cyan)),
        Span::raw("   "),
        Span::styled(hb, Style::default().fg(Color::Green)),
    ]);
    let store_line = Line::from(Span::styled(
        format!(
            "Data root: {} · {} files · {}",
            tui.data_root,
            state.store_summary.files,
            bytes_to_human(state.store_summary.bytes)
        ),
        Style::default().fg(Color::Gray),
    ));
    Paragraph::new(vec![header_line, store_line])
        .alignment(Alignment::Left)
        .block(Block::default().borders(Borders::BOTTOM))
}

fn draw_status_panel(state: &AppState, elapsed: Duration) -> Paragraph<'static> {
    let progress = phase_progress(state.phase);
    let phase_color = if state.cancelling {
        Color::Red
    } else if state.active {
        Color::Cyan
    } else if state.finished {
        Color::Green
    } else {
        Color::Yellow
    };
    let latency = state
        .latency_ms
        .map(|v| format!("{v} ms"))
        .unwrap_or_else(|| "--".to_string());
    let mut lines = vec![
        Line::from(Span::styled(
            "STATUS / PROGRESS",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        )),
        Line::from(vec![
            Span::styled("Phase: ", Style::default().fg(Color::Gray)),
            Span::styled(
                format!("{:<8} ", state.phase.label()),
                Style::default().fg(phase_color),
            ),
            Span::raw(progress_bar(progress)),
            Span::raw(format!(" {:>3}%", progress)),
        ]),
        Line::from(vec![
            Span::styled("Req/s: ", Style::default().fg(Color::Gray)),
            Span::raw(format!("{:.1}", state.req_rate)),
            Span::styled("   Latency: ", Style::default().fg(Color::Gray)),
            Span::raw(latency),
            Span::styled("   Elapsed: ", Style::default().fg(Color::Gray)),
            Span::raw(format!("{}s", elapsed.as_secs())),
        ]),
        Line::from(vec![
            Span::styled("Retries: ", Style::default().fg(Color::Gray)),
            Span::raw(format!("{}", state.retries)),
        ]),
        Line::from(Span::styled(
            "Recent events:",
            Style::default().fg(Color::Gray),
        )),
    ];
    for event in state.events.iter().rev().take(4) {
        lines.push(Line::from(format!("- {event}")));
    }

    Paragraph::new(lines)
        .block(Block::default().borders(Borders::RIGHT))
        .wrap(Wrap { trim: true })
}

fn draw_details_panel(state: &AppState) -> Paragraph<'static> {
    let mut lines = vec![
        Line::from(Span::styled(
            "LEDGER",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        )),
        Line::from(vec![
            Span::styled("Succeeded: ", Style::default().fg(Color::Gray)),
            Span::styled(format!("{}", state.ok), Style::default().fg(Color::Green)),
        ]),
        Line::from(vec![
            Span::styled("Failed: ", Style::default().fg(Color::Gray)),
            Span::styled(format!("{}", state.failed), Style::default().fg(Color::Red)),
        ]),
        Line::from(vec![
            Span::styled("Requests: ", Style::default().fg(Color::Gray)),
            Span::raw(format!("{}", state.request_count)),
        ]),
    ];
    if !state.summary.is_empty() {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            "RESULT",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        )));
        lines.extend(state.summary.iter().cloned().map(Line::from));
    }
    Paragraph::new(lines).wrap(Wrap { trim: true })
}

fn draw_footer(state: &AppState) -> Paragraph<'static> {
    Paragraph::new(Line::from(vec![
        Span::styled("> ", Style::default().fg(Color::Cyan)),
        Span::raw(state.status.clone()),
        Span::styled(
            "   q/Esc cancel · F4 logs · F1 help",
            Style::default().fg(Color::DarkGray),
        ),
    ]))
    .block(Block::default().borders(Borders::TOP))
}

fn draw_logs_view(state: &AppState, scroll: u16) -> Paragraph<'static> {
    let total = state.logs.len();
    let visible = 12usize;
    let start = total.saturating_sub(scroll as usize + visible);
    let mut lines = Vec::with_capacity(visible + 1);
    lines.push(Line::from(Span::styled(
        "LOGS (scrollable)",
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    )));
    for line in state.logs.iter().skip(start).take(visible) {
        lines.push(Line::from(line.clone()));
    }
    Paragraph::new(lines)
        .block(Block::default())
        .wrap(Wrap { trim: true })
}

fn phase_progress(phase: Phase) -> u8 {
    (((phase.index() + 1) as f64 / 5.0) * 100.0).min(100.0) as u8
}

fn progress_bar(percent: u8) -> String {
    let total = 10;
    let filled = (percent as usize * total) / 100;
    let mut out = String::from("[");
    for i in 0..total {
        out.push(if i < filled { '#' } else { '.' });
    }
    out.push(']');
    out
}

fn parse_phase(message: &str) -> Option<(Phase, &str)> {
    let rest = message.strip_prefix("phase=")?;
    let (name, payload) = rest.split_once(';')?;
    let phase = match name {
        "Resolve" => Phase::Resolve,
        "Discover" => Phase::Discover,
        "Fetch" => Phase::Fetch,
        "Verify" => Phase::Verify,
        "Store" => Phase::Store,
        _ => return None,
    };
    Some((phase, payload.trim()))
}

fn parse_latency(message: &str) -> Option<u128> {
    message
        .split("latency_ms=")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse::<u128>().ok())
}

fn push_event(buffer: &mut VecDeque<String>, item: String) {
    buffer.push_back(item);
    while buffer.len() > EVENTS_MAX {
        buffer.pop_front();
    }
}

fn push_log(buffer: &mut VecDeque<String>, item: String) {
    buffer.push_back(item);
    while buffer.len() > LOGS_MAX {
        buffer.pop_front();
    }
}

fn timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs();
    let mins = (secs / 60) % 60;
    let hours = (secs / 3600) % 24;
    let seconds = secs % 60;
    format!("{hours:02}:{mins:02}:{seconds:02}")
}

fn compute_store_summary(data_root: &Utf8PathBuf) -> StoreSummary {
    Store::new(data_root.clone())
        .list_artifacts()
        .map(|artifacts| StoreSummary {
            files: artifacts.len(),
            bytes: artifacts.iter().map(|artifact| artifact.size).sum(),
        })
        .unwrap_or_default()
}

fn bytes_to_human(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let value = bytes as f64;
    if value >= GB {
        format!("{:.1} GB", value / GB)
    } else if value >= MB {
        format!("{:.1} MB", value / MB)
    } else if value >= KB {
        format!("{:.1} KB", value / KB)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_phase_and_latency_markers() {
        assert_eq!(
            parse_phase("phase=Discover; https://host/x"),
            Some((Phase::Discover, "https://host/x"))
        );
        assert_eq!(parse_phase("phase=Other; x"), None);
        assert_eq!(parse_latency("service.response latency_ms=412"), Some(412));
        assert_eq!(parse_latency("service.request"), None);
    }

    #[test]
    fn progress_sink_counts_outcomes() {
        let tui = Tui::new(
            ProgressSinkKind::Run,
            Utf8PathBuf::from("does-not-exist"),
            CancelToken::new(),
        );
        let sink = TuiProgress {
            state: tui.state.clone(),
        };
        for message in [
            "service.request",
            "item.ok a.geojson",
            "item.failed https://host/x layer 1",
            "retry attempt=2 of 3 https://host/x",
            "service.response latency_ms=90",
        ] {
            sink.event(ProgressEvent::new(message));
        }
        let state = tui.state.lock().unwrap();
        assert_eq!((state.ok, state.failed, state.retries), (1, 1, 1));
        assert_eq!(state.request_count, 1);
        assert_eq!(state.latency_ms, Some(90));
        assert_eq!(state.events.len(), 3);
    }
}
